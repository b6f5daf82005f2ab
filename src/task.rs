//! Task definition: static descriptors and the per-task control block
//!
//! A task is a run-loop with a fixed priority, a core affinity and a stack
//! budget. Its body never loops on its own: the kernel calls `step` once
//! per iteration and then suspends the task according to its `Binding`
//! (a queue receive with timeout, or a fixed-period sleep).

use core::fmt;
use core::ops::RangeInclusive;

use crate::queue::QueueId;
use crate::time::{ms_to_ticks, Deadline, Ticks};
use crate::watchdog::LivenessMonitor;

/// Index of a task in the kernel's task table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u8);

impl TaskId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Task priority (higher number = more urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

/// Latency tolerance band a task belongs to.
///
/// Bands are disjoint and ordered, so every task of a more urgent class
/// outranks every task of a less urgent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeadlineClass {
    /// No bound; may be starved under sustained load
    Background,
    /// Tolerates 100 ms to 5 s
    Network,
    /// Tolerates up to 100 ms
    Ui,
    /// Sample-accurate streaming, 5 ms per period
    AudioTiming,
    /// Hard input, respond within 10 ms
    Interrupt,
}

impl DeadlineClass {
    /// Priorities a task of this class may use
    pub const fn band(self) -> RangeInclusive<u8> {
        match self {
            DeadlineClass::Interrupt => 22..=24,
            DeadlineClass::AudioTiming => 19..=21,
            DeadlineClass::Ui => 16..=18,
            DeadlineClass::Network => 6..=15,
            DeadlineClass::Background => 1..=5,
        }
    }

    /// Worst acceptable ready-to-dispatch latency
    pub const fn response_budget(self) -> Option<Ticks> {
        match self {
            DeadlineClass::Interrupt => Some(ms_to_ticks(10)),
            DeadlineClass::AudioTiming => Some(ms_to_ticks(5)),
            DeadlineClass::Ui => Some(ms_to_ticks(100)),
            DeadlineClass::Network => Some(ms_to_ticks(5_000)),
            DeadlineClass::Background => None,
        }
    }

    /// Must tasks of this class be watched by the liveness monitor?
    pub const fn requires_liveness(self) -> bool {
        !matches!(self, DeadlineClass::Background)
    }

    /// Does `priority` fall inside this class's band?
    pub fn admits(self, priority: Priority) -> bool {
        self.band().contains(&priority.0)
    }
}

/// One of the two cores
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoreId {
    /// Protocol CPU (I/O, WiFi)
    Core0,
    /// Application CPU
    Core1,
}

impl CoreId {
    pub const ALL: [CoreId; 2] = [CoreId::Core0, CoreId::Core1];

    pub const fn index(self) -> usize {
        match self {
            CoreId::Core0 => 0,
            CoreId::Core1 => 1,
        }
    }
}

/// Which cores a task may run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Pinned(CoreId),
    Any,
}

impl Affinity {
    pub fn permits(self, core: CoreId) -> bool {
        match self {
            Affinity::Pinned(pinned) => pinned == core,
            Affinity::Any => true,
        }
    }
}

/// Stack reserved for a task at creation (bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StackBudget(pub u32);

impl StackBudget {
    pub fn bytes(self) -> u32 {
        self.0
    }
}

/// Where a task suspends at the end of every iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Sleep for `period` ticks
    Periodic { period: Ticks },
    /// Wait on `queue` for an item, at most `timeout` ticks
    Queue { queue: QueueId, timeout: Option<Ticks> },
}

impl Binding {
    /// Longest a task can stay suspended between iterations
    pub fn max_suspension(self) -> Option<Ticks> {
        match self {
            Binding::Periodic { period } => Some(period),
            Binding::Queue { timeout, .. } => timeout,
        }
    }
}

/// Registration parameters, fixed at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDef {
    pub name: &'static str,
    pub class: DeadlineClass,
    pub priority: Priority,
    pub affinity: Affinity,
    pub stack: StackBudget,
    pub binding: Binding,
    /// Declared worst-case CPU ticks per iteration
    pub wcet: Ticks,
    /// Check-in bound for the liveness monitor (`None` = unwatched)
    pub liveness: Option<Ticks>,
}

/// Why a task was resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// First iteration after start
    Start,
    /// Period elapsed
    Timer,
    /// The bound queue has an item
    Item,
    /// The queue receive timed out
    Timeout,
}

/// What a blocked task is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Sleep { until: Ticks },
    Queue { queue: QueueId, deadline: Option<Ticks> },
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Suspended at its queue or timer
    Blocked(Wait),
    /// Eligible to run, waiting for a core
    Ready,
    /// Executing on a core
    Running(CoreId),
}

/// A run-loop ended in a way the system cannot recover from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFault {
    /// The loop body returned instead of suspending
    Returned,
    /// The loop body panicked
    Panicked(&'static str),
    /// The task waits on a queue the kernel does not know
    UnknownQueue,
}

impl fmt::Display for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFault::Returned => f.write_str("run-loop returned"),
            TaskFault::Panicked(msg) => write!(f, "run-loop panicked: {msg}"),
            TaskFault::UnknownQueue => f.write_str("waits on an unregistered queue"),
        }
    }
}

/// One iteration of a task's loop.
///
/// `step` does the iteration's work and reports how many ticks of CPU it
/// needs. The kernel charges those ticks to the task's core (preemptibly)
/// and suspends the task at its binding afterwards.
pub trait RunLoop {
    fn step(&mut self, wake: Wake, cx: &mut TaskCx<'_>) -> Result<Ticks, TaskFault>;
}

/// Kernel services available to a running iteration
pub struct TaskCx<'k> {
    id: TaskId,
    now: Ticks,
    monitor: &'k mut LivenessMonitor,
}

impl<'k> TaskCx<'k> {
    pub(crate) fn new(id: TaskId, now: Ticks, monitor: &'k mut LivenessMonitor) -> Self {
        Self { id, now, monitor }
    }

    /// Report liveness to the monitor
    pub fn checkin(&mut self) {
        self.monitor.checkin(self.id, self.now);
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn now(&self) -> Ticks {
        self.now
    }
}

/// Runtime counters for one task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Completed iterations
    pub iterations: u32,
    /// Times a higher-priority task took its core
    pub preemptions: u32,
    /// Iterations that asked for more than the declared `wcet`
    pub overruns: u32,
    /// Activations dispatched later than the class response budget
    pub response_misses: u32,
    /// Worst ready-to-dispatch latency observed
    pub worst_response: Ticks,
}

/// Task control block
pub(crate) struct Task<'a> {
    pub id: TaskId,
    pub def: TaskDef,
    pub body: &'a mut dyn RunLoop,
    pub state: TaskState,
    /// Reason for the pending activation
    pub wake: Wake,
    /// CPU still owed to the current iteration (`None` between iterations)
    pub work: Option<Ticks>,
    /// FIFO order among ready tasks
    pub ready_seq: u64,
    /// Response deadline of the pending activation
    pub activation: Option<Deadline>,
    pub last_core: Option<CoreId>,
    pub stats: TaskStats,
}

impl<'a> Task<'a> {
    pub fn new(id: TaskId, def: TaskDef, body: &'a mut dyn RunLoop) -> Self {
        Self {
            id,
            def,
            body,
            state: TaskState::Ready,
            wake: Wake::Start,
            work: None,
            ready_seq: 0,
            activation: None,
            last_core: None,
            stats: TaskStats::default(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.def.priority
    }

    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Ready
    }

    /// Suspend at the binding after an iteration completed at `now`
    pub fn suspend(&mut self, now: Ticks) {
        let wait = match self.def.binding {
            Binding::Periodic { period } => Wait::Sleep {
                until: now.saturating_add(period),
            },
            Binding::Queue { queue, timeout } => Wait::Queue {
                queue,
                deadline: timeout.map(|t| now.saturating_add(t)),
            },
        };
        self.state = TaskState::Blocked(wait);
        self.work = None;
        self.stats.iterations += 1;
    }

    /// Mark ready for a new activation
    pub fn activate(&mut self, wake: Wake, now: Ticks, seq: u64) {
        self.state = TaskState::Ready;
        self.wake = wake;
        self.ready_seq = seq;
        self.activation = self
            .def
            .class
            .response_budget()
            .map(|budget| Deadline::new(now, budget));
    }
}
