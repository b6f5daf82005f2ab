//! Bootstrap: one-time registration of queues and tasks
//!
//! Every queue and task is registered here before the first dispatch.
//! Each task definition is checked against its deadline class, the
//! monitor priority and its liveness bound; any error is fatal at
//! startup. `start` consumes the bootstrap, so nothing can be registered
//! once the kernel runs.

use core::fmt;

use heapless::Vec;
use log::info;

use crate::config::{MAX_QUEUES, MIN_STACK_BYTES, MONITOR_PRIORITY};
use crate::kernel::Kernel;
use crate::queue::{QueueId, QueueProbe};
use crate::scheduler::Scheduler;
use crate::task::{Binding, RunLoop, TaskDef, TaskId};
use crate::watchdog::LivenessMonitor;

/// Startup configuration error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationError {
    /// Task table is full
    TooManyTasks,
    /// Queue table is full
    TooManyQueues,
    DuplicateTask(&'static str),
    DuplicateQueue(&'static str),
    /// Priority falls outside the task's deadline class band
    PriorityOutsideClass(&'static str),
    /// Priority at or above the monitor's
    PriorityReserved(&'static str),
    StackTooSmall(&'static str),
    /// Task bound to a queue that was never registered
    UnknownQueue(&'static str),
    /// Period or receive timeout of zero ticks
    ZeroPeriod(&'static str),
    /// Watched class without a (non-zero) liveness bound
    MissingLivenessBound(&'static str),
    /// The task's loop cannot come round within its liveness bound
    CheckinUnreachable(&'static str),
    /// `start` called with an empty task table
    NoTasks,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::TooManyTasks => f.write_str("task table full"),
            RegistrationError::TooManyQueues => f.write_str("queue table full"),
            RegistrationError::DuplicateTask(name) => write!(f, "task '{name}' registered twice"),
            RegistrationError::DuplicateQueue(name) => {
                write!(f, "queue '{name}' registered twice")
            }
            RegistrationError::PriorityOutsideClass(name) => {
                write!(f, "task '{name}': priority outside its class band")
            }
            RegistrationError::PriorityReserved(name) => write!(
                f,
                "task '{name}': priority must stay below the monitor ({MONITOR_PRIORITY})"
            ),
            RegistrationError::StackTooSmall(name) => write!(
                f,
                "task '{name}': stack below {MIN_STACK_BYTES} bytes"
            ),
            RegistrationError::UnknownQueue(name) => {
                write!(f, "task '{name}': bound to an unregistered queue")
            }
            RegistrationError::ZeroPeriod(name) => {
                write!(f, "task '{name}': zero period or timeout")
            }
            RegistrationError::MissingLivenessBound(name) => {
                write!(f, "task '{name}': watched class needs a liveness bound")
            }
            RegistrationError::CheckinUnreachable(name) => {
                write!(f, "task '{name}': loop interval exceeds its liveness bound")
            }
            RegistrationError::NoTasks => f.write_str("no tasks registered"),
        }
    }
}

/// Registry under construction
pub struct Bootstrap<'a> {
    scheduler: Scheduler<'a>,
    queues: Vec<&'a dyn QueueProbe, MAX_QUEUES>,
    monitor: LivenessMonitor,
}

impl<'a> Bootstrap<'a> {
    pub const fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            queues: Vec::new(),
            monitor: LivenessMonitor::new(),
        }
    }

    /// Register a queue tasks may bind to
    pub fn queue(&mut self, queue: &'a dyn QueueProbe) -> Result<QueueId, RegistrationError> {
        if self.queues.iter().any(|q| q.name() == queue.name()) {
            return Err(RegistrationError::DuplicateQueue(queue.name()));
        }
        let id = QueueId::issue(self.queues.len() as u8, queue);
        self.queues
            .push(queue)
            .map_err(|_| RegistrationError::TooManyQueues)?;
        info!(
            "queue '{}' registered (capacity {})",
            queue.name(),
            queue.capacity()
        );
        Ok(id)
    }

    /// Validate and register a task
    pub fn task(
        &mut self,
        def: TaskDef,
        body: &'a mut dyn RunLoop,
    ) -> Result<TaskId, RegistrationError> {
        self.validate(&def)?;
        let id = self.scheduler.register(def, body)?;
        if let Some(bound) = def.liveness {
            self.monitor.register(id, def.name, bound, 0)?;
        }
        info!(
            "task '{}' registered: priority {}, {:?}, {} bytes",
            def.name,
            def.priority.0,
            def.affinity,
            def.stack.bytes()
        );
        Ok(id)
    }

    fn validate(&self, def: &TaskDef) -> Result<(), RegistrationError> {
        let name = def.name;
        if def.priority.0 >= MONITOR_PRIORITY {
            return Err(RegistrationError::PriorityReserved(name));
        }
        if !def.class.admits(def.priority) {
            return Err(RegistrationError::PriorityOutsideClass(name));
        }
        if def.stack.bytes() < MIN_STACK_BYTES {
            return Err(RegistrationError::StackTooSmall(name));
        }
        match def.binding {
            Binding::Periodic { period: 0 } | Binding::Queue { timeout: Some(0), .. } => {
                return Err(RegistrationError::ZeroPeriod(name));
            }
            Binding::Queue { queue, .. }
                if !self.queues.get(queue.index()).map_or(false, |q| queue.names(*q)) =>
            {
                return Err(RegistrationError::UnknownQueue(name));
            }
            _ => {}
        }
        if self.scheduler.find(name).is_some() {
            return Err(RegistrationError::DuplicateTask(name));
        }

        match def.liveness {
            None | Some(0) if def.class.requires_liveness() => {
                Err(RegistrationError::MissingLivenessBound(name))
            }
            Some(0) => Err(RegistrationError::MissingLivenessBound(name)),
            Some(bound) => {
                let interval = def
                    .binding
                    .max_suspension()
                    .map(|wait| wait.saturating_add(def.wcet));
                match interval {
                    Some(interval) if interval < bound => Ok(()),
                    _ => Err(RegistrationError::CheckinUnreachable(name)),
                }
            }
            None => Ok(()),
        }
    }

    /// Hand the registry to the kernel
    pub fn start(self) -> Result<Kernel<'a>, RegistrationError> {
        if self.scheduler.task_count() == 0 {
            return Err(RegistrationError::NoTasks);
        }
        info!(
            "starting: {} tasks, {} queues, {} watched",
            self.scheduler.task_count(),
            self.queues.len(),
            self.monitor.len()
        );
        Ok(Kernel::new(self.scheduler, self.queues, self.monitor))
    }
}

impl Default for Bootstrap<'_> {
    fn default() -> Self {
        Self::new()
    }
}
