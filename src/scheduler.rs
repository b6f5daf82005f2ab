//! Dual-core fixed-priority preemptive scheduler
//!
//! Both cores share one priority space. At every decision point the
//! scheduler keeps placing the best ready task (highest priority, then
//! earliest ready) onto a core its affinity permits, taking a free core
//! first and otherwise evicting a strictly lower-priority running task.
//! When nothing more can be placed, no ready task waits while a lower
//! priority task holds one of its cores.
//!
//! Static task table, no dynamic allocation.

use core::cmp::Ordering;

use heapless::Vec;
use log::{debug, warn};

use crate::bootstrap::RegistrationError;
use crate::config::{MAX_TASKS, NUM_CORES};
use crate::queue::QueueProbe;
use crate::task::{
    Affinity, CoreId, RunLoop, Task, TaskCx, TaskDef, TaskFault, TaskId, TaskState, TaskStats,
    Wait, Wake,
};
use crate::time::Ticks;
use crate::watchdog::LivenessMonitor;

/// A run-loop faulted while being dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Faulted {
    pub task: TaskId,
    pub name: &'static str,
    pub fault: TaskFault,
}

/// Dual-core scheduler
pub struct Scheduler<'a> {
    /// Static task table, in registration order
    tasks: Vec<Task<'a>, MAX_TASKS>,
    /// Task occupying each core
    cores: [Option<TaskId>; NUM_CORES],
    /// Ready-order sequence counter
    next_seq: u64,
    busy_ticks: [Ticks; NUM_CORES],
    idle_ticks: [Ticks; NUM_CORES],
    /// Total context switches
    pub context_switches: u32,
    /// Total preemptions
    pub preemptions: u32,
}

impl<'a> Scheduler<'a> {
    /// Create empty scheduler
    pub const fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cores: [None; NUM_CORES],
            next_seq: 0,
            busy_ticks: [0; NUM_CORES],
            idle_ticks: [0; NUM_CORES],
            context_switches: 0,
            preemptions: 0,
        }
    }

    /// Add a task; it starts Ready with a `Start` activation at tick 0
    pub(crate) fn register(
        &mut self,
        def: TaskDef,
        body: &'a mut dyn RunLoop,
    ) -> Result<TaskId, RegistrationError> {
        let id = TaskId(self.tasks.len() as u8);
        let seq = self.bump_seq();
        let mut task = Task::new(id, def, body);
        task.activate(Wake::Start, 0, seq);
        self.tasks
            .push(task)
            .map_err(|_| RegistrationError::TooManyTasks)?;
        Ok(id)
    }

    /// Move blocked tasks whose wait has resolved to Ready.
    ///
    /// Tasks are visited in registration order, which fixes the FIFO order
    /// of tasks that become ready on the same tick. A task waiting on a
    /// queue missing from `queues` is reported as faulted.
    pub fn resolve_wakes(
        &mut self,
        now: Ticks,
        queues: &[&dyn QueueProbe],
    ) -> Result<(), Faulted> {
        for i in 0..self.tasks.len() {
            let wake = match self.tasks[i].state {
                TaskState::Blocked(Wait::Sleep { until }) if now >= until => Some(Wake::Timer),
                TaskState::Blocked(Wait::Queue { queue, deadline }) => {
                    let Some(probe) = queues.get(queue.index()) else {
                        let task = &self.tasks[i];
                        return Err(Faulted {
                            task: task.id,
                            name: task.def.name,
                            fault: TaskFault::UnknownQueue,
                        });
                    };
                    if !probe.is_empty() {
                        Some(Wake::Item)
                    } else if deadline.map_or(false, |d| now >= d) {
                        Some(Wake::Timeout)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            if let Some(wake) = wake {
                let seq = self.bump_seq();
                self.tasks[i].activate(wake, now, seq);
            }
        }
        Ok(())
    }

    /// Assign ready tasks to cores until no placement is possible.
    ///
    /// A task that starts a new iteration runs its loop body here; a body
    /// fault aborts dispatching and is handed back for escalation.
    pub fn dispatch(&mut self, now: Ticks, monitor: &mut LivenessMonitor) -> Result<(), Faulted> {
        loop {
            let mut ready: Vec<usize, MAX_TASKS> =
                (0..self.tasks.len()).filter(|&i| self.tasks[i].is_ready()).collect();
            ready.sort_unstable_by(|&a, &b| self.rank(a, b));

            let placement = ready
                .iter()
                .find_map(|&i| self.pick_core(i).map(|core| (i, core)));
            match placement {
                Some((i, core)) => self.assign(i, core, now, monitor)?,
                None => return Ok(()),
            }
        }
    }

    /// Charge one tick of CPU on every core
    pub fn execute(&mut self, now: Ticks) {
        for core in CoreId::ALL {
            let Some(id) = self.cores[core.index()] else {
                self.idle_ticks[core.index()] += 1;
                continue;
            };
            self.busy_ticks[core.index()] += 1;
            let task = &mut self.tasks[id.index()];
            let left = task.work.unwrap_or(1).saturating_sub(1);
            if left == 0 {
                task.suspend(now);
                self.cores[core.index()] = None;
            } else {
                task.work = Some(left);
            }
        }
    }

    /// Find a ready task held off a core by a lower-priority task or an
    /// idle core it may use. `None` after every `dispatch`.
    pub fn find_inversion(&self) -> Option<(TaskId, CoreId)> {
        self.tasks.iter().filter(|t| t.is_ready()).find_map(|t| {
            CoreId::ALL
                .into_iter()
                .filter(|&core| t.def.affinity.permits(core))
                .find(|&core| match self.cores[core.index()] {
                    None => true,
                    Some(running) => self.tasks[running.index()].priority() < t.priority(),
                })
                .map(|core| (t.id, core))
        })
    }

    /// Ordering among ready tasks: priority first, then ready order
    fn rank(&self, a: usize, b: usize) -> Ordering {
        let (ta, tb) = (&self.tasks[a], &self.tasks[b]);
        tb.priority()
            .cmp(&ta.priority())
            .then(ta.ready_seq.cmp(&tb.ready_seq))
    }

    fn pick_core(&self, i: usize) -> Option<CoreId> {
        let task = &self.tasks[i];
        let affinity = task.def.affinity;
        let prefers = |core: CoreId| task.last_core != Some(core);

        // Free core: last-run core first, but leave a core to a pinned
        // task that is waiting for it
        let free = CoreId::ALL
            .into_iter()
            .filter(|&core| affinity.permits(core) && self.cores[core.index()].is_none())
            .min_by_key(|&core| (self.pinned_waiting(core, i), prefers(core), core.index()));
        if free.is_some() {
            return free;
        }

        // Otherwise evict the least urgent strictly-lower running task
        CoreId::ALL
            .into_iter()
            .filter(|&core| affinity.permits(core))
            .filter_map(|core| {
                let running = self.cores[core.index()]?;
                let priority = self.tasks[running.index()].priority();
                (priority < task.priority()).then_some((core, priority))
            })
            .min_by_key(|&(core, priority)| (priority, prefers(core), core.index()))
            .map(|(core, _)| core)
    }

    /// Is a ready task other than `except` pinned to `core`?
    fn pinned_waiting(&self, core: CoreId, except: usize) -> bool {
        self.tasks
            .iter()
            .enumerate()
            .any(|(j, t)| j != except && t.is_ready() && t.def.affinity == Affinity::Pinned(core))
    }

    fn assign(
        &mut self,
        i: usize,
        core: CoreId,
        now: Ticks,
        monitor: &mut LivenessMonitor,
    ) -> Result<(), Faulted> {
        if let Some(prev) = self.cores[core.index()] {
            let seq = self.bump_seq();
            let evicted = &mut self.tasks[prev.index()];
            evicted.state = TaskState::Ready;
            evicted.ready_seq = seq;
            evicted.stats.preemptions += 1;
            self.preemptions += 1;
            debug!(
                "core{}: '{}' preempts '{}'",
                core.index(),
                self.tasks[i].def.name,
                self.tasks[prev.index()].def.name
            );
        }
        self.cores[core.index()] = Some(self.tasks[i].id);
        self.context_switches += 1;

        let task = &mut self.tasks[i];
        task.state = TaskState::Running(core);
        task.last_core = Some(core);
        if task.work.is_some() {
            // Resuming a preempted iteration
            return Ok(());
        }

        if let Some(deadline) = task.activation.take() {
            let latency = deadline.elapsed(now);
            task.stats.worst_response = task.stats.worst_response.max(latency);
            if !deadline.is_met(now) {
                task.stats.response_misses += 1;
                warn!("task '{}' dispatched {} ticks after ready", task.def.name, latency);
            }
        }

        let mut cx = TaskCx::new(task.id, now, monitor);
        match task.body.step(task.wake, &mut cx) {
            Ok(demand) => {
                if demand > task.def.wcet {
                    task.stats.overruns += 1;
                    warn!(
                        "task '{}' asked for {} ticks (wcet {})",
                        task.def.name, demand, task.def.wcet
                    );
                }
                task.work = Some(demand.max(1));
                Ok(())
            }
            Err(fault) => Err(Faulted {
                task: task.id,
                name: task.def.name,
                fault,
            }),
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Number of registered tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn find(&self, name: &str) -> Option<TaskId> {
        self.tasks.iter().find(|t| t.def.name == name).map(|t| t.id)
    }

    pub fn task_def(&self, id: TaskId) -> Option<&TaskDef> {
        self.tasks.get(id.index()).map(|t| &t.def)
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id.index()).map(|t| t.state)
    }

    pub fn task_stats(&self, id: TaskId) -> Option<TaskStats> {
        self.tasks.get(id.index()).map(|t| t.stats)
    }

    /// Task currently on `core`
    pub fn running_on(&self, core: CoreId) -> Option<TaskId> {
        self.cores[core.index()]
    }

    pub fn busy_ticks(&self, core: CoreId) -> Ticks {
        self.busy_ticks[core.index()]
    }

    pub fn idle_ticks(&self, core: CoreId) -> Ticks {
        self.idle_ticks[core.index()]
    }

    /// Fraction of elapsed ticks `core` spent running a task
    pub fn utilization(&self, core: CoreId) -> f32 {
        let busy = self.busy_ticks(core);
        let total = busy + self.idle_ticks(core);
        if total == 0 {
            0.0
        } else {
            busy as f32 / total as f32
        }
    }
}

impl Default for Scheduler<'_> {
    fn default() -> Self {
        Self::new()
    }
}
