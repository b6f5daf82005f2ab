//! Kernel: top-level manager
//!
//! Combines scheduler, system timer, queue table and liveness monitor into
//! a single instance built by `Bootstrap::start`. Each tick the kernel
//!
//! 1. advances time,
//! 2. polls the liveness monitor (above every task, before any dispatch),
//! 3. resolves queue and timer waits,
//! 4. dispatches ready tasks onto the two cores,
//! 5. charges one tick of work on each core.
//!
//! A reset halts the kernel for good; every later tick reports the same
//! reset and no task state can be read.

use heapless::Vec;
use log::info;

use crate::config::{MAX_QUEUES, MONITOR_POLL_TICKS, NUM_CORES};
use crate::queue::QueueProbe;
use crate::scheduler::Scheduler;
use crate::task::{CoreId, TaskId, TaskState, TaskStats};
use crate::time::{SysTimer, TickSource, Ticks};
use crate::watchdog::{LivenessMonitor, ResetLine, SystemReset};

/// Running system
pub struct Kernel<'a> {
    scheduler: Scheduler<'a>,
    timer: SysTimer,
    queues: Vec<&'a dyn QueueProbe, MAX_QUEUES>,
    monitor: LivenessMonitor,
    halted: Option<SystemReset>,
    /// Total ticks executed
    total_ticks: u64,
}

impl<'a> Kernel<'a> {
    pub(crate) fn new(
        scheduler: Scheduler<'a>,
        queues: Vec<&'a dyn QueueProbe, MAX_QUEUES>,
        monitor: LivenessMonitor,
    ) -> Self {
        Self {
            scheduler,
            timer: SysTimer::software(),
            queues,
            monitor,
            halted: None,
            total_ticks: 0,
        }
    }

    /// Run one scheduler tick
    pub fn tick(&mut self) -> Result<(), SystemReset> {
        if let Some(reset) = self.halted {
            return Err(reset);
        }
        self.timer.advance(1);
        self.total_ticks += 1;
        let now = self.timer.now();

        if now % MONITOR_POLL_TICKS == 0 {
            self.monitor.poll(now).map_err(|reset| self.halt(reset))?;
        }

        let placed = self
            .scheduler
            .resolve_wakes(now, &self.queues)
            .and_then(|()| self.scheduler.dispatch(now, &mut self.monitor));
        if let Err(faulted) = placed {
            let reset = self
                .monitor
                .escalate(faulted.task, faulted.name, faulted.fault, now);
            return Err(self.halt(reset));
        }
        self.scheduler.execute(now);
        Ok(())
    }

    /// Run for `ticks` ticks (testing)
    pub fn run_for(&mut self, ticks: Ticks) -> Result<KernelStats, SystemReset> {
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(self.stats())
    }

    /// Run forever, paced by the tick interrupt
    pub fn run(mut self, source: &mut impl TickSource, line: &mut impl ResetLine) -> ! {
        info!("kernel running at {} Hz", self.timer.tick_hz());
        loop {
            source.wait_tick();
            if let Err(reset) = self.tick() {
                line.hard_reset(&reset);
            }
        }
    }

    fn halt(&mut self, reset: SystemReset) -> SystemReset {
        self.halted = Some(reset);
        reset
    }

    /// Reset that halted the kernel, if any
    pub fn halted(&self) -> Option<&SystemReset> {
        self.halted.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Current time in ticks
    pub fn now(&self) -> Ticks {
        self.timer.now()
    }

    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.scheduler.find(name)
    }

    /// Task state; `None` once the kernel is halted
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        if self.is_halted() {
            return None;
        }
        self.scheduler.task_state(id)
    }

    /// Task counters; `None` once the kernel is halted
    pub fn task_stats(&self, id: TaskId) -> Option<TaskStats> {
        if self.is_halted() {
            return None;
        }
        self.scheduler.task_stats(id)
    }

    /// Task on `core`; `None` once the kernel is halted
    pub fn running_on(&self, core: CoreId) -> Option<TaskId> {
        if self.is_halted() {
            return None;
        }
        self.scheduler.running_on(core)
    }

    /// Last check-in the monitor holds for `id`; `None` once the kernel is halted
    pub fn last_checkin(&self, id: TaskId) -> Option<Ticks> {
        if self.is_halted() {
            return None;
        }
        self.monitor.last_checkin(id)
    }

    /// Registered queues
    pub fn queues(&self) -> &[&'a dyn QueueProbe] {
        &self.queues
    }

    pub fn stats(&self) -> KernelStats {
        let s = &self.scheduler;
        KernelStats {
            total_ticks: self.total_ticks,
            context_switches: s.context_switches,
            preemptions: s.preemptions,
            busy_ticks: CoreId::ALL.map(|core| s.busy_ticks(core)),
            idle_ticks: CoreId::ALL.map(|core| s.idle_ticks(core)),
            utilization: CoreId::ALL.map(|core| s.utilization(core)),
            timer_overflows: self.timer.overflows(),
        }
    }

    /// Memory footprint estimate
    pub fn memory_footprint(&self) -> usize {
        core::mem::size_of::<Self>()
    }
}

/// Kernel execution statistics
#[derive(Debug, Clone, Copy)]
pub struct KernelStats {
    /// Total scheduler ticks
    pub total_ticks: u64,
    pub context_switches: u32,
    pub preemptions: u32,
    /// Busy ticks per core
    pub busy_ticks: [Ticks; NUM_CORES],
    /// Idle ticks per core
    pub idle_ticks: [Ticks; NUM_CORES],
    /// CPU utilization per core
    pub utilization: [f32; NUM_CORES],
    /// Times the tick counter wrapped
    pub timer_overflows: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Bootstrap;
    use crate::queue::{EventQueue, OverflowPolicy};
    use crate::task::{
        Affinity, Binding, DeadlineClass, Priority, RunLoop, StackBudget, TaskCx, TaskDef,
        TaskFault, Wake,
    };
    use crate::watchdog::ResetCause;

    /// Checks in on every iteration until told to go quiet
    struct Worker {
        demand: Ticks,
        silent_after: Option<u32>,
        iterations: u32,
    }

    impl Worker {
        fn new(demand: Ticks) -> Self {
            Self {
                demand,
                silent_after: None,
                iterations: 0,
            }
        }
    }

    impl RunLoop for Worker {
        fn step(&mut self, _: Wake, cx: &mut TaskCx<'_>) -> Result<Ticks, TaskFault> {
            self.iterations += 1;
            if self.silent_after.map_or(true, |n| self.iterations <= n) {
                cx.checkin();
            }
            Ok(self.demand)
        }
    }

    fn periodic(name: &'static str, priority: u8, class: DeadlineClass, period: Ticks) -> TaskDef {
        TaskDef {
            name,
            class,
            priority: Priority(priority),
            affinity: Affinity::Pinned(CoreId::Core0),
            stack: StackBudget(1024),
            binding: Binding::Periodic { period },
            wcet: 5,
            liveness: class.requires_liveness().then_some(100),
        }
    }

    #[test]
    fn test_kernel_tick() {
        let mut worker = Worker::new(2);
        let mut boot = Bootstrap::new();
        let id = boot
            .task(periodic("ui", 17, DeadlineClass::Ui, 10), &mut worker)
            .unwrap();
        let mut kernel = boot.start().unwrap();
        assert_eq!(kernel.now(), 0);

        kernel.tick().unwrap();
        assert_eq!(kernel.now(), 1);
        assert_eq!(kernel.running_on(CoreId::Core0), Some(id));
        assert_eq!(kernel.last_checkin(id), Some(1));
    }

    #[test]
    fn test_kernel_run_for() {
        let mut fast = Worker::new(1);
        let mut slow = Worker::new(4);
        let mut boot = Bootstrap::new();
        let fast_id = boot
            .task(periodic("fast", 17, DeadlineClass::Ui, 10), &mut fast)
            .unwrap();
        boot.task(periodic("slow", 3, DeadlineClass::Background, 20), &mut slow)
            .unwrap();
        let mut kernel = boot.start().unwrap();

        let stats = kernel.run_for(1000).unwrap();
        assert_eq!(stats.total_ticks, 1000);
        assert!(stats.utilization[0] > 0.0);
        assert_eq!(stats.busy_ticks[1], 0);
        assert_eq!(stats.busy_ticks[0] + stats.idle_ticks[0], 1000);
        assert_eq!(stats.timer_overflows, 0);
        assert!(kernel.task_stats(fast_id).unwrap().iterations >= 90);
        assert!(kernel.memory_footprint() > 0);
    }

    #[test]
    fn test_watchdog_fires_within_one_tick() {
        let mut worker = Worker::new(1);
        worker.silent_after = Some(3);
        let mut boot = Bootstrap::new();
        let id = boot
            .task(periodic("ui", 17, DeadlineClass::Ui, 10), &mut worker)
            .unwrap();
        let mut kernel = boot.start().unwrap();

        // iterations at ticks 1, 11, 21 check in; the bound is 100
        let reset = kernel.run_for(1000).unwrap_err();
        assert_eq!(reset.at(), 21 + 100 + 1);
        assert!(matches!(
            reset.cause(),
            ResetCause::LivenessViolation { task, silent_for: 101, bound: 100, .. } if *task == id
        ));
    }

    #[test]
    fn test_halted_kernel_is_unreadable() {
        let mut worker = Worker::new(1);
        worker.silent_after = Some(0);
        let mut boot = Bootstrap::new();
        let id = boot
            .task(periodic("ui", 17, DeadlineClass::Ui, 10), &mut worker)
            .unwrap();
        let mut kernel = boot.start().unwrap();

        let reset = kernel.run_for(500).unwrap_err();
        assert!(kernel.is_halted());
        assert_eq!(kernel.halted(), Some(&reset));
        assert_eq!(kernel.task_state(id), None);
        assert_eq!(kernel.task_stats(id), None);
        assert_eq!(kernel.running_on(CoreId::Core0), None);
        assert_eq!(kernel.last_checkin(id), None);

        // Time stands still and the same reset is reported again
        let now = kernel.now();
        assert_eq!(kernel.tick(), Err(reset));
        assert_eq!(kernel.now(), now);
    }

    #[test]
    fn test_task_fault_escalates() {
        struct Panics;
        impl RunLoop for Panics {
            fn step(&mut self, _: Wake, _: &mut TaskCx<'_>) -> Result<Ticks, TaskFault> {
                Err(TaskFault::Panicked("index out of bounds"))
            }
        }
        let mut body = Panics;
        let mut boot = Bootstrap::new();
        let id = boot
            .task(periodic("ui", 17, DeadlineClass::Ui, 10), &mut body)
            .unwrap();
        let mut kernel = boot.start().unwrap();

        let reset = kernel.tick().unwrap_err();
        assert_eq!(reset.at(), 1);
        assert_eq!(
            *reset.cause(),
            ResetCause::TaskFault {
                task: id,
                name: "ui",
                fault: TaskFault::Panicked("index out of bounds"),
            }
        );
    }

    #[test]
    fn test_queue_table() {
        let queue: EventQueue<u8, 2> = EventQueue::new("events", OverflowPolicy::DropOldest);
        let mut worker = Worker::new(3);
        let mut boot = Bootstrap::new();
        let qid = boot.queue(&queue).unwrap();
        let mut def = periodic("consumer", 17, DeadlineClass::Ui, 10);
        def.binding = Binding::Queue {
            queue: qid,
            timeout: Some(50),
        };
        let id = boot.task(def, &mut worker).unwrap();
        let mut kernel = boot.start().unwrap();
        assert_eq!(kernel.queues().len(), 1);
        assert_eq!(kernel.queues()[0].name(), "events");

        kernel.run_for(5).unwrap();
        queue.send(1);
        kernel.tick().unwrap();
        assert_eq!(kernel.task_state(id), Some(TaskState::Running(CoreId::Core0)));
    }
}
