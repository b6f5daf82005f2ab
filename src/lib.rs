//! twincore-rtos: dual-core task-scheduling policy for a listening station
//!
//! Fixed-priority preemptive scheduling of a static task set on two cores:
//! - Static task and queue tables (no heap, no allocation)
//! - Deadline classes with disjoint priority bands, core affinity, FIFO tie-break
//! - Bounded event queues with an explicit overflow policy and an ISR send path
//! - A liveness monitor above every task that alone can reset the system
//! - One-time registration: nothing is created after dispatch begins
//!
//! Time is counted in scheduler ticks; task bodies report the CPU each
//! loop iteration needs and the kernel charges it core by core.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod time;
pub mod queue;
pub mod task;
pub mod scheduler;
pub mod watchdog;
pub mod bootstrap;
pub mod session;
pub mod kernel;
pub mod station;

pub use bootstrap::{Bootstrap, RegistrationError};
pub use kernel::{Kernel, KernelStats};
pub use queue::{EventQueue, IsrSender, OverflowPolicy, QueueId, SendOutcome, Timeout};
pub use scheduler::Scheduler;
pub use session::{SessionCell, SessionSnapshot};
pub use task::{
    Affinity, Binding, CoreId, DeadlineClass, Priority, RunLoop, StackBudget, TaskCx, TaskDef,
    TaskFault, TaskId, TaskState, TaskStats, Wake,
};
pub use time::{SysTimer, TickSource, Ticks};
pub use watchdog::{LivenessMonitor, ResetCause, ResetLine, SystemReset};
