//! Liveness monitor: task watchdog with sole reset authority
//!
//! Every watched task must check in more often than its bound. The kernel
//! polls the monitor each tick before making any dispatch decision, so it
//! behaves like an independent timer running above every application
//! priority (`MONITOR_PRIORITY`). A missed bound is not recoverable: the
//! monitor produces a `SystemReset` and the whole system restarts.
//!
//! Task faults are routed through `escalate` so that the monitor is the
//! only place a reset can originate.

use core::fmt;

use heapless::Vec;
use log::error;

use crate::bootstrap::RegistrationError;
use crate::config::MAX_TASKS;
use crate::task::{TaskFault, TaskId};
use crate::time::Ticks;

#[derive(Debug, Clone, Copy)]
struct Record {
    task: TaskId,
    name: &'static str,
    bound: Ticks,
    last_checkin: Ticks,
}

/// Why the system is being reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    /// A watched task stayed silent longer than its bound
    LivenessViolation {
        task: TaskId,
        name: &'static str,
        silent_for: Ticks,
        bound: Ticks,
    },
    /// A run-loop returned or panicked
    TaskFault {
        task: TaskId,
        name: &'static str,
        fault: TaskFault,
    },
}

impl ResetCause {
    /// Task the reset is attributed to
    pub fn task(&self) -> TaskId {
        match *self {
            ResetCause::LivenessViolation { task, .. } | ResetCause::TaskFault { task, .. } => task,
        }
    }
}

impl fmt::Display for ResetCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetCause::LivenessViolation {
                name,
                silent_for,
                bound,
                ..
            } => write!(
                f,
                "task '{name}' silent for {silent_for} ticks (bound {bound})"
            ),
            ResetCause::TaskFault { name, fault, .. } => write!(f, "task '{name}': {fault}"),
        }
    }
}

/// A hard reset decided by the monitor.
///
/// Only the monitor can construct one; tasks have no way to reset the
/// system themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemReset {
    cause: ResetCause,
    at: Ticks,
}

impl SystemReset {
    pub fn cause(&self) -> &ResetCause {
        &self.cause
    }

    /// Tick the reset was decided at
    pub fn at(&self) -> Ticks {
        self.at
    }
}

impl fmt::Display for SystemReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hard reset at tick {}: {}", self.at, self.cause)
    }
}

/// The chip's reset line
pub trait ResetLine {
    /// Reset the whole system; nothing survives
    fn hard_reset(&mut self, reset: &SystemReset) -> !;
}

/// Check-in records for every watched task
pub struct LivenessMonitor {
    records: Vec<Record, MAX_TASKS>,
}

impl LivenessMonitor {
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Watch `task`; its bound starts counting from `now`
    pub fn register(
        &mut self,
        task: TaskId,
        name: &'static str,
        bound: Ticks,
        now: Ticks,
    ) -> Result<(), RegistrationError> {
        if bound == 0 {
            return Err(RegistrationError::MissingLivenessBound(name));
        }
        if self.records.iter().any(|r| r.task == task) {
            return Err(RegistrationError::DuplicateTask(name));
        }
        self.records
            .push(Record {
                task,
                name,
                bound,
                last_checkin: now,
            })
            .map_err(|_| RegistrationError::TooManyTasks)
    }

    /// Record a check-in; unwatched tasks are ignored
    pub fn checkin(&mut self, task: TaskId, now: Ticks) {
        if let Some(record) = self.records.iter_mut().find(|r| r.task == task) {
            record.last_checkin = now;
        }
    }

    /// Check every record against its bound
    pub fn poll(&self, now: Ticks) -> Result<(), SystemReset> {
        for record in &self.records {
            let silent_for = now.saturating_sub(record.last_checkin);
            if silent_for > record.bound {
                let reset = SystemReset {
                    cause: ResetCause::LivenessViolation {
                        task: record.task,
                        name: record.name,
                        silent_for,
                        bound: record.bound,
                    },
                    at: now,
                };
                error!("watchdog: {}", reset);
                return Err(reset);
            }
        }
        Ok(())
    }

    /// Turn a task fault into a reset
    pub fn escalate(
        &self,
        task: TaskId,
        name: &'static str,
        fault: TaskFault,
        now: Ticks,
    ) -> SystemReset {
        let reset = SystemReset {
            cause: ResetCause::TaskFault { task, name, fault },
            at: now,
        };
        error!("watchdog: {}", reset);
        reset
    }

    pub fn is_watched(&self, task: TaskId) -> bool {
        self.records.iter().any(|r| r.task == task)
    }

    pub fn last_checkin(&self, task: TaskId) -> Option<Ticks> {
        self.records
            .iter()
            .find(|r| r.task == task)
            .map(|r| r.last_checkin)
    }

    /// Number of watched tasks
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new()
    }
}
