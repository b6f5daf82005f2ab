//! System time: software tick counter and deadline tracking
//!
//! The kernel counts time in scheduler ticks (`TICK_HZ` per second).
//! On real hardware a `TickSource` paces the kernel from the tick
//! interrupt; for testing the kernel advances the counter itself.

use crate::config::TICK_HZ;

/// Scheduler ticks
pub type Ticks = u64;

/// Convert milliseconds to ticks (rounds down, like `pdMS_TO_TICKS`)
pub const fn ms_to_ticks(ms: u32) -> Ticks {
    (ms as u64 * TICK_HZ as u64) / 1000
}

/// Hardware pacing for `Kernel::run`
pub trait TickSource {
    /// Block until the next tick interrupt has fired
    fn wait_tick(&mut self);
}

/// System timer
pub struct SysTimer {
    /// Current tick count
    ticks: Ticks,
    /// Tick frequency in Hz
    tick_hz: u32,
    /// Overflow count
    overflows: u32,
}

impl SysTimer {
    /// Create a timer running at `tick_hz`
    pub const fn new(tick_hz: u32) -> Self {
        Self {
            ticks: 0,
            tick_hz,
            overflows: 0,
        }
    }

    /// Software timer at the configured kernel tick rate
    pub const fn software() -> Self {
        Self::new(TICK_HZ)
    }

    /// Advance time by `ticks`
    pub fn advance(&mut self, ticks: Ticks) {
        let new = self.ticks.wrapping_add(ticks);
        if new < self.ticks {
            self.overflows += 1;
        }
        self.ticks = new;
    }

    /// Current time in ticks
    pub fn now(&self) -> Ticks {
        self.ticks
    }

    /// Tick frequency in Hz
    pub fn tick_hz(&self) -> u32 {
        self.tick_hz
    }

    /// Number of overflows
    pub fn overflows(&self) -> u32 {
        self.overflows
    }
}

/// Response deadline for one activation of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// Time the task became ready
    start: Ticks,
    /// Deadline (absolute)
    deadline: Ticks,
}

impl Deadline {
    /// Create a deadline `budget` ticks after `start`
    pub fn new(start: Ticks, budget: Ticks) -> Self {
        Self {
            start,
            deadline: start.saturating_add(budget),
        }
    }

    /// Check if deadline is met
    pub fn is_met(&self, current: Ticks) -> bool {
        current <= self.deadline
    }

    /// Elapsed since start
    pub fn elapsed(&self, current: Ticks) -> Ticks {
        current.wrapping_sub(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_timer() {
        let mut timer = SysTimer::software();
        assert_eq!(timer.now(), 0);
        timer.advance(250);
        timer.advance(1);
        assert_eq!(timer.now(), 251);
        assert_eq!(timer.tick_hz(), TICK_HZ);
    }

    #[test]
    fn test_counter_wrap_is_counted() {
        let mut timer = SysTimer::software();
        timer.advance(u64::MAX - 1);
        assert_eq!(timer.overflows(), 0);
        timer.advance(3);
        assert_eq!(timer.now(), 1);
        assert_eq!(timer.overflows(), 1);
    }

    #[test]
    fn test_ms_to_ticks() {
        assert_eq!(ms_to_ticks(5), 5);
        assert_eq!(ms_to_ticks(30_000), 30_000);
    }

    #[test]
    fn test_response_deadline() {
        let deadline = Deadline::new(10, 5);
        assert!(deadline.is_met(15));
        assert!(!deadline.is_met(16));
        assert_eq!(deadline.elapsed(13), 3);

        let open = Deadline::new(7, Ticks::MAX);
        assert!(open.is_met(Ticks::MAX));
    }
}
