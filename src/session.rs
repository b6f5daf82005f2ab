//! Lock-session state
//!
//! The button task is the only mutator; display and MQTT read snapshots.
//! The state is a seqlock over 32-bit atomics, so a reader never holds
//! anything the writer could wait on, and targets without 64-bit atomics
//! are supported.

use core::hint;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use log::info;

use crate::config::SESSION_TIMEOUT_MS;
use crate::time::{ms_to_ticks, Ticks};

/// Lock held longer than this is released
pub const SESSION_TIMEOUT: Ticks = ms_to_ticks(SESSION_TIMEOUT_MS);

const LOCKED: u32 = 1 << 31;
const TRACK_MASK: u32 = 0xff;

/// Consistent view of the session state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub locked: bool,
    /// Track the lock is (or was last) on
    pub track: u8,
    /// Incremented by every new lock
    pub session: u32,
    /// Tick of the last lock or unlock
    pub since: Ticks,
}

/// Shared session cell, placed in a `static`
pub struct SessionCell {
    seq: AtomicU32,
    flags: AtomicU32,
    session: AtomicU32,
    since_lo: AtomicU32,
    since_hi: AtomicU32,
    writer_taken: AtomicBool,
}

impl SessionCell {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            session: AtomicU32::new(0),
            since_lo: AtomicU32::new(0),
            since_hi: AtomicU32::new(0),
            writer_taken: AtomicBool::new(false),
        }
    }

    /// The single writer handle; `None` if it was already taken
    pub fn writer(&self) -> Option<SessionWriter<'_>> {
        if self.writer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(SessionWriter {
            cell: self,
            current: self.read(),
        })
    }

    pub fn reader(&self) -> SessionReader<'_> {
        SessionReader { cell: self }
    }

    fn read(&self) -> SessionSnapshot {
        loop {
            let start = self.seq.load(Ordering::Acquire);
            if start & 1 == 1 {
                hint::spin_loop();
                continue;
            }
            let flags = self.flags.load(Ordering::Relaxed);
            let session = self.session.load(Ordering::Relaxed);
            let lo = self.since_lo.load(Ordering::Relaxed);
            let hi = self.since_hi.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == start {
                return SessionSnapshot {
                    locked: flags & LOCKED != 0,
                    track: (flags & TRACK_MASK) as u8,
                    session,
                    since: (u64::from(hi) << 32) | u64::from(lo),
                };
            }
        }
    }

    fn write(&self, state: &SessionSnapshot) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        let flags = u32::from(state.track) | if state.locked { LOCKED } else { 0 };
        self.flags.store(flags, Ordering::Relaxed);
        self.session.store(state.session, Ordering::Relaxed);
        self.since_lo.store(state.since as u32, Ordering::Relaxed);
        self.since_hi.store((state.since >> 32) as u32, Ordering::Relaxed);

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }
}

impl Default for SessionCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot reader; never blocks the writer
#[derive(Clone, Copy)]
pub struct SessionReader<'c> {
    cell: &'c SessionCell,
}

impl SessionReader<'_> {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.cell.read()
    }
}

/// Exclusive mutator, owned by the button task
pub struct SessionWriter<'c> {
    cell: &'c SessionCell,
    current: SessionSnapshot,
}

impl SessionWriter<'_> {
    /// Lock on `track`, starting a new session
    pub fn lock(&mut self, track: u8, now: Ticks) -> SessionSnapshot {
        self.current = SessionSnapshot {
            locked: true,
            track,
            session: self.current.session.wrapping_add(1),
            since: now,
        };
        self.cell.write(&self.current);
        info!("session {} locked on track {}", self.current.session, track);
        self.current
    }

    /// Release the lock; the track is kept for display
    pub fn unlock(&mut self, now: Ticks) -> SessionSnapshot {
        self.current.locked = false;
        self.current.since = now;
        self.cell.write(&self.current);
        info!("session {} released", self.current.session);
        self.current
    }

    /// Button press: lock on `track` if free, release otherwise
    pub fn toggle(&mut self, track: u8, now: Ticks) -> SessionSnapshot {
        if self.current.locked {
            self.unlock(now)
        } else {
            self.lock(track, now)
        }
    }

    /// Release a lock older than the session timeout; true if released
    pub fn expire(&mut self, now: Ticks) -> bool {
        if self.current.locked && now.saturating_sub(self.current.since) >= SESSION_TIMEOUT {
            info!("session {} timed out", self.current.session);
            self.unlock(now);
            return true;
        }
        false
    }

    pub fn current(&self) -> SessionSnapshot {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_writer() {
        let cell = SessionCell::new();
        let writer = cell.writer();
        assert!(writer.is_some());
        assert!(cell.writer().is_none());
    }

    #[test]
    fn test_toggle_lock() {
        let cell = SessionCell::new();
        let mut writer = cell.writer().unwrap();
        let reader = cell.reader();
        assert_eq!(reader.snapshot(), SessionSnapshot::default());

        writer.toggle(3, 100);
        assert_eq!(
            reader.snapshot(),
            SessionSnapshot {
                locked: true,
                track: 3,
                session: 1,
                since: 100,
            }
        );

        writer.toggle(4, 250);
        let snap = reader.snapshot();
        assert!(!snap.locked);
        assert_eq!(snap.track, 3);
        assert_eq!(snap.since, 250);

        writer.toggle(4, 300);
        assert_eq!(reader.snapshot().session, 2);
        assert_eq!(reader.snapshot().track, 4);
    }

    #[test]
    fn test_expire() {
        let cell = SessionCell::new();
        let mut writer = cell.writer().unwrap();
        assert!(!writer.expire(SESSION_TIMEOUT * 2));

        writer.lock(1, 1_000);
        assert!(!writer.expire(1_000 + SESSION_TIMEOUT - 1));
        assert!(writer.expire(1_000 + SESSION_TIMEOUT));
        assert!(!cell.reader().snapshot().locked);
    }

    #[test]
    fn test_wide_timestamp() {
        let cell = SessionCell::new();
        let mut writer = cell.writer().unwrap();
        let now = (7u64 << 32) + 5;
        writer.lock(2, now);
        assert_eq!(cell.reader().snapshot().since, now);
    }

    /// Readers on other threads only ever see states the writer produced
    #[test]
    fn test_readers_see_consistent_snapshots() {
        let cell = Arc::new(SessionCell::new());
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let snap = cell.reader().snapshot();
                        if snap.session > 0 {
                            // lock() always writes track == session % 5 and since == session
                            assert_eq!(u32::from(snap.track), snap.session % 5);
                            assert_eq!(snap.since, u64::from(snap.session) << 20);
                        }
                    }
                })
            })
            .collect();

        let mut writer = cell.writer().unwrap();
        for n in 1..=5_000u32 {
            writer.lock((n % 5) as u8, u64::from(n) << 20);
        }
        for handle in readers {
            handle.join().unwrap();
        }
    }
}
