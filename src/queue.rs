//! Bounded event queue
//!
//! Fixed-capacity FIFO shared between interrupt handlers, tasks and cores.
//! Storage lives behind a critical section, so `send` never blocks and
//! never allocates; it is safe to call from an ISR on either core.
//!
//! A full queue applies the policy chosen when it was created. The policy
//! is part of the queue's identity, and every overflow is counted.

use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::Mutex;
use heapless::Deque;

use crate::task::Wake;

/// What `send` does when the queue is already full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest queued item to make room for the new one
    DropOldest,
    /// Keep the queue as is and discard the new item
    RejectNewest,
}

/// Result of a `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Item queued, nothing lost
    Accepted,
    /// Item queued, the oldest item was discarded
    DisplacedOldest,
    /// Queue full, the new item was discarded
    Rejected,
}

impl SendOutcome {
    /// Did this send lose an item?
    pub fn is_overflow(self) -> bool {
        self != SendOutcome::Accepted
    }
}

/// A blocking receive ended without an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout;

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("receive timed out")
    }
}

/// Registry handle for a queue.
///
/// Remembers which queue object it was issued for, so a handle from one
/// `Bootstrap` is rejected by another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId {
    slot: u8,
    addr: usize,
}

impl QueueId {
    pub(crate) fn issue(slot: u8, queue: &dyn QueueProbe) -> Self {
        Self {
            slot,
            addr: probe_addr(queue),
        }
    }

    /// Handle with no queue behind it, for tables built outside a `Bootstrap`
    #[cfg(test)]
    pub(crate) const fn detached(slot: u8) -> Self {
        Self { slot, addr: 0 }
    }

    /// Slot in the kernel's queue table
    pub fn index(self) -> usize {
        self.slot as usize
    }

    /// Whether this handle was issued for `queue`
    pub(crate) fn names(self, queue: &dyn QueueProbe) -> bool {
        self.addr == probe_addr(queue)
    }
}

fn probe_addr(queue: &dyn QueueProbe) -> usize {
    queue as *const _ as *const () as usize
}

/// Type-erased view the kernel uses to resolve waits
pub trait QueueProbe: Sync {
    fn name(&self) -> &'static str;
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
    fn overflow_count(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded FIFO with an explicit overflow policy
pub struct EventQueue<T, const N: usize> {
    name: &'static str,
    policy: OverflowPolicy,
    items: Mutex<RefCell<Deque<T, N>>>,
    overflows: AtomicU32,
}

impl<T, const N: usize> EventQueue<T, N> {
    /// Create an empty queue
    pub const fn new(name: &'static str, policy: OverflowPolicy) -> Self {
        Self {
            name,
            policy,
            items: Mutex::new(RefCell::new(Deque::new())),
            overflows: AtomicU32::new(0),
        }
    }

    /// Queue an item without blocking
    pub fn send(&self, item: T) -> SendOutcome {
        let outcome = critical_section::with(|cs| {
            let mut items = self.items.borrow_ref_mut(cs);
            if !items.is_full() {
                // Capacity checked above
                let _ = items.push_back(item);
                return SendOutcome::Accepted;
            }
            match self.policy {
                OverflowPolicy::RejectNewest => SendOutcome::Rejected,
                OverflowPolicy::DropOldest => {
                    items.pop_front();
                    let _ = items.push_back(item);
                    SendOutcome::DisplacedOldest
                }
            }
        });
        if outcome.is_overflow() {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Take the oldest item if there is one
    pub fn try_receive(&self) -> Option<T> {
        critical_section::with(|cs| self.items.borrow_ref_mut(cs).pop_front())
    }

    /// Complete a blocking receive.
    ///
    /// The kernel parks a queue-bound task until an item arrives or its
    /// timeout expires; the body passes the `Wake` it was resumed with.
    /// A timeout wake, or an item already taken by another consumer,
    /// yields `Err(Timeout)`.
    pub fn receive(&self, wake: Wake) -> Result<T, Timeout> {
        match wake {
            Wake::Timeout => Err(Timeout),
            _ => self.try_receive().ok_or(Timeout),
        }
    }

    /// Send-only view for interrupt handlers
    pub fn isr_sender(&self) -> IsrSender<'_, T, N> {
        IsrSender { queue: self }
    }

    /// Drop every queued item
    pub fn clear(&self) {
        critical_section::with(|cs| self.items.borrow_ref_mut(cs).clear());
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.items.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sends that lost an item so far
    pub fn overflow_count(&self) -> u32 {
        self.overflows.load(Ordering::Relaxed)
    }
}

impl<T: Send, const N: usize> QueueProbe for EventQueue<T, N> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn len(&self) -> usize {
        EventQueue::len(self)
    }

    fn capacity(&self) -> usize {
        N
    }

    fn overflow_count(&self) -> u32 {
        EventQueue::overflow_count(self)
    }
}

/// Send-only, non-blocking handle given to interrupt handlers
pub struct IsrSender<'q, T, const N: usize> {
    queue: &'q EventQueue<T, N>,
}

impl<T, const N: usize> IsrSender<'_, T, N> {
    /// Queue an item, applying the queue's overflow policy
    #[inline]
    pub fn send(&self, item: T) -> SendOutcome {
        self.queue.send(item)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.queue.policy()
    }
}

impl<T, const N: usize> Clone for IsrSender<'_, T, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const N: usize> Copy for IsrSender<'_, T, N> {}
