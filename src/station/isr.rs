//! GPIO edge handler for the lock button

use log::trace;

use crate::config::{BUTTON_QUEUE_DEPTH, DEBOUNCE_MS};
use crate::queue::{IsrSender, SendOutcome};
use crate::time::{ms_to_ticks, Ticks};

use super::ButtonEvent;

const DEBOUNCE: Ticks = ms_to_ticks(DEBOUNCE_MS);

/// Debounces edges and forwards presses through the send-only queue view
pub struct ButtonIsr<'q> {
    sender: IsrSender<'q, ButtonEvent, BUTTON_QUEUE_DEPTH>,
    pin: u8,
    last_accepted: Option<Ticks>,
}

impl<'q> ButtonIsr<'q> {
    pub fn new(sender: IsrSender<'q, ButtonEvent, BUTTON_QUEUE_DEPTH>, pin: u8) -> Self {
        Self {
            sender,
            pin,
            last_accepted: None,
        }
    }

    /// Falling edge at `now`. Returns `None` for bounce.
    pub fn on_edge(&mut self, now: Ticks) -> Option<SendOutcome> {
        if let Some(last) = self.last_accepted {
            if now.saturating_sub(last) < DEBOUNCE {
                trace!("pin {}: bounce at {}", self.pin, now);
                return None;
            }
        }
        self.last_accepted = Some(now);
        Some(self.sender.send(ButtonEvent { pin: self.pin, at: now }))
    }
}
