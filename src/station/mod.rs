//! Station firmware: the six-task system of one listening station
//!
//! | task    | class       | prio | core | binding               |
//! |---------|-------------|------|------|-----------------------|
//! | button  | Interrupt   | 24   | 0    | button queue, 1 s t/o |
//! | audio   | AudioTiming | 20   | 1    | audio queue, 5 ms t/o |
//! | display | Ui          | 18   | 1    | every 100 ms          |
//! | mqtt    | Network     | 12   | 1    | every 100 ms          |
//! | wifi    | Network     | 10   | 0    | every 1 s             |
//! | logging | Background  | 1    | 0    | every 500 ms          |
//!
//! Peripherals (codec, OLED, broker, radio, flash) are collaborators
//! behind the traits below.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8};

use crate::bootstrap::{Bootstrap, RegistrationError};
use crate::config::{
    AUDIO_FRAME_PERIOD_MS, AUDIO_QUEUE_DEPTH, BUTTON_QUEUE_DEPTH, FRAME_SAMPLES, WATCHDOG_TIMEOUT,
};
use crate::kernel::Kernel;
use crate::queue::{EventQueue, OverflowPolicy, QueueId};
use crate::session::{SessionCell, SessionSnapshot};
use crate::task::{Affinity, Binding, CoreId, DeadlineClass, Priority, StackBudget, TaskDef};
use crate::time::{ms_to_ticks, Ticks};

mod isr;
mod tasks;

pub use isr::ButtonIsr;
pub use tasks::{AudioTask, ButtonTask, DisplayTask, LoggingTask, MqttTask, WifiTask};

/// Which of the two stations this board is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationId {
    A,
    B,
}

impl StationId {
    pub fn as_str(self) -> &'static str {
        match self {
            StationId::A => "A",
            StationId::B => "B",
        }
    }
}

/// Debounced button press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub pin: u8,
    /// Tick the edge was accepted at
    pub at: Ticks,
}

/// One block of audio for the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrame {
    pub seq: u32,
    /// Track the block belongs to (1-based, 0 = silence)
    pub track: u8,
    pub samples: [i16; FRAME_SAMPLES],
}

impl AudioFrame {
    pub const fn silence(seq: u32) -> Self {
        Self {
            seq,
            track: 0,
            samples: [0; FRAME_SAMPLES],
        }
    }
}

/// Queues and shared state, `const`-constructible for a `static`
pub struct Resources {
    pub buttons: EventQueue<ButtonEvent, BUTTON_QUEUE_DEPTH>,
    pub audio: EventQueue<AudioFrame, AUDIO_QUEUE_DEPTH>,
    pub session: SessionCell,
    /// Track the audio task played last (0 = none)
    pub now_playing: AtomicU8,
    /// Last match result received from the server
    pub matched: AtomicBool,
}

impl Resources {
    pub const fn new() -> Self {
        Self {
            // Earliest debounced presses win; later ones are the duplicates
            buttons: EventQueue::new("buttons", OverflowPolicy::RejectNewest),
            // A stale frame is worse than a skipped one
            audio: EventQueue::new("audio", OverflowPolicy::DropOldest),
            session: SessionCell::new(),
            now_playing: AtomicU8::new(0),
            matched: AtomicBool::new(false),
        }
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure reported by a network collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Link is down
    Down,
    /// Peer refused the request
    Refused,
    Timeout,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Down => f.write_str("link down"),
            LinkError::Refused => f.write_str("refused by peer"),
            LinkError::Timeout => f.write_str("timed out"),
        }
    }
}

/// Failure reported by the log store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    Full,
    Io,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Full => f.write_str("log store full"),
            StoreError::Io => f.write_str("flash write failed"),
        }
    }
}

/// Lock announcement (`blinddate/lock`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMessage {
    pub station: StationId,
    pub track: u8,
    pub session: u32,
    pub at: Ticks,
}

/// Liveness announcement (`blinddate/heartbeat`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub station: StationId,
    pub at: Ticks,
}

/// Server verdict (`blinddate/status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchStatus {
    pub station: StationId,
    pub matched: bool,
}

/// What the OLED shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusView {
    pub session: SessionSnapshot,
    pub now_playing: Option<u8>,
    pub matched: bool,
}

/// Codec / I2S output
pub trait AudioSink {
    /// Hand one frame to the codec; returns the ticks the hand-off took
    fn play(&mut self, frame: &AudioFrame) -> Ticks;
    /// No frame arrived within one frame period
    fn underrun(&mut self);
}

/// Status screen
pub trait StatusDisplay {
    fn render(&mut self, view: &StatusView);
}

/// MQTT broker connection
pub trait MqttLink {
    fn is_connected(&self) -> bool;
    fn connect(&mut self) -> Result<(), LinkError>;
    fn publish_lock(&mut self, msg: &LockMessage) -> Result<(), LinkError>;
    fn publish_heartbeat(&mut self, msg: &Heartbeat) -> Result<(), LinkError>;
    /// Process incoming traffic; returns a status addressed to us, if any
    fn poll(&mut self) -> Result<Option<MatchStatus>, LinkError>;
}

/// WiFi station interface
pub trait WifiLink {
    fn is_up(&self) -> bool;
    fn reconnect(&mut self) -> Result<(), LinkError>;
}

/// Flash-backed log buffer
pub trait LogStore {
    /// Write buffered records out; returns how many were written
    fn flush(&mut self) -> Result<usize, StoreError>;
}

/// Declared worst-case ticks per iteration
pub mod wcet {
    use crate::time::Ticks;

    pub const BUTTON: Ticks = 2;
    pub const AUDIO: Ticks = 5;
    pub const DISPLAY: Ticks = 12;
    pub const MQTT: Ticks = 50;
    pub const WIFI: Ticks = 5;
    pub const LOGGING: Ticks = 100;
}

/// Audio must come round within 50 frame periods
const AUDIO_LIVENESS: Ticks = ms_to_ticks(AUDIO_FRAME_PERIOD_MS * 50);

/// Registration parameters of the six tasks
pub fn task_table(buttons: QueueId, audio: QueueId) -> [TaskDef; 6] {
    [
        TaskDef {
            name: "button",
            class: DeadlineClass::Interrupt,
            priority: Priority(24),
            affinity: Affinity::Pinned(CoreId::Core0),
            stack: StackBudget(1024),
            binding: Binding::Queue {
                queue: buttons,
                timeout: Some(ms_to_ticks(1_000)),
            },
            wcet: wcet::BUTTON,
            liveness: Some(WATCHDOG_TIMEOUT),
        },
        TaskDef {
            name: "audio",
            class: DeadlineClass::AudioTiming,
            priority: Priority(20),
            affinity: Affinity::Pinned(CoreId::Core1),
            stack: StackBudget(4096),
            binding: Binding::Queue {
                queue: audio,
                timeout: Some(ms_to_ticks(AUDIO_FRAME_PERIOD_MS)),
            },
            wcet: wcet::AUDIO,
            liveness: Some(AUDIO_LIVENESS),
        },
        TaskDef {
            name: "display",
            class: DeadlineClass::Ui,
            priority: Priority(18),
            affinity: Affinity::Pinned(CoreId::Core1),
            stack: StackBudget(2048),
            binding: Binding::Periodic {
                period: ms_to_ticks(100),
            },
            wcet: wcet::DISPLAY,
            liveness: Some(WATCHDOG_TIMEOUT),
        },
        TaskDef {
            name: "mqtt",
            class: DeadlineClass::Network,
            priority: Priority(12),
            affinity: Affinity::Pinned(CoreId::Core1),
            stack: StackBudget(4096),
            binding: Binding::Periodic {
                period: ms_to_ticks(100),
            },
            wcet: wcet::MQTT,
            liveness: Some(WATCHDOG_TIMEOUT),
        },
        TaskDef {
            name: "wifi",
            class: DeadlineClass::Network,
            priority: Priority(10),
            affinity: Affinity::Pinned(CoreId::Core0),
            stack: StackBudget(2048),
            binding: Binding::Periodic {
                period: ms_to_ticks(1_000),
            },
            wcet: wcet::WIFI,
            liveness: Some(WATCHDOG_TIMEOUT),
        },
        TaskDef {
            name: "logging",
            class: DeadlineClass::Background,
            priority: Priority(1),
            affinity: Affinity::Pinned(CoreId::Core0),
            stack: StackBudget(2048),
            binding: Binding::Periodic {
                period: ms_to_ticks(500),
            },
            wcet: wcet::LOGGING,
            liveness: None,
        },
    ]
}

/// External collaborators of one station
pub struct Peripherals<A, D, M, W, L> {
    pub audio: A,
    pub display: D,
    pub mqtt: M,
    pub wifi: W,
    pub log: L,
}

/// The six task bodies of one station, bound to the resources they share
pub struct Station<'r, A, D, M, W, L> {
    resources: &'r Resources,
    pub button: ButtonTask<'r>,
    pub audio: AudioTask<'r, A>,
    pub display: DisplayTask<'r, D>,
    pub mqtt: MqttTask<'r, M>,
    pub wifi: WifiTask<W>,
    pub logging: LoggingTask<L>,
}

impl<'r, A, D, M, W, L> Station<'r, A, D, M, W, L>
where
    A: AudioSink,
    D: StatusDisplay,
    M: MqttLink,
    W: WifiLink,
    L: LogStore,
{
    /// Build the task bodies; `None` if the session writer is already taken
    pub fn new(
        resources: &'r Resources,
        id: StationId,
        peripherals: Peripherals<A, D, M, W, L>,
    ) -> Option<Self> {
        let writer = resources.session.writer()?;
        let reader = resources.session.reader();
        Some(Self {
            resources,
            button: ButtonTask::new(&resources.buttons, writer, &resources.now_playing),
            audio: AudioTask::new(&resources.audio, peripherals.audio, &resources.now_playing),
            display: DisplayTask::new(
                peripherals.display,
                reader,
                &resources.now_playing,
                &resources.matched,
            ),
            mqtt: MqttTask::new(peripherals.mqtt, id, reader, &resources.matched),
            wifi: WifiTask::new(peripherals.wifi),
            logging: LoggingTask::new(peripherals.log),
        })
    }

    /// Register the station's queues and tasks, then start the kernel
    pub fn boot<'k>(&'k mut self) -> Result<Kernel<'k>, RegistrationError>
    where
        'r: 'k,
    {
        let resources: &'r Resources = self.resources;
        let mut boot = Bootstrap::new();
        let buttons = boot.queue(&resources.buttons)?;
        let audio = boot.queue(&resources.audio)?;
        let [button, audio_def, display, mqtt, wifi, logging] = task_table(buttons, audio);

        boot.task(button, &mut self.button)?;
        boot.task(audio_def, &mut self.audio)?;
        boot.task(display, &mut self.display)?;
        boot.task(mqtt, &mut self.mqtt)?;
        boot.task(wifi, &mut self.wifi)?;
        boot.task(logging, &mut self.logging)?;
        boot.start()
    }
}
