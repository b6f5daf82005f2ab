//! Build-time configuration
//!
//! Every limit and timing constant the kernel and the station firmware
//! consume. Nothing here changes at runtime.

use crate::time::{ms_to_ticks, Ticks};

/// Scheduler tick frequency (1 ms resolution)
pub const TICK_HZ: u32 = 1000;

/// Homogeneous cores sharing one priority space
pub const NUM_CORES: usize = 2;

/// Task table capacity
pub const MAX_TASKS: usize = 8;

/// Queue table capacity
pub const MAX_QUEUES: usize = 4;

/// Priority the liveness monitor runs at.
///
/// Strictly above every application band; registration rejects any task
/// at or above it.
pub const MONITOR_PRIORITY: u8 = 25;

/// Monitor poll interval in ticks
pub const MONITOR_POLL_TICKS: Ticks = 1;

/// Smallest stack a task may be created with (bytes)
pub const MIN_STACK_BYTES: u32 = 512;

/// Hardware watchdog timeout
pub const WATCHDOG_TIMEOUT_MS: u32 = 5_000;

// --- Station timing (inputs to task periods and bounds) ---

/// GPIO edges closer than this to the last accepted press are bounce
pub const DEBOUNCE_MS: u32 = 50;
/// MQTT heartbeat publish interval
pub const HEARTBEAT_INTERVAL_MS: u32 = 30_000;
/// Minimum spacing between WiFi reconnect attempts
pub const WIFI_RECONNECT_DELAY_MS: u32 = 1_000;
/// Minimum spacing between MQTT reconnect attempts
pub const MQTT_RECONNECT_DELAY_MS: u32 = 5_000;
/// A lock that has not been released after this long expires
pub const SESSION_TIMEOUT_MS: u32 = 30_000;

// --- Station I/O ---

/// GPIO the lock button is wired to
pub const BUTTON_PIN: u8 = 4;
/// Button-event queue depth
pub const BUTTON_QUEUE_DEPTH: usize = 4;
/// Audio-frame queue depth (~4 frames of playback slack)
pub const AUDIO_QUEUE_DEPTH: usize = 4;
/// Samples per audio frame (256 @ 44.1 kHz ≈ 5.8 ms)
pub const FRAME_SAMPLES: usize = 256;
/// Audio receive timeout, one frame period
pub const AUDIO_FRAME_PERIOD_MS: u32 = 5;
/// Tracks a station can lock on
pub const TRACK_COUNT: u8 = 5;

/// Watchdog timeout in ticks
pub const WATCHDOG_TIMEOUT: Ticks = ms_to_ticks(WATCHDOG_TIMEOUT_MS);
