//! Loop bodies of the six station tasks

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use log::{debug, info, warn};

use crate::config::{
    AUDIO_QUEUE_DEPTH, BUTTON_QUEUE_DEPTH, HEARTBEAT_INTERVAL_MS, MQTT_RECONNECT_DELAY_MS,
    TRACK_COUNT, WIFI_RECONNECT_DELAY_MS,
};
use crate::queue::EventQueue;
use crate::session::{SessionReader, SessionWriter};
use crate::task::{RunLoop, TaskCx, TaskFault, Wake};
use crate::time::{ms_to_ticks, Ticks};

use super::{
    wcet, AudioFrame, AudioSink, ButtonEvent, Heartbeat, LockMessage, LogStore, MqttLink,
    StationId, StatusDisplay, StatusView, WifiLink,
};

const HEARTBEAT_INTERVAL: Ticks = ms_to_ticks(HEARTBEAT_INTERVAL_MS);
const MQTT_RECONNECT_DELAY: Ticks = ms_to_ticks(MQTT_RECONNECT_DELAY_MS);
const WIFI_RECONNECT_DELAY: Ticks = ms_to_ticks(WIFI_RECONNECT_DELAY_MS);

/// Base cost of one MQTT event-processing pass
const MQTT_POLL_WORK: Ticks = 30;
/// Extra cost per publish
const MQTT_PUBLISH_WORK: Ticks = 10;

/// Is a retry allowed at `now`?
fn retry_due(last_attempt: Option<Ticks>, now: Ticks, delay: Ticks) -> bool {
    last_attempt.map_or(true, |t| now.saturating_sub(t) >= delay)
}

/// Log overflows a queue recorded since the last look
fn report_overflows<T, const N: usize>(queue: &EventQueue<T, N>, seen: &mut u32) {
    let total = queue.overflow_count();
    if total != *seen {
        warn!(
            "queue '{}': {} item(s) lost to overflow",
            queue.name(),
            total.wrapping_sub(*seen)
        );
        *seen = total;
    }
}

/// Handles debounced presses: toggles the lock on the track now playing
pub struct ButtonTask<'r> {
    queue: &'r EventQueue<ButtonEvent, BUTTON_QUEUE_DEPTH>,
    session: SessionWriter<'r>,
    now_playing: &'r AtomicU8,
    seen_overflows: u32,
    /// Presses that arrived with nothing to lock on
    pub ignored: u32,
}

impl<'r> ButtonTask<'r> {
    pub fn new(
        queue: &'r EventQueue<ButtonEvent, BUTTON_QUEUE_DEPTH>,
        session: SessionWriter<'r>,
        now_playing: &'r AtomicU8,
    ) -> Self {
        Self {
            queue,
            session,
            now_playing,
            seen_overflows: 0,
            ignored: 0,
        }
    }
}

impl RunLoop for ButtonTask<'_> {
    fn step(&mut self, wake: Wake, cx: &mut TaskCx<'_>) -> Result<Ticks, TaskFault> {
        cx.checkin();
        let now = cx.now();
        report_overflows(self.queue, &mut self.seen_overflows);
        self.session.expire(now);

        let Ok(event) = self.queue.receive(wake) else {
            return Ok(1);
        };
        let track = self.now_playing.load(Ordering::Relaxed);
        if self.session.current().locked || (1..=TRACK_COUNT).contains(&track) {
            let state = self.session.toggle(track, now);
            debug!(
                "press on pin {} at {}: locked={} track={}",
                event.pin, event.at, state.locked, state.track
            );
        } else {
            self.ignored += 1;
            debug!("press at {} ignored, nothing playing", event.at);
        }
        Ok(wcet::BUTTON)
    }
}

/// Streams frames to the codec
pub struct AudioTask<'r, A> {
    queue: &'r EventQueue<AudioFrame, AUDIO_QUEUE_DEPTH>,
    sink: A,
    now_playing: &'r AtomicU8,
    last_seq: Option<u32>,
    playing: bool,
    seen_overflows: u32,
    /// Frames handed to the codec
    pub frames: u32,
    /// Frame periods that passed with nothing to play
    pub underruns: u32,
    /// Frames missing from the sequence (dropped upstream or by overflow)
    pub gaps: u32,
}

impl<'r, A: AudioSink> AudioTask<'r, A> {
    pub fn new(
        queue: &'r EventQueue<AudioFrame, AUDIO_QUEUE_DEPTH>,
        sink: A,
        now_playing: &'r AtomicU8,
    ) -> Self {
        Self {
            queue,
            sink,
            now_playing,
            last_seq: None,
            playing: false,
            seen_overflows: 0,
            frames: 0,
            underruns: 0,
            gaps: 0,
        }
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }
}

impl<A: AudioSink> RunLoop for AudioTask<'_, A> {
    fn step(&mut self, wake: Wake, cx: &mut TaskCx<'_>) -> Result<Ticks, TaskFault> {
        cx.checkin();
        report_overflows(self.queue, &mut self.seen_overflows);

        let frame = match self.queue.receive(wake) {
            Ok(frame) => frame,
            Err(_) => {
                if self.playing {
                    self.playing = false;
                    self.underruns = self.underruns.saturating_add(1);
                    self.sink.underrun();
                }
                return Ok(1);
            }
        };

        if let Some(last) = self.last_seq {
            let missed = frame.seq.wrapping_sub(last).wrapping_sub(1);
            if missed != 0 && missed < u32::MAX / 2 {
                self.gaps = self.gaps.saturating_add(missed);
            }
        }
        self.last_seq = Some(frame.seq);
        self.playing = true;
        self.frames = self.frames.saturating_add(1);
        self.now_playing.store(frame.track, Ordering::Relaxed);
        Ok(self.sink.play(&frame))
    }
}

/// Redraws the status screen
pub struct DisplayTask<'r, D> {
    display: D,
    session: SessionReader<'r>,
    now_playing: &'r AtomicU8,
    matched: &'r AtomicBool,
    /// Frames drawn
    pub refreshes: u32,
}

impl<'r, D: StatusDisplay> DisplayTask<'r, D> {
    pub fn new(
        display: D,
        session: SessionReader<'r>,
        now_playing: &'r AtomicU8,
        matched: &'r AtomicBool,
    ) -> Self {
        Self {
            display,
            session,
            now_playing,
            matched,
            refreshes: 0,
        }
    }

    pub fn display(&self) -> &D {
        &self.display
    }
}

impl<D: StatusDisplay> RunLoop for DisplayTask<'_, D> {
    fn step(&mut self, _wake: Wake, cx: &mut TaskCx<'_>) -> Result<Ticks, TaskFault> {
        cx.checkin();
        let track = self.now_playing.load(Ordering::Relaxed);
        let view = StatusView {
            session: self.session.snapshot(),
            now_playing: (track != 0).then_some(track),
            matched: self.matched.load(Ordering::Relaxed),
        };
        self.display.render(&view);
        self.refreshes += 1;
        Ok(wcet::DISPLAY)
    }
}

/// Keeps the broker session alive and announces locks
pub struct MqttTask<'r, M> {
    link: M,
    station: StationId,
    session: SessionReader<'r>,
    matched: &'r AtomicBool,
    last_attempt: Option<Ticks>,
    last_heartbeat: Option<Ticks>,
    /// Last session number announced
    announced: u32,
    was_connected: bool,
}

impl<'r, M: MqttLink> MqttTask<'r, M> {
    pub fn new(
        link: M,
        station: StationId,
        session: SessionReader<'r>,
        matched: &'r AtomicBool,
    ) -> Self {
        Self {
            link,
            station,
            session,
            matched,
            last_attempt: None,
            last_heartbeat: None,
            announced: 0,
            was_connected: false,
        }
    }

    pub fn link(&self) -> &M {
        &self.link
    }

    fn reconnect(&mut self, now: Ticks) {
        if self.was_connected {
            warn!("mqtt: broker connection lost");
            self.was_connected = false;
            self.last_heartbeat = None;
        }
        if !retry_due(self.last_attempt, now, MQTT_RECONNECT_DELAY) {
            return;
        }
        self.last_attempt = Some(now);
        match self.link.connect() {
            Ok(()) => {
                info!("mqtt: connected as station {}", self.station.as_str());
                self.was_connected = true;
            }
            Err(e) => warn!("mqtt: connect failed: {}", e),
        }
    }
}

impl<M: MqttLink> RunLoop for MqttTask<'_, M> {
    fn step(&mut self, _wake: Wake, cx: &mut TaskCx<'_>) -> Result<Ticks, TaskFault> {
        cx.checkin();
        let now = cx.now();
        if !self.link.is_connected() {
            self.reconnect(now);
            return Ok(MQTT_PUBLISH_WORK);
        }
        self.was_connected = true;
        let mut work = MQTT_POLL_WORK;

        let snapshot = self.session.snapshot();
        if snapshot.locked && snapshot.session != self.announced {
            let msg = LockMessage {
                station: self.station,
                track: snapshot.track,
                session: snapshot.session,
                at: snapshot.since,
            };
            match self.link.publish_lock(&msg) {
                Ok(()) => self.announced = snapshot.session,
                Err(e) => warn!("mqtt: lock publish failed: {}", e),
            }
            work += MQTT_PUBLISH_WORK;
        }

        if retry_due(self.last_heartbeat, now, HEARTBEAT_INTERVAL) {
            let msg = Heartbeat {
                station: self.station,
                at: now,
            };
            match self.link.publish_heartbeat(&msg) {
                Ok(()) => self.last_heartbeat = Some(now),
                Err(e) => warn!("mqtt: heartbeat failed: {}", e),
            }
            work += MQTT_PUBLISH_WORK;
        }

        match self.link.poll() {
            Ok(Some(status)) if status.station == self.station => {
                self.matched.store(status.matched, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => warn!("mqtt: poll failed: {}", e),
        }
        Ok(work)
    }
}

/// Watches the WiFi link and reconnects it
pub struct WifiTask<W> {
    link: W,
    last_attempt: Option<Ticks>,
    was_up: bool,
    /// Reconnect attempts made
    pub attempts: u32,
}

impl<W: WifiLink> WifiTask<W> {
    pub fn new(link: W) -> Self {
        Self {
            link,
            last_attempt: None,
            was_up: false,
            attempts: 0,
        }
    }

    pub fn link(&self) -> &W {
        &self.link
    }
}

impl<W: WifiLink> RunLoop for WifiTask<W> {
    fn step(&mut self, _wake: Wake, cx: &mut TaskCx<'_>) -> Result<Ticks, TaskFault> {
        cx.checkin();
        let now = cx.now();
        if self.link.is_up() {
            self.was_up = true;
            return Ok(1);
        }
        if self.was_up {
            warn!("wifi: link lost");
            self.was_up = false;
        }
        if retry_due(self.last_attempt, now, WIFI_RECONNECT_DELAY) {
            self.last_attempt = Some(now);
            self.attempts += 1;
            if let Err(e) = self.link.reconnect() {
                warn!("wifi: reconnect failed: {}", e);
            }
        }
        Ok(wcet::WIFI)
    }
}

/// Flushes buffered log records to flash; may starve
pub struct LoggingTask<L> {
    store: L,
    /// Records written so far
    pub flushed: usize,
}

impl<L: LogStore> LoggingTask<L> {
    pub fn new(store: L) -> Self {
        Self { store, flushed: 0 }
    }

    pub fn store(&self) -> &L {
        &self.store
    }
}

impl<L: LogStore> RunLoop for LoggingTask<L> {
    fn step(&mut self, _wake: Wake, _cx: &mut TaskCx<'_>) -> Result<Ticks, TaskFault> {
        match self.store.flush() {
            Ok(n) => self.flushed += n,
            Err(e) => warn!("logging: flush failed: {}", e),
        }
        Ok(wcet::LOGGING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionCell;
    use crate::station::{LinkError, MatchStatus, Resources};
    use crate::task::TaskId;
    use crate::watchdog::LivenessMonitor;

    fn cx(monitor: &mut LivenessMonitor, now: Ticks) -> TaskCx<'_> {
        TaskCx::new(TaskId(0), now, monitor)
    }

    #[derive(Default)]
    struct Sink {
        played: std::vec::Vec<u32>,
        underruns: u32,
    }

    impl AudioSink for Sink {
        fn play(&mut self, frame: &AudioFrame) -> Ticks {
            self.played.push(frame.seq);
            4
        }

        fn underrun(&mut self) {
            self.underruns += 1;
        }
    }

    #[derive(Default)]
    struct Broker {
        connected: bool,
        refuse: bool,
        connects: u32,
        locks: std::vec::Vec<LockMessage>,
        heartbeats: std::vec::Vec<Ticks>,
        inbox: Option<MatchStatus>,
    }

    impl MqttLink for Broker {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn connect(&mut self) -> Result<(), LinkError> {
            self.connects += 1;
            if self.refuse {
                return Err(LinkError::Refused);
            }
            self.connected = true;
            Ok(())
        }

        fn publish_lock(&mut self, msg: &LockMessage) -> Result<(), LinkError> {
            self.locks.push(*msg);
            Ok(())
        }

        fn publish_heartbeat(&mut self, msg: &Heartbeat) -> Result<(), LinkError> {
            self.heartbeats.push(msg.at);
            Ok(())
        }

        fn poll(&mut self) -> Result<Option<MatchStatus>, LinkError> {
            Ok(self.inbox.take())
        }
    }

    #[test]
    fn test_button_locks_on_playing_track() {
        let res = Resources::new();
        let mut monitor = LivenessMonitor::new();
        let writer = res.session.writer().unwrap();
        let mut task = ButtonTask::new(&res.buttons, writer, &res.now_playing);

        // Nothing playing yet
        res.buttons.send(ButtonEvent { pin: 4, at: 10 });
        assert_eq!(task.step(Wake::Item, &mut cx(&mut monitor, 10)), Ok(wcet::BUTTON));
        assert_eq!(task.ignored, 1);
        assert!(!res.session.reader().snapshot().locked);

        res.now_playing.store(3, Ordering::Relaxed);
        res.buttons.send(ButtonEvent { pin: 4, at: 20 });
        task.step(Wake::Item, &mut cx(&mut monitor, 20)).unwrap();
        let snap = res.session.reader().snapshot();
        assert!(snap.locked);
        assert_eq!(snap.track, 3);

        // Second press releases
        res.buttons.send(ButtonEvent { pin: 4, at: 90 });
        task.step(Wake::Item, &mut cx(&mut monitor, 90)).unwrap();
        assert!(!res.session.reader().snapshot().locked);
    }

    #[test]
    fn test_button_timeout_expires_session() {
        let res = Resources::new();
        let mut monitor = LivenessMonitor::new();
        let writer = res.session.writer().unwrap();
        let mut task = ButtonTask::new(&res.buttons, writer, &res.now_playing);
        res.now_playing.store(1, Ordering::Relaxed);
        res.buttons.send(ButtonEvent { pin: 4, at: 0 });
        task.step(Wake::Item, &mut cx(&mut monitor, 0)).unwrap();
        assert!(res.session.reader().snapshot().locked);

        assert_eq!(task.step(Wake::Timeout, &mut cx(&mut monitor, 29_999)), Ok(1));
        assert!(res.session.reader().snapshot().locked);
        task.step(Wake::Timeout, &mut cx(&mut monitor, 30_000)).unwrap();
        assert!(!res.session.reader().snapshot().locked);
    }

    #[test]
    fn test_audio_counts_gaps_and_underruns() {
        let res = Resources::new();
        let mut monitor = LivenessMonitor::new();
        let mut task = AudioTask::new(&res.audio, Sink::default(), &res.now_playing);

        for seq in [0, 1, 3] {
            let mut frame = AudioFrame::silence(seq);
            frame.track = 2;
            res.audio.send(frame);
            assert_eq!(task.step(Wake::Item, &mut cx(&mut monitor, 0)), Ok(4));
        }
        assert_eq!(task.frames, 3);
        assert_eq!(task.gaps, 1);
        assert_eq!(res.now_playing.load(Ordering::Relaxed), 2);

        // Only the first silent period after playback is an underrun
        task.step(Wake::Timeout, &mut cx(&mut monitor, 10)).unwrap();
        task.step(Wake::Timeout, &mut cx(&mut monitor, 15)).unwrap();
        assert_eq!(task.underruns, 1);
        assert_eq!(task.sink().underruns, 1);
        assert_eq!(task.sink().played, [0, 1, 3]);
    }

    #[test]
    fn test_audio_gap_count_saturates() {
        let res = Resources::new();
        let mut monitor = LivenessMonitor::new();
        let mut task = AudioTask::new(&res.audio, Sink::default(), &res.now_playing);

        // Each jump skips just under half the sequence space
        for seq in [0, 0x7fff_fff0, 0xffff_ffe0, 0x7fff_ffd0] {
            res.audio.send(AudioFrame::silence(seq));
            assert_eq!(task.step(Wake::Item, &mut cx(&mut monitor, 0)), Ok(4));
        }
        assert_eq!(task.frames, 4);
        assert_eq!(task.gaps, u32::MAX);
    }

    #[test]
    fn test_mqtt_reconnect_is_paced() {
        let cell = SessionCell::new();
        let matched = AtomicBool::new(false);
        let mut monitor = LivenessMonitor::new();
        let broker = Broker {
            refuse: true,
            ..Broker::default()
        };
        let mut task = MqttTask::new(broker, StationId::A, cell.reader(), &matched);

        for now in (0..10_000).step_by(100) {
            task.step(Wake::Timer, &mut cx(&mut monitor, now)).unwrap();
        }
        // Attempts at 0 and 5000 only
        assert_eq!(task.link().connects, 2);
    }

    #[test]
    fn test_mqtt_announces_each_session_once() {
        let cell = SessionCell::new();
        let matched = AtomicBool::new(false);
        let mut writer = cell.writer().unwrap();
        let mut monitor = LivenessMonitor::new();
        let mut task = MqttTask::new(Broker::default(), StationId::B, cell.reader(), &matched);

        task.step(Wake::Start, &mut cx(&mut monitor, 0)).unwrap();
        assert!(task.link().connected);

        writer.lock(5, 50);
        let work = task.step(Wake::Timer, &mut cx(&mut monitor, 100)).unwrap();
        // First connected pass also sends the initial heartbeat
        assert_eq!(work, MQTT_POLL_WORK + 2 * MQTT_PUBLISH_WORK);
        assert!(work <= wcet::MQTT);
        task.step(Wake::Timer, &mut cx(&mut monitor, 200)).unwrap();

        assert_eq!(
            task.link().locks,
            [LockMessage {
                station: StationId::B,
                track: 5,
                session: 1,
                at: 50,
            }]
        );
        assert_eq!(task.link().heartbeats, [100]);
    }

    #[test]
    fn test_mqtt_heartbeat_interval_and_status() {
        let cell = SessionCell::new();
        let matched = AtomicBool::new(false);
        let mut monitor = LivenessMonitor::new();
        let mut task = MqttTask::new(Broker::default(), StationId::A, cell.reader(), &matched);

        for now in (0..=60_000).step_by(100) {
            task.step(Wake::Timer, &mut cx(&mut monitor, now)).unwrap();
        }
        assert_eq!(task.link().heartbeats, [100, 30_100]);

        task.link.inbox = Some(MatchStatus {
            station: StationId::A,
            matched: true,
        });
        task.step(Wake::Timer, &mut cx(&mut monitor, 60_100)).unwrap();
        assert!(matched.load(Ordering::Relaxed));
    }
}
