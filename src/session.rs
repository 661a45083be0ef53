//! # Live Session
//!
//! The orchestrator: owns the realtime channel, the capture pipeline and the
//! playback scheduler, and moves the session through its states in response
//! to events taken one at a time from the session queue.
//!
//! ## State Machine:
//! ```text
//! Uninitialized ──start──▶ Connecting ──opened──▶ Open ⇄ Recording
//!                              │                    │        │
//!                              └──────closed────────┴────────┴──▶ Closed
//!        any state ──channel error / local failure──▶ Errored
//!        Closed / Errored / any ──reset──▶ Connecting
//! ```
//!
//! ## Cleanup Guarantees:
//! - Leaving `Recording` for any reason releases the microphone
//! - `reset` flushes playback and closes the old channel before reconnecting
//! - Events from a channel discarded by `reset` are ignored by connection id
//! - Microphone frames from a stopped recording are dropped by generation

use crate::audio::capture::CapturePipeline;
use crate::audio::codec::{decode_audio_data, decode_base64, AudioFrame};
use crate::audio::scheduler::{PlaybackScheduler, UnitId};
use crate::channel::{
    ChannelEvent, ConnectionId, InboundPayload, RealtimeChannel, RealtimeConnector, SessionRequest,
};
use crate::error::{AppError, AppResult};
use crate::events::{EventReceiver, EventSender, SessionEvent, UserCommand};
use crate::state::AppState;
use std::fmt;
use std::ops::ControlFlow;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Open,
    Recording,
    Closed,
    /// Unrecoverable failure, with the message shown to the user
    Errored(String),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Recording => "recording",
            SessionState::Closed => "closed",
            SessionState::Errored(_) => "errored",
        }
    }

    /// Whether the channel is usable (reply audio is accepted).
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Recording)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status readout: current state plus the latest message for the user.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: SessionState,
    pub message: String,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.state, self.message)
    }
}

pub struct LiveSession {
    state: SessionState,
    app: AppState,
    request: SessionRequest,
    connector: Box<dyn RealtimeConnector>,
    channel: Option<Box<dyn RealtimeChannel>>,
    connection: ConnectionId,
    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    events: EventSender,
    status: watch::Sender<StatusReport>,
}

impl LiveSession {
    /// Assemble a session. Nothing is opened until [`start`](Self::start).
    ///
    /// `events` must feed the queue later passed to [`run`](Self::run); the
    /// channel and the microphone report into it.
    pub fn new(
        app: AppState,
        request: SessionRequest,
        connector: Box<dyn RealtimeConnector>,
        capture: CapturePipeline,
        scheduler: PlaybackScheduler,
        events: EventSender,
    ) -> Self {
        let (status, _) = watch::channel(StatusReport {
            state: SessionState::Uninitialized,
            message: "Initializing".to_string(),
        });
        Self {
            state: SessionState::Uninitialized,
            app,
            request,
            connector,
            channel: None,
            connection: 0,
            capture,
            scheduler,
            events,
            status,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    /// Watch the status readout.
    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.subscribe()
    }

    /// Current status readout.
    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    /// `Uninitialized → Connecting`: open the realtime channel.
    pub fn start(&mut self) {
        if self.state == SessionState::Uninitialized {
            self.connect();
        }
    }

    /// Drain the event queue until a `Quit` command shuts the session down.
    ///
    /// The session keeps a sender of its own for the microphone, so the queue
    /// never closes underneath it; `Quit` is the only way out.
    pub async fn run(&mut self, mut events: EventReceiver) {
        self.start();
        while let Some(event) = events.recv().await {
            if self.handle_event(event).is_break() {
                break;
            }
        }
    }

    /// Handle one queued event. Returns `Break` once the session has shut down.
    pub fn handle_event(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Command(command) => return self.handle_command(command),
            SessionEvent::Channel { connection, event } => {
                if connection == self.connection {
                    self.handle_channel_event(event);
                } else {
                    debug!(connection, current = self.connection, "Ignoring event from a discarded channel");
                }
            }
            SessionEvent::CapturedFrame { generation, frame } => {
                self.forward_frame(generation, &frame);
            }
            SessionEvent::PlaybackEnded(unit) => self.playback_ended(unit),
        }
        ControlFlow::Continue(())
    }

    fn handle_command(&mut self, command: UserCommand) -> ControlFlow<()> {
        debug!(?command, state = %self.state, "User command");
        match command {
            UserCommand::StartRecording => {
                // The failure is already on the status line
                let _ = self.start_recording();
            }
            UserCommand::StopRecording => self.stop_recording(),
            UserCommand::Reset => self.reset(),
            UserCommand::Quit => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// `Open → Recording`. Only valid while `Open`; if the microphone cannot
    /// be acquired the session stays `Open`.
    pub fn start_recording(&mut self) -> AppResult<()> {
        match self.state {
            SessionState::Recording => return Ok(()),
            SessionState::Open => {}
            _ => {
                self.publish("Not connected; wait for the session to open or reset it");
                return Err(AppError::Channel(format!(
                    "cannot record while {}",
                    self.state
                )));
            }
        }

        match self.capture.start(&self.events) {
            Ok(()) => {
                self.transition(SessionState::Recording, "Listening");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Could not start recording");
                self.capture.stop();
                self.app.record_error();
                self.publish(e.status_message());
                Err(e)
            }
        }
    }

    /// `Recording → Open`. Releasing the microphone is safe in any state.
    pub fn stop_recording(&mut self) {
        self.capture.stop();
        if self.state == SessionState::Recording {
            self.transition(SessionState::Open, "Stopped listening");
        }
    }

    /// Tear everything down and reconnect. Callable from any state.
    pub fn reset(&mut self) {
        info!(state = %self.state, "Resetting session");
        self.capture.stop();
        let flushed = self.scheduler.reset();
        debug!(flushed, "Playback flushed for reset");
        self.close_channel();
        self.app.record_reset();
        self.connect();
    }

    /// Final cleanup: microphone released, playback flushed, channel closed.
    pub fn shutdown(&mut self) {
        self.capture.stop();
        if self.scheduler.is_playing() {
            debug!(active = self.scheduler.active_count(), "Cutting reply playback for shutdown");
        }
        self.scheduler.interrupt();
        self.close_channel();
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closed, "Session ended");
        }
    }

    fn connect(&mut self) {
        self.connection += 1;
        self.transition(SessionState::Connecting, "Connecting");
        self.app.record_connection();

        match self
            .connector
            .connect(&self.request, self.connection, self.events.clone())
        {
            Ok(channel) => self.channel = Some(channel),
            Err(e) => self.fail(e),
        }
    }

    fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                if self.state == SessionState::Connecting {
                    self.transition(SessionState::Open, "Connected");
                }
            }
            ChannelEvent::Message(payload) => {
                if self.state.is_connected() {
                    self.handle_payload(payload);
                } else {
                    debug!(state = %self.state, "Ignoring message outside an open session");
                }
            }
            ChannelEvent::Error(message) => self.fail(AppError::Channel(message)),
            ChannelEvent::Closed(reason) => match self.state {
                SessionState::Connecting | SessionState::Open | SessionState::Recording => {
                    self.capture.stop();
                    self.channel = None;
                    self.transition(SessionState::Closed, format!("Connection closed: {}", reason));
                }
                _ => debug!(state = %self.state, reason = %reason, "Close after session ended"),
            },
        }
    }

    /// Schedule every audio part in order, then apply an interruption if the
    /// same message carries one.
    fn handle_payload(&mut self, payload: InboundPayload) {
        for data in &payload.audio_data {
            if let Err(e) = self.schedule_reply(data) {
                match e {
                    AppError::Decode(_) => {
                        warn!(error = %e, "Dropping malformed reply chunk");
                        self.app.record_decode_error();
                    }
                    _ => {
                        error!(error = %e, kind = e.kind(), "Could not schedule reply chunk");
                        self.app.record_error();
                    }
                }
                self.publish(e.status_message());
            }
        }

        if payload.interrupted {
            let units = self.scheduler.interrupt();
            self.app.record_interruption(units);
        }
    }

    fn schedule_reply(&mut self, data: &str) -> AppResult<()> {
        let audio = &self.app.config.audio;
        let raw = decode_base64(data)?;
        let buffer = decode_audio_data(&raw, audio.output_sample_rate, audio.output_channels)?;
        let unit = self.scheduler.schedule_chunk(buffer)?;
        self.app.record_chunk_scheduled(unit.duration);
        Ok(())
    }

    fn forward_frame(&mut self, generation: u64, frame: &AudioFrame) {
        let sent = self.state == SessionState::Recording
            && matches!(
                self.capture.forward(generation, frame, self.channel.as_deref()),
                Ok(true)
            );
        if sent {
            self.app.record_frame_sent();
        } else {
            self.app.record_frame_dropped();
        }
    }

    fn playback_ended(&mut self, unit: UnitId) {
        if !self.scheduler.handle_ended(unit) {
            debug!(unit = %unit, "Completion for a unit already removed");
        }
    }

    /// `any → Errored`: release the microphone and the channel. Reply audio
    /// already scheduled plays out.
    fn fail(&mut self, err: AppError) {
        error!(error = %err, kind = err.kind(), "Session failed");
        self.capture.stop();
        self.close_channel();
        self.app.record_error();
        let message = err.status_message();
        self.transition(SessionState::Errored(message.clone()), message);
    }

    fn transition(&mut self, state: SessionState, message: impl Into<String>) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Session state change");
        }
        self.state = state;
        self.publish(message);
    }

    fn publish(&self, message: impl Into<String>) {
        self.status.send_replace(StatusReport {
            state: self.state.clone(),
            message: message.into(),
        });
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.capture.stop();
        self.close_channel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::tests::FakeMicrophone;
    use crate::audio::codec::{decode_bytes, encode_samples, EncodedBlob, OUTPUT_SAMPLE_RATE};
    use crate::audio::scheduler::tests::ManualSink;
    use crate::audio::scheduler::CompletionNotifier;
    use crate::audio::tap::SignalTap;
    use crate::config::AppConfig;
    use crate::events::event_queue;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ChannelLog {
        sent: Mutex<Vec<EncodedBlob>>,
        closes: Mutex<usize>,
    }

    struct TestChannel {
        log: Arc<ChannelLog>,
        open: bool,
    }

    impl RealtimeChannel for TestChannel {
        fn send_realtime_input(&self, blob: EncodedBlob) -> AppResult<()> {
            if !self.open {
                return Err(AppError::Channel("closed".to_string()));
            }
            self.log.sent.lock().unwrap().push(blob);
            Ok(())
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                *self.log.closes.lock().unwrap() += 1;
            }
        }
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        channels: Arc<Mutex<Vec<(ConnectionId, Arc<ChannelLog>)>>>,
        requests: Arc<Mutex<Vec<SessionRequest>>>,
        refuse: Arc<Mutex<bool>>,
    }

    impl FakeConnector {
        fn log(&self, index: usize) -> Arc<ChannelLog> {
            Arc::clone(&self.channels.lock().unwrap()[index].1)
        }

        fn count(&self) -> usize {
            self.channels.lock().unwrap().len()
        }
    }

    impl RealtimeConnector for FakeConnector {
        fn connect(
            &mut self,
            request: &SessionRequest,
            connection: ConnectionId,
            _events: EventSender,
        ) -> AppResult<Box<dyn RealtimeChannel>> {
            if *self.refuse.lock().unwrap() {
                return Err(AppError::Channel("handshake refused".to_string()));
            }
            self.requests.lock().unwrap().push(request.clone());
            let log = Arc::new(ChannelLog::default());
            self.channels.lock().unwrap().push((connection, Arc::clone(&log)));
            Ok(Box::new(TestChannel { log, open: true }))
        }
    }

    struct Harness {
        session: LiveSession,
        rx: EventReceiver,
        app: AppState,
        sink: Arc<ManualSink>,
        mic: FakeMicrophone,
        connector: FakeConnector,
    }

    impl Harness {
        fn new() -> Self {
            let app = AppState::new(AppConfig::default());
            let (tx, rx) = event_queue();
            let sink = Arc::new(ManualSink::default());
            let ended_tx = tx.clone();
            let notify: CompletionNotifier = Arc::new(move |id| {
                let _ = ended_tx.send(SessionEvent::PlaybackEnded(id));
            });
            let scheduler = PlaybackScheduler::new(sink.clone(), notify);
            let mic = FakeMicrophone::default();
            let capture = CapturePipeline::new(Box::new(mic.clone()), SignalTap::new("input", 256), 256);
            let connector = FakeConnector::default();
            let request = SessionRequest {
                model: "models/test".to_string(),
                response_modality: "AUDIO".to_string(),
                voice: "Orus".to_string(),
                system_instruction: Some("Be brief.".to_string()),
            };
            let session = LiveSession::new(
                app.clone(),
                request,
                Box::new(connector.clone()),
                capture,
                scheduler,
                tx,
            );
            Self { session, rx, app, sink, mic, connector }
        }

        /// Start and acknowledge the first connection.
        fn open() -> Self {
            let mut h = Self::new();
            h.session.start();
            h.channel_event(ChannelEvent::Opened);
            assert_eq!(h.session.state(), &SessionState::Open);
            h
        }

        fn channel_event(&mut self, event: ChannelEvent) {
            let connection = self.session.connection();
            let _ = self.session.handle_event(SessionEvent::Channel { connection, event });
        }

        /// Feed every queued event back into the session.
        fn pump(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                let _ = self.session.handle_event(event);
            }
        }

        fn reply(&mut self, audio: Vec<String>, interrupted: bool) {
            self.channel_event(ChannelEvent::Message(InboundPayload {
                audio_data: audio,
                interrupted,
            }));
        }
    }

    fn reply_chunk(seconds: f64) -> String {
        let frames = (seconds * f64::from(OUTPUT_SAMPLE_RATE)) as usize;
        encode_samples(&vec![0.0; frames], OUTPUT_SAMPLE_RATE).data
    }

    #[test]
    fn test_start_connects_with_request() {
        let mut h = Harness::new();
        assert_eq!(h.session.state(), &SessionState::Uninitialized);

        h.session.start();
        assert_eq!(h.session.state(), &SessionState::Connecting);
        assert_eq!(h.connector.count(), 1);
        let requests = h.connector.requests.lock().unwrap();
        assert_eq!(requests[0].system_instruction.as_deref(), Some("Be brief."));
    }

    #[test]
    fn test_opened_moves_to_open() {
        let h = Harness::open();
        let status = h.session.status();
        assert_eq!(status.state, SessionState::Open);
        assert_eq!(status.to_string(), "[open] Connected");
    }

    #[test]
    fn test_connect_failure_is_errored() {
        let mut h = Harness::new();
        *h.connector.refuse.lock().unwrap() = true;
        h.session.start();
        assert!(matches!(h.session.state(), SessionState::Errored(_)));
        assert!(h.session.status().message.contains("handshake refused"));
    }

    #[test]
    fn test_recording_forwards_frames() {
        let mut h = Harness::open();
        h.session.start_recording().unwrap();
        assert_eq!(h.session.state(), &SessionState::Recording);

        h.mic.speak(&[0.0; 256]);
        h.pump();

        let log = h.connector.log(0);
        let sent = log.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mime_type, "audio/pcm;rate=16000");
        let samples = decode_bytes(&decode_base64(&sent[0].data).unwrap()).unwrap();
        assert_eq!(samples, vec![0i16; 256]);
        assert_eq!(h.app.metrics_snapshot().frames_sent, 1);
    }

    #[test]
    fn test_recording_requires_open_session() {
        let mut h = Harness::new();
        h.session.start();
        assert!(h.session.start_recording().is_err());
        assert_eq!(h.session.state(), &SessionState::Connecting);
        assert_eq!(*h.mic.acquired.lock().unwrap(), 0);
    }

    #[test]
    fn test_denied_microphone_stays_open() {
        let mut h = Harness::open();
        *h.mic.deny.lock().unwrap() = true;

        let err = h.session.start_recording().unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));
        assert_eq!(h.session.state(), &SessionState::Open);
        assert!(!h.session.capture.is_active());
        assert!(h.session.status().message.starts_with("Microphone unavailable"));
    }

    #[test]
    fn test_frames_after_stop_are_not_forwarded() {
        let mut h = Harness::open();
        h.session.start_recording().unwrap();
        h.mic.speak(&[0.1; 256]);

        // The frame is still queued when recording stops
        h.session.stop_recording();
        assert_eq!(h.session.state(), &SessionState::Open);
        h.pump();

        assert!(h.connector.log(0).sent.lock().unwrap().is_empty());
        assert_eq!(h.app.metrics_snapshot().frames_dropped, 1);
        assert_eq!(*h.mic.released.lock().unwrap(), 1);

        // Stopping again changes nothing
        h.session.stop_recording();
        assert_eq!(*h.mic.released.lock().unwrap(), 1);
    }

    #[test]
    fn test_reply_chunks_play_gaplessly_then_interrupt() {
        let mut h = Harness::open();
        h.sink.set_now(10.0);

        h.reply(vec![reply_chunk(1.0), reply_chunk(0.5), reply_chunk(2.0)], false);
        assert_eq!(h.sink.start_times(), vec![10.0, 11.0, 11.5]);
        assert_eq!(h.session.scheduler().active_count(), 3);

        h.sink.set_now(10.7);
        h.reply(vec![], true);
        assert_eq!(h.session.scheduler().active_count(), 0);
        assert_eq!(h.session.scheduler().next_start_time(), 0.0);
        assert_eq!(h.sink.stopped.lock().unwrap().len(), 3);

        let metrics = h.app.metrics_snapshot();
        assert_eq!(metrics.chunks_scheduled, 3);
        assert_eq!(metrics.interruptions, 1);
        assert_eq!(metrics.units_interrupted, 3);
    }

    #[test]
    fn test_audio_and_interrupt_in_one_message() {
        let mut h = Harness::open();
        h.reply(vec![reply_chunk(0.5)], true);

        assert_eq!(h.sink.started.lock().unwrap().len(), 1);
        assert_eq!(h.sink.stopped.lock().unwrap().len(), 1);
        assert!(!h.session.scheduler().is_playing());
    }

    #[test]
    fn test_malformed_audio_keeps_session_open() {
        let mut h = Harness::open();
        // Invalid base64, then valid base64 holding three bytes
        h.reply(vec!["%%%".to_string(), "AAAA".to_string(), reply_chunk(0.5)], false);

        assert_eq!(h.session.state(), &SessionState::Open);
        assert_eq!(h.app.metrics_snapshot().decode_errors, 2);
        assert_eq!(h.session.scheduler().active_count(), 1);
        assert_eq!(*h.connector.log(0).closes.lock().unwrap(), 0);
    }

    #[test]
    fn test_natural_end_removes_unit() {
        let mut h = Harness::open();
        h.reply(vec![reply_chunk(0.5), reply_chunk(0.5)], false);
        let first = h.sink.started.lock().unwrap()[0].0;

        h.sink.finish(first);
        h.pump();
        assert_eq!(h.session.scheduler().active_count(), 1);
        assert!(!h.session.scheduler().is_active(first));
    }

    #[test]
    fn test_channel_error_releases_microphone_but_lets_audio_finish() {
        let mut h = Harness::open();
        h.session.start_recording().unwrap();
        h.reply(vec![reply_chunk(1.0)], false);

        h.channel_event(ChannelEvent::Error("socket reset".to_string()));
        assert!(matches!(h.session.state(), SessionState::Errored(_)));
        assert!(!h.session.capture.is_active());
        assert_eq!(*h.connector.log(0).closes.lock().unwrap(), 1);
        assert!(h.sink.stopped.lock().unwrap().is_empty());
        assert_eq!(h.session.scheduler().active_count(), 1);
    }

    #[test]
    fn test_close_while_recording() {
        let mut h = Harness::open();
        h.session.start_recording().unwrap();
        h.channel_event(ChannelEvent::Closed("server going away".to_string()));

        assert_eq!(h.session.state(), &SessionState::Closed);
        assert!(!h.session.capture.is_active());
        assert_eq!(h.session.status().message, "Connection closed: server going away");
    }

    #[test]
    fn test_close_while_connecting() {
        let mut h = Harness::new();
        h.session.start();
        h.channel_event(ChannelEvent::Closed("rejected".to_string()));
        assert_eq!(h.session.state(), &SessionState::Closed);
    }

    #[test]
    fn test_reset_discards_old_channel() {
        let mut h = Harness::open();
        h.session.start_recording().unwrap();
        h.reply(vec![reply_chunk(1.0)], false);
        let old = h.session.connection();

        h.session.reset();
        assert_eq!(h.session.state(), &SessionState::Connecting);
        assert_eq!(h.connector.count(), 2);
        assert_eq!(*h.connector.log(0).closes.lock().unwrap(), 1);
        assert!(!h.session.capture.is_active());
        assert_eq!(h.session.scheduler().active_count(), 0);

        // Late events from the old connection change nothing
        let _ = h.session.handle_event(SessionEvent::Channel {
            connection: old,
            event: ChannelEvent::Opened,
        });
        assert_eq!(h.session.state(), &SessionState::Connecting);
        let _ = h.session.handle_event(SessionEvent::Channel {
            connection: old,
            event: ChannelEvent::Error("late".to_string()),
        });
        assert_eq!(h.session.state(), &SessionState::Connecting);

        h.channel_event(ChannelEvent::Opened);
        assert_eq!(h.session.state(), &SessionState::Open);
    }

    #[test]
    fn test_reset_recovers_from_error() {
        let mut h = Harness::open();
        h.channel_event(ChannelEvent::Error("boom".to_string()));
        h.session.reset();
        h.channel_event(ChannelEvent::Opened);
        assert_eq!(h.session.state(), &SessionState::Open);
        assert_eq!(h.app.metrics_snapshot().resets, 1);
    }

    #[test]
    fn test_quit_releases_everything() {
        let mut h = Harness::open();
        h.session.start_recording().unwrap();
        h.reply(vec![reply_chunk(1.0)], false);

        let flow = h.session.handle_event(SessionEvent::Command(UserCommand::Quit));
        assert!(flow.is_break());
        assert_eq!(h.session.state(), &SessionState::Closed);
        assert!(!h.session.capture.is_active());
        assert!(!h.session.scheduler().is_playing());
        assert_eq!(*h.connector.log(0).closes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_processes_queue_until_quit() {
        let mut h = Harness::new();
        let tx = h.session.events.clone();
        let mut status = h.session.subscribe();

        tx.send(SessionEvent::Channel {
            connection: 1,
            event: ChannelEvent::Opened,
        })
        .unwrap();
        tx.send(SessionEvent::Command(UserCommand::StartRecording)).unwrap();
        tx.send(SessionEvent::Command(UserCommand::Quit)).unwrap();

        let rx = std::mem::replace(&mut h.rx, event_queue().1);
        h.session.run(rx).await;

        assert_eq!(*h.mic.acquired.lock().unwrap(), 1);
        assert_eq!(*h.mic.released.lock().unwrap(), 1);
        assert!(status.has_changed().unwrap());
        assert_eq!(status.borrow_and_update().state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_run_keeps_going_without_outside_senders() {
        let mut h = Harness::new();
        // Only the session's own senders remain on this queue
        let rx = std::mem::replace(&mut h.rx, event_queue().1);

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), h.session.run(rx)).await;
        assert!(waited.is_err(), "only Quit ends the run loop");
        assert_eq!(h.session.state(), &SessionState::Connecting);
    }
}
