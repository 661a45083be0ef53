//! # Capture Pipeline
//!
//! Microphone → fixed-size frames → PCM codec → outbound channel.
//!
//! ## Flow:
//! 1. [`CapturePipeline::start`] acquires the microphone and hands it a
//!    [`FrameSink`] stamped with a fresh generation number
//! 2. The microphone thread pushes 16 kHz mono samples into the sink, which
//!    feeds the input tap and cuts them into frames of `frame_size` samples
//! 3. Each complete frame is queued on the session's event queue
//! 4. The session calls [`CapturePipeline::forward`], which encodes the frame
//!    and sends it upstream only if it belongs to the current recording
//!
//! The generation check is what makes [`CapturePipeline::stop`] final: frames
//! still sitting in the queue from an earlier recording are dropped.

use crate::audio::codec::{encode_frame, AudioFrame, INPUT_SAMPLE_RATE};
use crate::audio::tap::SignalTap;
use crate::channel::RealtimeChannel;
use crate::error::{AppError, AppResult};
use crate::events::{EventSender, SessionEvent};
use tracing::{debug, info, warn};

/// Splits a continuous sample stream into frames of a fixed length.
#[derive(Debug)]
pub struct Framer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples waiting for the next complete frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Append samples and emit every frame they complete, in order.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        while !samples.is_empty() {
            let room = self.frame_size - self.pending.len();
            let take = room.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_size {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                emit(AudioFrame::new(frame));
            }
        }
    }
}

/// Where a microphone delivers its (already 16 kHz mono) samples.
pub struct FrameSink {
    generation: u64,
    framer: Framer,
    tap: SignalTap,
    events: EventSender,
}

impl FrameSink {
    pub fn new(generation: u64, frame_size: usize, tap: SignalTap, events: EventSender) -> Self {
        Self {
            generation,
            framer: Framer::new(frame_size),
            tap,
            events,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Called from the capture thread for every block the device produces.
    pub fn push(&mut self, samples: &[f32]) {
        self.tap.push_slice(samples);

        let generation = self.generation;
        let events = &self.events;
        self.framer.push(samples, |frame| {
            // A closed queue means the session is gone; nothing left to do
            let _ = events.send(SessionEvent::CapturedFrame { generation, frame });
        });
    }
}

/// Source of microphone audio.
///
/// `acquire` either returns a live stream feeding `sink`, or fails with
/// [`AppError::Permission`] when access is denied or no device exists.
pub trait Microphone: Send {
    fn acquire(&mut self, sink: FrameSink) -> AppResult<Box<dyn MicrophoneStream>>;
}

/// A held microphone. Releasing must be synchronous: once `release` returns,
/// the sink receives nothing more. Releasing twice is a no-op.
pub trait MicrophoneStream: Send {
    fn release(&mut self);
}

/// Owns the microphone handle for one session.
pub struct CapturePipeline {
    microphone: Box<dyn Microphone>,
    stream: Option<Box<dyn MicrophoneStream>>,
    input_tap: SignalTap,
    frame_size: usize,
    sample_rate: u32,
    generation: u64,
}

impl CapturePipeline {
    pub fn new(microphone: Box<dyn Microphone>, input_tap: SignalTap, frame_size: usize) -> Self {
        Self {
            microphone,
            stream: None,
            input_tap,
            frame_size,
            sample_rate: INPUT_SAMPLE_RATE,
            generation: 0,
        }
    }

    /// Rate the microphone delivers and frames are tagged with.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Acquire the microphone and start framing into `events`.
    ///
    /// Starting while already active is a no-op.
    pub fn start(&mut self, events: &EventSender) -> AppResult<()> {
        if self.is_active() {
            return Ok(());
        }

        self.generation += 1;
        let sink = FrameSink::new(
            self.generation,
            self.frame_size,
            self.input_tap.clone(),
            events.clone(),
        );
        let stream = self.microphone.acquire(sink)?;
        self.stream = Some(stream);

        info!(generation = self.generation, frame_size = self.frame_size, "Capture started");
        Ok(())
    }

    /// Release the microphone. Safe to call at any time, any number of times.
    ///
    /// Returns `true` if a held microphone was actually released.
    pub fn stop(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.release();
                self.input_tap.clear();
                info!(generation = self.generation, "Capture stopped");
                true
            }
            None => false,
        }
    }

    /// Whether a frame from `generation` should still go upstream.
    pub fn accepts(&self, generation: u64) -> bool {
        self.is_active() && generation == self.generation
    }

    /// Encode `frame` and send it upstream if it belongs to the current recording.
    ///
    /// ## Returns:
    /// - **Ok(true)**: Frame was sent
    /// - **Ok(false)**: Frame was stale (recording stopped or restarted) and dropped
    /// - **Err(...)**: The channel refused it; capture keeps running
    pub fn forward(
        &self,
        generation: u64,
        frame: &AudioFrame,
        channel: Option<&dyn RealtimeChannel>,
    ) -> AppResult<bool> {
        if !self.accepts(generation) {
            debug!(generation, current = self.generation, "Dropping stale capture frame");
            return Ok(false);
        }

        let channel =
            channel.ok_or_else(|| AppError::Channel("no open channel".to_string()))?;
        let blob = encode_frame(frame, self.sample_rate);
        if let Err(e) = channel.send_realtime_input(blob) {
            warn!(error = %e, "Failed to forward capture frame");
            return Err(e);
        }
        Ok(true)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::codec::EncodedBlob;
    use crate::events::SessionEvent;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// Microphone that records acquisitions and lets tests push samples.
    #[derive(Clone, Default)]
    pub(crate) struct FakeMicrophone {
        pub deny: Arc<Mutex<bool>>,
        pub acquired: Arc<Mutex<usize>>,
        pub released: Arc<Mutex<usize>>,
        pub sink: Arc<Mutex<Option<FrameSink>>>,
    }

    impl FakeMicrophone {
        pub fn speak(&self, samples: &[f32]) {
            if let Some(sink) = self.sink.lock().unwrap().as_mut() {
                sink.push(samples);
            }
        }
    }

    struct FakeStream {
        released: Arc<Mutex<usize>>,
        sink: Arc<Mutex<Option<FrameSink>>>,
        live: bool,
    }

    impl MicrophoneStream for FakeStream {
        fn release(&mut self) {
            if self.live {
                self.live = false;
                *self.released.lock().unwrap() += 1;
                self.sink.lock().unwrap().take();
            }
        }
    }

    impl Microphone for FakeMicrophone {
        fn acquire(&mut self, sink: FrameSink) -> AppResult<Box<dyn MicrophoneStream>> {
            if *self.deny.lock().unwrap() {
                return Err(AppError::Permission("denied by user".to_string()));
            }
            *self.acquired.lock().unwrap() += 1;
            *self.sink.lock().unwrap() = Some(sink);
            Ok(Box::new(FakeStream {
                released: Arc::clone(&self.released),
                sink: Arc::clone(&self.sink),
                live: true,
            }))
        }
    }

    /// Channel that collects what it is sent, or fails on demand.
    #[derive(Default)]
    pub(crate) struct CollectingChannel {
        pub sent: Mutex<Vec<EncodedBlob>>,
        pub closed: Mutex<bool>,
        pub fail: Mutex<bool>,
    }

    impl RealtimeChannel for CollectingChannel {
        fn send_realtime_input(&self, blob: EncodedBlob) -> AppResult<()> {
            if *self.fail.lock().unwrap() {
                return Err(AppError::Channel("channel is closed".to_string()));
            }
            self.sent.lock().unwrap().push(blob);
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn drain_frames(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<(u64, AudioFrame)> {
        let mut frames = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::CapturedFrame { generation, frame } = event {
                frames.push((generation, frame));
            }
        }
        frames
    }

    #[test]
    fn test_framer_emits_whole_frames_in_order() {
        let mut framer = Framer::new(256);
        let samples: Vec<f32> = (0..600).map(|i| i as f32).collect();
        let mut frames = Vec::new();
        framer.push(&samples, |f| frames.push(f));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples()[0], 0.0);
        assert_eq!(frames[1].samples()[0], 256.0);
        assert_eq!(framer.pending(), 88);

        // The remainder completes with the next block
        framer.push(&samples[..168], |f| frames.push(f));
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].samples()[0], 512.0);
        assert_eq!(frames[2].samples()[88], 0.0);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_frames_reach_the_event_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mic = FakeMicrophone::default();
        let tap = SignalTap::new("input", 256);
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), tap.clone(), 256);

        capture.start(&tx).unwrap();
        mic.speak(&[0.0; 512]);

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|(generation, f)| *generation == 1 && f.len() == 256));
        assert_eq!(tap.len(), 256);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mic = FakeMicrophone::default();
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), SignalTap::new("input", 8), 256);

        capture.start(&tx).unwrap();
        assert!(capture.stop());
        assert!(!capture.stop());
        assert!(!capture.is_active());
        assert_eq!(*mic.released.lock().unwrap(), 1);
    }

    #[test]
    fn test_denied_microphone_leaves_pipeline_stopped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mic = FakeMicrophone::default();
        *mic.deny.lock().unwrap() = true;
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), SignalTap::new("input", 8), 256);

        let err = capture.start(&tx).unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));
        assert!(!capture.is_active());
        assert!(!capture.stop());
    }

    #[test]
    fn test_repeated_cycles_do_not_leak_streams() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mic = FakeMicrophone::default();
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), SignalTap::new("input", 8), 256);

        for _ in 0..3 {
            capture.start(&tx).unwrap();
            // A second start while active must not acquire again
            capture.start(&tx).unwrap();
            capture.stop();
        }
        assert_eq!(*mic.acquired.lock().unwrap(), 3);
        assert_eq!(*mic.released.lock().unwrap(), 3);
        assert_eq!(capture.generation(), 3);
    }

    #[test]
    fn test_forward_drops_frames_from_old_recordings() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mic = FakeMicrophone::default();
        let channel = CollectingChannel::default();
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), SignalTap::new("input", 8), 4);

        capture.start(&tx).unwrap();
        mic.speak(&[0.5; 4]);
        let queued = drain_frames(&mut rx);
        capture.stop();

        // Frame was queued before stop, handled after: must not go out
        let (generation, frame) = &queued[0];
        assert!(!capture.forward(*generation, frame, Some(&channel)).unwrap());

        capture.start(&tx).unwrap();
        assert!(!capture.forward(*generation, frame, Some(&channel)).unwrap());
        assert!(capture.forward(capture.generation(), frame, Some(&channel)).unwrap());
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_forward_failure_keeps_capture_running() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mic = FakeMicrophone::default();
        let channel = CollectingChannel::default();
        *channel.fail.lock().unwrap() = true;
        let mut capture = CapturePipeline::new(Box::new(mic), SignalTap::new("input", 8), 4);

        capture.start(&tx).unwrap();
        let frame = AudioFrame::new(vec![0.0; 4]);
        assert!(capture.forward(1, &frame, Some(&channel)).is_err());
        assert!(capture.is_active());
    }
}
