//! # Playback Output
//!
//! The playback sink of the audio graph: a sample-accurate mixer driven by the
//! default output device through `cpal`.
//!
//! ## Clock:
//! The output clock is the number of frames the device has pulled so far,
//! divided by the device rate. Units are placed on that clock in seconds and
//! converted to a start frame, so scheduling is exact no matter when the
//! device callback happens to run.
//!
//! ## Threading:
//! `cpal::Stream` is `!Send` on some platforms, so the stream lives on a
//! dedicated thread for its whole life. Everything else talks to the shared
//! [`Mixer`] behind a mutex, which the device callback locks once per buffer.

use crate::audio::codec::DecodedAudioBuffer;
use crate::audio::scheduler::{CompletionHook, PlaybackSink, UnitId};
use crate::audio::tap::SignalTap;
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info};

/// Slack, in device frames, for clock times that land on a frame boundary
/// but carry rounding error from summed durations.
const FRAME_EPSILON: f64 = 1e-6;

/// One unit being played (or waiting for its start frame).
///
/// A unit occupies the device frames `[start_frame, end_frame)`. Both ends are
/// the first whole frame at or after the exact clock position, so a unit that
/// starts where the previous one ends takes over on the very next frame.
struct Voice {
    id: UnitId,
    buffer: Arc<DecodedAudioBuffer>,
    /// Exact (fractional) device frame where source frame 0 sits
    origin: f64,
    start_frame: u64,
    end_frame: u64,
    /// Source frames advanced per device frame
    step: f64,
    on_ended: Option<CompletionHook>,
}

impl Voice {
    fn plays(&self, frame: u64) -> bool {
        frame >= self.start_frame && frame < self.end_frame
    }

    /// Linearly interpolated sample of `channel` at device frame `frame`.
    fn sample(&self, channel: usize, frame: u64) -> f32 {
        let channel = channel.min(self.buffer.channel_count().saturating_sub(1));
        let Some(data) = self.buffer.channel(channel) else {
            return 0.0;
        };
        let position = ((frame as f64 - self.origin) * self.step).max(0.0);
        let index = position.floor() as usize;
        let frac = (position - index as f64) as f32;
        let a = data.get(index).copied().unwrap_or(0.0);
        let b = data.get(index + 1).copied().unwrap_or(a);
        a + (b - a) * frac
    }
}

/// Sums every scheduled unit into the device buffer.
pub struct Mixer {
    sample_rate: u32,
    channels: u16,
    frames_rendered: u64,
    voices: Vec<Voice>,
    tap: SignalTap,
    mono: Vec<f32>,
}

impl Mixer {
    /// Create a mixer for a device running at `sample_rate` with `channels`
    /// interleaved output channels. The mixed signal is copied into `tap`.
    pub fn new(sample_rate: u32, channels: u16, tap: SignalTap) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            frames_rendered: 0,
            voices: Vec::new(),
            tap,
            mono: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Output clock in seconds.
    pub fn now(&self) -> f64 {
        self.frames_rendered as f64 / f64::from(self.sample_rate)
    }

    /// Place `buffer` on the timeline at clock time `at`.
    pub fn add(&mut self, id: UnitId, buffer: Arc<DecodedAudioBuffer>, at: f64, on_ended: CompletionHook) {
        let rate = f64::from(self.sample_rate);
        // A start already in the past plays from the next frame, late but whole
        let origin = (at * rate).max(self.frames_rendered as f64);
        let length = buffer.frames() as f64 * rate / f64::from(buffer.sample_rate());
        let start_frame = (origin - FRAME_EPSILON).ceil().max(0.0) as u64;
        let end_frame = (origin + length - FRAME_EPSILON).ceil().max(0.0) as u64;
        let step = f64::from(buffer.sample_rate()) / rate;
        self.voices.push(Voice {
            id,
            buffer,
            origin,
            start_frame,
            end_frame,
            step,
            on_ended: Some(on_ended),
        });
    }

    /// Drop a unit without firing its hook.
    pub fn remove(&mut self, id: UnitId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|voice| voice.id != id);
        self.voices.len() != before
    }

    /// Fill an interleaved device buffer and advance the clock.
    ///
    /// Units whose last sample was rendered are removed and their completion
    /// hooks run after the buffer is filled.
    pub fn render(&mut self, out: &mut [f32]) {
        let channels = usize::from(self.channels);
        let frames = out.len() / channels;
        out.fill(0.0);
        self.mono.clear();
        self.mono.resize(frames, 0.0);

        for voice in &mut self.voices {
            for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
                let absolute = self.frames_rendered + i as u64;
                if !voice.plays(absolute) {
                    continue;
                }
                let mut mono = 0.0;
                for (ch, slot) in frame.iter_mut().enumerate() {
                    let sample = voice.sample(ch, absolute);
                    *slot += sample;
                    mono += sample;
                }
                self.mono[i] += mono / channels as f32;
            }
        }

        self.frames_rendered += frames as u64;
        self.tap.push_slice(&self.mono);

        let mut ended = Vec::new();
        let rendered = self.frames_rendered;
        self.voices.retain_mut(|voice| {
            if voice.end_frame <= rendered {
                ended.extend(voice.on_ended.take());
                false
            } else {
                true
            }
        });
        for hook in ended {
            hook();
        }
    }
}

/// Shared handle to a [`Mixer`], implementing the scheduler's sink contract.
#[derive(Clone)]
pub struct MixerHandle {
    mixer: Arc<Mutex<Mixer>>,
}

impl MixerHandle {
    pub fn new(mixer: Mixer) -> Self {
        Self {
            mixer: Arc::new(Mutex::new(mixer)),
        }
    }

    /// Render one device buffer; called from the device callback.
    pub fn render(&self, out: &mut [f32]) {
        match self.mixer.lock() {
            Ok(mut mixer) => mixer.render(out),
            Err(_) => out.fill(0.0),
        }
    }
}

impl PlaybackSink for MixerHandle {
    fn now(&self) -> f64 {
        self.mixer.lock().map(|m| m.now()).unwrap_or(0.0)
    }

    fn start(
        &self,
        unit: UnitId,
        buffer: Arc<DecodedAudioBuffer>,
        at: f64,
        on_ended: CompletionHook,
    ) -> AppResult<()> {
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| AppError::Device("mixer lock poisoned".to_string()))?;
        mixer.add(unit, buffer, at, on_ended);
        Ok(())
    }

    fn stop(&self, unit: UnitId) -> bool {
        self.mixer.lock().map(|mut m| m.remove(unit)).unwrap_or(false)
    }
}

/// Default output device running a [`Mixer`].
///
/// Dropping the engine stops the device stream and joins its thread.
pub struct OutputEngine {
    handle: MixerHandle,
    shutdown_tx: mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OutputEngine {
    /// Open the default output device and start pulling audio from the mixer.
    ///
    /// Errors from device setup on the audio thread are sent back through a
    /// one-shot init channel.
    pub fn spawn(tap: SignalTap) -> AppResult<Self> {
        let (init_tx, init_rx) = mpsc::channel::<AppResult<MixerHandle>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("live-voice-output".into())
            .spawn(move || Self::run(tap, init_tx, shutdown_rx))
            .map_err(|e| AppError::Device(format!("failed to spawn output thread: {}", e)))?;

        let handle = init_rx
            .recv()
            .map_err(|_| AppError::Device("output thread exited during setup".to_string()))??;

        Ok(Self {
            handle,
            shutdown_tx,
            thread: Some(thread),
        })
    }

    /// The sink to hand to the scheduler.
    pub fn sink(&self) -> MixerHandle {
        self.handle.clone()
    }

    /// Body of the output thread. Owns the stream until shutdown.
    fn run(
        tap: SignalTap,
        init_tx: mpsc::Sender<AppResult<MixerHandle>>,
        shutdown_rx: mpsc::Receiver<()>,
    ) {
        let stream = match Self::open_stream(tap) {
            Ok((stream, handle)) => {
                if init_tx.send(Ok(handle)).is_err() {
                    return;
                }
                stream
            }
            Err(e) => {
                let _ = init_tx.send(Err(e));
                return;
            }
        };

        // Blocks until shutdown is requested or the engine is dropped
        let _ = shutdown_rx.recv();
        drop(stream);
        debug!("Output thread shutting down");
    }

    fn open_stream(tap: SignalTap) -> AppResult<(cpal::Stream, MixerHandle)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AppError::Device("no audio output device found".to_string()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| AppError::Device(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "Audio output initialized"
        );

        let handle = MixerHandle::new(Mixer::new(config.sample_rate.0, config.channels, tap));
        let err_fn = |err: cpal::StreamError| {
            error!(%err, "Audio output stream error");
        };

        let stream = match sample_format {
            SampleFormat::F32 => {
                let handle = handle.clone();
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| handle.render(data),
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let handle = handle.clone();
                let mut scratch: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        handle.render(&mut scratch);
                        for (out, &s) in data.iter_mut().zip(&scratch) {
                            *out = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(AppError::Device(format!("unsupported sample format: {:?}", other)));
            }
        }
        .map_err(|e| AppError::Device(e.to_string()))?;

        stream.play().map_err(|e| AppError::Device(e.to_string()))?;
        Ok((stream, handle))
    }
}

impl Drop for OutputEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
