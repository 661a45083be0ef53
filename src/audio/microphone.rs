//! # Device Microphone
//!
//! cpal-backed [`Microphone`]. The input stream is `!Send`, so it lives on a
//! dedicated thread for as long as the microphone is held:
//!
//! ```text
//! acquire() ──spawn──▶ capture thread: open device, build stream, play
//!     ◀── init result ──┘        │ callback: downmix → resample → FrameSink
//! release() ── shutdown ──▶ drop stream, exit; release() joins
//! ```
//!
//! Whatever the device's native format, the sink only ever sees mono at the
//! capture rate (16 kHz unless configured otherwise).

use crate::audio::capture::{FrameSink, Microphone, MicrophoneStream};
use crate::audio::codec::INPUT_SAMPLE_RATE;
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler as _};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, error, info, warn};

const RESAMPLER_CHUNK: usize = 1024;

/// Streaming conversion of device audio to mono at the capture rate.
///
/// Runs inside the device callback, so every buffer is sized once up front
/// and reused; steady-state blocks do not allocate.
pub struct InputConverter {
    channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    /// Mono input not yet consumed by the resampler
    pending: Vec<f32>,
    resampled: Vec<Vec<f32>>,
    mono: Vec<f32>,
}

impl InputConverter {
    pub fn new(device_rate: u32, channels: u16, target_rate: u32) -> AppResult<Self> {
        let resampler = if device_rate == target_rate {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                device_rate as usize,
                target_rate as usize,
                RESAMPLER_CHUNK,
                2,
                1,
            )
            .map_err(|e| AppError::Device(format!("resampler setup failed: {}", e)))?;
            Some(resampler)
        };

        let resampled = resampler
            .as_ref()
            .map(|r| r.output_buffer_allocate(true))
            .unwrap_or_default();

        Ok(Self {
            channels: usize::from(channels.max(1)),
            resampler,
            pending: Vec::with_capacity(RESAMPLER_CHUNK * 4),
            resampled,
            mono: Vec::with_capacity(RESAMPLER_CHUNK * 4),
        })
    }

    /// Convert one block of interleaved device samples and hand the result to `sink`.
    pub fn process(&mut self, interleaved: &[f32], sink: &mut FrameSink) {
        self.mono.clear();
        self.mono.extend(
            interleaved
                .chunks_exact(self.channels)
                .map(|frame| frame.iter().sum::<f32>() / self.channels as f32),
        );

        let Some(resampler) = self.resampler.as_mut() else {
            sink.push(&self.mono);
            return;
        };

        self.pending.extend_from_slice(&self.mono);
        let mut read = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - read < needed {
                break;
            }
            let block = &self.pending[read..read + needed];
            match resampler.process_into_buffer(&[block], self.resampled.as_mut_slice(), None) {
                Ok((_, written)) => {
                    if let Some(channel) = self.resampled.first() {
                        sink.push(&channel[..written]);
                    }
                }
                Err(e) => warn!(error = %e, "Dropping input block the resampler rejected"),
            }
            read += needed;
        }

        // Shift the leftover to the front once per block
        let leftover = self.pending.len() - read;
        self.pending.copy_within(read.., 0);
        self.pending.truncate(leftover);
    }
}

/// The system's default input device, delivered at `target_rate`.
#[derive(Debug)]
pub struct CpalMicrophone {
    target_rate: u32,
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new(INPUT_SAMPLE_RATE)
    }
}

impl CpalMicrophone {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    fn open_stream(sink: FrameSink, target_rate: u32) -> AppResult<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AppError::Permission("no input device available".to_string()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| AppError::Permission(format!("input device refused: {}", e)))?;

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?sample_format,
            "Opening input device"
        );

        let mut converter = InputConverter::new(config.sample_rate.0, config.channels, target_rate)?;
        let mut sink = sink;
        let err_fn = |err: cpal::StreamError| {
            error!(%err, "Audio input stream error");
        };

        let stream = match sample_format {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    converter.process(data, &mut sink);
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        scratch.clear();
                        scratch.extend(data.iter().map(|&s| f32::from(s) / 32768.0));
                        converter.process(&scratch, &mut sink);
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(AppError::Permission(format!(
                    "unsupported input sample format: {:?}",
                    other
                )))
            }
        }
        .map_err(|e| AppError::Permission(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AppError::Permission(format!("input stream failed to start: {}", e)))?;
        Ok(stream)
    }
}

impl Microphone for CpalMicrophone {
    fn acquire(&mut self, sink: FrameSink) -> AppResult<Box<dyn MicrophoneStream>> {
        let (init_tx, init_rx) = mpsc::channel::<AppResult<()>>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let generation = sink.generation();
        let target_rate = self.target_rate;

        let thread = thread::Builder::new()
            .name("live-voice-capture".to_string())
            .spawn(move || {
                let stream = match Self::open_stream(sink, target_rate) {
                    Ok(stream) => {
                        let _ = init_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                // Held until release() or the handle is dropped
                let _ = release_rx.recv();
                drop(stream);
                debug!(generation, "Capture thread exiting");
            })
            .map_err(|e| AppError::Device(format!("failed to spawn capture thread: {}", e)))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                release_tx: Some(release_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AppError::Permission("capture thread exited during setup".to_string()))
            }
        }
    }
}

/// A live input stream held on its own thread.
struct CpalStream {
    release_tx: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneStream for CpalStream {
    fn release(&mut self) {
        if let Some(tx) = self.release_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.release();
    }
}
