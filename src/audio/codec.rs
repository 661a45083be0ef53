//! # PCM Codec
//!
//! Pure conversions between normalized floating-point samples and the wire
//! representation the realtime service speaks: base64-encoded 16-bit
//! little-endian PCM.
//!
//! ## Directions:
//! - **Upstream**: `[f32]` frame → `i16` (×32767, rounded) → LE bytes → base64
//! - **Downstream**: base64 → LE bytes → `i16` → `f32` (÷32768) → de-interleaved channels
//!
//! The asymmetric scale factors follow the service's reference client; a full
//! round trip is accurate to within `(|s| + 0.5) / 32768`.

use crate::error::{AppError, AppResult};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Rate of captured audio sent upstream.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Rate of synthesized reply audio received from the service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// One capture callback's worth of mono samples, nominally in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Wire representation of one [`AudioFrame`].
///
/// Serializes as `{"mimeType": "...", "data": "..."}`, the shape of a media
/// chunk in the realtime input message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedBlob {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

/// Multi-channel reply audio at a fixed sample rate.
///
/// ## Layout:
/// One `Vec<f32>` per channel, all of equal length (planar, not interleaved),
/// which is what the mixer reads from.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl DecodedAudioBuffer {
    /// Build a buffer from planar channel data.
    ///
    /// Returns a `Decode` error if there are no channels, the rate is zero, or
    /// the channels differ in length.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> AppResult<Self> {
        if sample_rate == 0 {
            return Err(AppError::Decode("sample rate must be greater than 0".to_string()));
        }
        let Some(first) = channels.first() else {
            return Err(AppError::Decode("buffer needs at least one channel".to_string()));
        };
        let frames = first.len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(AppError::Decode("channels differ in length".to_string()));
        }
        Ok(Self { sample_rate, channels })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

/// MIME tag for raw 16-bit PCM at the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Quantize one normalized sample to 16-bit.
///
/// NaN maps to silence and infinities saturate, so any `f32` input yields a
/// defined value.
fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Encode a captured frame for the upstream channel, tagged with the capture
/// rate (normally [`INPUT_SAMPLE_RATE`]).
pub fn encode_frame(frame: &AudioFrame, sample_rate: u32) -> EncodedBlob {
    encode_samples(frame.samples(), sample_rate)
}

/// Encode arbitrary mono samples, tagged with `sample_rate`.
pub fn encode_samples(samples: &[f32], sample_rate: u32) -> EncodedBlob {
    let pcm: Vec<i16> = samples.iter().map(|&s| quantize(s)).collect();
    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);

    EncodedBlob {
        mime_type: pcm_mime_type(sample_rate),
        data: BASE64_STANDARD.encode(&bytes),
    }
}

/// Decode the base64 `data` field of an inbound payload into raw bytes.
pub fn decode_base64(data: &str) -> AppResult<Vec<u8>> {
    Ok(BASE64_STANDARD.decode(data.trim())?)
}

/// Read little-endian 16-bit samples from `raw`.
///
/// An odd byte count is malformed input; nothing is allocated in that case.
pub fn decode_bytes(raw: &[u8]) -> AppResult<Vec<i16>> {
    if raw.len() % 2 != 0 {
        return Err(AppError::Decode(format!(
            "16-bit PCM needs an even byte count, got {}",
            raw.len()
        )));
    }

    let mut samples = Vec::with_capacity(raw.len() / 2);
    let mut cursor = Cursor::new(raw);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Turn an interleaved 16-bit stream into a playable buffer.
///
/// ## Steps:
/// 1. Check `raw` holds a whole number of frames (`channel_count * 2` bytes each)
/// 2. Scale each sample to float by `s / 32768`
/// 3. De-interleave into one vector per channel
pub fn decode_audio_data(
    raw: &[u8],
    sample_rate: u32,
    channel_count: u16,
) -> AppResult<DecodedAudioBuffer> {
    if channel_count == 0 {
        return Err(AppError::Decode("channel count must be greater than 0".to_string()));
    }
    let channels = usize::from(channel_count);
    let frame_bytes = channels * 2;
    if raw.len() % frame_bytes != 0 {
        return Err(AppError::Decode(format!(
            "{} bytes is not a whole number of {}-channel frames",
            raw.len(),
            channels
        )));
    }

    let samples = decode_bytes(raw)?;
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (channel, &sample) in planar.iter_mut().zip(frame) {
            channel.push(f32::from(sample) / 32768.0);
        }
    }

    DecodedAudioBuffer::new(sample_rate, planar)
}
