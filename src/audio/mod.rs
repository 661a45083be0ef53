//! # Audio Module
//!
//! Everything between the sound card and the wire.
//!
//! ## Key Components:
//! - **Codec**: Float ↔ 16-bit PCM conversion and base64 blobs
//! - **Capture**: Microphone handle, framing and upstream forwarding
//! - **Microphone**: cpal input device resampled to 16 kHz mono
//! - **Scheduler**: Gapless playback queue with interruption
//! - **Output**: cpal output device and the mixer that plays scheduled units
//! - **Tap / Analyser**: Passive signal copies and their byte spectra
//!
//! ## Audio Format Requirements:
//! - **Upstream**: 16 kHz, 16-bit little-endian PCM, mono
//! - **Downstream**: 24 kHz, 16-bit little-endian PCM, mono

pub mod analyser;   // Byte spectrum for the visualizer
pub mod capture;    // Framing and forwarding of microphone audio
pub mod codec;      // PCM encoding and decoding
pub mod microphone; // cpal input device
pub mod output;     // cpal output device and mixer
pub mod scheduler;  // Playback timeline
pub mod tap;        // Passthrough sample rings
