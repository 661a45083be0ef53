//! # Configuration Management
//!
//! This module handles loading and managing client configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` (special case for the credential)
//! 2. Environment variables (APP_CHANNEL__MODEL, APP_AUDIO__FRAME_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main client configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (channel, audio, visualizer)
/// mirrors the components that consume them; each component only receives
/// its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub channel: ChannelConfig,
    pub audio: AudioConfig,
    pub visualizer: VisualizerConfig,
    pub instructions: InstructionsConfig,
}

/// Remote conversational service settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming endpoint
/// - `api_key`: Credential appended as the `key` query parameter
/// - `model`: Model identifier sent in the session setup
/// - `voice`: Prebuilt voice name used for synthesized replies
/// - `response_modality`: "AUDIO" or "TEXT"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub response_modality: String,
}

/// Audio graph settings.
///
/// ## Fields:
/// - `input_sample_rate`: Rate the capture path delivers to the codec (16 kHz)
/// - `output_sample_rate`: Rate of the reply audio produced by the service (24 kHz)
/// - `output_channels`: Channel count of the reply audio
/// - `frame_size`: Samples per captured frame forwarded upstream
/// - `fft_size`: Transform size of each spectral analyser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub frame_size: usize,
    pub fft_size: usize,
}

/// Visualization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizerConfig {
    /// "off", "log" or "terminal"
    pub mode: String,
    /// Draw loop frequency in frames per second
    pub fps: u32,
    /// Viewport width in character cells
    pub width: u16,
    /// Viewport height in character cells
    pub height: u16,
}

/// Where the system-instruction text lives. An empty path disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionsConfig {
    pub path: String,
}

/// Response modalities the service accepts.
const RESPONSE_MODALITIES: [&str; 2] = ["AUDIO", "TEXT"];

/// Renderers the visualizer knows about.
pub const VISUALIZER_MODES: [&str; 3] = ["off", "log", "terminal"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.5-flash-preview-native-audio-dialog".to_string(),
                voice: "Orus".to_string(),
                response_modality: "AUDIO".to_string(),
            },
            audio: AudioConfig {
                input_sample_rate: INPUT_SAMPLE_RATE,   // What the service expects upstream
                output_sample_rate: OUTPUT_SAMPLE_RATE, // What the service sends back
                output_channels: 1,
                frame_size: 256,
                fft_size: 256,             // 128 frequency bins
            },
            visualizer: VisualizerConfig {
                mode: "off".to_string(),
                fps: 30,
                width: 64,
                height: 32,
            },
            instructions: InstructionsConfig {
                path: "system-instructions.txt".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle the special case of GEMINI_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_CHANNEL__VOICE=Puck`: Override the reply voice
    /// - `APP_VISUALIZER__MODE=terminal`: Draw the visualizer in the terminal
    /// - `GEMINI_API_KEY=...`: Credential, as most tooling for the service names it
    ///
    /// The double underscore separates sections so that field names that
    /// contain a single underscore (`api_key`, `frame_size`) survive intact.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("channel.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Sample rates, channel count and frame size are non-zero
    /// - FFT size is a power of two between 32 and 32768 (the analyser range)
    /// - The draw loop rate is between 1 and 240 fps
    /// - Modality and visualizer mode are known values
    pub fn validate(&self) -> Result<()> {
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.output_channels == 0 {
            return Err(anyhow::anyhow!("Output channel count must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        let fft = self.audio.fft_size;
        if !fft.is_power_of_two() || !(32..=32768).contains(&fft) {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two between 32 and 32768, got {}",
                fft
            ));
        }

        if !(1..=240).contains(&self.visualizer.fps) {
            return Err(anyhow::anyhow!("Visualizer fps must be between 1 and 240"));
        }

        if !RESPONSE_MODALITIES.contains(&self.channel.response_modality.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown response modality '{}'",
                self.channel.response_modality
            ));
        }

        if !VISUALIZER_MODES.contains(&self.visualizer.mode.as_str()) {
            return Err(anyhow::anyhow!("Unknown visualizer mode '{}'", self.visualizer.mode));
        }

        if self.channel.endpoint.is_empty() {
            return Err(anyhow::anyhow!("Channel endpoint cannot be empty"));
        }

        Ok(())
    }

    /// Check that a credential is present. Kept apart from `validate` so that
    /// the defaults stay valid for tests and tooling.
    pub fn require_credentials(&self) -> Result<()> {
        if self.channel.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "No API key configured; set GEMINI_API_KEY or APP_CHANNEL__API_KEY"
            ));
        }
        Ok(())
    }
}
