//! # Error Handling
//!
//! This module defines the client's error taxonomy and how each error is turned
//! into the status text shown to the user.
//!
//! ## Error Categories:
//! - **Permission**: Microphone denied or unavailable
//! - **Channel**: Remote realtime channel failed to open, send or receive
//! - **Decode**: Malformed inbound audio payload
//! - **ConfigLoad**: System-instruction file could not be read (non-fatal)
//! - **Config**: Invalid configuration values
//! - **Device**: Audio output device could not be opened or driven
//!
//! ## Propagation Policy:
//! Errors are caught at the boundary where they occur and converted into a
//! status string with [`AppError::status_message`]. Nothing is allowed to escape
//! in a way that leaves the microphone or a playback unit dangling.

use std::fmt;

/// Custom error types for the client.
///
/// ## Rust Concepts:
/// - **enum**: A type that can be one of several variants
/// - **String**: Each variant holds a human-readable description
/// - **#[derive(Debug)]**: Automatically implements debug printing
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Decode("odd byte count".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Microphone access denied or no input device present
    Permission(String),

    /// Remote conversational channel failure
    Channel(String),

    /// Inbound audio could not be decoded
    Decode(String),

    /// System instructions could not be loaded
    ConfigLoad(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Audio output device problems
    Device(String),
}

impl AppError {
    /// Machine-readable error tag, used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Permission(_) => "permission_error",
            AppError::Channel(_) => "channel_error",
            AppError::Decode(_) => "decode_error",
            AppError::ConfigLoad(_) => "config_load_error",
            AppError::Config(_) => "config_error",
            AppError::Device(_) => "device_error",
        }
    }

    /// Convert the error into the text shown in the status readout.
    ///
    /// ## Why a separate method:
    /// `Display` is for logs and carries the category prefix; the status line
    /// is read by the person talking to the assistant and says what to do.
    pub fn status_message(&self) -> String {
        match self {
            AppError::Permission(msg) => format!("Microphone unavailable: {}", msg),
            AppError::Channel(msg) => format!("Connection problem: {}", msg),
            AppError::Decode(msg) => format!("Skipped unreadable audio: {}", msg),
            AppError::ConfigLoad(msg) => {
                format!("Continuing without custom instructions: {}", msg)
            }
            AppError::Config(msg) => format!("Configuration problem: {}", msg),
            AppError::Device(msg) => format!("Audio output problem: {}", msg),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Permission(msg) => write!(f, "Permission error: {}", msg),
            AppError::Channel(msg) => write!(f, "Channel error: {}", msg),
            AppError::Decode(msg) => write!(f, "Decode error: {}", msg),
            AppError::ConfigLoad(msg) => write!(f, "Config load error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Device(msg) => write!(f, "Audio device error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Configuration loading failures (bad `config.toml`, unparsable env values).
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// JSON failures only happen on the wire, so they are channel errors.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Channel(format!("malformed message: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Channel(err.to_string())
    }
}

/// Inbound audio arrives base64-encoded; a bad alphabet or padding is a
/// malformed payload.
impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::Decode(format!("invalid base64: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Rust Concepts:
/// - **type alias**: Creates a new name for an existing type
/// - **Generic type**: `T` can be any type (Vec<i16>, EncodedBlob, etc.)
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_messages_are_user_facing() {
        let err = AppError::Permission("denied by user".to_string());
        assert_eq!(err.status_message(), "Microphone unavailable: denied by user");
        assert_eq!(err.kind(), "permission_error");

        let err = AppError::ConfigLoad("missing file".to_string());
        assert!(err.status_message().starts_with("Continuing without custom instructions"));
    }

    #[test]
    fn test_base64_error_becomes_decode_error() {
        use base64::Engine;
        let err: AppError = base64::engine::general_purpose::STANDARD
            .decode("***")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "decode_error");
    }

    #[test]
    fn test_json_error_becomes_channel_error() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Channel(_)));
        assert!(err.to_string().starts_with("Channel error: malformed message"));
    }
}
