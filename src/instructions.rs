//! # System Instructions
//!
//! Optional free text passed verbatim as the session's system instruction.
//! A missing or unreadable file is not fatal: the caller reports it and the
//! session starts without custom instructions.

use crate::error::{AppError, AppResult};
use std::path::Path;
use tracing::info;

/// Read the instruction text at `path`.
///
/// ## Returns:
/// - **Ok(None)**: No path configured, or the file holds only whitespace
/// - **Ok(Some(text))**: The file contents, untouched
/// - **Err(ConfigLoad)**: The file could not be read
pub async fn load_system_instruction(path: &str) -> AppResult<Option<String>> {
    if path.trim().is_empty() {
        return Ok(None);
    }

    let text = tokio::fs::read_to_string(Path::new(path))
        .await
        .map_err(|e| AppError::ConfigLoad(format!("{}: {}", path, e)))?;

    if text.trim().is_empty() {
        return Ok(None);
    }

    info!(path, chars = text.chars().count(), "Loaded system instructions");
    Ok(Some(text))
}
