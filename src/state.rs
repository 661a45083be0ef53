//! # Application State
//!
//! Shared, read-mostly state of one client run: the configuration, a run id
//! for log correlation, and counters describing what the session did.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: The session, the status printer and `main` all hold a handle
//! - **RwLock**: The session is the only writer; readers take a snapshot
//! - **Poisoning**: A poisoned lock only means a panicking writer; counters
//!   are still meaningful, so we recover the guard instead of panicking

use crate::config::AppConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Instant;
use uuid::Uuid;

/// State shared between the session and the front end.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Configuration the run was started with
    pub config: Arc<AppConfig>,

    /// Counters updated by the session as events are handled
    pub metrics: Arc<RwLock<SessionMetrics>>,

    /// Identifies this run in logs
    pub run_id: Uuid,

    /// Wall-clock start, for the exit summary
    pub started_at: DateTime<Utc>,

    /// Monotonic start, for uptime
    pub start_time: Instant,
}

/// What happened during the run.
///
/// ## Counters:
/// - **frames_sent / frames_dropped**: Microphone frames forwarded upstream,
///   and frames discarded because recording had stopped or the send failed
/// - **chunks_scheduled**: Reply chunks handed to the playback scheduler
/// - **decode_errors**: Reply payloads that could not be decoded
/// - **interruptions**: Barge-in signals that cut playback
/// - **connections / resets**: Channel opens attempted and user resets
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub reply_seconds: f64,
    pub decode_errors: u64,
    pub interruptions: u64,
    pub units_interrupted: u64,
    pub connections: u64,
    pub resets: u64,
    pub errors: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(SessionMetrics::default())),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, SessionMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_frame_sent(&self) {
        self.metrics_mut().frames_sent += 1;
    }

    pub fn record_frame_dropped(&self) {
        self.metrics_mut().frames_dropped += 1;
    }

    /// A reply chunk of `duration` seconds was scheduled.
    pub fn record_chunk_scheduled(&self, duration: f64) {
        let mut metrics = self.metrics_mut();
        metrics.chunks_scheduled += 1;
        metrics.reply_seconds += duration;
    }

    pub fn record_decode_error(&self) {
        self.metrics_mut().decode_errors += 1;
    }

    /// A barge-in stopped `units` playing units.
    pub fn record_interruption(&self, units: usize) {
        let mut metrics = self.metrics_mut();
        metrics.interruptions += 1;
        metrics.units_interrupted += units as u64;
    }

    pub fn record_connection(&self) {
        self.metrics_mut().connections += 1;
    }

    pub fn record_reset(&self) {
        self.metrics_mut().resets += 1;
    }

    pub fn record_error(&self) {
        self.metrics_mut().errors += 1;
    }

    /// Copy of the counters, so callers never hold the lock.
    pub fn metrics_snapshot(&self) -> SessionMetrics {
        self.metrics
            .read()
            .map(|metrics| metrics.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl SessionMetrics {
    /// Share of microphone frames that never went upstream (0.0 to 1.0).
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_sent + self.frames_dropped;
        if total > 0 {
            self.frames_dropped as f64 / total as f64
        } else {
            0.0
        }
    }
}
