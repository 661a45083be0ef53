//! # Signal Tap
//!
//! A passthrough node placed on the capture input and on the playback output.
//! Audio flowing past is copied into a bounded ring so spectral analysers can
//! read the most recent window without touching the signal itself.
//!
//! ## Key Features:
//! - **Circular buffer**: Keeps only the latest `capacity` samples
//! - **Unity gain**: Samples are stored exactly as produced
//! - **Thread safety**: Written from audio device threads, read from the draw loop

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared handle to one tap. Cloning gives another handle to the same ring.
///
/// ## Thread Safety:
/// Uses `Arc<Mutex<VecDeque<f32>>>` so the device callback can write while the
/// visualizer reads. Both sides hold the lock only for a copy.
#[derive(Debug, Clone)]
pub struct SignalTap {
    label: &'static str,
    ring: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl SignalTap {
    /// Create a tap that remembers the last `capacity` samples.
    pub fn new(label: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            label,
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy samples into the ring, discarding the oldest once full.
    pub fn push_slice(&self, samples: &[f32]) {
        let Ok(mut ring) = self.ring.lock() else {
            return;
        };

        // Only the tail can survive, so skip what would be evicted anyway
        let keep = samples.len().min(self.capacity);
        let tail = &samples[samples.len() - keep..];

        let overflow = (ring.len() + tail.len()).saturating_sub(self.capacity);
        ring.drain(..overflow);
        ring.extend(tail.iter().copied());
    }

    /// Fill `out` with the most recent samples, oldest first.
    ///
    /// When fewer samples than `out.len()` have been seen, the front of `out`
    /// is zero-filled so the newest sample always lands at the end.
    pub fn copy_latest(&self, out: &mut [f32]) {
        out.fill(0.0);
        let Ok(ring) = self.ring.lock() else {
            return;
        };

        let take = out.len().min(ring.len());
        let start = out.len() - take;
        for (slot, &sample) in out[start..].iter_mut().zip(ring.iter().skip(ring.len() - take)) {
            *slot = sample;
        }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().map(|ring| ring.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything seen so far (used when a stream is torn down).
    pub fn clear(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.clear();
        }
    }
}
