//! # Spectral Analyser
//!
//! Frequency-domain magnitudes of one tapped node, refreshed once per visual
//! frame. The output matches the byte spectrum a browser `AnalyserNode`
//! produces, so bar heights look the same as in the web client:
//!
//! 1. Take the latest `fft_size` samples from the tap
//! 2. Apply a Blackman window
//! 3. FFT, keep the first `fft_size / 2` bins, scale magnitudes by `1 / fft_size`
//! 4. Smooth over time: `m = τ·m_prev + (1 - τ)·|X|` with τ = 0.8
//! 5. Convert to dB and map [-100 dB, -30 dB] onto [0, 255]

use crate::audio::tap::SignalTap;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::debug;

/// Default transform size (256 samples → 128 frequency bins).
pub const DEFAULT_FFT_SIZE: usize = 256;

/// Time smoothing applied between consecutive updates.
pub const DEFAULT_SMOOTHING: f32 = 0.8;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Analyser bound to exactly one [`SignalTap`].
///
/// ## Memory:
/// All working buffers, including the snapshot returned by [`data`](Self::data),
/// are allocated once at construction and reused by every [`update`](Self::update).
pub struct SpectralAnalyser {
    tap: SignalTap,
    fft_size: usize,
    smoothing: f32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    time_domain: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    data: Vec<u8>,
}

impl SpectralAnalyser {
    /// Tap `node` with the default 256-point transform.
    pub fn new(node: SignalTap) -> Self {
        Self::with_fft_size(node, DEFAULT_FFT_SIZE)
    }

    /// Tap `node` with a custom transform size (a power of two, validated by config).
    pub fn with_fft_size(node: SignalTap, fft_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        // Blackman window, the same one the browser analyser uses
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / fft_size as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        let bins = fft_size / 2;
        debug!(node = node.label(), fft_size, bins, "Analyser attached");
        Self {
            tap: node,
            fft_size,
            smoothing: DEFAULT_SMOOTHING,
            fft,
            window,
            time_domain: vec![0.0; fft_size],
            spectrum: vec![Complex::new(0.0, 0.0); fft_size],
            scratch,
            smoothed: vec![0.0; bins],
            data: vec![0; bins],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of bins in the snapshot (`fft_size / 2`).
    pub fn frequency_bin_count(&self) -> usize {
        self.data.len()
    }

    /// Latest snapshot. Call [`update`](Self::update) first on every frame.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mean bin magnitude in [0, 1], a cheap loudness proxy for renderers.
    pub fn level(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u32 = self.data.iter().map(|&b| u32::from(b)).sum();
        sum as f32 / (self.data.len() as f32 * 255.0)
    }

    /// Refresh the snapshot in place from the node's current signal.
    pub fn update(&mut self) {
        self.tap.copy_latest(&mut self.time_domain);

        for ((slot, &sample), &w) in self
            .spectrum
            .iter_mut()
            .zip(&self.time_domain)
            .zip(&self.window)
        {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process_with_scratch(&mut self.spectrum, &mut self.scratch);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for ((smoothed, byte), bin) in self
            .smoothed
            .iter_mut()
            .zip(self.data.iter_mut())
            .zip(&self.spectrum)
        {
            let magnitude = bin.norm() * scale;
            let mut value = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            if !value.is_finite() {
                value = 0.0;
            }
            *smoothed = value;

            let db = if value > 0.0 { 20.0 * value.log10() } else { f32::NEG_INFINITY };
            let scaled = (255.0 / range) * (db - MIN_DECIBELS);
            *byte = scaled.clamp(0.0, 255.0) as u8;
        }
    }
}
