//! Live spectrum analysis of the playback signal.
//!
//! Behaves like a browser `AnalyserNode`: the most recent `fft_size`
//! samples are Blackman-windowed, transformed, smoothed over time and
//! mapped from a decibel range onto bytes. Lip-sync reads the byte
//! spectrum once per animation frame.

use crate::config::AnalyserConfig;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};

pub struct SpectrumAnalyser {
    fft_size: usize,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    state: Mutex<AnalyserState>,
}

struct AnalyserState {
    /// Circular buffer of the latest time-domain samples.
    ring: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyser {
    /// Create an analyser. `fft_size` is rounded up to a power of two
    /// (minimum 32).
    #[must_use]
    pub fn new(config: &AnalyserConfig) -> Self {
        let fft_size = config.fft_size.max(32).next_power_of_two();
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let window = blackman_window(fft_size);

        Self {
            fft_size,
            smoothing: config.smoothing.clamp(0.0, 0.999),
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels.max(config.min_decibels + 1.0),
            window,
            fft,
            state: Mutex::new(AnalyserState {
                ring: vec![0.0; fft_size],
                write_pos: 0,
                smoothed: vec![0.0; fft_size / 2],
                scratch: vec![Complex::new(0.0, 0.0); fft_size],
            }),
        }
    }

    #[must_use]
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of bins written by [`byte_frequency_data`](Self::byte_frequency_data).
    #[must_use]
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Feed samples that are being played right now.
    pub fn push_samples(&self, samples: &[f32]) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        let len = state.ring.len();
        for &sample in samples {
            let pos = state.write_pos;
            state.ring[pos] = sample;
            state.write_pos = (pos + 1) % len;
        }
    }

    /// Clear the sample history and smoothing memory.
    pub fn reset(&self) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        state.ring.fill(0.0);
        state.smoothed.fill(0.0);
        state.write_pos = 0;
    }

    /// Write the current byte spectrum into `out`.
    ///
    /// Writes at most [`frequency_bin_count`](Self::frequency_bin_count)
    /// values; any remaining entries of `out` are left untouched.
    pub fn byte_frequency_data(&self, out: &mut [u8]) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        let AnalyserState {
            ring,
            write_pos,
            smoothed,
            scratch,
        } = &mut *state;

        // Oldest sample first.
        for (i, slot) in scratch.iter_mut().enumerate() {
            let sample = ring[(*write_pos + i) % self.fft_size];
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(scratch);

        let scale = 1.0 / self.fft_size as f32;
        let range = self.max_decibels - self.min_decibels;
        for (k, value) in smoothed.iter_mut().enumerate() {
            let magnitude = scratch[k].norm() * scale;
            *value = self.smoothing * *value + (1.0 - self.smoothing) * magnitude;
            if let Some(byte) = out.get_mut(k) {
                let db = if *value > 0.0 {
                    20.0 * value.log10()
                } else {
                    f32::NEG_INFINITY
                };
                let scaled = 255.0 / range * (db - self.min_decibels);
                *byte = scaled.clamp(0.0, 255.0) as u8;
            }
        }
    }
}

fn blackman_window(n: usize) -> Vec<f32> {
    const ALPHA: f32 = 0.16;
    let a0 = (1.0 - ALPHA) / 2.0;
    let a1 = 0.5;
    let a2 = ALPHA / 2.0;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}
