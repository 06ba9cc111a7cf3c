//! Short-time Fourier transform source with incremental column fill.

use std::sync::Arc;

use anyhow::{Result, ensure};
use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex32;
use tracing::warn;

use super::{FieldSampler, PeakMode, SampleKind, Signal, TransformDesc, TransformSource};
use crate::util::audio::{apply_window, bin_frequency};

// How far a Major peak must rise above the column mean.
const MAJOR_PEAK_RATIO: f32 = 2.0;

struct Column {
    magnitudes: Box<[f32]>,
    phases: Box<[f32]>,
    max_magnitude: f32,
}

/// Windowed FFT columns over a [`Signal`], one every `window_increment`
/// frames, each centred on its frame. Columns are computed on demand via
/// [`TransformSource::advance`] or [`TransformSource::ensure_column`].
pub struct StftSource {
    signal: Signal,
    desc: TransformDesc,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    output: Vec<Complex32>,
    scratch: Vec<Complex32>,
    columns: Vec<Option<Column>>,
    /// Columns below this index are all computed.
    filled: usize,
}

impl std::fmt::Debug for StftSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StftSource")
            .field("desc", &self.desc)
            .field("filled", &self.filled)
            .finish_non_exhaustive()
    }
}

impl StftSource {
    pub fn new(signal: Signal, desc: TransformDesc) -> Result<Self> {
        ensure!(signal.is_ok(), "signal has no channels or no sample rate");
        ensure!(
            desc.window_size >= 2 && desc.window_size.is_power_of_two(),
            "window size {} is not a power of two",
            desc.window_size
        );
        ensure!(desc.window_increment >= 1, "window increment must be positive");

        let fft_size = desc.fft_size();
        let fft = RealFftPlanner::new().plan_fft_forward(fft_size);
        let column_count = if signal.frames() == 0 {
            0
        } else {
            signal.frames() / desc.window_increment + 1
        };

        Ok(Self {
            window: desc.window_kind.coefficients(desc.window_size),
            input: vec![0.0; fft_size],
            output: vec![Complex32::default(); fft_size / 2 + 1],
            scratch: vec![Complex32::default(); fft.get_scratch_len()],
            columns: (0..column_count).map(|_| None).collect(),
            filled: 0,
            signal,
            desc,
            fft,
        })
    }

    fn sample_frame(&self, frame: i64) -> f32 {
        if frame < 0 || frame as usize >= self.signal.frames() {
            return 0.0;
        }
        let channels = self.signal.channels;
        let base = frame as usize * channels;
        if self.desc.channel < channels {
            self.signal.samples[base + self.desc.channel]
        } else {
            // Out-of-range channel selects a mixdown of all channels.
            let frame = &self.signal.samples[base..base + channels];
            frame.iter().sum::<f32>() / channels as f32
        }
    }

    fn compute_column(&mut self, column: usize) {
        let window_size = self.desc.window_size;
        let centre = (column * self.desc.window_increment) as i64;
        let start = centre - (window_size / 2) as i64;

        for offset in 0..window_size {
            self.input[offset] = self.sample_frame(start + offset as i64);
        }
        apply_window(&mut self.input[..window_size], &self.window);
        self.input[window_size..].fill(0.0);
        self.output.fill(Complex32::default());

        if let Err(err) = self
            .fft
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
        {
            warn!("transform failed for column {column}: {err}");
        }

        let bins = self.output.len();
        let mut magnitudes = vec![0.0f32; bins].into_boxed_slice();
        let mut phases = vec![0.0f32; bins].into_boxed_slice();
        let mut max_magnitude = 0.0f32;
        for bin in 0..bins {
            let value = self.output[bin];
            let magnitude = value.norm();
            magnitudes[bin] = magnitude;
            phases[bin] = value.arg();
            max_magnitude = max_magnitude.max(magnitude);
        }

        self.columns[column] = Some(Column {
            magnitudes,
            phases,
            max_magnitude,
        });
    }

    fn column(&self, column: usize) -> Option<&Column> {
        self.columns.get(column).and_then(|c| c.as_ref())
    }
}

impl FieldSampler for StftSource {
    fn width(&self) -> usize {
        self.columns.len()
    }

    fn height(&self) -> usize {
        self.desc.fft_size() / 2 + 1
    }

    fn is_column_available(&self, column: usize) -> bool {
        self.column(column).is_some()
    }

    fn fetch_column(&self, kind: SampleKind, column: usize, bin0: usize, out: &mut [f32]) -> bool {
        let Some(data) = self.column(column) else {
            return false;
        };
        let bins = data.magnitudes.len();
        let count = out.len().min(bins.saturating_sub(bin0));
        match kind {
            SampleKind::Magnitude => {
                out[..count].copy_from_slice(&data.magnitudes[bin0..bin0 + count]);
            }
            SampleKind::NormalizedMagnitude => {
                let scale = if data.max_magnitude > 0.0 {
                    1.0 / data.max_magnitude
                } else {
                    0.0
                };
                for (slot, magnitude) in out[..count]
                    .iter_mut()
                    .zip(&data.magnitudes[bin0..bin0 + count])
                {
                    *slot = magnitude * scale;
                }
            }
            SampleKind::Phase => {
                out[..count].copy_from_slice(&data.phases[bin0..bin0 + count]);
            }
        }
        out[count..].fill(0.0);
        true
    }
}

impl TransformSource for StftSource {
    fn sample_rate(&self) -> f32 {
        self.signal.sample_rate
    }

    fn fft_size(&self) -> usize {
        self.desc.fft_size()
    }

    fn window_increment(&self) -> usize {
        self.desc.window_increment
    }

    fn fill_frames(&self) -> usize {
        if self.filled >= self.columns.len() {
            self.signal.frames()
        } else {
            self.filled * self.desc.window_increment
        }
    }

    fn is_complete(&self) -> bool {
        self.filled >= self.columns.len()
    }

    fn advance(&mut self, max_columns: usize) -> usize {
        let mut computed = 0;
        while computed < max_columns && self.filled < self.columns.len() {
            if self.columns[self.filled].is_none() {
                self.compute_column(self.filled);
                computed += 1;
            }
            self.filled += 1;
        }
        computed
    }

    fn ensure_column(&mut self, column: usize) -> bool {
        if column >= self.columns.len() {
            return false;
        }
        if self.columns[column].is_none() {
            self.compute_column(column);
        }
        true
    }

    fn estimate_stable_frequency(&self, column: usize, bin: usize) -> Option<f32> {
        if column == 0 || bin >= self.height() {
            return None;
        }
        let previous = self.column(column - 1)?;
        let current = self.column(column)?;

        let fft_size = self.desc.fft_size() as f32;
        let increment = self.desc.window_increment as f32;
        let expected = previous.phases[bin]
            + core::f32::consts::TAU * bin as f32 * increment / fft_size;
        let error = princarg(current.phases[bin] - expected);

        let refined = bin as f32 + error * fft_size / (core::f32::consts::TAU * increment);
        Some(refined * self.signal.sample_rate / fft_size)
    }

    fn peak_frequencies(
        &self,
        mode: PeakMode,
        column: usize,
        bin0: usize,
        bin1: usize,
    ) -> Vec<(usize, f32)> {
        let Some(data) = self.column(column) else {
            return Vec::new();
        };
        let bins = data.magnitudes.len();
        if bins < 3 {
            return Vec::new();
        }

        let floor = match mode {
            PeakMode::All => 0.0,
            PeakMode::Major => {
                let mean = data.magnitudes.iter().sum::<f32>() / bins as f32;
                mean * MAJOR_PEAK_RATIO
            }
        };

        let lo = bin0.max(1);
        let hi = bin1.min(bins - 2);
        let mut peaks = Vec::new();
        for bin in lo..=hi {
            let value = data.magnitudes[bin];
            if value <= data.magnitudes[bin - 1] || value < data.magnitudes[bin + 1] {
                continue;
            }
            if mode == PeakMode::Major && value < floor {
                continue;
            }
            let frequency = self
                .estimate_stable_frequency(column, bin)
                .unwrap_or_else(|| {
                    bin_frequency(bin, self.desc.fft_size(), self.signal.sample_rate)
                });
            peaks.push((bin, frequency));
        }
        peaks
    }
}

// Wrap a phase difference into (-pi, pi].
fn princarg(phase: f32) -> f32 {
    use core::f32::consts::{PI, TAU};
    PI - (PI - phase).rem_euclid(TAU)
}
