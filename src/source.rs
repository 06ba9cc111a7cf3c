pub mod peaks;
pub mod stft;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{RenderParams, WindowKind};

/// Immutable audio material a transform reads from.
#[derive(Debug, Clone)]
pub struct Signal {
    pub samples: Arc<[f32]>,
    pub channels: usize,
    pub sample_rate: f32,
}

impl Signal {
    pub fn new(samples: Arc<[f32]>, channels: usize, sample_rate: f32) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    /// A signal with no channels or a nonsensical rate cannot be rendered.
    pub fn is_ok(&self) -> bool {
        self.channels > 0 && self.sample_rate > 0.0
    }
}

/// Which scalar a column fetch yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Magnitude,
    /// Magnitude divided by the largest value in its column.
    NormalizedMagnitude,
    Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakMode {
    /// Every local magnitude maximum.
    All,
    /// Local maxima that stand clear of the column average.
    Major,
}

/// Column-addressed scalar field: `width` columns of `height` bins each.
/// Columns may become available over time; fetches on missing columns fail
/// rather than block.
pub trait FieldSampler {
    fn width(&self) -> usize;
    fn height(&self) -> usize;

    fn is_column_available(&self, column: usize) -> bool;

    /// Copies `out.len()` bins of `column` starting at `bin0` into `out`.
    /// Returns false (leaving `out` untouched) when the column is missing.
    fn fetch_column(&self, kind: SampleKind, column: usize, bin0: usize, out: &mut [f32]) -> bool;

    /// Single-value fetch with coordinates clamped into range. Returns 0.0
    /// for columns that are not available.
    fn sample_at(&self, kind: SampleKind, column: usize, bin: usize) -> f32 {
        if self.width() == 0 || self.height() == 0 {
            return 0.0;
        }
        let column = column.min(self.width() - 1);
        let bin = bin.min(self.height() - 1);
        let mut value = [0.0f32];
        if self.fetch_column(kind, column, bin, &mut value) {
            value[0]
        } else {
            0.0
        }
    }
}

/// A short-time transform over a [`Signal`], filled cooperatively.
pub trait TransformSource: FieldSampler {
    fn sample_rate(&self) -> f32;

    /// Effective transform size after zero padding.
    fn fft_size(&self) -> usize;

    fn window_increment(&self) -> usize;

    /// Number of signal frames covered by filled columns.
    fn fill_frames(&self) -> usize;

    fn is_complete(&self) -> bool;

    /// Fills up to `max_columns` further columns. Returns how many were
    /// actually computed; 0 once the signal is exhausted.
    fn advance(&mut self, max_columns: usize) -> usize;

    /// Computes `column` (and nothing else) if it is missing. Returns false
    /// when the column lies outside the signal.
    fn ensure_column(&mut self, column: usize) -> bool;

    /// Phase-derived frequency estimate for a bin, more precise than the bin
    /// centre when the underlying partial is stable across hops. None for
    /// column 0 and for unavailable data.
    fn estimate_stable_frequency(&self, column: usize, bin: usize) -> Option<f32>;

    /// (bin, frequency) pairs for magnitude peaks of a column, restricted to
    /// `bin0..=bin1`, ordered by bin.
    fn peak_frequencies(
        &self,
        mode: PeakMode,
        column: usize,
        bin0: usize,
        bin1: usize,
    ) -> Vec<(usize, f32)>;
}

/// Everything needed to build a transform for one view.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformDesc {
    pub channel: usize,
    pub window_kind: WindowKind,
    pub window_size: usize,
    pub window_increment: usize,
    pub zero_pad_level: usize,
}

impl TransformDesc {
    pub fn from_params(params: &RenderParams, zero_pad_level: usize) -> Self {
        Self {
            channel: params.channel,
            window_kind: params.window_kind,
            window_size: params.window_size,
            window_increment: params.window_increment(),
            zero_pad_level,
        }
    }

    /// Transform size after zero padding.
    pub fn fft_size(&self) -> usize {
        self.window_size * (self.zero_pad_level + 1)
    }
}

/// Creation seam for transforms, so rendering can be driven by synthetic
/// sources in tests.
pub trait TransformFactory {
    fn create(&mut self, signal: &Signal, desc: &TransformDesc) -> Result<Box<dyn TransformSource>>;
}

/// Default factory producing [`stft::StftSource`] instances.
#[derive(Debug, Default)]
pub struct StftFactory;

impl TransformFactory for StftFactory {
    fn create(&mut self, signal: &Signal, desc: &TransformDesc) -> Result<Box<dyn TransformSource>> {
        Ok(Box::new(stft::StftSource::new(signal.clone(), desc.clone())?))
    }
}
