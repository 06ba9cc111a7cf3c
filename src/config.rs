//! Render parameters and engine tuning constants.

pub mod persistence;

use crate::palette::ColourMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Rectangular,
    #[default]
    Hann,
    Hamming,
    Blackman,
}

impl WindowKind {
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        match self {
            WindowKind::Rectangular => vec![1.0; len],
            WindowKind::Hann => (0..len)
                .map(|n| {
                    let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                    0.5 * (1.0 - phase.cos())
                })
                .collect(),
            WindowKind::Hamming => (0..len)
                .map(|n| {
                    let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                    0.54 - 0.46 * phase.cos()
                })
                .collect(),
            WindowKind::Blackman => {
                let a0 = 0.42;
                let a1 = 0.5;
                let a2 = 0.08;
                (0..len)
                    .map(|n| {
                        let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                        a0 - a1 * phase.cos() + a2 * (2.0 * phase).cos()
                    })
                    .collect()
            }
        }
    }
}

/// How a sampled magnitude (or phase) maps to a palette index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColourScale {
    Linear,
    Meter,
    DbSquared,
    #[default]
    Db,
    Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyScale {
    #[default]
    Linear,
    Log,
}

/// Which bins of each column contribute pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BinDisplay {
    #[default]
    AllBins,
    PeakBins,
    PeakFrequencies,
}

/// Display parameters. Held constant for the duration of one paint call;
/// any change invalidates the image caches and transform-derived caches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderParams {
    pub channel: usize,
    /// Analysis window length in samples (power of two).
    pub window_size: usize,
    pub window_kind: WindowKind,
    /// Hop as a right shift of the window size: level 2 means window / 4.
    pub hop_level: u32,
    /// Base zero-pad level; the effective level also tracks zoom density.
    pub zero_pad_level: usize,
    pub gain: f32,
    pub threshold: f32,
    pub colour_map: ColourMap,
    pub colour_rotation: i32,
    pub colour_scale: ColourScale,
    pub frequency_scale: FrequencyScale,
    pub bin_display: BinDisplay,
    pub normalize_columns: bool,
    pub normalize_visible_area: bool,
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// Smooth the vertical mapping when rows are finer than bins.
    pub interpolate: bool,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            channel: 0,
            window_size: 1024,
            window_kind: WindowKind::Hann,
            hop_level: 2,
            zero_pad_level: 0,
            gain: 1.0,
            threshold: 0.0,
            colour_map: ColourMap::default(),
            colour_rotation: 0,
            colour_scale: ColourScale::default(),
            frequency_scale: FrequencyScale::default(),
            bin_display: BinDisplay::default(),
            normalize_columns: false,
            normalize_visible_area: false,
            min_frequency: 10.0,
            max_frequency: 8000.0,
            interpolate: true,
        }
    }
}

impl RenderParams {
    /// Samples advanced between successive transform columns.
    pub fn window_increment(&self) -> usize {
        (self.window_size >> self.hop_level).max(1)
    }

    /// Transform size from the base zero-pad level alone; density-driven
    /// padding multiplies on top per paint.
    pub fn base_fft_size(&self) -> usize {
        self.window_size * (self.zero_pad_level + 1)
    }
}

/// Empirical tuning knobs for the paint scheduler and derived caches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Paint time below this doubles the next span width.
    pub budget_low: Duration,
    /// Paint time above this halves the next span width.
    pub budget_high: Duration,
    /// Hard floor for the span width in pixels.
    pub span_floor: u32,
    /// Halving stops once the width is at or below this.
    pub span_shrink_floor: u32,
    /// Doubling stops once the width is at or above this.
    pub span_ceiling: u32,
    /// First span covers roughly this many samples.
    pub initial_span_samples: u64,
    /// Column bucket size of the peak cache.
    pub peak_decimation: usize,
    /// Pixels-per-bin density above which 2x zero padding kicks in.
    pub density_two_x: f32,
    /// Pixels-per-bin density above which 4x zero padding kicks in.
    pub density_four_x: f32,
    /// Suggested cadence for fill-extent polling.
    pub poll_interval: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            budget_low: Duration::from_millis(90),
            budget_high: Duration::from_millis(200),
            span_floor: 20,
            span_shrink_floor: 50,
            span_ceiling: 1500,
            initial_span_samples: 300_000,
            peak_decimation: 8,
            density_two_x: 1.5,
            density_four_x: 2.8,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Everything a host persists for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineSettings {
    pub params: RenderParams,
    pub tuning: Tuning,
}
