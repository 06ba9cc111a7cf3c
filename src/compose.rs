//! Composites transform columns into an indexed draw buffer.
//!
//! Pixels hold palette indices, 0 meaning "no value". The caller resolves
//! them to colours when storing into a bitmap cache, so palette rotation
//! never forces a recomposite.

use crate::config::{BinDisplay, ColourScale, FrequencyScale};
use crate::magnitude::MagnitudeRange;
use crate::source::{FieldSampler, PeakMode, SampleKind, TransformSource};
use crate::util::audio::meter_deflection;
use crate::view::ViewState;

/// Reusable index-per-pixel render target.
pub struct IndexedImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl IndexedImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    /// Resizes if needed and clears every pixel to "no value".
    pub fn reset(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.data.resize(width * height, 0);
        self.data.fill(0);
    }
}

/// Per-span inputs for a composite pass.
///
/// `binforx[x]` is the transform column drawn at span pixel `x`, before
/// decimation, or -1 to leave the pixel untouched. `binfory[y]` is the
/// fractional bin at span row `y`, counted bottom-up.
pub struct ComposeParams<'a> {
    pub binforx: &'a [i64],
    pub binfory: &'a [f32],
    /// 1 when reading the transform directly, the decimation factor when
    /// reading a peak cache.
    pub divisor: usize,
    pub fft_size: usize,
    pub gain: f32,
    pub threshold: f32,
    pub interpolate: bool,
    pub bin_display: BinDisplay,
    pub colour_scale: ColourScale,
    pub normalize_columns: bool,
    pub normalize_visible_area: bool,
    pub view_range: MagnitudeRange,
    /// When set, missing columns are treated as empty instead of aborting.
    pub synchronous: bool,
}

impl ComposeParams<'_> {
    fn fetch_kind(&self) -> SampleKind {
        if self.colour_scale == ColourScale::Phase {
            SampleKind::Phase
        } else if self.normalize_columns {
            SampleKind::NormalizedMagnitude
        } else {
            SampleKind::Magnitude
        }
    }
}

/// Vertical placement for peak-frequency rendering.
#[derive(Debug, Clone, Copy)]
pub struct FrequencyBand {
    pub min: f32,
    pub max: f32,
    pub scale: FrequencyScale,
}

/// What a composite pass accomplished. Span pixels `[0, columns_done)` hold
/// final data; the rest were abandoned at the first missing column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposeOutcome {
    pub complete: bool,
    pub columns_done: usize,
    pub overall_changed: bool,
}

/// Column compositor with reusable scratch buffers.
#[derive(Default)]
pub struct Compositor {
    values: Vec<f32>,
    peaks: Vec<f32>,
}

impl Compositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders every span pixel whose columns are available, accumulating
    /// pre-gain magnitudes into `column_mags` and `overall` as it goes.
    pub fn render(
        &mut self,
        image: &mut IndexedImage,
        field: &dyn FieldSampler,
        params: &ComposeParams<'_>,
        column_mags: &mut [MagnitudeRange],
        overall: &mut MagnitudeRange,
    ) -> ComposeOutcome {
        let w = image.width;
        let h = image.height;
        debug_assert_eq!(params.binforx.len(), w);
        debug_assert_eq!(params.binfory.len(), h);
        if w == 0 || h == 0 {
            return ComposeOutcome {
                complete: true,
                columns_done: w,
                overall_changed: false,
            };
        }

        let mut minbin = (params.binfory[0] + 0.0001) as i32;
        let mut maxbin = params.binfory[h - 1] as i32;
        if minbin < 0 {
            minbin = 0;
        }
        if maxbin < minbin {
            maxbin = minbin + 1;
        }
        if params.divisor > 1 {
            minbin = 0;
            maxbin = field.height() as i32;
        }

        let kind = params.fetch_kind();
        let divisor = params.divisor.max(1) as i64;
        let field_width = field.width() as i64;

        self.values.resize((maxbin - minbin + 1) as usize, 0.0);
        self.peaks.resize(h, 0.0);
        let mut psx: i64 = -1;
        let mut overall_changed = false;

        for x in 0..w {
            if params.binforx[x] < 0 {
                continue;
            }

            let sx0 = params.binforx[x] / divisor;
            let mut sx1 = sx0;
            if x + 1 < w {
                sx1 = params.binforx[x + 1] / divisor;
            }
            if sx1 <= sx0 {
                sx1 = sx0 + 1;
            }

            self.peaks[..h].fill(0.0);

            for sx in sx0..sx1 {
                if sx < 0 || sx >= field_width {
                    continue;
                }
                let sx = sx as usize;

                if !params.synchronous && !field.is_column_available(sx) {
                    return ComposeOutcome {
                        complete: false,
                        columns_done: x,
                        overall_changed,
                    };
                }

                let mut mag = MagnitudeRange::new();

                if psx != sx as i64 {
                    if !field.fetch_column(kind, sx, minbin as usize, &mut self.values) {
                        self.values.fill(0.0);
                    }
                    psx = sx as i64;
                }

                for y in 0..h {
                    let sy0 = params.binfory[y];
                    let sy1 = if y + 1 < h {
                        params.binfory[y + 1]
                    } else {
                        sy0 + 1.0
                    };

                    if params.interpolate && (sy1 - sy0).abs() < 1.0 {
                        let centre = (sy0 + sy1) / 2.0;
                        let dist = (centre - 0.5) - (centre - 0.5).round_ties_even();
                        let mut bin = centre as i32;
                        let mut other = if dist < 0.0 { bin - 1 } else { bin + 1 };
                        if bin < minbin {
                            bin = minbin;
                        }
                        if bin > maxbin {
                            bin = maxbin;
                        }
                        if other < minbin || other > maxbin {
                            other = bin;
                        }
                        let prop = 1.0 - dist.abs();

                        let mut v0 = self.value_at(bin - minbin);
                        let mut v1 = self.value_at(other - minbin);
                        if params.bin_display == BinDisplay::PeakBins {
                            if bin == minbin
                                || bin == maxbin
                                || v0 < self.value_at(bin - minbin - 1)
                                || v0 < self.value_at(bin - minbin + 1)
                            {
                                v0 = 0.0;
                            }
                            if other == minbin
                                || other == maxbin
                                || v1 < self.value_at(other - minbin - 1)
                                || v1 < self.value_at(other - minbin + 1)
                            {
                                v1 = 0.0;
                            }
                        }
                        if v0 == 0.0 && v1 == 0.0 {
                            continue;
                        }
                        let value = prop * v0 + (1.0 - prop) * v1;
                        self.peaks[y] = shade(value, params, &mut mag);
                    } else {
                        let by0 = (sy0 + 0.0001) as i32;
                        let mut by1 = (sy1 + 0.0001) as i32;
                        if by1 < by0 + 1 {
                            by1 = by0 + 1;
                        }

                        for bin in by0..by1 {
                            if bin < minbin || bin > maxbin {
                                continue;
                            }
                            let value = self.value_at(bin - minbin);
                            if params.bin_display == BinDisplay::PeakBins
                                && (bin == minbin
                                    || bin == maxbin
                                    || value < self.value_at(bin - minbin - 1)
                                    || value < self.value_at(bin - minbin + 1))
                            {
                                continue;
                            }

                            let value = shade(value, params, &mut mag);
                            if value > self.peaks[y] {
                                self.peaks[y] = value;
                            }
                        }
                    }
                }

                if mag.is_set() {
                    merge_column_mag(column_mags, sx, params.divisor, mag);
                    if overall.merge(mag) {
                        overall_changed = true;
                    }
                }
            }

            for y in 0..h {
                let pix = display_value(
                    params.colour_scale,
                    params.normalize_columns,
                    params.normalize_visible_area,
                    params.view_range,
                    self.peaks[y],
                );
                image.data[(h - y - 1) * w + x] = pix;
            }
        }

        ComposeOutcome {
            complete: true,
            columns_done: w,
            overall_changed,
        }
    }

    /// Renders magnitude peaks as single pixels at their phase-refined
    /// frequencies instead of shading whole bins.
    pub fn render_peak_frequencies(
        &mut self,
        image: &mut IndexedImage,
        source: &dyn TransformSource,
        view: &ViewState,
        params: &ComposeParams<'_>,
        minbin: i32,
        maxbin: i32,
        band: FrequencyBand,
        column_mags: &mut [MagnitudeRange],
        overall: &mut MagnitudeRange,
    ) -> ComposeOutcome {
        let w = image.width;
        let h = image.height;
        debug_assert_eq!(params.binforx.len(), w);

        let minbin = minbin.max(0);
        let maxbin = if maxbin < 0 { minbin + 1 } else { maxbin };

        let kind = params.fetch_kind();
        let source_width = source.width() as i64;

        self.values.resize((maxbin - minbin + 1) as usize, 0.0);
        let mut peaks: Vec<(usize, f32)> = Vec::new();
        let mut psx: i64 = -1;
        let mut overall_changed = false;

        for x in 0..w {
            if params.binforx[x] < 0 {
                continue;
            }

            let sx0 = params.binforx[x];
            let mut sx1 = sx0;
            if x + 1 < w {
                sx1 = params.binforx[x + 1];
            }
            if sx1 <= sx0 {
                sx1 = sx0 + 1;
            }

            for sx in sx0..sx1 {
                if sx < 0 || sx >= source_width {
                    continue;
                }
                let sx = sx as usize;

                if !params.synchronous && !source.is_column_available(sx) {
                    return ComposeOutcome {
                        complete: false,
                        columns_done: x,
                        overall_changed,
                    };
                }

                let mut mag = MagnitudeRange::new();

                if psx != sx as i64 {
                    peaks = source.peak_frequencies(
                        PeakMode::All,
                        sx,
                        minbin as usize,
                        (maxbin - 1).max(0) as usize,
                    );
                    if !source.fetch_column(kind, sx, minbin as usize, &mut self.values) {
                        self.values.fill(0.0);
                    }
                    psx = sx as i64;
                }

                for &(bin, frequency) in &peaks {
                    let bin = bin as i32;
                    if bin < minbin {
                        continue;
                    }
                    if bin > maxbin {
                        break;
                    }

                    let value = self.value_at(bin - minbin);
                    let value = shade(value, params, &mut mag);

                    let y = view.y_for_frequency(frequency, band.min, band.max, band.scale);
                    let iy = (y + 0.5) as i32;
                    if iy < 0 || iy >= h as i32 {
                        continue;
                    }

                    let pix = display_value(
                        params.colour_scale,
                        params.normalize_columns,
                        params.normalize_visible_area,
                        params.view_range,
                        value,
                    );
                    image.data[iy as usize * w + x] = pix;
                }

                if mag.is_set() {
                    merge_column_mag(column_mags, sx, 1, mag);
                    if overall.merge(mag) {
                        overall_changed = true;
                    }
                }
            }
        }

        ComposeOutcome {
            complete: true,
            columns_done: w,
            overall_changed,
        }
    }

    fn value_at(&self, index: i32) -> f32 {
        if index < 0 {
            return 0.0;
        }
        self.values.get(index as usize).copied().unwrap_or(0.0)
    }
}

// Normalize, track and apply gain to one raw sample. Phase values pass
// through untouched.
fn shade(mut value: f32, params: &ComposeParams<'_>, mag: &mut MagnitudeRange) -> f32 {
    if params.colour_scale != ColourScale::Phase {
        if !params.normalize_columns {
            value /= params.fft_size as f32 / 2.0;
        }
        mag.sample(value);
        if value < params.threshold {
            return 0.0;
        }
        value *= params.gain;
    }
    value
}

// A decimated column stands in for its whole bucket of transform columns.
fn merge_column_mag(
    column_mags: &mut [MagnitudeRange],
    sx: usize,
    divisor: usize,
    mag: MagnitudeRange,
) {
    if divisor <= 1 {
        if let Some(slot) = column_mags.get_mut(sx) {
            slot.merge(mag);
        }
        return;
    }
    let first = sx * divisor;
    let last = (first + divisor).min(column_mags.len());
    for slot in column_mags.get_mut(first..last).unwrap_or(&mut []) {
        slot.merge(mag);
    }
}

/// Maps one composited value onto a palette index, 1..=255, following the
/// active colour scale. 0 is reserved for "no value".
pub fn display_value(
    scale: ColourScale,
    normalize_columns: bool,
    normalize_visible_area: bool,
    view_range: MagnitudeRange,
    input: f32,
) -> u8 {
    let mut min = 0.0f32;
    let mut max = 1.0f32;

    if normalize_visible_area {
        min = view_range.min();
        max = view_range.max();
    } else if !normalize_columns && scale == ColourScale::Linear {
        max = 0.1;
    }

    let mut thresh = -80.0f32;
    if max == 0.0 {
        max = 1.0;
    }
    if max == min {
        min = max - 0.0001;
    }

    let value: i32 = match scale {
        ColourScale::Linear => ((((input - min) / (max - min)) * 255.0) as i32) + 1,
        ColourScale::Meter => meter_deflection((input - min) / (max - min), 254) as i32 + 1,
        ColourScale::DbSquared => {
            let ratio = ((input - min) * (input - min)) / ((max - min) * (max - min));
            let db = if ratio > 0.0 {
                10.0 * ratio.log10()
            } else {
                thresh
            };
            if min > 0.0 {
                thresh = (10.0 * (min * min).log10()).max(-80.0);
            }
            let norm = ((db - thresh) / -thresh).clamp(0.0, 1.0);
            (norm * 255.0) as i32 + 1
        }
        ColourScale::Db => {
            let ratio = (input - min) / (max - min);
            let db = if ratio > 0.0 {
                10.0 * ratio.log10()
            } else {
                thresh
            };
            if min > 0.0 {
                thresh = (10.0 * min.log10()).max(-80.0);
            }
            let norm = ((db - thresh) / -thresh).clamp(0.0, 1.0);
            (norm * 255.0) as i32 + 1
        }
        ColourScale::Phase => (input * 127.0 / core::f32::consts::PI + 128.0) as i32,
    };

    value.clamp(0, 255) as u8
}
