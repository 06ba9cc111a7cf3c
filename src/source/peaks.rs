//! Column-decimated peak cache for far-zoomed-out rendering.

use super::{FieldSampler, SampleKind};

struct Bucket {
    magnitudes: Box<[f32]>,
    max_magnitude: f32,
}

/// Per-bin magnitude maxima over groups of `decimation` source columns.
/// Reading one bucket instead of every underlying column keeps rendering
/// affordable when each pixel spans many columns.
///
/// Buckets are built explicitly with [`PeakCache::ensure_buckets`]; a bucket
/// whose underlying columns are not all available stays missing, so fetches
/// on it fail exactly like fetches on an unfilled source column.
pub struct PeakCache {
    decimation: usize,
    source_width: usize,
    height: usize,
    buckets: Vec<Option<Bucket>>,
}

impl PeakCache {
    pub fn new(source: &dyn FieldSampler, decimation: usize) -> Self {
        let decimation = decimation.max(1);
        let width = source.width().div_ceil(decimation);
        Self {
            decimation,
            source_width: source.width(),
            height: source.height(),
            buckets: (0..width).map(|_| None).collect(),
        }
    }

    pub fn decimation(&self) -> usize {
        self.decimation
    }

    /// True when the cache still matches the source's dimensions.
    pub fn covers(&self, source: &dyn FieldSampler) -> bool {
        self.source_width == source.width() && self.height == source.height()
    }

    /// Builds every missing bucket in `bucket0..bucket1` whose underlying
    /// source columns are all available.
    pub fn ensure_buckets(&mut self, source: &dyn FieldSampler, bucket0: usize, bucket1: usize) {
        let hi = bucket1.min(self.buckets.len());
        let mut scratch = vec![0.0f32; self.height];
        for bucket in bucket0.min(hi)..hi {
            if self.buckets[bucket].is_some() {
                continue;
            }
            let col0 = bucket * self.decimation;
            let col1 = (col0 + self.decimation).min(self.source_width);
            if !(col0..col1).all(|col| source.is_column_available(col)) {
                continue;
            }

            let mut magnitudes = vec![0.0f32; self.height].into_boxed_slice();
            for col in col0..col1 {
                if !source.fetch_column(SampleKind::Magnitude, col, 0, &mut scratch) {
                    continue;
                }
                for (slot, value) in magnitudes.iter_mut().zip(&scratch) {
                    *slot = slot.max(*value);
                }
            }
            let max_magnitude = magnitudes.iter().cloned().fold(0.0f32, f32::max);
            self.buckets[bucket] = Some(Bucket {
                magnitudes,
                max_magnitude,
            });
        }
    }

    /// Drops buckets overlapping the source column range `col0..col1`.
    pub fn invalidate_columns(&mut self, col0: usize, col1: usize) {
        if col1 <= col0 {
            return;
        }
        let first = col0 / self.decimation;
        let last = (col1 - 1) / self.decimation;
        for bucket in first..=last.min(self.buckets.len().saturating_sub(1)) {
            self.buckets[bucket] = None;
        }
    }

    pub fn invalidate_all(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = None;
        }
    }
}

impl FieldSampler for PeakCache {
    fn width(&self) -> usize {
        self.buckets.len()
    }

    fn height(&self) -> usize {
        self.height
    }

    fn is_column_available(&self, column: usize) -> bool {
        self.buckets.get(column).is_some_and(|b| b.is_some())
    }

    fn fetch_column(&self, kind: SampleKind, column: usize, bin0: usize, out: &mut [f32]) -> bool {
        let Some(bucket) = self.buckets.get(column).and_then(|b| b.as_ref()) else {
            return false;
        };
        let count = out.len().min(bucket.magnitudes.len().saturating_sub(bin0));
        match kind {
            SampleKind::Magnitude => {
                out[..count].copy_from_slice(&bucket.magnitudes[bin0..bin0 + count]);
            }
            SampleKind::NormalizedMagnitude => {
                let scale = if bucket.max_magnitude > 0.0 {
                    1.0 / bucket.max_magnitude
                } else {
                    0.0
                };
                for (slot, magnitude) in out[..count]
                    .iter_mut()
                    .zip(&bucket.magnitudes[bin0..bin0 + count])
                {
                    *slot = magnitude * scale;
                }
            }
            // Phase has no meaningful decimated form.
            SampleKind::Phase => return false,
        }
        out[count..].fill(0.0);
        true
    }
}
