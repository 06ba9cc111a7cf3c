//! Running (min, max) magnitude bounds used for display normalization.

/// Observed magnitude bounds for a column or a whole view.
///
/// `(0, 0)` doubles as the unset state; magnitudes worth tracking are
/// positive, so the ambiguity is harmless in practice.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MagnitudeRange {
    min: f32,
    max: f32,
}

impl MagnitudeRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounds(min: f32, max: f32) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn is_set(&self) -> bool {
        self.min != 0.0 || self.max != 0.0
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Folds one observation in. Returns true when the bounds moved.
    pub fn sample(&mut self, value: f32) -> bool {
        if !self.is_set() {
            self.min = value;
            self.max = value;
            return true;
        }

        let mut changed = false;
        if value < self.min {
            self.min = value;
            changed = true;
        }
        if value > self.max {
            self.max = value;
            changed = true;
        }
        changed
    }

    /// Merges another range in. Returns true when the bounds moved.
    pub fn merge(&mut self, other: MagnitudeRange) -> bool {
        if !other.is_set() {
            return false;
        }
        if !self.is_set() {
            *self = other;
            return true;
        }

        let mut changed = false;
        if other.min < self.min {
            self.min = other.min;
            changed = true;
        }
        if other.max > self.max {
            self.max = other.max;
            changed = true;
        }
        changed
    }
}
