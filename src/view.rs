//! Viewport identity and pixel mapping math.

use crate::config::FrequencyScale;

/// Stable identity of a viewport across paint calls. Allocated by the host;
/// the engine keys all per-viewport caches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewportId(pub u64);

/// Frame snap directions for column-boundary alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snap {
    Left,
    Right,
    Nearest,
}

/// One viewport's scroll and geometry for a single paint call.
///
/// `zoom` is samples per pixel. Pixel x = 0 shows the frame range starting
/// at `start_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewState {
    pub id: ViewportId,
    pub start_frame: i64,
    pub zoom: u32,
    pub width: u32,
    pub height: u32,
    /// Pixel the host wants local features highlighted at, usually its
    /// pointer position. Paint answers with the covered cell's extents.
    pub highlight: Option<(i32, i32)>,
}

impl ViewState {
    pub fn new(id: ViewportId, start_frame: i64, zoom: u32, width: u32, height: u32) -> Self {
        Self {
            id,
            start_frame,
            zoom: zoom.max(1),
            width,
            height,
            highlight: None,
        }
    }

    pub fn with_highlight(mut self, x: i32, y: i32) -> Self {
        self.highlight = Some((x, y));
        self
    }

    /// Pixel column showing `frame`, relative to the left edge. The frame
    /// and the view origin are quantized to pixels independently, so two
    /// views whose origins land in the same pixel agree on every frame.
    pub fn x_for_frame(&self, frame: i64) -> i64 {
        let zoom = self.zoom as i64;
        frame.div_euclid(zoom) - self.start_frame.div_euclid(zoom)
    }

    /// First frame shown in pixel column `x`.
    pub fn frame_for_x(&self, x: i64) -> i64 {
        let zoom = self.zoom as i64;
        (x + self.start_frame.div_euclid(zoom)) * zoom
    }

    /// Vertical position of `frequency` within [min_f, max_f], bottom up.
    /// Row 0 is the top of the viewport.
    pub fn y_for_frequency(
        &self,
        frequency: f32,
        min_f: f32,
        max_f: f32,
        scale: FrequencyScale,
    ) -> f32 {
        let h = self.height as f32;
        match scale {
            FrequencyScale::Log => {
                let min_f = if min_f <= 0.0 { 1.0 } else { min_f };
                let (log_min, log_max) = (min_f.log10(), max_f.log10());
                if log_min == log_max {
                    return 0.0;
                }
                h - (h * (frequency.max(min_f).log10() - log_min)) / (log_max - log_min)
            }
            FrequencyScale::Linear => {
                if min_f == max_f {
                    return 0.0;
                }
                h - (h * (frequency - min_f)) / (max_f - min_f)
            }
        }
    }

    /// Inverse of [`Self::y_for_frequency`].
    pub fn frequency_for_y(
        &self,
        y: f32,
        min_f: f32,
        max_f: f32,
        scale: FrequencyScale,
    ) -> f32 {
        let h = self.height as f32;
        if h == 0.0 {
            return min_f;
        }
        let t = (h - y) / h;
        match scale {
            FrequencyScale::Log => {
                let min_f = if min_f <= 0.0 { 1.0 } else { min_f };
                let (log_min, log_max) = (min_f.log10(), max_f.log10());
                10.0f32.powf(log_min + t * (log_max - log_min))
            }
            FrequencyScale::Linear => min_f + t * (max_f - min_f),
        }
    }
}

/// Snaps `frame` to a transform column boundary at `increment` samples.
pub fn snap_to_column_boundary(frame: i64, increment: usize, snap: Snap) -> i64 {
    let increment = increment.max(1) as i64;
    let left = frame.div_euclid(increment) * increment;
    let right = left + increment;
    match snap {
        Snap::Left => left,
        Snap::Right => right,
        Snap::Nearest => {
            if frame - left > right - frame {
                right
            } else {
                left
            }
        }
    }
}
