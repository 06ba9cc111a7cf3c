//! Cached bitmap state per viewport, with scroll reuse and partial
//! invalidation.

use crate::compose::IndexedImage;
use crate::palette::{Palette, Rgba, mix};

/// Axis-aligned pixel rectangle. Zero or negative extent means empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub const EMPTY: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn intersect(self, other: Self) -> Self {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x || bottom <= y {
            Self::EMPTY
        } else {
            Self::new(x, y, right - x, bottom - y)
        }
    }

    pub fn union(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Self::new(x, y, right - x, bottom - y)
    }
}

/// Rendered RGBA pixels for one viewport, tagged with the geometry they were
/// painted for. `valid` is the full-height pixel region whose contents are
/// current; everything outside it is stale and must be repainted before use.
pub struct ImageCache {
    pixels: Vec<Rgba>,
    width: usize,
    height: usize,
    valid: PixelRect,
    start_frame: i64,
    zoom: u32,
}

impl ImageCache {
    pub fn new(width: usize, height: usize, start_frame: i64, zoom: u32) -> Self {
        Self {
            pixels: vec![[0; 4]; width * height],
            width,
            height,
            valid: PixelRect::EMPTY,
            start_frame,
            zoom: zoom.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn valid_area(&self) -> PixelRect {
        self.valid
    }

    pub fn start_frame(&self) -> i64 {
        self.start_frame
    }

    pub fn zoom(&self) -> u32 {
        self.zoom
    }

    pub fn size_matches(&self, width: usize, height: usize) -> bool {
        self.width == width && self.height == height
    }

    /// True when cached pixels can be blitted without any adjustment.
    pub fn matches(&self, start_frame: i64, zoom: u32) -> bool {
        self.start_frame == start_frame && self.zoom == zoom
    }

    pub fn invalidate_all(&mut self) {
        self.valid = PixelRect::EMPTY;
    }

    /// Adopts a new origin without touching pixels. Callers shift first when
    /// content is meant to survive.
    pub fn retarget(&mut self, start_frame: i64, zoom: u32) {
        self.start_frame = start_frame;
        self.zoom = zoom.max(1);
    }

    fn x_for_frame(&self, frame: i64) -> i64 {
        let zoom = self.zoom as i64;
        frame.div_euclid(zoom) - self.start_frame.div_euclid(zoom)
    }

    fn frame_for_x(&self, x: i64) -> i64 {
        let zoom = self.zoom as i64;
        (x + self.start_frame.div_euclid(zoom)) * zoom
    }

    /// Moves cached content `dx` pixels to the right (negative moves left)
    /// and clamps the valid area to what survives on screen.
    pub fn shift_by(&mut self, dx: i32) {
        if dx == 0 {
            return;
        }
        let width = self.width;
        if dx.unsigned_abs() as usize >= width {
            self.valid = PixelRect::EMPTY;
            self.pixels.fill([0; 4]);
            return;
        }

        let shift = dx.unsigned_abs() as usize;
        for row in self.pixels.chunks_exact_mut(width) {
            if dx > 0 {
                row.copy_within(0..width - shift, shift);
                row[..shift].fill([0; 4]);
            } else {
                row.copy_within(shift.., 0);
                row[width - shift..].fill([0; 4]);
            }
        }

        if !self.valid.is_empty() {
            let mut moved = self.valid;
            moved.x += dx;
            self.valid = moved.intersect(self.full_rect());
        }
    }

    /// Drops cached pixels covering frames in `[start_frame, end_frame)`,
    /// judged against the geometry the cache was painted with.
    pub fn invalidate_frames(&mut self, start_frame: i64, end_frame: i64) {
        if self.valid.is_empty() {
            return;
        }
        let view_start = self.frame_for_x(0);
        let view_end = self.frame_for_x(self.width as i64);

        if start_frame > view_start {
            if start_frame >= view_end {
                return;
            }
            // Keep only what lies safely left of the changed range.
            let x = self.x_for_frame(start_frame);
            if x > 1 {
                self.valid = self
                    .valid
                    .intersect(PixelRect::new(0, 0, x as i32 - 1, self.height as i32));
            } else {
                self.valid = PixelRect::EMPTY;
            }
        } else {
            if end_frame < view_start {
                return;
            }
            // Keep only what lies safely right of the changed range.
            let x = self.x_for_frame(end_frame);
            if x < self.width as i64 {
                self.valid = self.valid.intersect(PixelRect::new(
                    x as i32 + 1,
                    0,
                    self.width as i32 - (x as i32 + 1),
                    self.height as i32,
                ));
            } else {
                self.valid = PixelRect::EMPTY;
            }
        }
    }

    /// Extends the valid area with a freshly painted full-height span.
    /// A disconnected older region is discarded rather than kept, so the
    /// valid area always stays a single contiguous run.
    pub fn merge_valid_span(&mut self, x0: i32, width: i32) {
        if width <= 0 {
            return;
        }
        let span = PixelRect::new(x0, 0, width, self.height as i32).intersect(self.full_rect());
        if span.is_empty() {
            return;
        }
        if self.valid.is_empty() || self.valid.right() < span.x || span.right() < self.valid.x {
            self.valid = span;
        } else {
            self.valid = self.valid.union(span);
        }
    }

    /// Resolves the first `columns_done` columns of an indexed span through
    /// `palette` and writes them at cache column `x0`.
    pub fn store_indexed(
        &mut self,
        x0: i32,
        src: &IndexedImage,
        columns_done: usize,
        palette: &Palette,
    ) {
        debug_assert_eq!(src.height, self.height);
        let done = columns_done.min(src.width);
        for sx in 0..done {
            let dx = x0 + sx as i32;
            if dx < 0 || dx as usize >= self.width {
                continue;
            }
            for y in 0..self.height {
                let index = src.data[y * src.width + sx];
                self.pixels[y * self.width + dx as usize] = palette.colour(index);
            }
        }
    }

    /// Scales an indexed span horizontally onto cache columns
    /// `[span_x0, span_x0 + span_width)`, cropped to `[crop0, crop1)`.
    /// Only destination pixels whose source columns all lie below
    /// `columns_done` are written. Returns the written x interval.
    #[allow(clippy::too_many_arguments)]
    pub fn store_scaled(
        &mut self,
        span_x0: i32,
        span_width: i32,
        crop0: i32,
        crop1: i32,
        src: &IndexedImage,
        columns_done: usize,
        smooth: bool,
        palette: &Palette,
    ) -> Option<(i32, i32)> {
        debug_assert_eq!(src.height, self.height);
        if span_width <= 0 || src.width == 0 {
            return None;
        }
        let done = columns_done.min(src.width);
        if done == 0 {
            return None;
        }

        let x_begin = crop0.max(span_x0).max(0);
        let x_end = crop1.min(span_x0 + span_width).min(self.width as i32);
        let mut written_end = x_begin;

        'columns: for dx in x_begin..x_end {
            // Map the destination pixel centre back into span columns.
            let u = (dx - span_x0) as f32 + 0.5;
            let pos = (u * src.width as f32 / span_width as f32 - 0.5)
                .clamp(0.0, (src.width - 1) as f32);

            if smooth {
                let base = pos.floor();
                let frac = pos - base;
                let i0 = base as usize;
                let i1 = (i0 + 1).min(src.width - 1);
                if i1 >= done {
                    break 'columns;
                }
                for y in 0..self.height {
                    let a = palette.colour(src.data[y * src.width + i0]);
                    let b = palette.colour(src.data[y * src.width + i1]);
                    self.pixels[y * self.width + dx as usize] = mix(a, b, frac);
                }
            } else {
                let i = pos.round() as usize;
                if i >= done {
                    break 'columns;
                }
                for y in 0..self.height {
                    self.pixels[y * self.width + dx as usize] =
                        palette.colour(src.data[y * src.width + i]);
                }
            }
            written_end = dx + 1;
        }

        (written_end > x_begin).then_some((x_begin, written_end))
    }

    /// Copies `rect` ∩ valid into a caller surface of `dst_width` pixels per
    /// row, at the same coordinates.
    pub fn copy_valid_rect(&self, rect: PixelRect, dst: &mut [Rgba], dst_width: usize) {
        let region = rect.intersect(self.valid).intersect(self.full_rect());
        if region.is_empty() {
            return;
        }
        let x0 = region.x as usize;
        let w = region.width as usize;
        for y in region.y as usize..region.bottom() as usize {
            let src_row = &self.pixels[y * self.width + x0..y * self.width + x0 + w];
            let dst_row = &mut dst[y * dst_width + x0..y * dst_width + x0 + w];
            dst_row.copy_from_slice(src_row);
        }
    }

    fn full_rect(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width as i32, self.height as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::ColourMap;

    fn patterned_cache(width: usize, height: usize) -> ImageCache {
        let mut cache = ImageCache::new(width, height, 0, 1);
        for y in 0..height {
            for x in 0..width {
                cache.pixels[y * width + x] = [x as u8, y as u8, 7, 255];
            }
        }
        cache.merge_valid_span(10, 50);
        cache
    }

    #[test]
    fn exact_match_is_geometry_equality() {
        let cache = ImageCache::new(100, 40, 1024, 4);
        assert!(cache.matches(1024, 4));
        assert!(!cache.matches(1028, 4));
        assert!(!cache.matches(1024, 2));
    }

    #[test]
    fn shift_moves_pixels_and_valid_area() {
        let mut cache = patterned_cache(100, 8);
        cache.shift_by(5);

        assert_eq!(cache.pixels[3 * 100 + 30], [25, 3, 7, 255]);
        assert_eq!(cache.pixels[0], [0, 0, 0, 0]);
        assert_eq!(cache.valid_area(), PixelRect::new(15, 0, 50, 8));
    }

    #[test]
    fn left_shift_clamps_valid_to_screen() {
        let mut cache = patterned_cache(100, 8);
        cache.shift_by(-20);

        assert_eq!(cache.pixels[3 * 100 + 30], [50, 3, 7, 255]);
        assert_eq!(cache.valid_area(), PixelRect::new(0, 0, 40, 8));
    }

    #[test]
    fn oversized_shift_clears_everything() {
        let mut cache = patterned_cache(100, 8);
        cache.shift_by(120);
        assert!(cache.valid_area().is_empty());
        assert!(cache.pixels.iter().all(|p| *p == [0, 0, 0, 0]));
    }

    #[test]
    fn fill_invalidation_keeps_the_left_prefix() {
        let mut cache = ImageCache::new(100, 8, 0, 1);
        cache.merge_valid_span(0, 100);

        cache.invalidate_frames(40, 70);
        assert_eq!(cache.valid_area(), PixelRect::new(0, 0, 39, 8));
    }

    #[test]
    fn prefix_invalidation_keeps_the_right_side() {
        let mut cache = ImageCache::new(100, 8, 0, 1);
        cache.merge_valid_span(0, 100);

        cache.invalidate_frames(-50, 20);
        assert_eq!(cache.valid_area(), PixelRect::new(21, 0, 79, 8));
    }

    #[test]
    fn disjoint_ranges_leave_the_cache_alone() {
        let mut cache = ImageCache::new(100, 8, 0, 1);
        cache.merge_valid_span(0, 100);

        cache.invalidate_frames(200, 300);
        cache.invalidate_frames(-300, -10);
        assert_eq!(cache.valid_area(), PixelRect::new(0, 0, 100, 8));
    }

    #[test]
    fn invalidation_scales_with_cached_zoom() {
        let mut cache = ImageCache::new(100, 8, 1000, 10);
        cache.merge_valid_span(0, 100);

        // Frames 1400.. start at pixel 40 under zoom 10.
        cache.invalidate_frames(1400, 1700);
        assert_eq!(cache.valid_area(), PixelRect::new(0, 0, 39, 8));
    }

    #[test]
    fn whole_range_invalidation_empties_the_cache() {
        let mut cache = ImageCache::new(100, 8, 0, 1);
        cache.merge_valid_span(0, 100);
        cache.invalidate_frames(-10, 500);
        assert!(cache.valid_area().is_empty());
    }

    #[test]
    fn merge_extends_contiguous_spans_and_drops_disconnected_ones() {
        let mut cache = ImageCache::new(100, 8, 0, 1);
        cache.merge_valid_span(10, 20);
        assert_eq!(cache.valid_area(), PixelRect::new(10, 0, 20, 8));

        cache.merge_valid_span(30, 10);
        assert_eq!(cache.valid_area(), PixelRect::new(10, 0, 30, 8));

        cache.merge_valid_span(60, 10);
        assert_eq!(cache.valid_area(), PixelRect::new(60, 0, 10, 8));
    }

    #[test]
    fn store_indexed_respects_completion() {
        let mut cache = ImageCache::new(10, 2, 0, 1);
        let palette = Palette::new(ColourMap::Heat);
        let mut span = IndexedImage::new(4, 2);
        span.data.copy_from_slice(&[200, 201, 202, 203, 204, 205, 206, 207]);

        cache.store_indexed(3, &span, 2, &palette);
        assert_eq!(cache.pixels[3], palette.colour(200));
        assert_eq!(cache.pixels[4], palette.colour(201));
        assert_eq!(cache.pixels[5], [0, 0, 0, 0]);
        assert_eq!(cache.pixels[10 + 3], palette.colour(204));
    }

    #[test]
    fn scaled_store_upsamples_and_crops() {
        let mut cache = ImageCache::new(40, 1, 0, 1);
        let palette = Palette::new(ColourMap::Heat);
        let mut span = IndexedImage::new(4, 1);
        span.data.copy_from_slice(&[10, 80, 160, 240]);

        // Four source columns stretched over 16 pixels, cropped to [2, 14).
        let written = cache
            .store_scaled(0, 16, 2, 14, &span, 4, false, &palette)
            .unwrap();
        assert_eq!(written, (2, 14));
        assert_eq!(cache.pixels[2], palette.colour(10));
        assert_eq!(cache.pixels[5], palette.colour(80));
        assert_eq!(cache.pixels[13], palette.colour(240));
        assert_eq!(cache.pixels[14], [0, 0, 0, 0]);
    }

    #[test]
    fn scaled_store_stops_at_unfinished_columns() {
        let mut cache = ImageCache::new(16, 1, 0, 1);
        let palette = Palette::new(ColourMap::Heat);
        let mut span = IndexedImage::new(4, 1);
        span.data.copy_from_slice(&[10, 80, 160, 240]);

        let written = cache
            .store_scaled(0, 16, 0, 16, &span, 2, false, &palette)
            .unwrap();
        // Pixels 0..8 read source columns 0 and 1 under nearest sampling.
        assert_eq!(written, (0, 8));
        assert_eq!(cache.pixels[6], palette.colour(80));
        assert_eq!(cache.pixels[8], [0, 0, 0, 0]);
    }

    #[test]
    fn smooth_scaling_blends_neighbouring_columns() {
        let mut cache = ImageCache::new(8, 1, 0, 1);
        let palette = Palette::new(ColourMap::WhiteOnBlack);
        let mut span = IndexedImage::new(2, 1);
        span.data.copy_from_slice(&[1, 255]);

        cache.store_scaled(0, 8, 0, 8, &span, 2, true, &palette);
        let dark = cache.pixels[0];
        let light = cache.pixels[7];
        let middle = cache.pixels[4];
        assert!(middle[0] > dark[0]);
        assert!(middle[0] < light[0]);
    }

    #[test]
    fn copy_out_is_limited_to_the_valid_region() {
        let cache = patterned_cache(100, 8);
        let mut out = vec![[9u8; 4]; 100 * 8];
        cache.copy_valid_rect(PixelRect::new(0, 0, 100, 8), &mut out, 100);

        assert_eq!(out[3 * 100 + 5], [9, 9, 9, 9]);
        assert_eq!(out[3 * 100 + 15], [15, 3, 7, 255]);
        assert_eq!(out[3 * 100 + 65], [9, 9, 9, 9]);
    }
}
