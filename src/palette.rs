//! Indexed colour table mapping display values to pixels.

use serde::{Deserialize, Serialize};

/// Number of entries in an indexed palette.
pub const PALETTE_SIZE: usize = 256;

/// Palette index reserved for "no value here" (below range / nothing drawn).
pub const NO_VALUE: u8 = 0;

/// One palette entry, straight RGBA bytes.
pub type Rgba = [u8; 4];

/// Colour map selections. Each is a small set of gradient stops sampled
/// across the value range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ColourMap {
    /// Heat map: black through purple and red up to white.
    #[default]
    Heat,
    /// Wider analyzer gradient ending in yellow.
    Spectrum,
    WhiteOnBlack,
    BlackOnWhite,
    Sunset,
}

impl ColourMap {
    fn stops(self) -> &'static [Rgba] {
        match self {
            ColourMap::Heat => &[
                [0, 0, 0, 255],
                [56, 27, 85, 255],
                [155, 0, 0, 255],
                [255, 188, 90, 255],
                [255, 255, 255, 255],
            ],
            ColourMap::Spectrum => &[
                [0, 0, 0, 255],
                [56, 27, 85, 255],
                [155, 0, 0, 255],
                [231, 124, 0, 255],
                [255, 188, 90, 255],
                [255, 255, 0, 255],
            ],
            ColourMap::WhiteOnBlack => &[[0, 0, 0, 255], [255, 255, 255, 255]],
            ColourMap::BlackOnWhite => &[[255, 255, 255, 255], [0, 0, 0, 255]],
            ColourMap::Sunset => &[
                [15, 0, 50, 255],
                [120, 20, 90, 255],
                [230, 80, 40, 255],
                [255, 200, 80, 255],
            ],
        }
    }

    /// Colour drawn where no value has been composited yet.
    fn background(self) -> Rgba {
        self.stops()[0]
    }
}

/// Samples a gradient at position `t` (0.0 to 1.0) using linear interpolation.
fn sample_gradient(stops: &[Rgba], t: f32) -> Rgba {
    let n = stops.len();
    match n {
        0 => [0, 0, 0, 255],
        1 => stops[0],
        _ => {
            let pos = t.clamp(0.0, 1.0) * (n - 1) as f32;
            let i = (pos as usize).min(n - 2);
            mix(stops[i], stops[i + 1], pos - i as f32)
        }
    }
}

pub(crate) fn mix(a: Rgba, b: Rgba, t: f32) -> Rgba {
    let lerp = |x: u8, y: u8| -> u8 {
        let v = x as f32 + (y as f32 - x as f32) * t;
        v.round().clamp(0.0, 255.0) as u8
    };
    [
        lerp(a[0], b[0]),
        lerp(a[1], b[1]),
        lerp(a[2], b[2]),
        lerp(a[3], b[3]),
    ]
}

/// A 256-entry indexed colour table.
///
/// Entry 0 holds the background colour and never participates in rotation.
/// Entries 1..=255 map monotonically increasing display values; rotating the
/// table permutes those entries circularly so already-drawn indices elsewhere
/// keep their meaning until the next recomposite.
#[derive(Debug, Clone)]
pub struct Palette {
    map: ColourMap,
    entries: [Rgba; PALETTE_SIZE],
    rotation: i32,
}

impl Palette {
    pub fn new(map: ColourMap) -> Self {
        let mut palette = Self {
            map,
            entries: [[0, 0, 0, 255]; PALETTE_SIZE],
            rotation: 0,
        };
        palette.rebuild();
        palette
    }

    pub fn map(&self) -> ColourMap {
        self.map
    }

    pub fn rotation(&self) -> i32 {
        self.rotation
    }

    pub fn colour(&self, index: u8) -> Rgba {
        self.entries[index as usize]
    }

    pub fn entries(&self) -> &[Rgba; PALETTE_SIZE] {
        &self.entries
    }

    /// Rebuilds the table for a new map, keeping the current rotation.
    pub fn set_map(&mut self, map: ColourMap) {
        if map == self.map {
            return;
        }
        self.map = map;
        self.rebuild();
    }

    /// Sets the absolute rotation, permuting only by the difference.
    pub fn set_rotation(&mut self, rotation: i32) {
        let delta = rotation - self.rotation;
        if delta != 0 {
            self.rotate(delta);
        }
    }

    /// Circularly permutes entries 1..=255 by `distance`; entry 0 is fixed.
    pub fn rotate(&mut self, distance: i32) {
        let mut rotated = self.entries;
        for pixel in 1..PALETTE_SIZE as i32 {
            let mut target = pixel + distance;
            while target < 1 {
                target += 255;
            }
            while target > 255 {
                target -= 255;
            }
            rotated[target as usize] = self.entries[pixel as usize];
        }
        self.entries = rotated;
        self.rotation += distance;
    }

    fn rebuild(&mut self) {
        let stops = self.map.stops();
        self.entries[NO_VALUE as usize] = self.map.background();
        for pixel in 1..PALETTE_SIZE {
            let t = (pixel - 1) as f32 / (PALETTE_SIZE - 2) as f32;
            self.entries[pixel] = sample_gradient(stops, t);
        }
        let rotation = self.rotation;
        if rotation != 0 {
            self.rotation = 0;
            self.rotate(rotation);
        }
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::new(ColourMap::default())
    }
}
