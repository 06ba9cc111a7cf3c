//! Incremental spectrogram rendering with pixel-level caching.

pub mod cache;
pub mod compose;
pub mod config;
pub mod engine;
pub mod magnitude;
pub mod palette;
pub mod source;
pub mod util;
pub mod view;

pub use cache::PixelRect;
pub use config::{EngineSettings, RenderParams, Tuning};
pub use engine::{CellInfo, FillChange, PaintOutcome, PollOutcome, SpectrogramEngine};
pub use palette::ColourMap;
pub use source::{Signal, StftFactory, TransformFactory, TransformSource};
pub use view::{ViewState, ViewportId};
