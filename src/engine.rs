//! Incremental paint driver. Reconciles one image cache per viewport against
//! scroll, zoom, parameter changes, and background transform fill, and
//! recomputes only the pixel strips that cannot be reused.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::{ImageCache, PixelRect};
use crate::compose::{ComposeOutcome, ComposeParams, Compositor, FrequencyBand, IndexedImage};
use crate::config::{BinDisplay, ColourScale, EngineSettings, FrequencyScale, RenderParams, Tuning};
use crate::magnitude::MagnitudeRange;
use crate::palette::{Palette, Rgba};
use crate::source::peaks::PeakCache;
use crate::source::{
    FieldSampler, SampleKind, Signal, StftFactory, TransformDesc, TransformFactory,
    TransformSource,
};
use crate::util::audio;
use crate::view::{ViewState, ViewportId};

/// What one paint call accomplished.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaintOutcome {
    /// Region of the caller's surface that now holds settled pixels.
    pub drawn: PixelRect,
    /// Regions the caller should request again; empty once the viewport is
    /// fully rendered or when painting synchronously.
    pub stale: Vec<PixelRect>,
    /// Extents of the transform cell under the view's highlight point, for
    /// the host to outline.
    pub highlight: Option<PixelRect>,
}

/// Fill movement observed for one viewport's transform during a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillChange {
    /// Frames `[start, end)` became available since the last poll.
    Advanced { start: i64, end: i64 },
    /// Fill went backwards; the transform was replaced underneath us.
    Restarted,
    /// The transform covers the whole signal; polling it is over.
    Completed,
}

/// Result of a fill poll across every registered viewport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PollOutcome {
    pub changes: Vec<(ViewportId, FillChange)>,
    /// True once no transform needs further polling.
    pub idle: bool,
}

/// Magnitude and phase extents over the source cells one pixel covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellInfo {
    pub min_magnitude: f32,
    pub max_magnitude: f32,
    pub min_phase: f32,
    pub max_phase: f32,
}

/// Adaptive recompute span width. Each asynchronous paint records how long
/// its span took; the next span is halved or doubled until the projected
/// cost lands inside the tuning window.
#[derive(Debug, Clone, Copy, Default)]
struct SpanBudget {
    last_width: u32,
    last_time: Duration,
}

impl SpanBudget {
    fn next_span(&self, requested: u32, zoom: u32, synchronous: bool, tuning: &Tuning) -> u32 {
        if synchronous {
            return self.last_width.max(requested);
        }
        let mut span = self.last_width;
        if span == 0 {
            span = (tuning.initial_span_samples / u64::from(zoom.max(1))) as u32;
        } else {
            let mut last = self.last_time;
            while last > tuning.budget_high && span > tuning.span_shrink_floor {
                span /= 2;
                last /= 2;
            }
            while last < tuning.budget_low && span < tuning.span_ceiling {
                span *= 2;
                last *= 2;
            }
        }
        span.max(tuning.span_floor)
    }

    fn record(&mut self, width: u32, elapsed: Duration) {
        self.last_width = width;
        self.last_time = elapsed;
    }
}

struct ViewEntry {
    id: ViewportId,
    image: Option<ImageCache>,
    transform: Option<Box<dyn TransformSource>>,
    /// Latched after a failed creation so one bad viewport cannot spam the
    /// log; cleared when a parameter change drops the transform.
    transform_failed: bool,
    peaks: Option<PeakCache>,
    view_mag: MagnitudeRange,
    /// Frames confirmed filled at the last poll. None once fill tracking
    /// finished for this transform.
    last_fill: Option<u64>,
}

impl ViewEntry {
    fn new(id: ViewportId) -> Self {
        Self {
            id,
            image: None,
            transform: None,
            transform_failed: false,
            peaks: None,
            view_mag: MagnitudeRange::new(),
            last_fill: None,
        }
    }

    /// Drops a transform whose padded size no longer matches and creates a
    /// missing one, carrying the failure latch across paint calls.
    fn prepare_transform(
        &mut self,
        factory: &mut dyn TransformFactory,
        signal: &Signal,
        params: &RenderParams,
        zero_pad_level: usize,
    ) {
        let desc = TransformDesc::from_params(params, zero_pad_level);
        if self
            .transform
            .as_ref()
            .is_some_and(|t| t.fft_size() != desc.fft_size())
        {
            self.transform = None;
            self.peaks = None;
        }
        if self.transform.is_none() && !self.transform_failed {
            match factory.create(signal, &desc) {
                Ok(transform) => {
                    debug!(
                        "created transform for view {}: fft {} increment {}",
                        self.id.0,
                        desc.fft_size(),
                        desc.window_increment
                    );
                    self.transform = Some(transform);
                    self.last_fill = Some(0);
                }
                Err(e) => {
                    warn!("transform creation failed for view {}: {e:#}", self.id.0);
                    self.transform_failed = true;
                }
            }
        }
    }
}

/// The rendering engine: one image cache, transform, and peak cache per
/// registered viewport, plus the shared palette, scratch buffers, and
/// magnitude bookkeeping.
///
/// All methods run on the caller's thread; background progress arrives by
/// polling [`SpectrogramEngine::poll`] on roughly [`Tuning::poll_interval`].
pub struct SpectrogramEngine {
    params: RenderParams,
    tuning: Tuning,
    palette: Palette,
    signal: Option<Signal>,
    factory: Box<dyn TransformFactory>,
    views: Vec<ViewEntry>,
    /// Per-transform-column magnitude extents, shared across viewports.
    column_mags: Vec<MagnitudeRange>,
    compositor: Compositor,
    draw_buffer: IndexedImage,
    binforx: Vec<i64>,
    binfory: Vec<f32>,
    budget: SpanBudget,
    synchronous: bool,
}

impl std::fmt::Debug for SpectrogramEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrogramEngine")
            .field("views", &self.views.len())
            .field("synchronous", &self.synchronous)
            .finish_non_exhaustive()
    }
}

impl Default for SpectrogramEngine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl SpectrogramEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_factory(settings, Box::new(StftFactory))
    }

    pub fn with_factory(settings: EngineSettings, factory: Box<dyn TransformFactory>) -> Self {
        let mut params = settings.params;
        params.colour_rotation = params.colour_rotation.clamp(0, 256);
        let mut palette = Palette::new(params.colour_map);
        palette.set_rotation(-params.colour_rotation);
        Self {
            params,
            tuning: settings.tuning,
            palette,
            signal: None,
            factory,
            views: Vec::new(),
            column_mags: Vec::new(),
            compositor: Compositor::new(),
            draw_buffer: IndexedImage::new(0, 0),
            binforx: Vec::new(),
            binfory: Vec::new(),
            budget: SpanBudget::default(),
            synchronous: false,
        }
    }

    pub fn params(&self) -> &RenderParams {
        &self.params
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn signal(&self) -> Option<&Signal> {
        self.signal.as_ref()
    }

    pub fn synchronous(&self) -> bool {
        self.synchronous
    }

    /// Synchronous mode computes every missing column up front and always
    /// paints the full requested width; used for export rendering.
    pub fn set_synchronous(&mut self, synchronous: bool) {
        self.synchronous = synchronous;
    }

    /// Replaces the rendered signal. All per-view caches restart from
    /// scratch unless the very same material is set again.
    pub fn set_signal(&mut self, signal: Signal) {
        if let Some(current) = &self.signal {
            if Arc::ptr_eq(&current.samples, &signal.samples)
                && current.channels == signal.channels
                && current.sample_rate == signal.sample_rate
            {
                return;
            }
        }
        self.signal = Some(signal);
        self.invalidate_images();
        self.invalidate_magnitudes();
        self.invalidate_transforms();
    }

    /// Applies a new parameter set, invalidating exactly the state each
    /// changed field taints.
    pub fn set_params(&mut self, mut next: RenderParams) {
        next.colour_rotation = next.colour_rotation.clamp(0, 256);
        let prev = self.params;
        if next == prev {
            return;
        }

        let transforms = next.channel != prev.channel
            || next.window_size != prev.window_size
            || next.window_kind != prev.window_kind
            || next.hop_level != prev.hop_level
            || next.zero_pad_level != prev.zero_pad_level;
        let magnitudes = transforms
            || next.min_frequency != prev.min_frequency
            || next.max_frequency != prev.max_frequency
            || next.normalize_columns != prev.normalize_columns
            || next.normalize_visible_area != prev.normalize_visible_area
            || next.interpolate != prev.interpolate;

        if next.colour_map != prev.colour_map {
            self.palette.set_map(next.colour_map);
        }
        if next.colour_rotation != prev.colour_rotation {
            self.palette.set_rotation(-next.colour_rotation);
        }

        self.params = next;
        self.invalidate_images();
        if magnitudes {
            self.invalidate_magnitudes();
        }
        if transforms {
            self.invalidate_transforms();
        }
    }

    /// Every cached pixel is stale; repaint from the transforms.
    pub fn model_changed(&mut self) {
        self.invalidate_images();
        self.invalidate_magnitudes();
    }

    /// Frames `[start_frame, end_frame)` are stale in every image cache.
    pub fn model_changed_range(&mut self, start_frame: i64, end_frame: i64) {
        self.invalidate_images_range(start_frame, end_frame);
        self.invalidate_magnitudes();
    }

    /// A dormant viewport gives up its caches entirely; the next paint call
    /// for the same id rebuilds them.
    pub fn set_viewport_dormant(&mut self, view: ViewportId, dormant: bool) {
        if dormant {
            self.views.retain(|entry| entry.id != view);
        }
    }

    /// Checks fill progress of every viewport's transform, invalidating the
    /// newly covered frame ranges. Call on a timer of roughly
    /// [`Tuning::poll_interval`] until the outcome reports idle.
    pub fn poll(&mut self) -> PollOutcome {
        let mut changes = Vec::new();
        let end_frame = match self.signal.as_ref().filter(|s| s.is_ok()) {
            Some(signal) => signal.frames() as u64,
            None => {
                return PollOutcome {
                    changes,
                    idle: true,
                };
            }
        };

        for entry in &mut self.views {
            let Some(transform) = entry.transform.as_ref() else {
                continue;
            };
            let Some(last) = entry.last_fill else {
                continue;
            };
            let fill = transform.fill_frames() as u64;
            if fill >= last {
                if fill >= end_frame && last > 0 {
                    entry.last_fill = None;
                    changes.push((entry.id, FillChange::Completed));
                } else if fill > last {
                    entry.last_fill = Some(fill);
                    changes.push((
                        entry.id,
                        FillChange::Advanced {
                            start: last as i64,
                            end: fill as i64,
                        },
                    ));
                }
            } else {
                debug!(
                    "fill went backwards for view {}: {fill} < {last}",
                    entry.id.0
                );
                entry.last_fill = Some(fill);
                changes.push((entry.id, FillChange::Restarted));
            }
        }

        for (_, change) in &changes {
            match change {
                FillChange::Advanced { start, end } => self.invalidate_images_range(*start, *end),
                FillChange::Restarted | FillChange::Completed => self.invalidate_images(),
            }
        }

        let idle = self
            .views
            .iter()
            .all(|entry| entry.transform.is_none() || entry.last_fill.is_none());
        PollOutcome { changes, idle }
    }

    /// Runs up to `max_columns` of pending transform fill across the
    /// registered viewports. Returns how many columns were computed; 0 means
    /// every transform is caught up. Hosts call this from their idle loop
    /// and pick up the resulting invalidations through
    /// [`SpectrogramEngine::poll`].
    pub fn advance(&mut self, max_columns: usize) -> usize {
        let mut computed = 0;
        for entry in &mut self.views {
            if computed >= max_columns {
                break;
            }
            if let Some(transform) = entry.transform.as_deref_mut() {
                if !transform.is_complete() {
                    computed += transform.advance(max_columns - computed);
                }
            }
        }
        computed
    }

    /// Runs transform fill one column at a time until `deadline` passes or
    /// nothing is left to compute. Always makes progress when work remains,
    /// even with an already-expired deadline.
    pub fn advance_until(&mut self, deadline: Instant) -> usize {
        let mut computed = 0;
        loop {
            let n = self.advance(1);
            if n == 0 {
                return computed;
            }
            computed += n;
            if Instant::now() >= deadline {
                return computed;
            }
        }
    }

    /// Percentage of the signal covered by this viewport's transform.
    /// Saturates at 99 until a poll confirms completion.
    pub fn completion(&self, view: ViewportId) -> u8 {
        let Some(signal) = self.signal.as_ref().filter(|s| s.is_ok()) else {
            return 0;
        };
        let Some(entry) = self.views.iter().find(|e| e.id == view) else {
            return 100;
        };
        let Some(transform) = entry.transform.as_ref() else {
            return 100;
        };
        if entry.last_fill.is_none() {
            return 100;
        }
        let frames = signal.frames();
        if frames == 0 {
            return 100;
        }
        ((transform.fill_frames() * 100 / frames) as u8).min(99)
    }

    /// Magnitude and phase extents of the source cells under pixel (x, y),
    /// across whatever columns are already computed. Never forces work.
    pub fn cell_info(&self, view: &ViewState, x: i32, y: i32) -> Option<CellInfo> {
        let signal = self.signal.as_ref().filter(|s| s.is_ok())?;
        let entry = self.views.iter().find(|e| e.id == view.id)?;
        let transform = entry.transform.as_ref()?;

        let (q0, q1) = y_bin_range(view, y, &self.params, signal.sample_rate)?;
        let (s0, s1) = x_bin_range(
            view,
            x,
            signal.frames() as i64,
            self.params.window_increment(),
        )?;

        let zpl = (transform.fft_size() / self.params.base_fft_size()).max(1) as i64;
        let q0i = (q0 + 0.001) as i64 * zpl;
        let q1i = q1 as i64 * zpl;
        let s0i = (s0 + 0.001) as i64;
        let s1i = s1 as i64;

        let cw = transform.width() as i64;
        let ch = transform.height() as i64;
        let half = self.params.base_fft_size() as f32 / 2.0;

        let mut info = CellInfo {
            min_magnitude: 0.0,
            max_magnitude: 0.0,
            min_phase: 0.0,
            max_phase: 0.0,
        };
        let mut have = false;
        let mut value = [0.0f32];

        for q in q0i..=q1i {
            for s in s0i..=s1i {
                if s < 0 || q < 0 || s >= cw || q >= ch {
                    continue;
                }
                let (s, q) = (s as usize, q as usize);
                if !transform.is_column_available(s) {
                    continue;
                }
                if !transform.fetch_column(SampleKind::Phase, s, q, &mut value) {
                    continue;
                }
                let phase = value[0];
                if !transform.fetch_column(SampleKind::Magnitude, s, q, &mut value) {
                    continue;
                }
                let magnitude = value[0] / half;

                if !have || phase < info.min_phase {
                    info.min_phase = phase;
                }
                if !have || phase > info.max_phase {
                    info.max_phase = phase;
                }
                if !have || magnitude < info.min_magnitude {
                    info.min_magnitude = magnitude;
                }
                if !have || magnitude > info.max_magnitude {
                    info.max_magnitude = magnitude;
                }
                have = true;
            }
        }

        have.then_some(info)
    }

    /// Frequency band covered by output row `y`, quantized to the nominal
    /// bin grid.
    pub fn row_frequency_range(&self, view: &ViewState, y: i32) -> Option<(f32, f32)> {
        let signal = self.signal.as_ref().filter(|s| s.is_ok())?;
        let (q0, q1) = y_bin_range(view, y, &self.params, signal.sample_rate)?;
        let q0i = (q0 + 0.001) as i64;
        let q1i = q1 as i64;
        let sr = signal.sample_rate as i64;
        let fft = self.params.base_fft_size() as i64;
        Some((((sr * q0i) / fft) as f32, ((sr * (q1i + 1)) / fft) as f32))
    }

    /// Pixel extents of the transform cell covering (x, y), quantized the
    /// same way `cell_info` and `row_frequency_range` are. Paint reports
    /// this for the view's highlight point; hosts outline the rectangle
    /// themselves.
    pub fn highlight_extents(&self, view: &ViewState, x: i32, y: i32) -> Option<PixelRect> {
        let signal = self.signal.as_ref().filter(|s| s.is_ok())?;
        let increment = self.params.window_increment();
        let (s0, s1) = x_bin_range(view, x, signal.frames() as i64, increment)?;
        let (f0, f1) = self.row_frequency_range(view, y)?;

        let s0i = (s0 + 0.001) as i64;
        let s1i = s1 as i64;
        let x0 = view.x_for_frame(s0i * increment as i64) as i32;
        let x1 = view.x_for_frame((s1i + 1) * increment as i64) as i32;

        let sr = signal.sample_rate;
        let nominal = self.params.base_fft_size();
        let (minbin, maxbin) = audio::effective_bin_range(
            self.params.min_frequency,
            self.params.max_frequency,
            nominal,
            sr,
        );
        let min_f = audio::bin_frequency(minbin, nominal, sr);
        let max_f = audio::bin_frequency(maxbin, nominal, sr);
        let scale = self.params.frequency_scale;
        let y1 = view.y_for_frequency(f1, min_f, max_f, scale) as i32;
        let y0 = view.y_for_frequency(f0, min_f, max_f, scale) as i32;

        Some(PixelRect::new(x0, y1, x1 - x0 + 1, y0 - y1 + 1))
    }

    /// Draws `rect` of `view` into the caller's surface, reusing cached
    /// pixels where the cache still applies and recomputing one budgeted
    /// strip otherwise. `out` is a `width * height` row-major RGBA surface.
    pub fn paint(&mut self, view: &ViewState, rect: PixelRect, out: &mut [Rgba]) -> PaintOutcome {
        let Some(signal) = self.signal.clone() else {
            return PaintOutcome::default();
        };
        if !signal.is_ok() {
            return PaintOutcome::default();
        }

        let vw = view.width as i32;
        let vh = view.height as i32;
        let screen = PixelRect::new(0, 0, vw, vh);
        let rect = rect.intersect(screen);
        if rect.is_empty() {
            return PaintOutcome::default();
        }
        debug_assert_eq!(out.len(), (view.width * view.height) as usize);

        let highlight = view
            .highlight
            .and_then(|(hx, hy)| self.highlight_extents(view, hx, hy));

        let started = Instant::now();
        let increment = self.params.window_increment();
        let auto_pad = zero_pad_level(&self.params, &self.tuning, view, signal.sample_rate);
        let zpl = (self.params.zero_pad_level + 1) * (auto_pad + 1) - 1;
        let idx = self.entry_index(view.id);

        let mut x0 = rect.x;
        let mut x1 = rect.right();
        let mut recreate = true;

        if let Some(cache) = self.views[idx].image.as_mut() {
            if !cache.valid_area().is_empty() {
                if cache.zoom() == view.zoom
                    && cache.size_matches(view.width as usize, view.height as usize)
                {
                    let dx = view.x_for_frame(cache.start_frame());
                    let valid = cache.valid_area();
                    if dx == 0 && valid.x <= x0 && valid.right() >= x1 {
                        cache.copy_valid_rect(rect, out, view.width as usize);
                        return PaintOutcome {
                            drawn: rect,
                            stale: Vec::new(),
                            highlight,
                        };
                    }
                    recreate = false;
                    if dx != 0 {
                        let cw = cache.width() as i64;
                        if dx > -cw && dx < cw {
                            cache.shift_by(dx as i32);
                            if dx < 0 {
                                x0 = (cw + dx) as i32;
                                x1 = cw as i32;
                            } else {
                                x0 = 0;
                                x1 = dx as i32;
                            }
                        } else {
                            cache.invalidate_all();
                            recreate = true;
                        }
                    }
                } else {
                    cache.invalidate_all();
                }
            }
        }

        let mag_changed = update_view_magnitudes(
            &mut self.column_mags,
            &mut self.views[idx].view_mag,
            view,
            increment,
            signal.frames() as i64,
        );
        if mag_changed && self.params.normalize_visible_area {
            if let Some(cache) = self.views[idx].image.as_mut() {
                cache.invalidate_all();
            }
            recreate = true;
        }

        if recreate {
            x0 = 0;
            x1 = vw;
        }

        let span = self.budget.next_span(
            (x1 - x0).max(0) as u32,
            view.zoom,
            self.synchronous,
            &self.tuning,
        );
        let span_w = span as i32;

        // Pick the strip to recompute: hug the valid area's nearest edge, or
        // land a first window inside an empty cache.
        let valid = self.views[idx]
            .image
            .as_ref()
            .map(|c| c.valid_area())
            .filter(|r| !r.is_empty());
        match valid {
            Some(valid) => {
                let vx0 = valid.x;
                let vx1 = valid.right();
                if x0 < vx0 {
                    if x0 + span_w < vx0 {
                        x0 = vx0 - span_w;
                    }
                    x1 = vx0;
                } else if x0 >= vx1 {
                    x0 = vx1;
                    if x1 > x0 + span_w {
                        x1 = x0 + span_w;
                    }
                } else if x1 > vx1 {
                    x0 = vx1;
                    if x0 + span_w < x1 {
                        x1 = x0 + span_w;
                    }
                } else {
                    x1 = x0;
                }
            }
            None => {
                if x1 > x0 + span_w {
                    let sfx = if view.start_frame < 0 {
                        view.x_for_frame(0)
                    } else {
                        x1 as i64
                    };
                    if sfx >= x0 as i64 && sfx + span_w as i64 <= x1 as i64 {
                        x0 = sfx as i32;
                        x1 = x0 + span_w;
                    } else {
                        let mid = (x1 + x0) / 2;
                        x0 = mid - span_w / 2;
                        x1 = x0 + span_w;
                    }
                }
            }
        }

        let w = (x1 - x0).max(0);
        let h = view.height as usize;

        self.views[idx].prepare_transform(self.factory.as_mut(), &signal, &self.params, zpl);

        let sr = signal.sample_rate;
        let nominal = self.params.base_fft_size();
        let (minbin_n, maxbin_n) = audio::effective_bin_range(
            self.params.min_frequency,
            self.params.max_frequency,
            nominal,
            sr,
        );
        let auto_plus = auto_pad + 1;
        let fft_size = nominal * auto_plus;
        let minbin = minbin_n * auto_plus;
        let maxbin = (maxbin_n + 1) * auto_plus - 1;
        let display_min = audio::bin_frequency(minbin_n, nominal, sr);
        let display_max = audio::bin_frequency(maxbin_n, nominal, sr);

        // Lay the draw buffer out at pixel resolution, or at column
        // resolution widened to column boundaries when columns are wider
        // than pixels.
        let bin_res = increment as i64 > view.zoom as i64;
        let mut left_boundary = 0i64;
        let mut left_crop = 0i64;
        let mut right_boundary = 0i64;
        let mut right_crop = 0i64;
        let mut bufwid = w as usize;

        if bin_res && w > 0 {
            let inc = increment as i64;
            let mut crop = -1i64;
            let mut x = x0 as i64;
            left_boundary = loop {
                let f = view.frame_for_x(x);
                if f % inc == 0 {
                    if crop == -1 {
                        crop = f;
                    } else if x < x0 as i64 - 2 {
                        break f;
                    }
                }
                x -= 1;
            };
            left_crop = crop;

            let mut crop = -1i64;
            let mut x = (x0 + w) as i64;
            right_boundary = loop {
                let f = view.frame_for_x(x);
                if f % inc == 0 {
                    if crop == -1 {
                        crop = f;
                    } else if x > (x0 + w + 2) as i64 {
                        break f;
                    }
                }
                x += 1;
            };
            right_crop = crop;
            bufwid = ((right_boundary - left_boundary) / inc) as usize;
        }

        self.binforx.clear();
        if bin_res {
            let first = left_boundary / increment as i64;
            self.binforx.extend((0..bufwid).map(|x| first + x as i64));
        } else {
            let frames = signal.frames() as i64;
            self.binforx.extend((0..bufwid).map(|x| {
                match x_bin_range(view, x0 + x as i32, frames, increment) {
                    Some((s0, _)) => (s0 + 0.0001) as i64,
                    None => -1,
                }
            }));
        }

        let use_peaks = !bin_res
            && (increment * self.tuning.peak_decimation) < view.zoom as usize
            && self.params.colour_scale != ColourScale::Phase;

        self.binfory.clear();
        if self.params.bin_display != BinDisplay::PeakFrequencies {
            let scale = self.params.frequency_scale;
            self.binfory.extend((0..h).map(|y| {
                let frequency =
                    view.frequency_for_y((h - y) as f32, display_min, display_max, scale);
                frequency * fft_size as f32 / sr
            }));
        }

        self.draw_buffer.reset(bufwid, h);

        let mut overall = self.views[idx].view_mag;
        let mut composed = ComposeOutcome {
            complete: false,
            columns_done: 0,
            overall_changed: false,
        };

        if w > 0 {
            let mut lo = -1i64;
            let mut hi = -1i64;
            for &sx in &self.binforx {
                if sx >= 0 {
                    if lo < 0 {
                        lo = sx;
                    }
                    hi = hi.max(sx);
                }
            }

            let entry = &mut self.views[idx];

            if lo >= 0 {
                if self.synchronous {
                    if let Some(transform) = entry.transform.as_deref_mut() {
                        let width = transform.width() as i64;
                        let (c0, c1) = if use_peaks {
                            let d = self.tuning.peak_decimation as i64;
                            ((lo / d) * d, ((hi / d + 1) * d).min(width))
                        } else {
                            (lo, (hi + 1).min(width))
                        };
                        for column in c0..c1 {
                            transform.ensure_column(column as usize);
                        }
                    }
                }
                if use_peaks {
                    if let Some(transform) = entry.transform.as_deref() {
                        let decimation = self.tuning.peak_decimation;
                        if entry
                            .peaks
                            .as_ref()
                            .is_none_or(|p| !p.covers(transform) || p.decimation() != decimation)
                        {
                            entry.peaks = Some(PeakCache::new(transform, decimation));
                        }
                        if let Some(peaks) = entry.peaks.as_mut() {
                            let d = decimation as i64;
                            peaks.ensure_buckets(
                                transform,
                                (lo / d) as usize,
                                (hi / d + 1) as usize,
                            );
                        }
                    }
                }
            }

            if let Some(transform) = entry.transform.as_deref() {
                let (field, divisor): (&dyn FieldSampler, usize) = match entry.peaks.as_ref() {
                    Some(peaks) if use_peaks => (peaks, self.tuning.peak_decimation),
                    _ => (transform, 1),
                };
                let compose = ComposeParams {
                    binforx: &self.binforx,
                    binfory: &self.binfory,
                    divisor,
                    fft_size: nominal,
                    gain: self.params.gain,
                    threshold: self.params.threshold,
                    interpolate: self.params.interpolate,
                    bin_display: self.params.bin_display,
                    colour_scale: self.params.colour_scale,
                    normalize_columns: self.params.normalize_columns,
                    normalize_visible_area: self.params.normalize_visible_area,
                    view_range: entry.view_mag,
                    synchronous: self.synchronous,
                };
                composed = if self.params.bin_display == BinDisplay::PeakFrequencies {
                    let band = FrequencyBand {
                        min: display_min,
                        max: display_max,
                        scale: self.params.frequency_scale,
                    };
                    self.compositor.render_peak_frequencies(
                        &mut self.draw_buffer,
                        transform,
                        view,
                        &compose,
                        minbin as i32,
                        maxbin as i32,
                        band,
                        &mut self.column_mags,
                        &mut overall,
                    )
                } else {
                    self.compositor.render(
                        &mut self.draw_buffer,
                        field,
                        &compose,
                        &mut self.column_mags,
                        &mut overall,
                    )
                };
            }
        }

        if composed.overall_changed {
            self.views[idx].view_mag = overall;
        }

        if recreate {
            self.views[idx].image = Some(ImageCache::new(
                view.width as usize,
                view.height as usize,
                view.start_frame,
                view.zoom,
            ));
        }

        let mut outcome = PaintOutcome::default();
        if let Some(cache) = self.views[idx].image.as_mut() {
            if w > 0 {
                if bin_res {
                    let span_left = view.x_for_frame(left_boundary) as i32;
                    let span_right = view.x_for_frame(right_boundary) as i32;
                    let crop0 = view.x_for_frame(left_crop) as i32;
                    let crop1 = view.x_for_frame(right_crop) as i32;
                    if let Some((written0, written1)) = cache.store_scaled(
                        span_left,
                        span_right - span_left,
                        crop0,
                        crop1,
                        &self.draw_buffer,
                        composed.columns_done,
                        self.params.interpolate,
                        &self.palette,
                    ) {
                        cache.merge_valid_span(written0, written1 - written0);
                    }
                } else {
                    cache.store_indexed(x0, &self.draw_buffer, composed.columns_done, &self.palette);
                    let begin = x0.max(0);
                    let end = (x0 + composed.columns_done as i32).min(vw);
                    if end > begin {
                        cache.merge_valid_span(begin, end - begin);
                    }
                }
            }

            outcome.drawn = rect.intersect(cache.valid_area());
            cache.copy_valid_rect(rect, out, view.width as usize);
            cache.retarget(view.start_frame, view.zoom);

            if !self.synchronous {
                if !self.params.normalize_visible_area || !composed.overall_changed {
                    let valid = cache.valid_area();
                    if valid.x > 0 {
                        outcome.stale.push(PixelRect::new(0, 0, valid.x, vh));
                    }
                    if valid.right() < vw {
                        outcome
                            .stale
                            .push(PixelRect::new(valid.right(), 0, vw - valid.right(), vh));
                    }
                } else {
                    cache.invalidate_all();
                    outcome.stale.push(screen);
                }
            }
        }

        if !self.synchronous {
            self.budget.record(span, started.elapsed());
        }
        outcome.highlight = highlight;
        outcome
    }

    fn entry_index(&mut self, id: ViewportId) -> usize {
        if let Some(idx) = self.views.iter().position(|e| e.id == id) {
            return idx;
        }
        self.views.push(ViewEntry::new(id));
        self.views.len() - 1
    }

    fn invalidate_images(&mut self) {
        for entry in &mut self.views {
            if let Some(cache) = entry.image.as_mut() {
                cache.invalidate_all();
            }
        }
    }

    fn invalidate_images_range(&mut self, start_frame: i64, end_frame: i64) {
        for entry in &mut self.views {
            if let Some(cache) = entry.image.as_mut() {
                cache.invalidate_frames(start_frame, end_frame);
            }
        }
    }

    fn invalidate_magnitudes(&mut self) {
        for slot in &mut self.column_mags {
            slot.reset();
        }
        for entry in &mut self.views {
            entry.view_mag.reset();
        }
    }

    fn invalidate_transforms(&mut self) {
        for entry in &mut self.views {
            entry.transform = None;
            entry.peaks = None;
            entry.transform_failed = false;
            entry.last_fill = None;
        }
    }
}

/// Fractional transform-column range a pixel column covers, or None when
/// the pixel lies entirely outside the signal.
fn x_bin_range(view: &ViewState, x: i32, frames: i64, increment: usize) -> Option<(f32, f32)> {
    let f0 = view.frame_for_x(x as i64);
    let f1 = view.frame_for_x(x as i64 + 1) - 1;
    if f1 < 0 || f0 > frames {
        return None;
    }
    let increment = increment.max(1) as f32;
    Some((f0 as f32 / increment, f1 as f32 / increment))
}

/// Fractional nominal-bin range a pixel row covers, from its bottom edge
/// (`q0`) to its top edge (`q1`).
fn y_bin_range(
    view: &ViewState,
    y: i32,
    params: &RenderParams,
    sample_rate: f32,
) -> Option<(f32, f32)> {
    if y < 0 || y >= view.height as i32 {
        return None;
    }
    let nominal = params.base_fft_size();
    let (minbin, maxbin) = audio::effective_bin_range(
        params.min_frequency,
        params.max_frequency,
        nominal,
        sample_rate,
    );
    let min_f = audio::bin_frequency(minbin, nominal, sample_rate);
    let max_f = audio::bin_frequency(maxbin, nominal, sample_rate);
    let scale = params.frequency_scale;
    let to_bin = nominal as f32 / sample_rate;
    let q0 = view.frequency_for_y(y as f32 + 1.0, min_f, max_f, scale) * to_bin;
    let q1 = view.frequency_for_y(y as f32, min_f, max_f, scale) * to_bin;
    Some((q0, q1))
}

/// Merges the set per-column ranges over the visible span into the view's
/// overall range. True when the overall range moved.
fn update_view_magnitudes(
    column_mags: &mut Vec<MagnitudeRange>,
    view_mag: &mut MagnitudeRange,
    view: &ViewState,
    increment: usize,
    frames: i64,
) -> bool {
    let fallback_start = 0.0f32;
    let fallback_end = frames as f32 / increment.max(1) as f32;

    let (s00, s01) =
        x_bin_range(view, 0, frames, increment).unwrap_or((fallback_start, fallback_start));
    let (s10, s11) = x_bin_range(view, view.width as i32, frames, increment)
        .unwrap_or((fallback_end, fallback_end));

    let s0 = (s00.min(s10) + 0.0001).max(0.0) as usize;
    let s1 = (s01.max(s11) + 0.0001).max(0.0) as usize;

    if column_mags.len() <= s1 {
        column_mags.resize(s1 + 1, MagnitudeRange::new());
    }

    let mut mag = MagnitudeRange::new();
    for slot in &column_mags[s0..=s1] {
        if slot.is_set() {
            mag.merge(*slot);
        }
    }

    if !mag.is_set() || mag == *view_mag {
        return false;
    }
    *view_mag = mag;
    true
}

/// Density-driven oversampling level, multiplied on top of the base
/// zero-pad level by paint. Fine vertical zooms pad the transform so
/// interpolation has real bins to work with; log scale always pads fully.
fn zero_pad_level(
    params: &RenderParams,
    tuning: &Tuning,
    view: &ViewState,
    sample_rate: f32,
) -> usize {
    if params.bin_display != BinDisplay::AllBins {
        return 0;
    }
    if params.frequency_scale == FrequencyScale::Log {
        return 3;
    }
    let (minbin, maxbin) = audio::effective_bin_range(
        params.min_frequency,
        params.max_frequency,
        params.base_fft_size(),
        sample_rate,
    );
    // Divide the base padding back out so density is judged per window bin.
    let bins = (maxbin - minbin) / (params.zero_pad_level + 1);
    if bins == 0 {
        return 3;
    }
    let per_pixel = view.height as f32 / bins as f32;
    if per_pixel > tuning.density_four_x {
        3
    } else if per_pixel > tuning.density_two_x {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::config::WindowKind;
    use crate::source::PeakMode;

    fn grid_magnitude(column: usize, bin: usize) -> f32 {
        ((column * 7 + bin * 3) % 13 + 1) as f32
    }

    fn grid_phase(column: usize, bin: usize) -> f32 {
        ((column + bin) % 7) as f32 * 0.4 - 1.2
    }

    /// Transform double with deterministic per-cell values. Availability
    /// follows a shared frame counter the test moves at will; `ensure_column`
    /// marks single columns available the way a synchronous fill would.
    struct GridSource {
        width: usize,
        height: usize,
        increment: usize,
        sample_rate: f32,
        fft_size: usize,
        frames: usize,
        fill: Arc<AtomicUsize>,
        fetches: Arc<AtomicUsize>,
        ensured: Arc<Mutex<HashSet<usize>>>,
    }

    impl GridSource {
        fn available(&self, column: usize) -> bool {
            (column + 1) * self.increment <= self.fill.load(Ordering::Relaxed)
                || self.ensured.lock().unwrap().contains(&column)
        }
    }

    impl FieldSampler for GridSource {
        fn width(&self) -> usize {
            self.width
        }

        fn height(&self) -> usize {
            self.height
        }

        fn is_column_available(&self, column: usize) -> bool {
            column < self.width && self.available(column)
        }

        fn fetch_column(
            &self,
            kind: SampleKind,
            column: usize,
            bin0: usize,
            out: &mut [f32],
        ) -> bool {
            if !self.is_column_available(column) {
                return false;
            }
            self.fetches.fetch_add(1, Ordering::Relaxed);
            for (offset, slot) in out.iter_mut().enumerate() {
                let bin = bin0 + offset;
                *slot = match kind {
                    SampleKind::Magnitude => grid_magnitude(column, bin),
                    SampleKind::NormalizedMagnitude => grid_magnitude(column, bin) / 13.0,
                    SampleKind::Phase => grid_phase(column, bin),
                };
            }
            true
        }
    }

    impl TransformSource for GridSource {
        fn sample_rate(&self) -> f32 {
            self.sample_rate
        }

        fn fft_size(&self) -> usize {
            self.fft_size
        }

        fn window_increment(&self) -> usize {
            self.increment
        }

        fn fill_frames(&self) -> usize {
            self.fill.load(Ordering::Relaxed).min(self.frames)
        }

        fn is_complete(&self) -> bool {
            self.fill_frames() >= self.frames
        }

        fn advance(&mut self, max_columns: usize) -> usize {
            let done = self.fill.load(Ordering::Relaxed) / self.increment;
            let computed = max_columns.min(self.width.saturating_sub(done));
            self.fill
                .store((done + computed) * self.increment, Ordering::Relaxed);
            computed
        }

        fn ensure_column(&mut self, column: usize) -> bool {
            if column >= self.width {
                return false;
            }
            self.ensured.lock().unwrap().insert(column);
            true
        }

        fn estimate_stable_frequency(&self, _column: usize, _bin: usize) -> Option<f32> {
            None
        }

        fn peak_frequencies(
            &self,
            _mode: PeakMode,
            column: usize,
            bin0: usize,
            bin1: usize,
        ) -> Vec<(usize, f32)> {
            if !self.is_column_available(column) {
                return Vec::new();
            }
            let mut peaks = Vec::new();
            let hi = bin1.min(self.height.saturating_sub(2));
            for bin in bin0.max(1)..=hi {
                let value = grid_magnitude(column, bin);
                if value > grid_magnitude(column, bin - 1)
                    && value >= grid_magnitude(column, bin + 1)
                {
                    peaks.push((bin, bin as f32 * self.sample_rate / self.fft_size as f32));
                }
            }
            peaks
        }
    }

    struct GridFactory {
        fill: Arc<AtomicUsize>,
        fetches: Arc<AtomicUsize>,
        ensured: Arc<Mutex<HashSet<usize>>>,
        descs: Arc<Mutex<Vec<TransformDesc>>>,
        fail: Arc<AtomicBool>,
    }

    impl TransformFactory for GridFactory {
        fn create(
            &mut self,
            signal: &Signal,
            desc: &TransformDesc,
        ) -> anyhow::Result<Box<dyn TransformSource>> {
            self.descs.lock().unwrap().push(desc.clone());
            anyhow::ensure!(
                !self.fail.load(Ordering::Relaxed),
                "transform backing store exhausted"
            );
            Ok(Box::new(GridSource {
                width: signal.frames() / desc.window_increment,
                height: desc.fft_size() / 2 + 1,
                increment: desc.window_increment,
                sample_rate: signal.sample_rate,
                fft_size: desc.fft_size(),
                frames: signal.frames(),
                fill: self.fill.clone(),
                fetches: self.fetches.clone(),
                ensured: self.ensured.clone(),
            }))
        }
    }

    struct Harness {
        engine: SpectrogramEngine,
        fill: Arc<AtomicUsize>,
        fetches: Arc<AtomicUsize>,
        ensured: Arc<Mutex<HashSet<usize>>>,
        descs: Arc<Mutex<Vec<TransformDesc>>>,
        fail: Arc<AtomicBool>,
    }

    impl Harness {
        fn set_fill(&self, frames: usize) {
            self.fill.store(frames, Ordering::Relaxed);
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::Relaxed)
        }

        fn desc(&self, index: usize) -> TransformDesc {
            self.descs.lock().unwrap()[index].clone()
        }

        fn desc_count(&self) -> usize {
            self.descs.lock().unwrap().len()
        }
    }

    /// Window 32 at 8 kHz with hop level 2 gives an 8 frame increment and
    /// bins 1..=16 spanning 250..4000 Hz. A 16 px tall viewport keeps the
    /// display pad at zero, so transform columns map 1:1 onto pixels at
    /// zoom 8.
    fn grid_params() -> RenderParams {
        RenderParams {
            window_size: 32,
            min_frequency: 0.0,
            max_frequency: 0.0,
            interpolate: false,
            ..RenderParams::default()
        }
    }

    fn harness(params: RenderParams, frames: usize) -> Harness {
        let fill = Arc::new(AtomicUsize::new(0));
        let fetches = Arc::new(AtomicUsize::new(0));
        let ensured = Arc::new(Mutex::new(HashSet::new()));
        let descs = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let factory = GridFactory {
            fill: fill.clone(),
            fetches: fetches.clone(),
            ensured: ensured.clone(),
            descs: descs.clone(),
            fail: fail.clone(),
        };
        let settings = EngineSettings {
            params,
            tuning: Tuning::default(),
        };
        let mut engine = SpectrogramEngine::with_factory(settings, Box::new(factory));
        engine.set_signal(Signal::new(vec![0.0f32; frames].into(), 1, 8_000.0));
        Harness {
            engine,
            fill,
            fetches,
            ensured,
            descs,
            fail,
        }
    }

    fn grid_view(width: u32, height: u32, start_frame: i64, zoom: u32) -> ViewState {
        ViewState::new(ViewportId(1), start_frame, zoom, width, height)
    }

    fn surface(view: &ViewState) -> Vec<Rgba> {
        vec![[0u8; 4]; (view.width * view.height) as usize]
    }

    fn screen(view: &ViewState) -> PixelRect {
        PixelRect::new(0, 0, view.width as i32, view.height as i32)
    }

    fn column_pixels(out: &[Rgba], view: &ViewState, x: usize) -> Vec<Rgba> {
        (0..view.height as usize)
            .map(|y| out[y * view.width as usize + x])
            .collect()
    }

    #[test]
    fn span_seeds_from_zoom_and_respects_the_floor() {
        let tuning = Tuning::default();
        let budget = SpanBudget::default();
        assert_eq!(budget.next_span(64, 8, false, &tuning), 37_500);
        assert_eq!(budget.next_span(64, 100, false, &tuning), 3_000);
        assert_eq!(budget.next_span(64, 100_000, false, &tuning), 20);
    }

    #[test]
    fn span_converges_on_a_constant_cost_renderer() {
        let tuning = Tuning::default();
        let mut budget = SpanBudget::default();
        let per_column = Duration::from_micros(150);

        let mut span = budget.next_span(64, 8, false, &tuning);
        assert_eq!(span, 37_500);
        for _ in 0..12 {
            budget.record(span, per_column * span);
            span = budget.next_span(64, 8, false, &tuning);
        }
        // 150 us per column projects into the window at 1171 columns.
        assert_eq!(span, 1_171);
        budget.record(span, per_column * span);
        assert_eq!(budget.next_span(64, 8, false, &tuning), 1_171);
    }

    #[test]
    fn span_adapts_within_its_bounds() {
        let tuning = Tuning::default();
        let mut budget = SpanBudget::default();

        // Cheap spans double until the projected time enters the window.
        budget.record(100, Duration::from_millis(30));
        assert_eq!(budget.next_span(0, 8, false, &tuning), 400);

        // Growth stops at the ceiling.
        budget.record(1_500, Duration::from_millis(1));
        assert_eq!(budget.next_span(0, 8, false, &tuning), 1_500);

        // Shrinking stops at the shrink floor even when hopelessly slow.
        budget.record(40, Duration::from_secs(10));
        assert_eq!(budget.next_span(0, 8, false, &tuning), 40);
    }

    #[test]
    fn synchronous_spans_cover_the_request() {
        let tuning = Tuning::default();
        let mut budget = SpanBudget::default();
        assert_eq!(budget.next_span(640, 8, true, &tuning), 640);
        budget.record(1_000, Duration::from_millis(500));
        assert_eq!(budget.next_span(640, 8, true, &tuning), 1_000);
    }

    #[test]
    fn engine_without_a_signal_stays_idle() {
        let mut engine = SpectrogramEngine::default();
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        let outcome = engine.paint(&view, screen(&view), &mut out);
        assert_eq!(outcome, PaintOutcome::default());
        assert!(engine.poll().idle);
        assert_eq!(engine.completion(view.id), 0);
        assert!(engine.cell_info(&view, 0, 0).is_none());
    }

    #[test]
    fn synchronous_paint_renders_the_whole_viewport() {
        let mut h = harness(grid_params(), 512);
        h.engine.set_synchronous(true);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);

        assert_eq!(outcome.drawn, screen(&view));
        assert!(outcome.stale.is_empty());
        assert_eq!(h.ensured.lock().unwrap().len(), 64);
        assert!(out.iter().all(|px| px[3] == 255));
        assert!(out.iter().any(|px| px[0] > 0 || px[1] > 0 || px[2] > 0));
    }

    #[test]
    fn asynchronous_paint_stops_at_the_fill_frontier() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(160);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);

        assert_eq!(outcome.drawn, PixelRect::new(0, 0, 20, 16));
        assert_eq!(outcome.stale, vec![PixelRect::new(20, 0, 44, 16)]);
        // Only filled columns reach the surface.
        assert!(column_pixels(&out, &view, 19).iter().all(|px| px[3] == 255));
        assert!(column_pixels(&out, &view, 20).iter().all(|px| *px == [0; 4]));
        assert!(h.ensured.lock().unwrap().is_empty());
    }

    #[test]
    fn poll_tracks_fill_progress_to_completion() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(160);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);
        h.engine.paint(&view, screen(&view), &mut out);

        h.set_fill(320);
        let outcome = h.engine.poll();
        assert_eq!(
            outcome.changes,
            vec![(view.id, FillChange::Advanced { start: 0, end: 320 })]
        );
        assert!(!outcome.idle);
        assert_eq!(h.engine.completion(view.id), 62);

        h.set_fill(512);
        let outcome = h.engine.poll();
        assert_eq!(outcome.changes, vec![(view.id, FillChange::Completed)]);
        assert!(outcome.idle);
        assert_eq!(h.engine.completion(view.id), 100);

        // Nothing left to report once completion fired.
        let outcome = h.engine.poll();
        assert!(outcome.changes.is_empty());
        assert!(outcome.idle);
    }

    #[test]
    fn fill_invalidation_triggers_incremental_repaint() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(256);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.fetches(), 32);

        // The first advance overlaps everything painted so far, so the next
        // paint recomposes the whole covered region once.
        let polled = h.engine.poll();
        assert_eq!(
            polled.changes,
            vec![(view.id, FillChange::Advanced { start: 0, end: 256 })]
        );
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.fetches(), 64);

        h.set_fill(384);
        let polled = h.engine.poll();
        assert_eq!(
            polled.changes,
            vec![(view.id, FillChange::Advanced { start: 256, end: 384 })]
        );

        // Only the invalidated tail is recomposed now.
        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.fetches(), 81);
        assert_eq!(outcome.drawn, PixelRect::new(0, 0, 48, 16));
        assert_eq!(outcome.stale, vec![PixelRect::new(48, 0, 16, 16)]);
    }

    #[test]
    fn scrolling_shifts_cached_pixels() {
        let params = grid_params();

        let mut scrolled = harness(params, 512);
        scrolled.set_fill(512);
        let before = grid_view(64, 16, 0, 8);
        let after = grid_view(64, 16, 80, 8);
        let mut out = surface(&before);
        scrolled.engine.paint(&before, screen(&before), &mut out);
        let outcome = scrolled.engine.paint(&after, screen(&after), &mut out);
        assert_eq!(outcome.drawn, screen(&after));
        assert!(outcome.stale.is_empty());
        // The exposed strip lies past the signal, so no new columns were read.
        assert_eq!(scrolled.fetches(), 64);

        let mut fresh = harness(params, 512);
        fresh.set_fill(512);
        let mut expected = surface(&after);
        fresh.engine.paint(&after, screen(&after), &mut expected);
        assert_eq!(fresh.fetches(), 54);

        assert_eq!(out, expected);
    }

    #[test]
    fn covered_repaints_come_from_the_cache() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        h.engine.paint(&view, screen(&view), &mut out);
        let fetched = h.fetches();

        let mut again = surface(&view);
        let outcome = h.engine.paint(&view, screen(&view), &mut again);

        assert_eq!(h.fetches(), fetched);
        assert_eq!(outcome.drawn, screen(&view));
        assert!(outcome.stale.is_empty());
        assert_eq!(again, out);
    }

    #[test]
    fn paint_clips_to_the_viewport() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        let outcome = h
            .engine
            .paint(&view, PixelRect::new(-5, -3, 200, 100), &mut out);
        assert_eq!(outcome.drawn, screen(&view));

        let outcome = h
            .engine
            .paint(&view, PixelRect::new(100, 0, 10, 16), &mut out);
        assert_eq!(outcome, PaintOutcome::default());
    }

    #[test]
    fn visible_normalization_settles_after_one_repaint() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);
        h.engine.paint(&view, screen(&view), &mut out);

        let mut params = *h.engine.params();
        params.normalize_visible_area = true;
        h.engine.set_params(params);

        // The first paint discovers the visible range and invalidates
        // everything shaded against the stale one.
        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(outcome.stale, vec![screen(&view)]);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(outcome.drawn, screen(&view));
        assert!(outcome.stale.is_empty());
    }

    #[test]
    fn tall_viewports_pad_the_transform() {
        let mut h = harness(grid_params(), 512);
        h.engine.set_synchronous(true);
        h.set_fill(512);

        let short = grid_view(64, 16, 0, 8);
        let mut out = surface(&short);
        h.engine.paint(&short, screen(&short), &mut out);
        assert_eq!(h.desc(0).fft_size(), 32);

        // 48 rows over 15 bins crosses the 4x oversampling density.
        let tall = grid_view(64, 48, 0, 8);
        let mut out = surface(&tall);
        h.engine.paint(&tall, screen(&tall), &mut out);
        assert_eq!(h.desc_count(), 2);
        assert_eq!(h.desc(1).fft_size(), 128);

        // Same geometry again reuses the padded transform.
        h.engine.paint(&tall, screen(&tall), &mut out);
        assert_eq!(h.desc_count(), 2);
    }

    #[test]
    fn base_zero_padding_multiplies_the_transform_size() {
        let mut params = grid_params();
        params.zero_pad_level = 1;
        let mut h = harness(params, 512);
        h.engine.set_synchronous(true);
        h.set_fill(512);

        // Base padding doubles the transform without disturbing density
        // selection: the doubled bin count divides back out, so 16 rows
        // stay under the 2x threshold.
        let short = grid_view(64, 16, 0, 8);
        let mut out = surface(&short);
        h.engine.paint(&short, screen(&short), &mut out);
        assert_eq!(h.desc(0).fft_size(), 64);

        // Density padding multiplies on top of the base level.
        let tall = grid_view(64, 48, 0, 8);
        let mut out = surface(&tall);
        h.engine.paint(&tall, screen(&tall), &mut out);
        assert_eq!(h.desc(1).fft_size(), 256);
    }

    #[test]
    fn parameter_changes_invalidate_what_they_taint() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 1);
        assert_eq!(h.fetches(), 64);

        // A display-only change keeps the transform but repaints.
        let mut params = *h.engine.params();
        params.gain = 2.0;
        h.engine.set_params(params);
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 1);
        assert_eq!(h.fetches(), 128);

        // Setting identical parameters is a no-op.
        h.engine.set_params(params);
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.fetches(), 128);

        // A window change rebuilds the transform.
        params.window_size = 64;
        h.engine.set_params(params);
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 2);
        assert_eq!(h.desc(1).window_size, 64);
        assert_eq!(h.desc(1).window_increment, 16);

        // A frequency window change taints magnitudes but not transforms.
        params.min_frequency = 500.0;
        h.engine.set_params(params);
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 2);
    }

    #[test]
    fn colour_rotation_is_clamped_and_mirrored_into_the_palette() {
        let mut params = grid_params();
        params.colour_rotation = -5;
        let mut h = harness(params, 512);
        assert_eq!(h.engine.params().colour_rotation, 0);
        assert_eq!(h.engine.palette().rotation(), 0);

        let mut params = *h.engine.params();
        params.colour_rotation = 300;
        h.engine.set_params(params);
        assert_eq!(h.engine.params().colour_rotation, 256);
        assert_eq!(h.engine.palette().rotation(), -256);
    }

    #[test]
    fn dormant_viewports_release_their_state() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 1);

        h.engine.set_viewport_dormant(view.id, true);
        assert_eq!(h.engine.completion(view.id), 100);

        // Waking is implicit: the next paint rebuilds everything.
        h.engine.set_viewport_dormant(view.id, false);
        let fetched = h.fetches();
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 2);
        assert_eq!(h.fetches(), fetched + 64);
    }

    #[test]
    fn model_changes_invalidate_by_frame_range() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.fetches(), 64);

        // Frames from 256 on changed: pixels 32.. are stale, minus the
        // boundary guard column.
        h.engine.model_changed_range(256, 512);
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.fetches(), 97);

        h.engine.model_changed();
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.fetches(), 161);
    }

    #[test]
    fn wide_zooms_render_from_peak_buckets() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        let view = grid_view(4, 16, 0, 128);
        let mut out = surface(&view);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);

        assert_eq!(outcome.drawn, screen(&view));
        assert!(outcome.stale.is_empty());
        assert!(out.iter().all(|px| px[3] == 255));
        // Seven buckets of eight columns each were built; the compositor
        // never touched the transform directly.
        assert_eq!(h.fetches(), 56);
    }

    #[test]
    fn coarse_zooms_scale_columns_onto_pixels() {
        let mut params = grid_params();
        params.hop_level = 0;
        let mut h = harness(params, 128);
        h.set_fill(128);
        let view = grid_view(16, 16, 0, 4);
        let mut out = surface(&view);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);

        assert_eq!(outcome.drawn, screen(&view));
        assert!(outcome.stale.is_empty());
        assert_eq!(h.fetches(), 3);
        // Eight pixels per 32 frame column at zoom 4.
        assert_eq!(column_pixels(&out, &view, 0), column_pixels(&out, &view, 7));
        assert_eq!(
            column_pixels(&out, &view, 8),
            column_pixels(&out, &view, 15)
        );
        assert_ne!(
            column_pixels(&out, &view, 7),
            column_pixels(&out, &view, 8)
        );
    }

    #[test]
    fn failed_transform_creation_is_latched() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        h.fail.store(true, Ordering::Relaxed);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 1);
        assert_eq!(outcome.drawn, PixelRect::EMPTY);
        assert_eq!(outcome.stale, vec![screen(&view)]);

        // No retry until parameters move.
        h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 1);
        assert_eq!(h.engine.completion(view.id), 100);

        h.fail.store(false, Ordering::Relaxed);
        let mut params = *h.engine.params();
        params.window_kind = WindowKind::Hamming;
        h.engine.set_params(params);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(h.desc_count(), 2);
        assert_eq!(h.desc(1).window_kind, WindowKind::Hamming);
        assert_eq!(outcome.drawn, screen(&view));
    }

    #[test]
    fn advance_drives_fill_without_a_worker() {
        let mut h = harness(grid_params(), 512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(outcome.drawn, PixelRect::EMPTY);
        assert_eq!(outcome.stale, vec![screen(&view)]);
        assert_eq!(h.engine.completion(view.id), 0);

        assert_eq!(h.engine.advance(16), 16);
        let polled = h.engine.poll();
        assert_eq!(
            polled.changes,
            vec![(view.id, FillChange::Advanced { start: 0, end: 128 })]
        );
        assert_eq!(h.engine.completion(view.id), 25);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(outcome.drawn, PixelRect::new(0, 0, 16, 16));

        // The remaining 48 columns finish the signal; completion saturates
        // until a poll confirms it.
        assert_eq!(h.engine.advance(100), 48);
        assert_eq!(h.engine.completion(view.id), 99);
        let polled = h.engine.poll();
        assert_eq!(polled.changes, vec![(view.id, FillChange::Completed)]);
        assert_eq!(h.engine.completion(view.id), 100);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(outcome.drawn, screen(&view));
        assert!(outcome.stale.is_empty());
        assert_eq!(h.engine.advance(5), 0);

        // The streamed result matches a single cold paint over a full fill.
        let mut fresh = harness(grid_params(), 512);
        fresh.set_fill(512);
        let mut expected = surface(&view);
        fresh.engine.paint(&view, screen(&view), &mut expected);
        assert_eq!(out, expected);
    }

    #[test]
    fn advance_until_respects_the_deadline() {
        let mut h = harness(grid_params(), 512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);
        h.engine.paint(&view, screen(&view), &mut out);

        // An expired deadline still computes one column.
        assert_eq!(h.engine.advance_until(Instant::now()), 1);

        let deadline = Instant::now() + Duration::from_secs(60);
        assert_eq!(h.engine.advance_until(deadline), 63);
        assert_eq!(h.engine.advance(1), 0);
    }

    #[test]
    fn stft_factory_renders_a_sine() {
        let samples: Vec<f32> = (0..4096)
            .map(|n| {
                let t = n as f32 / 8_000.0;
                (core::f32::consts::TAU * 1_000.0 * t).sin()
            })
            .collect();

        let mut engine = SpectrogramEngine::default();
        engine.set_synchronous(true);
        engine.set_signal(Signal::new(samples.into(), 1, 8_000.0));

        let view = ViewState::new(ViewportId(9), 0, 512, 8, 12);
        let mut out = surface(&view);
        let outcome = engine.paint(&view, screen(&view), &mut out);

        assert_eq!(outcome.drawn, screen(&view));
        assert!(outcome.stale.is_empty());
        assert!(out.iter().all(|px| px[3] == 255));
        assert!(out.iter().any(|px| px[0] > 0 || px[1] > 0 || px[2] > 0));
    }

    #[test]
    fn cell_info_reports_source_extents_under_a_pixel() {
        let mut h = harness(grid_params(), 512);
        h.set_fill(512);
        let view = grid_view(64, 16, 0, 8);
        let mut out = surface(&view);
        h.engine.paint(&view, screen(&view), &mut out);

        // Pixel (3, 5) covers transform column 3 and bins 10..=11.
        let info = h.engine.cell_info(&view, 3, 5).unwrap();
        assert_eq!(info.min_magnitude, 3.0 / 16.0);
        assert_eq!(info.max_magnitude, 13.0 / 16.0);
        assert_eq!(info.min_phase, grid_phase(3, 11));
        assert_eq!(info.max_phase, grid_phase(3, 10));

        assert!(h.engine.cell_info(&view, -1, 5).is_none());
        assert!(h.engine.cell_info(&view, 3, -1).is_none());
        assert!(h.engine.cell_info(&view, 3, 16).is_none());

        // No viewport entry yet means no data.
        let fresh = harness(grid_params(), 512);
        assert!(fresh.engine.cell_info(&view, 3, 5).is_none());
    }

    #[test]
    fn row_frequency_range_quantizes_to_the_bin_grid() {
        let h = harness(grid_params(), 512);
        let view = grid_view(64, 16, 0, 8);

        // Bottom row: bin 1 of 32 at 8 kHz.
        assert_eq!(
            h.engine.row_frequency_range(&view, 15),
            Some((250.0, 500.0))
        );
        // Top row rounds down to bin 15 and up past bin 16.
        assert_eq!(
            h.engine.row_frequency_range(&view, 0),
            Some((3_750.0, 4_250.0))
        );
        assert_eq!(h.engine.row_frequency_range(&view, 16), None);
    }

    #[test]
    fn highlighting_reports_the_cell_under_the_cursor() {
        let mut h = harness(grid_params(), 512);
        h.engine.set_synchronous(true);
        h.set_fill(512);
        let view = grid_view(64, 16, 0, 8).with_highlight(10, 5);
        let mut out = surface(&view);

        // Pixel (10, 5) covers transform column 10 (frames 80..88) and the
        // band 2.5-3 kHz, two pixels wide and three rows tall on screen.
        let cell = PixelRect::new(10, 4, 2, 3);
        assert_eq!(h.engine.highlight_extents(&view, 10, 5), Some(cell));

        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(outcome.highlight, Some(cell));

        // A fully valid cache answers from the reuse path too.
        let outcome = h.engine.paint(&view, screen(&view), &mut out);
        assert_eq!(outcome.highlight, Some(cell));

        let plain = grid_view(64, 16, 0, 8);
        let outcome = h.engine.paint(&plain, screen(&plain), &mut out);
        assert_eq!(outcome.highlight, None);

        assert_eq!(h.engine.highlight_extents(&view, 10, -1), None);
        assert_eq!(h.engine.highlight_extents(&view, 70, 5), None);
    }

    #[test]
    fn painting_past_the_signal_end_stays_blank() {
        let mut h = harness(grid_params(), 512);
        let view = grid_view(64, 16, 10_000, 8);
        let mut out = surface(&view);

        let outcome = h.engine.paint(&view, screen(&view), &mut out);

        assert_eq!(outcome.drawn, screen(&view));
        assert!(outcome.stale.is_empty());
        assert_eq!(h.fetches(), 0);
        assert!(out.iter().all(|px| *px == [0, 0, 0, 255]));
    }
}
