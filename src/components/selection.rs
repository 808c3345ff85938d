use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::canvas::TiledImage;
use crate::components::jobs::{ArtifactId, BackgroundJob};
use crate::geometry::Rect;
use crate::notify::{Notification, NotificationSink};

/// Boundary of the selected area as axis-aligned unit-edge runs.
/// Horizontal runs are `(y_line, x0, x1)`, vertical runs `(x_line, y0, y1)`,
/// with exclusive ends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outline {
    pub horizontal: Vec<(u32, u32, u32)>,
    pub vertical: Vec<(u32, u32, u32)>,
}

impl Outline {
    pub fn is_empty(&self) -> bool {
        self.horizontal.is_empty() && self.vertical.is_empty()
    }

    /// Total boundary length in pixels.
    pub fn perimeter(&self) -> u32 {
        let h: u32 = self.horizontal.iter().map(|&(_, a, b)| b - a).sum();
        let v: u32 = self.vertical.iter().map(|&(_, a, b)| b - a).sum();
        h + v
    }
}

/// A pixel selection plus its derived artifacts.  The mask is the source
/// data; the outline and thumbnail caches are rebuilt by
/// [`UpdateOutlineJob`].
pub struct Selection {
    id: ArtifactId,
    mask: RwLock<TiledImage>,
    outline: Mutex<Option<Outline>>,
    thumbnail: Mutex<Option<RgbaImage>>,
    outline_builds: AtomicU64,
    thumbnail_builds: AtomicU64,
}

impl Selection {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            id: ArtifactId::new(),
            mask: RwLock::new(TiledImage::new(width, height)),
            outline: Mutex::new(None),
            thumbnail: Mutex::new(None),
            outline_builds: AtomicU64::new(0),
            thumbnail_builds: AtomicU64::new(0),
        }
    }

    pub fn artifact(&self) -> ArtifactId {
        self.id
    }

    /// Add `rect` to the selection.
    pub fn select_rect(&self, rect: Rect) {
        if let Ok(mut mask) = self.mask.write() {
            mask.fill_rect(rect, Rgba([255, 255, 255, 255]));
        }
    }

    /// Remove `rect` from the selection.
    pub fn deselect_rect(&self, rect: Rect) {
        if let Ok(mut mask) = self.mask.write() {
            mask.clear_rect(rect);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut mask) = self.mask.write() {
            mask.clear();
        }
    }

    pub fn is_selected(&self, x: u32, y: u32) -> bool {
        self.mask.read().map(|m| m.get_pixel(x, y)[3] > 0).unwrap_or(false)
    }

    pub fn bounds(&self) -> Rect {
        self.mask.read().map(|m| m.exact_bounds()).unwrap_or(Rect::EMPTY)
    }

    pub fn outline(&self) -> Option<Outline> {
        self.outline.lock().ok().and_then(|o| o.clone())
    }

    pub fn thumbnail(&self) -> Option<RgbaImage> {
        self.thumbnail.lock().ok().and_then(|t| t.clone())
    }

    /// How many times the outline cache has been rebuilt.
    pub fn outline_builds(&self) -> u64 {
        self.outline_builds.load(Ordering::Acquire)
    }

    /// How many times the thumbnail cache has been rebuilt.
    pub fn thumbnail_builds(&self) -> u64 {
        self.thumbnail_builds.load(Ordering::Acquire)
    }

    /// Walk the mask and collect every edge between a selected and an
    /// unselected pixel.
    pub fn recalculate_outline_cache(&self) {
        let outline = match self.mask.read() {
            Ok(mask) => trace_outline(&mask),
            Err(_) => return,
        };
        if let Ok(mut slot) = self.outline.lock() {
            *slot = Some(outline);
        }
        self.outline_builds.fetch_add(1, Ordering::AcqRel);
    }

    /// Render the mask as `selected` over `unselected`, scaled so the longest
    /// edge is at most `max_edge`.
    pub fn recalculate_thumbnail(&self, selected: Rgba<u8>, unselected: Rgba<u8>, max_edge: u32) {
        let full = match self.mask.read() {
            Ok(mask) => {
                let mut img = RgbaImage::from_pixel(mask.width(), mask.height(), unselected);
                for (cx, cy) in mask.chunk_keys().collect::<Vec<_>>() {
                    let r = mask.chunk_rect(cx, cy);
                    for y in r.top()..r.bottom() {
                        for x in r.left()..r.right() {
                            let t = mask.pixel_at(x, y)[3] as f32 / 255.0;
                            if t > 0.0 {
                                img.put_pixel(x as u32, y as u32, lerp(unselected, selected, t));
                            }
                        }
                    }
                }
                img
            }
            Err(_) => return,
        };
        let (w, h) = full.dimensions();
        let max_edge = max_edge.max(1);
        let thumb = if w.max(h) > max_edge {
            let scale = max_edge as f32 / w.max(h) as f32;
            let tw = ((w as f32 * scale).round() as u32).max(1);
            let th = ((h as f32 * scale).round() as u32).max(1);
            imageops::resize(&full, tw, th, FilterType::Triangle)
        } else {
            full
        };
        if let Ok(mut slot) = self.thumbnail.lock() {
            *slot = Some(thumb);
        }
        self.thumbnail_builds.fetch_add(1, Ordering::AcqRel);
    }

    pub fn notify_selection_changed(&self, sink: &dyn NotificationSink) {
        sink.notify(Notification::SelectionChanged { artifact: self.id });
    }
}

fn lerp(a: Rgba<u8>, b: Rgba<u8>, t: f32) -> Rgba<u8> {
    let mix = |x: u8, y: u8| (x as f32 + (y as f32 - x as f32) * t).round().clamp(0.0, 255.0) as u8;
    Rgba([mix(a[0], b[0]), mix(a[1], b[1]), mix(a[2], b[2]), mix(a[3], b[3])])
}

fn trace_outline(mask: &TiledImage) -> Outline {
    let mut outline = Outline::default();
    let bounds = mask.exact_bounds();
    if bounds.is_empty() {
        return outline;
    }
    let (w, h) = (mask.width(), mask.height());
    let sel = |x: u32, y: u32| mask.get_pixel(x, y)[3] > 0;
    let (min_x, min_y) = (bounds.left() as u32, bounds.top() as u32);
    let (max_x, max_y) = (bounds.right() as u32 - 1, bounds.bottom() as u32 - 1);

    // Horizontal edges
    for y_line in min_y..=max_y + 1 {
        let mut seg_x: Option<u32> = None;
        for x in min_x..=max_x {
            let above = y_line > 0 && y_line - 1 < h && sel(x, y_line - 1);
            let below = y_line < h && sel(x, y_line);
            let boundary = above != below;
            if boundary && seg_x.is_none() {
                seg_x = Some(x);
            } else if !boundary {
                if let Some(sx) = seg_x.take() {
                    outline.horizontal.push((y_line, sx, x));
                }
            }
        }
        if let Some(sx) = seg_x {
            outline.horizontal.push((y_line, sx, max_x + 1));
        }
    }

    // Vertical edges
    for x_line in min_x..=max_x + 1 {
        let mut seg_y: Option<u32> = None;
        for y in min_y..=max_y {
            let left = x_line > 0 && x_line - 1 < w && sel(x_line - 1, y);
            let right = x_line < w && sel(x_line, y);
            let boundary = left != right;
            if boundary && seg_y.is_none() {
                seg_y = Some(y);
            } else if !boundary {
                if let Some(sy) = seg_y.take() {
                    outline.vertical.push((x_line, sy, y));
                }
            }
        }
        if let Some(sy) = seg_y {
            outline.vertical.push((x_line, sy, max_y + 1));
        }
    }
    outline
}

// ============================================================================
// OUTLINE JOB
// ============================================================================

/// Rebuilds a selection's outline (and optionally its thumbnail), then
/// announces the change.  Any newer outline job for the same selection
/// supersedes a pending one.
pub struct UpdateOutlineJob {
    selection: Arc<Selection>,
    update_thumbnail: bool,
    mask_colors: [Rgba<u8>; 2],
    thumbnail_max_edge: u32,
}

impl UpdateOutlineJob {
    pub const KIND: &'static str = "update-outline";

    pub fn new(selection: Arc<Selection>, update_thumbnail: bool, mask_colors: [Rgba<u8>; 2]) -> Self {
        Self { selection, update_thumbnail, mask_colors, thumbnail_max_edge: 256 }
    }

    pub fn with_thumbnail_max_edge(mut self, max_edge: u32) -> Self {
        self.thumbnail_max_edge = max_edge;
        self
    }

    pub fn updates_thumbnail(&self) -> bool {
        self.update_thumbnail
    }
}

impl BackgroundJob for UpdateOutlineJob {
    fn artifact(&self) -> ArtifactId {
        self.selection.artifact()
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn overrides(&self, other: &dyn BackgroundJob) -> bool {
        other.kind() == Self::KIND
    }

    fn run(&mut self, sink: &dyn NotificationSink) {
        self.selection.recalculate_outline_cache();
        if self.update_thumbnail {
            let [selected, unselected] = self.mask_colors;
            self.selection
                .recalculate_thumbnail(selected, unselected, self.thumbnail_max_edge);
        }
        self.selection.notify_selection_changed(sink);
    }
}
