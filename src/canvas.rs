use std::sync::Arc;

use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::geometry::Rect;

// ============================================================================
// TILED IMAGE – sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;

/// A pixel with zero alpha, returned by reference for missing chunks.
static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Sparse tiled image backed by a flat `Vec<Option<Arc<RgbaImage>>>`.
/// Chunk coordinates are mapped to a flat index via `cy * chunks_per_row + cx`,
/// giving O(1) access with zero hashing overhead.
///
/// Chunks are wrapped in `Arc` for copy-on-write semantics: `clone()` only
/// bumps reference counts, and mutations via `put_pixel` / `ensure_chunk_mut`
/// use `Arc::make_mut` to COW-clone only the touched chunk.  Projections,
/// scratch copies and undo patches all lean on this to stay cheap.
#[derive(Clone)]
pub struct TiledImage {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl std::fmt::Debug for TiledImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

impl TiledImage {
    // ---- construction -------------------------------------------------------

    /// Create an empty (fully transparent) tiled image.
    pub fn new(width: u32, height: u32) -> Self {
        // Sanity: clamp dimensions to prevent overflow (max ~256 megapixels)
        let (width, height) = {
            let total = (width as u64) * (height as u64);
            if total > 256_000_000 || width == 0 || height == 0 {
                crate::log_warn!("TiledImage::new: dimensions {}×{} rejected, clamped to 1×1", width, height);
                (1, 1)
            } else {
                (width, height)
            }
        };
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        let total = (chunks_per_row * chunks_per_col) as usize;
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; total],
        }
    }

    /// Flatten into a dense `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        for (cx, cy) in self.chunk_keys().collect::<Vec<_>>() {
            let Some(chunk) = self.get_chunk(cx, cy) else { continue };
            let base_x = cx * CHUNK_SIZE;
            let base_y = cy * CHUNK_SIZE;
            let cw = CHUNK_SIZE.min(self.width - base_x);
            let ch = CHUNK_SIZE.min(self.height - base_y);
            for ly in 0..ch {
                for lx in 0..cw {
                    out.put_pixel(base_x + lx, base_y + ly, *chunk.get_pixel(lx, ly));
                }
            }
        }
        out
    }

    // ---- indexing helpers ----------------------------------------------------

    #[inline(always)]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    #[inline(always)]
    fn chunk_coord(x: u32, y: u32) -> (u32, u32) { (x / CHUNK_SIZE, y / CHUNK_SIZE) }

    #[inline(always)]
    fn local(x: u32, y: u32) -> (u32, u32) { (x % CHUNK_SIZE, y % CHUNK_SIZE) }

    /// Pixel rectangle covered by chunk `(cx, cy)`, clipped to the image.
    pub fn chunk_rect(&self, cx: u32, cy: u32) -> Rect {
        let base_x = cx * CHUNK_SIZE;
        let base_y = cy * CHUNK_SIZE;
        Rect::new(
            base_x as i32,
            base_y as i32,
            CHUNK_SIZE.min(self.width.saturating_sub(base_x)) as i32,
            CHUNK_SIZE.min(self.height.saturating_sub(base_y)) as i32,
        )
    }

    /// Chunk coordinates whose pixels intersect `rect`.
    pub fn chunks_in(&self, rect: Rect) -> Vec<(u32, u32)> {
        let Some((min_x, min_y, max_x, max_y)) = rect.clamp_to(self.width, self.height) else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        for cy in (min_y / CHUNK_SIZE)..max_y.div_ceil(CHUNK_SIZE) {
            for cx in (min_x / CHUNK_SIZE)..max_x.div_ceil(CHUNK_SIZE) {
                keys.push((cx, cy));
            }
        }
        keys
    }

    // ---- pixel access -------------------------------------------------------

    /// Read a pixel (returns `&TRANSPARENT_PIXEL` for missing chunks).
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height { return &TRANSPARENT_PIXEL; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        self.chunks[idx].as_ref()
            .map(|c| c.get_pixel(lx, ly))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    /// Signed-coordinate read; anything outside the image is transparent.
    #[inline]
    pub fn pixel_at(&self, x: i32, y: i32) -> Rgba<u8> {
        if x < 0 || y < 0 {
            return TRANSPARENT_PIXEL;
        }
        *self.get_pixel(x as u32, y as u32)
    }

    /// Write a pixel (creates the chunk on demand, COW-clones if shared).
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x >= self.width || y >= self.height { return; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        if pixel[3] == 0 && self.chunks[idx].is_none() {
            return;
        }
        let arc = self.chunks[idx]
            .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc).put_pixel(lx, ly, pixel);
    }

    /// Read-only access to a chunk (if it exists).
    pub fn get_chunk(&self, cx: u32, cy: u32) -> Option<&RgbaImage> {
        let idx = self.flat_index(cx, cy);
        self.chunks.get(idx).and_then(|c| c.as_deref())
    }

    /// Get or create a chunk, returning a mutable reference (COW-safe).
    pub fn ensure_chunk_mut(&mut self, cx: u32, cy: u32) -> &mut RgbaImage {
        let idx = self.flat_index(cx, cy);
        let arc = self.chunks[idx]
            .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc)
    }

    /// Place a fully-built chunk at the given chunk coordinate.
    pub fn set_chunk(&mut self, cx: u32, cy: u32, chunk: Option<RgbaImage>) {
        let idx = self.flat_index(cx, cy);
        if idx < self.chunks.len() {
            self.chunks[idx] = chunk.map(Arc::new);
        }
    }

    /// Iterator over populated chunk coordinates.
    pub fn chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let cpr = self.chunks_per_row;
        self.chunks.iter().enumerate().filter_map(move |(i, slot)| {
            if slot.is_some() {
                Some(((i as u32) % cpr, (i as u32) / cpr))
            } else {
                None
            }
        })
    }

    /// Number of populated chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    // ---- geometry -----------------------------------------------------------

    pub fn width(&self) -> u32 { self.width }

    pub fn height(&self) -> u32 { self.height }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    /// Bounding box of all allocated chunks, clipped to the image.  This is a
    /// cheap, conservative answer: pixels outside it are guaranteed transparent.
    pub fn extent(&self) -> Rect {
        self.chunk_keys()
            .map(|(cx, cy)| self.chunk_rect(cx, cy))
            .fold(Rect::EMPTY, |acc, r| acc.union(&r))
    }

    /// Tight bounding box of non-transparent pixels.
    pub fn exact_bounds(&self) -> Rect {
        let mut bounds = Rect::EMPTY;
        for (cx, cy) in self.chunk_keys() {
            let Some(chunk) = self.get_chunk(cx, cy) else { continue };
            let r = self.chunk_rect(cx, cy);
            for ly in 0..r.h as u32 {
                for lx in 0..r.w as u32 {
                    if chunk.get_pixel(lx, ly)[3] > 0 {
                        bounds = bounds.union(&Rect::new(r.x + lx as i32, r.y + ly as i32, 1, 1));
                    }
                }
            }
        }
        bounds
    }

    /// True when no pixel inside `rect` has any coverage.
    pub fn is_transparent_in(&self, rect: Rect) -> bool {
        let area = rect.intersect(&self.extent());
        if area.is_empty() {
            return true;
        }
        for y in area.top()..area.bottom() {
            for x in area.left()..area.right() {
                if self.pixel_at(x, y)[3] > 0 {
                    return false;
                }
            }
        }
        true
    }

    // ---- bulk operations ----------------------------------------------------

    pub fn fill_rect(&mut self, rect: Rect, color: Rgba<u8>) {
        let Some((min_x, min_y, max_x, max_y)) = rect.clamp_to(self.width, self.height) else {
            return;
        };
        for y in min_y..max_y {
            for x in min_x..max_x {
                self.put_pixel(x, y, color);
            }
        }
    }

    /// Make every pixel inside `rect` transparent.  Chunks fully covered by
    /// the rect are dropped outright.
    pub fn clear_rect(&mut self, rect: Rect) {
        for (cx, cy) in self.chunks_in(rect) {
            let idx = self.flat_index(cx, cy);
            if self.chunks[idx].is_none() {
                continue;
            }
            let chunk_rect = self.chunk_rect(cx, cy);
            if rect.contains(&chunk_rect) {
                self.chunks[idx] = None;
                continue;
            }
            let part = rect.intersect(&chunk_rect);
            let chunk = self.ensure_chunk_mut(cx, cy);
            for y in part.top()..part.bottom() {
                for x in part.left()..part.right() {
                    let (lx, ly) = Self::local(x as u32, y as u32);
                    chunk.put_pixel(lx, ly, TRANSPARENT_PIXEL);
                }
            }
        }
    }

    /// Drop all chunks (make the image fully transparent).
    pub fn clear(&mut self) {
        for slot in &mut self.chunks {
            *slot = None;
        }
    }

    /// Replace the pixels of `rect` with `src`'s.  Whole chunks are shared
    /// rather than copied when both images use the same chunk grid.
    pub fn copy_region_from(&mut self, src: &TiledImage, rect: Rect) {
        self.copy_region_translated(src, rect, 0, 0);
    }

    /// Replace the pixels of `rect` with `src` shifted by `(dx, dy)`:
    /// `self[x, y] = src[x - dx, y - dy]`.
    pub fn copy_region_translated(&mut self, src: &TiledImage, rect: Rect, dx: i32, dy: i32) {
        let same_grid = dx == 0
            && dy == 0
            && src.width == self.width
            && src.height == self.height;
        for (cx, cy) in self.chunks_in(rect) {
            let chunk_rect = self.chunk_rect(cx, cy);
            let idx = self.flat_index(cx, cy);
            if same_grid && rect.contains(&chunk_rect) {
                self.chunks[idx] = src.chunks[idx].clone();
                continue;
            }
            let part = rect.intersect(&chunk_rect);
            for y in part.top()..part.bottom() {
                for x in part.left()..part.right() {
                    let px = src.pixel_at(x - dx, y - dy);
                    if px[3] == 0 && self.chunks[idx].is_none() {
                        continue;
                    }
                    let (lx, ly) = Self::local(x as u32, y as u32);
                    self.ensure_chunk_mut(cx, cy).put_pixel(lx, ly, px);
                }
            }
        }
    }

    /// Pixels of `rect` in row-major order (outside pixels read transparent).
    pub fn region_pixels(&self, rect: Rect) -> Vec<Rgba<u8>> {
        if rect.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(rect.area() as usize);
        for y in rect.top()..rect.bottom() {
            for x in rect.left()..rect.right() {
                out.push(self.pixel_at(x, y));
            }
        }
        out
    }

    /// Approximate memory usage in bytes.
    /// Shared (COW) chunks are counted at minimal cost (Arc pointer only)
    /// since their pixel data is shared with projections or undo patches.
    pub fn memory_bytes(&self) -> usize {
        let chunk_byte_size = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;
        self.chunks.iter()
            .filter_map(|c| c.as_ref())
            .map(|arc| {
                if Arc::strong_count(arc) == 1 {
                    chunk_byte_size
                } else {
                    std::mem::size_of::<usize>() * 2
                }
            })
            .sum()
    }

    /// Binarize coverage inside `rect` according to `mode`.  Chunks are
    /// processed in parallel.
    pub fn threshold_opacity(&mut self, rect: Rect, mode: ThresholdMode) {
        if mode == ThresholdMode::None {
            return;
        }
        let cpr = self.chunks_per_row;
        let (width, height) = (self.width, self.height);
        self.chunks.par_iter_mut().enumerate().for_each(|(i, slot)| {
            let Some(arc) = slot.as_mut() else { return };
            let (cx, cy) = ((i as u32) % cpr, (i as u32) / cpr);
            let base_x = (cx * CHUNK_SIZE) as i32;
            let base_y = (cy * CHUNK_SIZE) as i32;
            let chunk_rect = Rect::new(
                base_x,
                base_y,
                CHUNK_SIZE.min(width - cx * CHUNK_SIZE) as i32,
                CHUNK_SIZE.min(height - cy * CHUNK_SIZE) as i32,
            );
            let part = rect.intersect(&chunk_rect);
            if part.is_empty() {
                return;
            }
            let chunk = Arc::make_mut(arc);
            for y in part.top()..part.bottom() {
                for x in part.left()..part.right() {
                    let px = chunk.get_pixel_mut((x - base_x) as u32, (y - base_y) as u32);
                    px[3] = mode.apply(px[3]);
                }
            }
        });
    }
}

/// How `applyMaxOutAlpha` binarizes coverage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThresholdMode {
    /// Leave coverage untouched.
    #[default]
    None,
    /// Anything not fully opaque becomes transparent.
    Floor,
    /// Any coverage at all becomes fully opaque.
    Ceil,
    /// Coverage at or above the cutoff becomes opaque, the rest transparent.
    Cutoff(u8),
}

impl ThresholdMode {
    #[inline]
    pub fn apply(self, alpha: u8) -> u8 {
        match self {
            ThresholdMode::None => alpha,
            ThresholdMode::Floor => if alpha == 255 { 255 } else { 0 },
            ThresholdMode::Ceil => if alpha > 0 { 255 } else { 0 },
            ThresholdMode::Cutoff(c) => if alpha >= c && alpha > 0 { 255 } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    #[test]
    fn empty_image_has_no_extent() {
        let img = TiledImage::new(200, 100);
        assert!(img.extent().is_empty());
        assert!(img.exact_bounds().is_empty());
        assert_eq!(img.chunk_count(), 0);
    }

    #[test]
    fn extent_is_chunk_aligned_and_exact_bounds_tight() {
        let mut img = TiledImage::new(200, 100);
        img.fill_rect(Rect::new(70, 10, 5, 5), RED);
        assert_eq!(img.extent(), Rect::new(64, 0, 64, 64));
        assert_eq!(img.exact_bounds(), Rect::new(70, 10, 5, 5));
        assert!(!img.is_transparent_in(Rect::new(72, 12, 1, 1)));
        assert!(img.is_transparent_in(Rect::new(0, 0, 60, 60)));
    }

    #[test]
    fn clear_rect_is_pixel_exact() {
        let mut img = TiledImage::new(128, 128);
        img.fill_rect(img.bounds(), RED);
        img.clear_rect(Rect::new(0, 0, 64, 64));
        img.clear_rect(Rect::new(64, 64, 10, 10));
        assert_eq!(img.chunk_count(), 3);
        assert_eq!(img.get_pixel(74, 74), &RED);
        assert_eq!(img.get_pixel(70, 70)[3], 0);
    }

    #[test]
    fn region_copy_shares_whole_chunks() {
        let mut src = TiledImage::new(128, 64);
        src.fill_rect(src.bounds(), RED);
        let mut dst = TiledImage::new(128, 64);
        dst.copy_region_from(&src, Rect::new(0, 0, 64, 64));
        assert_eq!(dst.get_pixel(10, 10), &RED);
        assert_eq!(dst.get_pixel(100, 10)[3], 0);
        // Shared chunk: the source now reports pointer-only cost for it.
        assert!(src.memory_bytes() < 2 * (CHUNK_SIZE * CHUNK_SIZE * 4) as usize);
    }

    #[test]
    fn translated_copy_shifts_content() {
        let mut src = TiledImage::new(32, 32);
        src.put_pixel(1, 1, RED);
        let mut dst = TiledImage::new(32, 32);
        dst.copy_region_translated(&src, dst.bounds(), 5, 3);
        assert_eq!(dst.get_pixel(6, 4), &RED);
        assert_eq!(dst.get_pixel(1, 1)[3], 0);
    }

    #[test]
    fn threshold_modes() {
        let mut img = TiledImage::new(4, 1);
        img.put_pixel(0, 0, Rgba([1, 2, 3, 10]));
        img.put_pixel(1, 0, Rgba([1, 2, 3, 200]));
        img.put_pixel(2, 0, Rgba([1, 2, 3, 255]));
        let mut cut = img.clone();
        cut.threshold_opacity(cut.bounds(), ThresholdMode::Cutoff(128));
        assert_eq!(cut.get_pixel(0, 0)[3], 0);
        assert_eq!(cut.get_pixel(1, 0)[3], 255);
        let mut ceil = img.clone();
        ceil.threshold_opacity(Rect::new(0, 0, 1, 1), ThresholdMode::Ceil);
        assert_eq!(ceil.get_pixel(0, 0)[3], 255);
        assert_eq!(ceil.get_pixel(1, 0)[3], 200);
        // Original untouched thanks to copy-on-write.
        assert_eq!(img.get_pixel(0, 0)[3], 10);
        assert_eq!(ThresholdMode::Floor.apply(254), 0);
    }
}
