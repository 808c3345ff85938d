use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::canvas::{CHUNK_SIZE, TiledImage};
use crate::geometry::Rect;
use crate::ops::composite::{CompositeOp, blend_pixel, blend_pixel_alpha_locked};

/// Per-channel write mask.  A disabled channel keeps the destination value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelFlags {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
    pub alpha: bool,
}

impl Default for ChannelFlags {
    fn default() -> Self {
        Self::ALL
    }
}

impl ChannelFlags {
    pub const ALL: ChannelFlags = ChannelFlags { red: true, green: true, blue: true, alpha: true };

    /// Colour channels only; used when merging clip-chain members.
    pub const COLOR_ONLY: ChannelFlags = ChannelFlags { red: true, green: true, blue: true, alpha: false };

    pub fn with_alpha(self, alpha: bool) -> Self {
        Self { alpha, ..self }
    }

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    fn mask(&self, base: Rgba<u8>, blended: Rgba<u8>) -> Rgba<u8> {
        Rgba([
            if self.red { blended[0] } else { base[0] },
            if self.green { blended[1] } else { base[1] },
            if self.blue { blended[2] } else { base[2] },
            if self.alpha { blended[3] } else { base[3] },
        ])
    }
}

/// Region-bounded compositing onto a destination image.
///
/// Mirrors a paint-device painter: configure operator, opacity and channel
/// flags, then `bit_blt` source regions onto the destination.
pub struct Painter<'a> {
    dst: &'a mut TiledImage,
    op: CompositeOp,
    opacity: f32,
    flags: ChannelFlags,
}

impl<'a> Painter<'a> {
    pub fn new(dst: &'a mut TiledImage) -> Self {
        Self {
            dst,
            op: CompositeOp::Normal,
            opacity: 1.0,
            flags: ChannelFlags::ALL,
        }
    }

    pub fn set_composite_op(&mut self, op: CompositeOp) -> &mut Self {
        self.op = op;
        self
    }

    pub fn set_opacity(&mut self, opacity: f32) -> &mut Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn set_channel_flags(&mut self, flags: ChannelFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    #[inline]
    fn blend(&self, base: Rgba<u8>, top: Rgba<u8>) -> Rgba<u8> {
        if self.flags.alpha {
            let out = blend_pixel(base, top, self.op, self.opacity);
            if self.flags.is_all() { out } else { self.flags.mask(base, out) }
        } else {
            let out = blend_pixel_alpha_locked(base, top, self.op, self.opacity);
            self.flags.mask(base, out)
        }
    }

    /// Composite `src` onto the destination over `rect` (same coordinates in
    /// both images).  Chunks are blended in parallel, then written back.
    pub fn bit_blt(&mut self, rect: Rect, src: &TiledImage) {
        let rect = rect.intersect(&self.dst.bounds());
        if rect.is_empty() {
            return;
        }

        // Non-coverage operators leave the destination alone wherever the
        // source has no chunk; coverage operators must visit every pixel.
        let keys: Vec<(u32, u32)> = if self.op.is_full_coverage() {
            self.dst.chunks_in(rect)
        } else {
            src.chunks_in(rect)
                .into_iter()
                .filter(|&(cx, cy)| src.get_chunk(cx, cy).is_some())
                .collect()
        };

        let dst: &TiledImage = &*self.dst;
        let this = &*self;
        let chunk_results: Vec<_> = keys
            .par_iter()
            .map(|&(cx, cy)| {
                let part = rect.intersect(&dst.chunk_rect(cx, cy));
                let base_x = (cx * CHUNK_SIZE) as i32;
                let base_y = (cy * CHUNK_SIZE) as i32;
                let mut chunk = dst
                    .get_chunk(cx, cy)
                    .cloned()
                    .unwrap_or_else(|| RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE));
                for y in part.top()..part.bottom() {
                    for x in part.left()..part.right() {
                        let (lx, ly) = ((x - base_x) as u32, (y - base_y) as u32);
                        let base = *chunk.get_pixel(lx, ly);
                        let top = src.pixel_at(x, y);
                        chunk.put_pixel(lx, ly, this.blend(base, top));
                    }
                }
                let empty = chunk.pixels().all(|p| p[3] == 0);
                (cx, cy, if empty { None } else { Some(chunk) })
            })
            .collect();

        for (cx, cy, chunk) in chunk_results {
            self.dst.set_chunk(cx, cy, chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    #[test]
    fn normal_blit_stays_inside_rect() {
        let mut src = TiledImage::new(100, 100);
        src.fill_rect(src.bounds(), BLUE);
        let mut dst = TiledImage::new(100, 100);
        dst.fill_rect(dst.bounds(), RED);

        Painter::new(&mut dst).bit_blt(Rect::new(10, 10, 70, 5), &src);
        assert_eq!(dst.get_pixel(10, 10), &BLUE);
        assert_eq!(dst.get_pixel(79, 14), &BLUE);
        assert_eq!(dst.get_pixel(80, 14), &RED);
        assert_eq!(dst.get_pixel(10, 15), &RED);
    }

    #[test]
    fn destination_in_erases_uncovered_pixels() {
        let mut src = TiledImage::new(100, 100);
        src.fill_rect(Rect::new(0, 0, 10, 10), BLUE);
        let mut dst = TiledImage::new(100, 100);
        let all = dst.bounds();
        dst.fill_rect(all, RED);

        Painter::new(&mut dst)
            .set_composite_op(CompositeOp::DestinationIn)
            .bit_blt(all, &src);
        assert_eq!(dst.get_pixel(5, 5), &RED);
        assert_eq!(dst.get_pixel(50, 50)[3], 0);
        // Chunks that became fully transparent are released.
        assert_eq!(dst.chunk_count(), 1);
    }

    #[test]
    fn channel_flags_protect_disabled_channels() {
        let mut src = TiledImage::new(4, 4);
        src.fill_rect(src.bounds(), Rgba([10, 20, 30, 255]));
        let mut dst = TiledImage::new(4, 4);
        dst.fill_rect(dst.bounds(), Rgba([200, 200, 200, 255]));

        Painter::new(&mut dst)
            .set_channel_flags(ChannelFlags { red: false, ..ChannelFlags::ALL })
            .bit_blt(Rect::new(0, 0, 4, 4), &src);
        assert_eq!(dst.get_pixel(0, 0), &Rgba([200, 20, 30, 255]));
    }

    #[test]
    fn alpha_locked_blit_keeps_destination_coverage() {
        let mut src = TiledImage::new(4, 4);
        src.fill_rect(src.bounds(), BLUE);
        let mut dst = TiledImage::new(4, 4);
        dst.put_pixel(1, 1, RED);

        Painter::new(&mut dst)
            .set_channel_flags(ChannelFlags::COLOR_ONLY)
            .bit_blt(Rect::new(0, 0, 4, 4), &src);
        assert_eq!(dst.get_pixel(1, 1), &BLUE);
        assert_eq!(dst.get_pixel(0, 0)[3], 0);
    }
}
