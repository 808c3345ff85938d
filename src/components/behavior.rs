use image::Rgba;
use rayon::prelude::*;

use crate::canvas::TiledImage;
use crate::components::layers::NodeKind;
use crate::geometry::Rect;

// ============================================================================
// REGION RULES — per-kind behaviour table
// ============================================================================

/// How a node kind maps regions between its input and its output.
pub struct Behavior {
    /// Source region needed to produce `rect` of the projection.
    pub need_rect: fn(&NodeKind, Rect) -> Rect,
    /// Output region affected when `rect` of the input changes.
    pub change_rect: fn(&NodeKind, Rect) -> Rect,
    /// Region read (including neighbourhood samples) when producing `rect`.
    pub access_rect: fn(&NodeKind, Rect) -> Rect,
    /// `need_rect` expressed in the original's own pixel coordinates.
    pub need_rect_for_original: fn(&NodeKind, Rect) -> Rect,
}

fn identity(_: &NodeKind, rect: Rect) -> Rect {
    rect
}

fn nothing(_: &NodeKind, _: Rect) -> Rect {
    Rect::EMPTY
}

fn blur_margin(kind: &NodeKind, rect: Rect) -> Rect {
    match kind {
        NodeKind::Filtered { radius, .. } => rect.grow(*radius as i32),
        _ => rect,
    }
}

fn unshift(kind: &NodeKind, rect: Rect) -> Rect {
    match kind {
        NodeKind::Paint { offset, .. } | NodeKind::Clone { offset, .. } => rect.translate(-offset.0, -offset.1),
        _ => rect,
    }
}

static PAINT: Behavior = Behavior {
    need_rect: identity,
    change_rect: identity,
    access_rect: identity,
    need_rect_for_original: unshift,
};

static GROUP: Behavior = Behavior {
    need_rect: identity,
    change_rect: identity,
    access_rect: identity,
    need_rect_for_original: identity,
};

static FILTERED: Behavior = Behavior {
    need_rect: blur_margin,
    change_rect: blur_margin,
    access_rect: blur_margin,
    need_rect_for_original: blur_margin,
};

// A generator reads nothing.
static FILL: Behavior = Behavior {
    need_rect: nothing,
    change_rect: identity,
    access_rect: nothing,
    need_rect_for_original: nothing,
};

static CLONE: Behavior = Behavior {
    need_rect: unshift,
    change_rect: identity,
    access_rect: unshift,
    need_rect_for_original: unshift,
};

pub fn behavior_of(kind: &NodeKind) -> &'static Behavior {
    match kind {
        NodeKind::Paint { .. } => &PAINT,
        NodeKind::Group => &GROUP,
        NodeKind::Filtered { .. } => &FILTERED,
        NodeKind::Fill { .. } => &FILL,
        NodeKind::Clone { .. } => &CLONE,
    }
}

// ============================================================================
// CONTENT GENERATION
// ============================================================================

/// Write a box blur of `src` into `dst` over `rect`.  Averages premultiplied
/// colour over the `(2r+1)²` window; samples outside `src` count as
/// transparent.  Rows are computed in parallel.
pub fn box_blur_region(src: &TiledImage, dst: &mut TiledImage, rect: Rect, radius: u32) {
    let rect = rect.intersect(&dst.bounds());
    if rect.is_empty() {
        return;
    }
    if radius == 0 {
        dst.copy_region_from(src, rect);
        return;
    }
    let r = radius as i32;
    let window = ((2 * r + 1) * (2 * r + 1)) as u32;
    let rows: Vec<Vec<Rgba<u8>>> = (rect.top()..rect.bottom())
        .into_par_iter()
        .map(|y| {
            (rect.left()..rect.right())
                .map(|x| {
                    let mut acc = [0u32; 4];
                    for sy in (y - r)..=(y + r) {
                        for sx in (x - r)..=(x + r) {
                            let p = src.pixel_at(sx, sy);
                            let a = p[3] as u32;
                            acc[0] += p[0] as u32 * a;
                            acc[1] += p[1] as u32 * a;
                            acc[2] += p[2] as u32 * a;
                            acc[3] += a;
                        }
                    }
                    if acc[3] == 0 {
                        return Rgba([0, 0, 0, 0]);
                    }
                    let unpremul = |c: u32| ((c + acc[3] / 2) / acc[3]).min(255) as u8;
                    let alpha = ((acc[3] + window / 2) / window).min(255) as u8;
                    Rgba([unpremul(acc[0]), unpremul(acc[1]), unpremul(acc[2]), alpha])
                })
                .collect()
        })
        .collect();

    dst.clear_rect(rect);
    for (row, y) in rows.into_iter().zip(rect.top()..) {
        for (px, x) in row.into_iter().zip(rect.left()..) {
            dst.put_pixel(x as u32, y as u32, px);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_rules_grow_by_radius() {
        let kind = NodeKind::Filtered { original: TiledImage::new(8, 8), radius: 2 };
        let b = behavior_of(&kind);
        let r = Rect::new(10, 10, 4, 4);
        assert_eq!((b.need_rect)(&kind, r), Rect::new(8, 8, 8, 8));
        assert_eq!((b.change_rect)(&kind, r), Rect::new(8, 8, 8, 8));
    }

    #[test]
    fn paint_original_rect_undoes_offset() {
        let kind = NodeKind::Paint { original: TiledImage::new(8, 8), offset: (3, -2) };
        let b = behavior_of(&kind);
        assert_eq!((b.need_rect_for_original)(&kind, Rect::new(3, 0, 1, 1)), Rect::new(0, 2, 1, 1));
        assert_eq!((b.need_rect)(&kind, Rect::new(3, 0, 1, 1)), Rect::new(3, 0, 1, 1));
    }

    #[test]
    fn fill_needs_no_input() {
        let kind = NodeKind::Fill { color: Rgba([1, 2, 3, 255]) };
        assert!((behavior_of(&kind).need_rect)(&kind, Rect::new(0, 0, 5, 5)).is_empty());
    }

    #[test]
    fn blur_spreads_coverage() {
        let mut src = TiledImage::new(16, 16);
        src.put_pixel(8, 8, Rgba([90, 90, 90, 255]));
        let mut dst = TiledImage::new(16, 16);
        let all = dst.bounds();
        box_blur_region(&src, &mut dst, all, 1);
        assert_eq!(dst.get_pixel(7, 7), &Rgba([90, 90, 90, 28]));
        assert_eq!(dst.get_pixel(9, 9)[3], 28);
        assert_eq!(dst.get_pixel(10, 10)[3], 0);
    }
}
