//! Integer pixel rectangles.
//!
//! Dirty regions, extents and composite areas are all expressed as
//! `Rect`s in document pixel space.  Right and bottom edges are exclusive.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect { x: 0, y: 0, w: 0, h: 0 };

    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Rectangle anchored at the origin.
    pub const fn from_size(w: u32, h: u32) -> Self {
        Self { x: 0, y: 0, w: w as i32, h: h as i32 }
    }

    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { x: left, y: top, w: right - left, h: bottom - top }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn left(&self) -> i32 { self.x }
    pub fn top(&self) -> i32 { self.y }
    pub fn right(&self) -> i32 { self.x + self.w }
    pub fn bottom(&self) -> i32 { self.y + self.h }

    pub fn area(&self) -> i64 {
        if self.is_empty() { 0 } else { self.w as i64 * self.h as i64 }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.left() && x < self.right() && y >= self.top() && y < self.bottom()
    }

    /// `other` lies entirely inside `self`.  The empty rect is contained everywhere.
    pub fn contains(&self, other: &Rect) -> bool {
        other.is_empty()
            || (other.left() >= self.left()
                && other.top() >= self.top()
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let l = self.left().max(other.left());
        let t = self.top().max(other.top());
        let r = self.right().min(other.right());
        let b = self.bottom().min(other.bottom());
        if l >= r || t >= b {
            Rect::EMPTY
        } else {
            Rect::from_edges(l, t, r, b)
        }
    }

    /// Bounding box of both rects.  Empty operands are ignored.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_edges(
            self.left().min(other.left()),
            self.top().min(other.top()),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Grow (or shrink, for negative `n`) on every side.
    pub fn grow(&self, n: i32) -> Rect {
        if self.is_empty() {
            return *self;
        }
        Rect::new(self.x - n, self.y - n, self.w + 2 * n, self.h + 2 * n)
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.w, self.h)
    }

    /// `self − other` as at most four disjoint bands (top, bottom, left, right).
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let cut = self.intersect(other);
        if cut.is_empty() {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        }
        let mut out = Vec::with_capacity(4);
        if cut.top() > self.top() {
            out.push(Rect::from_edges(self.left(), self.top(), self.right(), cut.top()));
        }
        if cut.bottom() < self.bottom() {
            out.push(Rect::from_edges(self.left(), cut.bottom(), self.right(), self.bottom()));
        }
        if cut.left() > self.left() {
            out.push(Rect::from_edges(self.left(), cut.top(), cut.left(), cut.bottom()));
        }
        if cut.right() < self.right() {
            out.push(Rect::from_edges(cut.right(), cut.top(), self.right(), cut.bottom()));
        }
        out
    }

    /// Clamp to `[0, width) × [0, height)` and return unsigned edges
    /// `(min_x, min_y, max_x, max_y)`, or `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let r = self.intersect(&Rect::from_size(width, height));
        if r.is_empty() {
            None
        } else {
            Some((r.left() as u32, r.top() as u32, r.right() as u32, r.bottom() as u32))
        }
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.w, self.h, self.x, self.y)
    }
}
