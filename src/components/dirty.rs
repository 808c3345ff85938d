use crate::geometry::Rect;

/// Above this many rectangles the region collapses into its bounding box.
const MAX_RECTS: usize = 16;

/// A set of stale rectangles.  Rectangles never overlap each other; adding
/// a rectangle that touches existing ones keeps only the uncovered parts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtyRegion {
    rects: Vec<Rect>,
}

impl DirtyRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add(rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn bounds(&self) -> Rect {
        self.rects.iter().fold(Rect::EMPTY, |acc, r| acc.union(r))
    }

    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        if self.rects.iter().any(|r| r.contains(&rect)) {
            return;
        }
        self.rects.retain(|r| !rect.contains(r));
        // Only the parts not already covered are kept.
        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces
                .into_iter()
                .flat_map(|p| p.subtract(existing))
                .collect();
        }
        self.rects.extend(pieces);
        if self.rects.len() > MAX_RECTS {
            let bounds = self.bounds();
            self.rects.clear();
            self.rects.push(bounds);
        }
    }

    /// Mark `rect` as clean.
    pub fn remove(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        self.rects = self
            .rects
            .iter()
            .flat_map(|r| r.subtract(&rect))
            .collect();
    }

    pub fn intersects(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    /// Bounding box of the stale parts inside `rect`.
    pub fn bounds_within(&self, rect: &Rect) -> Rect {
        self.rects
            .iter()
            .map(|r| r.intersect(rect))
            .fold(Rect::EMPTY, |acc, r| acc.union(&r))
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }
}
