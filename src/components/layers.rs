use std::collections::HashSet;

use image::Rgba;
use serde::{Deserialize, Serialize};

use crate::canvas::TiledImage;
use crate::components::dirty::DirtyRegion;
use crate::error::{EngineError, EngineResult};
use crate::geometry::Rect;
use crate::ops::composite::CompositeOp;
use crate::pool::ScratchPool;
use crate::settings::EngineSettings;

pub use crate::ops::painter::ChannelFlags;

// ============================================================================
// LAYER IDS & KINDS
// ============================================================================

/// Index of a node in the [`LayerTree`] arena.  Slots are never reused, so an
/// id stays meaningful after the node is detached (history relies on this).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(u32);

impl LayerId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a node renders.  The projection of every kind is produced by
/// `LayerTree::recalculate`; region rules live in `components::behavior`.
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// Raster pixels, shown translated by `offset`.
    Paint { original: TiledImage, offset: (i32, i32) },
    /// Composite of the visible children.
    Group,
    /// Raster pixels seen through a box blur of `radius`.
    Filtered { original: TiledImage, radius: u32 },
    /// Solid colour covering the whole document.
    Fill { color: Rgba<u8> },
    /// Another node's projection, translated by `offset`.
    Clone { source: LayerId, offset: (i32, i32) },
}

impl NodeKind {
    pub fn paint(width: u32, height: u32) -> Self {
        NodeKind::Paint { original: TiledImage::new(width, height), offset: (0, 0) }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Paint { .. } => "paint",
            NodeKind::Group => "group",
            NodeKind::Filtered { .. } => "filtered",
            NodeKind::Fill { .. } => "fill",
            NodeKind::Clone { .. } => "clone",
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, NodeKind::Group)
    }
}

// ============================================================================
// LAYER NODE
// ============================================================================

pub struct LayerNode {
    pub name: String,
    pub kind: NodeKind,
    pub composite_op: CompositeOp,
    pub opacity: f32,
    pub channel_flags: ChannelFlags,
    /// Clip source: merged only as part of the clip chain of the layer below.
    pub alpha_disabled: bool,
    pub visible: bool,
    pub(crate) projection: Option<TiledImage>,
    pub(crate) stale: DirtyRegion,
    parent: Option<LayerId>,
    first_child: Option<LayerId>,
    last_child: Option<LayerId>,
    prev_sibling: Option<LayerId>,
    next_sibling: Option<LayerId>,
}

impl LayerNode {
    fn new(name: String, kind: NodeKind, bounds: Rect) -> Self {
        Self {
            name,
            kind,
            composite_op: CompositeOp::Normal,
            opacity: 1.0,
            channel_flags: ChannelFlags::ALL,
            alpha_disabled: false,
            visible: true,
            projection: None,
            stale: DirtyRegion::from_rect(bounds),
            parent: None,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
        }
    }

    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }

    /// The layer directly above this one.
    pub fn next_sibling(&self) -> Option<LayerId> {
        self.next_sibling
    }

    /// The layer directly below this one.
    pub fn prev_sibling(&self) -> Option<LayerId> {
        self.prev_sibling
    }

    pub fn first_child(&self) -> Option<LayerId> {
        self.first_child
    }

    pub fn last_child(&self) -> Option<LayerId> {
        self.last_child
    }

    pub fn projection(&self) -> Option<&TiledImage> {
        self.projection.as_ref()
    }

    /// Regions whose projection has not been recomputed since they changed.
    pub fn stale(&self) -> &DirtyRegion {
        &self.stale
    }
}

// ============================================================================
// LAYER TREE — arena with index-based topology
// ============================================================================

/// All nodes of one document.  Children are ordered bottom to top: the first
/// child is painted first and `next_sibling` is the layer stacked above.
pub struct LayerTree {
    width: u32,
    height: u32,
    nodes: Vec<LayerNode>,
    root: LayerId,
    settings: EngineSettings,
    pub(crate) pool: ScratchPool,
}

impl LayerTree {
    pub fn new(width: u32, height: u32, settings: EngineSettings) -> Self {
        let bounds = TiledImage::new(width, height).bounds();
        let root = LayerNode::new("root".to_string(), NodeKind::Group, bounds);
        let pool = ScratchPool::new(settings.scratch_pool_capacity);
        Self {
            width: bounds.w as u32,
            height: bounds.h as u32,
            nodes: vec![root],
            root: LayerId(0),
            settings,
            pool,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    pub fn root(&self) -> LayerId {
        self.root
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn pool(&self) -> &ScratchPool {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: LayerId) -> bool {
        id.index() < self.nodes.len()
    }

    pub fn node(&self, id: LayerId) -> Option<&LayerNode> {
        self.nodes.get(id.index())
    }

    pub(crate) fn node_mut(&mut self, id: LayerId) -> Option<&mut LayerNode> {
        self.nodes.get_mut(id.index())
    }

    fn get(&self, id: LayerId) -> EngineResult<&LayerNode> {
        self.node(id).ok_or(EngineError::UnknownLayer(id))
    }

    fn get_mut(&mut self, id: LayerId) -> EngineResult<&mut LayerNode> {
        self.node_mut(id).ok_or(EngineError::UnknownLayer(id))
    }

    pub fn projection(&self, id: LayerId) -> Option<&TiledImage> {
        self.node(id).and_then(|n| n.projection.as_ref())
    }

    // ---- topology queries ---------------------------------------------------

    pub fn parent(&self, id: LayerId) -> Option<LayerId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// Children of `id`, bottom to top.
    pub fn children(&self, id: LayerId) -> Vec<LayerId> {
        let mut out = Vec::new();
        let mut cursor = self.node(id).and_then(|n| n.first_child);
        while let Some(child) = cursor {
            out.push(child);
            cursor = self.node(child).and_then(|n| n.next_sibling);
        }
        out
    }

    /// Position among the parent's children (0 = bottom).
    pub fn index_in_parent(&self, id: LayerId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|&c| c == id)
    }

    /// `ancestor` is `id` itself or lies on its path to the root.
    pub fn is_ancestor_or_self(&self, ancestor: LayerId, id: LayerId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    /// Reachable from the root.
    pub fn is_attached(&self, id: LayerId) -> bool {
        self.contains(id) && self.is_ancestor_or_self(self.root, id)
    }

    // ---- structure edits ----------------------------------------------------

    /// Allocate a detached node.  It joins the document once attached.
    pub fn create_node(&mut self, name: impl Into<String>, kind: NodeKind) -> EngineResult<LayerId> {
        if let NodeKind::Clone { source, .. } = &kind {
            self.get(*source)?;
        }
        let id = LayerId(self.nodes.len() as u32);
        self.nodes.push(LayerNode::new(name.into(), kind, self.bounds()));
        Ok(id)
    }

    /// Create a node and attach it under `parent` at `index` (`None` = top).
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        parent: LayerId,
        index: Option<usize>,
    ) -> EngineResult<LayerId> {
        let id = self.create_node(name, kind)?;
        let index = index.unwrap_or(usize::MAX);
        self.attach(id, parent, index)?;
        Ok(id)
    }

    pub fn add_paint_layer(&mut self, name: impl Into<String>, parent: LayerId) -> EngineResult<LayerId> {
        let kind = NodeKind::paint(self.width, self.height);
        self.add_node(name, kind, parent, None)
    }

    /// Insert a detached node under `parent`; `index` is clamped to the
    /// number of children.
    pub fn attach(&mut self, id: LayerId, parent: LayerId, index: usize) -> EngineResult<()> {
        let node = self.get(id)?;
        if !self.get(parent)?.kind.is_group() {
            return Err(EngineError::InvalidTopology(format!("{} is not a group", parent)));
        }
        if id == self.root || node.parent.is_some() {
            return Err(EngineError::InvalidTopology(format!("{} is already attached", id)));
        }
        if self.is_ancestor_or_self(id, parent) {
            return Err(EngineError::InvalidTopology(format!("{} cannot contain itself", id)));
        }
        if let Some(source) = self.clone_cycle(id, parent) {
            return Err(EngineError::InvalidTopology(format!(
                "clone of {} would contain its own source",
                source
            )));
        }
        self.link(id, parent, index);
        self.invalidate_structure(id);
        Ok(())
    }

    /// Unlink `id` from its parent.  Returns the former parent and index so
    /// the node can be re-attached exactly where it was.
    pub fn detach(&mut self, id: LayerId) -> EngineResult<(LayerId, usize)> {
        if id == self.root {
            return Err(EngineError::InvalidTopology("the root cannot be removed".into()));
        }
        self.get(id)?;
        let parent = self
            .parent(id)
            .ok_or_else(|| EngineError::InvalidTopology(format!("{} is not attached", id)))?;
        self.invalidate_structure(id);
        let index = self.unlink(id).unwrap_or(0);
        // Former clip-chain neighbours may now bind to a different base.
        self.invalidate_alpha_disabled_children(parent);
        Ok((parent, index))
    }

    /// Move `id` to `index` among its siblings.  Returns the old index.
    pub fn restack(&mut self, id: LayerId, index: usize) -> EngineResult<usize> {
        let (parent, old_index) = self.detach(id)?;
        self.link(id, parent, index);
        self.invalidate_structure(id);
        Ok(old_index)
    }

    fn link(&mut self, id: LayerId, parent: LayerId, index: usize) {
        let siblings = self.children(parent);
        let index = index.min(siblings.len());
        let below = if index == 0 { None } else { Some(siblings[index - 1]) };
        let above = siblings.get(index).copied();
        {
            let node = &mut self.nodes[id.index()];
            node.parent = Some(parent);
            node.prev_sibling = below;
            node.next_sibling = above;
        }
        match below {
            Some(b) => self.nodes[b.index()].next_sibling = Some(id),
            None => self.nodes[parent.index()].first_child = Some(id),
        }
        match above {
            Some(a) => self.nodes[a.index()].prev_sibling = Some(id),
            None => self.nodes[parent.index()].last_child = Some(id),
        }
    }

    fn unlink(&mut self, id: LayerId) -> Option<usize> {
        let index = self.index_in_parent(id)?;
        let node = &mut self.nodes[id.index()];
        let parent = node.parent.take()?;
        let prev = node.prev_sibling.take();
        let next = node.next_sibling.take();
        match prev {
            Some(p) => self.nodes[p.index()].next_sibling = next,
            None => self.nodes[parent.index()].first_child = next,
        }
        match next {
            Some(n) => self.nodes[n.index()].prev_sibling = prev,
            None => self.nodes[parent.index()].last_child = prev,
        }
        Some(index)
    }

    /// Attaching `id` under `parent` makes every ancestor of `parent` render
    /// `id`'s subtree.  Walk what that subtree renders (children, and clone
    /// sources transitively); reaching `parent` or one of its ancestors, or
    /// `id` itself, means a node would composite itself.  Returns the
    /// offending clone source.
    fn clone_cycle(&self, id: LayerId, parent: LayerId) -> Option<LayerId> {
        let mut visited = HashSet::new();
        let mut stack = vec![(id, None)];
        while let Some((current, via)) = stack.pop() {
            if via.is_some() && (current == id || self.is_ancestor_or_self(current, parent)) {
                return via;
            }
            if !visited.insert(current) {
                continue;
            }
            let Some(node) = self.node(current) else { continue };
            if let NodeKind::Clone { source, .. } = node.kind {
                stack.push((source, Some(source)));
            }
            stack.extend(self.children(current).into_iter().map(|c| (c, via)));
        }
        None
    }

    // ---- property edits -----------------------------------------------------

    pub fn rename(&mut self, id: LayerId, name: impl Into<String>) -> EngineResult<String> {
        let node = self.get_mut(id)?;
        Ok(std::mem::replace(&mut node.name, name.into()))
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32) -> EngineResult<f32> {
        let node = self.get_mut(id)?;
        let old = std::mem::replace(&mut node.opacity, opacity.clamp(0.0, 1.0));
        self.invalidate_in_parent(id);
        Ok(old)
    }

    pub fn set_visible(&mut self, id: LayerId, visible: bool) -> EngineResult<bool> {
        let node = self.get_mut(id)?;
        let old = std::mem::replace(&mut node.visible, visible);
        if old != visible {
            self.invalidate_structure(id);
        }
        Ok(old)
    }

    pub fn set_composite_op(&mut self, id: LayerId, op: CompositeOp) -> EngineResult<CompositeOp> {
        let node = self.get_mut(id)?;
        let old = std::mem::replace(&mut node.composite_op, op);
        // Both the old and the new operator may reach beyond the content.
        if old.is_full_coverage() || op.is_full_coverage() {
            if let Some(parent) = self.parent(id) {
                self.set_dirty(parent, self.bounds());
            }
        } else {
            self.invalidate_in_parent(id);
        }
        Ok(old)
    }

    pub fn set_channel_flags(&mut self, id: LayerId, flags: ChannelFlags) -> EngineResult<ChannelFlags> {
        let node = self.get_mut(id)?;
        let old = std::mem::replace(&mut node.channel_flags, flags);
        self.invalidate_in_parent(id);
        Ok(old)
    }

    pub fn set_alpha_disabled(&mut self, id: LayerId, disabled: bool) -> EngineResult<bool> {
        let node = self.get_mut(id)?;
        let old = std::mem::replace(&mut node.alpha_disabled, disabled);
        if old != disabled {
            self.invalidate_structure(id);
        }
        Ok(old)
    }

    /// Shift a paint or clone layer by `(dx, dy)`.
    pub fn translate(&mut self, id: LayerId, dx: i32, dy: i32) -> EngineResult<()> {
        let before = self.dirty_extent(id);
        let node = self.get_mut(id)?;
        match &mut node.kind {
            NodeKind::Paint { offset, .. } | NodeKind::Clone { offset, .. } => {
                offset.0 += dx;
                offset.1 += dy;
            }
            _ => return Err(EngineError::UnsupportedEdit { layer: id, edit: "translate" }),
        }
        let after = self.dirty_extent(id);
        self.set_dirty(id, before.union(&after));
        Ok(())
    }

    pub fn offset(&self, id: LayerId) -> Option<(i32, i32)> {
        match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Paint { offset, .. }) | Some(NodeKind::Clone { offset, .. }) => Some(*offset),
            _ => None,
        }
    }

    // ---- pixel access -------------------------------------------------------

    /// Raster pixels of a paint or filtered layer.
    pub fn original(&self, id: LayerId) -> Option<&TiledImage> {
        match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Paint { original, .. }) | Some(NodeKind::Filtered { original, .. }) => Some(original),
            _ => None,
        }
    }

    /// Mutable raster pixels.  Callers must follow up with
    /// [`LayerTree::original_changed`] for the edited rect.
    pub fn original_mut(&mut self, id: LayerId) -> EngineResult<&mut TiledImage> {
        match &mut self.get_mut(id)?.kind {
            NodeKind::Paint { original, .. } | NodeKind::Filtered { original, .. } => Ok(original),
            _ => Err(EngineError::UnsupportedEdit { layer: id, edit: "paint" }),
        }
    }

    /// Mark `rect` (in the layer's own pixel coordinates) as changed.
    pub fn original_changed(&mut self, id: LayerId, rect: Rect) {
        let (dx, dy) = match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Paint { offset, .. }) => *offset,
            _ => (0, 0),
        };
        let rect = match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Filtered { radius, .. }) => rect.grow(*radius as i32),
            _ => rect,
        };
        self.set_dirty(id, rect.translate(dx, dy));
    }

    pub fn fill_original(&mut self, id: LayerId, rect: Rect, color: Rgba<u8>) -> EngineResult<()> {
        self.original_mut(id)?.fill_rect(rect, color);
        self.original_changed(id, rect);
        Ok(())
    }

    // ---- dirty tracking -----------------------------------------------------

    /// Conservative document-space box of what the node shows now or showed
    /// at its last recompute.
    pub fn dirty_extent(&self, id: LayerId) -> Rect {
        let shown = self.content_extent(id, 0);
        let cached = self.projection(id).map(|p| p.extent()).unwrap_or(Rect::EMPTY);
        shown.union(&cached).intersect(&self.bounds())
    }

    fn content_extent(&self, id: LayerId, depth: usize) -> Rect {
        let Some(node) = self.node(id) else { return Rect::EMPTY };
        if depth > self.nodes.len() {
            return Rect::EMPTY;
        }
        match &node.kind {
            NodeKind::Paint { original, offset } => original.extent().translate(offset.0, offset.1),
            NodeKind::Filtered { original, radius } => original.extent().grow(*radius as i32),
            NodeKind::Fill { .. } => self.bounds(),
            NodeKind::Clone { source, offset } => self
                .content_extent(*source, depth + 1)
                .translate(offset.0, offset.1),
            NodeKind::Group => self
                .children(id)
                .into_iter()
                .map(|c| self.content_extent(c, depth + 1))
                .fold(Rect::EMPTY, |acc, r| acc.union(&r)),
        }
    }

    /// Mark `rect` of `id` stale and propagate the change to every ancestor,
    /// growing it by each node's change rule on the way up.  Clones of any
    /// node on the path are dirtied too.
    pub fn set_dirty(&mut self, id: LayerId, rect: Rect) {
        let mut visited = HashSet::new();
        self.set_dirty_inner(id, rect, &mut visited);
    }

    fn set_dirty_inner(&mut self, id: LayerId, rect: Rect, visited: &mut HashSet<LayerId>) {
        let bounds = self.bounds();
        let mut rect = rect.intersect(&bounds);
        if rect.is_empty() || !self.contains(id) || !visited.insert(id) {
            return;
        }
        let mut current = id;
        let mut clones = Vec::new();
        loop {
            self.nodes[current.index()].stale.add(rect);
            clones.extend(self.clones_of(current).into_iter().map(|c| (c, rect)));
            let Some(parent) = self.parent(current) else { break };
            let mut grown = self.plane(current).change_rect(rect);
            if let Some(base) = self.clip_base(current) {
                grown = grown.union(&self.plane(base).change_rect(rect));
            }
            rect = grown.intersect(&bounds);
            current = parent;
        }
        for (clone, rect) in clones {
            let (dx, dy) = self.offset(clone).unwrap_or((0, 0));
            self.set_dirty_inner(clone, rect.translate(dx, dy), visited);
        }
    }

    fn clones_of(&self, source: LayerId) -> Vec<LayerId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Clone { source: s, .. } if s == source))
            .map(|(i, _)| LayerId(i as u32))
            .collect()
    }

    /// The layer whose clip chain `id` belongs to, if any.
    pub fn clip_base(&self, id: LayerId) -> Option<LayerId> {
        let node = self.node(id)?;
        if !node.alpha_disabled || !node.visible {
            return None;
        }
        let mut cursor = node.prev_sibling;
        while let Some(below) = cursor {
            let n = self.node(below)?;
            if !n.visible {
                return None;
            }
            if !n.alpha_disabled {
                return Some(below);
            }
            cursor = n.prev_sibling;
        }
        None
    }

    /// The node's own pixels are fine, only the parent composite changed.
    fn invalidate_in_parent(&mut self, id: LayerId) {
        let extent = self.dirty_extent(id);
        if let Some(parent) = self.parent(id) {
            let mut rect = self.plane(id).change_rect(extent);
            if let Some(base) = self.clip_base(id) {
                rect = rect.union(&self.plane(base).change_rect(extent));
            }
            self.set_dirty(parent, rect);
        }
    }

    /// Stacking or clip membership changed: the node and every clip source
    /// next to it may now composite differently.
    fn invalidate_structure(&mut self, id: LayerId) {
        let extent = self.dirty_extent(id);
        self.set_dirty(id, extent);
        if let Some(parent) = self.parent(id) {
            self.invalidate_alpha_disabled_children(parent);
        }
    }

    fn invalidate_alpha_disabled_children(&mut self, parent: LayerId) {
        let mut rect = Rect::EMPTY;
        for child in self.children(parent) {
            if self.node(child).is_some_and(|n| n.alpha_disabled) {
                rect = rect.union(&self.dirty_extent(child));
            }
        }
        if !rect.is_empty() {
            self.set_dirty(parent, rect);
        }
    }
}
