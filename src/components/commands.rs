use image::Rgba;

use crate::canvas::TiledImage;
use crate::components::history::{Command, MergeResult};
use crate::components::layers::{ChannelFlags, LayerId, LayerTree};
use crate::error::{EngineError, EngineResult};
use crate::geometry::Rect;
use crate::ops::composite::CompositeOp;

// ============================================================================
// PIXEL PATCH — region snapshot of a layer's original
// ============================================================================

/// A rectangular patch of pixel data for efficient undo/redo.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelPatch {
    pub layer: LayerId,
    /// In the layer's own pixel coordinates, clamped to the image.
    pub rect: Rect,
    pub pixels: Vec<Rgba<u8>>,
}

impl PixelPatch {
    pub fn capture(tree: &LayerTree, layer: LayerId, rect: Rect) -> EngineResult<Self> {
        let original = tree
            .original(layer)
            .ok_or(EngineError::UnsupportedEdit { layer, edit: "paint" })?;
        Ok(Self::from_image(original, layer, rect))
    }

    pub fn from_image(image: &TiledImage, layer: LayerId, rect: Rect) -> Self {
        let rect = rect.intersect(&image.bounds());
        Self { layer, rect, pixels: image.region_pixels(rect) }
    }

    pub fn apply(&self, tree: &mut LayerTree) {
        let original = match tree.original_mut(self.layer) {
            Ok(original) => original,
            Err(e) => {
                crate::log_warn!("PixelPatch: {}", e);
                return;
            }
        };
        let mut pixels = self.pixels.iter();
        for y in self.rect.top()..self.rect.bottom() {
            for x in self.rect.left()..self.rect.right() {
                if let Some(px) = pixels.next() {
                    original.put_pixel(x as u32, y as u32, *px);
                }
            }
        }
        tree.original_changed(self.layer, self.rect);
    }

    pub fn memory_size(&self) -> usize {
        self.pixels.len() * 4 // 4 bytes per RGBA pixel
    }
}

fn pick<T>(forward: bool, old: T, new: T) -> T {
    if forward { new } else { old }
}

// ============================================================================
// LAYER COMMANDS
// ============================================================================

/// Every reversible edit of a [`LayerTree`].
#[derive(Clone, Debug, PartialEq)]
pub enum LayerCommand {
    /// Attach an existing (detached) node.
    Add { layer: LayerId, parent: LayerId, index: usize },
    /// Detach a node; it keeps its id and content for undo.
    Remove { layer: LayerId, parent: LayerId, index: usize },
    Restack { layer: LayerId, from: usize, to: usize },
    Translate { layer: LayerId, dx: i32, dy: i32 },
    Opacity { layer: LayerId, old: f32, new: f32 },
    Visibility { layer: LayerId, old: bool, new: bool },
    Rename { layer: LayerId, old: String, new: String },
    CompositeOp { layer: LayerId, old: CompositeOp, new: CompositeOp },
    AlphaDisabled { layer: LayerId, old: bool, new: bool },
    ChannelFlags { layer: LayerId, old: ChannelFlags, new: ChannelFlags },
    Paint { layer: LayerId, before: PixelPatch, after: PixelPatch },
}

impl LayerCommand {
    pub fn remove(tree: &LayerTree, layer: LayerId) -> EngineResult<Self> {
        let parent = tree
            .parent(layer)
            .ok_or_else(|| EngineError::InvalidTopology(format!("{} is not attached", layer)))?;
        let index = tree.index_in_parent(layer).unwrap_or(0);
        Ok(LayerCommand::Remove { layer, parent, index })
    }

    pub fn restack(tree: &LayerTree, layer: LayerId, to: usize) -> EngineResult<Self> {
        let from = tree.index_in_parent(layer).ok_or(EngineError::UnknownLayer(layer))?;
        let siblings = tree.parent(layer).map_or(0, |p| tree.children(p).len());
        Ok(LayerCommand::Restack { layer, from, to: to.min(siblings.saturating_sub(1)) })
    }

    pub fn set_opacity(tree: &LayerTree, layer: LayerId, new: f32) -> EngineResult<Self> {
        let old = tree.node(layer).ok_or(EngineError::UnknownLayer(layer))?.opacity;
        Ok(LayerCommand::Opacity { layer, old, new: new.clamp(0.0, 1.0) })
    }

    pub fn set_visible(tree: &LayerTree, layer: LayerId, new: bool) -> EngineResult<Self> {
        let old = tree.node(layer).ok_or(EngineError::UnknownLayer(layer))?.visible;
        Ok(LayerCommand::Visibility { layer, old, new })
    }

    pub fn rename(tree: &LayerTree, layer: LayerId, new: impl Into<String>) -> EngineResult<Self> {
        let old = tree.node(layer).ok_or(EngineError::UnknownLayer(layer))?.name.clone();
        Ok(LayerCommand::Rename { layer, old, new: new.into() })
    }

    pub fn set_composite_op(tree: &LayerTree, layer: LayerId, new: CompositeOp) -> EngineResult<Self> {
        let old = tree.node(layer).ok_or(EngineError::UnknownLayer(layer))?.composite_op;
        Ok(LayerCommand::CompositeOp { layer, old, new })
    }

    pub fn set_alpha_disabled(tree: &LayerTree, layer: LayerId, new: bool) -> EngineResult<Self> {
        let old = tree.node(layer).ok_or(EngineError::UnknownLayer(layer))?.alpha_disabled;
        Ok(LayerCommand::AlphaDisabled { layer, old, new })
    }

    pub fn set_channel_flags(tree: &LayerTree, layer: LayerId, new: ChannelFlags) -> EngineResult<Self> {
        let old = tree.node(layer).ok_or(EngineError::UnknownLayer(layer))?.channel_flags;
        Ok(LayerCommand::ChannelFlags { layer, old, new })
    }

    /// Build a paint command by running `edit` on a copy of the layer's
    /// pixels and recording `rect` before and after.
    pub fn paint_with(
        tree: &LayerTree,
        layer: LayerId,
        rect: Rect,
        edit: impl FnOnce(&mut TiledImage),
    ) -> EngineResult<Self> {
        let before = PixelPatch::capture(tree, layer, rect)?;
        let mut scratch = tree
            .original(layer)
            .cloned()
            .ok_or(EngineError::UnsupportedEdit { layer, edit: "paint" })?;
        edit(&mut scratch);
        let after = PixelPatch::from_image(&scratch, layer, rect);
        Ok(LayerCommand::Paint { layer, before, after })
    }

    pub fn fill(tree: &LayerTree, layer: LayerId, rect: Rect, color: Rgba<u8>) -> EngineResult<Self> {
        Self::paint_with(tree, layer, rect, |img| img.fill_rect(rect, color))
    }

    pub fn layer(&self) -> LayerId {
        match self {
            LayerCommand::Add { layer, .. }
            | LayerCommand::Remove { layer, .. }
            | LayerCommand::Restack { layer, .. }
            | LayerCommand::Translate { layer, .. }
            | LayerCommand::Opacity { layer, .. }
            | LayerCommand::Visibility { layer, .. }
            | LayerCommand::Rename { layer, .. }
            | LayerCommand::CompositeOp { layer, .. }
            | LayerCommand::AlphaDisabled { layer, .. }
            | LayerCommand::ChannelFlags { layer, .. }
            | LayerCommand::Paint { layer, .. } => *layer,
        }
    }

    fn apply(&self, tree: &mut LayerTree, forward: bool) -> EngineResult<()> {
        use LayerCommand as C;
        match self {
            C::Add { layer, parent, index } | C::Remove { layer, parent, index } => {
                let attach = matches!(self, C::Add { .. }) == forward;
                if attach {
                    tree.attach(*layer, *parent, *index)
                } else {
                    tree.detach(*layer).map(|_| ())
                }
            }
            C::Restack { layer, from, to } => tree.restack(*layer, pick(forward, *from, *to)).map(|_| ()),
            C::Translate { layer, dx, dy } => {
                let sign = if forward { 1 } else { -1 };
                tree.translate(*layer, dx * sign, dy * sign)
            }
            C::Opacity { layer, old, new } => tree.set_opacity(*layer, pick(forward, *old, *new)).map(|_| ()),
            C::Visibility { layer, old, new } => tree.set_visible(*layer, pick(forward, *old, *new)).map(|_| ()),
            C::Rename { layer, old, new } => {
                let name = if forward { new } else { old };
                tree.rename(*layer, name.clone()).map(|_| ())
            }
            C::CompositeOp { layer, old, new } => tree.set_composite_op(*layer, pick(forward, *old, *new)).map(|_| ()),
            C::AlphaDisabled { layer, old, new } => tree.set_alpha_disabled(*layer, pick(forward, *old, *new)).map(|_| ()),
            C::ChannelFlags { layer, old, new } => tree.set_channel_flags(*layer, pick(forward, *old, *new)).map(|_| ()),
            C::Paint { before, after, .. } => {
                if forward { after.apply(tree) } else { before.apply(tree) }
                Ok(())
            }
        }
    }

    /// Apply the command forward, reporting a refused edit instead of
    /// logging it.
    pub fn try_redo(&self, tree: &mut LayerTree) -> EngineResult<()> {
        self.apply(tree, true)
    }

    fn run(&self, tree: &mut LayerTree, forward: bool) {
        if let Err(e) = self.apply(tree, forward) {
            crate::log_err!("{} ({}): {}", self.description(), if forward { "redo" } else { "undo" }, e);
        }
    }
}

impl Command for LayerCommand {
    type Target = LayerTree;

    fn redo(&self, tree: &mut LayerTree) {
        self.run(tree, true);
    }

    fn undo(&self, tree: &mut LayerTree) {
        self.run(tree, false);
    }

    fn description(&self) -> String {
        match self {
            LayerCommand::Add { layer, .. } => format!("Add Layer {}", layer),
            LayerCommand::Remove { layer, .. } => format!("Delete Layer {}", layer),
            LayerCommand::Restack { layer, from, to } => format!("Move Layer {} {} → {}", layer, from, to),
            LayerCommand::Translate { layer, dx, dy } => format!("Offset Layer {} by ({}, {})", layer, dx, dy),
            LayerCommand::Opacity { layer, new, .. } => {
                format!("Layer {} Opacity: {:.0}%", layer, new * 100.0)
            }
            LayerCommand::Visibility { layer, new, .. } => {
                if *new {
                    format!("Show Layer {}", layer)
                } else {
                    format!("Hide Layer {}", layer)
                }
            }
            LayerCommand::Rename { old, new, .. } => format!("Rename: {} → {}", old, new),
            LayerCommand::CompositeOp { layer, new, .. } => format!("Layer {} Blend: {}", layer, new),
            LayerCommand::AlphaDisabled { layer, new, .. } => {
                if *new {
                    format!("Clip Layer {}", layer)
                } else {
                    format!("Unclip Layer {}", layer)
                }
            }
            LayerCommand::ChannelFlags { layer, .. } => format!("Layer {} Channels", layer),
            LayerCommand::Paint { layer, .. } => format!("Paint Layer {}", layer),
        }
    }

    fn memory_size(&self) -> usize {
        match self {
            LayerCommand::Paint { before, after, .. } => before.memory_size() + after.memory_size(),
            LayerCommand::Rename { old, new, .. } => old.len() + new.len(),
            _ => std::mem::size_of::<LayerCommand>(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            LayerCommand::Add { .. } => "add",
            LayerCommand::Remove { .. } => "remove",
            LayerCommand::Restack { .. } => "restack",
            LayerCommand::Translate { .. } => "translate",
            LayerCommand::Opacity { .. } => "opacity",
            LayerCommand::Visibility { .. } => "visibility",
            LayerCommand::Rename { .. } => "rename",
            LayerCommand::CompositeOp { .. } => "composite-op",
            LayerCommand::AlphaDisabled { .. } => "alpha-disabled",
            LayerCommand::ChannelFlags { .. } => "channel-flags",
            LayerCommand::Paint { .. } => "paint",
        }
    }

    /// Consecutive moves of the same layer always collapse.
    fn can_merge_with(&self, earlier: &Self) -> bool {
        matches!(
            (self, earlier),
            (LayerCommand::Translate { layer: a, .. }, LayerCommand::Translate { layer: b, .. }) if a == b
        )
    }

    /// Opacity drags produce bursts of small changes.
    fn timed_mergeable(&self) -> bool {
        matches!(self, LayerCommand::Opacity { .. })
    }

    fn absorb(&mut self, later: Self) -> MergeResult<Self> {
        match (self, later) {
            (LayerCommand::Translate { layer, dx, dy }, LayerCommand::Translate { layer: l, dx: x, dy: y })
                if *layer == l =>
            {
                *dx += x;
                *dy += y;
                MergeResult::Merged
            }
            (LayerCommand::Opacity { layer, new, .. }, LayerCommand::Opacity { layer: l, new: n, .. })
                if *layer == l =>
            {
                *new = n;
                MergeResult::Merged
            }
            (_, later) => MergeResult::NotMergeable(later),
        }
    }
}
