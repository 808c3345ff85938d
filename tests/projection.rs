use image::Rgba;

use strata::ops::painter::Painter;
use strata::{
    ChannelFlags, CompositeOp, EngineSettings, LayerId, LayerTree, Rect, ThresholdMode, TiledImage,
};

const W: u32 = 96;
const H: u32 = 80;

struct Scene {
    tree: LayerTree,
    base: LayerId,
    chain: Vec<LayerId>,
    above: LayerId,
}

/// A half-transparent base followed by three clip members with distinct
/// colours and operators, plus an ordinary layer on top.
fn scene() -> Scene {
    let mut tree = LayerTree::new(W, H, EngineSettings::default());
    let root = tree.root();
    let base = tree.add_paint_layer("base", root).unwrap();
    tree.fill_original(base, Rect::new(8, 8, 60, 50), Rgba([40, 90, 200, 160])).unwrap();

    let members = [
        (Rgba([220, 30, 30, 255]), CompositeOp::Normal, 0.75, Rect::new(0, 0, 40, 40)),
        (Rgba([30, 220, 60, 200]), CompositeOp::Multiply, 1.0, Rect::new(20, 20, 60, 30)),
        (Rgba([250, 250, 10, 255]), CompositeOp::Screen, 0.5, Rect::new(30, 0, 20, 80)),
    ];
    let mut chain = Vec::new();
    for (i, (color, op, opacity, rect)) in members.into_iter().enumerate() {
        let id = tree.add_paint_layer(format!("clip {}", i), root).unwrap();
        tree.fill_original(id, rect, color).unwrap();
        tree.set_composite_op(id, op).unwrap();
        tree.set_opacity(id, opacity).unwrap();
        tree.set_alpha_disabled(id, true).unwrap();
        chain.push(id);
    }
    let above = tree.add_paint_layer("above", root).unwrap();
    tree.fill_original(above, Rect::new(70, 60, 10, 10), Rgba([0, 0, 0, 255])).unwrap();

    let bounds = tree.bounds();
    tree.recalculate(root, bounds, None);
    Scene { tree, base, chain, above }
}

/// Composite the chain onto a copy of the base by hand.
fn expected_apply(tree: &LayerTree, base: LayerId, chain: &[LayerId]) -> TiledImage {
    let bounds = tree.bounds();
    let mut scratch = TiledImage::new(W, H);
    scratch.copy_region_from(tree.projection(base).unwrap(), bounds);
    for &member in chain {
        let node = tree.node(member).unwrap();
        Painter::new(&mut scratch)
            .set_composite_op(node.composite_op)
            .set_opacity(node.opacity)
            .set_channel_flags(ChannelFlags::ALL.with_alpha(false))
            .bit_blt(bounds, tree.projection(member).unwrap());
    }
    let mut out = TiledImage::new(W, H);
    let node = tree.node(base).unwrap();
    Painter::new(&mut out)
        .set_composite_op(node.composite_op)
        .set_opacity(node.opacity)
        .bit_blt(bounds, &scratch);
    out
}

#[test]
fn clip_chain_is_merged_onto_a_copy_of_the_base() {
    let s = scene();
    let plane = s.tree.plane(s.base);
    assert_eq!(plane.clip_chain(), s.chain);

    let mut actual = TiledImage::new(W, H);
    assert!(plane.apply(&mut actual, s.tree.bounds()));
    let expected = expected_apply(&s.tree, s.base, &s.chain);
    assert_eq!(actual.to_rgba_image(), expected.to_rgba_image());
}

#[test]
fn clip_chain_never_widens_base_coverage() {
    let s = scene();
    let mut actual = TiledImage::new(W, H);
    s.tree.plane(s.base).apply(&mut actual, s.tree.bounds());
    // The first member paints (0,0) but the base is empty there.
    assert_eq!(actual.get_pixel(2, 2)[3], 0);
    assert_eq!(actual.get_pixel(20, 20)[3], 160);
}

#[test]
fn base_projection_is_left_untouched() {
    let s = scene();
    let before = s.tree.projection(s.base).unwrap().to_rgba_image();
    let mut dst = TiledImage::new(W, H);
    s.tree.plane(s.base).apply(&mut dst, s.tree.bounds());
    assert_eq!(s.tree.projection(s.base).unwrap().to_rgba_image(), before);
}

#[test]
fn clip_sources_do_not_apply_on_their_own() {
    let s = scene();
    let bounds = s.tree.bounds();
    for &member in &s.chain {
        let mut dst = TiledImage::new(W, H);
        assert!(!s.tree.plane(member).apply(&mut dst, bounds));
        assert!(!s.tree.plane(member).apply_max_out_alpha(&mut dst, bounds, ThresholdMode::Floor));
        assert_eq!(dst.chunk_count(), 0);
        assert!(s.tree.plane(member).clip_chain().is_empty());
    }
}

#[test]
fn root_matches_base_chain_then_top_layer() {
    let s = scene();
    let bounds = s.tree.bounds();
    let mut expected = expected_apply(&s.tree, s.base, &s.chain);
    Painter::new(&mut expected).bit_blt(bounds, s.tree.projection(s.above).unwrap());
    let root = s.tree.projection(s.tree.root()).unwrap();
    assert_eq!(root.to_rgba_image(), expected.to_rgba_image());
}

#[test]
fn invisible_member_ends_the_chain() {
    let mut s = scene();
    s.tree.set_visible(s.chain[1], false).unwrap();
    assert_eq!(s.tree.plane(s.base).clip_chain(), vec![s.chain[0]]);
}

#[test]
fn max_out_alpha_binarizes_coverage() {
    let s = scene();
    let mut dst = TiledImage::new(W, H);
    assert!(s.tree.plane(s.base).apply_max_out_alpha(&mut dst, s.tree.bounds(), ThresholdMode::Ceil));
    assert_eq!(dst.get_pixel(20, 20)[3], 255);
    assert_eq!(dst.get_pixel(2, 2)[3], 0);
    // Scratch buffers went back to the pool.
    assert_eq!(s.tree.pool().outstanding(), 0);
}

#[test]
fn missing_projection_and_empty_region_are_silent() {
    let mut tree = LayerTree::new(W, H, EngineSettings::default());
    let root = tree.root();
    let fresh = tree.add_paint_layer("fresh", root).unwrap();
    let mut dst = TiledImage::new(W, H);
    assert!(!tree.plane(fresh).apply(&mut dst, tree.bounds()));

    let s = scene();
    assert!(!s.tree.plane(s.base).apply(&mut dst, Rect::EMPTY));
    // Non full-coverage ops skip regions outside the projection's extent.
    assert!(!s.tree.plane(s.above).apply(&mut dst, Rect::new(0, 0, 10, 10)));
}

#[test]
fn full_extent_spread_is_idempotent() {
    let mut s = scene();
    s.tree.set_composite_op(s.above, CompositeOp::DestinationIn).unwrap();
    let plane = s.tree.plane(s.above);
    let once = plane.change_rect(Rect::new(1, 1, 2, 2));
    assert_eq!(once, s.tree.bounds());
    assert_eq!(plane.change_rect(once), once);
}

#[test]
fn editing_a_layer_recomputes_only_what_changed() {
    let mut s = scene();
    let root = s.tree.root();
    assert!(s.tree.node(root).unwrap().stale().is_empty());
    s.tree.fill_original(s.above, Rect::new(0, 70, 4, 4), Rgba([9, 9, 9, 255])).unwrap();
    let stale = s.tree.node(root).unwrap().stale().bounds();
    assert!(stale.contains(&Rect::new(0, 70, 4, 4)));
    assert!(!stale.contains(&Rect::new(20, 20, 1, 1)));
    s.tree.recalculate(root, stale, None);
    assert_eq!(s.tree.projection(root).unwrap().get_pixel(1, 71), &Rgba([9, 9, 9, 255]));
}
