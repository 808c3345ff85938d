// ============================================================================
// COMPOSITE OPERATORS — id registry + per-pixel blend math
// ============================================================================

use image::Rgba;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompositeOp {
    #[default]
    Normal,
    Multiply,
    Screen,
    Additive,
    Reflect,
    Glow,
    ColorBurn,
    ColorDodge,
    Overlay,
    Difference,
    Negation,
    Lighten,
    Darken,
    Xor,
    HardLight,
    SoftLight,
    Exclusion,
    Subtract,
    Divide,
    LinearBurn,
    VividLight,
    LinearLight,
    PinLight,
    HardMix,
    /// Replace the destination with the source.
    Copy,
    /// Keep the destination only where the source is opaque.
    DestinationIn,
    /// Destination over source, clipped to the source's coverage.
    DestinationAtop,
}

impl CompositeOp {
    pub fn all() -> &'static [CompositeOp] {
        &[
            CompositeOp::Normal,
            CompositeOp::Multiply,
            CompositeOp::Screen,
            CompositeOp::Additive,
            CompositeOp::Overlay,
            CompositeOp::HardLight,
            CompositeOp::SoftLight,
            CompositeOp::Lighten,
            CompositeOp::Darken,
            CompositeOp::ColorBurn,
            CompositeOp::ColorDodge,
            CompositeOp::Difference,
            CompositeOp::Exclusion,
            CompositeOp::Negation,
            CompositeOp::Reflect,
            CompositeOp::Glow,
            CompositeOp::Subtract,
            CompositeOp::Divide,
            CompositeOp::LinearBurn,
            CompositeOp::VividLight,
            CompositeOp::LinearLight,
            CompositeOp::PinLight,
            CompositeOp::HardMix,
            CompositeOp::Xor,
            CompositeOp::Copy,
            CompositeOp::DestinationIn,
            CompositeOp::DestinationAtop,
        ]
    }

    /// Operators whose result depends on every destination pixel, including
    /// those the source does not cover.  Their working area is never clipped
    /// to the source extent.
    pub fn full_coverage() -> &'static [CompositeOp] {
        &[CompositeOp::Copy, CompositeOp::DestinationIn, CompositeOp::DestinationAtop]
    }

    pub fn is_full_coverage(&self) -> bool {
        Self::full_coverage().contains(self)
    }

    /// Stable kebab-case identifier used by settings (`spread.<id>`) and
    /// external registries.
    pub fn id(&self) -> &'static str {
        match self {
            CompositeOp::Normal => "normal",
            CompositeOp::Multiply => "multiply",
            CompositeOp::Screen => "screen",
            CompositeOp::Additive => "additive",
            CompositeOp::Reflect => "reflect",
            CompositeOp::Glow => "glow",
            CompositeOp::ColorBurn => "color-burn",
            CompositeOp::ColorDodge => "color-dodge",
            CompositeOp::Overlay => "overlay",
            CompositeOp::Difference => "difference",
            CompositeOp::Negation => "negation",
            CompositeOp::Lighten => "lighten",
            CompositeOp::Darken => "darken",
            CompositeOp::Xor => "xor",
            CompositeOp::HardLight => "hard-light",
            CompositeOp::SoftLight => "soft-light",
            CompositeOp::Exclusion => "exclusion",
            CompositeOp::Subtract => "subtract",
            CompositeOp::Divide => "divide",
            CompositeOp::LinearBurn => "linear-burn",
            CompositeOp::VividLight => "vivid-light",
            CompositeOp::LinearLight => "linear-light",
            CompositeOp::PinLight => "pin-light",
            CompositeOp::HardMix => "hard-mix",
            CompositeOp::Copy => "copy",
            CompositeOp::DestinationIn => "destination-in",
            CompositeOp::DestinationAtop => "destination-atop",
        }
    }

    /// Resolve an identifier; `None` for operators this registry does not know.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::all().iter().copied().find(|op| op.id() == id)
    }
}

impl std::fmt::Display for CompositeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Blend `top` onto `base` with `op` at `opacity`.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, op: CompositeOp, opacity: f32) -> Rgba<u8> {
    let opacity = opacity.clamp(0.0, 1.0);

    if !op.is_full_coverage() {
        // Fast path: fully transparent top pixel — nothing to blend
        if top[3] == 0 || opacity <= 0.0 {
            return base;
        }
        // Fast path: Normal blend, full opacity, fully opaque top pixel — just overwrite
        if op == CompositeOp::Normal && opacity >= 1.0 && top[3] == 255 {
            return top;
        }
    }

    let [base_r, base_g, base_b, base_a] = unit(base);
    let [top_r, top_g, top_b, top_a] = unit(top);
    let top_a = top_a * opacity;

    match op {
        CompositeOp::Copy => {
            // Opacity fades between destination and source on every channel.
            let mix = |b: f32, t: f32| b + (t - b) * opacity;
            return to_u8([
                mix(base_r, top_r),
                mix(base_g, top_g),
                mix(base_b, top_b),
                mix(base_a, top[3] as f32 / 255.0),
            ]);
        }
        CompositeOp::DestinationIn => {
            let keep = 1.0 - opacity + top_a;
            return to_u8([base_r, base_g, base_b, base_a * keep.min(1.0)]);
        }
        CompositeOp::DestinationAtop => {
            let src_a = top[3] as f32 / 255.0;
            let out_a = base_a + (src_a - base_a) * opacity;
            if out_a <= 0.0 {
                return Rgba([0, 0, 0, 0]);
            }
            let r = base_r * base_a + top_r * (1.0 - base_a);
            let g = base_g * base_a + top_g * (1.0 - base_a);
            let b = base_b * base_a + top_b * (1.0 - base_a);
            return to_u8([r, g, b, out_a]);
        }
        CompositeOp::Xor => {
            let xor_a = base_a * (1.0 - top_a) + top_a * (1.0 - base_a);
            if xor_a == 0.0 {
                return Rgba([0, 0, 0, 0]);
            }
            let xor_r = (base_r * base_a * (1.0 - top_a) + top_r * top_a * (1.0 - base_a)) / xor_a;
            let xor_g = (base_g * base_a * (1.0 - top_a) + top_g * top_a * (1.0 - base_a)) / xor_a;
            let xor_b = (base_b * base_a * (1.0 - top_a) + top_b * top_a * (1.0 - base_a)) / xor_a;
            return to_u8([xor_r, xor_g, xor_b, xor_a]);
        }
        _ => {}
    }

    let (r, g, b) = blend_color(op, [base_r, base_g, base_b], [top_r, top_g, top_b]);

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    to_u8([out_r, out_g, out_b, out_a])
}

/// Blend with the destination's coverage locked: colour moves towards the
/// blended result by the source coverage, alpha stays untouched.  This is how
/// clip-chain members are merged onto their base.
pub fn blend_pixel_alpha_locked(base: Rgba<u8>, top: Rgba<u8>, op: CompositeOp, opacity: f32) -> Rgba<u8> {
    if base[3] == 0 {
        return base;
    }
    let opacity = opacity.clamp(0.0, 1.0);
    let [base_r, base_g, base_b, _] = unit(base);
    let [top_r, top_g, top_b, top_a] = unit(top);
    let t = top_a * opacity;
    if t <= 0.0 {
        return base;
    }

    let (r, g, b) = match op {
        CompositeOp::Copy | CompositeOp::DestinationAtop => (top_r, top_g, top_b),
        CompositeOp::DestinationIn | CompositeOp::Xor => (base_r, base_g, base_b),
        _ => blend_color(op, [base_r, base_g, base_b], [top_r, top_g, top_b]),
    };

    to_u8([
        base_r + (r - base_r) * t,
        base_g + (g - base_g) * t,
        base_b + (b - base_b) * t,
        base[3] as f32 / 255.0,
    ])
}

fn blend_color(op: CompositeOp, base: [f32; 3], top: [f32; 3]) -> (f32, f32, f32) {
    let [base_r, base_g, base_b] = base;
    let [top_r, top_g, top_b] = top;
    match op {
        CompositeOp::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        CompositeOp::Screen => (
            1.0 - (1.0 - base_r) * (1.0 - top_r),
            1.0 - (1.0 - base_g) * (1.0 - top_g),
            1.0 - (1.0 - base_b) * (1.0 - top_b),
        ),
        CompositeOp::Additive => (
            (base_r + top_r).min(1.0),
            (base_g + top_g).min(1.0),
            (base_b + top_b).min(1.0),
        ),
        CompositeOp::Overlay => (
            overlay_channel(base_r, top_r),
            overlay_channel(base_g, top_g),
            overlay_channel(base_b, top_b),
        ),
        CompositeOp::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
        CompositeOp::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        CompositeOp::Difference => ((base_r - top_r).abs(), (base_g - top_g).abs(), (base_b - top_b).abs()),
        CompositeOp::Negation => (
            1.0 - (1.0 - base_r - top_r).abs(),
            1.0 - (1.0 - base_g - top_g).abs(),
            1.0 - (1.0 - base_b - top_b).abs(),
        ),
        CompositeOp::ColorBurn => (
            color_burn_channel(base_r, top_r),
            color_burn_channel(base_g, top_g),
            color_burn_channel(base_b, top_b),
        ),
        CompositeOp::ColorDodge => (
            color_dodge_channel(base_r, top_r),
            color_dodge_channel(base_g, top_g),
            color_dodge_channel(base_b, top_b),
        ),
        CompositeOp::Reflect => (
            reflect_channel(base_r, top_r),
            reflect_channel(base_g, top_g),
            reflect_channel(base_b, top_b),
        ),
        CompositeOp::Glow => (
            reflect_channel(top_r, base_r),
            reflect_channel(top_g, base_g),
            reflect_channel(top_b, base_b),
        ),
        CompositeOp::HardLight => (
            overlay_channel(top_r, base_r),
            overlay_channel(top_g, base_g),
            overlay_channel(top_b, base_b),
        ),
        CompositeOp::SoftLight => (
            soft_light_channel(base_r, top_r),
            soft_light_channel(base_g, top_g),
            soft_light_channel(base_b, top_b),
        ),
        CompositeOp::Exclusion => (
            base_r + top_r - 2.0 * base_r * top_r,
            base_g + top_g - 2.0 * base_g * top_g,
            base_b + top_b - 2.0 * base_b * top_b,
        ),
        CompositeOp::Subtract => (
            (base_r - top_r).max(0.0),
            (base_g - top_g).max(0.0),
            (base_b - top_b).max(0.0),
        ),
        CompositeOp::Divide => (
            divide_channel(base_r, top_r),
            divide_channel(base_g, top_g),
            divide_channel(base_b, top_b),
        ),
        CompositeOp::LinearBurn => (
            (base_r + top_r - 1.0).max(0.0),
            (base_g + top_g - 1.0).max(0.0),
            (base_b + top_b - 1.0).max(0.0),
        ),
        CompositeOp::VividLight => (
            vivid_light_channel(base_r, top_r),
            vivid_light_channel(base_g, top_g),
            vivid_light_channel(base_b, top_b),
        ),
        CompositeOp::LinearLight => (
            (base_r + 2.0 * top_r - 1.0).clamp(0.0, 1.0),
            (base_g + 2.0 * top_g - 1.0).clamp(0.0, 1.0),
            (base_b + 2.0 * top_b - 1.0).clamp(0.0, 1.0),
        ),
        CompositeOp::PinLight => (
            pin_light_channel(base_r, top_r),
            pin_light_channel(base_g, top_g),
            pin_light_channel(base_b, top_b),
        ),
        CompositeOp::HardMix => (
            if base_r + top_r >= 1.0 { 1.0 } else { 0.0 },
            if base_g + top_g >= 1.0 { 1.0 } else { 0.0 },
            if base_b + top_b >= 1.0 { 1.0 } else { 0.0 },
        ),
        // Coverage operators keep the source colour when merged normally.
        CompositeOp::Normal
        | CompositeOp::Xor
        | CompositeOp::Copy
        | CompositeOp::DestinationIn
        | CompositeOp::DestinationAtop => (top_r, top_g, top_b),
    }
}

#[inline]
fn unit(p: Rgba<u8>) -> [f32; 4] {
    [
        p[0] as f32 / 255.0,
        p[1] as f32 / 255.0,
        p[2] as f32 / 255.0,
        p[3] as f32 / 255.0,
    ]
}

#[inline]
fn to_u8(c: [f32; 4]) -> Rgba<u8> {
    Rgba([
        (c[0] * 255.0).round().clamp(0.0, 255.0) as u8,
        (c[1] * 255.0).round().clamp(0.0, 255.0) as u8,
        (c[2] * 255.0).round().clamp(0.0, 255.0) as u8,
        (c[3] * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if top == 0.0 {
        0.0
    } else {
        (1.0 - (1.0 - base) / top).max(0.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

fn reflect_channel(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base * base / (1.0 - top)).min(1.0)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

fn divide_channel(base: f32, top: f32) -> f32 {
    if top <= 0.0 { 1.0 } else { (base / top).min(1.0) }
}

fn vivid_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        // Color Burn with 2*top
        let t2 = 2.0 * top;
        if t2 <= 0.0 { 0.0 } else { (1.0 - (1.0 - base) / t2).max(0.0) }
    } else {
        // Color Dodge with 2*(top-0.5)
        let t2 = 2.0 * (top - 0.5);
        if t2 >= 1.0 { 1.0 } else { (base / (1.0 - t2)).min(1.0) }
    }
}

fn pin_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base.min(2.0 * top)
    } else {
        base.max(2.0 * (top - 0.5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
    const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

    #[test]
    fn ids_resolve_back_to_ops() {
        for op in CompositeOp::all() {
            assert_eq!(CompositeOp::from_id(op.id()), Some(*op));
        }
        assert_eq!(CompositeOp::from_id("no-such-op"), None);
    }

    #[test]
    fn ids_are_unique_kebab_case() {
        let mut seen = std::collections::HashSet::new();
        for op in CompositeOp::all() {
            let id = op.id();
            assert!(id.chars().all(|c| c.is_ascii_lowercase() || c == '-'), "{id}");
            assert!(!id.starts_with('-') && !id.ends_with('-'), "{id}");
            assert!(seen.insert(id), "duplicate id {id}");
        }
        assert_eq!(CompositeOp::HardLight.id(), "hard-light");
        assert_eq!(CompositeOp::LinearLight.id(), "linear-light");
        assert_eq!(CompositeOp::from_id("color-burn"), Some(CompositeOp::ColorBurn));
    }

    #[test]
    fn normal_over_opaque_replaces() {
        assert_eq!(blend_pixel(RED, BLUE, CompositeOp::Normal, 1.0), BLUE);
        assert_eq!(blend_pixel(RED, CLEAR, CompositeOp::Normal, 1.0), RED);
        assert_eq!(blend_pixel(RED, BLUE, CompositeOp::Normal, 0.0), RED);
    }

    #[test]
    fn destination_in_erases_outside_source() {
        assert_eq!(blend_pixel(RED, CLEAR, CompositeOp::DestinationIn, 1.0)[3], 0);
        assert_eq!(blend_pixel(RED, BLUE, CompositeOp::DestinationIn, 1.0), RED);
    }

    #[test]
    fn copy_replaces_including_transparency() {
        assert_eq!(blend_pixel(RED, CLEAR, CompositeOp::Copy, 1.0), CLEAR);
        assert_eq!(blend_pixel(RED, BLUE, CompositeOp::Copy, 1.0), BLUE);
    }

    #[test]
    fn alpha_locked_keeps_coverage() {
        let half = Rgba([255, 0, 0, 128]);
        let out = blend_pixel_alpha_locked(half, BLUE, CompositeOp::Normal, 1.0);
        assert_eq!(out, Rgba([0, 0, 255, 128]));
        assert_eq!(blend_pixel_alpha_locked(CLEAR, BLUE, CompositeOp::Normal, 1.0), CLEAR);
        let multiplied = blend_pixel_alpha_locked(RED, Rgba([128, 128, 128, 255]), CompositeOp::Multiply, 1.0);
        assert_eq!(multiplied[3], 255);
        assert_eq!(multiplied[0], 128);
    }
}
