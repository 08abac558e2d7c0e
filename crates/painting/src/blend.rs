//! Per-texel blending shared by brush dabs and the layer compositor
//!
//! Texels are straight (non-premultiplied) RGBA. Stored textures hold 8-bit
//! channels; blending happens in `f32`.

use crate::types::BlendMode;

/// Unpack an 8-bit RGBA texel to `[0, 1]` floats
#[inline]
pub fn unpack(texel: [u8; 4]) -> [f32; 4] {
    texel.map(|c| c as f32 / 255.0)
}

/// Pack `[0, 1]` floats to an 8-bit RGBA texel, rounding to nearest
#[inline]
pub fn pack(color: [f32; 4]) -> [u8; 4] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

/// Brush weight at `distance` from the dab center: `(1 - d/r)^falloff`.
///
/// A falloff of zero gives a hard-edged disc.
#[inline]
pub fn falloff(distance: f32, radius: f32, exponent: f32) -> f32 {
    if radius <= 0.0 || distance > radius {
        return 0.0;
    }
    let t = (1.0 - distance / radius).clamp(0.0, 1.0);
    if exponent <= 0.0 { 1.0 } else { t.powf(exponent) }
}

/// Blend `color` with coverage `alpha` onto `dst`
///
/// Over is the usual straight-alpha over operator: `out = src*a + dst*(1-a)`
/// weighted by destination alpha and renormalized. Replace discards the
/// destination wherever the coverage is non-zero and writes the color with
/// the coverage as its alpha.
#[inline]
pub fn blend(dst: [f32; 4], color: [f32; 3], alpha: f32, mode: BlendMode) -> [f32; 4] {
    let a = alpha.clamp(0.0, 1.0);
    let inv = 1.0 - a;
    match mode {
        BlendMode::Over => {
            let out_a = a + dst[3] * inv;
            if out_a <= f32::EPSILON {
                return [0.0; 4];
            }
            let channel = |i: usize| (color[i] * a + dst[i] * dst[3] * inv) / out_a;
            [channel(0), channel(1), channel(2), out_a]
        }
        BlendMode::Replace if a <= 0.0 => dst,
        BlendMode::Replace => [color[0], color[1], color[2], a],
        // Destination-out
        BlendMode::Erase => [dst[0], dst[1], dst[2], dst[3] * inv],
        BlendMode::Add => [
            (dst[0] + color[0] * a).min(1.0),
            (dst[1] + color[1] * a).min(1.0),
            (dst[2] + color[2] * a).min(1.0),
            a + dst[3] * inv,
        ],
        BlendMode::Multiply => [
            dst[0] * (inv + color[0] * a),
            dst[1] * (inv + color[1] * a),
            dst[2] * (inv + color[2] * a),
            dst[3],
        ],
    }
}

/// Blend a stored texel in place
#[inline]
pub fn blend_texel(dst: &mut [u8; 4], color: [f32; 3], alpha: f32, mode: BlendMode) {
    *dst = pack(blend(unpack(*dst), color, alpha, mode));
}

/// Blend one layer texel into the compositor accumulator
#[inline]
pub fn composite(acc: [f32; 4], src: [u8; 4], mode: BlendMode, opacity: f32) -> [f32; 4] {
    let src = unpack(src);
    if src[3] <= 0.0 {
        return acc;
    }
    blend(acc, [src[0], src[1], src[2]], src[3] * opacity, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: [f32; 4], b: [f32; 4]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 0.01)
    }

    #[test]
    fn test_over_on_transparent_keeps_color() {
        let out = blend([0.0; 4], [1.0, 0.0, 0.0], 0.5, BlendMode::Over);
        assert!(approx(out, [1.0, 0.0, 0.0, 0.5]));
    }

    #[test]
    fn test_over_on_opaque() {
        // 50% red over white
        let out = blend([1.0, 1.0, 1.0, 1.0], [1.0, 0.0, 0.0], 0.5, BlendMode::Over);
        assert!(approx(out, [1.0, 0.5, 0.5, 1.0]));
    }

    #[test]
    fn test_erase_reduces_alpha_only() {
        let out = blend([0.2, 0.4, 0.6, 1.0], [0.0; 3], 0.25, BlendMode::Erase);
        assert!(approx(out, [0.2, 0.4, 0.6, 0.75]));
    }

    #[test]
    fn test_replace_discards_destination() {
        let dst = [0.2, 0.4, 0.6, 1.0];
        let out = blend(dst, [1.0, 0.0, 0.0], 0.3, BlendMode::Replace);
        assert!(approx(out, [1.0, 0.0, 0.0, 0.3]));
        assert_eq!(blend(dst, [1.0, 0.0, 0.0], 0.0, BlendMode::Replace), dst);

        // A half-transparent replace layer punches through what is below
        let out = composite([0.0, 0.0, 1.0, 1.0], [255, 255, 255, 128], BlendMode::Replace, 1.0);
        assert!(approx(out, [1.0, 1.0, 1.0, 0.5]));
    }

    #[test]
    fn test_multiply_and_add() {
        let dst = [0.5, 0.5, 0.5, 1.0];
        assert!(approx(blend(dst, [0.0, 1.0, 1.0], 1.0, BlendMode::Multiply), [0.0, 0.5, 0.5, 1.0]));
        assert!(approx(blend(dst, [1.0, 0.2, 0.0], 1.0, BlendMode::Add), [1.0, 0.7, 0.5, 1.0]));
    }

    #[test]
    fn test_falloff() {
        assert_eq!(falloff(0.0, 1.0, 2.0), 1.0);
        assert!((falloff(0.5, 1.0, 2.0) - 0.25).abs() < 1e-6);
        assert_eq!(falloff(1.5, 1.0, 1.0), 0.0);
        assert_eq!(falloff(0.9, 1.0, 0.0), 1.0);
        assert_eq!(falloff(0.0, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_pack_rounds() {
        assert_eq!(pack([1.0, 0.5, 0.0, 2.0]), [255, 128, 0, 255]);
        assert_eq!(unpack([255, 0, 0, 255]), [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_composite_skips_transparent() {
        let acc = [0.3, 0.3, 0.3, 1.0];
        assert_eq!(composite(acc, [255, 0, 0, 0], BlendMode::Over, 1.0), acc);
        let out = composite([0.0; 4], [255, 0, 0, 255], BlendMode::Over, 0.5);
        assert!(approx(out, [1.0, 0.0, 0.0, 0.5]));
    }
}
