// crates/mixcast-render/src/matrices.rs
//
// RGB↔YUV coefficient rows for the conversion shaders.
//
// Each row is a vec4 dotted with (r, g, b, 1) — or (y, u, v, 1) for the
// unpack direction — in normalized [0,1] texture values. Rows are derived
// from the colorimetry constants Kr/Kb rather than hard-coded tables, and
// the range scaling (partial: luma 16–235, chroma 16–240 in 8-bit terms)
// is folded into the rows.

use mixcast_core::frame::{ColorRange, ColorSpace};

/// Row set for one direction of conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionRows {
    pub row0: [f32; 4],
    pub row1: [f32; 4],
    pub row2: [f32; 4],
}

struct Colorimetry {
    kr: f32,
    kb: f32,
}

fn colorimetry(cs: ColorSpace) -> Colorimetry {
    match cs {
        // default resolves to 601, matching the rest of the pipeline
        ColorSpace::Default | ColorSpace::Bt601 => Colorimetry {
            kr: 0.299,
            kb: 0.114,
        },
        ColorSpace::Bt709 => Colorimetry {
            kr: 0.2126,
            kb: 0.0722,
        },
    }
}

struct RangeScale {
    y_scale: f32,
    y_offset: f32,
    uv_scale: f32,
}

fn range_scale(range: ColorRange) -> RangeScale {
    match range {
        ColorRange::Default | ColorRange::Partial => RangeScale {
            y_scale: 219.0 / 255.0,
            y_offset: 16.0 / 255.0,
            uv_scale: 224.0 / 255.0,
        },
        ColorRange::Full => RangeScale {
            y_scale: 1.0,
            y_offset: 0.0,
            uv_scale: 1.0,
        },
    }
}

const UV_CENTER: f32 = 128.0 / 255.0;

/// Rows mapping (r, g, b, 1) → stored (y, u, v).
pub fn rgb_to_yuv(cs: ColorSpace, range: ColorRange) -> ConversionRows {
    let c = colorimetry(cs);
    let s = range_scale(range);
    let kg = 1.0 - c.kr - c.kb;

    let y = [c.kr, kg, c.kb];
    // U = 0.5 * (B - Y) / (1 - Kb); V = 0.5 * (R - Y) / (1 - Kr)
    let su = 0.5 / (1.0 - c.kb);
    let sv = 0.5 / (1.0 - c.kr);
    let u = [-c.kr * su, -kg * su, (1.0 - c.kb) * su];
    let v = [(1.0 - c.kr) * sv, -kg * sv, -c.kb * sv];

    ConversionRows {
        row0: [
            y[0] * s.y_scale,
            y[1] * s.y_scale,
            y[2] * s.y_scale,
            s.y_offset,
        ],
        row1: [
            u[0] * s.uv_scale,
            u[1] * s.uv_scale,
            u[2] * s.uv_scale,
            UV_CENTER,
        ],
        row2: [
            v[0] * s.uv_scale,
            v[1] * s.uv_scale,
            v[2] * s.uv_scale,
            UV_CENTER,
        ],
    }
}

/// Rows mapping stored (y, u, v, 1) → (r, g, b) — used when async-source
/// YUV frames are unpacked into their RGBA source texture.
pub fn yuv_to_rgb(cs: ColorSpace, range: ColorRange) -> ConversionRows {
    let c = colorimetry(cs);
    let s = range_scale(range);
    let kg = 1.0 - c.kr - c.kb;

    let ys = 1.0 / s.y_scale;
    let us = 1.0 / s.uv_scale;

    // r = y' + 2(1-Kr) v'; b = y' + 2(1-Kb) u'; g from the luma identity
    let rv = 2.0 * (1.0 - c.kr) * us;
    let bu = 2.0 * (1.0 - c.kb) * us;
    let gu = -bu * c.kb / kg;
    let gv = -rv * c.kr / kg;

    // fold the stored-value offsets into the constant column
    let r_const = -(s.y_offset * ys) - rv * UV_CENTER;
    let g_const = -(s.y_offset * ys) - gu * UV_CENTER - gv * UV_CENTER;
    let b_const = -(s.y_offset * ys) - bu * UV_CENTER;

    ConversionRows {
        row0: [ys, 0.0, rv, r_const],
        row1: [ys, gu, gv, g_const],
        row2: [ys, bu, 0.0, b_const],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(row: [f32; 4], rgb: [f32; 3]) -> f32 {
        row[0] * rgb[0] + row[1] * rgb[1] + row[2] * rgb[2] + row[3]
    }

    #[test]
    fn white_maps_to_partial_range_peaks() {
        let rows = rgb_to_yuv(ColorSpace::Bt709, ColorRange::Partial);
        let white = [1.0, 1.0, 1.0];
        assert!((dot(rows.row0, white) - 235.0 / 255.0).abs() < 1e-4);
        assert!((dot(rows.row1, white) - 128.0 / 255.0).abs() < 1e-4);
        assert!((dot(rows.row2, white) - 128.0 / 255.0).abs() < 1e-4);
    }

    #[test]
    fn black_sits_at_range_floor() {
        let rows = rgb_to_yuv(ColorSpace::Bt601, ColorRange::Partial);
        let black = [0.0, 0.0, 0.0];
        assert!((dot(rows.row0, black) - 16.0 / 255.0).abs() < 1e-4);
        assert!((dot(rows.row1, black) - 128.0 / 255.0).abs() < 1e-4);
    }

    #[test]
    fn full_range_601_luma_weights() {
        let rows = rgb_to_yuv(ColorSpace::Bt601, ColorRange::Full);
        assert!((rows.row0[0] - 0.299).abs() < 1e-6);
        assert!((rows.row0[1] - 0.587).abs() < 1e-6);
        assert!((rows.row0[2] - 0.114).abs() < 1e-6);
    }

    #[test]
    fn pack_then_unpack_is_identity() {
        for range in [ColorRange::Partial, ColorRange::Full] {
            let pack = rgb_to_yuv(ColorSpace::Bt709, range);
            let unpack = yuv_to_rgb(ColorSpace::Bt709, range);
            for rgb in [[0.2, 0.5, 0.8], [1.0, 0.0, 0.0], [0.5, 0.5, 0.5]] {
                let yuv = [
                    dot(pack.row0, rgb),
                    dot(pack.row1, rgb),
                    dot(pack.row2, rgb),
                ];
                let back = [
                    dot(unpack.row0, yuv),
                    dot(unpack.row1, yuv),
                    dot(unpack.row2, yuv),
                ];
                for (a, b) in rgb.iter().zip(back.iter()) {
                    assert!((a - b).abs() < 1e-3, "{rgb:?} -> {yuv:?} -> {back:?}");
                }
            }
        }
    }

    #[test]
    fn default_space_is_601() {
        assert_eq!(
            rgb_to_yuv(ColorSpace::Default, ColorRange::Partial),
            rgb_to_yuv(ColorSpace::Bt601, ColorRange::Partial)
        );
    }
}
