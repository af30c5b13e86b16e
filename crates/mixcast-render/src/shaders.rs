// crates/mixcast-render/src/shaders.rs
//
// WGSL for every pass the compositor runs.
//
// Sprite and bicubic draws take a model-view-projection; the conversion
// passes (pack RGBA→planar, unpack planar→RGBA) are full-screen and
// compute clip coordinates straight from the quad, so their uniform is
// just the coefficient rows plus a texel-size vector.

/// Textured quad through an MVP. Also serves as the passthrough scaler.
pub const SPRITE: &str = r#"
struct SpriteUniform {
    mvp: mat4x4<f32>,
    params: vec4<f32>,
};

@group(0) @binding(0) var<uniform> u: SpriteUniform;
@group(0) @binding(1) var t_src: texture_2d<f32>;
@group(0) @binding(2) var s_src: sampler;

struct VertexIn {
    @location(0) pos: vec2<f32>,
    @location(1) uv: vec2<f32>,
};

struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(in: VertexIn) -> VertexOut {
    var out: VertexOut;
    out.clip = u.mvp * vec4<f32>(in.pos, 0.0, 1.0);
    out.uv = in.uv;
    return out;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    return textureSample(t_src, s_src, in.uv);
}
"#;

/// Catmull-Rom bicubic scaler; u.params.xy is the source texel size.
pub const BICUBIC: &str = r#"
struct SpriteUniform {
    mvp: mat4x4<f32>,
    params: vec4<f32>,
};

@group(0) @binding(0) var<uniform> u: SpriteUniform;
@group(0) @binding(1) var t_src: texture_2d<f32>;
@group(0) @binding(2) var s_src: sampler;

struct VertexIn {
    @location(0) pos: vec2<f32>,
    @location(1) uv: vec2<f32>,
};

struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(in: VertexIn) -> VertexOut {
    var out: VertexOut;
    out.clip = u.mvp * vec4<f32>(in.pos, 0.0, 1.0);
    out.uv = in.uv;
    return out;
}

fn weight(x: f32) -> f32 {
    let a = abs(x);
    if (a < 1.0) {
        return 1.5 * a * a * a - 2.5 * a * a + 1.0;
    }
    if (a < 2.0) {
        return -0.5 * a * a * a + 2.5 * a * a - 4.0 * a + 2.0;
    }
    return 0.0;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    let texel = u.params.xy;
    let src = in.uv / texel - 0.5;
    let base = floor(src);
    let f = src - base;

    var color = vec4<f32>(0.0);
    var total = 0.0;
    for (var y: i32 = -1; y <= 2; y = y + 1) {
        for (var x: i32 = -1; x <= 2; x = x + 1) {
            let w = weight(f32(x) - f.x) * weight(f32(y) - f.y);
            let uv = (base + vec2<f32>(f32(x), f32(y)) + 0.5) * texel;
            color = color + textureSample(t_src, s_src, uv) * w;
            total = total + w;
        }
    }
    return color / total;
}
"#;

/// RGBA → planar packing. One module, one entry point per target plane.
/// u.texel.x is the horizontal source texel step for the chroma 2-tap;
/// zero collapses both taps onto the same sample (full-resolution chroma).
pub const PACK: &str = r#"
struct PackUniform {
    row0: vec4<f32>,
    row1: vec4<f32>,
    row2: vec4<f32>,
    texel: vec4<f32>,
};

@group(0) @binding(0) var<uniform> u: PackUniform;
@group(0) @binding(1) var t_src: texture_2d<f32>;
@group(0) @binding(2) var s_src: sampler;

struct VertexIn {
    @location(0) pos: vec2<f32>,
    @location(1) uv: vec2<f32>,
};

struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(in: VertexIn) -> VertexOut {
    var out: VertexOut;
    out.clip = vec4<f32>(in.pos.x * 2.0 - 1.0, 1.0 - in.pos.y * 2.0, 0.0, 1.0);
    out.uv = in.uv;
    return out;
}

fn tap2(uv: vec2<f32>) -> vec4<f32> {
    let off = vec2<f32>(u.texel.x * 0.5, 0.0);
    let a = textureSample(t_src, s_src, uv - off);
    let b = textureSample(t_src, s_src, uv + off);
    return (a + b) * 0.5;
}

@fragment
fn fs_y(in: VertexOut) -> @location(0) vec4<f32> {
    let rgb = textureSample(t_src, s_src, in.uv);
    let y = dot(vec4<f32>(rgb.rgb, 1.0), u.row0);
    return vec4<f32>(y, 0.0, 0.0, 1.0);
}

@fragment
fn fs_u(in: VertexOut) -> @location(0) vec4<f32> {
    let rgb = tap2(in.uv);
    let c = dot(vec4<f32>(rgb.rgb, 1.0), u.row1);
    return vec4<f32>(c, 0.0, 0.0, 1.0);
}

@fragment
fn fs_v(in: VertexOut) -> @location(0) vec4<f32> {
    let rgb = tap2(in.uv);
    let c = dot(vec4<f32>(rgb.rgb, 1.0), u.row2);
    return vec4<f32>(c, 0.0, 0.0, 1.0);
}

@fragment
fn fs_uv(in: VertexOut) -> @location(0) vec4<f32> {
    let rgb = tap2(in.uv);
    let cu = dot(vec4<f32>(rgb.rgb, 1.0), u.row1);
    let cv = dot(vec4<f32>(rgb.rgb, 1.0), u.row2);
    return vec4<f32>(cu, cv, 0.0, 1.0);
}
"#;

/// Planar I420 → RGBA, for async-source frame uploads.
pub const UNPACK_I420: &str = r#"
struct PackUniform {
    row0: vec4<f32>,
    row1: vec4<f32>,
    row2: vec4<f32>,
    texel: vec4<f32>,
};

@group(0) @binding(0) var<uniform> u: PackUniform;
@group(0) @binding(1) var t_y: texture_2d<f32>;
@group(0) @binding(2) var t_u: texture_2d<f32>;
@group(0) @binding(3) var t_v: texture_2d<f32>;
@group(0) @binding(4) var s_src: sampler;

struct VertexIn {
    @location(0) pos: vec2<f32>,
    @location(1) uv: vec2<f32>,
};

struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(in: VertexIn) -> VertexOut {
    var out: VertexOut;
    out.clip = vec4<f32>(in.pos.x * 2.0 - 1.0, 1.0 - in.pos.y * 2.0, 0.0, 1.0);
    out.uv = in.uv;
    return out;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    let y = textureSample(t_y, s_src, in.uv).r;
    let cu = textureSample(t_u, s_src, in.uv).r;
    let cv = textureSample(t_v, s_src, in.uv).r;
    let yuv = vec4<f32>(y, cu, cv, 1.0);
    let r = dot(yuv, u.row0);
    let g = dot(yuv, u.row1);
    let b = dot(yuv, u.row2);
    return vec4<f32>(clamp(vec3<f32>(r, g, b), vec3<f32>(0.0), vec3<f32>(1.0)), 1.0);
}
"#;

/// Semi-planar NV12 → RGBA.
pub const UNPACK_NV12: &str = r#"
struct PackUniform {
    row0: vec4<f32>,
    row1: vec4<f32>,
    row2: vec4<f32>,
    texel: vec4<f32>,
};

@group(0) @binding(0) var<uniform> u: PackUniform;
@group(0) @binding(1) var t_y: texture_2d<f32>;
@group(0) @binding(2) var t_uv: texture_2d<f32>;
@group(0) @binding(3) var s_src: sampler;

struct VertexIn {
    @location(0) pos: vec2<f32>,
    @location(1) uv: vec2<f32>,
};

struct VertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(in: VertexIn) -> VertexOut {
    var out: VertexOut;
    out.clip = vec4<f32>(in.pos.x * 2.0 - 1.0, 1.0 - in.pos.y * 2.0, 0.0, 1.0);
    out.uv = in.uv;
    return out;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    let y = textureSample(t_y, s_src, in.uv).r;
    let c = textureSample(t_uv, s_src, in.uv).rg;
    let yuv = vec4<f32>(y, c.x, c.y, 1.0);
    let r = dot(yuv, u.row0);
    let g = dot(yuv, u.row1);
    let b = dot(yuv, u.row2);
    return vec4<f32>(clamp(vec3<f32>(r, g, b), vec3<f32>(0.0), vec3<f32>(1.0)), 1.0);
}
"#;
