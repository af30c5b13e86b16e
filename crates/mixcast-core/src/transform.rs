// crates/mixcast-core/src/transform.rs
//
// Per-source affine placement and z-order movement.
//
// The compositor draws every source as a unit quad; the transform turns
// that quad into the source's on-canvas footprint. Composition order is
// fixed — scale about the origin, rotate about the origin, mirror per axis
// about the content center, translate, then (optionally) fit into the
// render box. There is no general matrix API on the public surface.
//
// Matrices are 4×4 column-major, ready for a GPU uniform upload.

pub type Mat4 = [[f32; 4]; 4];

// ── Matrix helpers ────────────────────────────────────────────────────────────

pub fn mat4_identity() -> Mat4 {
    let mut m = [[0.0; 4]; 4];
    for (i, col) in m.iter_mut().enumerate() {
        col[i] = 1.0;
    }
    m
}

/// `a * b` (column-major; `b` applies first).
pub fn mat4_mul(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [[0.0; 4]; 4];
    for (c, out_col) in out.iter_mut().enumerate() {
        for (r, out_cell) in out_col.iter_mut().enumerate() {
            *out_cell = (0..4).map(|k| a[k][r] * b[c][k]).sum();
        }
    }
    out
}

pub fn mat4_translate(x: f32, y: f32) -> Mat4 {
    let mut m = mat4_identity();
    m[3][0] = x;
    m[3][1] = y;
    m
}

pub fn mat4_scale(x: f32, y: f32) -> Mat4 {
    let mut m = mat4_identity();
    m[0][0] = x;
    m[1][1] = y;
    m
}

pub fn mat4_rotate_z(radians: f32) -> Mat4 {
    let (s, c) = radians.sin_cos();
    let mut m = mat4_identity();
    m[0][0] = c;
    m[0][1] = s;
    m[1][0] = -s;
    m[1][1] = c;
    m
}

/// Pixel-space orthographic projection with y down, matching the canvas.
pub fn mat4_ortho(width: f32, height: f32) -> Mat4 {
    let mut m = mat4_identity();
    m[0][0] = 2.0 / width;
    m[1][1] = -2.0 / height;
    m[3][0] = -1.0;
    m[3][1] = 1.0;
    m
}

pub fn mat4_apply(m: &Mat4, x: f32, y: f32) -> (f32, f32) {
    (
        m[0][0] * x + m[1][0] * y + m[3][0],
        m[0][1] * x + m[1][1] * y + m[3][1],
    )
}

// ── Transform ─────────────────────────────────────────────────────────────────

/// How content is reconciled with a render box whose aspect differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleFit {
    /// Stretch to fill the box exactly.
    #[default]
    Ignore,
    /// Letterbox: uniform scale, whole content visible inside the box.
    Keep,
    /// Crop: uniform scale, box fully covered, overflow clipped.
    KeepByExpanding,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub fit: ScaleFit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceTransform {
    pub pos: (f32, f32),
    pub scale: (f32, f32),
    pub rotation_deg: f32,
    pub flip_h: bool,
    pub flip_v: bool,
    pub render_box: Option<RenderBox>,
}

impl Default for SourceTransform {
    fn default() -> Self {
        Self {
            pos: (0.0, 0.0),
            scale: (1.0, 1.0),
            rotation_deg: 0.0,
            flip_h: false,
            flip_v: false,
            render_box: None,
        }
    }
}

impl SourceTransform {
    /// Model matrix placing a unit quad of `src_w × src_h` content.
    pub fn model_matrix(&self, src_w: f32, src_h: f32) -> Mat4 {
        let sw = src_w * self.scale.0;
        let sh = src_h * self.scale.1;

        // scale → rotate
        let mut m = mat4_mul(
            &mat4_rotate_z(self.rotation_deg.to_radians()),
            &mat4_scale(sw, sh),
        );

        // mirror per axis about the (rotated) content center, so a flip
        // never moves the content
        if self.flip_h || self.flip_v {
            let (cx, cy) = {
                let (ax, ay) = mat4_apply(&m, 0.5, 0.5);
                (ax, ay)
            };
            let fx = if self.flip_h { -1.0 } else { 1.0 };
            let fy = if self.flip_v { -1.0 } else { 1.0 };
            let mirror = mat4_mul(
                &mat4_translate(cx - fx * cx, cy - fy * cy),
                &mat4_scale(fx, fy),
            );
            m = mat4_mul(&mirror, &m);
        }

        match self.render_box {
            None => mat4_mul(&mat4_translate(self.pos.0, self.pos.1), &m),
            Some(rb) => {
                let (min, max) = quad_aabb(&m);
                let cw = (max.0 - min.0).max(f32::EPSILON);
                let ch = (max.1 - min.1).max(f32::EPSILON);
                let (fx, fy) = match rb.fit {
                    ScaleFit::Ignore => (rb.width / cw, rb.height / ch),
                    ScaleFit::Keep => {
                        let s = (rb.width / cw).min(rb.height / ch);
                        (s, s)
                    }
                    ScaleFit::KeepByExpanding => {
                        let s = (rb.width / cw).max(rb.height / ch);
                        (s, s)
                    }
                };
                // center the fitted content in the box
                let ox = rb.x + (rb.width - cw * fx) * 0.5 - min.0 * fx;
                let oy = rb.y + (rb.height - ch * fy) * 0.5 - min.1 * fy;
                let fit = mat4_mul(&mat4_translate(ox, oy), &mat4_scale(fx, fy));
                mat4_mul(&fit, &m)
            }
        }
    }

    /// Scissor rectangle for crop fitting; the compositor clips the draw
    /// to the box when KeepByExpanding overflows it.
    pub fn clip_rect(&self) -> Option<(f32, f32, f32, f32)> {
        self.render_box
            .filter(|rb| rb.fit == ScaleFit::KeepByExpanding)
            .map(|rb| (rb.x, rb.y, rb.width, rb.height))
    }
}

fn quad_aabb(m: &Mat4) -> ((f32, f32), (f32, f32)) {
    let corners = [
        mat4_apply(m, 0.0, 0.0),
        mat4_apply(m, 1.0, 0.0),
        mat4_apply(m, 0.0, 1.0),
        mat4_apply(m, 1.0, 1.0),
    ];
    let mut min = (f32::MAX, f32::MAX);
    let mut max = (f32::MIN, f32::MIN);
    for (x, y) in corners {
        min.0 = min.0.min(x);
        min.1 = min.1.min(y);
        max.0 = max.0.max(x);
        max.1 = max.1.max(y);
    }
    (min, max)
}

// ── Z-order ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMovement {
    UpOne,
    DownOne,
    ToTop,
    ToBottom,
}

/// Move `list[idx]` per `movement`; returns the element's new index.
/// Index 0 is the bottom of the stack.
pub fn apply_movement<T>(list: &mut Vec<T>, idx: usize, movement: OrderMovement) -> usize {
    if idx >= list.len() {
        return idx;
    }
    let last = list.len() - 1;
    let new_idx = match movement {
        OrderMovement::UpOne => (idx + 1).min(last),
        OrderMovement::DownOne => idx.saturating_sub(1),
        OrderMovement::ToTop => last,
        OrderMovement::ToBottom => 0,
    };
    let item = list.remove(idx);
    list.insert(new_idx, item);
    new_idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn identity_transform_spans_source_size() {
        let t = SourceTransform::default();
        let m = t.model_matrix(320.0, 240.0);
        assert_eq!(mat4_apply(&m, 0.0, 0.0), (0.0, 0.0));
        assert_eq!(mat4_apply(&m, 1.0, 1.0), (320.0, 240.0));
    }

    #[test]
    fn translate_then_scale_order() {
        let t = SourceTransform {
            pos: (100.0, 50.0),
            scale: (2.0, 2.0),
            ..Default::default()
        };
        let m = t.model_matrix(10.0, 10.0);
        assert_eq!(mat4_apply(&m, 0.0, 0.0), (100.0, 50.0));
        assert_eq!(mat4_apply(&m, 1.0, 1.0), (120.0, 70.0));
    }

    #[test]
    fn horizontal_flip_keeps_footprint() {
        let t = SourceTransform {
            pos: (10.0, 0.0),
            flip_h: true,
            ..Default::default()
        };
        let m = t.model_matrix(100.0, 100.0);
        // left edge of the quad now lands on the right edge of the footprint
        let (x0, _) = mat4_apply(&m, 0.0, 0.0);
        let (x1, _) = mat4_apply(&m, 1.0, 0.0);
        assert!(close(x0, 110.0));
        assert!(close(x1, 10.0));
    }

    #[test]
    fn rotation_rotates_about_origin() {
        let t = SourceTransform {
            rotation_deg: 90.0,
            ..Default::default()
        };
        let m = t.model_matrix(10.0, 10.0);
        let (x, y) = mat4_apply(&m, 1.0, 0.0);
        assert!(close(x, 0.0) && close(y, 10.0));
    }

    #[test]
    fn keep_fit_letterboxes() {
        let t = SourceTransform {
            render_box: Some(RenderBox {
                x: 0.0,
                y: 0.0,
                width: 200.0,
                height: 200.0,
                fit: ScaleFit::Keep,
            }),
            ..Default::default()
        };
        // 2:1 content into a square box → fills width, centered in height
        let m = t.model_matrix(100.0, 50.0);
        let (min, max) = super::quad_aabb(&m);
        assert!(close(min.0, 0.0) && close(max.0, 200.0));
        assert!(close(min.1, 50.0) && close(max.1, 150.0));
    }

    #[test]
    fn expand_fit_covers_box() {
        let t = SourceTransform {
            render_box: Some(RenderBox {
                x: 0.0,
                y: 0.0,
                width: 200.0,
                height: 200.0,
                fit: ScaleFit::KeepByExpanding,
            }),
            ..Default::default()
        };
        let m = t.model_matrix(100.0, 50.0);
        let (min, max) = super::quad_aabb(&m);
        // covers the full box, overflowing horizontally
        assert!(min.0 <= 0.0 && max.0 >= 200.0);
        assert!(close(min.1, 0.0) && close(max.1, 200.0));
        assert!(t.clip_rect().is_some());
    }

    #[test]
    fn ortho_maps_canvas_to_ndc() {
        let p = mat4_ortho(1280.0, 720.0);
        assert_eq!(mat4_apply(&p, 0.0, 0.0), (-1.0, 1.0));
        assert_eq!(mat4_apply(&p, 1280.0, 720.0), (1.0, -1.0));
    }

    #[test]
    fn movement_commands() {
        let mut v = vec!['a', 'b', 'c', 'd'];
        assert_eq!(apply_movement(&mut v, 1, OrderMovement::ToTop), 3);
        assert_eq!(v, vec!['a', 'c', 'd', 'b']);
        assert_eq!(apply_movement(&mut v, 2, OrderMovement::DownOne), 1);
        assert_eq!(v, vec!['a', 'd', 'c', 'b']);
        assert_eq!(apply_movement(&mut v, 0, OrderMovement::DownOne), 0);
        assert_eq!(apply_movement(&mut v, 3, OrderMovement::UpOne), 3);
    }
}
