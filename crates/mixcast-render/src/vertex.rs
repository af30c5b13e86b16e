// crates/mixcast-render/src/vertex.rs
//
// The one vertex buffer every pass shares: a unit quad as two triangles,
// position in [0,1]² with matching texture coordinates. Sprite draws run
// it through a model-view-projection; the full-screen conversion passes
// stretch it to clip space in the vertex shader.

use wgpu::util::DeviceExt;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
}

pub const QUAD_VERTICES: [Vertex; 6] = [
    Vertex { pos: [0.0, 0.0], uv: [0.0, 0.0] },
    Vertex { pos: [1.0, 0.0], uv: [1.0, 0.0] },
    Vertex { pos: [0.0, 1.0], uv: [0.0, 1.0] },
    Vertex { pos: [1.0, 0.0], uv: [1.0, 0.0] },
    Vertex { pos: [1.0, 1.0], uv: [1.0, 1.0] },
    Vertex { pos: [0.0, 1.0], uv: [0.0, 1.0] },
];

pub fn create_quad_buffer(device: &wgpu::Device) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("mixcast quad"),
        contents: bytemuck::cast_slice(&QUAD_VERTICES),
        usage: wgpu::BufferUsages::VERTEX,
    })
}

pub fn vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    const ATTRS: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<Vertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &ATTRS,
    }
}
