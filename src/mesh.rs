// Mesh data shared by every demo
//
// Positions are given in NDC with Y up; the vertex shaders flip Y for
// Vulkan's Y-down clip space.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::mem::{offset_of, size_of};

pub type IndexType = u32;
pub const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub col: [u8; 4],
    pub uv: [f32; 2],
}

impl Vertex {
    fn new(pos: [f32; 2], col: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            pos: [pos[0], pos[1], 0.0],
            normal: [0.0, 0.0, 1.0],
            col: [unorm8(col[0]), unorm8(col[1]), unorm8(col[2]), 255],
            uv,
        }
    }

    /// Colour as floats in 0..=1
    pub fn color(&self) -> [f32; 4] {
        self.col.map(|c| c as f32 / 255.0)
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    /// position (0), colour (1), uv (2)
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R8G8B8A8_UNORM,
                offset: offset_of!(Vertex, col) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, uv) as u32,
            },
        ]
    }
}

/// Truncating float to byte conversion, `255 * c` cast like the asset tables expect
fn unorm8(c: f32) -> u8 {
    (255.0 * c) as u8
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<IndexType>,
}

impl Mesh {
    pub fn triangle() -> Self {
        Self {
            vertices: vec![
                Vertex::new([0.0, 0.4], [0.8, 0.0, 0.6], [0.5, 0.0]),   // MIDDLE_TOP
                Vertex::new([0.25, -0.4], [0.1, 0.6, 0.4], [1.0, 1.0]), // BOTTOM_RIGHT
                Vertex::new([-0.25, -0.4], [0.0, 0.5, 1.0], [0.0, 1.0]), // BOTTOM_LEFT
            ],
            indices: vec![0, 1, 2],
        }
    }

    pub fn quad() -> Self {
        Self {
            vertices: vec![
                Vertex::new([0.25, 0.4], [0.5, 0.3, 0.6], [1.0, 0.0]),   // TOP_RIGHT
                Vertex::new([-0.25, 0.4], [0.8, 0.0, 0.6], [0.0, 0.0]),  // TOP_LEFT
                Vertex::new([0.25, -0.4], [0.1, 0.6, 0.4], [1.0, 1.0]),  // BOTTOM_RIGHT
                Vertex::new([-0.25, -0.4], [0.0, 0.5, 1.0], [0.0, 1.0]), // BOTTOM_LEFT
            ],
            indices: vec![
                1, 2, 3, // lower left triangle
                0, 2, 1, // upper right triangle
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(size_of::<Vertex>(), 36);
        let attrs = Vertex::attribute_descriptions();
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].offset, 24);
        assert_eq!(attrs[2].offset, 28);
        assert_eq!(Vertex::binding_description().stride, 36);
    }

    #[test]
    fn colors_use_truncating_conversion() {
        let triangle = Mesh::triangle();
        assert_eq!(triangle.vertices[0].col, [204, 0, 153, 255]);
        assert_eq!(triangle.vertices[1].col, [25, 153, 102, 255]);
        assert_eq!(triangle.vertices[2].col, [0, 127, 255, 255]);
    }

    #[test]
    fn indices_stay_in_range() {
        for mesh in [Mesh::triangle(), Mesh::quad()] {
            assert_eq!(mesh.indices.len() % 3, 0);
            assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
        }
    }

    #[test]
    fn quad_uvs_cover_unit_square() {
        let quad = Mesh::quad();
        let (min, max) = quad.vertices.iter().fold(([1.0f32; 2], [0.0f32; 2]), |(lo, hi), v| {
            (
                [lo[0].min(v.uv[0]), lo[1].min(v.uv[1])],
                [hi[0].max(v.uv[0]), hi[1].max(v.uv[1])],
            )
        });
        assert_eq!(min, [0.0, 0.0]);
        assert_eq!(max, [1.0, 1.0]);
    }
}
