// Meshes - vertex format, generated shapes, GPU upload
//
// Front faces are counter-clockwise seen from outside; the projection flips Y
// for Vulkan so this matches FrontFace::COUNTER_CLOCKWISE.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::f32::consts::PI;
use std::sync::Arc;

use crate::backend::pipeline::VertexLayout;
use crate::backend::{GpuBuffer, VulkanDevice};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn vertex_layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Vertex>() as u32,
            attributes: vec![
                (0, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, position) as u32),
                (1, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, normal) as u32),
                (2, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(Vertex, uv) as u32),
            ],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Unit cube centred on the origin, 4 vertices per face for flat normals
pub fn cube() -> MeshData {
    // (normal, u axis, v axis) with u x v = normal
    let faces = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];
    let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut mesh = MeshData::default();
    for (normal, u, v) in faces {
        let base = mesh.vertices.len() as u32;
        for (cu, cv) in corners {
            let position = (normal + u * cu + v * cv) * 0.5;
            mesh.vertices.push(Vertex {
                position: position.to_array(),
                normal: normal.to_array(),
                uv: [(cu + 1.0) * 0.5, 1.0 - (cv + 1.0) * 0.5],
            });
        }
        mesh.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    mesh
}

/// Unit-radius sphere; `segments` around the equator, `rings` pole to pole
pub fn uv_sphere(segments: u32, rings: u32) -> MeshData {
    let segments = segments.max(3);
    let rings = rings.max(2);
    let mut mesh = MeshData::default();

    for ring in 0..=rings {
        let theta = PI * ring as f32 / rings as f32;
        for segment in 0..=segments {
            let phi = 2.0 * PI * segment as f32 / segments as f32;
            let normal = Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
            mesh.vertices.push(Vertex {
                position: normal.to_array(),
                normal: normal.to_array(),
                uv: [segment as f32 / segments as f32, ring as f32 / rings as f32],
            });
        }
    }

    let stride = segments + 1;
    for ring in 0..rings {
        for segment in 0..segments {
            let a = ring * stride + segment;
            let b = a + stride;
            let c = a + 1;
            let d = b + 1;
            mesh.indices.extend_from_slice(&[a, c, b, c, d, b]);
        }
    }
    mesh
}

/// Index into the viewer's mesh list
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeshId(pub u32);

pub struct GpuMesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
}

impl GpuMesh {
    pub fn upload(device: &Arc<VulkanDevice>, mesh: &MeshData, name: &str) -> Result<Self> {
        let vertex_buffer = GpuBuffer::with_data(
            device,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
            &format!("{name} vertices"),
        )?;
        let index_buffer = GpuBuffer::with_data(
            device,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
            &format!("{name} indices"),
        )?;
        log::debug!(
            "Uploaded mesh '{}': {} vertices, {} indices",
            name,
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
        })
    }

    pub fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangles(mesh: &MeshData) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        mesh.indices.chunks(3).map(|tri| {
            tri.iter()
                .map(|&i| Vec3::from(mesh.vertices[i as usize].position))
                .collect::<Vec<_>>()
                .try_into()
                .unwrap()
        })
    }

    #[test]
    fn test_vertex_layout_matches_struct() {
        let layout = Vertex::vertex_layout();
        assert_eq!(layout.stride, 32);
        let offsets: Vec<u32> = layout.attributes.iter().map(|a| a.2).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }

    #[test]
    fn test_cube_counts_and_bounds() {
        let mesh = cube();
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.indices.len(), 36);
        for v in &mesh.vertices {
            assert!(v.position.iter().all(|c| c.abs() == 0.5));
        }
    }

    #[test]
    fn test_cube_faces_wind_outward() {
        let mesh = cube();
        for [a, b, c] in triangles(&mesh) {
            let facing = (b - a).cross(c - a);
            let centre = (a + b + c) / 3.0;
            assert!(facing.dot(centre) > 0.0, "inward triangle at {centre:?}");
        }
    }

    #[test]
    fn test_sphere_counts() {
        let mesh = uv_sphere(16, 8);
        assert_eq!(mesh.vertices.len(), 17 * 9);
        assert_eq!(mesh.indices.len(), 16 * 8 * 6);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
        for v in &mesh.vertices {
            assert!((Vec3::from(v.position).length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sphere_winds_outward() {
        let mesh = uv_sphere(12, 6);
        let mut outward = 0;
        for [a, b, c] in triangles(&mesh) {
            let facing = (b - a).cross(c - a);
            let centre = (a + b + c) / 3.0;
            // Pole triangles are degenerate
            assert!(facing.dot(centre) > -1e-6);
            if facing.dot(centre) > 1e-6 {
                outward += 1;
            }
        }
        assert!(outward >= 12 * (6 - 2) * 2);
    }

    #[test]
    fn test_degenerate_sphere_params_are_clamped() {
        let mesh = uv_sphere(0, 0);
        assert_eq!(mesh.indices.len(), 3 * 2 * 6);
    }
}
