// SPDX-License-Identifier: CEPL-1.0
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use kestrel_math::{Transform, Vec3};
use tracing::debug;

use crate::command::CommandRecorder;
use crate::context::DeviceContext;
use crate::error::{VkError, VkResult};
use crate::memory::{upload_via_staging, GpuBuffer};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, normal) as u32,
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

/// Host-side geometry, counter-clockwise front faces.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Unit cube centred on the origin, four vertices per face.
    pub fn cube() -> Self {
        // (normal, u, v) with u x v == normal.
        let faces = [
            (Vec3::X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
        ];
        let mut data = MeshData::default();
        for (n, u, v) in faces {
            data.push_face(n * 0.5, n, u * 0.5, v * 0.5);
        }
        data
    }

    /// Unit quad in the XY plane facing +Z.
    pub fn quad() -> Self {
        let mut data = MeshData::default();
        data.push_face(Vec3::ZERO, Vec3::Z, Vec3::X * 0.5, Vec3::Y * 0.5);
        data
    }

    fn push_face(&mut self, center: Vec3, normal: Vec3, u: Vec3, v: Vec3) {
        let base = self.vertices.len() as u32;
        let corners = [
            (center - u - v, [0.0, 1.0]),
            (center + u - v, [1.0, 1.0]),
            (center + u + v, [1.0, 0.0]),
            (center - u + v, [0.0, 0.0]),
        ];
        for (p, uv) in corners {
            self.vertices.push(Vertex {
                position: p.to_array(),
                normal: normal.to_array(),
                uv,
            });
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }
}

/// Device-local vertex and index buffers.
pub struct Mesh {
    vertices: GpuBuffer,
    indices: GpuBuffer,
    index_count: u32,
}

impl Mesh {
    pub fn upload(
        ctx: &Arc<DeviceContext>,
        recorder: &CommandRecorder,
        data: &MeshData,
    ) -> VkResult<Self> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&data.indices);

        let vertices = GpuBuffer::new(
            ctx,
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        upload_via_staging(ctx, recorder, &vertices, vertex_bytes)?;

        let indices = GpuBuffer::new(
            ctx,
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        upload_via_staging(ctx, recorder, &indices, index_bytes)?;

        debug!(
            vertices = data.vertices.len(),
            indices = data.indices.len(),
            "mesh uploaded"
        );
        Ok(Mesh {
            vertices,
            indices,
            index_count: data.indices.len() as u32,
        })
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.handle()
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.handle()
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Index of a mesh owned by the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(pub usize);

impl MeshId {
    /// The mesh this id names in `loaded`, or `UnknownMesh`.
    pub fn lookup<T>(self, loaded: &[T]) -> VkResult<&T> {
        loaded.get(self.0).ok_or(VkError::UnknownMesh {
            id: self.0,
            loaded: loaded.len(),
        })
    }
}

/// A mesh reference plus where to draw it.
#[derive(Clone, Copy, Debug)]
pub struct Drawable {
    pub mesh: MeshId,
    pub transform: Transform,
}

impl Drawable {
    pub fn new(mesh: MeshId, transform: Transform) -> Self {
        Drawable { mesh, transform }
    }
}
