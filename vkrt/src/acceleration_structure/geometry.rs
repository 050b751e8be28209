//! Triangle meshes and their description as acceleration structure build input.

use crate::{
    buffer::{Buffer, BufferUsage},
    DeviceAddress, DeviceSize, Validated, ValidationError, VulkanError,
};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::{mem::size_of, sync::Arc};

/// A vertex of a triangle mesh, as laid out in the vertex buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
}

impl Vertex {
    /// The format the acceleration structure build reads positions with.
    pub const FORMAT: vk::Format = vk::Format::R32G32B32_SFLOAT;

    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Vertex {
            position: [x, y, z],
        }
    }
}

impl From<[f32; 3]> for Vertex {
    #[inline]
    fn from(position: [f32; 3]) -> Self {
        Vertex { position }
    }
}

/// The usage every mesh buffer must have to be read by an acceleration structure build.
const MESH_BUFFER_USAGE: BufferUsage = BufferUsage::from_raw(
    BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | BufferUsage::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// An indexed triangle list, together with the device buffers holding it.
///
/// Every three consecutive indices form a triangle. The index count must be a multiple of three
/// and every index must be smaller than the vertex count; neither is checked outside of debug
/// builds.
#[derive(Debug)]
pub struct Mesh {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    vertex_buffer: Arc<Buffer>,
    index_buffer: Arc<Buffer>,
    vertex_address: DeviceAddress,
    index_address: DeviceAddress,
}

impl Mesh {
    /// Uploads `vertices` and `indices` into new host-visible buffers.
    pub fn new(
        device: Arc<dyn crate::device::Device>,
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
    ) -> Result<Mesh, Validated<VulkanError>> {
        let vertex_buffer = Buffer::from_slice(
            device.clone(),
            MESH_BUFFER_USAGE | BufferUsage::VERTEX_BUFFER | BufferUsage::STORAGE_BUFFER,
            &vertices,
        )
        .map_err(|err| add_context(err, "vertices"))?;
        let index_buffer = Buffer::from_slice(
            device,
            MESH_BUFFER_USAGE | BufferUsage::INDEX_BUFFER | BufferUsage::STORAGE_BUFFER,
            &indices,
        )
        .map_err(|err| add_context(err, "indices"))?;

        Ok(Mesh::from_buffers(
            vertices,
            indices,
            Arc::new(vertex_buffer),
            Arc::new(index_buffer),
        )?)
    }

    /// Wraps buffers that already hold `vertices` and `indices`.
    ///
    /// Both buffers must have been created with `SHADER_DEVICE_ADDRESS` and
    /// `ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR` usage.
    pub fn from_buffers(
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        vertex_buffer: Arc<Buffer>,
        index_buffer: Arc<Buffer>,
    ) -> Result<Mesh, Box<ValidationError>> {
        debug_assert!(indices.len() % 3 == 0);
        debug_assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));

        for (buffer, context) in [
            (&vertex_buffer, "vertex_buffer"),
            (&index_buffer, "index_buffer"),
        ] {
            if !buffer.usage().contains(MESH_BUFFER_USAGE) {
                return Err(Box::new(ValidationError {
                    context: format!("{context}.usage()").into(),
                    problem: "does not contain both `SHADER_DEVICE_ADDRESS` and \
                        `ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR`"
                        .into(),
                    vuids: &["VUID-vkCmdBuildAccelerationStructuresKHR-geometry-03673"],
                }));
            }
        }

        let vertex_address = vertex_buffer
            .device_address()
            .map_err(|err| err.add_context("vertex_buffer"))?;
        let index_address = index_buffer
            .device_address()
            .map_err(|err| err.add_context("index_buffer"))?;

        Ok(Mesh {
            vertices,
            indices,
            vertex_buffer,
            index_buffer,
            vertex_address,
            index_address,
        })
    }

    #[inline]
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    #[inline]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    #[inline]
    pub fn vertex_buffer(&self) -> &Arc<Buffer> {
        &self.vertex_buffer
    }

    #[inline]
    pub fn index_buffer(&self) -> &Arc<Buffer> {
        &self.index_buffer
    }

    /// Returns the number of triangles in the mesh.
    #[inline]
    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

fn add_context(err: Validated<VulkanError>, context: &'static str) -> Validated<VulkanError> {
    match err {
        Validated::ValidationError(err) => Validated::ValidationError(err.add_context(context)),
        err => err,
    }
}

/// The description of a mesh as triangle geometry for a bottom-level build.
///
/// Produced by [`GeometryDescriptor::from_mesh`] without allocating anything on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryDescriptor {
    pub vertex_format: vk::Format,
    pub vertex_stride: DeviceSize,
    pub vertex_data: DeviceAddress,

    /// The highest index a triangle may reference.
    pub max_vertex: u32,
    pub index_type: vk::IndexType,
    pub index_data: DeviceAddress,

    /// The number of triangles.
    pub primitive_count: u32,

    /// The default value is `OPAQUE | NO_DUPLICATE_ANY_HIT_INVOCATION`, which skips any-hit
    /// shaders entirely.
    pub flags: vk::GeometryFlagsKHR,
}

impl GeometryDescriptor {
    pub fn from_mesh(mesh: &Mesh) -> Self {
        GeometryDescriptor {
            vertex_format: Vertex::FORMAT,
            vertex_stride: size_of::<Vertex>() as DeviceSize,
            vertex_data: mesh.vertex_address,
            max_vertex: (mesh.vertices.len() as u32).saturating_sub(1),
            index_type: vk::IndexType::UINT32,
            index_data: mesh.index_address,
            primitive_count: mesh.triangle_count(),
            flags: vk::GeometryFlagsKHR::OPAQUE
                | vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION,
        }
    }

    /// Returns the build range covering every triangle, starting at the first index.
    #[inline]
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(self.primitive_count)
    }

    pub(crate) fn to_vk(self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(self.vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertex_data,
            })
            .vertex_stride(self.vertex_stride)
            .max_vertex(self.max_vertex)
            .index_type(self.index_type)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.index_data,
            });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(self.flags)
    }
}
