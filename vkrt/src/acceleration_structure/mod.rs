//! An opaque data structure that is used to accelerate spatial queries on geometry data.
//!
//! Acceleration structures contain geometry data, arranged in such a way that the device can
//! easily search through the data and check for intersections between the geometry and rays
//! (lines). The geometry data can consist of either triangles, or axis-aligned bounding boxes
//! (AABBs); this crate only builds triangle geometry.
//!
//! Acceleration structures come in two forms: top-level and bottom-level. A bottom-level
//! acceleration structure holds the actual geometry data, while a top-level structure contains
//! instances of (references to) one or more bottom-level structures. A top-level structure is
//! intended to contain the whole rendered scene (or the relevant parts of it), while a
//! bottom-level structure may contain individual objects within the scene. This two-level
//! arrangement allows you to easily rearrange the scene, adding and removing parts of it as
//! needed.
//!
//! # Building
//!
//! Every build in this crate goes through the same synchronous sequence:
//!
//! 1. The sizes of the structure and of the scratch memory are queried from the device.
//! 2. A scratch buffer is allocated, with enough slack to align its address to
//!    `minAccelerationStructureScratchOffsetAlignment`.
//! 3. The storage buffer is allocated and the structure is created inside it.
//! 4. The build command is recorded into a one-time command buffer, which is submitted and waited
//!    on.
//! 5. The scratch buffer is released and the device address of the structure is queried.
//!
//! Consequently an [`AccelerationStructure`] value only ever exists in the built state, and its
//! [`device_address`](AccelerationStructure::device_address) can be used right away, for example
//! to reference it from a top-level instance.

pub use self::{
    bottom_level::BottomLevelAccelerationStructure,
    geometry::{GeometryDescriptor, Mesh, Vertex},
    top_level::{AccelerationStructureInstance, TopLevelAccelerationStructure},
};
use crate::{
    buffer::{Buffer, BufferCreateInfo, BufferUsage},
    device::{Device, DeviceOwned},
    macros::impl_id_counter,
    memory::align_up,
    DeviceAddress, DeviceSize, Validated, VulkanError, VulkanObject,
};
use ash::vk;
use std::{num::NonZero, slice, sync::Arc};

pub mod bottom_level;
pub mod geometry;
pub mod top_level;

/// Flags that control how an acceleration structure is built.
pub use ash::vk::BuildAccelerationStructureFlagsKHR as BuildAccelerationStructureFlags;

/// The kind of an acceleration structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructureType {
    /// Refers to bottom-level acceleration structures. This type can be bound to a descriptor.
    TopLevel,

    /// Contains AABBs or geometry to be intersected.
    BottomLevel,
}

impl From<AccelerationStructureType> for vk::AccelerationStructureTypeKHR {
    #[inline]
    fn from(val: AccelerationStructureType) -> Self {
        match val {
            AccelerationStructureType::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            AccelerationStructureType::BottomLevel => {
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
            }
        }
    }
}

/// A built acceleration structure, together with the buffer that stores it.
#[derive(Debug)]
pub struct AccelerationStructure {
    handle: vk::AccelerationStructureKHR,
    device: Arc<dyn Device>,
    id: NonZero<u64>,

    buffer: Buffer,
    ty: AccelerationStructureType,
    flags: BuildAccelerationStructureFlags,
    primitive_count: u32,
    device_address: DeviceAddress,
}

impl AccelerationStructure {
    /// Builds an acceleration structure over a single geometry, blocking until the device is
    /// done.
    pub(crate) fn build(
        device: &Arc<dyn Device>,
        ty: AccelerationStructureType,
        geometry: &vk::AccelerationStructureGeometryKHR<'_>,
        build_range: vk::AccelerationStructureBuildRangeInfoKHR,
        flags: BuildAccelerationStructureFlags,
    ) -> Result<AccelerationStructure, Validated<VulkanError>> {
        let primitive_count = build_range.primitive_count;
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty.into())
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(slice::from_ref(geometry));

        let build_sizes =
            unsafe { device.acceleration_structure_build_sizes(&build_info, &[primitive_count]) };
        log::debug!(
            "{:?} acceleration structure: {} primitives, size {}, scratch {}",
            ty,
            primitive_count,
            build_sizes.acceleration_structure_size,
            build_sizes.build_scratch_size,
        );

        let scratch_alignment = device.ray_tracing_properties().scratch_alignment();
        let scratch_buffer = Buffer::new(
            device.clone(),
            BufferCreateInfo::device_local(
                build_sizes.build_scratch_size + scratch_alignment.as_devicesize(),
                BufferUsage::STORAGE_BUFFER | BufferUsage::SHADER_DEVICE_ADDRESS,
            ),
        )?;
        let scratch_address = align_up(scratch_buffer.device_address()?, scratch_alignment);

        let buffer = Buffer::new(
            device.clone(),
            BufferCreateInfo::device_local(
                build_sizes.acceleration_structure_size,
                BufferUsage::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | BufferUsage::SHADER_DEVICE_ADDRESS,
            ),
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .offset(0)
            .size(buffer.size())
            .ty(ty.into());
        let handle = unsafe { device.create_acceleration_structure(&create_info) }?;

        // From here on, dropping `structure` releases the handle and then the buffer.
        let mut structure = AccelerationStructure {
            handle,
            device: device.clone(),
            id: Self::next_id(),
            buffer,
            ty,
            flags,
            primitive_count,
            device_address: 0,
        };

        build_info = build_info
            .dst_acceleration_structure(handle)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        unsafe {
            let command_buffer = device.begin_single_time_commands()?;
            device.cmd_build_acceleration_structures(
                command_buffer,
                slice::from_ref(&build_info),
                &[slice::from_ref(&build_range)],
            );
            device.end_single_time_commands(command_buffer)?;
        }

        drop(scratch_buffer);
        structure.device_address = unsafe { device.acceleration_structure_device_address(handle) };

        Ok(structure)
    }

    /// Returns the kind of the acceleration structure.
    #[inline]
    pub fn ty(&self) -> AccelerationStructureType {
        self.ty
    }

    /// Returns the flags the acceleration structure was built with.
    #[inline]
    pub fn flags(&self) -> BuildAccelerationStructureFlags {
        self.flags
    }

    /// Returns the number of triangles, or of instances, the acceleration structure was built
    /// over.
    #[inline]
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    /// Returns the buffer the acceleration structure is stored in.
    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Returns the size of the acceleration structure.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.buffer.size()
    }

    /// Returns the device address of the acceleration structure.
    ///
    /// The device address of the acceleration structure may be different from the device address
    /// of the underlying buffer.
    #[inline]
    pub fn device_address(&self) -> DeviceAddress {
        self.device_address
    }
}

impl Drop for AccelerationStructure {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.device.destroy_acceleration_structure(self.handle) };
    }
}

unsafe impl VulkanObject for AccelerationStructure {
    type Handle = vk::AccelerationStructureKHR;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for AccelerationStructure {
    #[inline]
    fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl_id_counter!(AccelerationStructure);
