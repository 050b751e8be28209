use super::{
    AccelerationStructure, AccelerationStructureType, BottomLevelAccelerationStructure,
    BuildAccelerationStructureFlags,
};
use crate::{
    buffer::{Buffer, BufferCreateInfo, BufferUsage},
    device::Device,
    DeviceAddress, DeviceSize, Validated, ValidationError, VulkanError,
};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::{mem::size_of, ops::Deref, sync::Arc};

/// One instance of a bottom-level acceleration structure inside a top-level one.
///
/// Laid out exactly like `VkAccelerationStructureInstanceKHR`, so a slice of instances can be
/// copied into the instance buffer as is.
#[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct AccelerationStructureInstance {
    /// A 3x4 row-major affine transform from object space to world space.
    pub transform: [[f32; 4]; 3],

    /// The custom index in the low 24 bits, the visibility mask in the high 8 bits.
    pub instance_custom_index_and_mask: u32,

    /// The shader binding table record offset in the low 24 bits, the
    /// `VkGeometryInstanceFlagsKHR` in the high 8 bits.
    pub instance_shader_binding_table_record_offset_and_flags: u32,

    /// The device address of the bottom-level acceleration structure.
    pub acceleration_structure_reference: DeviceAddress,
}

const _: () = assert!(size_of::<AccelerationStructureInstance>() == 64);

const IDENTITY: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

const LOW_24_BITS: u32 = 0x00ff_ffff;

#[inline]
const fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    (low_24 & LOW_24_BITS) | ((high_8 as u32) << 24)
}

impl AccelerationStructureInstance {
    /// The largest custom index that fits in an instance.
    pub const MAX_CUSTOM_INDEX: u32 = LOW_24_BITS;

    /// Returns an instance of the bottom-level structure at `blas_address`, with an identity
    /// transform, every visibility bit set, a shader binding table record offset of 0 and face
    /// culling disabled.
    pub fn new(blas_address: DeviceAddress, custom_index: u32) -> Self {
        debug_assert!(custom_index <= Self::MAX_CUSTOM_INDEX);

        AccelerationStructureInstance {
            transform: IDENTITY,
            instance_custom_index_and_mask: pack_24_8(custom_index, 0xff),
            instance_shader_binding_table_record_offset_and_flags: pack_24_8(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: blas_address,
        }
    }

    /// Replaces the transform with the upper three rows of `transform`.
    pub fn with_transform(mut self, transform: glam::Mat4) -> Self {
        let rows = transform.transpose().to_cols_array_2d();
        self.transform = [rows[0], rows[1], rows[2]];
        self
    }

    /// Replaces the visibility mask. A ray only hits the instance if the mask it is traced with
    /// has a bit in common.
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_custom_index_and_mask = pack_24_8(self.custom_index(), mask);
        self
    }

    /// Replaces the offset added to the hit group index when this instance is hit.
    pub fn with_shader_binding_table_record_offset(mut self, offset: u32) -> Self {
        debug_assert!(offset <= LOW_24_BITS);
        self.instance_shader_binding_table_record_offset_and_flags =
            pack_24_8(offset, self.flags().as_raw() as u8);
        self
    }

    /// Replaces the instance flags.
    pub fn with_flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags = pack_24_8(
            self.shader_binding_table_record_offset(),
            flags.as_raw() as u8,
        );
        self
    }

    /// Returns the value shaders read as `gl_InstanceCustomIndexEXT`.
    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & LOW_24_BITS
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    #[inline]
    pub fn shader_binding_table_record_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & LOW_24_BITS
    }

    #[inline]
    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(
            self.instance_shader_binding_table_record_offset_and_flags >> 24,
        )
    }
}

/// An acceleration structure over instances of bottom-level acceleration structures.
#[derive(Debug)]
pub struct TopLevelAccelerationStructure {
    inner: AccelerationStructure,
    instances: Vec<AccelerationStructureInstance>,
}

impl TopLevelAccelerationStructure {
    /// Builds a top-level acceleration structure with one instance per element of
    /// `bottom_level`, using the element's position as custom index.
    ///
    /// Every bottom-level structure is already built, so the instances can reference their
    /// addresses directly.
    pub fn new(
        device: Arc<dyn Device>,
        bottom_level: &[BottomLevelAccelerationStructure],
        flags: BuildAccelerationStructureFlags,
    ) -> Result<Self, Validated<VulkanError>> {
        if bottom_level.len() > AccelerationStructureInstance::MAX_CUSTOM_INDEX as usize + 1 {
            return Err(Box::new(ValidationError {
                context: "bottom_level".into(),
                problem: "has more elements than there are custom indices".into(),
                ..Default::default()
            })
            .into());
        }

        let instances = bottom_level
            .iter()
            .enumerate()
            .map(|(index, blas)| {
                AccelerationStructureInstance::new(blas.device_address(), index as u32)
            })
            .collect();

        Self::from_instances(device, instances, flags)
    }

    /// Builds a top-level acceleration structure over caller-provided instances.
    ///
    /// The bottom-level structures the instances reference must outlive the returned object.
    pub fn from_instances(
        device: Arc<dyn Device>,
        instances: Vec<AccelerationStructureInstance>,
        flags: BuildAccelerationStructureFlags,
    ) -> Result<Self, Validated<VulkanError>> {
        let instance_bytes: &[u8] = bytemuck::cast_slice(&instances);
        let instance_buffer = Buffer::new(
            device.clone(),
            BufferCreateInfo::host_visible(
                (instance_bytes.len() as DeviceSize)
                    .max(size_of::<AccelerationStructureInstance>() as DeviceSize),
                BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | BufferUsage::SHADER_DEVICE_ADDRESS,
            ),
        )?;
        instance_buffer.map()?;
        instance_buffer.write(0, instance_bytes)?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.device_address()?,
            });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            });
        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(instances.len() as u32);

        let inner = AccelerationStructure::build(
            &device,
            AccelerationStructureType::TopLevel,
            &geometry,
            build_range,
            flags,
        )?;

        Ok(TopLevelAccelerationStructure { inner, instances })
    }

    /// Returns the instances the structure was built over.
    #[inline]
    pub fn instances(&self) -> &[AccelerationStructureInstance] {
        &self.instances
    }
}

impl Deref for TopLevelAccelerationStructure {
    type Target = AccelerationStructure;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
