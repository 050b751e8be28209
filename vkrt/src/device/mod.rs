//! The device function table every object of this crate is created from.
//!
//! The ray tracing core never loads Vulkan entry points itself. It consumes them, already
//! resolved, through the [`Device`] trait: [`VulkanDevice`] implements it on top of `ash`'s
//! function tables for a device the application created with the acceleration structure, ray
//! tracing pipeline and buffer device address extensions and features enabled.
//!
//! The trait is low level. Methods take and return raw `ash::vk` handles and create
//! infos, and the owning wrappers elsewhere in the crate ([`Buffer`], [`AccelerationStructure`],
//! [`RayTracingPipeline`], ...) are responsible for pairing every `create_*` with its `destroy_*`.
//!
//! [`Buffer`]: crate::buffer::Buffer
//! [`AccelerationStructure`]: crate::acceleration_structure::AccelerationStructure
//! [`RayTracingPipeline`]: crate::pipeline::ray_tracing::RayTracingPipeline

pub use self::vulkan::VulkanDevice;
use crate::{
    buffer::BufferCreateInfo, memory::DeviceAlignment, DeviceAddress, DeviceSize, VulkanError,
};
use ash::vk;
use std::{fmt::Debug, ptr::NonNull, sync::Arc};

mod vulkan;

/// The limits of a physical device that the ray tracing core depends on.
///
/// Read once, when the [`Device`] is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// `shaderGroupHandleSize`: the size in bytes of a shader group handle.
    pub shader_group_handle_size: u32,

    /// `shaderGroupHandleAlignment`: the required alignment of shader group handles inside a
    /// shader binding table region.
    pub shader_group_handle_alignment: u32,

    /// `shaderGroupBaseAlignment`: the required alignment of the start of a shader binding table
    /// region.
    pub shader_group_base_alignment: u32,

    /// `maxRayRecursionDepth`: the largest `maxPipelineRayRecursionDepth` a pipeline may request.
    pub max_ray_recursion_depth: u32,

    /// `minAccelerationStructureScratchOffsetAlignment`: the required alignment of the scratch
    /// address of an acceleration structure build.
    pub min_acceleration_structure_scratch_offset_alignment: u32,
}

impl RayTracingProperties {
    #[inline]
    pub(crate) fn handle_alignment(&self) -> DeviceAlignment {
        DeviceAlignment::from_limit(self.shader_group_handle_alignment).unwrap_or_default()
    }

    #[inline]
    pub(crate) fn base_alignment(&self) -> DeviceAlignment {
        DeviceAlignment::from_limit(self.shader_group_base_alignment).unwrap_or_default()
    }

    #[inline]
    pub(crate) fn scratch_alignment(&self) -> DeviceAlignment {
        DeviceAlignment::from_limit(self.min_acceleration_structure_scratch_offset_alignment)
            .unwrap_or_default()
    }
}

/// A `VkBuffer` together with the `VkDeviceMemory` bound to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawBuffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
}

/// The Vulkan entry points used by the ray tracing core.
///
/// # Safety
///
/// - Implementations must behave like the Vulkan commands each method is named after.
/// - `end_single_time_commands` must not return before the GPU finished executing the commands
///   recorded into the command buffer, so that every object written by them can be used right
///   away.
/// - Memory returned by `map_memory` must stay valid and writable until `unmap_memory` or
///   `destroy_buffer` is called for it.
pub unsafe trait Device: Send + Sync + Debug {
    /// Returns the ray tracing limits of the physical device.
    fn ray_tracing_properties(&self) -> &RayTracingProperties;

    /// Creates a buffer, allocates memory of the requested properties for it and binds the two.
    ///
    /// If `usage` contains `SHADER_DEVICE_ADDRESS` the memory is allocated with
    /// `VK_MEMORY_ALLOCATE_DEVICE_ADDRESS_BIT`.
    unsafe fn create_buffer(
        &self,
        create_info: &BufferCreateInfo,
    ) -> Result<RawBuffer, VulkanError>;

    unsafe fn destroy_buffer(&self, buffer: RawBuffer);

    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> DeviceAddress;

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError>;

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// `vkGetAccelerationStructureBuildSizesKHR` for a device build.
    unsafe fn acceleration_structure_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static>;

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR, VulkanError>;

    unsafe fn destroy_acceleration_structure(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    );

    unsafe fn acceleration_structure_device_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> DeviceAddress;

    /// Allocates a primary command buffer and begins it for one-time submission.
    unsafe fn begin_single_time_commands(&self) -> Result<vk::CommandBuffer, VulkanError>;

    /// Ends `command_buffer`, submits it, waits until the queue is idle and frees it.
    ///
    /// The command buffer is also freed if it could not be submitted. If it was submitted but
    /// waiting for the queue failed, it may still be pending and is left to the command pool.
    unsafe fn end_single_time_commands(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), VulkanError>;

    unsafe fn cmd_build_acceleration_structures(
        &self,
        command_buffer: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    );

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    );

    unsafe fn cmd_trace_rays(
        &self,
        command_buffer: vk::CommandBuffer,
        raygen_shader_binding_table: &vk::StridedDeviceAddressRegionKHR,
        miss_shader_binding_table: &vk::StridedDeviceAddressRegionKHR,
        hit_shader_binding_table: &vk::StridedDeviceAddressRegionKHR,
        callable_shader_binding_table: &vk::StridedDeviceAddressRegionKHR,
        width: u32,
        height: u32,
        depth: u32,
    );

    unsafe fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, VulkanError>;

    unsafe fn destroy_shader_module(&self, shader_module: vk::ShaderModule);

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, VulkanError>;

    unsafe fn destroy_descriptor_set_layout(&self, descriptor_set_layout: vk::DescriptorSetLayout);

    unsafe fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, VulkanError>;

    unsafe fn destroy_pipeline_layout(&self, pipeline_layout: vk::PipelineLayout);

    /// Creates a single ray tracing pipeline, without a deferred operation or pipeline cache.
    unsafe fn create_ray_tracing_pipeline(
        &self,
        create_info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline, VulkanError>;

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// `vkGetRayTracingShaderGroupHandlesKHR`, returning `data_size` bytes of handle data.
    unsafe fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>, VulkanError>;

    unsafe fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, VulkanError>;

    unsafe fn destroy_descriptor_pool(&self, descriptor_pool: vk::DescriptorPool);

    unsafe fn allocate_descriptor_set(
        &self,
        descriptor_pool: vk::DescriptorPool,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError>;

    unsafe fn update_descriptor_sets(&self, descriptor_writes: &[vk::WriteDescriptorSet<'_>]);
}

/// Implemented on objects that belong to a Vulkan device.
///
/// # Safety
///
/// - `device()` must return the correct device.
pub unsafe trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<dyn Device>;
}

unsafe impl<T> DeviceOwned for T
where
    T: std::ops::Deref,
    T::Target: DeviceOwned,
{
    fn device(&self) -> &Arc<dyn Device> {
        (**self).device()
    }
}
