use super::{Device, RawBuffer, RayTracingProperties};
use crate::{buffer::BufferCreateInfo, DeviceAddress, DeviceSize, VulkanError};
use ash::vk;
use parking_lot::Mutex;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    ptr::NonNull,
    slice,
    sync::Arc,
};

/// A [`Device`] backed by a real Vulkan logical device.
///
/// The logical device, and the instance and physical device it was created from, are owned by the
/// application. It must have been created with `VK_KHR_acceleration_structure`,
/// `VK_KHR_ray_tracing_pipeline` and `VK_KHR_deferred_host_operations` enabled, and with the
/// `accelerationStructure`, `rayTracingPipeline` and `bufferDeviceAddress` features turned on.
///
/// One-time command buffers are allocated from a transient command pool on the first queue of
/// `queue_family_index`, which must support compute operations.
pub struct VulkanDevice {
    handle: ash::Device,
    acceleration_structure_fns: ash::khr::acceleration_structure::Device,
    ray_tracing_pipeline_fns: ash::khr::ray_tracing_pipeline::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    ray_tracing_properties: RayTracingProperties,
    queue_family_index: u32,
    commands: Mutex<SingleTimeCommands>,
}

#[derive(Debug)]
struct SingleTimeCommands {
    queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl VulkanDevice {
    /// Wraps `device`, loading the extension function tables and reading the device limits.
    ///
    /// Ownership of `device` is transferred: it is destroyed when the returned object is dropped.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to `instance`.
    /// - `instance` must outlive the returned object.
    /// - The extensions and features listed in the type documentation must be enabled.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
    ) -> Result<Arc<Self>, VulkanError> {
        let acceleration_structure_fns =
            ash::khr::acceleration_structure::Device::new(instance, &device);
        let ray_tracing_pipeline_fns =
            ash::khr::ray_tracing_pipeline::Device::new(instance, &device);
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let mut ray_tracing_pipeline_properties =
            vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut acceleration_structure_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        {
            let mut properties2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut ray_tracing_pipeline_properties)
                .push_next(&mut acceleration_structure_properties);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        }

        let ray_tracing_properties = RayTracingProperties {
            shader_group_handle_size: ray_tracing_pipeline_properties.shader_group_handle_size,
            shader_group_handle_alignment: ray_tracing_pipeline_properties
                .shader_group_handle_alignment,
            shader_group_base_alignment: ray_tracing_pipeline_properties
                .shader_group_base_alignment,
            max_ray_recursion_depth: ray_tracing_pipeline_properties.max_ray_recursion_depth,
            min_acceleration_structure_scratch_offset_alignment: acceleration_structure_properties
                .min_acceleration_structure_scratch_offset_alignment,
        };
        log::debug!("ray tracing properties: {:?}", ray_tracing_properties);

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family_index);
        let command_pool = match unsafe { device.create_command_pool(&create_info, None) } {
            Ok(command_pool) => command_pool,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err.into());
            }
        };

        Ok(Arc::new(VulkanDevice {
            handle: device,
            acceleration_structure_fns,
            ray_tracing_pipeline_fns,
            memory_properties,
            ray_tracing_properties,
            queue_family_index,
            commands: Mutex::new(SingleTimeCommands {
                queue,
                command_pool,
            }),
        }))
    }

    /// Returns the wrapped `ash` device, for creating the objects this crate takes as input
    /// (images, image views, the swapchain).
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.handle
    }

    /// Returns the queue family one-time commands are submitted to.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        let memory_type_count = self.memory_properties.memory_type_count as usize;
        let memory_types = &self.memory_properties.memory_types[..memory_type_count];

        memory_types
            .iter()
            .enumerate()
            .find(|&(index, memory_type)| {
                type_bits & (1 << index) != 0 && memory_type.property_flags.contains(properties)
            })
            .map(|(index, _)| index as u32)
    }

    unsafe fn submit_and_wait(
        &self,
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), SubmitError> {
        unsafe { self.handle.end_command_buffer(command_buffer) }
            .map_err(SubmitError::Submit)?;

        let submit_info =
            vk::SubmitInfo::default().command_buffers(slice::from_ref(&command_buffer));
        unsafe {
            self.handle
                .queue_submit(queue, &[submit_info], vk::Fence::null())
        }
        .map_err(SubmitError::Submit)?;

        unsafe { self.handle.queue_wait_idle(queue) }.map_err(SubmitError::Wait)
    }
}

/// Where submitting a one-time command buffer stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubmitError {
    /// Ending the command buffer or submitting it failed. It never became pending.
    Submit(vk::Result),

    /// The command buffer was submitted, but waiting for the queue failed.
    Wait(vk::Result),
}

impl SubmitError {
    /// Returns whether the command buffer may still be executing.
    fn is_pending(self) -> bool {
        matches!(self, SubmitError::Wait(_))
    }
}

impl From<SubmitError> for VulkanError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Submit(err) | SubmitError::Wait(err) => err.into(),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.handle.device_wait_idle() {
                log::error!(
                    "failed to wait for the device to become idle: {}",
                    VulkanError::from(err),
                );
            }

            let command_pool = self.commands.get_mut().command_pool;
            self.handle.destroy_command_pool(command_pool, None);
            self.handle.destroy_device(None);
        }
    }
}

impl Debug for VulkanDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("VulkanDevice")
            .field("handle", &self.handle.handle())
            .field("ray_tracing_properties", &self.ray_tracing_properties)
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}

unsafe impl Device for VulkanDevice {
    #[inline]
    fn ray_tracing_properties(&self) -> &RayTracingProperties {
        &self.ray_tracing_properties
    }

    unsafe fn create_buffer(
        &self,
        create_info: &BufferCreateInfo,
    ) -> Result<RawBuffer, VulkanError> {
        let &BufferCreateInfo {
            size,
            usage,
            memory_properties,
            _ne: _,
        } = create_info;

        let buffer_create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.handle.create_buffer(&buffer_create_info, None) }?;

        let requirements = unsafe { self.handle.get_buffer_memory_requirements(handle) };
        let Some(memory_type_index) =
            self.find_memory_type(requirements.memory_type_bits, memory_properties)
        else {
            log::error!(
                "no memory type with properties {:?} for a buffer of usage {:?}",
                memory_properties,
                usage,
            );
            unsafe { self.handle.destroy_buffer(handle, None) };
            return Err(VulkanError::OutOfDeviceMemory);
        };

        let mut allocate_flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            allocate_info = allocate_info.push_next(&mut allocate_flags_info);
        }

        let memory = match unsafe { self.handle.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.handle.destroy_buffer(handle, None) };
                return Err(err.into());
            }
        };

        if let Err(err) = unsafe { self.handle.bind_buffer_memory(handle, memory, 0) } {
            unsafe {
                self.handle.destroy_buffer(handle, None);
                self.handle.free_memory(memory, None);
            }
            return Err(err.into());
        }

        Ok(RawBuffer { handle, memory })
    }

    unsafe fn destroy_buffer(&self, buffer: RawBuffer) {
        unsafe {
            self.handle.destroy_buffer(buffer.handle, None);
            self.handle.free_memory(buffer.memory, None);
        }
    }

    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.handle.get_buffer_device_address(&info) }
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError> {
        let ptr = unsafe {
            self.handle
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
        }?;

        NonNull::new(ptr.cast::<u8>()).ok_or(VulkanError::MemoryMapFailed)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.handle.unmap_memory(memory) };
    }

    unsafe fn acceleration_structure_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.acceleration_structure_fns
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    build_info,
                    max_primitive_counts,
                    &mut build_sizes,
                )
        };

        build_sizes
    }

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR, VulkanError> {
        unsafe {
            self.acceleration_structure_fns
                .create_acceleration_structure(create_info, None)
        }
        .map_err(VulkanError::from)
    }

    unsafe fn destroy_acceleration_structure(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) {
        unsafe {
            self.acceleration_structure_fns
                .destroy_acceleration_structure(acceleration_structure, None)
        };
    }

    unsafe fn acceleration_structure_device_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(acceleration_structure);
        unsafe {
            self.acceleration_structure_fns
                .get_acceleration_structure_device_address(&info)
        }
    }

    unsafe fn begin_single_time_commands(&self) -> Result<vk::CommandBuffer, VulkanError> {
        let commands = self.commands.lock();

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(commands.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.handle.allocate_command_buffers(&allocate_info) }?
            .into_iter()
            .next()
            .ok_or(VulkanError::Unknown)?;

        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(err) = unsafe { self.handle.begin_command_buffer(command_buffer, &info) } {
            unsafe {
                self.handle
                    .free_command_buffers(commands.command_pool, &[command_buffer])
            };
            return Err(err.into());
        }

        Ok(command_buffer)
    }

    unsafe fn end_single_time_commands(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), VulkanError> {
        let commands = self.commands.lock();
        let result = unsafe { self.submit_and_wait(commands.queue, command_buffer) };

        // A command buffer that may still be pending is reclaimed with the pool.
        if result.is_err_and(SubmitError::is_pending) {
            log::error!("waiting for one-time commands failed");
        } else {
            unsafe {
                self.handle
                    .free_command_buffers(commands.command_pool, &[command_buffer])
            };
        }

        result.map_err(VulkanError::from)
    }

    unsafe fn cmd_build_acceleration_structures(
        &self,
        command_buffer: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        unsafe {
            self.acceleration_structure_fns
                .cmd_build_acceleration_structures(command_buffer, infos, build_range_infos)
        };
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.handle
                .cmd_bind_pipeline(command_buffer, pipeline_bind_point, pipeline)
        };
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                pipeline_bind_point,
                layout,
                first_set,
                descriptor_sets,
                &[],
            )
        };
    }

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
    ) {
        unsafe {
            self.ray_tracing_pipeline_fns.cmd_trace_rays(
                command_buffer,
                raygen_shader_binding_table,
                miss_shader_binding_table,
                hit_shader_binding_table,
                callable_shader_binding_table,
                width,
                height,
                depth,
            )
        };
    }

    unsafe fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, VulkanError> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.handle.create_shader_module(&create_info, None) }.map_err(VulkanError::from)
    }

    unsafe fn destroy_shader_module(&self, shader_module: vk::ShaderModule) {
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, VulkanError> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        unsafe { self.handle.create_descriptor_set_layout(&create_info, None) }
            .map_err(VulkanError::from)
    }

    unsafe fn destroy_descriptor_set_layout(&self, descriptor_set_layout: vk::DescriptorSetLayout) {
        unsafe {
            self.handle
                .destroy_descriptor_set_layout(descriptor_set_layout, None)
        };
    }

    unsafe fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, VulkanError> {
        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        unsafe { self.handle.create_pipeline_layout(&create_info, None) }.map_err(VulkanError::from)
    }

    unsafe fn destroy_pipeline_layout(&self, pipeline_layout: vk::PipelineLayout) {
        unsafe { self.handle.destroy_pipeline_layout(pipeline_layout, None) };
    }

    unsafe fn create_ray_tracing_pipeline(
        &self,
        create_info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline, VulkanError> {
        let result = unsafe {
            self.ray_tracing_pipeline_fns.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                slice::from_ref(create_info),
                None,
            )
        };

        match result {
            Ok(pipelines) => pipelines.into_iter().next().ok_or(VulkanError::Unknown),
            Err((pipelines, err)) => {
                for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    unsafe { self.handle.destroy_pipeline(pipeline, None) };
                }

                Err(err.into())
            }
        }
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }

    unsafe fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>, VulkanError> {
        unsafe {
            self.ray_tracing_pipeline_fns
                .get_ray_tracing_shader_group_handles(pipeline, first_group, group_count, data_size)
        }
        .map_err(VulkanError::from)
    }

    unsafe fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, VulkanError> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        unsafe { self.handle.create_descriptor_pool(&create_info, None) }.map_err(VulkanError::from)
    }

    unsafe fn destroy_descriptor_pool(&self, descriptor_pool: vk::DescriptorPool) {
        unsafe { self.handle.destroy_descriptor_pool(descriptor_pool, None) };
    }

    unsafe fn allocate_descriptor_set(
        &self,
        descriptor_pool: vk::DescriptorPool,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError> {
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(slice::from_ref(&set_layout));

        unsafe { self.handle.allocate_descriptor_sets(&allocate_info) }?
            .into_iter()
            .next()
            .ok_or(VulkanError::OutOfPoolMemory)
    }

    unsafe fn update_descriptor_sets(&self, descriptor_writes: &[vk::WriteDescriptorSet<'_>]) {
        unsafe { self.handle.update_descriptor_sets(descriptor_writes, &[]) };
    }
}
