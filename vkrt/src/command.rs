//! Recording the trace dispatch.

use crate::{
    descriptor_set::RayTracingDescriptorSet, device::DeviceOwned,
    pipeline::ShaderBindingTable, ValidationError, VulkanObject,
};
use ash::vk;

/// Records binding the pipeline of `shader_binding_table` and `descriptor_set`, followed by a
/// `vkCmdTraceRaysKHR` launching one ray generation invocation per pixel of `extent`.
///
/// # Safety
///
/// - `command_buffer` must be in the recording state and belong to the device of
///   `shader_binding_table`.
/// - The output image bound in `descriptor_set` must be in the `GENERAL` layout when the command
///   executes; transitioning it is up to the caller.
/// - The shader binding table, descriptor set, and every resource the set refers to must outlive
///   the execution of the command buffer.
pub unsafe fn record_trace_rays(
    command_buffer: vk::CommandBuffer,
    shader_binding_table: &ShaderBindingTable,
    descriptor_set: &RayTracingDescriptorSet,
    extent: vk::Extent2D,
) -> Result<(), Box<ValidationError>> {
    let pipeline = shader_binding_table.pipeline();

    if descriptor_set.layout() != pipeline.layout() {
        return Err(Box::new(ValidationError {
            context: "descriptor_set.layout()".into(),
            problem: "is not the layout of the pipeline of `shader_binding_table`".into(),
            vuids: &["VUID-vkCmdTraceRaysKHR-None-02697"],
        }));
    }

    let device = pipeline.device();
    let addresses = shader_binding_table.addresses();

    unsafe {
        device.cmd_bind_pipeline(
            command_buffer,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline.handle(),
        );
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline.layout().handle(),
            0,
            &[descriptor_set.handle()],
        );
        device.cmd_trace_rays(
            command_buffer,
            &addresses.raygen,
            &addresses.miss,
            &addresses.hit,
            &addresses.callable,
            extent.width,
            extent.height,
            1,
        );
    }

    Ok(())
}
