use super::{ray_tracing::ShaderGroupKind, RayTracingPipeline};
use crate::{
    buffer::{Buffer, BufferCreateInfo, BufferUsage},
    device::{Device, DeviceOwned},
    memory::{align_up, DeviceAlignment},
    DeviceSize, Validated, VulkanError, VulkanObject,
};
use ash::vk::StridedDeviceAddressRegionKHR;
use std::sync::Arc;

/// The regions of a shader binding table, as passed to the trace command.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderBindingTableAddresses {
    pub raygen: StridedDeviceAddressRegionKHR,
    pub miss: StridedDeviceAddressRegionKHR,
    pub hit: StridedDeviceAddressRegionKHR,
    /// Always empty; the pipelines of this crate have no callable shaders.
    pub callable: StridedDeviceAddressRegionKHR,
}

/// The shader group handles of a [`RayTracingPipeline`], laid out for the trace command.
///
/// Each non-empty region lives in its own host-visible buffer. Handles are placed at a stride of
/// `shaderGroupHandleSize` rounded up to `shaderGroupHandleAlignment`, and every region starts at
/// a multiple of `shaderGroupBaseAlignment`. The raygen region holds a single handle, so its size
/// equals its stride; the miss and hit regions hold the handles of every miss and hit group of
/// the pipeline, in group order.
#[derive(Debug)]
pub struct ShaderBindingTable {
    addresses: ShaderBindingTableAddresses,
    buffers: Vec<Buffer>,
    pipeline: Arc<RayTracingPipeline>,
}

impl ShaderBindingTable {
    /// Fetches the shader group handles of `pipeline` and copies them into new buffers.
    pub fn new(
        pipeline: &Arc<RayTracingPipeline>,
    ) -> Result<ShaderBindingTable, Validated<VulkanError>> {
        let device = pipeline.device();
        let properties = device.ray_tracing_properties();

        let handle_size = properties.shader_group_handle_size as usize;
        let handle_size_aligned =
            align_up(handle_size as DeviceSize, properties.handle_alignment());
        let base_alignment = properties.base_alignment();

        let group_count = pipeline.groups().len();
        let handle_data = unsafe {
            device.ray_tracing_shader_group_handles(
                pipeline.handle(),
                0,
                group_count as u32,
                group_count * handle_size,
            )
        }?;
        let handles: Vec<(ShaderGroupKind, &[u8])> = pipeline
            .group_kinds()
            .zip(handle_data.chunks_exact(handle_size.max(1)))
            .collect();

        let mut buffers = Vec::with_capacity(3);
        let mut region_of = |kind: ShaderGroupKind| -> Result<_, Validated<VulkanError>> {
            let region_handles: Vec<&[u8]> = handles
                .iter()
                .filter(|&&(k, _)| k == kind)
                .map(|&(_, handle)| handle)
                .collect();
            let region = create_region(
                device,
                &region_handles,
                handle_size_aligned,
                base_alignment,
            )?;

            Ok(match region {
                Some((buffer, region)) => {
                    buffers.push(buffer);
                    region
                }
                None => StridedDeviceAddressRegionKHR::default(),
            })
        };

        let addresses = ShaderBindingTableAddresses {
            raygen: region_of(ShaderGroupKind::Raygen)?,
            miss: region_of(ShaderGroupKind::Miss)?,
            hit: region_of(ShaderGroupKind::Hit)?,
            callable: StridedDeviceAddressRegionKHR::default(),
        };

        log::info!(
            "shader binding table created: handle stride {}, raygen at {:#x}, miss at {:#x}, \
            hit at {:#x}",
            handle_size_aligned,
            addresses.raygen.device_address,
            addresses.miss.device_address,
            addresses.hit.device_address,
        );

        Ok(ShaderBindingTable {
            addresses,
            buffers,
            pipeline: pipeline.clone(),
        })
    }

    /// Returns the regions to pass to the trace command.
    #[inline]
    pub fn addresses(&self) -> &ShaderBindingTableAddresses {
        &self.addresses
    }

    /// Returns the pipeline the handles were taken from.
    #[inline]
    pub fn pipeline(&self) -> &Arc<RayTracingPipeline> {
        &self.pipeline
    }

    /// Returns the buffers backing the non-empty regions.
    #[inline]
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }
}

/// Creates a buffer holding `handles` at `stride` intervals, starting at an address aligned to
/// `base_alignment`. Returns `None` if there are no handles.
fn create_region(
    device: &Arc<dyn Device>,
    handles: &[&[u8]],
    stride: DeviceSize,
    base_alignment: DeviceAlignment,
) -> Result<Option<(Buffer, StridedDeviceAddressRegionKHR)>, Validated<VulkanError>> {
    if handles.is_empty() {
        return Ok(None);
    }

    let size = stride * handles.len() as DeviceSize;
    let buffer = Buffer::new(
        device.clone(),
        BufferCreateInfo::host_visible(
            size + base_alignment.as_devicesize() - 1,
            BufferUsage::SHADER_BINDING_TABLE_KHR | BufferUsage::SHADER_DEVICE_ADDRESS,
        ),
    )?;
    buffer.map()?;

    let buffer_address = buffer.device_address()?;
    let device_address = align_up(buffer_address, base_alignment);
    let padding = device_address - buffer_address;

    for (index, handle) in handles.iter().enumerate() {
        let offset = padding + index as DeviceSize * stride;
        buffer.write(offset, handle)?;
    }

    Ok(Some((
        buffer,
        StridedDeviceAddressRegionKHR {
            device_address,
            stride,
            size,
        },
    )))
}
