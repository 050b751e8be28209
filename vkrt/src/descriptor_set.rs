//! The descriptor set the ray generation shader reads its inputs from.

use crate::{
    acceleration_structure::TopLevelAccelerationStructure,
    buffer::{Buffer, BufferCreateInfo, BufferUsage},
    device::{Device, DeviceOwned},
    pipeline::layout::{
        PipelineLayout, ACCELERATION_STRUCTURE_BINDING, OUTPUT_IMAGE_BINDING,
        UNIFORM_BUFFER_BINDING,
    },
    DeviceSize, Validated, ValidationError, VulkanError, VulkanObject,
};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::{mem::size_of, slice, sync::Arc};

/// The contents of the uniform buffer at [`UNIFORM_BUFFER_BINDING`].
///
/// The raygen shader turns pixel coordinates into rays by unprojecting them, hence the inverse
/// matrices.
#[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct CameraUniform {
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
}

impl CameraUniform {
    /// Returns the uniform for a camera with the given view and projection matrices.
    #[inline]
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        CameraUniform {
            view_inverse: view.inverse(),
            proj_inverse: projection.inverse(),
        }
    }
}

impl Default for CameraUniform {
    #[inline]
    fn default() -> Self {
        CameraUniform {
            view_inverse: Mat4::IDENTITY,
            proj_inverse: Mat4::IDENTITY,
        }
    }
}

/// A descriptor set, allocated from its own pool, holding the top-level acceleration structure,
/// the output storage image and the camera uniform buffer.
///
/// The acceleration structure and the image view are referenced, not owned: they must stay alive
/// for as long as commands using the set may execute.
#[derive(Debug)]
pub struct RayTracingDescriptorSet {
    handle: vk::DescriptorSet,
    device: Arc<dyn Device>,

    pool: vk::DescriptorPool,
    layout: Arc<PipelineLayout>,
    uniform_buffer: Buffer,
}

impl RayTracingDescriptorSet {
    /// Allocates a descriptor set for `layout` and writes all three bindings.
    ///
    /// The camera starts out with identity matrices.
    pub fn new(
        layout: &Arc<PipelineLayout>,
        top_level: &TopLevelAccelerationStructure,
        output_image: vk::ImageView,
    ) -> Result<RayTracingDescriptorSet, Validated<VulkanError>> {
        let device = layout.device().clone();

        let uniform_buffer = Buffer::new(
            device.clone(),
            BufferCreateInfo::host_visible(
                size_of::<CameraUniform>() as DeviceSize,
                BufferUsage::UNIFORM_BUFFER,
            ),
        )?;
        let camera = CameraUniform::default();
        uniform_buffer.map()?;
        uniform_buffer.write(0, bytemuck::bytes_of(&camera))?;

        let pool_sizes: Vec<_> = layout
            .descriptor_counts()
            .iter()
            .map(|(&ty, &descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
        let pool = unsafe { device.create_descriptor_pool(1, &pool_sizes) }?;
        let handle = match unsafe { device.allocate_descriptor_set(pool, layout.set_layout()) } {
            Ok(handle) => handle,
            Err(err) => {
                unsafe { device.destroy_descriptor_pool(pool) };
                return Err(err.into());
            }
        };

        let set = RayTracingDescriptorSet {
            handle,
            device,
            pool,
            layout: layout.clone(),
            uniform_buffer,
        };
        set.set_acceleration_structure(top_level);
        set.set_output_image(output_image);
        set.write_uniform_buffer_descriptor();

        Ok(set)
    }

    /// Returns the layout the set was allocated with.
    #[inline]
    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    /// Returns the camera uniform buffer.
    #[inline]
    pub fn uniform_buffer(&self) -> &Buffer {
        &self.uniform_buffer
    }

    /// Writes new camera matrices into the uniform buffer.
    ///
    /// The buffer is not double-buffered: the caller must make sure no trace command reading it
    /// is executing.
    pub fn update_camera(&self, view: Mat4, projection: Mat4) -> Result<(), Box<ValidationError>> {
        self.uniform_buffer
            .write(0, bytemuck::bytes_of(&CameraUniform::new(view, projection)))
    }

    /// Points [`OUTPUT_IMAGE_BINDING`] at `image_view`, which must be in the `GENERAL` layout
    /// when rays are traced. Used after the output image is recreated, for example on resize.
    ///
    /// The set is updated in place: no command buffer recorded with it may be pending execution.
    pub fn set_output_image(&self, image_view: vk::ImageView) {
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(image_view)
            .image_layout(vk::ImageLayout::GENERAL);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(OUTPUT_IMAGE_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(slice::from_ref(&image_info));

        unsafe { self.device.update_descriptor_sets(&[write]) };
    }

    /// Points [`ACCELERATION_STRUCTURE_BINDING`] at `top_level`. Used after the scene is rebuilt.
    pub fn set_acceleration_structure(&self, top_level: &TopLevelAccelerationStructure) {
        let handles = [top_level.handle()];
        let mut acceleration_structure_write =
            vk::WriteDescriptorSetAccelerationStructureKHR::default()
                .acceleration_structures(&handles);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(ACCELERATION_STRUCTURE_BINDING)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .push_next(&mut acceleration_structure_write);

        unsafe { self.device.update_descriptor_sets(&[write]) };
    }

    fn write_uniform_buffer_descriptor(&self) {
        let buffer_info = self.uniform_buffer.descriptor_info();
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(UNIFORM_BUFFER_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(slice::from_ref(&buffer_info));

        unsafe { self.device.update_descriptor_sets(&[write]) };
    }
}

impl Drop for RayTracingDescriptorSet {
    #[inline]
    fn drop(&mut self) {
        // Frees the set along with the pool.
        unsafe { self.device.destroy_descriptor_pool(self.pool) };
    }
}

unsafe impl VulkanObject for RayTracingDescriptorSet {
    type Handle = vk::DescriptorSet;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for RayTracingDescriptorSet {
    #[inline]
    fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}
