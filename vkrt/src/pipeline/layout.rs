//! The resource interface of the ray tracing pipeline.
//!
//! The pipeline accesses exactly one descriptor set, visible to the ray generation stage only:
//!
//! | Binding                          | Descriptor type                 |
//! |----------------------------------|---------------------------------|
//! | [`ACCELERATION_STRUCTURE_BINDING`] | top-level acceleration structure |
//! | [`OUTPUT_IMAGE_BINDING`]           | storage image the rays write to  |
//! | [`UNIFORM_BUFFER_BINDING`]         | camera uniform buffer            |

use crate::{
    device::{Device, DeviceOwned},
    macros::impl_id_counter,
    VulkanError, VulkanObject,
};
use ash::vk;
use foldhash::HashMap;
use std::{num::NonZero, sync::Arc};

pub const ACCELERATION_STRUCTURE_BINDING: u32 = 0;
pub const OUTPUT_IMAGE_BINDING: u32 = 1;
pub const UNIFORM_BUFFER_BINDING: u32 = 2;

const BINDINGS: [(u32, vk::DescriptorType); 3] = [
    (
        ACCELERATION_STRUCTURE_BINDING,
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    ),
    (OUTPUT_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
    (UNIFORM_BUFFER_BINDING, vk::DescriptorType::UNIFORM_BUFFER),
];

/// The descriptor set layout and pipeline layout of the ray tracing pipeline.
#[derive(Debug)]
pub struct PipelineLayout {
    handle: vk::PipelineLayout,
    device: Arc<dyn Device>,
    id: NonZero<u64>,

    set_layout: vk::DescriptorSetLayout,
    descriptor_counts: HashMap<vk::DescriptorType, u32>,
}

impl PipelineLayout {
    /// Creates the descriptor set layout and a pipeline layout containing it.
    pub fn new(device: Arc<dyn Device>) -> Result<Arc<PipelineLayout>, VulkanError> {
        let bindings_vk: Vec<_> = BINDINGS
            .iter()
            .map(|&(binding, descriptor_type)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
            })
            .collect();

        let set_layout = unsafe { device.create_descriptor_set_layout(&bindings_vk) }?;
        let handle = match unsafe { device.create_pipeline_layout(&[set_layout]) } {
            Ok(handle) => handle,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout) };
                return Err(err);
            }
        };

        let mut descriptor_counts: HashMap<vk::DescriptorType, u32> = HashMap::default();
        for &(_, descriptor_type) in &BINDINGS {
            *descriptor_counts.entry(descriptor_type).or_default() += 1;
        }

        Ok(Arc::new(PipelineLayout {
            handle,
            device,
            id: Self::next_id(),
            set_layout,
            descriptor_counts,
        }))
    }

    /// Returns the layout of the single descriptor set.
    #[inline]
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// Returns the number of descriptors of each type in the descriptor set, which is what a
    /// descriptor pool needs to be sized for.
    #[inline]
    pub fn descriptor_counts(&self) -> &HashMap<vk::DescriptorType, u32> {
        &self.descriptor_counts
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.handle);
            self.device.destroy_descriptor_set_layout(self.set_layout);
        }
    }
}

unsafe impl VulkanObject for PipelineLayout {
    type Handle = vk::PipelineLayout;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for PipelineLayout {
    #[inline]
    fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl_id_counter!(PipelineLayout);
