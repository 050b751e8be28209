//! Compiled shader code.
//!
//! Shaders are handed to this crate as SPIR-V binaries; compiling them from source is left to
//! the application's build process. The code is treated as opaque apart from a sanity check of
//! its header.

use crate::{
    device::{Device, DeviceOwned},
    macros::impl_id_counter,
    Validated, ValidationError, VulkanError, VulkanObject,
};
use ash::vk;
use std::{num::NonZero, sync::Arc};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Contains SPIR-V code with one or more entry points.
#[derive(Debug)]
pub struct ShaderModule {
    handle: vk::ShaderModule,
    device: Arc<dyn Device>,
    id: NonZero<u64>,
}

impl ShaderModule {
    /// Creates a shader module from SPIR-V words.
    pub fn from_words(
        device: Arc<dyn Device>,
        words: &[u32],
    ) -> Result<Arc<ShaderModule>, Validated<VulkanError>> {
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(Box::new(ValidationError {
                context: "words".into(),
                problem: "does not start with the SPIR-V magic number".into(),
                vuids: &["VUID-VkShaderModuleCreateInfo-pCode-08737"],
            })
            .into());
        }

        let handle = unsafe { device.create_shader_module(words) }?;

        Ok(Arc::new(ShaderModule {
            handle,
            device,
            id: Self::next_id(),
        }))
    }

    /// Creates a shader module from SPIR-V bytes, as read from a `.spv` file.
    ///
    /// Both little- and big-endian files are accepted.
    pub fn from_bytes(
        device: Arc<dyn Device>,
        bytes: &[u8],
    ) -> Result<Arc<ShaderModule>, Validated<VulkanError>> {
        if bytes.len() % 4 != 0 {
            return Err(Box::new(ValidationError {
                context: "bytes".into(),
                problem: "has a length that is not a multiple of 4".into(),
                vuids: &["VUID-VkShaderModuleCreateInfo-codeSize-08735"],
            })
            .into());
        }

        let mut words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        if words.first() == Some(&SPIRV_MAGIC.swap_bytes()) {
            for word in &mut words {
                *word = word.swap_bytes();
            }
        }

        Self::from_words(device, &words)
    }
}

impl Drop for ShaderModule {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle) };
    }
}

unsafe impl VulkanObject for ShaderModule {
    type Handle = vk::ShaderModule;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for ShaderModule {
    #[inline]
    fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl_id_counter!(ShaderModule);
