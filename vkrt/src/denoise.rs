//! The hand-off point between the traced image and a denoising stage.
//!
//! Tracing produces a noisy color image. A [`Denoiser`] records whatever passes it needs
//! (temporal accumulation, variance estimation, wavelet or bilateral filtering) into the frame's
//! command buffer and names the image view holding the result. The filters themselves are not
//! part of this crate; [`PassthroughDenoiser`] hands the input back unchanged.

use crate::VulkanError;
use ash::vk;
use std::fmt::Debug;

/// What a [`Denoiser`] receives for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DenoiseInput {
    /// The noisy color image written by the trace, in the `GENERAL` layout.
    pub color: vk::ImageView,

    /// The size of `color` in pixels.
    pub extent: vk::Extent2D,

    /// Counts frames since the camera or scene last changed, for temporal accumulation.
    pub frame_index: u64,
}

/// A stage turning a noisy ray traced image into a clean one.
pub trait Denoiser: Send + Debug {
    /// Records the commands denoising `input` and returns the view of the denoised image.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be in the recording state.
    /// - The commands must be recorded after the trace command writing `input.color`.
    unsafe fn record_denoise(
        &mut self,
        command_buffer: vk::CommandBuffer,
        input: &DenoiseInput,
    ) -> Result<vk::ImageView, VulkanError>;

    /// Called when the output extent changes, before the next `record_denoise`.
    fn resize(&mut self, extent: vk::Extent2D) -> Result<(), VulkanError> {
        let _ = extent;
        Ok(())
    }
}

/// A [`Denoiser`] that records nothing and returns the noisy image.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughDenoiser;

impl Denoiser for PassthroughDenoiser {
    #[inline]
    unsafe fn record_denoise(
        &mut self,
        _command_buffer: vk::CommandBuffer,
        input: &DenoiseInput,
    ) -> Result<vk::ImageView, VulkanError> {
        Ok(input.color)
    }
}
