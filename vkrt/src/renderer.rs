//! Ties the pieces together into something that can render a frame.
//!
//! [`Renderer::new`] creates, in this order: the scene's acceleration structures (every
//! bottom-level structure, then the top-level one), the pipeline layout, the descriptor set
//! binding the top-level structure, the ray tracing pipeline, and its shader binding table. Each
//! step depends on the previous ones having completed.

use crate::{
    command::record_trace_rays,
    denoise::{DenoiseInput, Denoiser, PassthroughDenoiser},
    descriptor_set::RayTracingDescriptorSet,
    device::Device,
    pipeline::{
        ray_tracing::DEFAULT_MIN_RAY_RECURSION_DEPTH, PipelineLayout, RayTracingPipeline,
        RayTracingPipelineCreateInfo, ShaderBindingTable,
    },
    scene::{Scene, SceneCreateInfo},
    shader::ShaderModule,
    NonExhaustive, Validated, ValidationError, VulkanError,
};
use ash::vk;
use glam::Mat4;
use std::sync::Arc;

/// Parameters to create a new [`Renderer`].
#[derive(Debug)]
pub struct RendererCreateInfo {
    /// The scene to build.
    pub scene: SceneCreateInfo,

    /// The ray generation shader, with entry point `rgenMain`.
    pub raygen_shader: Arc<ShaderModule>,

    /// The miss shader, with entry point `rmissMain`.
    pub miss_shader: Arc<ShaderModule>,

    /// The closest-hit shader, with entry point `chitMain`.
    pub closest_hit_shader: Arc<ShaderModule>,

    /// The storage image the rays are traced into.
    pub output_image: vk::ImageView,

    /// The size of `output_image`.
    pub extent: vk::Extent2D,

    /// See [`RayTracingPipelineCreateInfo::min_ray_recursion_depth`].
    ///
    /// The default value is `3`.
    pub min_ray_recursion_depth: u32,

    /// The denoising stage run after every trace.
    ///
    /// The default value is [`PassthroughDenoiser`].
    pub denoiser: Box<dyn Denoiser>,

    pub _ne: NonExhaustive,
}

impl RendererCreateInfo {
    /// Returns a `RendererCreateInfo` with the specified scene, shaders and output image.
    pub fn new(
        scene: SceneCreateInfo,
        [raygen_shader, miss_shader, closest_hit_shader]: [Arc<ShaderModule>; 3],
        output_image: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            scene,
            raygen_shader,
            miss_shader,
            closest_hit_shader,
            output_image,
            extent,
            min_ray_recursion_depth: DEFAULT_MIN_RAY_RECURSION_DEPTH,
            denoiser: Box::new(PassthroughDenoiser),
            _ne: NonExhaustive(()),
        }
    }
}

/// Owns everything needed to trace a scene into an image.
#[derive(Debug)]
pub struct Renderer {
    shader_binding_table: ShaderBindingTable,
    pipeline: Arc<RayTracingPipeline>,
    descriptor_set: RayTracingDescriptorSet,
    scene: Scene,
    denoiser: Box<dyn Denoiser>,

    output_image: vk::ImageView,
    extent: vk::Extent2D,
    frame_index: u64,
}

impl Renderer {
    /// Builds the scene and creates the pipeline objects for it.
    pub fn new(
        device: Arc<dyn Device>,
        create_info: RendererCreateInfo,
    ) -> Result<Renderer, Validated<VulkanError>> {
        let RendererCreateInfo {
            scene,
            raygen_shader,
            miss_shader,
            closest_hit_shader,
            output_image,
            extent,
            min_ray_recursion_depth,
            mut denoiser,
            _ne: _,
        } = create_info;

        let scene = Scene::new(device.clone(), scene)?;
        let layout = PipelineLayout::new(device.clone())?;
        let descriptor_set =
            RayTracingDescriptorSet::new(&layout, scene.top_level(), output_image)?;
        let pipeline = RayTracingPipeline::new(
            device,
            RayTracingPipelineCreateInfo {
                min_ray_recursion_depth,
                ..RayTracingPipelineCreateInfo::raygen_miss_closest_hit(
                    layout,
                    raygen_shader,
                    miss_shader,
                    closest_hit_shader,
                )
            },
        )?;
        let shader_binding_table = ShaderBindingTable::new(&pipeline)?;
        denoiser.resize(extent)?;

        Ok(Renderer {
            shader_binding_table,
            pipeline,
            descriptor_set,
            scene,
            denoiser,
            output_image,
            extent,
            frame_index: 0,
        })
    }

    #[inline]
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    #[inline]
    pub fn pipeline(&self) -> &Arc<RayTracingPipeline> {
        &self.pipeline
    }

    #[inline]
    pub fn shader_binding_table(&self) -> &ShaderBindingTable {
        &self.shader_binding_table
    }

    #[inline]
    pub fn descriptor_set(&self) -> &RayTracingDescriptorSet {
        &self.descriptor_set
    }

    /// Returns the number of frames recorded since the camera last moved or the output was
    /// resized.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Uploads new camera matrices. Restarts temporal accumulation.
    ///
    /// No frame recorded by this renderer may be executing, as the camera uniform buffer is
    /// written in place.
    pub fn update_camera(
        &mut self,
        view: Mat4,
        projection: Mat4,
    ) -> Result<(), Box<ValidationError>> {
        self.descriptor_set.update_camera(view, projection)?;
        self.frame_index = 0;

        Ok(())
    }

    /// Switches to a new output image, for example after the window was resized.
    ///
    /// No frame recorded by this renderer may be pending execution, as the descriptor set is
    /// updated in place to point at `output_image`.
    pub fn resize(
        &mut self,
        output_image: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<(), VulkanError> {
        self.denoiser.resize(extent)?;
        self.descriptor_set.set_output_image(output_image);
        self.output_image = output_image;
        self.extent = extent;
        self.frame_index = 0;

        Ok(())
    }

    /// Records tracing the scene into the output image, then denoising it. Returns the view of
    /// the final image.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be in the recording state.
    /// - The output image must be in the `GENERAL` layout when the commands execute.
    pub unsafe fn record_frame(
        &mut self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<vk::ImageView, Validated<VulkanError>> {
        unsafe {
            record_trace_rays(
                command_buffer,
                &self.shader_binding_table,
                &self.descriptor_set,
                self.extent,
            )
        }?;

        let input = DenoiseInput {
            color: self.output_image,
            extent: self.extent,
            frame_index: self.frame_index,
        };
        let output = unsafe { self.denoiser.record_denoise(command_buffer, &input) }?;
        self.frame_index += 1;

        Ok(output)
    }
}
