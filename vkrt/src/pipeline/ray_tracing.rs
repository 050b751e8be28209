//! Ray tracing pipelines.
//!
//! A ray tracing pipeline combines ray generation, miss and hit shaders into shader groups. The
//! trace command does not reference shaders directly: it looks up shader group handles in a
//! [`ShaderBindingTable`](super::ShaderBindingTable), which is built from the pipeline after it
//! has been created.

use super::PipelineLayout;
use crate::{
    device::{Device, DeviceOwned},
    macros::impl_id_counter,
    shader::ShaderModule,
    NonExhaustive, Validated, ValidationError, VulkanError, VulkanObject,
};
use ash::vk;
use smallvec::{smallvec, SmallVec};
use std::{
    ffi::{CStr, CString},
    num::NonZero,
    sync::Arc,
};

/// The entry point of the ray generation shader in the fixed pipeline.
pub const RAYGEN_ENTRY_POINT: &CStr = c"rgenMain";
/// The entry point of the miss shader in the fixed pipeline.
pub const MISS_ENTRY_POINT: &CStr = c"rmissMain";
/// The entry point of the closest-hit shader in the fixed pipeline.
pub const CLOSEST_HIT_ENTRY_POINT: &CStr = c"chitMain";

/// The lowest `maxPipelineRayRecursionDepth` requested by default.
pub const DEFAULT_MIN_RAY_RECURSION_DEPTH: u32 = 3;

/// A ray tracing shader stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Raygen,
    Miss,
    ClosestHit,
    AnyHit,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    #[inline]
    fn from(val: ShaderStage) -> Self {
        match val {
            ShaderStage::Raygen => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        }
    }
}

/// Specifies a single shader stage when creating a pipeline.
#[derive(Clone, Debug)]
pub struct PipelineShaderStageCreateInfo {
    /// The stage the shader is executed in.
    pub stage: ShaderStage,

    /// The module the shader code is taken from.
    pub module: Arc<ShaderModule>,

    /// The name of the entry point inside `module`.
    pub entry_point: CString,

    pub _ne: NonExhaustive,
}

impl PipelineShaderStageCreateInfo {
    /// Returns a `PipelineShaderStageCreateInfo` with the specified `stage`, `module` and
    /// `entry_point`.
    #[inline]
    pub fn new(stage: ShaderStage, module: Arc<ShaderModule>, entry_point: &CStr) -> Self {
        Self {
            stage,
            module,
            entry_point: entry_point.to_owned(),
            _ne: NonExhaustive(()),
        }
    }

    fn to_vk(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.handle())
            .name(self.entry_point.as_c_str())
    }
}

/// A shader group: the unit the shader binding table holds handles of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RayTracingShaderGroupCreateInfo {
    /// A group with a single ray generation or miss shader.
    General { general_shader: u32 },

    /// A hit group for triangle geometry.
    TrianglesHit {
        closest_hit_shader: Option<u32>,
        any_hit_shader: Option<u32>,
    },
}

impl RayTracingShaderGroupCreateInfo {
    fn validate(
        &self,
        stages: &[PipelineShaderStageCreateInfo],
    ) -> Result<(), Box<ValidationError>> {
        let stage_of = |index: u32, field: &'static str| {
            stages
                .get(index as usize)
                .map(|stage| stage.stage)
                .ok_or_else(|| {
                    Box::new(ValidationError {
                        context: field.into(),
                        problem: "is not less than the number of stages".into(),
                        vuids: &["VUID-VkRayTracingShaderGroupCreateInfoKHR-type-03474"],
                    })
                })
        };

        match *self {
            RayTracingShaderGroupCreateInfo::General { general_shader } => {
                if !matches!(
                    stage_of(general_shader, "general_shader")?,
                    ShaderStage::Raygen | ShaderStage::Miss,
                ) {
                    return Err(Box::new(ValidationError {
                        context: "general_shader".into(),
                        problem: "does not refer to a raygen or miss stage".into(),
                        vuids: &["VUID-VkRayTracingShaderGroupCreateInfoKHR-type-03474"],
                    }));
                }
            }
            RayTracingShaderGroupCreateInfo::TrianglesHit {
                closest_hit_shader,
                any_hit_shader,
            } => {
                if closest_hit_shader.is_none() && any_hit_shader.is_none() {
                    return Err(Box::new(ValidationError {
                        problem: "a triangles hit group has neither a closest hit nor an any hit \
                            shader"
                            .into(),
                        ..Default::default()
                    }));
                }

                if let Some(index) = closest_hit_shader {
                    if stage_of(index, "closest_hit_shader")? != ShaderStage::ClosestHit {
                        return Err(Box::new(ValidationError {
                            context: "closest_hit_shader".into(),
                            problem: "does not refer to a closest hit stage".into(),
                            vuids: &[
                                "VUID-VkRayTracingShaderGroupCreateInfoKHR-closestHitShader-03477",
                            ],
                        }));
                    }
                }

                if let Some(index) = any_hit_shader {
                    if stage_of(index, "any_hit_shader")? != ShaderStage::AnyHit {
                        return Err(Box::new(ValidationError {
                            context: "any_hit_shader".into(),
                            problem: "does not refer to an any hit stage".into(),
                            vuids: &[
                                "VUID-VkRayTracingShaderGroupCreateInfoKHR-anyHitShader-03479",
                            ],
                        }));
                    }
                }
            }
        }

        Ok(())
    }

    pub(crate) fn to_vk(&self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        match *self {
            RayTracingShaderGroupCreateInfo::General { general_shader } => {
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(general_shader)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
            }
            RayTracingShaderGroupCreateInfo::TrianglesHit {
                closest_hit_shader,
                any_hit_shader,
            } => vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(closest_hit_shader.unwrap_or(vk::SHADER_UNUSED_KHR))
                .any_hit_shader(any_hit_shader.unwrap_or(vk::SHADER_UNUSED_KHR))
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        }
    }
}

/// The role a shader group plays in the shader binding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ShaderGroupKind {
    Raygen,
    Miss,
    Hit,
}

/// Parameters to create a new [`RayTracingPipeline`].
#[derive(Clone, Debug)]
pub struct RayTracingPipelineCreateInfo {
    /// The shader stages of the pipeline.
    ///
    /// The default value is empty, which must be overridden.
    pub stages: SmallVec<[PipelineShaderStageCreateInfo; 5]>,

    /// The shader groups, referring to `stages` by index.
    ///
    /// There must be exactly one group with a raygen shader. The default value is empty, which
    /// must be overridden.
    pub groups: SmallVec<[RayTracingShaderGroupCreateInfo; 5]>,

    /// The recursion depth requested is the larger of this value and the device's
    /// `maxRayRecursionDepth`.
    ///
    /// The default value is `3`.
    pub min_ray_recursion_depth: u32,

    /// The pipeline layout to use.
    ///
    /// There is no default value.
    pub layout: Arc<PipelineLayout>,

    pub _ne: NonExhaustive,
}

impl RayTracingPipelineCreateInfo {
    /// Returns a `RayTracingPipelineCreateInfo` with the specified `layout` and no stages.
    #[inline]
    pub fn layout(layout: Arc<PipelineLayout>) -> Self {
        Self {
            stages: SmallVec::new(),
            groups: SmallVec::new(),
            min_ray_recursion_depth: DEFAULT_MIN_RAY_RECURSION_DEPTH,
            layout,
            _ne: NonExhaustive(()),
        }
    }

    /// Returns a `RayTracingPipelineCreateInfo` with one raygen, one miss and one closest-hit
    /// shader, in groups 0, 1 and 2 respectively.
    pub fn raygen_miss_closest_hit(
        layout: Arc<PipelineLayout>,
        raygen: Arc<ShaderModule>,
        miss: Arc<ShaderModule>,
        closest_hit: Arc<ShaderModule>,
    ) -> Self {
        Self {
            stages: smallvec![
                PipelineShaderStageCreateInfo::new(ShaderStage::Raygen, raygen, RAYGEN_ENTRY_POINT),
                PipelineShaderStageCreateInfo::new(ShaderStage::Miss, miss, MISS_ENTRY_POINT),
                PipelineShaderStageCreateInfo::new(
                    ShaderStage::ClosestHit,
                    closest_hit,
                    CLOSEST_HIT_ENTRY_POINT,
                ),
            ],
            groups: smallvec![
                RayTracingShaderGroupCreateInfo::General { general_shader: 0 },
                RayTracingShaderGroupCreateInfo::General { general_shader: 1 },
                RayTracingShaderGroupCreateInfo::TrianglesHit {
                    closest_hit_shader: Some(2),
                    any_hit_shader: None,
                },
            ],
            ..Self::layout(layout)
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.stages.is_empty() {
            return Err(Box::new(ValidationError {
                context: "stages".into(),
                problem: "is empty".into(),
                vuids: &["VUID-VkRayTracingPipelineCreateInfoKHR-stageCount-03604"],
            }));
        }

        for (index, group) in self.groups.iter().enumerate() {
            group
                .validate(&self.stages)
                .map_err(|err| err.add_context(format!("groups[{index}]")))?;
        }

        let raygen_groups = group_kinds(&self.stages, &self.groups)
            .filter(|&kind| kind == ShaderGroupKind::Raygen)
            .count();
        if raygen_groups != 1 {
            return Err(Box::new(ValidationError {
                context: "groups".into(),
                problem: format!("contains {raygen_groups} raygen groups instead of exactly one")
                    .into(),
                ..Default::default()
            }));
        }

        Ok(())
    }
}

fn group_kinds<'a>(
    stages: &'a [PipelineShaderStageCreateInfo],
    groups: &'a [RayTracingShaderGroupCreateInfo],
) -> impl Iterator<Item = ShaderGroupKind> + 'a {
    groups.iter().map(move |group| match *group {
        RayTracingShaderGroupCreateInfo::General { general_shader }
            if stages[general_shader as usize].stage == ShaderStage::Raygen =>
        {
            ShaderGroupKind::Raygen
        }
        RayTracingShaderGroupCreateInfo::General { .. } => ShaderGroupKind::Miss,
        RayTracingShaderGroupCreateInfo::TrianglesHit { .. } => ShaderGroupKind::Hit,
    })
}

/// A compiled ray tracing pipeline.
#[derive(Debug)]
pub struct RayTracingPipeline {
    handle: vk::Pipeline,
    device: Arc<dyn Device>,
    id: NonZero<u64>,

    layout: Arc<PipelineLayout>,
    stages: SmallVec<[PipelineShaderStageCreateInfo; 5]>,
    groups: SmallVec<[RayTracingShaderGroupCreateInfo; 5]>,
    max_pipeline_ray_recursion_depth: u32,
}

impl RayTracingPipeline {
    /// Creates a new `RayTracingPipeline`.
    pub fn new(
        device: Arc<dyn Device>,
        create_info: RayTracingPipelineCreateInfo,
    ) -> Result<Arc<RayTracingPipeline>, Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let device_max = device.ray_tracing_properties().max_ray_recursion_depth;
        let max_pipeline_ray_recursion_depth = create_info.min_ray_recursion_depth.max(device_max);
        if max_pipeline_ray_recursion_depth > device_max {
            log::warn!(
                "requesting a ray recursion depth of {} on a device that supports at most {}",
                max_pipeline_ray_recursion_depth,
                device_max,
            );
        }

        let RayTracingPipelineCreateInfo {
            stages,
            groups,
            min_ray_recursion_depth: _,
            layout,
            _ne: _,
        } = create_info;

        let stages_vk: SmallVec<[_; 5]> = stages
            .iter()
            .map(PipelineShaderStageCreateInfo::to_vk)
            .collect();
        let groups_vk: SmallVec<[_; 5]> = groups
            .iter()
            .map(RayTracingShaderGroupCreateInfo::to_vk)
            .collect();
        let create_info_vk = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages_vk)
            .groups(&groups_vk)
            .max_pipeline_ray_recursion_depth(max_pipeline_ray_recursion_depth)
            .layout(layout.handle())
            .base_pipeline_index(-1);

        let handle = unsafe { device.create_ray_tracing_pipeline(&create_info_vk) }?;
        drop(stages_vk);

        log::info!(
            "ray tracing pipeline created: {} stages, {} groups, recursion depth {}",
            stages.len(),
            groups.len(),
            max_pipeline_ray_recursion_depth,
        );

        Ok(Arc::new(RayTracingPipeline {
            handle,
            device,
            id: Self::next_id(),
            layout,
            stages,
            groups,
            max_pipeline_ray_recursion_depth,
        }))
    }

    /// Returns the pipeline layout used in this pipeline.
    #[inline]
    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    #[inline]
    pub fn stages(&self) -> &[PipelineShaderStageCreateInfo] {
        &self.stages
    }

    #[inline]
    pub fn groups(&self) -> &[RayTracingShaderGroupCreateInfo] {
        &self.groups
    }

    /// Returns the recursion depth the pipeline was created with.
    #[inline]
    pub fn max_pipeline_ray_recursion_depth(&self) -> u32 {
        self.max_pipeline_ray_recursion_depth
    }

    pub(crate) fn group_kinds(&self) -> impl Iterator<Item = ShaderGroupKind> + '_ {
        group_kinds(&self.stages, &self.groups)
    }
}

impl Drop for RayTracingPipeline {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.device.destroy_pipeline(self.handle) };
    }
}

unsafe impl VulkanObject for RayTracingPipeline {
    type Handle = vk::Pipeline;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

unsafe impl DeviceOwned for RayTracingPipeline {
    #[inline]
    fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl_id_counter!(RayTracingPipeline);
