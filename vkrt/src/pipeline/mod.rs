//! Describes how the device traces rays: the shader stages, how they are grouped, the resources
//! they access, and the table the trace command looks shaders up in.

pub use self::{
    layout::PipelineLayout,
    ray_tracing::{
        PipelineShaderStageCreateInfo, RayTracingPipeline, RayTracingPipelineCreateInfo,
        RayTracingShaderGroupCreateInfo, ShaderStage,
    },
    shader_binding_table::{ShaderBindingTable, ShaderBindingTableAddresses},
};

pub mod layout;
pub mod ray_tracing;
pub mod shader_binding_table;
