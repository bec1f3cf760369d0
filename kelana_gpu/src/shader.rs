/*! Shader modules.
 *
 * The core consumes compiled SPIR-V only; source compilation is the shader
 * compiler front-end's job. Vertex stage modules additionally record the
 * input attribute locations reflected by the compiler.
 */

use std::{ffi::CString, sync::Arc};

use anyhow::{Context, Result};
use ash::vk;

use super::device::Device;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    TessellationControl,
    TessellationEvaluation,
    Compute,
}

impl ShaderStage {
    pub(crate) fn to_vulkan_shader_stage_flag(self) -> vk::ShaderStageFlags {
        use vk::ShaderStageFlags;

        match self {
            Self::Vertex => ShaderStageFlags::VERTEX,
            Self::Fragment => ShaderStageFlags::FRAGMENT,
            Self::Geometry => ShaderStageFlags::GEOMETRY,
            Self::TessellationControl => ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessellationEvaluation => ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Compute => ShaderStageFlags::COMPUTE,
        }
    }
}

/// Attribute location reflected from a compiled vertex shader.
#[derive(Clone, Debug)]
pub struct VertexInputAttribute {
    pub name: String,
    pub location: u32,
    pub format: vk::Format,
}

/// Compiled shader handed over by the compiler front-end.
pub struct ShaderCompiledInfo<'a> {
    pub stage: ShaderStage,
    pub entry_point: &'a str,
    pub spirv: &'a [u32],
    pub vertex_attributes: Vec<VertexInputAttribute>,
}

pub struct ShaderModule {
    pub(crate) raw: vk::ShaderModule,
    pub stage: ShaderStage,
    pub(crate) entry_point: CString,
    pub vertex_attributes: Vec<VertexInputAttribute>,
    device: Arc<Device>,
}

impl ShaderModule {
    pub fn entry_point(&self) -> &str {
        self.entry_point.to_str().unwrap_or("main")
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.device.schedule_destruction_shader(self.raw);
    }
}

impl Device {
    pub fn create_shader_module(
        self: &Arc<Self>,
        info: ShaderCompiledInfo,
    ) -> Result<Arc<ShaderModule>> {
        if info.spirv.is_empty() {
            return Err(anyhow::anyhow!("Shader binary is empty!"));
        }

        let create_info = vk::ShaderModuleCreateInfo::default().code(info.spirv);
        let raw = unsafe {
            self.shared
                .raw
                .create_shader_module(&create_info, None)
                .with_context(|| "Failed to create shader module!")?
        };

        let entry_point = CString::new(info.entry_point)
            .with_context(|| "Shader entry point is not a valid C string!")?;

        self.shared
            .set_object_name(raw, "shader", info.entry_point);

        Ok(Arc::new(ShaderModule {
            raw,
            stage: info.stage,
            entry_point,
            vertex_attributes: info.vertex_attributes,
            device: self.clone(),
        }))
    }
}
