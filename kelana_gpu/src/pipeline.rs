/*! Pipelines and the on-disk pipeline cache.
 *
 * Pipelines never own their layout; layouts are drawn from the descriptor
 * cache's shared table keyed by push constant footprint. All raster
 * pipelines target dynamic rendering and take their attachment formats
 * inline.
 */

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use ash::vk;

use super::{device::Device, shader::ShaderModule, Version};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    Raster,
    Compute,
}

pub struct RasterizationStateDescriptor {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub depth_clamp_enable: bool,
}

impl Default for RasterizationStateDescriptor {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            depth_clamp_enable: false,
        }
    }
}

pub struct DepthTestDescriptor {
    pub compare_op: vk::CompareOp,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
    pub depth_bounds_test_enable: bool,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
}

impl Default for DepthTestDescriptor {
    fn default() -> Self {
        Self {
            compare_op: vk::CompareOp::LESS,
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
            depth_bounds_test_enable: false,
            depth_test_enable: false,
            depth_write_enable: false,
        }
    }
}

pub struct RasterPipelineDescriptor<'a> {
    pub name: String,
    pub vertex_shader: &'a Arc<ShaderModule>,
    pub fragment_shader: Option<&'a Arc<ShaderModule>>,
    pub vertex_input_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub vertex_input_bindings: Vec<vk::VertexInputBindingDescription>,
    pub primitive_topology: vk::PrimitiveTopology,
    pub rasterization_state: RasterizationStateDescriptor,
    pub depth_test: DepthTestDescriptor,
    pub color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub color_attachment_formats: Vec<vk::Format>,
    pub depth_attachment_format: vk::Format,
    pub stencil_attachment_format: vk::Format,
    pub push_constant_size: u32,
}

pub struct ComputePipelineDescriptor<'a> {
    pub name: String,
    pub shader: &'a Arc<ShaderModule>,
    pub push_constant_size: u32,
}

pub struct Pipeline {
    pub(crate) raw: vk::Pipeline,
    /// Shared layout owned by the descriptor cache.
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) bind_point: vk::PipelineBindPoint,
    pub(crate) push_constant_size: u32,
    kind: PipelineKind,
    device: Arc<Device>,
}

impl Pipeline {
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // The layout belongs to the descriptor cache table and stays alive.
        self.device.schedule_destruction_pipeline(self.raw);
    }
}

impl Device {
    pub fn create_raster_pipeline(
        self: &Arc<Self>,
        desc: RasterPipelineDescriptor,
        cache: Option<&PipelineCacheStore>,
    ) -> Result<Arc<Pipeline>> {
        let layout = self
            .descriptor_cache
            .layout_for_push_constant_size(desc.push_constant_size)?;

        let mut shader_stages = vec![vk::PipelineShaderStageCreateInfo::default()
            .stage(desc.vertex_shader.stage.to_vulkan_shader_stage_flag())
            .module(desc.vertex_shader.raw)
            .name(desc.vertex_shader.entry_point.as_c_str())];
        if let Some(fragment_shader) = desc.fragment_shader {
            shader_stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(fragment_shader.stage.to_vulkan_shader_stage_flag())
                    .module(fragment_shader.raw)
                    .name(fragment_shader.entry_point.as_c_str()),
            );
        }

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_attribute_descriptions(&desc.vertex_input_attributes)
            .vertex_binding_descriptions(&desc.vertex_input_bindings);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.primitive_topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.rasterization_state.polygon_mode)
            .cull_mode(desc.rasterization_state.cull_mode)
            .front_face(desc.rasterization_state.front_face)
            .line_width(desc.rasterization_state.line_width)
            .depth_clamp_enable(desc.rasterization_state.depth_clamp_enable);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test.depth_test_enable)
            .depth_write_enable(desc.depth_test.depth_write_enable)
            .depth_compare_op(desc.depth_test.compare_op)
            .depth_bounds_test_enable(desc.depth_test.depth_bounds_test_enable)
            .min_depth_bounds(desc.depth_test.min_depth_bounds)
            .max_depth_bounds(desc.depth_test.max_depth_bounds);

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&desc.color_blend_attachments);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false)
            .min_sample_shading(1.0);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut pipeline_rendering_info = vk::PipelineRenderingCreateInfo::default()
            .view_mask(0)
            .color_attachment_formats(&desc.color_attachment_formats)
            .depth_attachment_format(desc.depth_attachment_format)
            .stencil_attachment_format(desc.stencil_attachment_format);

        let pipeline_create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .multisample_state(&multisample_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut pipeline_rendering_info);

        let raw = unsafe {
            self.shared
                .raw
                .create_graphics_pipelines(
                    cache.map(|cache| cache.raw).unwrap_or_else(vk::PipelineCache::null),
                    std::slice::from_ref(&pipeline_create_info),
                    None,
                )
                .map_err(|(_, error)| error)
                .with_context(|| "Failed to create raster pipeline!")?[0]
        };
        self.shared.set_object_name(raw, "pipeline", &desc.name);

        Ok(Arc::new(Pipeline {
            raw,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_constant_size: desc.push_constant_size,
            kind: PipelineKind::Raster,
            device: self.clone(),
        }))
    }

    pub fn create_compute_pipeline(
        self: &Arc<Self>,
        desc: ComputePipelineDescriptor,
        cache: Option<&PipelineCacheStore>,
    ) -> Result<Arc<Pipeline>> {
        let layout = self
            .descriptor_cache
            .layout_for_push_constant_size(desc.push_constant_size)?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(desc.shader.stage.to_vulkan_shader_stage_flag())
            .module(desc.shader.raw)
            .name(desc.shader.entry_point.as_c_str());

        let pipeline_create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let raw = unsafe {
            self.shared
                .raw
                .create_compute_pipelines(
                    cache.map(|cache| cache.raw).unwrap_or_else(vk::PipelineCache::null),
                    std::slice::from_ref(&pipeline_create_info),
                    None,
                )
                .map_err(|(_, error)| error)
                .with_context(|| "Failed to create compute pipeline!")?[0]
        };
        self.shared.set_object_name(raw, "pipeline", &desc.name);

        Ok(Arc::new(Pipeline {
            raw,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            push_constant_size: desc.push_constant_size,
            kind: PipelineKind::Compute,
            device: self.clone(),
        }))
    }
}

const SBF_MAGIC: u32 = u32::from_le_bytes(*b".SBF");
const SBF_VERSION_MAJOR: i8 = 1;
const SBF_VERSION_MINOR: i8 = 0;
const PIPELINE_CACHE_TAG: u32 = u32::from_le_bytes(*b"PSOC");

const CACHE_INFO_FILE: &str = ".cacheinfo";
const CACHE_BLOB_FILE: &str = "pipeline_cache.sbf";

/// `{ magic, version }` header plus a `{ tag, size }` descriptor in front
/// of the raw driver blob.
fn encode_sbf_blob(tag: u32, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(14 + data.len());
    bytes.extend_from_slice(&SBF_MAGIC.to_le_bytes());
    bytes.push(SBF_VERSION_MAJOR as u8);
    bytes.push(SBF_VERSION_MINOR as u8);
    bytes.extend_from_slice(&tag.to_le_bytes());
    bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    bytes.extend_from_slice(data);
    bytes
}

fn decode_sbf_blob(bytes: &[u8]) -> Option<(u32, &[u8])> {
    if bytes.len() < 14 {
        return None;
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    if magic != SBF_MAGIC {
        return None;
    }
    if bytes[4] as i8 != SBF_VERSION_MAJOR {
        return None;
    }
    let tag = u32::from_le_bytes(bytes[6..10].try_into().ok()?);
    let size = u32::from_le_bytes(bytes[10..14].try_into().ok()?) as usize;
    let payload = bytes.get(14..14 + size)?;
    Some((tag, payload))
}

fn encode_driver_version(version: Version) -> [u8; 12] {
    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&version.major.to_le_bytes());
    bytes[4..8].copy_from_slice(&version.minor.to_le_bytes());
    bytes[8..12].copy_from_slice(&version.patch.to_le_bytes());
    bytes
}

fn driver_version_matches(stored: &[u8], version: Version) -> bool {
    stored.len() == 12 && stored == encode_driver_version(version)
}

/// Persisted `vkPipelineCache` keyed by the driver version. A driver
/// change purges the cache directory and flags every pipeline for
/// recompilation.
pub struct PipelineCacheStore {
    raw: vk::PipelineCache,
    cache_dir: PathBuf,
    recompile_shaders: bool,
    device: Arc<Device>,
}

impl PipelineCacheStore {
    pub fn open(device: &Arc<Device>, cache_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("Failed to create pipeline cache directory {:?}", cache_dir))?;

        let driver_version = device.info().driver_version;
        let info_path = cache_dir.join(CACHE_INFO_FILE);
        let blob_path = cache_dir.join(CACHE_BLOB_FILE);

        let mut recompile_shaders = false;
        match fs::read(&info_path) {
            Ok(stored) if driver_version_matches(&stored, driver_version) => {}
            Ok(_) => {
                log::info!("Driver version changed; purging the pipeline cache");
                fs::remove_dir_all(cache_dir).ok();
                fs::create_dir_all(cache_dir)?;
                fs::write(&info_path, encode_driver_version(driver_version))?;
                recompile_shaders = true;
            }
            Err(_) => {
                fs::write(&info_path, encode_driver_version(driver_version))?;
                recompile_shaders = true;
            }
        }

        let initial_data = fs::read(&blob_path).ok().and_then(|bytes| {
            decode_sbf_blob(&bytes).and_then(|(tag, payload)| {
                (tag == PIPELINE_CACHE_TAG).then(|| payload.to_vec())
            })
        });

        let mut create_info = vk::PipelineCacheCreateInfo::default();
        if let Some(initial_data) = &initial_data {
            create_info = create_info.initial_data(initial_data);
        }
        let raw = unsafe {
            device
                .shared
                .raw
                .create_pipeline_cache(&create_info, None)
                .with_context(|| "Failed to create pipeline cache!")?
        };

        Ok(Self {
            raw,
            cache_dir: cache_dir.to_path_buf(),
            recompile_shaders,
            device: device.clone(),
        })
    }

    /// Whether cached pipeline state was discarded and shaders should be
    /// compiled fresh.
    pub fn recompile_shaders(&self) -> bool {
        self.recompile_shaders
    }

    /// Writes the current driver blob back to disk.
    pub fn save(&self) -> Result<()> {
        let data = unsafe { self.device.shared.raw.get_pipeline_cache_data(self.raw)? };
        fs::write(
            self.cache_dir.join(CACHE_BLOB_FILE),
            encode_sbf_blob(PIPELINE_CACHE_TAG, &data),
        )?;
        fs::write(
            self.cache_dir.join(CACHE_INFO_FILE),
            encode_driver_version(self.device.info().driver_version),
        )?;
        Ok(())
    }
}

impl Drop for PipelineCacheStore {
    fn drop(&mut self) {
        unsafe {
            self.device.shared.raw.destroy_pipeline_cache(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbf_blob_round_trips() {
        let payload = [1u8, 2, 3, 4, 5];
        let encoded = encode_sbf_blob(PIPELINE_CACHE_TAG, &payload);
        let (tag, decoded) = decode_sbf_blob(&encoded).unwrap();
        assert_eq!(tag, PIPELINE_CACHE_TAG);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn sbf_magic_reads_back_as_dot_sbf() {
        let encoded = encode_sbf_blob(PIPELINE_CACHE_TAG, &[]);
        assert_eq!(&encoded[0..4], b".SBF");
    }

    #[test]
    fn sbf_blob_rejects_a_bad_magic() {
        let mut encoded = encode_sbf_blob(PIPELINE_CACHE_TAG, &[1, 2, 3]);
        encoded[0] = b'X';
        assert!(decode_sbf_blob(&encoded).is_none());
    }

    #[test]
    fn sbf_blob_rejects_truncated_payloads() {
        let mut encoded = encode_sbf_blob(PIPELINE_CACHE_TAG, &[1, 2, 3, 4]);
        encoded.truncate(encoded.len() - 2);
        assert!(decode_sbf_blob(&encoded).is_none());
    }

    #[test]
    fn driver_version_gate_detects_changes() {
        let version = Version {
            variant: 0,
            major: 535,
            minor: 3,
            patch: 1,
        };
        let stored = encode_driver_version(version);
        assert!(driver_version_matches(&stored, version));

        let newer = Version {
            patch: 2,
            ..version
        };
        assert!(!driver_version_matches(&stored, newer));
        assert!(!driver_version_matches(&stored[..8], version));
    }
}
