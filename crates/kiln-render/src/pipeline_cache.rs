//! Pipeline cache: at-most-one pipeline per (program, pass, state) tuple.

use ash::vk;
use hashbrown::HashMap;
use kiln_core::{ProgramId, StableHasher};
use kiln_gpu::error::Result;
use kiln_gpu::pipeline::{create_graphics_pipeline, GraphicsPipelineDesc};

use crate::pass::{DrawPass, PassStateFlags, PassTarget};
use crate::scene::{ShaderLibrary, Vertex};

/// Version tag for the pipeline key stream.
const PIPELINE_KEY_VERSION: u8 = 1;

/// Identity of one pipeline: program, pass, state bits, and the target's
/// attachment formats (the render-pass identity under dynamic rendering).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineKey {
    pub program: ProgramId,
    pub pass: DrawPass,
    pub state: PassStateFlags,
    pub color_format: Option<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl PipelineKey {
    /// Serialize the key into a stable 64-bit cache tag.
    pub fn stable_key(&self) -> u64 {
        let mut hasher = StableHasher::new(PIPELINE_KEY_VERSION);
        hasher.write_u32(self.program.0);
        hasher.write_u32(self.pass.index() as u32);
        hasher.write_u32(self.state.bits());
        hasher.write_i32(self.color_format.map_or(-1, |f| f.as_raw()));
        hasher.write_i32(self.depth_format.map_or(-1, |f| f.as_raw()));
        hasher.finish()
    }
}

/// Formats of the attachments each pass target renders into.
#[derive(Clone, Copy, Debug)]
pub struct TargetFormats {
    pub shadow_depth: vk::Format,
    pub main_color: vk::Format,
    pub main_depth: vk::Format,
    pub swapchain_color: vk::Format,
}

impl TargetFormats {
    /// The (color, depth) format pair for a pass target.
    pub fn for_target(&self, target: PassTarget) -> (Option<vk::Format>, Option<vk::Format>) {
        match target {
            PassTarget::ShadowMap => (None, Some(self.shadow_depth)),
            PassTarget::MainColor => (Some(self.main_color), Some(self.main_depth)),
            PassTarget::Swapchain => (Some(self.swapchain_color), None),
        }
    }
}

/// Lazily-populated cache of graphics pipelines.
///
/// Pipelines live for the process lifetime unless `invalidate` runs
/// (asset reload). A lookup whose program is missing returns the null
/// pipeline sentinel; callers skip the draw.
pub struct PipelineCache {
    entries: HashMap<u64, vk::Pipeline>,
    layout: vk::PipelineLayout,
    formats: TargetFormats,
}

impl PipelineCache {
    /// Create an empty cache using the given shared pipeline layout.
    pub fn new(layout: vk::PipelineLayout, formats: TargetFormats) -> Self {
        Self {
            entries: HashMap::new(),
            layout,
            formats,
        }
    }

    /// The shared pipeline layout.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Build the full key for a (program, pass, state) request, filling in
    /// the pass target's attachment formats.
    pub fn key_for(
        &self,
        program: ProgramId,
        pass: DrawPass,
        state: PassStateFlags,
    ) -> PipelineKey {
        let (color_format, depth_format) = self.formats.for_target(pass.target());
        PipelineKey {
            program,
            pass,
            state,
            color_format,
            depth_format,
        }
    }

    /// Update target formats (swapchain format may change on rebuild).
    ///
    /// # Safety
    /// The device must be valid; cached pipelines for stale formats are
    /// destroyed.
    pub unsafe fn set_formats(&mut self, device: &ash::Device, formats: TargetFormats) {
        if formats.swapchain_color != self.formats.swapchain_color {
            unsafe { self.invalidate(device) };
        }
        self.formats = formats;
    }

    /// Resolve the pipeline for a key, creating it on first request.
    ///
    /// Returns `vk::Pipeline::null()` when the program does not exist or
    /// has no fragment stage but the pass needs color output; both are
    /// soft misses, not errors.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn get_or_create(
        &mut self,
        device: &ash::Device,
        shaders: &ShaderLibrary,
        key: &PipelineKey,
    ) -> Result<vk::Pipeline> {
        let tag = key.stable_key();
        if let Some(&pipeline) = self.entries.get(&tag) {
            return Ok(pipeline);
        }

        let Some(program) = shaders.get(key.program) else {
            self.entries.insert(tag, vk::Pipeline::null());
            return Ok(vk::Pipeline::null());
        };

        let (color_format, depth_format) = (key.color_format, key.depth_format);
        if color_format.is_some()
            && key.state.contains(PassStateFlags::COLOR_WRITE)
            && program.fragment.is_none()
        {
            self.entries.insert(tag, vk::Pipeline::null());
            return Ok(vk::Pipeline::null());
        }

        let desc = GraphicsPipelineDesc {
            vertex_module: program.vertex,
            fragment_module: program.fragment,
            vertex_bindings: Vertex::bindings(),
            vertex_attributes: Vertex::attributes(),
            raster: key.state.to_raster_desc(),
            color_format,
            depth_format,
        };

        let pipeline = unsafe { create_graphics_pipeline(device, self.layout, &desc)? };
        tracing::debug!(
            "created pipeline for program {} in {:?} (tag {tag:#018x})",
            key.program.0,
            key.pass
        );
        self.entries.insert(tag, pipeline);
        Ok(pipeline)
    }

    /// Look up a key without creating anything.
    ///
    /// Returns the null sentinel for keys never requested.
    pub fn peek(&self, key: &PipelineKey) -> vk::Pipeline {
        self.entries
            .get(&key.stable_key())
            .copied()
            .unwrap_or(vk::Pipeline::null())
    }

    /// Number of cached entries (including null sentinels).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached pipeline, e.g. after an asset reload.
    ///
    /// # Safety
    /// The device must be idle; no cached pipeline may be in use.
    pub unsafe fn invalidate(&mut self, device: &ash::Device) {
        for (_, pipeline) in self.entries.drain() {
            if pipeline != vk::Pipeline::null() {
                unsafe { device.destroy_pipeline(pipeline, None) };
            }
        }
    }

    /// Destroy the cache contents. The layout is owned by the renderer.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe { self.invalidate(device) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(program: u32, pass: DrawPass) -> PipelineKey {
        PipelineKey {
            program: ProgramId(program),
            pass,
            state: pass.state(),
            color_format: Some(vk::Format::B8G8R8A8_SRGB),
            depth_format: Some(vk::Format::D32_SFLOAT_S8_UINT),
        }
    }

    #[test]
    fn same_tuple_same_tag() {
        assert_eq!(
            key(1, DrawPass::Opaque).stable_key(),
            key(1, DrawPass::Opaque).stable_key()
        );
    }

    #[test]
    fn distinct_tuples_distinct_tags() {
        let base = key(1, DrawPass::Opaque);
        assert_ne!(base.stable_key(), key(2, DrawPass::Opaque).stable_key());
        assert_ne!(base.stable_key(), key(1, DrawPass::Transparent).stable_key());

        let mut stencil = base;
        stencil.state |= PassStateFlags::STENCIL_TEST;
        assert_ne!(base.stable_key(), stencil.stable_key());

        let mut other_format = base;
        other_format.color_format = Some(vk::Format::R8G8B8A8_UNORM);
        assert_ne!(base.stable_key(), other_format.stable_key());
    }

    #[test]
    fn missing_format_is_distinct_from_any_format() {
        let mut with = key(1, DrawPass::Post);
        with.depth_format = Some(vk::Format::D32_SFLOAT);
        let mut without = key(1, DrawPass::Post);
        without.depth_format = None;
        assert_ne!(with.stable_key(), without.stable_key());
    }

    #[test]
    fn key_for_fills_target_formats() {
        let formats = TargetFormats {
            shadow_depth: vk::Format::D32_SFLOAT,
            main_color: vk::Format::R8G8B8A8_UNORM,
            main_depth: vk::Format::D32_SFLOAT_S8_UINT,
            swapchain_color: vk::Format::B8G8R8A8_SRGB,
        };
        let cache = PipelineCache::new(vk::PipelineLayout::null(), formats);

        let shadow = cache.key_for(ProgramId(1), DrawPass::Shadow, DrawPass::Shadow.state());
        assert_eq!(shadow.color_format, None);
        assert_eq!(shadow.depth_format, Some(vk::Format::D32_SFLOAT));

        let opaque = cache.key_for(ProgramId(1), DrawPass::Opaque, DrawPass::Opaque.state());
        assert_eq!(opaque.color_format, Some(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn target_formats_by_pass() {
        let formats = TargetFormats {
            shadow_depth: vk::Format::D32_SFLOAT,
            main_color: vk::Format::R8G8B8A8_UNORM,
            main_depth: vk::Format::D32_SFLOAT_S8_UINT,
            swapchain_color: vk::Format::B8G8R8A8_SRGB,
        };

        let (color, depth) = formats.for_target(PassTarget::ShadowMap);
        assert_eq!(color, None);
        assert_eq!(depth, Some(vk::Format::D32_SFLOAT));

        let (color, depth) = formats.for_target(PassTarget::Swapchain);
        assert_eq!(color, Some(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(depth, None);
    }
}
