//! Graphics pipeline construction.
//!
//! Pipelines are built for dynamic rendering (Vulkan 1.3): there is no
//! `VkRenderPass`; the target is identified by its attachment formats.
//! Viewport and scissor are always dynamic so pipelines survive resizes.

use crate::error::{GpuError, Result};
use ash::vk;

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid and `code` must be valid SPIR-V.
pub unsafe fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
) -> Result<vk::ShaderModule> {
    let shader_info = vk::ShaderModuleCreateInfo::default().code(code);
    let module = unsafe {
        device
            .create_shader_module(&shader_info, None)
            .map_err(|e| GpuError::ShaderModule(e.to_string()))?
    };
    Ok(module)
}

/// Create a pipeline layout.
///
/// # Safety
/// The device and descriptor set layouts must be valid.
pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    descriptor_set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(descriptor_set_layouts)
        .push_constant_ranges(push_constant_ranges);

    let layout = unsafe {
        device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?
    };
    Ok(layout)
}

/// Fixed-function state for one pipeline, fully expanded from pass state
/// bits by the render layer.
#[derive(Clone, Copy, Debug)]
pub struct RasterDesc {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend: bool,
    pub stencil_test: bool,
    pub color_write: bool,
}

impl Default for RasterDesc {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            blend: false,
            stencil_test: false,
            color_write: true,
        }
    }
}

/// Everything needed to build one graphics pipeline.
#[derive(Clone)]
pub struct GraphicsPipelineDesc {
    pub vertex_module: vk::ShaderModule,
    /// Absent for depth-only passes.
    pub fragment_module: Option<vk::ShaderModule>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub raster: RasterDesc,
    /// Color attachment format, if the target has one.
    pub color_format: Option<vk::Format>,
    /// Depth(-stencil) attachment format, if the target has one.
    pub depth_format: Option<vk::Format>,
}

/// Whether a depth format carries a stencil aspect.
pub fn format_has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Create a graphics pipeline for dynamic rendering.
///
/// # Safety
/// The device, layout, and shader modules must be valid.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &GraphicsPipelineDesc,
) -> Result<vk::Pipeline> {
    let mut shader_stages = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(desc.vertex_module)
        .name(c"main")];

    if let Some(fragment) = desc.fragment_module {
        shader_stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(c"main"),
        );
    }

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&desc.vertex_bindings)
        .vertex_attribute_descriptions(&desc.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.raster.polygon_mode)
        .cull_mode(desc.raster.cull_mode)
        .front_face(desc.raster.front_face)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    // Stencil-marking surfaces write reference 1 where they pass the
    // depth test; the post pass reads the marks.
    let stencil_op = vk::StencilOpState {
        fail_op: vk::StencilOp::KEEP,
        pass_op: vk::StencilOp::REPLACE,
        depth_fail_op: vk::StencilOp::KEEP,
        compare_op: vk::CompareOp::ALWAYS,
        compare_mask: 0xFF,
        write_mask: 0xFF,
        reference: 1,
    };

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.raster.depth_test)
        .depth_write_enable(desc.raster.depth_write)
        .depth_compare_op(desc.raster.depth_compare)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(desc.raster.stencil_test)
        .front(stencil_op)
        .back(stencil_op);

    let color_write_mask = if desc.raster.color_write {
        vk::ColorComponentFlags::RGBA
    } else {
        vk::ColorComponentFlags::empty()
    };

    let blend_attachment = if desc.raster.blend {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(color_write_mask)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(color_write_mask)
    };

    let color_blend_attachments: Vec<_> = desc
        .color_format
        .iter()
        .map(|_| blend_attachment)
        .collect();

    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc.color_format.into_iter().collect();
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

    if let Some(depth_format) = desc.depth_format {
        rendering_info = rendering_info.depth_attachment_format(depth_format);
        // Combined depth-stencil targets bind a stencil attachment whether
        // or not this pipeline tests it, and the formats must agree.
        if format_has_stencil(depth_format) {
            rendering_info = rendering_info.stencil_attachment_format(depth_format);
        }
    }

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?
    };

    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencil_formats() {
        assert!(format_has_stencil(vk::Format::D32_SFLOAT_S8_UINT));
        assert!(format_has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(!format_has_stencil(vk::Format::D32_SFLOAT));
        assert!(!format_has_stencil(vk::Format::R8G8B8A8_UNORM));
    }
}
