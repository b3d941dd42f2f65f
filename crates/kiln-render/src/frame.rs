//! Per-frame-in-flight resource slots.
//!
//! Each slot owns the per-frame copies of every uniform/storage buffer,
//! the transient render targets, a descriptor set, a command buffer, and
//! the frame's sync primitives. While the GPU consumes slot `k`, the CPU
//! fills slot `k+1`; nothing here is shared between slots.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use kiln_core::constants::{
    FRAMES_IN_FLIGHT, MATERIAL_TEXTURE_SLOTS, MAX_LIGHTS, MAX_MATERIALS, MAX_OBJECTS,
};
use kiln_gpu::descriptors::{
    write_sampled_image, write_storage_buffer, write_uniform_buffer, DescriptorPool,
};
use kiln_gpu::error::Result;
use kiln_gpu::memory::{GpuAllocator, GpuBuffer, GpuImage, ImageDesc, MemoryLocation};
use kiln_gpu::sync::FrameSync;
use kiln_gpu::CommandPool;

use crate::view::VIEW_COUNT;

/// Descriptor binding indices for the per-frame set.
pub mod bindings {
    pub const GLOBALS: u32 = 0;
    pub const VIEWS: u32 = 1;
    pub const OBJECTS: u32 = 2;
    pub const MATERIALS: u32 = 3;
    pub const LIGHTS: u32 = 4;
    pub const SHADOW_MAP: u32 = 5;
    pub const MAIN_COLOR: u32 = 6;
    pub const MAIN_DEPTH: u32 = 7;
    pub const TEXTURES: u32 = 8;
}

/// Frame-global shader constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GlobalUniforms {
    pub time: f32,
    pub delta_time: f32,
    pub frame: u32,
    pub light_count: u32,
    pub sun_direction: [f32; 4],
    pub sun_color: [f32; 4],
    pub shadow_view_proj: [[f32; 4]; 4],
}

impl GlobalUniforms {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Per-view matrices, indexed by the push-constant view id.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ViewUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub position: [f32; 4],
    pub viewport: [f32; 4],
}

impl ViewUniforms {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// One entry of the compacted per-object array.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ObjectParams {
    pub model: [[f32; 4]; 4],
}

impl ObjectParams {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// One entry of the material table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuMaterial {
    pub base_color: [f32; 4],
    pub emissive: [f32; 4],
    /// roughness, metallic, unused, unused
    pub params: [f32; 4],
    /// Indices into the bound texture array; `u32::MAX` means unbound.
    pub textures: [u32; MATERIAL_TEXTURE_SLOTS],
}

impl GpuMaterial {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// One entry of the light table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuLight {
    /// xyz position, w radius
    pub position: [f32; 4],
    /// rgb color, w unused
    pub color: [f32; 4],
}

impl GpuLight {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Push constants identifying the draw within the frame tables.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PushConstants {
    /// Base slot of this draw's instances in the object array.
    pub object_base: u32,
    pub material: u32,
    pub view: u32,
    /// Surface render flag bits, for debug shading.
    pub flags: u32,
}

impl PushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Formats and sizes for frame-state creation.
#[derive(Clone, Copy, Debug)]
pub struct FrameTargetConfig {
    pub extent: vk::Extent2D,
    pub shadow_map_size: u32,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub shadow_format: vk::Format,
}

/// One frame-in-flight slot.
pub struct FrameState {
    pub globals: GpuBuffer,
    pub views: GpuBuffer,
    pub objects: GpuBuffer,
    pub materials: GpuBuffer,
    pub lights: GpuBuffer,

    pub shadow_map: GpuImage,
    pub color: GpuImage,
    pub depth: GpuImage,
    /// Depth-aspect-only view for sampling in the post pass.
    pub depth_sample_view: vk::ImageView,

    pub descriptor_set: vk::DescriptorSet,
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,

    /// Texture-array binding generation this slot was last updated to.
    pub texture_generation: u64,

    sampler: vk::Sampler,
    shadow_sampler: vk::Sampler,
}

impl FrameState {
    /// Create one frame slot with all of its per-frame resources.
    ///
    /// # Safety
    /// All handles must be valid.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        descriptor_pool: &DescriptorPool,
        set_layout: vk::DescriptorSetLayout,
        command_pool: &CommandPool,
        sampler: vk::Sampler,
        shadow_sampler: vk::Sampler,
        config: &FrameTargetConfig,
        slot: usize,
    ) -> Result<Self> {
        let globals = unsafe {
            allocator.create_buffer(
                device,
                GlobalUniforms::SIZE as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("globals_{slot}"),
            )?
        };
        let views = unsafe {
            allocator.create_buffer(
                device,
                (VIEW_COUNT * ViewUniforms::SIZE) as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("views_{slot}"),
            )?
        };
        let objects = unsafe {
            allocator.create_buffer(
                device,
                (MAX_OBJECTS * ObjectParams::SIZE) as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("objects_{slot}"),
            )?
        };
        let materials = unsafe {
            allocator.create_buffer(
                device,
                (MAX_MATERIALS * GpuMaterial::SIZE) as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("materials_{slot}"),
            )?
        };
        let lights = unsafe {
            allocator.create_buffer(
                device,
                (MAX_LIGHTS * GpuLight::SIZE) as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("lights_{slot}"),
            )?
        };

        let shadow_map = unsafe {
            allocator.create_image(
                device,
                &ImageDesc::shadow_map(config.shadow_map_size, config.shadow_format),
                &format!("shadow_map_{slot}"),
            )?
        };
        let (color, depth, depth_sample_view) =
            unsafe { create_main_targets(device, allocator, config, slot)? };

        let descriptor_set = unsafe { descriptor_pool.allocate(device, &[set_layout])?[0] };
        let command_buffer = unsafe { command_pool.allocate(device, 1)?[0] };
        let sync = unsafe { FrameSync::new(device)? };

        let state = Self {
            globals,
            views,
            objects,
            materials,
            lights,
            shadow_map,
            color,
            depth,
            depth_sample_view,
            descriptor_set,
            command_buffer,
            sync,
            texture_generation: 0,
            sampler,
            shadow_sampler,
        };

        unsafe { state.write_static_descriptors(device) };
        Ok(state)
    }

    /// Write the descriptor bindings that only change on target rebuild.
    ///
    /// # Safety
    /// The descriptor set must not be in use by the GPU.
    unsafe fn write_static_descriptors(&self, device: &ash::Device) {
        unsafe {
            write_uniform_buffer(
                device,
                self.descriptor_set,
                bindings::GLOBALS,
                self.globals.buffer,
                0,
                self.globals.size,
            );
            write_storage_buffer(
                device,
                self.descriptor_set,
                bindings::VIEWS,
                self.views.buffer,
                0,
                self.views.size,
            );
            write_storage_buffer(
                device,
                self.descriptor_set,
                bindings::OBJECTS,
                self.objects.buffer,
                0,
                self.objects.size,
            );
            write_storage_buffer(
                device,
                self.descriptor_set,
                bindings::MATERIALS,
                self.materials.buffer,
                0,
                self.materials.size,
            );
            write_storage_buffer(
                device,
                self.descriptor_set,
                bindings::LIGHTS,
                self.lights.buffer,
                0,
                self.lights.size,
            );
            write_sampled_image(
                device,
                self.descriptor_set,
                bindings::SHADOW_MAP,
                self.shadow_map.view,
                self.shadow_sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
            write_sampled_image(
                device,
                self.descriptor_set,
                bindings::MAIN_COLOR,
                self.color.view,
                self.sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
            write_sampled_image(
                device,
                self.descriptor_set,
                bindings::MAIN_DEPTH,
                self.depth_sample_view,
                self.sampler,
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            );
        }
    }

    /// Rebuild the window-size-dependent targets after a resize.
    ///
    /// # Safety
    /// The GPU must be idle.
    pub unsafe fn recreate_targets(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        config: &FrameTargetConfig,
        slot: usize,
    ) -> Result<()> {
        unsafe {
            device.destroy_image_view(self.depth_sample_view, None);
            allocator.free_image(device, &mut self.color);
            allocator.free_image(device, &mut self.depth);

            let (color, depth, depth_sample_view) =
                create_main_targets(device, allocator, config, slot)?;
            self.color = color;
            self.depth = depth;
            self.depth_sample_view = depth_sample_view;

            self.write_static_descriptors(device);
        }
        Ok(())
    }

    /// Rewind every per-frame buffer cursor for a new frame.
    pub fn reset_buffers(&mut self) {
        self.globals.reset();
        self.views.reset();
        self.objects.reset();
        self.materials.reset();
        self.lights.reset();
    }

    /// Destroy all resources owned by this slot.
    ///
    /// # Safety
    /// The GPU must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        unsafe {
            self.sync.destroy(device);
            device.destroy_image_view(self.depth_sample_view, None);
            allocator.free_image(device, &mut self.shadow_map);
            allocator.free_image(device, &mut self.color);
            allocator.free_image(device, &mut self.depth);
            allocator.free_buffer(device, &mut self.globals);
            allocator.free_buffer(device, &mut self.views);
            allocator.free_buffer(device, &mut self.objects);
            allocator.free_buffer(device, &mut self.materials);
            allocator.free_buffer(device, &mut self.lights);
        }
    }
}

/// Create the main color/depth targets plus the depth sample view.
///
/// # Safety
/// All handles must be valid.
unsafe fn create_main_targets(
    device: &ash::Device,
    allocator: &mut GpuAllocator,
    config: &FrameTargetConfig,
    slot: usize,
) -> Result<(GpuImage, GpuImage, vk::ImageView)> {
    let color = unsafe {
        allocator.create_image(
            device,
            &ImageDesc::color_target(
                config.extent.width,
                config.extent.height,
                config.color_format,
            ),
            &format!("main_color_{slot}"),
        )?
    };
    let depth = unsafe {
        allocator.create_image(
            device,
            &ImageDesc::depth_stencil_target(
                config.extent.width,
                config.extent.height,
                config.depth_format,
            ),
            &format!("main_depth_{slot}"),
        )?
    };

    // Sampling reads the depth aspect only; the attachment view keeps
    // both aspects.
    let view_info = vk::ImageViewCreateInfo::default()
        .image(depth.image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(config.depth_format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::DEPTH)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );
    let depth_sample_view = unsafe { device.create_image_view(&view_info, None)? };

    Ok((color, depth, depth_sample_view))
}

/// Cycling frame-slot index.
#[derive(Clone, Copy, Debug)]
pub struct FrameRing {
    index: usize,
    count: usize,
}

impl FrameRing {
    /// Create a ring over `count` slots.
    pub fn new(count: usize) -> Self {
        debug_assert!(count > 0);
        Self { index: 0, count }
    }

    /// Ring with the default frames-in-flight count.
    pub fn with_default_depth() -> Self {
        Self::new(FRAMES_IN_FLIGHT)
    }

    /// Current slot index.
    pub fn current(&self) -> usize {
        self.index
    }

    /// Advance to the next slot and return it.
    pub fn advance(&mut self) -> usize {
        self.index = (self.index + 1) % self.count;
        self.index
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Rings are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_uniforms_layout() {
        assert_eq!(GlobalUniforms::SIZE, 112);
        assert_eq!(std::mem::offset_of!(GlobalUniforms, time), 0);
        assert_eq!(std::mem::offset_of!(GlobalUniforms, light_count), 12);
        assert_eq!(std::mem::offset_of!(GlobalUniforms, sun_direction), 16);
        assert_eq!(std::mem::offset_of!(GlobalUniforms, shadow_view_proj), 48);
    }

    #[test]
    fn view_uniforms_layout() {
        assert_eq!(ViewUniforms::SIZE, 224);
        assert_eq!(std::mem::offset_of!(ViewUniforms, projection), 64);
        assert_eq!(std::mem::offset_of!(ViewUniforms, view_proj), 128);
        assert_eq!(std::mem::offset_of!(ViewUniforms, position), 192);
        assert_eq!(std::mem::offset_of!(ViewUniforms, viewport), 208);
    }

    #[test]
    fn table_entry_layouts() {
        assert_eq!(ObjectParams::SIZE, 64);
        assert_eq!(GpuMaterial::SIZE, 80);
        assert_eq!(std::mem::offset_of!(GpuMaterial, textures), 48);
        assert_eq!(GpuLight::SIZE, 32);
        assert_eq!(PushConstants::SIZE, 16);
    }

    #[test]
    fn frame_ring_cycles() {
        let mut ring = FrameRing::new(2);
        assert_eq!(ring.current(), 0);
        assert_eq!(ring.advance(), 1);
        assert_eq!(ring.advance(), 0);
        assert_eq!(ring.advance(), 1);
    }

    #[test]
    fn frame_ring_of_three() {
        let mut ring = FrameRing::new(3);
        let seen: Vec<usize> = (0..6).map(|_| ring.advance()).collect();
        assert_eq!(seen, vec![1, 2, 0, 1, 2, 0]);
    }
}
