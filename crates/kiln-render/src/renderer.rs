//! The frame renderer and scheduler.
//!
//! Drives the fixed per-frame sequence: wait on the reused slot's fence,
//! acquire a swapchain image (rebuilding on out-of-date), drain deferred
//! asset uploads, commit and merge the three render views, write the
//! frame slot's uniform data, record the shadow, main, and post segments
//! in order, submit, and present. The only blocking waits are the frame
//! fence and the synchronous upload drain.

use ash::vk;
use glam::Mat4;
use kiln_core::constants::{
    FRAMES_IN_FLIGHT, MAX_BOUND_TEXTURES, MAX_LIGHTS, MAX_MATERIALS, MAX_OBJECTS,
};
use kiln_core::{ObjectId, ProgramId, RenderFlags};
use kiln_gpu::command::{submit_command_buffers, CommandPool};
use kiln_gpu::descriptors::{
    write_sampled_image_array_element, DescriptorPool, DescriptorSetLayoutBuilder,
};
use kiln_gpu::error::{GpuError, Result};
use kiln_gpu::memory::{GpuAllocator, GpuImage};
use kiln_gpu::pipeline::create_pipeline_layout;
use kiln_gpu::swapchain::AcquireOutcome;
use kiln_gpu::sync::FENCE_TIMEOUT_NS;
use kiln_gpu::{GpuContext, SurfaceContext, Swapchain};

use crate::camera::{sun_shadow_matrices, Camera};
use crate::draw::DrawSurface;
use crate::frame::{
    bindings, FrameRing, FrameState, FrameTargetConfig, GlobalUniforms, GpuLight, GpuMaterial,
    ObjectParams, PushConstants, ViewUniforms,
};
use crate::pass::{surface_pass_state, DrawPass};
use crate::pipeline_cache::{PipelineCache, TargetFormats};
use crate::scene::{AssetStore, ProgramDesc, Scene, ShaderLibrary};
use crate::upload::{create_fallback_texture, GeometryBuffers, UploadQueue};
use crate::view::{RenderView, ViewKind, VIEW_COUNT};

/// World-space half-extent of the sun shadow volume.
const SHADOW_EXTENT: f32 = 60.0;

/// Clear color of the main view.
const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];

/// View indices into the renderer's view array.
const SHADOW_VIEW: usize = 0;
const MAIN_VIEW: usize = 1;
const POST_VIEW: usize = 2;

/// Renderer configuration.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub shadow_map_size: u32,
    pub memory_block_size: u64,
    /// Program for the fullscreen post resolve; `INVALID` skips it.
    pub post_program: ProgramId,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            shadow_map_size: 2048,
            memory_block_size: GpuAllocator::DEFAULT_BLOCK_SIZE,
            post_program: ProgramId::INVALID,
        }
    }
}

/// Resize/recreate sub-state of the swapchain.
///
/// `Normal` renders; `Invalidated` skips straight to a rebuild at the
/// start of the next frame. Out-of-date acquires/presents and explicit
/// resize requests both land here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainHealth {
    Normal,
    Invalidated { width: u32, height: u32 },
}

impl SwapchainHealth {
    /// Request a rebuild at the given extent; a later request wins.
    pub fn invalidate(&mut self, width: u32, height: u32) {
        *self = Self::Invalidated { width, height };
    }

    /// Whether a rebuild is pending.
    pub fn is_invalidated(&self) -> bool {
        matches!(self, Self::Invalidated { .. })
    }
}

/// Top-level renderer owning the views, frame slots, and pipeline cache.
pub struct Renderer {
    surface: SurfaceContext,
    swapchain: Swapchain,
    health: SwapchainHealth,
    allocator: GpuAllocator,
    command_pool: CommandPool,

    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    pipeline_layout: vk::PipelineLayout,
    sampler: vk::Sampler,
    shadow_sampler: vk::Sampler,

    shaders: ShaderLibrary,
    cache: PipelineCache,

    views: Vec<RenderView>,
    view_bases: [u32; VIEW_COUNT],
    frames: Vec<FrameState>,
    ring: FrameRing,
    frame_number: u64,
    time: f32,

    /// One render-finished semaphore per swapchain image.
    render_finished: Vec<vk::Semaphore>,

    geometry: Option<GeometryBuffers>,
    geometry_revision: u64,
    uploads: UploadQueue,
    fallback_texture: Option<GpuImage>,

    config: RendererConfig,
}

impl Renderer {
    /// Create the renderer.
    ///
    /// Every failure here is a fatal setup error; there is no partial
    /// renderer to fall back to.
    pub fn new(
        gpu: &GpuContext,
        surface: SurfaceContext,
        programs: &[ProgramDesc],
        config: RendererConfig,
    ) -> Result<Self> {
        let device = gpu.device();

        let swapchain = unsafe {
            surface.create_swapchain(gpu, config.width, config.height, config.vsync, None)?
        };
        tracing::info!(
            "swapchain created: {}x{} ({} images)",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len()
        );

        let mut allocator = GpuAllocator::new(gpu.memory_props(), config.memory_block_size);

        let command_pool = unsafe {
            CommandPool::new(
                device,
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };

        let sampler = unsafe { create_sampler(device, vk::SamplerAddressMode::REPEAT, true)? };
        let shadow_sampler =
            unsafe { create_sampler(device, vk::SamplerAddressMode::CLAMP_TO_EDGE, false)? };

        let set_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .uniform_buffer(
                    bindings::GLOBALS,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                )
                .storage_buffer(
                    bindings::VIEWS,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                )
                .storage_buffer(bindings::OBJECTS, vk::ShaderStageFlags::VERTEX)
                .storage_buffer(bindings::MATERIALS, vk::ShaderStageFlags::FRAGMENT)
                .storage_buffer(bindings::LIGHTS, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image(bindings::SHADOW_MAP, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image(bindings::MAIN_COLOR, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image(bindings::MAIN_DEPTH, vk::ShaderStageFlags::FRAGMENT)
                .sampled_image_array(
                    bindings::TEXTURES,
                    MAX_BOUND_TEXTURES as u32,
                    vk::ShaderStageFlags::FRAGMENT,
                )
                .build(device)?
        };

        let frames_in_flight = FRAMES_IN_FLIGHT as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(frames_in_flight),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(4 * frames_in_flight),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count((3 + MAX_BOUND_TEXTURES as u32) * frames_in_flight),
        ];
        let descriptor_pool =
            unsafe { DescriptorPool::new(device, frames_in_flight, &pool_sizes)? };

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(PushConstants::SIZE);
        let pipeline_layout =
            unsafe { create_pipeline_layout(device, &[set_layout], &[push_range])? };

        let shaders = unsafe { ShaderLibrary::generate_gpu_programs(device, programs)? };
        tracing::info!("{} gpu programs ready", shaders.len());

        let formats = TargetFormats {
            shadow_depth: vk::Format::D32_SFLOAT,
            main_color: vk::Format::R8G8B8A8_UNORM,
            main_depth: vk::Format::D32_SFLOAT_S8_UINT,
            swapchain_color: swapchain.format,
        };
        let mut cache = PipelineCache::new(pipeline_layout, formats);

        // The fullscreen resolve is the one pipeline not driven by a
        // material; create it up front.
        if config.post_program.is_valid() {
            let key = cache.key_for(config.post_program, DrawPass::Post, DrawPass::Post.state());
            unsafe { cache.get_or_create(device, &shaders, &key)? };
        }

        let target_config = FrameTargetConfig {
            extent: swapchain.extent,
            shadow_map_size: config.shadow_map_size,
            color_format: formats.main_color,
            depth_format: formats.main_depth,
            shadow_format: formats.shadow_depth,
        };

        let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for slot in 0..FRAMES_IN_FLIGHT {
            frames.push(unsafe {
                FrameState::new(
                    device,
                    &mut allocator,
                    &descriptor_pool,
                    set_layout,
                    &command_pool,
                    sampler,
                    shadow_sampler,
                    &target_config,
                    slot,
                )?
            });
        }

        let fallback_texture = unsafe {
            create_fallback_texture(device, &mut allocator, &command_pool, gpu.graphics_queue())?
        };

        // Every texture-array slot starts at the fallback so unreferenced
        // indices are always safe to sample.
        for frame in &frames {
            for element in 0..MAX_BOUND_TEXTURES as u32 {
                unsafe {
                    write_sampled_image_array_element(
                        device,
                        frame.descriptor_set,
                        bindings::TEXTURES,
                        element,
                        fallback_texture.view,
                        sampler,
                    );
                }
            }
        }

        let mut render_finished = Vec::with_capacity(swapchain.images.len());
        for _ in 0..swapchain.images.len() {
            render_finished.push(unsafe { kiln_gpu::sync::create_semaphore(device)? });
        }

        let views = ViewKind::ALL.iter().map(|&kind| RenderView::new(kind)).collect();

        Ok(Self {
            surface,
            swapchain,
            health: SwapchainHealth::Normal,
            allocator,
            command_pool,
            set_layout,
            descriptor_pool,
            pipeline_layout,
            sampler,
            shadow_sampler,
            shaders,
            cache,
            views,
            view_bases: [0; VIEW_COUNT],
            frames,
            ring: FrameRing::with_default_depth(),
            frame_number: 0,
            time: 0.0,
            render_finished,
            geometry: None,
            geometry_revision: 0,
            uploads: UploadQueue::new(),
            fallback_texture: Some(fallback_texture),
            config,
        })
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Aspect ratio of the swapchain.
    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent.width as f32 / self.swapchain.extent.height.max(1) as f32
    }

    /// Total frames rendered.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Mark the swapchain for rebuild at the given size.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.health.invalidate(width, height);
    }

    /// Render one frame.
    ///
    /// Returns without rendering when the swapchain came back out of
    /// date; the rebuilt swapchain is used on the next call.
    pub fn render_frame(
        &mut self,
        gpu: &GpuContext,
        assets: &AssetStore,
        scene: &Scene,
        camera: &Camera,
        dt: f32,
    ) -> Result<()> {
        let device = gpu.device();
        let slot = self.ring.current();

        unsafe { self.frames[slot].sync.wait(device)? };

        if let SwapchainHealth::Invalidated { width, height } = self.health {
            self.recreate_swapchain(gpu, width, height)?;
        }

        let outcome = unsafe {
            self.swapchain.acquire_next_image(
                &self.surface.swapchain_loader,
                self.frames[slot].sync.image_available,
                FENCE_TIMEOUT_NS,
            )?
        };
        let image_index = match outcome {
            AcquireOutcome::Ready(index) => index,
            AcquireOutcome::Suboptimal(index) => {
                let extent = self.swapchain.extent;
                self.health.invalidate(extent.width, extent.height);
                index
            }
            AcquireOutcome::OutOfDate => {
                let extent = self.swapchain.extent;
                self.health.invalidate(extent.width, extent.height);
                return Ok(());
            }
        };

        unsafe { self.frames[slot].sync.reset(device)? };

        self.sync_geometry(gpu, assets)?;
        unsafe {
            self.uploads.process(
                device,
                &mut self.allocator,
                &self.command_pool,
                gpu.graphics_queue(),
                assets,
            )?;
        }
        if self.frames[slot].texture_generation != self.uploads.generation() {
            self.rebind_textures(device, slot, assets);
        }

        self.commit_views(device, assets, scene, camera)?;
        for view in &mut self.views {
            view.finish();
        }

        self.write_frame_data(slot, assets, scene, camera, dt)?;
        self.record_frame(device, slot, image_index)?;

        let frame = &self.frames[slot];
        let wait_semaphores = [frame.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_finished[image_index as usize]];
        let command_buffers = [frame.command_buffer];

        unsafe {
            submit_command_buffers(
                device,
                gpu.graphics_queue(),
                &command_buffers,
                &wait_semaphores,
                &wait_stages,
                &signal_semaphores,
                frame.sync.in_flight,
            )?;

            let needs_rebuild = self.swapchain.present(
                &self.surface.swapchain_loader,
                gpu.graphics_queue(),
                image_index,
                &signal_semaphores,
            )?;
            if needs_rebuild {
                let extent = self.swapchain.extent;
                self.health.invalidate(extent.width, extent.height);
            }
        }

        self.ring.advance();
        self.frame_number += 1;
        self.time += dt;
        Ok(())
    }

    /// Re-upload the shared geometry buffers when the asset store changed.
    fn sync_geometry(&mut self, gpu: &GpuContext, assets: &AssetStore) -> Result<()> {
        if self.geometry.is_some() && self.geometry_revision == assets.geometry_revision() {
            return Ok(());
        }
        if assets.vertices.is_empty() {
            return Ok(());
        }

        let device = gpu.device();
        if let Some(mut old) = self.geometry.take() {
            // The old buffers may back in-flight draws.
            gpu.wait_idle()?;
            unsafe { old.destroy(device, &mut self.allocator) };
        }

        let geometry = unsafe {
            GeometryBuffers::upload(
                device,
                &mut self.allocator,
                &self.command_pool,
                gpu.graphics_queue(),
                &assets.vertices,
                &assets.indices,
            )?
        };
        self.geometry = Some(geometry);
        self.geometry_revision = assets.geometry_revision();
        Ok(())
    }

    /// Point this slot's texture-array elements at the uploaded images.
    fn rebind_textures(&mut self, device: &ash::Device, slot: usize, assets: &AssetStore) {
        let fallback_view = self
            .fallback_texture
            .as_ref()
            .map_or(vk::ImageView::null(), |texture| texture.view);
        let count = assets.texture_count().min(MAX_BOUND_TEXTURES);
        for index in 0..count {
            let view = self
                .uploads
                .image(kiln_core::TextureId(index as u32))
                .map_or(fallback_view, |image| image.view);
            unsafe {
                write_sampled_image_array_element(
                    device,
                    self.frames[slot].descriptor_set,
                    bindings::TEXTURES,
                    index as u32,
                    view,
                    self.sampler,
                );
            }
        }
        self.frames[slot].texture_generation = self.uploads.generation();
    }

    /// Commit every visible entity's surfaces to the views they belong to.
    fn commit_views(
        &mut self,
        device: &ash::Device,
        assets: &AssetStore,
        scene: &Scene,
        camera: &Camera,
    ) -> Result<()> {
        let extent = self.swapchain.extent;

        let (shadow_view, shadow_proj) =
            sun_shadow_matrices(scene.sun.direction, camera.position, SHADOW_EXTENT);

        {
            let view = &mut self.views[SHADOW_VIEW];
            view.clear();
            view.view_matrix = shadow_view;
            view.projection = shadow_proj;
            view.viewport = (self.config.shadow_map_size, self.config.shadow_map_size);
        }
        {
            let view = &mut self.views[MAIN_VIEW];
            view.clear();
            view.view_matrix = camera.view_matrix();
            view.projection = camera.projection_matrix();
            view.viewport = (extent.width, extent.height);
        }
        {
            let view = &mut self.views[POST_VIEW];
            view.clear();
            view.view_matrix = Mat4::IDENTITY;
            view.projection = Mat4::IDENTITY;
            view.viewport = (extent.width, extent.height);
        }

        for (object_index, entity) in scene.entities.iter().enumerate() {
            if entity.flags.is_hidden() {
                continue;
            }
            let Some(model) = assets.model(entity.model) else {
                tracing::warn!("entity references unknown model {}", entity.model.0);
                continue;
            };

            for model_surface in &model.surfaces {
                let Some(material) = assets.material(model_surface.material) else {
                    continue;
                };
                self.uploads.note_material(material);

                let mut surface = DrawSurface::new(
                    model_surface.first_index,
                    model_surface.index_count,
                    model_surface.vertex_offset,
                    model_surface.material,
                    entity.flags,
                    ObjectId(object_index as u32),
                );

                for pass in DrawPass::ALL {
                    let program = material.program(pass);
                    if !program.is_valid() {
                        continue;
                    }
                    // The wireframe flag swaps a surface's color pass.
                    let wireframe = entity.flags.contains(RenderFlags::WIREFRAME);
                    if (pass == DrawPass::Opaque && wireframe)
                        || (pass == DrawPass::Wireframe && !wireframe)
                    {
                        continue;
                    }
                    let state = surface_pass_state(pass, entity.flags);
                    let key = self.cache.key_for(program, pass, state);
                    surface.pipelines[pass.index()] =
                        unsafe { self.cache.get_or_create(device, &self.shaders, &key)? };
                }

                let in_main = ViewKind::Main
                    .passes()
                    .iter()
                    .any(|&pass| surface.pipeline(pass) != vk::Pipeline::null());
                if in_main {
                    self.views[MAIN_VIEW].submit(surface.clone(), entity.transform);
                }
                if entity.flags.casts_shadow()
                    && surface.pipeline(DrawPass::Shadow) != vk::Pipeline::null()
                {
                    self.views[SHADOW_VIEW].submit(surface.clone(), entity.transform);
                }
                if surface.pipeline(DrawPass::Post) != vk::Pipeline::null() {
                    self.views[POST_VIEW].submit(surface, entity.transform);
                }
            }
        }

        Ok(())
    }

    /// Fill this slot's uniform and storage buffers from the merged views.
    fn write_frame_data(
        &mut self,
        slot: usize,
        assets: &AssetStore,
        scene: &Scene,
        camera: &Camera,
        dt: f32,
    ) -> Result<()> {
        // Dense object slots across views: each view's compacted offsets
        // sit at a per-view base.
        let mut base = 0u32;
        for (index, view) in self.views.iter().enumerate() {
            self.view_bases[index] = base;
            base += view.total_instances();
        }
        let total_objects = base as usize;
        if total_objects > MAX_OBJECTS {
            return Err(GpuError::InvalidState(format!(
                "{total_objects} object slots exceed the {MAX_OBJECTS} capacity"
            )));
        }

        let mut object_slots = vec![Mat4::IDENTITY; total_objects];
        for (index, view) in self.views.iter().enumerate() {
            let start = self.view_bases[index] as usize;
            let end = start + view.total_instances() as usize;
            view.fill_object_slots(&mut object_slots[start..end]);
        }

        let shadow_view_proj =
            self.views[SHADOW_VIEW].projection * self.views[SHADOW_VIEW].view_matrix;

        let globals = GlobalUniforms {
            time: self.time,
            delta_time: dt,
            frame: self.frame_number as u32,
            light_count: scene.lights.len().min(MAX_LIGHTS) as u32,
            sun_direction: scene.sun.direction.extend(0.0).to_array(),
            sun_color: scene.sun.color.extend(1.0).to_array(),
            shadow_view_proj: shadow_view_proj.to_cols_array_2d(),
        };

        let view_uniforms: Vec<ViewUniforms> = self
            .views
            .iter()
            .map(|view| ViewUniforms {
                view: view.view_matrix.to_cols_array_2d(),
                projection: view.projection.to_cols_array_2d(),
                view_proj: (view.projection * view.view_matrix).to_cols_array_2d(),
                position: match view.kind() {
                    ViewKind::Main => camera.position.extend(1.0).to_array(),
                    _ => [0.0, 0.0, 0.0, 1.0],
                },
                viewport: [view.viewport.0 as f32, view.viewport.1 as f32, 0.0, 0.0],
            })
            .collect();

        let object_params: Vec<ObjectParams> = object_slots
            .iter()
            .map(|m| ObjectParams {
                model: m.to_cols_array_2d(),
            })
            .collect();

        let materials: Vec<GpuMaterial> = assets
            .materials()
            .iter()
            .take(MAX_MATERIALS)
            .map(|m| GpuMaterial {
                base_color: m.base_color,
                emissive: m.emissive,
                params: [m.roughness, m.metallic, 0.0, 0.0],
                textures: m.textures.map(|t| t.0),
            })
            .collect();

        let lights: Vec<GpuLight> = scene
            .lights
            .iter()
            .take(MAX_LIGHTS)
            .map(|l| GpuLight {
                position: l.position.extend(l.radius).to_array(),
                color: l.color.extend(0.0).to_array(),
            })
            .collect();

        let frame = &mut self.frames[slot];
        frame.reset_buffers();
        frame.globals.copy_data(bytemuck::bytes_of(&globals))?;
        frame.views.copy_data(bytemuck::cast_slice(&view_uniforms))?;
        if !object_params.is_empty() {
            frame.objects.copy_data(bytemuck::cast_slice(&object_params))?;
        }
        if !materials.is_empty() {
            frame.materials.copy_data(bytemuck::cast_slice(&materials))?;
        }
        if !lights.is_empty() {
            frame.lights.copy_data(bytemuck::cast_slice(&lights))?;
        }

        Ok(())
    }

    /// Record the full pass chain for this frame.
    fn record_frame(&self, device: &ash::Device, slot: usize, image_index: u32) -> Result<()> {
        let frame = &self.frames[slot];
        let cmd = frame.command_buffer;
        let extent = self.swapchain.extent;

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;

            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[frame.descriptor_set],
                &[],
            );

            if let Some(geometry) = &self.geometry {
                device.cmd_bind_vertex_buffers(cmd, 0, &[geometry.vertex.buffer], &[0]);
                device.cmd_bind_index_buffer(cmd, geometry.index.buffer, 0, vk::IndexType::UINT32);
            }

            self.record_shadow_segment(device, cmd, frame);
            self.record_main_segment(device, cmd, frame, extent);
            self.record_post_segment(device, cmd, image_index, extent);

            device.end_command_buffer(cmd)?;
        }
        Ok(())
    }

    /// Shadow pass: depth-only into the shadow map, then make it sampleable.
    unsafe fn record_shadow_segment(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        frame: &FrameState,
    ) {
        let size = self.config.shadow_map_size;
        let shadow_range = frame.shadow_map.desc.subresource_range();

        unsafe {
            image_barrier(
                device,
                cmd,
                frame.shadow_map.image,
                shadow_range,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

            let depth_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(frame.shadow_map.view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                });

            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: vk::Extent2D {
                        width: size,
                        height: size,
                    },
                })
                .layer_count(1)
                .depth_attachment(&depth_attachment);

            device.cmd_begin_rendering(cmd, &rendering_info);
            set_viewport_scissor(device, cmd, size, size);

            let mut last_pipeline = vk::Pipeline::null();
            self.record_view_pass(
                device,
                cmd,
                SHADOW_VIEW,
                DrawPass::Shadow,
                &mut last_pipeline,
            );

            device.cmd_end_rendering(cmd);

            // Main-view fragments sample the map produced above.
            image_barrier(
                device,
                cmd,
                frame.shadow_map.image,
                shadow_range,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            );
        }
    }

    /// Main raster segment: depth prepass through wireframe into the main
    /// color/depth targets, then make both sampleable for post.
    unsafe fn record_main_segment(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        frame: &FrameState,
        extent: vk::Extent2D,
    ) {
        let color_range = frame.color.desc.subresource_range();
        let depth_range = frame.depth.desc.subresource_range();

        unsafe {
            image_barrier(
                device,
                cmd,
                frame.color.image,
                color_range,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            );
            image_barrier(
                device,
                cmd,
                frame.depth.image,
                depth_range,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

            let color_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(frame.color.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: CLEAR_COLOR,
                    },
                });

            let depth_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(frame.depth.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                });

            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                })
                .layer_count(1)
                .color_attachments(std::slice::from_ref(&color_attachment))
                .depth_attachment(&depth_attachment)
                .stencil_attachment(&depth_attachment);

            device.cmd_begin_rendering(cmd, &rendering_info);
            set_viewport_scissor(device, cmd, extent.width, extent.height);

            let mut last_pipeline = vk::Pipeline::null();
            for &pass in ViewKind::Main.passes() {
                self.record_view_pass(device, cmd, MAIN_VIEW, pass, &mut last_pipeline);
            }

            device.cmd_end_rendering(cmd);

            // Post reads the resolved color and depth of this frame.
            image_barrier(
                device,
                cmd,
                frame.color.image,
                color_range,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            );
            image_barrier(
                device,
                cmd,
                frame.depth.image,
                depth_range,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            );
        }
    }

    /// Post segment: fullscreen resolve plus 2D overlays into the
    /// swapchain image, ending in present layout.
    unsafe fn record_post_segment(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image_index: u32,
        extent: vk::Extent2D,
    ) {
        let image = self.swapchain.images[image_index as usize];
        let view = self.swapchain.image_views[image_index as usize];
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        unsafe {
            image_barrier(
                device,
                cmd,
                image,
                range,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            );

            let color_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 1.0],
                    },
                });

            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                })
                .layer_count(1)
                .color_attachments(std::slice::from_ref(&color_attachment));

            device.cmd_begin_rendering(cmd, &rendering_info);
            set_viewport_scissor(device, cmd, extent.width, extent.height);

            let mut last_pipeline = vk::Pipeline::null();

            // Fullscreen resolve reads the main color/depth bindings. The
            // pipeline still declares the shared vertex layout, so skip it
            // until geometry is bound.
            let resolve = self.resolve_pipeline();
            if resolve != vk::Pipeline::null() && self.geometry.is_some() {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, resolve);
                last_pipeline = resolve;
                let push = PushConstants {
                    object_base: 0,
                    material: u32::MAX,
                    view: POST_VIEW as u32,
                    flags: 0,
                };
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push),
                );
                device.cmd_draw(cmd, 3, 1, 0, 0);
            }

            self.record_view_pass(device, cmd, POST_VIEW, DrawPass::Post, &mut last_pipeline);

            device.cmd_end_rendering(cmd);

            image_barrier(
                device,
                cmd,
                image,
                range,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            );
        }
    }

    /// The cached fullscreen resolve pipeline, or null when unavailable.
    fn resolve_pipeline(&self) -> vk::Pipeline {
        if !self.config.post_program.is_valid() {
            return vk::Pipeline::null();
        }
        let key = self
            .cache
            .key_for(self.config.post_program, DrawPass::Post, DrawPass::Post.state());
        self.cache.peek(&key)
    }

    /// Draw every merged surface of one view that participates in `pass`.
    unsafe fn record_view_pass(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        view_index: usize,
        pass: DrawPass,
        last_pipeline: &mut vk::Pipeline,
    ) {
        if self.geometry.is_none() {
            return;
        }
        let view = &self.views[view_index];

        for merged in view.merged() {
            let surface = &view.surfaces()[merged.surface as usize];
            let pipeline = surface.pipeline(pass);
            if pipeline == vk::Pipeline::null() {
                continue;
            }

            unsafe {
                if pipeline != *last_pipeline {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                    *last_pipeline = pipeline;
                }

                let push = PushConstants {
                    object_base: self.view_bases[view_index] + merged.object_offset,
                    material: surface.material.0,
                    view: view_index as u32,
                    flags: surface.flags.bits(),
                };
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push),
                );

                device.cmd_draw_indexed(
                    cmd,
                    surface.index_count,
                    merged.instance_count,
                    surface.first_index,
                    surface.vertex_offset,
                    0,
                );
            }
        }
    }

    /// Tear down and rebuild all window-size-dependent resources.
    fn recreate_swapchain(&mut self, gpu: &GpuContext, width: u32, height: u32) -> Result<()> {
        let device = gpu.device();
        gpu.wait_idle()?;

        unsafe {
            self.swapchain
                .destroy(device, &self.surface.swapchain_loader);
            self.swapchain =
                self.surface
                    .create_swapchain(gpu, width, height, self.config.vsync, None)?;

            for semaphore in self.render_finished.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
            for _ in 0..self.swapchain.images.len() {
                self.render_finished
                    .push(kiln_gpu::sync::create_semaphore(device)?);
            }

            let formats = TargetFormats {
                shadow_depth: vk::Format::D32_SFLOAT,
                main_color: vk::Format::R8G8B8A8_UNORM,
                main_depth: vk::Format::D32_SFLOAT_S8_UINT,
                swapchain_color: self.swapchain.format,
            };
            self.cache.set_formats(device, formats);
            if self.config.post_program.is_valid() {
                let key = self.cache.key_for(
                    self.config.post_program,
                    DrawPass::Post,
                    DrawPass::Post.state(),
                );
                self.cache.get_or_create(device, &self.shaders, &key)?;
            }

            let target_config = FrameTargetConfig {
                extent: self.swapchain.extent,
                shadow_map_size: self.config.shadow_map_size,
                color_format: formats.main_color,
                depth_format: formats.main_depth,
                shadow_format: formats.shadow_depth,
            };
            for (slot, frame) in self.frames.iter_mut().enumerate() {
                frame.recreate_targets(device, &mut self.allocator, &target_config, slot)?;
            }
        }

        self.health = SwapchainHealth::Normal;
        tracing::info!(
            "swapchain recreated: {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }

    /// Destroy all renderer resources.
    ///
    /// Must be called before the GPU context is dropped.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        let device = gpu.device();
        if let Err(e) = gpu.wait_idle() {
            tracing::error!("wait_idle before renderer teardown failed: {e}");
        }

        unsafe {
            for frame in &mut self.frames {
                frame.destroy(device, &mut self.allocator);
            }
            self.frames.clear();

            if let Some(mut geometry) = self.geometry.take() {
                geometry.destroy(device, &mut self.allocator);
            }
            self.uploads.destroy(device, &mut self.allocator);
            if let Some(mut fallback) = self.fallback_texture.take() {
                self.allocator.free_image(device, &mut fallback);
            }

            self.cache.destroy(device);
            self.shaders.destroy(device);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            self.descriptor_pool.destroy(device);
            device.destroy_sampler(self.sampler, None);
            device.destroy_sampler(self.shadow_sampler, None);

            for semaphore in self.render_finished.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }

            self.command_pool.destroy(device);
            self.swapchain
                .destroy(device, &self.surface.swapchain_loader);
            self.surface.destroy();
            self.allocator.shutdown(device);
        }
    }
}

/// Record a single image layout transition with explicit scopes.
///
/// # Safety
/// The command buffer must be in recording state.
#[allow(clippy::too_many_arguments)]
unsafe fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
) {
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .image(image)
        .subresource_range(range);

    let dependency_info =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
}

/// Set the dynamic viewport and scissor to cover the full target.
///
/// # Safety
/// The command buffer must be in recording state.
unsafe fn set_viewport_scissor(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    width: u32,
    height: u32,
) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: width as f32,
        height: height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent: vk::Extent2D { width, height },
    };
    unsafe {
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);
    }
}

/// Create a sampler.
///
/// # Safety
/// The device must be valid.
unsafe fn create_sampler(
    device: &ash::Device,
    address_mode: vk::SamplerAddressMode,
    anisotropy: bool,
) -> Result<vk::Sampler> {
    let create_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(address_mode)
        .address_mode_v(address_mode)
        .address_mode_w(address_mode)
        .anisotropy_enable(anisotropy)
        .max_anisotropy(if anisotropy { 8.0 } else { 1.0 })
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE);

    let sampler = unsafe { device.create_sampler(&create_info, None)? };
    Ok(sampler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_starts_normal_and_invalidates() {
        let mut health = SwapchainHealth::Normal;
        assert!(!health.is_invalidated());

        health.invalidate(800, 600);
        assert_eq!(health, SwapchainHealth::Invalidated {
            width: 800,
            height: 600
        });
    }

    #[test]
    fn latest_invalidation_wins() {
        let mut health = SwapchainHealth::Normal;
        health.invalidate(800, 600);
        health.invalidate(1024, 768);
        assert_eq!(health, SwapchainHealth::Invalidated {
            width: 1024,
            height: 768
        });
    }

    #[test]
    fn default_config_is_sane() {
        let config = RendererConfig::default();
        assert!(config.shadow_map_size.is_power_of_two());
        assert!(!config.post_program.is_valid());
        assert!(config.memory_block_size > 0);
    }
}
