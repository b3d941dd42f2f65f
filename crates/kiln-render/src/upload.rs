//! Deferred asset upload.
//!
//! Textures are uploaded lazily on first reference: commit notes the
//! textures of every material it touches, and the renderer drains the
//! queue at the start of the next frame. Uploads stage through a
//! host-visible buffer and a one-shot command buffer that is submitted
//! and drained synchronously; a transfer queue with first-use fences is
//! the known improvement.

use ash::vk;
use hashbrown::HashSet;
use kiln_core::TextureId;
use kiln_gpu::command::{execute_one_shot, CommandPool};
use kiln_gpu::error::{GpuError, Result};
use kiln_gpu::memory::{
    validate_cubemap_faces, GpuAllocator, GpuBuffer, GpuImage, ImageDesc, MemoryLocation,
};

use crate::scene::{AssetStore, MaterialDesc, TexturePixels, Vertex};

/// Device-local vertex/index buffers shared by all draws.
pub struct GeometryBuffers {
    pub vertex: GpuBuffer,
    pub index: GpuBuffer,
}

impl GeometryBuffers {
    /// Upload the shared geometry arrays through a staging buffer.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn upload(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        pool: &CommandPool,
        queue: vk::Queue,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> Result<Self> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);

        let vertex = unsafe {
            allocator.create_buffer(
                device,
                vertex_bytes.len().max(1) as u64,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
                "shared_vertices",
            )?
        };
        let index = unsafe {
            allocator.create_buffer(
                device,
                index_bytes.len().max(1) as u64,
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
                "shared_indices",
            )?
        };

        let mut staging = unsafe {
            allocator.create_buffer(
                device,
                (vertex_bytes.len() + index_bytes.len()).max(1) as u64,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
                "geometry_staging",
            )?
        };
        let vertex_offset = staging.copy_data(vertex_bytes)?;
        let index_offset = staging.copy_data(index_bytes)?;

        unsafe {
            execute_one_shot(device, pool, queue, |cmd| {
                let vertex_copy = vk::BufferCopy::default()
                    .src_offset(vertex_offset)
                    .size(vertex_bytes.len() as u64);
                device.cmd_copy_buffer(cmd, staging.buffer, vertex.buffer, &[vertex_copy]);

                let index_copy = vk::BufferCopy::default()
                    .src_offset(index_offset)
                    .size(index_bytes.len() as u64);
                device.cmd_copy_buffer(cmd, staging.buffer, index.buffer, &[index_copy]);
            })?;

            allocator.free_buffer(device, &mut staging);
        }

        tracing::info!(
            "uploaded geometry: {} vertices, {} indices",
            vertices.len(),
            indices.len()
        );

        Ok(Self { vertex, index })
    }

    /// Destroy both buffers.
    ///
    /// # Safety
    /// The GPU must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        unsafe {
            allocator.free_buffer(device, &mut self.vertex);
            allocator.free_buffer(device, &mut self.index);
        }
    }
}

/// First-reference texture upload queue.
pub struct UploadQueue {
    pending: Vec<TextureId>,
    requested: HashSet<TextureId>,
    images: Vec<Option<GpuImage>>,
    generation: u64,
}

impl UploadQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            requested: HashSet::new(),
            images: Vec::new(),
            generation: 0,
        }
    }

    /// Note every texture a committed material references.
    pub fn note_material(&mut self, material: &MaterialDesc) {
        for &texture in &material.textures {
            if texture.is_valid() && self.requested.insert(texture) {
                self.pending.push(texture);
            }
        }
    }

    /// Whether any uploads are queued.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Uploaded image for a texture, if its upload completed.
    pub fn image(&self, texture: TextureId) -> Option<&GpuImage> {
        self.images.get(texture.index()).and_then(Option::as_ref)
    }

    /// Generation counter, bumped whenever new images become available.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drain the queue, uploading each pending texture.
    ///
    /// A texture that fails validation or upload is logged and skipped
    /// without creating anything (atomic per texture); the frame goes on.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn process(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        pool: &CommandPool,
        queue: vk::Queue,
        assets: &AssetStore,
    ) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        if self.images.len() < assets.texture_count() {
            self.images.resize_with(assets.texture_count(), || None);
        }

        let mut uploaded = 0usize;
        for texture in std::mem::take(&mut self.pending) {
            let Some(pixels) = assets.texture(texture) else {
                tracing::warn!("texture {} not in asset store, skipping", texture.0);
                continue;
            };

            let result = match pixels {
                TexturePixels::Flat {
                    width,
                    height,
                    format,
                    data,
                } => unsafe {
                    upload_texture_2d(
                        device, allocator, pool, queue, *width, *height, *format, data,
                    )
                },
                TexturePixels::Cube { faces } => unsafe {
                    upload_cubemap(device, allocator, pool, queue, faces)
                },
            };

            match result {
                Ok(image) => {
                    self.images[texture.index()] = Some(image);
                    uploaded += 1;
                }
                Err(e) => {
                    tracing::warn!("texture {} upload failed: {e}", texture.0);
                    // Allow a retry if the asset is fixed and re-referenced.
                    self.requested.remove(&texture);
                }
            }
        }

        if uploaded > 0 {
            self.generation += 1;
            tracing::debug!("uploaded {uploaded} textures (generation {})", self.generation);
        }
        Ok(())
    }

    /// Destroy every uploaded image.
    ///
    /// # Safety
    /// The GPU must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        for image in self.images.iter_mut().filter_map(Option::take) {
            let mut image = image;
            unsafe { allocator.free_image(device, &mut image) };
        }
        self.pending.clear();
        self.requested.clear();
    }
}

impl Default for UploadQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Upload a 2D texture and generate its mip chain.
///
/// # Safety
/// All handles must be valid.
#[allow(clippy::too_many_arguments)]
unsafe fn upload_texture_2d(
    device: &ash::Device,
    allocator: &mut GpuAllocator,
    pool: &CommandPool,
    queue: vk::Queue,
    width: u32,
    height: u32,
    format: vk::Format,
    data: &[u8],
) -> Result<GpuImage> {
    let desc = ImageDesc::texture_2d(width, height, format);
    let image = unsafe { allocator.create_image(device, &desc, "texture_2d")? };

    let mut staging = unsafe {
        allocator.create_buffer(
            device,
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "texture_staging",
        )?
    };
    if let Err(e) = staging.copy_data(data) {
        unsafe {
            allocator.free_buffer(device, &mut staging);
            let mut image = image;
            allocator.free_image(device, &mut image);
        }
        return Err(e);
    }

    unsafe {
        execute_one_shot(device, pool, queue, |cmd| {
            transition_image(
                device,
                cmd,
                image.image,
                desc.subresource_range(),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            generate_mips(device, cmd, image.image, width, height, desc.mip_levels);
        })?;

        allocator.free_buffer(device, &mut staging);
    }

    Ok(image)
}

/// Upload a cubemap: exactly six matching faces or nothing.
///
/// # Safety
/// All handles must be valid.
unsafe fn upload_cubemap(
    device: &ash::Device,
    allocator: &mut GpuAllocator,
    pool: &CommandPool,
    queue: vk::Queue,
    faces: &[crate::scene::TextureFace],
) -> Result<GpuImage> {
    let meta: Vec<(u32, u32, vk::Format)> =
        faces.iter().map(|f| (f.width, f.height, f.format)).collect();
    let (size, height, format) = validate_cubemap_faces(&meta)?;
    if size != height {
        return Err(GpuError::InvalidState(format!(
            "cubemap faces must be square, got {size}x{height}"
        )));
    }

    let desc = ImageDesc::cubemap(size, format);
    let image = unsafe { allocator.create_image(device, &desc, "cubemap")? };

    let total: usize = faces.iter().map(|f| f.data.len()).sum();
    let mut staging = unsafe {
        allocator.create_buffer(
            device,
            total as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "cubemap_staging",
        )?
    };

    let mut regions = Vec::with_capacity(6);
    for (layer, face) in faces.iter().enumerate() {
        let offset = match staging.copy_data(&face.data) {
            Ok(offset) => offset,
            Err(e) => {
                unsafe {
                    allocator.free_buffer(device, &mut staging);
                    let mut image = image;
                    allocator.free_image(device, &mut image);
                }
                return Err(e);
            }
        };
        regions.push(
            vk::BufferImageCopy::default()
                .buffer_offset(offset)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: layer as u32,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: size,
                    height: size,
                    depth: 1,
                }),
        );
    }

    unsafe {
        execute_one_shot(device, pool, queue, |cmd| {
            transition_image(
                device,
                cmd,
                image.image,
                desc.subresource_range(),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
            transition_image(
                device,
                cmd,
                image.image,
                desc.subresource_range(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;

        allocator.free_buffer(device, &mut staging);
    }

    Ok(image)
}

/// Record a full-subresource layout transition.
///
/// # Safety
/// The command buffer must be in recording state.
unsafe fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .image(image)
        .subresource_range(range);

    let dependency_info =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
}

/// Blit each mip level from the previous one, leaving the whole chain in
/// `SHADER_READ_ONLY_OPTIMAL`.
///
/// # Safety
/// The image must be in `TRANSFER_DST_OPTIMAL` across all levels.
unsafe fn generate_mips(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) {
    let level_range = |level: u32| vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: level,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    let mut src_width = width.max(1) as i32;
    let mut src_height = height.max(1) as i32;

    for level in 1..mip_levels {
        unsafe {
            // Previous level becomes the blit source.
            transition_image(
                device,
                cmd,
                image,
                level_range(level - 1),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            );
        }

        let dst_width = (src_width / 2).max(1);
        let dst_height = (src_height / 2).max(1);

        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level - 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: src_width,
                    y: src_height,
                    z: 1,
                },
            ],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dst_width,
                    y: dst_height,
                    z: 1,
                },
            ],
        };

        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );

            transition_image(
                device,
                cmd,
                image,
                level_range(level - 1),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }

        src_width = dst_width;
        src_height = dst_height;
    }

    unsafe {
        // The last level was only ever a blit destination.
        transition_image(
            device,
            cmd,
            image,
            level_range(mip_levels - 1),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
    }
}

/// A fallback 1x1 white texture bound to unused texture-array slots.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn create_fallback_texture(
    device: &ash::Device,
    allocator: &mut GpuAllocator,
    pool: &CommandPool,
    queue: vk::Queue,
) -> Result<GpuImage> {
    unsafe {
        upload_texture_2d(
            device,
            allocator,
            pool,
            queue,
            1,
            1,
            vk::Format::R8G8B8A8_UNORM,
            &[255, 255, 255, 255],
        )
    }
    .map_err(|e| GpuError::Other(format!("fallback texture: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material_with_textures(ids: &[u32]) -> MaterialDesc {
        let mut material = MaterialDesc::default();
        for (slot, &id) in ids.iter().enumerate() {
            material.textures[slot] = TextureId(id);
        }
        material
    }

    #[test]
    fn note_material_queues_each_texture_once() {
        let mut queue = UploadQueue::new();
        queue.note_material(&material_with_textures(&[0, 1]));
        queue.note_material(&material_with_textures(&[1, 2]));
        assert_eq!(queue.pending.len(), 3);
        assert!(queue.has_pending());
    }

    #[test]
    fn invalid_slots_are_ignored() {
        let mut queue = UploadQueue::new();
        queue.note_material(&MaterialDesc::default());
        assert!(!queue.has_pending());
    }
}
