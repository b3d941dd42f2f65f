//! GPU memory blocks and typed resource wrappers.
//!
//! Device memory is allocated in large fixed-size blocks, one per memory
//! type actually used, and carved up by the bump [`SubAllocator`]. Buffers
//! and images bind into a block at their sub-allocation offset and keep an
//! arena handle instead of a pointer back into the allocator.

use crate::alloc::{align_up, SubAlloc, SubAllocator};
use crate::error::{GpuError, Result};
use ash::vk;

/// Where a resource's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device-local memory; not CPU-visible. Writes go through staging.
    GpuOnly,
    /// Host-visible, persistently mapped memory for per-frame uploads.
    CpuToGpu,
}

impl MemoryLocation {
    fn property_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::CpuToGpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }
}

/// Find a memory type index matching `type_bits` and the requested flags.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        let supported = type_bits & (1 << i) != 0;
        let matches = props.memory_types[i as usize]
            .property_flags
            .contains(flags);
        supported && matches
    })
}

/// Mip chain length for auto-generated mips: `floor(log2(max(w, h))) + 1`.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    32 - largest.leading_zeros()
}

/// Validate a set of cubemap faces.
///
/// All six faces must share dimensions and format; anything else fails the
/// whole load (no partial cubemap). Returns the common `(width, height,
/// format)` on success.
pub fn validate_cubemap_faces(
    faces: &[(u32, u32, vk::Format)],
) -> Result<(u32, u32, vk::Format)> {
    if faces.len() != 6 {
        return Err(GpuError::InvalidState(format!(
            "cubemap requires 6 faces, got {}",
            faces.len()
        )));
    }
    let (w, h, format) = faces[0];
    for (i, &(fw, fh, ff)) in faces.iter().enumerate().skip(1) {
        if (fw, fh) != (w, h) {
            return Err(GpuError::InvalidState(format!(
                "cubemap face {i} is {fw}x{fh}, expected {w}x{h}"
            )));
        }
        if ff != format {
            return Err(GpuError::InvalidState(format!(
                "cubemap face {i} has format {ff:?}, expected {format:?}"
            )));
        }
    }
    Ok((w, h, format))
}

/// One large `vk::DeviceMemory` allocation managed by a bump allocator.
struct MemoryBlock {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    /// Persistent map base, null for device-local blocks.
    mapped: *mut u8,
    sub: SubAllocator,
}

impl MemoryBlock {
    /// # Safety
    /// The device must be valid and `memory_type_index` must exist.
    unsafe fn new(
        device: &ash::Device,
        size: u64,
        memory_type_index: u32,
        map: bool,
    ) -> Result<Self> {
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.allocate_memory(&alloc_info, None)? };

        let mapped = if map {
            let ptr = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match ptr {
                Ok(p) => p.cast::<u8>(),
                Err(e) => {
                    unsafe { device.free_memory(memory, None) };
                    return Err(GpuError::from(e));
                }
            }
        } else {
            std::ptr::null_mut()
        };

        Ok(Self {
            memory,
            memory_type_index,
            mapped,
            sub: SubAllocator::new(size),
        })
    }

    /// # Safety
    /// No resource bound into this block may still be in use.
    unsafe fn destroy(&mut self, device: &ash::Device) {
        if !self.mapped.is_null() {
            unsafe { device.unmap_memory(self.memory) };
            self.mapped = std::ptr::null_mut();
        }
        unsafe { device.free_memory(self.memory, None) };
        self.memory = vk::DeviceMemory::null();
    }
}

/// Handle to a range within one of the allocator's blocks.
#[derive(Clone, Copy, Debug)]
pub struct BlockAlloc {
    block: u32,
    sub: SubAlloc,
}

impl BlockAlloc {
    /// Byte offset within the owning block.
    pub fn offset(&self) -> u64 {
        self.sub.offset
    }

    /// Allocated size in bytes.
    pub fn size(&self) -> u64 {
        self.sub.size
    }
}

/// Block-based GPU memory allocator.
///
/// Owns every `vk::DeviceMemory` block the engine allocates. Blocks are
/// created lazily per memory type; sub-ranges come from the bump allocator
/// and are never physically reclaimed (see [`SubAllocator::pack`]).
///
/// Requires external synchronization; the renderer owns it on the single
/// render thread.
pub struct GpuAllocator {
    memory_props: vk::PhysicalDeviceMemoryProperties,
    blocks: Vec<MemoryBlock>,
    block_size: u64,
}

impl GpuAllocator {
    /// Default size of each memory block.
    pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

    /// Create an allocator for the given physical device.
    pub fn new(memory_props: vk::PhysicalDeviceMemoryProperties, block_size: u64) -> Self {
        Self {
            memory_props,
            blocks: Vec::new(),
            block_size,
        }
    }

    /// Sub-allocate a range for the given requirements.
    ///
    /// # Safety
    /// The device must be valid.
    unsafe fn allocate_range(
        &mut self,
        device: &ash::Device,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        label: &str,
    ) -> Result<BlockAlloc> {
        let flags = location.property_flags();
        let memory_type_index =
            find_memory_type(&self.memory_props, requirements.memory_type_bits, flags)
                .ok_or_else(|| GpuError::NoMemoryType(format!("{flags:?} for {label}")))?;
        let want_map = location == MemoryLocation::CpuToGpu;

        // Reuse an existing block of the right type with room. Mapped-ness
        // must match: on unified memory one type index can serve both
        // locations, but only mapped blocks can back CPU writes.
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if block.memory_type_index == memory_type_index
                && !block.mapped.is_null() == want_map
                && block.sub.can_allocate(requirements.alignment, requirements.size)
            {
                let sub = block
                    .sub
                    .allocate(requirements.alignment, requirements.size)
                    .ok_or_else(|| GpuError::AllocationFailed(label.to_string()))?;
                return Ok(BlockAlloc {
                    block: i as u32,
                    sub,
                });
            }
        }

        // No block fits; create one sized for the larger of the default and
        // the request itself.
        let block_size = self.block_size.max(requirements.size);
        let mut block =
            unsafe { MemoryBlock::new(device, block_size, memory_type_index, want_map)? };

        tracing::debug!(
            "allocated {} MiB memory block (type {memory_type_index}) for {label}",
            block_size / (1024 * 1024)
        );

        let sub = block
            .sub
            .allocate(requirements.alignment, requirements.size)
            .ok_or_else(|| GpuError::AllocationFailed(label.to_string()))?;

        self.blocks.push(block);
        Ok(BlockAlloc {
            block: self.blocks.len() as u32 - 1,
            sub,
        })
    }

    /// Create a buffer bound into one of the managed blocks.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create_buffer(
        &mut self,
        device: &ash::Device,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        label: &str,
    ) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let alloc = match unsafe { self.allocate_range(device, requirements, location, label) } {
            Ok(alloc) => alloc,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let block = &self.blocks[alloc.block as usize];
        unsafe { device.bind_buffer_memory(buffer, block.memory, alloc.sub.offset)? };

        let mapped = if block.mapped.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { block.mapped.add(alloc.sub.offset as usize) }
        };

        Ok(GpuBuffer {
            buffer,
            alloc,
            size,
            cursor: 0,
            mapped,
        })
    }

    /// Create an image plus its default view, bound into a managed block.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create_image(
        &mut self,
        device: &ash::Device,
        desc: &ImageDesc,
        label: &str,
    ) -> Result<GpuImage> {
        let flags = if desc.cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let alloc = match unsafe {
            self.allocate_range(device, requirements, MemoryLocation::GpuOnly, label)
        } {
            Ok(alloc) => alloc,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let block = &self.blocks[alloc.block as usize];
        unsafe { device.bind_image_memory(image, block.memory, alloc.sub.offset)? };

        let view_type = if desc.cube {
            vk::ImageViewType::CUBE
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(desc.subresource_range());

        let view = unsafe { device.create_image_view(&view_info, None)? };

        Ok(GpuImage {
            image,
            view,
            alloc,
            desc: *desc,
        })
    }

    /// Free a buffer's Vulkan handle and mark its range freed.
    ///
    /// # Safety
    /// The buffer must not be in use by the GPU.
    pub unsafe fn free_buffer(&mut self, device: &ash::Device, buffer: &mut GpuBuffer) {
        unsafe { device.destroy_buffer(buffer.buffer, None) };
        buffer.buffer = vk::Buffer::null();
        buffer.mapped = std::ptr::null_mut();
        self.mark_freed(buffer.alloc);
    }

    /// Free an image's Vulkan handles and mark its range freed.
    ///
    /// # Safety
    /// The image must not be in use by the GPU.
    pub unsafe fn free_image(&mut self, device: &ash::Device, image: &mut GpuImage) {
        unsafe {
            device.destroy_image_view(image.view, None);
            device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();
        image.view = vk::ImageView::null();
        self.mark_freed(image.alloc);
    }

    fn mark_freed(&mut self, alloc: BlockAlloc) {
        if let Some(block) = self.blocks.get_mut(alloc.block as usize) {
            if let Err(e) = block.sub.free(alloc.sub.index) {
                tracing::warn!("bad free in block {}: {e}", alloc.block);
            }
        }
    }

    /// Total bytes consumed across all blocks (including bump padding).
    pub fn used_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.sub.used()).sum()
    }

    /// Bytes a compaction pass would reclaim across all blocks.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.sub.pack()).sum()
    }

    /// Release all device memory.
    ///
    /// # Safety
    /// The device must be idle and every resource already destroyed.
    pub unsafe fn shutdown(&mut self, device: &ash::Device) {
        for block in &mut self.blocks {
            let live = block.sub.live_count();
            if live > 0 {
                tracing::warn!("memory block dropped with {live} live allocations");
            }
            unsafe { block.destroy(device) };
        }
        self.blocks.clear();
    }
}

/// A buffer with an append-style write cursor.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    alloc: BlockAlloc,
    /// Requested buffer size (the sub-allocation may be larger).
    pub size: u64,
    cursor: u64,
    mapped: *mut u8,
}

impl GpuBuffer {
    /// Append `data` at the current write cursor.
    ///
    /// Advances the cursor by `data.len()` rounded up to the
    /// sub-allocation's alignment and returns the offset written at.
    /// Fails if the backing memory is not host-visible or the write would
    /// run past the buffer end.
    pub fn copy_data(&mut self, data: &[u8]) -> Result<u64> {
        if self.mapped.is_null() {
            return Err(GpuError::InvalidState(
                "copy_data on unmapped buffer".to_string(),
            ));
        }
        let offset = self.cursor;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("write cursor overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "append of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.add(offset as usize),
                data.len(),
            );
        }

        self.cursor = align_up(end, self.alloc.sub.alignment).min(self.size);
        Ok(offset)
    }

    /// Write `data` at an absolute offset without moving the cursor.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.mapped.is_null() {
            return Err(GpuError::InvalidState(
                "write_at on unmapped buffer".to_string(),
            ));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("write offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Rewind the write cursor to the buffer base.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Move the write cursor to `pos`.
    pub fn set_pos(&mut self, pos: u64) -> Result<()> {
        if pos > self.size {
            return Err(GpuError::InvalidState(format!(
                "cursor {pos} past buffer size {}",
                self.size
            )));
        }
        self.cursor = pos;
        Ok(())
    }

    /// Current write cursor.
    pub fn pos(&self) -> u64 {
        self.cursor
    }

    /// Bytes left between the cursor and the buffer end.
    pub fn remaining(&self) -> u64 {
        self.size - self.cursor
    }

    /// Mapped base pointer, if host-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        (!self.mapped.is_null()).then_some(self.mapped)
    }
}

/// Image creation descriptor.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub cube: bool,
}

impl ImageDesc {
    /// A render-target color image that is also sampled by later passes.
    pub fn color_target(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            array_layers: 1,
            cube: false,
        }
    }

    /// A depth-stencil render target sampled by the post pass.
    pub fn depth_stencil_target(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            mip_levels: 1,
            array_layers: 1,
            cube: false,
        }
    }

    /// A depth-only shadow map sampled by the main passes.
    pub fn shadow_map(size: u32, format: vk::Format) -> Self {
        Self {
            width: size,
            height: size,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::DEPTH,
            mip_levels: 1,
            array_layers: 1,
            cube: false,
        }
    }

    /// A sampled 2D texture with an auto-generated mip chain.
    pub fn texture_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: mip_level_count(width, height),
            array_layers: 1,
            cube: false,
        }
    }

    /// A sampled cubemap (six faces, single mip level).
    pub fn cubemap(size: u32, format: vk::Format) -> Self {
        Self {
            width: size,
            height: size,
            format,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            array_layers: 6,
            cube: true,
        }
    }

    /// Full subresource range for this image.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }
}

/// An image with its default view and creation descriptor.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    alloc: BlockAlloc,
    pub desc: ImageDesc,
}

impl GpuImage {
    /// Image extent as `vk::Extent2D`.
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.width,
            height: self.desc.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_counts() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 2), 2);
        assert_eq!(mip_level_count(3, 3), 2);
        assert_eq!(mip_level_count(4, 4), 3);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(1920, 1080), 11);
        // Non-square uses the larger axis.
        assert_eq!(mip_level_count(512, 64), 10);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn cubemap_faces_must_match() {
        let face = (64, 64, vk::Format::R8G8B8A8_UNORM);
        let ok = [face; 6];
        assert_eq!(
            validate_cubemap_faces(&ok).unwrap(),
            (64, 64, vk::Format::R8G8B8A8_UNORM)
        );

        let mut wrong_size = ok;
        wrong_size[3] = (32, 64, vk::Format::R8G8B8A8_UNORM);
        assert!(validate_cubemap_faces(&wrong_size).is_err());

        let mut wrong_format = ok;
        wrong_format[5] = (64, 64, vk::Format::R8G8B8A8_SRGB);
        assert!(validate_cubemap_faces(&wrong_format).is_err());

        assert!(validate_cubemap_faces(&ok[..5]).is_err());
    }

    #[test]
    fn memory_type_selection() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            find_memory_type(
                &props,
                0b11,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            Some(1)
        );
        // Type bits exclude the matching type.
        assert_eq!(
            find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn texture_desc_auto_mips() {
        let desc = ImageDesc::texture_2d(256, 128, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(desc.mip_levels, 9);
        assert!(!desc.cube);
        let cube = ImageDesc::cubemap(64, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(cube.array_layers, 6);
        assert!(cube.cube);
    }
}
