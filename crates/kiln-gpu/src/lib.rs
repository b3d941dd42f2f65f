//! Vulkan abstraction layer for the Kiln engine.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - Block-based bump memory allocation and typed buffer/image wrappers
//! - Command buffer management
//! - Swapchain and surface handling
//! - Graphics pipeline construction for dynamic rendering

pub mod alloc;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use alloc::{align_up, SubAlloc, SubAllocator};
pub use command::{execute_one_shot, submit_command_buffers, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder};
pub use error::{GpuError, Result};
pub use memory::{
    mip_level_count, validate_cubemap_faces, GpuAllocator, GpuBuffer, GpuImage, ImageDesc,
    MemoryLocation,
};
pub use pipeline::{GraphicsPipelineDesc, RasterDesc};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{AcquireOutcome, Swapchain};
pub use sync::{create_fence, create_semaphore, FrameSync, FENCE_TIMEOUT_NS};
