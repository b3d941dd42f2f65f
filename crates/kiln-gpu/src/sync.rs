//! Synchronization primitives.

use crate::error::{GpuError, Result};
use ash::vk;

/// How long a frame fence may stay unsignaled before the device is
/// considered lost (nanoseconds).
pub const FENCE_TIMEOUT_NS: u64 = 2_000_000_000;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// Wait for a fence with a bounded timeout.
///
/// Timeout expiry means the GPU stopped making progress on a prior frame
/// and is reported as device loss; an unbounded wait would hang the render
/// thread instead.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    let result = unsafe { device.wait_for_fences(&[fence], true, timeout_ns) };
    match result {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::DeviceLost(format!(
            "frame fence unsignaled after {}ms",
            timeout_ns / 1_000_000
        ))),
        Err(e) => Err(GpuError::from(e)),
    }
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}

/// Per-frame-slot synchronization resources.
pub struct FrameSync {
    /// Semaphore signaled when the swapchain image is available.
    pub image_available: vk::Semaphore,
    /// Fence signaled when this slot's GPU work completes.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            image_available: unsafe { create_semaphore(device)? },
            in_flight: unsafe { create_fence(device, true)? },
        })
    }

    /// Wait until this slot's previous frame finished on the GPU.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe { wait_for_fence(device, self.in_flight, FENCE_TIMEOUT_NS) }
    }

    /// Reset the fence for the next submission.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe { reset_fence(device, self.in_flight) }
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}
