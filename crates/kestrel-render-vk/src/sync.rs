// SPDX-License-Identifier: CEPL-1.0
//! Per-slot synchronization: two semaphores and a fence per frame in flight.
//!
//! The frame counter itself is the `SlotRing` inside `kestrel_render::DrawLoop`;
//! this module owns only the primitives each slot index refers to.
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use kestrel_render::Acquired;
use tracing::{debug, trace};

use crate::context::DeviceContext;
use crate::error::{VkError, VkResult};
use crate::swapchain::Swapchain;

pub struct Semaphore {
    ctx: Arc<DeviceContext>,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(ctx: &Arc<DeviceContext>) -> VkResult<Self> {
        let ci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        let handle = unsafe { ctx.device()?.create_semaphore(&ci, None)? };
        Ok(Semaphore {
            ctx: Arc::clone(ctx),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            unsafe { device.destroy_semaphore(self.handle, None) };
        }
    }
}

pub struct Fence {
    ctx: Arc<DeviceContext>,
    handle: vk::Fence,
}

impl Fence {
    pub fn new(ctx: &Arc<DeviceContext>, signaled: bool) -> VkResult<Self> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        let handle = unsafe { ctx.device()?.create_fence(&ci, None)? };
        Ok(Fence {
            ctx: Arc::clone(ctx),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until signaled. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> VkResult<()> {
        let device = self.ctx.device()?;
        let nanos = timeout_nanos(timeout);
        match unsafe { device.wait_for_fences(&[self.handle], true, nanos) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(VkError::GpuTimeout {
                waited_ms: timeout.map_or(u64::MAX, |d| d.as_millis() as u64),
            }),
            Err(e) => Err(VkError::classify(e)),
        }
    }

    pub fn reset(&self) -> VkResult<()> {
        let device = self.ctx.device()?;
        unsafe { device.reset_fences(&[self.handle]) }.map_err(VkError::classify)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            unsafe { device.destroy_fence(self.handle, None) };
        }
    }
}

fn timeout_nanos(timeout: Option<Duration>) -> u64 {
    match timeout {
        Some(d) => u64::try_from(d.as_nanos()).unwrap_or(u64::MAX),
        None => u64::MAX,
    }
}

/// `fence_timeout_ms` from config: 0 means unbounded.
pub fn fence_timeout(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

pub struct FrameSlot {
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    /// Created signaled so the first wait on a fresh slot returns at once.
    pub in_flight: Fence,
}

impl FrameSlot {
    fn new(ctx: &Arc<DeviceContext>) -> VkResult<Self> {
        Ok(FrameSlot {
            image_available: Semaphore::new(ctx)?,
            render_finished: Semaphore::new(ctx)?,
            in_flight: Fence::new(ctx, true)?,
        })
    }
}

pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    timeout: Option<Duration>,
}

impl FrameSynchronizer {
    pub fn new(ctx: &Arc<DeviceContext>, count: usize, timeout: Option<Duration>) -> VkResult<Self> {
        let slots = (0..count.max(1))
            .map(|_| FrameSlot::new(ctx))
            .collect::<VkResult<Vec<_>>>()?;
        debug!(slots = slots.len(), ?timeout, "frame synchronizer created");
        Ok(FrameSynchronizer { slots, timeout })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index % self.slots.len()]
    }

    /// Wait for the slot's previous frame, then acquire an image on its semaphore.
    ///
    /// The fence is reset only once an image was actually acquired; resetting it
    /// on an out-of-date result would leave nothing to signal it again.
    pub fn acquire_next(&self, index: usize, swapchain: &Swapchain) -> VkResult<Acquired> {
        let slot = self.slot(index);
        slot.in_flight.wait(self.timeout)?;

        let acquired = swapchain.acquire_next_image(slot.image_available.handle())?;
        if let Acquired::Image { index: image, suboptimal } = acquired {
            trace!(slot = index, image, suboptimal, "image acquired");
            slot.in_flight.reset()?;
        }
        Ok(acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_means_unbounded() {
        assert_eq!(fence_timeout(0), None);
        assert_eq!(fence_timeout(250), Some(Duration::from_millis(250)));
    }

    #[test]
    fn nanosecond_conversion_saturates() {
        assert_eq!(timeout_nanos(None), u64::MAX);
        assert_eq!(timeout_nanos(Some(Duration::from_millis(2))), 2_000_000);
        assert_eq!(timeout_nanos(Some(Duration::MAX)), u64::MAX);
    }
}
