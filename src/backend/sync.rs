// Synchronization primitives
//
// One FrameSync per frame slot: the semaphores order GPU work within a
// frame, the fence tells the host when the slot's resources can be reused.

use ash::vk;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::RenderResult;

/// Frame synchronization objects - one set per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    /// The fence starts signaled so the first wait on a fresh slot returns
    /// immediately.
    pub fn new(device: &Arc<DeviceContext>) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
