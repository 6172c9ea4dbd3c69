// Frame scheduler - CPU/GPU frame pacing
//
// Drives the per-frame synchronization protocol over a small driver
// trait so the ordering rules can be tested without a GPU. The driver
// owns the Vulkan objects; the scheduler owns the slot rotation and the
// image-to-slot ownership map.
//
// Protocol per frame:
//   1. wait the current slot's fence
//   2. acquire an image (out-of-date: rebuild, retry next frame)
//   3. if another slot still owns that image, wait its fence too
//   4. claim the image for the current slot
//   5. reset the slot fence (only after all waits)
//   6. submit
//   7. present (out-of-date or suboptimal: rebuild, no slot advance)
//   8. advance to the next slot

use crate::backend::{ImageAcquire, PresentResult};
use crate::error::RenderResult;

/// How many frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// What a completed `draw_frame` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and presented.
    Drawn,
    /// The swapchain was stale; it was rebuilt and the frame skipped.
    SwapchainRebuilt,
}

/// The per-frame operations the scheduler sequences.
///
/// `slot` is always in `0..MAX_FRAMES_IN_FLIGHT`. Fence waits block until
/// the GPU work submitted with that slot's fence has finished.
pub trait FrameDriver {
    fn wait_slot_fence(&mut self, slot: usize) -> RenderResult<()>;
    fn acquire_image(&mut self, slot: usize) -> RenderResult<ImageAcquire>;
    fn reset_slot_fence(&mut self, slot: usize) -> RenderResult<()>;
    fn submit(&mut self, slot: usize, image_index: u32) -> RenderResult<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentResult>;
    /// Recreate the swapchain and return the new image count.
    fn rebuild_swapchain(&mut self) -> RenderResult<usize>;
}

pub struct FrameScheduler {
    current_slot: usize,
    /// For each swapchain image, the slot whose submission last targeted it.
    images_in_flight: Vec<Option<usize>>,
}

impl FrameScheduler {
    pub fn new(image_count: usize) -> Self {
        Self {
            current_slot: 0,
            images_in_flight: vec![None; image_count],
        }
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Forget all image ownership. Called after every swapchain rebuild,
    /// since the old images (and anything waiting on them) are gone.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    /// Run one iteration of the frame protocol.
    pub fn draw_frame<D: FrameDriver>(&mut self, driver: &mut D) -> RenderResult<FrameOutcome> {
        let slot = self.current_slot;

        driver.wait_slot_fence(slot)?;

        let (image_index, _suboptimal) = match driver.acquire_image(slot)? {
            ImageAcquire::Ready {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            ImageAcquire::OutOfDate => {
                let count = driver.rebuild_swapchain()?;
                self.reset_images(count);
                return Ok(FrameOutcome::SwapchainRebuilt);
            }
        };
        // Suboptimal on acquire still delivered a usable image; draw with
        // it and let present report staleness if it matters.

        let image = image_index as usize;
        if image >= self.images_in_flight.len() {
            self.images_in_flight.resize(image + 1, None);
        }

        // The image may still be referenced by an older frame in a
        // different slot. Waiting its fence keeps the acquire semaphore
        // and command buffer for this image from being reused early.
        if let Some(owner) = self.images_in_flight[image] {
            if owner != slot {
                driver.wait_slot_fence(owner)?;
            }
        }
        self.images_in_flight[image] = Some(slot);

        // Only reset once every wait has completed; resetting earlier
        // could deadlock the next wait on this slot.
        driver.reset_slot_fence(slot)?;
        driver.submit(slot, image_index)?;

        match driver.present(slot, image_index)? {
            PresentResult::Presented { suboptimal: false } => {}
            PresentResult::Presented { suboptimal: true } | PresentResult::OutOfDate => {
                let count = driver.rebuild_swapchain()?;
                self.reset_images(count);
                // The submitted work is already in flight; the slot fence
                // stays unsignaled until it finishes. Do not advance, the
                // next frame re-waits this slot.
                return Ok(FrameOutcome::SwapchainRebuilt);
            }
        }

        self.current_slot = (self.current_slot + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(FrameOutcome::Drawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use ash::vk;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        WaitFence(usize),
        Acquire(usize),
        ResetFence(usize),
        Submit { slot: usize, image: u32 },
        Present { slot: usize, image: u32 },
        Rebuild,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Reset,
    }

    /// Driver with an instantly-completing GPU: submit signals the slot
    /// fence immediately. Waiting a reset fence with no pending work would
    /// hang forever on real hardware, so it panics here.
    struct MockDriver {
        events: Vec<Event>,
        fences: [FenceState; MAX_FRAMES_IN_FLIGHT],
        image_count: usize,
        next_image: u32,
        acquire_script: VecDeque<ImageAcquire>,
        present_script: VecDeque<PresentResult>,
        rebuilt_image_count: usize,
        fail_submit: bool,
    }

    impl MockDriver {
        fn new(image_count: usize) -> Self {
            Self {
                events: Vec::new(),
                fences: [FenceState::Signaled; MAX_FRAMES_IN_FLIGHT],
                image_count,
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                rebuilt_image_count: image_count,
                fail_submit: false,
            }
        }
    }

    impl FrameDriver for MockDriver {
        fn wait_slot_fence(&mut self, slot: usize) -> RenderResult<()> {
            self.events.push(Event::WaitFence(slot));
            assert_eq!(
                self.fences[slot],
                FenceState::Signaled,
                "deadlock: waited slot {slot} fence with no submission pending"
            );
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> RenderResult<ImageAcquire> {
            self.events.push(Event::Acquire(slot));
            if let Some(scripted) = self.acquire_script.pop_front() {
                return Ok(scripted);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            Ok(ImageAcquire::Ready {
                image_index,
                suboptimal: false,
            })
        }

        fn reset_slot_fence(&mut self, slot: usize) -> RenderResult<()> {
            self.events.push(Event::ResetFence(slot));
            self.fences[slot] = FenceState::Reset;
            Ok(())
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> RenderResult<()> {
            self.events.push(Event::Submit {
                slot,
                image: image_index,
            });
            if self.fail_submit {
                return Err(RenderError::Draw(vk::Result::ERROR_DEVICE_LOST));
            }
            self.fences[slot] = FenceState::Signaled;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentResult> {
            self.events.push(Event::Present {
                slot,
                image: image_index,
            });
            Ok(self
                .present_script
                .pop_front()
                .unwrap_or(PresentResult::Presented { suboptimal: false }))
        }

        fn rebuild_swapchain(&mut self) -> RenderResult<usize> {
            self.events.push(Event::Rebuild);
            self.image_count = self.rebuilt_image_count;
            self.next_image = 0;
            Ok(self.image_count)
        }
    }

    #[test]
    fn first_frame_runs_full_protocol_on_slot_zero() {
        let mut driver = MockDriver::new(3);
        let mut scheduler = FrameScheduler::new(3);

        let outcome = scheduler.draw_frame(&mut driver).unwrap();

        assert_eq!(outcome, FrameOutcome::Drawn);
        assert_eq!(scheduler.current_slot(), 1);
        assert_eq!(
            driver.events,
            vec![
                Event::WaitFence(0),
                Event::Acquire(0),
                Event::ResetFence(0),
                Event::Submit { slot: 0, image: 0 },
                Event::Present { slot: 0, image: 0 },
            ]
        );
    }

    #[test]
    fn slots_cycle_round_robin() {
        let mut driver = MockDriver::new(4);
        let mut scheduler = FrameScheduler::new(4);

        let mut slots = Vec::new();
        for _ in 0..MAX_FRAMES_IN_FLIGHT + 1 {
            slots.push(scheduler.current_slot());
            assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Drawn);
        }
        assert_eq!(slots, vec![0, 1, 2, 0]);
    }

    #[test]
    fn out_of_date_acquire_rebuilds_without_submitting() {
        let mut driver = MockDriver::new(3);
        driver.acquire_script.push_back(ImageAcquire::OutOfDate);
        driver.rebuilt_image_count = 4;
        let mut scheduler = FrameScheduler::new(3);

        let outcome = scheduler.draw_frame(&mut driver).unwrap();

        assert_eq!(outcome, FrameOutcome::SwapchainRebuilt);
        // Same slot retries next frame
        assert_eq!(scheduler.current_slot(), 0);
        assert_eq!(
            driver.events,
            vec![Event::WaitFence(0), Event::Acquire(0), Event::Rebuild]
        );
        // Ownership map matches the new image count and holds no stale claims
        assert_eq!(scheduler.images_in_flight, vec![None; 4]);
    }

    #[test]
    fn suboptimal_acquire_still_draws() {
        let mut driver = MockDriver::new(3);
        driver.acquire_script.push_back(ImageAcquire::Ready {
            image_index: 1,
            suboptimal: true,
        });
        let mut scheduler = FrameScheduler::new(3);

        assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Drawn);
        assert!(driver
            .events
            .contains(&Event::Submit { slot: 0, image: 1 }));
    }

    #[test]
    fn stale_present_rebuilds_after_submission() {
        let mut driver = MockDriver::new(3);
        driver
            .present_script
            .push_back(PresentResult::OutOfDate);
        let mut scheduler = FrameScheduler::new(3);

        let outcome = scheduler.draw_frame(&mut driver).unwrap();

        assert_eq!(outcome, FrameOutcome::SwapchainRebuilt);
        assert_eq!(scheduler.current_slot(), 0);
        // The frame was fully submitted and presented before the rebuild
        assert_eq!(
            driver.events,
            vec![
                Event::WaitFence(0),
                Event::Acquire(0),
                Event::ResetFence(0),
                Event::Submit { slot: 0, image: 0 },
                Event::Present { slot: 0, image: 0 },
                Event::Rebuild,
            ]
        );
    }

    #[test]
    fn suboptimal_present_rebuilds() {
        let mut driver = MockDriver::new(3);
        driver
            .present_script
            .push_back(PresentResult::Presented { suboptimal: true });
        let mut scheduler = FrameScheduler::new(3);

        assert_eq!(
            scheduler.draw_frame(&mut driver).unwrap(),
            FrameOutcome::SwapchainRebuilt
        );
        assert!(driver.events.contains(&Event::Rebuild));
    }

    #[test]
    fn waits_for_image_owner_before_reuse() {
        // One image, so the second frame reacquires the image the first
        // frame still owns and must wait slot 0's fence before touching it.
        let mut driver = MockDriver::new(1);
        let mut scheduler = FrameScheduler::new(1);

        scheduler.draw_frame(&mut driver).unwrap();
        driver.events.clear();
        scheduler.draw_frame(&mut driver).unwrap();

        assert_eq!(
            driver.events,
            vec![
                Event::WaitFence(1),
                Event::Acquire(1),
                Event::WaitFence(0),
                Event::ResetFence(1),
                Event::Submit { slot: 1, image: 0 },
                Event::Present { slot: 1, image: 0 },
            ]
        );
        assert_eq!(scheduler.images_in_flight[0], Some(1));
    }

    #[test]
    fn sustained_rendering_never_deadlocks() {
        // MockDriver panics on any wait that real hardware would hang on.
        let mut driver = MockDriver::new(2);
        let mut scheduler = FrameScheduler::new(2);

        for _ in 0..100 {
            assert_eq!(scheduler.draw_frame(&mut driver).unwrap(), FrameOutcome::Drawn);
        }
    }

    #[test]
    fn submit_failure_propagates() {
        let mut driver = MockDriver::new(3);
        driver.fail_submit = true;
        let mut scheduler = FrameScheduler::new(3);

        let err = scheduler.draw_frame(&mut driver).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Draw(vk::Result::ERROR_DEVICE_LOST)
        ));
    }
}
