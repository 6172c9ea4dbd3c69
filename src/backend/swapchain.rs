// Swapchain - window presentation
//
// Manages the chain of presentable images, their views, and framebuffers.
// The chain is rebuilt whenever the presentation engine reports it stale
// or the window size changes; rebuilding may reuse the old chain's
// resources by passing it as `old`.
//
// Invariant: image count == view count == framebuffer count (once the
// framebuffers are attached).

use ash::vk;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::{RenderError, RenderResult};

/// Result of an image acquisition attempt.
///
/// Out-of-date is not an error: the caller drops the frame and rebuilds.
/// Suboptimal still acquired an image, so the frame may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAcquire {
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of a present request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Presented { suboptimal: bool },
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: ash::khr::swapchain::Device,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(
        device: Arc<DeviceContext>,
        width: u32,
        height: u32,
        preferred_present_mode: vk::PresentModeKHR,
        old: Option<&Swapchain>,
    ) -> RenderResult<Self> {
        let surface = device.surface()?;

        let surface_caps = unsafe {
            surface.loader.get_physical_device_surface_capabilities(
                device.physical_device,
                surface.surface,
            )
        }?;
        let formats = unsafe {
            surface.loader.get_physical_device_surface_formats(
                device.physical_device,
                surface.surface,
            )
        }?;
        let present_modes = unsafe {
            surface.loader.get_physical_device_surface_present_modes(
                device.physical_device,
                surface.surface,
            )
        }?;

        // Prefer SRGB, fall back to whatever the surface offers first
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .ok_or_else(|| RenderError::Init("no suitable surface format".to_string()))?;

        // FIFO is the only mode Vulkan guarantees
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == preferred_present_mode)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let loader =
            ash::khr::swapchain::Device::new(&device.instance, &device.device);

        let queue_families = [
            device.graphics_queue_family,
            device.present_queue_family,
        ];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(
                old.map(|chain| chain.swapchain)
                    .unwrap_or(vk::SwapchainKHR::null()),
            );

        create_info = if device.graphics_queue_family != device.present_queue_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| RenderError::Init(format!("failed to create swapchain: {e}")))?;

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };
        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            images.len(),
            present_mode
        );

        // Rebuild failures are retried next frame, so a half-built chain
        // must not leak: tear down whatever exists before returning.
        let image_views = create_all_or_destroy(
            images.iter().copied(),
            |image| {
                let create_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    device
                        .device
                        .create_image_view(&create_info, None)
                        .map_err(RenderError::from)
                }
            },
            |&view| unsafe { device.device.destroy_image_view(view, None) },
        );
        let image_views = match image_views {
            Ok(image_views) => image_views,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        Ok(Self {
            swapchain,
            loader,
            images,
            image_views,
            framebuffers: Vec::new(),
            format: surface_format.format,
            extent,
            device,
        })
    }

    /// Create one framebuffer per image view for the given render pass.
    /// Must be called before recording and again after every rebuild.
    pub fn build_framebuffers(&mut self, render_pass: vk::RenderPass) -> RenderResult<()> {
        self.destroy_framebuffers();

        self.framebuffers = create_all_or_destroy(
            self.image_views.iter().copied(),
            |view| {
                let attachments = [view];
                let framebuffer_info = vk::FramebufferCreateInfo::default()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(self.extent.width)
                    .height(self.extent.height)
                    .layers(1);

                unsafe {
                    self.device
                        .device
                        .create_framebuffer(&framebuffer_info, None)
                        .map_err(RenderError::from)
                }
            },
            |&framebuffer| unsafe {
                self.device.device.destroy_framebuffer(framebuffer, None)
            },
        )?;
        debug_assert_eq!(self.images.len(), self.image_views.len());
        debug_assert_eq!(self.images.len(), self.framebuffers.len());
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next presentable image, signaling `semaphore` when it is
    /// ready for rendering.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> RenderResult<ImageAcquire> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(ImageAcquire::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(ImageAcquire::OutOfDate),
            Err(e) => Err(RenderError::Draw(e)),
        }
    }

    /// Present `image_index` on the present queue after `wait_semaphores`.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> RenderResult<PresentResult> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(PresentResult::Presented { suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentResult::OutOfDate),
            Err(e) => Err(RenderError::Draw(e)),
        }
    }

    fn destroy_framebuffers(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // The images themselves belong to the presentation engine
        self.destroy_framebuffers();
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Create one resource per input item. If any creation fails, destroy the
/// resources created so far and return the error, so a mid-batch failure
/// never leaks the partial set.
fn create_all_or_destroy<T, I, C, D>(
    items: I,
    mut create: C,
    mut destroy: D,
) -> RenderResult<Vec<T>>
where
    I: IntoIterator,
    C: FnMut(I::Item) -> RenderResult<T>,
    D: FnMut(&T),
{
    let mut created = Vec::new();
    for item in items {
        match create(item) {
            Ok(value) => created.push(value),
            Err(e) => {
                for value in &created {
                    destroy(value);
                }
                return Err(e);
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_batch_creates_everything_and_destroys_nothing() {
        let mut destroyed = Vec::new();
        let created = create_all_or_destroy(
            0..3,
            |i| Ok::<_, RenderError>(i * 10),
            |&value| destroyed.push(value),
        )
        .unwrap();

        assert_eq!(created, vec![0, 10, 20]);
        assert!(destroyed.is_empty());
    }

    #[test]
    fn failed_batch_destroys_the_partial_set() {
        let mut destroyed = Vec::new();
        let result = create_all_or_destroy(
            0..4,
            |i| {
                if i < 2 {
                    Ok(i * 10)
                } else {
                    Err(RenderError::Init("creation failed".to_string()))
                }
            },
            |&value| destroyed.push(value),
        );

        assert!(matches!(result, Err(RenderError::Init(_))));
        // Exactly the successfully created resources, nothing more
        assert_eq!(destroyed, vec![0, 10]);
    }
}
