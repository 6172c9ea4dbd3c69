// Renderer - owns every Vulkan object and drives recording
//
// Created once per window. The frame scheduler calls back into this
// through the FrameDriver impl; everything else here is setup, geometry
// upload, command recording, and swapchain rebuild.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::buffer::upload_to_device_local;
use crate::backend::{
    pipeline, shader, BufferAllocator, BufferKind, DeviceContext, FrameSync, GpuBuffer,
    ImageAcquire, PresentResult, Swapchain, Vertex,
};
use crate::config::Config;
use crate::error::{RenderError, RenderResult};
use crate::frame::{FrameDriver, MAX_FRAMES_IN_FLIGHT};

const VERT_SHADER_PATH: &str = "shaders/triangle.vert.spv";
const FRAG_SHADER_PATH: &str = "shaders/triangle.frag.spv";

pub struct Renderer {
    swapchain: Swapchain,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,

    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    frame_syncs: Vec<FrameSync>,

    vertex_buffer: Option<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,
    index_count: u32,

    // Desired extent from the latest window resize, used at rebuild time
    target_extent: (u32, u32),
    clear_color: [f32; 4],
    preferred_present_mode: vk::PresentModeKHR,

    allocator: Arc<BufferAllocator>,
    device: Arc<DeviceContext>,
}

impl Renderer {
    pub fn new(window: &Window, config: &Config) -> RenderResult<Self> {
        let display_handle = window
            .display_handle()
            .map_err(|e| RenderError::Init(format!("no display handle: {e}")))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RenderError::Init(format!("no window handle: {e}")))?
            .as_raw();

        let device = DeviceContext::new(
            &config.window.title,
            display_handle,
            window_handle,
            config.debug.validation_layers,
        )?;
        let allocator = BufferAllocator::new(device.clone())?;

        let size = window.inner_size();
        let preferred_present_mode = config.preferred_present_mode();
        let mut swapchain = Swapchain::new(
            device.clone(),
            size.width,
            size.height,
            preferred_present_mode,
            None,
        )?;

        let render_pass = pipeline::create_render_pass(&device, swapchain.format)?;
        swapchain.build_framebuffers(render_pass)?;

        let vert_shader = shader::load_shader_module(&device, VERT_SHADER_PATH)?;
        let frag_shader = shader::load_shader_module(&device, FRAG_SHADER_PATH)?;
        let pipeline_result =
            pipeline::create_graphics_pipeline(&device, render_pass, vert_shader, frag_shader);
        // Modules are compiled into the pipeline; drop them either way
        unsafe {
            device.device.destroy_shader_module(vert_shader, None);
            device.device.destroy_shader_module(frag_shader, None);
        }
        let (graphics_pipeline, pipeline_layout) = pipeline_result?;

        let command_pool = Self::create_command_pool(&device)?;
        let command_buffers =
            Self::allocate_command_buffers(&device, command_pool, swapchain.image_count())?;

        let frame_syncs = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(&device))
            .collect::<RenderResult<Vec<_>>>()?;

        log::info!(
            "Renderer ready: {} swapchain images, {} frames in flight",
            swapchain.image_count(),
            MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            swapchain,
            render_pass,
            pipeline_layout,
            pipeline: graphics_pipeline,
            command_pool,
            command_buffers,
            frame_syncs,
            vertex_buffer: None,
            index_buffer: None,
            index_count: 0,
            target_extent: (size.width, size.height),
            clear_color: config.graphics.clear_color,
            preferred_present_mode,
            allocator,
            device,
        })
    }

    fn create_command_pool(device: &Arc<DeviceContext>) -> RenderResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family);
        unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .map_err(RenderError::from)
        }
    }

    /// Destroy the pool (releasing every buffer allocated from it) and
    /// build a fresh one with `count` primary command buffers.
    ///
    /// On failure the pool handle is left null, which `Drop` tolerates.
    fn recreate_command_buffers(
        device: &Arc<DeviceContext>,
        pool: &mut vk::CommandPool,
        count: usize,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        unsafe {
            device.device.destroy_command_pool(*pool, None);
        }
        *pool = vk::CommandPool::null();
        *pool = Self::create_command_pool(device)?;
        Self::allocate_command_buffers(device, *pool, count)
    }

    fn allocate_command_buffers(
        device: &Arc<DeviceContext>,
        pool: vk::CommandPool,
        count: usize,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        unsafe {
            device
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(RenderError::from)
        }
    }

    /// Upload indexed geometry to device-local memory and record the
    /// command buffers that draw it.
    pub fn upload_geometry(&mut self, vertices: &[Vertex], indices: &[u16]) -> RenderResult<()> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(RenderError::BufferMisuse(
                "geometry upload needs at least one vertex and one index".to_string(),
            ));
        }

        self.vertex_buffer = Some(upload_to_device_local(
            &self.allocator,
            &self.device,
            self.command_pool,
            BufferKind::Vertex,
            bytemuck::cast_slice(vertices),
            vertices.len() as u32,
        )?);
        self.index_buffer = Some(upload_to_device_local(
            &self.allocator,
            &self.device,
            self.command_pool,
            BufferKind::Index,
            bytemuck::cast_slice(indices),
            indices.len() as u32,
        )?);
        self.index_count = indices.len() as u32;

        self.record_commands()
    }

    /// Record one command buffer per swapchain image. Without geometry the
    /// buffers just clear and present.
    pub fn record_commands(&mut self) -> RenderResult<()> {
        let extent = self.swapchain.extent;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];

        for (&command_buffer, &framebuffer) in self
            .command_buffers
            .iter()
            .zip(self.swapchain.framebuffers.iter())
        {
            let begin_info = vk::CommandBufferBeginInfo::default();
            let render_pass_info = vk::RenderPassBeginInfo::default()
                .render_pass(self.render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };

            unsafe {
                let dev = &self.device.device;
                dev.begin_command_buffer(command_buffer, &begin_info)?;
                dev.cmd_begin_render_pass(
                    command_buffer,
                    &render_pass_info,
                    vk::SubpassContents::INLINE,
                );

                if let (Some(vertex_buffer), Some(index_buffer)) =
                    (&self.vertex_buffer, &self.index_buffer)
                {
                    dev.cmd_bind_pipeline(
                        command_buffer,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipeline,
                    );
                    dev.cmd_set_viewport(command_buffer, 0, &[viewport]);
                    dev.cmd_set_scissor(command_buffer, 0, &[scissor]);
                    dev.cmd_bind_vertex_buffers(
                        command_buffer,
                        0,
                        &[vertex_buffer.handle()],
                        &[0],
                    );
                    dev.cmd_bind_index_buffer(
                        command_buffer,
                        index_buffer.handle(),
                        0,
                        vk::IndexType::UINT16,
                    );
                    dev.cmd_draw_indexed(command_buffer, self.index_count, 1, 0, 0, 0);
                }

                dev.cmd_end_render_pass(command_buffer);
                dev.end_command_buffer(command_buffer)?;
            }
        }

        Ok(())
    }

    /// Note the window's new size for the next swapchain rebuild.
    pub fn set_target_extent(&mut self, width: u32, height: u32) {
        self.target_extent = (width, height);
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// Recreate the swapchain at the target extent, then the framebuffers
    /// and command buffers that depend on it. Returns the new image count.
    pub fn rebuild(&mut self) -> RenderResult<usize> {
        self.device.wait_idle()?;

        let (width, height) = self.target_extent;
        log::info!("Rebuilding swapchain at {}x{}", width, height);

        let new_chain = Swapchain::new(
            self.device.clone(),
            width,
            height,
            self.preferred_present_mode,
            Some(&self.swapchain),
        )?;
        // The old chain is retired only after the new one exists, so the
        // driver can recycle its images.
        self.swapchain = new_chain;
        self.swapchain.build_framebuffers(self.render_pass)?;

        self.command_buffers = Self::recreate_command_buffers(
            &self.device,
            &mut self.command_pool,
            self.swapchain.image_count(),
        )?;
        self.record_commands()?;

        Ok(self.swapchain.image_count())
    }
}

impl FrameDriver for Renderer {
    fn wait_slot_fence(&mut self, slot: usize) -> RenderResult<()> {
        let fence = self.frame_syncs[slot].in_flight_fence;
        unsafe {
            self.device
                .device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(RenderError::Draw)
        }
    }

    fn acquire_image(&mut self, slot: usize) -> RenderResult<ImageAcquire> {
        self.swapchain
            .acquire_next_image(self.frame_syncs[slot].image_available)
    }

    fn reset_slot_fence(&mut self, slot: usize) -> RenderResult<()> {
        let fence = self.frame_syncs[slot].in_flight_fence;
        unsafe {
            self.device
                .device
                .reset_fences(&[fence])
                .map_err(RenderError::Draw)
        }
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> RenderResult<()> {
        let sync = &self.frame_syncs[slot];
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffers[image_index as usize]];
        let signal_semaphores = [sync.render_finished];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info],
                    sync.in_flight_fence,
                )
                .map_err(RenderError::Draw)
        }
    }

    fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentResult> {
        let wait_semaphores = [self.frame_syncs[slot].render_finished];
        self.swapchain
            .present(self.device.present_queue, image_index, &wait_semaphores)
    }

    fn rebuild_swapchain(&mut self) -> RenderResult<usize> {
        self.rebuild()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();

        unsafe {
            for sync in &self.frame_syncs {
                sync.destroy(&self.device.device);
            }
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .device
                .destroy_render_pass(self.render_pass, None);
        }
        // Swapchain, buffers, allocator, and device drop in field order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_replaces_the_command_pool() {
        let Some(device) = DeviceContext::headless_for_tests() else {
            eprintln!("no Vulkan device available, skipping");
            return;
        };

        let mut pool = Renderer::create_command_pool(&device).unwrap();
        let first = Renderer::allocate_command_buffers(&device, pool, 3).unwrap();
        assert_eq!(first.len(), 3);

        let second = Renderer::recreate_command_buffers(&device, &mut pool, 4).unwrap();
        assert_eq!(second.len(), 4);
        assert_ne!(pool, vk::CommandPool::null());

        // A second recreation at a different image count also succeeds
        let third = Renderer::recreate_command_buffers(&device, &mut pool, 2).unwrap();
        assert_eq!(third.len(), 2);

        unsafe { device.device.destroy_command_pool(pool, None) };
    }
}
