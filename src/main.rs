// Vulkan renderer entry point
//
// The winit application owns the window, the renderer, and the frame
// scheduler. Each redraw runs one iteration of the frame protocol; the
// scheduler reports whether a frame was drawn or the swapchain had to
// be rebuilt.

mod backend;
mod config;
mod error;
mod frame;
mod renderer;

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

use backend::Vertex;
use config::Config;
use frame::{FrameOutcome, FrameScheduler};
use renderer::Renderer;

const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { position: [-0.5, -0.5], color: [1.0, 0.0, 0.0] },
    Vertex { position: [0.5, -0.5], color: [0.0, 1.0, 0.0] },
    Vertex { position: [0.5, 0.5], color: [0.0, 0.0, 1.0] },
    Vertex { position: [-0.5, 0.5], color: [1.0, 1.0, 1.0] },
];
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load();
    log::info!("Starting Vulkan renderer");
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    scheduler: FrameScheduler,

    /// Window size changed since the last frame; rebuild before drawing
    needs_resize: bool,
    /// Zero-sized window; skip rendering entirely until it comes back
    is_minimized: bool,

    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            renderer: None,
            scheduler: FrameScheduler::new(0),
            needs_resize: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    /// Run one frame. Returns `false` when a fatal draw error means the
    /// event loop must stop.
    fn render_frame(&mut self) -> bool {
        if self.is_minimized {
            return true;
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return true;
        };

        if self.needs_resize {
            match renderer.rebuild() {
                Ok(image_count) => {
                    self.scheduler.reset_images(image_count);
                    self.needs_resize = false;
                }
                Err(e) => {
                    // Retried on the next redraw
                    log::error!("Swapchain rebuild failed: {e}");
                    return true;
                }
            }
        }

        match self.scheduler.draw_frame(renderer) {
            Ok(FrameOutcome::Drawn) => {
                self.update_fps();
                true
            }
            Ok(FrameOutcome::SwapchainRebuilt) => {
                log::debug!("Swapchain rebuilt, frame skipped");
                true
            }
            Err(e) => {
                log::error!("Render error: {e}");
                if e.halts_frame_loop() {
                    let _ = renderer.device().wait_idle();
                    return false;
                }
                true
            }
        }
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                log::error!("Failed to create window: {e}");
                event_loop.exit();
                return;
            }
        };

        let mut renderer = match Renderer::new(&window, &self.config) {
            Ok(renderer) => renderer,
            Err(e) => {
                log::error!("Failed to initialize renderer: {e}");
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = renderer.upload_geometry(&QUAD_VERTICES, &QUAD_INDICES) {
            log::error!("Failed to upload geometry: {e}");
            event_loop.exit();
            return;
        }

        self.scheduler = FrameScheduler::new(renderer.image_count());
        self.renderer = Some(renderer);
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down");
                if let Some(ref renderer) = self.renderer {
                    let _ = renderer.device().wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.set_target_extent(size.width, size.height);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if !self.render_frame() {
                    log::error!("Unrecoverable draw error, exiting");
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};
                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws; the present mode paces the loop.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
