// =============================================================================
// FRAME PIPELINE DEMO - winit window driving the Vulkan frame protocol
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input, redraw requests)              │
// │    └── Renderer<VulkanGpu> (frame slots, cursor, surface)       │
// │          └── FrameParticipant: texture churn demo               │
// │                └── staging uploads + deferred destruction       │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (see renderer.rs):
// acquire ─> wait(previous) ─> reclaim ─> record ─> submit transfer
//         ─> submit render ─> present ─> advance cursor
//
// =============================================================================

use anyhow::{Context, Result};
use frame_pipeline::backend::vulkan::{VulkanGpu, VulkanSettings};
use frame_pipeline::config::Config;
use frame_pipeline::{FrameParticipant, Renderer, SamplerConfig, Texture, TextureDesc, TextureFormat};
use glam::UVec2;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

/// Frames between two texture replacements of the demo participant
const TEXTURE_LIFETIME: u64 = 240;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting frame pipeline demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, {} frames in flight",
        config.graphics.present_mode,
        config.graphics.frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    // RUST_LOG still wins over the default level
    builder.parse_default_env();
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Frame Pipeline Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// DEMO PARTICIPANT
// =============================================================================

/// Keeps one mip-mapped checkerboard alive and replaces it periodically,
/// so uploads and deferred destruction run while frames are in flight.
struct TextureChurn {
    texture: Option<Texture<VulkanGpu>>,
    generation: u32,
    uploaded_at: u64,
}

impl TextureChurn {
    fn new() -> Self {
        Self {
            texture: None,
            generation: 0,
            uploaded_at: 0,
        }
    }

    fn checkerboard(size: u32, generation: u32) -> Vec<u8> {
        let (a, b): ([u8; 4], [u8; 4]) = if generation % 2 == 0 {
            ([230, 230, 230, 255], [40, 40, 40, 255])
        } else {
            ([220, 80, 60, 255], [30, 30, 90, 255])
        };
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let color = if ((x / 32) + (y / 32)) % 2 == 0 { a } else { b };
                pixels.extend_from_slice(&color);
            }
        }
        pixels
    }

    fn replace(&mut self, renderer: &mut Renderer<VulkanGpu>) -> Result<()> {
        let desc = TextureDesc::new(256, 256, TextureFormat::Rgba8Srgb).with_full_mip_chain();
        let pixels = Self::checkerboard(desc.width, self.generation);
        let texture = renderer.upload_texture(&desc, &pixels, &SamplerConfig::default())?;

        if let Some(old) = self.texture.replace(texture) {
            renderer.schedule_destruction(old);
        }
        self.generation += 1;
        self.uploaded_at = renderer.absolute_frame_count();
        log::debug!("Uploaded checkerboard generation {}", self.generation);
        Ok(())
    }

    fn retire(&mut self, renderer: &mut Renderer<VulkanGpu>) {
        if let Some(texture) = self.texture.take() {
            renderer.schedule_destruction(texture);
        }
    }
}

impl FrameParticipant<VulkanGpu> for TextureChurn {
    fn update(&mut self, renderer: &mut Renderer<VulkanGpu>) -> Result<()> {
        if renderer.absolute_frame_count() - self.uploaded_at >= TEXTURE_LIFETIME {
            self.replace(renderer)?;
        }
        Ok(())
    }

    fn render(&mut self, _renderer: &Renderer<VulkanGpu>, _commands: ash::vk::CommandBuffer) -> Result<()> {
        // Clear-only pass: pipelines are built outside this crate
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The renderer holds the surface
/// of the window and must go first.
struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING
    // ─────────────────────────────────────────────────────────────────────────
    renderer: Option<Renderer<VulkanGpu>>,
    demo: TextureChurn,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    config: Config,
    is_fullscreen: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            renderer: None,
            demo: TextureChurn::new(),
            window: None,
            config,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing renderer...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Create the Vulkan backend for this window
        // ─────────────────────────────────────────────────────────────────────
        let settings = VulkanSettings {
            app_name: self.config.window.title.clone(),
            enable_validation: cfg!(debug_assertions) && self.config.debug.validation_layers,
            msaa_samples: self.config.graphics.msaa_samples,
            clear_color: self.config.graphics.clear_color,
        };
        let gpu = VulkanGpu::new(&settings, window).context("Failed to create Vulkan backend")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Frame slots and the first surface set
        // ─────────────────────────────────────────────────────────────────────
        let mut frame_settings = self.config.frame_settings();
        let size = window.inner_size();
        frame_settings.window_extent = UVec2::new(size.width, size.height);
        let mut renderer = Renderer::new(gpu, frame_settings)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Startup uploads, flushed before the first frame
        // ─────────────────────────────────────────────────────────────────────
        self.demo.replace(&mut renderer)?;
        renderer.first_transfer()?;

        self.renderer = Some(renderer);
        log::info!("Renderer initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            self.demo.retire(&mut renderer);
            if let Err(e) = renderer.shutdown() {
                log::error!("Renderer shutdown failed: {:#}", e);
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize renderer: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.notify_resized(UVec2::new(size.width, size.height));
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => {
                let Some(ref mut renderer) = self.renderer else {
                    return;
                };
                match renderer.render_frame(&mut [&mut self.demo]) {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {}
                    Err(e) => {
                        // The demo has no recoverable participants, so any error ends it
                        log::error!("Render error: {:#}", e);
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
