//! Application runner and event loop.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use kiln_gpu::{GpuContextBuilder, SurfaceContext};
use kiln_render::{AssetStore, Renderer, RendererConfig};

use crate::app::{AppContext, KilnApp};

/// Application configuration.
#[derive(Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Renderer configuration beyond the window-derived fields.
    pub renderer: RendererConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Kiln Engine".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            validation: cfg!(debug_assertions),
            renderer: RendererConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }
}

/// Run a KilnApp with the given configuration.
///
/// Initializes logging, creates the window, GPU context, and renderer,
/// then runs the event loop until the application exits.
pub fn run_app<A: KilnApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new().expect("Failed to create event loop");
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
    };

    if let Err(e) = event_loop.run_app(&mut runner) {
        error!("Event loop error: {e}");
    }

    Ok(())
}

/// Internal application runner implementing winit's ApplicationHandler.
struct AppRunner<A: KilnApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
}

/// Internal application state.
struct AppState<A: KilnApp> {
    ctx: AppContext,
    app: A,
    assets: AssetStore,
    last_frame_time: Instant,
}

impl<A: KilnApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => {
                error!("Failed to initialize application: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let mut failed = false;
                if let Some(state) = &mut self.state {
                    if state.app.should_exit() {
                        event_loop.exit();
                        return;
                    }
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e}");
                        failed = true;
                    } else {
                        state.ctx.window.request_redraw();
                    }
                }
                // A render error here means device loss or an equally
                // unrecoverable state.
                if failed {
                    if let Some(mut state) = self.state.take() {
                        state.cleanup();
                    }
                    event_loop.exit();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.handle_resize(size.width, size.height);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: KilnApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build()?;

        let mut assets = AssetStore::new();
        let programs = A::load_assets(&mut assets)?;

        // SAFETY: The window outlives the surface; both live in AppContext.
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let renderer_config = RendererConfig {
            width: size.width.max(1),
            height: size.height.max(1),
            vsync: self.config.vsync,
            ..self.config.renderer.clone()
        };
        let renderer = Renderer::new(&gpu, surface, &programs, renderer_config)?;

        let mut ctx = AppContext {
            window,
            gpu,
            renderer,
        };
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            ctx,
            app,
            assets,
            last_frame_time: Instant::now(),
        })
    }
}

impl<A: KilnApp> AppState<A> {
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        self.app.update(&self.ctx, dt);

        self.ctx.renderer.render_frame(
            &self.ctx.gpu,
            &self.assets,
            self.app.scene(),
            self.app.camera(),
            dt,
        )?;
        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.ctx.renderer.request_resize(width, height);
        self.app.on_resize(width, height);
        info!("Resize requested: {width}x{height}");
    }

    fn cleanup(&mut self) {
        info!("Starting cleanup...");
        self.ctx.renderer.destroy(&self.ctx.gpu);
        info!("Cleanup complete");
    }
}
