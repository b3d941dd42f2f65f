//! `KilnApp` trait definition.

use std::sync::Arc;

use kiln_gpu::GpuContext;
use kiln_render::{AssetStore, Camera, ProgramDesc, Renderer, Scene};
use winit::event::WindowEvent;
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// GPU context with device and queue.
    pub gpu: GpuContext,
    /// The frame renderer.
    pub renderer: Renderer,
}

impl AppContext {
    /// Current render aspect ratio.
    pub fn aspect_ratio(&self) -> f32 {
        self.renderer.aspect_ratio()
    }
}

/// Trait for Kiln applications.
///
/// The framework handles window creation, GPU initialization, renderer
/// setup, and the event loop; the app supplies assets once and a scene
/// snapshot every frame.
pub trait KilnApp: Sized {
    /// Register asset data (models, materials, textures).
    ///
    /// Called once before the renderer is created.
    fn load_assets(assets: &mut AssetStore) -> anyhow::Result<Vec<ProgramDesc>>;

    /// Initialize the application after GPU and renderer setup.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// The scene snapshot for this frame.
    fn scene(&self) -> &Scene;

    /// The camera for this frame.
    fn camera(&self) -> &Camera;

    /// Handle window resize.
    ///
    /// The framework already queued a swapchain rebuild; override to
    /// adjust app state such as the camera aspect ratio.
    #[allow(unused_variables)]
    fn on_resize(&mut self, width: u32, height: u32) {}

    /// Handle window events.
    ///
    /// Return `true` if the event was consumed.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Whether the application wants to exit.
    fn should_exit(&self) -> bool {
        false
    }
}
