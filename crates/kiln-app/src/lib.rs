//! Application framework for the Kiln engine.
//!
//! Owns the window boundary: winit event loop, GPU context creation, and
//! forwarding of resize/redraw events into the renderer. Applications
//! implement [`KilnApp`] and hand the runner their scene each frame.

mod app;
mod runner;

pub use app::{AppContext, KilnApp};
pub use runner::{run_app, AppConfig};

// Re-export commonly used types for convenience
pub use kiln_gpu::{GpuContext, GpuContextBuilder};
pub use kiln_render::{Camera, Renderer, RendererConfig, Scene};
pub use winit::event::WindowEvent;
