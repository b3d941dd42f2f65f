//! Render views, draw-pass scheduling, and the frame renderer.
//!
//! This crate holds the engine's frame core:
//! - Draw surface submission, merge/instancing, and offset compaction
//! - The fixed draw-pass table and lazily-populated pipeline cache
//! - Multi-buffered frame state and the top-level frame scheduler

pub mod camera;
pub mod draw;
pub mod frame;
pub mod pass;
pub mod pipeline_cache;
pub mod renderer;
pub mod scene;
pub mod upload;
pub mod view;

pub use camera::{sun_shadow_matrices, Camera};
pub use draw::{DrawSurface, DrawSurfaceInstance, MergedDrawSurface};
pub use frame::{FrameRing, FrameState, GlobalUniforms, PushConstants};
pub use pass::{surface_pass_state, DrawPass, PassStateFlags, PassTarget};
pub use pipeline_cache::{PipelineCache, PipelineKey, TargetFormats};
pub use renderer::{Renderer, RendererConfig, SwapchainHealth};
pub use scene::{
    AssetStore, Entity, Light, MaterialDesc, Model, ModelSurface, ProgramDesc, Scene,
    ShaderLibrary, Sun, TextureFace, TexturePixels, Vertex,
};
pub use upload::{GeometryBuffers, UploadQueue};
pub use view::{RenderView, ViewKind, VIEW_COUNT};
