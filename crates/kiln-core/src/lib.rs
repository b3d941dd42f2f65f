//! Core types shared across the Kiln engine.
//!
//! This crate provides the foundational types used throughout the engine:
//! - Asset and object handles
//! - Render flags and draw sort keys
//! - Common error types

pub mod error;
pub mod flags;
pub mod handles;
pub mod hash;
pub mod sort;

pub use error::{Error, Result};
pub use flags::RenderFlags;
pub use handles::{MaterialId, ModelId, ObjectId, ProgramId, TextureId};
pub use hash::StableHasher;
pub use sort::SortKey;

/// Engine-wide constants
pub mod constants {
    /// Number of frames the CPU may prepare while the GPU is still working.
    pub const FRAMES_IN_FLIGHT: usize = 2;
    /// Maximum texture bindings per material.
    pub const MATERIAL_TEXTURE_SLOTS: usize = 8;
    /// Capacity of the per-frame object parameter array.
    pub const MAX_OBJECTS: usize = 4096;
    /// Capacity of the per-frame material table.
    pub const MAX_MATERIALS: usize = 256;
    /// Capacity of the per-frame light table.
    pub const MAX_LIGHTS: usize = 64;
    /// Size of the global sampled-texture binding array.
    pub const MAX_BOUND_TEXTURES: usize = 64;
}
