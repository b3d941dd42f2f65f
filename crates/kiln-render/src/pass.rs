//! Draw passes and their fixed state configuration.
//!
//! The set of passes is closed, so each pass is an enum variant and its
//! rasterizer behavior is a table lookup rather than a virtual call. The
//! table maps every pass to its state bits, target, and clear policy; the
//! per-surface part of pipeline state is limited to the stencil-mark flag.

use ash::vk;
use bitflags::bitflags;
use kiln_core::RenderFlags;
use kiln_gpu::RasterDesc;

/// One semantic stage of the fixed frame pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DrawPass {
    /// Depth-only render into the shadow map.
    Shadow = 0,
    /// Depth prepass for the main view.
    Depth = 1,
    /// Terrain surfaces.
    Terrain = 2,
    /// Standard opaque geometry.
    Opaque = 3,
    /// Skybox, drawn where the depth buffer is still at the far plane.
    Skybox = 4,
    /// Alpha-blended geometry.
    Transparent = 5,
    /// Debug wireframe overlay.
    Wireframe = 6,
    /// Fullscreen post-process and 2D overlays into the swapchain.
    Post = 7,
}

impl DrawPass {
    /// Number of passes.
    pub const COUNT: usize = 8;

    /// All passes, in execution order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Shadow,
        Self::Depth,
        Self::Terrain,
        Self::Opaque,
        Self::Skybox,
        Self::Transparent,
        Self::Wireframe,
        Self::Post,
    ];

    /// The pass as a table index.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Baseline state bits for this pass.
    pub const fn state(self) -> PassStateFlags {
        match self {
            Self::Shadow => PassStateFlags::DEPTH_TEST
                .union(PassStateFlags::DEPTH_WRITE)
                .union(PassStateFlags::CULL_FRONT),
            Self::Depth => PassStateFlags::DEPTH_TEST
                .union(PassStateFlags::DEPTH_WRITE)
                .union(PassStateFlags::CULL_BACK),
            Self::Terrain | Self::Opaque => PassStateFlags::DEPTH_TEST
                .union(PassStateFlags::DEPTH_WRITE)
                .union(PassStateFlags::DEPTH_COMPARE_LEQUAL)
                .union(PassStateFlags::CULL_BACK)
                .union(PassStateFlags::COLOR_WRITE),
            Self::Skybox => PassStateFlags::DEPTH_TEST
                .union(PassStateFlags::DEPTH_COMPARE_LEQUAL)
                .union(PassStateFlags::COLOR_WRITE),
            Self::Transparent => PassStateFlags::DEPTH_TEST
                .union(PassStateFlags::DEPTH_COMPARE_LEQUAL)
                .union(PassStateFlags::CULL_BACK)
                .union(PassStateFlags::BLEND)
                .union(PassStateFlags::COLOR_WRITE),
            Self::Wireframe => PassStateFlags::DEPTH_TEST
                .union(PassStateFlags::DEPTH_COMPARE_LEQUAL)
                .union(PassStateFlags::FILL_WIREFRAME)
                .union(PassStateFlags::COLOR_WRITE),
            Self::Post => PassStateFlags::BLEND.union(PassStateFlags::COLOR_WRITE),
        }
    }

    /// Render target this pass draws into.
    pub const fn target(self) -> PassTarget {
        match self {
            Self::Shadow => PassTarget::ShadowMap,
            Self::Post => PassTarget::Swapchain,
            _ => PassTarget::MainColor,
        }
    }
}

/// Render target class of a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassTarget {
    /// Depth-only shadow map.
    ShadowMap,
    /// Main color + depth-stencil targets.
    MainColor,
    /// Swapchain image.
    Swapchain,
}

bitflags! {
    /// Fixed-function state bits, packed for pipeline cache keys.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PassStateFlags: u32 {
        const DEPTH_TEST = 1 << 0;
        const DEPTH_WRITE = 1 << 1;
        /// Use `LESS_OR_EQUAL` depth compare instead of `LESS`.
        const DEPTH_COMPARE_LEQUAL = 1 << 2;
        const CULL_BACK = 1 << 3;
        const CULL_FRONT = 1 << 4;
        const FILL_WIREFRAME = 1 << 5;
        const BLEND = 1 << 6;
        const STENCIL_TEST = 1 << 7;
        const COLOR_WRITE = 1 << 8;
    }
}

/// Effective state bits for one surface in one pass.
///
/// The pass table is fixed; the only per-surface contribution is the
/// stencil mark, which enables the stencil write in color passes.
pub fn surface_pass_state(pass: DrawPass, flags: RenderFlags) -> PassStateFlags {
    let mut state = pass.state();
    if flags.contains(RenderFlags::STENCIL_MARK) && pass.target() == PassTarget::MainColor {
        state |= PassStateFlags::STENCIL_TEST;
    }
    state
}

impl PassStateFlags {
    /// Expand the bits into a full rasterizer description.
    pub fn to_raster_desc(self) -> RasterDesc {
        let cull_mode = if self.contains(Self::CULL_BACK) {
            vk::CullModeFlags::BACK
        } else if self.contains(Self::CULL_FRONT) {
            vk::CullModeFlags::FRONT
        } else {
            vk::CullModeFlags::NONE
        };

        let polygon_mode = if self.contains(Self::FILL_WIREFRAME) {
            vk::PolygonMode::LINE
        } else {
            vk::PolygonMode::FILL
        };

        let depth_compare = if self.contains(Self::DEPTH_COMPARE_LEQUAL) {
            vk::CompareOp::LESS_OR_EQUAL
        } else {
            vk::CompareOp::LESS
        };

        RasterDesc {
            polygon_mode,
            cull_mode,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: self.contains(Self::DEPTH_TEST),
            depth_write: self.contains(Self::DEPTH_WRITE),
            depth_compare,
            blend: self.contains(Self::BLEND),
            stencil_test: self.contains(Self::STENCIL_TEST),
            color_write: self.contains(Self::COLOR_WRITE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_order_is_fixed() {
        for (i, pass) in DrawPass::ALL.iter().enumerate() {
            assert_eq!(pass.index(), i);
        }
        assert_eq!(DrawPass::ALL[0], DrawPass::Shadow);
        assert_eq!(DrawPass::ALL[DrawPass::COUNT - 1], DrawPass::Post);
    }

    #[test]
    fn shadow_pass_writes_no_color() {
        let state = DrawPass::Shadow.state();
        assert!(state.contains(PassStateFlags::DEPTH_WRITE));
        assert!(!state.contains(PassStateFlags::COLOR_WRITE));
        assert!(!state.contains(PassStateFlags::BLEND));
        assert_eq!(DrawPass::Shadow.target(), PassTarget::ShadowMap);
    }

    #[test]
    fn transparent_pass_blends_without_depth_write() {
        let state = DrawPass::Transparent.state();
        assert!(state.contains(PassStateFlags::BLEND));
        assert!(state.contains(PassStateFlags::DEPTH_TEST));
        assert!(!state.contains(PassStateFlags::DEPTH_WRITE));
    }

    #[test]
    fn post_pass_only_blends() {
        let state = DrawPass::Post.state();
        assert_eq!(
            state,
            PassStateFlags::BLEND | PassStateFlags::COLOR_WRITE
        );
        assert_eq!(DrawPass::Post.target(), PassTarget::Swapchain);
    }

    #[test]
    fn stencil_mark_only_affects_main_target() {
        let flags = RenderFlags::STENCIL_MARK;
        assert!(
            surface_pass_state(DrawPass::Opaque, flags)
                .contains(PassStateFlags::STENCIL_TEST)
        );
        assert!(
            !surface_pass_state(DrawPass::Shadow, flags)
                .contains(PassStateFlags::STENCIL_TEST)
        );
        assert!(
            !surface_pass_state(DrawPass::Post, flags)
                .contains(PassStateFlags::STENCIL_TEST)
        );
    }

    #[test]
    fn raster_desc_expansion() {
        let desc = DrawPass::Wireframe.state().to_raster_desc();
        assert_eq!(desc.polygon_mode, vk::PolygonMode::LINE);
        assert_eq!(desc.cull_mode, vk::CullModeFlags::NONE);
        assert!(!desc.depth_write);

        let shadow = DrawPass::Shadow.state().to_raster_desc();
        assert_eq!(shadow.cull_mode, vk::CullModeFlags::FRONT);
        assert_eq!(shadow.depth_compare, vk::CompareOp::LESS);
        assert!(!shadow.color_write);
    }
}
