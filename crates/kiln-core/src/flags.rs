//! Per-entity render flags.

use bitflags::bitflags;

bitflags! {
    /// Flags controlling how an entity's surfaces are drawn.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RenderFlags: u32 {
        /// Skip the entity entirely.
        const HIDDEN = 1 << 0;
        /// Exclude from the shadow view.
        const NO_SHADOW = 1 << 1;
        /// Draw in the wireframe pass instead of the opaque pass.
        const WIREFRAME = 1 << 2;
        /// Debug visualization: force flat shading.
        const DEBUG_SOLID = 1 << 3;
        /// Mark the surface in the stencil buffer for post effects.
        const STENCIL_MARK = 1 << 4;
    }
}

impl RenderFlags {
    /// Returns true if the entity should not be committed to any view.
    #[inline]
    pub const fn is_hidden(self) -> bool {
        self.contains(Self::HIDDEN)
    }

    /// Returns true if the entity participates in the shadow view.
    #[inline]
    pub const fn casts_shadow(self) -> bool {
        !self.contains(Self::NO_SHADOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_draws_everywhere() {
        let flags = RenderFlags::default();
        assert!(!flags.is_hidden());
        assert!(flags.casts_shadow());
    }

    #[test]
    fn no_shadow_excludes_shadow_view_only() {
        let flags = RenderFlags::NO_SHADOW;
        assert!(!flags.is_hidden());
        assert!(!flags.casts_shadow());
    }
}
