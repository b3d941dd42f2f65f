//! Draw surfaces: the per-frame unit of submitted geometry.

use ash::vk;
use glam::Mat4;
use kiln_core::{MaterialId, ObjectId, RenderFlags, SortKey, StableHasher};

use crate::pass::DrawPass;

/// Version tag for the surface content hash stream.
const CONTENT_HASH_VERSION: u8 = 1;

/// Flags that change what a surface *is* for merging purposes. The rest
/// (e.g. `HIDDEN`) never reach a committed surface.
const HASHED_FLAGS: RenderFlags = RenderFlags::WIREFRAME
    .union(RenderFlags::DEBUG_SOLID)
    .union(RenderFlags::STENCIL_MARK);

/// One submitted piece of geometry plus material for one frame.
///
/// Created fresh every frame during commit; never persists across frames.
#[derive(Clone, Debug)]
pub struct DrawSurface {
    /// Range into the shared index buffer.
    pub first_index: u32,
    pub index_count: u32,
    /// Added to indices when fetching vertices.
    pub vertex_offset: i32,
    pub material: MaterialId,
    pub flags: RenderFlags,
    /// Resolved pipeline per pass; `vk::Pipeline::null()` means the
    /// surface does not participate in that pass.
    pub pipelines: [vk::Pipeline; DrawPass::COUNT],
    pub sort_key: SortKey,
    pub content_hash: u64,
}

impl DrawSurface {
    /// Build a surface for one (geometry range, material) pair.
    ///
    /// `object` is the submitting entity's id and only breaks sort ties;
    /// it is deliberately not part of the content hash so identical
    /// surfaces from different entities merge.
    pub fn new(
        first_index: u32,
        index_count: u32,
        vertex_offset: i32,
        material: MaterialId,
        flags: RenderFlags,
        object: ObjectId,
    ) -> Self {
        let content_hash =
            content_hash(first_index, index_count, vertex_offset, material, flags);
        Self {
            first_index,
            index_count,
            vertex_offset,
            material,
            flags,
            pipelines: [vk::Pipeline::null(); DrawPass::COUNT],
            sort_key: SortKey::pack(material, object),
            content_hash,
        }
    }

    /// Pipeline for a pass, or null if the surface skips it.
    #[inline]
    pub fn pipeline(&self, pass: DrawPass) -> vk::Pipeline {
        self.pipelines[pass.index()]
    }
}

/// Content hash identifying mergeable surfaces.
///
/// Two surfaces merge into one instanced draw exactly when this hash
/// matches: same geometry range, same material, same state-relevant flags.
pub fn content_hash(
    first_index: u32,
    index_count: u32,
    vertex_offset: i32,
    material: MaterialId,
    flags: RenderFlags,
) -> u64 {
    let mut hasher = StableHasher::new(CONTENT_HASH_VERSION);
    hasher.write_u32(first_index);
    hasher.write_u32(index_count);
    hasher.write_i32(vertex_offset);
    hasher.write_u32(material.0);
    hasher.write_u32(flags.intersection(HASHED_FLAGS).bits());
    hasher.finish()
}

/// One submitted entity-surface pair, mapping onto a merged surface.
#[derive(Clone, Copy, Debug)]
pub struct DrawSurfaceInstance {
    /// Model matrix of the submitting entity.
    pub transform: Mat4,
    /// Index of the merged surface this instance belongs to.
    /// Valid after the view's merge step.
    pub merged: u32,
    /// Position of this instance within its merged group.
    pub instance: u32,
}

/// The deduplicated representative of one or more identical surfaces.
#[derive(Clone, Copy, Debug)]
pub struct MergedDrawSurface {
    /// Index of the representative surface in the view's surface list.
    pub surface: u32,
    /// Number of instances collapsed into this entry.
    pub instance_count: u32,
    /// Base offset into the per-frame object parameter array.
    /// Assigned by the view's compaction step.
    pub object_offset: u32,
    pub content_hash: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_surfaces_hash_equal() {
        let a = DrawSurface::new(0, 36, 0, MaterialId(1), RenderFlags::empty(), ObjectId(0));
        let b = DrawSurface::new(0, 36, 0, MaterialId(1), RenderFlags::empty(), ObjectId(9));
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.sort_key, b.sort_key);
    }

    #[test]
    fn geometry_and_material_change_hash() {
        let base = DrawSurface::new(0, 36, 0, MaterialId(1), RenderFlags::empty(), ObjectId(0));
        let other_range =
            DrawSurface::new(36, 36, 0, MaterialId(1), RenderFlags::empty(), ObjectId(0));
        let other_material =
            DrawSurface::new(0, 36, 0, MaterialId(2), RenderFlags::empty(), ObjectId(0));
        assert_ne!(base.content_hash, other_range.content_hash);
        assert_ne!(base.content_hash, other_material.content_hash);
    }

    #[test]
    fn stencil_mark_prevents_merge() {
        let plain = DrawSurface::new(0, 36, 0, MaterialId(1), RenderFlags::empty(), ObjectId(0));
        let marked = DrawSurface::new(
            0,
            36,
            0,
            MaterialId(1),
            RenderFlags::STENCIL_MARK,
            ObjectId(0),
        );
        assert_ne!(plain.content_hash, marked.content_hash);
    }

    #[test]
    fn no_shadow_does_not_affect_hash() {
        let plain = DrawSurface::new(0, 36, 0, MaterialId(1), RenderFlags::empty(), ObjectId(0));
        let no_shadow = DrawSurface::new(
            0,
            36,
            0,
            MaterialId(1),
            RenderFlags::NO_SHADOW,
            ObjectId(0),
        );
        assert_eq!(plain.content_hash, no_shadow.content_hash);
    }
}
