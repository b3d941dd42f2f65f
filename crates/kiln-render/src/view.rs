//! Render views and the per-frame surface merge.
//!
//! A view collects the frame's draw submissions, then runs the merge
//! pipeline: sort by material, deduplicate identical surfaces into
//! instanced entries, and compact object-parameter offsets into a dense
//! index space. Everything here is pure bookkeeping; command recording
//! reads the result.

use glam::Mat4;
use hashbrown::HashMap;

use crate::draw::{DrawSurface, DrawSurfaceInstance, MergedDrawSurface};
use crate::pass::DrawPass;

/// Number of logical render views.
pub const VIEW_COUNT: usize = 3;

/// The logical camera/pass-group a view represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewKind {
    /// Depth-only view from the sun.
    Shadow,
    /// Main 3D raster view.
    Main,
    /// Post-process and 2D overlay view.
    Post,
}

impl ViewKind {
    /// All view kinds in execution order.
    pub const ALL: [Self; VIEW_COUNT] = [Self::Shadow, Self::Main, Self::Post];

    /// The passes this view records, in order.
    pub fn passes(self) -> &'static [DrawPass] {
        match self {
            Self::Shadow => &[DrawPass::Shadow],
            Self::Main => &[
                DrawPass::Depth,
                DrawPass::Terrain,
                DrawPass::Opaque,
                DrawPass::Skybox,
                DrawPass::Transparent,
                DrawPass::Wireframe,
            ],
            Self::Post => &[DrawPass::Post],
        }
    }
}

/// One logical render view with its per-frame surface lists.
///
/// The view itself persists across frames; its lists are cleared and
/// refilled every frame.
pub struct RenderView {
    kind: ViewKind,
    pub view_matrix: Mat4,
    pub projection: Mat4,
    pub viewport: (u32, u32),
    surfaces: Vec<DrawSurface>,
    instances: Vec<DrawSurfaceInstance>,
    merged: Vec<MergedDrawSurface>,
    merged_built: bool,
}

impl RenderView {
    /// Create an empty view.
    pub fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            view_matrix: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            viewport: (0, 0),
            surfaces: Vec::new(),
            instances: Vec::new(),
            merged: Vec::new(),
            merged_built: false,
        }
    }

    /// The view's kind.
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// Step 1: reset the committed lists for a new frame.
    pub fn clear(&mut self) {
        self.surfaces.clear();
        self.instances.clear();
        self.merged.clear();
        self.merged_built = false;
    }

    /// Step 2: commit one surface with its instance transform.
    ///
    /// Entity filtering (hidden, no-shadow) happens before this call;
    /// the view accepts everything it is handed.
    pub fn submit(&mut self, surface: DrawSurface, transform: Mat4) {
        self.surfaces.push(surface);
        self.instances.push(DrawSurfaceInstance {
            transform,
            merged: 0,
            instance: 0,
        });
    }

    /// Steps 3–5: sort, merge, and compact the committed surfaces.
    pub fn finish(&mut self) {
        self.sort();
        self.merge();
        self.compact_offsets();
        self.merged_built = true;
    }

    /// Stable sort by sort key so surfaces sharing a material are
    /// contiguous. Instances are permuted alongside their surfaces.
    fn sort(&mut self) {
        let mut order: Vec<u32> = (0..self.surfaces.len() as u32).collect();
        order.sort_by_key(|&i| self.surfaces[i as usize].sort_key);

        let mut surfaces = Vec::with_capacity(self.surfaces.len());
        let mut instances = Vec::with_capacity(self.instances.len());
        for &i in &order {
            surfaces.push(self.surfaces[i as usize].clone());
            instances.push(self.instances[i as usize]);
        }
        self.surfaces = surfaces;
        self.instances = instances;
    }

    /// Single pass over the sorted list: identical content hashes land in
    /// the same merged entry, each occurrence recording its position
    /// within the group.
    fn merge(&mut self) {
        let mut by_hash: HashMap<u64, u32> = HashMap::with_capacity(self.surfaces.len());

        for (i, surface) in self.surfaces.iter().enumerate() {
            match by_hash.get(&surface.content_hash) {
                Some(&merged_index) => {
                    let entry = &mut self.merged[merged_index as usize];
                    self.instances[i].merged = merged_index;
                    self.instances[i].instance = entry.instance_count;
                    entry.instance_count += 1;
                }
                None => {
                    let merged_index = self.merged.len() as u32;
                    by_hash.insert(surface.content_hash, merged_index);
                    self.merged.push(MergedDrawSurface {
                        surface: i as u32,
                        instance_count: 1,
                        object_offset: 0,
                        content_hash: surface.content_hash,
                    });
                    self.instances[i].merged = merged_index;
                    self.instances[i].instance = 0;
                }
            }
        }
    }

    /// Assign each merged entry a base offset equal to the running sum of
    /// prior instance counts: a dense, gapless index space sized to the
    /// total instance count.
    fn compact_offsets(&mut self) {
        let mut offset = 0;
        for entry in &mut self.merged {
            entry.object_offset = offset;
            offset += entry.instance_count;
        }
    }

    /// Committed surfaces (sorted after `finish`).
    pub fn surfaces(&self) -> &[DrawSurface] {
        &self.surfaces
    }

    /// Committed instances, parallel to `surfaces`.
    pub fn instances(&self) -> &[DrawSurfaceInstance] {
        &self.instances
    }

    /// Merged entries in draw order. Empty before `finish`.
    pub fn merged(&self) -> &[MergedDrawSurface] {
        debug_assert!(self.merged_built || self.surfaces.is_empty());
        &self.merged
    }

    /// Total instances across all merged entries; also the number of
    /// object-parameter slots this view consumes.
    pub fn total_instances(&self) -> u32 {
        self.merged.iter().map(|m| m.instance_count).sum()
    }

    /// Write each instance's transform into its compacted slot.
    ///
    /// `slots` must hold at least `total_instances` entries.
    pub fn fill_object_slots(&self, slots: &mut [Mat4]) {
        for instance in &self.instances {
            let base = self.merged[instance.merged as usize].object_offset;
            slots[(base + instance.instance) as usize] = instance.transform;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use kiln_core::{MaterialId, ObjectId, RenderFlags};

    fn cube_surface(material: u32, object: u32) -> DrawSurface {
        DrawSurface::new(
            0,
            36,
            0,
            MaterialId(material),
            RenderFlags::empty(),
            ObjectId(object),
        )
    }

    fn unique_surface(first_index: u32, material: u32, object: u32) -> DrawSurface {
        DrawSurface::new(
            first_index,
            36,
            0,
            MaterialId(material),
            RenderFlags::empty(),
            ObjectId(object),
        )
    }

    #[test]
    fn three_shared_one_unique() {
        // Three entities sharing a model/material plus one distinct
        // material: exactly 2 merged surfaces, counts {3, 1}, offsets
        // {0, 3}.
        let mut view = RenderView::new(ViewKind::Main);
        for object in 0..3 {
            view.submit(
                cube_surface(1, object),
                Mat4::from_translation(Vec3::splat(object as f32)),
            );
        }
        view.submit(unique_surface(36, 2, 3), Mat4::IDENTITY);
        view.finish();

        assert_eq!(view.merged().len(), 2);
        assert_eq!(view.merged()[0].instance_count, 3);
        assert_eq!(view.merged()[1].instance_count, 1);
        assert_eq!(view.merged()[0].object_offset, 0);
        assert_eq!(view.merged()[1].object_offset, 3);
        assert_eq!(view.total_instances(), 4);
    }

    #[test]
    fn instance_counts_sum_to_submissions() {
        let mut view = RenderView::new(ViewKind::Main);
        let patterns = [1, 1, 2, 3, 2, 1, 4, 4, 4, 4];
        for (object, &material) in patterns.iter().enumerate() {
            view.submit(cube_surface(material, object as u32), Mat4::IDENTITY);
        }
        view.finish();

        let total: u32 = view.merged().iter().map(|m| m.instance_count).sum();
        assert_eq!(total as usize, patterns.len());
    }

    #[test]
    fn identical_hashes_share_a_merged_entry() {
        let mut view = RenderView::new(ViewKind::Main);
        view.submit(cube_surface(5, 0), Mat4::IDENTITY);
        view.submit(unique_surface(72, 1, 1), Mat4::IDENTITY);
        view.submit(cube_surface(5, 2), Mat4::IDENTITY);
        view.finish();

        let cube_hash = cube_surface(5, 0).content_hash;
        let entries: Vec<_> = view
            .merged()
            .iter()
            .filter(|m| m.content_hash == cube_hash)
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].instance_count, 2);
    }

    #[test]
    fn offsets_are_gapless_and_increasing() {
        let mut view = RenderView::new(ViewKind::Main);
        for object in 0..20 {
            view.submit(cube_surface(object % 5, object), Mat4::IDENTITY);
        }
        view.finish();

        let merged = view.merged();
        for pair in merged.windows(2) {
            assert_eq!(
                pair[1].object_offset,
                pair[0].object_offset + pair[0].instance_count
            );
        }
        assert_eq!(merged[0].object_offset, 0);
    }

    #[test]
    fn sort_groups_materials_contiguously() {
        let mut view = RenderView::new(ViewKind::Main);
        let materials = [3, 1, 2, 1, 3, 2, 1];
        for (object, &material) in materials.iter().enumerate() {
            view.submit(
                unique_surface(object as u32 * 36, material, object as u32),
                Mat4::IDENTITY,
            );
        }
        view.finish();

        let mut seen = Vec::new();
        for surface in view.surfaces() {
            if seen.last() != Some(&surface.material) {
                assert!(
                    !seen.contains(&surface.material),
                    "material {:?} split into multiple runs",
                    surface.material
                );
                seen.push(surface.material);
            }
        }
    }

    #[test]
    fn intra_group_instance_ids_count_up() {
        let mut view = RenderView::new(ViewKind::Main);
        for object in 0..4 {
            view.submit(cube_surface(1, object), Mat4::IDENTITY);
        }
        view.finish();

        let mut ids: Vec<u32> = view.instances().iter().map(|i| i.instance).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn object_slots_are_dense() {
        let mut view = RenderView::new(ViewKind::Main);
        for object in 0..3 {
            view.submit(
                cube_surface(1, object),
                Mat4::from_translation(Vec3::new(object as f32, 0.0, 0.0)),
            );
        }
        view.submit(unique_surface(36, 2, 3), Mat4::from_translation(Vec3::Y));
        view.finish();

        let mut slots = vec![Mat4::ZERO; view.total_instances() as usize];
        view.fill_object_slots(&mut slots);
        // Every slot was written: no transform is the zero matrix.
        for slot in &slots {
            assert_ne!(*slot, Mat4::ZERO);
        }
    }

    #[test]
    fn clear_resets_for_next_frame() {
        let mut view = RenderView::new(ViewKind::Main);
        view.submit(cube_surface(1, 0), Mat4::IDENTITY);
        view.finish();
        assert_eq!(view.merged().len(), 1);

        view.clear();
        assert!(view.surfaces().is_empty());
        assert!(view.merged().is_empty());
        assert_eq!(view.total_instances(), 0);
    }

    #[test]
    fn entity_churn_recompacts_each_frame() {
        // Offsets are re-derived every frame: after an entity disappears,
        // the index space is again dense starting at zero.
        let mut view = RenderView::new(ViewKind::Main);
        for object in 0..3 {
            view.submit(cube_surface(1, object), Mat4::IDENTITY);
        }
        view.submit(unique_surface(36, 2, 3), Mat4::IDENTITY);
        view.finish();
        assert_eq!(view.merged()[1].object_offset, 3);

        // Next frame: the three shared entities are gone.
        view.clear();
        view.submit(unique_surface(36, 2, 3), Mat4::IDENTITY);
        view.finish();
        assert_eq!(view.merged().len(), 1);
        assert_eq!(view.merged()[0].object_offset, 0);
        assert_eq!(view.total_instances(), 1);
    }

    #[test]
    fn view_pass_ranges() {
        assert_eq!(ViewKind::Shadow.passes(), &[DrawPass::Shadow]);
        assert_eq!(ViewKind::Post.passes(), &[DrawPass::Post]);
        assert_eq!(ViewKind::Main.passes().len(), 6);
        assert!(!ViewKind::Main.passes().contains(&DrawPass::Shadow));
        assert!(!ViewKind::Main.passes().contains(&DrawPass::Post));
    }
}
