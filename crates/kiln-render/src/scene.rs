//! Scene and asset boundary types.
//!
//! The asset/scene layer proper lives outside this crate; these are the
//! contracts it feeds the renderer: models resolving to ranges in the
//! shared vertex/index buffers, materials resolving to per-pass programs
//! plus texture bindings, and raw texture pixel data for deferred upload.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use kiln_core::constants::MATERIAL_TEXTURE_SLOTS;
use kiln_core::{MaterialId, ModelId, ProgramId, RenderFlags, TextureId};
use kiln_gpu::error::Result;
use kiln_gpu::pipeline::create_shader_module;

use crate::pass::DrawPass;

/// Vertex format shared by every mesh in the engine.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Vertex buffer binding description.
    pub fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(Self::SIZE as u32)
            .input_rate(vk::VertexInputRate::VERTEX)]
    }

    /// Vertex attribute descriptions matching the shader interface.
    pub fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(24),
        ]
    }
}

/// One geometric surface of a model: an index range plus its material.
#[derive(Clone, Copy, Debug)]
pub struct ModelSurface {
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
    pub material: MaterialId,
}

/// A model: a list of surfaces into the shared geometry buffers.
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub surfaces: Vec<ModelSurface>,
}

/// Material description: per-pass programs, texture bindings, and the
/// constant factors uploaded to the material table.
#[derive(Clone, Debug)]
pub struct MaterialDesc {
    /// Program handle per draw pass; `ProgramId::INVALID` means the
    /// material does not participate in that pass.
    pub programs: [ProgramId; DrawPass::COUNT],
    /// Up to 8 texture bindings; unused slots are `TextureId::INVALID`.
    pub textures: [TextureId; MATERIAL_TEXTURE_SLOTS],
    pub base_color: [f32; 4],
    pub emissive: [f32; 4],
    pub roughness: f32,
    pub metallic: f32,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            programs: [ProgramId::INVALID; DrawPass::COUNT],
            textures: [TextureId::INVALID; MATERIAL_TEXTURE_SLOTS],
            base_color: [1.0, 1.0, 1.0, 1.0],
            emissive: [0.0, 0.0, 0.0, 0.0],
            roughness: 0.8,
            metallic: 0.0,
        }
    }
}

impl MaterialDesc {
    /// Program for a pass, if the material participates.
    pub fn program(&self, pass: DrawPass) -> ProgramId {
        self.programs[pass.index()]
    }
}

/// Pixel payload of a texture awaiting upload.
#[derive(Clone, Debug)]
pub enum TexturePixels {
    /// A flat 2D texture; mips are generated on upload.
    Flat {
        width: u32,
        height: u32,
        format: vk::Format,
        data: Vec<u8>,
    },
    /// A cubemap: exactly six same-size, same-format faces.
    Cube { faces: Vec<TextureFace> },
}

/// One face of a cubemap.
#[derive(Clone, Debug)]
pub struct TextureFace {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub data: Vec<u8>,
}

/// CPU-side asset tables the renderer consumes.
///
/// Geometry lives in two shared arrays; models address into them by
/// range. `geometry_revision` bumps whenever vertices or indices change
/// so the renderer knows to re-upload.
#[derive(Default)]
pub struct AssetStore {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    models: Vec<Model>,
    materials: Vec<MaterialDesc>,
    textures: Vec<TexturePixels>,
    geometry_revision: u64,
}

impl AssetStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mesh's geometry and register its model.
    pub fn add_model(
        &mut self,
        vertices: &[Vertex],
        indices: &[u32],
        surfaces: Vec<ModelSurface>,
    ) -> ModelId {
        let vertex_offset = self.vertices.len() as i32;
        let first_index = self.indices.len() as u32;
        self.vertices.extend_from_slice(vertices);
        self.indices.extend_from_slice(indices);
        self.geometry_revision += 1;

        let surfaces = surfaces
            .into_iter()
            .map(|s| ModelSurface {
                first_index: first_index + s.first_index,
                index_count: s.index_count,
                vertex_offset: vertex_offset + s.vertex_offset,
                material: s.material,
            })
            .collect();

        let id = ModelId(self.models.len() as u32);
        self.models.push(Model { surfaces });
        id
    }

    /// Register a material.
    pub fn add_material(&mut self, material: MaterialDesc) -> MaterialId {
        let id = MaterialId(self.materials.len() as u32);
        self.materials.push(material);
        id
    }

    /// Register a texture for deferred upload.
    pub fn add_texture(&mut self, pixels: TexturePixels) -> TextureId {
        let id = TextureId(self.textures.len() as u32);
        self.textures.push(pixels);
        id
    }

    pub fn model(&self, id: ModelId) -> Option<&Model> {
        self.models.get(id.index())
    }

    pub fn material(&self, id: MaterialId) -> Option<&MaterialDesc> {
        self.materials.get(id.index())
    }

    pub fn materials(&self) -> &[MaterialDesc] {
        &self.materials
    }

    pub fn texture(&self, id: TextureId) -> Option<&TexturePixels> {
        self.textures.get(id.index())
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Revision counter for the shared geometry arrays.
    pub fn geometry_revision(&self) -> u64 {
        self.geometry_revision
    }
}

/// SPIR-V blobs for one program, supplied by the shader loader.
#[derive(Clone, Debug)]
pub struct ProgramDesc {
    pub name: String,
    pub vertex_spirv: Vec<u32>,
    /// Absent for depth-only programs.
    pub fragment_spirv: Option<Vec<u32>>,
}

/// A program's pipeline-ready shader modules.
pub struct GpuProgram {
    pub vertex: vk::ShaderModule,
    pub fragment: Option<vk::ShaderModule>,
}

/// Shader modules for every registered program.
#[derive(Default)]
pub struct ShaderLibrary {
    programs: Vec<GpuProgram>,
}

impl ShaderLibrary {
    /// Turn compiled SPIR-V blobs into pipeline-ready shader modules.
    ///
    /// Program ids are assigned by position. This does not compile
    /// shaders; the loader hands over finished binaries.
    ///
    /// # Safety
    /// The device must be valid and every blob must be valid SPIR-V.
    pub unsafe fn generate_gpu_programs(
        device: &ash::Device,
        descs: &[ProgramDesc],
    ) -> Result<Self> {
        let mut programs = Vec::with_capacity(descs.len());
        for desc in descs {
            let vertex = unsafe { create_shader_module(device, &desc.vertex_spirv)? };
            let fragment = match &desc.fragment_spirv {
                Some(spirv) => Some(unsafe { create_shader_module(device, spirv)? }),
                None => None,
            };
            tracing::debug!("created shader modules for program '{}'", desc.name);
            programs.push(GpuProgram { vertex, fragment });
        }
        Ok(Self { programs })
    }

    /// Look up a program's modules.
    pub fn get(&self, id: ProgramId) -> Option<&GpuProgram> {
        if !id.is_valid() {
            return None;
        }
        self.programs.get(id.index())
    }

    /// Number of registered programs.
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    /// Whether the library is empty.
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Destroy all shader modules.
    ///
    /// # Safety
    /// The device must be valid and no pipeline may still use the modules.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for program in self.programs.drain(..) {
            unsafe {
                device.destroy_shader_module(program.vertex, None);
                if let Some(fragment) = program.fragment {
                    device.destroy_shader_module(fragment, None);
                }
            }
        }
    }
}

/// A renderable entity: a model instance with a transform and flags.
#[derive(Clone, Copy, Debug)]
pub struct Entity {
    pub model: ModelId,
    pub transform: Mat4,
    pub flags: RenderFlags,
}

/// A point light.
#[derive(Clone, Copy, Debug)]
pub struct Light {
    pub position: glam::Vec3,
    pub color: glam::Vec3,
    pub radius: f32,
}

/// Directional sun light driving the shadow view.
#[derive(Clone, Copy, Debug)]
pub struct Sun {
    pub direction: glam::Vec3,
    pub color: glam::Vec3,
}

impl Default for Sun {
    fn default() -> Self {
        Self {
            direction: glam::Vec3::new(-0.4, -1.0, -0.3).normalize(),
            color: glam::Vec3::ONE,
        }
    }
}

/// The per-frame scene snapshot handed to the renderer.
#[derive(Default)]
pub struct Scene {
    pub entities: Vec<Entity>,
    pub lights: Vec<Light>,
    pub sun: Sun,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            position: glam::Vec3::ZERO,
            color: glam::Vec3::ONE,
            radius: 10.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout() {
        assert_eq!(Vertex::SIZE, 32);
        assert_eq!(std::mem::offset_of!(Vertex, position), 0);
        assert_eq!(std::mem::offset_of!(Vertex, normal), 12);
        assert_eq!(std::mem::offset_of!(Vertex, uv), 24);
    }

    #[test]
    fn vertex_attributes_match_layout() {
        let attributes = Vertex::attributes();
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(Vertex::bindings()[0].stride, 32);
    }

    #[test]
    fn add_model_rebases_surface_ranges() {
        let mut store = AssetStore::new();
        let quad_vertices = vec![Vertex::default(); 4];
        let quad_indices = vec![0, 1, 2, 2, 3, 0];

        store.add_model(
            &quad_vertices,
            &quad_indices,
            vec![ModelSurface {
                first_index: 0,
                index_count: 6,
                vertex_offset: 0,
                material: MaterialId(0),
            }],
        );
        let second = store.add_model(
            &quad_vertices,
            &quad_indices,
            vec![ModelSurface {
                first_index: 0,
                index_count: 6,
                vertex_offset: 0,
                material: MaterialId(1),
            }],
        );

        let surface = store.model(second).unwrap().surfaces[0];
        assert_eq!(surface.first_index, 6);
        assert_eq!(surface.vertex_offset, 4);
        assert_eq!(store.geometry_revision(), 2);
    }

    #[test]
    fn default_material_skips_all_passes() {
        let material = MaterialDesc::default();
        for pass in DrawPass::ALL {
            assert!(!material.program(pass).is_valid());
        }
    }
}
