//! Demo viewer: a small scene of instanced props orbited by the camera.
//!
//! Shader programs are loaded as precompiled SPIR-V from
//! `assets/shaders/` when present; without them the frame still runs the
//! full commit/merge/record path and presents the clear color (missing
//! pipelines are soft skips).

use std::path::Path;

use anyhow::Result;
use glam::{Mat4, Vec3};
use kiln_app::{run_app, AppConfig, AppContext, KilnApp};
use kiln_core::{ProgramId, RenderFlags};
use kiln_render::{
    AssetStore, Camera, DrawPass, Entity, Light, MaterialDesc, ModelSurface, ProgramDesc, Scene,
    Vertex,
};
use tracing::{info, warn};

/// Orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.3;

fn main() -> Result<()> {
    let config = AppConfig::new("Kiln Viewer").with_size(1280, 720);
    run_app::<Viewer>(config)
}

struct Viewer {
    scene: Scene,
    camera: Camera,
    orbit_angle: f32,
}

impl KilnApp for Viewer {
    fn load_assets(assets: &mut AssetStore) -> Result<Vec<ProgramDesc>> {
        let programs = load_programs();
        let program_count = programs.len() as u32;

        // Material 0: the shared crate prop.
        let mut crate_material = MaterialDesc {
            base_color: [0.8, 0.6, 0.4, 1.0],
            roughness: 0.7,
            ..Default::default()
        };
        // Material 1: a distinct ground material.
        let mut ground_material = MaterialDesc {
            base_color: [0.3, 0.45, 0.3, 1.0],
            roughness: 0.95,
            ..Default::default()
        };

        if program_count >= 2 {
            for material in [&mut crate_material, &mut ground_material] {
                material.programs[DrawPass::Shadow.index()] = ProgramId(0);
                material.programs[DrawPass::Depth.index()] = ProgramId(0);
                material.programs[DrawPass::Opaque.index()] = ProgramId(1);
                material.programs[DrawPass::Wireframe.index()] = ProgramId(1);
            }
        } else {
            warn!("no shader programs found; rendering clear color only");
        }

        let crate_mat = assets.add_material(crate_material);
        let ground_mat = assets.add_material(ground_material);

        let (cube_vertices, cube_indices) = cube_mesh(1.0);
        let cube = assets.add_model(
            &cube_vertices,
            &cube_indices,
            vec![ModelSurface {
                first_index: 0,
                index_count: cube_indices.len() as u32,
                vertex_offset: 0,
                material: crate_mat,
            }],
        );

        let (plane_vertices, plane_indices) = plane_mesh(40.0);
        let ground = assets.add_model(
            &plane_vertices,
            &plane_indices,
            vec![ModelSurface {
                first_index: 0,
                index_count: plane_indices.len() as u32,
                vertex_offset: 0,
                material: ground_mat,
            }],
        );

        info!("assets ready: cube model {}, ground model {}", cube.0, ground.0);
        Ok(programs)
    }

    fn init(ctx: &mut AppContext) -> Result<Self> {
        let mut scene = Scene::default();

        // Three identical crates merge into one instanced draw; the
        // ground stays its own draw call.
        for i in 0..3 {
            scene.entities.push(Entity {
                model: kiln_core::ModelId(0),
                transform: Mat4::from_translation(Vec3::new(i as f32 * 2.5 - 2.5, 0.5, 0.0)),
                flags: RenderFlags::empty(),
            });
        }
        scene.entities.push(Entity {
            model: kiln_core::ModelId(1),
            transform: Mat4::IDENTITY,
            flags: RenderFlags::NO_SHADOW,
        });

        scene.lights.push(Light {
            position: Vec3::new(0.0, 6.0, 4.0),
            color: Vec3::new(1.0, 0.9, 0.7),
            radius: 25.0,
        });

        let camera = Camera::new(
            Vec3::new(8.0, 5.0, 8.0),
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::Y,
            60.0_f32.to_radians(),
            ctx.aspect_ratio(),
            0.1,
            500.0,
        );

        Ok(Self {
            scene,
            camera,
            orbit_angle: 0.0,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.orbit_angle += ORBIT_SPEED * dt;
        let radius = 10.0;
        self.camera.position = Vec3::new(
            self.orbit_angle.cos() * radius,
            5.0,
            self.orbit_angle.sin() * radius,
        );
        self.camera.look_at(Vec3::new(0.0, 0.5, 0.0));
    }

    fn scene(&self) -> &Scene {
        &self.scene
    }

    fn camera(&self) -> &Camera {
        &self.camera
    }

    fn on_resize(&mut self, width: u32, height: u32) {
        self.camera.set_aspect(width as f32 / height.max(1) as f32);
    }
}

/// Load precompiled SPIR-V programs from `assets/shaders/`.
///
/// Expected files: `mesh_depth.vert.spv`, then `mesh.vert.spv` +
/// `mesh.frag.spv`. Missing files simply yield fewer programs.
fn load_programs() -> Vec<ProgramDesc> {
    let dir = Path::new("assets/shaders");
    let mut programs = Vec::new();

    if let Some(depth_vert) = read_spirv(&dir.join("mesh_depth.vert.spv")) {
        programs.push(ProgramDesc {
            name: "mesh_depth".to_string(),
            vertex_spirv: depth_vert,
            fragment_spirv: None,
        });
    }
    if let (Some(vert), Some(frag)) = (
        read_spirv(&dir.join("mesh.vert.spv")),
        read_spirv(&dir.join("mesh.frag.spv")),
    ) {
        programs.push(ProgramDesc {
            name: "mesh".to_string(),
            vertex_spirv: vert,
            fragment_spirv: Some(frag),
        });
    }

    programs
}

/// Read a SPIR-V blob as 32-bit words.
fn read_spirv(path: &Path) -> Option<Vec<u32>> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() % 4 != 0 {
        warn!("{} is not a valid SPIR-V blob", path.display());
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Unit cube centered on the origin, scaled by `size`.
fn cube_mesh(size: f32) -> (Vec<Vertex>, Vec<u32>) {
    let h = size * 0.5;
    let faces: [([f32; 3], [Vec3; 4]); 6] = [
        (
            [0.0, 0.0, 1.0],
            [
                Vec3::new(-h, -h, h),
                Vec3::new(h, -h, h),
                Vec3::new(h, h, h),
                Vec3::new(-h, h, h),
            ],
        ),
        (
            [0.0, 0.0, -1.0],
            [
                Vec3::new(h, -h, -h),
                Vec3::new(-h, -h, -h),
                Vec3::new(-h, h, -h),
                Vec3::new(h, h, -h),
            ],
        ),
        (
            [1.0, 0.0, 0.0],
            [
                Vec3::new(h, -h, h),
                Vec3::new(h, -h, -h),
                Vec3::new(h, h, -h),
                Vec3::new(h, h, h),
            ],
        ),
        (
            [-1.0, 0.0, 0.0],
            [
                Vec3::new(-h, -h, -h),
                Vec3::new(-h, -h, h),
                Vec3::new(-h, h, h),
                Vec3::new(-h, h, -h),
            ],
        ),
        (
            [0.0, 1.0, 0.0],
            [
                Vec3::new(-h, h, h),
                Vec3::new(h, h, h),
                Vec3::new(h, h, -h),
                Vec3::new(-h, h, -h),
            ],
        ),
        (
            [0.0, -1.0, 0.0],
            [
                Vec3::new(-h, -h, -h),
                Vec3::new(h, -h, -h),
                Vec3::new(h, -h, h),
                Vec3::new(-h, -h, h),
            ],
        ),
    ];

    let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, corners) in faces {
        let base = vertices.len() as u32;
        for (corner, uv) in corners.iter().zip(uvs) {
            vertices.push(Vertex {
                position: corner.to_array(),
                normal,
                uv,
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    (vertices, indices)
}

/// Flat ground plane of `size` x `size` units on XZ.
fn plane_mesh(size: f32) -> (Vec<Vertex>, Vec<u32>) {
    let h = size * 0.5;
    let vertices = vec![
        Vertex {
            position: [-h, 0.0, -h],
            normal: [0.0, 1.0, 0.0],
            uv: [0.0, 0.0],
        },
        Vertex {
            position: [h, 0.0, -h],
            normal: [0.0, 1.0, 0.0],
            uv: [1.0, 0.0],
        },
        Vertex {
            position: [h, 0.0, h],
            normal: [0.0, 1.0, 0.0],
            uv: [1.0, 1.0],
        },
        Vertex {
            position: [-h, 0.0, h],
            normal: [0.0, 1.0, 0.0],
            uv: [0.0, 1.0],
        },
    ];
    let indices = vec![0, 2, 1, 2, 0, 3];
    (vertices, indices)
}
