//! Eyewear asset loading and preparation.
//!
//! Loading yields a `RawAsset` (flattened triangle meshes with their source
//! material properties). `OverlayAsset::prepare` then recenters the geometry
//! on its bounding-box center, turns it to face the camera, and splits meshes
//! into lenses and frame parts.
//!
//! The lens/frame split is a heuristic over material properties. Assets that
//! do not follow the transparency/transmission convention can name their
//! meshes explicitly through `MaterialOverrides`.

use nalgebra::{Matrix4, Point3, Rotation3, Vector3};
use std::f32::consts::PI;
use std::path::Path;
use thiserror::Error;

/// Opacity below which a material counts as a lens.
const LENS_OPACITY_THRESHOLD: f32 = 0.95;
/// Transmission above which a material counts as a lens.
const LENS_TRANSMISSION_THRESHOLD: f32 = 0.1;
/// Opacity forced on lenses that arrive fully opaque.
const LENS_DEFAULT_OPACITY: f32 = 0.45;
const FRAME_MAX_METALNESS: f32 = 0.65;
const FRAME_MIN_ROUGHNESS: f32 = 0.20;
/// Render order of overlay meshes; the occluder draws at 0.
pub const OVERLAY_RENDER_ORDER: i32 = 1;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("failed to parse asset {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("asset contains no triangle meshes: {0}")]
    Empty(String),
    #[error("asset has a degenerate bounding box (width {0})")]
    Degenerate(f32),
}

/// Material properties as authored in the source asset.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialProps {
    pub name: Option<String>,
    pub base_color: [f32; 4],
    pub transparent: bool,
    pub transmission: f32,
    pub metalness: f32,
    pub roughness: f32,
}

impl Default for MaterialProps {
    fn default() -> Self {
        Self {
            name: None,
            base_color: [1.0, 1.0, 1.0, 1.0],
            transparent: false,
            transmission: 0.0,
            metalness: 1.0,
            roughness: 1.0,
        }
    }
}

impl MaterialProps {
    pub fn opacity(&self) -> f32 {
        self.base_color[3]
    }
}

/// A triangle mesh with positions already in asset space.
#[derive(Debug, Clone)]
pub struct RawMesh {
    pub name: String,
    pub positions: Vec<Point3<f32>>,
    pub triangles: Vec<[u32; 3]>,
    pub material: MaterialProps,
}

#[derive(Debug, Clone, Default)]
pub struct RawAsset {
    pub meshes: Vec<RawMesh>,
}

/// Loads a 3D asset from disk.
pub trait AssetLoader: Send {
    fn load(&self, path: &Path) -> Result<RawAsset, AssetError>;
}

/// Mesh names that bypass the material heuristic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialOverrides {
    pub lens: Vec<String>,
    pub frame: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshRole {
    Lens,
    Frame,
    Occluder,
}

/// Render-ready material.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub color: [f32; 3],
    pub opacity: f32,
    pub transparent: bool,
    pub metalness: f32,
    pub roughness: f32,
    pub color_write: bool,
    pub depth_write: bool,
    pub depth_test: bool,
    pub double_sided: bool,
}

impl Material {
    /// Invisible material that only writes depth.
    pub fn depth_only() -> Self {
        Self {
            color: [0.0; 3],
            opacity: 1.0,
            transparent: false,
            metalness: 0.0,
            roughness: 1.0,
            color_write: false,
            depth_write: true,
            depth_test: true,
            double_sided: false,
        }
    }
}

/// A mesh in the overlay scene, in local (pre-transform) coordinates.
#[derive(Debug, Clone)]
pub struct SceneMesh {
    pub name: String,
    pub role: MeshRole,
    pub positions: Vec<Point3<f32>>,
    pub triangles: Vec<[u32; 3]>,
    pub material: Material,
    pub render_order: i32,
}

/// The prepared eyewear model.
#[derive(Debug, Clone)]
pub struct OverlayAsset {
    /// Width along x in asset units, measured before orientation.
    pub native_width: f32,
    pub native_height: f32,
    pub native_depth: f32,
    pub meshes: Vec<SceneMesh>,
}

pub fn classify(name: &str, props: &MaterialProps, overrides: &MaterialOverrides) -> MeshRole {
    if overrides.lens.iter().any(|n| n == name) {
        return MeshRole::Lens;
    }
    if overrides.frame.iter().any(|n| n == name) {
        return MeshRole::Frame;
    }
    let is_lens = props.transparent
        || props.opacity() < LENS_OPACITY_THRESHOLD
        || props.transmission > LENS_TRANSMISSION_THRESHOLD;
    if is_lens {
        MeshRole::Lens
    } else {
        MeshRole::Frame
    }
}

/// Lenses: forced translucency, no depth writes. Frames: clamped metalness/roughness.
pub fn treat_material(props: &MaterialProps, role: MeshRole) -> Material {
    let [r, g, b, a] = props.base_color;
    match role {
        MeshRole::Lens => Material {
            color: [r, g, b],
            // Unset (zero) and fully opaque lenses both get the default tint.
            opacity: if a <= 0.0 || a >= 1.0 { LENS_DEFAULT_OPACITY } else { a },
            transparent: true,
            metalness: props.metalness,
            roughness: props.roughness,
            color_write: true,
            depth_write: false,
            depth_test: true,
            double_sided: true,
        },
        MeshRole::Frame => Material {
            color: [r, g, b],
            opacity: 1.0,
            transparent: false,
            metalness: props.metalness.min(FRAME_MAX_METALNESS),
            roughness: props.roughness.max(FRAME_MIN_ROUGHNESS),
            color_write: true,
            depth_write: true,
            depth_test: true,
            double_sided: true,
        },
        MeshRole::Occluder => Material::depth_only(),
    }
}

impl OverlayAsset {
    pub fn prepare(raw: RawAsset, overrides: &MaterialOverrides) -> Result<Self, AssetError> {
        let mut min = Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY);
        let mut max = Point3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);
        for p in raw.meshes.iter().flat_map(|m| m.positions.iter()) {
            min = min.inf(p);
            max = max.sup(p);
        }
        if !min.x.is_finite() {
            return Err(AssetError::Empty("no vertices".into()));
        }

        let size = max - min;
        if !(size.x.is_finite() && size.x > f32::EPSILON) {
            return Err(AssetError::Degenerate(size.x));
        }
        let center = nalgebra::center(&min, &max);

        // Assets are modeled facing away from the viewer: yaw them half a turn
        // about their own center.
        let orient = Rotation3::from_axis_angle(&Vector3::y_axis(), PI);

        let mut lenses = 0usize;
        let meshes: Vec<SceneMesh> = raw
            .meshes
            .into_iter()
            .map(|m| {
                let role = classify(&m.name, &m.material, overrides);
                if role == MeshRole::Lens {
                    lenses += 1;
                }
                let positions = m
                    .positions
                    .iter()
                    .map(|p| Point3::from(orient * (p - center)))
                    .collect();
                SceneMesh {
                    material: treat_material(&m.material, role),
                    name: m.name,
                    role,
                    positions,
                    triangles: m.triangles,
                    render_order: OVERLAY_RENDER_ORDER,
                }
            })
            .collect();

        tracing::info!(
            width = size.x,
            height = size.y,
            depth = size.z,
            meshes = meshes.len(),
            lenses,
            "overlay asset prepared"
        );

        Ok(Self {
            native_width: size.x,
            native_height: size.y,
            native_depth: size.z,
            meshes,
        })
    }

    pub fn lens_meshes(&self) -> impl Iterator<Item = &SceneMesh> {
        self.meshes.iter().filter(|m| m.role == MeshRole::Lens)
    }

    pub fn frame_meshes(&self) -> impl Iterator<Item = &SceneMesh> {
        self.meshes.iter().filter(|m| m.role == MeshRole::Frame)
    }
}

/// Binary glTF (`.glb`) and glTF loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct GltfLoader;

impl AssetLoader for GltfLoader {
    fn load(&self, path: &Path) -> Result<RawAsset, AssetError> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(AssetError::NotFound(shown));
        }

        let (document, buffers, _images) = gltf::import(path).map_err(|e| AssetError::Parse {
            path: shown.clone(),
            reason: e.to_string(),
        })?;

        let scene = document
            .default_scene()
            .or_else(|| document.scenes().next())
            .ok_or_else(|| AssetError::Empty(shown.clone()))?;

        let mut asset = RawAsset::default();
        for node in scene.nodes() {
            collect_node(&node, &Matrix4::identity(), &buffers, &mut asset.meshes);
        }
        if asset.meshes.is_empty() {
            return Err(AssetError::Empty(shown));
        }

        tracing::info!(path = %shown, meshes = asset.meshes.len(), "loaded glTF asset");
        Ok(asset)
    }
}

fn collect_node(
    node: &gltf::Node,
    parent: &Matrix4<f32>,
    buffers: &[gltf::buffer::Data],
    out: &mut Vec<RawMesh>,
) {
    let world = parent * Matrix4::from(node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        let mesh_name = mesh
            .name()
            .or_else(|| node.name())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("mesh{}", mesh.index()));

        for (i, primitive) in mesh.primitives().enumerate() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                tracing::debug!(mesh = %mesh_name, "skipping non-triangle primitive");
                continue;
            }
            let reader = primitive.reader(|b| Some(buffers[b.index()].0.as_slice()));
            let Some(positions) = reader.read_positions() else {
                continue;
            };
            let positions: Vec<Point3<f32>> = positions
                .map(|[x, y, z]| world.transform_point(&Point3::new(x, y, z)))
                .collect();

            let indices: Vec<u32> = match reader.read_indices() {
                Some(idx) => idx.into_u32().collect(),
                None => (0..positions.len() as u32).collect(),
            };
            let triangles: Vec<[u32; 3]> = indices
                .chunks_exact(3)
                .filter(|t| t.iter().all(|&v| (v as usize) < positions.len()))
                .map(|t| [t[0], t[1], t[2]])
                .collect();
            if triangles.is_empty() {
                continue;
            }

            let material = primitive.material();
            let pbr = material.pbr_metallic_roughness();
            let props = MaterialProps {
                name: material.name().map(str::to_owned),
                base_color: pbr.base_color_factor(),
                transparent: matches!(material.alpha_mode(), gltf::material::AlphaMode::Blend),
                transmission: material
                    .transmission()
                    .map(|t| t.transmission_factor())
                    .unwrap_or(0.0),
                metalness: pbr.metallic_factor(),
                roughness: pbr.roughness_factor(),
            };

            let name = if i == 0 {
                mesh_name.clone()
            } else {
                format!("{mesh_name}.{i}")
            };
            out.push(RawMesh {
                name,
                positions,
                triangles,
                material: props,
            });
        }
    }

    for child in node.children() {
        collect_node(&child, &world, buffers, out);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Axis-aligned box mesh from `min` to `max`.
    pub(crate) fn box_mesh(
        name: &str,
        min: [f32; 3],
        max: [f32; 3],
        material: MaterialProps,
    ) -> RawMesh {
        let [x0, y0, z0] = min;
        let [x1, y1, z1] = max;
        let positions = vec![
            Point3::new(x0, y0, z0),
            Point3::new(x1, y0, z0),
            Point3::new(x1, y1, z0),
            Point3::new(x0, y1, z0),
            Point3::new(x0, y0, z1),
            Point3::new(x1, y0, z1),
            Point3::new(x1, y1, z1),
            Point3::new(x0, y1, z1),
        ];
        let triangles = vec![
            [0, 1, 2], [0, 2, 3], // back
            [4, 6, 5], [4, 7, 6], // front
            [0, 4, 5], [0, 5, 1], // bottom
            [3, 2, 6], [3, 6, 7], // top
            [0, 3, 7], [0, 7, 4], // left
            [1, 5, 6], [1, 6, 2], // right
        ];
        RawMesh {
            name: name.to_string(),
            positions,
            triangles,
            material,
        }
    }

    pub(crate) fn lens_props() -> MaterialProps {
        MaterialProps {
            base_color: [0.2, 0.2, 0.2, 1.0],
            transparent: true,
            ..MaterialProps::default()
        }
    }

    #[test]
    fn test_classify_by_material() {
        let none = MaterialOverrides::default();
        assert_eq!(classify("a", &lens_props(), &none), MeshRole::Lens);

        let tinted = MaterialProps {
            base_color: [1.0, 1.0, 1.0, 0.5],
            ..MaterialProps::default()
        };
        assert_eq!(classify("a", &tinted, &none), MeshRole::Lens);

        let glass = MaterialProps {
            transmission: 0.9,
            ..MaterialProps::default()
        };
        assert_eq!(classify("a", &glass, &none), MeshRole::Lens);

        assert_eq!(classify("a", &MaterialProps::default(), &none), MeshRole::Frame);
    }

    #[test]
    fn test_overrides_win() {
        let overrides = MaterialOverrides {
            lens: vec!["Glass".into()],
            frame: vec!["Rim".into()],
        };
        assert_eq!(classify("Glass", &MaterialProps::default(), &overrides), MeshRole::Lens);
        assert_eq!(classify("Rim", &lens_props(), &overrides), MeshRole::Frame);
    }

    #[test]
    fn test_material_treatment() {
        let lens = treat_material(&lens_props(), MeshRole::Lens);
        assert!(lens.transparent);
        assert!(!lens.depth_write);
        assert_eq!(lens.opacity, LENS_DEFAULT_OPACITY);

        let tinted = MaterialProps {
            base_color: [0.2, 0.2, 0.2, 0.3],
            ..lens_props()
        };
        assert_eq!(treat_material(&tinted, MeshRole::Lens).opacity, 0.3);

        let shiny = MaterialProps {
            metalness: 1.0,
            roughness: 0.0,
            ..MaterialProps::default()
        };
        let frame = treat_material(&shiny, MeshRole::Frame);
        assert_eq!(frame.metalness, 0.65);
        assert_eq!(frame.roughness, 0.20);
        assert!(frame.depth_write && frame.depth_test && frame.double_sided);
    }

    #[test]
    fn test_invisible_lens_gets_default_opacity() {
        let clear = MaterialProps {
            base_color: [0.2, 0.2, 0.2, 0.0],
            ..lens_props()
        };
        let lens = treat_material(&clear, MeshRole::Lens);
        assert_eq!(lens.opacity, LENS_DEFAULT_OPACITY);
        assert!(lens.transparent);
    }

    #[test]
    fn test_prepare_recenters_and_faces_camera() {
        // Modeled facing away: rim at small z, arms running toward +z.
        let raw = RawAsset {
            meshes: vec![
                box_mesh("rim", [10.0, 0.0, -5.0], [24.0, 4.0, -4.0], MaterialProps::default()),
                box_mesh("arm", [10.0, 1.0, -4.0], [11.0, 2.0, 10.0], MaterialProps::default()),
                box_mesh("lens", [11.0, 0.5, -4.8], [23.0, 3.5, -4.5], lens_props()),
            ],
        };
        let asset = OverlayAsset::prepare(raw, &MaterialOverrides::default()).unwrap();
        assert!((asset.native_width - 14.0).abs() < 1e-4);
        assert!((asset.native_depth - 15.0).abs() < 1e-4);
        assert_eq!(asset.lens_meshes().count(), 1);
        assert_eq!(asset.frame_meshes().count(), 2);

        let all: Vec<_> = asset.meshes.iter().flat_map(|m| m.positions.iter()).collect();
        let min_x = all.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
        let max_x = all.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max);
        assert!((min_x + 7.0).abs() < 1e-3 && (max_x - 7.0).abs() < 1e-3);

        // After the half-turn the rim is nearest the camera (+z) and the arm
        // tips lie behind it.
        let min_z = |m: &SceneMesh| m.positions.iter().map(|p| p.z).fold(f32::INFINITY, f32::min);
        assert!((min_z(&asset.meshes[0]) - 6.5).abs() < 1e-3);
        assert!((min_z(&asset.meshes[1]) + 7.5).abs() < 1e-3);
    }

    #[test]
    fn test_prepare_rejects_empty() {
        assert!(matches!(
            OverlayAsset::prepare(RawAsset::default(), &MaterialOverrides::default()),
            Err(AssetError::Empty(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = GltfLoader.load(Path::new("/nonexistent/glasses.glb")).unwrap_err();
        assert!(matches!(err, AssetError::NotFound(_)));
    }
}
