//! Off-screen rendering of the overlay scene.
//!
//! `SoftwareRenderer` is a depth-buffered triangle rasterizer. It honors the
//! material masks the occlusion trick depends on (color write, depth write,
//! depth test) and draws in two passes: opaque meshes by render order, then
//! translucent meshes by render order, back to front.

use crate::asset::{Material, SceneMesh};
use crate::scene::OrthoCamera;
use image::{Rgba, RgbaImage};
use nalgebra::{Matrix4, Point3, Vector3};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("render context lost")]
    ContextLost,
    #[error("surface size mismatch: expected {expected:?}, got {actual:?}")]
    SurfaceMismatch { expected: (u32, u32), actual: (u32, u32) },
    #[error("renderer has been disposed")]
    Disposed,
    #[error("invalid surface size {0}x{1}")]
    InvalidSurface(u32, u32),
}

/// One mesh with its model matrix.
#[derive(Debug, Clone, Copy)]
pub struct RenderItem<'a> {
    pub mesh: &'a SceneMesh,
    pub model: Matrix4<f32>,
}

pub trait Renderer: Send {
    fn surface_size(&self) -> (u32, u32);

    /// Clear the surface to transparent and draw `items` through `camera`.
    fn render(
        &mut self,
        items: &[RenderItem<'_>],
        camera: &OrthoCamera,
    ) -> Result<&RgbaImage, RenderError>;

    /// Release the surface. Later `render` calls fail with `Disposed`.
    fn dispose(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub intensity: f32,
    /// Direction toward the light.
    pub direction: Vector3<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightingRig {
    pub ambient: f32,
    pub key: DirectionalLight,
    pub fill: DirectionalLight,
}

impl Default for LightingRig {
    fn default() -> Self {
        Self {
            ambient: 1.0,
            key: DirectionalLight {
                intensity: 0.7,
                direction: Vector3::new(1.0, 2.0, 3.0).normalize(),
            },
            fill: DirectionalLight {
                intensity: 0.3,
                direction: Vector3::new(-1.0, 0.0, -2.0).normalize(),
            },
        }
    }
}

impl LightingRig {
    /// Lambert diffuse plus a roughness-weighted key highlight. Metals lose
    /// part of their diffuse term.
    pub fn shade(&self, normal: &Vector3<f32>, material: &Material) -> [f32; 3] {
        let key = normal.dot(&self.key.direction).max(0.0);
        let fill = normal.dot(&self.fill.direction).max(0.0);
        let diffuse = (self.ambient + self.key.intensity * key + self.fill.intensity * fill)
            * (1.0 - 0.5 * material.metalness);
        let highlight = self.key.intensity * key.powi(8) * (1.0 - material.roughness);
        material.color.map(|c| (c * diffuse + highlight).clamp(0.0, 1.0))
    }
}

pub struct SoftwareRenderer {
    width: u32,
    height: u32,
    color: RgbaImage,
    depth: Vec<f32>,
    lights: LightingRig,
    disposed: bool,
}

impl SoftwareRenderer {
    pub fn new(width: u32, height: u32) -> Result<Self, RenderError> {
        Self::with_lighting(width, height, LightingRig::default())
    }

    pub fn with_lighting(
        width: u32,
        height: u32,
        lights: LightingRig,
    ) -> Result<Self, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidSurface(width, height));
        }
        Ok(Self {
            width,
            height,
            color: RgbaImage::new(width, height),
            depth: vec![f32::INFINITY; (width * height) as usize],
            lights,
            disposed: false,
        })
    }

    fn clear(&mut self) {
        for p in self.color.pixels_mut() {
            *p = Rgba([0, 0, 0, 0]);
        }
        self.depth.fill(f32::INFINITY);
    }

    fn draw(&mut self, item: &RenderItem<'_>, camera: &OrthoCamera, view_proj: &Matrix4<f32>) {
        let mesh = item.mesh;
        let mat = &mesh.material;

        let world: Vec<Point3<f32>> = mesh
            .positions
            .iter()
            .map(|p| item.model.transform_point(p))
            .collect();
        let screen: Vec<(f32, f32, f32)> =
            world.iter().map(|p| camera.project(view_proj, p)).collect();

        for tri in &mesh.triangles {
            let [a, b, c] = tri.map(|i| i as usize);
            let normal = (world[b] - world[a]).cross(&(world[c] - world[a]));
            let Some(mut normal) = normal.try_normalize(f32::EPSILON) else {
                continue;
            };
            // The camera looks down -z; front faces have +z normals.
            if normal.z < 0.0 {
                if !mat.double_sided {
                    continue;
                }
                normal = -normal;
            }
            let rgb = if mat.color_write {
                self.lights.shade(&normal, mat)
            } else {
                [0.0; 3]
            };
            self.raster_triangle([screen[a], screen[b], screen[c]], mat, rgb);
        }
    }

    fn raster_triangle(&mut self, v: [(f32, f32, f32); 3], mat: &Material, rgb: [f32; 3]) {
        let edge = |a: (f32, f32, f32), b: (f32, f32, f32), x: f32, y: f32| {
            (b.0 - a.0) * (y - a.1) - (b.1 - a.1) * (x - a.0)
        };
        let area = edge(v[0], v[1], v[2].0, v[2].1);
        if area.abs() < f32::EPSILON {
            return;
        }

        let min_x = v.iter().map(|p| p.0).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
        let min_y = v.iter().map(|p| p.1).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
        let max_x = v.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max).ceil();
        let max_y = v.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max).ceil();
        if max_x < 0.0 || max_y < 0.0 {
            return;
        }
        let max_x = (max_x as u32).min(self.width);
        let max_y = (max_y as u32).min(self.height);

        let src = [rgb[0], rgb[1], rgb[2], mat.opacity.clamp(0.0, 1.0)];

        for y in min_y..max_y {
            for x in min_x..max_x {
                let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
                let w0 = edge(v[1], v[2], px, py) / area;
                let w1 = edge(v[2], v[0], px, py) / area;
                let w2 = edge(v[0], v[1], px, py) / area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }
                let z = w0 * v[0].2 + w1 * v[1].2 + w2 * v[2].2;
                if !(-1.0..=1.0).contains(&z) {
                    continue;
                }

                let i = (y * self.width + x) as usize;
                if mat.depth_test && z >= self.depth[i] {
                    continue;
                }
                if mat.color_write {
                    let dst = self.color.get_pixel_mut(x, y);
                    *dst = blend_over(*dst, src);
                }
                if mat.depth_write {
                    self.depth[i] = z;
                }
            }
        }
    }
}

/// Straight-alpha source-over.
fn blend_over(dst: Rgba<u8>, src: [f32; 4]) -> Rgba<u8> {
    let [dr, dg, db, da] = dst.0.map(|c| c as f32 / 255.0);
    let sa = src[3];
    let out_a = sa + da * (1.0 - sa);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let mix = |s: f32, d: f32| (s * sa + d * da * (1.0 - sa)) / out_a;
    let to_u8 = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgba([
        to_u8(mix(src[0], dr)),
        to_u8(mix(src[1], dg)),
        to_u8(mix(src[2], db)),
        to_u8(out_a),
    ])
}

fn mean_depth(item: &RenderItem<'_>, camera: &OrthoCamera, view_proj: &Matrix4<f32>) -> f32 {
    let n = item.mesh.positions.len().max(1) as f32;
    item.mesh
        .positions
        .iter()
        .map(|p| camera.project(view_proj, &item.model.transform_point(p)).2)
        .sum::<f32>()
        / n
}

impl Renderer for SoftwareRenderer {
    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn render(
        &mut self,
        items: &[RenderItem<'_>],
        camera: &OrthoCamera,
    ) -> Result<&RgbaImage, RenderError> {
        if self.disposed {
            return Err(RenderError::Disposed);
        }
        if (camera.width, camera.height) != (self.width, self.height) {
            return Err(RenderError::SurfaceMismatch {
                expected: (self.width, self.height),
                actual: (camera.width, camera.height),
            });
        }

        self.clear();
        let view_proj = camera.view_projection();

        let (mut translucent, mut opaque): (Vec<&RenderItem<'_>>, Vec<&RenderItem<'_>>) =
            items.iter().partition(|item| item.mesh.material.transparent);
        opaque.sort_by_key(|item| item.mesh.render_order);
        let mut translucent: Vec<_> = translucent
            .drain(..)
            .map(|item| (mean_depth(item, camera, &view_proj), item))
            .collect();
        translucent.sort_by(|(da, a), (db, b)| {
            a.mesh
                .render_order
                .cmp(&b.mesh.render_order)
                .then(db.total_cmp(da))
        });

        for item in opaque {
            self.draw(item, camera, &view_proj);
        }
        for (_, item) in translucent {
            self.draw(item, camera, &view_proj);
        }
        Ok(&self.color)
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.color = RgbaImage::new(0, 0);
            self.depth = Vec::new();
        }
    }
}
