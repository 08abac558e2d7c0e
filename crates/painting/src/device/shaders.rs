//! Software shader programs run by [`CpuDevice`](super::CpuDevice)
//!
//! Programs are dispatched through the shader binding table: the raygen
//! record picks the entry point and trace calls name miss and hit records by
//! index, so a table with groups out of order changes what the trace does.

use glam::{Mat4, Vec2, Vec3, Vec3Swizzles, Vec4, Vec4Swizzles};

use super::cpu::CpuTexture;
use super::{DeviceError, DeviceResult, PushConstants, ShaderProgram, Uniforms};
use crate::blend;
use crate::constants::{AMBIENT_LIGHT, BASE_ALBEDO, MISS_OCCLUSION, MISS_PRIMARY};
use crate::raycast::{MeshGeometry, SurfaceHit, SurfacePoint};
use crate::types::Region;

/// Offset applied along the normal before tracing secondary rays
const RAY_BIAS: f32 = 1e-3;

/// Programs resolved from a binding table, indexed like the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ResolvedSbt {
    pub raygen: ShaderProgram,
    pub miss: Vec<ShaderProgram>,
    pub hit: Vec<ShaderProgram>,
}

/// Ray payload after the miss or closest-hit program ran
#[derive(Debug, Clone, Copy)]
enum Payload {
    /// Primary miss: nothing under the ray
    Miss,
    /// Occlusion miss: nothing between origin and target
    Visible,
    Surface(SurfaceHit),
}

/// Matrices unpacked from the uniform block
struct Transforms {
    model: Mat4,
    model_inv: Mat4,
    view: Mat4,
    proj: Mat4,
    view_inv: Mat4,
    proj_inv: Mat4,
}

impl Transforms {
    fn new(uniforms: &Uniforms) -> Self {
        let m = &uniforms.matrices;
        let model = Mat4::from_cols_array_2d(&m.model);
        Self {
            model,
            model_inv: model.inverse(),
            view: Mat4::from_cols_array_2d(&m.view),
            proj: Mat4::from_cols_array_2d(&m.proj),
            view_inv: Mat4::from_cols_array_2d(&m.view_inv),
            proj_inv: Mat4::from_cols_array_2d(&m.proj_inv),
        }
    }

    /// Camera position in model space
    fn eye_model(&self) -> Vec3 {
        let eye = self.view_inv.transform_point3(Vec3::ZERO);
        self.model_inv.transform_point3(eye)
    }

    /// Depth in `[0, 1]` of a model-space point
    fn depth_of(&self, point: Vec3) -> f32 {
        let clip = self.proj * self.view * self.model * point.extend(1.0);
        if clip.w.abs() < f32::EPSILON { 1.0 } else { (clip.z / clip.w).clamp(0.0, 1.0) }
    }
}

pub(super) struct Tracer<'a> {
    geometry: &'a MeshGeometry,
    sbt: &'a ResolvedSbt,
    rays: u64,
}

impl<'a> Tracer<'a> {
    pub fn new(geometry: &'a MeshGeometry, sbt: &'a ResolvedSbt) -> Self {
        Self { geometry, sbt, rays: 0 }
    }

    pub fn rays(&self) -> u64 {
        self.rays
    }

    fn trace(&mut self, origin: Vec3, dir: Vec3, t_max: f32, miss_index: u32, hit_index: u32) -> DeviceResult<Payload> {
        self.rays += 1;
        match self.geometry.raycast(origin, dir, t_max) {
            Some(hit) => self.closest_hit(hit_index, hit),
            None => self.miss(miss_index),
        }
    }

    /// Surface point at `uv` resolved through the hit/miss programs
    fn lookup_uv(&mut self, uv: Vec2, candidates: &[usize]) -> DeviceResult<Option<SurfacePoint>> {
        let payload = match self.geometry.surface_at_uv(uv, candidates) {
            Some(point) => self.closest_hit(0, SurfaceHit { t: 0.0, point })?,
            None => self.miss(MISS_PRIMARY)?,
        };
        Ok(match payload {
            Payload::Surface(hit) => Some(hit.point),
            Payload::Miss | Payload::Visible => None,
        })
    }

    fn miss(&self, index: u32) -> DeviceResult<Payload> {
        match self.sbt.miss.get(index as usize) {
            Some(ShaderProgram::PrimaryMiss) => Ok(Payload::Miss),
            Some(ShaderProgram::OcclusionMiss) => Ok(Payload::Visible),
            Some(other) => Err(DeviceError::ShaderBindingTable(format!(
                "{other:?} bound as miss {index}"
            ))),
            None => Err(DeviceError::ShaderBindingTable(format!(
                "miss index {index} outside {} records",
                self.sbt.miss.len()
            ))),
        }
    }

    fn closest_hit(&self, index: u32, hit: SurfaceHit) -> DeviceResult<Payload> {
        match self.sbt.hit.get(index as usize) {
            Some(ShaderProgram::SurfaceClosestHit) => Ok(Payload::Surface(hit)),
            Some(other) => Err(DeviceError::ShaderBindingTable(format!(
                "{other:?} bound as hit {index}"
            ))),
            None => Err(DeviceError::ShaderBindingTable(format!(
                "hit index {index} outside {} records",
                self.sbt.hit.len()
            ))),
        }
    }
}

/// Paint raygen: blend the brush into `target` over the `launch` texels
pub(super) fn paint_raygen(
    tracer: &mut Tracer<'_>,
    target: &mut CpuTexture,
    launch: Region,
    uniforms: &Uniforms,
    occlusion_test: bool,
) -> DeviceResult<u64> {
    let brush = &uniforms.brush;
    let transforms = Transforms::new(uniforms);
    let eye = transforms.eye_model();
    let center = brush.center();
    let color = [brush.r, brush.g, brush.b];
    let mode = brush.mode();
    let (width, height) = (target.desc.width as f32, target.desc.height as f32);

    let reach = Vec2::splat(brush.radius);
    let candidates = tracer.geometry.triangles_in_uv_rect(center - reach, center + reach);

    let mut written = 0;
    for y in launch.y..launch.bottom() {
        for x in launch.x..launch.right() {
            let uv = Vec2::new((x as f32 + 0.5) / width, (y as f32 + 0.5) / height);
            let weight = blend::falloff(uv.distance(center), brush.radius, brush.falloff);
            if weight <= 0.0 {
                continue;
            }
            let Some(point) = tracer.lookup_uv(uv, &candidates)? else {
                continue;
            };
            if occlusion_test {
                let to_point = point.position - eye;
                let distance = to_point.length();
                if distance > RAY_BIAS {
                    let dir = to_point / distance;
                    let visibility = tracer.trace(eye, dir, distance - RAY_BIAS, MISS_OCCLUSION, 0)?;
                    if !matches!(visibility, Payload::Visible) {
                        continue;
                    }
                }
            }
            if let Some(texel) = target.texel_mut(x, y) {
                blend::blend_texel(texel, color, brush.opacity * weight, mode);
                written += 1;
            }
        }
    }
    Ok(written)
}

/// Lambert-shaded color of a surface point, paint composited over the base albedo
fn shade(
    point: &SurfacePoint,
    paint: Option<&CpuTexture>,
    push: &PushConstants,
    transforms: &Transforms,
    lit: bool,
) -> [f32; 4] {
    let paint = paint.map(|t| blend::unpack(t.sample(point.uv))).unwrap_or([0.0; 4]);
    let albedo = Vec3::from(BASE_ALBEDO).lerp(Vec3::new(paint[0], paint[1], paint[2]), paint[3]);

    let normal = transforms.model.transform_vector3(point.normal).normalize_or_zero();
    let light = Vec3::from(push.light_dir).normalize_or_zero();
    let lambert = if lit { normal.dot(light).max(0.0) } else { 0.0 };
    let rgb = albedo * (AMBIENT_LIGHT + push.light_intensity * lambert);
    [rgb.x, rgb.y, rgb.z, 1.0]
}

/// View raygen: one camera ray per pixel into `color` and `depth`
pub(super) fn view_raygen(
    tracer: &mut Tracer<'_>,
    color: &mut CpuTexture,
    depth: &mut CpuTexture,
    paint: Option<&CpuTexture>,
    uniforms: &Uniforms,
    push: &PushConstants,
) -> DeviceResult<()> {
    let transforms = Transforms::new(uniforms);
    let eye = transforms.eye_model();
    let light_model = transforms
        .model_inv
        .transform_vector3(Vec3::from(push.light_dir))
        .normalize_or_zero();
    let clear = blend::pack(push.clear_color);
    let (width, height) = (color.desc.width, color.desc.height);

    for y in 0..height {
        for x in 0..width {
            let ndc = Vec2::new(
                (x as f32 + 0.5) / width as f32 * 2.0 - 1.0,
                1.0 - (y as f32 + 0.5) / height as f32 * 2.0,
            );
            let far = transforms.proj_inv * Vec4::new(ndc.x, ndc.y, 1.0, 1.0);
            let far_world = transforms.view_inv.transform_point3(far.xyz() / far.w);
            let dir = (transforms.model_inv.transform_point3(far_world) - eye).normalize_or_zero();

            let (texel, z) = match tracer.trace(eye, dir, f32::MAX, MISS_PRIMARY, 0)? {
                Payload::Surface(hit) => {
                    let p = hit.point;
                    let facing = p.normal.dot(light_model) > 0.0;
                    let lit = facing
                        && matches!(
                            tracer.trace(p.position + p.normal * RAY_BIAS, light_model, f32::MAX, MISS_OCCLUSION, 0)?,
                            Payload::Visible
                        );
                    let rgba = shade(&p, paint, push, &transforms, lit);
                    (blend::pack(rgba), transforms.depth_of(p.position))
                }
                Payload::Miss | Payload::Visible => (clear, 1.0),
            };
            if let Some(out) = color.texel_mut(x, y) {
                *out = texel;
            }
            if let Some(out) = depth.texel_mut(x, y) {
                *out = z.to_le_bytes();
            }
        }
    }
    Ok(())
}

/// Raster pass: depth-tested triangles, perspective-correct attributes
pub(super) fn rasterize(
    geometry: &MeshGeometry,
    color: &mut CpuTexture,
    depth: &mut CpuTexture,
    paint: Option<&CpuTexture>,
    uniforms: &Uniforms,
    push: &PushConstants,
) {
    let transforms = Transforms::new(uniforms);
    let mvp = transforms.proj * transforms.view * transforms.model;
    let (width, height) = (color.desc.width as f32, color.desc.height as f32);

    for tri in 0..geometry.triangle_count() {
        let positions = geometry.triangle_positions(tri);
        let clip = positions.map(|p| mvp * p.extend(1.0));
        // Triangles crossing the camera plane are dropped, not clipped
        if clip.iter().any(|c| c.w <= f32::EPSILON) {
            continue;
        }
        let screen = clip.map(|c| {
            let ndc = c.xyz() / c.w;
            Vec3::new((ndc.x + 1.0) * 0.5 * width, (1.0 - ndc.y) * 0.5 * height, ndc.z)
        });
        let area = edge(screen[0].xy(), screen[1].xy(), screen[2].xy());
        if area.abs() < f32::EPSILON {
            continue;
        }

        let lo = screen[0].min(screen[1]).min(screen[2]);
        let hi = screen[0].max(screen[1]).max(screen[2]);
        let x0 = lo.x.floor().max(0.0) as u32;
        let y0 = lo.y.floor().max(0.0) as u32;
        let x1 = (hi.x.ceil().min(width)).max(0.0) as u32;
        let y1 = (hi.y.ceil().min(height)).max(0.0) as u32;

        let inv_w = clip.map(|c| 1.0 / c.w);

        for y in y0..y1 {
            for x in x0..x1 {
                let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                let w0 = edge(screen[1].xy(), screen[2].xy(), p) / area;
                let w1 = edge(screen[2].xy(), screen[0].xy(), p) / area;
                let w2 = 1.0 - w0 - w1;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }
                let z = w0 * screen[0].z + w1 * screen[1].z + w2 * screen[2].z;
                if !(0.0..=1.0).contains(&z) || z >= depth.depth_at(x, y) {
                    continue;
                }

                // Perspective-correct barycentrics
                let denom = w0 * inv_w[0] + w1 * inv_w[1] + w2 * inv_w[2];
                let (u, v) = (w1 * inv_w[1] / denom, w2 * inv_w[2] / denom);
                let point = geometry.point_on(tri, u, v);
                let rgba = shade(&point, paint, push, &transforms, true);
                if let Some(out) = color.texel_mut(x, y) {
                    *out = blend::pack(rgba);
                }
                if let Some(out) = depth.texel_mut(x, y) {
                    *out = z.to_le_bytes();
                }
            }
        }
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b - a).perp_dot(p - a)
}

/// Nearest-neighbour blit of `source` onto `target`
pub(super) fn post(source: &CpuTexture, target: &mut CpuTexture) {
    let (tw, th) = (target.desc.width, target.desc.height);
    for y in 0..th {
        for x in 0..tw {
            let uv = Vec2::new((x as f32 + 0.5) / tw as f32, (y as f32 + 0.5) / th as f32);
            let texel = source.sample(uv);
            if let Some(out) = target.texel_mut(x, y) {
                *out = texel;
            }
        }
    }
}
