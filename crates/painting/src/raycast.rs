//! Mesh geometry and ray/UV queries used by the software ray tracer
//!
//! Ray-triangle tests use Moller-Trumbore. Painting also needs the inverse
//! lookup (which surface point carries a given UV), done with 2D barycentrics
//! in texture space.

use glam::{Vec2, Vec3};

use crate::error::{PaintError, PaintResult};

/// Epsilon for floating point comparisons in ray intersection
const EPSILON: f32 = 1e-6;

/// Tolerance for UV-space containment so shared triangle edges leave no gaps
const UV_EPSILON: f32 = 1e-5;

/// Result of a ray-triangle intersection test
#[derive(Debug, Clone, Copy)]
pub struct TriangleHit {
    /// Distance along the ray to the intersection point
    pub t: f32,
    /// Barycentric coordinate u (weight for vertex 1)
    pub u: f32,
    /// Barycentric coordinate v (weight for vertex 2)
    pub v: f32,
}

/// Moller-Trumbore ray-triangle intersection.
///
/// Returns the hit distance and barycentric coordinates if the ray hits the
/// triangle in front of its origin.
pub fn ray_triangle_intersection(
    ray_origin: Vec3,
    ray_dir: Vec3,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
) -> Option<TriangleHit> {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;

    let pvec = ray_dir.cross(edge2);
    let det = edge1.dot(pvec);

    // Ray parallel to the triangle plane
    if det.abs() < EPSILON {
        return None;
    }

    let inv_det = 1.0 / det;
    let tvec = ray_origin - v0;

    let u = tvec.dot(pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let qvec = tvec.cross(edge1);
    let v = ray_dir.dot(qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = edge2.dot(qvec) * inv_det;
    if t < EPSILON {
        return None;
    }

    Some(TriangleHit { t, u, v })
}

/// Barycentric `(u, v)` of `p` in the 2D triangle `(a, b, c)`, `None` if outside
pub fn uv_barycentric(p: Vec2, a: Vec2, b: Vec2, c: Vec2) -> Option<(f32, f32)> {
    let e1 = b - a;
    let e2 = c - a;
    let det = e1.perp_dot(e2);
    if det.abs() < EPSILON * EPSILON {
        return None;
    }
    let d = p - a;
    let u = d.perp_dot(e2) / det;
    let v = e1.perp_dot(d) / det;
    (u >= -UV_EPSILON && v >= -UV_EPSILON && u + v <= 1.0 + UV_EPSILON).then_some((u, v))
}

/// Interpolate a Vec3 attribute using barycentric coordinates.
pub fn interpolate_vec3(v0: Vec3, v1: Vec3, v2: Vec3, u: f32, v: f32) -> Vec3 {
    let w = 1.0 - u - v;
    v0 * w + v1 * u + v2 * v
}

/// Interpolate a Vec2 attribute (like UVs) using barycentric coordinates.
pub fn interpolate_vec2(v0: Vec2, v1: Vec2, v2: Vec2, u: f32, v: f32) -> Vec2 {
    let w = 1.0 - u - v;
    v0 * w + v1 * u + v2 * v
}

/// A point on the mesh surface with interpolated attributes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfacePoint {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub face_id: u32,
}

/// Closest hit of a ray against the mesh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceHit {
    /// Distance along the ray
    pub t: f32,
    pub point: SurfacePoint,
}

/// Triangle mesh with per-vertex normals and UVs, in model space
#[derive(Debug, Clone, PartialEq)]
pub struct MeshGeometry {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    uvs: Vec<Vec2>,
    /// Triangle indices (3 per triangle)
    indices: Vec<u32>,
}

impl MeshGeometry {
    /// Build a mesh, checking attribute counts and index bounds
    pub fn new(
        positions: Vec<Vec3>,
        normals: Vec<Vec3>,
        uvs: Vec<Vec2>,
        indices: Vec<u32>,
    ) -> PaintResult<Self> {
        if positions.is_empty() || indices.is_empty() {
            return Err(PaintError::InvalidMesh("mesh has no triangles".to_string()));
        }
        if indices.len() % 3 != 0 {
            return Err(PaintError::InvalidMesh(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if normals.len() != positions.len() || uvs.len() != positions.len() {
            return Err(PaintError::InvalidMesh(format!(
                "{} positions, {} normals, {} uvs",
                positions.len(),
                normals.len(),
                uvs.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= positions.len()) {
            return Err(PaintError::InvalidMesh(format!(
                "index {bad} out of range for {} vertices",
                positions.len()
            )));
        }
        Ok(Self {
            positions,
            normals,
            uvs,
            indices,
        })
    }

    /// Square in the XY plane facing +Z, centered at the origin, UVs covering `[0, 1]`
    pub fn plane(size: f32) -> Self {
        let h = size * 0.5;
        Self {
            positions: vec![
                Vec3::new(-h, -h, 0.0),
                Vec3::new(h, -h, 0.0),
                Vec3::new(h, h, 0.0),
                Vec3::new(-h, h, 0.0),
            ],
            normals: vec![Vec3::Z; 4],
            uvs: vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(1.0, 0.0),
                Vec2::new(1.0, 1.0),
                Vec2::new(0.0, 1.0),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Get the vertex indices for a triangle
    pub fn triangle_indices(&self, tri_index: usize) -> [usize; 3] {
        let base = tri_index * 3;
        [
            self.indices[base] as usize,
            self.indices[base + 1] as usize,
            self.indices[base + 2] as usize,
        ]
    }

    pub fn triangle_positions(&self, tri_index: usize) -> [Vec3; 3] {
        self.triangle_indices(tri_index).map(|i| self.positions[i])
    }

    pub fn triangle_uvs(&self, tri_index: usize) -> [Vec2; 3] {
        self.triangle_indices(tri_index).map(|i| self.uvs[i])
    }

    /// Bounding box of all UVs as `(min, max)`
    pub fn uv_bounds(&self) -> (Vec2, Vec2) {
        self.uvs.iter().fold(
            (Vec2::splat(f32::MAX), Vec2::splat(f32::MIN)),
            |(min, max), uv| (min.min(*uv), max.max(*uv)),
        )
    }

    /// Triangles whose UV bounding box overlaps `[min, max]`
    pub fn triangles_in_uv_rect(&self, min: Vec2, max: Vec2) -> Vec<usize> {
        (0..self.triangle_count())
            .filter(|&tri| {
                let [a, b, c] = self.triangle_uvs(tri);
                let lo = a.min(b).min(c);
                let hi = a.max(b).max(c);
                lo.x <= max.x && hi.x >= min.x && lo.y <= max.y && hi.y >= min.y
            })
            .collect()
    }

    /// Surface point carrying `uv`, searching only `candidates`
    pub fn surface_at_uv(&self, uv: Vec2, candidates: &[usize]) -> Option<SurfacePoint> {
        candidates.iter().find_map(|&tri| {
            let [a, b, c] = self.triangle_uvs(tri);
            uv_barycentric(uv, a, b, c).map(|(u, v)| self.point_on(tri, u, v))
        })
    }

    /// Surface point at barycentric `(u, v)` of triangle `tri`
    pub fn point_on(&self, tri: usize, u: f32, v: f32) -> SurfacePoint {
        let [i0, i1, i2] = self.triangle_indices(tri);
        let position = interpolate_vec3(self.positions[i0], self.positions[i1], self.positions[i2], u, v);
        let normal = interpolate_vec3(self.normals[i0], self.normals[i1], self.normals[i2], u, v)
            .normalize_or_zero();
        let uv = interpolate_vec2(self.uvs[i0], self.uvs[i1], self.uvs[i2], u, v);
        SurfacePoint {
            position,
            normal,
            uv,
            face_id: tri as u32,
        }
    }

    /// Closest hit along the ray within `t_max`
    pub fn raycast(&self, ray_origin: Vec3, ray_dir: Vec3, t_max: f32) -> Option<SurfaceHit> {
        let mut closest: Option<(TriangleHit, usize)> = None;

        // Brute force over all triangles
        for tri in 0..self.triangle_count() {
            let [v0, v1, v2] = self.triangle_positions(tri);
            if let Some(hit) = ray_triangle_intersection(ray_origin, ray_dir, v0, v1, v2) {
                let better = hit.t < t_max && closest.is_none_or(|(prev, _)| hit.t < prev.t);
                if better {
                    closest = Some((hit, tri));
                }
            }
        }

        closest.map(|(hit, tri)| SurfaceHit {
            t: hit.t,
            point: self.point_on(tri, hit.u, hit.v),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_triangle_hit() {
        let v0 = Vec3::new(0.0, 0.0, 0.0);
        let v1 = Vec3::new(1.0, 0.0, 0.0);
        let v2 = Vec3::new(0.0, 1.0, 0.0);

        let hit = ray_triangle_intersection(Vec3::new(0.25, 0.25, 1.0), Vec3::NEG_Z, v0, v1, v2).unwrap();
        assert!((hit.t - 1.0).abs() < EPSILON);
        assert!((hit.u - 0.25).abs() < EPSILON);
        assert!((hit.v - 0.25).abs() < EPSILON);
    }

    #[test]
    fn test_ray_triangle_miss_and_behind() {
        let v0 = Vec3::new(0.0, 0.0, 0.0);
        let v1 = Vec3::new(1.0, 0.0, 0.0);
        let v2 = Vec3::new(0.0, 1.0, 0.0);

        assert!(ray_triangle_intersection(Vec3::new(2.0, 2.0, 1.0), Vec3::NEG_Z, v0, v1, v2).is_none());
        assert!(ray_triangle_intersection(Vec3::new(0.25, 0.25, 1.0), Vec3::Z, v0, v1, v2).is_none());
    }

    #[test]
    fn test_interpolate_vec2() {
        let v0 = Vec2::new(0.0, 0.0);
        let v1 = Vec2::new(1.0, 0.0);
        let v2 = Vec2::new(0.0, 1.0);

        assert!((interpolate_vec2(v0, v1, v2, 1.0, 0.0) - v1).length() < EPSILON);
        assert!((interpolate_vec2(v0, v1, v2, 0.0, 1.0) - v2).length() < EPSILON);
        let center = (v0 + v1 + v2) / 3.0;
        assert!((interpolate_vec2(v0, v1, v2, 1.0 / 3.0, 1.0 / 3.0) - center).length() < EPSILON);
    }

    #[test]
    fn test_plane_raycast_uv() {
        let plane = MeshGeometry::plane(2.0);
        let hit = plane.raycast(Vec3::new(0.5, -0.5, 3.0), Vec3::NEG_Z, f32::MAX).unwrap();
        assert!((hit.t - 3.0).abs() < 1e-4);
        assert!((hit.point.uv - Vec2::new(0.75, 0.25)).length() < 1e-4);
        assert!((hit.point.normal - Vec3::Z).length() < 1e-4);

        // Beyond t_max
        assert!(plane.raycast(Vec3::new(0.0, 0.0, 3.0), Vec3::NEG_Z, 2.0).is_none());
    }

    #[test]
    fn test_surface_at_uv() {
        let plane = MeshGeometry::plane(2.0);
        let all: Vec<usize> = (0..plane.triangle_count()).collect();
        let point = plane.surface_at_uv(Vec2::new(0.5, 0.5), &all).unwrap();
        assert!(point.position.length() < 1e-4);
        assert!(plane.surface_at_uv(Vec2::new(1.5, 0.5), &all).is_none());
    }

    #[test]
    fn test_uv_bounds_and_candidates() {
        let plane = MeshGeometry::plane(1.0);
        assert_eq!(plane.uv_bounds(), (Vec2::ZERO, Vec2::ONE));
        assert_eq!(plane.triangles_in_uv_rect(Vec2::splat(2.0), Vec2::splat(3.0)).len(), 0);
        assert_eq!(plane.triangles_in_uv_rect(Vec2::splat(0.4), Vec2::splat(0.6)).len(), 2);
    }

    #[test]
    fn test_new_rejects_bad_indices() {
        let plane = MeshGeometry::plane(1.0);
        let result = MeshGeometry::new(
            plane.positions.clone(),
            plane.normals.clone(),
            plane.uvs.clone(),
            vec![0, 1, 9],
        );
        assert!(matches!(result, Err(PaintError::InvalidMesh(_))));
    }
}
