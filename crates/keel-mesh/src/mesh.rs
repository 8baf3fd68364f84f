// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Triangle-source capabilities.
//!
//! The BVH never owns geometry; it reads triangles through these traits at
//! build and refit time and addresses them afterwards by `(part, index)`.

use keel_geom::{Aabb, Vec3};

/// Receiver for triangle enumeration during a mesh scan.
pub trait TriangleIndexCallback {
    /// Called once per triangle with its vertices and `(part, index)`
    /// address.
    fn process_triangle(&mut self, triangle: &[Vec3; 3], part: usize, index: usize);
}

impl<F: FnMut(&[Vec3; 3], usize, usize)> TriangleIndexCallback for F {
    fn process_triangle(&mut self, triangle: &[Vec3; 3], part: usize, index: usize) {
        self(triangle, part, index);
    }
}

/// A source of indexed triangles, organized in parts.
///
/// `(part, index)` addresses must be stable across calls: the BVH stores
/// them at build time and resolves them again during refit and query
/// narrowing.
pub trait TriangleMesh {
    /// Enumerates every triangle in every part.
    fn process_all_triangles(&self, callback: &mut dyn TriangleIndexCallback);

    /// Fetches one triangle by address.
    fn triangle(&self, part: usize, index: usize) -> [Vec3; 3];

    /// Brute-force bound over all vertices.
    fn compute_bounds(&self) -> Aabb {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        self.process_all_triangles(&mut |tri: &[Vec3; 3], _part: usize, _index: usize| {
            for v in tri {
                min = min.min(v);
                max = max.max(v);
            }
        });
        Aabb::new(min, max)
    }
}

struct SoupPart {
    vertices: Vec<Vec3>,
    triangles: Vec<[u32; 3]>,
}

/// Owned triangle storage implementing [`TriangleMesh`]. Suitable for tests
/// and applications without their own vertex buffers.
#[derive(Default)]
pub struct TriangleSoup {
    parts: Vec<SoupPart>,
}

impl TriangleSoup {
    /// Creates an empty soup.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a part and returns its index.
    pub fn add_part(&mut self, vertices: Vec<Vec3>, triangles: Vec<[u32; 3]>) -> usize {
        self.parts.push(SoupPart {
            vertices,
            triangles,
        });
        self.parts.len() - 1
    }

    /// Total triangle count across parts.
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.parts.iter().map(|p| p.triangles.len()).sum()
    }

    /// Mutable access to a part's vertices, for deforming meshes that will
    /// be refit.
    ///
    /// # Panics
    /// Panics if `part` is out of range.
    pub fn vertices_mut(&mut self, part: usize) -> &mut [Vec3] {
        &mut self.parts[part].vertices
    }
}

impl TriangleMesh for TriangleSoup {
    fn process_all_triangles(&self, callback: &mut dyn TriangleIndexCallback) {
        for (part_id, part) in self.parts.iter().enumerate() {
            for (tri_id, tri) in part.triangles.iter().enumerate() {
                let verts = [
                    part.vertices[tri[0] as usize],
                    part.vertices[tri[1] as usize],
                    part.vertices[tri[2] as usize],
                ];
                callback.process_triangle(&verts, part_id, tri_id);
            }
        }
    }

    fn triangle(&self, part: usize, index: usize) -> [Vec3; 3] {
        let p = &self.parts[part];
        let tri = p.triangles[index];
        [
            p.vertices[tri[0] as usize],
            p.vertices[tri[1] as usize],
            p.vertices[tri[2] as usize],
        ]
    }
}
