// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use crate::math::{Transform, Vec3};

/// Axis-aligned bounding box in world coordinates.
///
/// Invariants:
/// - `min` components are less than or equal to `max` components.
/// - Values are `f32` and represent meters in world space.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb {
    min: Vec3,
    max: Vec3,
}

impl Aabb {
    /// Constructs an AABB from its minimum and maximum corners.
    ///
    /// # Panics
    /// Panics if any component of `min` is greater than its counterpart in
    /// `max`.
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        let a = min.to_array();
        let b = max.to_array();
        assert!(
            a[0] <= b[0] && a[1] <= b[1] && a[2] <= b[2],
            "invalid AABB: min > max"
        );
        Self { min, max }
    }

    /// Returns the minimum corner.
    #[must_use]
    pub fn min(&self) -> Vec3 {
        self.min
    }

    /// Returns the maximum corner.
    #[must_use]
    pub fn max(&self) -> Vec3 {
        self.max
    }

    /// Builds an AABB centered at `center` with half-extents `extents`.
    #[must_use]
    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        Self::new(center.sub(&extents), center.add(&extents))
    }

    /// Builds an AABB centered at `center` with radius `r` on every axis.
    #[must_use]
    pub fn from_radius(center: Vec3, r: f32) -> Self {
        Self::from_center_extents(center, Vec3::splat(r))
    }

    /// Builds the minimal AABB that contains all `points`.
    ///
    /// # Panics
    /// Panics if `points` is empty.
    #[must_use]
    pub fn from_points(points: &[Vec3]) -> Self {
        assert!(!points.is_empty(), "from_points requires at least one point");
        let mut min = points[0];
        let mut max = points[0];
        for p in &points[1..] {
            min = min.min(p);
            max = max.max(p);
        }
        Self { min, max }
    }

    /// Center of the box.
    #[must_use]
    pub fn center(&self) -> Vec3 {
        self.min.add(&self.max).scale(0.5)
    }

    /// Full edge lengths of the box.
    #[must_use]
    pub fn lengths(&self) -> Vec3 {
        self.max.sub(&self.min)
    }

    /// Half-extents of the box.
    #[must_use]
    pub fn extents(&self) -> Vec3 {
        self.lengths().scale(0.5)
    }

    /// Returns the union of two AABBs.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(&other.min),
            max: self.max.max(&other.max),
        }
    }

    /// Returns `true` if `other` lies entirely inside this box (inclusive).
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        let a_min = self.min.to_array();
        let a_max = self.max.to_array();
        let b_min = other.min.to_array();
        let b_max = other.max.to_array();
        a_min[0] <= b_min[0]
            && a_min[1] <= b_min[1]
            && a_min[2] <= b_min[2]
            && a_max[0] >= b_max[0]
            && a_max[1] >= b_max[1]
            && a_max[2] >= b_max[2]
    }

    /// Returns `true` if this AABB overlaps another (inclusive on faces).
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let a_min = self.min.to_array();
        let a_max = self.max.to_array();
        let b_min = other.min.to_array();
        let b_max = other.max.to_array();
        // Inclusive to treat touching faces as overlap for broad-phase pairing.
        a_min[0] <= b_max[0]
            && a_max[0] >= b_min[0]
            && a_min[1] <= b_max[1]
            && a_max[1] >= b_min[1]
            && a_min[2] <= b_max[2]
            && a_max[2] >= b_min[2]
    }

    /// Returns `true` if `point` lies inside the box (inclusive).
    #[must_use]
    pub fn contains_point(&self, point: &Vec3) -> bool {
        let p = point.to_array();
        let mi = self.min.to_array();
        let ma = self.max.to_array();
        p[0] >= mi[0]
            && p[1] >= mi[1]
            && p[2] >= mi[2]
            && p[0] <= ma[0]
            && p[1] <= ma[1]
            && p[2] <= ma[2]
    }

    /// Separating-axis overlap test against `other` expressed in a different
    /// frame, with `rel` mapping `other`'s frame into this box's frame.
    ///
    /// Tests the axis joining the two box centers, which is cheap and catches
    /// the common miss case for cross-frame queries such as compound
    /// children. Conservative: may report overlap where a full SAT would not.
    #[must_use]
    pub fn overlaps_transformed(&self, other: &Self, rel: &Transform) -> bool {
        let d0 = rel.transform_point(&other.center()).sub(&self.center());
        let d1 = rel.basis.transpose_transform(&d0);

        let (a_lo, a_hi) = self.span(&d0, 0.0);
        let base = rel.origin.dot(&d0);
        let (b_lo, b_hi) = other.span(&d1, base);
        a_lo <= b_hi && a_hi >= b_lo
    }

    // Projection interval of the box onto `axis`, both endpoints seeded with
    // `base`.
    fn span(&self, axis: &Vec3, base: f32) -> (f32, f32) {
        let mut lo = base;
        let mut hi = base;
        for i in 0..3 {
            let d = axis.axis(i);
            if d < 0.0 {
                lo += self.max.axis(i) * d;
                hi += self.min.axis(i) * d;
            } else {
                lo += self.min.axis(i) * d;
                hi += self.max.axis(i) * d;
            }
        }
        (lo, hi)
    }

    /// L1 distance between the two boxes' center sums.
    ///
    /// A deliberately cheap surrogate for insertion cost: used only as a
    /// greedy tie-break when descending the dynamic tree, never as a global
    /// optimum.
    #[must_use]
    pub fn proximity(&self, other: &Self) -> f32 {
        let a = self.min.add(&self.max);
        let b = other.min.add(&other.max);
        a.sub(&b).abs().to_array().iter().sum()
    }

    /// Packs the signs of `v`'s components into 3 bits (bit set when the
    /// component is non-negative). Precompute once per plane or axis and
    /// reuse across many [`Self::classify`]/[`Self::project_minimum`] calls.
    #[must_use]
    pub fn sign_bits(v: &Vec3) -> usize {
        usize::from(v.x() >= 0.0)
            | (usize::from(v.y() >= 0.0) << 1)
            | (usize::from(v.z() >= 0.0) << 2)
    }

    /// Classifies the box against the half-space `normal · p + offset >= 0`.
    ///
    /// `signs` are the precomputed [`Self::sign_bits`] of `normal`; they
    /// select the near and far support corners without per-axis branches on
    /// the normal. Returns `-1` (fully outside), `+1` (fully inside) or `0`
    /// (straddling).
    #[must_use]
    pub fn classify(&self, normal: &Vec3, offset: f32, signs: usize) -> i8 {
        let mi = self.min.to_array();
        let ma = self.max.to_array();
        let mut far = [0.0f32; 3];
        let mut near = [0.0f32; 3];
        for i in 0..3 {
            if signs & (1 << i) != 0 {
                far[i] = ma[i];
                near[i] = mi[i];
            } else {
                far[i] = mi[i];
                near[i] = ma[i];
            }
        }
        if normal.dot(&Vec3::from(far)) + offset < 0.0 {
            return -1;
        }
        if normal.dot(&Vec3::from(near)) + offset >= 0.0 {
            return 1;
        }
        0
    }

    /// Minimum projection of the box onto `axis`, with `signs` the
    /// precomputed [`Self::sign_bits`] of `axis`. Used by ordered best-first
    /// traversal.
    #[must_use]
    pub fn project_minimum(&self, axis: &Vec3, signs: usize) -> f32 {
        let mi = self.min.to_array();
        let ma = self.max.to_array();
        let mut p = [0.0f32; 3];
        for i in 0..3 {
            p[i] = if signs & (1 << i) != 0 { mi[i] } else { ma[i] };
        }
        Vec3::from(p).dot(axis)
    }

    /// Grows the box symmetrically by `e` on every axis.
    #[must_use]
    pub fn expand(&self, e: &Vec3) -> Self {
        Self {
            min: self.min.sub(e),
            max: self.max.add(e),
        }
    }

    /// Grows the box along the direction of `e` only: positive components
    /// push `max` out, negative components push `min` out. Used for
    /// predictive broadphase margins along a velocity.
    #[must_use]
    pub fn signed_expand(&self, e: &Vec3) -> Self {
        let mut min = self.min.to_array();
        let mut max = self.max.to_array();
        for i in 0..3 {
            let v = e.axis(i);
            if v > 0.0 {
                max[i] += v;
            } else {
                min[i] += v;
            }
        }
        Self {
            min: Vec3::from(min),
            max: Vec3::from(max),
        }
    }

    /// Slab test against a ray given its origin, per-axis inverse direction
    /// and direction sign bits (`1` when the direction component is
    /// negative). Returns `true` when the ray enters the box at a positive
    /// parameter.
    #[must_use]
    pub fn ray_overlaps(&self, origin: &Vec3, inv_dir: &Vec3, signs: &[usize; 3]) -> bool {
        let bounds = [self.min.to_array(), self.max.to_array()];
        let org = origin.to_array();
        let inv = inv_dir.to_array();

        let mut tmin = (bounds[signs[0]][0] - org[0]) * inv[0];
        let mut tmax = (bounds[1 - signs[0]][0] - org[0]) * inv[0];
        let tymin = (bounds[signs[1]][1] - org[1]) * inv[1];
        let tymax = (bounds[1 - signs[1]][1] - org[1]) * inv[1];
        if tmin > tymax || tymin > tmax {
            return false;
        }
        if tymin > tmin {
            tmin = tymin;
        }
        if tymax < tmax {
            tmax = tymax;
        }
        let tzmin = (bounds[signs[2]][2] - org[2]) * inv[2];
        let tzmax = (bounds[1 - signs[2]][2] - org[2]) * inv[2];
        if tmin > tzmax || tzmin > tmax {
            return false;
        }
        if tzmax < tmax {
            tmax = tzmax;
        }
        tmax > 0.0
    }

    /// Exact segment-vs-box test from `from` to `to`. Returns the entry
    /// fraction in `[0, 1]` when the segment reaches the box.
    #[must_use]
    pub fn segment_hits(&self, from: &Vec3, to: &Vec3) -> Option<f32> {
        let dir = to.sub(from);
        let mi = self.min.to_array();
        let ma = self.max.to_array();
        let o = from.to_array();
        let d = dir.to_array();

        let mut t_enter = 0.0f32;
        let mut t_exit = 1.0f32;
        for i in 0..3 {
            if d[i].abs() < f32::EPSILON {
                if o[i] < mi[i] || o[i] > ma[i] {
                    return None;
                }
            } else {
                let inv = 1.0 / d[i];
                let mut t0 = (mi[i] - o[i]) * inv;
                let mut t1 = (ma[i] - o[i]) * inv;
                if t0 > t1 {
                    core::mem::swap(&mut t0, &mut t1);
                }
                t_enter = t_enter.max(t0);
                t_exit = t_exit.min(t1);
                if t_enter > t_exit {
                    return None;
                }
            }
        }
        Some(t_enter)
    }
}
