// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic math helpers: vectors, 3x3 bases, and rigid transforms.
//!
//! The API intentionally rounds everything to `f32` to keep behaviour
//! identical across environments. Types are array-backed value types; no
//! operation allocates.

const EPSILON: f32 = 1e-6;

/// 3D vector with deterministic float32 operations.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vec3 {
    data: [f32; 3],
}

impl Vec3 {
    /// The zero vector.
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    /// Creates a vector from components.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { data: [x, y, z] }
    }

    /// Creates a vector with all components equal to `v`.
    #[must_use]
    pub const fn splat(v: f32) -> Self {
        Self::new(v, v, v)
    }

    /// Returns the components as an array.
    #[must_use]
    pub fn to_array(self) -> [f32; 3] {
        self.data
    }

    /// Returns the component on `axis` (0 = x, 1 = y, 2 = z).
    ///
    /// # Panics
    /// Panics if `axis >= 3`.
    #[must_use]
    pub fn axis(&self, axis: usize) -> f32 {
        self.data[axis]
    }

    /// X component.
    #[must_use]
    pub fn x(&self) -> f32 {
        self.data[0]
    }

    /// Y component.
    #[must_use]
    pub fn y(&self) -> f32 {
        self.data[1]
    }

    /// Z component.
    #[must_use]
    pub fn z(&self) -> f32 {
        self.data[2]
    }

    /// Adds two vectors.
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        Self::new(
            self.data[0] + other.data[0],
            self.data[1] + other.data[1],
            self.data[2] + other.data[2],
        )
    }

    /// Subtracts another vector.
    #[must_use]
    pub fn sub(&self, other: &Self) -> Self {
        Self::new(
            self.data[0] - other.data[0],
            self.data[1] - other.data[1],
            self.data[2] - other.data[2],
        )
    }

    /// Scales the vector by a scalar.
    #[must_use]
    pub fn scale(&self, scalar: f32) -> Self {
        Self::new(
            self.data[0] * scalar,
            self.data[1] * scalar,
            self.data[2] * scalar,
        )
    }

    /// Componentwise product.
    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        Self::new(
            self.data[0] * other.data[0],
            self.data[1] * other.data[1],
            self.data[2] * other.data[2],
        )
    }

    /// Dot product with another vector.
    #[must_use]
    pub fn dot(&self, other: &Self) -> f32 {
        self.data[0] * other.data[0]
            + self.data[1] * other.data[1]
            + self.data[2] * other.data[2]
    }

    /// Cross product with another vector.
    #[must_use]
    pub fn cross(&self, other: &Self) -> Self {
        let [ax, ay, az] = self.data;
        let [bx, by, bz] = other.data;
        Self::new(ay * bz - az * by, az * bx - ax * bz, ax * by - ay * bx)
    }

    /// Componentwise minimum.
    #[must_use]
    pub fn min(&self, other: &Self) -> Self {
        Self::new(
            self.data[0].min(other.data[0]),
            self.data[1].min(other.data[1]),
            self.data[2].min(other.data[2]),
        )
    }

    /// Componentwise maximum.
    #[must_use]
    pub fn max(&self, other: &Self) -> Self {
        Self::new(
            self.data[0].max(other.data[0]),
            self.data[1].max(other.data[1]),
            self.data[2].max(other.data[2]),
        )
    }

    /// Componentwise absolute value.
    #[must_use]
    pub fn abs(&self) -> Self {
        Self::new(self.data[0].abs(), self.data[1].abs(), self.data[2].abs())
    }

    /// Squared vector length.
    #[must_use]
    pub fn length_squared(&self) -> f32 {
        self.dot(self)
    }

    /// Vector length (magnitude).
    #[must_use]
    pub fn length(&self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Normalises the vector, returning the zero vector if length is ~0.
    #[must_use]
    pub fn normalize(&self) -> Self {
        let len = self.length();
        if len.abs() <= EPSILON {
            return Self::ZERO;
        }
        self.scale(1.0 / len)
    }

    /// Returns `true` if every component is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.data[0].is_finite() && self.data[1].is_finite() && self.data[2].is_finite()
    }

    /// Index of the component with the largest value.
    #[must_use]
    pub fn max_axis(&self) -> usize {
        let mut best = 0;
        if self.data[1] > self.data[best] {
            best = 1;
        }
        if self.data[2] > self.data[best] {
            best = 2;
        }
        best
    }
}

impl From<[f32; 3]> for Vec3 {
    fn from(value: [f32; 3]) -> Self {
        Self { data: value }
    }
}

/// Row-major 3x3 matrix used as a rotation basis.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mat3 {
    rows: [[f32; 3]; 3],
}

impl Mat3 {
    /// The identity basis.
    pub const IDENTITY: Self = Self {
        rows: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    /// Builds a matrix from three rows.
    #[must_use]
    pub const fn from_rows(rows: [[f32; 3]; 3]) -> Self {
        Self { rows }
    }

    /// Returns row `i` as a vector.
    ///
    /// # Panics
    /// Panics if `i >= 3`.
    #[must_use]
    pub fn row(&self, i: usize) -> Vec3 {
        Vec3::from(self.rows[i])
    }

    /// Rotation of `angle` radians about the (normalised) `axis`.
    #[must_use]
    pub fn from_axis_angle(axis: &Vec3, angle: f32) -> Self {
        let n = axis.normalize();
        let [x, y, z] = n.to_array();
        let (s, c) = angle.sin_cos();
        let t = 1.0 - c;
        Self::from_rows([
            [t * x * x + c, t * x * y - s * z, t * x * z + s * y],
            [t * x * y + s * z, t * y * y + c, t * y * z - s * x],
            [t * x * z - s * y, t * y * z + s * x, t * z * z + c],
        ])
    }

    /// Applies the basis to a vector (`M * v`).
    #[must_use]
    pub fn transform(&self, v: &Vec3) -> Vec3 {
        Vec3::new(
            self.row(0).dot(v),
            self.row(1).dot(v),
            self.row(2).dot(v),
        )
    }

    /// Applies the transposed basis to a vector (`M^T * v`).
    ///
    /// For a pure rotation this is the inverse rotation.
    #[must_use]
    pub fn transpose_transform(&self, v: &Vec3) -> Vec3 {
        let [vx, vy, vz] = v.to_array();
        Vec3::new(
            self.rows[0][0] * vx + self.rows[1][0] * vy + self.rows[2][0] * vz,
            self.rows[0][1] * vx + self.rows[1][1] * vy + self.rows[2][1] * vz,
            self.rows[0][2] * vx + self.rows[1][2] * vy + self.rows[2][2] * vz,
        )
    }

    /// Matrix product `self * other`.
    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        let mut rows = [[0.0; 3]; 3];
        for (i, row) in rows.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = self.rows[i][0] * other.rows[0][j]
                    + self.rows[i][1] * other.rows[1][j]
                    + self.rows[i][2] * other.rows[2][j];
            }
        }
        Self { rows }
    }

    /// Returns the transpose.
    #[must_use]
    pub fn transposed(&self) -> Self {
        let mut rows = [[0.0; 3]; 3];
        for (i, row) in rows.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = self.rows[j][i];
            }
        }
        Self { rows }
    }
}

/// Rigid transform: rotation basis plus translation.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transform {
    /// Rotation part.
    pub basis: Mat3,
    /// Translation part.
    pub origin: Vec3,
}

impl Transform {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        basis: Mat3::IDENTITY,
        origin: Vec3::ZERO,
    };

    /// Creates a transform from a basis and origin.
    #[must_use]
    pub const fn new(basis: Mat3, origin: Vec3) -> Self {
        Self { basis, origin }
    }

    /// Applies the transform to a point.
    #[must_use]
    pub fn transform_point(&self, p: &Vec3) -> Vec3 {
        self.basis.transform(p).add(&self.origin)
    }

    /// Returns the inverse transform.
    ///
    /// Assumes `basis` is a rotation (orthonormal), so the inverse basis is
    /// the transpose.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let inv_basis = self.basis.transposed();
        let inv_origin = inv_basis.transform(&self.origin).scale(-1.0);
        Self::new(inv_basis, inv_origin)
    }

    /// Composition `self * other` (apply `other` first).
    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        Self::new(
            self.basis.mul(&other.basis),
            self.transform_point(&other.origin),
        )
    }

    /// Relative transform `self⁻¹ * other`, mapping `other`'s frame into
    /// `self`'s frame.
    #[must_use]
    pub fn inverse_times(&self, other: &Self) -> Self {
        self.inverse().mul(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_follows_right_hand_rule() {
        let x = Vec3::new(1.0, 0.0, 0.0);
        let y = Vec3::new(0.0, 1.0, 0.0);
        assert_eq!(x.cross(&y), Vec3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn axis_angle_quarter_turn_about_z() {
        let r = Mat3::from_axis_angle(&Vec3::new(0.0, 0.0, 1.0), core::f32::consts::FRAC_PI_2);
        let v = r.transform(&Vec3::new(1.0, 0.0, 0.0));
        let [x, y, z] = v.to_array();
        assert!((x - 0.0).abs() < 1e-6 && (y - 1.0).abs() < 1e-6 && z.abs() < 1e-6);
    }

    #[test]
    fn inverse_round_trips_points() {
        let t = Transform::new(
            Mat3::from_axis_angle(&Vec3::new(0.0, 1.0, 0.0), 0.7),
            Vec3::new(3.0, -2.0, 5.0),
        );
        let p = Vec3::new(1.0, 2.0, 3.0);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        let d = back.sub(&p);
        assert!(d.length() < 1e-5);
    }

    #[test]
    fn transpose_transform_matches_inverse_rotation() {
        let r = Mat3::from_axis_angle(&Vec3::new(1.0, 1.0, 0.0), 1.1);
        let v = Vec3::new(0.3, -0.8, 2.0);
        let a = r.transpose_transform(&v);
        let b = r.transposed().transform(&v);
        assert!(a.sub(&b).length() < 1e-6);
    }
}
