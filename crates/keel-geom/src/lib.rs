// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![doc = r"Geometry primitives for Keel.

This crate provides:
- Deterministic float32 linear algebra (`Vec3`, `Mat3`, `Transform`).
- Axis-aligned bounding volumes (`Aabb`) and their algebra: merge,
  containment, overlap, plane classification, directed expansion, and the
  cheap proximity surrogate used by greedy tree insertion.

Design notes:
- Float32 throughout; operations favor clarity and reproducibility.
- No ambient RNG, no globals; every operation is a pure function of its
  inputs.
- Rustdoc is treated as part of the contract; public items are documented.
"]

/// Bounding-volume type and its algebra.
pub mod aabb;
/// Deterministic float32 linear algebra.
pub mod math;

pub use aabb::Aabb;
pub use math::{Mat3, Transform, Vec3};
