// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![doc = r"Static triangle-mesh spatial index for Keel.

A build-once bounding-volume hierarchy over mesh triangles, flattened into a
contiguous array of 16-byte quantized nodes. Coordinates are compressed to
16 bits per axis against one global quantization frame; dequantized bounds
are guaranteed to never shrink below the input volume, so queries stay
conservative. Traversal is stackless: internal nodes carry an escape offset
that skips their whole subtree on a miss, and iteration is bounded by the
array length.

Topology is fixed after `build`; `refit` rescans vertex positions in place
for meshes that deform without changing connectivity.
"]

/// Quantized BVH construction and queries.
pub mod bvh;
/// Triangle-source capability traits and a simple concrete carrier.
pub mod mesh;

pub use bvh::{BvhError, QuantizedNode, StaticBvh, SubtreeHeader, MAX_NUM_PARTS_IN_BITS};
pub use mesh::{TriangleIndexCallback, TriangleMesh, TriangleSoup};
