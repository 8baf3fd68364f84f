// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Quantized static BVH.
//!
//! Node layout: 16 bytes, two `[u16; 3]` quantized corners plus an `i32`
//! payload. Non-negative payloads are leaves and pack `(part, triangle)`;
//! negative payloads are internal nodes and store the subtree slot count as
//! an escape offset. Children of an internal node start at the next slot,
//! so a depth-first walk needs no stack: advance by one to descend, or by
//! the escape offset to skip a missed subtree.

use keel_geom::{Aabb, Vec3};
use tracing::debug;

use crate::mesh::TriangleMesh;

/// Bits of the leaf payload reserved for the part id, leaving
/// `31 - MAX_NUM_PARTS_IN_BITS` bits for the triangle index.
pub const MAX_NUM_PARTS_IN_BITS: u32 = 10;

const TRIANGLE_INDEX_BITS: u32 = 31 - MAX_NUM_PARTS_IN_BITS;
const NODE_SIZE_BYTES: usize = 16;
const MAX_SUBTREE_SIZE_BYTES: usize = 2048;
/// Partition size at which construction switches from center splits to
/// greedy bottom-up agglomeration.
const BOTTOM_UP_THRESHOLD: usize = 16;
/// Slack added around the build bound so quantization never divides by a
/// zero extent.
const QUANTIZATION_MARGIN: f32 = 1.0;
/// Degenerate-thin triangle boxes are padded up to this dimension so they
/// survive quantization.
const MIN_LEAF_DIMENSION: f32 = 0.002;
const LEAF_PAD: f32 = 0.001;

const AXES: [Vec3; 3] = [
    Vec3::new(1.0, 0.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
    Vec3::new(0.0, 0.0, 1.0),
];

/// Errors reported by BVH operations that exist in the API surface but are
/// deliberately unsupported.
#[derive(Debug, thiserror::Error)]
pub enum BvhError {
    /// The operation is not supported by this index.
    #[error("unsupported bvh operation: {0}")]
    Unsupported(&'static str),
}

/// One flattened tree slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QuantizedNode {
    min: [u16; 3],
    max: [u16; 3],
    payload: i32,
}

impl QuantizedNode {
    /// Returns `true` when the slot is a triangle leaf.
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.payload >= 0
    }

    /// Slot count of this subtree, including this node. Internal nodes
    /// only.
    #[must_use]
    pub const fn escape_index(self) -> usize {
        (-self.payload) as usize
    }

    /// Mesh part id. Leaves only.
    #[must_use]
    pub const fn part(self) -> usize {
        (self.payload >> TRIANGLE_INDEX_BITS) as usize
    }

    /// Triangle index within the part. Leaves only.
    #[must_use]
    pub const fn triangle_index(self) -> usize {
        (self.payload & ((1 << TRIANGLE_INDEX_BITS) - 1)) as usize
    }
}

/// Entry point shortcut into a subtree small enough to traverse alone,
/// recorded for callers that batch queries per spatial region.
#[derive(Debug, Copy, Clone)]
pub struct SubtreeHeader {
    /// Quantized minimum corner of the subtree root.
    pub min: [u16; 3],
    /// Quantized maximum corner of the subtree root.
    pub max: [u16; 3],
    /// Slot index of the subtree root.
    pub root: usize,
    /// Slot count of the subtree.
    pub size: usize,
}

enum BuildKind {
    Leaf(usize),
    Internal(usize, usize),
}

struct BuildNode {
    volume: Aabb,
    kind: BuildKind,
}

/// Build-once quantized BVH over a triangle mesh.
pub struct StaticBvh {
    nodes: Vec<QuantizedNode>,
    headers: Vec<SubtreeHeader>,
    frame_min: Vec3,
    frame_max: Vec3,
    quantization: Vec3,
}

impl StaticBvh {
    /// Builds the index over `mesh`, quantizing against `bounds` (normally
    /// the mesh's own bound; every triangle must fit inside it).
    ///
    /// # Panics
    /// Panics if a part id or triangle index exceeds the leaf payload
    /// packing limits.
    #[must_use]
    pub fn build(mesh: &dyn TriangleMesh, bounds: &Aabb) -> Self {
        let mut bvh = Self {
            nodes: Vec::new(),
            headers: Vec::new(),
            frame_min: Vec3::ZERO,
            frame_max: Vec3::ZERO,
            quantization: Vec3::ZERO,
        };
        bvh.set_quantization_frame(bounds);

        let mut leaf_nodes: Vec<QuantizedNode> = Vec::new();
        let mut leaf_volumes: Vec<Aabb> = Vec::new();
        {
            let frame = &bvh;
            let nodes = &mut leaf_nodes;
            let volumes = &mut leaf_volumes;
            mesh.process_all_triangles(&mut |tri: &[Vec3; 3], part: usize, index: usize| {
                assert!(part < (1 << MAX_NUM_PARTS_IN_BITS), "part id too large");
                assert!(index < (1 << TRIANGLE_INDEX_BITS), "triangle index too large");
                let padded = pad_thin(&Aabb::from_points(tri));
                volumes.push(padded);
                nodes.push(QuantizedNode {
                    min: frame.quantize_min(&padded.min()),
                    max: frame.quantize_max(&padded.max()),
                    payload: ((part as i32) << TRIANGLE_INDEX_BITS) | index as i32,
                });
            });
        }

        if !leaf_nodes.is_empty() {
            let mut arena: Vec<BuildNode> = Vec::with_capacity(2 * leaf_nodes.len());
            let items: Vec<usize> = (0..leaf_nodes.len()).collect();
            let root = build_hierarchy(&mut arena, &leaf_volumes, items);
            bvh.nodes.reserve(2 * leaf_nodes.len());
            bvh.flatten(&arena, root, &leaf_nodes);

            if bvh.headers.is_empty() {
                let size = subtree_size(&bvh.nodes, 0);
                bvh.headers.push(SubtreeHeader {
                    min: bvh.nodes[0].min,
                    max: bvh.nodes[0].max,
                    root: 0,
                    size,
                });
            }
        }

        debug!(
            nodes = bvh.nodes.len(),
            headers = bvh.headers.len(),
            "static bvh built"
        );
        bvh
    }

    /// Requantizes every node in place from fresh vertex positions. The
    /// topology (and therefore the slot layout) is untouched; only bounds
    /// and the quantization frame change.
    pub fn refit(&mut self, mesh: &dyn TriangleMesh) {
        if self.nodes.is_empty() {
            return;
        }
        let bounds = mesh.compute_bounds();
        self.set_quantization_frame(&bounds);

        // Children sit at higher slots than their parent, so a reverse
        // walk sees every child before the internal node that unions it.
        for i in (0..self.nodes.len()).rev() {
            if self.nodes[i].is_leaf() {
                let tri = mesh.triangle(self.nodes[i].part(), self.nodes[i].triangle_index());
                // Same thin-box padding as `build`, so a refit is a
                // fixed point for an unchanged mesh.
                let aabb = pad_thin(&Aabb::from_points(&tri));
                let qmin = self.quantize_min(&aabb.min());
                let qmax = self.quantize_max(&aabb.max());
                self.nodes[i].min = qmin;
                self.nodes[i].max = qmax;
            } else {
                let left = i + 1;
                let right = left + subtree_size(&self.nodes, left);
                for axis in 0..3 {
                    self.nodes[i].min[axis] =
                        self.nodes[left].min[axis].min(self.nodes[right].min[axis]);
                    self.nodes[i].max[axis] =
                        self.nodes[left].max[axis].max(self.nodes[right].max[axis]);
                }
            }
        }
        for h in 0..self.headers.len() {
            let root = self.headers[h].root;
            self.headers[h].min = self.nodes[root].min;
            self.headers[h].max = self.nodes[root].max;
        }
    }

    /// Refit restricted to a region. Unsupported: use [`Self::refit`].
    pub fn refit_partial(&mut self, _region: &Aabb) -> Result<(), BvhError> {
        Err(BvhError::Unsupported("partial refit"))
    }

    /// Index persistence. Unsupported: rebuild from the mesh instead.
    pub fn serialize(&self) -> Result<Vec<u8>, BvhError> {
        Err(BvhError::Unsupported("bvh serialization"))
    }

    /// Visits the `(part, triangle)` address of every leaf whose quantized
    /// bound overlaps `aabb`.
    pub fn aabb_overlapping_nodes(&self, aabb: &Aabb, mut visit: impl FnMut(usize, usize)) {
        if self.nodes.is_empty() {
            return;
        }
        let qmin = self.quantize_min(&aabb.min());
        let qmax = self.quantize_max(&aabb.max());
        let mut i = 0;
        let mut iterations = 0;
        while i < self.nodes.len() {
            debug_assert!(iterations < self.nodes.len(), "corrupt escape indices");
            iterations += 1;
            let node = self.nodes[i];
            let overlap = quantized_overlap(&qmin, &qmax, &node.min, &node.max);
            let leaf = node.is_leaf();
            if leaf && overlap {
                visit(node.part(), node.triangle_index());
            }
            if overlap || leaf {
                i += 1;
            } else {
                i += node.escape_index();
            }
        }
    }

    /// Visits every leaf whose bound the segment `from → to` reaches.
    pub fn ray_overlapping_nodes(&self, from: &Vec3, to: &Vec3, visit: impl FnMut(usize, usize)) {
        self.box_cast_overlapping_nodes(from, to, &Vec3::ZERO, &Vec3::ZERO, visit);
    }

    /// Visits every leaf whose bound a box swept along `from → to` reaches.
    /// `box_min`/`box_max` are the cast box's extents relative to its
    /// center (`box_min` non-positive, `box_max` non-negative).
    ///
    /// The whole sweep is quantized once as a cheap prefilter; candidates
    /// that pass get an exact slab test against their dequantized bound
    /// grown by the cast extents.
    pub fn box_cast_overlapping_nodes(
        &self,
        from: &Vec3,
        to: &Vec3,
        box_min: &Vec3,
        box_max: &Vec3,
        mut visit: impl FnMut(usize, usize),
    ) {
        if self.nodes.is_empty() {
            return;
        }
        let sweep_min = from.min(to).add(box_min);
        let sweep_max = from.max(to).add(box_max);
        let qmin = self.quantize_min(&sweep_min);
        let qmax = self.quantize_max(&sweep_max);

        let mut i = 0;
        let mut iterations = 0;
        while i < self.nodes.len() {
            debug_assert!(iterations < self.nodes.len(), "corrupt escape indices");
            iterations += 1;
            let node = self.nodes[i];
            let leaf = node.is_leaf();
            let mut hit = false;
            if quantized_overlap(&qmin, &qmax, &node.min, &node.max) {
                let bounds = self.node_bounds_raw(&node);
                let grown = Aabb::new(
                    bounds.min().add(box_min),
                    bounds.max().add(box_max),
                );
                hit = grown.segment_hits(from, to).is_some();
            }
            if leaf && hit {
                visit(node.part(), node.triangle_index());
            }
            if hit || leaf {
                i += 1;
            } else {
                i += node.escape_index();
            }
        }
    }

    /// Number of flattened tree slots.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Recorded subtree headers.
    #[must_use]
    pub fn subtree_headers(&self) -> &[SubtreeHeader] {
        &self.headers
    }

    /// The quantization frame (build bound plus margin).
    #[must_use]
    pub fn quantization_frame(&self) -> Aabb {
        Aabb::new(self.frame_min, self.frame_max)
    }

    /// Dequantized (conservative) bound of a slot.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn node_bounds(&self, index: usize) -> Aabb {
        self.node_bounds_raw(&self.nodes[index])
    }

    fn node_bounds_raw(&self, node: &QuantizedNode) -> Aabb {
        Aabb::new(self.dequantize(&node.min), self.dequantize(&node.max))
    }

    fn set_quantization_frame(&mut self, bounds: &Aabb) {
        let margin = Vec3::splat(QUANTIZATION_MARGIN);
        self.frame_min = bounds.min().sub(&margin);
        self.frame_max = bounds.max().add(&margin);
        let size = self.frame_max.sub(&self.frame_min);
        self.quantization = Vec3::new(
            65535.0 / size.x(),
            65535.0 / size.y(),
            65535.0 / size.z(),
        );
    }

    // Quantization never shrinks: minimum corners round down, maximum
    // corners round up, so the dequantized box always contains the input.
    fn quantize_min(&self, p: &Vec3) -> [u16; 3] {
        self.quantize_with(p, f32::floor)
    }

    fn quantize_max(&self, p: &Vec3) -> [u16; 3] {
        self.quantize_with(p, f32::ceil)
    }

    fn quantize_with(&self, p: &Vec3, round: fn(f32) -> f32) -> [u16; 3] {
        let clamped = p.max(&self.frame_min).min(&self.frame_max);
        let v = clamped.sub(&self.frame_min).mul(&self.quantization);
        let mut out = [0u16; 3];
        for axis in 0..3 {
            out[axis] = round(v.axis(axis)).clamp(0.0, 65535.0) as u16;
        }
        out
    }

    fn dequantize(&self, q: &[u16; 3]) -> Vec3 {
        Vec3::new(
            f32::from(q[0]) / self.quantization.x(),
            f32::from(q[1]) / self.quantization.y(),
            f32::from(q[2]) / self.quantization.z(),
        )
        .add(&self.frame_min)
    }

    /// Emits the subtree rooted at `build_id` depth-first and returns its
    /// slot count. Records subtree headers for the children of any subtree
    /// whose serialized size crosses the threshold.
    fn flatten(&mut self, arena: &[BuildNode], build_id: usize, leaves: &[QuantizedNode]) -> usize {
        match arena[build_id].kind {
            BuildKind::Leaf(leaf_id) => {
                self.nodes.push(leaves[leaf_id]);
                1
            }
            BuildKind::Internal(left, right) => {
                let pos = self.nodes.len();
                let volume = arena[build_id].volume;
                let qmin = self.quantize_min(&volume.min());
                let qmax = self.quantize_max(&volume.max());
                self.nodes.push(QuantizedNode {
                    min: qmin,
                    max: qmax,
                    payload: 0,
                });
                let left_idx = self.nodes.len();
                let left_count = self.flatten(arena, left, leaves);
                let right_idx = self.nodes.len();
                let right_count = self.flatten(arena, right, leaves);
                let count = 1 + left_count + right_count;
                self.nodes[pos].payload = -(count as i32);
                if count * NODE_SIZE_BYTES > MAX_SUBTREE_SIZE_BYTES {
                    self.record_header(left_idx);
                    self.record_header(right_idx);
                }
                count
            }
        }
    }

    fn record_header(&mut self, root: usize) {
        let size = subtree_size(&self.nodes, root);
        if size * NODE_SIZE_BYTES <= MAX_SUBTREE_SIZE_BYTES {
            self.headers.push(SubtreeHeader {
                min: self.nodes[root].min,
                max: self.nodes[root].max,
                root,
                size,
            });
        }
    }
}

fn subtree_size(nodes: &[QuantizedNode], index: usize) -> usize {
    if nodes[index].is_leaf() {
        1
    } else {
        nodes[index].escape_index()
    }
}

fn quantized_overlap(a_min: &[u16; 3], a_max: &[u16; 3], b_min: &[u16; 3], b_max: &[u16; 3]) -> bool {
    a_min[0] <= b_max[0]
        && a_max[0] >= b_min[0]
        && a_min[1] <= b_max[1]
        && a_max[1] >= b_min[1]
        && a_min[2] <= b_max[2]
        && a_max[2] >= b_min[2]
}

fn pad_thin(aabb: &Aabb) -> Aabb {
    let mut min = aabb.min().to_array();
    let mut max = aabb.max().to_array();
    for axis in 0..3 {
        if max[axis] - min[axis] < MIN_LEAF_DIMENSION {
            min[axis] -= LEAF_PAD;
            max[axis] += LEAF_PAD;
        }
    }
    Aabb::new(Vec3::from(min), Vec3::from(max))
}

/// Two-phase hierarchy construction over leaf indices: center-balance
/// splits down to [`BOTTOM_UP_THRESHOLD`], greedy agglomeration below.
/// Returns the arena id of the subtree root.
fn build_hierarchy(arena: &mut Vec<BuildNode>, volumes: &[Aabb], items: Vec<usize>) -> usize {
    if items.len() == 1 {
        let leaf = items[0];
        arena.push(BuildNode {
            volume: volumes[leaf],
            kind: BuildKind::Leaf(leaf),
        });
        return arena.len() - 1;
    }
    if items.len() <= BOTTOM_UP_THRESHOLD {
        return agglomerate(arena, volumes, &items);
    }

    let mut vol = volumes[items[0]];
    for &it in &items[1..] {
        vol = vol.merge(&volumes[it]);
    }
    let org = vol.center();

    let mut counts = [[0usize; 2]; 3];
    for &it in &items {
        let c = volumes[it].center().sub(&org);
        for (axis_i, axis) in AXES.iter().enumerate() {
            counts[axis_i][usize::from(c.dot(axis) > 0.0)] += 1;
        }
    }
    let mut best_axis = None;
    let mut best_mid = items.len();
    for (axis_i, count) in counts.iter().enumerate() {
        if count[0] > 0 && count[1] > 0 {
            let mid = count[0].abs_diff(count[1]);
            if mid < best_mid {
                best_axis = Some(axis_i);
                best_mid = mid;
            }
        }
    }

    let mut left = Vec::new();
    let mut right = Vec::new();
    match best_axis {
        Some(axis_i) => {
            for &it in &items {
                let c = volumes[it].center().sub(&org);
                if AXES[axis_i].dot(&c) < 0.0 {
                    left.push(it);
                } else {
                    right.push(it);
                }
            }
        }
        None => {
            for (i, &it) in items.iter().enumerate() {
                if i & 1 == 0 {
                    left.push(it);
                } else {
                    right.push(it);
                }
            }
        }
    }
    let l = build_hierarchy(arena, volumes, left);
    let r = build_hierarchy(arena, volumes, right);
    arena.push(BuildNode {
        volume: vol,
        kind: BuildKind::Internal(l, r),
    });
    arena.len() - 1
}

fn agglomerate(arena: &mut Vec<BuildNode>, volumes: &[Aabb], items: &[usize]) -> usize {
    let mut work: Vec<usize> = items
        .iter()
        .map(|&leaf| {
            arena.push(BuildNode {
                volume: volumes[leaf],
                kind: BuildKind::Leaf(leaf),
            });
            arena.len() - 1
        })
        .collect();
    while work.len() > 1 {
        let mut min_cost = f32::INFINITY;
        let mut min_pair = (0usize, 1usize);
        for i in 0..work.len() {
            for j in (i + 1)..work.len() {
                let merged = arena[work[i]].volume.merge(&arena[work[j]].volume);
                let cost = merge_cost(&merged);
                if cost < min_cost {
                    min_cost = cost;
                    min_pair = (i, j);
                }
            }
        }
        let (i, j) = min_pair;
        let a = work[i];
        let b = work[j];
        let merged = arena[a].volume.merge(&arena[b].volume);
        arena.push(BuildNode {
            volume: merged,
            kind: BuildKind::Internal(a, b),
        });
        work[i] = arena.len() - 1;
        work.swap_remove(j);
    }
    work[0]
}

// Volume plus edge lengths; penalizes both bulk and elongation.
fn merge_cost(a: &Aabb) -> f32 {
    let [x, y, z] = a.lengths().to_array();
    x * y * z + x + y + z
}
