// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Arena-backed dynamic bounding-volume tree.
//!
//! Nodes live in a slot arena indexed by [`NodeId`]; structure is expressed
//! through parent/child indices, never references, so the whole tree is a
//! single allocation plus a free list. Every traversal is iterative with an
//! explicit stack.

use keel_geom::{Aabb, Transform, Vec3};

/// Leaf-count threshold below which full rebuilds switch from recursive
/// center splits to greedy bottom-up agglomeration.
pub const DEFAULT_TOPDOWN_THRESHOLD: usize = 128;

const AXES: [Vec3; 3] = [
    Vec3::new(1.0, 0.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
    Vec3::new(0.0, 0.0, 1.0),
];

/// Errors reported by tree operations that exist in the API surface but are
/// deliberately unsupported.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// The operation is not supported by this tree.
    #[error("unsupported tree operation: {0}")]
    Unsupported(&'static str),
}

/// Handle to a node in a [`DynamicTree`] arena.
///
/// Handles stay valid until the node is removed; using a handle after
/// removal (or after [`DynamicTree::clear`]) is a logic error and panics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

enum NodeKind<T> {
    Leaf(T),
    Internal([NodeId; 2]),
}

struct Node<T> {
    volume: Aabb,
    parent: Option<NodeId>,
    kind: NodeKind<T>,
}

/// Self-balancing AABB tree over leaf payloads of type `T`.
///
/// Insertion descends greedily by [`Aabb::proximity`]; updates use lazy
/// reinsertion (a leaf whose stored volume still contains the new one is
/// left alone); `optimize_incremental` amortizes rebalancing across frames
/// with a persistent round-robin path cursor.
pub struct DynamicTree<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<u32>,
    root: Option<NodeId>,
    leaf_count: usize,
    opath: u32,
    lookahead: Option<usize>,
}

impl<T> Default for DynamicTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DynamicTree<T> {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            leaf_count: 0,
            opath: 0,
            lookahead: None,
        }
    }

    /// Number of leaves currently stored.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Returns `true` if the tree holds no leaves.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Volume of the root node, `None` when empty.
    #[must_use]
    pub fn bounds(&self) -> Option<Aabb> {
        self.root.map(|r| self.node(r).volume)
    }

    /// Stored volume of a leaf (the fat volume, not the caller's last tight
    /// box).
    #[must_use]
    pub fn volume(&self, leaf: NodeId) -> Aabb {
        self.node(leaf).volume
    }

    /// Payload of a leaf.
    ///
    /// # Panics
    /// Panics if `leaf` names an internal node or a freed slot.
    #[must_use]
    pub fn data(&self, leaf: NodeId) -> &T {
        self.leaf_data(leaf)
    }

    /// Sets how many ancestors reinsertion walks up from the removal point
    /// before descending again. `None` restarts from the root.
    pub fn set_lookahead(&mut self, lookahead: Option<usize>) {
        self.lookahead = lookahead;
    }

    /// Removes every node. Outstanding handles become invalid.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.root = None;
        self.leaf_count = 0;
    }

    /// Inserts a leaf and returns its handle.
    pub fn insert(&mut self, volume: Aabb, data: T) -> NodeId {
        let leaf = self.alloc(volume, None, NodeKind::Leaf(data));
        self.insert_leaf(self.root, leaf);
        self.leaf_count += 1;
        leaf
    }

    /// Removes a leaf and returns its payload.
    ///
    /// # Panics
    /// Panics if `leaf` is not a live leaf handle.
    pub fn remove(&mut self, leaf: NodeId) -> T {
        self.remove_leaf(leaf);
        let Some(node) = self.slots[leaf.index()].take() else {
            panic!("stale node handle");
        };
        self.free.push(leaf.0);
        self.leaf_count -= 1;
        match node.kind {
            NodeKind::Leaf(data) => data,
            NodeKind::Internal(_) => panic!("handle names an internal node"),
        }
    }

    /// Removal keyed by payload value. Unsupported: callers are expected to
    /// keep the [`NodeId`] returned by [`Self::insert`].
    pub fn remove_by_value(&mut self, _data: &T) -> Result<NodeId, TreeError>
    where
        T: PartialEq,
    {
        Err(TreeError::Unsupported("value-keyed removal"))
    }

    /// Tree persistence. Unsupported: trees are rebuilt from live proxies.
    pub fn serialize(&self) -> Result<Vec<u8>, TreeError> {
        Err(TreeError::Unsupported("tree serialization"))
    }

    /// Unconditionally moves a leaf to a new volume (the teleport path):
    /// remove, re-anchor, reinsert.
    pub fn update(&mut self, leaf: NodeId, volume: Aabb) {
        let anchor = self.remove_leaf(leaf);
        let start = self.reanchor(anchor);
        self.set_volume(leaf, volume);
        self.insert_leaf(start, leaf);
    }

    /// Lazy update for a tracked (moving) leaf.
    ///
    /// Returns `false` without touching the tree when the stored fat volume
    /// still contains `volume`. Otherwise grows `volume` by `margin` on all
    /// sides plus a directional slab along `velocity`, reinserts, and
    /// returns `true`.
    pub fn update_tracked(
        &mut self,
        leaf: NodeId,
        volume: Aabb,
        velocity: &Vec3,
        margin: f32,
    ) -> bool {
        if self.node(leaf).volume.contains(&volume) {
            return false;
        }
        let grown = volume.expand(&Vec3::splat(margin)).signed_expand(velocity);
        self.update(leaf, grown);
        true
    }

    /// One round of amortized rebalancing per pass: descend along the
    /// persistent `opath` cursor, rotating each visited internal node above
    /// its parent when the arena order says so, then force-reinsert the leaf
    /// the path lands on.
    pub fn optimize_incremental(&mut self, passes: usize) {
        if self.root.is_none() {
            return;
        }
        for _ in 0..passes {
            let Some(mut node) = self.root else { break };
            let mut bit = 0u32;
            while self.is_internal(node) {
                let sorted = self.rotate(node);
                node = self.children(sorted)[((self.opath >> bit) & 1) as usize];
                bit = (bit + 1) & 31;
            }
            self.reinsert(node);
            self.opath = self.opath.wrapping_add(1);
        }
    }

    /// Full rebuild by greedy bottom-up agglomeration. O(n²) per merge
    /// round; intended for small trees or offline use.
    pub fn optimize_bottom_up(&mut self) {
        if self.root.is_some() {
            let mut leaves = self.fetch_leaves();
            self.bottomup(&mut leaves);
            let root = leaves[0];
            self.set_parent(root, None);
            self.root = Some(root);
        }
    }

    /// Full rebuild by recursive center splits, switching to bottom-up
    /// agglomeration once a partition holds `threshold` leaves or fewer.
    pub fn optimize_top_down(&mut self, threshold: usize) {
        if self.root.is_some() {
            let leaves = self.fetch_leaves();
            let root = self.topdown(leaves, threshold);
            self.set_parent(root, None);
            self.root = Some(root);
        }
    }

    /// Visits every leaf whose volume overlaps `volume`.
    pub fn collide_aabb(&self, volume: &Aabb, mut visit: impl FnMut(&T)) {
        let Some(root) = self.root else { return };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if volume.overlaps(&self.node(id).volume) {
                if self.is_internal(id) {
                    stack.extend(self.children(id));
                } else {
                    visit(self.leaf_data(id));
                }
            }
        }
    }

    /// Dual-tree descent against another tree, visiting every pair of leaves
    /// whose volumes overlap.
    pub fn collide_with<U>(&self, other: &DynamicTree<U>, mut visit: impl FnMut(&T, &U)) {
        let (Some(ra), Some(rb)) = (self.root, other.root) else {
            return;
        };
        let mut stack = vec![(ra, rb)];
        while let Some((na, nb)) = stack.pop() {
            if self.node(na).volume.overlaps(&other.node(nb).volume) {
                match (self.is_internal(na), other.is_internal(nb)) {
                    (true, true) => {
                        let [a0, a1] = self.children(na);
                        let [b0, b1] = other.children(nb);
                        stack.push((a0, b0));
                        stack.push((a1, b0));
                        stack.push((a0, b1));
                        stack.push((a1, b1));
                    }
                    (true, false) => {
                        let [a0, a1] = self.children(na);
                        stack.push((a0, nb));
                        stack.push((a1, nb));
                    }
                    (false, true) => {
                        let [b0, b1] = other.children(nb);
                        stack.push((na, b0));
                        stack.push((na, b1));
                    }
                    (false, false) => visit(self.leaf_data(na), other.leaf_data(nb)),
                }
            }
        }
    }

    /// Self-descent producing every overlapping leaf pair within this tree,
    /// each unordered pair exactly once.
    pub fn collide_self(&self, mut visit: impl FnMut(&T, &T)) {
        let Some(root) = self.root else { return };
        let mut stack = vec![(root, root)];
        while let Some((na, nb)) = stack.pop() {
            if na == nb {
                if self.is_internal(na) {
                    let [c0, c1] = self.children(na);
                    stack.push((c0, c0));
                    stack.push((c1, c1));
                    stack.push((c0, c1));
                }
            } else if self.node(na).volume.overlaps(&self.node(nb).volume) {
                match (self.is_internal(na), self.is_internal(nb)) {
                    (true, true) => {
                        let [a0, a1] = self.children(na);
                        let [b0, b1] = self.children(nb);
                        stack.push((a0, b0));
                        stack.push((a1, b0));
                        stack.push((a0, b1));
                        stack.push((a1, b1));
                    }
                    (true, false) => {
                        let [a0, a1] = self.children(na);
                        stack.push((a0, nb));
                        stack.push((a1, nb));
                    }
                    (false, true) => {
                        let [b0, b1] = self.children(nb);
                        stack.push((na, b0));
                        stack.push((na, b1));
                    }
                    (false, false) => visit(self.leaf_data(na), self.leaf_data(nb)),
                }
            }
        }
    }

    /// Dual-tree descent where each tree carries its own world transform;
    /// node volumes are compared with the separating-axis cross-frame test.
    pub fn collide_with_transformed<U>(
        &self,
        xf_self: &Transform,
        other: &DynamicTree<U>,
        xf_other: &Transform,
        mut visit: impl FnMut(&T, &U),
    ) {
        let (Some(ra), Some(rb)) = (self.root, other.root) else {
            return;
        };
        let rel = xf_self.inverse_times(xf_other);
        let mut stack = vec![(ra, rb)];
        while let Some((na, nb)) = stack.pop() {
            if self
                .node(na)
                .volume
                .overlaps_transformed(&other.node(nb).volume, &rel)
            {
                match (self.is_internal(na), other.is_internal(nb)) {
                    (true, true) => {
                        let [a0, a1] = self.children(na);
                        let [b0, b1] = other.children(nb);
                        stack.push((a0, b0));
                        stack.push((a1, b0));
                        stack.push((a0, b1));
                        stack.push((a1, b1));
                    }
                    (true, false) => {
                        let [a0, a1] = self.children(na);
                        stack.push((a0, nb));
                        stack.push((a1, nb));
                    }
                    (false, true) => {
                        let [b0, b1] = other.children(nb);
                        stack.push((na, b0));
                        stack.push((na, b1));
                    }
                    (false, false) => visit(self.leaf_data(na), other.leaf_data(nb)),
                }
            }
        }
    }

    /// Visits every leaf whose volume the ray from `origin` along
    /// `direction` enters.
    pub fn collide_ray(&self, origin: &Vec3, direction: &Vec3, mut visit: impl FnMut(&T)) {
        let Some(root) = self.root else { return };
        let n = direction.normalize();
        let inv = Vec3::new(1.0 / n.x(), 1.0 / n.y(), 1.0 / n.z());
        let signs = [
            usize::from(direction.x() < 0.0),
            usize::from(direction.y() < 0.0),
            usize::from(direction.z() < 0.0),
        ];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.node(id).volume.ray_overlaps(origin, &inv, &signs) {
                if self.is_internal(id) {
                    stack.extend(self.children(id));
                } else {
                    visit(self.leaf_data(id));
                }
            }
        }
    }

    /// Visits every leaf inside the convex region bounded by the given
    /// half-spaces (`normal · p + offset >= 0` keeps a point).
    ///
    /// Each stack entry carries an accept mask of planes the node is already
    /// fully inside of; a subtree fully inside all planes is enumerated
    /// without further plane tests.
    ///
    /// # Panics
    /// Panics if `normals` and `offsets` differ in length or name 32 or
    /// more planes.
    pub fn collide_kdop(&self, normals: &[Vec3], offsets: &[f32], mut visit: impl FnMut(&T)) {
        assert_eq!(normals.len(), offsets.len());
        assert!(normals.len() < 32, "too many bounding planes");
        let Some(root) = self.root else { return };
        let inside: u32 = (1u32 << normals.len()) - 1;
        let signs: Vec<usize> = normals.iter().map(Aabb::sign_bits).collect();
        let mut stack = vec![(root, 0u32)];
        while let Some((id, mut mask)) = stack.pop() {
            let mut out = false;
            for (i, (normal, offset)) in normals.iter().zip(offsets).enumerate() {
                if mask & (1 << i) == 0 {
                    match self.node(id).volume.classify(normal, *offset, signs[i]) {
                        -1 => {
                            out = true;
                            break;
                        }
                        1 => mask |= 1 << i,
                        _ => {}
                    }
                }
            }
            if out {
                continue;
            }
            if mask != inside && self.is_internal(id) {
                let [c0, c1] = self.children(id);
                stack.push((c0, mask));
                stack.push((c1, mask));
            } else {
                self.visit_subtree_leaves(id, &mut visit);
            }
        }
    }

    /// Best-first variant of [`Self::collide_kdop`]: nodes are expanded in
    /// increasing order of their minimum projection onto `sort_axis`.
    ///
    /// `descend` sees each node's projection before expansion and can prune
    /// (e.g. against the best hit found so far); `visit` receives leaf
    /// payloads with their projection.
    ///
    /// # Panics
    /// Panics if `normals` and `offsets` differ in length or name 32 or
    /// more planes.
    pub fn collide_ordered(
        &self,
        normals: &[Vec3],
        offsets: &[f32],
        sort_axis: &Vec3,
        mut descend: impl FnMut(f32) -> bool,
        mut visit: impl FnMut(&T, f32),
    ) {
        assert_eq!(normals.len(), offsets.len());
        assert!(normals.len() < 32, "too many bounding planes");
        let Some(root) = self.root else { return };
        let srt_signs = Aabb::sign_bits(sort_axis);
        let inside: u32 = (1u32 << normals.len()) - 1;
        let signs: Vec<usize> = normals.iter().map(Aabb::sign_bits).collect();

        // Sorted descending by projection so popping the tail yields the
        // current minimum.
        let mut stack: Vec<(NodeId, u32, f32)> = Vec::new();
        let root_value = self.node(root).volume.project_minimum(sort_axis, srt_signs);
        stack.push((root, 0, root_value));
        while let Some((id, mut mask, value)) = stack.pop() {
            if mask != inside {
                let mut out = false;
                for (i, (normal, offset)) in normals.iter().zip(offsets).enumerate() {
                    if mask & (1 << i) == 0 {
                        match self.node(id).volume.classify(normal, *offset, signs[i]) {
                            -1 => {
                                out = true;
                                break;
                            }
                            1 => mask |= 1 << i,
                            _ => {}
                        }
                    }
                }
                if out {
                    continue;
                }
            }
            if !descend(value) {
                continue;
            }
            if self.is_internal(id) {
                for child in self.children(id) {
                    let v = self.node(child).volume.project_minimum(sort_axis, srt_signs);
                    let at = stack.partition_point(|e| e.2 >= v);
                    stack.insert(at, (child, mask, v));
                }
            } else {
                visit(self.leaf_data(id), value);
            }
        }
    }

    fn visit_subtree_leaves(&self, start: NodeId, visit: &mut impl FnMut(&T)) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if self.is_internal(id) {
                stack.extend(self.children(id));
            } else {
                visit(self.leaf_data(id));
            }
        }
    }

    // ── arena plumbing ──────────────────────────────────────────────

    fn node(&self, id: NodeId) -> &Node<T> {
        let Some(node) = self.slots[id.index()].as_ref() else {
            panic!("stale node handle");
        };
        node
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        let Some(node) = self.slots[id.index()].as_mut() else {
            panic!("stale node handle");
        };
        node
    }

    fn leaf_data(&self, id: NodeId) -> &T {
        match &self.node(id).kind {
            NodeKind::Leaf(data) => data,
            NodeKind::Internal(_) => panic!("handle names an internal node"),
        }
    }

    fn is_internal(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Internal(_))
    }

    fn children(&self, id: NodeId) -> [NodeId; 2] {
        match &self.node(id).kind {
            NodeKind::Internal(childs) => *childs,
            NodeKind::Leaf(_) => panic!("leaf has no children"),
        }
    }

    fn child_index(&self, parent: NodeId, child: NodeId) -> usize {
        usize::from(self.children(parent)[1] == child)
    }

    fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        self.node_mut(id).parent = parent;
    }

    fn set_volume(&mut self, id: NodeId, volume: Aabb) {
        self.node_mut(id).volume = volume;
    }

    fn set_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        match &mut self.node_mut(parent).kind {
            NodeKind::Internal(childs) => childs[index] = child,
            NodeKind::Leaf(_) => panic!("leaf has no children"),
        }
    }

    fn set_children(&mut self, parent: NodeId, childs: [NodeId; 2]) {
        match &mut self.node_mut(parent).kind {
            NodeKind::Internal(slot) => *slot = childs,
            NodeKind::Leaf(_) => panic!("leaf has no children"),
        }
    }

    fn alloc(&mut self, volume: Aabb, parent: Option<NodeId>, kind: NodeKind<T>) -> NodeId {
        let node = Node {
            volume,
            parent,
            kind,
        };
        if let Some(i) = self.free.pop() {
            self.slots[i as usize] = Some(node);
            NodeId(i)
        } else {
            let i = self.slots.len() as u32;
            self.slots.push(Some(node));
            NodeId(i)
        }
    }

    fn free_slot(&mut self, id: NodeId) {
        self.slots[id.index()] = None;
        self.free.push(id.0);
    }

    // ── structural operations ───────────────────────────────────────

    /// Attaches `leaf` starting the greedy descent at `start` (or the root
    /// when `start` is `None`), then refits ancestors upward, stopping at
    /// the first one whose volume already contains the grown child.
    fn insert_leaf(&mut self, start: Option<NodeId>, leaf: NodeId) {
        let Some(root) = self.root else {
            self.root = Some(leaf);
            self.set_parent(leaf, None);
            return;
        };
        let leaf_vol = self.node(leaf).volume;
        let mut sibling = start.unwrap_or(root);
        while self.is_internal(sibling) {
            let [c0, c1] = self.children(sibling);
            sibling = if self.node(c0).volume.proximity(&leaf_vol)
                < self.node(c1).volume.proximity(&leaf_vol)
            {
                c0
            } else {
                c1
            };
        }
        let prev = self.node(sibling).parent;
        let merged = self.node(sibling).volume.merge(&leaf_vol);
        let node = self.alloc(merged, prev, NodeKind::Internal([sibling, leaf]));
        match prev {
            Some(p) => {
                let k = self.child_index(p, sibling);
                self.set_child(p, k, node);
                self.set_parent(sibling, Some(node));
                self.set_parent(leaf, Some(node));
                let mut child = node;
                let mut cur = Some(p);
                while let Some(a) = cur {
                    let grown = self.node(child).volume;
                    if self.node(a).volume.contains(&grown) {
                        break;
                    }
                    let [c0, c1] = self.children(a);
                    let refit = self.node(c0).volume.merge(&self.node(c1).volume);
                    self.set_volume(a, refit);
                    child = a;
                    cur = self.node(a).parent;
                }
            }
            None => {
                self.set_parent(sibling, Some(node));
                self.set_parent(leaf, Some(node));
                self.root = Some(node);
            }
        }
    }

    /// Detaches `leaf`, promotes its sibling, frees the parent slot, and
    /// shrink-refits upward until an ancestor's volume stops changing.
    /// Returns the node where refitting stopped (a good reinsertion anchor),
    /// or `None` when the leaf was the root.
    fn remove_leaf(&mut self, leaf: NodeId) -> Option<NodeId> {
        if self.root == Some(leaf) {
            self.root = None;
            return None;
        }
        let Some(parent) = self.node(leaf).parent else {
            panic!("leaf is detached from the tree");
        };
        let prev = self.node(parent).parent;
        let i = self.child_index(parent, leaf);
        let sibling = self.children(parent)[1 - i];
        match prev {
            Some(p) => {
                let k = self.child_index(p, parent);
                self.set_child(p, k, sibling);
                self.set_parent(sibling, Some(p));
                self.free_slot(parent);
                let mut cur = p;
                loop {
                    let [c0, c1] = self.children(cur);
                    let refit = self.node(c0).volume.merge(&self.node(c1).volume);
                    let before = self.node(cur).volume;
                    self.set_volume(cur, refit);
                    if before == refit {
                        break;
                    }
                    match self.node(cur).parent {
                        Some(up) => cur = up,
                        None => break,
                    }
                }
                Some(cur)
            }
            None => {
                self.root = Some(sibling);
                self.set_parent(sibling, None);
                self.free_slot(parent);
                self.root
            }
        }
    }

    fn reanchor(&self, anchor: Option<NodeId>) -> Option<NodeId> {
        match (anchor, self.lookahead) {
            (Some(mut a), Some(k)) => {
                for _ in 0..k {
                    match self.node(a).parent {
                        Some(p) => a = p,
                        None => break,
                    }
                }
                Some(a)
            }
            (Some(_), None) => self.root,
            (None, _) => None,
        }
    }

    fn reinsert(&mut self, leaf: NodeId) {
        let anchor = self.remove_leaf(leaf);
        let start = self.reanchor(anchor);
        self.insert_leaf(start, leaf);
    }

    /// Rotates `n` above its parent when the arena order says the parent
    /// came later, swapping their volumes so ancestors stay valid. Returns
    /// the node now occupying `n`'s former depth (the old parent after a
    /// rotation, `n` itself otherwise).
    fn rotate(&mut self, n: NodeId) -> NodeId {
        let Some(p) = self.node(n).parent else {
            return n;
        };
        if p <= n {
            return n;
        }
        let q = self.node(p).parent;
        let i = self.child_index(p, n);
        let j = 1 - i;
        let s = self.children(p)[j];
        let [n0, n1] = self.children(n);

        match q {
            Some(q_id) => {
                let k = self.child_index(q_id, p);
                self.set_child(q_id, k, n);
            }
            None => self.root = Some(n),
        }
        self.set_parent(s, Some(n));
        self.set_parent(p, Some(n));
        self.set_parent(n, q);
        self.set_children(p, [n0, n1]);
        self.set_parent(n0, Some(p));
        self.set_parent(n1, Some(p));
        let mut childs = [p, s];
        childs[i] = p;
        childs[j] = s;
        self.set_children(n, childs);

        let vp = self.node(p).volume;
        let vn = self.node(n).volume;
        self.set_volume(p, vn);
        self.set_volume(n, vp);
        p
    }

    // ── full rebuilds ───────────────────────────────────────────────

    /// Collects all leaf ids and frees every internal slot, leaving the
    /// tree rootless until the caller reattaches a rebuilt hierarchy.
    fn fetch_leaves(&mut self) -> Vec<NodeId> {
        let mut leaves = Vec::with_capacity(self.leaf_count);
        let Some(root) = self.root.take() else {
            return leaves;
        };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.is_internal(id) {
                stack.extend(self.children(id));
                self.free_slot(id);
            } else {
                leaves.push(id);
            }
        }
        leaves
    }

    /// Greedy agglomeration: repeatedly merge the pair with the smallest
    /// combined volume-plus-edge cost until one node remains.
    fn bottomup(&mut self, leaves: &mut Vec<NodeId>) {
        while leaves.len() > 1 {
            let mut min_cost = f32::INFINITY;
            let mut min_pair = (0usize, 1usize);
            for i in 0..leaves.len() {
                for j in (i + 1)..leaves.len() {
                    let merged = self.node(leaves[i]).volume.merge(&self.node(leaves[j]).volume);
                    let cost = merge_cost(&merged);
                    if cost < min_cost {
                        min_cost = cost;
                        min_pair = (i, j);
                    }
                }
            }
            let (i, j) = min_pair;
            let a = leaves[i];
            let b = leaves[j];
            let merged = self.node(a).volume.merge(&self.node(b).volume);
            let parent = self.alloc(merged, None, NodeKind::Internal([a, b]));
            self.set_parent(a, Some(parent));
            self.set_parent(b, Some(parent));
            leaves[i] = parent;
            leaves.swap_remove(j);
        }
    }

    fn topdown(&mut self, mut leaves: Vec<NodeId>, threshold: usize) -> NodeId {
        if leaves.len() == 1 {
            return leaves[0];
        }
        if leaves.len() <= threshold {
            self.bottomup(&mut leaves);
            return leaves[0];
        }
        let mut vol = self.node(leaves[0]).volume;
        for &l in &leaves[1..] {
            vol = vol.merge(&self.node(l).volume);
        }
        let org = vol.center();

        let mut counts = [[0usize; 2]; 3];
        for &l in &leaves {
            let c = self.node(l).volume.center().sub(&org);
            for (axis_i, axis) in AXES.iter().enumerate() {
                counts[axis_i][usize::from(c.dot(axis) > 0.0)] += 1;
            }
        }
        let mut best_axis = None;
        let mut best_mid = leaves.len();
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
                for &l in &leaves {
                    let c = self.node(l).volume.center().sub(&org);
                    if AXES[axis_i].dot(&c) < 0.0 {
                        left.push(l);
                    } else {
                        right.push(l);
                    }
                }
            }
            // All centers coincide on every axis; alternate to keep the
            // split balanced.
            None => {
                for (i, &l) in leaves.iter().enumerate() {
                    if i & 1 == 0 {
                        left.push(l);
                    } else {
                        right.push(l);
                    }
                }
            }
        }
        let c0 = self.topdown(left, threshold);
        let c1 = self.topdown(right, threshold);
        let node = self.alloc(vol, None, NodeKind::Internal([c0, c1]));
        self.set_parent(c0, Some(node));
        self.set_parent(c1, Some(node));
        node
    }
}

// Volume plus edge lengths; penalizes both bulk and elongation.
fn merge_cost(a: &Aabb) -> f32 {
    let [x, y, z] = a.lengths().to_array();
    x * y * z + x + y + z
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(min: [f32; 3], max: [f32; 3]) -> Aabb {
        Aabb::new(Vec3::from(min), Vec3::from(max))
    }

    /// Walks every internal node checking that its volume is the exact
    /// componentwise union of its children's, not merely a superset.
    fn assert_exact_unions<T>(tree: &DynamicTree<T>) {
        let Some(root) = tree.root else { return };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if tree.is_internal(id) {
                let [c0, c1] = tree.children(id);
                let union = tree.node(c0).volume.merge(&tree.node(c1).volume);
                assert_eq!(
                    tree.node(id).volume,
                    union,
                    "internal volume drifted from its children's union"
                );
                stack.push(c0);
                stack.push(c1);
            }
        }
    }

    #[test]
    fn two_leaves_merge_into_root_volume() {
        let mut tree = DynamicTree::new();
        tree.insert(boxed([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]), 0u32);
        tree.insert(boxed([5.0, 5.0, 5.0], [7.0, 7.0, 7.0]), 1u32);
        let bounds = tree.bounds();
        assert_eq!(
            bounds,
            Some(boxed([-1.0, -1.0, -1.0], [7.0, 7.0, 7.0]))
        );
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn removing_one_of_two_promotes_the_sibling() {
        let mut tree = DynamicTree::new();
        let a = tree.insert(boxed([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]), 'a');
        let _b = tree.insert(boxed([4.0, 4.0, 4.0], [5.0, 5.0, 5.0]), 'b');
        assert_eq!(tree.remove(a), 'a');
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.bounds(), Some(boxed([4.0, 4.0, 4.0], [5.0, 5.0, 5.0])));
    }

    #[test]
    fn tracked_update_is_a_noop_while_contained() {
        let mut tree = DynamicTree::new();
        let leaf = tree.insert(boxed([-2.0, -2.0, -2.0], [2.0, 2.0, 2.0]), ());
        let before = tree.volume(leaf);
        let moved = tree.update_tracked(
            leaf,
            boxed([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]),
            &Vec3::new(0.1, 0.0, 0.0),
            0.05,
        );
        assert!(!moved);
        assert_eq!(tree.volume(leaf), before);
    }

    #[test]
    fn tracked_update_reinserts_when_escaping() {
        let mut tree = DynamicTree::new();
        let leaf = tree.insert(boxed([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]), ());
        let moved = tree.update_tracked(
            leaf,
            boxed([10.0, 0.0, 0.0], [11.0, 1.0, 1.0]),
            &Vec3::new(1.0, 0.0, 0.0),
            0.05,
        );
        assert!(moved);
        // Fat volume: margin everywhere plus the velocity slab on +x.
        assert!(tree
            .volume(leaf)
            .contains(&boxed([10.0, 0.0, 0.0], [12.0, 1.0, 1.0])));
    }

    #[test]
    fn incremental_optimization_preserves_the_leaf_set() {
        let mut tree = DynamicTree::new();
        for i in 0..32 {
            let base = i as f32 * 3.0;
            tree.insert(boxed([base, 0.0, 0.0], [base + 1.0, 1.0, 1.0]), i);
        }
        tree.optimize_incremental(64);
        let mut seen = Vec::new();
        tree.collide_aabb(
            &boxed([-1000.0; 3], [1000.0; 3]),
            |&i| seen.push(i),
        );
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
        assert_eq!(tree.leaf_count(), 32);
    }

    #[test]
    fn top_down_rebuild_round_trips_leaves() {
        let mut tree = DynamicTree::new();
        for i in 0..50 {
            let base = (i % 10) as f32 * 2.0;
            let lift = (i / 10) as f32 * 2.0;
            tree.insert(
                boxed([base, lift, 0.0], [base + 1.0, lift + 1.0, 1.0]),
                i,
            );
        }
        let before = tree.bounds();
        tree.optimize_top_down(4);
        assert_eq!(tree.leaf_count(), 50);
        assert_eq!(tree.bounds(), before);
        let mut seen = Vec::new();
        tree.collide_aabb(&boxed([-1000.0; 3], [1000.0; 3]), |&i| seen.push(i));
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    fn lcg(seed: &mut u32) -> u32 {
        *seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *seed
    }

    fn scattered_volume(seed: &mut u32) -> Aabb {
        let x = (lcg(seed) % 100) as f32 - 50.0;
        let y = (lcg(seed) % 100) as f32 - 50.0;
        let z = (lcg(seed) % 100) as f32 - 50.0;
        let e = 1.0 + (lcg(seed) % 3) as f32;
        boxed([x, y, z], [x + e, y + e, z + e])
    }

    #[test]
    fn internal_volumes_stay_exact_unions_under_mutation() {
        let mut tree = DynamicTree::new();
        let mut handles = Vec::new();
        let mut seed = 0x9e37_79b9_u32;
        for _ in 0..400 {
            match lcg(&mut seed) % 3 {
                0 => {
                    let volume = scattered_volume(&mut seed);
                    handles.push(tree.insert(volume, handles.len()));
                }
                1 if !handles.is_empty() => {
                    let i = lcg(&mut seed) as usize % handles.len();
                    tree.remove(handles.swap_remove(i));
                }
                _ if !handles.is_empty() => {
                    let i = lcg(&mut seed) as usize % handles.len();
                    let volume = scattered_volume(&mut seed);
                    tree.update(handles[i], volume);
                }
                _ => {}
            }
        }
        assert_exact_unions(&tree);

        // Rebalancing rotations swap volumes between nodes; the union
        // property must survive every optimization strategy.
        tree.optimize_incremental(32);
        assert_exact_unions(&tree);
        tree.optimize_top_down(8);
        assert_exact_unions(&tree);
        tree.optimize_bottom_up();
        assert_exact_unions(&tree);
        assert_eq!(tree.leaf_count(), handles.len());
    }

    #[test]
    fn bottom_up_rebuild_round_trips_leaves() {
        let mut tree = DynamicTree::new();
        for i in 0..40 {
            let base = (i % 8) as f32 * 3.0;
            let lift = (i / 8) as f32 * 3.0;
            tree.insert(boxed([base, lift, 0.0], [base + 1.0, lift + 1.0, 1.0]), i);
        }
        tree.optimize_top_down(4);
        tree.optimize_bottom_up();
        assert_eq!(tree.leaf_count(), 40);
        assert_exact_unions(&tree);
        let mut seen = Vec::new();
        tree.collide_aabb(&boxed([-1000.0; 3], [1000.0; 3]), |&i| seen.push(i));
        seen.sort_unstable();
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn self_collide_reports_each_pair_once() {
        let mut tree = DynamicTree::new();
        tree.insert(boxed([0.0, 0.0, 0.0], [2.0, 2.0, 2.0]), 0u32);
        tree.insert(boxed([1.0, 1.0, 1.0], [3.0, 3.0, 3.0]), 1u32);
        tree.insert(boxed([10.0, 10.0, 10.0], [11.0, 11.0, 11.0]), 2u32);
        let mut pairs = Vec::new();
        tree.collide_self(|&a, &b| pairs.push((a.min(b), a.max(b))));
        assert_eq!(pairs, vec![(0, 1)]);
    }

    #[test]
    fn ray_finds_the_boxes_it_pierces() {
        let mut tree = DynamicTree::new();
        tree.insert(boxed([2.0, -1.0, -1.0], [3.0, 1.0, 1.0]), 'x');
        tree.insert(boxed([0.0, 5.0, 0.0], [1.0, 6.0, 1.0]), 'y');
        let mut hits = Vec::new();
        tree.collide_ray(&Vec3::ZERO, &Vec3::new(1.0, 0.0, 0.0), |&c| hits.push(c));
        assert_eq!(hits, vec!['x']);
    }

    #[test]
    fn kdop_accepts_leaves_inside_every_plane() {
        let mut tree = DynamicTree::new();
        tree.insert(boxed([1.0, 0.0, 0.0], [2.0, 1.0, 1.0]), 'a');
        tree.insert(boxed([-4.0, 0.0, 0.0], [-3.0, 1.0, 1.0]), 'b');
        // Single half-space keeping x >= 0.
        let normals = [Vec3::new(1.0, 0.0, 0.0)];
        let offsets = [0.0];
        let mut seen = Vec::new();
        tree.collide_kdop(&normals, &offsets, |&c| seen.push(c));
        assert_eq!(seen, vec!['a']);
    }

    #[test]
    fn ordered_traversal_yields_nearest_first() {
        let mut tree = DynamicTree::new();
        tree.insert(boxed([5.0, 0.0, 0.0], [6.0, 1.0, 1.0]), 'f');
        tree.insert(boxed([1.0, 0.0, 0.0], [2.0, 1.0, 1.0]), 'n');
        let axis = Vec3::new(1.0, 0.0, 0.0);
        let mut order = Vec::new();
        tree.collide_ordered(&[], &[], &axis, |_| true, |&c, _| order.push(c));
        assert_eq!(order, vec!['n', 'f']);
    }

    #[test]
    fn value_keyed_removal_is_unsupported() {
        let mut tree = DynamicTree::new();
        tree.insert(boxed([0.0; 3], [1.0; 3]), 7u32);
        assert!(matches!(
            tree.remove_by_value(&7),
            Err(TreeError::Unsupported(_))
        ));
    }
}
