// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Staged two-tree broad phase.
//!
//! Proxies start in the `moving` tree. Each step advances a round-robin
//! stage cursor and migrates the proxies that have not moved for a full
//! stage cycle into the `settled` tree, which is never updated, only
//! re-optimized. The cost of settling is amortized: at most one stage
//! bucket migrates per step.

use keel_geom::{Aabb, Vec3};
use tracing::debug;

use crate::pairs::{HashedPairCache, OverlappingPairCache, ProxyPair};
use crate::tree::{DynamicTree, NodeId};

/// Number of round-robin stages a proxy passes through before settling.
pub const STAGECOUNT: usize = 2;

/// Handle to a proxy registered with a [`DynamicBroadphase`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProxyId(u32);

impl ProxyId {
    /// Builds a handle from its raw index. Intended for tests and
    /// serialization shims; handles are normally obtained from
    /// [`DynamicBroadphase::create_proxy`].
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw index value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Tuning knobs for the broad phase.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BroadphaseConfig {
    /// How many frames of motion the predictive leaf expansion covers.
    pub predicted_frames: f32,
    /// Percent of moving-tree leaves rebalanced per step.
    pub dynamic_update_pct: usize,
    /// Percent of settled-tree leaves rebalanced per step.
    pub fixed_update_pct: usize,
    /// Symmetric fattening margin applied on tracked updates.
    pub margin: f32,
}

impl Default for BroadphaseConfig {
    fn default() -> Self {
        Self {
            predicted_frames: 2.0,
            dynamic_update_pct: 1,
            fixed_update_pct: 1,
            margin: 0.05,
        }
    }
}

struct Proxy {
    aabb: Aabb,
    owner: u64,
    group: u16,
    mask: u16,
    leaf: NodeId,
    stage: usize,
    slot: usize,
}

/// Broad phase over two dynamic trees with staged settling and a hashed
/// pair cache.
///
/// Pair lifetime: a pair is added the step the proxies' (fat) volumes
/// overlap and retired by the cleanup sweep of the first step that sees
/// their stored tight volumes separated. The sweep is the only place pairs
/// are removed, apart from proxy destruction.
pub struct DynamicBroadphase {
    moving: DynamicTree<ProxyId>,
    settled: DynamicTree<ProxyId>,
    proxies: Vec<Option<Proxy>>,
    free: Vec<u32>,
    stages: [Vec<ProxyId>; STAGECOUNT + 1],
    stage_current: usize,
    cache: Box<dyn OverlappingPairCache>,
    config: BroadphaseConfig,
    steps: u64,
}

impl Default for DynamicBroadphase {
    fn default() -> Self {
        Self::new(BroadphaseConfig::default())
    }
}

impl DynamicBroadphase {
    /// Creates a broad phase with the default hashed pair cache.
    #[must_use]
    pub fn new(config: BroadphaseConfig) -> Self {
        Self::with_pair_cache(config, Box::new(HashedPairCache::new()))
    }

    /// Creates a broad phase over a caller-supplied pair cache.
    #[must_use]
    pub fn with_pair_cache(config: BroadphaseConfig, cache: Box<dyn OverlappingPairCache>) -> Self {
        Self {
            moving: DynamicTree::new(),
            settled: DynamicTree::new(),
            proxies: Vec::new(),
            free: Vec::new(),
            stages: core::array::from_fn(|_| Vec::new()),
            stage_current: 0,
            cache,
            config,
            steps: 0,
        }
    }

    /// Registers a proxy. `owner` is an opaque tag handed back with query
    /// results; `group`/`mask` are the collision filter bits (a pair is
    /// reported when each proxy's group intersects the other's mask).
    pub fn create_proxy(&mut self, aabb: Aabb, owner: u64, group: u16, mask: u16) -> ProxyId {
        let id = match self.free.pop() {
            Some(i) => ProxyId(i),
            None => {
                let i = self.proxies.len() as u32;
                self.proxies.push(None);
                ProxyId(i)
            }
        };
        let leaf = self.moving.insert(aabb, id);
        let stage = self.stage_current;
        let slot = self.stages[stage].len();
        self.stages[stage].push(id);
        self.proxies[id.index()] = Some(Proxy {
            aabb,
            owner,
            group,
            mask,
            leaf,
            stage,
            slot,
        });
        id
    }

    /// Unregisters a proxy, dropping its leaf, its stage membership and
    /// every cached pair it participates in.
    ///
    /// # Panics
    /// Panics if `id` is stale.
    pub fn destroy_proxy(&mut self, id: ProxyId) {
        let Some(proxy) = self.proxies[id.index()].take() else {
            panic!("stale proxy handle");
        };
        if proxy.stage == STAGECOUNT {
            self.settled.remove(proxy.leaf);
        } else {
            self.moving.remove(proxy.leaf);
        }
        self.bucket_remove(proxy.stage, proxy.slot);
        self.cache.remove_pairs_containing(id);
        self.free.push(id.0);
    }

    /// Moves a proxy to a new tight volume.
    ///
    /// Settled proxies reheat into the moving tree. Moving proxies whose
    /// new volume still touches their fat leaf follow the tracked-update
    /// path: the leaf is grown by the configured margin plus a predictive
    /// slab along the observed center displacement. A volume with no
    /// overlap at all is a teleport and reinserts without prediction.
    pub fn set_aabb(&mut self, id: ProxyId, aabb: Aabb) {
        let (leaf, stage, old_center) = {
            let p = self.proxy(id);
            (p.leaf, p.stage, p.aabb.center())
        };
        if stage == STAGECOUNT {
            self.settled.remove(leaf);
            let fresh = self.moving.insert(aabb, id);
            self.proxy_mut(id).leaf = fresh;
        } else if self.moving.volume(leaf).overlaps(&aabb) {
            let delta = aabb
                .center()
                .sub(&old_center)
                .scale(self.config.predicted_frames);
            self.moving
                .update_tracked(leaf, aabb, &delta, self.config.margin);
        } else {
            self.moving.update(leaf, aabb);
        }

        let slot = self.proxy(id).slot;
        self.bucket_remove(stage, slot);
        let current = self.stage_current;
        let new_slot = self.stages[current].len();
        self.stages[current].push(id);
        let proxy = self.proxy_mut(id);
        proxy.aabb = aabb;
        proxy.stage = current;
        proxy.slot = new_slot;
    }

    /// One broad-phase step: amortized tree optimization, stage migration,
    /// tree-vs-tree collision, then the pair cleanup sweep.
    pub fn calculate_overlapping_pairs(&mut self) {
        let dynamic_passes = 1 + self.moving.leaf_count() * self.config.dynamic_update_pct / 100;
        let fixed_passes = 1 + self.settled.leaf_count() * self.config.fixed_update_pct / 100;
        self.moving.optimize_incremental(dynamic_passes);
        self.settled.optimize_incremental(fixed_passes);

        // Settle the bucket whose turn came up. Each migrant collides
        // against the settled tree before joining it, so migrant-migrant
        // overlaps surface through the tree as well.
        self.stage_current = (self.stage_current + 1) % STAGECOUNT;
        let migrants = core::mem::take(&mut self.stages[self.stage_current]);
        for id in migrants {
            let (leaf, aabb) = {
                let p = self.proxy(id);
                (p.leaf, p.aabb)
            };
            let fat = self.moving.volume(leaf);
            {
                let proxies = &self.proxies;
                let cache = &mut self.cache;
                self.settled.collide_aabb(&fat, |&other| {
                    if other != id && filter_allows(proxies, id, other) {
                        cache.add_pair(id, other);
                    }
                });
            }
            self.moving.remove(leaf);
            let fresh = self.settled.insert(aabb, id);
            let slot = self.stages[STAGECOUNT].len();
            self.stages[STAGECOUNT].push(id);
            let proxy = self.proxy_mut(id);
            proxy.leaf = fresh;
            proxy.stage = STAGECOUNT;
            proxy.slot = slot;
        }

        {
            let proxies = &self.proxies;
            let cache = &mut self.cache;
            self.moving.collide_with(&self.settled, |&a, &b| {
                if filter_allows(proxies, a, b) {
                    cache.add_pair(a, b);
                }
            });
            self.moving.collide_self(|&a, &b| {
                if filter_allows(proxies, a, b) {
                    cache.add_pair(a, b);
                }
            });
        }

        // Cleanup sweep: the only place pairs retire. A pair whose stored
        // tight volumes no longer touch dies here, one step after the
        // separation happened.
        let mut i = 0;
        while i < self.cache.pairs().len() {
            let ProxyPair { a, b } = self.cache.pairs()[i];
            if self.proxy(a).aabb.overlaps(&self.proxy(b).aabb) {
                i += 1;
            } else {
                self.cache.remove_pair(a, b);
            }
        }

        self.steps += 1;
        debug!(
            step = self.steps,
            moving = self.moving.leaf_count(),
            settled = self.settled.leaf_count(),
            pairs = self.cache.len(),
            "broadphase step"
        );
    }

    /// Current overlapping pairs.
    #[must_use]
    pub fn pairs(&self) -> &[ProxyPair] {
        self.cache.pairs()
    }

    /// The pair cache itself.
    #[must_use]
    pub fn pair_cache(&self) -> &dyn OverlappingPairCache {
        self.cache.as_ref()
    }

    /// Stored tight volume of a proxy.
    #[must_use]
    pub fn proxy_aabb(&self, id: ProxyId) -> Aabb {
        self.proxy(id).aabb
    }

    /// Owner tag supplied at creation.
    #[must_use]
    pub fn proxy_owner(&self, id: ProxyId) -> u64 {
        self.proxy(id).owner
    }

    /// Union of both tree root volumes; a degenerate point box at the
    /// origin when no proxies exist.
    #[must_use]
    pub fn overlap_bounds(&self) -> Aabb {
        match (self.moving.bounds(), self.settled.bounds()) {
            (Some(a), Some(b)) => a.merge(&b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => Aabb::from_radius(Vec3::ZERO, 0.0),
        }
    }

    /// Leaves currently in the moving tree.
    #[must_use]
    pub fn moving_leaf_count(&self) -> usize {
        self.moving.leaf_count()
    }

    /// Leaves currently in the settled tree.
    #[must_use]
    pub fn settled_leaf_count(&self) -> usize {
        self.settled.leaf_count()
    }

    /// Visits the owner of every proxy whose stored volume overlaps `aabb`.
    pub fn query_aabb(&self, aabb: &Aabb, mut visit: impl FnMut(ProxyId, u64)) {
        let proxies = &self.proxies;
        let mut each = |id: &ProxyId| {
            if let Some(p) = proxies[id.index()].as_ref() {
                visit(*id, p.owner);
            }
        };
        self.moving.collide_aabb(aabb, &mut each);
        self.settled.collide_aabb(aabb, &mut each);
    }

    /// Visits the owner of every proxy whose stored volume the ray enters.
    pub fn query_ray(&self, origin: &Vec3, direction: &Vec3, mut visit: impl FnMut(ProxyId, u64)) {
        let proxies = &self.proxies;
        let mut each = |id: &ProxyId| {
            if let Some(p) = proxies[id.index()].as_ref() {
                visit(*id, p.owner);
            }
        };
        self.moving.collide_ray(origin, direction, &mut each);
        self.settled.collide_ray(origin, direction, &mut each);
    }

    fn proxy(&self, id: ProxyId) -> &Proxy {
        let Some(proxy) = self.proxies[id.index()].as_ref() else {
            panic!("stale proxy handle");
        };
        proxy
    }

    fn proxy_mut(&mut self, id: ProxyId) -> &mut Proxy {
        let Some(proxy) = self.proxies[id.index()].as_mut() else {
            panic!("stale proxy handle");
        };
        proxy
    }

    fn bucket_remove(&mut self, stage: usize, slot: usize) {
        self.stages[stage].swap_remove(slot);
        if let Some(&moved) = self.stages[stage].get(slot) {
            self.proxy_mut(moved).slot = slot;
        }
    }
}

fn filter_allows(proxies: &[Option<Proxy>], a: ProxyId, b: ProxyId) -> bool {
    let (Some(pa), Some(pb)) = (
        proxies[a.index()].as_ref(),
        proxies[b.index()].as_ref(),
    ) else {
        return false;
    };
    (pa.group & pb.mask) != 0 && (pb.group & pa.mask) != 0
}
