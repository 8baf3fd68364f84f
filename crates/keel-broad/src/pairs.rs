// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Overlapping-pair bookkeeping for the broad phase.

use rustc_hash::FxHashMap;

use crate::broadphase::ProxyId;

/// An unordered proxy pair, stored canonically with `a < b`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProxyPair {
    /// Smaller proxy id.
    pub a: ProxyId,
    /// Larger proxy id.
    pub b: ProxyId,
}

impl ProxyPair {
    /// Canonicalizes two proxy ids into a pair key.
    #[must_use]
    pub fn new(x: ProxyId, y: ProxyId) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }
}

/// Storage for the set of currently-overlapping proxy pairs.
///
/// The broad phase adds pairs as trees collide and retires them in its
/// cleanup sweep; consumers read the snapshot via [`Self::pairs`]. The
/// snapshot order is deterministic for a given mutation sequence.
pub trait OverlappingPairCache {
    /// Records a pair, returning `true` if it was not already present.
    fn add_pair(&mut self, x: ProxyId, y: ProxyId) -> bool;

    /// Removes a pair, returning `true` if it was present.
    fn remove_pair(&mut self, x: ProxyId, y: ProxyId) -> bool;

    /// Removes every pair involving `id`.
    fn remove_pairs_containing(&mut self, id: ProxyId);

    /// Current pair snapshot.
    fn pairs(&self) -> &[ProxyPair];

    /// Number of stored pairs.
    fn len(&self) -> usize {
        self.pairs().len()
    }

    /// Returns `true` when no pairs are stored.
    fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }

    /// Drops every pair.
    fn clear(&mut self);
}

/// Hash-backed pair cache: a map from canonical pair to its slot in a dense
/// pair list. Add, lookup and remove are O(1); removal swap-fills from the
/// tail.
#[derive(Debug, Default)]
pub struct HashedPairCache {
    map: FxHashMap<ProxyPair, usize>,
    list: Vec<ProxyPair>,
}

impl HashedPairCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverlappingPairCache for HashedPairCache {
    fn add_pair(&mut self, x: ProxyId, y: ProxyId) -> bool {
        let pair = ProxyPair::new(x, y);
        if self.map.contains_key(&pair) {
            return false;
        }
        self.map.insert(pair, self.list.len());
        self.list.push(pair);
        true
    }

    fn remove_pair(&mut self, x: ProxyId, y: ProxyId) -> bool {
        let pair = ProxyPair::new(x, y);
        let Some(slot) = self.map.remove(&pair) else {
            return false;
        };
        self.list.swap_remove(slot);
        if let Some(moved) = self.list.get(slot) {
            self.map.insert(*moved, slot);
        }
        true
    }

    fn remove_pairs_containing(&mut self, id: ProxyId) {
        let mut i = 0;
        while i < self.list.len() {
            let pair = self.list[i];
            if pair.a == id || pair.b == id {
                self.map.remove(&pair);
                self.list.swap_remove(i);
                if let Some(moved) = self.list.get(i) {
                    self.map.insert(*moved, i);
                }
            } else {
                i += 1;
            }
        }
    }

    fn pairs(&self) -> &[ProxyPair] {
        &self.list
    }

    fn clear(&mut self) {
        self.map.clear();
        self.list.clear();
    }
}
