// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![doc = r"Broad-phase collision detection for Keel.

Two layers:
- `tree` — an arena-backed dynamic bounding-volume tree with greedy
  insertion, lazy-reinsertion updates, incremental self-optimization and a
  family of iterative (stack-based, never recursive) traversals.
- `broadphase` — the staged two-tree broad phase: recently-moved proxies
  live in a `moving` tree that is updated aggressively, proxies that have
  not moved for a stage cycle migrate to a `settled` tree that is only
  re-optimized. Overlapping pairs accumulate in a hashed pair cache and are
  retired by the cleanup sweep one step after the proxies separate.

Determinism: node handles are arena indices, pair keys are canonicalized by
proxy-id order, and tree rotation ties are broken by arena-index comparison.
Two runs with the same mutation sequence produce the same trees and pairs.
"]

/// Staged two-tree broad phase and proxy management.
pub mod broadphase;
/// Overlapping-pair cache.
pub mod pairs;
/// Dynamic bounding-volume tree.
pub mod tree;

pub use broadphase::{BroadphaseConfig, DynamicBroadphase, ProxyId};
pub use pairs::{HashedPairCache, OverlappingPairCache, ProxyPair};
pub use tree::{DynamicTree, NodeId, TreeError};
