// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![doc = r"Rigid-body world stepping for Keel.

[`DiscreteWorld`] advances a set of rigid bodies by fixed-size substeps,
carrying leftover wall-clock time in an accumulator. Each substep predicts
unconstrained motion, refreshes the broad phase, dispatches narrowphase
work, partitions bodies into independent islands with a union-find pass,
invokes the constraint solver per island, integrates transforms with a
CCD sweep clamp for fast movers, and finally updates per-body sleep state.

The world orchestrates but never implements narrowphase contact
generation, constraint solving, shape geometry or convex casting; those
arrive through the capability traits in [`collab`]. Bodies live in an
arena addressed by [`BodyHandle`]; all per-step passes walk bodies in
insertion order so a run is reproducible regardless of slot reuse.
"]

/// Rigid-body state and integration.
pub mod body;
/// Collaborator capability traits.
pub mod collab;
mod islands;
/// The stepping loop.
pub mod world;

pub use body::{
    integrate_transform, ActivationState, BodyDesc, BodyHandle, BodySet, RigidBody,
    ANGULAR_MOTION_THRESHOLD,
};
pub use collab::{
    Action, Constraint, ConstraintSolver, ContactManifold, ConvexSweeper, Dispatcher, IslandView,
    Shape, SolverInfo, SweepHit, SweepRequest,
};
pub use world::{DiscreteWorld, WorldConfig, WorldError};
