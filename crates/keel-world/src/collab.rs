// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Capability traits for everything the stepping loop orchestrates but
//! does not implement.
//!
//! Narrowphase contact generation, constraint solving, shape geometry
//! and convex casting all live behind these seams. The world only ever
//! needs bounds from a shape, manifolds from a dispatcher, and a
//! time-of-impact fraction from a sweeper.

use keel_broad::DynamicBroadphase;
use keel_geom::{Transform, Vec3};

use crate::body::{BodyHandle, BodySet};

/// Minimal collision-shape capability: world-space bounds plus a
/// three-way topology tag.
///
/// The returned corners are deliberately raw vectors, not a validated
/// box: the world inspects them for degeneracy (non-finite or absurdly
/// large values) before pushing anything into the broadphase.
pub trait Shape {
    /// World-space bounds of the shape under `transform`, as raw
    /// `(min, max)` corners.
    fn aabb(&self, transform: &Transform) -> (Vec3, Vec3);

    /// Convex shapes are eligible for CCD sweeps.
    fn is_convex(&self) -> bool {
        false
    }

    /// Concave shapes, e.g. triangle meshes.
    fn is_concave(&self) -> bool {
        false
    }

    /// Compound shapes aggregating children.
    fn is_compound(&self) -> bool {
        false
    }
}

/// A persistent contact between two bodies, produced and refreshed by
/// the dispatcher.
#[derive(Debug, Copy, Clone)]
pub struct ContactManifold {
    /// First body of the pair.
    pub body_a: BodyHandle,
    /// Second body of the pair.
    pub body_b: BodyHandle,
    /// Number of live contact points.
    pub contact_count: usize,
}

/// Narrowphase collaborator: turns broadphase pairs into contact
/// manifolds.
///
/// The world calls [`Dispatcher::dispatch`] once per substep with every
/// pair that passed collision filtering, then reads the manifold list
/// back for island partitioning and solving. Implementations own
/// manifold persistence across steps.
pub trait Dispatcher {
    /// Processes the step's candidate pairs.
    fn dispatch(&mut self, pairs: &[(BodyHandle, BodyHandle)], bodies: &mut BodySet<'_>);

    /// Manifolds currently alive, in a deterministic order.
    fn manifolds(&self) -> &[ContactManifold];
}

/// Tuning handed to the solver for one group.
#[derive(Debug, Copy, Clone)]
pub struct SolverInfo {
    /// Substep length in seconds.
    pub time_step: f32,
    /// Iteration budget for iterative solvers.
    pub num_iterations: u32,
}

/// One island's worth of work for the constraint solver.
#[derive(Debug)]
pub struct IslandView<'a> {
    /// Bodies in the island.
    pub bodies: &'a [BodyHandle],
    /// Contact manifolds whose bodies are in the island.
    pub manifolds: &'a [ContactManifold],
    /// Indices into the world's constraint list for this island.
    pub constraints: &'a [usize],
}

/// Constraint-solver collaborator, invoked once per island (or once for
/// the whole world when island splitting is disabled).
pub trait ConstraintSolver {
    /// Resolves one independent group of bodies.
    fn solve_group(&mut self, island: &IslandView<'_>, bodies: &mut BodySet<'_>, info: &SolverInfo);
}

/// A two-body constraint. Solving happens inside the
/// [`ConstraintSolver`]; the world only needs the endpoints to build
/// islands, so dynamic constrained bodies always share an island even
/// without contact.
pub trait Constraint {
    /// First constrained body.
    fn body_a(&self) -> BodyHandle;

    /// Second constrained body.
    fn body_b(&self) -> BodyHandle;
}

/// A CCD sweep request: a sphere of `radius` cast from `from` to `to`.
#[derive(Debug, Copy, Clone)]
pub struct SweepRequest<'a> {
    /// Swept-sphere radius.
    pub radius: f32,
    /// Sweep start, the body's current center.
    pub from: Vec3,
    /// Sweep end, the body's predicted center.
    pub to: Vec3,
    /// The swept body itself, to be ignored by the cast.
    pub exclude: BodyHandle,
    /// Bodies the swept body already has live contacts with. Hits
    /// against these must be ignored; clamping against an existing
    /// contact would freeze the pair in place.
    pub touching: &'a [BodyHandle],
    /// Collision filter group of the swept body.
    pub group: u16,
    /// Collision filter mask of the swept body.
    pub mask: u16,
}

/// Earliest hit found by a sweep.
#[derive(Debug, Copy, Clone)]
pub struct SweepHit {
    /// Time-of-impact fraction along the sweep, in `(0, 1]`.
    pub fraction: f32,
    /// Surface normal at the hit.
    pub normal: Vec3,
}

/// Convex-cast collaborator used for CCD motion clamping.
///
/// Implementations must skip `request.exclude` and everything in
/// `request.touching`.
pub trait ConvexSweeper {
    /// Casts a sphere through the world, typically by walking
    /// `broadphase` and narrowing against exact geometry.
    fn sweep(
        &mut self,
        request: &SweepRequest<'_>,
        broadphase: &DynamicBroadphase,
    ) -> Option<SweepHit>;
}

/// Per-step auxiliary behaviour (vehicles, character controllers),
/// advanced after solving and integration.
pub trait Action {
    /// Advances the action by one substep.
    fn update(&mut self, bodies: &mut BodySet<'_>, dt: f32);
}
