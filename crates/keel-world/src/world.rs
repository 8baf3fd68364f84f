// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The discrete stepping loop.
//!
//! [`DiscreteWorld`] owns the bodies and the broadphase and orchestrates
//! everything else through collaborator traits. One substep runs, in
//! order: unconstrained motion prediction, broadphase refresh, pair
//! calculation, narrowphase dispatch, island partitioning, per-island
//! solving, transform integration with CCD clamping, auxiliary actions,
//! and activation bookkeeping.

use keel_broad::{BroadphaseConfig, DynamicBroadphase};
use keel_geom::{Aabb, Vec3};
use tracing::{debug, warn};

use crate::body::{ActivationState, BodyDesc, BodyHandle, BodySet, RigidBody};
use crate::collab::{
    Action, Constraint, ConstraintSolver, ContactManifold, ConvexSweeper, Dispatcher, IslandView,
    Shape, SolverInfo, SweepRequest,
};
use crate::islands::UnionFind;

/// Extents beyond this squared length mark a dynamic body's bounds as
/// degenerate.
const MAX_EXTENT_SQUARED: f32 = 1e12;

/// CCD hits closer than this fraction are ignored so touching bodies
/// cannot lock themselves in place.
const MIN_CCD_FRACTION: f32 = 1e-4;

/// World-level tuning. Everything the reference kept in ambient globals
/// lives here so that independent worlds never share state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WorldConfig {
    /// Acceleration applied to every dynamic body each step.
    pub gravity: Vec3,
    /// Linear speed below which a body's sleep timer runs.
    pub linear_sleep_threshold: f32,
    /// Angular speed below which a body's sleep timer runs.
    pub angular_sleep_threshold: f32,
    /// Seconds a body must stay slow before it may sleep; zero disables
    /// sleeping entirely.
    pub deactivation_time: f32,
    /// Solve each island separately instead of the whole world at once.
    pub split_islands: bool,
    /// Slack added around every body's bounds so contacts persist
    /// across small separations.
    pub contact_breaking_threshold: f32,
    /// Iteration budget forwarded to the solver.
    pub solver_iterations: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            linear_sleep_threshold: 0.8,
            angular_sleep_threshold: 1.0,
            deactivation_time: 2.0,
            split_islands: true,
            contact_breaking_threshold: 0.02,
            solver_iterations: 10,
        }
    }
}

/// Failures surfaced by the world's own API. Collaborator failures stay
/// inside the collaborators.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// The handle does not name a live body.
    #[error("unknown body handle {0:?}")]
    UnknownBody(BodyHandle),
    /// The shape reported non-finite or inverted bounds at the body's
    /// transform.
    #[error("shape bounds are degenerate at the given transform")]
    DegenerateBounds,
}

struct IslandGroup {
    bodies: Vec<BodyHandle>,
    manifolds: Vec<ContactManifold>,
    constraints: Vec<usize>,
    sleeping: bool,
}

/// A rigid-body world advanced by fixed-size substeps.
pub struct DiscreteWorld {
    config: WorldConfig,
    broadphase: DynamicBroadphase,
    bodies: Vec<Option<RigidBody>>,
    free: Vec<u32>,
    /// Insertion order of live handles; all per-step passes walk this so
    /// results never depend on arena slot reuse.
    order: Vec<BodyHandle>,
    dispatcher: Box<dyn Dispatcher>,
    solver: Box<dyn ConstraintSolver>,
    sweeper: Option<Box<dyn ConvexSweeper>>,
    constraints: Vec<Box<dyn Constraint>>,
    actions: Vec<Box<dyn Action>>,
    local_time: f32,
}

impl DiscreteWorld {
    /// Creates a world with a default broadphase.
    #[must_use]
    pub fn new(
        dispatcher: Box<dyn Dispatcher>,
        solver: Box<dyn ConstraintSolver>,
        config: WorldConfig,
    ) -> Self {
        Self::with_broadphase(
            dispatcher,
            solver,
            config,
            DynamicBroadphase::new(BroadphaseConfig::default()),
        )
    }

    /// Creates a world around a pre-configured broadphase.
    #[must_use]
    pub fn with_broadphase(
        dispatcher: Box<dyn Dispatcher>,
        solver: Box<dyn ConstraintSolver>,
        config: WorldConfig,
        broadphase: DynamicBroadphase,
    ) -> Self {
        Self {
            config,
            broadphase,
            bodies: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            dispatcher,
            solver,
            sweeper: None,
            constraints: Vec::new(),
            actions: Vec::new(),
            local_time: 0.0,
        }
    }

    /// Installs the convex-cast collaborator used for CCD clamping.
    /// Without one, fast bodies integrate unclamped.
    pub fn set_sweeper(&mut self, sweeper: Box<dyn ConvexSweeper>) {
        self.sweeper = Some(sweeper);
    }

    /// Registers an auxiliary action advanced once per substep.
    pub fn add_action(&mut self, action: Box<dyn Action>) {
        self.actions.push(action);
    }

    /// Registers a constraint and returns its index. Dynamic endpoints
    /// of a constraint always share an island.
    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint>) -> usize {
        self.constraints.push(constraint);
        self.constraints.len() - 1
    }

    /// Removes the constraint at `index`, shifting later indices down.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn remove_constraint(&mut self, index: usize) {
        self.constraints.remove(index);
    }

    /// Adds a body to the world and registers it with the broadphase.
    ///
    /// # Errors
    /// Returns [`WorldError::DegenerateBounds`] when the shape reports
    /// non-finite or inverted bounds at the initial transform.
    pub fn add_body(
        &mut self,
        desc: BodyDesc,
        shape: Box<dyn Shape>,
    ) -> Result<BodyHandle, WorldError> {
        let (min, max) = shape.aabb(&desc.transform);
        if !bounds_usable(&min, &max) {
            return Err(WorldError::DegenerateBounds);
        }
        let raw = self.free.pop().unwrap_or_else(|| {
            self.bodies.push(None);
            (self.bodies.len() - 1) as u32
        });
        let handle = BodyHandle::from_raw(raw);
        let mut body = RigidBody::new(desc, shape);
        let slack = Vec3::splat(self.config.contact_breaking_threshold);
        let aabb = Aabb::new(min.sub(&slack), max.add(&slack));
        body.proxy = Some(
            self.broadphase
                .create_proxy(aabb, u64::from(raw), body.group, body.mask),
        );
        self.bodies[raw as usize] = Some(body);
        self.order.push(handle);
        Ok(handle)
    }

    /// Removes a body, its broadphase proxy and any cached pairs.
    ///
    /// # Errors
    /// Returns [`WorldError::UnknownBody`] for a stale handle.
    pub fn remove_body(&mut self, handle: BodyHandle) -> Result<(), WorldError> {
        let slot = self
            .bodies
            .get_mut(handle.raw() as usize)
            .ok_or(WorldError::UnknownBody(handle))?;
        let body = slot.take().ok_or(WorldError::UnknownBody(handle))?;
        if let Some(proxy) = body.proxy {
            self.broadphase.destroy_proxy(proxy);
        }
        self.order.retain(|&h| h != handle);
        self.free.push(handle.raw());
        Ok(())
    }

    /// Shared access to a body.
    #[must_use]
    pub fn body(&self, handle: BodyHandle) -> Option<&RigidBody> {
        self.bodies.get(handle.raw() as usize)?.as_ref()
    }

    /// Exclusive access to a body.
    pub fn body_mut(&mut self, handle: BodyHandle) -> Option<&mut RigidBody> {
        self.bodies.get_mut(handle.raw() as usize)?.as_mut()
    }

    /// Live bodies in insertion order.
    pub fn bodies(&self) -> impl Iterator<Item = (BodyHandle, &RigidBody)> {
        self.order
            .iter()
            .filter_map(|&h| Some((h, self.bodies.get(h.raw() as usize)?.as_ref()?)))
    }

    /// Number of live bodies.
    #[must_use]
    pub fn body_count(&self) -> usize {
        self.order.len()
    }

    /// The broadphase, for queries and sweeper implementations.
    #[must_use]
    pub fn broadphase(&self) -> &DynamicBroadphase {
        &self.broadphase
    }

    /// World tuning.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Adds each dynamic body's weight to its force accumulator. Called
    /// automatically at the start of every stepped frame.
    pub fn apply_gravity(&mut self) {
        let gravity = self.config.gravity;
        for slot in &mut self.bodies {
            if let Some(body) = slot {
                if body.is_active() && !body.is_static_or_kinematic() {
                    body.apply_gravity(&gravity);
                }
            }
        }
    }

    /// Drops every body's accumulated forces. Called automatically at
    /// the end of every stepped frame.
    pub fn clear_forces(&mut self) {
        for slot in &mut self.bodies {
            if let Some(body) = slot {
                body.clear_forces();
            }
        }
    }

    /// Advances the world by `dt` seconds using substeps of
    /// `fixed_step`, executing at most `max_sub_steps` of them and
    /// carrying the remainder in an accumulator.
    ///
    /// `max_sub_steps == 0` degrades to a single variable-length substep
    /// of exactly `dt`, trading determinism for latency.
    ///
    /// Returns the number of substeps the elapsed time called for, which
    /// exceeds `max_sub_steps` when the simulation is falling behind.
    pub fn step_simulation(&mut self, dt: f32, max_sub_steps: usize, fixed_step: f32) -> usize {
        let mut fixed = fixed_step;
        let mut max = max_sub_steps;
        let mut substeps = 0usize;
        if max == 0 {
            // Variable-step fallback: consume dt in one go.
            fixed = dt;
            self.local_time = dt;
            if dt.abs() >= f32::EPSILON {
                substeps = 1;
                max = 1;
            }
        } else {
            self.local_time += dt;
            if self.local_time >= fixed {
                substeps = (self.local_time / fixed) as usize;
                self.local_time -= substeps as f32 * fixed;
            }
        }
        if substeps != 0 {
            self.save_kinematic_states(fixed);
            self.apply_gravity();
            let clamped = substeps.min(max);
            debug!(substeps, clamped, fixed, "stepping world");
            for _ in 0..clamped {
                self.single_step(fixed);
            }
        }
        self.clear_forces();
        substeps
    }

    fn single_step(&mut self, dt: f32) {
        self.predict_unconstrained_motion(dt);
        self.update_aabbs();
        self.broadphase.calculate_overlapping_pairs();
        self.dispatch_pairs();
        let islands = self.build_islands();
        self.solve(&islands, dt);
        self.integrate_transforms(dt);
        self.update_actions(dt);
        self.update_activation_state(dt);
    }

    fn save_kinematic_states(&mut self, dt: f32) {
        for slot in &mut self.bodies {
            if let Some(body) = slot {
                if body.is_kinematic() && body.is_active() {
                    body.save_kinematic_state(dt);
                }
            }
        }
    }

    fn predict_unconstrained_motion(&mut self, dt: f32) {
        for slot in &mut self.bodies {
            if let Some(body) = slot {
                if body.is_active() && !body.is_static_or_kinematic() {
                    body.integrate_velocities(dt);
                    body.apply_damping(dt);
                    body.predicted = body.predict_transform(dt);
                }
            }
        }
    }

    fn update_aabbs(&mut self) {
        let slack = Vec3::splat(self.config.contact_breaking_threshold);
        let bodies = &mut self.bodies;
        let broadphase = &mut self.broadphase;
        for &handle in &self.order {
            let Some(body) = bodies
                .get_mut(handle.raw() as usize)
                .and_then(Option::as_mut)
            else {
                continue;
            };
            if !body.is_active() {
                continue;
            }
            let (min, max) = body.shape.aabb(body.transform());
            let usable = bounds_usable(&min, &max)
                && (body.is_static() || max.sub(&min).length_squared() < MAX_EXTENT_SQUARED);
            if usable {
                if let Some(proxy) = body.proxy {
                    broadphase.set_aabb(proxy, Aabb::new(min.sub(&slack), max.add(&slack)));
                }
            } else {
                // Runaway or non-finite motion. Park the body instead of
                // poisoning the trees.
                body.force_activation_state(ActivationState::DisableSimulation);
                if !body.degenerate_warned {
                    body.degenerate_warned = true;
                    warn!(
                        body = handle.raw(),
                        "degenerate bounds, body removed from simulation"
                    );
                }
            }
        }
    }

    fn dispatch_pairs(&mut self) {
        let mut candidates = Vec::with_capacity(self.broadphase.pairs().len());
        for pair in self.broadphase.pairs() {
            let a = BodyHandle::from_raw(self.broadphase.proxy_owner(pair.a) as u32);
            let b = BodyHandle::from_raw(self.broadphase.proxy_owner(pair.b) as u32);
            let (Some(body_a), Some(body_b)) = (self.body(a), self.body(b)) else {
                continue;
            };
            if body_a.is_static_or_kinematic() && body_b.is_static_or_kinematic() {
                continue;
            }
            if !body_a.is_active() && !body_b.is_active() {
                continue;
            }
            candidates.push((a, b));
        }
        self.dispatcher
            .dispatch(&candidates, &mut BodySet::new(&mut self.bodies));
    }

    /// Unions bodies into islands over contacts and constraints, applies
    /// island-wide wake/sleep agreement, and returns the per-island work
    /// lists in deterministic (arena) order.
    fn build_islands(&mut self) -> Vec<IslandGroup> {
        let arena = self.bodies.len();
        let mut uf = UnionFind::new(arena);
        for manifold in self.dispatcher.manifolds() {
            if self.merges(manifold.body_a) && self.merges(manifold.body_b) {
                uf.unite(
                    manifold.body_a.raw() as usize,
                    manifold.body_b.raw() as usize,
                );
            }
        }
        for constraint in &self.constraints {
            let a = constraint.body_a();
            let b = constraint.body_b();
            if self.merges(a) && self.merges(b) {
                let awake = self.body(a).is_some_and(RigidBody::is_active)
                    || self.body(b).is_some_and(RigidBody::is_active);
                if awake {
                    uf.unite(a.raw() as usize, b.raw() as usize);
                }
            }
        }

        let roots: Vec<usize> = (0..arena).map(|i| uf.find(i)).collect();

        // Bucket non-static bodies by root, in insertion order.
        let mut group_of_root: Vec<Option<usize>> = vec![None; arena];
        let mut groups: Vec<IslandGroup> = Vec::new();
        for &handle in &self.order {
            let raw = handle.raw() as usize;
            let Some(body) = self.bodies[raw].as_ref() else {
                continue;
            };
            if body.is_static() {
                continue;
            }
            let root = roots[raw];
            let index = *group_of_root[root].get_or_insert_with(|| {
                groups.push(IslandGroup {
                    bodies: Vec::new(),
                    manifolds: Vec::new(),
                    constraints: Vec::new(),
                    sleeping: false,
                });
                groups.len() - 1
            });
            groups[index].bodies.push(handle);
        }
        for (raw, slot) in self.bodies.iter_mut().enumerate() {
            if let Some(body) = slot {
                body.island_tag = (!body.is_static()).then(|| roots[raw]);
            }
        }

        // An island sleeps only by unanimous agreement; one awake body
        // keeps (or wakes) the whole island.
        let deactivation_time = self.config.deactivation_time;
        for group in &mut groups {
            let all_want_sleep = group.bodies.iter().all(|&h| {
                self.bodies[h.raw() as usize]
                    .as_ref()
                    .is_some_and(|b| b.wants_sleeping(deactivation_time))
            });
            if all_want_sleep {
                group.sleeping = true;
                for &h in &group.bodies {
                    if let Some(body) = self.bodies[h.raw() as usize].as_mut() {
                        body.set_activation_state(ActivationState::IslandSleeping);
                    }
                }
            } else {
                for &h in &group.bodies {
                    if let Some(body) = self.bodies[h.raw() as usize].as_mut() {
                        if !body.is_active() {
                            body.set_activation_state(ActivationState::Active);
                            body.deactivation_timer = 0.0;
                        }
                    }
                }
            }
        }

        // Attach work to the island of its dynamic endpoint.
        for manifold in self.dispatcher.manifolds() {
            if let Some(index) =
                self.island_of(&roots, &group_of_root, manifold.body_a, manifold.body_b)
            {
                groups[index].manifolds.push(*manifold);
            }
        }
        for (i, constraint) in self.constraints.iter().enumerate() {
            if let Some(index) = self.island_of(
                &roots,
                &group_of_root,
                constraint.body_a(),
                constraint.body_b(),
            ) {
                groups[index].constraints.push(i);
            }
        }
        groups
    }

    fn merges(&self, handle: BodyHandle) -> bool {
        self.body(handle).is_some_and(|b| !b.is_static_or_kinematic())
    }

    fn island_of(
        &self,
        roots: &[usize],
        group_of_root: &[Option<usize>],
        a: BodyHandle,
        b: BodyHandle,
    ) -> Option<usize> {
        let pick = if self.merges(a) { a } else { b };
        if !self.merges(pick) {
            return None;
        }
        group_of_root[roots[pick.raw() as usize]]
    }

    fn solve(&mut self, islands: &[IslandGroup], dt: f32) {
        let info = SolverInfo {
            time_step: dt,
            num_iterations: self.config.solver_iterations,
        };
        if self.config.split_islands {
            for group in islands {
                if group.sleeping {
                    continue;
                }
                let view = IslandView {
                    bodies: &group.bodies,
                    manifolds: &group.manifolds,
                    constraints: &group.constraints,
                };
                self.solver
                    .solve_group(&view, &mut BodySet::new(&mut self.bodies), &info);
            }
        } else {
            let bodies: Vec<BodyHandle> = islands.iter().flat_map(|g| g.bodies.clone()).collect();
            let manifolds = self.dispatcher.manifolds().to_vec();
            let constraints: Vec<usize> = (0..self.constraints.len()).collect();
            let view = IslandView {
                bodies: &bodies,
                manifolds: &manifolds,
                constraints: &constraints,
            };
            self.solver
                .solve_group(&view, &mut BodySet::new(&mut self.bodies), &info);
        }
    }

    fn integrate_transforms(&mut self, dt: f32) {
        let bodies = &mut self.bodies;
        let broadphase = &self.broadphase;
        let sweeper = &mut self.sweeper;
        let dispatcher = &self.dispatcher;
        for &handle in &self.order {
            let Some(body) = bodies
                .get_mut(handle.raw() as usize)
                .and_then(Option::as_mut)
            else {
                continue;
            };
            body.hit_fraction = 1.0;
            if !body.is_active() || body.is_static_or_kinematic() {
                continue;
            }
            let predicted = body.predict_transform(dt);
            let mut committed = predicted;
            let motion = predicted
                .origin
                .sub(&body.transform().origin)
                .length_squared();
            let threshold = body.ccd_motion_threshold * body.ccd_motion_threshold;
            if threshold != 0.0 && threshold < motion && body.shape.is_convex() {
                if let Some(sweeper) = sweeper.as_mut() {
                    let touching: Vec<BodyHandle> = dispatcher
                        .manifolds()
                        .iter()
                        .filter(|m| m.contact_count > 0)
                        .filter_map(|m| {
                            if m.body_a == handle {
                                Some(m.body_b)
                            } else if m.body_b == handle {
                                Some(m.body_a)
                            } else {
                                None
                            }
                        })
                        .collect();
                    let request = SweepRequest {
                        radius: body.ccd_swept_sphere_radius,
                        from: body.transform().origin,
                        to: predicted.origin,
                        exclude: handle,
                        touching: &touching,
                        group: body.group,
                        mask: body.mask,
                    };
                    if let Some(hit) = sweeper.sweep(&request, broadphase) {
                        if hit.fraction > MIN_CCD_FRACTION && hit.fraction < 1.0 {
                            body.hit_fraction = hit.fraction;
                            committed = body.predict_transform(dt * hit.fraction);
                        }
                    }
                }
            }
            body.proceed_to_transform(committed);
        }
    }

    fn update_actions(&mut self, dt: f32) {
        let bodies = &mut self.bodies;
        for action in &mut self.actions {
            action.update(&mut BodySet::new(bodies), dt);
        }
    }

    fn update_activation_state(&mut self, dt: f32) {
        let config = &self.config;
        for slot in &mut self.bodies {
            let Some(body) = slot else { continue };
            body.update_deactivation(
                dt,
                config.linear_sleep_threshold,
                config.angular_sleep_threshold,
            );
            if body.wants_sleeping(config.deactivation_time) {
                if body.is_static_or_kinematic() {
                    body.set_activation_state(ActivationState::IslandSleeping);
                } else {
                    if body.activation_state() == ActivationState::Active {
                        body.set_activation_state(ActivationState::WantsDeactivation);
                    }
                    if body.activation_state() == ActivationState::IslandSleeping {
                        body.set_linear_velocity(Vec3::ZERO);
                        body.set_angular_velocity(Vec3::ZERO);
                    }
                }
            } else if body.activation_state() != ActivationState::DisableDeactivation {
                body.set_activation_state(ActivationState::Active);
            }
        }
    }
}

fn bounds_usable(min: &Vec3, max: &Vec3) -> bool {
    min.is_finite()
        && max.is_finite()
        && min.x() <= max.x()
        && min.y() <= max.y()
        && min.z() <= max.z()
}
