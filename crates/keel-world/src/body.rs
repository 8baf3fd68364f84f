// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rigid bodies: state, integration helpers and activation bookkeeping.
//!
//! A body is a point of mass with a rigid transform, velocities, and a
//! shape capability used only for bounds. All integration here is
//! explicit Euler with an exponential-map rotation update; the constraint
//! solver collaborator owns anything smarter.

use keel_geom::{Mat3, Transform, Vec3};

use crate::collab::Shape;

/// Rotation per substep is clamped to this angle before integration to
/// keep the exponential map well-conditioned.
pub const ANGULAR_MOTION_THRESHOLD: f32 = core::f32::consts::FRAC_PI_4;

const MAX_ANGULAR_VELOCITY: f32 = core::f32::consts::FRAC_PI_2;

/// Stable identifier for a body stored in a [`crate::DiscreteWorld`]
/// arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BodyHandle(u32);

impl BodyHandle {
    /// Reconstructs a handle from its raw index.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw arena index of this handle.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Sleep/wake lifecycle of a body.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActivationState {
    /// Simulated normally.
    Active,
    /// Below the sleep thresholds long enough; sleeps once its whole
    /// island agrees.
    WantsDeactivation,
    /// Asleep. Velocities are held at zero until something wakes it.
    IslandSleeping,
    /// Simulated normally and never considered for sleeping.
    DisableDeactivation,
    /// Excluded from simulation entirely, e.g. after a degenerate-bounds
    /// diagnosis.
    DisableSimulation,
}

/// Construction-time parameters for a rigid body.
///
/// `mass == 0.0` makes the body static. `inertia` is the diagonal of the
/// local inertia tensor; a zero component locks rotation about that axis.
#[derive(Debug, Clone)]
pub struct BodyDesc {
    /// Initial world transform.
    pub transform: Transform,
    /// Mass in kilograms; zero means static.
    pub mass: f32,
    /// Diagonal local inertia tensor.
    pub inertia: Vec3,
    /// Linear velocity damping factor per second, in `[0, 1]`.
    pub linear_damping: f32,
    /// Angular velocity damping factor per second, in `[0, 1]`.
    pub angular_damping: f32,
    /// Kinematic bodies are moved by the caller and never integrated.
    pub kinematic: bool,
    /// Broadphase filter group bits.
    pub group: u16,
    /// Broadphase filter mask bits.
    pub mask: u16,
    /// Motion per substep beyond which a CCD sweep runs; zero disables
    /// CCD for this body.
    pub ccd_motion_threshold: f32,
    /// Radius of the synthetic sphere swept during CCD.
    pub ccd_swept_sphere_radius: f32,
}

impl Default for BodyDesc {
    fn default() -> Self {
        Self {
            transform: Transform::IDENTITY,
            mass: 1.0,
            inertia: Vec3::splat(1.0),
            linear_damping: 0.0,
            angular_damping: 0.0,
            kinematic: false,
            group: u16::MAX,
            mask: u16::MAX,
            ccd_motion_threshold: 0.0,
            ccd_swept_sphere_radius: 0.0,
        }
    }
}

/// A simulated rigid body.
pub struct RigidBody {
    pub(crate) shape: Box<dyn Shape>,
    transform: Transform,
    /// Transform at the last kinematic snapshot, used to derive
    /// velocities for caller-driven bodies.
    kinematic_reference: Transform,
    pub(crate) predicted: Transform,
    linear_velocity: Vec3,
    angular_velocity: Vec3,
    total_force: Vec3,
    total_torque: Vec3,
    inv_mass: f32,
    inv_inertia_local: Vec3,
    linear_damping: f32,
    angular_damping: f32,
    kinematic: bool,
    activation: ActivationState,
    pub(crate) deactivation_timer: f32,
    pub(crate) hit_fraction: f32,
    /// Set when this body's degenerate bounds have been logged, so the
    /// diagnosis is reported once per body, not once per substep.
    pub(crate) degenerate_warned: bool,
    pub(crate) group: u16,
    pub(crate) mask: u16,
    pub(crate) ccd_motion_threshold: f32,
    pub(crate) ccd_swept_sphere_radius: f32,
    pub(crate) proxy: Option<keel_broad::ProxyId>,
    pub(crate) island_tag: Option<usize>,
}

impl RigidBody {
    pub(crate) fn new(desc: BodyDesc, shape: Box<dyn Shape>) -> Self {
        let inv = |i: f32| if i > 0.0 { 1.0 / i } else { 0.0 };
        Self {
            shape,
            transform: desc.transform,
            kinematic_reference: desc.transform,
            predicted: desc.transform,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            total_force: Vec3::ZERO,
            total_torque: Vec3::ZERO,
            inv_mass: inv(desc.mass),
            inv_inertia_local: Vec3::new(
                inv(desc.inertia.x()),
                inv(desc.inertia.y()),
                inv(desc.inertia.z()),
            ),
            linear_damping: desc.linear_damping.clamp(0.0, 1.0),
            angular_damping: desc.angular_damping.clamp(0.0, 1.0),
            kinematic: desc.kinematic,
            activation: ActivationState::Active,
            deactivation_timer: 0.0,
            hit_fraction: 1.0,
            degenerate_warned: false,
            group: desc.group,
            mask: desc.mask,
            ccd_motion_threshold: desc.ccd_motion_threshold,
            ccd_swept_sphere_radius: desc.ccd_swept_sphere_radius,
            proxy: None,
            island_tag: None,
        }
    }

    /// Current world transform.
    #[must_use]
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Transform predicted at the start of the current substep, before
    /// solving and CCD clamping rewrote it.
    #[must_use]
    pub fn predicted_transform(&self) -> &Transform {
        &self.predicted
    }

    /// Island the body belonged to after the last substep; `None` for
    /// static bodies and before the first step.
    #[must_use]
    pub fn island_tag(&self) -> Option<usize> {
        self.island_tag
    }

    /// Moves the body. For kinematic bodies this is the intended way to
    /// drive motion; velocities are recovered at the next step.
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    /// Linear velocity in world space.
    #[must_use]
    pub fn linear_velocity(&self) -> Vec3 {
        self.linear_velocity
    }

    /// Sets the linear velocity and leaves activation untouched.
    pub fn set_linear_velocity(&mut self, v: Vec3) {
        self.linear_velocity = v;
    }

    /// Angular velocity in world space.
    #[must_use]
    pub fn angular_velocity(&self) -> Vec3 {
        self.angular_velocity
    }

    /// Sets the angular velocity and leaves activation untouched.
    pub fn set_angular_velocity(&mut self, v: Vec3) {
        self.angular_velocity = v;
    }

    /// Inverse mass; zero for static bodies.
    #[must_use]
    pub fn inv_mass(&self) -> f32 {
        self.inv_mass
    }

    /// Current activation state.
    #[must_use]
    pub fn activation_state(&self) -> ActivationState {
        self.activation
    }

    /// Forces a new activation state. `DisableDeactivation` and
    /// `DisableSimulation` are sticky; use this to clear them.
    pub fn force_activation_state(&mut self, state: ActivationState) {
        self.activation = state;
    }

    pub(crate) fn set_activation_state(&mut self, state: ActivationState) {
        if !matches!(
            self.activation,
            ActivationState::DisableDeactivation | ActivationState::DisableSimulation
        ) {
            self.activation = state;
        }
    }

    /// Wakes the body and resets its sleep timer.
    pub fn activate(&mut self) {
        self.set_activation_state(ActivationState::Active);
        self.deactivation_timer = 0.0;
    }

    /// `true` unless the body is asleep or removed from simulation.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(
            self.activation,
            ActivationState::IslandSleeping | ActivationState::DisableSimulation
        )
    }

    /// Static bodies have zero inverse mass and are not kinematic.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.inv_mass == 0.0 && !self.kinematic
    }

    /// `true` when the body never integrates its own motion.
    #[must_use]
    pub fn is_static_or_kinematic(&self) -> bool {
        self.inv_mass == 0.0 || self.kinematic
    }

    /// `true` for caller-driven bodies.
    #[must_use]
    pub fn is_kinematic(&self) -> bool {
        self.kinematic
    }

    /// Time-of-impact fraction committed by the last substep; `1.0`
    /// when motion was not CCD-clamped.
    #[must_use]
    pub fn hit_fraction(&self) -> f32 {
        self.hit_fraction
    }

    /// Accumulates a force through the center of mass until the end of
    /// the current step.
    pub fn apply_central_force(&mut self, force: &Vec3) {
        self.total_force = self.total_force.add(force);
    }

    /// Accumulates a torque until the end of the current step.
    pub fn apply_torque(&mut self, torque: &Vec3) {
        self.total_torque = self.total_torque.add(torque);
    }

    /// Drops all accumulated forces and torques.
    pub fn clear_forces(&mut self) {
        self.total_force = Vec3::ZERO;
        self.total_torque = Vec3::ZERO;
    }

    pub(crate) fn apply_gravity(&mut self, gravity: &Vec3) {
        if self.inv_mass == 0.0 {
            return;
        }
        self.apply_central_force(&gravity.scale(1.0 / self.inv_mass));
    }

    pub(crate) fn integrate_velocities(&mut self, dt: f32) {
        if self.is_static_or_kinematic() {
            return;
        }
        self.linear_velocity = self
            .linear_velocity
            .add(&self.total_force.scale(self.inv_mass * dt));
        self.angular_velocity = self
            .angular_velocity
            .add(&self.inv_inertia_world(&self.total_torque).scale(dt));
        // Bound rotation to half a turn per unit time; faster spins are
        // not representable by the exponential-map update.
        let speed = self.angular_velocity.length();
        if speed * dt > MAX_ANGULAR_VELOCITY {
            self.angular_velocity = self
                .angular_velocity
                .scale(MAX_ANGULAR_VELOCITY / (speed * dt));
        }
    }

    pub(crate) fn apply_damping(&mut self, dt: f32) {
        self.linear_velocity = self
            .linear_velocity
            .scale((1.0 - self.linear_damping).powf(dt));
        self.angular_velocity = self
            .angular_velocity
            .scale((1.0 - self.angular_damping).powf(dt));
    }

    /// Transform the body would reach after `dt` seconds of free flight
    /// with its current velocities.
    #[must_use]
    pub fn predict_transform(&self, dt: f32) -> Transform {
        integrate_transform(
            &self.transform,
            &self.linear_velocity,
            &self.angular_velocity,
            dt,
        )
    }

    pub(crate) fn proceed_to_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    /// Recovers velocities for a kinematic body from the transform the
    /// caller committed since the previous snapshot.
    pub(crate) fn save_kinematic_state(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        self.linear_velocity = self
            .transform
            .origin
            .sub(&self.kinematic_reference.origin)
            .scale(1.0 / dt);
        let delta = self
            .transform
            .basis
            .mul(&self.kinematic_reference.basis.transposed());
        let (axis, angle) = axis_angle_of(&delta);
        self.angular_velocity = axis.scale(angle / dt);
        self.kinematic_reference = self.transform;
    }

    pub(crate) fn update_deactivation(&mut self, dt: f32, linear_threshold: f32, angular_threshold: f32) {
        if matches!(
            self.activation,
            ActivationState::IslandSleeping | ActivationState::DisableDeactivation
        ) {
            return;
        }
        if self.linear_velocity.length_squared() < linear_threshold * linear_threshold
            && self.angular_velocity.length_squared() < angular_threshold * angular_threshold
        {
            self.deactivation_timer += dt;
        } else {
            self.deactivation_timer = 0.0;
        }
    }

    pub(crate) fn wants_sleeping(&self, deactivation_time: f32) -> bool {
        if deactivation_time == 0.0 {
            return false;
        }
        match self.activation {
            ActivationState::DisableDeactivation => false,
            ActivationState::IslandSleeping | ActivationState::WantsDeactivation => true,
            _ => self.deactivation_timer > deactivation_time,
        }
    }

    fn inv_inertia_world(&self, torque: &Vec3) -> Vec3 {
        let local = self.transform.basis.transpose_transform(torque);
        self.transform
            .basis
            .transform(&local.mul(&self.inv_inertia_local))
    }
}

/// Explicit Euler position update plus an exponential-map rotation
/// update, with the rotation angle clamped to
/// [`ANGULAR_MOTION_THRESHOLD`] per call.
#[must_use]
pub fn integrate_transform(
    transform: &Transform,
    linear_velocity: &Vec3,
    angular_velocity: &Vec3,
    dt: f32,
) -> Transform {
    let origin = transform.origin.add(&linear_velocity.scale(dt));
    let mut speed = angular_velocity.length();
    if speed * dt > ANGULAR_MOTION_THRESHOLD {
        speed = ANGULAR_MOTION_THRESHOLD / dt;
    }
    if speed * dt <= f32::EPSILON {
        return Transform::new(transform.basis, origin);
    }
    let rotation = Mat3::from_axis_angle(angular_velocity, speed * dt);
    Transform::new(rotation.mul(&transform.basis), origin)
}

/// Axis and angle of a rotation matrix; the zero axis for a rotation
/// close to identity.
fn axis_angle_of(m: &Mat3) -> (Vec3, f32) {
    let trace = m.row(0).x() + m.row(1).y() + m.row(2).z();
    let angle = ((trace - 1.0) * 0.5).clamp(-1.0, 1.0).acos();
    let axis = Vec3::new(
        m.row(2).y() - m.row(1).z(),
        m.row(0).z() - m.row(2).x(),
        m.row(1).x() - m.row(0).y(),
    );
    if axis.length_squared() <= f32::EPSILON {
        return (Vec3::ZERO, 0.0);
    }
    (axis.normalize(), angle)
}

/// Mutable view over the world's body arena, handed to solver and
/// action collaborators.
pub struct BodySet<'a> {
    slots: &'a mut [Option<RigidBody>],
}

impl<'a> BodySet<'a> {
    pub(crate) fn new(slots: &'a mut [Option<RigidBody>]) -> Self {
        Self { slots }
    }

    /// Shared access to a body, if the handle is live.
    #[must_use]
    pub fn body(&self, handle: BodyHandle) -> Option<&RigidBody> {
        self.slots.get(handle.raw() as usize)?.as_ref()
    }

    /// Exclusive access to a body, if the handle is live.
    pub fn body_mut(&mut self, handle: BodyHandle) -> Option<&mut RigidBody> {
        self.slots.get_mut(handle.raw() as usize)?.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PointShape;

    impl Shape for PointShape {
        fn aabb(&self, xf: &Transform) -> (Vec3, Vec3) {
            (xf.origin, xf.origin)
        }

        fn is_convex(&self) -> bool {
            true
        }
    }

    fn body(desc: BodyDesc) -> RigidBody {
        RigidBody::new(desc, Box::new(PointShape))
    }

    #[test]
    fn gravity_accumulates_into_velocity_once_integrated() {
        let mut b = body(BodyDesc {
            mass: 2.0,
            ..BodyDesc::default()
        });
        b.apply_gravity(&Vec3::new(0.0, -10.0, 0.0));
        b.integrate_velocities(0.5);
        let v = b.linear_velocity();
        assert!((v.y() + 5.0).abs() < 1e-6, "got {v:?}");
    }

    #[test]
    fn static_bodies_ignore_forces() {
        let mut b = body(BodyDesc {
            mass: 0.0,
            ..BodyDesc::default()
        });
        b.apply_gravity(&Vec3::new(0.0, -10.0, 0.0));
        b.integrate_velocities(1.0);
        assert_eq!(b.linear_velocity(), Vec3::ZERO);
    }

    #[test]
    fn integrate_transform_moves_along_velocity() {
        let xf = integrate_transform(
            &Transform::IDENTITY,
            &Vec3::new(3.0, 0.0, 0.0),
            &Vec3::ZERO,
            0.5,
        );
        assert!((xf.origin.x() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn rotation_update_is_clamped_per_call() {
        // A wild spin advances by at most the motion threshold.
        let spin = Vec3::new(0.0, 0.0, 1000.0);
        let xf = integrate_transform(&Transform::IDENTITY, &Vec3::ZERO, &spin, 1.0);
        let rotated = xf.basis.transform(&Vec3::new(1.0, 0.0, 0.0));
        let angle = rotated.y().atan2(rotated.x());
        assert!((angle - ANGULAR_MOTION_THRESHOLD).abs() < 1e-4);
    }

    #[test]
    fn kinematic_state_recovers_linear_velocity() {
        let mut b = body(BodyDesc {
            mass: 0.0,
            kinematic: true,
            ..BodyDesc::default()
        });
        b.set_transform(Transform::new(Mat3::IDENTITY, Vec3::new(2.0, 0.0, 0.0)));
        b.save_kinematic_state(0.5);
        let v = b.linear_velocity();
        assert!((v.x() - 4.0).abs() < 1e-5);
    }

    #[test]
    fn kinematic_state_recovers_angular_velocity() {
        let mut b = body(BodyDesc {
            mass: 0.0,
            kinematic: true,
            ..BodyDesc::default()
        });
        let quarter = Mat3::from_axis_angle(&Vec3::new(0.0, 0.0, 1.0), 0.5);
        b.set_transform(Transform::new(quarter, Vec3::ZERO));
        b.save_kinematic_state(1.0);
        let w = b.angular_velocity();
        assert!((w.z() - 0.5).abs() < 1e-4, "got {w:?}");
    }

    #[test]
    fn deactivation_timer_accumulates_only_below_thresholds() {
        let mut b = body(BodyDesc::default());
        b.update_deactivation(0.5, 0.8, 1.0);
        b.update_deactivation(0.5, 0.8, 1.0);
        assert!(!b.wants_sleeping(2.0));
        b.update_deactivation(1.5, 0.8, 1.0);
        assert!(b.wants_sleeping(2.0));
        b.set_linear_velocity(Vec3::new(5.0, 0.0, 0.0));
        b.update_deactivation(0.5, 0.8, 1.0);
        assert!(!b.wants_sleeping(2.0));
    }

    #[test]
    fn disable_deactivation_never_sleeps() {
        let mut b = body(BodyDesc::default());
        b.force_activation_state(ActivationState::DisableDeactivation);
        b.update_deactivation(100.0, 0.8, 1.0);
        assert!(!b.wants_sleeping(2.0));
    }
}
