// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Whole-world scenarios: gravity, sleep, islands, CCD clamping and
//! degenerate-motion handling.
#![allow(clippy::unwrap_used)]

use std::cell::RefCell;
use std::rc::Rc;

use keel_broad::DynamicBroadphase;
use keel_geom::{Transform, Vec3};
use proptest::prelude::*;
use keel_world::{
    ActivationState, BodyDesc, BodyHandle, BodySet, ConstraintSolver, ContactManifold,
    ConvexSweeper, DiscreteWorld, Dispatcher, IslandView, RigidBody, Shape, SolverInfo, SweepHit,
    SweepRequest, WorldConfig,
};

struct BoxShape {
    half: Vec3,
}

impl Shape for BoxShape {
    fn aabb(&self, xf: &Transform) -> (Vec3, Vec3) {
        (xf.origin.sub(&self.half), xf.origin.add(&self.half))
    }

    fn is_convex(&self) -> bool {
        true
    }
}

fn unit_box() -> Box<BoxShape> {
    Box::new(BoxShape {
        half: Vec3::splat(0.5),
    })
}

fn at(x: f32, y: f32, z: f32) -> Transform {
    Transform::new(keel_geom::Mat3::IDENTITY, Vec3::new(x, y, z))
}

/// Produces one single-point manifold per dispatched pair, refreshed
/// every substep.
#[derive(Default)]
struct TouchDispatcher {
    manifolds: Vec<ContactManifold>,
}

impl Dispatcher for TouchDispatcher {
    fn dispatch(&mut self, pairs: &[(BodyHandle, BodyHandle)], _bodies: &mut BodySet<'_>) {
        self.manifolds = pairs
            .iter()
            .map(|&(body_a, body_b)| ContactManifold {
                body_a,
                body_b,
                contact_count: 1,
            })
            .collect();
    }

    fn manifolds(&self) -> &[ContactManifold] {
        &self.manifolds
    }
}

struct NoopSolver;

impl ConstraintSolver for NoopSolver {
    fn solve_group(
        &mut self,
        _island: &IslandView<'_>,
        _bodies: &mut BodySet<'_>,
        _info: &SolverInfo,
    ) {
    }
}

/// Records the body sets each `solve_group` call received.
struct RecordingSolver {
    islands: Rc<RefCell<Vec<Vec<BodyHandle>>>>,
}

impl ConstraintSolver for RecordingSolver {
    fn solve_group(
        &mut self,
        island: &IslandView<'_>,
        _bodies: &mut BodySet<'_>,
        _info: &SolverInfo,
    ) {
        self.islands.borrow_mut().push(island.bodies.to_vec());
    }
}

#[test]
fn free_fall_matches_explicit_euler() {
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig::default(),
    );
    let body = world
        .add_body(
            BodyDesc {
                transform: at(0.0, 100.0, 0.0),
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    for _ in 0..8 {
        world.step_simulation(0.125, 1, 0.125);
    }
    let b = world.body(body).unwrap();
    // One second of gravity in eight substeps.
    assert!((b.linear_velocity().y() + 9.81).abs() < 1e-3);
    assert!(b.transform().origin.y() < 100.0);
}

#[test]
fn resting_body_sleeps_after_the_deactivation_time() {
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    let body = world.add_body(BodyDesc::default(), unit_box()).unwrap();
    // 2.5 seconds at rest, past the 2.0s deactivation window.
    for _ in 0..150 {
        world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    }
    let b = world.body(body).unwrap();
    assert_eq!(b.activation_state(), ActivationState::IslandSleeping);
    assert_eq!(b.linear_velocity(), Vec3::ZERO);
    assert!(!b.is_active());
}

#[test]
fn an_awake_neighbor_wakes_a_sleeping_island_member() {
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    let sleeper = world.add_body(BodyDesc::default(), unit_box()).unwrap();
    let mover = world
        .add_body(
            BodyDesc {
                transform: at(0.6, 0.0, 0.0),
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world
        .body_mut(sleeper)
        .unwrap()
        .force_activation_state(ActivationState::IslandSleeping);
    world
        .body_mut(mover)
        .unwrap()
        .set_linear_velocity(Vec3::new(2.0, 0.0, 0.0));
    world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    assert_eq!(
        world.body(sleeper).unwrap().activation_state(),
        ActivationState::Active
    );
}

#[test]
fn separated_clusters_solve_as_independent_islands() {
    let islands = Rc::new(RefCell::new(Vec::new()));
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(RecordingSolver {
            islands: Rc::clone(&islands),
        }),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    // Two touching pairs, 100 units apart.
    for base in [0.0, 100.0] {
        for offset in [0.0, 0.6] {
            world
                .add_body(
                    BodyDesc {
                        transform: at(base + offset, 0.0, 0.0),
                        ..BodyDesc::default()
                    },
                    unit_box(),
                )
                .unwrap();
        }
    }
    world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    let groups = islands.borrow();
    assert_eq!(groups.len(), 2);
    for group in &*groups {
        assert_eq!(group.len(), 2);
    }
}

#[test]
fn a_shared_kinematic_platform_does_not_merge_islands() {
    let islands = Rc::new(RefCell::new(Vec::new()));
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(RecordingSolver {
            islands: Rc::clone(&islands),
        }),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    let _platform = world
        .add_body(
            BodyDesc {
                mass: 0.0,
                kinematic: true,
                ..BodyDesc::default()
            },
            Box::new(BoxShape {
                half: Vec3::new(5.0, 0.5, 5.0),
            }),
        )
        .unwrap();
    let left = world
        .add_body(
            BodyDesc {
                transform: at(-2.0, 0.9, 0.0),
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    let right = world
        .add_body(
            BodyDesc {
                transform: at(2.0, 0.9, 0.0),
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    // Both boxes rest on the platform, but resting on caller-driven
    // geometry must not couple them into one solve group.
    let groups = islands.borrow();
    let solo = |h: BodyHandle| groups.iter().any(|g| g.as_slice() == [h]);
    assert!(solo(left), "left box is not its own island: {groups:?}");
    assert!(solo(right), "right box is not its own island: {groups:?}");
    assert!(!groups
        .iter()
        .any(|g| g.contains(&left) && g.contains(&right)));
}

#[test]
fn constrained_bodies_share_an_island_without_contact() {
    struct Link(BodyHandle, BodyHandle);
    impl keel_world::Constraint for Link {
        fn body_a(&self) -> BodyHandle {
            self.0
        }

        fn body_b(&self) -> BodyHandle {
            self.1
        }
    }

    let islands = Rc::new(RefCell::new(Vec::new()));
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(RecordingSolver {
            islands: Rc::clone(&islands),
        }),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    let a = world.add_body(BodyDesc::default(), unit_box()).unwrap();
    let b = world
        .add_body(
            BodyDesc {
                transform: at(50.0, 0.0, 0.0),
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world.add_constraint(Box::new(Link(a, b)));
    world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    let groups = islands.borrow();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 2);
}

/// Sweeper that models an infinite wall at `x = 1` and reports the exact
/// crossing fraction for the swept sphere's leading surface.
struct WallSweeper;

impl ConvexSweeper for WallSweeper {
    fn sweep(
        &mut self,
        request: &SweepRequest<'_>,
        _broadphase: &DynamicBroadphase,
    ) -> Option<SweepHit> {
        let wall = 1.0;
        let lead_from = request.from.x() + request.radius;
        let lead_to = request.to.x() + request.radius;
        if lead_from < wall && lead_to >= wall {
            Some(SweepHit {
                fraction: (wall - lead_from) / (lead_to - lead_from),
                normal: Vec3::new(-1.0, 0.0, 0.0),
            })
        } else {
            None
        }
    }
}

#[test]
fn ccd_clamps_a_fast_body_on_the_near_side_of_a_thin_wall() {
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    world.set_sweeper(Box::new(WallSweeper));
    let projectile = world
        .add_body(
            BodyDesc {
                ccd_motion_threshold: 0.5,
                ccd_swept_sphere_radius: 0.2,
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world
        .body_mut(projectile)
        .unwrap()
        .set_linear_velocity(Vec3::new(200.0, 0.0, 0.0));
    // One substep of free flight would cross the wall by over two units.
    world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    let b = world.body(projectile).unwrap();
    assert!(b.hit_fraction() < 1.0);
    assert!(
        b.transform().origin.x() + 0.2 <= 1.0 + 1e-4,
        "tunneled to {:?}",
        b.transform().origin
    );
}

#[test]
fn slow_bodies_skip_the_ccd_sweep() {
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    world.set_sweeper(Box::new(WallSweeper));
    let body = world
        .add_body(
            BodyDesc {
                ccd_motion_threshold: 0.5,
                ccd_swept_sphere_radius: 0.2,
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world
        .body_mut(body)
        .unwrap()
        .set_linear_velocity(Vec3::new(1.0, 0.0, 0.0));
    world.step_simulation(0.25, 1, 0.25);
    let b = world.body(body).unwrap();
    assert!((b.hit_fraction() - 1.0).abs() < f32::EPSILON);
    assert!((b.transform().origin.x() - 0.25).abs() < 1e-5);
}

/// Captures the touching list of every sweep it is asked for.
struct PartnerRecordingSweeper {
    partners: Rc<RefCell<Vec<BodyHandle>>>,
}

impl ConvexSweeper for PartnerRecordingSweeper {
    fn sweep(
        &mut self,
        request: &SweepRequest<'_>,
        _broadphase: &DynamicBroadphase,
    ) -> Option<SweepHit> {
        *self.partners.borrow_mut() = request.touching.to_vec();
        None
    }
}

#[test]
fn ccd_requests_carry_the_current_contact_partners() {
    let partners = Rc::new(RefCell::new(Vec::new()));
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    world.set_sweeper(Box::new(PartnerRecordingSweeper {
        partners: Rc::clone(&partners),
    }));
    let projectile = world
        .add_body(
            BodyDesc {
                ccd_motion_threshold: 0.5,
                ccd_swept_sphere_radius: 0.2,
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    // A static slab the projectile starts in contact with; the sweeper
    // needs to know not to clamp against it.
    let slab = world
        .add_body(
            BodyDesc {
                transform: at(0.6, 0.0, 0.0),
                mass: 0.0,
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world
        .body_mut(projectile)
        .unwrap()
        .set_linear_velocity(Vec3::new(200.0, 0.0, 0.0));
    world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    assert_eq!(*partners.borrow(), vec![slab]);
}

#[test]
fn kinematic_motion_yields_derived_velocities() {
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    let platform = world
        .add_body(
            BodyDesc {
                mass: 0.0,
                kinematic: true,
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world
        .body_mut(platform)
        .unwrap()
        .set_transform(at(0.5, 0.0, 0.0));
    world.step_simulation(0.25, 1, 0.25);
    let v = world.body(platform).unwrap().linear_velocity();
    assert!((v.x() - 2.0).abs() < 1e-5, "got {v:?}");
}

struct RunawayShape;

impl Shape for RunawayShape {
    fn aabb(&self, xf: &Transform) -> (Vec3, Vec3) {
        if xf.origin.x() > 5.0 {
            (Vec3::splat(f32::NAN), Vec3::splat(f32::NAN))
        } else {
            (
                xf.origin.sub(&Vec3::splat(0.5)),
                xf.origin.add(&Vec3::splat(0.5)),
            )
        }
    }

    fn is_convex(&self) -> bool {
        true
    }
}

#[test]
fn degenerate_motion_parks_the_body_instead_of_poisoning_the_world() {
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    let runaway = world
        .add_body(BodyDesc::default(), Box::new(RunawayShape))
        .unwrap();
    let bystander = world
        .add_body(
            BodyDesc {
                transform: at(0.0, 30.0, 0.0),
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world
        .body_mut(runaway)
        .unwrap()
        .set_linear_velocity(Vec3::new(1000.0, 0.0, 0.0));
    // First substep moves it past the breakage point; the second detects
    // the degenerate bounds and parks it.
    world.step_simulation(0.25, 1, 0.25);
    world.step_simulation(0.25, 1, 0.25);
    let b = world.body(runaway).unwrap();
    assert_eq!(b.activation_state(), ActivationState::DisableSimulation);
    let frozen = b.transform().origin;
    world.step_simulation(0.25, 1, 0.25);
    assert_eq!(world.body(runaway).unwrap().transform().origin, frozen);
    // Unaffected bodies keep simulating.
    assert!(world.body(bystander).unwrap().is_active());
}

#[test]
fn removing_a_body_retires_its_pairs() {
    let mut world = DiscreteWorld::new(
        Box::new(TouchDispatcher::default()),
        Box::new(NoopSolver),
        WorldConfig {
            gravity: Vec3::ZERO,
            ..WorldConfig::default()
        },
    );
    let a = world.add_body(BodyDesc::default(), unit_box()).unwrap();
    let _b = world
        .add_body(
            BodyDesc {
                transform: at(0.6, 0.0, 0.0),
                ..BodyDesc::default()
            },
            unit_box(),
        )
        .unwrap();
    world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    assert_eq!(world.broadphase().pairs().len(), 1);
    world.remove_body(a).unwrap();
    world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);
    assert!(world.broadphase().pairs().is_empty());
}

proptest! {
    // Three chains of three touching boxes each, added in an arbitrary
    // order. The resulting solve groups must always be the same three
    // chains, whatever the arena layout.
    #[test]
    fn island_partition_ignores_body_insertion_order(
        order in Just((0..9usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let positions: Vec<f32> = (0..9)
            .map(|i| (i / 3) as f32 * 100.0 + (i % 3) as f32 * 0.6)
            .collect();
        let islands = Rc::new(RefCell::new(Vec::new()));
        let mut world = DiscreteWorld::new(
            Box::new(TouchDispatcher::default()),
            Box::new(RecordingSolver {
                islands: Rc::clone(&islands),
            }),
            WorldConfig {
                gravity: Vec3::ZERO,
                ..WorldConfig::default()
            },
        );
        let mut x_of = std::collections::HashMap::new();
        for &i in &order {
            let handle = world
                .add_body(
                    BodyDesc {
                        transform: at(positions[i], 0.0, 0.0),
                        ..BodyDesc::default()
                    },
                    unit_box(),
                )
                .unwrap();
            x_of.insert(handle, positions[i]);
        }
        world.step_simulation(1.0 / 60.0, 1, 1.0 / 60.0);

        // Canonicalize: tenths-of-a-unit x coordinates, sorted within and
        // across groups.
        let mut partition: Vec<Vec<i64>> = islands
            .borrow()
            .iter()
            .map(|group| {
                let mut xs: Vec<i64> = group
                    .iter()
                    .map(|h| (x_of[h] * 10.0).round() as i64)
                    .collect();
                xs.sort_unstable();
                xs
            })
            .collect();
        partition.sort();
        prop_assert_eq!(
            partition,
            vec![
                vec![0, 6, 12],
                vec![1000, 1006, 1012],
                vec![2000, 2006, 2012],
            ]
        );
    }
}
