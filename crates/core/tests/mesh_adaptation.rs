//! Topology invariants under long refine/coarsen sequences and wavelet adaptation

mod common;

use approx::assert_relative_eq;
use canopy_amr_core::{
    AdaptConfig, AdaptCriterion, CellId, Domain, FieldSpec, GridConfig, Prolongation,
    Restriction, Vec2, WaveletEstimator,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn unit_domain(initial: u8, min: u8, max: u8) -> Domain {
    Domain::new(GridConfig {
        origin: [0.0, 0.0],
        size: 1.0,
        initial_level: initial,
        min_level: min,
        max_level: max,
        periodic: [false, false],
    })
    .unwrap()
}

#[test]
fn test_balance_holds_through_random_operations() {
    let mut domain = unit_domain(2, 0, 7);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut accepted = 0;
    let mut rejected = 0;

    for _ in 0..400 {
        let leaves: Vec<CellId> = domain.tree().leaves().collect();
        let pick = leaves[rng.random_range(0..leaves.len())];
        let result = if rng.random::<f64>() < 0.6 {
            domain.refine(pick).map(|_| ())
        } else {
            match domain.tree().parent(pick) {
                Some(parent) => domain.coarsen(parent),
                None => Ok(()),
            }
        };
        match result {
            Ok(()) => accepted += 1,
            Err(e) => {
                assert!(e.is_topology_violation(), "unexpected error {e}");
                rejected += 1;
            }
        }
        assert_eq!(domain.tree().find_imbalance(), None);
    }
    assert!(accepted > 0);
    assert!(rejected > 0);
}

#[test]
fn test_balanced_refinement_cascades() {
    let mut domain = unit_domain(2, 0, 8);
    let corner = domain.tree().locate(Vec2::new(0.01, 0.01)).unwrap();
    let mut id = corner;
    for _ in 0..5 {
        domain.refine_balanced(id).unwrap();
        id = domain.tree().locate(Vec2::new(0.01, 0.01)).unwrap();
    }
    assert_eq!(domain.tree().level(id), 7);
    assert_eq!(domain.tree().find_imbalance(), None);
}

#[test]
fn test_refine_coarsen_round_trip_is_exact_with_constant_prolongation() {
    let mut domain = unit_domain(3, 0, 6);
    let c = domain
        .register(
            FieldSpec::scalar("C")
                .with_prolongation(Prolongation::Constant)
                .with_restriction(Restriction::Average),
        )
        .unwrap();
    domain.fill(c, |p| (7.0 * p.x).sin() + p.y * p.y);
    let before: Vec<(CellId, f64)> = domain
        .tree()
        .leaves()
        .map(|id| (id, domain.value(c, id)))
        .collect();

    for &(id, _) in &before {
        domain.refine(id).unwrap();
    }
    for &(id, _) in &before {
        domain.coarsen(id).unwrap();
    }
    for &(id, value) in &before {
        assert_eq!(domain.value(c, id), value);
    }
}

#[test]
fn test_refine_coarsen_round_trip_with_linear_prolongation() {
    let mut domain = unit_domain(3, 0, 6);
    let c = domain.register(FieldSpec::scalar("C")).unwrap();
    domain.fill(c, |p| 3.0 * p.x - 2.0 * p.y + 0.5 * (5.0 * p.x * p.y).cos());
    let before: Vec<(CellId, f64)> = domain
        .tree()
        .leaves()
        .map(|id| (id, domain.value(c, id)))
        .collect();
    for &(id, _) in &before {
        domain.refine(id).unwrap();
    }
    for &(id, _) in &before {
        domain.coarsen(id).unwrap();
    }
    for &(id, value) in &before {
        assert_relative_eq!(domain.value(c, id), value, epsilon = 1e-12);
    }
}

#[test]
fn test_wavelet_adaptation_tracks_a_front() {
    let mut domain = unit_domain(4, 2, 7);
    let c = domain.register(FieldSpec::scalar("C")).unwrap();
    let front = |p: Vec2| 0.5 * (1.0 + ((p.x - 0.5) / 0.02).tanh());
    domain.fill(c, front);

    let estimator = WaveletEstimator::new(
        &domain,
        &AdaptConfig {
            criteria: vec![AdaptCriterion {
                field: "C".into(),
                tolerance: 1e-3,
            }],
            ..AdaptConfig::default()
        },
    )
    .unwrap();

    for _ in 0..10 {
        let report = estimator.adapt(&mut domain).unwrap();
        domain.fill(c, front);
        if report.changed() == 0 {
            break;
        }
    }

    let tree = domain.tree();
    assert_eq!(tree.find_imbalance(), None);
    let at_front = tree.locate(Vec2::new(0.5, 0.5)).unwrap();
    let far = tree.locate(Vec2::new(0.05, 0.5)).unwrap();
    assert_eq!(tree.level(at_front), 7);
    // Balance grades the mesh away from the front; far leaves stay coarse
    assert!(tree.level(far) <= 4, "far leaf at level {}", tree.level(far));
    assert!(tree.leaf_count() < 4usize.pow(7) / 3);
}

#[test]
fn test_wavelet_adaptation_settles_on_smooth_bump() {
    let mut domain = unit_domain(4, 2, 7);
    let c = domain.register(FieldSpec::scalar("C")).unwrap();
    let bump = |p: Vec2| (-(p - Vec2::new(0.5, 0.5)).norm_squared() / 0.02).exp();
    domain.fill(c, bump);

    let estimator = WaveletEstimator::new(
        &domain,
        &AdaptConfig {
            criteria: vec![AdaptCriterion {
                field: "C".into(),
                tolerance: 1e-3,
            }],
            ..AdaptConfig::default()
        },
    )
    .unwrap();

    let mut passes = 0;
    loop {
        let report = estimator.adapt(&mut domain).unwrap();
        domain.fill(c, bump);
        if report.changed() == 0 {
            break;
        }
        passes += 1;
        assert!(passes < 12, "still adapting after {passes} passes: {report:?}");
    }

    // Further passes leave the mesh alone
    let leaves = domain.tree().leaf_count();
    for _ in 0..3 {
        let report = estimator.adapt(&mut domain).unwrap();
        domain.fill(c, bump);
        assert_eq!(report.changed(), 0);
        assert_eq!(report.leaves, leaves);
    }

    let tree = domain.tree();
    assert_eq!(tree.find_imbalance(), None);
    assert!(tree.depth() > 4);
    let peak = tree.locate(Vec2::new(0.51, 0.51)).unwrap();
    let corner = tree.locate(Vec2::new(0.02, 0.02)).unwrap();
    assert!(tree.level(peak) > tree.level(corner));
}

#[test]
fn test_refine_where_and_statistics() {
    let mut domain = unit_domain(2, 0, 5);
    let c = domain.register(FieldSpec::scalar("C").with_default(2.0)).unwrap();
    let split = domain
        .refine_where(|info| info.center.x < 0.25 && info.center.y < 0.25)
        .unwrap();
    assert!(split > 0);
    let stats = domain.stats(c);
    assert_relative_eq!(stats.volume, 1.0, epsilon = 1e-12);
    assert_relative_eq!(stats.mean(), 2.0);
    assert_relative_eq!(stats.stddev(), 0.0, epsilon = 1e-12);
    assert_eq!(stats.min, 2.0);
    assert_eq!(stats.max, 2.0);
}
