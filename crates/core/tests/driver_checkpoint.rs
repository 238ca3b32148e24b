//! Full driver runs: resuming from checkpoints and config-driven adaptive runs

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use approx::assert_relative_eq;
use canopy_amr_core::driver::FixedStep;
use canopy_amr_core::{
    Checkpoint, Circle, Diffusivity, Domain, DriverConfig, EmbeddedCondition, EmbeddedGeometry,
    EngineConfig, FieldSpec, GridConfig, Prolongation, Simulation, Trigger, Vec2,
};

fn gaussian_domain() -> Domain {
    let mut domain = Domain::new(GridConfig::centered(2.0, 4, 2, 6)).unwrap();
    let t = domain
        .register(FieldSpec::scalar("T").diffusive(Diffusivity::Constant(0.05)))
        .unwrap();
    domain
        .refine_where(|info| info.center.norm() < 0.4 && info.level() < 6)
        .unwrap();
    domain.fill(t, |p| (-p.norm_squared() / 0.05).exp());
    domain
}

#[test]
fn test_resumed_run_matches_uninterrupted_run() {
    let saved: Rc<RefCell<Option<Checkpoint>>> = Rc::new(RefCell::new(None));
    let mut full = Simulation::new(gaussian_domain(), DriverConfig::until(1.0))
        .with_step_policy(FixedStep(0.25));
    let sink = Rc::clone(&saved);
    full.on_output("checkpoint", Trigger::At(0.5), move |snapshot| {
        *sink.borrow_mut() = Some(Checkpoint::capture(
            snapshot.domain(),
            snapshot.time(),
            snapshot.iteration(),
        ));
        Ok(())
    })
    .unwrap();
    let summary = full.run().unwrap();
    assert_eq!(summary.steps, 4);

    let checkpoint = saved.borrow_mut().take().expect("checkpoint written at t = 0.5");
    assert_relative_eq!(checkpoint.time, 0.5);
    assert_eq!(checkpoint.iteration, 2);

    // Round trip through the file format before resuming
    let parsed = Checkpoint::from_json(&checkpoint.to_json().unwrap()).unwrap();
    let mut domain = Domain::new(GridConfig::centered(2.0, 4, 2, 6)).unwrap();
    domain
        .register(FieldSpec::scalar("T").diffusive(Diffusivity::Constant(0.05)))
        .unwrap();
    parsed.restore(&mut domain).unwrap();

    let mut resumed =
        Simulation::new(domain, DriverConfig::until(1.0)).with_step_policy(FixedStep(0.25));
    resumed.set_clock(parsed.time, parsed.iteration).unwrap();
    let summary = resumed.run().unwrap();
    assert_eq!(summary.steps, 2);
    assert_eq!(resumed.iteration(), 4);
    assert_relative_eq!(resumed.time(), 1.0);

    let a = full.domain();
    let b = resumed.domain();
    assert_eq!(a.tree().leaf_count(), b.tree().leaf_count());
    let t = a.fields().handle("T").unwrap();
    for leaf in a.tree().leaves() {
        let key = a.tree().key(leaf);
        let other = b.tree().find(key).expect("same mesh after resume");
        assert_relative_eq!(a.value(t, leaf), b.value(t, other), epsilon = 1e-12);
    }
}

#[test]
fn test_config_driven_run_with_embedded_source() {
    let config = EngineConfig::from_json_str(
        r#"{
            "grid": { "origin": [-1.0, -1.0], "size": 2.0,
                      "initial_level": 4, "min_level": 3, "max_level": 6 },
            "adapt": { "criteria": [ { "field": "T", "tolerance": 0.01 } ] },
            "driver": { "end_time": 0.05 }
        }"#,
    )
    .unwrap();

    let mut domain = Domain::new(config.grid.clone()).unwrap();
    domain
        .register(
            FieldSpec::scalar("T")
                .with_embedded(EmbeddedCondition::Dirichlet(1.0))
                .with_prolongation(Prolongation::Limited)
                .diffusive(Diffusivity::Constant(0.1)),
        )
        .unwrap();
    let geometry = EmbeddedGeometry::new(Circle {
        center: Vec2::zeros(),
        radius: 0.3,
    });
    let mut sim = Simulation::new(domain, config.driver)
        .with_geometry(geometry)
        .with_adapt(config.adapt.clone())
        .with_multigrid(config.multigrid);

    let outputs = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&outputs);
    sim.on_output("probe", Trigger::every(0.01), move |snapshot| {
        let stats = snapshot.stats("T")?;
        sink.borrow_mut().push((snapshot.time(), stats.max));
        Ok(())
    })
    .unwrap();

    let summary = sim.run().unwrap();
    assert_relative_eq!(summary.time, 0.05, epsilon = 1e-12);
    assert_eq!(summary.diagnostics.nonconverged, 0);
    assert!(summary.diagnostics.geometry.cut > 0);
    assert!(summary.diagnostics.coarsened > 0);
    assert!(summary.diagnostics.embedded_exchange > 0.0);
    assert_eq!(sim.domain().tree().find_imbalance(), None);

    let outputs = outputs.borrow();
    assert_eq!(outputs.len(), 6);
    for (k, &(time, max)) in outputs.iter().enumerate() {
        assert_relative_eq!(time, 0.01 * k as f64, epsilon = 1e-9);
        assert!(max <= 1.0 + 1e-6);
    }
    // The surface heats the fluid from the first step on
    assert!(outputs[5].1 > outputs[0].1);
}
