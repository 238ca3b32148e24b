//! Time-step driver
//!
//! Owns the domain and runs the step pipeline:
//!
//! 1. before-step callbacks
//! 2. implicit diffusion of every diffusive field
//! 3. after-step callbacks
//! 4. wavelet adaptation
//! 5. embedded fractions, when the shape moves or the mesh changed
//! 6. time advance, landing exactly on scheduled times
//! 7. output callbacks
//!
//! Stages run one after another; each stage finishes before the next starts.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::context::{EventContext, Snapshot};
use super::events::{land_on, Phase, Schedule, Trigger, TIME_EPSILON};
use super::policy::{DiffusionStability, StepPolicy};
use crate::adapt::{AdaptConfig, AdaptReport, WaveletEstimator};
use crate::diffusion::{MultigridConfig, MultigridSolver, SolverStats};
use crate::domain::Domain;
use crate::error::EngineError;
use crate::geometry::{EmbeddedGeometry, FractionStats};

/// Driver settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Initial simulation time
    pub start_time: f64,
    /// Time at which the run stops
    pub end_time: Option<f64>,
    /// Upper bound on every step
    pub max_dt: Option<f64>,
    /// Number of steps after which the run stops
    pub max_iterations: Option<usize>,
    /// Treat a non-converged solve as an error instead of a warning
    pub fail_on_nonconvergence: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            end_time: None,
            max_dt: None,
            max_iterations: None,
            fail_on_nonconvergence: false,
        }
    }
}

impl DriverConfig {
    /// Run from 0 to `end_time`
    pub fn until(end_time: f64) -> Self {
        Self {
            end_time: Some(end_time),
            ..Self::default()
        }
    }

    /// Check that the times are consistent
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for non-finite times, an end
    /// time before the start or a non-positive step cap.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.start_time.is_finite() {
            return Err(EngineError::config("start time must be finite"));
        }
        if let Some(end) = self.end_time {
            if !end.is_finite() || end < self.start_time {
                return Err(EngineError::config(format!(
                    "end time {end} must be finite and not before start time {}",
                    self.start_time
                )));
            }
        }
        if let Some(max_dt) = self.max_dt {
            if !(max_dt > 0.0 && max_dt.is_finite()) {
                return Err(EngineError::config(format!(
                    "max_dt must be positive, got {max_dt}"
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    /// Registered but not yet initialised
    Uninitialized,
    /// Initialised; steps may be taken
    Stepping,
    /// End time reached or stop requested
    Stopped,
}

impl DriverState {
    fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Stepping => "stepping",
            Self::Stopped => "stopped",
        }
    }
}

/// Counters accumulated over a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Steps taken
    pub steps: usize,
    /// Multigrid cycles over all solves
    pub solver_cycles: usize,
    /// Solves that hit the cycle cap
    pub nonconverged: usize,
    /// Statistics of the solves of the last step
    pub last_solves: Vec<SolverStats>,
    /// Embedded-surface flux rate of the last step, summed over fields
    pub embedded_flux: f64,
    /// Time integral of the embedded-surface flux
    pub embedded_exchange: f64,
    /// Cells refined by adaptation
    pub refined: usize,
    /// Parents coarsened by adaptation
    pub coarsened: usize,
    /// Adaptation requests rejected by the balance rules
    pub rejected: usize,
    /// Fraction counts of the last geometry update
    pub geometry: FractionStats,
}

/// What happened during one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Steps completed, including this one
    pub iteration: usize,
    /// Time at the end of the step
    pub time: f64,
    /// Step length
    pub dt: f64,
    /// One entry per diffusive field
    pub solves: Vec<SolverStats>,
    /// Mesh changes
    pub adapt: AdaptReport,
    /// Whether the driver stopped after this step
    pub stopped: bool,
}

/// Outcome of [`Simulation::run`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Steps taken
    pub steps: usize,
    /// Final time
    pub time: f64,
    /// Leaves at the end
    pub leaves: usize,
    /// Accumulated counters
    pub diagnostics: Diagnostics,
}

type EventCallback = Box<dyn FnMut(&mut EventContext<'_>) -> Result<(), EngineError>>;
type OutputCallback = Box<dyn FnMut(&Snapshot<'_>) -> Result<(), EngineError>>;

struct Registration<C> {
    name: String,
    schedule: Schedule,
    callback: C,
}

/// Adaptive simulation driver
pub struct Simulation {
    domain: Domain,
    config: DriverConfig,
    state: DriverState,
    time: f64,
    iteration: usize,
    last_dt: f64,
    geometry: Option<EmbeddedGeometry>,
    adapt: AdaptConfig,
    estimator: Option<WaveletEstimator>,
    multigrid: MultigridConfig,
    solver: Option<MultigridSolver>,
    policies: Vec<Box<dyn StepPolicy>>,
    init: Vec<Registration<EventCallback>>,
    before: Vec<Registration<EventCallback>>,
    after: Vec<Registration<EventCallback>>,
    outputs: Vec<Registration<OutputCallback>>,
    diagnostics: Diagnostics,
    stop_requested: bool,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |events: &[Registration<EventCallback>]| -> Vec<String> {
            events.iter().map(|e| e.name.clone()).collect()
        };
        f.debug_struct("Simulation")
            .field("state", &self.state)
            .field("time", &self.time)
            .field("iteration", &self.iteration)
            .field("config", &self.config)
            .field("geometry", &self.geometry)
            .field("init", &names(&self.init))
            .field("before", &names(&self.before))
            .field("after", &names(&self.after))
            .field(
                "outputs",
                &self.outputs.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Driver over a domain whose fields are already registered
    pub fn new(domain: Domain, config: DriverConfig) -> Self {
        Self {
            domain,
            time: config.start_time,
            config,
            state: DriverState::Uninitialized,
            iteration: 0,
            last_dt: 0.0,
            geometry: None,
            adapt: AdaptConfig::default(),
            estimator: None,
            multigrid: MultigridConfig::default(),
            solver: None,
            policies: Vec::new(),
            init: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            outputs: Vec::new(),
            diagnostics: Diagnostics::default(),
            stop_requested: false,
        }
    }

    /// Add an embedded solid
    #[must_use]
    pub fn with_geometry(mut self, geometry: EmbeddedGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Set the adaptation criteria
    #[must_use]
    pub fn with_adapt(mut self, adapt: AdaptConfig) -> Self {
        self.adapt = adapt;
        self
    }

    /// Set the multigrid parameters
    #[must_use]
    pub fn with_multigrid(mut self, multigrid: MultigridConfig) -> Self {
        self.multigrid = multigrid;
        self
    }

    /// Add a step-size bound
    ///
    /// Without any policy the driver uses [`DiffusionStability`].
    #[must_use]
    pub fn with_step_policy(mut self, policy: impl StepPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    /// Register a callback that may modify field values
    ///
    /// Callbacks of one phase run in registration order. `Init` callbacks
    /// ignore the trigger and run once per initial adaptation pass.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for an invalid trigger or the
    /// `Output` phase (use [`Simulation::on_output`]), and
    /// [`EngineError::InvalidState`] for an `Init` callback added after
    /// initialisation.
    pub fn on<F>(
        &mut self,
        phase: Phase,
        name: impl Into<String>,
        trigger: Trigger,
        callback: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&mut EventContext<'_>) -> Result<(), EngineError> + 'static,
    {
        let name = name.into();
        if !trigger.is_valid() {
            return Err(EngineError::config(format!(
                "event '{name}' has an invalid trigger {trigger:?}"
            )));
        }
        let registration = Registration {
            schedule: Schedule::new(trigger, self.time),
            name,
            callback: Box::new(callback) as EventCallback,
        };
        match phase {
            Phase::Init if self.state != DriverState::Uninitialized => {
                Err(EngineError::InvalidState {
                    operation: "register init event",
                    state: self.state.name(),
                })
            }
            Phase::Init => {
                self.init.push(registration);
                Ok(())
            }
            Phase::BeforeStep => {
                self.before.push(registration);
                Ok(())
            }
            Phase::AfterStep => {
                self.after.push(registration);
                Ok(())
            }
            Phase::Output => Err(EngineError::config(format!(
                "event '{}' uses the output phase; register it with on_output",
                registration.name
            ))),
        }
    }

    /// Register a read-only output callback
    ///
    /// Output callbacks see the state after time has advanced; time-based
    /// triggers also fire once at initialisation when due.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for an invalid trigger.
    pub fn on_output<F>(
        &mut self,
        name: impl Into<String>,
        trigger: Trigger,
        callback: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&Snapshot<'_>) -> Result<(), EngineError> + 'static,
    {
        let name = name.into();
        if !trigger.is_valid() {
            return Err(EngineError::config(format!(
                "output '{name}' has an invalid trigger {trigger:?}"
            )));
        }
        self.outputs.push(Registration {
            schedule: Schedule::new(trigger, self.time),
            name,
            callback: Box::new(callback),
        });
        Ok(())
    }

    /// The domain
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The domain, for setup before initialisation
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] once the driver is initialised;
    /// topology and fields then belong to the step pipeline.
    pub fn domain_mut(&mut self) -> Result<&mut Domain, EngineError> {
        if self.state == DriverState::Uninitialized {
            Ok(&mut self.domain)
        } else {
            Err(EngineError::InvalidState {
                operation: "mutate domain",
                state: self.state.name(),
            })
        }
    }

    /// Give the domain back
    pub fn into_domain(self) -> Domain {
        self.domain
    }

    /// Lifecycle state
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Current simulation time
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Steps completed
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Length of the last step
    pub fn last_dt(&self) -> f64 {
        self.last_dt
    }

    /// Accumulated counters
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Read-only view of the current state
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot::new(&self.domain, self.time, self.iteration, &self.diagnostics)
    }

    /// Resume from a restored state
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] after initialisation.
    pub fn set_clock(&mut self, time: f64, iteration: usize) -> Result<(), EngineError> {
        if self.state != DriverState::Uninitialized {
            return Err(EngineError::InvalidState {
                operation: "set clock",
                state: self.state.name(),
            });
        }
        self.time = time;
        self.iteration = iteration;
        for event in self.before.iter_mut().chain(self.after.iter_mut()) {
            event.schedule = Schedule::new(event.schedule.trigger(), time);
        }
        for event in &mut self.outputs {
            event.schedule = Schedule::new(event.schedule.trigger(), time);
        }
        Ok(())
    }

    /// Stop after the current step
    pub fn stop(&mut self) {
        if self.state != DriverState::Stopped {
            info!("Simulation stopped at t = {:.6} after {} steps", self.time, self.iteration);
        }
        self.state = DriverState::Stopped;
    }

    /// Validate settings, compute fractions and adapt the initial mesh
    ///
    /// Init callbacks run, the mesh is adapted, and the callbacks run again
    /// on the new mesh until adaptation changes nothing or the pass limit of
    /// [`AdaptConfig::init_passes`] is reached.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if already initialised,
    /// [`EngineError::Configuration`] for invalid settings, and any error
    /// returned by an init callback.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.state != DriverState::Uninitialized {
            return Err(EngineError::InvalidState {
                operation: "initialize",
                state: self.state.name(),
            });
        }
        self.config.validate()?;
        self.solver = Some(MultigridSolver::new(self.multigrid)?);
        self.domain.freeze();
        let estimator = WaveletEstimator::new(&self.domain, &self.adapt)?;
        let estimator = (!estimator.criteria().is_empty()).then_some(estimator);
        if self.policies.is_empty() {
            self.policies.push(Box::new(DiffusionStability::default()));
        }

        self.update_geometry(self.time);
        self.run_init_events()?;
        let passes = if estimator.is_some() { self.adapt.init_passes } else { 0 };
        for pass in 0..passes {
            let Some(estimator) = &estimator else {
                break;
            };
            let report = estimator.adapt(&mut self.domain)?;
            self.record_adapt(&report);
            if report.changed() == 0 {
                break;
            }
            debug!("Initial adaptation pass {}: {:?}", pass + 1, report);
            self.update_geometry(self.time);
            self.run_init_events()?;
        }
        self.estimator = estimator;
        self.state = DriverState::Stepping;

        info!(
            "Simulation initialized at t = {}: {} fields, {} leaves, depth {}",
            self.time,
            self.domain.fields().len(),
            self.domain.tree().leaf_count(),
            self.domain.tree().depth()
        );
        self.run_outputs()?;
        self.check_stop();
        Ok(())
    }

    /// Take one step, initialising first if needed
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] once stopped, a callback's error,
    /// or [`EngineError::ConvergenceFailure`] when
    /// [`DriverConfig::fail_on_nonconvergence`] is set.
    pub fn step(&mut self) -> Result<StepReport, EngineError> {
        match self.state {
            DriverState::Uninitialized => self.initialize()?,
            DriverState::Stepping => {}
            DriverState::Stopped => {
                return Err(EngineError::InvalidState {
                    operation: "step",
                    state: self.state.name(),
                })
            }
        }
        if self.state == DriverState::Stopped {
            return Err(EngineError::InvalidState {
                operation: "step",
                state: self.state.name(),
            });
        }

        let (dt, target) = self.next_step()?;
        let t = self.time;

        self.run_phase(Phase::BeforeStep, t, dt)?;

        let solver = self
            .solver
            .as_ref()
            .ok_or(EngineError::InvalidState {
                operation: "step",
                state: "missing solver",
            })?;
        let mut solves = Vec::new();
        for (field, spec) in self.domain.fields().diffusive() {
            let stats = solver.solve(&mut self.domain, field, spec, dt)?;
            self.diagnostics.solver_cycles += stats.iterations;
            if !stats.converged {
                self.diagnostics.nonconverged += 1;
            }
            let stats = if self.config.fail_on_nonconvergence {
                stats.into_result()?
            } else {
                stats
            };
            solves.push(stats);
        }
        let flux: f64 = solves.iter().map(|s| s.embedded_flux).sum();
        self.diagnostics.embedded_flux = flux;
        self.diagnostics.embedded_exchange += flux * dt;
        self.diagnostics.last_solves.clone_from(&solves);

        self.run_phase(Phase::AfterStep, t, dt)?;

        let adapt = match &self.estimator {
            Some(estimator) => estimator.adapt(&mut self.domain)?,
            None => AdaptReport::default(),
        };
        self.record_adapt(&adapt);

        let mut new_time = t + dt;
        if (new_time - target).abs() <= TIME_EPSILON * target.abs().max(1.0) {
            new_time = target;
        }
        self.update_geometry(new_time);

        self.time = new_time;
        self.iteration += 1;
        self.last_dt = dt;
        self.diagnostics.steps += 1;

        self.run_outputs()?;
        self.check_stop();

        debug!(
            "Step {}: t = {:.6}, dt = {:.3e}, {} leaves",
            self.iteration,
            self.time,
            dt,
            self.domain.tree().leaf_count()
        );
        Ok(StepReport {
            iteration: self.iteration,
            time: self.time,
            dt,
            solves,
            adapt,
            stopped: self.state == DriverState::Stopped,
        })
    }

    /// Step until the end time, the iteration cap or a stop request
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if neither an end time nor an
    /// iteration cap is set, plus any error from [`Simulation::step`].
    pub fn run(&mut self) -> Result<RunSummary, EngineError> {
        if self.config.end_time.is_none() && self.config.max_iterations.is_none() {
            return Err(EngineError::config(
                "run needs an end time or an iteration cap",
            ));
        }
        if self.state == DriverState::Uninitialized {
            self.initialize()?;
        }
        while self.state == DriverState::Stepping {
            self.step()?;
        }
        info!(
            "Run finished: {} steps, t = {:.6}, {} leaves, {} solver cycles, {} non-converged solves",
            self.diagnostics.steps,
            self.time,
            self.domain.tree().leaf_count(),
            self.diagnostics.solver_cycles,
            self.diagnostics.nonconverged
        );
        Ok(RunSummary {
            steps: self.diagnostics.steps,
            time: self.time,
            leaves: self.domain.tree().leaf_count(),
            diagnostics: self.diagnostics.clone(),
        })
    }

    /// Step length and the scheduled time it lands on
    fn next_step(&self) -> Result<(f64, f64), EngineError> {
        let mut dt = self.config.max_dt.unwrap_or(f64::INFINITY);
        for policy in &self.policies {
            if let Some(bound) = policy.max_step(&self.domain) {
                dt = dt.min(bound);
            }
        }

        let horizon = TIME_EPSILON * self.time.abs().max(1.0);
        let target = self
            .before
            .iter()
            .chain(&self.after)
            .map(|e| e.schedule.next_time())
            .chain(self.outputs.iter().map(|e| e.schedule.next_time()))
            .chain(std::iter::once(self.config.end_time))
            .flatten()
            .filter(|&t| t > self.time + horizon)
            .fold(f64::INFINITY, f64::min);

        if !dt.is_finite() {
            dt = target - self.time;
        }
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(EngineError::config(
                "no step bound: add a step policy, max_dt, an end time or a timed event",
            ));
        }
        let dt = if target.is_finite() {
            land_on(self.time, target, dt)
        } else {
            dt
        };
        Ok((dt, target))
    }

    fn update_geometry(&mut self, time: f64) {
        if let Some(geometry) = &mut self.geometry {
            if geometry.needs_update(&self.domain) {
                self.diagnostics.geometry = geometry.update(&mut self.domain, time);
            }
        }
    }

    fn record_adapt(&mut self, report: &AdaptReport) {
        self.diagnostics.refined += report.refined;
        self.diagnostics.coarsened += report.coarsened;
        self.diagnostics.rejected += report.rejected;
    }

    fn run_init_events(&mut self) -> Result<(), EngineError> {
        let mut init = std::mem::take(&mut self.init);
        let result = init
            .iter_mut()
            .try_for_each(|event| self.fire(event, self.time, 0.0));
        self.init = init;
        result
    }

    fn run_phase(&mut self, phase: Phase, time: f64, dt: f64) -> Result<(), EngineError> {
        let mut events = match phase {
            Phase::BeforeStep => std::mem::take(&mut self.before),
            Phase::AfterStep => std::mem::take(&mut self.after),
            Phase::Init | Phase::Output => return Ok(()),
        };
        let mut result = Ok(());
        for event in &mut events {
            if event.schedule.is_due(time) {
                event.schedule.advance(time);
                result = self.fire(event, time, dt);
                if result.is_err() {
                    break;
                }
            }
        }
        match phase {
            Phase::BeforeStep => self.before = events,
            _ => self.after = events,
        }
        result
    }

    fn fire(
        &mut self,
        event: &mut Registration<EventCallback>,
        time: f64,
        dt: f64,
    ) -> Result<(), EngineError> {
        let mut ctx = EventContext::new(&mut self.domain, time, dt, self.iteration);
        let result = (event.callback)(&mut ctx);
        let (touched, stop) = ctx.finish();
        for field in touched {
            self.domain.restrict(field);
        }
        if stop {
            debug!("Event '{}' requested a stop", event.name);
            self.stop_requested = true;
        }
        result.map_err(|e| {
            warn!("Event '{}' failed at t = {}: {}", event.name, time, e);
            e
        })
    }

    fn run_outputs(&mut self) -> Result<(), EngineError> {
        let snapshot = Snapshot::new(&self.domain, self.time, self.iteration, &self.diagnostics);
        for event in &mut self.outputs {
            if event.schedule.is_due(self.time) {
                event.schedule.advance(self.time);
                (event.callback)(&snapshot).map_err(|e| {
                    warn!("Output '{}' failed at t = {}: {}", event.name, self.time, e);
                    e
                })?;
            }
        }
        Ok(())
    }

    fn check_stop(&mut self) {
        let end_reached = self
            .config
            .end_time
            .is_some_and(|end| self.time >= end - TIME_EPSILON * end.abs().max(1.0));
        let cap_reached = self
            .config
            .max_iterations
            .is_some_and(|cap| self.iteration >= cap);
        if end_reached || cap_reached || self.stop_requested {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::AdaptCriterion;
    use crate::driver::FixedStep;
    use crate::fields::{Diffusivity, FieldSpec};
    use crate::grid::GridConfig;
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn domain() -> Domain {
        let mut domain = Domain::new(GridConfig::centered(1.0, 3, 2, 5)).unwrap();
        domain
            .register(FieldSpec::scalar("T").diffusive(Diffusivity::Constant(0.01)))
            .unwrap();
        domain
    }

    #[test]
    fn test_steps_land_on_output_times() {
        let mut sim =
            Simulation::new(domain(), DriverConfig::until(1.0)).with_step_policy(FixedStep(0.3));
        let times = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&times);
        sim.on_output("log", Trigger::every(0.5), move |s| {
            seen.borrow_mut().push(s.time());
            Ok(())
        })
        .unwrap();
        let summary = sim.run().unwrap();
        assert_eq!(sim.state(), DriverState::Stopped);
        assert_relative_eq!(summary.time, 1.0);
        // 0 → 0.5 in two steps of 0.25, then again to 1.0
        assert_eq!(summary.steps, 4);
        assert_eq!(*times.borrow(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_event_order_and_stop_request() {
        let mut sim =
            Simulation::new(domain(), DriverConfig::until(10.0)).with_step_policy(FixedStep(1.0));
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (Rc::clone(&log), Rc::clone(&log));
        sim.on(Phase::BeforeStep, "before", Trigger::EveryStep, move |ctx| {
            a.borrow_mut().push(format!("before {}", ctx.time()));
            Ok(())
        })
        .unwrap();
        sim.on(Phase::AfterStep, "after", Trigger::EveryStep, move |ctx| {
            b.borrow_mut().push(format!("after {}", ctx.time()));
            if ctx.iteration() == 1 {
                ctx.request_stop();
            }
            Ok(())
        })
        .unwrap();
        let summary = sim.run().unwrap();
        assert_eq!(summary.steps, 2);
        assert_eq!(
            *log.borrow(),
            vec!["before 0", "after 0", "before 1", "after 1"]
        );
        assert!(matches!(sim.step(), Err(EngineError::InvalidState { .. })));
    }

    #[test]
    fn test_init_events_and_adaptation() {
        let mut sim = Simulation::new(domain(), DriverConfig::until(0.1)).with_adapt(AdaptConfig {
            criteria: vec![AdaptCriterion {
                field: "T".into(),
                tolerance: 1e-3,
            }],
            ..AdaptConfig::default()
        });
        sim.on(Phase::Init, "init", Trigger::EveryStep, |ctx| {
            let t = ctx.handle("T")?;
            ctx.map_leaves(t, |info| (-(info.center.norm_squared()) / 0.01).exp())
        })
        .unwrap();
        sim.initialize().unwrap();
        assert_eq!(sim.domain().tree().depth(), 5);
        assert!(sim.diagnostics().refined > 0);
        assert!(matches!(
            sim.on(Phase::Init, "late", Trigger::EveryStep, |_| Ok(())),
            Err(EngineError::InvalidState { .. })
        ));
        assert!(sim.domain_mut().is_err());
    }

    #[test]
    fn test_callbacks_cannot_overwrite_volume_fraction() {
        let mut sim = Simulation::new(domain(), DriverConfig::until(0.5));
        sim.on(Phase::BeforeStep, "clobber", Trigger::EveryStep, |ctx| {
            let cs = ctx.handle("cs")?;
            ctx.map_leaves(cs, |_| 0.3)
        })
        .unwrap();
        assert!(matches!(sim.run(), Err(EngineError::Configuration(_))));

        let domain = sim.domain();
        let cs = domain.cs();
        assert!(domain.tree().leaves().all(|id| domain.value(cs, id) == 1.0));
    }

    #[test]
    fn test_run_requires_a_stop_condition() {
        let mut sim = Simulation::new(domain(), DriverConfig::default());
        assert!(matches!(sim.run(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_output_phase_rejected_by_on() {
        let mut sim = Simulation::new(domain(), DriverConfig::until(1.0));
        assert!(sim
            .on(Phase::Output, "x", Trigger::EveryStep, |_| Ok(()))
            .is_err());
        assert!(sim
            .on_output("bad", Trigger::every(-1.0), |_| Ok(()))
            .is_err());
    }

    #[test]
    fn test_iteration_cap() {
        let config = DriverConfig {
            max_iterations: Some(3),
            ..DriverConfig::default()
        };
        let mut sim = Simulation::new(domain(), config);
        let summary = sim.run().unwrap();
        assert_eq!(summary.steps, 3);
        let h = 1.0 / 8.0;
        assert_relative_eq!(sim.last_dt(), h * h / 0.04, epsilon = 1e-12);
    }
}
