//! Time-step driver, event scheduling and step-size policies

pub mod context;
pub mod events;
pub mod policy;
pub mod simulation;

pub use context::{EventContext, LeafSample, Snapshot};
pub use events::{land_on, Phase, Schedule, Trigger, TIME_EPSILON};
pub use policy::{DiffusionStability, FixedStep, StepPolicy};
pub use simulation::{
    Diagnostics, DriverConfig, DriverState, RunSummary, Simulation, StepReport,
};
