//! Adaptive Quadtree Diffusion Engine
//!
//! A 2D finite-volume engine on a 2:1-balanced quadtree. The mesh refines and
//! coarsens itself from wavelet error estimates, solid bodies are embedded
//! through level sets as per-cell volume fractions and per-face fractions,
//! and diffusive fields advance with an implicit step solved by geometric
//! multigrid on the tree's own levels.
//!
//! ## Pipeline
//!
//! Each step of a [`Simulation`]:
//! - runs the registered before-step callbacks
//! - diffuses every diffusive field ([`diffusion`])
//! - runs the after-step callbacks
//! - adapts the mesh ([`adapt`])
//! - recomputes embedded fractions when needed ([`geometry`])
//! - advances time, landing exactly on scheduled output times
//!
//! ## Example
//!
//! ```no_run
//! use canopy_amr_core::{
//!     Circle, Diffusivity, Domain, DriverConfig, EmbeddedGeometry, FieldSpec, GridConfig,
//!     Simulation, Vec2,
//! };
//!
//! let mut domain = Domain::new(GridConfig::centered(5.0, 6, 4, 8))?;
//! let c = domain.register(FieldSpec::scalar("C").with_default(400.0).adapt(1.0)
//!     .diffusive(Diffusivity::Constant(0.1)))?;
//! domain.fill(c, |p| if p.norm() < 0.1 { 1500.0 } else { 400.0 });
//!
//! let leaf = Circle { center: Vec2::new(1.0, 0.0), radius: 0.3 };
//! let mut sim = Simulation::new(domain, DriverConfig::until(1.0))
//!     .with_geometry(EmbeddedGeometry::new(leaf));
//! let summary = sim.run()?;
//! println!("{} steps, {} leaves", summary.steps, summary.leaves);
//! # Ok::<(), canopy_amr_core::EngineError>(())
//! ```

// Core types and utilities
pub mod core_types;
pub mod error;

// Mesh and field storage
pub mod domain;
pub mod fields;
pub mod grid;

// Numerical components
pub mod adapt;
pub mod diffusion;
pub mod geometry;

// Driving and persistence
pub mod checkpoint;
pub mod config;
pub mod driver;

pub use core_types::Vec2;
pub use error::{EngineError, TopologyReason};

pub use domain::{CellInfo, Domain, FieldStats, FACE_FRACTION, VOLUME_FRACTION};
pub use fields::{
    BoundaryCondition, BoundarySpec, DiffusionSpec, Diffusivity, EmbeddedCondition,
    FaceFieldHandle, FieldHandle, FieldSpec, Prolongation, Restriction, Stencil, VectorHandle,
};
pub use grid::{CellId, CellKey, Face, FaceKey, GridConfig, Neighbor, Quadtree, Side};

pub use adapt::{AdaptConfig, AdaptCriterion, AdaptReport, WaveletEstimator};
pub use diffusion::{diffuse, MultigridConfig, SmootherKind, SolverStats};
pub use geometry::{
    is_solid, Circle, CosineWave, Ellipse, EmbeddedGeometry, FractionStats, GeometryMode,
    HalfPlane, LevelSet, LevelSetExt, Rectangle, TimeVarying,
};

pub use checkpoint::{Checkpoint, CheckpointError};
pub use config::EngineConfig;
pub use driver::{
    DiffusionStability, DriverConfig, DriverState, EventContext, Phase, RunSummary, Simulation,
    Snapshot, StepPolicy, StepReport, Trigger,
};
