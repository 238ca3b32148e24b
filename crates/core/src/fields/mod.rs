//! Field declarations and storage
//!
//! - `registry`: field specs, boundary conditions, transfer rules and handles
//! - `data`: flat per-field value arrays and sparse face stores

pub mod data;
pub mod registry;

pub use data::{FaceData, FieldData};
pub use registry::{
    average4, linear_children, BoundaryCondition, BoundarySpec, DiffusionSpec, Diffusivity,
    EmbeddedCondition, FaceFieldHandle, FieldHandle, FieldKind, FieldRegistry, FieldSpec,
    ProlongFn, Prolongation, RestrictFn, Restriction, Stencil, VectorHandle,
};
