//! Embedded solid geometry
//!
//! - `level_set`: implicit shapes, composition and the solid/fluid tie-break
//! - `fractions`: volume and face fractions of a single cell
//! - `embedded`: the engine that writes fractions for every leaf

pub mod embedded;
pub mod fractions;
pub mod level_set;

pub use embedded::{EmbeddedGeometry, FractionStats, GeometryMode};
pub use fractions::{cell_fractions, edge_fraction, CellClass, CellFractions, Interface};
pub use level_set::{
    is_solid, Circle, Complement, CosineWave, Difference, Ellipse, HalfPlane, Intersection,
    LevelSet, LevelSetExt, Rectangle, TimeVarying, Translate, Union,
};
