//! Vector type alias for 2D positions and offsets.

use nalgebra::Vector2;

/// 2D vector type for cell centres, vertices and interface points.
///
/// This is a simple alias for `nalgebra::Vector2<f64>`, used throughout
/// the engine for physical coordinates inside the square domain.
pub type Vec2 = Vector2<f64>;
