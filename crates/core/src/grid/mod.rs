//! Adaptive quadtree grid
//!
//! This module provides the cell store and topology of the engine:
//! - `cell`: cell keys, ids, sides and per-cell records
//! - `quadtree`: the tree itself with 2:1 balanced split/merge
//! - `traversal`: lazy depth-first leaf, level-grid and face iterators

pub mod cell;
pub mod quadtree;
pub mod traversal;

pub use cell::{Axis, Cell, CellId, CellKey, CellStatus, Side, NE, NW, SE, SW};
pub use quadtree::{GridConfig, Neighbor, Quadtree, LEAF_GRID, MAX_SUPPORTED_LEVEL};
pub use traversal::{side_endpoints, Face, FaceKey, FaceSide, Faces, LevelCells};
