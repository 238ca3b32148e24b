//! Lazy depth-first traversals over cells and faces
//!
//! Iterators borrow the tree immutably, visit children in quadrant order and
//! can be restarted by asking the tree for a fresh one. Each face of a level
//! grid is produced exactly once:
//! - same-level faces from the cell on their low side
//! - fine/coarse faces from the finer cell
//! - boundary faces from the cell that owns them

use serde::{Deserialize, Serialize};

use super::cell::{Axis, CellId, CellKey, Side};
use super::quadtree::{Neighbor, Quadtree, LEAF_GRID};
use crate::core_types::Vec2;

/// Depth-first iterator over the cells of one level grid
///
/// Children are visited in quadrant order (SW, SE, NW, NE) and a subtree is
/// finished before its next sibling starts, so a fine patch is yielded where
/// it sits in the Morton curve rather than ahead of coarser cells. The order
/// depends only on the topology, which keeps reductions over it
/// reproducible.
#[derive(Debug, Clone)]
pub struct LevelCells<'a> {
    tree: &'a Quadtree,
    stack: Vec<CellId>,
    limit: u8,
}

impl Iterator for LevelCells<'_> {
    type Item = CellId;

    fn next(&mut self) -> Option<CellId> {
        loop {
            let id = self.stack.pop()?;
            let cell = self.tree.cell(id);
            if cell.key.level >= self.limit {
                return Some(id);
            }
            match cell.children {
                Some(children) => self.stack.extend(children.iter().rev()),
                None => return Some(id),
            }
        }
    }
}

/// Position of a face on the lattice of its level
///
/// An `X` face lies at `x = origin + i·h` spanning row `j`; a `Y` face lies at
/// `y = origin + j·h` spanning column `i`. On periodic axes the last face
/// wraps to index 0, so both sides of the seam share one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FaceKey {
    /// Normal axis
    pub axis: Axis,
    /// Level of the (finer) cell owning the face
    pub level: u8,
    /// Column index
    pub i: u32,
    /// Row index
    pub j: u32,
}

impl FaceKey {
    /// Key of the face on one side of a cell
    pub fn of_cell(key: CellKey, side: Side, periodic: [bool; 2]) -> FaceKey {
        let n = key.cells_per_side();
        let bump = |v: u32, wrap: bool| {
            if v + 1 == n && wrap {
                0
            } else {
                v + 1
            }
        };
        let (i, j) = match side {
            Side::Left | Side::Bottom => (key.i, key.j),
            Side::Right => (bump(key.i, periodic[0]), key.j),
            Side::Top => (key.i, bump(key.j, periodic[1])),
        };
        FaceKey {
            axis: side.axis(),
            level: key.level,
            i,
            j,
        }
    }
}

/// What lies on one side of a face
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceSide {
    /// An active cell of the grid being traversed
    Cell(CellId),
    /// The domain boundary
    Boundary(Side),
}

impl FaceSide {
    /// The cell, if this side is not the boundary
    pub fn cell(self) -> Option<CellId> {
        match self {
            FaceSide::Cell(id) => Some(id),
            FaceSide::Boundary(_) => None,
        }
    }
}

/// One face of a level grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Face {
    /// Lattice position
    pub key: FaceKey,
    /// Side with the lower coordinate along the normal
    pub lo: FaceSide,
    /// Side with the higher coordinate along the normal
    pub hi: FaceSide,
    /// Face length (the finer adjacent cell's size)
    pub length: f64,
    /// Normal distance between the two cell centres, or centre to boundary
    pub distance: f64,
    /// Endpoints, ordered along the face
    pub endpoints: [Vec2; 2],
}

impl Face {
    /// Normal axis
    pub fn axis(&self) -> Axis {
        self.key.axis
    }

    /// Whether one side is the domain boundary
    pub fn is_boundary(&self) -> bool {
        matches!(self.lo, FaceSide::Boundary(_)) || matches!(self.hi, FaceSide::Boundary(_))
    }

    /// Midpoint of the face
    pub fn center(&self) -> Vec2 {
        0.5 * (self.endpoints[0] + self.endpoints[1])
    }
}

/// Depth-first iterator over the faces of one level grid
#[derive(Debug, Clone)]
pub struct Faces<'a> {
    tree: &'a Quadtree,
    cells: LevelCells<'a>,
    current: Option<CellId>,
    next_side: usize,
    limit: u8,
}

impl Iterator for Faces<'_> {
    type Item = Face;

    fn next(&mut self) -> Option<Face> {
        loop {
            let id = match self.current {
                Some(id) => id,
                None => {
                    let id = self.cells.next()?;
                    self.current = Some(id);
                    self.next_side = 0;
                    id
                }
            };
            while self.next_side < Side::ALL.len() {
                let side = Side::ALL[self.next_side];
                self.next_side += 1;
                if let Some(face) = self.face_on(id, side) {
                    return Some(face);
                }
            }
            self.current = None;
        }
    }
}

impl Faces<'_> {
    fn face_on(&self, id: CellId, side: Side) -> Option<Face> {
        let tree = self.tree;
        let h = tree.size_of(id);
        let (own, other, distance) = match tree.neighbor(id, side, self.limit) {
            Neighbor::Boundary(s) => (id, FaceSide::Boundary(s), 0.5 * h),
            Neighbor::Same(n) if side.is_positive() => (id, FaceSide::Cell(n), h),
            Neighbor::Coarser(n) => (id, FaceSide::Cell(n), 1.5 * h),
            Neighbor::Same(_) | Neighbor::Finer(_) => return None,
        };
        let (lo, hi) = if side.is_positive() {
            (FaceSide::Cell(own), other)
        } else {
            (other, FaceSide::Cell(own))
        };
        Some(Face {
            key: FaceKey::of_cell(tree.key(id), side, tree.config().periodic),
            lo,
            hi,
            length: h,
            distance,
            endpoints: side_endpoints(tree, id, side),
        })
    }
}

/// Endpoints of one side of a cell, ordered along the side
pub fn side_endpoints(tree: &Quadtree, id: CellId, side: Side) -> [Vec2; 2] {
    let c = tree.corner(id);
    let h = tree.size_of(id);
    match side {
        Side::Left => [c, c + Vec2::new(0.0, h)],
        Side::Right => [c + Vec2::new(h, 0.0), c + Vec2::new(h, h)],
        Side::Bottom => [c, c + Vec2::new(h, 0.0)],
        Side::Top => [c + Vec2::new(0.0, h), c + Vec2::new(h, h)],
    }
}

impl Quadtree {
    /// Depth-first iterator over all leaves
    pub fn leaves(&self) -> LevelCells<'_> {
        self.level_cells(LEAF_GRID)
    }

    /// Depth-first iterator over the level grid `limit`
    ///
    /// Yields every cell of level `limit` (leaf or not) and every leaf
    /// coarser than `limit`.
    pub fn level_cells(&self, limit: u8) -> LevelCells<'_> {
        LevelCells {
            tree: self,
            stack: vec![self.root()],
            limit,
        }
    }

    /// Iterator over the faces of the leaf grid
    pub fn faces(&self) -> Faces<'_> {
        self.level_faces(LEAF_GRID)
    }

    /// Iterator over the faces of the level grid `limit`
    pub fn level_faces(&self, limit: u8) -> Faces<'_> {
        Faces {
            tree: self,
            cells: self.level_cells(limit),
            current: None,
            next_side: 0,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridConfig;
    use approx::assert_relative_eq;

    fn tree(level: u8, periodic: [bool; 2]) -> Quadtree {
        Quadtree::new(GridConfig {
            origin: [0.0, 0.0],
            size: 1.0,
            initial_level: level,
            min_level: 0,
            max_level: 6,
            periodic,
        })
        .unwrap()
    }

    #[test]
    fn test_leaves_in_morton_order() {
        let tree = tree(2, [false, false]);
        let codes: Vec<u64> = tree.leaves().map(|id| tree.key(id).morton()).collect();
        assert_eq!(codes.len(), 16);
        assert!(codes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_traversal_is_restartable() {
        let tree = tree(2, [false, false]);
        let mut iter = tree.leaves();
        let first: Vec<CellId> = iter.by_ref().take(5).collect();
        let resumed = iter.clone();
        assert_eq!(resumed.count(), 11);
        let again: Vec<CellId> = tree.leaves().take(5).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_uniform_face_count() {
        // 4x4 grid: 5 vertical lines x 4 rows, twice
        let tree = tree(2, [false, false]);
        let faces: Vec<Face> = tree.faces().collect();
        assert_eq!(faces.len(), 40);
        let boundary = faces.iter().filter(|f| f.is_boundary()).count();
        assert_eq!(boundary, 16);
        for face in &faces {
            assert_relative_eq!(face.length, 0.25);
        }
    }

    #[test]
    fn test_periodic_face_count() {
        let tree = tree(2, [true, true]);
        let faces: Vec<Face> = tree.faces().collect();
        assert_eq!(faces.len(), 32);
        assert!(faces.iter().all(|f| !f.is_boundary()));
    }

    #[test]
    fn test_faces_unique_with_refinement() {
        let mut tree = tree(2, [false, false]);
        let id = tree.find(CellKey::new(2, 1, 1)).unwrap();
        tree.split(id).unwrap();
        let faces: Vec<Face> = tree.faces().collect();
        let mut keys: Vec<FaceKey> = faces.iter().map(|f| f.key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), faces.len());
        // 40 coarse faces - 4 replaced by 8 fine ones + 4 interior fine faces
        assert_eq!(faces.len(), 40 - 4 + 8 + 4);

        let coarse_fine: Vec<&Face> = faces
            .iter()
            .filter(|f| f.key.level == 3 && (f.distance - 0.1875).abs() < 1e-12)
            .collect();
        assert_eq!(coarse_fine.len(), 8);
    }

    #[test]
    fn test_refined_patch_visited_in_place() {
        let mut tree = tree(1, [false, false]);
        let se = tree.find(CellKey::new(1, 1, 0)).unwrap();
        tree.split(se).unwrap();
        let keys: Vec<CellKey> = tree.leaves().map(|id| tree.key(id)).collect();
        assert_eq!(
            keys,
            vec![
                CellKey::new(1, 0, 0),
                CellKey::new(2, 2, 0),
                CellKey::new(2, 3, 0),
                CellKey::new(2, 2, 1),
                CellKey::new(2, 3, 1),
                CellKey::new(1, 0, 1),
                CellKey::new(1, 1, 1),
            ]
        );
    }

    #[test]
    fn test_level_grid_contains_coarse_leaves() {
        let mut tree = tree(1, [false, false]);
        let id = tree.find(CellKey::new(1, 0, 0)).unwrap();
        tree.split(id).unwrap();
        let level1: Vec<CellId> = tree.level_cells(1).collect();
        assert_eq!(level1.len(), 4);
        let level2: Vec<CellId> = tree.level_cells(2).collect();
        assert_eq!(level2.len(), 7);
        let level0: Vec<CellId> = tree.level_cells(0).collect();
        assert_eq!(level0, vec![tree.root()]);
    }

    #[test]
    fn test_face_orientation() {
        let tree = tree(1, [false, false]);
        let sw = tree.find(CellKey::new(1, 0, 0)).unwrap();
        let se = tree.find(CellKey::new(1, 1, 0)).unwrap();
        let face = tree
            .faces()
            .find(|f| f.lo == FaceSide::Cell(sw) && f.hi == FaceSide::Cell(se))
            .unwrap();
        assert_eq!(face.axis(), Axis::X);
        assert_eq!(face.key, FaceKey { axis: Axis::X, level: 1, i: 1, j: 0 });
        assert_relative_eq!(face.center().x, 0.5);
        assert_relative_eq!(face.center().y, 0.25);
    }
}
