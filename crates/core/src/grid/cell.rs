//! Cell identity and per-cell topology records
//!
//! A cell is identified by its refinement level and integer coordinates
//! `(i, j)` on the uniform `2^level × 2^level` lattice covering the domain.
//! Children are always stored in quadrant order SW, SE, NW, NE, which is
//! also the Morton order of their `(i, j)` low bits.

use serde::{Deserialize, Serialize};

/// Quadrant index of the south-west child
pub const SW: usize = 0;
/// Quadrant index of the south-east child
pub const SE: usize = 1;
/// Quadrant index of the north-west child
pub const NW: usize = 2;
/// Quadrant index of the north-east child
pub const NE: usize = 3;

/// Position of a cell in the tree: level plus lattice coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    /// Refinement level (0 = root)
    pub level: u8,
    /// Column index on the level lattice
    pub i: u32,
    /// Row index on the level lattice
    pub j: u32,
}

impl CellKey {
    /// The root cell covering the whole domain
    pub const ROOT: CellKey = CellKey { level: 0, i: 0, j: 0 };

    /// Create a key
    pub const fn new(level: u8, i: u32, j: u32) -> Self {
        CellKey { level, i, j }
    }

    /// Number of cells per side at this key's level
    #[inline]
    pub fn cells_per_side(&self) -> u32 {
        1u32 << self.level
    }

    /// Parent key, `None` for the root
    #[inline]
    pub fn parent(&self) -> Option<CellKey> {
        if self.level == 0 {
            None
        } else {
            Some(CellKey::new(self.level - 1, self.i >> 1, self.j >> 1))
        }
    }

    /// Key of the child in the given quadrant
    #[inline]
    pub fn child(&self, quadrant: usize) -> CellKey {
        debug_assert!(quadrant < 4);
        CellKey::new(
            self.level + 1,
            (self.i << 1) | (quadrant as u32 & 1),
            (self.j << 1) | (quadrant as u32 >> 1),
        )
    }

    /// Keys of all four children in quadrant order
    pub fn children(&self) -> [CellKey; 4] {
        [self.child(SW), self.child(SE), self.child(NW), self.child(NE)]
    }

    /// Quadrant this cell occupies inside its parent
    #[inline]
    pub fn quadrant(&self) -> usize {
        ((self.i & 1) | ((self.j & 1) << 1)) as usize
    }

    /// Ancestor of this key at a coarser level
    pub fn ancestor(&self, level: u8) -> CellKey {
        debug_assert!(level <= self.level);
        let shift = self.level - level;
        CellKey::new(level, self.i >> shift, self.j >> shift)
    }

    /// Key offset by `(di, dj)` cells on the same level
    ///
    /// # Arguments
    ///
    /// * `di` - Column offset
    /// * `dj` - Row offset
    /// * `periodic` - Whether each axis wraps around
    ///
    /// # Returns
    ///
    /// The neighbouring key, or `None` if it lies outside a non-periodic domain
    pub fn offset(&self, di: i32, dj: i32, periodic: [bool; 2]) -> Option<CellKey> {
        let n = i64::from(self.cells_per_side());
        let wrap = |v: i64, p: bool| -> Option<u32> {
            if (0..n).contains(&v) {
                Some(v as u32)
            } else if p {
                Some(v.rem_euclid(n) as u32)
            } else {
                None
            }
        };
        let i = wrap(i64::from(self.i) + i64::from(di), periodic[0])?;
        let j = wrap(i64::from(self.j) + i64::from(dj), periodic[1])?;
        Some(CellKey::new(self.level, i, j))
    }

    /// Neighbour across one side on the same level
    pub fn neighbor(&self, side: Side, periodic: [bool; 2]) -> Option<CellKey> {
        let (di, dj) = side.offset();
        self.offset(di, dj, periodic)
    }

    /// Morton (Z-order) code of the lattice coordinates
    ///
    /// Interleaves the bits of `i` and `j`, matching the depth-first child
    /// order used by the traversals.
    pub fn morton(&self) -> u64 {
        fn spread(v: u32) -> u64 {
            let mut x = u64::from(v);
            x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
            x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
            x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
            x = (x | (x << 2)) & 0x3333_3333_3333_3333;
            x = (x | (x << 1)) & 0x5555_5555_5555_5555;
            x
        }
        spread(self.i) | (spread(self.j) << 1)
    }
}

impl std::fmt::Display for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.level, self.i, self.j)
    }
}

/// Slot index of a live cell in the cell store
///
/// Ids of destroyed cells are recycled, so an id is only meaningful for the
/// topology generation it was obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub(crate) u32);

impl CellId {
    /// Position of the cell's values in every field array
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Coordinate axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// Horizontal
    X,
    /// Vertical
    Y,
}

impl Axis {
    /// Component index into a 2D vector
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
        }
    }
}

/// One of the four sides of a cell, or of the square domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// -x
    Left,
    /// +x
    Right,
    /// -y
    Bottom,
    /// +y
    Top,
}

impl Side {
    /// All sides in a fixed order
    pub const ALL: [Side; 4] = [Side::Left, Side::Right, Side::Bottom, Side::Top];

    /// Lattice offset towards this side
    #[inline]
    pub fn offset(self) -> (i32, i32) {
        match self {
            Side::Left => (-1, 0),
            Side::Right => (1, 0),
            Side::Bottom => (0, -1),
            Side::Top => (0, 1),
        }
    }

    /// Axis normal to this side
    #[inline]
    pub fn axis(self) -> Axis {
        match self {
            Side::Left | Side::Right => Axis::X,
            Side::Bottom | Side::Top => Axis::Y,
        }
    }

    /// Whether the outward normal points in the positive axis direction
    #[inline]
    pub fn is_positive(self) -> bool {
        matches!(self, Side::Right | Side::Top)
    }

    /// The side facing this one
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
            Side::Bottom => Side::Top,
            Side::Top => Side::Bottom,
        }
    }

    /// Position in [`Side::ALL`]
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
            Side::Bottom => 2,
            Side::Top => 3,
        }
    }

    /// Quadrants of a cell's children that touch this side, ordered along the side
    #[inline]
    pub fn quadrants(self) -> [usize; 2] {
        match self {
            Side::Left => [SW, NW],
            Side::Right => [SE, NE],
            Side::Bottom => [SW, SE],
            Side::Top => [NW, NE],
        }
    }
}

/// Lifecycle state of a cell slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// Active cell without children
    Leaf,
    /// Cell with four children; still carries restricted values
    Refined,
    /// Slot released by coarsening, waiting for reuse
    Destroyed,
}

/// Topology record of one cell
#[derive(Debug, Clone)]
pub struct Cell {
    /// Position in the tree
    pub key: CellKey,
    /// Current status
    pub status: CellStatus,
    /// Parent cell, `None` for the root
    pub parent: Option<CellId>,
    /// Children in quadrant order, present while refined
    pub children: Option<[CellId; 4]>,
}

impl Cell {
    /// Whether the cell is an active leaf
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.status == CellStatus::Leaf
    }

    /// Whether the slot holds a live (leaf or refined) cell
    #[inline]
    pub fn is_live(&self) -> bool {
        self.status != CellStatus::Destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_child_round_trip() {
        let key = CellKey::new(4, 5, 9);
        for (q, child) in key.children().iter().enumerate() {
            assert_eq!(child.parent(), Some(key));
            assert_eq!(child.quadrant(), q);
            assert_eq!(child.level, 5);
        }
        assert_eq!(CellKey::ROOT.parent(), None);
    }

    #[test]
    fn test_child_layout() {
        let key = CellKey::new(1, 1, 0);
        assert_eq!(key.child(SW), CellKey::new(2, 2, 0));
        assert_eq!(key.child(SE), CellKey::new(2, 3, 0));
        assert_eq!(key.child(NW), CellKey::new(2, 2, 1));
        assert_eq!(key.child(NE), CellKey::new(2, 3, 1));
    }

    #[test]
    fn test_offset_clips_and_wraps() {
        let key = CellKey::new(2, 0, 3);
        assert_eq!(key.offset(-1, 0, [false, false]), None);
        assert_eq!(key.offset(-1, 0, [true, false]), Some(CellKey::new(2, 3, 3)));
        assert_eq!(key.offset(0, 1, [false, false]), None);
        assert_eq!(key.offset(0, 1, [false, true]), Some(CellKey::new(2, 0, 0)));
        assert_eq!(key.offset(1, -1, [false, false]), Some(CellKey::new(2, 1, 2)));
    }

    #[test]
    fn test_ancestor() {
        let key = CellKey::new(5, 27, 13);
        assert_eq!(key.ancestor(5), key);
        assert_eq!(key.ancestor(3), CellKey::new(3, 6, 3));
        assert_eq!(key.ancestor(0), CellKey::ROOT);
    }

    #[test]
    fn test_morton_follows_quadrant_order() {
        let parent = CellKey::new(3, 2, 6);
        let codes: Vec<u64> = parent.children().iter().map(CellKey::morton).collect();
        assert!(codes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(CellKey::new(1, 1, 1).morton(), 3);
    }

    #[test]
    fn test_side_quadrants_touch_side() {
        let parent = CellKey::new(2, 1, 1);
        for side in Side::ALL {
            for q in side.quadrants() {
                let child = parent.child(q);
                match side {
                    Side::Left => assert_eq!(child.i, parent.i * 2),
                    Side::Right => assert_eq!(child.i, parent.i * 2 + 1),
                    Side::Bottom => assert_eq!(child.j, parent.j * 2),
                    Side::Top => assert_eq!(child.j, parent.j * 2 + 1),
                }
            }
            assert_eq!(side.opposite().opposite(), side);
        }
    }
}
