//! Quadtree index over the square domain
//!
//! The tree owns every cell record (leaves and refined ancestors) in a slab
//! with a free list, plus a hash index from [`CellKey`] to slot. It is the
//! only place topology changes: [`Quadtree::split`] and [`Quadtree::merge`]
//! check 2:1 balance against face and corner neighbours before touching the
//! slab, so a rejected request leaves the tree untouched.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cell::{Cell, CellId, CellKey, CellStatus, Side};
use crate::core_types::Vec2;
use crate::error::{EngineError, TopologyReason};

/// Level argument meaning "the leaf grid" in level-grid queries
pub const LEAF_GRID: u8 = u8::MAX;

/// Deepest level the lattice coordinates can address
pub const MAX_SUPPORTED_LEVEL: u8 = 30;

/// Face and corner neighbour offsets
pub(crate) const NEIGHBOR_OFFSETS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Configuration for the square computational domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Lower-left corner of the domain
    pub origin: [f64; 2],
    /// Side length of the square domain
    pub size: f64,
    /// Uniform level the tree is refined to on creation
    pub initial_level: u8,
    /// Coarsest level adaptation may reach
    pub min_level: u8,
    /// Finest level any cell may reach
    pub max_level: u8,
    /// Whether the x and y axes wrap around
    pub periodic: [bool; 2],
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            origin: [-0.5, -0.5],
            size: 1.0,
            initial_level: 4,
            min_level: 2,
            max_level: 8,
            periodic: [false, false],
        }
    }
}

impl GridConfig {
    /// Square domain of side `size` centred on the origin
    pub fn centered(size: f64, initial_level: u8, min_level: u8, max_level: u8) -> Self {
        Self {
            origin: [-0.5 * size, -0.5 * size],
            size,
            initial_level,
            min_level,
            max_level,
            periodic: [false, false],
        }
    }

    /// Check the configuration for consistency
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if the size is not a positive
    /// finite number or the levels are out of order or out of range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.size.is_finite() && self.size > 0.0) {
            return Err(EngineError::config(format!(
                "domain size must be positive, got {}",
                self.size
            )));
        }
        if !(self.origin[0].is_finite() && self.origin[1].is_finite()) {
            return Err(EngineError::config("domain origin must be finite"));
        }
        if self.max_level > MAX_SUPPORTED_LEVEL {
            return Err(EngineError::config(format!(
                "max_level {} exceeds supported depth {MAX_SUPPORTED_LEVEL}",
                self.max_level
            )));
        }
        if self.min_level > self.initial_level || self.initial_level > self.max_level {
            return Err(EngineError::config(format!(
                "levels must satisfy min <= initial <= max, got {} / {} / {}",
                self.min_level, self.initial_level, self.max_level
            )));
        }
        Ok(())
    }

    /// Cell side length at a level
    #[inline]
    pub fn cell_size(&self, level: u8) -> f64 {
        self.size / f64::from(1u32 << level)
    }
}

/// Result of a neighbour lookup on a level grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neighbor {
    /// The side lies on the domain boundary
    Boundary(Side),
    /// A cell of the same level
    Same(CellId),
    /// A coarser leaf (one level up under 2:1 balance)
    Coarser(CellId),
    /// Two finer cells, ordered along the shared side
    Finer([CellId; 2]),
}

/// Adaptive quadtree over a square domain
#[derive(Debug, Clone)]
pub struct Quadtree {
    config: GridConfig,
    cells: Vec<Cell>,
    lookup: FxHashMap<CellKey, CellId>,
    free: Vec<CellId>,
    leaves_per_level: Vec<usize>,
    generation: u64,
}

impl Quadtree {
    /// Create a tree refined uniformly to `config.initial_level`
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if the grid config is invalid.
    pub fn new(config: GridConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let mut leaves_per_level = vec![0; usize::from(config.max_level) + 1];
        leaves_per_level[0] = 1;
        let mut tree = Self {
            config,
            cells: vec![Cell {
                key: CellKey::ROOT,
                status: CellStatus::Leaf,
                parent: None,
                children: None,
            }],
            lookup: FxHashMap::default(),
            free: Vec::new(),
            leaves_per_level,
            generation: 0,
        };
        tree.lookup.insert(CellKey::ROOT, CellId(0));

        for _ in 0..tree.config.initial_level {
            let leaves: Vec<CellId> = tree.leaves().collect();
            for id in leaves {
                tree.split(id)?;
            }
        }

        debug!(
            "Quadtree created: {} leaves at level {}, domain size {}",
            tree.leaf_count(),
            tree.config.initial_level,
            tree.config.size
        );
        Ok(tree)
    }

    /// Grid configuration
    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Counter bumped by every split and merge
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of slots in the cell store, including recycled ones
    ///
    /// Every field array is at least this long.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// The root cell
    pub fn root(&self) -> CellId {
        CellId(0)
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> usize {
        self.leaves_per_level.iter().sum()
    }

    /// Number of leaves on each level
    pub fn leaves_per_level(&self) -> &[usize] {
        &self.leaves_per_level
    }

    /// Level of the finest leaf
    pub fn depth(&self) -> u8 {
        self.leaves_per_level
            .iter()
            .rposition(|&n| n > 0)
            .map_or(0, |l| l as u8)
    }

    /// Topology record of a cell
    ///
    /// # Panics
    ///
    /// Panics if the id is out of range
    #[inline]
    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.index()]
    }

    /// Topology record of a cell if the id names a live cell
    pub fn get(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(id.index()).filter(|c| c.is_live())
    }

    /// Key of a cell
    #[inline]
    pub fn key(&self, id: CellId) -> CellKey {
        self.cells[id.index()].key
    }

    /// Level of a cell
    #[inline]
    pub fn level(&self, id: CellId) -> u8 {
        self.cells[id.index()].key.level
    }

    /// Whether a cell is a leaf
    #[inline]
    pub fn is_leaf(&self, id: CellId) -> bool {
        self.cells[id.index()].is_leaf()
    }

    /// Children of a refined cell
    #[inline]
    pub fn children(&self, id: CellId) -> Option<[CellId; 4]> {
        self.cells[id.index()].children
    }

    /// Parent of a cell
    #[inline]
    pub fn parent(&self, id: CellId) -> Option<CellId> {
        self.cells[id.index()].parent
    }

    /// Look up a live cell by key
    #[inline]
    pub fn find(&self, key: CellKey) -> Option<CellId> {
        self.lookup.get(&key).copied()
    }

    /// Deepest live cell whose area contains the area of `key`
    pub fn covering(&self, key: CellKey) -> Option<CellId> {
        (0..=key.level)
            .rev()
            .find_map(|level| self.find(key.ancestor(level)))
    }

    /// Cell side length at a level
    #[inline]
    pub fn cell_size(&self, level: u8) -> f64 {
        self.config.cell_size(level)
    }

    /// Side length of a cell
    #[inline]
    pub fn size_of(&self, id: CellId) -> f64 {
        self.config.cell_size(self.level(id))
    }

    /// Lower-left corner of a cell
    pub fn corner(&self, id: CellId) -> Vec2 {
        let key = self.key(id);
        let h = self.cell_size(key.level);
        Vec2::new(
            self.config.origin[0] + f64::from(key.i) * h,
            self.config.origin[1] + f64::from(key.j) * h,
        )
    }

    /// Centre of a cell
    pub fn center(&self, id: CellId) -> Vec2 {
        let h = self.size_of(id);
        self.corner(id) + Vec2::new(0.5 * h, 0.5 * h)
    }

    /// Whether a point lies inside the (closed) domain square
    pub fn contains(&self, p: Vec2) -> bool {
        let [x0, y0] = self.config.origin;
        let l = self.config.size;
        p.x >= x0 && p.x <= x0 + l && p.y >= y0 && p.y <= y0 + l
    }

    /// Leaf containing a point
    ///
    /// Points on an internal edge belong to the cell above/right of it.
    /// Returns `None` for points outside the domain.
    pub fn locate(&self, p: Vec2) -> Option<CellId> {
        if !self.contains(p) {
            return None;
        }
        let mut id = self.root();
        while let Some(children) = self.children(id) {
            let c = self.center(id);
            let q = usize::from(p.x >= c.x) | (usize::from(p.y >= c.y) << 1);
            id = children[q];
        }
        Some(id)
    }

    /// Whether a cell belongs to the level grid `limit`
    ///
    /// The level grid `l` holds every cell of level `l` plus all leaves
    /// coarser than `l`; [`LEAF_GRID`] selects the leaves.
    #[inline]
    pub fn is_active(&self, id: CellId, limit: u8) -> bool {
        let cell = &self.cells[id.index()];
        cell.key.level == limit || (cell.is_leaf() && cell.key.level < limit)
    }

    /// Neighbour of an active cell across one side, on the level grid `limit`
    pub fn neighbor(&self, id: CellId, side: Side, limit: u8) -> Neighbor {
        let key = self.key(id);
        let Some(nkey) = key.neighbor(side, self.config.periodic) else {
            return Neighbor::Boundary(side);
        };
        match self.find(nkey) {
            Some(n) if self.is_active(n, limit) => Neighbor::Same(n),
            Some(n) => match self.children(n) {
                Some(children) => {
                    let [a, b] = side.opposite().quadrants();
                    Neighbor::Finer([children[a], children[b]])
                }
                None => Neighbor::Same(n),
            },
            None => match self.covering(nkey) {
                Some(c) => Neighbor::Coarser(c),
                None => Neighbor::Boundary(side),
            },
        }
    }

    /// Check whether a leaf may be split
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TopologyViolation`] if the cell is not a live
    /// leaf, is already at the maximum level, or has a coarser face or
    /// corner neighbour.
    pub fn check_refine(&self, id: CellId) -> Result<(), EngineError> {
        let cell = self.live(id)?;
        let key = cell.key;
        if !cell.is_leaf() {
            return Err(violation(key, TopologyReason::NotALeaf));
        }
        if key.level >= self.config.max_level {
            return Err(violation(key, TopologyReason::MaxLevelReached));
        }
        for (di, dj) in NEIGHBOR_OFFSETS {
            if let Some(nkey) = key.offset(di, dj, self.config.periodic) {
                if self.find(nkey).is_none() {
                    let neighbor = self.covering(nkey).map_or(nkey, |c| self.key(c));
                    return Err(violation(key, TopologyReason::Unbalanced { neighbor }));
                }
            }
        }
        Ok(())
    }

    /// Check whether a refined cell may be merged back into a leaf
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TopologyViolation`] if the cell has no
    /// children, a child is refined, or a neighbour's child adjacent to
    /// this cell is refined.
    pub fn check_coarsen(&self, id: CellId) -> Result<(), EngineError> {
        let cell = self.live(id)?;
        let key = cell.key;
        let Some(children) = cell.children else {
            return Err(violation(key, TopologyReason::NotRefined));
        };
        if children.iter().any(|&c| !self.is_leaf(c)) {
            return Err(violation(key, TopologyReason::ChildNotLeaf));
        }
        for (di, dj) in NEIGHBOR_OFFSETS {
            let Some(nkey) = key.offset(di, dj, self.config.periodic) else {
                continue;
            };
            let Some(ncells) = self.find(nkey).and_then(|n| self.children(n)) else {
                continue;
            };
            for (q, &child) in ncells.iter().enumerate() {
                if faces_block(q, di, dj) && !self.is_leaf(child) {
                    return Err(violation(
                        key,
                        TopologyReason::Unbalanced {
                            neighbor: self.key(child),
                        },
                    ));
                }
            }
        }
        Ok(())
    }

    /// Replace a leaf by four children
    ///
    /// Field values are not touched; callers prolong data into the returned
    /// slots.
    ///
    /// # Errors
    ///
    /// See [`Quadtree::check_refine`].
    pub(crate) fn split(&mut self, id: CellId) -> Result<[CellId; 4], EngineError> {
        self.check_refine(id)?;
        let key = self.key(id);
        let children = key.children().map(|child| {
            let slot = self.allocate(Cell {
                key: child,
                status: CellStatus::Leaf,
                parent: Some(id),
                children: None,
            });
            self.lookup.insert(child, slot);
            slot
        });

        let cell = &mut self.cells[id.index()];
        cell.status = CellStatus::Refined;
        cell.children = Some(children);
        self.leaves_per_level[usize::from(key.level)] -= 1;
        self.leaves_per_level[usize::from(key.level) + 1] += 4;
        self.generation += 1;
        Ok(children)
    }

    /// Destroy the four leaf children of a cell, making it a leaf again
    ///
    /// # Errors
    ///
    /// See [`Quadtree::check_coarsen`].
    pub(crate) fn merge(&mut self, id: CellId) -> Result<[CellId; 4], EngineError> {
        self.check_coarsen(id)?;
        let key = self.key(id);
        let Some(children) = self.children(id) else {
            return Err(violation(key, TopologyReason::NotRefined));
        };
        for &child in &children {
            let record = &mut self.cells[child.index()];
            record.status = CellStatus::Destroyed;
            record.parent = None;
            let child_key = record.key;
            self.lookup.remove(&child_key);
            self.free.push(child);
        }

        let cell = &mut self.cells[id.index()];
        cell.status = CellStatus::Leaf;
        cell.children = None;
        self.leaves_per_level[usize::from(key.level) + 1] -= 4;
        self.leaves_per_level[usize::from(key.level)] += 1;
        self.generation += 1;
        Ok(children)
    }

    /// All refined cells, deepest level first
    ///
    /// Within a level the order is depth-first, so the list is a valid
    /// bottom-up schedule for restriction.
    pub fn refined_bottom_up(&self) -> Vec<CellId> {
        let mut refined = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            if let Some(children) = self.children(id) {
                refined.push(id);
                stack.extend(children.iter().rev());
            }
        }
        refined.sort_by_key(|&id| std::cmp::Reverse(self.level(id)));
        refined
    }

    /// Verify that every pair of adjacent leaves differs by at most one level
    ///
    /// Returns the first offending pair of keys.
    pub fn find_imbalance(&self) -> Option<(CellKey, CellKey)> {
        for leaf in self.leaves() {
            let key = self.key(leaf);
            for (di, dj) in NEIGHBOR_OFFSETS {
                let Some(nkey) = key.offset(di, dj, self.config.periodic) else {
                    continue;
                };
                if let Some(c) = self.covering(nkey) {
                    let ckey = self.key(c);
                    if key.level > ckey.level + 1 {
                        return Some((key, ckey));
                    }
                }
            }
        }
        None
    }

    fn live(&self, id: CellId) -> Result<&Cell, EngineError> {
        self.get(id).ok_or_else(|| {
            let key = self
                .cells
                .get(id.index())
                .map_or(CellKey::ROOT, |c| c.key);
            violation(key, TopologyReason::UnknownCell)
        })
    }

    fn allocate(&mut self, cell: Cell) -> CellId {
        if let Some(slot) = self.free.pop() {
            self.cells[slot.index()] = cell;
            slot
        } else {
            let slot = CellId(self.cells.len() as u32);
            self.cells.push(cell);
            slot
        }
    }
}

/// Whether child `q` of the neighbour at offset `(di, dj)` touches the block
fn faces_block(q: usize, di: i32, dj: i32) -> bool {
    let x_bit = q & 1;
    let y_bit = q >> 1;
    let x_ok = match di {
        1 => x_bit == 0,
        -1 => x_bit == 1,
        _ => true,
    };
    let y_ok = match dj {
        1 => y_bit == 0,
        -1 => y_bit == 1,
        _ => true,
    };
    x_ok && y_ok
}

fn violation(cell: CellKey, reason: TopologyReason) -> EngineError {
    EngineError::TopologyViolation { cell, reason }
}
