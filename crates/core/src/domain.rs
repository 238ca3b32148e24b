//! Computational domain: quadtree, fields and their values
//!
//! [`Domain`] ties the topology to the data. Every refine and coarsen goes
//! through it so that prolongation and restriction run for every registered
//! field in the same call that changes the tree. Two fields are always
//! present: the cell volume fraction `cs` and the face fraction `fs`, both
//! 1 (all fluid) until an embedded geometry writes them.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core_types::Vec2;
use crate::error::{EngineError, TopologyReason};
use crate::fields::{
    FaceData, FaceFieldHandle, FieldData, FieldHandle, FieldRegistry, FieldSpec, Prolongation,
    Restriction, Stencil, VectorHandle,
};
use crate::geometry::Interface;
use crate::grid::{CellId, CellKey, FaceKey, GridConfig, Neighbor, Quadtree, Side};

/// Name of the reserved cell volume-fraction field
pub const VOLUME_FRACTION: &str = "cs";
/// Name of the reserved face-fraction field
pub const FACE_FRACTION: &str = "fs";

/// Geometric description of one cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellInfo {
    /// Slot id
    pub id: CellId,
    /// Tree position
    pub key: CellKey,
    /// Centre point
    pub center: Vec2,
    /// Side length
    pub size: f64,
}

impl CellInfo {
    /// Refinement level
    pub fn level(&self) -> u8 {
        self.key.level
    }
}

/// Volume-weighted statistics of a field over the fluid part of the leaves
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    /// Smallest value
    pub min: f64,
    /// Largest value
    pub max: f64,
    /// Integral Σ v·dv
    pub sum: f64,
    /// Σ v²·dv
    pub sum_squares: f64,
    /// Fluid volume Σ dv
    pub volume: f64,
    /// Number of leaves with fluid
    pub cells: usize,
}

impl FieldStats {
    /// Statistics of nothing
    pub fn empty() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            sum_squares: 0.0,
            volume: 0.0,
            cells: 0,
        }
    }

    fn single(value: f64, dv: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value * dv,
            sum_squares: value * value * dv,
            volume: dv,
            cells: 1,
        }
    }

    /// Combine two disjoint sets of cells
    pub fn merge(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            sum: self.sum + other.sum,
            sum_squares: self.sum_squares + other.sum_squares,
            volume: self.volume + other.volume,
            cells: self.cells + other.cells,
        }
    }

    /// Volume-weighted mean
    pub fn mean(&self) -> f64 {
        if self.volume > 0.0 {
            self.sum / self.volume
        } else {
            0.0
        }
    }

    /// Volume-weighted standard deviation
    pub fn stddev(&self) -> f64 {
        if self.volume > 0.0 {
            let mean = self.mean();
            (self.sum_squares / self.volume - mean * mean).max(0.0).sqrt()
        } else {
            0.0
        }
    }
}

/// Quadtree plus all field storage
#[derive(Debug, Clone)]
pub struct Domain {
    tree: Quadtree,
    fields: FieldRegistry,
    data: FieldData,
    faces: FaceData,
    interfaces: FxHashMap<CellId, Interface>,
    cs: FieldHandle,
    fs: FaceFieldHandle,
}

impl Domain {
    /// Create a domain refined uniformly to the initial level
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if the grid config is invalid.
    pub fn new(config: GridConfig) -> Result<Self, EngineError> {
        let tree = Quadtree::new(config)?;
        let fields = FieldRegistry::new(tree.config().periodic);
        let data = FieldData::new(tree.capacity());
        let mut domain = Self {
            tree,
            fields,
            data,
            faces: FaceData::default(),
            interfaces: FxHashMap::default(),
            cs: FieldHandle(0),
            fs: FaceFieldHandle(0),
        };
        domain.cs = domain.register(
            FieldSpec::scalar(VOLUME_FRACTION)
                .with_default(1.0)
                .with_prolongation(Prolongation::Constant)
                .with_restriction(Restriction::Average),
        )?;
        domain.fs = domain.register_face_field(FACE_FRACTION, 1.0)?;

        info!(
            "Domain initialized: size {} at ({}, {}), {} leaves, levels {}..{}",
            domain.tree.config().size,
            domain.tree.config().origin[0],
            domain.tree.config().origin[1],
            domain.tree.leaf_count(),
            domain.tree.config().min_level,
            domain.tree.config().max_level
        );
        Ok(domain)
    }

    /// The quadtree
    pub fn tree(&self) -> &Quadtree {
        &self.tree
    }

    /// The field registry
    pub fn fields(&self) -> &FieldRegistry {
        &self.fields
    }

    /// Cell field values
    pub fn data(&self) -> &FieldData {
        &self.data
    }

    /// Face field values
    pub fn face_data(&self) -> &FaceData {
        &self.faces
    }

    /// Handle of the volume-fraction field
    pub fn cs(&self) -> FieldHandle {
        self.cs
    }

    /// Handle of the face-fraction field
    pub fn fs(&self) -> FaceFieldHandle {
        self.fs
    }

    /// Declare a cell field; every live cell starts at the spec's default
    ///
    /// # Errors
    ///
    /// See [`FieldRegistry::register`].
    pub fn register(&mut self, spec: FieldSpec) -> Result<FieldHandle, EngineError> {
        let default = spec.default_value;
        let handle = self.fields.register(spec)?;
        self.data.add_slot(default);
        Ok(handle)
    }

    /// Declare a vector field as two scalar components
    ///
    /// # Errors
    ///
    /// See [`FieldRegistry::register_vector`].
    pub fn register_vector(&mut self, template: FieldSpec) -> Result<VectorHandle, EngineError> {
        let default = template.default_value;
        let handle = self.fields.register_vector(template)?;
        self.data.add_slot(default);
        self.data.add_slot(default);
        Ok(handle)
    }

    /// Declare a face field
    ///
    /// # Errors
    ///
    /// See [`FieldRegistry::register_face`].
    pub fn register_face_field(
        &mut self,
        name: impl Into<String>,
        default_value: f64,
    ) -> Result<FaceFieldHandle, EngineError> {
        let handle = self.fields.register_face(name, default_value)?;
        self.faces.add_store(default_value);
        Ok(handle)
    }

    /// Close the registry
    pub fn freeze(&mut self) {
        self.fields.freeze();
    }

    /// Value of a field in a cell
    #[inline]
    pub fn value(&self, field: FieldHandle, cell: CellId) -> f64 {
        self.data.get(field, cell)
    }

    /// Set the value of a field in a cell
    ///
    /// Ancestor values are refreshed by the next restriction.
    #[inline]
    pub fn set_value(&mut self, field: FieldHandle, cell: CellId, value: f64) {
        self.data.set(field, cell, value);
    }

    /// Value of a face field
    #[inline]
    pub fn face_value(&self, field: FaceFieldHandle, face: FaceKey) -> f64 {
        self.faces.get(field, face)
    }

    /// Set the value of a face field
    pub fn set_face_value(&mut self, field: FaceFieldHandle, face: FaceKey, value: f64) {
        self.faces.set(field, face, value);
    }

    /// Embedded surface crossing a cut leaf
    pub fn interface(&self, cell: CellId) -> Option<&Interface> {
        self.interfaces.get(&cell)
    }

    /// Number of cut leaves with an embedded surface
    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Geometry of a cell
    pub fn cell_info(&self, id: CellId) -> CellInfo {
        CellInfo {
            id,
            key: self.tree.key(id),
            center: self.tree.center(id),
            size: self.tree.size_of(id),
        }
    }

    /// Geometry of every leaf in traversal order
    pub fn leaf_infos(&self) -> Vec<CellInfo> {
        self.tree.leaves().map(|id| self.cell_info(id)).collect()
    }

    /// Set a field on every leaf from a function of the cell, then restrict
    ///
    /// The function runs in parallel over the leaves.
    pub fn map_leaves<F>(&mut self, field: FieldHandle, f: F)
    where
        F: Fn(&CellInfo) -> f64 + Sync,
    {
        let infos = self.leaf_infos();
        let values: Vec<f64> = infos.par_iter().map(&f).collect();
        for (info, value) in infos.iter().zip(values) {
            self.data.set(field, info.id, value);
        }
        self.restrict(field);
    }

    /// Set a field on every leaf from a function of the cell centre
    pub fn fill<F>(&mut self, field: FieldHandle, f: F)
    where
        F: Fn(Vec2) -> f64 + Sync,
    {
        self.map_leaves(field, |info| f(info.center));
    }

    /// Values of a field around a cell on its own level grid
    ///
    /// Domain edges use the field's boundary ghosts; fully solid neighbours
    /// mirror the centre value.
    pub fn stencil(&self, field: FieldHandle, id: CellId) -> Stencil {
        let spec = self.fields.spec(field);
        let center = self.data.get(field, id);
        let h = self.tree.size_of(id);
        let level = self.tree.level(id);
        let fluid_value = |n: CellId| {
            if self.data.get(self.cs, n) > 0.0 {
                self.data.get(field, n)
            } else {
                center
            }
        };
        let value_on = |side: Side| match self.tree.neighbor(id, side, level) {
            Neighbor::Same(n) | Neighbor::Coarser(n) => fluid_value(n),
            Neighbor::Finer([a, b]) => 0.5 * (fluid_value(a) + fluid_value(b)),
            Neighbor::Boundary(s) => spec.boundary.get(s).ghost(center, h),
        };
        Stencil {
            center,
            left: value_on(Side::Left),
            right: value_on(Side::Right),
            bottom: value_on(Side::Bottom),
            top: value_on(Side::Top),
        }
    }

    /// Split a leaf, prolonging every field into the children
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TopologyViolation`] if the split is not allowed;
    /// the domain is unchanged in that case.
    pub fn refine(&mut self, id: CellId) -> Result<[CellId; 4], EngineError> {
        self.tree.check_refine(id)?;
        let values: Vec<[f64; 4]> = self
            .fields
            .iter()
            .map(|(h, spec)| spec.prolongation.apply(&self.stencil(h, id)))
            .collect();

        let children = self.tree.split(id)?;
        self.data.ensure_capacity(self.tree.capacity());
        for (k, child_values) in values.iter().enumerate() {
            let field = FieldHandle(k as u32);
            for (child, &value) in children.iter().zip(child_values) {
                self.data.set(field, *child, value);
            }
        }
        self.interfaces.remove(&id);
        Ok(children)
    }

    /// Split a leaf, first splitting any coarser neighbour that would break balance
    ///
    /// # Returns
    ///
    /// Number of cells split, including the target
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TopologyViolation`] if the target is not a leaf
    /// or is already at the maximum level.
    pub fn refine_balanced(&mut self, id: CellId) -> Result<usize, EngineError> {
        let cell = self
            .tree
            .get(id)
            .ok_or(EngineError::TopologyViolation {
                cell: CellKey::ROOT,
                reason: TopologyReason::UnknownCell,
            })?;
        let key = cell.key;
        if !cell.is_leaf() {
            return Err(EngineError::TopologyViolation {
                cell: key,
                reason: TopologyReason::NotALeaf,
            });
        }
        if key.level >= self.tree.config().max_level {
            return Err(EngineError::TopologyViolation {
                cell: key,
                reason: TopologyReason::MaxLevelReached,
            });
        }

        let periodic = self.tree.config().periodic;
        let mut count = 0;
        for (di, dj) in crate::grid::quadtree::NEIGHBOR_OFFSETS {
            let Some(nkey) = key.offset(di, dj, periodic) else {
                continue;
            };
            if self.tree.find(nkey).is_none() {
                if let Some(coarse) = self.tree.covering(nkey) {
                    count += self.refine_balanced(coarse)?;
                }
            }
        }
        self.refine(id)?;
        Ok(count + 1)
    }

    /// Merge the four leaf children of a cell, restricting every field
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TopologyViolation`] if the merge is not allowed;
    /// the domain is unchanged in that case.
    pub fn coarsen(&mut self, id: CellId) -> Result<(), EngineError> {
        self.tree.check_coarsen(id)?;
        let Some(children) = self.tree.children(id) else {
            return Err(EngineError::TopologyViolation {
                cell: self.tree.key(id),
                reason: TopologyReason::NotRefined,
            });
        };
        let fractions = children.map(|c| self.data.get(self.cs, c));
        let values: Vec<f64> = self
            .fields
            .iter()
            .map(|(h, spec)| {
                let child_values = children.map(|c| self.data.get(h, c));
                spec.restriction.apply(&child_values, &fractions)
            })
            .collect();

        self.tree.merge(id)?;
        for (k, value) in values.into_iter().enumerate() {
            self.data.set(FieldHandle(k as u32), id, value);
        }
        for child in children {
            self.interfaces.remove(&child);
        }
        Ok(())
    }

    /// Refine every leaf matching a predicate until none is left below the maximum level
    ///
    /// # Returns
    ///
    /// Number of cells split
    ///
    /// # Errors
    ///
    /// Propagates topology errors from [`Domain::refine_balanced`].
    pub fn refine_where<P>(&mut self, predicate: P) -> Result<usize, EngineError>
    where
        P: Fn(&CellInfo) -> bool,
    {
        let max_level = self.tree.config().max_level;
        let mut total = 0;
        loop {
            let candidates: Vec<CellId> = self
                .tree
                .leaves()
                .filter(|&id| self.tree.level(id) < max_level && predicate(&self.cell_info(id)))
                .collect();
            let mut refined = 0;
            for id in candidates {
                if self.tree.get(id).is_some_and(|c| c.is_leaf()) {
                    refined += self.refine_balanced(id)?;
                }
            }
            if refined == 0 {
                break;
            }
            total += refined;
        }
        debug!("refine_where split {} cells", total);
        Ok(total)
    }

    /// Recompute the values of all refined cells of one field from their children
    pub fn restrict(&mut self, field: FieldHandle) {
        let restriction = self.fields.spec(field).restriction;
        for id in self.tree.refined_bottom_up() {
            if let Some(children) = self.tree.children(id) {
                let fractions = children.map(|c| self.data.get(self.cs, c));
                let values = children.map(|c| self.data.get(field, c));
                let value = restriction.apply(&values, &fractions);
                self.data.set(field, id, value);
            }
        }
    }

    /// Recompute the values of all refined cells of every field
    ///
    /// The volume fraction is restricted first at each parent so that
    /// volume-weighted rules see consistent fractions.
    pub fn restrict_all(&mut self) {
        let rules: Vec<Restriction> = self.fields.iter().map(|(_, s)| s.restriction).collect();
        for id in self.tree.refined_bottom_up() {
            let Some(children) = self.tree.children(id) else {
                continue;
            };
            let cs_rule = rules[self.cs.index()];
            let fractions = children.map(|c| self.data.get(self.cs, c));
            let parent_cs = cs_rule.apply(&fractions, &fractions);
            self.data.set(self.cs, id, parent_cs);
            for (k, rule) in rules.iter().enumerate() {
                if k == self.cs.index() {
                    continue;
                }
                let field = FieldHandle(k as u32);
                let values = children.map(|c| self.data.get(field, c));
                self.data.set(field, id, rule.apply(&values, &fractions));
            }
        }
    }

    /// Volume-weighted statistics of a field over the leaves
    ///
    /// Cells are weighted by `cs·h²`; fully solid cells are ignored.
    pub fn stats(&self, field: FieldHandle) -> FieldStats {
        let leaves: Vec<CellId> = self.tree.leaves().collect();
        leaves
            .par_iter()
            .map(|&id| {
                let h = self.tree.size_of(id);
                let dv = self.data.get(self.cs, id) * h * h;
                if dv > 0.0 {
                    FieldStats::single(self.data.get(field, id), dv)
                } else {
                    FieldStats::empty()
                }
            })
            .reduce(FieldStats::empty, FieldStats::merge)
    }

    /// Integral of a field over the fluid
    pub fn integral(&self, field: FieldHandle) -> f64 {
        self.stats(field).sum
    }

    /// Linearly interpolated value of a field at a point
    ///
    /// Returns `None` outside the domain.
    pub fn interpolate(&self, field: FieldHandle, p: Vec2) -> Option<f64> {
        let leaf = self.tree.locate(p)?;
        let stencil = self.stencil(field, leaf);
        let [gx, gy] = stencil.gradient();
        let c = self.tree.center(leaf);
        let h = self.tree.size_of(leaf);
        Some(stencil.center + gx * (p.x - c.x) / h + gy * (p.y - c.y) / h)
    }

    pub(crate) fn data_mut(&mut self) -> &mut FieldData {
        &mut self.data
    }

    pub(crate) fn face_data_mut(&mut self) -> &mut FaceData {
        &mut self.faces
    }

    pub(crate) fn set_interfaces(&mut self, interfaces: FxHashMap<CellId, Interface>) {
        self.interfaces = interfaces;
    }

    /// Split borrows for stages that write field values but never topology
    pub(crate) fn split_mut(&mut self) -> (&Quadtree, &FieldRegistry, &mut FieldData) {
        (&self.tree, &self.fields, &mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{BoundaryCondition, BoundarySpec};
    use approx::assert_relative_eq;

    fn unit_domain(level: u8) -> Domain {
        Domain::new(GridConfig {
            origin: [0.0, 0.0],
            size: 1.0,
            initial_level: level,
            min_level: 0,
            max_level: 6,
            periodic: [false, false],
        })
        .unwrap()
    }

    #[test]
    fn test_reserved_fields() {
        let domain = unit_domain(2);
        assert_eq!(domain.fields().handle(VOLUME_FRACTION).unwrap(), domain.cs());
        assert_eq!(domain.fields().face_handle(FACE_FRACTION).unwrap(), domain.fs());
        let leaf = domain.tree().leaves().next().unwrap();
        assert_eq!(domain.value(domain.cs(), leaf), 1.0);
    }

    #[test]
    fn test_refine_coarsen_round_trip_constant() {
        let mut domain = unit_domain(2);
        let c = domain
            .register(FieldSpec::scalar("C").with_prolongation(Prolongation::Constant))
            .unwrap();
        domain.fill(c, |p| 0.1 + p.x * p.x + 3.0 * p.y);
        let id = domain.tree().find(CellKey::new(2, 1, 2)).unwrap();
        let before = domain.value(c, id);

        let children = domain.refine(id).unwrap();
        assert!(children.iter().all(|&ch| domain.value(c, ch) == before));
        domain.coarsen(id).unwrap();
        assert_eq!(domain.value(c, id), before);
    }

    #[test]
    fn test_linear_prolongation_conserves_mean() {
        let mut domain = unit_domain(2);
        let c = domain.register(FieldSpec::scalar("C")).unwrap();
        domain.fill(c, |p| 2.0 * p.x - p.y);
        let id = domain.tree().find(CellKey::new(2, 1, 1)).unwrap();
        let before = domain.value(c, id);
        let children = domain.refine(id).unwrap();
        let values = children.map(|ch| domain.value(c, ch));
        assert_relative_eq!(crate::fields::average4(&values), before, epsilon = 1e-12);
        // Linear data is reproduced exactly by a centred gradient
        let center = domain.tree().center(children[3]);
        assert_relative_eq!(values[3], 2.0 * center.x - center.y, epsilon = 1e-12);
        domain.coarsen(id).unwrap();
        assert_relative_eq!(domain.value(c, id), before, epsilon = 1e-12);
    }

    #[test]
    fn test_refine_balanced_splits_neighbours() {
        let mut domain = unit_domain(2);
        let id = domain.tree().find(CellKey::new(2, 1, 1)).unwrap();
        let children = domain.refine(id).unwrap();
        let count = domain.refine_balanced(children[0]).unwrap();
        assert!(count > 1);
        assert!(domain.tree().find_imbalance().is_none());
        assert_eq!(domain.tree().depth(), 4);
    }

    #[test]
    fn test_rejected_refine_leaves_domain_unchanged() {
        let mut domain = unit_domain(2);
        let c = domain.register(FieldSpec::scalar("C").with_default(3.0)).unwrap();
        let id = domain.tree().find(CellKey::new(2, 1, 1)).unwrap();
        let children = domain.refine(id).unwrap();
        let leaves = domain.tree().leaf_count();
        let err = domain.refine(children[0]).unwrap_err();
        assert!(err.is_topology_violation());
        assert_eq!(domain.tree().leaf_count(), leaves);
        assert_eq!(domain.value(c, children[0]), 3.0);
    }

    #[test]
    fn test_refine_where_disk() {
        let mut domain = unit_domain(2);
        let center = Vec2::new(0.5, 0.5);
        let split = domain
            .refine_where(|cell| {
                (cell.center - center).norm() < 0.1 + cell.size && cell.level() < 5
            })
            .unwrap();
        assert!(split > 0);
        assert_eq!(domain.tree().depth(), 5);
        assert!(domain.tree().find_imbalance().is_none());
        let leaf = domain.tree().locate(center).unwrap();
        assert_eq!(domain.tree().level(leaf), 5);
    }

    #[test]
    fn test_stats_and_integral() {
        let mut domain = unit_domain(3);
        let c = domain.register(FieldSpec::scalar("C")).unwrap();
        domain.fill(c, |p| if p.x < 0.5 { 1.0 } else { 3.0 });
        let stats = domain.stats(c);
        assert_relative_eq!(stats.volume, 1.0, epsilon = 1e-12);
        assert_relative_eq!(stats.sum, 2.0, epsilon = 1e-12);
        assert_relative_eq!(stats.mean(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(stats.stddev(), 1.0, epsilon = 1e-12);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.cells, 64);
        assert_relative_eq!(domain.integral(c), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolate_linear_field() {
        let mut domain = unit_domain(3);
        let c = domain
            .register(FieldSpec::scalar("C").with_boundary(BoundarySpec {
                left: BoundaryCondition::Dirichlet(0.0),
                right: BoundaryCondition::Dirichlet(1.0),
                bottom: BoundaryCondition::Neumann(0.0),
                top: BoundaryCondition::Neumann(0.0),
            }))
            .unwrap();
        domain.fill(c, |p| p.x);
        let v = domain.interpolate(c, Vec2::new(0.4, 0.7)).unwrap();
        assert_relative_eq!(v, 0.4, epsilon = 1e-12);
        // Dirichlet ghost keeps the profile linear up to the edge
        let v = domain.interpolate(c, Vec2::new(0.99, 0.2)).unwrap();
        assert_relative_eq!(v, 0.99, epsilon = 1e-12);
        assert!(domain.interpolate(c, Vec2::new(2.0, 0.2)).is_none());
    }

    #[test]
    fn test_restrict_all_volume_weighted() {
        let mut domain = unit_domain(1);
        let c = domain
            .register(FieldSpec::scalar("C").with_restriction(Restriction::VolumeWeighted))
            .unwrap();
        let leaves: Vec<CellId> = domain.tree().leaves().collect();
        for (k, &leaf) in leaves.iter().enumerate() {
            domain.set_value(c, leaf, k as f64);
            domain.set_value(domain.cs(), leaf, if k < 2 { 1.0 } else { 0.0 });
        }
        domain.restrict_all();
        let root = domain.tree().root();
        assert_relative_eq!(domain.value(c, root), 0.5);
        assert_relative_eq!(domain.value(domain.cs(), root), 0.5);
    }
}
