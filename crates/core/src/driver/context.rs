//! Views handed to user callbacks
//!
//! [`EventContext`] can read and write field values but has no access to the
//! topology. The reserved volume fraction is read-only there: only the
//! geometry engine writes it. [`Snapshot`] is read-only and used by output
//! callbacks.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::simulation::Diagnostics;
use crate::core_types::Vec2;
use crate::domain::{CellInfo, Domain, FieldStats, VOLUME_FRACTION};
use crate::error::EngineError;
use crate::fields::{FieldData, FieldHandle, FieldRegistry};
use crate::grid::{CellId, Quadtree};

/// Mutable access to field values during a callback
#[derive(Debug)]
pub struct EventContext<'a> {
    tree: &'a Quadtree,
    fields: &'a FieldRegistry,
    data: &'a mut FieldData,
    time: f64,
    dt: f64,
    iteration: usize,
    touched: Vec<FieldHandle>,
    stop_requested: bool,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(domain: &'a mut Domain, time: f64, dt: f64, iteration: usize) -> Self {
        let (tree, fields, data) = domain.split_mut();
        Self {
            tree,
            fields,
            data,
            time,
            dt,
            iteration,
            touched: Vec::new(),
            stop_requested: false,
        }
    }

    /// Simulation time of the callback
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Length of the current step (0 during initialisation)
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Number of completed steps
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The quadtree, read-only
    pub fn tree(&self) -> &Quadtree {
        self.tree
    }

    /// Look up a field by name
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if no field has that name.
    pub fn handle(&self, name: &str) -> Result<FieldHandle, EngineError> {
        self.fields.handle(name)
    }

    /// Value of a field in a cell
    pub fn value(&self, field: FieldHandle, cell: CellId) -> f64 {
        self.data.get(field, cell)
    }

    /// Set a leaf value; ancestors are restricted after the callback
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for the reserved volume fraction.
    pub fn set_value(
        &mut self,
        field: FieldHandle,
        cell: CellId,
        value: f64,
    ) -> Result<(), EngineError> {
        self.check_writable(field)?;
        self.data.set(field, cell, value);
        self.touch(field);
        Ok(())
    }

    /// Whether a cell has no fluid
    pub fn is_solid(&self, cell: CellId) -> bool {
        let cs = self.fields.handle(VOLUME_FRACTION);
        cs.is_ok_and(|cs| self.data.get(cs, cell) <= 0.0)
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

    /// Set a field on every leaf from a function of the cell
    ///
    /// Runs in parallel over the leaves.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for the reserved volume fraction.
    pub fn map_leaves<F>(&mut self, field: FieldHandle, f: F) -> Result<(), EngineError>
    where
        F: Fn(&CellInfo) -> f64 + Sync,
    {
        self.check_writable(field)?;
        let leaves: Vec<CellId> = self.tree.leaves().collect();
        let values: Vec<f64> = leaves
            .par_iter()
            .map(|&id| f(&self.cell_info(id)))
            .collect();
        for (id, value) in leaves.into_iter().zip(values) {
            self.data.set(field, id, value);
        }
        self.touch(field);
        Ok(())
    }

    /// Update a field on every leaf from its current value and the cell
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for the reserved volume fraction.
    pub fn update_leaves<F>(&mut self, field: FieldHandle, f: F) -> Result<(), EngineError>
    where
        F: Fn(&CellInfo, f64) -> f64 + Sync,
    {
        self.check_writable(field)?;
        let leaves: Vec<CellId> = self.tree.leaves().collect();
        let values: Vec<f64> = leaves
            .par_iter()
            .map(|&id| f(&self.cell_info(id), self.data.get(field, id)))
            .collect();
        for (id, value) in leaves.into_iter().zip(values) {
            self.data.set(field, id, value);
        }
        self.touch(field);
        Ok(())
    }

    /// Ask the driver to stop after the current step
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    fn check_writable(&self, field: FieldHandle) -> Result<(), EngineError> {
        if self.fields.name(field) == VOLUME_FRACTION {
            return Err(EngineError::config(format!(
                "'{VOLUME_FRACTION}' is written by the geometry engine only"
            )));
        }
        Ok(())
    }

    fn touch(&mut self, field: FieldHandle) {
        if !self.touched.contains(&field) {
            self.touched.push(field);
        }
    }

    pub(crate) fn finish(self) -> (Vec<FieldHandle>, bool) {
        (self.touched, self.stop_requested)
    }
}

/// Field values of one leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafSample {
    /// Centre point
    pub center: [f64; 2],
    /// Side length
    pub size: f64,
    /// Refinement level
    pub level: u8,
    /// Values in the order the fields were requested
    pub values: Vec<f64>,
}

/// Read-only view of the simulation for output callbacks
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    domain: &'a Domain,
    time: f64,
    iteration: usize,
    diagnostics: &'a Diagnostics,
}

impl<'a> Snapshot<'a> {
    pub(crate) fn new(
        domain: &'a Domain,
        time: f64,
        iteration: usize,
        diagnostics: &'a Diagnostics,
    ) -> Self {
        Self {
            domain,
            time,
            iteration,
            diagnostics,
        }
    }

    /// Simulation time
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of completed steps
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The whole domain
    pub fn domain(&self) -> &'a Domain {
        self.domain
    }

    /// Accumulated run diagnostics
    pub fn diagnostics(&self) -> &'a Diagnostics {
        self.diagnostics
    }

    /// Volume-weighted statistics of a named field
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for an unknown field name.
    pub fn stats(&self, name: &str) -> Result<FieldStats, EngineError> {
        Ok(self.domain.stats(self.domain.fields().handle(name)?))
    }

    /// Interpolated value of a named field at a point (`None` outside)
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for an unknown field name.
    pub fn value_at(&self, name: &str, p: Vec2) -> Result<Option<f64>, EngineError> {
        Ok(self.domain.interpolate(self.domain.fields().handle(name)?, p))
    }

    /// Per-leaf values of the named fields
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if any name is unknown.
    pub fn samples(&self, names: &[&str]) -> Result<Vec<LeafSample>, EngineError> {
        let handles = names
            .iter()
            .map(|name| self.domain.fields().handle(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self
            .domain
            .leaf_infos()
            .into_iter()
            .map(|info| LeafSample {
                center: [info.center.x, info.center.y],
                size: info.size,
                level: info.level(),
                values: handles.iter().map(|&h| self.domain.value(h, info.id)).collect(),
            })
            .collect())
    }
}
