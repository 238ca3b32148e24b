//! Wavelet-based refinement estimator
//!
//! For every parent of leaves the children values are compared with a
//! linear prediction from the (restricted) parent and its neighbours. The
//! prediction error is the wavelet coefficient of the child:
//! - a leaf is refined when any field's error exceeds its tolerance
//! - a parent of four leaves is coarsened when, for every field, the summed
//!   error of its children is below `coarsen_ratio` times the tolerance and
//!   its own error, as a child of its parent, is within `coarsen_ratio` of
//!   the tolerance (so the merged leaf is not refined again)
//!
//! Error estimation runs in parallel over parents; the resulting mesh edits
//! are then applied sequentially, refinements first, in traversal order.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::Domain;
use crate::error::EngineError;
use crate::fields::{linear_children, FieldHandle};
use crate::grid::CellId;

/// Adaptation criterion given by field name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptCriterion {
    /// Registered field name
    pub field: String,
    /// Absolute wavelet tolerance
    pub tolerance: f64,
}

/// Configuration for wavelet adaptation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptConfig {
    /// Extra criteria on top of field registrations (overrides their tolerance)
    pub criteria: Vec<AdaptCriterion>,
    /// Coarsest level leaves may reach (defaults to the grid's)
    pub min_level: Option<u8>,
    /// Finest level leaves may reach (defaults to the grid's)
    pub max_level: Option<u8>,
    /// Coarsening threshold as a fraction of the tolerance
    pub coarsen_ratio: f64,
    /// Cap on adapt/re-initialise passes before the first step
    pub init_passes: usize,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            min_level: None,
            max_level: None,
            coarsen_ratio: 0.5,
            init_passes: 10,
        }
    }
}

/// Outcome of one adaptation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptReport {
    /// Cells split (including splits needed for balance)
    pub refined: usize,
    /// Cells merged
    pub coarsened: usize,
    /// Requests skipped because they would break the tree invariants
    pub rejected: usize,
    /// Leaves after the pass
    pub leaves: usize,
}

impl AdaptReport {
    /// Number of topology changes
    pub fn changed(&self) -> usize {
        self.refined + self.coarsened
    }
}

/// Wavelet error estimates of the children of one parent
#[derive(Debug, Clone, Copy)]
struct ParentEstimate {
    parent: CellId,
    children: [CellId; 4],
    /// Largest error/tolerance over all fields, per child
    errors: [f64; 4],
    /// Every field's summed child error is below the coarsening threshold
    smooth: bool,
}

/// Wavelet refinement estimator
#[derive(Debug, Clone)]
pub struct WaveletEstimator {
    criteria: Vec<(FieldHandle, f64)>,
    min_level: u8,
    max_level: u8,
    coarsen_ratio: f64,
}

impl WaveletEstimator {
    /// Build the estimator from field registrations and a config
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if a criterion names an unknown
    /// field, a tolerance is not positive, or the level range is invalid.
    pub fn new(domain: &Domain, config: &AdaptConfig) -> Result<Self, EngineError> {
        let grid = domain.tree().config();
        let mut criteria: Vec<(FieldHandle, f64)> = domain
            .fields()
            .iter()
            .filter_map(|(h, spec)| spec.adapt_tolerance.map(|tol| (h, tol)))
            .collect();

        for criterion in &config.criteria {
            let handle = domain.fields().handle(&criterion.field)?;
            if !(criterion.tolerance.is_finite() && criterion.tolerance > 0.0) {
                return Err(EngineError::config(format!(
                    "adaptation tolerance of '{}' must be positive, got {}",
                    criterion.field, criterion.tolerance
                )));
            }
            match criteria.iter_mut().find(|(h, _)| *h == handle) {
                Some(entry) => entry.1 = criterion.tolerance,
                None => criteria.push((handle, criterion.tolerance)),
            }
        }

        let min_level = config.min_level.unwrap_or(grid.min_level);
        let max_level = config.max_level.unwrap_or(grid.max_level);
        if max_level > grid.max_level || min_level > max_level {
            return Err(EngineError::config(format!(
                "adaptation levels {min_level}..{max_level} must lie within 0..{}",
                grid.max_level
            )));
        }
        if !(config.coarsen_ratio > 0.0 && config.coarsen_ratio <= 1.0) {
            return Err(EngineError::config(format!(
                "coarsen_ratio must be in (0, 1], got {}",
                config.coarsen_ratio
            )));
        }

        Ok(Self {
            criteria,
            min_level,
            max_level,
            coarsen_ratio: config.coarsen_ratio,
        })
    }

    /// Fields and tolerances driving adaptation
    pub fn criteria(&self) -> &[(FieldHandle, f64)] {
        &self.criteria
    }

    /// Level range
    pub fn levels(&self) -> (u8, u8) {
        (self.min_level, self.max_level)
    }

    /// Largest normalised wavelet error of every leaf
    ///
    /// Values above 1 mark leaves that need refinement. Ancestor values must
    /// be up to date (see [`Domain::restrict_all`]).
    pub fn indicators(&self, domain: &Domain) -> Vec<(CellId, f64)> {
        self.estimates(domain)
            .into_iter()
            .flat_map(|est| {
                est.children
                    .into_iter()
                    .zip(est.errors)
                    .filter(|(child, _)| domain.tree().is_leaf(*child))
            })
            .collect()
    }

    /// Estimates for every refined cell, leaf parents or not
    fn estimates(&self, domain: &Domain) -> Vec<ParentEstimate> {
        let parents = domain.tree().refined_bottom_up();
        parents
            .par_iter()
            .filter_map(|&p| self.estimate(domain, p))
            .collect()
    }

    fn estimate(&self, domain: &Domain, parent: CellId) -> Option<ParentEstimate> {
        let children = domain.tree().children(parent)?;
        let mut errors = [0.0; 4];
        let mut smooth = true;
        for &(field, tolerance) in &self.criteria {
            let stencil = domain.stencil(field, parent);
            let [gx, gy] = stencil.gradient();
            let predicted = linear_children(stencil.center, gx, gy);
            let mut total = 0.0;
            for q in 0..4 {
                let error = (domain.value(field, children[q]) - predicted[q]).abs();
                total += error;
                errors[q] = f64::max(errors[q], error / tolerance);
            }
            if total >= self.coarsen_ratio * tolerance {
                smooth = false;
            }
        }
        Some(ParentEstimate {
            parent,
            children,
            errors,
            smooth,
        })
    }

    /// Run one adaptation pass
    ///
    /// Topology requests that would break 2:1 balance are skipped and
    /// counted in [`AdaptReport::rejected`]. Callers wanting a converged mesh
    /// repeat the pass until [`AdaptReport::changed`] is zero.
    ///
    /// # Errors
    ///
    /// Only non-topology errors are returned; none occur for a consistent domain.
    pub fn adapt(&self, domain: &mut Domain) -> Result<AdaptReport, EngineError> {
        domain.restrict_all();
        let estimates = self.estimates(domain);
        // Error of each cell as a child of its parent
        let own_error: FxHashMap<CellId, f64> = estimates
            .iter()
            .flat_map(|est| est.children.into_iter().zip(est.errors))
            .collect();

        let tree = domain.tree();
        let mut to_refine = Vec::new();
        let mut to_coarsen = Vec::new();
        for est in &estimates {
            let mut any_refine = false;
            for (&child, &error) in est.children.iter().zip(&est.errors) {
                if !tree.is_leaf(child) {
                    continue;
                }
                let level = tree.level(child);
                if level < self.min_level || (error > 1.0 && level < self.max_level) {
                    to_refine.push(child);
                    any_refine = true;
                }
            }
            if est.children.iter().all(|&c| tree.is_leaf(c)) {
                let child_level = tree.level(est.parent) + 1;
                let too_fine = child_level > self.max_level;
                let settled = own_error
                    .get(&est.parent)
                    .is_none_or(|&e| e <= self.coarsen_ratio);
                let may_coarsen =
                    est.smooth && settled && child_level > self.min_level && !any_refine;
                if too_fine || may_coarsen {
                    to_coarsen.push(est.parent);
                }
            }
        }
        if tree.leaf_count() == 1 && self.min_level > 0 {
            to_refine.push(tree.root());
        }

        let mut report = AdaptReport::default();
        for id in to_refine {
            let still_leaf = domain.tree().get(id).is_some_and(|c| c.is_leaf());
            if !still_leaf || domain.tree().level(id) >= self.max_level {
                continue;
            }
            match domain.refine_balanced(id) {
                Ok(n) => report.refined += n,
                Err(e) if e.is_topology_violation() => {
                    debug!("Refinement skipped: {}", e);
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        for id in to_coarsen {
            match domain.coarsen(id) {
                Ok(()) => report.coarsened += 1,
                Err(e) if e.is_topology_violation() => {
                    debug!("Coarsening skipped: {}", e);
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        report.leaves = domain.tree().leaf_count();
        if report.changed() > 0 {
            info!(
                "Adapted mesh: {} refined, {} coarsened, {} leaves (depth {})",
                report.refined,
                report.coarsened,
                report.leaves,
                domain.tree().depth()
            );
        }
        Ok(report)
    }
}
