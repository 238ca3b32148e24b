//! Geometric multigrid over the quadtree's level grids
//!
//! Each V-cycle restricts the leaf residual up the tree by summation, starts
//! from a zero correction on the coarsest level grid and walks back down:
//! on every level the correction is interpolated linearly from the parent
//! into newly active cells and relaxed against the level operator. The
//! finest pass uses the exact leaf operator. A cycle that increases the residual is rolled
//! back and replaced by plain smoothing; if that fails as well the solve
//! stops and reports non-convergence instead of accepting the worse state.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::operator::{build_coarse_operator, build_leaf_system, LeafSystem, LevelOperator};
use crate::domain::Domain;
use crate::error::EngineError;
use crate::fields::{linear_children, BoundaryCondition, BoundarySpec, DiffusionSpec, FieldHandle};
use crate::grid::{CellId, Neighbor, Side, LEAF_GRID};

/// Relaxation scheme applied on each level
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum SmootherKind {
    /// Weighted Jacobi, parallel over rows
    Jacobi {
        /// Damping factor in (0, 1]
        omega: f64,
    },
    /// Sequential Gauss–Seidel in depth-first order
    #[default]
    GaussSeidel,
}

impl SmootherKind {
    /// Smoother implementing this scheme
    pub fn build(self) -> Box<dyn Smoother> {
        match self {
            Self::Jacobi { omega } => Box::new(Jacobi { omega }),
            Self::GaussSeidel => Box::new(GaussSeidel),
        }
    }
}

/// One relaxation sweep of `A x = b` on a level operator
pub trait Smoother: Send + Sync {
    /// Improve `x` in place
    fn sweep(&self, operator: &LevelOperator, rhs: &[f64], x: &mut [f64]);

    /// Scheme name for logs
    fn name(&self) -> &'static str;
}

/// Weighted Jacobi relaxation
#[derive(Debug, Clone, Copy)]
pub struct Jacobi {
    /// Damping factor
    pub omega: f64,
}

impl Smoother for Jacobi {
    fn sweep(&self, operator: &LevelOperator, rhs: &[f64], x: &mut [f64]) {
        let current: &[f64] = x;
        let updated: Vec<f64> = (0..operator.len())
            .into_par_iter()
            .map(|i| {
                let d = operator.diag(i);
                if d <= 0.0 {
                    return current[i];
                }
                let coupled: f64 = operator.links(i).iter().map(|&(j, w)| w * current[j]).sum();
                let target = (rhs[i] + coupled) / d;
                current[i] + self.omega * (target - current[i])
            })
            .collect();
        x.copy_from_slice(&updated);
    }

    fn name(&self) -> &'static str {
        "jacobi"
    }
}

/// Gauss–Seidel relaxation
#[derive(Debug, Clone, Copy)]
pub struct GaussSeidel;

impl Smoother for GaussSeidel {
    fn sweep(&self, operator: &LevelOperator, rhs: &[f64], x: &mut [f64]) {
        for i in 0..operator.len() {
            let d = operator.diag(i);
            if d <= 0.0 {
                continue;
            }
            let coupled: f64 = operator.links(i).iter().map(|&(j, w)| w * x[j]).sum();
            x[i] = (rhs[i] + coupled) / d;
        }
    }

    fn name(&self) -> &'static str {
        "gauss-seidel"
    }
}

/// Multigrid parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultigridConfig {
    /// Relaxation scheme
    pub smoother: SmootherKind,
    /// Sweeps per level on the way down
    pub sweeps: usize,
    /// Sweeps on the coarsest level grid
    pub coarse_sweeps: usize,
    /// Coarsest level grid visited by the cycle
    pub coarsest_level: u8,
    /// Residual norm below which the solve has converged
    pub tolerance: f64,
    /// Maximum number of V-cycles
    pub max_cycles: usize,
    /// Leaf sweeps tried when a cycle is rolled back
    pub fallback_sweeps: usize,
}

impl Default for MultigridConfig {
    fn default() -> Self {
        Self {
            smoother: SmootherKind::GaussSeidel,
            sweeps: 4,
            coarse_sweeps: 20,
            coarsest_level: 0,
            tolerance: 1e-6,
            max_cycles: 100,
            fallback_sweeps: 8,
        }
    }
}

impl MultigridConfig {
    /// Check parameter ranges
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for a non-positive tolerance, a
    /// zero cycle or sweep count, or a Jacobi weight outside (0, 1].
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(EngineError::config(format!(
                "multigrid tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_cycles == 0 || self.sweeps == 0 || self.coarse_sweeps == 0 {
            return Err(EngineError::config(
                "multigrid cycle and sweep counts must be at least 1",
            ));
        }
        if let SmootherKind::Jacobi { omega } = self.smoother {
            if !(omega > 0.0 && omega <= 1.0) {
                return Err(EngineError::config(format!(
                    "Jacobi weight must lie in (0, 1], got {omega}"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one implicit solve
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverStats {
    /// Field that was solved for
    pub field: String,
    /// Cycles performed
    pub iterations: usize,
    /// Residual norm before the first cycle
    pub initial_residual: f64,
    /// Residual norm after the last cycle
    pub residual: f64,
    /// Whether the residual fell below the tolerance
    pub converged: bool,
    /// Residual norm after every cycle, starting with the initial one
    pub history: Vec<f64>,
    /// Cycles replaced by plain smoothing after a residual increase
    pub rollbacks: usize,
    /// Net rate at which the embedded surface feeds the fluid
    pub embedded_flux: f64,
}

impl SolverStats {
    /// Turn a non-converged solve into an error
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConvergenceFailure`] carrying the cycle count and
    /// final residual when the solve did not converge.
    pub fn into_result(self) -> Result<Self, EngineError> {
        if self.converged {
            Ok(self)
        } else {
            Err(EngineError::ConvergenceFailure {
                field: self.field,
                iterations: self.iterations,
                residual: self.residual,
            })
        }
    }
}

/// V-cycle solver for one implicit diffusion step
pub struct MultigridSolver {
    config: MultigridConfig,
    smoother: Box<dyn Smoother>,
}

impl std::fmt::Debug for MultigridSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultigridSolver")
            .field("config", &self.config)
            .field("smoother", &self.smoother.name())
            .finish()
    }
}

impl MultigridSolver {
    /// Solver with validated parameters
    ///
    /// # Errors
    ///
    /// Propagates [`MultigridConfig::validate`] failures.
    pub fn new(config: MultigridConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            smoother: config.smoother.build(),
        })
    }

    /// Solver with a custom smoother
    pub fn with_smoother(
        config: MultigridConfig,
        smoother: Box<dyn Smoother>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { config, smoother })
    }

    /// Parameters
    pub fn config(&self) -> &MultigridConfig {
        &self.config
    }

    /// Advance `field` by one backward-Euler step of length `dt`
    ///
    /// The new leaf values are written back and restricted to the ancestors
    /// even when the solve did not converge; the returned statistics say so.
    ///
    /// # Arguments
    ///
    /// * `domain` - Mesh, fractions and field values
    /// * `field` - Field to advance
    /// * `diffusion` - Diffusivity and source
    /// * `dt` - Time step, must be positive
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for a non-positive or non-finite
    /// step.
    pub fn solve(
        &self,
        domain: &mut Domain,
        field: FieldHandle,
        diffusion: DiffusionSpec,
        dt: f64,
    ) -> Result<SolverStats, EngineError> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(EngineError::config(format!(
                "diffusion time step must be positive, got {dt}"
            )));
        }
        let name = domain.fields().name(field).to_string();
        let boundary = domain.fields().spec(field).boundary;

        let (system, coefficients) = build_leaf_system(domain, field, diffusion, dt);
        let depth = domain.tree().depth();
        let coarsest = self.config.coarsest_level.min(depth);
        let coarse: Vec<LevelOperator> = (coarsest..depth)
            .map(|level| build_coarse_operator(domain, field, &coefficients, dt, level))
            .collect();
        let area: Vec<f64> = system
            .operator
            .cells()
            .iter()
            .map(|&c| domain.tree().size_of(c).powi(2))
            .collect();

        let mut u = system.initial.clone();
        let mut residual = system.operator.residual(&system.rhs, &u);
        let mut norm = residual_norm(&system.operator, &residual, &area);
        let mut stats = SolverStats {
            field: name,
            initial_residual: norm,
            residual: norm,
            history: vec![norm],
            ..SolverStats::default()
        };

        while norm >= self.config.tolerance && stats.iterations < self.config.max_cycles {
            let saved = u.clone();
            self.v_cycle(domain, &boundary, &system, &coarse, &residual, &mut u);
            let mut candidate = system.operator.residual(&system.rhs, &u);
            let mut candidate_norm = residual_norm(&system.operator, &candidate, &area);

            if candidate_norm >= norm || candidate_norm.is_nan() {
                debug!(
                    "V-cycle raised residual of '{}' from {:.3e} to {:.3e}; smoothing instead",
                    stats.field, norm, candidate_norm
                );
                stats.rollbacks += 1;
                u.copy_from_slice(&saved);
                for _ in 0..self.config.fallback_sweeps {
                    self.smoother.sweep(&system.operator, &system.rhs, &mut u);
                }
                candidate = system.operator.residual(&system.rhs, &u);
                candidate_norm = residual_norm(&system.operator, &candidate, &area);
                if candidate_norm >= norm || candidate_norm.is_nan() {
                    u.copy_from_slice(&saved);
                    stats.iterations += 1;
                    stats.history.push(norm);
                    warn!(
                        "Multigrid stalled on '{}' at residual {:.3e} after {} cycles",
                        stats.field, norm, stats.iterations
                    );
                    break;
                }
            }

            residual = candidate;
            norm = candidate_norm;
            stats.iterations += 1;
            stats.history.push(norm);
            trace!("Cycle {} of '{}': residual {:.3e}", stats.iterations, stats.field, norm);
        }

        stats.residual = norm;
        stats.converged = norm < self.config.tolerance;
        stats.embedded_flux = embedded_flux(&system, &u);

        for (&id, &value) in system.operator.cells().iter().zip(&u) {
            domain.set_value(field, id, value);
        }
        domain.restrict(field);

        if stats.converged {
            debug!(
                "Solved '{}' in {} cycles: residual {:.3e} -> {:.3e}",
                stats.field, stats.iterations, stats.initial_residual, stats.residual
            );
        } else {
            warn!(
                "'{}' did not converge in {} cycles: residual {:.3e} (tolerance {:.1e})",
                stats.field, stats.iterations, stats.residual, self.config.tolerance
            );
        }
        Ok(stats)
    }

    fn v_cycle(
        &self,
        domain: &Domain,
        boundary: &BoundarySpec,
        system: &LeafSystem,
        coarse: &[LevelOperator],
        residual: &[f64],
        u: &mut [f64],
    ) {
        let tree = domain.tree();
        let leaf = &system.operator;

        let mut restricted = vec![0.0; tree.capacity()];
        for (&id, &r) in leaf.cells().iter().zip(residual) {
            restricted[id.index()] = r;
        }
        for parent in tree.refined_bottom_up() {
            if let Some(children) = tree.children(parent) {
                restricted[parent.index()] = children.iter().map(|c| restricted[c.index()]).sum();
            }
        }

        // Cells first seen on a pass interpolate their parent's correction
        let mut correction = vec![0.0; tree.capacity()];
        let finest = tree.depth();
        for (pass, operator) in coarse.iter().chain(std::iter::once(leaf)).enumerate() {
            let grid_level = if operator.level() == LEAF_GRID {
                finest
            } else {
                operator.level()
            };
            let sweeps = if pass == 0 {
                self.config.coarse_sweeps
            } else {
                self.config.sweeps
            };
            let mut x: Vec<f64> = operator
                .cells()
                .iter()
                .map(|&id| match tree.parent(id) {
                    Some(p) if pass > 0 && tree.level(id) == grid_level => {
                        prolong_correction(domain, boundary, &correction, p, id)
                    }
                    _ => correction[id.index()],
                })
                .collect();
            let rhs: Vec<f64> = operator
                .cells()
                .iter()
                .map(|&id| restricted[id.index()])
                .collect();
            for _ in 0..sweeps {
                self.smoother.sweep(operator, &rhs, &mut x);
            }
            for (&id, &e) in operator.cells().iter().zip(&x) {
                correction[id.index()] = e;
            }
        }

        for (value, &id) in u.iter_mut().zip(leaf.cells()) {
            *value += correction[id.index()];
        }
    }
}

/// Linear interpolation of a parent's correction into one child
///
/// Gradients come from the parent's neighbours on its own level grid.
/// Solid neighbours mirror the parent; domain edges use homogeneous ghosts.
fn prolong_correction(
    domain: &Domain,
    boundary: &BoundarySpec,
    correction: &[f64],
    parent: CellId,
    child: CellId,
) -> f64 {
    let tree = domain.tree();
    let center = correction[parent.index()];
    let level = tree.level(parent);
    let value_on = |side: Side| match tree.neighbor(parent, side, level) {
        Neighbor::Same(n) | Neighbor::Coarser(n) => {
            if domain.value(domain.cs(), n) > 0.0 {
                correction[n.index()]
            } else {
                center
            }
        }
        Neighbor::Finer([a, b]) => 0.5 * (correction[a.index()] + correction[b.index()]),
        Neighbor::Boundary(s) => match boundary.get(s) {
            BoundaryCondition::Dirichlet(_) => -center,
            BoundaryCondition::Neumann(_) | BoundaryCondition::Periodic => center,
        },
    };
    let gx = 0.5 * (value_on(Side::Right) - value_on(Side::Left));
    let gy = 0.5 * (value_on(Side::Top) - value_on(Side::Bottom));
    linear_children(center, gx, gy)[tree.key(child).quadrant()]
}

/// Volume-weighted RMS of the residual density over fluid rows
fn residual_norm(operator: &LevelOperator, residual: &[f64], area: &[f64]) -> f64 {
    let (sum, weight) = (0..operator.len())
        .into_par_iter()
        .filter(|&i| operator.is_active(i))
        .map(|i| {
            let density = residual[i] / area[i];
            (density * density * area[i], area[i])
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));
    if weight > 0.0 {
        (sum / weight).sqrt()
    } else {
        0.0
    }
}

/// Net flux entering the fluid through embedded surfaces for values `u`
fn embedded_flux(system: &LeafSystem, u: &[f64]) -> f64 {
    (0..u.len())
        .map(|i| {
            system.embedded_coefficient[i] * (system.embedded_value[i] - u[i])
                + system.embedded_flux[i]
        })
        .sum()
}
