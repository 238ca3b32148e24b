//! Implicit diffusion with geometric multigrid
//!
//! [`diffuse`] advances one registered diffusive field by a backward-Euler
//! step. The discrete operator weights volumes by `cs` and faces by `fs`, so
//! solid cells never exchange anything with the fluid.

pub mod multigrid;
pub mod operator;

pub use multigrid::{
    GaussSeidel, Jacobi, MultigridConfig, MultigridSolver, Smoother, SmootherKind, SolverStats,
};
pub use operator::{LeafSystem, LevelOperator};

use crate::domain::Domain;
use crate::error::EngineError;
use crate::fields::{DiffusionSpec, FieldHandle};

/// Advance a diffusive field by one implicit step
///
/// Uses the diffusivity and source declared with the field.
///
/// # Errors
///
/// Returns [`EngineError::Configuration`] if the field was registered
/// without a diffusion spec, if `dt` is not positive or if the multigrid
/// parameters are invalid. Non-convergence is not an error here; inspect
/// [`SolverStats::converged`] or call [`SolverStats::into_result`].
pub fn diffuse(
    domain: &mut Domain,
    field: FieldHandle,
    dt: f64,
    config: &MultigridConfig,
) -> Result<SolverStats, EngineError> {
    let diffusion = domain.fields().spec(field).diffusion.ok_or_else(|| {
        EngineError::config(format!(
            "field '{}' was not registered as diffusive",
            domain.fields().name(field)
        ))
    })?;
    diffuse_with(domain, field, dt, diffusion, config)
}

/// Advance a field by one implicit step with an explicit diffusion spec
///
/// # Errors
///
/// Same as [`diffuse`], minus the registration check.
pub fn diffuse_with(
    domain: &mut Domain,
    field: FieldHandle,
    dt: f64,
    diffusion: DiffusionSpec,
    config: &MultigridConfig,
) -> Result<SolverStats, EngineError> {
    MultigridSolver::new(*config)?.solve(domain, field, diffusion, dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Diffusivity, FieldSpec};
    use crate::grid::GridConfig;

    #[test]
    fn test_non_diffusive_field_is_rejected() {
        let mut domain = Domain::new(GridConfig::default()).unwrap();
        let t = domain.register(FieldSpec::scalar("T")).unwrap();
        let err = diffuse(&mut domain, t, 0.1, &MultigridConfig::default()).unwrap_err();
        assert!(err.to_string().contains("'T'"));
    }

    #[test]
    fn test_diffuse_with_face_diffusivity() {
        let mut domain = Domain::new(GridConfig::centered(1.0, 4, 1, 6)).unwrap();
        let t = domain.register(FieldSpec::scalar("T")).unwrap();
        let kappa = domain.register_face_field("kappa", 0.2).unwrap();
        domain.fill(t, |p| if p.x < 0.0 { 1.0 } else { 0.0 });
        let before = domain.integral(t);
        let stats = diffuse_with(
            &mut domain,
            t,
            0.05,
            DiffusionSpec {
                diffusivity: Diffusivity::Face(kappa),
                source: None,
            },
            &MultigridConfig::default(),
        )
        .unwrap();
        assert!(stats.converged);
        assert!((domain.integral(t) - before).abs() < 1e-5);
        let left = domain.interpolate(t, crate::core_types::Vec2::new(-0.45, 0.0)).unwrap();
        assert!(left > 0.9 && left <= 1.0 + 1e-9);
    }
}
