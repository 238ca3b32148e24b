//! Step-size bounds consulted before every step

use crate::domain::Domain;
use crate::fields::Diffusivity;

/// Upper bound on the next time step
///
/// The driver takes the smallest bound over all policies and then shortens
/// the step further so scheduled times are hit exactly.
pub trait StepPolicy {
    /// Largest allowed step for the current state, `None` for no bound
    fn max_step(&self, domain: &Domain) -> Option<f64>;
}

impl<F> StepPolicy for F
where
    F: Fn(&Domain) -> Option<f64>,
{
    fn max_step(&self, domain: &Domain) -> Option<f64> {
        self(domain)
    }
}

/// Fixed step length
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedStep(pub f64);

impl StepPolicy for FixedStep {
    fn max_step(&self, _domain: &Domain) -> Option<f64> {
        Some(self.0)
    }
}

/// Explicit-diffusion stability bound `factor · h_min² / κ_max`
///
/// The implicit solver is stable for any step; this bound keeps the step in
/// the range where one backward-Euler step stays accurate. The default factor
/// of 1/4 gives `Δx² / (4 κ)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionStability {
    /// Multiplier on `h_min² / κ_max`
    pub factor: f64,
}

impl Default for DiffusionStability {
    fn default() -> Self {
        Self { factor: 0.25 }
    }
}

impl DiffusionStability {
    /// Largest diffusivity over all diffusive fields
    pub fn max_diffusivity(domain: &Domain) -> f64 {
        let tree = domain.tree();
        domain
            .fields()
            .diffusive()
            .into_iter()
            .map(|(_, spec)| match spec.diffusivity {
                Diffusivity::Constant(d) => d,
                Diffusivity::Cell(h) => tree
                    .leaves()
                    .map(|id| domain.value(h, id))
                    .fold(0.0, f64::max),
                Diffusivity::Face(h) => tree
                    .faces()
                    .map(|face| domain.face_value(h, face.key))
                    .fold(0.0, f64::max),
            })
            .fold(0.0, f64::max)
    }
}

impl StepPolicy for DiffusionStability {
    fn max_step(&self, domain: &Domain) -> Option<f64> {
        let kappa = Self::max_diffusivity(domain);
        if kappa <= 0.0 {
            return None;
        }
        let depth = domain.tree().depth();
        let h = domain.tree().cell_size(depth);
        Some(self.factor * h * h / kappa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldSpec;
    use crate::grid::GridConfig;
    use approx::assert_relative_eq;

    #[test]
    fn test_diffusion_stability_bound() {
        let mut domain = Domain::new(GridConfig::centered(5.0, 6, 2, 8)).unwrap();
        assert_eq!(DiffusionStability::default().max_step(&domain), None);
        domain
            .register(FieldSpec::scalar("C").diffusive(Diffusivity::Constant(0.1)))
            .unwrap();
        let h = 5.0 / 64.0;
        let dt = DiffusionStability::default().max_step(&domain).unwrap();
        assert_relative_eq!(dt, h * h / 0.4);
    }

    #[test]
    fn test_closure_and_fixed_policies() {
        let domain = Domain::new(GridConfig::default()).unwrap();
        let policy = |_: &Domain| Some(0.3);
        assert_eq!(policy.max_step(&domain), Some(0.3));
        assert_eq!(FixedStep(0.1).max_step(&domain), Some(0.1));
    }
}
