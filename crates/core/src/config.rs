//! Aggregated engine configuration loadable from JSON

use serde::{Deserialize, Serialize};

use crate::adapt::AdaptConfig;
use crate::diffusion::MultigridConfig;
use crate::driver::DriverConfig;
use crate::error::EngineError;
use crate::grid::GridConfig;

/// Every tunable setting of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Domain and level range
    pub grid: GridConfig,
    /// Adaptation criteria
    pub adapt: AdaptConfig,
    /// Multigrid parameters
    pub multigrid: MultigridConfig,
    /// Driver timing
    pub driver: DriverConfig,
}

impl EngineConfig {
    /// Parse from JSON; missing sections take their defaults
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for malformed JSON or values
    /// that fail validation.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if serialization fails.
    pub fn to_json_string(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::config(format!("cannot serialize engine config: {e}")))
    }

    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first [`EngineError::Configuration`] found.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.grid.validate()?;
        self.multigrid.validate()?;
        self.driver.validate()?;
        if let Some(max) = self.adapt.max_level {
            if max > self.grid.max_level {
                return Err(EngineError::config(format!(
                    "adaptation max level {max} exceeds grid max level {}",
                    self.grid.max_level
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::SmootherKind;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "grid": { "size": 5.0, "initial_level": 6, "max_level": 8 },
                "multigrid": { "smoother": { "Jacobi": { "omega": 0.7 } } },
                "driver": { "end_time": 2.0 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.grid.size, 5.0);
        assert_eq!(config.grid.min_level, GridConfig::default().min_level);
        assert_eq!(config.multigrid.smoother, SmootherKind::Jacobi { omega: 0.7 });
        assert_eq!(config.driver.end_time, Some(2.0));
        assert_eq!(config.adapt, AdaptConfig::default());
    }

    #[test]
    fn test_round_trip_and_validation() {
        let config = EngineConfig::default();
        let json = config.to_json_string().unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
        assert!(EngineConfig::from_json_str(r#"{"driver": {"max_dt": -1.0}}"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }
}
