//! Checkpoints: mesh topology plus every leaf value
//!
//! A checkpoint stores the key of every leaf and the values of all cell
//! fields on it. Restoring rebuilds exactly that set of leaves on a domain
//! with the same grid and field declarations, writes the values bit for bit
//! and restricts them to the ancestors. Face fields and interfaces are not
//! stored; an embedded geometry recomputes them after the mesh changes.

use std::fs;
use std::path::Path;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::Domain;
use crate::error::EngineError;
use crate::fields::FieldHandle;
use crate::grid::{CellKey, GridConfig};

/// Values of one leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafRecord {
    /// Position in the tree
    pub key: CellKey,
    /// One value per field, in [`Checkpoint::fields`] order
    pub values: Vec<f64>,
}

/// Saved simulation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Grid the state was taken on
    pub grid: GridConfig,
    /// Cell field names in registration order
    pub fields: Vec<String>,
    /// Simulation time
    pub time: f64,
    /// Completed steps
    pub iteration: usize,
    /// Every leaf in traversal order
    pub leaves: Vec<LeafRecord>,
}

impl Checkpoint {
    /// Record the current state of a domain
    pub fn capture(domain: &Domain, time: f64, iteration: usize) -> Self {
        let handles: Vec<FieldHandle> = domain.fields().iter().map(|(h, _)| h).collect();
        let fields = domain
            .fields()
            .iter()
            .map(|(_, spec)| spec.name.clone())
            .collect();
        let tree = domain.tree();
        let leaves = tree
            .leaves()
            .map(|id| LeafRecord {
                key: tree.key(id),
                values: handles.iter().map(|&h| domain.value(h, id)).collect(),
            })
            .collect();
        Self {
            grid: tree.config().clone(),
            fields,
            time,
            iteration,
            leaves,
        }
    }

    /// Rebuild the stored mesh on `domain` and write the stored values
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Mismatch`] if the grid or the field list
    /// differs, or if a leaf record has the wrong number of values, and
    /// [`CheckpointError::Engine`] if the stored leaves cannot be rebuilt.
    pub fn restore(&self, domain: &mut Domain) -> Result<(), CheckpointError> {
        if domain.tree().config() != &self.grid {
            return Err(CheckpointError::Mismatch(
                "grid configuration differs from the checkpoint".into(),
            ));
        }
        let names: Vec<&str> = domain.fields().iter().map(|(_, s)| s.name.as_str()).collect();
        if names != self.fields.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(CheckpointError::Mismatch(format!(
                "fields {:?} differ from checkpoint fields {:?}",
                names, self.fields
            )));
        }
        if let Some(bad) = self.leaves.iter().find(|l| l.values.len() != self.fields.len()) {
            return Err(CheckpointError::Mismatch(format!(
                "leaf {} has {} values for {} fields",
                bad.key,
                bad.values.len(),
                self.fields.len()
            )));
        }

        // Refine down to every stored leaf, coarsest first
        let mut keys: Vec<CellKey> = self.leaves.iter().map(|l| l.key).collect();
        keys.sort_by_key(|k| k.level);
        for &key in &keys {
            loop {
                let covering = domain.tree().covering(key).ok_or_else(|| {
                    CheckpointError::Mismatch(format!("leaf {key} lies outside the grid"))
                })?;
                if domain.tree().level(covering) >= key.level {
                    break;
                }
                domain.refine_balanced(covering)?;
            }
        }

        // Merge everything below a stored leaf, deepest first
        let stored: FxHashSet<CellKey> = keys.iter().copied().collect();
        for id in domain.tree().refined_bottom_up() {
            let tree = domain.tree();
            let refined = tree.get(id).is_some_and(|c| !c.is_leaf());
            let key = tree.key(id);
            let under_leaf = (0..=key.level).any(|l| stored.contains(&key.ancestor(l)));
            if refined && under_leaf {
                domain.coarsen(id)?;
            }
        }

        let handles: Vec<FieldHandle> = domain.fields().iter().map(|(h, _)| h).collect();
        for record in &self.leaves {
            let id = domain
                .tree()
                .find(record.key)
                .filter(|&id| domain.tree().is_leaf(id))
                .ok_or_else(|| {
                    CheckpointError::Mismatch(format!("leaf {} could not be rebuilt", record.key))
                })?;
            for (&h, &value) in handles.iter().zip(&record.values) {
                domain.set_value(h, id, value);
            }
        }
        domain.restrict_all();

        if domain.tree().leaf_count() != self.leaves.len() {
            return Err(CheckpointError::Mismatch(format!(
                "rebuilt {} leaves, checkpoint has {}",
                domain.tree().leaf_count(),
                self.leaves.len()
            )));
        }
        info!(
            "Restored checkpoint at t = {}: {} leaves, {} fields",
            self.time,
            self.leaves.len(),
            self.fields.len()
        );
        Ok(())
    }

    /// Serialize to JSON
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::SerializeFailed`] if serialization fails.
    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string(self).map_err(|e| CheckpointError::SerializeFailed(e.to_string()))
    }

    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::ParseFailed`] for malformed input.
    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        serde_json::from_str(json).map_err(|e| CheckpointError::ParseFailed(e.to_string()))
    }

    /// Load a checkpoint file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let contents =
            fs::read_to_string(path).map_err(|e| CheckpointError::LoadFailed(e.to_string()))?;
        Self::from_json(&contents)
    }

    /// Save to a checkpoint file
    ///
    /// # Errors
    /// Returns error if the state cannot be serialized or the file cannot be written
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let contents = self.to_json()?;
        fs::write(path, contents).map_err(|e| CheckpointError::SaveFailed(e.to_string()))
    }
}

/// Errors that can occur while saving or restoring a checkpoint
#[derive(Debug)]
pub enum CheckpointError {
    /// Failed to read the file
    LoadFailed(String),
    /// Failed to parse the contents
    ParseFailed(String),
    /// Failed to serialize the state
    SerializeFailed(String),
    /// Failed to write the file
    SaveFailed(String),
    /// Checkpoint does not fit the target domain
    Mismatch(String),
    /// Mesh could not be rebuilt
    Engine(EngineError),
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::LoadFailed(msg) => write!(f, "Failed to load: {msg}"),
            CheckpointError::ParseFailed(msg) => write!(f, "Failed to parse: {msg}"),
            CheckpointError::SerializeFailed(msg) => write!(f, "Failed to serialize: {msg}"),
            CheckpointError::SaveFailed(msg) => write!(f, "Failed to save: {msg}"),
            CheckpointError::Mismatch(msg) => write!(f, "Checkpoint mismatch: {msg}"),
            CheckpointError::Engine(e) => write!(f, "Failed to rebuild mesh: {e}"),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EngineError> for CheckpointError {
    fn from(e: EngineError) -> Self {
        CheckpointError::Engine(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Vec2;
    use crate::fields::FieldSpec;

    fn domain() -> Domain {
        let mut domain = Domain::new(GridConfig::centered(2.0, 3, 1, 6)).unwrap();
        domain.register(FieldSpec::scalar("T")).unwrap();
        domain.register(FieldSpec::scalar("U").with_default(2.0)).unwrap();
        domain
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut source = domain();
        let t = source.fields().handle("T").unwrap();
        source
            .refine_where(|info| info.center.norm() < 0.4 && info.level() < 5)
            .unwrap();
        source.fill(t, |p| (3.0 * p.x).sin() * (1.0 / 3.0) + p.y * 0.1);

        let checkpoint = Checkpoint::capture(&source, 1.25, 17);
        let json = checkpoint.to_json().unwrap();
        let parsed = Checkpoint::from_json(&json).unwrap();
        assert_eq!(parsed, checkpoint);

        let mut target = domain();
        parsed.restore(&mut target).unwrap();
        assert_eq!(target.tree().leaf_count(), source.tree().leaf_count());
        let restored = Checkpoint::capture(&target, 1.25, 17);
        assert_eq!(restored, checkpoint);
        assert_eq!(
            target.interpolate(t, Vec2::new(0.1, 0.1)),
            source.interpolate(t, Vec2::new(0.1, 0.1))
        );
    }

    #[test]
    fn test_restore_coarsens_finer_target() {
        let source = domain();
        let checkpoint = Checkpoint::capture(&source, 0.0, 0);
        let mut target = domain();
        target.refine_where(|info| info.center.x > 0.0).unwrap();
        checkpoint.restore(&mut target).unwrap();
        assert_eq!(target.tree().leaf_count(), 64);
    }

    #[test]
    fn test_mismatch_detected() {
        let checkpoint = Checkpoint::capture(&domain(), 0.0, 0);
        let mut other = Domain::new(GridConfig::centered(2.0, 3, 1, 6)).unwrap();
        other.register(FieldSpec::scalar("V")).unwrap();
        assert!(matches!(
            checkpoint.restore(&mut other),
            Err(CheckpointError::Mismatch(_))
        ));
        assert!(matches!(
            Checkpoint::from_json("{"),
            Err(CheckpointError::ParseFailed(_))
        ));
    }
}
