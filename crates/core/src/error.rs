//! Error types shared by every engine component
//!
//! Topology violations are recoverable (the caller may retry with a different
//! request), convergence failures are usually reported through solver
//! statistics instead of this type, and configuration errors are raised
//! before the first time step.

use crate::grid::CellKey;

/// Why a refine or coarsen request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyReason {
    /// The cell id does not name a live cell
    UnknownCell,
    /// Refinement was requested on a cell that already has children
    NotALeaf,
    /// Coarsening was requested on a cell without children
    NotRefined,
    /// Coarsening was requested but at least one child has children itself
    ChildNotLeaf,
    /// Refinement would exceed the grid's maximum level
    MaxLevelReached,
    /// The change would leave two adjacent leaves more than one level apart
    Unbalanced {
        /// Neighbour that would violate 2:1 balance
        neighbor: CellKey,
    },
}

impl std::fmt::Display for TopologyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyReason::UnknownCell => write!(f, "cell does not exist"),
            TopologyReason::NotALeaf => write!(f, "cell is not a leaf"),
            TopologyReason::NotRefined => write!(f, "cell has no children"),
            TopologyReason::ChildNotLeaf => write!(f, "a child cell is refined"),
            TopologyReason::MaxLevelReached => write!(f, "maximum level reached"),
            TopologyReason::Unbalanced { neighbor } => {
                write!(f, "2:1 balance violated against neighbour {neighbor}")
            }
        }
    }
}

/// Errors produced by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A refine/coarsen request would break the tree invariants
    TopologyViolation {
        /// Cell the request targeted
        cell: CellKey,
        /// What went wrong
        reason: TopologyReason,
    },
    /// The implicit solver hit its iteration cap above tolerance
    ConvergenceFailure {
        /// Field being solved for
        field: String,
        /// Cycles performed
        iterations: usize,
        /// Final residual norm
        residual: f64,
    },
    /// Invalid setup: bad field declarations, inconsistent conditions, bad parameters
    Configuration(String),
    /// An operation was called in a driver state that does not allow it
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// Driver state at the time
        state: &'static str,
    },
}

impl EngineError {
    /// Shorthand for building a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    /// Whether the error is a rejected topology change
    pub fn is_topology_violation(&self) -> bool {
        matches!(self, EngineError::TopologyViolation { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::TopologyViolation { cell, reason } => {
                write!(f, "Topology violation at {cell}: {reason}")
            }
            EngineError::ConvergenceFailure {
                field,
                iterations,
                residual,
            } => write!(
                f,
                "Solver for '{field}' did not converge: residual {residual:.3e} after {iterations} cycles"
            ),
            EngineError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            EngineError::InvalidState { operation, state } => {
                write!(f, "Cannot {operation} while driver is {state}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_topology_violation() {
        let err = EngineError::TopologyViolation {
            cell: CellKey::new(3, 2, 5),
            reason: TopologyReason::Unbalanced {
                neighbor: CellKey::new(2, 0, 2),
            },
        };
        let text = err.to_string();
        assert!(text.contains("(3, 2, 5)"));
        assert!(text.contains("(2, 0, 2)"));
        assert!(err.is_topology_violation());
    }

    #[test]
    fn test_display_configuration() {
        let err = EngineError::config("duplicate field 'C'");
        assert_eq!(err.to_string(), "Configuration error: duplicate field 'C'");
        assert!(!err.is_topology_violation());
    }
}
