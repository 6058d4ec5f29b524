//! Error types for rig logic initialization, evaluation and structural edits.

use crate::neural::ActivationFunction;

/// Errors produced by the rig logic engine.
///
/// Soft inconsistencies (unused controls, RBF size mismatches, ambiguous GUI
/// inversion) are logged and never surface here.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RigError {
    /// Malformed or inconsistent rig data: index out of range, size mismatch,
    /// unsorted or duplicated registrations.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// A network layer uses an activation the evaluator does not implement.
    #[error("unsupported activation {kind:?} in neural network {network}, layer {layer}")]
    UnsupportedActivation {
        network: usize,
        layer: usize,
        kind: ActivationFunction,
    },

    /// Mirrored indices could not be resolved consistently.
    #[error("symmetry error: {reason}")]
    Symmetry { reason: String },

    /// Rig definition JSON could not be parsed.
    #[error("rig definition parse error: {0}")]
    Parse(String),
}

impl RigError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        RigError::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn symmetry(reason: impl Into<String>) -> Self {
        RigError::Symmetry {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type RigResult<T> = Result<T, RigError>;
