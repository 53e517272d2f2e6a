//! Pruning-specific error types.
//!
//! Configuration errors and invariant violations are fatal to the caller;
//! recoverable situations (unregistered layer, bias blob under a structural
//! policy) are `Ok` no-ops and never surface here.

use std::fmt;

/// Pruning operation errors with detailed context.
///
/// Each variant carries enough information to name the offending layer
/// and parameter in the abort message.
#[derive(Debug, Clone)]
pub enum PruneError {
    /// Policy name not part of the closed policy family.
    ///
    /// Raised by the string front end only; the `RegPolicy` enum itself
    /// is exhaustive at compile time.
    UnknownPolicy {
        /// The unrecognized policy name
        name: String,
    },

    /// A configuration value is outside its legal range.
    InvalidConfig {
        /// Parameter name (e.g. "prune_ratio")
        field: &'static str,
        /// Provided value
        value: f32,
        /// Constraint description
        constraint: String,
    },

    /// Blob and recorded layer shape don't align.
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape found
        got: Vec<usize>,
    },

    /// A curve policy was asked to run with no units left to prune.
    ///
    /// The penalty curves divide by the remaining-to-prune count; reaching
    /// zero while the layer is still marked active is an invariant
    /// violation, not a legal schedule state.
    NothingToPrune {
        /// Layer whose schedule degenerated
        layer: String,
    },

    /// A budgeted policy ran past its distribution horizon.
    ScheduleExhausted {
        /// Layer whose budget horizon passed
        layer: String,
        /// Current global step
        step: u64,
        /// Configured horizon
        horizon: u64,
    },

    /// The cross-layer propagation queue was not drained before a new step.
    ///
    /// The queue must be consumed exactly once per discovered unit; silent
    /// carry-over corrupts pruned counters.
    QueueNotDrained {
        /// Number of stale entries found
        pending: usize,
    },

    /// Snapshot serialization or restoration failed.
    Snapshot {
        /// Underlying serializer message
        details: String,
    },
}

impl fmt::Display for PruneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PruneError::UnknownPolicy { name } => {
                write!(f, "Unknown regularization policy: '{name}'")
            }
            PruneError::InvalidConfig {
                field,
                value,
                constraint,
            } => {
                write!(f, "Invalid value {value} for '{field}': {constraint}")
            }
            PruneError::ShapeMismatch { expected, got } => {
                write!(f, "Shape mismatch: expected {expected:?}, got {got:?}")
            }
            PruneError::NothingToPrune { layer } => {
                write!(
                    f,
                    "Layer '{layer}' has no units left to prune but is still active"
                )
            }
            PruneError::ScheduleExhausted {
                layer,
                step,
                horizon,
            } => {
                write!(
                    f,
                    "Layer '{layer}' passed its regularization horizon ({step} >= {horizon})"
                )
            }
            PruneError::QueueNotDrained { pending } => {
                write!(
                    f,
                    "Propagation queue holds {pending} stale entries at step start"
                )
            }
            PruneError::Snapshot { details } => {
                write!(f, "Snapshot failure: {details}")
            }
        }
    }
}

impl std::error::Error for PruneError {}

/// Convenience alias for fallible pruning operations.
pub type Result<T> = std::result::Result<T, PruneError>;
