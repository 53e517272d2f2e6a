//! Pruning-state snapshots.
//!
//! The whole [`PruneStore`] — masks, scores, ranks, regularization
//! accumulators, probabilities, counters, finished flags, the pending
//! propagation queue, and the step counter — serializes through serde.
//! Restoration must reproduce identical pruning decisions going forward,
//! and does: `f32` values survive the JSON round trip exactly
//! (shortest-representation float encoding), and the transient sort
//! buffers are rebuilt lazily on the next step.

use crate::error::PruneError;
use crate::store::PruneStore;

/// Serialize a store to JSON.
pub fn to_json(store: &PruneStore) -> Result<String, PruneError> {
    serde_json::to_string(store).map_err(|e| PruneError::Snapshot {
        details: e.to_string(),
    })
}

/// Restore a store from JSON.
pub fn from_json(json: &str) -> Result<PruneStore, PruneError> {
    serde_json::from_str(json).map_err(|e| PruneError::Snapshot {
        details: e.to_string(),
    })
}
