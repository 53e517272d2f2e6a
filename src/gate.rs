//! Post-update mask gate.
//!
//! The external optimizer folds gradients into its momentum buffer and
//! applies the update; afterwards the gate re-applies the permanent mask
//! to both the momentum buffer and the weights, so pruned units never
//! re-accumulate momentum and never drift away from zero.

use crate::blob::ParamBlob;
use crate::error::PruneError;
use crate::store::LayerState;

/// Zero the momentum entries of masked weights.
pub fn mask_momentum(state: &LayerState, momentum: &mut [f32]) -> Result<(), PruneError> {
    if momentum.len() != state.mask.len() {
        return Err(PruneError::ShapeMismatch {
            expected: vec![state.mask.len()],
            got: vec![momentum.len()],
        });
    }
    for (m, &bit) in momentum.iter_mut().zip(&state.mask) {
        if !bit {
            *m = 0.0;
        }
    }
    Ok(())
}

/// Re-zero masked weights after the external update.
pub fn mask_weights(state: &LayerState, blob: &mut ParamBlob) -> Result<(), PruneError> {
    blob.check_shape(state.rows, state.cols)?;
    for (w, &bit) in blob.data_mut().iter_mut().zip(&state.mask) {
        if !bit {
            *w = 0.0;
        }
    }
    Ok(())
}
