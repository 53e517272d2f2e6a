//! Cross-layer mask propagation along a feed-forward chain.
//!
//! When layer L prunes an output row, the matching input positions of
//! layer L+1 carry no signal and are pruned too, translated through L+1's
//! kernel spatial extent and grouped-convolution factor. Symmetrically,
//! when a whole receptive block of L+1 input columns is pruned, the
//! upstream row feeding it is dead and is removed.
//!
//! The forward direction runs off an explicit work queue of
//! `(source layer, row)` pairs, drained exactly once per discovered unit;
//! the engine asserts the queue is empty at every step boundary, so
//! double application — which would corrupt the pruned counters — is
//! structurally impossible.

use crate::blob::ParamBlob;
use crate::error::PruneError;
use crate::store::{LayerId, PruneStore};

/// Drain the pruned-row queue, pruning the matching input columns of each
/// source layer's successor. Entries from the last chain layer (or from
/// layers outside the chain) are consumed without effect.
///
/// `blobs` is parallel to `chain`. Returns the number of row entries that
/// produced a downstream prune.
pub fn drain(
    store: &mut PruneStore,
    chain: &[LayerId],
    blobs: &mut [ParamBlob],
) -> Result<usize, PruneError> {
    if blobs.len() != chain.len() {
        return Err(PruneError::ShapeMismatch {
            expected: vec![chain.len()],
            got: vec![blobs.len()],
        });
    }
    let entries = store.take_pending();
    let mut applied = 0;

    for (src, row) in entries {
        let Some(k) = chain.iter().position(|&c| c == src) else {
            continue;
        };
        if k + 1 >= chain.len() {
            continue; // no successor to update
        }
        let dst = chain[k + 1];
        let blob = &mut blobs[k + 1];
        let state = store.get_mut(dst);
        blob.check_shape(state.rows, state.cols)?;

        let cols = state.cols;
        let ka = state.config.kernel_area;
        let group = state.config.group;
        if cols % ka != 0 {
            return Err(PruneError::ShapeMismatch {
                expected: vec![ka],
                got: vec![cols],
            });
        }
        // source row r feeds input channel r % num_chl of group r / num_chl
        let num_chl = cols / ka;
        let rows_per_g = state.rows / group;
        let chl = row % num_chl;
        let g = row / num_chl;
        if g >= group {
            continue; // row beyond the successor's input extent
        }
        if state.col_pruned[g * cols + chl * ka] {
            continue; // block already pruned, don't recount
        }

        let data = blob.data_mut();
        for i in g * rows_per_g..(g + 1) * rows_per_g {
            for j in chl * ka..(chl + 1) * ka {
                data[i * cols + j] = 0.0;
                state.mask[i * cols + j] = false;
            }
        }
        for j in chl * ka..(chl + 1) * ka {
            state.col_pruned[g * cols + j] = true;
        }
        state.pruned_cols += ka as f32 / group as f32;
        applied += 1;
    }
    Ok(applied)
}

/// Backward pass: prune any upstream row whose entire receptive block in
/// the successor is already pruned.
///
/// These rows need no re-queueing — the downstream columns that would
/// receive the propagation are exactly the ones that triggered it.
pub fn backfill(
    store: &mut PruneStore,
    chain: &[LayerId],
    blobs: &mut [ParamBlob],
    step: u64,
) -> Result<usize, PruneError> {
    if blobs.len() != chain.len() {
        return Err(PruneError::ShapeMismatch {
            expected: vec![chain.len()],
            got: vec![blobs.len()],
        });
    }
    let mut pruned = 0;

    for k in 0..chain.len().saturating_sub(1) {
        let (src_state, dst_state) = store.get2_mut(chain[k], chain[k + 1]);
        let blob = &mut blobs[k];
        blob.check_shape(src_state.rows, src_state.cols)?;

        let fanl = dst_state.config.kernel_area;
        let dgroup = dst_state.config.group;
        if dgroup == 0 || src_state.rows % dgroup != 0 {
            continue;
        }
        let rows_per_g = src_state.rows / dgroup;
        let dcols = dst_state.cols;

        for i in 0..src_state.rows {
            if src_state.row_pruned[i] {
                continue;
            }
            let chl = i % rows_per_g;
            let g = i / rows_per_g;
            let start = chl * fanl;
            let end = start + fanl;
            if end > dcols {
                continue;
            }
            let block_dead = (start..end).all(|j| dst_state.col_pruned[g * dcols + j]);
            if block_dead {
                src_state.force_prune_row(i, blob.data_mut(), step);
                pruned += 1;
            }
        }
    }
    Ok(pruned)
}
