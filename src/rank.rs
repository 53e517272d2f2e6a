//! Importance scoring and rank smoothing.
//!
//! A unit's raw score is the sum of absolute weight magnitude across the
//! orthogonal dimension. Active units are ranked ascending (0 = weakest,
//! ties broken by unit index through the stable sort); the smoothed
//! `history_rank` then drives the penalty curves, giving a pruning
//! priority signal that is stable across noisy single-step scores.
//!
//! Pruned units never re-enter the ranking: their `history_rank` is frozen
//! at the value recorded when they were pruned, preserving relative order
//! within the pruned set.

use crate::config::RankSmoothing;
use crate::store::LayerState;

/// Where pruned units sit in a full ordering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrunedEnd {
    /// Pruned units sort first, by their frozen rank sentinel (deeply
    /// negative). Rank-curve policies index the active region past them.
    Front,
    /// Pruned units float to the end.
    Back,
}

/// Refresh raw scores and fold the current ranking of active units into
/// `history_rank`.
///
/// `step` is the 0-based global step; the running-mean rule uses the
/// 1-based count `n = step + 1`.
pub fn update_history_rank(state: &mut LayerState, data: &[f32], step: u64) {
    let units = state.unit_count();
    let mut scratch = std::mem::take(&mut state.scratch);

    scratch.pairs.clear();
    for u in 0..units {
        if state.is_unit_pruned(u) {
            continue;
        }
        let s = state.sum_abs_unit(u, data);
        state.score[u] = s;
        scratch.pairs.push((s, u));
    }
    scratch
        .pairs
        .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let n = (step + 1) as f32;
    for (rk, &(_, u)) in scratch.pairs.iter().enumerate() {
        let rank = rk as f32;
        let h = state.history_rank[u];
        state.history_rank[u] = match state.config.smoothing {
            RankSmoothing::RunningMean => ((n - 1.0) * h + rank) / n,
            // zero history seeds with the first observed rank
            RankSmoothing::Ema { momentum } => {
                if h == 0.0 {
                    rank
                } else {
                    momentum * h + (1.0 - momentum) * rank
                }
            }
        };
    }

    state.scratch = scratch;
}

/// Like [`update_history_rank`], but ranked by descending importance
/// (negated score): rank 0 is the strongest unit, so the weakest units
/// carry the largest smoothed ranks and sort to the tail.
///
/// Used only by the budgeted policy, whose zone partition and
/// proportional weighting are defined over this inverted axis. Policies
/// are mutually exclusive per layer, so a layer's `history_rank` keeps
/// one orientation for its whole lifetime.
pub(crate) fn update_history_rank_inverted(state: &mut LayerState, data: &[f32], step: u64) {
    let units = state.unit_count();
    let mut scratch = std::mem::take(&mut state.scratch);

    scratch.pairs.clear();
    for u in 0..units {
        if state.is_unit_pruned(u) {
            continue;
        }
        let s = state.sum_abs_unit(u, data);
        state.score[u] = s;
        scratch.pairs.push((-s, u));
    }
    scratch
        .pairs
        .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let n = (step + 1) as f32;
    for (rk, &(_, u)) in scratch.pairs.iter().enumerate() {
        let rank = rk as f32;
        let h = state.history_rank[u];
        state.history_rank[u] = match state.config.smoothing {
            RankSmoothing::RunningMean => ((n - 1.0) * h + rank) / n,
            RankSmoothing::Ema { momentum } => {
                if h == 0.0 {
                    rank
                } else {
                    momentum * h + (1.0 - momentum) * rank
                }
            }
        };
    }

    state.scratch = scratch;
}

/// Order all units by `history_rank`, leaving the sorted `(key, unit)`
/// pairs and the index order in the layer scratch.
pub(crate) fn order_by_history_rank(state: &mut LayerState, end: PrunedEnd) {
    let units = state.unit_count();
    let mut scratch = std::mem::take(&mut state.scratch);

    scratch.pairs.clear();
    for u in 0..units {
        let key = if state.is_unit_pruned(u) {
            match end {
                // frozen sentinel: deeply negative, below any active rank
                PrunedEnd::Front => state.history_rank[u],
                PrunedEnd::Back => f32::INFINITY,
            }
        } else {
            state.history_rank[u]
        };
        scratch.pairs.push((key, u));
    }
    scratch
        .pairs
        .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    scratch.order.clear();
    scratch.order.extend(scratch.pairs.iter().map(|&(_, u)| u));
    state.scratch = scratch;
}

/// Order all units by their raw score, pruned units floated to the end.
///
/// Refreshes `score` for active units as a side effect.
pub(crate) fn order_by_score(state: &mut LayerState, data: &[f32]) {
    let units = state.unit_count();
    let mut scratch = std::mem::take(&mut state.scratch);

    scratch.pairs.clear();
    for u in 0..units {
        let key = if state.is_unit_pruned(u) {
            f32::INFINITY
        } else {
            let s = state.sum_abs_unit(u, data);
            state.score[u] = s;
            s
        };
        scratch.pairs.push((key, u));
    }
    scratch
        .pairs
        .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    scratch.order.clear();
    scratch.order.extend(scratch.pairs.iter().map(|&(_, u)| u));
    state.scratch = scratch;
}

/// Fold the current scores into the decayed score history and order units
/// by it, pruned units floated to the end.
///
/// The decayed history is the ranking signal of the probabilistic decider:
/// `h = decay * h + score`, updated for every unit (a pruned unit's score
/// contribution is zero, so its history decays toward zero).
pub(crate) fn order_by_history_score(state: &mut LayerState, data: &[f32], decay: f32) {
    let units = state.unit_count();
    let mut scratch = std::mem::take(&mut state.scratch);

    scratch.pairs.clear();
    for u in 0..units {
        let s = state.sum_abs_unit(u, data);
        state.score[u] = s;
        state.history_score[u] = decay * state.history_score[u] + s;
        let key = if state.is_unit_pruned(u) {
            f32::INFINITY
        } else {
            state.history_score[u]
        };
        scratch.pairs.push((key, u));
    }
    scratch
        .pairs
        .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    scratch.order.clear();
    scratch.order.extend(scratch.pairs.iter().map(|&(_, u)| u));
    state.scratch = scratch;
}
