//! Pruning decisions: threshold crossing, probabilistic masking with
//! recovery, finish transitions, and retrain restoration.
//!
//! The deterministic decider prunes a unit when its mean absolute
//! magnitude falls below the configured floor or its accumulated
//! regularization reaches the cap. The probabilistic decider keeps a
//! functioning probability per unit: schedule draws recover borderline
//! units or decrement the weakest, probability zero is a permanent prune,
//! and a fresh Bernoulli mask is sampled from the surviving probabilities
//! every step.
//!
//! Once a unit's mask is permanently cleared it is never set again — not
//! by recovery, not by sampling.
//!
//! # References
//! - Wang, H., et al. (2018). Structured probabilistic pruning for deep
//!   convolutional neural network acceleration. BMVC.

use crate::blob::ParamBlob;
use crate::config::{ProbCurve, PruneMode, PruneUnit};
use crate::error::PruneError;
use crate::rank;
use crate::store::{LayerId, PruneStore};
use rand::Rng;

/// Deterministic threshold pass: prune every active unit whose mean
/// absolute magnitude is below `threshold` or whose accumulated
/// regularization reached the cap.
///
/// Freshly pruned rows are queued for cross-layer propagation. Returns
/// the number of units pruned this pass.
pub fn prune_minimals(
    store: &mut PruneStore,
    id: LayerId,
    blob: &mut ParamBlob,
    step: u64,
) -> Result<usize, PruneError> {
    let mut new_rows = Vec::new();
    let pruned = {
        let state = store.get_mut(id);
        if state.is_finished() || (blob.is_bias() && state.config.unit != PruneUnit::Weight) {
            return Ok(0);
        }
        let PruneMode::Deterministic { threshold } = state.config.mode else {
            return Ok(0);
        };
        blob.check_shape(state.rows, state.cols)?;

        let target_reg = state.config.target_reg;
        let mut count = 0;
        for u in 0..state.unit_count() {
            if state.is_unit_pruned(u) {
                continue;
            }
            let mean = state.mean_abs_unit(u, blob.data());
            if mean < threshold || state.history_reg[u] >= target_reg {
                state.prune_unit(u, blob.data_mut(), step);
                if state.config.unit == PruneUnit::Row {
                    new_rows.push(u);
                }
                count += 1;
            }
        }
        count
    };
    for r in new_rows {
        store.queue_pruned_row(id, r);
    }
    Ok(pruned)
}

/// One probabilistic iteration: recovery draw, probability decrement,
/// then a fresh Bernoulli mask from the surviving probabilities. The
/// update and the sampling are distinct and always run in that order.
pub fn prob_step<R: Rng>(
    store: &mut PruneStore,
    id: LayerId,
    blob: &mut ParamBlob,
    rng: &mut R,
    step: u64,
) -> Result<(), PruneError> {
    let mut new_rows = Vec::new();
    {
        let state = store.get_mut(id);
        if state.is_finished() || (blob.is_bias() && state.config.unit != PruneUnit::Weight) {
            return Ok(());
        }
        let PruneMode::Probabilistic(pp) = state.config.mode else {
            return Ok(());
        };
        blob.check_shape(state.rows, state.cols)?;
        state.prepare_scratch();

        rank::order_by_history_score(state, blob.data(), pp.score_decay);
        let units = state.unit_count();
        let n_active = (0..units).filter(|&u| !state.is_unit_pruned(u)).count();
        let pruned = units - n_active;
        // overshoot the ratio target by the configured margin
        let n_target = (((state.config.prune_ratio + pp.margin) * units as f32).ceil() as usize)
            .min(units);

        // Recovery: restore borderline probabilities to 1 for units still
        // ranked near the to-prune boundary. Never touches a pruned unit.
        if pp.rgamma > 0.0 {
            let draw: f32 = rng.gen();
            if (pp.rgamma + 0.000_27 * step as f32).powf(pp.rpower) > draw {
                let start = n_target.saturating_sub(pruned).saturating_sub(1);
                for rk in start..n_active {
                    let u = state.scratch.order[rk];
                    if !state.is_unit_pruned(u) {
                        state.history_prob[u] = 1.0;
                    }
                }
            }
        }

        // Probability decrement on the schedule trigger.
        let fire = match pp.interval {
            Some(iv) => iv > 0 && step % iv == 0,
            None => {
                let draw: f32 = rng.gen();
                (pp.cgamma + 0.000_8 * step as f32).powf(pp.cpower) > draw
            }
        };
        if fire {
            let n_left = n_target.saturating_sub(pruned);
            if n_left > 0 {
                let aa = state.config.effective_aa(step);
                let (alpha, n1) = match pp.curve {
                    ProbCurve::Mirror => {
                        let alpha = (2.0 / pp.kk).ln() / n_left as f32;
                        (alpha, -pp.kk.ln() / alpha)
                    }
                    ProbCurve::Linear => (aa / n_left as f32, 0.0),
                };
                for rk in 0..n_active {
                    let u = state.scratch.order[rk];
                    if state.is_unit_pruned(u) {
                        continue;
                    }
                    let r = rk as f32;
                    let delta = match pp.curve {
                        ProbCurve::Mirror => {
                            if r < n1 {
                                aa * (-alpha * r).exp()
                            } else {
                                -aa * (-alpha * (2.0 * n1 - r)).exp() + 2.0 * pp.kk * aa
                            }
                        }
                        ProbCurve::Linear => aa - alpha * r,
                    };
                    let old = state.history_prob[u];
                    let new = (old - delta).clamp(0.0, 1.0);
                    state.history_prob[u] = new;
                    if new == 0.0 && old > 0.0 {
                        state.prune_unit(u, blob.data_mut(), step);
                        if state.config.unit == PruneUnit::Row {
                            new_rows.push(u);
                        }
                    }
                }
            }
        }

        // Bernoulli sampling: a non-zero-probability unit can still be
        // stochastically zeroed this step (implicit dropout-style
        // regularization). Pruned units stay zero unconditionally.
        let data = blob.data_mut();
        for u in 0..units {
            if state.is_unit_pruned(u) {
                continue;
            }
            let draw: f32 = rng.gen();
            if draw >= state.history_prob[u] {
                state.for_unit_weights(u, |i| data[i] = 0.0);
            }
        }
    }
    for r in new_rows {
        store.queue_pruned_row(id, r);
    }
    Ok(())
}

/// Check whether the layer reached its target ratio; if so, mark it
/// finished (terminal) and, for probabilistic layers, fold the surviving
/// probabilities into the weights once.
///
/// Idempotent: calling again on a finished layer changes nothing.
pub fn finish_check(
    store: &mut PruneStore,
    id: LayerId,
    blob: &mut ParamBlob,
    step: u64,
) -> Result<bool, PruneError> {
    let state = store.get_mut(id);
    if state.config.prune_ratio <= 0.0 {
        return Ok(false);
    }
    if state.is_finished() {
        return Ok(true);
    }
    if state.achieved_ratio() < state.config.prune_ratio {
        return Ok(false);
    }
    state.finished_at_step = Some(step);

    if matches!(state.config.mode, PruneMode::Probabilistic(_)) {
        blob.check_shape(state.rows, state.cols)?;
        let data = blob.data_mut();
        for u in 0..state.unit_count() {
            let p = state.history_prob[u];
            if p > 0.0 {
                if p < 1.0 {
                    state.for_unit_weights(u, |i| data[i] *= p);
                }
                state.history_prob[u] = 1.0;
            }
        }
    }
    Ok(true)
}

/// Rebuild masks, pruned flags, and counters from zero runs in a restored
/// weight blob (retraining after a checkpoint reload).
pub fn restore_from_weights(
    store: &mut PruneStore,
    id: LayerId,
    blob: &ParamBlob,
) -> Result<(), PruneError> {
    let step = store.step();
    let state = store.get_mut(id);
    blob.check_shape(state.rows, state.cols)?;
    let data = blob.data();
    let (rows, cols) = (state.rows, state.cols);
    let group = state.config.group;
    let rows_per_g = rows / group;
    let prob_mode = matches!(state.config.mode, PruneMode::Probabilistic(_));

    state.mask.iter_mut().for_each(|m| *m = true);
    state.weight_pruned.iter_mut().for_each(|p| *p = false);
    state.row_pruned.iter_mut().for_each(|p| *p = false);
    state.col_pruned.iter_mut().for_each(|p| *p = false);
    state.pruned_weights = 0;
    state.pruned_rows = 0;
    state.pruned_cols = 0.0;

    if state.config.unit == PruneUnit::Weight {
        for i in 0..rows * cols {
            if data[i] == 0.0 {
                state.mask[i] = false;
                state.weight_pruned[i] = true;
                state.pruned_weights += 1;
                if prob_mode {
                    state.history_prob[i] = 0.0;
                }
            }
        }
    }

    // Column scan, one group slice at a time; the column counter is
    // fractional under grouping.
    for j in 0..cols {
        for g in 0..group {
            let sum: f32 = (g * rows_per_g..(g + 1) * rows_per_g)
                .map(|i| data[i * cols + j].abs())
                .sum();
            if sum == 0.0 && rows_per_g > 0 {
                state.pruned_cols += 1.0 / group as f32;
                state.col_pruned[g * cols + j] = true;
                for i in g * rows_per_g..(g + 1) * rows_per_g {
                    state.mask[i * cols + j] = false;
                }
                if prob_mode && state.config.unit == PruneUnit::Col {
                    state.history_prob[j] = 0.0;
                }
            }
        }
    }

    // Row scan.
    for i in 0..rows {
        let sum: f32 = (0..cols).map(|j| data[i * cols + j].abs()).sum();
        if sum == 0.0 && cols > 0 {
            state.pruned_rows += 1;
            state.row_pruned[i] = true;
            for j in 0..cols {
                state.mask[i * cols + j] = false;
            }
            if prob_mode && state.config.unit == PruneUnit::Row {
                state.history_prob[i] = 0.0;
            }
        }
    }

    if state.config.prune_ratio > 0.0
        && state.achieved_ratio() >= state.config.prune_ratio
        && !state.is_finished()
    {
        state.finished_at_step = Some(step);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerConfig, ProbParams, RegPolicy};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weak_cols_layer() -> (PruneStore, ParamBlob, LayerId) {
        // 2x4 tensor, two strong and two weak columns, ratio 0.5, threshold 0.2
        let blob = ParamBlob::new(&[1.0, 1.0, 0.1, 0.1, 1.0, 1.0, 0.1, 0.1], &[2, 4]);
        let mut store = PruneStore::new();
        let cfg = LayerConfig::new(0.5).with_mode(PruneMode::Deterministic { threshold: 0.2 });
        let id = store.register("fc1", &blob, cfg).unwrap();
        (store, blob, id)
    }

    // ==========================================================================
    // FALSIFICATION TEST 1: The threshold scenario prunes exactly columns 2, 3
    // Popper: "If any other column loses a weight, the decider is broken"
    // ==========================================================================
    #[test]
    fn test_threshold_prunes_weak_columns() {
        let (mut store, mut blob, id) = weak_cols_layer();

        let n = prune_minimals(&mut store, id, &mut blob, 1).unwrap();
        assert_eq!(n, 2, "DEC-01 FALSIFIED: exactly two columns must prune");

        let state = store.get(id);
        assert!(state.is_unit_pruned(2) && state.is_unit_pruned(3));
        assert!(!state.is_unit_pruned(0) && !state.is_unit_pruned(1));
        assert!((state.pruned_cols - 2.0).abs() < 1e-6);
        assert_eq!(blob.data(), &[1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        // exactly those 2 columns' 4 weights are masked
        assert_eq!(state.mask.iter().filter(|&&m| !m).count(), 4);
    }

    #[test]
    fn test_threshold_scenario_finishes_layer() {
        let (mut store, mut blob, id) = weak_cols_layer();

        prune_minimals(&mut store, id, &mut blob, 1).unwrap();
        let finished = finish_check(&mut store, id, &mut blob, 1).unwrap();
        assert!(finished);
        assert_eq!(store.get(id).finished_at_step, Some(1));
        assert!((store.get(id).pruned_ratio_col() - 0.5).abs() < 1e-6);
    }

    // ==========================================================================
    // FALSIFICATION TEST 2: Finish check is idempotent
    // ==========================================================================
    #[test]
    fn test_finish_check_idempotent() {
        let (mut store, mut blob, id) = weak_cols_layer();

        prune_minimals(&mut store, id, &mut blob, 1).unwrap();
        finish_check(&mut store, id, &mut blob, 1).unwrap();
        let snapshot = store.get(id).clone();

        finish_check(&mut store, id, &mut blob, 2).unwrap();
        let again = store.get(id);
        assert_eq!(again.finished_at_step, Some(1));
        assert_eq!(again.mask, snapshot.mask);
        assert!(
            (again.pruned_cols - snapshot.pruned_cols).abs() < 1e-6,
            "DEC-02 FALSIFIED: second finish check drifted a counter"
        );
    }

    #[test]
    fn test_reg_cap_triggers_prune() {
        let (mut store, mut blob, id) = weak_cols_layer();
        // column 0 is strong, but its accumulated reg reached the cap
        store.get_mut(id).history_reg[0] = store.get(id).config.target_reg;

        prune_minimals(&mut store, id, &mut blob, 3).unwrap();
        assert!(store.get(id).is_unit_pruned(0));
    }

    #[test]
    fn test_pruned_rank_sentinel_orders_by_overshoot() {
        let (mut store, mut blob, id) = weak_cols_layer();
        store.get_mut(id).history_reg[2] = 1.5; // overshot cap by 0.5
        store.get_mut(id).history_reg[3] = 1.0; // exactly at cap

        prune_minimals(&mut store, id, &mut blob, 10).unwrap();
        let state = store.get(id);
        // heavier overshoot ranks earlier among the pruned set
        assert!(state.history_rank[2] < state.history_rank[3]);
    }

    #[test]
    fn test_row_prunes_are_queued() {
        let blob_data: Vec<f32> = vec![
            1.0, 1.0, 1.0, 1.0, // row 0: strong
            0.0, 0.01, 0.0, 0.01, // row 1: weak
        ];
        let mut blob = ParamBlob::new(&blob_data, &[2, 4]);
        let mut store = PruneStore::new();
        let cfg = LayerConfig::new(0.5)
            .with_unit(PruneUnit::Row)
            .with_mode(PruneMode::Deterministic { threshold: 0.2 });
        let id = store.register("conv1", &blob, cfg).unwrap();

        prune_minimals(&mut store, id, &mut blob, 1).unwrap();
        assert_eq!(store.pending_len(), 1);
        assert_eq!(store.take_pending(), vec![(id, 1)]);
    }

    #[test]
    fn test_bias_blob_skipped() {
        let (mut store, _, id) = weak_cols_layer();
        let mut bias = ParamBlob::new(&[0.01, 0.01], &[2]);
        let n = prune_minimals(&mut store, id, &mut bias, 1).unwrap();
        assert_eq!(n, 0);
    }

    fn prob_layer(interval: u64) -> (PruneStore, ParamBlob, LayerId) {
        let blob = ParamBlob::new(&[1.0, 1.0, 0.1, 0.1, 1.0, 1.0, 0.1, 0.1], &[2, 4]);
        let mut store = PruneStore::new();
        let pp = ProbParams {
            interval: Some(interval),
            ..ProbParams::default()
        };
        let cfg = LayerConfig::new(0.5)
            .with_policy(RegPolicy::L2)
            .with_mode(PruneMode::Probabilistic(pp))
            .with_reg_limits(0.6, 1.0); // aa large: probabilities drop fast
        let id = store.register("conv1", &blob, cfg).unwrap();
        (store, blob, id)
    }

    // ==========================================================================
    // FALSIFICATION TEST 3: Probability zero is a permanent, irreversible prune
    // Popper: "If a later recovery pass lifts a zero probability, the
    //          permanence invariant is falsified"
    // ==========================================================================
    #[test]
    fn test_probability_zero_is_permanent() {
        let (mut store, mut blob, id) = prob_layer(1);
        let mut rng = StdRng::seed_from_u64(7);

        // drive the two weakest columns to probability zero
        for step in 0..50 {
            if store.get(id).pruned_cols >= 2.0 {
                break;
            }
            prob_step(&mut store, id, &mut blob, &mut rng, step).unwrap();
            store.take_pending();
        }
        let state = store.get(id);
        assert!(state.is_unit_pruned(2) && state.is_unit_pruned(3));
        assert_eq!(state.history_prob[2], 0.0);

        // force a recovery pass over everything
        let mut forced = store.get_mut(id).clone();
        let mut recovery_rng = StdRng::seed_from_u64(1);
        let pp = ProbParams {
            rgamma: 10.0, // recovery fires with certainty
            rpower: 1.0,
            ..ProbParams::default()
        };
        forced.config.mode = PruneMode::Probabilistic(pp);
        *store.get_mut(id) = forced;
        prob_step(&mut store, id, &mut blob, &mut recovery_rng, 60).unwrap();

        let state = store.get(id);
        assert_eq!(
            state.history_prob[2], 0.0,
            "DEC-03 FALSIFIED: recovery lifted a permanently pruned unit"
        );
        assert!(!state.mask[2], "mask bit must stay cleared");
    }

    #[test]
    fn test_prob_sampling_never_unmasks_pruned() {
        let (mut store, mut blob, id) = prob_layer(1);
        let mut rng = StdRng::seed_from_u64(3);

        for step in 0..80 {
            prob_step(&mut store, id, &mut blob, &mut rng, step).unwrap();
            store.take_pending();
            let state = store.get(id);
            for u in 0..4 {
                if state.is_unit_pruned(u) {
                    assert_eq!(blob.data()[u], 0.0);
                    assert_eq!(blob.data()[4 + u], 0.0);
                }
            }
        }
    }

    #[test]
    fn test_prob_finish_folds_probabilities() {
        let (mut store, mut blob, id) = prob_layer(1);
        let mut rng = StdRng::seed_from_u64(11);

        for step in 0..100 {
            prob_step(&mut store, id, &mut blob, &mut rng, step).unwrap();
            store.take_pending();
            if finish_check(&mut store, id, &mut blob, step).unwrap() {
                break;
            }
        }
        let state = store.get(id);
        assert!(state.is_finished());
        // all surviving probabilities pinned to 1
        for u in 0..4 {
            if !state.is_unit_pruned(u) {
                assert_eq!(state.history_prob[u], 1.0);
            }
        }
    }

    #[test]
    fn test_restore_from_weights_rebuilds_state() {
        let (mut store, mut blob, id) = weak_cols_layer();
        prune_minimals(&mut store, id, &mut blob, 1).unwrap();
        finish_check(&mut store, id, &mut blob, 1).unwrap();
        let reference = store.get(id).clone();

        // a fresh registration restoring from the zeroed weights
        let mut store2 = PruneStore::new();
        let cfg = LayerConfig::new(0.5).with_mode(PruneMode::Deterministic { threshold: 0.2 });
        let id2 = store2.register("fc1", &blob, cfg).unwrap();
        restore_from_weights(&mut store2, id2, &blob).unwrap();

        let restored = store2.get(id2);
        assert_eq!(restored.mask, reference.mask);
        assert!((restored.pruned_cols - reference.pruned_cols).abs() < 1e-6);
        assert!(restored.is_finished());
    }

    #[test]
    fn test_restore_detects_rows_and_weights() {
        let data = vec![
            0.0, 0.0, 0.0, // row 0 fully zero
            1.0, 0.0, 2.0, // row 1 live, one zero weight
        ];
        let blob = ParamBlob::new(&data, &[2, 3]);
        let mut store = PruneStore::new();
        let cfg = LayerConfig::new(0.5)
            .with_unit(PruneUnit::Weight)
            .with_policy(RegPolicy::L2)
            .with_mode(PruneMode::Deterministic { threshold: 1e-4 });
        let id = store.register("fc1", &blob, cfg).unwrap();
        restore_from_weights(&mut store, id, &blob).unwrap();

        let state = store.get(id);
        assert_eq!(state.pruned_weights, 4);
        assert_eq!(state.pruned_rows, 1);
        assert!(state.row_pruned[0]);
        assert!(!state.mask[4]);
    }
}
