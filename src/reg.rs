//! Adaptive regularization policies.
//!
//! Every step, the scheduler turns a layer's rank/score table into a
//! per-unit regularization multiplier, accumulates it into `history_reg`
//! (clamped to `[0, target_reg]`), and adds `multiplier * weight` into the
//! gradient buffer — extra decay that grows for units headed toward
//! removal and shrinks for units being spared.
//!
//! Policy dispatch is a single exhaustive `match` over [`RegPolicy`]; the
//! plain L1/L2 variants reduce to classic weight decay with no per-unit
//! differentiation.
//!
//! # References
//! - Wang, H., et al. (2019). Structured pruning for efficient ConvNets
//!   via incremental regularization. IJCNN.

use crate::blob::ParamBlob;
use crate::config::{CurveScheme, PruneUnit, RegPolicy};
use crate::error::PruneError;
use crate::rank::{self, PrunedEnd};
use crate::store::LayerState;

/// Normal-distribution z values for percentiles 0.50 to 0.95 in steps of
/// 0.05, used by the bimodal threshold estimate.
const NORMAL_Z: [f32; 10] = [
    0.0, 0.1257, 0.2533, 0.3853, 0.5244, 0.6745, 0.8416, 1.0364, 1.2816, 1.6449,
];

/// Apply the baseline decay and the layer's policy delta for one step.
///
/// `decay_scale` scales the configured baseline decay (decreasing-decay
/// schedules); the per-unit policy runs only for registered, unfinished,
/// non-bias layers past their begin step. Skips are silent no-ops.
pub fn regularize(
    state: &mut LayerState,
    blob: &mut ParamBlob,
    step: u64,
    decay_scale: f32,
) -> Result<(), PruneError> {
    let policy = state.config.policy;
    let local_decay = state.config.decay * decay_scale;
    apply_base_decay(blob, policy, local_decay);
    if matches!(policy, RegPolicy::L2 | RegPolicy::L1) {
        return Ok(());
    }

    if blob.is_bias() && state.config.unit != PruneUnit::Weight {
        return Ok(());
    }
    if state.is_finished() || step < state.config.begin_step || state.config.prune_ratio <= 0.0 {
        return Ok(());
    }
    blob.check_shape(state.rows, state.cols)?;
    state.prepare_scratch();

    match policy {
        RegPolicy::RankCurve { scheme } => rank_curve(state, blob.data(), step, scheme)?,
        RegPolicy::ScoreGap => score_gap(state, blob.data(), step)?,
        RegPolicy::Budgeted { horizon } => budgeted(state, blob.data(), step, horizon)?,
        RegPolicy::Bimodal => bimodal(state, blob.data(), step)?,
        RegPolicy::SignForcing { floor } => {
            sign_forcing(state, blob, step, floor);
            return Ok(());
        }
        RegPolicy::L2 | RegPolicy::L1 => {}
    }

    // Broadcast the accumulated multiplier across each unit's weights.
    let (w, d) = blob.data_and_diff_mut();
    for u in 0..state.unit_count() {
        let m = state.scratch.mult[u];
        if m != 0.0 {
            state.for_unit_weights(u, |i| d[i] += m * w[i]);
        }
    }
    Ok(())
}

fn apply_base_decay(blob: &mut ParamBlob, policy: RegPolicy, local_decay: f32) {
    if local_decay == 0.0 {
        return;
    }
    let (w, d) = blob.data_and_diff_mut();
    if policy == RegPolicy::L1 {
        for i in 0..w.len() {
            d[i] += local_decay * w[i].signum();
        }
    } else {
        for i in 0..w.len() {
            d[i] += local_decay * w[i];
        }
    }
}

/// Active-unit count and units still to prune before the target is met.
fn active_counts(state: &LayerState) -> Result<(usize, usize), PruneError> {
    let units = state.unit_count();
    let n_active = (0..units).filter(|&u| !state.is_unit_pruned(u)).count();
    let remaining = state.target_units().saturating_sub(units - n_active);
    if remaining == 0 {
        // the penalty curves divide by this count
        return Err(PruneError::NothingToPrune {
            layer: state.name.clone(),
        });
    }
    Ok((n_active, remaining))
}

/// Accumulate `delta` into a unit's regularization history, clamped to the
/// cap, returning the new value.
fn bump(state: &mut LayerState, u: usize, delta: f32) -> f32 {
    let new = (state.history_reg[u] + delta).clamp(0.0, state.config.target_reg);
    state.history_reg[u] = new;
    new
}

fn rank_curve(
    state: &mut LayerState,
    data: &[f32],
    step: u64,
    scheme: CurveScheme,
) -> Result<(), PruneError> {
    let (n_active, remaining) = active_counts(state)?;
    rank::update_history_rank(state, data, step);
    rank::order_by_history_rank(state, PrunedEnd::Front);
    let aa = state.config.effective_aa(step);
    let front = state.unit_count() - n_active;

    let mut scratch = std::mem::take(&mut state.scratch);
    match scheme {
        CurveScheme::Mirror { kk } => {
            let alpha = (2.0 / kk).ln() / (remaining + 1) as f32;
            let n1 = -kk.ln() / alpha;
            for rk in 0..n_active {
                let u = scratch.order[front + rk];
                let r = rk as f32;
                let delta = if r < n1 {
                    aa * (-alpha * r).exp()
                } else {
                    -aa * (-alpha * (2.0 * n1 - r)).exp() + 2.0 * kk * aa
                };
                scratch.mult[u] = bump(state, u, delta);
            }
        }
        CurveScheme::TwoSegment { kk2 } => {
            let alpha1 = if remaining == 1 {
                0.0
            } else {
                (1.0 / kk2).ln() / (remaining - 1) as f32
            };
            let spared = n_active.saturating_sub(1).saturating_sub(remaining);
            let alpha2 = if spared == 0 {
                0.0
            } else {
                (1.0 / kk2).ln() / spared as f32
            };
            for rk in 0..n_active {
                let u = scratch.order[front + rk];
                let delta = if rk < remaining {
                    aa * (-alpha1 * rk as f32).exp()
                } else {
                    -aa * (-alpha2 * (n_active - 1 - rk) as f32).exp()
                };
                scratch.mult[u] = bump(state, u, delta);
            }
        }
    }
    state.scratch = scratch;
    Ok(())
}

fn score_gap(state: &mut LayerState, data: &[f32], step: u64) -> Result<(), PruneError> {
    let (n_active, remaining) = active_counts(state)?;
    rank::order_by_score(state, data);
    let aa = state.config.effective_aa(step);
    // boundary unit: delta is fitted to be exactly zero there
    let boundary = remaining.min(n_active - 1);

    let mut scratch = std::mem::take(&mut state.scratch);
    let s0 = scratch.pairs[0].0;
    let sb = scratch.pairs[boundary].0;
    let k = if sb - s0 > 0.0 { aa / (sb - s0) } else { 0.0 };
    for rk in 0..n_active {
        let (s, u) = scratch.pairs[rk];
        let delta = aa - k * (s - s0);
        scratch.mult[u] = bump(state, u, delta);
    }
    state.scratch = scratch;
    Ok(())
}

fn budgeted(
    state: &mut LayerState,
    data: &[f32],
    step: u64,
    horizon: u64,
) -> Result<(), PruneError> {
    if step >= horizon {
        return Err(PruneError::ScheduleExhausted {
            layer: state.name.clone(),
            step,
            horizon,
        });
    }
    let (n_active, remaining) = active_counts(state)?;
    // budgeted ranks run strongest-first, so the weakest units carry the
    // largest smoothed ranks and the to-prune zone is the sorted tail
    rank::update_history_rank_inverted(state, data, step);
    rank::order_by_history_rank(state, PrunedEnd::Back);

    let target = state.target_units();
    let target_reg = state.config.target_reg;
    let iters_left = (horizon - step) as f32;
    let zone_start = n_active - remaining;

    // Spend the remaining budget linearly down to zero over the horizon;
    // the quota for this step is the head of that ramp.
    let quota_end = state.reg_to_distribute * 2.0 / iters_left / (remaining + 1) as f32;
    let d = if iters_left > 1.0 {
        (remaining - 1) as f32 * quota_end / (iters_left - 1.0)
    } else {
        0.0
    };
    let quota_now = (remaining - 1) as f32 * d + quota_end;

    let mut scratch = std::mem::take(&mut state.scratch);
    let hrank_sum: f32 = scratch.pairs[zone_start..n_active].iter().map(|p| p.0).sum();
    let k = if hrank_sum > 0.0 {
        quota_now / hrank_sum
    } else {
        0.0
    };

    let mut reg_sum = 0.0;
    for rk in zone_start..n_active {
        let (h, u) = scratch.pairs[rk];
        let new = bump(state, u, k * h);
        reg_sum += new;
        scratch.mult[u] = new;
    }
    state.reg_to_distribute = target as f32 * target_reg - reg_sum;

    if zone_start > 0 {
        let boundary_key = scratch.pairs[zone_start - 1].0;
        for rk in 0..zone_start {
            let (h, u) = scratch.pairs[rk];
            // negative delta: spared units are relieved toward zero
            scratch.mult[u] = bump(state, u, k * (h - boundary_key));
        }
    }
    state.scratch = scratch;
    Ok(())
}

fn bimodal(state: &mut LayerState, data: &[f32], step: u64) -> Result<(), PruneError> {
    active_counts(state)?;
    let aa = state.config.effective_aa(step);
    let ratio = state.config.prune_ratio;

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for u in 0..state.unit_count() {
        if state.is_unit_pruned(u) {
            continue;
        }
        let s = data[u].abs();
        min = min.min(s);
        max = max.max(s);
    }
    if !(max > min) {
        return Ok(()); // degenerate spread, nothing to separate
    }

    // Threshold from a normal fit: mean at the midpoint, all weights
    // assumed inside a 4-sigma envelope. The z table covers half the
    // distribution, so ratios below 0.5 mirror around the mean.
    let mean = (max + min) / 2.0;
    let sigma = (max - min) / 8.0;
    let pr = if ratio < 0.5 { 1.0 - ratio } else { ratio };
    let normalized = (pr / 0.05).round() * 0.05;
    let idx = (((normalized - 0.5) / 0.05).round() as usize).min(NORMAL_Z.len() - 1);
    let thr = if ratio > 0.5 {
        mean + NORMAL_Z[idx] * sigma
    } else {
        mean - NORMAL_Z[idx] * sigma
    };

    let k1 = if thr - min > 0.0 { aa / (thr - min) } else { 0.0 };
    let k2 = if max - thr > 0.0 { aa / (max - thr) } else { 0.0 };

    let mut scratch = std::mem::take(&mut state.scratch);
    for u in 0..state.unit_count() {
        if state.is_unit_pruned(u) {
            continue;
        }
        let s = data[u].abs();
        let delta = if s < thr {
            aa - k1 * (s - min)
        } else {
            k2 * (thr - s)
        };
        scratch.mult[u] = bump(state, u, delta);
    }
    state.scratch = scratch;
    Ok(())
}

fn sign_forcing(state: &LayerState, blob: &mut ParamBlob, step: u64, floor: f32) {
    let aa = state.config.effective_aa(step);
    let (w, d) = blob.data_and_diff_mut();
    for i in 0..w.len() {
        let target = if w[i] < 0.0 { floor } else { 0.0 };
        // weakest weights are pushed hardest
        let rate = aa / (w[i].abs() + 1e-6);
        d[i] += rate * (w[i] - target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerConfig, PruneMode, RankSmoothing};
    use crate::store::PruneStore;

    fn setup(data: &[f32], shape: &[usize], cfg: LayerConfig) -> (PruneStore, ParamBlob) {
        let blob = ParamBlob::new(data, shape);
        let mut store = PruneStore::new();
        store.register("l", &blob, cfg).unwrap();
        (store, blob)
    }

    #[test]
    fn test_l2_baseline_decay() {
        let cfg = LayerConfig::new(0.0).with_policy(RegPolicy::L2).with_decay(0.1);
        let (mut store, mut blob) = setup(&[1.0, -2.0, 3.0, -4.0], &[2, 2], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        assert!((blob.diff()[0] - 0.1).abs() < 1e-6);
        assert!((blob.diff()[1] + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_l1_baseline_uses_sign() {
        let cfg = LayerConfig::new(0.0).with_policy(RegPolicy::L1).with_decay(0.1);
        let (mut store, mut blob) = setup(&[1.0, -2.0, 3.0, -4.0], &[2, 2], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        assert!((blob.diff()[0] - 0.1).abs() < 1e-6);
        assert!((blob.diff()[1] + 0.1).abs() < 1e-6);
        assert!((blob.diff()[3] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_bias_blob_is_silent_noop() {
        let cfg = LayerConfig::new(0.5).with_decay(0.0);
        let (mut store, _) = setup(&[1.0; 8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();
        let mut bias = ParamBlob::new(&[0.5, 0.5], &[2]);

        regularize(store.get_mut(id), &mut bias, 0, 1.0).unwrap();
        assert!(bias.diff().iter().all(|&d| d == 0.0));
        assert!(store.get(id).history_reg.iter().all(|&r| r == 0.0));
    }

    #[test]
    fn test_finished_layer_is_noop() {
        let cfg = LayerConfig::new(0.5).with_decay(0.0);
        let (mut store, mut blob) = setup(&[1.0, 0.2, 3.0, 1.0, 0.2, 3.0], &[2, 3], cfg);
        let id = store.lookup("l").unwrap();
        store.get_mut(id).finished_at_step = Some(5);

        regularize(store.get_mut(id), &mut blob, 6, 1.0).unwrap();
        assert!(
            store.get(id).history_reg.iter().all(|&r| r == 0.0),
            "REG-01 FALSIFIED: finished layer accumulated regularization"
        );
    }

    // ==========================================================================
    // FALSIFICATION TEST: Mirrored curve hits the weakest unit hardest
    // Popper: "If the strongest unit receives a larger delta than the
    //          weakest, the penalty curve is inverted"
    // ==========================================================================
    #[test]
    fn test_rank_curve_mirror_shape() {
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_reg_limits(0.1, 10.0);
        // column sums ascending: c0 weakest ... c3 strongest
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        let state = store.get(id);
        // kk = 0.25, remaining = 2: alpha = ln(8)/3, N1 = 2
        let aa = 0.1_f32;
        let alpha = (8.0_f32).ln() / 3.0;
        assert!((state.history_reg[0] - aa).abs() < 1e-6);
        assert!((state.history_reg[1] - aa * (-alpha).exp()).abs() < 1e-6);
        // rank 3 sits exactly where the mirrored curve returns to zero
        assert!(state.history_reg[3].abs() < 1e-6);
        assert!(state.history_reg[0] > state.history_reg[3]);
    }

    #[test]
    fn test_rank_curve_two_segment_sign_flip() {
        let cfg = LayerConfig::new(0.25)
            .with_decay(0.0)
            .with_policy(RegPolicy::RankCurve {
                scheme: CurveScheme::TwoSegment { kk2: 0.1 },
            })
            .with_reg_limits(0.1, 10.0);
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();

        // seed some accumulated reg so negative deltas are observable
        for r in &mut store.get_mut(id).history_reg {
            *r = 0.05;
        }
        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        let state = store.get(id);
        // remaining = 1: only rank 0 is in the to-prune zone
        assert!(state.history_reg[0] > 0.05, "to-prune zone must gain reg");
        assert!(state.history_reg[3] < 0.05, "spared zone must lose reg");
    }

    #[test]
    fn test_history_reg_clamped_to_target() {
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_reg_limits(0.6, 1.0);
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();

        for step in 0..5 {
            regularize(store.get_mut(id), &mut blob, step, 1.0).unwrap();
        }
        let state = store.get(id);
        assert!(
            state.history_reg.iter().all(|&r| r <= 1.0 + 1e-6),
            "REG-02 FALSIFIED: history_reg exceeded target cap"
        );
        assert!((state.history_reg[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_score_gap_boundary_delta_is_zero() {
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_policy(RegPolicy::ScoreGap)
            .with_reg_limits(0.1, 10.0);
        let (mut store, mut blob) = setup(&[0.1, 0.4, 1.0, 2.0], &[1, 4], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        let state = store.get(id);
        // k fitted so the unit at rank `remaining` gets exactly zero
        assert!((state.history_reg[0] - 0.1).abs() < 1e-6);
        assert!(state.history_reg[2].abs() < 1e-6);
        // beyond the boundary the delta is negative and clamps at zero
        assert!(state.history_reg[3].abs() < 1e-6);
    }

    #[test]
    fn test_budgeted_carries_remainder() {
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_policy(RegPolicy::Budgeted { horizon: 100 })
            .with_reg_limits(0.1, 1.0);
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        let state = store.get(id);
        let target = state.target_units() as f32;
        let zone_sum: f32 = state.history_reg[0] + state.history_reg[1];
        assert!(
            (state.reg_to_distribute - (target * 1.0 - zone_sum)).abs() < 1e-5,
            "REG-03 FALSIFIED: budget carry must equal allocation minus spend"
        );
    }

    #[test]
    fn test_budgeted_past_horizon_is_fatal() {
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_policy(RegPolicy::Budgeted { horizon: 10 });
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();

        let err = regularize(store.get_mut(id), &mut blob, 10, 1.0).unwrap_err();
        assert!(matches!(err, PruneError::ScheduleExhausted { .. }));
    }

    #[test]
    fn test_nothing_left_to_prune_is_fatal() {
        let cfg = LayerConfig::new(0.25).with_decay(0.0);
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();

        // target is 1 column; prune it by hand without finishing the layer
        store.get_mut(id).prune_unit(0, blob.data_mut(), 0);
        let err = regularize(store.get_mut(id), &mut blob, 1, 1.0).unwrap_err();
        assert!(
            matches!(err, PruneError::NothingToPrune { .. }),
            "REG-04 FALSIFIED: degenerate to-prune count must abort, got Ok"
        );
    }

    #[test]
    fn test_bimodal_penalizes_below_threshold() {
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_unit(PruneUnit::Weight)
            .with_policy(RegPolicy::Bimodal)
            .with_reg_limits(0.1, 10.0);
        let (mut store, mut blob) =
            setup(&[0.01, 0.02, 0.05, 0.9, 0.95, 1.0], &[1, 6], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        let state = store.get(id);
        assert!(state.history_reg[0] > 0.0);
        assert!(
            state.history_reg[0] > state.history_reg[5],
            "REG-05 FALSIFIED: small weights must be penalized harder"
        );
    }

    #[test]
    fn test_sign_forcing_pushes_toward_floor_and_zero() {
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_policy(RegPolicy::SignForcing { floor: -0.1 })
            .with_reg_limits(0.01, 1.0);
        let (mut store, mut blob) = setup(&[0.5, -0.05, -0.5, 0.2], &[2, 2], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        let d = blob.diff();
        // positive weight decays toward zero: positive gradient
        assert!(d[0] > 0.0);
        // -0.05 sits above the floor: pushed down toward -0.1
        assert!(d[1] > 0.0);
        // -0.5 sits below the floor: pushed up toward -0.1
        assert!(d[2] < 0.0);
    }

    #[test]
    fn test_gradient_contribution_is_mult_times_weight() {
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_reg_limits(0.1, 10.0);
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        let state = store.get(id);
        let expected = state.history_reg[0] * 0.1;
        assert!((blob.diff()[0] - expected).abs() < 1e-6);
        assert!((blob.diff()[4] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_ema_smoothing_selectable() {
        let mut cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_reg_limits(0.1, 10.0);
        cfg.smoothing = RankSmoothing::Ema { momentum: 0.99 };
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();

        regularize(store.get_mut(id), &mut blob, 0, 1.0).unwrap();
        let state = store.get(id);
        assert!((state.history_rank[3] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_deterministic_mode_config_unused_here() {
        // regularization is independent of the decision mode
        let cfg = LayerConfig::new(0.5)
            .with_decay(0.0)
            .with_mode(PruneMode::Deterministic { threshold: 0.2 })
            .with_reg_limits(0.1, 10.0);
        let (mut store, mut blob) = setup(&[0.1, 0.2, 0.4, 0.8, 0.1, 0.2, 0.4, 0.8], &[2, 4], cfg);
        let id = store.lookup("l").unwrap();
        assert!(regularize(store.get_mut(id), &mut blob, 0, 1.0).is_ok());
    }
}
