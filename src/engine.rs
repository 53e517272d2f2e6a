//! Step orchestration.
//!
//! [`PruneEngine`] owns the shared store and drives the fixed per-step
//! order: queue-empty assertion → score/rank update and regularization
//! (merged into the external gradient) → external momentum update →
//! mask re-application → pruning decisions on the schedule boundary →
//! cross-layer propagation → finish checks.
//!
//! All mutation happens through `&mut self`, keeping the single-writer
//! model: data-parallel replicas must route their regularization merge
//! through the one engine owner.

use crate::blob::ParamBlob;
use crate::config::{DecayMode, LayerConfig, PruneMode};
use crate::error::PruneError;
use crate::snapshot;
use crate::store::{LayerId, PruneStore};
use crate::{decide, gate, propagate, reg};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// What a schedule tick did.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSummary {
    /// Units pruned by threshold/probability decisions
    pub pruned_units: usize,
    /// Queue entries that propagated into a successor
    pub propagated: usize,
    /// Upstream rows removed by the backward pass
    pub backfilled: usize,
    /// Whether every registered layer is now finished
    pub all_finished: bool,
}

/// Owner of the pruning state and driver of the per-step sequence.
#[derive(Debug)]
pub struct PruneEngine {
    store: PruneStore,
    chain: Vec<LayerId>,
    decay_mode: DecayMode,
    rng: StdRng,
}

impl PruneEngine {
    /// Engine with an entropy-seeded RNG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: PruneStore::new(),
            chain: Vec::new(),
            decay_mode: DecayMode::None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Engine with a fixed RNG seed, for reproducible probabilistic runs.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            store: PruneStore::new(),
            chain: Vec::new(),
            decay_mode: DecayMode::None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Select a decreasing-weight-decay schedule.
    #[must_use]
    pub fn with_decay_mode(mut self, mode: DecayMode) -> Self {
        self.decay_mode = mode;
        self
    }

    /// Register a layer in feed-forward declaration order.
    pub fn register(
        &mut self,
        name: &str,
        blob: &ParamBlob,
        config: LayerConfig,
    ) -> Result<LayerId, PruneError> {
        let id = self.store.register(name, blob, config)?;
        if !self.chain.contains(&id) {
            self.chain.push(id);
        }
        Ok(id)
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> &PruneStore {
        &self.store
    }

    /// Exclusive access to the shared store.
    pub fn store_mut(&mut self) -> &mut PruneStore {
        &mut self.store
    }

    /// Registered layers in feed-forward order.
    #[must_use]
    pub fn chain(&self) -> &[LayerId] {
        &self.chain
    }

    /// Begin a new optimization step: assert the propagation queue was
    /// drained and advance the global counter.
    pub fn step_begin(&mut self) -> Result<u64, PruneError> {
        self.store.ensure_drained()?;
        Ok(self.store.advance_step())
    }

    /// Baseline-decay scale for the current step.
    #[must_use]
    pub fn decay_scale(&self) -> f32 {
        let step = self.store.step();
        match self.decay_mode {
            DecayMode::None => 1.0,
            DecayMode::Linear { begin, end, wd_end } => {
                if step < begin || end <= begin {
                    1.0
                } else {
                    let t = (step.min(end) - begin) as f32;
                    1.0 - (1.0 - wd_end) / (end - begin) as f32 * t
                }
            }
            DecayMode::StepLinear {
                begin,
                end,
                wd_end,
                stride,
            } => {
                if step < begin || end <= begin || stride == 0 {
                    1.0
                } else {
                    let t = ((step.min(end) - begin) / stride * stride) as f32;
                    1.0 - (1.0 - wd_end) / (end - begin) as f32 * t
                }
            }
            DecayMode::Adaptive {
                wd_end,
                max_cols_to_prune,
            } => {
                if max_cols_to_prune == 0 {
                    1.0
                } else {
                    let progress = self.store.max_pruned_cols() / max_cols_to_prune as f32;
                    (1.0 - (1.0 - wd_end) * progress).max(wd_end.min(1.0))
                }
            }
        }
    }

    /// Rank, score, and merge the regularization term into the layer's
    /// gradient buffer.
    pub fn regularize(&mut self, id: LayerId, blob: &mut ParamBlob) -> Result<(), PruneError> {
        let scale = self.decay_scale();
        let step = self.store.step();
        reg::regularize(self.store.get_mut(id), blob, step, scale)
    }

    /// Re-apply the permanent mask to weights and (optionally) to the
    /// external momentum buffer after the optimizer update.
    pub fn post_update(
        &mut self,
        id: LayerId,
        blob: &mut ParamBlob,
        momentum: Option<&mut [f32]>,
    ) -> Result<(), PruneError> {
        let state = self.store.get(id);
        if blob.is_bias() && blob.count() != state.count() {
            return Ok(());
        }
        gate::mask_weights(state, blob)?;
        if let Some(m) = momentum {
            gate::mask_momentum(state, m)?;
        }
        Ok(())
    }

    /// Run pruning decisions, cross-layer propagation, and finish checks
    /// for the current step. `blobs` is parallel to [`PruneEngine::chain`].
    ///
    /// Deterministic layers decide every `prune_interval` steps;
    /// probabilistic layers run every step (their own draws gate the
    /// probability update, and mask sampling is per-step by design).
    pub fn schedule_tick(&mut self, blobs: &mut [ParamBlob]) -> Result<TickSummary, PruneError> {
        if blobs.len() != self.chain.len() {
            return Err(PruneError::ShapeMismatch {
                expected: vec![self.chain.len()],
                got: vec![blobs.len()],
            });
        }
        let step = self.store.step();
        let mut pruned_units = 0;

        for (k, &id) in self.chain.iter().enumerate() {
            let (finished, ratio, begin, mode, interval) = {
                let st = self.store.get(id);
                (
                    st.is_finished(),
                    st.config.prune_ratio,
                    st.config.begin_step,
                    st.config.mode,
                    st.config.prune_interval,
                )
            };
            if finished || ratio <= 0.0 || step < begin {
                continue;
            }
            if !self.store.higher_priority_finished(id) {
                continue;
            }
            match mode {
                PruneMode::Probabilistic(_) => {
                    decide::prob_step(&mut self.store, id, &mut blobs[k], &mut self.rng, step)?;
                }
                PruneMode::Deterministic { .. } => {
                    if step % interval == 0 {
                        pruned_units +=
                            decide::prune_minimals(&mut self.store, id, &mut blobs[k], step)?;
                    }
                }
            }
        }

        let propagated = propagate::drain(&mut self.store, &self.chain, blobs)?;
        let backfilled = propagate::backfill(&mut self.store, &self.chain, blobs, step)?;

        for (k, &id) in self.chain.iter().enumerate() {
            decide::finish_check(&mut self.store, id, &mut blobs[k], step)?;
        }
        self.store.ensure_drained()?;

        Ok(TickSummary {
            pruned_units,
            propagated,
            backfilled,
            all_finished: self.store.all_finished(),
        })
    }

    /// Rebuild one layer's masks and counters from a restored weight blob.
    pub fn restore_layer(&mut self, id: LayerId, blob: &ParamBlob) -> Result<(), PruneError> {
        decide::restore_from_weights(&mut self.store, id, blob)
    }

    /// Serialize the full pruning state.
    pub fn snapshot_json(&self) -> Result<String, PruneError> {
        snapshot::to_json(&self.store)
    }

    /// Replace the pruning state from a snapshot; the chain is rebuilt in
    /// registration order.
    pub fn restore_json(&mut self, json: &str) -> Result<(), PruneError> {
        let store = snapshot::from_json(json)?;
        self.chain = (0..store.len()).map(LayerId).collect();
        self.store = store;
        Ok(())
    }
}

impl Default for PruneEngine {
    fn default() -> Self {
        Self::new()
    }
}
