//! Human-readable diagnostics: per-tick ranked-unit tables.
//!
//! Not part of the persistent state and not required to be bit-exact; the
//! tables exist so a training log can show which units are headed for
//! removal and how much regularization they have absorbed.

use crate::config::PruneUnit;
use crate::store::{LayerId, PruneStore};
use std::fmt;

/// One ranked unit in a schedule report.
#[derive(Debug, Clone)]
pub struct UnitReport {
    /// Unit index within the layer
    pub unit: usize,
    /// Latest raw importance score
    pub score: f32,
    /// Smoothed rank (frozen sentinel once pruned)
    pub rank: f32,
    /// Accumulated regularization
    pub reg: f32,
    /// Functioning probability
    pub prob: f32,
    /// Whether the unit is permanently pruned
    pub pruned: bool,
}

/// Top-N ranked units of one layer at one step, weakest first.
#[derive(Debug, Clone)]
pub struct ScheduleReport {
    /// Layer name
    pub layer: String,
    /// Global step the report was taken at
    pub step: u64,
    /// Unit granularity (for the index prefix)
    pub unit_kind: PruneUnit,
    /// Ranked units, ascending by smoothed rank
    pub units: Vec<UnitReport>,
}

impl ScheduleReport {
    /// Collect the `top_n` weakest-ranked units of a layer.
    #[must_use]
    pub fn collect(store: &PruneStore, id: LayerId, top_n: usize) -> Self {
        let state = store.get(id);
        let mut order: Vec<usize> = (0..state.unit_count()).collect();
        order.sort_by(|&a, &b| {
            state.history_rank[a]
                .partial_cmp(&state.history_rank[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let units = order
            .into_iter()
            .take(top_n)
            .map(|u| UnitReport {
                unit: u,
                score: state.score[u],
                rank: state.history_rank[u],
                reg: state.history_reg[u],
                prob: state.history_prob[u],
                pruned: state.is_unit_pruned(u),
            })
            .collect();

        Self {
            layer: state.name.clone(),
            step: store.step(),
            unit_kind: state.config.unit,
            units,
        }
    }
}

impl fmt::Display for ScheduleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.unit_kind {
            PruneUnit::Weight => 'w',
            PruneUnit::Row => 'r',
            PruneUnit::Col => 'c',
        };
        writeln!(
            f,
            "step {:>6}  {}  Index      Score   Mask  HistoryReg    Prob",
            self.step, self.layer
        )?;
        for u in &self.units {
            writeln!(
                f,
                "{:>12}  {}  {}{:<5} {:>10.5}   {:>4} {:>11.5} {:>7.4}",
                "",
                self.layer,
                prefix,
                u.unit + 1,
                u.score,
                if u.pruned { 0 } else { 1 },
                u.reg,
                u.prob,
            )?;
        }
        Ok(())
    }
}
