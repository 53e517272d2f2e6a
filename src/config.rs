//! Per-layer pruning configuration: unit granularity, policy selection,
//! penalty-curve constants, and schedule bounds.
//!
//! The policy family is a closed tagged enum rather than runtime string
//! dispatch, so an impossible policy is unrepresentable and the compiler
//! checks dispatch exhaustiveness. The string front end still exists for
//! configuration files; an unrecognized name is a fatal
//! [`PruneError::UnknownPolicy`].
//!
//! # References
//! - Wang, H., et al. (2019). Structured pruning for efficient ConvNets
//!   via incremental regularization. IJCNN.
//! - Wang, H., et al. (2018). Structured probabilistic pruning for deep
//!   convolutional neural network acceleration. BMVC.

use crate::error::PruneError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Pruning granularity: individual weight, output row, or input column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruneUnit {
    /// Individual weights (unstructured).
    Weight,
    /// Entire rows — output channels / neurons.
    Row,
    /// Entire columns — flattened input features.
    Col,
}

impl PruneUnit {
    /// Number of structural units in a (rows, cols) tensor.
    #[must_use]
    pub fn count(&self, rows: usize, cols: usize) -> usize {
        match self {
            PruneUnit::Weight => rows * cols,
            PruneUnit::Row => rows,
            PruneUnit::Col => cols,
        }
    }
}

/// Shape of the rank-driven penalty curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CurveScheme {
    /// Continuous curve: exponential decay over the to-prune zone that
    /// mirrors past the symmetry point `N1 = -ln(kk)/alpha` and asymptotes
    /// toward `2*kk*AA`.
    Mirror {
        /// Curve value (relative to AA) at the symmetry point
        kk: f32,
    },
    /// Two independent exponential segments with a sign flip at the zone
    /// boundary; each segment's decay constant is fitted so the curve
    /// reaches `kk2*AA` at its boundary.
    TwoSegment {
        /// Curve value (relative to AA) at each zone boundary
        kk2: f32,
    },
}

/// Regularization policy family. One per layer, mutually exclusive.
///
/// Every variant is additive to the baseline decay term and applies only
/// while the layer is registered, unfinished, and (for structural units)
/// not a bias blob.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RegPolicy {
    /// Plain L2 weight decay, no per-unit differentiation.
    L2,
    /// Plain L1 decay: `diff += decay * sign(w)`.
    L1,
    /// Rank-driven exponential penalty over the smoothed rank axis.
    RankCurve {
        /// Penalty curve shape
        scheme: CurveScheme,
    },
    /// Score-magnitude penalty: delta linear in the raw score gap from the
    /// weakest unit, zero exactly at the boundary unit.
    ScoreGap,
    /// Budget-distributed penalty: a fixed total regularization budget
    /// spent over a fixed number of iterations, remainder carried forward.
    Budgeted {
        /// Global step by which the budget must be fully distributed
        horizon: u64,
    },
    /// Two-sided linear ramp around a normal-distribution threshold
    /// estimated from a fixed percentile table. Weight-unit only.
    Bimodal,
    /// Push negative weights toward `floor` and positive weights toward
    /// zero, at a rate inversely proportional to magnitude.
    SignForcing {
        /// Target value for negative weights
        floor: f32,
    },
}

impl FromStr for RegPolicy {
    type Err = PruneError;

    /// Map the configuration-file policy names onto the closed family.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L2" => Ok(RegPolicy::L2),
            "L1" => Ok(RegPolicy::L1),
            "Reg-rank" => Ok(RegPolicy::RankCurve {
                scheme: CurveScheme::Mirror { kk: 0.25 },
            }),
            "Reg-rank2" => Ok(RegPolicy::RankCurve {
                scheme: CurveScheme::TwoSegment { kk2: 0.1 },
            }),
            "Reg-L1" => Ok(RegPolicy::ScoreGap),
            "OptimalReg" => Ok(RegPolicy::Budgeted { horizon: 10_000 }),
            "Reg_Weight" => Ok(RegPolicy::Bimodal),
            "SignForcing" => Ok(RegPolicy::SignForcing { floor: -0.1 }),
            other => Err(PruneError::UnknownPolicy {
                name: other.to_string(),
            }),
        }
    }
}

/// Curve used to decrement functioning probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbCurve {
    /// Same mirrored exponential as the rank penalty curve.
    Mirror,
    /// Linear punishment: `delta = AA - k * rank`.
    Linear,
}

/// Parameters of the probabilistic decider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbParams {
    /// Recovery draw base; recovery is disabled when <= 0
    pub rgamma: f32,
    /// Recovery draw exponent
    pub rpower: f32,
    /// Prune draw base (ignored when `interval` is set)
    pub cgamma: f32,
    /// Prune draw exponent
    pub cpower: f32,
    /// Fixed stride between probability updates, replacing the prune draw
    pub interval: Option<u64>,
    /// Probability decrement curve shape
    pub curve: ProbCurve,
    /// Curve constant of the mirrored decrement (symmetry-point value
    /// relative to AA)
    pub kk: f32,
    /// Overshoot margin added to the prune ratio so the stochastic target
    /// sits slightly past the deterministic one
    pub margin: f32,
    /// EMA factor for the decayed history score driving the ranking
    pub score_decay: f32,
}

impl Default for ProbParams {
    fn default() -> Self {
        Self {
            rgamma: 0.0,
            rpower: 1.0,
            cgamma: 0.0,
            cpower: 1.0,
            interval: Some(1),
            curve: ProbCurve::Mirror,
            kk: 0.25,
            margin: 0.0,
            score_decay: 0.88,
        }
    }
}

/// Pruning decision mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PruneMode {
    /// A unit is pruned when its mean absolute magnitude falls below
    /// `threshold` or its accumulated regularization reaches the cap.
    Deterministic {
        /// Mean-absolute-magnitude floor
        threshold: f32,
    },
    /// Per-unit functioning probabilities with stochastic masking and
    /// recovery; probability 0 is a permanent prune.
    Probabilistic(ProbParams),
}

/// History-rank smoothing rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RankSmoothing {
    /// Running mean over the 1-based step count:
    /// `h = ((n-1)*h + rank) / n`.
    RunningMean,
    /// Exponential moving average with a fixed momentum constant; no drift
    /// correction. Preferred for long schedules.
    Ema {
        /// Smoothing momentum in (0, 1)
        momentum: f32,
    },
}

/// Baseline weight-decay schedule (decrease-weight-decay modes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DecayMode {
    /// Constant baseline decay.
    None,
    /// Linear interpolation from `decay` at `begin` to `decay * wd_end`
    /// at `end`.
    Linear {
        /// First step of the ramp
        begin: u64,
        /// Last step of the ramp
        end: u64,
        /// Final decay as a fraction of the base value
        wd_end: f32,
    },
    /// Same ramp, quantized to `stride`-sized plateaus.
    StepLinear {
        /// First step of the ramp
        begin: u64,
        /// Last step of the ramp
        end: u64,
        /// Final decay as a fraction of the base value
        wd_end: f32,
        /// Plateau width in steps
        stride: u64,
    },
    /// Ramp driven by pruning progress instead of the step counter.
    Adaptive {
        /// Final decay as a fraction of the base value
        wd_end: f32,
        /// Column count at which the ramp bottoms out
        max_cols_to_prune: usize,
    },
}

/// Per-layer pruning and regularization configuration.
///
/// Constructed with [`LayerConfig::new`] and the `with_*` builders, then
/// validated at registration. Numeric constants follow the external
/// front end's names: `aa` is the maximum per-step delta magnitude,
/// `target_reg` the accumulated-regularization cap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Target fraction of units to remove
    pub prune_ratio: f32,
    /// Granularity being pruned
    pub unit: PruneUnit,
    /// Regularization policy
    pub policy: RegPolicy,
    /// Decision mode
    pub mode: PruneMode,
    /// History-rank smoothing rule
    pub smoothing: RankSmoothing,
    /// Maximum per-step regularization delta
    pub aa: f32,
    /// Accumulated-regularization cap; reaching it prunes the unit
    pub target_reg: f32,
    /// Baseline weight decay
    pub decay: f32,
    /// Steps between pruning decisions
    pub prune_interval: u64,
    /// First step at which this layer participates
    pub begin_step: u64,
    /// Steps over which `aa` ramps up from zero (0 disables the ramp)
    pub reg_cushion: u64,
    /// Ordering constraint: lower priorities must finish first
    pub priority: i32,
    /// Grouped-convolution factor
    pub group: usize,
    /// Kernel spatial extent, used by cross-layer translation
    pub kernel_area: usize,
}

impl LayerConfig {
    /// Configuration with the given target ratio and defaults everywhere
    /// else: column unit, mirrored rank curve, deterministic decisions.
    #[must_use]
    pub fn new(prune_ratio: f32) -> Self {
        Self {
            prune_ratio,
            unit: PruneUnit::Col,
            policy: RegPolicy::RankCurve {
                scheme: CurveScheme::Mirror { kk: 0.25 },
            },
            mode: PruneMode::Deterministic { threshold: 1e-4 },
            smoothing: RankSmoothing::RunningMean,
            aa: 1e-4,
            target_reg: 1.0,
            decay: 5e-4,
            prune_interval: 1,
            begin_step: 0,
            reg_cushion: 0,
            priority: 0,
            group: 1,
            kernel_area: 1,
        }
    }

    /// Set the pruning granularity.
    #[must_use]
    pub fn with_unit(mut self, unit: PruneUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Set the regularization policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RegPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the decision mode.
    #[must_use]
    pub fn with_mode(mut self, mode: PruneMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the history-rank smoothing rule.
    #[must_use]
    pub fn with_smoothing(mut self, smoothing: RankSmoothing) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Set the per-step delta magnitude and the accumulation cap.
    #[must_use]
    pub fn with_reg_limits(mut self, aa: f32, target_reg: f32) -> Self {
        self.aa = aa;
        self.target_reg = target_reg;
        self
    }

    /// Set the baseline weight decay.
    #[must_use]
    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    /// Set the decision stride.
    #[must_use]
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Set the first participating step.
    #[must_use]
    pub fn with_begin_step(mut self, begin: u64) -> Self {
        self.begin_step = begin;
        self
    }

    /// Set the layer priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the grouped-convolution factor and kernel spatial extent.
    #[must_use]
    pub fn with_geometry(mut self, group: usize, kernel_area: usize) -> Self {
        self.group = group;
        self.kernel_area = kernel_area;
        self
    }

    /// Validate the configuration against a (rows, cols) tensor view.
    ///
    /// Invalid bounds and missing-parameter combinations are fatal; this
    /// runs once at registration, before any state is created.
    pub fn validate(&self, rows: usize, cols: usize) -> Result<(), PruneError> {
        if !(0.0..=1.0).contains(&self.prune_ratio) {
            return Err(PruneError::InvalidConfig {
                field: "prune_ratio",
                value: self.prune_ratio,
                constraint: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.target_reg <= 0.0 {
            return Err(PruneError::InvalidConfig {
                field: "target_reg",
                value: self.target_reg,
                constraint: "must be positive".to_string(),
            });
        }
        if self.group == 0 || (rows > 0 && rows % self.group != 0) {
            return Err(PruneError::InvalidConfig {
                field: "group",
                value: self.group as f32,
                constraint: format!("must be >= 1 and divide the row count {rows}"),
            });
        }
        if self.kernel_area == 0 || (cols > 0 && cols % self.kernel_area != 0) {
            return Err(PruneError::InvalidConfig {
                field: "kernel_area",
                value: self.kernel_area as f32,
                constraint: format!("must be >= 1 and divide the fan-in {cols}"),
            });
        }
        if self.prune_interval == 0 {
            return Err(PruneError::InvalidConfig {
                field: "prune_interval",
                value: 0.0,
                constraint: "must be >= 1".to_string(),
            });
        }
        match self.policy {
            RegPolicy::RankCurve {
                scheme: CurveScheme::Mirror { kk },
            } => {
                if kk <= 0.0 || kk >= 2.0 {
                    return Err(PruneError::InvalidConfig {
                        field: "kk",
                        value: kk,
                        constraint: "must lie in (0, 2) for the mirrored curve".to_string(),
                    });
                }
                self.check_aa()?;
            }
            RegPolicy::RankCurve {
                scheme: CurveScheme::TwoSegment { kk2 },
            } => {
                if kk2 <= 0.0 || kk2 >= 1.0 {
                    return Err(PruneError::InvalidConfig {
                        field: "kk2",
                        value: kk2,
                        constraint: "must lie in (0, 1) for the two-segment curve".to_string(),
                    });
                }
                self.check_aa()?;
            }
            RegPolicy::ScoreGap | RegPolicy::Budgeted { .. } | RegPolicy::SignForcing { .. } => {
                self.check_aa()?;
            }
            RegPolicy::Bimodal => {
                self.check_aa()?;
                if self.unit != PruneUnit::Weight {
                    return Err(PruneError::InvalidConfig {
                        field: "unit",
                        value: 0.0,
                        constraint: "Bimodal policy requires the Weight unit".to_string(),
                    });
                }
            }
            RegPolicy::L2 | RegPolicy::L1 => {}
        }
        if let PruneMode::Probabilistic(pp) = self.mode {
            if !(0.0..1.0).contains(&pp.score_decay) {
                return Err(PruneError::InvalidConfig {
                    field: "score_decay",
                    value: pp.score_decay,
                    constraint: "must lie in [0, 1)".to_string(),
                });
            }
            if pp.interval.is_none() && pp.cgamma <= 0.0 {
                return Err(PruneError::InvalidConfig {
                    field: "cgamma",
                    value: pp.cgamma,
                    constraint: "adaptive probabilistic schedule requires cgamma > 0".to_string(),
                });
            }
        }
        if let RankSmoothing::Ema { momentum } = self.smoothing {
            if !(0.0..1.0).contains(&momentum) {
                return Err(PruneError::InvalidConfig {
                    field: "momentum",
                    value: momentum,
                    constraint: "must lie in [0, 1)".to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_aa(&self) -> Result<(), PruneError> {
        if self.aa <= 0.0 {
            return Err(PruneError::InvalidConfig {
                field: "aa",
                value: self.aa,
                constraint: "curve policies require aa > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Effective delta magnitude at `step`, honoring the cushion ramp.
    #[must_use]
    pub fn effective_aa(&self, step: u64) -> f32 {
        if self.reg_cushion > 0 && step < self.reg_cushion {
            (step + 1) as f32 / self.reg_cushion as f32 * self.aa
        } else {
            self.aa
        }
    }
}
