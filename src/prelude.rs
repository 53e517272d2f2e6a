//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use podar::prelude::*;
//! ```

pub use crate::blob::ParamBlob;
pub use crate::config::{
    CurveScheme, DecayMode, LayerConfig, ProbCurve, ProbParams, PruneMode, PruneUnit,
    RankSmoothing, RegPolicy,
};
pub use crate::engine::{PruneEngine, TickSummary};
pub use crate::error::PruneError;
pub use crate::report::ScheduleReport;
pub use crate::store::{LayerId, LayerState, PruneStore};
