//! Podar: structured pruning and adaptive regularization for iteratively
//! trained neural networks, in pure Rust.
//!
//! Podar tracks a persistent pruning state per layer weight tensor,
//! computes a per-step regularization term driven by a per-layer
//! scheduling policy, freezes units that cross their pruning threshold,
//! and keeps the bookkeeping consistent across adjacent layers — pruning
//! an output channel of layer L forces the matching input channels of
//! layer L+1 out as well.
//!
//! The tensor/autodiff runtime, the network topology manager, and the
//! base optimizer are external collaborators; podar consumes weight
//! values and gradient buffers through [`blob::ParamBlob`] and drives
//! everything else itself.
//!
//! # Quick Start
//!
//! ```
//! use podar::prelude::*;
//!
//! // a 2x4 weight tensor with two strong and two weak columns
//! let mut weights = ParamBlob::new(
//!     &[1.0, 1.0, 0.1, 0.1,
//!       1.0, 1.0, 0.1, 0.1],
//!     &[2, 4],
//! );
//!
//! let mut engine = PruneEngine::with_seed(42);
//! let config = LayerConfig::new(0.5)
//!     .with_mode(PruneMode::Deterministic { threshold: 0.2 });
//! let id = engine.register("fc1", &weights, config).unwrap();
//!
//! // one optimization step: regularize, (external update), decide
//! engine.step_begin().unwrap();
//! engine.regularize(id, &mut weights).unwrap();
//! let mut blobs = vec![weights];
//! let summary = engine.schedule_tick(&mut blobs).unwrap();
//!
//! assert_eq!(summary.pruned_units, 2);
//! assert!(summary.all_finished);
//! ```
//!
//! # Modules
//!
//! - [`blob`]: parameter tensor seam (weights + gradient buffer)
//! - [`config`]: per-layer configuration and the closed policy family
//! - [`store`]: shared per-layer pruning state, arena-allocated
//! - [`rank`]: importance scoring and history-rank smoothing
//! - [`reg`]: adaptive regularization policies
//! - [`decide`]: threshold and probabilistic pruning decisions
//! - [`propagate`]: cross-layer mask propagation
//! - [`gate`]: post-update mask re-application (momentum and weights)
//! - [`engine`]: per-step orchestration
//! - [`snapshot`]: serde round trip of the full pruning state
//! - [`report`]: human-readable ranked-unit diagnostics
//!
//! # References
//! - Wang, H., et al. (2019). Structured pruning for efficient ConvNets
//!   via incremental regularization. IJCNN.
//! - Wang, H., et al. (2018). Structured probabilistic pruning for deep
//!   convolutional neural network acceleration. BMVC.
//! - Wen, W., et al. (2016). Learning structured sparsity in deep neural
//!   networks. NeurIPS.
//! - Han, S., et al. (2015). Learning both weights and connections for
//!   efficient neural networks. NeurIPS.

pub mod blob;
pub mod config;
pub mod decide;
pub mod engine;
pub mod error;
pub mod gate;
pub mod prelude;
pub mod propagate;
pub mod rank;
pub mod reg;
pub mod report;
pub mod snapshot;
pub mod store;

pub use blob::ParamBlob;
pub use engine::{PruneEngine, TickSummary};
pub use error::{PruneError, Result};
pub use store::{LayerId, LayerState, PruneStore};
