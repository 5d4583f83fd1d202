//! Building blocks for training equivariant interatomic potentials with candle.
//!
//! This crate provides:
//! - Forces (and other derived fields) as gradients of a model's scalar
//!   outputs, computed by automatic differentiation through any wrapped model
//! - Streaming error metrics with per-species and per-component breakdowns
//! - Running mean/RMS statistics that never store samples
//! - An in-memory atomic dataset with batching and field statistics
//! - Weight initializers for fully connected and equivariant layers
//!
//! # Example
//!
//! ```no_run
//! use nequip_rs::prelude::*;
//!
//! # fn run<M: GraphModule>(energy_model: M, dataset: AtomicInMemoryDataset) -> NequipResult<()> {
//! let mut model = force_output(energy_model)?;
//! let config = EvaluateConfig::from_file("evaluate.yaml")?;
//! config.validate()?;
//!
//! let mut metrics = Metrics::new(config.metrics_components.clone())?;
//! let report = evaluate(&mut model, &dataset, config.batch_size, &mut metrics, None)?;
//! println!("force MAE: {}", report["f_mae"]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod init;
pub mod irreps;
pub mod nn;
pub mod runstats;
pub mod train;

pub use config::{ComponentOptions, ComponentSpec, EvaluateConfig, MetricsConfig};
pub use data::{AtomicDataDict, AtomicInMemoryDataset, TypeMapper};
pub use error::{NequipError, NequipResult};
pub use irreps::{Irrep, Irreps, IrrepsDict};
pub use nn::{force_output, GradientOutput, GraphModule};
pub use runstats::{Reduction, RunningStats};
pub use train::{evaluate, Metrics};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{ComponentOptions, ComponentSpec, EvaluateConfig, MetricsConfig};
    pub use crate::data::{
        AtomicDataDict, AtomicInMemoryDataset, TypeMapper, ATOMIC_NUMBERS_KEY, BATCH_KEY,
        FORCE_KEY, PER_ATOM_ENERGY_KEY, POSITIONS_KEY, SPECIES_INDEX_KEY, TOTAL_ENERGY_KEY,
    };
    pub use crate::error::{NequipError, NequipResult};
    pub use crate::irreps::{Irreps, IrrepsDict};
    pub use crate::nn::{force_output, Differentiate, GradientOutput, GraphModule};
    pub use crate::runstats::{Reduction, RunningStats};
    pub use crate::train::{evaluate, Abbreviations, MetricKey, Metrics};
}
