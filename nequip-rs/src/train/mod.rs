//! Training-loop support: error functions, streaming metrics and evaluation.

pub mod evaluate;
pub mod key;
pub mod loss;
pub mod metrics;

pub use evaluate::evaluate;
pub use key::Abbreviations;
pub use loss::ErrorFunctional;
pub use metrics::{metric_reduction, MetricKey, MetricValues, Metrics};
