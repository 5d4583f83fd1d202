//! Model building blocks that operate on [`AtomicDataDict`](crate::data::AtomicDataDict).

pub mod autograd;
pub mod grad_output;
pub mod graph_module;

pub use autograd::{keep_graph_enabled, Autograd, Differentiate, KEEP_GRAPH_ENV};
pub use grad_output::{force_output, FieldList, GradientOutput, RequiresGradGuard};
pub use graph_module::{fix_irreps_dict, init_irreps, GraphModule};
