//! Reverse-mode differentiation seam.
//!
//! [`Differentiate`] is the one capability the gradient wrapper needs from
//! an autodiff engine. [`Autograd`] implements it on top of candle's
//! backpropagation.

use candle_core::Tensor;

use crate::error::{NequipError, NequipResult};

/// Environment variable that stops candle from detaching the gradients it
/// computes during `backward`.
pub const KEEP_GRAPH_ENV: &str = "CANDLE_GRAD_DO_NOT_DETACH";

/// Whether [`KEEP_GRAPH_ENV`] is set to a value candle treats as enabled.
pub fn keep_graph_enabled() -> bool {
    std::env::var(KEEP_GRAPH_ENV).is_ok_and(|v| !v.is_empty() && v != "0")
}

/// Gradient of a scalar with respect to a set of tensors.
pub trait Differentiate: Send + Sync {
    /// Differentiate `output` with respect to each of `inputs`.
    ///
    /// Entry `i` is `None` when no gradient flows from `output` to
    /// `inputs[i]`. With `create_graph` the returned gradients stay attached
    /// to the computation graph so they can be differentiated again.
    fn grad(
        &self,
        output: &Tensor,
        inputs: &[Tensor],
        create_graph: bool,
    ) -> NequipResult<Vec<Option<Tensor>>>;
}

/// Candle backpropagation.
///
/// Candle's `backward` detaches every intermediate gradient unless
/// [`KEEP_GRAPH_ENV`] is set, and it reads that variable once per thread.
/// `create_graph` therefore needs the variable set before the first
/// backward pass runs; asking for it otherwise is an
/// [`NequipError::InvalidConfiguration`]. Without `create_graph` the
/// gradients are detached here.
#[derive(Debug, Clone, Copy, Default)]
pub struct Autograd;

fn check_keep_graph(enabled: bool) -> NequipResult<()> {
    if enabled {
        Ok(())
    } else {
        Err(NequipError::invalid_config(format!(
            "gradients that stay on the graph need {KEEP_GRAPH_ENV}=1 in the environment \
             before the first backward pass"
        )))
    }
}

impl Differentiate for Autograd {
    fn grad(
        &self,
        output: &Tensor,
        inputs: &[Tensor],
        create_graph: bool,
    ) -> NequipResult<Vec<Option<Tensor>>> {
        if create_graph {
            check_keep_graph(keep_graph_enabled())?;
        }
        let store = output.backward()?;
        Ok(inputs
            .iter()
            .map(|input| {
                store.get(input).map(|g| {
                    if create_graph {
                        g.clone()
                    } else {
                        g.detach()
                    }
                })
            })
            .collect())
    }
}
