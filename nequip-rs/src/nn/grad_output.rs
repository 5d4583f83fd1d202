//! Wrap a model and include the gradient of one of its outputs.
//!
//! [`GradientOutput`] runs a wrapped [`GraphModule`], then differentiates the
//! sum of a scalar output field (`of`) with respect to one or more input
//! fields (`wrt`) and stores `sign * gradient` under `out_field`.
//! [`force_output`] is the usual instance: forces as the negative gradient
//! of the total energy with respect to positions.
//!
//! Summing over the batch before differentiating gives every example the
//! gradient of its own output only if examples do not depend on each other's
//! inputs. That holds for energies of independent graphs (moving an atom in
//! one frame never changes the energy of another) and is assumed, not
//! checked, for any other `of` field.
//!
//! # Example
//!
//! ```no_run
//! use nequip_rs::nn::{force_output, GraphModule};
//! # use nequip_rs::prelude::*;
//! # fn run<M: GraphModule>(energy_model: M, mut batch: AtomicDataDict) -> NequipResult<()> {
//! let model = force_output(energy_model)?;
//! model.forward(&mut batch)?;
//! let forces = batch.field(FORCE_KEY)?;
//! # Ok(())
//! # }
//! ```

use std::ops::{Deref, DerefMut};

use candle_core::{Tensor, Var};

use crate::data::{AtomicDataDict, FORCE_KEY, POSITIONS_KEY, TOTAL_ENERGY_KEY};
use crate::error::{NequipError, NequipResult};
use crate::irreps::{Irreps, IrrepsDict};
use crate::nn::autograd::{Autograd, Differentiate};
use crate::nn::graph_module::{init_irreps, GraphModule};

/// One or more field names. Lets single names and lists be passed alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldList(Vec<String>);

impl FieldList {
    /// Number of names
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for FieldList {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl From<String> for FieldList {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl From<Vec<String>> for FieldList {
    fn from(names: Vec<String>) -> Self {
        Self(names)
    }
}

impl From<Vec<&str>> for FieldList {
    fn from(names: Vec<&str>) -> Self {
        Self(names.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for FieldList {
    fn from(names: [&str; N]) -> Self {
        Self(names.into_iter().map(str::to_string).collect())
    }
}

/// Forces the `wrt` fields of a dictionary to be tracked variables for the
/// guard's lifetime.
///
/// Fields that were not variables are swapped for variables holding the
/// same values; dropping the guard puts the original tensors back, so the
/// caller's tracking flags are unchanged on every exit path.
pub struct RequiresGradGuard<'a> {
    data: &'a mut AtomicDataDict,
    /// Original tensors of the fields this guard switched on
    saved: Vec<(String, Tensor)>,
    tracked: Vec<Tensor>,
}

impl<'a> RequiresGradGuard<'a> {
    /// Switch tracking on for every field in `keys`.
    ///
    /// # Errors
    ///
    /// Returns [`NequipError::MissingField`] if a key is absent. Fields
    /// already switched on are restored before the error is returned.
    pub fn acquire(data: &'a mut AtomicDataDict, keys: &[String]) -> NequipResult<Self> {
        let mut guard = Self {
            data,
            saved: Vec::with_capacity(keys.len()),
            tracked: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            guard.track(key)?;
        }
        Ok(guard)
    }

    fn track(&mut self, key: &str) -> NequipResult<()> {
        let original = self.data.field(key)?.clone();
        if original.is_variable() {
            self.tracked.push(original);
            return Ok(());
        }
        let var = Var::from_tensor(&original)?.into_inner();
        self.data.insert(key, var.clone());
        self.saved.push((key.to_string(), original));
        self.tracked.push(var);
        Ok(())
    }

    /// The tracked tensors, in `keys` order.
    pub fn tracked(&self) -> &[Tensor] {
        &self.tracked
    }
}

impl Deref for RequiresGradGuard<'_> {
    type Target = AtomicDataDict;

    fn deref(&self) -> &AtomicDataDict {
        self.data
    }
}

impl DerefMut for RequiresGradGuard<'_> {
    fn deref_mut(&mut self) -> &mut AtomicDataDict {
        self.data
    }
}

impl Drop for RequiresGradGuard<'_> {
    fn drop(&mut self) {
        for (key, original) in self.saved.drain(..) {
            self.data.insert(key, original);
        }
    }
}

/// Wrap a model and add the gradient of one of its scalar outputs.
///
/// In training mode the gradients stay on the graph so a loss on them
/// reaches the model's parameters. With the default [`Autograd`] engine
/// that requires [`KEEP_GRAPH_ENV`](crate::nn::KEEP_GRAPH_ENV) to be set.
pub struct GradientOutput<M> {
    func: M,
    of: String,
    wrt: Vec<String>,
    out_field: Vec<String>,
    sign: f64,
    training: bool,
    irreps_in: IrrepsDict,
    irreps_out: IrrepsDict,
    engine: Box<dyn Differentiate>,
}

impl<M: GraphModule> GradientOutput<M> {
    /// Wrap `func`.
    ///
    /// # Arguments
    ///
    /// * `func` - The model to wrap
    /// * `of` - Output field of `func` to differentiate; must be a scalar (`0e`)
    /// * `wrt` - Input field(s) to differentiate with respect to
    /// * `out_field` - Where to store the gradients; defaults to `d(of)/d(wrt)`
    /// * `sign` - `1.0` or `-1.0`; the gradient is multiplied by it
    ///
    /// # Errors
    ///
    /// [`NequipError::InvalidConfiguration`] for a sign other than ±1, an
    /// empty `wrt`, a `wrt` field the model does not take, or an `of` field
    /// the model declares as non-scalar; [`NequipError::ConfigurationMismatch`]
    /// when `out_field` and `wrt` differ in length.
    pub fn new(
        func: M,
        of: impl Into<String>,
        wrt: impl Into<FieldList>,
        out_field: Option<FieldList>,
        sign: f64,
    ) -> NequipResult<Self> {
        if sign != 1.0 && sign != -1.0 {
            return Err(NequipError::invalid_config(format!(
                "sign must be 1 or -1, got {sign}"
            )));
        }
        let of = of.into();
        let wrt = wrt.into().0;
        if wrt.is_empty() {
            return Err(NequipError::invalid_config(
                "at least one field to differentiate with respect to is required",
            ));
        }

        let out_field = match out_field {
            None => wrt.iter().map(|w| format!("d({of})/d({w})")).collect(),
            Some(fields) if fields.len() != wrt.len() => {
                return Err(NequipError::mismatch("out_field", wrt.len(), fields.len()));
            }
            Some(fields) => fields.0,
        };

        let my_irreps_in = IrrepsDict::from([(of.clone(), Some(Irreps::scalar()))]);
        if let Some(declared) = func.irreps_out().get(&of) {
            if declared.as_ref() != Some(&Irreps::scalar()) {
                return Err(NequipError::invalid_config(format!(
                    "field '{of}' must be a single scalar (0e) to take its gradient"
                )));
            }
        }
        let (irreps_in, mut irreps_out) =
            init_irreps(func.irreps_in(), &my_irreps_in, &[], func.irreps_out())?;

        // d(scalar)/d(x) transforms exactly like x
        for (out, w) in out_field.iter().zip(&wrt) {
            let ir = irreps_in.get(w).ok_or_else(|| {
                NequipError::invalid_config(format!("'{w}' is not an input field of the model"))
            })?;
            irreps_out.insert(out.clone(), ir.clone());
        }

        let training = func.training();
        Ok(Self {
            func,
            of,
            wrt,
            out_field,
            sign,
            training,
            irreps_in,
            irreps_out,
            engine: Box::new(Autograd),
        })
    }

    /// Use a different differentiation engine.
    #[must_use]
    pub fn with_engine(mut self, engine: impl Differentiate + 'static) -> Self {
        self.engine = Box::new(engine);
        self
    }

    /// The scalar field being differentiated
    pub fn of(&self) -> &str {
        &self.of
    }

    /// Fields differentiated with respect to
    pub fn wrt(&self) -> &[String] {
        &self.wrt
    }

    /// Fields the gradients are stored under
    pub fn out_field(&self) -> &[String] {
        &self.out_field
    }

    /// Sign applied to the gradients
    pub fn sign(&self) -> f64 {
        self.sign
    }

    /// The wrapped model
    pub fn inner(&self) -> &M {
        &self.func
    }

    /// Mutable access to the wrapped model
    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.func
    }
}

impl<M: GraphModule> GraphModule for GradientOutput<M> {
    fn irreps_in(&self) -> &IrrepsDict {
        &self.irreps_in
    }

    fn irreps_out(&self) -> &IrrepsDict {
        &self.irreps_out
    }

    fn forward(&self, data: &mut AtomicDataDict) -> NequipResult<()> {
        let mut guard = RequiresGradGuard::acquire(data, &self.wrt)?;
        let inputs = guard.tracked().to_vec();

        self.func.forward(&mut guard)?;

        let total = guard.field(&self.of)?.sum_all()?;
        tracing::trace!(
            of = %self.of,
            wrt = ?self.wrt,
            create_graph = self.training,
            "computing gradient output"
        );
        let grads = self.engine.grad(&total, &inputs, self.training)?;
        if grads.len() != self.wrt.len() {
            return Err(NequipError::mismatch("gradients", self.wrt.len(), grads.len()));
        }

        for ((out, wrt), grad) in self.out_field.iter().zip(&self.wrt).zip(grads) {
            let grad = grad.ok_or_else(|| NequipError::GradientUnavailable {
                of: self.of.clone(),
                wrt: wrt.clone(),
            })?;
            guard.insert(out.clone(), grad.affine(self.sign, 0.0)?);
        }
        Ok(())
    }

    fn training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.func.set_training(training);
    }
}

/// Wrap an energy model so that it also outputs forces,
/// `force = -d(total_energy)/d(positions)`.
///
/// # Errors
///
/// Fails like [`GradientOutput::new`] if the model does not take positions
/// or declares a non-scalar total energy.
pub fn force_output<M: GraphModule>(energy_model: M) -> NequipResult<GradientOutput<M>> {
    GradientOutput::new(
        energy_model,
        TOTAL_ENERGY_KEY,
        POSITIONS_KEY,
        Some(FORCE_KEY.into()),
        -1.0,
    )
}
