//! Weight initialization for fully connected and equivariant layers.
//!
//! Initializers act on a closed set of layer kinds ([`Layer`]) and are
//! selected by name ([`Initializer`]). Each initializer targets some layer
//! kinds and leaves the rest untouched, so a whole model can be swept with
//! one initializer:
//!
//! ```
//! use candle_core::{DType, Device, Var};
//! use nequip_rs::init::{initialize, Initializer, Layer};
//!
//! let fc = Layer::FullyConnectedNet(vec![Var::zeros((8, 16), DType::F32, &Device::Cpu).unwrap()]);
//! let linear = Layer::Linear(Var::zeros((4, 16), DType::F32, &Device::Cpu).unwrap());
//! let init: Initializer = "uniform_initialize_fcs".parse().unwrap();
//! let touched = initialize(&[fc, linear], init, 0).unwrap();
//! assert_eq!(touched, 1);
//! ```
//!
//! "Unit" initializers keep the second moment of every weight at one.

use std::fmt;
use std::str::FromStr;

use candle_core::Var;
use nalgebra::DMatrix;
use rand::distributions::{Distribution, Uniform};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::{NequipError, NequipResult};

/// A layer whose weights can be initialized.
#[derive(Debug, Clone)]
pub enum Layer {
    /// Dense layer with a `(out, in)` weight
    Linear(Var),
    /// Stack of dense layers, each weight `(h_in, h_out)`
    FullyConnectedNet(Vec<Var>),
    /// Equivariant linear map. `weight` is flat and split into consecutive
    /// `(mul_in, mul_out)` blocks given by `views`.
    EquivariantLinear {
        weight: Var,
        internal_weights: bool,
        views: Vec<(usize, usize)>,
    },
    /// Tensor product, flat `weight`
    TensorProduct { weight: Var, internal_weights: bool },
}

/// Named initialization routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Initializer {
    UniformFcs,
    UniformEquivariantLinears,
    UniformTpInternalWeights,
    XavierFcs,
    UnitOrthogonalEquivariantLinears,
    UnitOrthogonalFcs,
    UnitOrthogonalE3nnFcs,
    OrthogonalEquivariantLinears,
    OrthogonalFcs,
    OrthogonalE3nnFcs,
}

impl Initializer {
    /// Every initializer
    pub const ALL: [Self; 10] = [
        Self::UniformFcs,
        Self::UniformEquivariantLinears,
        Self::UniformTpInternalWeights,
        Self::XavierFcs,
        Self::UnitOrthogonalEquivariantLinears,
        Self::UnitOrthogonalFcs,
        Self::UnitOrthogonalE3nnFcs,
        Self::OrthogonalEquivariantLinears,
        Self::OrthogonalFcs,
        Self::OrthogonalE3nnFcs,
    ];

    /// Configuration name
    pub fn name(&self) -> &'static str {
        match self {
            Self::UniformFcs => "uniform_initialize_fcs",
            Self::UniformEquivariantLinears => "uniform_initialize_equivariant_linears",
            Self::UniformTpInternalWeights => "uniform_initialize_tp_internal_weights",
            Self::XavierFcs => "xavier_initialize_fcs",
            Self::UnitOrthogonalEquivariantLinears => {
                "unit_orthogonal_initialize_equivariant_linears"
            }
            Self::UnitOrthogonalFcs => "unit_orthogonal_initialize_fcs",
            Self::UnitOrthogonalE3nnFcs => "unit_orthogonal_initialize_e3nn_fcs",
            Self::OrthogonalEquivariantLinears => "orthogonal_initialize_equivariant_linears",
            Self::OrthogonalFcs => "orthogonal_initialize_fcs",
            Self::OrthogonalE3nnFcs => "orthogonal_initialize_e3nn_fcs",
        }
    }

    /// Initialize `layer` if this initializer targets it.
    ///
    /// Returns whether the layer was touched.
    ///
    /// # Errors
    ///
    /// Returns [`NequipError::ShapeMismatch`] when an orthogonal initializer
    /// meets a weight that is not a matrix or views that do not tile the
    /// weight.
    pub fn apply<R: Rng + ?Sized>(&self, layer: &Layer, rng: &mut R) -> NequipResult<bool> {
        match (self, layer) {
            (Self::UniformFcs, Layer::FullyConnectedNet(weights)) => {
                for w in weights {
                    unit_uniform_init_(w, rng)?;
                }
            }
            (
                Self::UniformEquivariantLinears,
                Layer::EquivariantLinear {
                    weight,
                    internal_weights: true,
                    ..
                },
            )
            | (
                Self::UniformTpInternalWeights,
                Layer::TensorProduct {
                    weight,
                    internal_weights: true,
                },
            ) => unit_uniform_init_(weight, rng)?,
            (Self::XavierFcs, Layer::FullyConnectedNet(weights)) => {
                for w in weights {
                    let gain = (dims2(w)?.0 as f64).sqrt();
                    xavier_uniform_init_(w, gain, rng)?;
                }
            }
            (Self::XavierFcs, Layer::Linear(w)) => xavier_uniform_init_(w, 1.0, rng)?,
            (
                Self::UnitOrthogonalEquivariantLinears,
                Layer::EquivariantLinear {
                    weight,
                    internal_weights: true,
                    views,
                },
            ) => init_views(weight, views, true, rng)?,
            (
                Self::OrthogonalEquivariantLinears,
                Layer::EquivariantLinear {
                    weight,
                    internal_weights: true,
                    views,
                },
            ) => init_views(weight, views, false, rng)?,
            (
                Self::UnitOrthogonalFcs | Self::UnitOrthogonalE3nnFcs,
                Layer::FullyConnectedNet(weights),
            ) => {
                for w in weights {
                    unit_orthogonal_init_(w, rng)?;
                }
            }
            (Self::UnitOrthogonalFcs, Layer::Linear(w)) => unit_orthogonal_init_(w, rng)?,
            (Self::OrthogonalFcs | Self::OrthogonalE3nnFcs, Layer::FullyConnectedNet(weights)) => {
                for w in weights {
                    orthogonal_init_(w, 1.0, rng)?;
                }
            }
            (Self::OrthogonalFcs, Layer::Linear(w)) => orthogonal_init_(w, 1.0, rng)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl FromStr for Initializer {
    type Err = NequipError;

    fn from_str(s: &str) -> NequipResult<Self> {
        Self::ALL
            .into_iter()
            .find(|init| init.name() == s)
            .ok_or_else(|| NequipError::invalid_config(format!("unknown initializer '{s}'")))
    }
}

impl fmt::Display for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Apply `init` to every layer with a seeded generator. Returns the number
/// of layers touched.
pub fn initialize(layers: &[Layer], init: Initializer, seed: u64) -> NequipResult<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut touched = 0;
    for layer in layers {
        if init.apply(layer, &mut rng)? {
            touched += 1;
        }
    }
    tracing::debug!(initializer = %init, touched, total = layers.len(), "initialized weights");
    Ok(touched)
}

/// Fill with U(-√3, √3), which has unit second moment.
pub fn unit_uniform_init_<R: Rng + ?Sized>(weight: &Var, rng: &mut R) -> NequipResult<()> {
    let bound = 3f64.sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    let data = (0..weight.elem_count()).map(|_| dist.sample(rng)).collect();
    fill(weight, data)
}

/// Xavier/Glorot uniform: U(-a, a) with `a = gain * sqrt(6 / (fan_in + fan_out))`,
/// `fan_in = dims[1]`, `fan_out = dims[0]`.
pub fn xavier_uniform_init_<R: Rng + ?Sized>(
    weight: &Var,
    gain: f64,
    rng: &mut R,
) -> NequipResult<()> {
    let (fan_out, fan_in) = dims2(weight)?;
    let bound = gain * (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    let data = (0..weight.elem_count()).map(|_| dist.sample(rng)).collect();
    fill(weight, data)
}

/// (Semi-)orthogonal matrix times `gain`.
pub fn orthogonal_init_<R: Rng + ?Sized>(weight: &Var, gain: f64, rng: &mut R) -> NequipResult<()> {
    let (rows, cols) = dims2(weight)?;
    fill(weight, orthogonal(rows, cols, gain, rng))
}

/// Orthogonal scaled by `sqrt(max(rows, cols))`, giving unit second moment.
pub fn unit_orthogonal_init_<R: Rng + ?Sized>(weight: &Var, rng: &mut R) -> NequipResult<()> {
    let (rows, cols) = dims2(weight)?;
    let gain = (rows.max(cols) as f64).sqrt();
    fill(weight, orthogonal(rows, cols, gain, rng))
}

fn init_views<R: Rng + ?Sized>(
    weight: &Var,
    views: &[(usize, usize)],
    unit: bool,
    rng: &mut R,
) -> NequipResult<()> {
    let total: usize = views.iter().map(|(a, b)| a * b).sum();
    if total != weight.elem_count() {
        return Err(NequipError::shape_mismatch(
            format!("{total} weights from views {views:?}"),
            format!("{:?}", weight.dims()),
        ));
    }
    let mut data = Vec::with_capacity(total);
    for &(rows, cols) in views {
        let gain = if unit {
            (rows.max(cols) as f64).sqrt()
        } else {
            1.0
        };
        data.extend(orthogonal(rows, cols, gain, rng));
    }
    fill(weight, data)
}

/// Row-major `rows x cols` matrix with orthonormal rows or columns, whichever
/// are fewer.
fn orthogonal<R: Rng + ?Sized>(rows: usize, cols: usize, gain: f64, rng: &mut R) -> Vec<f64> {
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    let transposed = rows < cols;
    let (n, m) = if transposed { (cols, rows) } else { (rows, cols) };

    let a = DMatrix::<f64>::from_fn(n, m, |_, _| StandardNormal.sample(&mut *rng));
    let qr = a.qr();
    let r = qr.r();
    let mut q = qr.q();
    // unique decomposition: make diag(R) positive
    for j in 0..m {
        if r[(j, j)] < 0.0 {
            q.column_mut(j).neg_mut();
        }
    }
    let q = if transposed { q.transpose() } else { q };
    let q = &q;
    (0..rows)
        .flat_map(|i| (0..cols).map(move |j| gain * q[(i, j)]))
        .collect()
}

fn dims2(weight: &Var) -> NequipResult<(usize, usize)> {
    match weight.dims() {
        &[rows, cols] => Ok((rows, cols)),
        other => Err(NequipError::shape_mismatch(
            "a 2-D weight",
            format!("{other:?}"),
        )),
    }
}

fn fill(weight: &Var, data: Vec<f64>) -> NequipResult<()> {
    let values = candle_core::Tensor::from_vec(data, weight.shape(), weight.device())?
        .to_dtype(weight.dtype())?;
    weight.set(&values)?;
    Ok(())
}
