//! Streaming reductions over batches of tensors.
//!
//! [`RunningStats`] keeps a running mean (or mean of squares, for RMS) per
//! output element without retaining any of the samples it has seen. Samples
//! can optionally be bucketed by an integer index ("accumulate by"), in which
//! case one running value is kept per bucket and the number of buckets grows
//! as larger indices show up.
//!
//! # Example
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use nequip_rs::runstats::{Reduction, RunningStats};
//!
//! let mut stats = RunningStats::new(vec![3], Reduction::Mean, vec![0], &Device::Cpu).unwrap();
//! let batch = Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &Device::Cpu).unwrap();
//! let mean = stats.accumulate_batch(&batch, None).unwrap();
//! assert_eq!(mean.to_scalar::<f64>().unwrap(), 3.5);
//! ```

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};

use crate::error::{NequipError, NequipResult};

/// How samples are folded into the running value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reduction {
    /// Arithmetic mean
    Mean,
    /// Root of the mean of squares
    Rms,
}

impl FromStr for Reduction {
    type Err = NequipError;

    fn from_str(s: &str) -> NequipResult<Self> {
        match s {
            "mean" => Ok(Self::Mean),
            "rms" => Ok(Self::Rms),
            other => Err(NequipError::invalid_config(format!(
                "unsupported reduction '{other}', expected 'mean' or 'rms'"
            ))),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => f.write_str("mean"),
            Self::Rms => f.write_str("rms"),
        }
    }
}

/// Incremental mean/RMS accumulator.
///
/// `dim` is the shape of one sample (the batch axis excluded). Axes listed in
/// `reduce_dims` are averaged away, so the reported value has shape
/// `output_dim`; with bucketing the result gains a leading bucket axis.
#[derive(Debug, Clone)]
pub struct RunningStats {
    dim: Vec<usize>,
    reduce_dims: Vec<usize>,
    output_dim: Vec<usize>,
    reduction: Reduction,
    /// Number of elements folded into one output element per sample
    reduction_factor: usize,
    /// Running value per bucket, shape `(n_bins, *output_dim)`, always F64
    state: Tensor,
    /// Elements seen per bucket
    counts: Vec<f64>,
    binned: bool,
    device: Device,
}

impl RunningStats {
    /// Create an empty accumulator on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a reduce axis is out of range.
    pub fn new(
        dim: Vec<usize>,
        reduction: Reduction,
        reduce_dims: Vec<usize>,
        device: &Device,
    ) -> NequipResult<Self> {
        let mut reduce_dims = reduce_dims;
        reduce_dims.sort_unstable();
        reduce_dims.dedup();
        if let Some(&bad) = reduce_dims.iter().find(|&&d| d >= dim.len()) {
            return Err(NequipError::invalid_config(format!(
                "reduce dim {bad} out of range for sample shape {dim:?}"
            )));
        }

        let output_dim: Vec<usize> = dim
            .iter()
            .enumerate()
            .filter(|(i, _)| !reduce_dims.contains(i))
            .map(|(_, &d)| d)
            .collect();
        let reduction_factor = reduce_dims.iter().map(|&i| dim[i]).product();

        let state = Tensor::zeros(bin_shape(1, &output_dim), DType::F64, device)?;

        Ok(Self {
            dim,
            reduce_dims,
            output_dim,
            reduction,
            reduction_factor,
            state,
            counts: vec![0.0],
            binned: false,
            device: device.clone(),
        })
    }

    /// Shape of a single sample.
    #[must_use]
    pub fn dim(&self) -> &[usize] {
        &self.dim
    }

    /// Sample axes that are averaged away.
    #[must_use]
    pub fn reduce_dims(&self) -> &[usize] {
        &self.reduce_dims
    }

    /// Shape of the reported value (per bucket).
    #[must_use]
    pub fn output_dim(&self) -> &[usize] {
        &self.output_dim
    }

    /// The reduction this accumulator computes.
    #[must_use]
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Number of elements seen per bucket.
    #[must_use]
    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Number of buckets currently tracked.
    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.counts.len()
    }

    /// Whether samples have been bucketed.
    #[must_use]
    pub fn is_binned(&self) -> bool {
        self.binned
    }

    /// Device holding the running state.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Check that `batch` and `accumulate_by` could be folded in, without
    /// touching the running state.
    ///
    /// # Errors
    ///
    /// The [`NequipError::ShapeMismatch`] that
    /// [`accumulate_batch`](Self::accumulate_batch) would return.
    pub fn check_batch(&self, batch: &Tensor, accumulate_by: Option<&Tensor>) -> NequipResult<()> {
        let dims = batch.dims();
        if dims.is_empty() || dims[1..] != self.dim[..] {
            return Err(NequipError::shape_mismatch(
                format!("(N, {})", join_dims(&self.dim)),
                format!("{dims:?}"),
            ));
        }
        if let Some(by) = accumulate_by {
            if by.elem_count() != dims[0] {
                return Err(NequipError::shape_mismatch(
                    format!("{} bucket indices", dims[0]),
                    format!("{:?}", by.dims()),
                ));
            }
        }
        Ok(())
    }

    /// Fold a batch of samples into the running value and return the
    /// updated aggregate.
    ///
    /// `batch` has shape `(n, *dim)`. When `accumulate_by` is given it must
    /// hold one non-negative bucket index per sample.
    ///
    /// # Errors
    ///
    /// Returns [`NequipError::ShapeMismatch`] if the sample shape differs from
    /// `dim` or the bucket indices do not line up with the batch.
    pub fn accumulate_batch(
        &mut self,
        batch: &Tensor,
        accumulate_by: Option<&Tensor>,
    ) -> NequipResult<Tensor> {
        self.check_batch(batch, accumulate_by)?;
        let n = batch.dims()[0];

        let ids: Vec<u32> = match accumulate_by {
            None => vec![0; n],
            Some(by) => {
                self.binned = true;
                by.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?
            }
        };
        if n == 0 {
            return self.current_result();
        }

        let mut batch = batch.to_device(&self.device)?.to_dtype(DType::F64)?;
        if self.reduction == Reduction::Rms {
            batch = batch.sqr()?;
        }
        if !self.reduce_dims.is_empty() {
            let axes: Vec<usize> = self.reduce_dims.iter().map(|d| d + 1).collect();
            batch = batch.sum(axes)?;
        }

        let needed = ids.iter().max().map_or(1, |&m| m as usize + 1);
        self.grow(needed)?;
        let n_bins = self.n_bins();

        let mut added = vec![0.0f64; n_bins];
        for &i in &ids {
            added[i as usize] += self.reduction_factor as f64;
        }
        let ids = Tensor::from_vec(ids, n, &self.device)?;
        let sums = Tensor::zeros(bin_shape(n_bins, &self.output_dim), DType::F64, &self.device)?
            .index_add(&ids, &batch, 0)?;

        // state += (sum - added * state) / (seen + added), per bucket
        let inv_total: Vec<f64> = self
            .counts
            .iter()
            .zip(&added)
            .map(|(seen, add)| {
                let total = seen + add;
                if total > 0.0 {
                    1.0 / total
                } else {
                    0.0
                }
            })
            .collect();
        let column = bin_shape(n_bins, &vec![1; self.output_dim.len()]);
        let added_t = Tensor::from_vec(added.clone(), column.clone(), &self.device)?;
        let inv_t = Tensor::from_vec(inv_total, column, &self.device)?;

        let delta = (sums - self.state.broadcast_mul(&added_t)?)?;
        self.state = (&self.state + delta.broadcast_mul(&inv_t)?)?;
        for (seen, add) in self.counts.iter_mut().zip(added) {
            *seen += add;
        }

        self.current_result()
    }

    /// The current aggregate. Shape `output_dim`, or `(n_bins, *output_dim)`
    /// once samples have been bucketed. Empty buckets report zero.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn current_result(&self) -> NequipResult<Tensor> {
        let value = match self.reduction {
            Reduction::Mean => self.state.clone(),
            Reduction::Rms => self.state.sqrt()?,
        };
        if self.binned {
            Ok(value)
        } else {
            Ok(value.squeeze(0)?)
        }
    }

    /// Forget everything seen so far. Bucketing, once enabled, stays enabled.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn reset(&mut self) -> NequipResult<()> {
        self.state = Tensor::zeros(bin_shape(1, &self.output_dim), DType::F64, &self.device)?;
        self.counts = vec![0.0];
        Ok(())
    }

    /// Move the running state to `device`.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn to(&mut self, device: &Device) -> NequipResult<()> {
        self.state = self.state.to_device(device)?;
        self.device = device.clone();
        Ok(())
    }

    fn grow(&mut self, n_bins: usize) -> NequipResult<()> {
        let current = self.n_bins();
        if n_bins <= current {
            return Ok(());
        }
        let extra = Tensor::zeros(
            bin_shape(n_bins - current, &self.output_dim),
            DType::F64,
            &self.device,
        )?;
        self.state = Tensor::cat(&[&self.state, &extra], 0)?;
        self.counts.resize(n_bins, 0.0);
        Ok(())
    }
}

fn bin_shape(n_bins: usize, output_dim: &[usize]) -> Vec<usize> {
    let mut shape = Vec::with_capacity(output_dim.len() + 1);
    shape.push(n_bins);
    shape.extend_from_slice(output_dim);
    shape
}

fn join_dims(dims: &[usize]) -> String {
    dims.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
