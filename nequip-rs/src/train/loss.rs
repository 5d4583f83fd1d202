//! Elementwise error functions used by the metrics.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::data::AtomicDataDict;
use crate::error::{NequipError, NequipResult};

/// Name-selected elementwise error between a prediction and a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorFunctional {
    /// `|pred - ref|`
    #[default]
    L1,
    /// `(pred - ref)^2`
    Mse,
}

impl FromStr for ErrorFunctional {
    type Err = NequipError;

    fn from_str(s: &str) -> NequipResult<Self> {
        match s {
            "L1Loss" => Ok(Self::L1),
            "MSELoss" => Ok(Self::Mse),
            other => Err(NequipError::invalid_config(format!(
                "unknown error functional '{other}', expected 'L1Loss' or 'MSELoss'"
            ))),
        }
    }
}

impl fmt::Display for ErrorFunctional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => f.write_str("L1Loss"),
            Self::Mse => f.write_str("MSELoss"),
        }
    }
}

impl ErrorFunctional {
    /// Unreduced error of field `key`, detached from any graph. Same shape
    /// as the prediction.
    ///
    /// # Errors
    ///
    /// [`NequipError::MissingField`] if either side lacks `key`,
    /// [`NequipError::ShapeMismatch`] if the shapes differ.
    pub fn error(
        &self,
        pred: &AtomicDataDict,
        reference: &AtomicDataDict,
        key: &str,
    ) -> NequipResult<Tensor> {
        let p = pred.field(key)?.detach();
        let r = reference.field(key)?;
        if p.dims() != r.dims() {
            return Err(NequipError::shape_mismatch(
                format!("reference '{key}' of shape {:?}", p.dims()),
                format!("{:?}", r.dims()),
            ));
        }
        let diff = (&p - r.to_dtype(p.dtype())?)?;
        let err = match self {
            Self::L1 => diff.abs()?,
            Self::Mse => diff.sqr()?,
        };
        Ok(err)
    }
}
