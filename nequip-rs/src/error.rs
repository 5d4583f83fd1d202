//! Error types for nequip-rs.

use thiserror::Error;

/// Result type for nequip-rs operations.
pub type NequipResult<T> = Result<T, NequipError>;

/// Errors that can occur while wrapping models, accumulating metrics or
/// preparing data.
#[derive(Debug, Error)]
pub enum NequipError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Malformed configuration (bad sign, bad component spec, unknown name)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Two configuration lists that must line up do not
    #[error("Configuration mismatch: {what} has {got} entries, expected {expected}")]
    ConfigurationMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    /// The differentiation engine produced no gradient for a requested field
    #[error(
        "Gradient of '{of}' with respect to '{wrt}' could not be computed; \
         the field is not connected to the output"
    )]
    GradientUnavailable { of: String, wrt: String },

    /// Shape mismatch
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// A required field is absent from a data dictionary
    #[error("Missing field '{0}' in data dictionary")]
    MissingField(String),

    /// Data preparation error
    #[error("Data error: {0}")]
    Data(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("Invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

impl NequipError {
    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a configuration mismatch error
    pub fn mismatch(what: impl Into<String>, expected: usize, got: usize) -> Self {
        Self::ConfigurationMismatch {
            what: what.into(),
            expected,
            got,
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a missing field error
    pub fn missing_field(key: impl Into<String>) -> Self {
        Self::MissingField(key.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let error = NequipError::invalid_config("sign must be 1 or -1");
        assert_eq!(
            error.to_string(),
            "Invalid configuration: sign must be 1 or -1"
        );
    }

    #[test]
    fn test_mismatch_display() {
        let error = NequipError::mismatch("out_field", 2, 1);
        assert_eq!(
            error.to_string(),
            "Configuration mismatch: out_field has 1 entries, expected 2"
        );
    }

    #[test]
    fn test_gradient_unavailable_names_fields() {
        let error = NequipError::GradientUnavailable {
            of: "total_energy".into(),
            wrt: "positions".into(),
        };
        let msg = error.to_string();
        assert!(msg.contains("total_energy"));
        assert!(msg.contains("positions"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("a: b: :::").unwrap_err();
        let error: NequipError = yaml_error.into();
        assert!(matches!(error, NequipError::ConfigParse(_)));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let error: NequipError = a.broadcast_add(&b).unwrap_err().into();
        assert!(error.to_string().contains("Candle error"));
    }
}
