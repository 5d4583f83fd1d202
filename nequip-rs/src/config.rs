//! Metric and evaluation configuration.
//!
//! Metric components are written the same way in code and in YAML:
//!
//! ```yaml
//! metrics_components:
//!   - force                       # (force, mae)
//!   - [force, rmse]
//!   - [total_energy, mae, {PerSpecies: false, functional: MSELoss}]
//!   - [force, rmse, {report_per_component: true}]
//! ```

use std::path::Path;

use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::Value;

use crate::data::FORCE_KEY;
use crate::error::{NequipError, NequipResult};

/// Reduction used when a component names none.
pub const DEFAULT_REDUCTION: &str = "mae";

/// One axis or a list of axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dims {
    /// A single axis or size
    One(usize),
    /// Several axes or sizes
    Many(Vec<usize>),
}

impl Dims {
    /// As a list
    pub fn to_vec(&self) -> Vec<usize> {
        match self {
            Self::One(d) => vec![*d],
            Self::Many(ds) => ds.clone(),
        }
    }
}

/// Options of a metric component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentOptions {
    /// Error function name, `L1Loss` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functional: Option<String>,

    /// Accumulate separately for every species
    #[serde(default, rename = "PerSpecies")]
    pub per_species: bool,

    /// Per-example shape of the error; inferred from the first batch when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<Dims>,

    /// Per-example axes to average away; all of them when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_dims: Option<Dims>,

    /// Keep the per-example axes instead of averaging them
    #[serde(default)]
    pub report_per_component: bool,
}

/// A `(key, reduction, options)` metric component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub key: String,
    pub reduction: String,
    pub options: ComponentOptions,
}

impl ComponentSpec {
    /// Component with default options
    pub fn new(key: impl Into<String>, reduction: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reduction: reduction.into(),
            options: ComponentOptions::default(),
        }
    }

    /// Builder-style options
    #[must_use]
    pub fn with_options(mut self, options: ComponentOptions) -> Self {
        self.options = options;
        self
    }

    /// Parse a component from a bare key or a sequence of one to three
    /// entries: key, reduction, options mapping.
    ///
    /// # Errors
    ///
    /// [`NequipError::InvalidConfiguration`] for longer sequences,
    /// non-string keys or reductions, and unknown option names.
    pub fn parse(value: &Value) -> NequipResult<Self> {
        let items = match value {
            Value::String(key) => return Ok(Self::new(key.clone(), DEFAULT_REDUCTION)),
            Value::Sequence(items) => items,
            other => {
                return Err(NequipError::invalid_config(format!(
                    "metric component must be a key or a sequence, got {other:?}"
                )))
            }
        };
        if items.is_empty() || items.len() > 3 {
            return Err(NequipError::invalid_config(format!(
                "metric component should have between 1 and 3 entries but {} are given",
                items.len()
            )));
        }

        let text = |v: &Value, what: &str| -> NequipResult<String> {
            v.as_str().map(str::to_string).ok_or_else(|| {
                NequipError::invalid_config(format!("metric {what} must be a string, got {v:?}"))
            })
        };
        let key = text(&items[0], "key")?;
        let reduction = match items.get(1) {
            Some(v) => text(v, "reduction")?,
            None => DEFAULT_REDUCTION.to_string(),
        };
        let options = match items.get(2) {
            None | Some(Value::Null) => ComponentOptions::default(),
            Some(v) => serde_yaml::from_value(v.clone()).map_err(|e| {
                NequipError::invalid_config(format!("bad options for metric '{key}': {e}"))
            })?,
        };
        Ok(Self {
            key,
            reduction,
            options,
        })
    }
}

impl From<&str> for ComponentSpec {
    fn from(key: &str) -> Self {
        Self::new(key, DEFAULT_REDUCTION)
    }
}

impl From<(&str, &str)> for ComponentSpec {
    fn from((key, reduction): (&str, &str)) -> Self {
        Self::new(key, reduction)
    }
}

impl From<(&str, &str, ComponentOptions)> for ComponentSpec {
    fn from((key, reduction, options): (&str, &str, ComponentOptions)) -> Self {
        Self::new(key, reduction).with_options(options)
    }
}

impl<'de> Deserialize<'de> for ComponentSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::parse(&value).map_err(D::Error::custom)
    }
}

impl Serialize for ComponentSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let with_options = self.options != ComponentOptions::default();
        let mut seq = serializer.serialize_seq(Some(if with_options { 3 } else { 2 }))?;
        seq.serialize_element(&self.key)?;
        seq.serialize_element(&self.reduction)?;
        if with_options {
            seq.serialize_element(&self.options)?;
        }
        seq.end()
    }
}

fn default_components() -> Vec<ComponentSpec> {
    vec![
        ComponentSpec::new(FORCE_KEY, "mae"),
        ComponentSpec::new(FORCE_KEY, "rmse"),
    ]
}

fn default_batch_size() -> usize {
    50
}

/// Which metrics to track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_components")]
    pub metrics_components: Vec<ComponentSpec>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            metrics_components: default_components(),
        }
    }
}

impl MetricsConfig {
    /// Parse from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> NequipResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> NequipResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}

/// Settings of an evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateConfig {
    /// Frames per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_components")]
    pub metrics_components: Vec<ComponentSpec>,

    /// Atomic numbers of the species, used to label per-species metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_species: Option<Vec<u32>>,
}

impl Default for EvaluateConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            metrics_components: default_components(),
            allowed_species: None,
        }
    }
}

impl EvaluateConfig {
    /// Parse from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> NequipResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> NequipResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Check the settings for consistency.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero batch size, no metric components, or an
    /// empty species list.
    pub fn validate(&self) -> NequipResult<()> {
        if self.batch_size == 0 {
            return Err(NequipError::invalid_config("batch_size must be positive"));
        }
        if self.metrics_components.is_empty() {
            return Err(NequipError::invalid_config(
                "at least one metric component is required",
            ));
        }
        if let Some(species) = &self.allowed_species {
            if species.is_empty() {
                return Err(NequipError::invalid_config(
                    "allowed_species must not be empty",
                ));
            }
        }
        Ok(())
    }
}
