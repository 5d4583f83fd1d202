//! Streaming error metrics.
//!
//! [`Metrics`] keeps one [`RunningStats`] per `(key, reduction)` pair and
//! folds the error between a prediction and a reference into all of them at
//! every step, so mean absolute and root-mean-square errors over an entire
//! epoch are available without holding on to any batch.
//!
//! `"mae"` is the mean of the error and `"rmse"` its root mean square; any
//! other reduction name is handed to the statistic as is (`"mean"`, `"rms"`).
//! The default error is the absolute difference, so `("force", "mae")` and
//! `("force", "rmse")` are the usual MAE and RMSE.
//!
//! # Example
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use nequip_rs::data::{AtomicDataDict, FORCE_KEY};
//! use nequip_rs::train::Metrics;
//!
//! let mut metrics = Metrics::new([(FORCE_KEY, "mae"), (FORCE_KEY, "rmse")]).unwrap();
//! let device = Device::Cpu;
//! let error = Tensor::new(&[[1f32, 0., 0.]], &device).unwrap();
//! let pred = AtomicDataDict::new().with(FORCE_KEY, error);
//! let zeros = Tensor::zeros((1, 3), candle_core::DType::F32, &device).unwrap();
//! let reference = AtomicDataDict::new().with(FORCE_KEY, zeros);
//! metrics.accumulate(&pred, &reference).unwrap();
//!
//! let (flat, _) = metrics.flatten_metrics(&metrics.current_result().unwrap(), None).unwrap();
//! assert!((flat["f_mae"] - 1.0 / 3.0).abs() < 1e-9);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{DType, Device, Tensor};

use crate::config::ComponentSpec;
use crate::data::{AtomicDataDict, SPECIES_INDEX_KEY};
use crate::error::{NequipError, NequipResult};
use crate::runstats::{Reduction, RunningStats};
use crate::train::key::Abbreviations;
use crate::train::loss::ErrorFunctional;

/// Identifies one tracked statistic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    /// Field the error is computed on
    pub key: String,
    /// Reduction name as registered, e.g. `mae`
    pub reduction: String,
}

impl MetricKey {
    /// Key for `reduction` of `key`
    pub fn new(key: impl Into<String>, reduction: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reduction: reduction.into(),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.key, self.reduction)
    }
}

/// Aggregates by statistic.
pub type MetricValues = BTreeMap<MetricKey, Tensor>;

/// Map a reduction name onto a running-statistic reduction.
///
/// # Errors
///
/// [`NequipError::InvalidConfiguration`] for names other than `mae`, `rmse`,
/// `mean` and `rms`.
pub fn metric_reduction(name: &str) -> NequipResult<Reduction> {
    match name {
        "mae" => Ok(Reduction::Mean),
        "rmse" => Ok(Reduction::Rms),
        other => other.parse(),
    }
}

/// One reduction of one key: its settings and, once data has been seen,
/// its statistic.
#[derive(Debug, Clone)]
struct Tracked {
    reduction: Reduction,
    per_species: bool,
    dim: Option<Vec<usize>>,
    reduce_dims: Option<Vec<usize>>,
    report_per_component: bool,
    stat: Option<RunningStats>,
}

impl Tracked {
    fn init_stat(&self, error: &Tensor) -> NequipResult<RunningStats> {
        let rank = error.rank();
        if rank == 0 {
            return Err(NequipError::shape_mismatch(
                "an error with a batch axis",
                "a scalar",
            ));
        }
        let dim = self
            .dim
            .clone()
            .unwrap_or_else(|| error.dims()[1..].to_vec());
        let reduce_dims = match &self.reduce_dims {
            Some(r) => r.clone(),
            None if self.report_per_component => Vec::new(),
            None => (0..rank - 1).collect(),
        };
        RunningStats::new(dim, self.reduction, reduce_dims, error.device())
    }
}

#[derive(Debug, Clone)]
struct KeyMetrics {
    functional: ErrorFunctional,
    /// In registration order
    reductions: Vec<(String, Tracked)>,
}

/// Streaming per-key, per-species and per-component error statistics.
#[derive(Debug, Clone)]
pub struct Metrics {
    /// In registration order
    keys: Vec<(String, KeyMetrics)>,
    abbreviations: Abbreviations,
}

impl Metrics {
    /// Build from component specs.
    ///
    /// Several reductions of the same key share the error function of the
    /// first component naming that key. Registering the same
    /// `(key, reduction)` twice keeps the later options.
    ///
    /// # Errors
    ///
    /// [`NequipError::InvalidConfiguration`] for an unknown error function
    /// or reduction.
    pub fn new<I, C>(components: I) -> NequipResult<Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<ComponentSpec>,
    {
        let mut keys: Vec<(String, KeyMetrics)> = Vec::new();
        for component in components {
            let ComponentSpec {
                key,
                reduction,
                options,
            } = component.into();

            let tracked = Tracked {
                reduction: metric_reduction(&reduction)?,
                per_species: options.per_species,
                dim: options.dim.as_ref().map(|d| d.to_vec()),
                reduce_dims: options.reduce_dims.as_ref().map(|d| d.to_vec()),
                report_per_component: options.report_per_component,
                stat: None,
            };

            let functional = options
                .functional
                .as_deref()
                .map_or(Ok(ErrorFunctional::default()), str::parse)?;
            let index = match keys.iter().position(|(k, _)| *k == key) {
                Some(i) => i,
                None => {
                    keys.push((
                        key.clone(),
                        KeyMetrics {
                            functional,
                            reductions: Vec::new(),
                        },
                    ));
                    keys.len() - 1
                }
            };

            let reductions = &mut keys[index].1.reductions;
            match reductions.iter_mut().find(|(r, _)| *r == reduction) {
                Some((_, existing)) => *existing = tracked,
                None => reductions.push((reduction, tracked)),
            }
        }

        Ok(Self {
            keys,
            abbreviations: Abbreviations::default(),
        })
    }

    /// Use a different abbreviation table for report names.
    #[must_use]
    pub fn with_abbreviations(mut self, abbreviations: Abbreviations) -> Self {
        self.abbreviations = abbreviations;
        self
    }

    /// Tracked statistics, in registration order.
    pub fn metric_keys(&self) -> Vec<MetricKey> {
        self.keys
            .iter()
            .flat_map(|(key, km)| km.reductions.iter().map(move |(r, _)| MetricKey::new(key, r)))
            .collect()
    }

    /// The statistic of `(key, reduction)`, if data has been seen.
    pub fn statistic(&self, key: &str, reduction: &str) -> Option<&RunningStats> {
        self.tracked(key, reduction)?.stat.as_ref()
    }

    /// Number of error elements seen per species for a per-species statistic.
    pub fn per_species_counts(&self, key: &str, reduction: &str) -> Option<&[f64]> {
        let tracked = self.tracked(key, reduction)?;
        if !tracked.per_species {
            return None;
        }
        tracked.stat.as_ref().map(RunningStats::counts)
    }

    /// Whether `(key, reduction)` is grouped by species.
    pub fn is_per_species(&self, key: &str, reduction: &str) -> bool {
        self.tracked(key, reduction).is_some_and(|t| t.per_species)
    }

    fn tracked(&self, key: &str, reduction: &str) -> Option<&Tracked> {
        let (_, km) = self.keys.iter().find(|(k, _)| k == key)?;
        km.reductions
            .iter()
            .find(|(r, _)| r == reduction)
            .map(|(_, t)| t)
    }

    /// Fold one batch into every statistic and return the updated aggregates.
    ///
    /// Statistics are created on the first call from the shape of the error;
    /// a later batch with a different per-example shape is rejected. Every
    /// error and shape is checked before any statistic changes, so a failed
    /// call leaves all of them as they were.
    ///
    /// # Errors
    ///
    /// [`NequipError::MissingField`] if a tracked key (or, for per-species
    /// statistics, the species index) is missing, [`NequipError::ShapeMismatch`]
    /// for a changed error shape.
    pub fn accumulate(
        &mut self,
        pred: &AtomicDataDict,
        reference: &AtomicDataDict,
    ) -> NequipResult<MetricValues> {
        let any_per_species = self
            .keys
            .iter()
            .any(|(_, km)| km.reductions.iter().any(|(_, t)| t.per_species));
        let species = if any_per_species {
            Some(pred.field(SPECIES_INDEX_KEY)?)
        } else {
            None
        };

        // (new statistic, input) per reduction, in registration order
        let mut staged: Vec<(Option<RunningStats>, Tensor)> = Vec::new();
        for (key, km) in &self.keys {
            let error = km.functional.error(pred, reference, key)?;
            for (_, tracked) in &km.reductions {
                let fresh = match tracked.stat {
                    Some(_) => None,
                    None => Some(tracked.init_stat(&error)?),
                };
                let Some(stat) = fresh.as_ref().or(tracked.stat.as_ref()) else {
                    continue;
                };
                let by = if tracked.per_species { species } else { None };
                let input = if by.is_none() && stat.dim().is_empty() {
                    error.flatten_all()?
                } else {
                    error.clone()
                };
                stat.check_batch(&input, by)?;
                staged.push((fresh, input));
            }
        }

        let mut values = MetricValues::new();
        let mut staged = staged.into_iter();
        for (key, km) in &mut self.keys {
            for (reduction, tracked) in &mut km.reductions {
                let Some((fresh, input)) = staged.next() else {
                    break;
                };
                if let Some(stat) = fresh {
                    tracing::debug!(
                        key = %key,
                        reduction = %reduction,
                        dim = ?stat.dim(),
                        reduce_dims = ?stat.reduce_dims(),
                        per_species = tracked.per_species,
                        "initialized running statistic"
                    );
                    tracked.stat = Some(stat);
                }
                let by = if tracked.per_species { species } else { None };
                if let Some(stat) = tracked.stat.as_mut() {
                    let value = stat.accumulate_batch(&input, by)?;
                    values.insert(MetricKey::new(key.as_str(), reduction.as_str()), value);
                }
            }
        }
        Ok(values)
    }

    /// Current aggregate of every statistic that has seen data.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn current_result(&self) -> NequipResult<MetricValues> {
        let mut values = MetricValues::new();
        for (key, km) in &self.keys {
            for (reduction, tracked) in &km.reductions {
                if let Some(stat) = &tracked.stat {
                    values.insert(
                        MetricKey::new(key.as_str(), reduction.as_str()),
                        stat.current_result()?,
                    );
                }
            }
        }
        Ok(values)
    }

    /// Turn aggregates into named scalars.
    ///
    /// Names are `{abbrev}_{reduction}`, with `_{i}` appended per component
    /// of a vector statistic. Per-species statistics are reported as
    /// `{species}_{name}` plus `all_{name}`, the unweighted mean over species;
    /// per-species vector entries are also returned in the skip list. Species
    /// are labelled by `allowed_species` when given, by index otherwise.
    ///
    /// # Errors
    ///
    /// [`NequipError::InvalidConfiguration`] for a statistic that is not
    /// tracked here or fewer labels than species.
    pub fn flatten_metrics(
        &self,
        metrics: &MetricValues,
        allowed_species: Option<&[String]>,
    ) -> NequipResult<(BTreeMap<String, f64>, Vec<String>)> {
        let mut flat = BTreeMap::new();
        let mut skip_keys = Vec::new();

        for (mk, value) in metrics {
            let tracked = self.tracked(&mk.key, &mk.reduction).ok_or_else(|| {
                NequipError::invalid_config(format!("metric {mk} is not tracked"))
            })?;
            let item_name = format!("{}_{}", self.abbreviations.get(&mk.key), mk.reduction);
            let host = value.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
            if !host.is_empty() && host.iter().all(|v| v.is_nan()) {
                tracing::warn!(metric = %mk, "metric is NaN");
            }

            if !tracked.per_species {
                if value.rank() == 0 {
                    flat.insert(item_name, host[0]);
                } else {
                    for (idx, v) in host.into_iter().enumerate() {
                        flat.insert(format!("{item_name}_{idx}"), v);
                    }
                }
                continue;
            }

            let n_species = value.dims().first().copied().unwrap_or(0);
            let labels: Vec<String> = match allowed_species {
                Some(names) if names.len() < n_species => {
                    return Err(NequipError::invalid_config(format!(
                        "{} species labels given for {n_species} species in {mk}",
                        names.len()
                    )))
                }
                Some(names) => names.to_vec(),
                None => (0..n_species).map(|i| i.to_string()).collect(),
            };

            if value.rank() == 1 {
                for (label, v) in labels.iter().zip(&host) {
                    flat.insert(format!("{label}_{item_name}"), *v);
                }
                let all = host.iter().sum::<f64>() / n_species.max(1) as f64;
                flat.insert(format!("all_{item_name}"), all);
            } else {
                let per_species = host.len() / n_species.max(1);
                for (label, row) in labels.iter().zip(host.chunks(per_species.max(1))) {
                    for (idx, v) in row.iter().enumerate() {
                        let name = format!("{label}_{item_name}_{idx}");
                        flat.insert(name.clone(), *v);
                        skip_keys.push(name);
                    }
                }
            }
        }
        Ok((flat, skip_keys))
    }

    /// Forget all accumulated data. Statistic shapes are kept.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn reset(&mut self) -> NequipResult<()> {
        for stat in self.stats_mut() {
            stat.reset()?;
        }
        Ok(())
    }

    /// Move every statistic to `device`.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn to(&mut self, device: &Device) -> NequipResult<()> {
        for stat in self.stats_mut() {
            stat.to(device)?;
        }
        Ok(())
    }

    fn stats_mut(&mut self) -> impl Iterator<Item = &mut RunningStats> {
        self.keys
            .iter_mut()
            .flat_map(|(_, km)| km.reductions.iter_mut())
            .filter_map(|(_, tracked)| tracked.stat.as_mut())
    }
}
