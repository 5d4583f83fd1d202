//! Atomic graph data.
//!
//! This module provides the dictionary type models read and write, plus a
//! small in-memory dataset for evaluation:
//! - [`AtomicDataDict`] - Field name to tensor map with the standard keys
//! - [`TypeMapper`] - Atomic numbers to contiguous species indices
//! - [`AtomicInMemoryDataset`] - Frames in memory, batching via [`collate`]
//!
//! Per-node fields have one row per atom, per-graph fields one row per frame.
//! Batches are formed by concatenating along the first axis and adding a
//! [`BATCH_KEY`] field that maps every atom to its frame.
//!
//! # Example
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use nequip_rs::data::{AtomicDataDict, POSITIONS_KEY};
//!
//! let mut data = AtomicDataDict::new();
//! let positions = Tensor::zeros((4, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
//! data.insert(POSITIONS_KEY, positions);
//! assert!(!data.requires_grad(POSITIONS_KEY).unwrap());
//! ```

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor, Var};

use crate::error::{NequipError, NequipResult};
use crate::runstats::{Reduction, RunningStats};

/// Cartesian positions, `(n_atoms, 3)`.
pub const POSITIONS_KEY: &str = "positions";
/// Atomic numbers, `(n_atoms,)`.
pub const ATOMIC_NUMBERS_KEY: &str = "atomic_numbers";
/// Contiguous species indices, `(n_atoms,)`.
pub const SPECIES_INDEX_KEY: &str = "species_index";
/// Graph index of every atom, `(n_atoms,)`.
pub const BATCH_KEY: &str = "batch";
/// Energy per frame, `(n_graphs,)`.
pub const TOTAL_ENERGY_KEY: &str = "total_energy";
/// Energy per atom, `(n_atoms,)`.
pub const PER_ATOM_ENERGY_KEY: &str = "atomic_energy";
/// Forces, `(n_atoms, 3)`.
pub const FORCE_KEY: &str = "force";

/// A batch of atomic graph data keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct AtomicDataDict {
    fields: BTreeMap<String, Tensor>,
}

impl AtomicDataDict {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Tensor) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Insert a field, returning the previous value
    pub fn insert(&mut self, key: impl Into<String>, value: Tensor) -> Option<Tensor> {
        self.fields.insert(key.into(), value)
    }

    /// Get a field if present
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.fields.get(key)
    }

    /// Get a field, failing with [`NequipError::MissingField`] if absent
    pub fn field(&self, key: &str) -> NequipResult<&Tensor> {
        self.fields
            .get(key)
            .ok_or_else(|| NequipError::missing_field(key))
    }

    /// Remove a field
    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.fields.remove(key)
    }

    /// Whether the field is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Field names in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Iterate fields in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether there are no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether the field is a tracked leaf variable.
    pub fn requires_grad(&self, key: &str) -> NequipResult<bool> {
        Ok(self.field(key)?.is_variable())
    }

    /// Mark or unmark the field as a tracked leaf variable.
    ///
    /// Turning tracking on replaces the tensor with a fresh variable holding
    /// the same values; turning it off detaches it.
    pub fn set_requires_grad(&mut self, key: &str, requires_grad: bool) -> NequipResult<()> {
        let current = self.field(key)?;
        if current.is_variable() == requires_grad {
            return Ok(());
        }
        let replacement = if requires_grad {
            Var::from_tensor(current)?.into_inner()
        } else {
            current.detach()
        };
        self.fields.insert(key.to_string(), replacement);
        Ok(())
    }

    /// Number of graphs in the batch. A dictionary without a
    /// [`BATCH_KEY`] field holds a single graph.
    pub fn num_graphs(&self) -> NequipResult<usize> {
        match self.get(BATCH_KEY) {
            None => Ok(1),
            Some(batch) => {
                let ids = batch.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
                Ok(ids.iter().max().map_or(0, |&m| m as usize + 1))
            }
        }
    }

    /// Number of atoms, read from [`POSITIONS_KEY`].
    pub fn num_atoms(&self) -> NequipResult<usize> {
        Ok(self.field(POSITIONS_KEY)?.dim(0)?)
    }
}

impl FromIterator<(String, Tensor)> for AtomicDataDict {
    fn from_iter<T: IntoIterator<Item = (String, Tensor)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

const ELEMENT_SYMBOLS: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk",
    "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh",
    "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Chemical symbol for an atomic number, if it is a known element.
pub fn chemical_symbol(z: u32) -> Option<&'static str> {
    z.checked_sub(1)
        .and_then(|i| ELEMENT_SYMBOLS.get(i as usize))
        .copied()
}

/// Maps atomic numbers onto species indices `0..n_species`.
#[derive(Debug, Clone)]
pub struct TypeMapper {
    allowed_species: Vec<u32>,
    lookup: HashMap<u32, u32>,
}

impl TypeMapper {
    /// Create a mapper; species indices follow ascending atomic number.
    ///
    /// # Errors
    ///
    /// Returns an error if `allowed_species` is empty.
    pub fn new(allowed_species: impl IntoIterator<Item = u32>) -> NequipResult<Self> {
        let mut allowed_species: Vec<u32> = allowed_species.into_iter().collect();
        allowed_species.sort_unstable();
        allowed_species.dedup();
        if allowed_species.is_empty() {
            return Err(NequipError::invalid_config("allowed_species must not be empty"));
        }
        let lookup = allowed_species
            .iter()
            .enumerate()
            .map(|(i, &z)| (z, i as u32))
            .collect();
        Ok(Self {
            allowed_species,
            lookup,
        })
    }

    /// Number of species
    pub fn num_species(&self) -> usize {
        self.allowed_species.len()
    }

    /// Atomic numbers in species-index order
    pub fn allowed_species(&self) -> &[u32] {
        &self.allowed_species
    }

    /// Human-readable labels in species-index order (chemical symbols
    /// where known).
    pub fn type_names(&self) -> Vec<String> {
        self.allowed_species
            .iter()
            .map(|&z| chemical_symbol(z).map_or_else(|| z.to_string(), str::to_string))
            .collect()
    }

    /// Add a [`SPECIES_INDEX_KEY`] field computed from [`ATOMIC_NUMBERS_KEY`].
    ///
    /// # Errors
    ///
    /// Returns an error if atomic numbers are missing or contain a species
    /// outside `allowed_species`.
    pub fn transform(&self, data: &mut AtomicDataDict) -> NequipResult<()> {
        let z = data.field(ATOMIC_NUMBERS_KEY)?;
        let device = z.device().clone();
        let shape = z.shape().clone();
        let numbers = z.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let indices = numbers
            .iter()
            .map(|z| {
                self.lookup.get(z).copied().ok_or_else(|| {
                    NequipError::data(format!("atomic number {z} is not an allowed species"))
                })
            })
            .collect::<NequipResult<Vec<u32>>>()?;
        data.insert(
            SPECIES_INDEX_KEY,
            Tensor::from_vec(indices, shape, &device)?,
        );
        Ok(())
    }
}

/// What [`AtomicInMemoryDataset::statistics`] computes for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsMode {
    /// Mean and unbiased standard deviation over all elements
    MeanStd,
    /// Root mean square over all elements
    Rms,
    /// Unique values and their counts
    Count,
}

impl std::str::FromStr for StatisticsMode {
    type Err = NequipError;

    fn from_str(s: &str) -> NequipResult<Self> {
        match s {
            "mean_std" => Ok(Self::MeanStd),
            "rms" => Ok(Self::Rms),
            "count" => Ok(Self::Count),
            other => Err(NequipError::invalid_config(format!(
                "unknown statistics mode '{other}'"
            ))),
        }
    }
}

/// Result of one field's statistics.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldStatistics {
    /// Mean and unbiased standard deviation
    MeanStd { mean: f64, std: f64 },
    /// Root mean square
    Rms(f64),
    /// Sorted unique values with their counts
    Count { unique: Vec<i64>, counts: Vec<usize> },
}

/// Frames held in memory.
///
/// Every frame must carry the same set of fields. Per-graph fields in a
/// single frame have a leading axis of length one.
#[derive(Debug, Clone)]
pub struct AtomicInMemoryDataset {
    frames: Vec<AtomicDataDict>,
}

impl AtomicInMemoryDataset {
    /// Create a dataset from frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the frames do not share the same fields.
    pub fn from_frames(frames: Vec<AtomicDataDict>) -> NequipResult<Self> {
        if let Some(first) = frames.first() {
            let keys: Vec<&str> = first.keys().collect();
            for (i, frame) in frames.iter().enumerate().skip(1) {
                if !frame.keys().eq(keys.iter().copied()) {
                    return Err(NequipError::data(format!(
                        "frame {i} has fields {:?}, expected {keys:?}",
                        frame.keys().collect::<Vec<_>>()
                    )));
                }
            }
        }
        Ok(Self { frames })
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether there are no frames
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame by index
    pub fn get(&self, index: usize) -> Option<&AtomicDataDict> {
        self.frames.get(index)
    }

    /// Apply a [`TypeMapper`] to every frame.
    pub fn with_type_mapper(mut self, mapper: &TypeMapper) -> NequipResult<Self> {
        for frame in &mut self.frames {
            mapper.transform(frame)?;
        }
        Ok(self)
    }

    /// A new dataset holding the selected frames, in the given order.
    ///
    /// # Errors
    ///
    /// Returns an error if an index is out of range.
    pub fn index_select(&self, indices: &[usize]) -> NequipResult<Self> {
        let frames = indices
            .iter()
            .map(|&i| {
                self.frames.get(i).cloned().ok_or_else(|| {
                    NequipError::data(format!("index {i} out of range for {} frames", self.len()))
                })
            })
            .collect::<NequipResult<Vec<_>>>()?;
        Ok(Self { frames })
    }

    /// Collated batches of at most `batch_size` frames, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is zero or collation fails.
    pub fn batches(&self, batch_size: usize) -> NequipResult<Vec<AtomicDataDict>> {
        if batch_size == 0 {
            return Err(NequipError::invalid_config("batch_size must be positive"));
        }
        self.frames.chunks(batch_size).map(collate).collect()
    }

    /// Statistics of the given fields over the whole dataset. `modes`
    /// defaults to [`StatisticsMode::MeanStd`] for every field.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is missing, the mode list has the wrong
    /// length, or the dataset is empty.
    pub fn statistics(
        &self,
        fields: &[&str],
        modes: Option<&[StatisticsMode]>,
    ) -> NequipResult<Vec<FieldStatistics>> {
        if self.is_empty() {
            return Err(NequipError::data("cannot compute statistics of an empty dataset"));
        }
        let modes = match modes {
            Some(m) if m.len() != fields.len() => {
                return Err(NequipError::mismatch("modes", fields.len(), m.len()))
            }
            Some(m) => m.to_vec(),
            None => vec![StatisticsMode::MeanStd; fields.len()],
        };

        fields
            .iter()
            .zip(modes)
            .map(|(&field, mode)| {
                let parts = self
                    .frames
                    .iter()
                    .map(|f| f.field(field)?.flatten_all().map_err(NequipError::from))
                    .collect::<NequipResult<Vec<_>>>()?;
                let values = Tensor::cat(&parts, 0)?;
                field_statistics(&values, mode)
            })
            .collect()
    }
}

fn field_statistics(values: &Tensor, mode: StatisticsMode) -> NequipResult<FieldStatistics> {
    match mode {
        StatisticsMode::MeanStd => {
            let mut stats = RunningStats::new(vec![], Reduction::Mean, vec![], values.device())?;
            let mean = stats.accumulate_batch(values, None)?.to_scalar::<f64>()?;
            let n = values.elem_count();
            let host = values.to_dtype(DType::F64)?.to_vec1::<f64>()?;
            let std = if n > 1 {
                let ss: f64 = host.iter().map(|v| (v - mean).powi(2)).sum();
                (ss / (n - 1) as f64).sqrt()
            } else {
                f64::NAN
            };
            Ok(FieldStatistics::MeanStd { mean, std })
        }
        StatisticsMode::Rms => {
            let mut stats = RunningStats::new(vec![], Reduction::Rms, vec![], values.device())?;
            let rms = stats.accumulate_batch(values, None)?.to_scalar::<f64>()?;
            Ok(FieldStatistics::Rms(rms))
        }
        StatisticsMode::Count => {
            let host = values.to_dtype(DType::F64)?.to_vec1::<f64>()?;
            let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
            for v in host {
                *counts.entry(v.round() as i64).or_insert(0) += 1;
            }
            let (unique, counts) = counts.into_iter().unzip();
            Ok(FieldStatistics::Count { unique, counts })
        }
    }
}

/// Concatenate frames into one batch and add the [`BATCH_KEY`] field.
///
/// # Errors
///
/// Returns an error on an empty slice, a frame without positions, or
/// fields that cannot be concatenated.
pub fn collate(frames: &[AtomicDataDict]) -> NequipResult<AtomicDataDict> {
    let first = frames
        .first()
        .ok_or_else(|| NequipError::data("cannot collate an empty batch"))?;
    let device = first.field(POSITIONS_KEY)?.device().clone();

    let mut batch = AtomicDataDict::new();
    for key in first.keys().filter(|k| *k != BATCH_KEY) {
        let parts = frames
            .iter()
            .map(|f| f.field(key))
            .collect::<NequipResult<Vec<_>>>()?;
        batch.insert(key, Tensor::cat(&parts, 0)?);
    }

    let mut graph_index = Vec::new();
    for (i, frame) in frames.iter().enumerate() {
        graph_index.extend(std::iter::repeat(i as u32).take(frame.num_atoms()?));
    }
    let n_atoms = graph_index.len();
    batch.insert(BATCH_KEY, Tensor::from_vec(graph_index, n_atoms, &device)?);
    Ok(batch)
}
