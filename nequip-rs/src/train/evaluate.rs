//! One pass of a model over a dataset, scored by [`Metrics`].

use std::collections::BTreeMap;

use crate::data::{AtomicDataDict, AtomicInMemoryDataset};
use crate::error::NequipResult;
use crate::nn::GraphModule;
use crate::train::metrics::Metrics;

/// Run `model` over `dataset` in evaluation mode and report the flattened
/// metrics.
///
/// Each batch is scored with the model's output on a copy of the batch as the
/// prediction and the batch itself as the reference. `metrics` is reset
/// first, so the report covers exactly this dataset and does not depend on
/// `batch_size`. The model's training flag is restored afterwards.
///
/// # Errors
///
/// Returns an error for a zero batch size or if the model or the metrics
/// fail on a batch.
pub fn evaluate<M: GraphModule>(
    model: &mut M,
    dataset: &AtomicInMemoryDataset,
    batch_size: usize,
    metrics: &mut Metrics,
    allowed_species: Option<&[String]>,
) -> NequipResult<BTreeMap<String, f64>> {
    let batches = dataset.batches(batch_size)?;
    let was_training = model.training();
    model.set_training(false);

    let result = score(model, &batches, metrics, allowed_species);

    model.set_training(was_training);
    let flat = result?;
    tracing::info!(
        n_frames = dataset.len(),
        n_batches = batches.len(),
        metrics = ?flat,
        "evaluation finished"
    );
    Ok(flat)
}

fn score<M: GraphModule>(
    model: &M,
    batches: &[AtomicDataDict],
    metrics: &mut Metrics,
    allowed_species: Option<&[String]>,
) -> NequipResult<BTreeMap<String, f64>> {
    metrics.reset()?;
    for (i, batch) in batches.iter().enumerate() {
        let mut pred = batch.clone();
        model.forward(&mut pred)?;
        metrics.accumulate(&pred, batch)?;
        tracing::trace!(batch = i, "accumulated batch");
    }
    let (flat, _) = metrics.flatten_metrics(&metrics.current_result()?, allowed_species)?;
    Ok(flat)
}
