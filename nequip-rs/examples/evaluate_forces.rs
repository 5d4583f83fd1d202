//! Score a force field against reference forces.
//!
//! Builds a toy harmonic energy model, wraps it so that it also predicts
//! forces, and evaluates it on random frames whose reference forces come
//! from a slightly different harmonic model.
//!
//! Usage:
//!   cargo run --example evaluate_forces
//!   cargo run --example evaluate_forces -- path/to/evaluate.yaml

use candle_core::{Device, Tensor};
use candle_nn::{Linear, Module};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use nequip_rs::irreps::irreps_dict;
use nequip_rs::prelude::*;

/// Per-atom energy `sum_c k_c r_c^2`, summed per graph.
struct Harmonic {
    linear: Linear,
    irreps_in: IrrepsDict,
    irreps_out: IrrepsDict,
}

impl Harmonic {
    fn new(k: [f32; 3], device: &Device) -> anyhow::Result<Self> {
        let irreps_in = irreps_dict([(POSITIONS_KEY, Some("1o"))])?;
        let mut irreps_out = irreps_in.clone();
        irreps_out.insert(TOTAL_ENERGY_KEY.to_string(), Some(Irreps::scalar()));
        Ok(Self {
            linear: Linear::new(Tensor::new(&[k], device)?, None),
            irreps_in,
            irreps_out,
        })
    }
}

impl GraphModule for Harmonic {
    fn irreps_in(&self) -> &IrrepsDict {
        &self.irreps_in
    }

    fn irreps_out(&self) -> &IrrepsDict {
        &self.irreps_out
    }

    fn forward(&self, data: &mut AtomicDataDict) -> NequipResult<()> {
        let pos = data.field(POSITIONS_KEY)?;
        let atomic = self.linear.forward(&pos.sqr()?)?.squeeze(1)?;
        let graph = data.field(BATCH_KEY)?;
        let n_graphs = data.num_graphs()?;
        let zeros = Tensor::zeros(n_graphs, atomic.dtype(), atomic.device())?;
        let total = zeros.index_add(graph, &atomic, 0)?;
        data.insert(TOTAL_ENERGY_KEY, total);
        Ok(())
    }
}

fn random_frames(
    n_frames: usize,
    k_ref: [f32; 3],
    device: &Device,
) -> anyhow::Result<Vec<AtomicDataDict>> {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let mut frames = Vec::with_capacity(n_frames);
    for _ in 0..n_frames {
        let n_atoms = rng.gen_range(3..12);
        let positions: Vec<f32> = (0..n_atoms * 3).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let forces: Vec<f32> = positions
            .iter()
            .enumerate()
            .map(|(i, r)| -2.0 * k_ref[i % 3] * r)
            .collect();
        let numbers: Vec<u32> = (0..n_atoms)
            .map(|_| if rng.gen_bool(0.3) { 8 } else { 1 })
            .collect();
        frames.push(
            AtomicDataDict::new()
                .with(POSITIONS_KEY, Tensor::from_vec(positions, (n_atoms, 3), device)?)
                .with(FORCE_KEY, Tensor::from_vec(forces, (n_atoms, 3), device)?)
                .with(ATOMIC_NUMBERS_KEY, Tensor::from_vec(numbers, n_atoms, device)?),
        );
    }
    Ok(frames)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("nequip_rs=debug".parse()?),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EvaluateConfig::from_file(path)?,
        None => EvaluateConfig {
            batch_size: 8,
            allowed_species: Some(vec![1, 8]),
            ..Default::default()
        },
    };
    config.validate()?;

    let device = Device::Cpu;
    let mapper = TypeMapper::new(config.allowed_species.clone().unwrap_or_else(|| vec![1, 8]))?;
    let dataset = AtomicInMemoryDataset::from_frames(random_frames(100, [1.0, 1.0, 1.5], &device)?)?
        .with_type_mapper(&mapper)?;

    let mut model = force_output(Harmonic::new([1.0, 1.1, 1.5], &device)?)?;
    let mut metrics = Metrics::new(config.metrics_components.clone())?;
    let labels = mapper.type_names();
    let report = evaluate(
        &mut model,
        &dataset,
        config.batch_size,
        &mut metrics,
        Some(&labels),
    )?;

    println!("=== Evaluation over {} frames ===", dataset.len());
    for (name, value) in &report {
        println!("{name:>16}: {value:.6}");
    }
    Ok(())
}
