//! Shared fixtures: a small learnable energy model and random frames.

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module};
use nequip_rs::irreps::irreps_dict;
use nequip_rs::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Per-atom energy `sum_c w_c r_c^2 + b` summed per graph, so
/// `force_c = -2 w_c r_c`.
pub struct QuadraticEnergy {
    linear: Linear,
    training: bool,
    irreps_in: IrrepsDict,
    irreps_out: IrrepsDict,
}

impl QuadraticEnergy {
    pub fn new(w: [f32; 3], bias: f32) -> Self {
        Self::with_weight(Tensor::new(&[w], &Device::Cpu).unwrap(), bias)
    }

    /// Model whose weight is a trainable variable, returned alongside it.
    pub fn learnable(w: [f32; 3], bias: f32) -> (Self, Var) {
        let weight = Var::new(&[w], &Device::Cpu).unwrap();
        (Self::with_weight(weight.as_tensor().clone(), bias), weight)
    }

    fn with_weight(weight: Tensor, bias: f32) -> Self {
        let bias = Tensor::new(&[bias], weight.device()).unwrap();
        let irreps_in = irreps_dict([(POSITIONS_KEY, Some("1o"))]).unwrap();
        let mut irreps_out = irreps_in.clone();
        irreps_out.insert(TOTAL_ENERGY_KEY.into(), Some(Irreps::scalar()));
        irreps_out.insert(PER_ATOM_ENERGY_KEY.into(), Some(Irreps::scalar()));
        Self {
            linear: Linear::new(weight, Some(bias)),
            training: false,
            irreps_in,
            irreps_out,
        }
    }

    /// Forces this model predicts at `positions`, computed by hand.
    pub fn expected_forces(w: [f32; 3], positions: &[[f32; 3]]) -> Vec<[f32; 3]> {
        positions
            .iter()
            .map(|r| [-2. * w[0] * r[0], -2. * w[1] * r[1], -2. * w[2] * r[2]])
            .collect()
    }
}

impl GraphModule for QuadraticEnergy {
    fn irreps_in(&self) -> &IrrepsDict {
        &self.irreps_in
    }

    fn irreps_out(&self) -> &IrrepsDict {
        &self.irreps_out
    }

    fn forward(&self, data: &mut AtomicDataDict) -> NequipResult<()> {
        let pos = data.field(POSITIONS_KEY)?;
        let device = pos.device().clone();
        let n_atoms = pos.dim(0)?;
        let atomic = self.linear.forward(&pos.sqr()?)?;

        let graph: Vec<u32> = match data.get(BATCH_KEY) {
            Some(b) => b.to_vec1::<u32>()?,
            None => vec![0; n_atoms],
        };
        let n_graphs = data.num_graphs()?;
        let mut one_hot = vec![0f32; n_graphs * n_atoms];
        for (atom, &g) in graph.iter().enumerate() {
            one_hot[g as usize * n_atoms + atom] = 1.0;
        }
        let one_hot = Tensor::from_vec(one_hot, (n_graphs, n_atoms), &device)?;
        let total = one_hot.matmul(&atomic)?.squeeze(1)?;

        data.insert(PER_ATOM_ENERGY_KEY, atomic.squeeze(1)?);
        data.insert(TOTAL_ENERGY_KEY, total);
        Ok(())
    }

    fn training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// A frame of `n_atoms` random atoms drawn from hydrogen and oxygen, with
/// reference forces from a quadratic model with weights `w_ref`.
pub fn random_frame(rng: &mut ChaCha8Rng, n_atoms: usize, w_ref: [f32; 3]) -> AtomicDataDict {
    let device = Device::Cpu;
    let positions: Vec<[f32; 3]> = (0..n_atoms)
        .map(|_| [rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)])
        .collect();
    let numbers: Vec<u32> = (0..n_atoms)
        .map(|_| if rng.gen_bool(0.5) { 1 } else { 8 })
        .collect();
    let forces = QuadraticEnergy::expected_forces(w_ref, &positions);
    let energy: f32 = positions
        .iter()
        .map(|r| w_ref[0] * r[0] * r[0] + w_ref[1] * r[1] * r[1] + w_ref[2] * r[2] * r[2])
        .sum();

    AtomicDataDict::new()
        .with(POSITIONS_KEY, matrix(&positions, &device))
        .with(FORCE_KEY, matrix(&forces, &device))
        .with(
            ATOMIC_NUMBERS_KEY,
            Tensor::from_vec(numbers, n_atoms, &device).unwrap(),
        )
        .with(TOTAL_ENERGY_KEY, Tensor::new(&[energy], &device).unwrap())
}

/// `n_frames` random frames of 2 to 6 atoms with species indices.
pub fn random_dataset(seed: u64, n_frames: usize, w_ref: [f32; 3]) -> AtomicInMemoryDataset {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let frames = (0..n_frames)
        .map(|_| {
            let n = rng.gen_range(2..=6);
            random_frame(&mut rng, n, w_ref)
        })
        .collect();
    let mapper = TypeMapper::new([1, 8]).unwrap();
    AtomicInMemoryDataset::from_frames(frames)
        .unwrap()
        .with_type_mapper(&mapper)
        .unwrap()
}

pub fn matrix(rows: &[[f32; 3]], device: &Device) -> Tensor {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), 3), device).unwrap()
}

pub fn rows(t: &Tensor) -> Vec<Vec<f32>> {
    t.to_dtype(DType::F32).unwrap().to_vec2::<f32>().unwrap()
}
