use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nequip_rs::config::{ComponentOptions, ComponentSpec, MetricsConfig};
use nequip_rs::data::{AtomicDataDict, FORCE_KEY, SPECIES_INDEX_KEY};
use nequip_rs::train::Metrics;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const METRICS_YAML: &str = r#"
metrics_components:
  - [force, mae]
  - [force, rmse]
  - [force, rmse, {report_per_component: true}]
  - [total_energy, mae]
  - [force, mae, {PerSpecies: true}]
"#;

// Random forces and species for `n_atoms` atoms
fn batch(rng: &mut ChaCha8Rng, n_atoms: usize, n_species: u32) -> AtomicDataDict {
    let device = Device::Cpu;
    let forces: Vec<f32> = (0..n_atoms * 3).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let species: Vec<u32> = (0..n_atoms).map(|_| rng.gen_range(0..n_species)).collect();
    AtomicDataDict::new()
        .with(
            FORCE_KEY,
            Tensor::from_vec(forces, (n_atoms, 3), &device).unwrap(),
        )
        .with(
            SPECIES_INDEX_KEY,
            Tensor::from_vec(species, n_atoms, &device).unwrap(),
        )
}

fn components(per_species: bool) -> Vec<ComponentSpec> {
    let options = ComponentOptions {
        per_species,
        ..Default::default()
    };
    vec![
        ComponentSpec::new(FORCE_KEY, "mae").with_options(options.clone()),
        ComponentSpec::new(FORCE_KEY, "rmse").with_options(options),
    ]
}

fn bench_accumulate(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut group = c.benchmark_group("metrics_accumulate");
    for n_atoms in [64, 1024, 16384] {
        let pred = batch(&mut rng, n_atoms, 4);
        let reference = batch(&mut rng, n_atoms, 4);
        group.bench_with_input(format!("atoms_{n_atoms}"), &n_atoms, |b, _| {
            let mut metrics = Metrics::new(components(false)).unwrap();
            b.iter(|| black_box(metrics.accumulate(&pred, &reference).unwrap()));
        });
        group.bench_with_input(format!("per_species_atoms_{n_atoms}"), &n_atoms, |b, _| {
            let mut metrics = Metrics::new(components(true)).unwrap();
            b.iter(|| black_box(metrics.accumulate(&pred, &reference).unwrap()));
        });
    }
    group.finish();
}

fn bench_flatten(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let pred = batch(&mut rng, 512, 8);
    let reference = batch(&mut rng, 512, 8);
    let mut metrics = Metrics::new(components(true)).unwrap();
    metrics.accumulate(&pred, &reference).unwrap();
    let result = metrics.current_result().unwrap();

    c.bench_function("flatten_metrics", |b| {
        b.iter(|| black_box(metrics.flatten_metrics(&result, None).unwrap()));
    });
}

fn bench_config_parsing(c: &mut Criterion) {
    c.bench_function("metrics_config_from_yaml", |b| {
        b.iter(|| MetricsConfig::from_yaml_str(black_box(METRICS_YAML)).unwrap());
    });
}

criterion_group!(benches, bench_accumulate, bench_flatten, bench_config_parsing);
criterion_main!(benches);
