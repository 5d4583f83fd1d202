//! Streaming metrics over batches of varying size.

mod common;

use candle_core::{Device, Tensor};
use common::matrix;
use nequip_rs::prelude::*;
use nequip_rs::train::MetricValues;

fn force_dict(rows: &[[f32; 3]]) -> AtomicDataDict {
    AtomicDataDict::new().with(FORCE_KEY, matrix(rows, &Device::Cpu))
}

fn with_species(rows: &[[f32; 3]], species: &[u32]) -> AtomicDataDict {
    force_dict(rows).with(
        SPECIES_INDEX_KEY,
        Tensor::from_vec(species.to_vec(), species.len(), &Device::Cpu).unwrap(),
    )
}

fn pred_rows() -> Vec<[f32; 3]> {
    vec![
        [0.3, -1.2, 0.8],
        [2.0, 0.1, -0.4],
        [-0.7, 0.6, 1.5],
        [0.0, -0.2, 0.9],
        [1.1, 1.1, -1.3],
        [-2.2, 0.4, 0.05],
    ]
}

fn ref_rows() -> Vec<[f32; 3]> {
    vec![[0.0; 3]; 6]
}

fn scalar(values: &MetricValues, key: &str, reduction: &str) -> f64 {
    values[&MetricKey::new(key, reduction)].to_scalar::<f64>().unwrap()
}

#[test]
fn test_per_component_rmse_scenario() {
    let options = ComponentOptions {
        report_per_component: true,
        ..Default::default()
    };
    let mut metrics = Metrics::new([(FORCE_KEY, "rmse", options)]).unwrap();
    let values = metrics
        .accumulate(
            &force_dict(&[[1., 0., 0.], [0., 2., 0.]]),
            &force_dict(&[[0.; 3], [0.; 3]]),
        )
        .unwrap();
    let rmse = values[&MetricKey::new(FORCE_KEY, "rmse")].to_vec1::<f64>().unwrap();
    assert!((rmse[0] - 0.70710678).abs() < 1e-6);
    assert!((rmse[1] - 1.41421356).abs() < 1e-6);
    assert!(rmse[2].abs() < 1e-12);

    let (flat, skip) = metrics.flatten_metrics(&values, None).unwrap();
    assert_eq!(
        flat.keys().cloned().collect::<Vec<_>>(),
        vec!["f_rmse_0", "f_rmse_1", "f_rmse_2"]
    );
    assert!(skip.is_empty());
}

#[test]
fn test_four_element_component_is_rejected() {
    let value: serde_yaml::Value = serde_yaml::from_str("[force, rmse, {}, extra]").unwrap();
    let err = ComponentSpec::parse(&value).unwrap_err();
    assert!(matches!(err, NequipError::InvalidConfiguration(_)));

    let err = MetricsConfig::from_yaml_str("metrics_components:\n  - [force, rmse, {}, extra]");
    assert!(err.is_err());
}

#[test]
fn test_batch_size_invariance() {
    let pred = pred_rows();
    let reference = ref_rows();
    let mut whole = Metrics::new([(FORCE_KEY, "mae"), (FORCE_KEY, "rmse")]).unwrap();
    whole.accumulate(&force_dict(&pred), &force_dict(&reference)).unwrap();
    let expected = whole.current_result().unwrap();

    for chunk in [1, 2, 4, 5] {
        let mut streamed = Metrics::new([(FORCE_KEY, "mae"), (FORCE_KEY, "rmse")]).unwrap();
        for (p, r) in pred.chunks(chunk).zip(reference.chunks(chunk)) {
            streamed.accumulate(&force_dict(p), &force_dict(r)).unwrap();
        }
        let got = streamed.current_result().unwrap();
        for reduction in ["mae", "rmse"] {
            let a = scalar(&got, FORCE_KEY, reduction);
            let b = scalar(&expected, FORCE_KEY, reduction);
            assert!((a - b).abs() < 1e-5, "{reduction} with batches of {chunk}: {a} vs {b}");
        }
    }
}

#[test]
fn test_accumulate_returns_running_aggregate() {
    let mut metrics = Metrics::new([FORCE_KEY]).unwrap();
    metrics
        .accumulate(&force_dict(&[[3., 3., 3.]]), &force_dict(&[[0.; 3]]))
        .unwrap();
    let second = metrics
        .accumulate(&force_dict(&[[1., 1., 1.]]), &force_dict(&[[0.; 3]]))
        .unwrap();
    assert!((scalar(&second, FORCE_KEY, "mae") - 2.0).abs() < 1e-12);
}

#[test]
fn test_current_result_is_idempotent() {
    let mut metrics = Metrics::new([(FORCE_KEY, "mae"), (FORCE_KEY, "rmse")]).unwrap();
    metrics
        .accumulate(&force_dict(&pred_rows()), &force_dict(&ref_rows()))
        .unwrap();
    let first = metrics.current_result().unwrap();
    let second = metrics.current_result().unwrap();
    for key in metrics.metric_keys() {
        assert_eq!(
            first[&key].to_scalar::<f64>().unwrap(),
            second[&key].to_scalar::<f64>().unwrap()
        );
    }
}

#[test]
fn test_reset_then_single_batch() {
    let components = || {
        let per_species = ComponentOptions {
            per_species: true,
            ..Default::default()
        };
        Metrics::new([
            ComponentSpec::new(FORCE_KEY, "mae"),
            ComponentSpec::new(FORCE_KEY, "rmse"),
            ComponentSpec::new(FORCE_KEY, "mean").with_options(per_species),
        ])
        .unwrap()
    };
    let mut metrics = components();
    metrics
        .accumulate(
            &with_species(&pred_rows(), &[0, 1, 1, 2, 0, 1]),
            &force_dict(&ref_rows()),
        )
        .unwrap();
    metrics.reset().unwrap();

    let cleared = metrics.current_result().unwrap();
    assert_eq!(cleared.len(), 3);
    assert_eq!(scalar(&cleared, FORCE_KEY, "mae"), 0.0);
    assert_eq!(scalar(&cleared, FORCE_KEY, "rmse"), 0.0);
    let by_species = &cleared[&MetricKey::new(FORCE_KEY, "mean")];
    assert_eq!(by_species.dims(), &[1]);
    assert_eq!(by_species.to_vec1::<f64>().unwrap(), vec![0.0]);
    assert_eq!(metrics.per_species_counts(FORCE_KEY, "mean").unwrap(), &[0.0]);
    assert!(metrics.statistic(FORCE_KEY, "mean").unwrap().is_binned());

    let batch = [[0.5, -0.5, 1.0], [2.0, 0.0, 0.0]];
    let after_reset = metrics
        .accumulate(&with_species(&batch, &[0, 1]), &force_dict(&[[0.; 3]; 2]))
        .unwrap();

    let mut fresh = components();
    let expected = fresh
        .accumulate(&with_species(&batch, &[0, 1]), &force_dict(&[[0.; 3]; 2]))
        .unwrap();
    for reduction in ["mae", "rmse", "mean"] {
        let key = MetricKey::new(FORCE_KEY, reduction);
        let a = after_reset[&key].flatten_all().unwrap().to_vec1::<f64>().unwrap();
        let b = expected[&key].flatten_all().unwrap().to_vec1::<f64>().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-12, "{key}: {x} vs {y}");
        }
    }
}

#[test]
fn test_per_species_weighted_sum_matches_total() {
    let species_options = ComponentOptions {
        per_species: true,
        ..Default::default()
    };
    let mut metrics = Metrics::new([
        ComponentSpec::new(FORCE_KEY, "mae"),
        ComponentSpec::new(FORCE_KEY, "rmse"),
        ComponentSpec::new(FORCE_KEY, "mean").with_options(species_options.clone()),
        ComponentSpec::new(FORCE_KEY, "rms").with_options(species_options),
    ])
    .unwrap();

    let pred = pred_rows();
    let species = [0, 1, 1, 2, 0, 1];
    for (p, s) in pred.chunks(4).zip(species.chunks(4)) {
        metrics
            .accumulate(&with_species(p, s), &force_dict(&vec![[0.; 3]; p.len()]))
            .unwrap();
    }
    let result = metrics.current_result().unwrap();

    let counts = metrics.per_species_counts(FORCE_KEY, "mean").unwrap().to_vec();
    assert_eq!(counts, vec![6.0, 9.0, 3.0]);
    let total: f64 = counts.iter().sum();

    let mean = result[&MetricKey::new(FORCE_KEY, "mean")].to_vec1::<f64>().unwrap();
    let weighted: f64 = mean.iter().zip(&counts).map(|(m, c)| m * c).sum::<f64>() / total;
    assert!((weighted - scalar(&result, FORCE_KEY, "mae")).abs() < 1e-6);

    let rms = result[&MetricKey::new(FORCE_KEY, "rms")].to_vec1::<f64>().unwrap();
    let weighted: f64 = rms.iter().zip(&counts).map(|(r, c)| r * r * c).sum::<f64>() / total;
    assert!((weighted.sqrt() - scalar(&result, FORCE_KEY, "rmse")).abs() < 1e-6);
}

#[test]
fn test_flatten_per_species_names() {
    let options = ComponentOptions {
        per_species: true,
        ..Default::default()
    };
    let mut metrics = Metrics::new([(FORCE_KEY, "mae", options)]).unwrap();
    metrics
        .accumulate(
            &with_species(&[[1., 1., 1.], [3., 3., 3.]], &[0, 1]),
            &force_dict(&[[0.; 3]; 2]),
        )
        .unwrap();
    let result = metrics.current_result().unwrap();

    let (flat, skip) = metrics.flatten_metrics(&result, None).unwrap();
    assert_eq!(flat["0_f_mae"], 1.0);
    assert_eq!(flat["1_f_mae"], 3.0);
    assert_eq!(flat["all_f_mae"], 2.0);
    assert!(skip.is_empty());

    let labels = TypeMapper::new([1, 8]).unwrap().type_names();
    let (flat, _) = metrics.flatten_metrics(&result, Some(&labels)).unwrap();
    assert_eq!(flat["H_f_mae"], 1.0);
    assert_eq!(flat["O_f_mae"], 3.0);
}

#[test]
fn test_energy_statistics_are_scalars() {
    let mut metrics = Metrics::new([TOTAL_ENERGY_KEY]).unwrap();
    let pred = AtomicDataDict::new().with(
        TOTAL_ENERGY_KEY,
        Tensor::new(&[1f32, -2.0, 4.0], &Device::Cpu).unwrap(),
    );
    let reference = AtomicDataDict::new().with(
        TOTAL_ENERGY_KEY,
        Tensor::new(&[0f32, 0.0, 0.0], &Device::Cpu).unwrap(),
    );
    metrics.accumulate(&pred, &reference).unwrap();
    let (flat, _) = metrics
        .flatten_metrics(&metrics.current_result().unwrap(), None)
        .unwrap();
    assert!((flat["e_mae"] - 7.0 / 3.0).abs() < 1e-9);
    assert!(metrics.statistic(TOTAL_ENERGY_KEY, "mae").unwrap().dim().is_empty());
}

#[test]
fn test_missing_species_index() {
    let options = ComponentOptions {
        per_species: true,
        ..Default::default()
    };
    let mut metrics = Metrics::new([(FORCE_KEY, "mae", options)]).unwrap();
    let err = metrics
        .accumulate(&force_dict(&[[1.; 3]]), &force_dict(&[[0.; 3]]))
        .unwrap_err();
    assert!(matches!(err, NequipError::MissingField(ref k) if k == SPECIES_INDEX_KEY));
}

#[test]
fn test_move_to_device_keeps_state() {
    let mut metrics = Metrics::new([FORCE_KEY]).unwrap();
    metrics
        .accumulate(&force_dict(&[[3.; 3]]), &force_dict(&[[0.; 3]]))
        .unwrap();
    metrics.to(&Device::Cpu).unwrap();
    let result = metrics.current_result().unwrap();
    assert_eq!(scalar(&result, FORCE_KEY, "mae"), 3.0);
}
