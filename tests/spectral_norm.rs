//! Spectral-norm estimates checked against a full SVD.

use rustygan::asg::DType;
use rustygan::init;
use rustygan::nn::{Linear, LinearConfig, Mode, SpectralNorm};
use rustygan::params::{ParamKind, ParameterStore};
use rustygan::runtime::compiled::CompiledGraph;
use rustygan::runtime::cpu_backend::CpuBackend;
use rustygan::tensor::{GraphContext, Tensor};

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use proptest::prelude::*;
use proptest::test_runner::Config;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

const TRAIN_RUNS: usize = 25;

/// Largest singular value of `weight` viewed as `[shape[0], rest]`.
fn reference_sigma(weight: &ArrayD<f32>) -> f64 {
    let rows = weight.shape()[0];
    let cols = weight.len() / rows;
    let data: Vec<f64> = weight.iter().map(|&v| v as f64).collect();
    DMatrix::from_row_slice(rows, cols, &data).singular_values().max()
}

/// Rank-one spike of strength `spike` plus small Gaussian noise, reshaped to `shape`.
fn planted_weight(shape: &[usize], spike: f32, seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = shape[0];
    let cols: usize = shape[1..].iter().product();
    let a = init::unit_gaussian(&[rows, 1], &mut rng).into_shape((rows, 1)).unwrap();
    let b = init::unit_gaussian(&[1, cols], &mut rng).into_shape((1, cols)).unwrap();
    let noise = Array2::<f32>::random_using((rows, cols), StandardNormal, &mut rng) * 0.05;
    (a.dot(&b) * spike + noise).into_shape(IxDyn(shape)).unwrap()
}

/// Runs the power iteration `TRAIN_RUNS` times in training mode and returns
/// the final sigma estimate.
fn estimate_sigma(weight: &ArrayD<f32>, seed: u64) -> (f32, ParameterStore) {
    let ctx = GraphContext::shared();
    let shape = weight.shape().to_vec();
    let w = Tensor::new_parameter(&ctx, "w", shape.clone(), ParamKind::ConvWeight);
    let sn = SpectralNorm::new(&ctx, "w", &w, &shape, 1e-12);
    let (_, sigma) = sn.normalized_with_sigma(Mode::Train);
    let updates = ctx.borrow_mut().drain_state_updates();
    let compiled = CompiledGraph::compile(&ctx, &[&sigma], updates, &HashMap::new()).unwrap();

    let mut store = init::initialize(ctx.borrow().registry(), &mut StdRng::seed_from_u64(seed));
    store.set_parameter("w", weight.clone());

    let backend = CpuBackend::new();
    let mut estimate = 0.0;
    for _ in 0..TRAIN_RUNS {
        let out = compiled.run(&backend, &HashMap::new(), &mut store).unwrap();
        estimate = out[0].iter().copied().next().unwrap();
    }
    (estimate, store)
}

#[test]
fn test_sigma_matches_svd_for_conv_kernel() {
    let weight = planted_weight(&[6, 3, 2, 2], 4.0, 17);
    let (estimate, store) = estimate_sigma(&weight, 3);
    let truth = reference_sigma(&weight);

    let relative = ((estimate as f64) - truth).abs() / truth;
    assert!(relative < 0.01, "sigma {} vs svd {} ({}% off)", estimate, truth, relative * 100.0);
    assert_eq!(store.state("w.u").unwrap().shape(), &[6, 1]);
}

#[test]
fn test_normalized_linear_has_unit_spectral_norm() {
    let ctx = GraphContext::shared();
    let fc = Linear::from_config(&ctx, "fc", LinearConfig::new(10, 5).with_spectral_norm(1e-12));
    let train_weight = fc.effective_weight(Mode::Train);
    let updates = ctx.borrow_mut().drain_state_updates();
    let train = CompiledGraph::compile(&ctx, &[&train_weight], updates, &HashMap::new()).unwrap();
    let eval_weight = fc.effective_weight(Mode::Eval);
    let eval = CompiledGraph::compile(&ctx, &[&eval_weight], vec![], &HashMap::new()).unwrap();

    let mut store = init::initialize(ctx.borrow().registry(), &mut StdRng::seed_from_u64(8));
    store.set_parameter("fc.weight", planted_weight(&[5, 10], 3.0, 21));

    let backend = CpuBackend::new();
    for _ in 0..TRAIN_RUNS {
        train.run(&backend, &HashMap::new(), &mut store).unwrap();
    }
    let u_after_training = store.state("fc.weight.u").unwrap().clone();

    let normalized = eval.run(&backend, &HashMap::new(), &mut store).unwrap().remove(0);
    assert!((reference_sigma(&normalized) - 1.0).abs() < 0.01);
    assert_eq!(store.state("fc.weight.u").unwrap(), &u_after_training);
}

#[test]
fn test_unused_input_shapes_are_not_required() {
    // The spectral-norm graph has no inputs, so compiling with extra input
    // shapes is harmless.
    let ctx = GraphContext::shared();
    let w = Tensor::new_parameter(&ctx, "w", vec![2, 3], ParamKind::LinearWeight);
    let sn = SpectralNorm::new(&ctx, "w", &w, &[2, 3], 1e-12);
    let normalized = sn.normalized(Mode::Eval);
    let shapes = HashMap::from([("unused".to_string(), (vec![1], DType::F32))]);
    let compiled = CompiledGraph::compile(&ctx, &[&normalized], vec![], &shapes).unwrap();
    assert!(compiled.input_names().is_empty());
    assert_eq!(compiled.output_shapes(), vec![vec![2, 3]]);
}

proptest! {
    #![proptest_config(Config::with_cases(12))]

    #[test]
    fn prop_sigma_converges_for_planted_spikes(
        spike in 1.5f32..8.0,
        seed in 0u64..1000,
    ) {
        let weight = planted_weight(&[4, 8], spike, seed);
        let (estimate, _) = estimate_sigma(&weight, seed.wrapping_add(1));
        let truth = reference_sigma(&weight);
        prop_assert!(((estimate as f64) - truth).abs() / truth < 0.01);
    }
}
