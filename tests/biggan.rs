//! End-to-end checks of the generator and discriminator.

use rustygan::asg::DType;
use rustygan::gan::Generator;
use rustygan::nn::{Module, SelfAttention};
use rustygan::runtime::compiled::CompiledGraph;
use rustygan::runtime::cpu_backend::CpuBackend;
use rustygan::tensor::{GraphContext, Tensor};
use rustygan::{infer_shapes, init, BigGan, BigGanConfig, GanError, Mode};

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use proptest::prelude::*;
use proptest::test_runner::Config;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

fn notebook_config() -> BigGanConfig {
    BigGanConfig { n_classes: 5, ..BigGanConfig::default() }
}

#[test]
fn test_default_network_produces_128px_images() {
    let report = infer_shapes(&notebook_config(), 5).unwrap();
    assert_eq!(report.image, vec![5, 3, 128, 128]);
    assert_eq!(report.score, vec![5, 1]);
    assert!(report.generator_parameters > 0);
    assert!(report.discriminator_parameters > 0);
}

#[test]
fn test_noise_is_split_into_six_chunks_of_twenty() {
    let config = notebook_config();
    let ctx = GraphContext::shared();
    let generator = Generator::new(&ctx, &config);
    let noise = Tensor::new_input(&ctx, "noise");
    let chunks = generator.split_noise(&noise);
    let refs: Vec<&Tensor> = chunks.iter().collect();

    let shapes = HashMap::from([("noise".to_string(), (vec![4, 120], DType::F32))]);
    let compiled = CompiledGraph::compile(&ctx, &refs, vec![], &shapes).unwrap();
    assert_eq!(compiled.output_shapes(), vec![vec![4, 20]; 6]);

    assert_eq!(generator.proj_z.config.in_features, 20);
    for stage in &generator.stages {
        assert_eq!(stage.block.bn1.class_scale_transform.config.in_features, 148);
        assert_eq!(stage.block.bn2.class_shift_transform.config.in_features, 148);
    }
}

#[test]
fn test_generated_images_are_bounded_and_scored() {
    let mut gan = BigGan::new(BigGanConfig::tiny(), 42).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let labels = [2usize, 0, 1, 1];
    let noise = ArrayD::<f32>::random_using(IxDyn(&[4, 12]), StandardNormal, &mut rng) * 3.0;

    let embedding = gan.embed(&labels).unwrap();
    let images = gan.generate(&noise, &embedding, Mode::Train).unwrap();
    assert_eq!(images.shape(), &[4, 3, 8, 8]);
    assert!(images.iter().all(|v| (-1.0..=1.0).contains(v)));

    assert_eq!(gan.score(&images, Some(&labels[..]), Mode::Train).unwrap().shape(), &[4, 1]);
    assert_eq!(gan.score(&images, None, Mode::Eval).unwrap().shape(), &[4, 1]);
}

#[test]
fn test_round_trip_stays_finite() {
    let mut gan = BigGan::new(BigGanConfig::tiny(), 5).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let n_classes = gan.config().n_classes;

    for trial in 0..100 {
        let batch = 1 + trial % 3;
        let labels: Vec<usize> = (0..batch).map(|_| rng.gen_range(0..n_classes)).collect();
        let noise = ArrayD::<f32>::random_using(IxDyn(&[batch, 12]), StandardNormal, &mut rng);
        let mode = if trial % 2 == 0 { Mode::Train } else { Mode::Eval };

        let embedding = gan.embed(&labels).unwrap();
        let images = gan.generate(&noise, &embedding, mode).unwrap();
        let scores = gan.score(&images, Some(labels.as_slice()), mode).unwrap();
        assert!(images.iter().chain(scores.iter()).all(|v| v.is_finite()), "trial {} produced NaN", trial);
    }
    assert!(gan.store().states.values().all(|s| s.iter().all(|v| v.is_finite())));
}

#[test]
fn test_attention_is_identity_until_gain_moves() {
    let ctx = GraphContext::shared();
    let attention = SelfAttention::new(&ctx, "attn", 32, 1e-12);
    let x = Tensor::new_input(&ctx, "x");
    let y = attention.forward(&x, Mode::Train);
    let updates = ctx.borrow_mut().drain_state_updates();
    let shapes = HashMap::from([("x".to_string(), (vec![2, 32, 6, 6], DType::F32))]);
    let compiled = CompiledGraph::compile(&ctx, &[&y], updates, &shapes).unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    let mut store = init::initialize(ctx.borrow().registry(), &mut rng);
    let input = ArrayD::<f32>::random_using(IxDyn(&[2, 32, 6, 6]), Uniform::new(-2.0, 2.0), &mut rng);
    let feeds = HashMap::from([("x".to_string(), input.clone())]);

    let out = compiled.run(&CpuBackend::new(), &feeds, &mut store).unwrap();
    assert_eq!(out[0], input);

    if let Some(gamma) = store.parameter_mut("attn.gamma") {
        gamma.fill(0.5);
    }
    let out = compiled.run(&CpuBackend::new(), &feeds, &mut store).unwrap();
    assert_ne!(out[0], input);
}

#[test]
fn test_running_stats_follow_training_only() {
    let mut gan = BigGan::new(BigGanConfig::tiny(), 9).unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let noise = ArrayD::<f32>::random_using(IxDyn(&[3, 12]), StandardNormal, &mut rng);
    let embedding = gan.embed(&[0, 1, 2]).unwrap();
    let name = "g.stages.0.block.bn1.bn.running_var";

    let initial = gan.store().state(name).unwrap().clone();
    gan.generate(&noise, &embedding, Mode::Eval).unwrap();
    assert_eq!(gan.store().state(name).unwrap(), &initial);

    let mut previous = initial;
    for _ in 0..3 {
        gan.generate(&noise, &embedding, Mode::Train).unwrap();
        let current = gan.store().state(name).unwrap().clone();
        assert_ne!(current, previous);
        previous = current;
    }
}

#[test]
fn test_bad_labels_are_errors_not_panics() {
    let mut gan = BigGan::new(BigGanConfig::tiny(), 1).unwrap();
    let err = gan.embed(&[7]).unwrap_err();
    assert!(matches!(err, GanError::LabelOutOfRange { label: 7, num_classes: 3 }));
    assert!(err.to_string().contains("out of range"));
}

proptest! {
    #![proptest_config(Config::with_cases(8))]

    #[test]
    fn prop_shapes_hold_for_any_batch(batch in 1usize..5, seed in 0u64..10_000) {
        let mut gan = BigGan::new(BigGanConfig::tiny(), seed).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let labels: Vec<usize> = (0..batch).map(|i| i % 3).collect();
        let noise = ArrayD::<f32>::random_using(IxDyn(&[batch, 12]), StandardNormal, &mut rng);

        let embedding = gan.embed(&labels).unwrap();
        let images = gan.generate(&noise, &embedding, Mode::Eval).unwrap();
        let scores = gan.score(&images, Some(labels.as_slice()), Mode::Eval).unwrap();

        prop_assert_eq!(images.shape(), &[batch, 3, 8, 8][..]);
        prop_assert_eq!(scores.shape(), &[batch, 1][..]);
        prop_assert!(images.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
