//! Sample forward pass: embed one label per class, generate an image for
//! each and score it against its label.

use clap::{Parser, ValueEnum};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustygan::{infer_shapes, BigGan, BigGanConfig, Mode};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    /// 8x8 images, 3 classes.
    Tiny,
    /// Default 128x128 network with 5 classes.
    Notebook,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunMode {
    Train,
    Eval,
}

impl From<RunMode> for Mode {
    fn from(mode: RunMode) -> Self {
        match mode {
            RunMode::Train => Mode::Train,
            RunMode::Eval => Mode::Eval,
        }
    }
}

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "RustyGAN: BigGAN forward pass on the CPU", long_about = None)]
struct Args {
    /// JSON configuration file; overrides --preset
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Preset::Tiny)]
    preset: Preset,

    /// Batch size; defaults to one sample per class
    #[arg(short, long)]
    batch_size: Option<usize>,

    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    #[arg(short, long, value_enum, default_value_t = RunMode::Eval)]
    mode: RunMode,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Only run shape inference, without allocating parameters
    #[arg(long)]
    shapes_only: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => BigGanConfig::from_json_file(path)?,
        None => match args.preset {
            Preset::Tiny => BigGanConfig::tiny(),
            Preset::Notebook => BigGanConfig { n_classes: 5, ..BigGanConfig::default() },
        },
    };
    config.validate()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let batch = args.batch_size.unwrap_or(config.n_classes);

    if args.shapes_only {
        let report = infer_shapes(&config, batch)?;
        info!(
            image = ?report.image,
            score = ?report.score,
            generator_parameters = report.generator_parameters,
            discriminator_parameters = report.discriminator_parameters,
            "shape check passed"
        );
        return Ok(());
    }

    let mode = Mode::from(args.mode);
    let mut gan = BigGan::new(config, args.seed)?;
    let labels: Vec<usize> = (0..batch).map(|i| i % gan.config().n_classes).collect();

    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
    let noise = ArrayD::<f32>::random_using(IxDyn(&[batch, gan.config().z_dim]), StandardNormal, &mut rng);

    let class_embedding = gan.embed(&labels)?;
    info!(shape = ?class_embedding.shape(), "embedded labels");

    let images = gan.generate(&noise, &class_embedding, mode)?;
    let (min, max) = images.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    info!(shape = ?images.shape(), min, max, "generated images");

    let scores = gan.score(&images, Some(labels.as_slice()), mode)?;
    info!(shape = ?scores.shape(), "scored images");
    for (label, score) in labels.iter().zip(scores.iter()) {
        println!("class {:>4}: score {:+.6}", label, score);
    }

    info!(penalty = gan.orthogonal_penalty()?, "orthogonal regularization");
    Ok(())
}
