//! # RustyGAN: BigGAN on an Abstract Semantic Graph
//!
//! **RustyGAN** implements the BigGAN generator and discriminator on top of
//! a small graph-based tensor engine. Layers do not compute anything when
//! called: they append nodes to an **Abstract Semantic Graph (ASG)** held by
//! a [`GraphContext`](tensor::GraphContext). A graph is shape-checked once,
//! then executed on a backend against a store of parameter and state values.
//!
//! ## Usage Example
//!
//! ```no_run
//! use rustygan::{BigGan, BigGanConfig, Mode};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let mut gan = BigGan::new(BigGanConfig::tiny(), 0)?;
//!
//! let labels = [0usize, 1, 2];
//! let class_embedding = gan.embed(&labels)?;
//! let noise = ArrayD::zeros(IxDyn(&[3, gan.config().z_dim]));
//!
//! let images = gan.generate(&noise, &class_embedding, Mode::Eval)?; // [3, 3, 8, 8]
//! let scores = gan.score(&images, Some(&labels[..]), Mode::Eval)?;  // [3, 1]
//! # Ok::<(), rustygan::GanError>(())
//! ```

pub mod analysis;
pub mod asg;
pub mod config;
pub mod error;
pub mod gan;
pub mod init;
pub mod nn;
pub mod params;
pub mod regularization;
pub mod runtime;
pub mod tensor;

pub use config::{BigGanConfig, ConfigError};
pub use error::{GanError, Result};
pub use gan::{infer_shapes, BigGan, Discriminator, Generator, ShapeReport};
pub use nn::Mode;
