//! # Neural Network Layers Module
//!
//! Building blocks for the generator and discriminator.
//!
//! In the graph-based architecture, each "layer" is a constructor that adds
//! a specific pattern of nodes (operations and parameters) to the ASG.
//!
//! ## Available Layers
//!
//! ### Core Layers
//! - [`Linear`]: Fully connected layer, optionally spectral-normalized
//! - [`Conv2d`]: 2D convolution, optionally spectral-normalized
//! - [`Embedding`]: Embedding lookup table
//!
//! ### Normalization
//! - [`SpectralNorm`]: Power-iteration estimate of a weight's largest singular value
//! - [`BatchNorm2d`]: Batch normalization with running statistics
//! - [`ClassConditionalBatchNorm2d`]: Batch normalization with a conditioned affine transform
//!
//! ### Attention
//! - [`SelfAttention`]: Spatial self-attention with a zero-initialized residual gain
//!
//! ## Example
//!
//! ```ignore
//! use rustygan::nn::{Conv2d, Mode, Module};
//! use rustygan::tensor::{GraphContext, Tensor};
//!
//! let ctx = GraphContext::shared();
//! let conv = Conv2d::pointwise(&ctx, "mixin", 16, 32, true, 1e-12);
//!
//! let x = Tensor::new_input(&ctx, "input");
//! let h = conv.forward(&x, Mode::Eval).relu();
//! ```

pub mod attention;
pub mod batchnorm;
pub mod conv;
pub mod embedding;
pub mod linear;
pub mod module;
pub mod spectral_norm;

pub use attention::SelfAttention;
pub use batchnorm::{BatchNorm2d, ClassConditionalBatchNorm2d, RunningNorm2d};
pub use conv::{Conv2d, Conv2dConfig};
pub use embedding::Embedding;
pub use linear::{Linear, LinearConfig};
pub use spectral_norm::SpectralNorm;

pub use module::{ConditionalModule, Mode, Module};
