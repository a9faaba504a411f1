//! The BigGAN networks and the facade that runs them.

pub mod dblock;
pub mod discriminator;
pub mod gblock;
pub mod generator;
pub mod model;

pub use dblock::DResidualBlock;
pub use discriminator::{Discriminator, DiscriminatorStage};
pub use gblock::GResidualBlock;
pub use generator::{Generator, GeneratorStage};
pub use model::{infer_shapes, BigGan, ShapeReport};
