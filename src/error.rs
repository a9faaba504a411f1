//! Crate-level error type.

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::asg::{AsgError, Shape};
use crate::config::ConfigError;
use crate::runtime::backend::RuntimeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GanError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Graph error: {0}")]
    Asg(#[from] AsgError),

    #[error("Shape check failed: {0}")]
    Shape(#[from] ShapeInferenceError),

    #[error("Execution failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Input '{name}' has shape {actual:?}, expected {expected:?}.")]
    InputShape {
        name: String,
        expected: Shape,
        actual: Shape,
    },

    #[error("Value for '{0}' is missing from the parameter store.")]
    MissingValue(String),

    #[error("Class label {label} out of range for {num_classes} classes.")]
    LabelOutOfRange { label: usize, num_classes: usize },

    #[error("Batch size mismatch: {0}")]
    BatchMismatch(String),
}

pub type Result<T> = std::result::Result<T, GanError>;
