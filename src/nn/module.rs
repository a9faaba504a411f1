//! Core traits shared by every layer.

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Whether a forward pass uses batch statistics and updates state.
///
/// In `Train` mode normalization layers normalize with batch statistics and
/// emit running-statistics updates, and spectral norms emit their refined
/// singular-vector estimate. In `Eval` mode both read their stored state
/// and leave it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }
}

/// Trait defining the common interface for all layers/modules.
///
/// In the graph-based architecture, `Module` is any component that can
/// add a specific pattern of operations and parameters to the graph.
pub trait Module {
    /// Performs a "symbolic" forward pass, building the corresponding part of the graph.
    fn forward(&self, inputs: &Tensor, mode: Mode) -> Tensor;

    /// Returns all trainable parameters (as symbolic tensors) that belong to this module.
    fn parameters(&self) -> Vec<Tensor>;
}

/// A module whose output also depends on a conditioning vector `[B, D]`.
pub trait ConditionalModule {
    fn forward_conditioned(&self, inputs: &Tensor, condition: &Tensor, mode: Mode) -> Tensor;

    fn parameters(&self) -> Vec<Tensor>;
}
