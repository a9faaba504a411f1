//! Parameter registry and parameter store.
//!
//! Every trainable parameter and every persisted state tensor is registered
//! with its shape when a module is constructed. The registry is the single
//! place initialization and shape inference look parameters up; the store
//! holds their current values.

use crate::asg::Shape;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of operator a parameter belongs to, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    LinearWeight,
    ConvWeight,
    EmbeddingWeight,
    Bias,
    /// Affine scale of a normalization layer (gamma).
    NormScale,
    /// Affine shift of a normalization layer (beta).
    NormShift,
    /// Scalar residual gain of an attention block.
    Gain,
}

impl ParamKind {
    /// Weights of weighted operators (linear, convolution, embedding).
    pub fn is_operator_weight(self) -> bool {
        matches!(self, ParamKind::LinearWeight | ParamKind::ConvWeight | ParamKind::EmbeddingWeight)
    }
}

/// Initial value of a state tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateInit {
    Zeros,
    Ones,
    /// Random direction with unit L2 norm.
    UnitGaussian,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Shape,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSpec {
    pub name: String,
    pub shape: Shape,
    pub init: StateInit,
}

/// Ordered list of everything registered in a graph context.
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    parameters: Vec<ParameterSpec>,
    states: Vec<StateSpec>,
    index: HashMap<String, usize>,
    state_index: HashMap<String, usize>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter. Names are unique within a context.
    pub fn register_parameter(&mut self, name: &str, shape: Shape, kind: ParamKind) {
        assert!(
            !self.index.contains_key(name),
            "parameter '{}' is already registered",
            name
        );
        self.index.insert(name.to_string(), self.parameters.len());
        self.parameters.push(ParameterSpec { name: name.to_string(), shape, kind });
    }

    /// Registers a state tensor. Names are unique within a context.
    pub fn register_state(&mut self, name: &str, shape: Shape, init: StateInit) {
        assert!(
            !self.state_index.contains_key(name),
            "state '{}' is already registered",
            name
        );
        self.state_index.insert(name.to_string(), self.states.len());
        self.states.push(StateSpec { name: name.to_string(), shape, init });
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn states(&self) -> &[StateSpec] {
        &self.states
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.index.get(name).map(|&i| &self.parameters[i])
    }

    pub fn state(&self, name: &str) -> Option<&StateSpec> {
        self.state_index.get(name).map(|&i| &self.states[i])
    }

    /// Total number of scalar parameters whose name starts with `prefix`.
    pub fn num_elements(&self, prefix: &str) -> usize {
        self.parameters
            .iter()
            .filter(|p| p.name.starts_with(prefix))
            .map(|p| p.shape.iter().product::<usize>())
            .sum()
    }
}

/// Current values of parameters and state tensors, keyed by name.
///
/// The store is the only thing an external optimizer mutates; it is never
/// touched while a graph is executing.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    pub parameters: HashMap<String, ArrayD<f32>>,
    pub states: HashMap<String, ArrayD<f32>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameter(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.parameters.get(name)
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.parameters.get_mut(name)
    }

    pub fn state(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.states.get(name)
    }

    pub fn set_parameter(&mut self, name: &str, value: ArrayD<f32>) {
        self.parameters.insert(name.to_string(), value);
    }

    pub fn set_state(&mut self, name: &str, value: ArrayD<f32>) {
        self.states.insert(name.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_and_count() {
        let mut registry = ParameterRegistry::new();
        registry.register_parameter("g.fc.weight", vec![4, 3], ParamKind::LinearWeight);
        registry.register_parameter("g.fc.bias", vec![4], ParamKind::Bias);
        registry.register_parameter("d.fc.weight", vec![1, 4], ParamKind::LinearWeight);
        registry.register_state("g.fc.u", vec![4, 1], StateInit::UnitGaussian);

        assert_eq!(registry.parameter("g.fc.bias").unwrap().kind, ParamKind::Bias);
        assert_eq!(registry.state("g.fc.u").unwrap().shape, vec![4, 1]);
        assert_eq!(registry.num_elements("g."), 16);
        assert_eq!(registry.num_elements(""), 20);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_parameter_panics() {
        let mut registry = ParameterRegistry::new();
        registry.register_parameter("w", vec![1], ParamKind::Gain);
        registry.register_parameter("w", vec![1], ParamKind::Gain);
    }

    #[test]
    fn test_operator_weight_tags() {
        assert!(ParamKind::ConvWeight.is_operator_weight());
        assert!(ParamKind::EmbeddingWeight.is_operator_weight());
        assert!(!ParamKind::Bias.is_operator_weight());
        assert!(!ParamKind::NormScale.is_operator_weight());
        assert!(!ParamKind::Gain.is_operator_weight());
    }
}
