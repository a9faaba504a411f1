//! Abstract interface (trait) for execution backends.

use crate::asg::{Asg, AsgId, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing a graph.
/// Shared by every backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node with ID {0} not found in graph {1}.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Type mismatch: operation expected {expected}, got {actual}.")]
    TypeError { expected: String, actual: String },

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("Missing value for input '{0}' (node ID: {1}). Feed it when running the graph.")]
    MissingInput(String, NodeId),

    #[error("Missing value for parameter '{0}' (node ID: {1}). Initialize the parameter store first.")]
    MissingParameter(String, NodeId),

    #[error("Missing value for state '{0}' (node ID: {1}).")]
    MissingState(String, NodeId),

    #[error("Index {index} out of range for {what} of size {size}.")]
    IndexOutOfRange {
        what: String,
        index: i64,
        size: usize,
    },
}

/// Cache of already computed node values.
/// Keyed by (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Common interface of an execution environment.
///
/// Anything implementing this trait can take an ASG plus data,
/// execute it and return the results.
pub trait Backend {
    /// Device-specific data representation.
    type DeviceData: std::fmt::Debug;

    /// Moves host values to the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes the graph, using and extending the memo.
    ///
    /// # Arguments
    /// * `main_asg` - Graph to execute. Every node reachable from its outputs is evaluated.
    /// * `initial_memo` - Values of inputs, parameters and state tensors.
    ///
    /// # Returns
    /// The output values, in the order of `main_asg.outputs`, and the final memo
    /// with every intermediate result.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies results back to host values.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
