//! ASG: Abstract Semantic Graph.
//!
//! Every module in this crate describes its computation by adding nodes to an
//! [`Asg`]. Nodes refer to their operands by [`NodeId`]; the graph itself holds
//! no numeric data apart from literals.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    /// Integer indices (class labels). Stored as `f32` values at runtime.
    I32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node ID (duplicates the HashMap key for convenience).
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    /// Persisted non-learned tensor (power-iteration vectors, running statistics).
    State { name: String },
    Literal(Value),

    // Binary, numpy broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    /// Residual sum: both operands must have identical shapes.
    Residual(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),

    // Unary
    Sqrt(NodeId),
    ReLU(NodeId),
    Tanh(NodeId),
    Softmax(NodeId), // over the last axis

    // Reductions
    Sum(NodeId),
    SumAxes { input: NodeId, axes: Vec<usize>, keep_dims: bool },
    MeanAxes { input: NodeId, axes: Vec<usize>, keep_dims: bool },
    /// Variance over `axes`, always keeps the reduced dims.
    Variance { input: NodeId, axes: Vec<usize>, unbiased: bool },

    // Transformations
    /// Target shape; at most one `-1` entry is inferred.
    Reshape(NodeId, Vec<isize>),
    /// Collapses `start_axis..` into a single trailing axis.
    Flatten { input: NodeId, start_axis: usize },
    /// Splits the trailing axis into the last two axes of `reference`.
    Unflatten2d { input: NodeId, reference: NodeId },
    Transpose(NodeId, usize, usize),
    Concat { inputs: Vec<NodeId>, axis: usize },
    Slice { input: NodeId, axis: usize, start: usize, len: usize },

    // Spatial
    Conv2d {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        stride: (usize, usize),
        padding: (usize, usize),
    },
    MaxPool2d { input: NodeId, kernel_size: (usize, usize), stride: (usize, usize) },
    AvgPool2d { input: NodeId, kernel_size: (usize, usize), stride: (usize, usize) },
    /// Nearest-neighbour upsampling by an integer factor.
    Upsample2d { input: NodeId, scale: usize },

    // Lookup
    Embedding { indices: NodeId, weight: NodeId },
}

impl NodeType {
    /// Operand node IDs, in evaluation order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::State { .. }
            | NodeType::Literal(_) => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::Residual(a, b)
            | NodeType::MatrixMultiply(a, b) => vec![*a, *b],

            NodeType::Sqrt(a)
            | NodeType::ReLU(a)
            | NodeType::Tanh(a)
            | NodeType::Softmax(a)
            | NodeType::Sum(a)
            | NodeType::Reshape(a, _)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::SumAxes { input, .. }
            | NodeType::MeanAxes { input, .. }
            | NodeType::Variance { input, .. }
            | NodeType::Flatten { input, .. }
            | NodeType::Slice { input, .. }
            | NodeType::MaxPool2d { input, .. }
            | NodeType::AvgPool2d { input, .. }
            | NodeType::Upsample2d { input, .. } => vec![*input],

            NodeType::Unflatten2d { input, reference } => vec![*input, *reference],
            NodeType::Concat { inputs, .. } => inputs.clone(),
            NodeType::Conv2d { input, weight, bias, .. } => {
                let mut deps = vec![*input, *weight];
                if let Some(b) = bias {
                    deps.push(*b);
                }
                deps
            }
            NodeType::Embedding { indices, weight } => vec![*indices, *weight],
        }
    }

    /// Short operation name used in error messages.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::State { .. } => "State",
            NodeType::Literal(_) => "Literal",
            NodeType::Add(..) => "Add",
            NodeType::Subtract(..) => "Subtract",
            NodeType::Multiply(..) => "Multiply",
            NodeType::Divide(..) => "Divide",
            NodeType::Residual(..) => "Residual",
            NodeType::MatrixMultiply(..) => "MatrixMultiply",
            NodeType::Sqrt(_) => "Sqrt",
            NodeType::ReLU(_) => "ReLU",
            NodeType::Tanh(_) => "Tanh",
            NodeType::Softmax(_) => "Softmax",
            NodeType::Sum(_) => "Sum",
            NodeType::SumAxes { .. } => "SumAxes",
            NodeType::MeanAxes { .. } => "MeanAxes",
            NodeType::Variance { .. } => "Variance",
            NodeType::Reshape(..) => "Reshape",
            NodeType::Flatten { .. } => "Flatten",
            NodeType::Unflatten2d { .. } => "Unflatten2d",
            NodeType::Transpose(..) => "Transpose",
            NodeType::Concat { .. } => "Concat",
            NodeType::Slice { .. } => "Slice",
            NodeType::Conv2d { .. } => "Conv2d",
            NodeType::MaxPool2d { .. } => "MaxPool2d",
            NodeType::AvgPool2d { .. } => "AvgPool2d",
            NodeType::Upsample2d { .. } => "Upsample2d",
            NodeType::Embedding { .. } => "Embedding",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Unwraps the value as an array; scalars become 0-d arrays.
    pub fn into_tensor(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals carry their own shape so inference never has to look them up.
        match &node.node_type {
            NodeType::Literal(Value::Tensor(arr)) => {
                node.shape = Some(arr.shape().to_vec());
                node.dtype = Some(DType::F32);
            }
            NodeType::Literal(Value::ScalarF32(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::F32);
            }
            _ => {}
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) { self.outputs = outputs; }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }
}
