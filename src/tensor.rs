//! `Tensor` handles and the `GraphContext` that owns the graph.
//!
//! A `Tensor` holds no data. It is a symbolic handle to a node of the
//! Abstract Semantic Graph; every operation on it appends a node instead of
//! computing anything.
//!
//! `GraphContext` owns the graph under construction, the registry of
//! parameters and state tensors, and the state updates emitted by modules
//! running in training mode.

use crate::asg::{Asg, NodeId, NodeType, Shape, Value};
use crate::params::{ParamKind, ParameterRegistry, StateInit};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

/// New value for a state tensor, produced by a graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub name: String,
    pub node_id: NodeId,
}

/// Owns the graph under construction.
///
/// Wrapped in `Rc<RefCell<>>` so many `Tensor` handles can share it.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    registry: ParameterRegistry,
    pending_updates: Vec<StateUpdate>,
}

impl GraphContext {
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
            registry: ParameterRegistry::new(),
            pending_updates: Vec::new(),
        }
    }

    /// Convenience constructor for the shared form every module expects.
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Records that state `name` must take the value of `node_id` after the
    /// graph currently being built has run.
    pub fn record_state_update(&mut self, name: &str, node_id: NodeId) {
        self.pending_updates.push(StateUpdate { name: name.to_string(), node_id });
    }

    /// Takes the updates recorded since the last call.
    pub fn drain_state_updates(&mut self) -> Vec<StateUpdate> {
        std::mem::take(&mut self.pending_updates)
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Node this tensor stands for.
    pub node_id: NodeId,
    /// Shared context the node lives in.
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates an input node; its value is fed at execution time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();

        let node_id = graph.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
        graph.inputs.push(node_id);

        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a trainable parameter and registers its shape and kind.
    pub fn new_parameter(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: Shape,
        kind: ParamKind,
    ) -> Self {
        let mut ctx = context.borrow_mut();
        ctx.registry.register_parameter(name, shape, kind);
        let node_id = ctx
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Parameter { name: name.to_string() });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a persisted state tensor and registers its shape and initial value.
    pub fn new_state(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: Shape,
        init: StateInit,
    ) -> Self {
        let mut ctx = context.borrow_mut();
        ctx.registry.register_state(name, shape, init);
        let node_id = ctx
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::State { name: name.to_string() });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a constant embedded in the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a scalar constant.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::ScalarF32(value)));
        Self { node_id, context: Rc::clone(context) }
    }

    fn push(&self, node_type: NodeType) -> Self {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self { node_id, context: Rc::clone(&self.context) }
    }

    // --- Arithmetic ---

    /// Matrix product; batched when both operands are 3-D.
    pub fn dot(&self, other: &Tensor) -> Self {
        self.push(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    /// Elementwise sum that rejects any shape difference (no broadcasting).
    pub fn residual(&self, other: &Tensor) -> Self {
        self.push(NodeType::Residual(self.node_id, other.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.push(NodeType::Sqrt(self.node_id))
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.push(NodeType::ReLU(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.push(NodeType::Tanh(self.node_id))
    }

    /// Softmax over the last axis.
    pub fn softmax(&self) -> Self {
        self.push(NodeType::Softmax(self.node_id))
    }

    // --- Reductions ---

    /// Sum of all elements, as a 0-d tensor.
    pub fn sum(&self) -> Self {
        self.push(NodeType::Sum(self.node_id))
    }

    pub fn sum_axes(&self, axes: &[usize], keep_dims: bool) -> Self {
        self.push(NodeType::SumAxes { input: self.node_id, axes: axes.to_vec(), keep_dims })
    }

    pub fn mean_axes(&self, axes: &[usize], keep_dims: bool) -> Self {
        self.push(NodeType::MeanAxes { input: self.node_id, axes: axes.to_vec(), keep_dims })
    }

    /// Variance over `axes`, keeping the reduced dims.
    pub fn variance(&self, axes: &[usize], unbiased: bool) -> Self {
        self.push(NodeType::Variance { input: self.node_id, axes: axes.to_vec(), unbiased })
    }

    /// L2 norm of all elements, as a 0-d tensor.
    pub fn l2_norm(&self) -> Self {
        (self * self).sum().sqrt()
    }

    // --- Transformations ---

    /// Reshapes to `shape`; one entry may be `-1` and is inferred.
    pub fn reshape(&self, shape: Vec<isize>) -> Self {
        self.push(NodeType::Reshape(self.node_id, shape))
    }

    pub fn flatten(&self, start_axis: usize) -> Self {
        self.push(NodeType::Flatten { input: self.node_id, start_axis })
    }

    /// Splits the trailing axis into the spatial dims `[H, W]` of `reference`.
    pub fn unflatten2d(&self, reference: &Tensor) -> Self {
        self.push(NodeType::Unflatten2d { input: self.node_id, reference: reference.node_id })
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.push(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// Concatenates tensors along `axis`. `tensors` must not be empty.
    pub fn concat(tensors: &[&Tensor], axis: usize) -> Self {
        assert!(!tensors.is_empty(), "concat needs at least one tensor");
        let inputs = tensors.iter().map(|t| t.node_id).collect();
        tensors[0].push(NodeType::Concat { inputs, axis })
    }

    /// Takes `len` entries starting at `start` along `axis`.
    pub fn slice(&self, axis: usize, start: usize, len: usize) -> Self {
        self.push(NodeType::Slice { input: self.node_id, axis, start, len })
    }

    // --- Spatial operations ---

    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        self.push(NodeType::Conv2d {
            input: self.node_id,
            weight: weight.node_id,
            bias: bias.map(|b| b.node_id),
            stride,
            padding,
        })
    }

    pub fn max_pool2d(&self, kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        self.push(NodeType::MaxPool2d { input: self.node_id, kernel_size, stride })
    }

    pub fn avg_pool2d(&self, kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        self.push(NodeType::AvgPool2d { input: self.node_id, kernel_size, stride })
    }

    pub fn upsample2d(&self, scale: usize) -> Self {
        self.push(NodeType::Upsample2d { input: self.node_id, scale })
    }

    /// Looks up rows of `weight` using `self` as the index tensor.
    pub fn embedding(&self, weight: &Tensor) -> Self {
        self.push(NodeType::Embedding { indices: self.node_id, weight: weight.node_id })
    }
}

impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        self.push(NodeType::Add(self.node_id, rhs.node_id))
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        self.push(NodeType::Subtract(self.node_id, rhs.node_id))
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        self.push(NodeType::Multiply(self.node_id, rhs.node_id))
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Self::Output {
        self.push(NodeType::Divide(self.node_id, rhs.node_id))
    }
}
