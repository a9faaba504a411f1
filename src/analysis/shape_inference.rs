//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape
//! and data type of the output tensor for each node based on its input shapes and operation type.
//! Every shape contract of the network (conditioning widths, residual sums,
//! attention reshapes) is checked here, before a single value is computed.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}. \
             The node has not been processed yet or the graph contains a cycle.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Inputs must be listed in the initial shapes; parameters and state must be registered.")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Axis {axis} is out of range for node {node_id} of rank {rank}.")]
    AxisOutOfRange {
        node_id: NodeId,
        axis: usize,
        rank: usize,
    },

    #[error("Cannot reshape {from:?} into {to:?} at node {node_id}.")]
    InvalidReshape {
        node_id: NodeId,
        from: Shape,
        to: Vec<isize>,
    },

    #[error("Window {window:?} does not fit spatial size {spatial:?} at node {node_id}.")]
    WindowTooLarge {
        node_id: NodeId,
        window: (usize, usize),
        spatial: (usize, usize),
    },

    #[error("Slice out of bounds at node {0}: shape {1:?}, start {2}, length {3}.")]
    InvalidShapeForSlice(NodeId, Shape, usize, usize),

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),

    #[error("Matrix multiplication error: incompatible inner dimensions {0} and {1}.")]
    MatmulDimensionError(usize, usize),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the shape inference process for the part of the graph reachable
    /// from its outputs.
    ///
    /// Modifies the graph in-place, filling in the `shape` and `dtype` fields for each node.
    ///
    /// # Arguments
    /// * `asg` - Mutable reference to the graph to analyze.
    /// * `initial_shapes` - Shapes and types of all `Input`, `Parameter` and
    ///   `State` nodes, keyed by node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let mut node = asg.get_node(node_id)?.clone();

            let (shape, dtype) = Self::infer_node_shape(asg, &node, initial_shapes)?;

            node.shape = Some(shape);
            node.dtype = Some(dtype);
            asg.nodes.insert(node_id, node);
        }

        Ok(())
    }

    /// Main shape inference logic for a single node.
    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } | NodeType::State { name } => {
                initial_shapes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone()))
            }

            NodeType::Literal(_) => match (&node.shape, node.dtype) {
                (Some(s), Some(d)) => Ok((s.clone(), d)),
                _ => Err(ShapeInferenceError::MissingShapeInfo(node.id)),
            },

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                Ok((broadcast_shapes(&ls, &rs)?, ld))
            }

            NodeType::Residual(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                if ls != rs {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Residual".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }
                Ok((ls, ld))
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;

                if ls.len() < 2 || rs.len() < 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: ls.len().min(rs.len()),
                    });
                }

                let m = ls[ls.len() - 2];
                let k1 = ls[ls.len() - 1];
                let k2 = rs[rs.len() - 2];
                let n = rs[rs.len() - 1];

                if k1 != k2 {
                    return Err(ShapeInferenceError::MatmulDimensionError(k1, k2));
                }

                let lhs_batch = &ls[..ls.len() - 2];
                let rhs_batch = &rs[..rs.len() - 2];
                if !rhs_batch.is_empty() && lhs_batch != rhs_batch {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls.clone(),
                        shape2: rs.clone(),
                    });
                }

                let mut out_shape = lhs_batch.to_vec();
                out_shape.push(m);
                out_shape.push(n);

                Ok((out_shape, ld))
            }

            // Element-wise operations - shape unchanged
            NodeType::Sqrt(id) | NodeType::ReLU(id) | NodeType::Tanh(id) | NodeType::Softmax(id) => {
                Self::get_shape_dtype(asg, *id)
            }

            NodeType::Sum(_) => Ok((vec![], DType::F32)),

            NodeType::SumAxes { input, axes, keep_dims } | NodeType::MeanAxes { input, axes, keep_dims } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                Ok((reduce_shape(node.id, &shape, axes, *keep_dims)?, dtype))
            }

            NodeType::Variance { input, axes, .. } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                Ok((reduce_shape(node.id, &shape, axes, true)?, dtype))
            }

            NodeType::Reshape(data_id, target) => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *data_id)?;
                let new_shape = resolve_reshape(&shape, target).ok_or_else(|| {
                    ShapeInferenceError::InvalidReshape { node_id: node.id, from: shape.clone(), to: target.clone() }
                })?;
                Ok((new_shape, dtype))
            }

            NodeType::Flatten { input, start_axis } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if *start_axis >= shape.len() {
                    return Err(ShapeInferenceError::AxisOutOfRange {
                        node_id: node.id,
                        axis: *start_axis,
                        rank: shape.len(),
                    });
                }
                let mut out = shape[..*start_axis].to_vec();
                out.push(shape[*start_axis..].iter().product());
                Ok((out, dtype))
            }

            NodeType::Unflatten2d { input, reference } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                let (ref_shape, _) = Self::get_shape_dtype(asg, *reference)?;
                if ref_shape.len() < 2 || shape.is_empty() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: ref_shape.len().min(shape.len()),
                    });
                }
                let h = ref_shape[ref_shape.len() - 2];
                let w = ref_shape[ref_shape.len() - 1];
                let last = shape[shape.len() - 1];
                if last != h * w {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Unflatten2d".to_string(),
                        shape1: shape,
                        shape2: ref_shape,
                    });
                }
                let mut out = shape[..shape.len() - 1].to_vec();
                out.push(h);
                out.push(w);
                Ok((out, dtype))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Concat { inputs, axis } => {
                let (mut out, dtype) = Self::get_shape_dtype(asg, inputs[0])?;
                if *axis >= out.len() {
                    return Err(ShapeInferenceError::AxisOutOfRange { node_id: node.id, axis: *axis, rank: out.len() });
                }
                for id in &inputs[1..] {
                    let (shape, _) = Self::get_shape_dtype(asg, *id)?;
                    let compatible = shape.len() == out.len()
                        && shape.iter().zip(out.iter()).enumerate().all(|(i, (a, b))| i == *axis || a == b);
                    if !compatible {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Concat".to_string(),
                            shape1: out,
                            shape2: shape,
                        });
                    }
                    out[*axis] += shape[*axis];
                }
                Ok((out, dtype))
            }

            NodeType::Slice { input, axis, start, len } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if *axis >= shape.len() {
                    return Err(ShapeInferenceError::AxisOutOfRange { node_id: node.id, axis: *axis, rank: shape.len() });
                }
                if start + len > shape[*axis] {
                    return Err(ShapeInferenceError::InvalidShapeForSlice(node.id, shape, *start, *len));
                }
                shape[*axis] = *len;
                Ok((shape, dtype))
            }

            // Conv2d: [N, C_in, H, W] x [C_out, C_in, kH, kW] -> [N, C_out, H_out, W_out]
            NodeType::Conv2d { input, weight, bias, stride, padding } => {
                let (input_shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                let (weight_shape, _) = Self::get_shape_dtype(asg, *weight)?;

                Self::expect_rank(node.id, &input_shape, 4)?;
                Self::expect_rank(node.id, &weight_shape, 4)?;

                if input_shape[1] != weight_shape[1] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Conv2d".to_string(),
                        shape1: input_shape,
                        shape2: weight_shape,
                    });
                }
                if let Some(b) = bias {
                    let (bias_shape, _) = Self::get_shape_dtype(asg, *b)?;
                    if bias_shape != vec![weight_shape[0]] {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Conv2d bias".to_string(),
                            shape1: weight_shape,
                            shape2: bias_shape,
                        });
                    }
                }

                let (n, h, w) = (input_shape[0], input_shape[2], input_shape[3]);
                let (kh, kw) = (weight_shape[2], weight_shape[3]);
                if h + 2 * padding.0 < kh || w + 2 * padding.1 < kw {
                    return Err(ShapeInferenceError::WindowTooLarge {
                        node_id: node.id,
                        window: (kh, kw),
                        spatial: (h + 2 * padding.0, w + 2 * padding.1),
                    });
                }

                let out_h = (h + 2 * padding.0 - kh) / stride.0 + 1;
                let out_w = (w + 2 * padding.1 - kw) / stride.1 + 1;

                Ok((vec![n, weight_shape[0], out_h, out_w], dtype))
            }

            NodeType::MaxPool2d { input, kernel_size, stride }
            | NodeType::AvgPool2d { input, kernel_size, stride } => {
                let (input_shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                Self::expect_rank(node.id, &input_shape, 4)?;

                let (n, c, h, w) = (input_shape[0], input_shape[1], input_shape[2], input_shape[3]);
                if h < kernel_size.0 || w < kernel_size.1 {
                    return Err(ShapeInferenceError::WindowTooLarge {
                        node_id: node.id,
                        window: *kernel_size,
                        spatial: (h, w),
                    });
                }

                let out_h = (h - kernel_size.0) / stride.0 + 1;
                let out_w = (w - kernel_size.1) / stride.1 + 1;
                Ok((vec![n, c, out_h, out_w], dtype))
            }

            NodeType::Upsample2d { input, scale } => {
                let (input_shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                Self::expect_rank(node.id, &input_shape, 4)?;
                let (n, c, h, w) = (input_shape[0], input_shape[1], input_shape[2], input_shape[3]);
                Ok((vec![n, c, h * scale, w * scale], dtype))
            }

            // Embedding: indices[*] + weight[num_embeddings, embedding_dim] -> [*, embedding_dim]
            NodeType::Embedding { indices, weight } => {
                let (indices_shape, _) = Self::get_shape_dtype(asg, *indices)?;
                let (weight_shape, dtype) = Self::get_shape_dtype(asg, *weight)?;
                Self::expect_rank(node.id, &weight_shape, 2)?;

                let mut output_shape = indices_shape;
                output_shape.push(weight_shape[1]);
                Ok((output_shape, dtype))
            }
        }
    }

    fn expect_rank(node_id: NodeId, shape: &Shape, expected: usize) -> Result<()> {
        if shape.len() != expected {
            return Err(ShapeInferenceError::InvalidRank { node_id, expected, actual: shape.len() });
        }
        Ok(())
    }

    /// Helper function to get already computed shape and type for a node.
    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    /// Performs topological sort of the graph.
    /// Returns a vector of node IDs in order suitable for computation.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        for output_id in &asg.outputs {
            Self::build_sorted_graph(*output_id, asg, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }

        let node = asg.get_node(node_id)?;
        for input_id in node.node_type.operands() {
            Self::build_sorted_graph(input_id, asg, visited, sorted)?;
        }

        if visited.insert(node_id) {
            sorted.push(node_id);
        }
        Ok(())
    }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(ShapeInferenceError::BroadcastError(a.to_vec(), b.to_vec())),
        };
    }
    Ok(out)
}

fn reduce_shape(node_id: NodeId, shape: &[usize], axes: &[usize], keep_dims: bool) -> Result<Shape> {
    if let Some(&axis) = axes.iter().find(|&&a| a >= shape.len()) {
        return Err(ShapeInferenceError::AxisOutOfRange { node_id, axis, rank: shape.len() });
    }
    Ok(shape
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keep_dims) {
            (true, true) => Some(1),
            (true, false) => None,
            (false, _) => Some(d),
        })
        .collect())
}

/// Resolves a target shape with at most one `-1` against the element count of `from`.
pub fn resolve_reshape(from: &[usize], target: &[isize]) -> Option<Shape> {
    let total: usize = from.iter().product();
    let inferred: Vec<usize> = target.iter().enumerate().filter(|(_, &d)| d == -1).map(|(i, _)| i).collect();
    if inferred.len() > 1 || target.iter().any(|&d| d < -1) {
        return None;
    }
    let known: usize = target.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    let mut out: Shape = target.iter().map(|&d| d.max(0) as usize).collect();
    if let Some(&i) = inferred.first() {
        if known == 0 || total % known != 0 {
            return None;
        }
        out[i] = total / known;
    } else if known != total {
        return None;
    }
    Some(out)
}
