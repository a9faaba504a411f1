//! Backend executing an ASG on the CPU.
//!
//! Walks the graph in topological order and evaluates every node with
//! `ndarray`. Binary operations follow numpy broadcasting; convolutions
//! are lowered to a matrix product over im2col patches.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, resolve_reshape, ShapeInference};
use crate::asg::{Asg, NodeId, NodeType, Value};
use ndarray::{s, Array2, Array4, ArrayD, Axis, Ix1, Ix2, Ix3, Ix4, IxDyn, Slice, Zip};
use std::collections::HashMap;

/// Execution state of a single graph run.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    /// Computed values, keyed by (AsgId, NodeId). Always `Value::Tensor`.
    memo: Memo<Value>,
}

impl<'a> ExecutionContext<'a> {
    fn new(asg: &'a Asg, initial_memo: Memo<Value>) -> Self {
        let memo = initial_memo
            .into_iter()
            .map(|(key, value)| (key, Value::Tensor(value.into_tensor())))
            .collect();
        Self { asg, memo }
    }

    fn operand(&self, node_id: NodeId) -> Result<&ArrayD<f32>, RuntimeError> {
        match self.memo.get(&(self.asg.id, node_id)) {
            Some(Value::Tensor(arr)) => Ok(arr),
            Some(Value::ScalarF32(_)) => Err(RuntimeError::TypeError {
                expected: "Tensor".to_string(),
                actual: "ScalarF32".to_string(),
            }),
            None => Err(RuntimeError::NodeNotFound(node_id, self.asg.id)),
        }
    }

    /// Computes the value of `node_id`. Operands must already be in the memo.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<(), RuntimeError> {
        if self.memo.contains_key(&(self.asg.id, node_id)) {
            return Ok(());
        }

        let asg = self.asg;
        let node = asg.nodes.get(&node_id).ok_or(RuntimeError::NodeNotFound(node_id, asg.id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => return Err(RuntimeError::MissingInput(name.clone(), node.id)),
            NodeType::Parameter { name } => return Err(RuntimeError::MissingParameter(name.clone(), node.id)),
            NodeType::State { name } => return Err(RuntimeError::MissingState(name.clone(), node.id)),
            NodeType::Literal(value) => value.clone().into_tensor(),

            NodeType::Add(l, r) => broadcast_binary(self.operand(*l)?, self.operand(*r)?, "Add", |a, b| a + b)?,
            NodeType::Subtract(l, r) => {
                broadcast_binary(self.operand(*l)?, self.operand(*r)?, "Subtract", |a, b| a - b)?
            }
            NodeType::Multiply(l, r) => {
                broadcast_binary(self.operand(*l)?, self.operand(*r)?, "Multiply", |a, b| a * b)?
            }
            NodeType::Divide(l, r) => broadcast_binary(self.operand(*l)?, self.operand(*r)?, "Divide", |a, b| a / b)?,
            NodeType::Residual(l, r) => op_residual(self.operand(*l)?, self.operand(*r)?)?,
            NodeType::MatrixMultiply(l, r) => op_matmul(self.operand(*l)?, self.operand(*r)?)?,

            NodeType::Sqrt(op) => self.operand(*op)?.mapv(f32::sqrt),
            NodeType::ReLU(op) => self.operand(*op)?.mapv(|x| x.max(0.0)),
            NodeType::Tanh(op) => self.operand(*op)?.mapv(f32::tanh),
            NodeType::Softmax(op) => op_softmax(self.operand(*op)?),

            NodeType::Sum(op) => ndarray::arr0(self.operand(*op)?.sum()).into_dyn(),
            NodeType::SumAxes { input, axes, keep_dims } => op_sum_axes(self.operand(*input)?, axes, *keep_dims)?,
            NodeType::MeanAxes { input, axes, keep_dims } => op_mean_axes(self.operand(*input)?, axes, *keep_dims)?,
            NodeType::Variance { input, axes, unbiased } => op_variance(self.operand(*input)?, axes, *unbiased)?,

            NodeType::Reshape(op, target) => {
                let a = self.operand(*op)?;
                let shape = resolve_reshape(a.shape(), target).ok_or_else(|| {
                    RuntimeError::ShapeError(format!("Cannot reshape {:?} into {:?}", a.shape(), target))
                })?;
                reshaped(a, &shape)?
            }
            NodeType::Flatten { input, start_axis } => {
                let a = self.operand(*input)?;
                if *start_axis >= a.ndim() {
                    return Err(RuntimeError::ShapeError(format!(
                        "Flatten axis {} out of range for rank {}",
                        start_axis,
                        a.ndim()
                    )));
                }
                let mut shape = a.shape()[..*start_axis].to_vec();
                shape.push(a.shape()[*start_axis..].iter().product());
                reshaped(a, &shape)?
            }
            NodeType::Unflatten2d { input, reference } => {
                let a = self.operand(*input)?;
                let r = self.operand(*reference)?;
                if r.ndim() < 2 || a.ndim() == 0 {
                    return Err(RuntimeError::ShapeError("Unflatten2d needs a spatial reference".to_string()));
                }
                let mut shape = a.shape()[..a.ndim() - 1].to_vec();
                shape.extend_from_slice(&r.shape()[r.ndim() - 2..]);
                reshaped(a, &shape)?
            }
            NodeType::Transpose(op, axis1, axis2) => op_transpose(self.operand(*op)?, *axis1, *axis2)?,
            NodeType::Concat { inputs, axis } => {
                let views = inputs
                    .iter()
                    .map(|id| self.operand(*id).map(|a| a.view()))
                    .collect::<Result<Vec<_>, _>>()?;
                ndarray::concatenate(Axis(*axis), &views).map_err(|e| RuntimeError::ShapeError(e.to_string()))?
            }
            NodeType::Slice { input, axis, start, len } => op_slice(self.operand(*input)?, *axis, *start, *len)?,

            NodeType::Conv2d { input, weight, bias, stride, padding } => {
                let bias_val = match bias {
                    Some(b) => Some(self.operand(*b)?),
                    None => None,
                };
                op_conv2d(self.operand(*input)?, self.operand(*weight)?, bias_val, *stride, *padding)?
            }
            NodeType::MaxPool2d { input, kernel_size, stride } => {
                op_pool2d(self.operand(*input)?, *kernel_size, *stride, PoolKind::Max)?
            }
            NodeType::AvgPool2d { input, kernel_size, stride } => {
                op_pool2d(self.operand(*input)?, *kernel_size, *stride, PoolKind::Average)?
            }
            NodeType::Upsample2d { input, scale } => op_upsample2d(self.operand(*input)?, *scale)?,
            NodeType::Embedding { indices, weight } => op_embedding(self.operand(*indices)?, self.operand(*weight)?)?,
        };

        self.memo.insert((self.asg.id, node_id), Value::Tensor(result));
        Ok(())
    }
}

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("Topological sort failed: {}", e)))?;

        let mut context = ExecutionContext::new(main_asg, initial_memo);
        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let results = main_asg
            .outputs
            .iter()
            .map(|id| {
                context
                    .memo
                    .get(&(main_asg.id, *id))
                    .cloned()
                    .ok_or(RuntimeError::NodeNotFound(*id, main_asg.id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

fn shape_error(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::ShapeError(e.to_string())
}

/// Copies `a` into a new array of `shape`, in logical (row-major) order.
fn reshaped(a: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>, RuntimeError> {
    ArrayD::from_shape_vec(IxDyn(shape), a.iter().copied().collect()).map_err(shape_error)
}

fn broadcast_binary(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    op: &str,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>, RuntimeError> {
    let shape = broadcast_shapes(a.shape(), b.shape()).map_err(|e| shape_error(format!("{}: {}", op, e)))?;
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| shape_error(format!("{}: cannot broadcast {:?} to {:?}", op, a.shape(), shape)))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| shape_error(format!("{}: cannot broadcast {:?} to {:?}", op, b.shape(), shape)))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

fn op_residual(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, RuntimeError> {
    if a.shape() != b.shape() {
        return Err(shape_error(format!(
            "Residual operands differ: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(a + b)
}

fn op_softmax(a: &ArrayD<f32>) -> ArrayD<f32> {
    let mut result = a.to_owned();
    if result.ndim() == 0 {
        return result.mapv(|_| 1.0);
    }
    let last_axis = Axis(result.ndim() - 1);
    for mut lane in result.lanes_mut(last_axis) {
        let max_val = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|x| (x - max_val).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    result
}

fn check_axes(a: &ArrayD<f32>, axes: &[usize]) -> Result<Vec<usize>, RuntimeError> {
    if let Some(axis) = axes.iter().find(|&&ax| ax >= a.ndim()) {
        return Err(shape_error(format!("Axis {} out of range for rank {}", axis, a.ndim())));
    }
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    Ok(sorted)
}

fn op_sum_axes(a: &ArrayD<f32>, axes: &[usize], keep_dims: bool) -> Result<ArrayD<f32>, RuntimeError> {
    let axes = check_axes(a, axes)?;
    let mut out = a.to_owned();
    for &axis in axes.iter().rev() {
        out = out.sum_axis(Axis(axis));
        if keep_dims {
            out = out.insert_axis(Axis(axis));
        }
    }
    Ok(out)
}

fn reduced_count(a: &ArrayD<f32>, axes: &[usize]) -> usize {
    axes.iter().map(|&ax| a.shape()[ax]).product()
}

fn op_mean_axes(a: &ArrayD<f32>, axes: &[usize], keep_dims: bool) -> Result<ArrayD<f32>, RuntimeError> {
    let sum = op_sum_axes(a, axes, keep_dims)?;
    let count = reduced_count(a, &check_axes(a, axes)?).max(1) as f32;
    Ok(sum.mapv(|v| v / count))
}

fn op_variance(a: &ArrayD<f32>, axes: &[usize], unbiased: bool) -> Result<ArrayD<f32>, RuntimeError> {
    let mean = op_mean_axes(a, axes, true)?;
    let squared = broadcast_binary(a, &mean, "Variance", |x, m| (x - m) * (x - m))?;
    let sum = op_sum_axes(&squared, axes, true)?;
    let count = reduced_count(a, &check_axes(a, axes)?);
    // A single sample has no unbiased estimate; fall back to the biased one.
    let denom = (if unbiased && count > 1 { count - 1 } else { count.max(1) }) as f32;
    Ok(sum.mapv(|v| v / denom))
}

fn op_matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, RuntimeError> {
    let mismatch = || shape_error(format!("Incompatible matmul shapes: {:?} and {:?}", a.shape(), b.shape()));
    match (a.ndim(), b.ndim()) {
        (2, 2) => {
            let a2 = a.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
            let b2 = b.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
            if a2.ncols() != b2.nrows() {
                return Err(mismatch());
            }
            Ok(a2.dot(&b2).into_dyn())
        }
        (3, 3) => {
            let a3 = a.view().into_dimensionality::<Ix3>().map_err(shape_error)?;
            let b3 = b.view().into_dimensionality::<Ix3>().map_err(shape_error)?;
            let (batch, m, k) = a3.dim();
            let (batch_b, k_b, n) = b3.dim();
            if batch != batch_b || k != k_b {
                return Err(mismatch());
            }
            let mut out = ndarray::Array3::<f32>::zeros((batch, m, n));
            for i in 0..batch {
                out.slice_mut(s![i, .., ..])
                    .assign(&a3.slice(s![i, .., ..]).dot(&b3.slice(s![i, .., ..])));
            }
            Ok(out.into_dyn())
        }
        (rank, 2) if rank > 2 => {
            let b2 = b.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
            let k = a.shape()[rank - 1];
            if k != b2.nrows() {
                return Err(mismatch());
            }
            let rows = a.len() / k.max(1);
            let a2 = Array2::from_shape_vec((rows, k), a.iter().copied().collect()).map_err(shape_error)?;
            let mut shape = a.shape()[..rank - 1].to_vec();
            shape.push(b2.ncols());
            reshaped(&a2.dot(&b2).into_dyn(), &shape)
        }
        _ => Err(mismatch()),
    }
}

fn op_transpose(a: &ArrayD<f32>, axis1: usize, axis2: usize) -> Result<ArrayD<f32>, RuntimeError> {
    if axis1 >= a.ndim() || axis2 >= a.ndim() {
        return Err(shape_error(format!("Transpose axes ({}, {}) out of range for rank {}", axis1, axis2, a.ndim())));
    }
    let mut axes: Vec<usize> = (0..a.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(a.view().permuted_axes(axes).as_standard_layout().into_owned())
}

fn op_slice(a: &ArrayD<f32>, axis: usize, start: usize, len: usize) -> Result<ArrayD<f32>, RuntimeError> {
    if axis >= a.ndim() || start + len > a.shape()[axis] {
        return Err(shape_error(format!(
            "Slice [{}..{}) on axis {} out of bounds for {:?}",
            start,
            start + len,
            axis,
            a.shape()
        )));
    }
    Ok(a.slice_axis(Axis(axis), Slice::from(start..start + len)).to_owned())
}

/// 2D convolution via im2col.
/// Input: [N, C_in, H, W], Weight: [C_out, C_in, kH, kW], Bias: [C_out]
fn op_conv2d(
    input: &ArrayD<f32>,
    weight: &ArrayD<f32>,
    bias: Option<&ArrayD<f32>>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<ArrayD<f32>, RuntimeError> {
    let x = input.view().into_dimensionality::<Ix4>().map_err(|e| shape_error(format!("Conv2d input: {}", e)))?;
    let w = weight.view().into_dimensionality::<Ix4>().map_err(|e| shape_error(format!("Conv2d weight: {}", e)))?;

    let (batch_size, in_channels, in_h, in_w) = x.dim();
    let (out_channels, weight_in_channels, kernel_h, kernel_w) = w.dim();
    if in_channels != weight_in_channels {
        return Err(shape_error(format!(
            "Conv2d: input channels {} != weight input channels {}",
            in_channels, weight_in_channels
        )));
    }

    let (stride_h, stride_w) = stride;
    let (pad_h, pad_w) = padding;
    if in_h + 2 * pad_h < kernel_h || in_w + 2 * pad_w < kernel_w || stride_h == 0 || stride_w == 0 {
        return Err(shape_error(format!("Conv2d: kernel {:?} does not fit input {:?}", w.dim(), x.dim())));
    }
    let out_h = (in_h + 2 * pad_h - kernel_h) / stride_h + 1;
    let out_w = (in_w + 2 * pad_w - kernel_w) / stride_w + 1;

    let patch = in_channels * kernel_h * kernel_w;
    let w_mat = Array2::from_shape_vec((out_channels, patch), w.iter().copied().collect()).map_err(shape_error)?;

    let mut output = Array4::<f32>::zeros((batch_size, out_channels, out_h, out_w));
    let mut cols = Array2::<f32>::zeros((patch, out_h * out_w));

    for n in 0..batch_size {
        cols.fill(0.0);
        for c in 0..in_channels {
            for kh in 0..kernel_h {
                for kw in 0..kernel_w {
                    let row = (c * kernel_h + kh) * kernel_w + kw;
                    for oh in 0..out_h {
                        let ih = (oh * stride_h + kh) as isize - pad_h as isize;
                        if ih < 0 || ih >= in_h as isize {
                            continue;
                        }
                        for ow in 0..out_w {
                            let iw = (ow * stride_w + kw) as isize - pad_w as isize;
                            if iw >= 0 && iw < in_w as isize {
                                cols[[row, oh * out_w + ow]] = x[[n, c, ih as usize, iw as usize]];
                            }
                        }
                    }
                }
            }
        }
        let y = w_mat.dot(&cols).into_shape((out_channels, out_h, out_w)).map_err(shape_error)?;
        output.slice_mut(s![n, .., .., ..]).assign(&y);
    }

    if let Some(bias_val) = bias {
        let b = bias_val.view().into_dimensionality::<Ix1>().map_err(shape_error)?;
        if b.len() != out_channels {
            return Err(shape_error(format!("Conv2d: bias of length {} for {} channels", b.len(), out_channels)));
        }
        for (c, mut plane) in output.axis_iter_mut(Axis(1)).enumerate() {
            plane += b[c];
        }
    }

    Ok(output.into_dyn())
}

#[derive(Clone, Copy)]
enum PoolKind {
    Max,
    Average,
}

fn op_pool2d(
    input: &ArrayD<f32>,
    kernel_size: (usize, usize),
    stride: (usize, usize),
    kind: PoolKind,
) -> Result<ArrayD<f32>, RuntimeError> {
    let x = input.view().into_dimensionality::<Ix4>().map_err(shape_error)?;
    let (n, c, h, w) = x.dim();
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    if h < kh || w < kw || sh == 0 || sw == 0 || kh == 0 || kw == 0 {
        return Err(shape_error(format!("Pool window {:?} does not fit {:?}", kernel_size, x.dim())));
    }
    let out_h = (h - kh) / sh + 1;
    let out_w = (w - kw) / sw + 1;
    let area = (kh * kw) as f32;

    let output = Array4::from_shape_fn((n, c, out_h, out_w), |(b, ch, oh, ow)| {
        let window = x.slice(s![b, ch, oh * sh..oh * sh + kh, ow * sw..ow * sw + kw]);
        match kind {
            PoolKind::Max => window.fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
            PoolKind::Average => window.sum() / area,
        }
    });
    Ok(output.into_dyn())
}

/// Nearest-neighbour upsampling.
fn op_upsample2d(input: &ArrayD<f32>, scale: usize) -> Result<ArrayD<f32>, RuntimeError> {
    if scale == 0 {
        return Err(shape_error("Upsample2d: scale must be positive"));
    }
    let x = input.view().into_dimensionality::<Ix4>().map_err(shape_error)?;
    let (n, c, h, w) = x.dim();
    let output = Array4::from_shape_fn((n, c, h * scale, w * scale), |(b, ch, i, j)| {
        x[[b, ch, i / scale, j / scale]]
    });
    Ok(output.into_dyn())
}

/// Embedding lookup.
/// Indices: any shape [*], Weight: [num_embeddings, embedding_dim]
/// Output: [*, embedding_dim]
fn op_embedding(indices: &ArrayD<f32>, weight: &ArrayD<f32>) -> Result<ArrayD<f32>, RuntimeError> {
    let table = weight
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| shape_error(format!("Embedding weight must be 2D, got {}D", weight.ndim())))?;
    let (num_embeddings, embedding_dim) = table.dim();

    let rows = indices
        .iter()
        .map(|&idx| {
            if idx.fract() != 0.0 || idx < 0.0 || idx as usize >= num_embeddings {
                Err(RuntimeError::IndexOutOfRange {
                    what: "embedding table".to_string(),
                    index: idx as i64,
                    size: num_embeddings,
                })
            } else {
                Ok(idx as usize)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let gathered = table.select(Axis(0), &rows);
    let mut shape = indices.shape().to_vec();
    shape.push(embedding_dim);
    reshaped(&gathered.into_dyn(), &shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayD};

    fn run_single(ctx: &std::rc::Rc<std::cell::RefCell<GraphContext>>, out: &Tensor, feeds: Vec<(&Tensor, ArrayD<f32>)>) -> ArrayD<f32> {
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let mut memo = HashMap::new();
        for (t, v) in feeds {
            memo.insert((graph.id, t.node_id), Value::Tensor(v));
        }
        let backend = CpuBackend::new();
        let (results, _) = backend.run(&graph, memo).unwrap();
        results.into_iter().next().unwrap().into_tensor()
    }

    #[test]
    fn test_broadcast_add_and_scalar_divide() {
        let ctx = GraphContext::shared();
        let a = Tensor::new_input(&ctx, "a");
        let b = Tensor::new_input(&ctx, "b");
        let two = Tensor::scalar(&ctx, 2.0, "two");
        let out = &(&a + &b) / &two;

        let result = run_single(
            &ctx,
            &out,
            vec![(&a, array![[1.0, 2.0], [3.0, 4.0]].into_dyn()), (&b, array![10.0, 20.0].into_dyn())],
        );
        assert_eq!(result, array![[5.5, 11.0], [6.5, 12.0]].into_dyn());
    }

    #[test]
    fn test_residual_rejects_mismatch() {
        let ctx = GraphContext::shared();
        let a = Tensor::new_input(&ctx, "a");
        let b = Tensor::new_input(&ctx, "b");
        let out = a.residual(&b);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let mut memo = HashMap::new();
        memo.insert((0, a.node_id), Value::Tensor(ArrayD::zeros(vec![1, 4])));
        memo.insert((0, b.node_id), Value::Tensor(ArrayD::zeros(vec![1, 1])));
        let err = CpuBackend::new().run(&graph, memo).unwrap_err();
        assert!(matches!(err, RuntimeError::ShapeError(_)));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let out = x.softmax();
        let result = run_single(&ctx, &out, vec![(&x, array![[[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]]].into_dyn())]);
        for row in result.lanes(Axis(2)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(result[[0, 1, 0]], 1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_conv2d_matches_direct_sum() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_input(&ctx, "w");
        let b = Tensor::new_input(&ctx, "b");
        let out = x.conv2d(&w, Some(&b), (1, 1), (1, 1));

        let input = ArrayD::from_shape_fn(vec![1, 2, 3, 3], |ix| (ix[1] * 9 + ix[2] * 3 + ix[3]) as f32);
        let weight = ArrayD::from_elem(vec![1, 2, 3, 3], 1.0);
        let result = run_single(&ctx, &out, vec![(&x, input.clone()), (&w, weight), (&b, array![0.5].into_dyn())]);

        assert_eq!(result.shape(), &[1, 1, 3, 3]);
        // Centre pixel sees every input value.
        assert_abs_diff_eq!(result[[0, 0, 1, 1]], input.sum() + 0.5, epsilon = 1e-4);
        // Corner pixel sees a 2x2 window in each channel.
        let corner = (0.0 + 1.0 + 3.0 + 4.0) + (9.0 + 10.0 + 12.0 + 13.0);
        assert_abs_diff_eq!(result[[0, 0, 0, 0]], corner + 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_pooling_and_upsample() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let avg = x.avg_pool2d((2, 2), (2, 2));
        let max = x.max_pool2d((2, 2), (2, 2));
        let up = avg.upsample2d(2);

        let input = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1.0, 2.0, 3.0, 6.0]).unwrap();
        assert_eq!(run_single(&ctx, &avg, vec![(&x, input.clone())]), ArrayD::from_elem(IxDyn(&[1, 1, 1, 1]), 3.0));
        assert_eq!(run_single(&ctx, &max, vec![(&x, input.clone())]), ArrayD::from_elem(IxDyn(&[1, 1, 1, 1]), 6.0));
        assert_eq!(run_single(&ctx, &up, vec![(&x, input)]), ArrayD::from_elem(vec![1, 1, 2, 2], 3.0));
    }

    #[test]
    fn test_variance_biased_and_unbiased() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let biased = x.variance(&[0], false);
        let unbiased = x.variance(&[0], true);
        let input = array![1.0, 2.0, 3.0, 4.0].into_dyn();

        assert_abs_diff_eq!(run_single(&ctx, &biased, vec![(&x, input.clone())])[[0]], 1.25, epsilon = 1e-6);
        assert_abs_diff_eq!(run_single(&ctx, &unbiased, vec![(&x, input)])[[0]], 5.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_embedding_lookup_and_bounds() {
        let ctx = GraphContext::shared();
        let idx = Tensor::new_input(&ctx, "idx");
        let table = Tensor::new_input(&ctx, "table");
        let out = idx.embedding(&table);
        let weights = array![[0.0, 1.0], [2.0, 3.0], [4.0, 5.0]].into_dyn();

        let result = run_single(&ctx, &out, vec![(&idx, array![2.0, 0.0].into_dyn()), (&table, weights.clone())]);
        assert_eq!(result, array![[4.0, 5.0], [0.0, 1.0]].into_dyn());

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let mut memo = HashMap::new();
        memo.insert((0, idx.node_id), Value::Tensor(array![3.0].into_dyn()));
        memo.insert((0, table.node_id), Value::Tensor(weights));
        let err = CpuBackend::new().run(&graph, memo).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::IndexOutOfRange { what: "embedding table".to_string(), index: 3, size: 3 }
        );
    }

    #[test]
    fn test_batched_matmul_and_transpose() {
        let ctx = GraphContext::shared();
        let a = Tensor::new_input(&ctx, "a");
        let out = a.transpose(1, 2).dot(&a);
        let input = array![[[1.0, 2.0], [3.0, 4.0]]].into_dyn();
        let result = run_single(&ctx, &out, vec![(&a, input)]);
        assert_eq!(result, array![[[10.0, 14.0], [14.0, 20.0]]].into_dyn());
    }
}
