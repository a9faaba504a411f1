//! Parameter initialization.
//!
//! Weights of linear, convolution and embedding operators get orthogonal
//! initialization; biases, shifts and gains start at zero and normalization
//! scales at one. State tensors follow their `StateInit`.

use crate::params::{ParamKind, ParameterRegistry, ParameterStore, StateInit};
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use tracing::debug;

/// Builds a store holding initial values for everything in `registry`.
pub fn initialize<R: Rng + ?Sized>(registry: &ParameterRegistry, rng: &mut R) -> ParameterStore {
    let mut store = ParameterStore::new();

    for spec in registry.parameters() {
        let value = match spec.kind {
            kind if kind.is_operator_weight() => orthogonal(&spec.shape, rng),
            ParamKind::NormScale => ArrayD::ones(IxDyn(&spec.shape)),
            _ => ArrayD::zeros(IxDyn(&spec.shape)),
        };
        store.set_parameter(&spec.name, value);
    }

    for spec in registry.states() {
        let value = match spec.init {
            StateInit::Zeros => ArrayD::zeros(IxDyn(&spec.shape)),
            StateInit::Ones => ArrayD::ones(IxDyn(&spec.shape)),
            StateInit::UnitGaussian => unit_gaussian(&spec.shape, rng),
        };
        store.set_state(&spec.name, value);
    }

    debug!(
        parameters = store.parameters.len(),
        states = store.states.len(),
        "initialized parameter store"
    );
    store
}

/// Random tensor with unit L2 norm.
pub fn unit_gaussian<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    loop {
        let sample = ArrayD::<f32>::random_using(IxDyn(shape), StandardNormal, rng);
        let norm = sample.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-6 {
            return sample / norm;
        }
    }
}

/// Orthogonal initialization of a weight of any rank.
///
/// The weight is viewed as `[shape[0], product(shape[1..])]`. The smaller
/// side gets orthonormal vectors: rows when `rows <= cols`, columns otherwise.
pub fn orthogonal<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    if shape.is_empty() {
        return ArrayD::zeros(IxDyn(shape));
    }
    let rows = shape[0];
    let cols: usize = shape[1..].iter().product();

    let matrix = if rows <= cols {
        orthonormal_rows(rows, cols, rng)
    } else {
        orthonormal_rows(cols, rows, rng).reversed_axes()
    };

    let data: Vec<f32> = matrix.iter().copied().collect();
    ArrayD::from_shape_vec(IxDyn(shape), data).unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)))
}

/// `n` orthonormal rows of length `len` (`n <= len`), by modified Gram-Schmidt
/// on a Gaussian sample.
fn orthonormal_rows<R: Rng + ?Sized>(n: usize, len: usize, rng: &mut R) -> Array2<f32> {
    let mut q = Array2::<f32>::zeros((n, len));
    let mut i = 0;
    while i < n {
        let mut v = ndarray::Array1::<f32>::random_using(len, StandardNormal, rng);
        for j in 0..i {
            let basis = q.index_axis(Axis(0), j);
            let proj = basis.dot(&v);
            v.scaled_add(-proj, &basis);
        }
        let norm = v.dot(&v).sqrt();
        // Resample on a degenerate draw.
        if norm < 1e-6 {
            continue;
        }
        q.row_mut(i).assign(&(v / norm));
        i += 1;
    }
    q
}
