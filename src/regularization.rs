//! Orthogonal regularization over stored weights.
//!
//! For a weight viewed as `W: [out, rest]` the penalty is
//! `beta * || W W^T * (1 - I) ||_F^2`: the squared off-diagonal entries of
//! the Gram matrix of its rows. Only operator weights (linear, convolution,
//! embedding) are penalized.

use crate::error::{GanError, Result};
use crate::params::{ParameterRegistry, ParameterStore};
use crate::runtime::backend::RuntimeError;
use ndarray::ArrayD;

/// Unscaled penalty of one weight.
pub fn off_diagonal_gram_norm(weight: &ArrayD<f32>) -> Result<f32> {
    let rows = weight.shape().first().copied().unwrap_or(1);
    let cols = if rows == 0 { 0 } else { weight.len() / rows };
    let standard = weight.as_standard_layout();
    let matrix = standard
        .view()
        .into_shape((rows, cols))
        .map_err(|e| RuntimeError::ShapeError(format!("cannot view {:?} as a matrix: {}", weight.shape(), e)))?;

    let gram = matrix.dot(&matrix.t());
    Ok(gram.indexed_iter().filter(|((i, j), _)| i != j).map(|(_, v)| v * v).sum())
}

/// `beta` times the summed penalty of every operator weight in `registry`.
pub fn orthogonal_penalty(registry: &ParameterRegistry, store: &ParameterStore, beta: f32) -> Result<f32> {
    let mut total = 0.0;
    for spec in registry.parameters().iter().filter(|s| s.kind.is_operator_weight()) {
        let weight = store.parameter(&spec.name).ok_or_else(|| GanError::MissingValue(spec.name.clone()))?;
        total += off_diagonal_gram_norm(weight)?;
    }
    Ok(beta * total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init;
    use crate::params::ParamKind;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_orthogonal_init_has_no_penalty() {
        let mut registry = ParameterRegistry::new();
        registry.register_parameter("conv.weight", vec![4, 2, 3, 3], ParamKind::ConvWeight);
        registry.register_parameter("fc.weight", vec![6, 10], ParamKind::LinearWeight);
        let store = init::initialize(&registry, &mut StdRng::seed_from_u64(2));

        let penalty = orthogonal_penalty(&registry, &store, 1.0).unwrap();
        assert_abs_diff_eq!(penalty, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_penalty_counts_off_diagonal_entries_only() {
        // Rows (1, 1) and (1, 0): Gram matrix [[2, 1], [1, 1]].
        let weight = array![[1.0, 1.0], [1.0, 0.0]].into_dyn();
        assert_abs_diff_eq!(off_diagonal_gram_norm(&weight).unwrap(), 2.0);

        let mut registry = ParameterRegistry::new();
        registry.register_parameter("w", vec![2, 2], ParamKind::LinearWeight);
        registry.register_parameter("b", vec![2], ParamKind::Bias);
        let mut store = ParameterStore::new();
        store.set_parameter("w", weight);
        store.set_parameter("b", array![5.0, 5.0].into_dyn());
        assert_abs_diff_eq!(orthogonal_penalty(&registry, &store, 1e-4).unwrap(), 2e-4);
    }

    #[test]
    fn test_missing_weight_is_reported() {
        let mut registry = ParameterRegistry::new();
        registry.register_parameter("w", vec![2, 2], ParamKind::EmbeddingWeight);
        let err = orthogonal_penalty(&registry, &ParameterStore::new(), 1.0).unwrap_err();
        assert!(matches!(err, GanError::MissingValue(name) if name == "w"));
    }
}
