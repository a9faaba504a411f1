//! Embedding layer.
//!
//! Maps integer class labels to dense vectors. Labels are fed as `f32`
//! values holding whole numbers.

use super::module::{Mode, Module};
use crate::nn::spectral_norm::SpectralNorm;
use crate::params::ParamKind;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Embedding layer turning indices into dense vectors.
///
/// # Example
///
/// ```ignore
/// use rustygan::nn::{Embedding, Mode, Module};
///
/// let embedding = Embedding::new(&context, "shared_emb", 1000, 128);
/// let labels = Tensor::new_input(&context, "labels"); // [batch]
/// let embedded = embedding.forward(&labels, Mode::Eval); // [batch, 128]
/// ```
#[derive(Debug, Clone)]
pub struct Embedding {
    /// Number of distinct indices.
    pub num_embeddings: usize,
    /// Size of each vector.
    pub embedding_dim: usize,
    /// Table of shape [num_embeddings, embedding_dim].
    pub weight: Tensor,
    spectral_norm: Option<SpectralNorm>,
}

impl Embedding {
    /// Creates a plain embedding table `{name}.weight`.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        num_embeddings: usize,
        embedding_dim: usize,
    ) -> Self {
        let weight = Tensor::new_parameter(
            context,
            &format!("{}.weight", name),
            vec![num_embeddings, embedding_dim],
            ParamKind::EmbeddingWeight,
        );
        Self { num_embeddings, embedding_dim, weight, spectral_norm: None }
    }

    /// Creates an embedding table whose rows are read from the
    /// spectral-normalized table.
    pub fn spectral(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        num_embeddings: usize,
        embedding_dim: usize,
        sn_eps: f32,
    ) -> Self {
        let mut embedding = Self::new(context, name, num_embeddings, embedding_dim);
        embedding.spectral_norm = Some(SpectralNorm::new(
            context,
            &format!("{}.weight", name),
            &embedding.weight,
            &[num_embeddings, embedding_dim],
            sn_eps,
        ));
        embedding
    }
}

impl Module for Embedding {
    /// Looks up `indices` (any shape) and returns `[*indices, embedding_dim]`.
    fn forward(&self, indices: &Tensor, mode: Mode) -> Tensor {
        let table = match &self.spectral_norm {
            Some(sn) => sn.normalized(mode),
            None => self.weight.clone(),
        };
        indices.embedding(&table)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone()]
    }
}
