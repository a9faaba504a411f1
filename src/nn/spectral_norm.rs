//! Spectral normalization of a weight tensor.
//!
//! The weight is viewed as a matrix `[rows, cols]` (first dimension kept,
//! the rest flattened) and divided by an estimate of its largest singular
//! value. The estimate comes from one power-iteration step per use,
//! starting from the persisted left singular vector `u`:
//!
//! ```text
//! v  = normalize(W^T u)
//! u' = normalize(W v)
//! sigma = u' . (W v)
//! ```
//!
//! `normalize(x) = x / (||x|| + eps)`. In training mode `u'` replaces the
//! stored `u` after the run; in evaluation mode `u` is left as is.

use crate::nn::module::Mode;
use crate::params::StateInit;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

pub const DEFAULT_SN_EPS: f32 = 1e-12;

#[derive(Debug, Clone)]
pub struct SpectralNorm {
    weight: Tensor,
    /// Left singular vector estimate, `[rows, 1]`.
    pub u: Tensor,
    u_name: String,
    eps: Tensor,
    rows: usize,
}

impl SpectralNorm {
    /// Wraps `weight` (registered as `weight_name` with `shape`).
    /// Registers the state `{weight_name}.u`.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        weight_name: &str,
        weight: &Tensor,
        shape: &[usize],
        eps: f32,
    ) -> Self {
        assert!(!shape.is_empty(), "spectral norm needs a weight of rank >= 1");
        let rows = shape[0];
        let u_name = format!("{}.u", weight_name);
        let u = Tensor::new_state(context, &u_name, vec![rows, 1], StateInit::UnitGaussian);
        let eps = Tensor::scalar(context, eps, &format!("{}.sn_eps", weight_name));
        Self { weight: weight.clone(), u, u_name, eps, rows }
    }

    fn normalize(&self, x: &Tensor) -> Tensor {
        x / &(&x.l2_norm() + &self.eps)
    }

    /// One power-iteration step. Returns `(u', sigma)`.
    pub fn power_iteration(&self) -> (Tensor, Tensor) {
        let w = self.weight.reshape(vec![self.rows as isize, -1]);
        let v = self.normalize(&w.transpose(0, 1).dot(&self.u));
        let wv = w.dot(&v);
        let u_next = self.normalize(&wv);
        let sigma = (&u_next * &wv).sum();
        (u_next, sigma)
    }

    /// The weight divided by its estimated spectral norm, in the weight's own shape.
    pub fn normalized(&self, mode: Mode) -> Tensor {
        self.normalized_with_sigma(mode).0
    }

    /// Like [`normalized`](Self::normalized), also returning the sigma node.
    pub fn normalized_with_sigma(&self, mode: Mode) -> (Tensor, Tensor) {
        let (u_next, sigma) = self.power_iteration();
        if mode.is_train() {
            self.weight.context.borrow_mut().record_state_update(&self.u_name, u_next.node_id);
        }
        (&self.weight / &sigma, sigma)
    }
}
