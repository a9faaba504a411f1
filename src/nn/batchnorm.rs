//! Batch normalization for `[N, C, H, W]` activations.
//!
//! `RunningNorm2d` does the normalization itself and owns the running
//! statistics; `BatchNorm2d` adds a learned per-channel affine transform and
//! `ClassConditionalBatchNorm2d` computes the affine transform from a
//! conditioning vector instead.

use crate::nn::linear::{Linear, LinearConfig};
use crate::nn::module::{ConditionalModule, Mode, Module};
use crate::params::{ParamKind, StateInit};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Small constant for numerical stability.
pub const DEFAULT_BN_EPS: f32 = 1e-5;

/// Momentum of the running statistics update.
pub const DEFAULT_MOMENTUM: f32 = 0.1;

const REDUCE_AXES: [usize; 3] = [0, 2, 3];

/// Per-channel normalization without affine parameters.
///
/// In training mode normalizes with the biased batch variance and emits
/// `r <- (1 - momentum) * r + momentum * batch` updates for both running
/// statistics, using the unbiased variance for the running estimate. In
/// evaluation mode normalizes with the running statistics.
pub struct RunningNorm2d {
    pub name: String,
    pub num_features: usize,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    eps: Tensor,
    momentum: Tensor,
    keep: Tensor,
}

impl RunningNorm2d {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        num_features: usize,
        momentum: f32,
        eps: f32,
    ) -> Self {
        let stat_shape = vec![1, num_features, 1, 1];
        let running_mean =
            Tensor::new_state(context, &format!("{}.running_mean", name), stat_shape.clone(), StateInit::Zeros);
        let running_var = Tensor::new_state(context, &format!("{}.running_var", name), stat_shape, StateInit::Ones);

        Self {
            name: name.to_string(),
            num_features,
            running_mean,
            running_var,
            eps: Tensor::scalar(context, eps, &format!("{}.eps", name)),
            momentum: Tensor::scalar(context, momentum, &format!("{}.momentum", name)),
            keep: Tensor::scalar(context, 1.0 - momentum, &format!("{}.keep", name)),
        }
    }

    fn ema(&self, running: &Tensor, batch: &Tensor) -> Tensor {
        &(&self.keep * running) + &(&self.momentum * batch)
    }

    /// Returns `(x - mean) / sqrt(var + eps)`.
    pub fn normalize(&self, x: &Tensor, mode: Mode) -> Tensor {
        let (mean, var) = match mode {
            Mode::Train => {
                let mean = x.mean_axes(&REDUCE_AXES, true);
                let var = x.variance(&REDUCE_AXES, false);

                let new_mean = self.ema(&self.running_mean, &mean);
                let new_var = self.ema(&self.running_var, &x.variance(&REDUCE_AXES, true));
                let mut ctx = x.context.borrow_mut();
                ctx.record_state_update(&format!("{}.running_mean", self.name), new_mean.node_id);
                ctx.record_state_update(&format!("{}.running_var", self.name), new_var.node_id);

                (mean, var)
            }
            Mode::Eval => (self.running_mean.clone(), self.running_var.clone()),
        };
        &(x - &mean) / &(&var + &self.eps).sqrt()
    }
}

/// Batch normalization with learned per-channel scale and shift.
pub struct BatchNorm2d {
    pub norm: RunningNorm2d,
    /// Learned scale (gamma), `[C]`.
    pub weight: Tensor,
    /// Learned shift (beta), `[C]`.
    pub bias: Tensor,
}

impl BatchNorm2d {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        num_features: usize,
        momentum: f32,
        eps: f32,
    ) -> Self {
        let norm = RunningNorm2d::new(context, name, num_features, momentum, eps);
        let weight =
            Tensor::new_parameter(context, &format!("{}.weight", name), vec![num_features], ParamKind::NormScale);
        let bias = Tensor::new_parameter(context, &format!("{}.bias", name), vec![num_features], ParamKind::NormShift);
        Self { norm, weight, bias }
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor, mode: Mode) -> Tensor {
        let normalized = self.norm.normalize(x, mode);
        let scale = self.weight.reshape(vec![1, -1, 1, 1]);
        let shift = self.bias.reshape(vec![1, -1, 1, 1]);
        &(&normalized * &scale) + &shift
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Batch normalization whose scale and shift are linear functions of a
/// conditioning vector `y` of width `cond_dim`:
///
/// `out = (1 + W_scale y) * x_hat + W_shift y`
///
/// Both projections are spectral-normalized and have no bias.
pub struct ClassConditionalBatchNorm2d {
    pub norm: RunningNorm2d,
    pub class_scale_transform: Linear,
    pub class_shift_transform: Linear,
    one: Tensor,
}

impl ClassConditionalBatchNorm2d {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        cond_dim: usize,
        num_features: usize,
        momentum: f32,
        eps: f32,
        sn_eps: f32,
    ) -> Self {
        let projection = LinearConfig::new(cond_dim, num_features).with_bias(false).with_spectral_norm(sn_eps);
        Self {
            norm: RunningNorm2d::new(context, &format!("{}.bn", name), num_features, momentum, eps),
            class_scale_transform: Linear::from_config(context, &format!("{}.scale", name), projection.clone()),
            class_shift_transform: Linear::from_config(context, &format!("{}.shift", name), projection),
            one: Tensor::scalar(context, 1.0, &format!("{}.one", name)),
        }
    }
}

impl ConditionalModule for ClassConditionalBatchNorm2d {
    fn forward_conditioned(&self, x: &Tensor, condition: &Tensor, mode: Mode) -> Tensor {
        let channels = self.norm.num_features as isize;
        let scale = (&self.one + &self.class_scale_transform.forward(condition, mode)).reshape(vec![-1, channels, 1, 1]);
        let shift = self.class_shift_transform.forward(condition, mode).reshape(vec![-1, channels, 1, 1]);
        let normalized = self.norm.normalize(x, mode);
        &(&normalized * &scale) + &shift
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.class_scale_transform.parameters();
        params.extend(self.class_shift_transform.parameters());
        params
    }
}
