//! Spatial self-attention over `[B, C, H, W]` feature maps.
//!
//! Queries come from every position; keys and values from a 2x2
//! max-pooled grid. The attention logits are plain dot products with no
//! `1/sqrt(d_k)` factor. The result is projected back to `C` channels and
//! added to the input through a learned scalar gain that starts at zero,
//! so a freshly initialized block is the identity.

use crate::nn::conv::Conv2d;
use crate::nn::module::{Mode, Module};
use crate::params::ParamKind;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

pub struct SelfAttention {
    pub channels: usize,
    /// Query projection `C -> C/8`.
    pub theta: Conv2d,
    /// Key projection `C -> C/8`.
    pub phi: Conv2d,
    /// Value projection `C -> C/2`.
    pub g: Conv2d,
    /// Output projection `C/2 -> C`.
    pub o: Conv2d,
    /// Residual gain, a scalar.
    pub gamma: Tensor,
}

impl SelfAttention {
    /// # Panics
    /// If `channels` is not a positive multiple of 8.
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, channels: usize, sn_eps: f32) -> Self {
        assert!(
            channels > 0 && channels % 8 == 0,
            "self-attention needs channels divisible by 8, got {}",
            channels
        );
        let conv = |suffix: &str, c_in: usize, c_out: usize| {
            Conv2d::pointwise(context, &format!("{}.{}", name, suffix), c_in, c_out, false, sn_eps)
        };

        Self {
            channels,
            theta: conv("theta", channels, channels / 8),
            phi: conv("phi", channels, channels / 8),
            g: conv("g", channels, channels / 2),
            o: conv("o", channels / 2, channels),
            gamma: Tensor::new_parameter(context, &format!("{}.gamma", name), vec![], ParamKind::Gain),
        }
    }
}

impl Module for SelfAttention {
    fn forward(&self, x: &Tensor, mode: Mode) -> Tensor {
        // [B, C/8, HW]
        let theta = self.theta.forward(x, mode).flatten(2);
        // [B, C/8, HW/4]
        let phi = self.phi.forward(x, mode).max_pool2d((2, 2), (2, 2)).flatten(2);
        // [B, C/2, HW/4]
        let g = self.g.forward(x, mode).max_pool2d((2, 2), (2, 2)).flatten(2);

        // [B, HW, HW/4]
        let beta = theta.transpose(1, 2).dot(&phi).softmax();
        // [B, C/2, H, W]
        let attended = g.dot(&beta.transpose(1, 2)).unflatten2d(x);
        let o = self.o.forward(&attended, mode);

        x.residual(&(&self.gamma * &o))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        for conv in [&self.theta, &self.phi, &self.g, &self.o] {
            params.extend(conv.parameters());
        }
        params.push(self.gamma.clone());
        params
    }
}
