//! Fully connected (linear) layer in the graph paradigm.

use crate::nn::module::{Mode, Module};
use crate::nn::spectral_norm::{SpectralNorm, DEFAULT_SN_EPS};
use crate::params::ParamKind;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for a Linear layer.
#[derive(Debug, Clone)]
pub struct LinearConfig {
    pub in_features: usize,
    pub out_features: usize,
    /// Use bias.
    pub bias: bool,
    /// Divide the weight by its spectral norm before each use.
    pub spectral_norm: bool,
    pub sn_eps: f32,
}

impl LinearConfig {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self { in_features, out_features, bias: true, spectral_norm: false, sn_eps: DEFAULT_SN_EPS }
    }

    /// Enables/disables bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Enables spectral normalization with the given epsilon.
    pub fn with_spectral_norm(mut self, eps: f32) -> Self {
        self.spectral_norm = true;
        self.sn_eps = eps;
        self
    }
}

/// Fully connected layer computing `y = x W^T + b`.
///
/// The layer holds no data: `weight` (`[out, in]`) and `bias` (`[out]`) are
/// `Parameter` nodes whose values live in the parameter store.
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    spectral_norm: Option<SpectralNorm>,
    pub config: LinearConfig,
}

impl Linear {
    /// Creates a plain linear layer with bias.
    ///
    /// * `name` - Base name, so parameters get unique names in the graph
    ///   (e.g. "proj_z.weight", "proj_z.bias").
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, in_features: usize, out_features: usize) -> Self {
        Self::from_config(context, name, LinearConfig::new(in_features, out_features))
    }

    pub fn from_config(context: &Rc<RefCell<GraphContext>>, name: &str, config: LinearConfig) -> Self {
        let weight_name = format!("{}.weight", name);
        let shape = vec![config.out_features, config.in_features];
        let weight = Tensor::new_parameter(context, &weight_name, shape.clone(), ParamKind::LinearWeight);

        let bias = config.bias.then(|| {
            Tensor::new_parameter(context, &format!("{}.bias", name), vec![config.out_features], ParamKind::Bias)
        });

        let spectral_norm = config
            .spectral_norm
            .then(|| SpectralNorm::new(context, &weight_name, &weight, &shape, config.sn_eps));

        Self { weight, bias, spectral_norm, config }
    }

    /// The weight as used by the forward pass.
    pub fn effective_weight(&self, mode: Mode) -> Tensor {
        match &self.spectral_norm {
            Some(sn) => sn.normalized(mode),
            None => self.weight.clone(),
        }
    }
}

impl Module for Linear {
    fn forward(&self, inputs: &Tensor, mode: Mode) -> Tensor {
        let output = inputs.dot(&self.effective_weight(mode).transpose(0, 1));
        match &self.bias {
            Some(bias) => &output + bias,
            None => output,
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::DType;
    use crate::params::ParameterStore;
    use crate::runtime::compiled::CompiledGraph;
    use crate::runtime::cpu_backend::CpuBackend;
    use ndarray::array;
    use std::collections::HashMap;

    #[test]
    fn test_linear_forward() {
        let ctx = GraphContext::shared();
        let fc = Linear::new(&ctx, "fc", 3, 2);
        let x = Tensor::new_input(&ctx, "x");
        let y = fc.forward(&x, Mode::Eval);

        let shapes = HashMap::from([("x".to_string(), (vec![1, 3], DType::F32))]);
        let compiled = CompiledGraph::compile(&ctx, &[&y], vec![], &shapes).unwrap();
        assert_eq!(compiled.output_shapes(), vec![vec![1, 2]]);

        let mut store = ParameterStore::new();
        store.set_parameter("fc.weight", array![[1.0, 0.0, 1.0], [0.0, 2.0, 0.0]].into_dyn());
        store.set_parameter("fc.bias", array![0.5, -0.5].into_dyn());
        let feeds = HashMap::from([("x".to_string(), array![[1.0, 2.0, 3.0]].into_dyn())]);
        let out = compiled.run(&CpuBackend::new(), &feeds, &mut store).unwrap();
        assert_eq!(out[0], array![[4.5, 3.5]].into_dyn());
    }

    #[test]
    fn test_spectral_linear_registers_state_and_no_bias() {
        let ctx = GraphContext::shared();
        let fc = Linear::from_config(&ctx, "scale", LinearConfig::new(12, 16).with_bias(false).with_spectral_norm(1e-12));
        assert!(fc.bias.is_none());
        assert_eq!(fc.parameters().len(), 1);
        assert_eq!(ctx.borrow().registry().state("scale.weight.u").unwrap().shape, vec![16, 1]);
        assert_eq!(ctx.borrow().registry().parameter("scale.weight").unwrap().shape, vec![16, 12]);
    }
}
