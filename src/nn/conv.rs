//! 2D convolution layer.

use crate::nn::module::{Mode, Module};
use crate::nn::spectral_norm::{SpectralNorm, DEFAULT_SN_EPS};
use crate::params::ParamKind;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for Conv2d layer.
#[derive(Debug, Clone)]
pub struct Conv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels (filters).
    pub out_channels: usize,
    /// Convolution kernel size.
    pub kernel_size: (usize, usize),
    /// Convolution stride.
    pub stride: (usize, usize),
    /// Padding.
    pub padding: (usize, usize),
    /// Use bias.
    pub bias: bool,
    /// Divide the kernel by its spectral norm before each use.
    pub spectral_norm: bool,
    pub sn_eps: f32,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: (3, 3),
            stride: (1, 1),
            padding: (0, 0),
            bias: true,
            spectral_norm: false,
            sn_eps: DEFAULT_SN_EPS,
        }
    }
}

impl Conv2dConfig {
    /// Creates Conv2d configuration.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self { in_channels, out_channels, kernel_size, ..Default::default() }
    }

    /// Sets convolution stride.
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    /// Sets padding.
    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
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

/// 2D Convolutional layer.
///
/// Applies 2D convolution to input tensor of shape [N, C_in, H, W].
/// Output tensor has shape [N, C_out, H_out, W_out].
///
/// # Example
///
/// ```rust,ignore
/// use rustygan::nn::{Conv2d, Conv2dConfig, Mode, Module};
///
/// let conv = Conv2d::from_config(&context, "conv1",
///     Conv2dConfig::new(3, 64, (3, 3)).with_padding((1, 1)).with_spectral_norm(1e-12));
/// let output = conv.forward(&input, Mode::Train);
/// ```
pub struct Conv2d {
    /// Symbolic descriptor for weight tensor [C_out, C_in, kH, kW].
    pub weight: Tensor,
    /// Optional symbolic descriptor for bias [C_out].
    pub bias: Option<Tensor>,
    spectral_norm: Option<SpectralNorm>,
    /// Layer configuration.
    pub config: Conv2dConfig,
}

impl Conv2d {
    /// Creates Conv2d layer from configuration.
    pub fn from_config(context: &Rc<RefCell<GraphContext>>, name: &str, config: Conv2dConfig) -> Self {
        let weight_name = format!("{}.weight", name);
        let shape = vec![config.out_channels, config.in_channels, config.kernel_size.0, config.kernel_size.1];
        let weight = Tensor::new_parameter(context, &weight_name, shape.clone(), ParamKind::ConvWeight);

        let bias = if config.bias {
            let bias_name = format!("{}.bias", name);
            Some(Tensor::new_parameter(context, &bias_name, vec![config.out_channels], ParamKind::Bias))
        } else {
            None
        };

        let spectral_norm = if config.spectral_norm {
            Some(SpectralNorm::new(context, &weight_name, &weight, &shape, config.sn_eps))
        } else {
            None
        };

        Self { weight, bias, spectral_norm, config }
    }

    /// 1x1 spectral-normalized convolution, the building block of attention and skip paths.
    pub fn pointwise(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        bias: bool,
        sn_eps: f32,
    ) -> Self {
        let config = Conv2dConfig::new(in_channels, out_channels, (1, 1)).with_bias(bias).with_spectral_norm(sn_eps);
        Self::from_config(context, name, config)
    }
}

impl Module for Conv2d {
    /// Applies convolution to input.
    fn forward(&self, inputs: &Tensor, mode: Mode) -> Tensor {
        let weight = match &self.spectral_norm {
            Some(sn) => sn.normalized(mode),
            None => self.weight.clone(),
        };
        inputs.conv2d(&weight, self.bias.as_ref(), self.config.stride, self.config.padding)
    }

    /// Returns trainable parameters of the layer.
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }
}
