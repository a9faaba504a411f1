//! Downsampling residual block of the discriminator.

use crate::config::BigGanConfig;
use crate::nn::{Conv2d, Conv2dConfig, Mode, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Residual block that optionally halves the spatial size.
///
/// ```text
/// main: [relu] -> conv3x3 -> relu -> [avgpool 2]
/// skip: preactivated:     mixin 1x1 -> [avgpool 2]
///       not preactivated: [avgpool 2] -> mixin 1x1
/// ```
///
/// The mixin exists when channels change or the block downsamples.
pub struct DResidualBlock {
    pub in_channels: usize,
    pub out_channels: usize,
    pub conv1: Conv2d,
    pub mixin: Option<Conv2d>,
    pub downsample: bool,
    pub use_preactivation: bool,
}

impl DResidualBlock {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        downsample: bool,
        use_preactivation: bool,
        config: &BigGanConfig,
    ) -> Self {
        let conv_config =
            Conv2dConfig::new(in_channels, out_channels, (3, 3)).with_padding((1, 1)).with_spectral_norm(config.sn_eps);
        let mixin = (in_channels != out_channels || downsample).then(|| {
            Conv2d::pointwise(context, &format!("{}.mixin", name), in_channels, out_channels, true, config.sn_eps)
        });

        Self {
            in_channels,
            out_channels,
            conv1: Conv2d::from_config(context, &format!("{}.conv1", name), conv_config),
            mixin,
            downsample,
            use_preactivation,
        }
    }

    fn pool(&self, x: Tensor) -> Tensor {
        if self.downsample {
            x.avg_pool2d((2, 2), (2, 2))
        } else {
            x
        }
    }

    fn mix(&self, x: Tensor, mode: Mode) -> Tensor {
        match &self.mixin {
            Some(mixin) => mixin.forward(&x, mode),
            None => x,
        }
    }
}

impl Module for DResidualBlock {
    fn forward(&self, x: &Tensor, mode: Mode) -> Tensor {
        let h = if self.use_preactivation { x.relu() } else { x.clone() };
        let h = self.pool(self.conv1.forward(&h, mode).relu());

        let skip = if self.use_preactivation {
            self.pool(self.mix(x.clone(), mode))
        } else {
            self.mix(self.pool(x.clone()), mode)
        };

        h.residual(&skip)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.conv1.parameters();
        if let Some(mixin) = &self.mixin {
            params.extend(mixin.parameters());
        }
        params
    }
}
