//! Upsampling residual block of the generator.

use crate::config::BigGanConfig;
use crate::nn::{ClassConditionalBatchNorm2d, ConditionalModule, Conv2d, Conv2dConfig, Mode, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Residual block that doubles the spatial size.
///
/// ```text
/// main: ccbn1(x, y) -> relu -> upsample x2 -> conv3x3 -> ccbn2(., y) -> relu -> conv3x3
/// skip: upsample x2 -> mixin 1x1 (only when channels change)
/// ```
///
/// Both paths meet in a strict same-shape sum.
pub struct GResidualBlock {
    pub in_channels: usize,
    pub out_channels: usize,
    pub bn1: ClassConditionalBatchNorm2d,
    pub conv1: Conv2d,
    pub bn2: ClassConditionalBatchNorm2d,
    pub conv2: Conv2d,
    pub mixin: Option<Conv2d>,
}

impl GResidualBlock {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        cond_dim: usize,
        config: &BigGanConfig,
    ) -> Self {
        let ccbn = |suffix: &str, channels: usize| {
            ClassConditionalBatchNorm2d::new(
                context,
                &format!("{}.{}", name, suffix),
                cond_dim,
                channels,
                config.bn_momentum,
                config.bn_eps,
                config.sn_eps,
            )
        };
        let conv3x3 = |suffix: &str, c_in: usize| {
            let conv_config =
                Conv2dConfig::new(c_in, out_channels, (3, 3)).with_padding((1, 1)).with_spectral_norm(config.sn_eps);
            Conv2d::from_config(context, &format!("{}.{}", name, suffix), conv_config)
        };

        Self {
            in_channels,
            out_channels,
            bn1: ccbn("bn1", in_channels),
            conv1: conv3x3("conv1", in_channels),
            bn2: ccbn("bn2", out_channels),
            conv2: conv3x3("conv2", out_channels),
            mixin: (in_channels != out_channels).then(|| {
                Conv2d::pointwise(context, &format!("{}.mixin", name), in_channels, out_channels, true, config.sn_eps)
            }),
        }
    }
}

impl ConditionalModule for GResidualBlock {
    fn forward_conditioned(&self, x: &Tensor, y: &Tensor, mode: Mode) -> Tensor {
        let h = self.bn1.forward_conditioned(x, y, mode).relu().upsample2d(2);
        let h = self.conv1.forward(&h, mode);
        let h = self.bn2.forward_conditioned(&h, y, mode).relu();
        let h = self.conv2.forward(&h, mode);

        let skip = x.upsample2d(2);
        let skip = match &self.mixin {
            Some(mixin) => mixin.forward(&skip, mode),
            None => skip,
        };

        h.residual(&skip)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        params.extend(self.bn1.parameters());
        params.extend(self.conv1.parameters());
        params.extend(self.bn2.parameters());
        params.extend(self.conv2.parameters());
        if let Some(mixin) = &self.mixin {
            params.extend(mixin.parameters());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::shape_inference::ShapeInferenceError;
    use crate::asg::DType;
    use crate::error::GanError;
    use crate::runtime::compiled::CompiledGraph;
    use std::collections::HashMap;

    fn compile_block(
        in_channels: usize,
        out_channels: usize,
        cond_width: usize,
    ) -> (GResidualBlock, crate::error::Result<CompiledGraph>) {
        let ctx = GraphContext::shared();
        let block = GResidualBlock::new(&ctx, "g.block", in_channels, out_channels, 12, &BigGanConfig::tiny());
        let x = Tensor::new_input(&ctx, "x");
        let y = Tensor::new_input(&ctx, "y");
        let out = block.forward_conditioned(&x, &y, Mode::Train);
        let updates = ctx.borrow_mut().drain_state_updates();

        let shapes = HashMap::from([
            ("x".to_string(), (vec![2, in_channels, 4, 4], DType::F32)),
            ("y".to_string(), (vec![2, cond_width], DType::F32)),
        ]);
        let compiled = CompiledGraph::compile(&ctx, &[&out], updates, &shapes);
        (block, compiled)
    }

    #[test]
    fn test_block_doubles_resolution_and_maps_channels() {
        let (block, compiled) = compile_block(16, 8, 12);
        assert_eq!(compiled.unwrap().output_shapes(), vec![vec![2, 8, 8, 8]]);
        assert!(block.mixin.is_some());
        // bn1, bn2 have two bias-free projections each; conv1, conv2, mixin have weight and bias.
        assert_eq!(ConditionalModule::parameters(&block).len(), 10);
    }

    #[test]
    fn test_block_without_channel_change_has_no_mixin() {
        let (block, compiled) = compile_block(16, 16, 12);
        assert_eq!(compiled.unwrap().output_shapes(), vec![vec![2, 16, 8, 8]]);
        assert!(block.mixin.is_none());
    }

    #[test]
    fn test_wrong_conditioning_width_fails_before_execution() {
        let (_, compiled) = compile_block(16, 8, 11);
        assert!(matches!(compiled, Err(GanError::Shape(ShapeInferenceError::MatmulDimensionError(11, 12)))));
    }
}
