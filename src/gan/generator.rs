//! Class-conditional generator.
//!
//! The noise vector is cut into one chunk per residual stage plus one for
//! the input projection. Chunk 0 becomes the bottom feature map; chunk `i`
//! is appended to the shared class embedding to condition stage `i - 1`.

use crate::config::BigGanConfig;
use crate::gan::gblock::GResidualBlock;
use crate::nn::{BatchNorm2d, ConditionalModule, Conv2d, Embedding, Linear, Mode, Module, SelfAttention};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// One generator stage: upsampling residual block followed by self-attention.
pub struct GeneratorStage {
    pub block: GResidualBlock,
    pub attention: SelfAttention,
}

pub struct Generator {
    pub config: BigGanConfig,
    /// Class embedding table `[n_classes, shared_dim]`, not spectral-normalized.
    pub shared_emb: Embedding,
    /// Projects noise chunk 0 to the bottom feature map.
    pub proj_z: Linear,
    pub stages: Vec<GeneratorStage>,
    pub output_bn: BatchNorm2d,
    /// 1x1 convolution to RGB.
    pub output_conv: Conv2d,
}

impl Generator {
    /// Builds the generator under the `g.` namespace.
    /// `config` is expected to be validated.
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: &BigGanConfig) -> Self {
        let bottom = config.bottom_channels() * config.bottom_width * config.bottom_width;
        let stages = config
            .generator_stages()
            .iter()
            .enumerate()
            .map(|(i, spec)| GeneratorStage {
                block: GResidualBlock::new(
                    context,
                    &format!("g.stages.{}.block", i),
                    spec.in_channels,
                    spec.out_channels,
                    spec.cond_dim,
                    config,
                ),
                attention: SelfAttention::new(
                    context,
                    &format!("g.stages.{}.attention", i),
                    spec.out_channels,
                    config.sn_eps,
                ),
            })
            .collect();

        Self {
            config: config.clone(),
            shared_emb: Embedding::new(context, "g.shared_emb", config.n_classes, config.shared_dim),
            proj_z: Linear::new(context, "g.proj_z", config.z_chunk_size(), bottom),
            stages,
            output_bn: BatchNorm2d::new(
                context,
                "g.proj_o.bn",
                config.top_channels(),
                config.bn_momentum,
                config.bn_eps,
            ),
            output_conv: Conv2d::pointwise(context, "g.proj_o.conv", config.top_channels(), 3, true, config.sn_eps),
        }
    }

    /// Looks up class embeddings: `[B]` labels to `[B, shared_dim]`.
    pub fn embed(&self, labels: &Tensor, mode: Mode) -> Tensor {
        self.shared_emb.forward(labels, mode)
    }

    /// Splits `[B, z_dim]` noise into `n_stages + 1` chunks of `[B, z_chunk_size]`.
    pub fn split_noise(&self, noise: &Tensor) -> Vec<Tensor> {
        let chunk = self.config.z_chunk_size();
        (0..self.config.num_chunks()).map(|i| noise.slice(1, i * chunk, chunk)).collect()
    }

    /// Maps noise `[B, z_dim]` and class embeddings `[B, shared_dim]` to
    /// images `[B, 3, R, R]` in `[-1, 1]`.
    pub fn generate(&self, noise: &Tensor, class_embedding: &Tensor, mode: Mode) -> Tensor {
        let chunks = self.split_noise(noise);
        let width = self.config.bottom_width as isize;

        let mut h = self.proj_z.forward(&chunks[0], mode).reshape(vec![
            -1,
            self.config.bottom_channels() as isize,
            width,
            width,
        ]);

        for (stage, chunk) in self.stages.iter().zip(&chunks[1..]) {
            let condition = Tensor::concat(&[class_embedding, chunk], 1);
            h = stage.block.forward_conditioned(&h, &condition, mode);
            h = stage.attention.forward(&h, mode);
        }

        let h = self.output_bn.forward(&h, mode).relu();
        self.output_conv.forward(&h, mode).tanh()
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.shared_emb.parameters();
        params.extend(self.proj_z.parameters());
        for stage in &self.stages {
            params.extend(ConditionalModule::parameters(&stage.block));
            params.extend(stage.attention.parameters());
        }
        params.extend(self.output_bn.parameters());
        params.extend(self.output_conv.parameters());
        params
    }
}
