//! Projection discriminator.

use crate::config::BigGanConfig;
use crate::gan::dblock::DResidualBlock;
use crate::nn::{Embedding, Linear, LinearConfig, Mode, Module, SelfAttention};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// One discriminator stage: residual block followed by self-attention.
pub struct DiscriminatorStage {
    pub block: DResidualBlock,
    pub attention: SelfAttention,
}

/// Scores images, optionally against class labels.
///
/// Features are summed over space after a final ReLU. The unconditional
/// score is a linear read-out; with labels the inner product between the
/// class embedding and the pooled features is added to it.
pub struct Discriminator {
    pub config: BigGanConfig,
    pub stages: Vec<DiscriminatorStage>,
    pub proj_o: Linear,
    /// Spectral-normalized class embedding `[n_classes, C]`.
    pub shared_emb: Embedding,
}

impl Discriminator {
    /// Builds the discriminator under the `d.` namespace.
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: &BigGanConfig) -> Self {
        let stages: Vec<DiscriminatorStage> = config
            .discriminator_stages()
            .iter()
            .enumerate()
            .map(|(i, spec)| DiscriminatorStage {
                block: DResidualBlock::new(
                    context,
                    &format!("d.stages.{}.block", i),
                    spec.in_channels,
                    spec.out_channels,
                    spec.downsample,
                    spec.use_preactivation,
                    config,
                ),
                attention: SelfAttention::new(
                    context,
                    &format!("d.stages.{}.attention", i),
                    spec.out_channels,
                    config.sn_eps,
                ),
            })
            .collect();

        let channels = config.bottom_channels();
        Self {
            config: config.clone(),
            stages,
            proj_o: Linear::from_config(
                context,
                "d.proj_o",
                LinearConfig::new(channels, 1).with_spectral_norm(config.sn_eps),
            ),
            shared_emb: Embedding::spectral(context, "d.shared_emb", config.n_classes, channels, config.sn_eps),
        }
    }

    /// Pooled features `[B, C]` of images `[B, 3, R, R]`.
    pub fn features(&self, image: &Tensor, mode: Mode) -> Tensor {
        let mut h = image.clone();
        for stage in &self.stages {
            h = stage.block.forward(&h, mode);
            h = stage.attention.forward(&h, mode);
        }
        h.relu().sum_axes(&[2, 3], false)
    }

    /// Realness score `[B, 1]`. `labels` is `[B]`.
    pub fn score(&self, image: &Tensor, labels: Option<&Tensor>, mode: Mode) -> Tensor {
        let h = self.features(image, mode);
        let unconditional = self.proj_o.forward(&h, mode);
        match labels {
            Some(labels) => {
                let class_embedding = self.shared_emb.forward(labels, mode);
                &unconditional + &(&class_embedding * &h).sum_axes(&[1], true)
            }
            None => unconditional,
        }
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        for stage in &self.stages {
            params.extend(stage.block.parameters());
            params.extend(stage.attention.parameters());
        }
        params.extend(self.proj_o.parameters());
        params.extend(self.shared_emb.parameters());
        params
    }
}
