//! Network configuration.
//!
//! The channel schedule is given once, generator-side, as multipliers of
//! `base_channels` ordered from the bottom (lowest resolution) upwards. The
//! generator walks it forwards; the discriminator walks it backwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),

    #[error("channel_multipliers needs at least two entries, got {0}")]
    TooFewStages(usize),

    #[error("z_dim {z_dim} cannot be split into {chunks} equal chunks")]
    IndivisibleNoise { z_dim: usize, chunks: usize },

    #[error("attention needs channels divisible by 8, got {0}")]
    AttentionChannels(usize),

    #[error("bottom_width must be at least 2 so attention can pool the last discriminator stage, got {0}")]
    BottomWidth(usize),

    #[error("{stages} upsampling stages overflow the image side for bottom_width {bottom_width}")]
    ResolutionOverflow { bottom_width: usize, stages: usize },

    #[error("'{name}' must lie in {range}, got {value}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f32,
    },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Hyperparameters of both networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BigGanConfig {
    pub base_channels: usize,
    /// Spatial size of the projected noise map.
    pub bottom_width: usize,
    pub z_dim: usize,
    /// Width of the generator's class embedding.
    pub shared_dim: usize,
    pub n_classes: usize,
    /// Multipliers of `base_channels`, from the projected noise map to the
    /// last generator stage. One stage per consecutive pair.
    pub channel_multipliers: Vec<usize>,
    pub bn_momentum: f32,
    pub bn_eps: f32,
    pub sn_eps: f32,
    /// Weight of the orthogonal regularization penalty.
    pub ortho_beta: f32,
}

impl Default for BigGanConfig {
    fn default() -> Self {
        Self {
            base_channels: 96,
            bottom_width: 4,
            z_dim: 120,
            shared_dim: 128,
            n_classes: 1000,
            channel_multipliers: vec![16, 16, 8, 4, 2, 1],
            bn_momentum: 0.1,
            bn_eps: 1e-5,
            sn_eps: 1e-12,
            ortho_beta: 1e-4,
        }
    }
}

/// One generator stage: residual block then attention at `out_channels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorStageSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub cond_dim: usize,
}

/// One discriminator stage: residual block then attention at `out_channels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscriminatorStageSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub downsample: bool,
    pub use_preactivation: bool,
}

impl BigGanConfig {
    /// Small network used by tests and the demo: 8x8 images, 3 classes.
    pub fn tiny() -> Self {
        Self {
            base_channels: 8,
            bottom_width: 2,
            z_dim: 12,
            shared_dim: 8,
            n_classes: 3,
            channel_multipliers: vec![2, 2, 1],
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("base_channels", self.base_channels),
            ("bottom_width", self.bottom_width),
            ("z_dim", self.z_dim),
            ("shared_dim", self.shared_dim),
            ("n_classes", self.n_classes),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.bottom_width < 2 {
            return Err(ConfigError::BottomWidth(self.bottom_width));
        }
        if self.channel_multipliers.len() < 2 {
            return Err(ConfigError::TooFewStages(self.channel_multipliers.len()));
        }
        if self.checked_resolution().is_none() {
            return Err(ConfigError::ResolutionOverflow { bottom_width: self.bottom_width, stages: self.n_stages() });
        }
        if self.channel_multipliers.contains(&0) {
            return Err(ConfigError::Zero("channel_multipliers"));
        }
        if self.z_dim % self.num_chunks() != 0 {
            return Err(ConfigError::IndivisibleNoise { z_dim: self.z_dim, chunks: self.num_chunks() });
        }
        if let Some(c) = self.channel_multipliers.iter().map(|m| m * self.base_channels).find(|c| c % 8 != 0) {
            return Err(ConfigError::AttentionChannels(c));
        }
        if !(self.bn_momentum > 0.0 && self.bn_momentum <= 1.0) {
            return Err(ConfigError::OutOfRange { name: "bn_momentum", range: "(0, 1]", value: self.bn_momentum });
        }
        for (name, value) in [("bn_eps", self.bn_eps), ("sn_eps", self.sn_eps)] {
            if !(value > 0.0) {
                return Err(ConfigError::OutOfRange { name, range: "(0, inf)", value });
            }
        }
        if !(self.ortho_beta >= 0.0) {
            return Err(ConfigError::OutOfRange { name: "ortho_beta", range: "[0, inf)", value: self.ortho_beta });
        }
        Ok(())
    }

    /// Number of generator residual stages.
    pub fn n_stages(&self) -> usize {
        self.channel_multipliers.len().saturating_sub(1)
    }

    /// The noise vector is split into one chunk per stage plus one for the projection.
    pub fn num_chunks(&self) -> usize {
        self.n_stages() + 1
    }

    pub fn z_chunk_size(&self) -> usize {
        self.z_dim / self.num_chunks()
    }

    /// Width of every conditioning vector: class embedding then noise chunk.
    pub fn cond_dim(&self) -> usize {
        self.shared_dim + self.z_chunk_size()
    }

    /// Channels of the projected noise map.
    pub fn bottom_channels(&self) -> usize {
        self.channel_multipliers[0] * self.base_channels
    }

    /// Channels entering the generator output layer.
    pub fn top_channels(&self) -> usize {
        self.channel_multipliers[self.n_stages()] * self.base_channels
    }

    /// Side of the generated images.
    ///
    /// Saturates at `usize::MAX` for configurations that fail validation.
    pub fn resolution(&self) -> usize {
        self.checked_resolution().unwrap_or(usize::MAX)
    }

    fn checked_resolution(&self) -> Option<usize> {
        (0..self.n_stages()).try_fold(self.bottom_width, |side, _| side.checked_mul(2))
    }

    pub fn generator_stages(&self) -> Vec<GeneratorStageSpec> {
        self.channel_multipliers
            .windows(2)
            .map(|pair| GeneratorStageSpec {
                in_channels: pair[0] * self.base_channels,
                out_channels: pair[1] * self.base_channels,
                cond_dim: self.cond_dim(),
            })
            .collect()
    }

    /// Stages from the image inwards: `3 -> m_k -> ... -> m_0` times base.
    /// Stage 0 reads the raw image and skips preactivation; the last stage
    /// keeps its resolution.
    pub fn discriminator_stages(&self) -> Vec<DiscriminatorStageSpec> {
        let channels: Vec<usize> = std::iter::once(3)
            .chain(self.channel_multipliers.iter().rev().map(|m| m * self.base_channels))
            .collect();
        let last = channels.len() - 2;
        channels
            .windows(2)
            .enumerate()
            .map(|(i, pair)| DiscriminatorStageSpec {
                in_channels: pair[0],
                out_channels: pair[1],
                downsample: i != last,
                use_preactivation: i != 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let config = BigGanConfig::default();
        config.validate().unwrap();
        assert_eq!(config.n_stages(), 5);
        assert_eq!(config.z_chunk_size(), 20);
        assert_eq!(config.cond_dim(), 148);
        assert_eq!(config.resolution(), 128);

        let g: Vec<(usize, usize)> =
            config.generator_stages().iter().map(|s| (s.in_channels, s.out_channels)).collect();
        assert_eq!(g, vec![(1536, 1536), (1536, 768), (768, 384), (384, 192), (192, 96)]);

        let d = config.discriminator_stages();
        let channels: Vec<(usize, usize)> = d.iter().map(|s| (s.in_channels, s.out_channels)).collect();
        assert_eq!(channels, vec![(3, 96), (96, 192), (192, 384), (384, 768), (768, 1536), (1536, 1536)]);
        assert!(!d[0].use_preactivation);
        assert!(d[1..].iter().all(|s| s.use_preactivation));
        assert!(d[..5].iter().all(|s| s.downsample));
        assert!(!d[5].downsample);
    }

    #[test]
    fn test_tiny_preset() {
        let config = BigGanConfig::tiny();
        config.validate().unwrap();
        assert_eq!(config.resolution(), 8);
        assert_eq!(config.cond_dim(), 12);
        assert_eq!(config.discriminator_stages().len(), 3);
    }

    #[test]
    fn test_validation_errors() {
        let config = BigGanConfig { z_dim: 121, ..BigGanConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::IndivisibleNoise { z_dim: 121, chunks: 6 })));

        let config = BigGanConfig { channel_multipliers: vec![1], ..BigGanConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::TooFewStages(1))));

        let config = BigGanConfig { base_channels: 4, ..BigGanConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::AttentionChannels(4))));

        let config = BigGanConfig { bottom_width: 1, ..BigGanConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::BottomWidth(1))));

        let config = BigGanConfig { channel_multipliers: vec![1; 70], base_channels: 8, z_dim: 70, ..BigGanConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::ResolutionOverflow { bottom_width: 4, stages: 69 })));
        assert_eq!(config.resolution(), usize::MAX);

        let config = BigGanConfig { n_classes: 0, ..BigGanConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("n_classes"))));

        let config = BigGanConfig { bn_momentum: 1.5, ..BigGanConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { name: "bn_momentum", .. })));
    }

    #[test]
    fn test_json_defaults_fill_missing_fields() {
        let config = BigGanConfig::from_json_str(r#"{ "n_classes": 5 }"#).unwrap();
        assert_eq!(config.n_classes, 5);
        assert_eq!(config.base_channels, 96);

        let round_trip = serde_json::to_string(&BigGanConfig::tiny()).unwrap();
        assert_eq!(BigGanConfig::from_json_str(&round_trip).unwrap(), BigGanConfig::tiny());

        assert!(matches!(BigGanConfig::from_json_str("{ not json"), Err(ConfigError::Json(_))));
    }
}
