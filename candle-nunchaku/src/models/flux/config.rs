//! Configuration for the quantized Flux transformer.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::quantized::Precision;

use super::attention::AttentionImpl;

/// Architecture of the Flux transformer core.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Number of dual-stream (joint) blocks (default: 19).
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Number of single-stream blocks (default: 38).
    #[serde(default = "default_num_single_layers")]
    pub num_single_layers: usize,

    /// Number of attention heads (default: 24).
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Dimension per attention head (default: 128).
    #[serde(default = "default_attention_head_dim")]
    pub attention_head_dim: usize,

    /// MLP expansion factor (default: 4).
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: usize,

    /// RoPE dimensions per position axis (default: [16, 56, 56]).
    #[serde(default = "default_axes_dims_rope")]
    pub axes_dims_rope: Vec<usize>,

    #[serde(default = "default_theta")]
    pub theta: f32,

    #[serde(default)]
    pub precision: Precision,

    /// Build the last joint block without a text-stream tail. Released Flux
    /// checkpoints carry a full last block, so this stays off for them.
    #[serde(default)]
    pub context_pre_only_last: bool,
}

fn default_num_layers() -> usize {
    19
}
fn default_num_single_layers() -> usize {
    38
}
fn default_num_attention_heads() -> usize {
    24
}
fn default_attention_head_dim() -> usize {
    128
}
fn default_mlp_ratio() -> usize {
    4
}
fn default_axes_dims_rope() -> Vec<usize> {
    vec![16, 56, 56]
}
fn default_theta() -> f32 {
    10_000.
}

impl Default for Config {
    fn default() -> Self {
        Self::flux_1_dev()
    }
}

impl Config {
    /// FLUX.1-dev, 12B parameters.
    pub fn flux_1_dev() -> Self {
        Self {
            num_layers: 19,
            num_single_layers: 38,
            num_attention_heads: 24,
            attention_head_dim: 128,
            mlp_ratio: 4,
            axes_dims_rope: vec![16, 56, 56],
            theta: 10_000.,
            precision: Precision::Int4,
            context_pre_only_last: false,
        }
    }

    /// FLUX.1-schnell shares the dev architecture.
    pub fn flux_1_schnell() -> Self {
        Self::flux_1_dev()
    }

    /// A small model for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            num_layers: 2,
            num_single_layers: 2,
            num_attention_heads: 2,
            attention_head_dim: 32,
            mlp_ratio: 4,
            axes_dims_rope: vec![8, 12, 12],
            theta: 10_000.,
            precision: Precision::Int4,
            context_pre_only_last: false,
        }
    }

    pub fn inner_dim(&self) -> usize {
        self.num_attention_heads * self.attention_head_dim
    }

    pub fn mlp_hidden_dim(&self) -> usize {
        self.inner_dim() * self.mlp_ratio
    }

    /// Joint plus single blocks.
    pub fn total_layers(&self) -> usize {
        self.num_layers + self.num_single_layers
    }

    pub fn validate(&self) -> Result<()> {
        let block = self.precision.ggml_dtype().block_size();
        let rope_dim: usize = self.axes_dims_rope.iter().sum();
        let problem = if self.total_layers() == 0 {
            Some("the model has no blocks".to_string())
        } else if self.num_attention_heads == 0 || self.attention_head_dim % 2 == 1 {
            Some(format!(
                "{} heads of {} channels",
                self.num_attention_heads, self.attention_head_dim
            ))
        } else if rope_dim != self.attention_head_dim {
            Some(format!(
                "rope axes {:?} sum to {rope_dim}, head dim is {}",
                self.axes_dims_rope, self.attention_head_dim
            ))
        } else if self.inner_dim() % block != 0 || self.mlp_hidden_dim() % block != 0 {
            Some(format!(
                "hidden size {} is not a multiple of the quantization block {block}",
                self.inner_dim()
            ))
        } else {
            None
        };
        match problem {
            Some(problem) => Err(Error::unsupported(format!("flux config: {problem}"))),
            None => Ok(()),
        }
    }
}

/// Runtime options that do not change the weights.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct InferenceConfig {
    /// Stream blocks in and out around compute instead of keeping all resident.
    #[serde(default)]
    pub offload: bool,

    #[serde(default)]
    pub attention_impl: AttentionImpl,

    /// Cast block-sparse attention inputs to f16.
    #[serde(default)]
    pub force_fp16: bool,
}
