//! Configuration for a low-rank attention block.
//!
//! Parsed from JSON, using the field names of the checkpoints' training
//! configs (`att_heads`, `att_type`, `att_mid_dim`, ...).

use serde::{Deserialize, Serialize};

use crate::activation::{Activation, DEFAULT_ELU_ALPHA};
use crate::aggregator::AggregatorKind;
use crate::error::{LowRankError, Result};
use crate::group_norm::DEFAULT_GROUP_NORM_EPS;

fn default_act() -> String {
    "NONE".to_string()
}

fn default_elu_alpha() -> f32 {
    DEFAULT_ELU_ALPHA
}

fn default_group_norm_eps() -> f64 {
    DEFAULT_GROUP_NORM_EPS
}

/// Hyperparameters of one [`LowRankAttention`](crate::lowrank::LowRankAttention).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LowRankConfig {
    /// Embedding width consumed and produced by the block.
    /// For the X-LAN captioner: 1024
    pub embed_dim: usize,

    /// Number of attention heads. Must divide `embed_dim`.
    /// For the X-LAN captioner: 8
    pub att_heads: usize,

    /// Aggregator variant: `"BasicAtt"` or `"SCAtt"`.
    pub att_type: AggregatorKind,

    /// Mid-stack widths `[head_dim, ..., out]`, where `out` is 1 for
    /// `BasicAtt` and `head_dim` for `SCAtt`.
    /// For the X-LAN captioner: [128, 64, 128]
    pub att_mid_dim: Vec<usize>,

    /// Dropout inside the aggregator's mid stack.
    #[serde(default)]
    pub att_mid_drop: f32,

    /// Projection activation: NONE, RELU, TANH, GLU, ELU, CELU or GELU.
    #[serde(default = "default_act")]
    pub act: String,

    /// Alpha for ELU/CELU.
    #[serde(default = "default_elu_alpha")]
    pub elu_alpha: f32,

    /// Dropout on the score tensor. Defaults to `att_mid_drop`.
    #[serde(default)]
    pub dropout: Option<f32>,

    /// GroupNorm epsilon for the four projections.
    #[serde(default = "default_group_norm_eps")]
    pub group_norm_eps: f64,
}

impl LowRankConfig {
    /// Load configuration from a JSON file.
    ///
    /// The result is not validated; call [`validate`](Self::validate).
    ///
    /// # Example
    /// ```no_run
    /// use lowrank_attention::config::LowRankConfig;
    ///
    /// let config = LowRankConfig::from_file("checkpoints/attention.json")?;
    /// config.validate()?;
    /// # Ok::<(), lowrank_attention::error::LowRankError>(())
    /// ```
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: LowRankConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Per-head width (`embed_dim / att_heads`).
    pub fn head_dim(&self) -> usize {
        if self.att_heads == 0 {
            0
        } else {
            self.embed_dim / self.att_heads
        }
    }

    /// Effective score dropout.
    pub fn score_dropout(&self) -> f32 {
        self.dropout.unwrap_or(self.att_mid_drop)
    }

    /// Resolve the projection activation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an unknown activation name.
    pub fn activation(&self) -> Result<Option<Activation>> {
        Activation::from_name(&self.act, self.elu_alpha)
    }

    /// Check that the hyperparameters describe a buildable block.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if:
    /// - `att_heads` is zero or doesn't divide `embed_dim`
    /// - the activation name is unknown
    /// - `att_mid_dim` doesn't start at `head_dim` or end at the width the
    ///   aggregator needs
    /// - a dropout probability is outside `[0, 1]`
    pub fn validate(&self) -> Result<()> {
        if self.att_heads == 0 || self.embed_dim % self.att_heads != 0 {
            return Err(LowRankError::InvalidConfig(format!(
                "embed_dim ({}) must be divisible by att_heads ({})",
                self.embed_dim, self.att_heads
            )));
        }

        self.activation()?;

        let head_dim = self.head_dim();
        let expected_out = self.att_type.output_dim(head_dim);
        match (self.att_mid_dim.first(), self.att_mid_dim.last()) {
            (Some(&first), Some(&last))
                if self.att_mid_dim.len() >= 2 && first == head_dim && last == expected_out => {}
            _ => {
                return Err(LowRankError::InvalidConfig(format!(
                    "att_mid_dim {:?} must start at head_dim ({}) and end at {} for {}",
                    self.att_mid_dim, head_dim, expected_out, self.att_type
                )))
            }
        }

        for (name, p) in [("att_mid_drop", self.att_mid_drop), ("dropout", self.score_dropout())] {
            if !(0.0..=1.0).contains(&p) {
                return Err(LowRankError::InvalidConfig(format!(
                    "{} must be in [0, 1], got {}",
                    name, p
                )));
            }
        }

        Ok(())
    }
}
