//! Projection unit: Linear -> optional activation -> per-head GroupNorm.
//!
//! The attention block owns four of these (query, key, value-A, value-B).
//! They share the same architecture but never share parameters.
//!
//! ```text
//! [..., E] --linear--> [..., E or 2E] --act--> [..., E] --group_norm(H groups)--> [..., E]
//! ```
//!
//! The linear output is `2E` only when the activation is gated (GLU), which
//! halves it back to `E` before normalization.

use crate::activation::Activation;
use crate::error::{LowRankError, Result};
use crate::group_norm::GroupNorm;
use crate::linear::Linear;
use crate::tensor::Tensor;

/// One of the four input projections of the low-rank attention block.
#[derive(Debug, Clone)]
pub struct ProjectionUnit {
    linear: Linear,
    activation: Option<Activation>,
    norm: GroupNorm,
}

impl ProjectionUnit {
    /// Assemble a projection unit, checking that the three stages chain.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the linear output width isn't
    /// `embed_dim` (or `2 * embed_dim` for a gated activation), where
    /// `embed_dim` is the norm's channel count, or if the linear input
    /// width isn't `embed_dim`.
    pub fn new(linear: Linear, activation: Option<Activation>, norm: GroupNorm) -> Result<Self> {
        let embed_dim = norm.channels();
        let gated = activation.map_or(false, |a| a.is_gated());
        let expected_out = if gated { 2 * embed_dim } else { embed_dim };

        if linear.out_features() != expected_out || linear.in_features() != embed_dim {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![expected_out, embed_dim],
                got: vec![linear.out_features(), linear.in_features()],
            });
        }

        Ok(ProjectionUnit {
            linear,
            activation,
            norm,
        })
    }

    /// Embedding width consumed and produced by this unit.
    pub fn embed_dim(&self) -> usize {
        self.norm.channels()
    }

    /// Number of normalization groups (one per attention head).
    pub fn num_groups(&self) -> usize {
        self.norm.num_groups()
    }

    /// Configured activation, if any.
    pub fn activation(&self) -> Option<Activation> {
        self.activation
    }

    /// Project `[..., embed_dim]` to `[..., embed_dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.linear.forward(x)?;
        if let Some(act) = &self.activation {
            h = act.apply(&h)?;
        }
        self.norm.forward(&h)
    }
}
