//! Attention aggregators: turn a cosine-direction score into a per-head context.
//!
//! The low-rank attention block doesn't decide how its score tensor becomes
//! attention weights. That is the job of an [`AttentionAggregator`], injected
//! at construction. Two variants are provided, both built on the same
//! "mid" MLP over the score's head_dim axis:
//!
//! ```text
//! mid_dims = [d0 = head_dim, d1, ..., dn]
//! stack    = (Linear(d[i-1] -> d[i]), ReLU, Dropout) for i in 1..n
//! ```
//!
//! * [`BasicAttention`] (`"BasicAtt"`): spatial softmax over keys, then
//!   `alpha @ value_b`. Requires `dn == 1`.
//! * [`SpatialChannelAttention`] (`"SCAtt"`): spatial softmax plus a sigmoid
//!   channel gate from the key-pooled score, then
//!   `value_a * (alpha @ value_b) * gate`. Requires `dn == head_dim`.
//!
//! # Shapes
//!
//! | mode        | score             | mask        | value_a        | value_b        | output         |
//! |-------------|-------------------|-------------|----------------|----------------|----------------|
//! | single-step | `[B, H, K, D]`    | `[B, K]`    | `[B, H, D]`    | `[B, H, K, D]` | `[B, H, D]`    |
//! | sequence    | `[B, H, Q, K, D]` | `[B, Q, K]` | `[B, H, Q, D]` | `[B, H, K, D]` | `[B, H, Q, D]` |
//!
//! Mask entries equal to 0 are excluded from the softmax and from pooling.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::activation::{sigmoid, Activation};
use crate::dropout::Dropout;
use crate::error::{LowRankError, Result};
use crate::linear::Linear;
use crate::loader::ModelWeights;
use crate::tensor::Tensor;

/// Logit assigned to masked key positions before the softmax.
pub const MASK_FILL: f32 = -1e9;

/// Turns `(score, mask, value_a, value_b)` into a per-head context.
pub trait AttentionAggregator: fmt::Debug + Send + Sync {
    /// Aggregate one scoring call. See the module docs for shapes.
    fn aggregate(
        &self,
        score: &Tensor,
        mask: Option<&Tensor>,
        value_a: &Tensor,
        value_b: &Tensor,
    ) -> Result<Tensor>;

    /// Switch internal dropout between training and inference.
    fn set_training(&mut self, _training: bool) {}
}

/// Which aggregator to build from a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregatorKind {
    /// Spatial softmax only.
    #[serde(rename = "BasicAtt")]
    Basic,
    /// Spatial softmax with a channel gate.
    #[serde(rename = "SCAtt")]
    SpatialChannel,
}

impl AggregatorKind {
    /// Width the last mid dimension must have, given the head dimension.
    pub fn output_dim(&self, head_dim: usize) -> usize {
        match self {
            AggregatorKind::Basic => 1,
            AggregatorKind::SpatialChannel => head_dim,
        }
    }

    /// Build the aggregator from checkpoint weights under `{prefix}attn_net.`.
    ///
    /// Mid-stack parameters are numbered by module position:
    /// `attention_basic.{i}` where `i` advances by 3 per layer when mid
    /// dropout is enabled (Linear, ReLU, Dropout) and by 2 otherwise.
    pub fn load(
        &self,
        weights: &ModelWeights,
        prefix: &str,
        mid_dims: &[usize],
        mid_dropout: f32,
    ) -> Result<Box<dyn AttentionAggregator>> {
        if mid_dims.len() < 2 {
            return Err(LowRankError::InvalidConfig(format!(
                "att_mid_dim needs at least 2 entries, got {:?}",
                mid_dims
            )));
        }

        let base = format!("{}attn_net", prefix);
        let step = if mid_dropout > 0.0 { 3 } else { 2 };
        let layers = (0..mid_dims.len() - 2)
            .map(|i| weights.linear(&format!("{}.attention_basic.{}", base, i * step)))
            .collect::<Result<Vec<_>>>()?;
        let mid = MidStack::new(layers, mid_dropout)?;
        let last = weights.linear(&format!("{}.attention_last", base))?;

        match self {
            AggregatorKind::Basic => Ok(Box::new(BasicAttention::new(mid, last)?)),
            AggregatorKind::SpatialChannel => {
                let last2 = weights.linear(&format!("{}.attention_last2", base))?;
                Ok(Box::new(SpatialChannelAttention::new(mid, last, last2)?))
            }
        }
    }
}

impl fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatorKind::Basic => write!(f, "BasicAtt"),
            AggregatorKind::SpatialChannel => write!(f, "SCAtt"),
        }
    }
}

/// `(Linear, ReLU, Dropout)*` applied over the last axis of the score.
#[derive(Debug, Clone)]
pub struct MidStack {
    layers: Vec<Linear>,
    dropout: Dropout,
}

impl MidStack {
    /// Chain `layers`, checking that each output width feeds the next input.
    ///
    /// An empty stack is the identity.
    pub fn new(layers: Vec<Linear>, dropout_p: f32) -> Result<Self> {
        for pair in layers.windows(2) {
            if pair[0].out_features() != pair[1].in_features() {
                return Err(LowRankError::ShapeMismatch {
                    expected: vec![pair[0].out_features()],
                    got: vec![pair[1].in_features()],
                });
            }
        }
        Ok(MidStack {
            layers,
            dropout: Dropout::new(dropout_p)?,
        })
    }

    /// Identity stack.
    pub fn empty() -> Self {
        MidStack {
            layers: Vec::new(),
            dropout: Dropout::default(),
        }
    }

    /// Output width, or `None` for the identity stack.
    pub fn out_features(&self) -> Option<usize> {
        self.layers.last().map(Linear::out_features)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = Activation::Relu.apply(&layer.forward(&h)?)?;
            h = self.dropout.forward(&h);
        }
        Ok(h)
    }

    fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Check that `head` consumes this stack's output.
    fn check_feeds(&self, head: &Linear) -> Result<()> {
        match self.out_features() {
            Some(width) if width != head.in_features() => Err(LowRankError::ShapeMismatch {
                expected: vec![width],
                got: vec![head.in_features()],
            }),
            _ => Ok(()),
        }
    }
}

/// Spatial logits `[.., K]` from the mid-stack output `[.., K, d]`, masked.
fn spatial_logits(last: &Linear, att_map: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let logits = last.forward(att_map)?;
    let logits = logits.squeeze(Some(logits.ndim() - 1))?;
    match mask {
        // [B, K] -> [B, 1, K]; [B, Q, K] -> [B, 1, Q, K]
        Some(mask) => logits.masked_fill(&mask.unsqueeze(1)?, MASK_FILL),
        None => Ok(logits),
    }
}

/// `alpha @ value_b` for `alpha` of `[B, H, K]` or `[B, H, Q, K]`.
fn weighted_values(alpha: &Tensor, value_b: &Tensor) -> Result<Tensor> {
    match alpha.ndim() {
        3 => alpha.unsqueeze(2)?.matmul(value_b)?.squeeze(Some(2)),
        _ => alpha.matmul(value_b),
    }
}

/// Spatial-only aggregator.
#[derive(Debug, Clone)]
pub struct BasicAttention {
    mid: MidStack,
    last: Linear,
}

impl BasicAttention {
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `last` doesn't consume the stack output or
    /// doesn't produce a single logit.
    pub fn new(mid: MidStack, last: Linear) -> Result<Self> {
        mid.check_feeds(&last)?;
        if last.out_features() != 1 {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![1],
                got: vec![last.out_features()],
            });
        }
        Ok(BasicAttention { mid, last })
    }
}

impl AttentionAggregator for BasicAttention {
    fn aggregate(
        &self,
        score: &Tensor,
        mask: Option<&Tensor>,
        _value_a: &Tensor,
        value_b: &Tensor,
    ) -> Result<Tensor> {
        let att_map = self.mid.forward(score)?;
        let logits = spatial_logits(&self.last, &att_map, mask)?;
        let alpha = logits.softmax(logits.ndim() - 1)?;
        weighted_values(&alpha, value_b)
    }

    fn set_training(&mut self, training: bool) {
        self.mid.set_training(training);
    }
}

/// Spatial softmax combined with a sigmoid channel gate.
#[derive(Debug, Clone)]
pub struct SpatialChannelAttention {
    mid: MidStack,
    /// Spatial head, `d[n-1] -> 1`.
    last: Linear,
    /// Channel head, `d[n-1] -> head_dim`.
    last2: Linear,
}

impl SpatialChannelAttention {
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if either head doesn't consume the stack
    /// output, or the spatial head doesn't produce a single logit.
    pub fn new(mid: MidStack, last: Linear, last2: Linear) -> Result<Self> {
        mid.check_feeds(&last)?;
        mid.check_feeds(&last2)?;
        if last.out_features() != 1 || last.in_features() != last2.in_features() {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![1, last2.in_features()],
                got: vec![last.out_features(), last.in_features()],
            });
        }
        Ok(SpatialChannelAttention { mid, last, last2 })
    }

    /// Mean of the mid-stack output over key positions, counting only unmasked keys.
    ///
    /// A mask row with every key masked has a zero count, so its pooled
    /// value (and the gate built from it) is NaN.
    fn pool(att_map: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let key_dim = att_map.ndim() - 2;
        match mask {
            Some(mask) => {
                // [B, K] -> [B, 1, K, 1]; [B, Q, K] -> [B, 1, Q, K, 1]
                let mask = mask.unsqueeze(1)?;
                let mask = mask.unsqueeze(mask.ndim())?;
                let total = att_map.mul(&mask)?.sum(key_dim)?;
                let count = mask.sum(key_dim)?;
                total.div(&count)
            }
            None => att_map.mean(key_dim),
        }
    }
}

impl AttentionAggregator for SpatialChannelAttention {
    fn aggregate(
        &self,
        score: &Tensor,
        mask: Option<&Tensor>,
        value_a: &Tensor,
        value_b: &Tensor,
    ) -> Result<Tensor> {
        let att_map = self.mid.forward(score)?;

        let pooled = Self::pool(&att_map, mask)?;
        let gate = self.last2.forward(&pooled)?.map(sigmoid);

        let logits = spatial_logits(&self.last, &att_map, mask)?;
        let alpha = logits.softmax(logits.ndim() - 1)?;
        let attended = weighted_values(&alpha, value_b)?;

        value_a.mul(&attended)?.mul(&gate)
    }

    fn set_training(&mut self, training: bool) {
        self.mid.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn zero_last(in_features: usize, out_features: usize) -> Linear {
        Linear::new(Tensor::zeros(&[out_features, in_features]), None).unwrap()
    }

    /// Spatial head that reads the first channel of the score as its logit.
    fn first_channel_last(in_features: usize) -> Linear {
        let mut w = vec![0.0; in_features];
        w[0] = 1.0;
        Linear::new(Tensor::new(w, vec![1, in_features]).unwrap(), None).unwrap()
    }

    #[test]
    fn test_kind_names() {
        let kind: AggregatorKind = serde_json::from_str("\"SCAtt\"").unwrap();
        assert_eq!(kind, AggregatorKind::SpatialChannel);
        assert_eq!(AggregatorKind::Basic.to_string(), "BasicAtt");
        assert_eq!(AggregatorKind::Basic.output_dim(8), 1);
        assert_eq!(AggregatorKind::SpatialChannel.output_dim(8), 8);
    }

    #[test]
    fn test_basic_uniform_logits_average_values() {
        let agg = BasicAttention::new(MidStack::empty(), zero_last(2, 1)).unwrap();
        let score = Tensor::zeros(&[1, 1, 2, 2]);
        let value_a = Tensor::zeros(&[1, 1, 2]);
        let value_b = Tensor::new(vec![1.0, 2.0, 3.0, 6.0], vec![1, 1, 2, 2]).unwrap();

        let out = agg.aggregate(&score, None, &value_a, &value_b).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2]);
        assert_eq!(out.to_vec_f32(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_basic_mask_excludes_keys() {
        let agg = BasicAttention::new(MidStack::empty(), first_channel_last(2)).unwrap();
        // Key 0 has the larger logit but is masked out
        let score = Tensor::new(vec![5.0, 0.0, 0.0, 0.0], vec![1, 1, 2, 2]).unwrap();
        let value_a = Tensor::zeros(&[1, 1, 2]);
        let value_b = Tensor::new(vec![1.0, 1.0, 7.0, 9.0], vec![1, 1, 2, 2]).unwrap();
        let mask = Tensor::new(vec![0.0, 1.0], vec![1, 2]).unwrap();

        let out = agg
            .aggregate(&score, Some(&mask), &value_a, &value_b)
            .unwrap()
            .to_vec_f32();
        assert_relative_eq!(out[0], 7.0, epsilon = 1e-5);
        assert_relative_eq!(out[1], 9.0, epsilon = 1e-5);
    }

    #[test]
    fn test_basic_sequence_mode() {
        let agg = BasicAttention::new(MidStack::empty(), zero_last(2, 1)).unwrap();
        let score = Tensor::zeros(&[2, 3, 4, 5, 2]);
        let value_a = Tensor::zeros(&[2, 3, 4, 2]);
        let value_b = Tensor::full(&[2, 3, 5, 2], 1.5);
        let mask = Tensor::full(&[2, 4, 5], 1.0);

        let out = agg
            .aggregate(&score, Some(&mask), &value_a, &value_b)
            .unwrap();
        assert_eq!(out.shape(), &[2, 3, 4, 2]);
        for v in out.data() {
            assert_relative_eq!(*v, 1.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_basic_requires_single_logit() {
        assert!(BasicAttention::new(MidStack::empty(), zero_last(2, 2)).is_err());
    }

    #[test]
    fn test_mid_stack_chain_checked() {
        let a = zero_last(4, 3);
        let b = zero_last(2, 1);
        assert!(MidStack::new(vec![a.clone(), b], 0.0).is_err());

        let mid = MidStack::new(vec![a], 0.1).unwrap();
        assert_eq!(mid.out_features(), Some(3));
        assert!(BasicAttention::new(mid, zero_last(4, 1)).is_err());
    }

    #[test]
    fn test_spatial_channel_zero_heads_half_gate() {
        // Zero heads: uniform alpha and gate sigmoid(0) = 0.5
        let agg =
            SpatialChannelAttention::new(MidStack::empty(), zero_last(2, 1), zero_last(2, 2))
                .unwrap();
        let score = Tensor::zeros(&[1, 1, 2, 2]);
        let value_a = Tensor::new(vec![2.0, 4.0], vec![1, 1, 2]).unwrap();
        let value_b = Tensor::new(vec![1.0, 1.0, 3.0, 3.0], vec![1, 1, 2, 2]).unwrap();

        let out = agg
            .aggregate(&score, None, &value_a, &value_b)
            .unwrap()
            .to_vec_f32();
        // value_a * mean(value_b) * 0.5 = [2*2*0.5, 4*2*0.5]
        assert_relative_eq!(out[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_spatial_channel_pool_ignores_masked_keys() {
        // Channel head copies the pooled score, so the gate reveals the pool.
        let identity = Linear::new(
            Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]).unwrap(),
            None,
        )
        .unwrap();
        let agg =
            SpatialChannelAttention::new(MidStack::empty(), zero_last(2, 1), identity).unwrap();

        let score = Tensor::new(vec![0.0, 0.0, 100.0, 100.0], vec![1, 1, 2, 2]).unwrap();
        let value_a = Tensor::full(&[1, 1, 2], 1.0);
        let value_b = Tensor::full(&[1, 1, 2, 2], 1.0);

        let masked = Tensor::new(vec![1.0, 0.0], vec![1, 2]).unwrap();
        let out = agg
            .aggregate(&score, Some(&masked), &value_a, &value_b)
            .unwrap();
        // Only key 0 pooled: gate = sigmoid(0) = 0.5
        for v in out.data() {
            assert_relative_eq!(*v, 0.5, epsilon = 1e-6);
        }

        let out = agg.aggregate(&score, None, &value_a, &value_b).unwrap();
        // Mean over both keys is 50: gate ~ 1
        for v in out.data() {
            assert_relative_eq!(*v, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_spatial_channel_head_widths_checked() {
        let mid = MidStack::new(vec![zero_last(4, 3)], 0.0).unwrap();
        assert!(SpatialChannelAttention::new(mid, zero_last(3, 1), zero_last(4, 4)).is_err());
    }

    #[test]
    fn test_load_step_follows_dropout() {
        let mut weights = ModelWeights::default();
        weights.insert("p.attn_net.attention_basic.0.weight", Tensor::zeros(&[3, 4]));
        weights.insert("p.attn_net.attention_basic.0.bias", Tensor::zeros(&[3]));
        weights.insert("p.attn_net.attention_basic.3.weight", Tensor::zeros(&[2, 3]));
        weights.insert("p.attn_net.attention_basic.3.bias", Tensor::zeros(&[2]));
        weights.insert("p.attn_net.attention_last.weight", Tensor::zeros(&[1, 2]));
        weights.insert("p.attn_net.attention_last.bias", Tensor::zeros(&[1]));

        let agg = AggregatorKind::Basic
            .load(&weights, "p.", &[4, 3, 2, 1], 0.1)
            .unwrap();
        let out = agg
            .aggregate(
                &Tensor::zeros(&[1, 1, 3, 4]),
                None,
                &Tensor::zeros(&[1, 1, 4]),
                &Tensor::full(&[1, 1, 3, 4], 2.0),
            )
            .unwrap();
        assert_eq!(out.shape(), &[1, 1, 4]);

        // Without dropout the second layer would live at index 2
        match AggregatorKind::Basic
            .load(&weights, "p.", &[4, 3, 2, 1], 0.0)
            .unwrap_err()
        {
            LowRankError::MissingWeight(name) => {
                assert_eq!(name, "p.attn_net.attention_basic.2.weight")
            }
            other => panic!("Expected MissingWeight, got {:?}", other),
        }
    }
}
