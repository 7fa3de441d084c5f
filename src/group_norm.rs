//! Group Normalization over the channel dimension.
//!
//! Splits the last dimension into `num_groups` contiguous groups and
//! normalizes each group to zero mean and unit variance, then applies a
//! learned per-channel affine transform.
//!
//! # Algorithm
//!
//! ```text
//! GroupNorm(x)[c] = (x[c] - mean_g) / sqrt(var_g + eps) * weight[c] + bias[c]
//! ```
//!
//! where `g` is the group containing channel `c` and the variance is biased
//! (divided by the group size).
//!
//! # Usage
//!
//! Every projection unit ends with a GroupNorm whose groups are the attention
//! heads: with `embed_dim = 64` and 8 heads, each head's 8 channels are
//! normalized independently of the others.
//!
//! # Reference
//!
//! Wu & He (2018): "Group Normalization"
//! https://arxiv.org/abs/1803.08494

use crate::error::{LowRankError, Result};
use crate::tensor::Tensor;

/// Default epsilon, matching the usual framework default.
pub const DEFAULT_GROUP_NORM_EPS: f64 = 1e-5;

/// Group normalization layer.
#[derive(Debug, Clone)]
pub struct GroupNorm {
    /// Per-channel scale, shape `[channels]`.
    weight: Tensor,
    /// Per-channel shift, shape `[channels]`.
    bias: Tensor,
    /// Number of channel groups.
    num_groups: usize,
    /// Epsilon for numerical stability.
    eps: f64,
}

impl GroupNorm {
    /// Create a new GroupNorm layer.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if weight/bias are not matching 1D tensors, and
    /// `InvalidConfig` if `num_groups` is zero or doesn't divide the channel count.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::group_norm::GroupNorm;
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let weight = Tensor::new(vec![1.0; 64], vec![64]).unwrap();
    /// let bias = Tensor::zeros(&[64]);
    /// let norm = GroupNorm::new(weight, bias, 8, 1e-5).unwrap();
    /// assert_eq!(norm.channels(), 64);
    /// ```
    pub fn new(weight: Tensor, bias: Tensor, num_groups: usize, eps: f64) -> Result<Self> {
        if weight.ndim() != 1 {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![0], // Expect 1D
                got: weight.shape().to_vec(),
            });
        }
        if bias.shape() != weight.shape() {
            return Err(LowRankError::ShapeMismatch {
                expected: weight.shape().to_vec(),
                got: bias.shape().to_vec(),
            });
        }

        let channels = weight.shape()[0];
        if num_groups == 0 || channels == 0 || channels % num_groups != 0 {
            return Err(LowRankError::InvalidConfig(format!(
                "{} channels cannot be split into {} groups",
                channels, num_groups
            )));
        }

        Ok(GroupNorm {
            weight,
            bias,
            num_groups,
            eps,
        })
    }

    /// Identity-affine GroupNorm (weight 1, bias 0).
    pub fn with_unit_affine(channels: usize, num_groups: usize, eps: f64) -> Result<Self> {
        GroupNorm::new(
            Tensor::full(&[channels], 1.0),
            Tensor::zeros(&[channels]),
            num_groups,
            eps,
        )
    }

    /// Number of channels normalized.
    pub fn channels(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Number of groups.
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// Normalize `x` of shape `[..., channels]`.
    ///
    /// Each leading position is treated as an independent sample.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the last dimension doesn't match the channel count.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let channels = self.channels();
        let last_dim = x.shape().last().copied().unwrap_or(0);
        if last_dim != channels {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![channels],
                got: vec![last_dim],
            });
        }

        let data = x.data();
        let weight = self.weight.data();
        let bias = self.bias.data();
        let group_size = channels / self.num_groups;

        let mut result = vec![0.0f32; data.len()];
        for (sample, out) in data.chunks(channels).zip(result.chunks_mut(channels)) {
            for g in 0..self.num_groups {
                let start = g * group_size;
                let end = start + group_size;
                let group = &sample[start..end];

                let mean = group.iter().sum::<f32>() / group_size as f32;
                let var = group.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>()
                    / group_size as f32;
                let inv_std = 1.0 / (var as f64 + self.eps).sqrt() as f32;

                for c in start..end {
                    out[c] = (sample[c] - mean) * inv_std * weight[c] + bias[c];
                }
            }
        }

        Tensor::new(result, x.shape().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_each_group_normalized_independently() {
        // Two groups of 2 channels with very different scales
        let norm = GroupNorm::with_unit_affine(4, 2, 1e-5).unwrap();
        let x = Tensor::new(vec![1.0, 3.0, 100.0, 300.0], vec![1, 4]).unwrap();
        let y = norm.forward(&x).unwrap().to_vec_f32();

        // Group 0: mean 2, var 1 -> [-1, 1]; group 1: mean 200, var 10000 -> [-1, 1]
        assert_relative_eq!(y[0], -1.0, epsilon = 1e-4);
        assert_relative_eq!(y[1], 1.0, epsilon = 1e-4);
        assert_relative_eq!(y[2], -1.0, epsilon = 1e-4);
        assert_relative_eq!(y[3], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_affine_applied_per_channel() {
        let weight = Tensor::new(vec![2.0, 2.0, 1.0, 1.0], vec![4]).unwrap();
        let bias = Tensor::new(vec![0.0, 0.0, 5.0, 5.0], vec![4]).unwrap();
        let norm = GroupNorm::new(weight, bias, 2, 1e-5).unwrap();

        let x = Tensor::new(vec![1.0, 3.0, 1.0, 3.0], vec![1, 4]).unwrap();
        let y = norm.forward(&x).unwrap().to_vec_f32();
        assert_relative_eq!(y[0], -2.0, epsilon = 1e-4);
        assert_relative_eq!(y[1], 2.0, epsilon = 1e-4);
        assert_relative_eq!(y[2], 4.0, epsilon = 1e-4);
        assert_relative_eq!(y[3], 6.0, epsilon = 1e-4);
    }

    #[test]
    fn test_rows_are_independent_samples() {
        let norm = GroupNorm::with_unit_affine(2, 1, 1e-5).unwrap();
        let x = Tensor::new(vec![0.0, 2.0, 10.0, 30.0], vec![2, 1, 2]).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 1, 2]);
        let data = y.to_vec_f32();
        assert_relative_eq!(data[0], -1.0, epsilon = 1e-4);
        assert_relative_eq!(data[3], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_constant_group_maps_to_bias() {
        let norm = GroupNorm::with_unit_affine(4, 2, 1e-5).unwrap();
        let x = Tensor::new(vec![7.0; 4], vec![1, 4]).unwrap();
        let y = norm.forward(&x).unwrap();
        assert!(y.to_vec_f32().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_indivisible_groups_rejected() {
        match GroupNorm::with_unit_affine(10, 3, 1e-5).unwrap_err() {
            LowRankError::InvalidConfig(msg) => assert!(msg.contains("10 channels")),
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }
        assert!(GroupNorm::with_unit_affine(8, 0, 1e-5).is_err());
    }

    #[test]
    fn test_bias_shape_must_match_weight() {
        let weight = Tensor::full(&[4], 1.0);
        let bias = Tensor::zeros(&[3]);
        assert!(GroupNorm::new(weight, bias, 2, 1e-5).is_err());
    }

    #[test]
    fn test_channel_mismatch() {
        let norm = GroupNorm::with_unit_affine(4, 2, 1e-5).unwrap();
        let x = Tensor::zeros(&[1, 6]);
        assert!(norm.forward(&x).is_err());
    }
}
