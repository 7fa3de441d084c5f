//! Split the embedding dimension into `(num_heads, head_dim)` and back.
//!
//! ```text
//! split: [B, E]    -> [B, H, D]
//!        [B, L, E] -> [B, L, H, D] -> [B, H, L, D]
//! merge: the inverse of each
//! ```

use crate::error::{LowRankError, Result};
use crate::tensor::Tensor;

/// Reshape `[B, E]` or `[B, L, E]` into per-head layout.
///
/// # Errors
///
/// Returns `ShapeMismatch` if the last dimension isn't `num_heads * head_dim`,
/// and `DimOutOfRange` for inputs that are neither 2D nor 3D.
///
/// # Example
///
/// ```rust
/// use lowrank_attention::heads::split_heads;
/// use lowrank_attention::tensor::Tensor;
///
/// let x = Tensor::zeros(&[2, 5, 64]);
/// let h = split_heads(&x, 8, 8).unwrap();
/// assert_eq!(h.shape(), &[2, 8, 5, 8]);
/// ```
pub fn split_heads(x: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let shape = x.shape();
    let embed_dim = num_heads * head_dim;
    if shape.last().copied() != Some(embed_dim) {
        return Err(LowRankError::ShapeMismatch {
            expected: vec![embed_dim],
            got: shape.to_vec(),
        });
    }

    match *shape {
        [batch, _] => x.reshape(&[batch, num_heads, head_dim]),
        [batch, seq_len, _] => x
            .reshape(&[batch, seq_len, num_heads, head_dim])?
            .transpose_dims(1, 2),
        _ => Err(LowRankError::DimOutOfRange {
            dim: 3,
            ndim: x.ndim(),
        }),
    }
}

/// Inverse of [`split_heads`]: `[B, H, D]` -> `[B, E]`, `[B, H, L, D]` -> `[B, L, E]`.
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    match *x.shape() {
        [batch, heads, head_dim] => x.reshape(&[batch, heads * head_dim]),
        [batch, heads, seq_len, head_dim] => x
            .transpose_dims(1, 2)?
            .reshape(&[batch, seq_len, heads * head_dim]),
        _ => Err(LowRankError::DimOutOfRange {
            dim: 4,
            ndim: x.ndim(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_single_step() {
        let x = Tensor::new((0..8).map(|i| i as f32).collect(), vec![1, 8]).unwrap();
        let h = split_heads(&x, 2, 4).unwrap();
        assert_eq!(h.shape(), &[1, 2, 4]);
        // Head 1 owns channels 4..8
        assert_eq!(&h.data()[4..], &[4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_split_sequence_moves_heads_before_positions() {
        // [B=1, L=2, E=4], H=2, D=2
        let x = Tensor::new(vec![0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0], vec![1, 2, 4]).unwrap();
        let h = split_heads(&x, 2, 2).unwrap();
        assert_eq!(h.shape(), &[1, 2, 2, 2]);
        // head 0: pos 0 [0,1], pos 1 [10,11]; head 1: pos 0 [2,3], pos 1 [12,13]
        assert_eq!(
            h.to_vec_f32(),
            vec![0.0, 1.0, 10.0, 11.0, 2.0, 3.0, 12.0, 13.0]
        );
    }

    #[test]
    fn test_merge_inverts_split() {
        let x = Tensor::new((0..48).map(|i| i as f32).collect(), vec![2, 3, 8]).unwrap();
        let merged = merge_heads(&split_heads(&x, 4, 2).unwrap()).unwrap();
        assert_eq!(merged, x);

        let y = Tensor::new((0..16).map(|i| i as f32).collect(), vec![2, 8]).unwrap();
        assert_eq!(merge_heads(&split_heads(&y, 2, 4).unwrap()).unwrap(), y);
    }

    #[test]
    fn test_split_rejects_wrong_width() {
        let x = Tensor::zeros(&[1, 10]);
        match split_heads(&x, 4, 2).unwrap_err() {
            LowRankError::ShapeMismatch { expected, .. } => assert_eq!(expected, vec![8]),
            other => panic!("Expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_rank_checks() {
        assert!(split_heads(&Tensor::zeros(&[1, 1, 1, 8]), 2, 4).is_err());
        assert!(merge_heads(&Tensor::zeros(&[8])).is_err());
    }
}
