//! Cosine-direction scorer.
//!
//! Instead of a scalar `q·k` per (query, key) pair, each pair is scored by a
//! vector: the query's unit direction scaled by the cosine similarity between
//! query and key.
//!
//! ```text
//! cos[k]      = q·k / (max(|q|, 1e-8) * max(|k|, 1e-8))
//! q_dir       = q / max(|q|, 1e-12)
//! score[k, :] = cos[k] * q_dir
//! ```
//!
//! Every score row for a given query points the same way; only its length
//! (and sign) changes with the key. This is a rank-1-per-position stand-in
//! for a full bilinear attention map.
//!
//! # Shapes
//!
//! | query          | keys           | cos_sim          | score               |
//! |----------------|----------------|------------------|---------------------|
//! | `[B, H, D]`    | `[B, H, K, D]` | `[B, H, K]`      | `[B, H, K, D]`      |
//! | `[B, H, Q, D]` | `[B, H, K, D]` | `[B, H, Q, K]`   | `[B, H, Q, K, D]`   |

use crate::error::{LowRankError, Result};
use crate::tensor::Tensor;

/// Norm floor used by cosine similarity.
pub const COSINE_EPS: f32 = 1e-8;

/// Norm floor used when normalizing the query direction.
pub const NORMALIZE_EPS: f32 = 1e-12;

/// Score tensor together with the cosine similarities it was built from.
#[derive(Debug, Clone)]
pub struct DirectionScore {
    /// `[B, H, K, D]` or `[B, H, Q, K, D]`.
    pub score: Tensor,
    /// `[B, H, K]` or `[B, H, Q, K]`.
    pub cos_sim: Tensor,
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize along the last dimension, with the norm floored at [`NORMALIZE_EPS`].
pub fn normalize(x: &Tensor) -> Result<Tensor> {
    let d = match x.shape().last() {
        Some(&d) if d > 0 => d,
        _ => return Ok(x.clone()),
    };

    let mut out = Vec::with_capacity(x.numel());
    for row in x.data().chunks(d) {
        let inv = 1.0 / l2_norm(row).max(NORMALIZE_EPS);
        out.extend(row.iter().map(|v| v * inv));
    }
    Tensor::new(out, x.shape().to_vec())
}

/// Cosine similarity between every query row and every key row of the same head.
///
/// `query` is `[B, H, D]` or `[B, H, Q, D]`; `keys` is `[B, H, K, D]`.
/// Returns `[B, H, K]` or `[B, H, Q, K]` respectively.
///
/// # Errors
///
/// Returns `ShapeMismatch` if batch, head or head_dim disagree, and
/// `DimOutOfRange` for unsupported ranks.
pub fn cosine_similarity(query: &Tensor, keys: &Tensor) -> Result<Tensor> {
    let (groups, q_len, k_len, head_dim) = score_dims(query, keys)?;
    let q_data = query.data();
    let k_data = keys.data();

    let k_norms: Vec<f32> = if head_dim == 0 {
        vec![0.0; groups * k_len]
    } else {
        k_data.chunks(head_dim).map(l2_norm).collect()
    };

    let mut out = vec![0.0f32; groups * q_len * k_len];
    for g in 0..groups {
        for i in 0..q_len {
            let q_row = &q_data[(g * q_len + i) * head_dim..(g * q_len + i + 1) * head_dim];
            let q_norm = l2_norm(q_row).max(COSINE_EPS);
            for j in 0..k_len {
                let k_row = &k_data[(g * k_len + j) * head_dim..(g * k_len + j + 1) * head_dim];
                let dot: f32 = q_row.iter().zip(k_row).map(|(a, b)| a * b).sum();
                let k_norm = k_norms[g * k_len + j].max(COSINE_EPS);
                out[(g * q_len + i) * k_len + j] = dot / (q_norm * k_norm);
            }
        }
    }

    let mut shape = query.shape()[..query.ndim() - 1].to_vec();
    shape.push(k_len);
    Tensor::new(out, shape)
}

/// Build the cosine-direction score for a single query step or a query sequence.
///
/// # Example
///
/// ```rust
/// use lowrank_attention::scorer::cosine_direction_score;
/// use lowrank_attention::tensor::Tensor;
///
/// // One batch, one head, head_dim 2; query along x, keys along x and y
/// let q = Tensor::new(vec![3.0, 0.0], vec![1, 1, 2]).unwrap();
/// let k = Tensor::new(vec![5.0, 0.0, 0.0, 2.0], vec![1, 1, 2, 2]).unwrap();
///
/// let out = cosine_direction_score(&q, &k).unwrap();
/// assert_eq!(out.score.shape(), &[1, 1, 2, 2]);
/// assert_eq!(out.score.to_vec_f32(), vec![1.0, 0.0, 0.0, 0.0]);
/// ```
pub fn cosine_direction_score(query: &Tensor, keys: &Tensor) -> Result<DirectionScore> {
    let cos_sim = cosine_similarity(query, keys)?;
    let q_dir = normalize(query)?;

    // [.., K] -> [.., K, 1] times [.., 1, D] -> [.., K, D]
    let cos_col = cos_sim.unsqueeze(cos_sim.ndim())?;
    let dir_row = q_dir.unsqueeze(q_dir.ndim() - 1)?;
    let score = cos_col.mul(&dir_row)?;

    Ok(DirectionScore { score, cos_sim })
}

/// Resolve `(batch*heads, q_len, k_len, head_dim)` for a query/key pair.
fn score_dims(query: &Tensor, keys: &Tensor) -> Result<(usize, usize, usize, usize)> {
    let [kb, kh, k_len, kd] = *keys.shape() else {
        return Err(LowRankError::DimOutOfRange {
            dim: 4,
            ndim: keys.ndim(),
        });
    };

    let (qb, qh, q_len, qd) = match *query.shape() {
        [b, h, d] => (b, h, 1, d),
        [b, h, q, d] => (b, h, q, d),
        _ => {
            return Err(LowRankError::DimOutOfRange {
                dim: 4,
                ndim: query.ndim(),
            })
        }
    };

    if (qb, qh, qd) != (kb, kh, kd) {
        return Err(LowRankError::ShapeMismatch {
            expected: vec![qb, qh, k_len, qd],
            got: keys.shape().to_vec(),
        });
    }

    Ok((qb * qh, q_len, k_len, qd))
}
