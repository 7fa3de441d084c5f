//! Decode-time cache of projected keys and value-B tensors.
//!
//! The cache is owned by the caller and handed to
//! [`LowRankAttention::forward_sequence`](crate::lowrank::LowRankAttention::forward_sequence)
//! by mutable reference. It is either absent (stateless mode: every call
//! scores only the keys it was given) or initialized (decode mode: each call
//! appends its keys and scores the whole history).
//!
//! # Lifecycle
//!
//! ```text
//! new()          -> absent
//! init(B, H, D)  -> [B, H, 0, D] buffers
//! append(k, v2)  -> [B, H, n + L, D]
//! clear()        -> absent
//! ```
//!
//! Nothing resets the cache between unrelated sequences; clear it (or drop it
//! and start a fresh one) before reusing it.

use tracing::{debug, trace};

use crate::error::{LowRankError, Result};
use crate::tensor::Tensor;

/// Sequence axis of the `[B, H, L, D]` buffers.
const SEQ_DIM: usize = 2;

/// Accumulated keys and value-B across decode steps.
#[derive(Debug, Clone, Default)]
pub struct LowRankCache {
    /// `(keys, value_b)`, each `[B, H, steps_so_far, D]`. Both or neither.
    buffers: Option<(Tensor, Tensor)>,
}

impl LowRankCache {
    /// Create an absent (stateless) cache.
    pub fn new() -> Self {
        LowRankCache { buffers: None }
    }

    /// Create a cache already initialized with empty buffers.
    pub fn with_batch(batch_size: usize, num_heads: usize, head_dim: usize) -> Self {
        let mut cache = LowRankCache::new();
        cache.init(batch_size, num_heads, head_dim);
        cache
    }

    /// Allocate empty `[batch_size, num_heads, 0, head_dim]` buffers.
    ///
    /// Any previous history is discarded.
    pub fn init(&mut self, batch_size: usize, num_heads: usize, head_dim: usize) {
        let shape = [batch_size, num_heads, 0, head_dim];
        self.buffers = Some((Tensor::zeros(&shape), Tensor::zeros(&shape)));
        debug!(batch_size, num_heads, head_dim, "cache buffers initialized");
    }

    /// Drop both buffers, returning to stateless mode. Idempotent.
    pub fn clear(&mut self) {
        if self.buffers.take().is_some() {
            debug!("cache buffers cleared");
        }
    }

    /// Whether the cache is in decode mode.
    pub fn is_initialized(&self) -> bool {
        self.buffers.is_some()
    }

    /// Number of positions accumulated so far (0 when absent).
    pub fn seq_len(&self) -> usize {
        self.buffers
            .as_ref()
            .map_or(0, |(keys, _)| keys.shape()[SEQ_DIM])
    }

    /// Accumulated keys, if initialized.
    pub fn keys(&self) -> Option<&Tensor> {
        self.buffers.as_ref().map(|(keys, _)| keys)
    }

    /// Accumulated value-B, if initialized.
    pub fn value_b(&self) -> Option<&Tensor> {
        self.buffers.as_ref().map(|(_, value_b)| value_b)
    }

    /// Append new keys and value-B along the sequence axis.
    ///
    /// # Arguments
    ///
    /// * `keys` - New keys `[B, H, L, D]`
    /// * `value_b` - New value-B `[B, H, L, D]`
    ///
    /// # Returns
    ///
    /// The full accumulated `(keys, value_b)`, including this call's positions.
    ///
    /// # Errors
    ///
    /// Returns `BufferNotInitialized` if the cache is absent, and
    /// `ShapeMismatch` if the new tensors don't match the buffered batch,
    /// heads or head_dim.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::cache::LowRankCache;
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let mut cache = LowRankCache::with_batch(1, 2, 4);
    ///
    /// let k = Tensor::new(vec![1.0; 8], vec![1, 2, 1, 4]).unwrap();
    /// let v = Tensor::new(vec![2.0; 8], vec![1, 2, 1, 4]).unwrap();
    /// let (k_full, _) = cache.append(&k, &v).unwrap();
    /// assert_eq!(k_full.shape(), &[1, 2, 1, 4]);
    ///
    /// let (k_full, _) = cache.append(&k, &v).unwrap();
    /// assert_eq!(k_full.shape(), &[1, 2, 2, 4]);
    /// assert_eq!(cache.seq_len(), 2);
    /// ```
    pub fn append(&mut self, keys: &Tensor, value_b: &Tensor) -> Result<(Tensor, Tensor)> {
        let (cached_keys, cached_value_b) = self
            .buffers
            .as_ref()
            .ok_or(LowRankError::BufferNotInitialized)?;

        if keys.shape() != value_b.shape() {
            return Err(LowRankError::ShapeMismatch {
                expected: keys.shape().to_vec(),
                got: value_b.shape().to_vec(),
            });
        }

        let keys_full = Tensor::cat(&[cached_keys, keys], SEQ_DIM)?;
        let value_b_full = Tensor::cat(&[cached_value_b, value_b], SEQ_DIM)?;
        trace!(
            added = keys.shape().get(SEQ_DIM).copied().unwrap_or(0),
            total = keys_full.shape()[SEQ_DIM],
            "cache append"
        );

        self.buffers = Some((keys_full.clone(), value_b_full.clone()));
        Ok((keys_full, value_b_full))
    }

    /// Replace both buffers with `f(buffer)`.
    ///
    /// Used to reorder or expand the batch axis, e.g. following a beam-search
    /// permutation with [`Tensor::index_select`] on dim 0.
    ///
    /// # Errors
    ///
    /// Returns `BufferNotInitialized` if the cache is absent, any error from
    /// `f`, and `ShapeMismatch` if `f` leaves the two buffers with different
    /// shapes. On error the cache is left unchanged.
    pub fn apply_to_states<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        let (keys, value_b) = self
            .buffers
            .as_ref()
            .ok_or(LowRankError::BufferNotInitialized)?;

        let new_keys = f(keys)?;
        let new_value_b = f(value_b)?;
        if new_keys.shape() != new_value_b.shape() {
            return Err(LowRankError::ShapeMismatch {
                expected: new_keys.shape().to_vec(),
                got: new_value_b.shape().to_vec(),
            });
        }

        if new_keys.shape().first() != keys.shape().first() {
            debug!(
                from = keys.shape()[0],
                to = new_keys.shape().first().copied().unwrap_or(0),
                "cache batch size changed"
            );
        }

        self.buffers = Some((new_keys, new_value_b));
        Ok(())
    }
}
