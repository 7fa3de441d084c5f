//! Low-rank cosine-direction multi-head attention.
//!
//! # Architecture
//!
//! ```text
//! query   --in_proj_q--> split --+
//! key     --in_proj_k--> split --+--> cosine-direction score --> dropout --+
//!                                                                          |
//! value_a --in_proj_v1-> split -----------------------------------------+  |
//! value_b --in_proj_v2-> split ------------------------------------------+-+--> aggregator --> merge
//! ```
//!
//! Each `in_proj_*` is a [`ProjectionUnit`] (Linear, optional activation,
//! per-head GroupNorm). The aggregator is any [`AttentionAggregator`].
//!
//! # Modes
//!
//! * [`forward`](LowRankAttention::forward): one query vector per batch
//!   element, `[B, E] -> [B, E]`.
//! * [`forward_sequence`](LowRankAttention::forward_sequence): a query
//!   sequence, `[B, Q, E] -> [B, Q, E]`. With an initialized
//!   [`LowRankCache`] the call's keys are appended and the whole history is
//!   scored (autoregressive decoding).
//! * `precompute = true`: `key`/`value_b` are already projected
//!   `[B, H, K, D]` tensors, typically from [`precompute`](LowRankAttention::precompute),
//!   so a fixed context is projected once and scored many times.
//!
//! The block itself is immutable while scoring; all decode state lives in
//! the caller's cache.

use std::borrow::Cow;

use tracing::debug;

use crate::aggregator::AttentionAggregator;
use crate::cache::LowRankCache;
use crate::config::LowRankConfig;
use crate::dropout::Dropout;
use crate::error::{LowRankError, Result};
use crate::heads::{merge_heads, split_heads};
use crate::loader::ModelWeights;
use crate::projection::ProjectionUnit;
use crate::scorer::cosine_direction_score;
use crate::tensor::Tensor;

/// The four input projections of a [`LowRankAttention`] block.
#[derive(Debug, Clone)]
pub struct Projections {
    /// Query projection (`in_proj_q`).
    pub query: ProjectionUnit,
    /// Key projection (`in_proj_k`).
    pub key: ProjectionUnit,
    /// Value-A projection (`in_proj_v1`), consumed per query position.
    pub value_a: ProjectionUnit,
    /// Value-B projection (`in_proj_v2`), consumed per key position.
    pub value_b: ProjectionUnit,
}

/// Low-rank cosine-direction attention block.
#[derive(Debug)]
pub struct LowRankAttention {
    projections: Projections,
    attn_net: Box<dyn AttentionAggregator>,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl LowRankAttention {
    /// Create an attention block.
    ///
    /// # Arguments
    ///
    /// * `num_heads` - Number of heads; must divide the projections' embedding width
    /// * `projections` - Query, key, value-A and value-B projection units
    /// * `attn_net` - Aggregator consuming the score tensor
    /// * `dropout_p` - Dropout rate applied to the score tensor in training mode
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `num_heads` is zero or doesn't divide the
    /// embedding width, if the four projections disagree on the embedding
    /// width or don't normalize with one group per head, or if `dropout_p`
    /// is outside `[0, 1]`.
    pub fn new(
        num_heads: usize,
        projections: Projections,
        attn_net: Box<dyn AttentionAggregator>,
        dropout_p: f32,
    ) -> Result<Self> {
        let embed_dim = projections.query.embed_dim();
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(LowRankError::InvalidConfig(format!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                embed_dim, num_heads
            )));
        }

        let units = [
            ("query", &projections.query),
            ("key", &projections.key),
            ("value_a", &projections.value_a),
            ("value_b", &projections.value_b),
        ];
        for (name, unit) in units {
            if unit.embed_dim() != embed_dim || unit.num_groups() != num_heads {
                return Err(LowRankError::InvalidConfig(format!(
                    "{} projection is {} wide with {} groups, expected {} wide with {} groups",
                    name,
                    unit.embed_dim(),
                    unit.num_groups(),
                    embed_dim,
                    num_heads
                )));
            }
        }

        Ok(LowRankAttention {
            projections,
            attn_net,
            dropout: Dropout::new(dropout_p)?,
            num_heads,
            head_dim: embed_dim / num_heads,
        })
    }

    /// Build a block from checkpoint weights.
    ///
    /// Parameters are looked up under `prefix` (include any trailing dot):
    ///
    /// ```text
    /// {prefix}in_proj_{q,k,v1,v2}.0.{weight,bias}      linear
    /// {prefix}in_proj_{q,k,v1,v2}.{1|2}.{weight,bias}  GroupNorm (2 when `act` is set)
    /// {prefix}attn_net.attention_basic.{i}.*           aggregator mid stack
    /// {prefix}attn_net.attention_last.*                spatial head
    /// {prefix}attn_net.attention_last2.*               channel head (SCAtt)
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the config doesn't validate,
    /// `MissingWeight` for absent parameters and `ShapeMismatch` for
    /// parameters of the wrong size.
    pub fn from_weights(config: &LowRankConfig, weights: &ModelWeights, prefix: &str) -> Result<Self> {
        config.validate()?;
        let activation = config.activation()?;
        let norm_index = if activation.is_some() { 2 } else { 1 };

        let unit = |name: &str| -> Result<ProjectionUnit> {
            let base = format!("{}in_proj_{}", prefix, name);
            let linear = weights.linear(&format!("{}.0", base))?;
            let norm = weights.group_norm(
                &format!("{}.{}", base, norm_index),
                config.att_heads,
                config.group_norm_eps,
            )?;
            ProjectionUnit::new(linear, activation, norm)
        };

        let projections = Projections {
            query: unit("q")?,
            key: unit("k")?,
            value_a: unit("v1")?,
            value_b: unit("v2")?,
        };
        let attn_net = config.att_type.load(
            weights,
            prefix,
            &config.att_mid_dim,
            config.att_mid_drop,
        )?;

        debug!(
            prefix,
            embed_dim = config.embed_dim,
            heads = config.att_heads,
            att_type = %config.att_type,
            act = %config.act,
            "built low-rank attention from weights"
        );
        LowRankAttention::new(config.att_heads, projections, attn_net, config.score_dropout())
    }

    /// Embedding width.
    pub fn embed_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Number of attention heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Per-head width.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Switch score dropout and the aggregator between training and inference.
    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
        self.attn_net.set_training(training);
    }

    /// Project keys and value-B for reuse with `precompute = true`.
    ///
    /// # Arguments
    ///
    /// * `key` - Raw keys `[B, K, E]`
    /// * `value_b` - Raw value-B `[B, K, E]`
    ///
    /// # Returns
    ///
    /// `(keys, value_b)`, each `[B, H, K, D]`.
    pub fn precompute(&self, key: &Tensor, value_b: &Tensor) -> Result<(Tensor, Tensor)> {
        for t in [key, value_b] {
            if t.ndim() != 3 {
                return Err(LowRankError::DimOutOfRange {
                    dim: 3,
                    ndim: t.ndim(),
                });
            }
        }

        let keys = self.split(&self.projections.key.forward(key)?)?;
        let value_b = self.split(&self.projections.value_b.forward(value_b)?)?;
        Ok((keys, value_b))
    }

    /// Empty decode cache for `batch_size` sequences.
    pub fn init_buffer(&self, batch_size: usize) -> LowRankCache {
        LowRankCache::with_batch(batch_size, self.num_heads, self.head_dim)
    }

    /// Return `cache` to stateless mode. Clearing an absent cache is a no-op.
    pub fn clear_buffer(&self, cache: &mut LowRankCache) {
        cache.clear();
    }

    /// Transform both cache buffers, e.g. to follow a beam reordering.
    ///
    /// See [`LowRankCache::apply_to_states`].
    pub fn apply_to_states<F>(&self, cache: &mut LowRankCache, f: F) -> Result<()>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        cache.apply_to_states(f)
    }

    /// Single-step attention: one query vector per batch element.
    ///
    /// # Arguments
    ///
    /// * `query` - `[B, E]`
    /// * `key` - Raw `[B, K, E]`, or projected `[B, H, K, D]` when `precompute`
    /// * `mask` - Optional `[B, K]`; zero entries are ignored by the aggregator
    /// * `value_a` - `[B, E]`
    /// * `value_b` - Raw `[B, K, E]`, or projected `[B, H, K, D]` when `precompute`
    /// * `precompute` - Whether `key`/`value_b` are already projected
    ///
    /// # Returns
    ///
    /// Context `[B, E]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch`/`DimOutOfRange` for inconsistent inputs,
    /// including a `value_a` whose shape differs from `query`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        mask: Option<&Tensor>,
        value_a: &Tensor,
        value_b: &Tensor,
        precompute: bool,
    ) -> Result<Tensor> {
        for t in [query, value_a] {
            if t.ndim() != 2 {
                return Err(LowRankError::DimOutOfRange {
                    dim: 2,
                    ndim: t.ndim(),
                });
            }
        }
        check_value_a(query, value_a)?;

        // [B, E] -> [B, H, D]
        let q = self.split(&self.projections.query.forward(query)?)?;
        let v1 = self.split(&self.projections.value_a.forward(value_a)?)?;
        let (k, v2) = self.keys_and_values(key, value_b, precompute)?;

        debug!(
            batch = q.shape()[0],
            keys = k.shape()[2],
            precompute,
            "low-rank attention step"
        );

        let attn = self.attend(&q, &k, mask, &v1, &v2)?;
        merge_heads(&attn)
    }

    /// Sequence attention: a query sequence per batch element.
    ///
    /// With an initialized `cache` and `precompute == false`, this call's
    /// projected keys/value-B are appended to the cache and the whole
    /// accumulated history is scored. Otherwise only the keys passed in are
    /// scored and `cache` is untouched.
    ///
    /// # Arguments
    ///
    /// * `query` - `[B, Q, E]`
    /// * `key` - Raw `[B, K, E]`, or projected `[B, H, K, D]` when `precompute`
    /// * `mask` - Optional `[B, Q, K_total]`, `K_total` including cached positions
    /// * `value_a` - `[B, Q, E]`
    /// * `value_b` - Raw `[B, K, E]`, or projected `[B, H, K, D]` when `precompute`
    /// * `precompute` - Whether `key`/`value_b` are already projected
    /// * `cache` - Decode cache, absent for stateless use
    ///
    /// # Returns
    ///
    /// Context `[B, Q, E]`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut cache = attn.init_buffer(batch);
    /// for step in tokens {
    ///     // step: [B, 1, E]; history grows by one position per call
    ///     let out = attn.forward_sequence(&step, &step, None, &step, &step, false, &mut cache)?;
    /// }
    /// attn.clear_buffer(&mut cache);
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn forward_sequence(
        &self,
        query: &Tensor,
        key: &Tensor,
        mask: Option<&Tensor>,
        value_a: &Tensor,
        value_b: &Tensor,
        precompute: bool,
        cache: &mut LowRankCache,
    ) -> Result<Tensor> {
        for t in [query, value_a] {
            if t.ndim() != 3 {
                return Err(LowRankError::DimOutOfRange {
                    dim: 3,
                    ndim: t.ndim(),
                });
            }
        }
        check_value_a(query, value_a)?;

        // [B, Q, E] -> [B, H, Q, D]
        let q = self.split(&self.projections.query.forward(query)?)?;
        let v1 = self.split(&self.projections.value_a.forward(value_a)?)?;
        let (k, v2) = self.keys_and_values(key, value_b, precompute)?;

        let (k, v2) = if !precompute && cache.is_initialized() {
            let (k_full, v2_full) = cache.append(&k, &v2)?;
            (Cow::Owned(k_full), Cow::Owned(v2_full))
        } else {
            (k, v2)
        };

        debug!(
            batch = q.shape()[0],
            queries = q.shape()[2],
            keys = k.shape()[2],
            cached = cache.seq_len(),
            precompute,
            "low-rank attention sequence"
        );

        let attn = self.attend(&q, &k, mask, &v1, &v2)?;
        merge_heads(&attn)
    }

    fn split(&self, x: &Tensor) -> Result<Tensor> {
        split_heads(x, self.num_heads, self.head_dim)
    }

    /// Projected `[B, H, K, D]` keys and value-B, borrowed when precomputed.
    fn keys_and_values<'a>(
        &self,
        key: &'a Tensor,
        value_b: &'a Tensor,
        precompute: bool,
    ) -> Result<(Cow<'a, Tensor>, Cow<'a, Tensor>)> {
        if !precompute {
            let (k, v2) = self.precompute(key, value_b)?;
            return Ok((Cow::Owned(k), Cow::Owned(v2)));
        }

        for t in [key, value_b] {
            let valid = t.ndim() == 4 && t.shape()[1] == self.num_heads && t.shape()[3] == self.head_dim;
            if !valid {
                return Err(LowRankError::ShapeMismatch {
                    expected: vec![t.shape().first().copied().unwrap_or(0), self.num_heads, 0, self.head_dim],
                    got: t.shape().to_vec(),
                });
            }
        }
        if key.shape() != value_b.shape() {
            return Err(LowRankError::ShapeMismatch {
                expected: key.shape().to_vec(),
                got: value_b.shape().to_vec(),
            });
        }
        Ok((Cow::Borrowed(key), Cow::Borrowed(value_b)))
    }

    /// Score, drop out and aggregate; returns per-head context.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        mask: Option<&Tensor>,
        v1: &Tensor,
        v2: &Tensor,
    ) -> Result<Tensor> {
        let score = cosine_direction_score(q, k)?.score;
        let score = self.dropout.forward(&score);
        self.attn_net.aggregate(&score, mask, v1, v2)
    }
}

/// Value-A must line up with the query row for row: same batch and,
/// in sequence mode, same query length.
fn check_value_a(query: &Tensor, value_a: &Tensor) -> Result<()> {
    if query.shape() != value_a.shape() {
        return Err(LowRankError::ShapeMismatch {
            expected: query.shape().to_vec(),
            got: value_a.shape().to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregatorKind, BasicAttention, MidStack, SpatialChannelAttention};
    use crate::group_norm::GroupNorm;
    use crate::linear::Linear;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::{Arc, Mutex};

    fn random_unit(rng: &mut StdRng, embed_dim: usize, heads: usize) -> ProjectionUnit {
        let w: Vec<f32> = (0..embed_dim * embed_dim)
            .map(|_| rng.gen_range(-0.5..0.5))
            .collect();
        let linear = Linear::new(Tensor::new(w, vec![embed_dim, embed_dim]).unwrap(), None).unwrap();
        let norm = GroupNorm::with_unit_affine(embed_dim, heads, 1e-5).unwrap();
        ProjectionUnit::new(linear, None, norm).unwrap()
    }

    fn projections(embed_dim: usize, heads: usize, seed: u64) -> Projections {
        let mut rng = StdRng::seed_from_u64(seed);
        Projections {
            query: random_unit(&mut rng, embed_dim, heads),
            key: random_unit(&mut rng, embed_dim, heads),
            value_a: random_unit(&mut rng, embed_dim, heads),
            value_b: random_unit(&mut rng, embed_dim, heads),
        }
    }

    fn uniform_aggregator(head_dim: usize) -> Box<dyn AttentionAggregator> {
        let last = Linear::new(Tensor::zeros(&[1, head_dim]), None).unwrap();
        Box::new(BasicAttention::new(MidStack::empty(), last).unwrap())
    }

    fn block(embed_dim: usize, heads: usize) -> LowRankAttention {
        LowRankAttention::new(
            heads,
            projections(embed_dim, heads, 3),
            uniform_aggregator(embed_dim / heads),
            0.0,
        )
        .unwrap()
    }

    fn random_tensor(shape: &[usize], seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let n: usize = shape.iter().product();
        Tensor::new((0..n).map(|_| rng.gen_range(-1.0..1.0)).collect(), shape.to_vec()).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let attn = block(16, 4);
        assert_eq!(attn.embed_dim(), 16);
        assert_eq!(attn.head_dim(), 4);

        let query = random_tensor(&[2, 16], 1);
        let key = random_tensor(&[2, 5, 16], 2);
        let out = attn.forward(&query, &key, None, &query, &key, false).unwrap();
        assert_eq!(out.shape(), &[2, 16]);
    }

    #[test]
    fn test_forward_sequence_shapes_stateless() {
        let attn = block(16, 4);
        let query = random_tensor(&[2, 3, 16], 1);
        let key = random_tensor(&[2, 5, 16], 2);
        let mut cache = LowRankCache::new();

        let out = attn
            .forward_sequence(&query, &key, None, &query, &key, false, &mut cache)
            .unwrap();
        assert_eq!(out.shape(), &[2, 3, 16]);
        assert!(!cache.is_initialized());
    }

    #[test]
    fn test_indivisible_heads_fail_fast() {
        let result = LowRankAttention::new(3, projections(16, 4, 0), uniform_aggregator(4), 0.0);
        match result.unwrap_err() {
            LowRankError::InvalidConfig(msg) => assert!(msg.contains("divisible")),
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_projection_groups_must_match_heads() {
        // Divisible, but the norms were built with 4 groups
        let result = LowRankAttention::new(2, projections(16, 4, 0), uniform_aggregator(8), 0.0);
        assert!(matches!(result, Err(LowRankError::InvalidConfig(_))));
    }

    #[test]
    fn test_precompute_shapes_and_rank_check() {
        let attn = block(16, 4);
        let key = random_tensor(&[2, 5, 16], 2);
        let (k, v2) = attn.precompute(&key, &key).unwrap();
        assert_eq!(k.shape(), &[2, 4, 5, 4]);
        assert_eq!(v2.shape(), &[2, 4, 5, 4]);

        assert!(attn.precompute(&random_tensor(&[2, 16], 1), &key).is_err());
    }

    #[test]
    fn test_precomputed_inputs_must_be_per_head() {
        let attn = block(16, 4);
        let query = random_tensor(&[2, 16], 1);
        let raw_key = random_tensor(&[2, 5, 16], 2);
        // Raw keys passed as if precomputed
        assert!(attn
            .forward(&query, &raw_key, None, &query, &raw_key, true)
            .is_err());
    }

    #[test]
    fn test_precompute_flag_skips_cache_append() {
        let attn = block(8, 2);
        let query = random_tensor(&[1, 1, 8], 1);
        let key = random_tensor(&[1, 3, 8], 2);
        let (k, v2) = attn.precompute(&key, &key).unwrap();

        let mut cache = attn.init_buffer(1);
        attn.forward_sequence(&query, &k, None, &query, &v2, true, &mut cache)
            .unwrap();
        assert!(cache.is_initialized());
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn test_query_rank_checked() {
        let attn = block(8, 2);
        let seq = random_tensor(&[1, 2, 8], 1);
        assert!(attn.forward(&seq, &seq, None, &seq, &seq, false).is_err());

        let step = random_tensor(&[1, 8], 1);
        let mut cache = LowRankCache::new();
        assert!(attn
            .forward_sequence(&step, &seq, None, &step, &seq, false, &mut cache)
            .is_err());
    }

    /// Passes value-A through and keeps every score it is handed.
    #[derive(Debug, Clone, Default)]
    struct ScoreRecorder {
        scores: Arc<Mutex<Vec<Tensor>>>,
    }

    impl AttentionAggregator for ScoreRecorder {
        fn aggregate(
            &self,
            score: &Tensor,
            _mask: Option<&Tensor>,
            value_a: &Tensor,
            _value_b: &Tensor,
        ) -> Result<Tensor> {
            self.scores.lock().unwrap().push(score.clone());
            Ok(value_a.clone())
        }
    }

    fn nonzero(t: &Tensor) -> usize {
        t.data().iter().filter(|x| **x != 0.0).count()
    }

    #[test]
    fn test_score_dropout_in_training_mode() {
        let recorder = ScoreRecorder::default();
        let mut attn = LowRankAttention::new(
            2,
            projections(8, 2, 5),
            Box::new(recorder.clone()),
            1.0,
        )
        .unwrap();
        let query = random_tensor(&[1, 8], 1);
        let key = random_tensor(&[1, 3, 8], 2);

        attn.forward(&query, &key, None, &query, &key, false).unwrap();
        attn.forward(&query, &key, None, &query, &key, false).unwrap();
        attn.set_training(true);
        attn.forward(&query, &key, None, &query, &key, false).unwrap();

        let scores = recorder.scores.lock().unwrap();
        assert_eq!(scores.len(), 3);
        // Inference mode leaves the score untouched
        assert_eq!(scores[0], scores[1]);
        assert_eq!(scores[0].shape(), &[1, 2, 3, 4]);
        assert!(nonzero(&scores[0]) > 0);
        // p = 1 drops every entry
        assert_eq!(scores[2].shape(), &[1, 2, 3, 4]);
        assert_eq!(nonzero(&scores[2]), 0);
    }

    fn spatial_channel_block(embed_dim: usize, heads: usize) -> LowRankAttention {
        let head_dim = embed_dim / heads;
        let last = Linear::new(Tensor::zeros(&[1, head_dim]), None).unwrap();
        let last2 = Linear::new(Tensor::zeros(&[head_dim, head_dim]), None).unwrap();
        let attn_net = SpatialChannelAttention::new(MidStack::empty(), last, last2).unwrap();
        LowRankAttention::new(heads, projections(embed_dim, heads, 3), Box::new(attn_net), 0.0)
            .unwrap()
    }

    #[test]
    fn test_value_a_batch_must_match_query() {
        let query = random_tensor(&[2, 8], 1);
        let key = random_tensor(&[2, 3, 8], 2);

        // Would broadcast across the batch inside the channel gate
        let single = random_tensor(&[1, 8], 3);
        let result = spatial_channel_block(8, 2).forward(&query, &key, None, &single, &key, false);
        match result.unwrap_err() {
            LowRankError::ShapeMismatch { expected, got } => {
                assert_eq!(expected, vec![2, 8]);
                assert_eq!(got, vec![1, 8]);
            }
            other => panic!("Expected ShapeMismatch, got {:?}", other),
        }

        // Never read by the basic aggregator, still rejected
        let wide = random_tensor(&[5, 8], 3);
        let result = block(8, 2).forward(&query, &key, None, &wide, &key, false);
        assert!(matches!(result, Err(LowRankError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_value_a_sequence_must_match_query() {
        let query = random_tensor(&[2, 3, 8], 1);
        let key = random_tensor(&[2, 4, 8], 2);

        for attn in [spatial_channel_block(8, 2), block(8, 2)] {
            let mut cache = attn.init_buffer(2);

            let short = random_tensor(&[2, 1, 8], 3);
            let result = attn.forward_sequence(&query, &key, None, &short, &key, false, &mut cache);
            assert!(matches!(result, Err(LowRankError::ShapeMismatch { .. })));

            let single = random_tensor(&[1, 3, 8], 3);
            let result = attn.forward_sequence(&query, &key, None, &single, &key, false, &mut cache);
            assert!(matches!(result, Err(LowRankError::ShapeMismatch { .. })));

            // Rejected before anything reaches the cache
            assert_eq!(cache.seq_len(), 0);
        }
    }

    fn insert_unit(weights: &mut ModelWeights, name: &str, unit_index: usize, embed_dim: usize) {
        let mut rng = StdRng::seed_from_u64(unit_index as u64 + 11);
        let w: Vec<f32> = (0..embed_dim * embed_dim)
            .map(|_| rng.gen_range(-0.5..0.5))
            .collect();
        weights.insert(
            format!("enc.in_proj_{}.0.weight", name),
            Tensor::new(w, vec![embed_dim, embed_dim]).unwrap(),
        );
        weights.insert(format!("enc.in_proj_{}.0.bias", name), Tensor::zeros(&[embed_dim]));
        weights.insert(format!("enc.in_proj_{}.1.weight", name), Tensor::full(&[embed_dim], 1.0));
        weights.insert(format!("enc.in_proj_{}.1.bias", name), Tensor::zeros(&[embed_dim]));
    }

    fn basic_config() -> LowRankConfig {
        LowRankConfig::from_json_str(
            r#"{"embed_dim": 8, "att_heads": 2, "att_type": "BasicAtt", "att_mid_dim": [4, 1]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_from_weights() {
        let mut weights = ModelWeights::default();
        for (i, name) in ["q", "k", "v1", "v2"].iter().enumerate() {
            insert_unit(&mut weights, name, i, 8);
        }
        weights.insert("enc.attn_net.attention_last.weight", Tensor::full(&[1, 4], 0.1));
        weights.insert("enc.attn_net.attention_last.bias", Tensor::zeros(&[1]));

        let config = basic_config();
        assert_eq!(config.att_type, AggregatorKind::Basic);
        let attn = LowRankAttention::from_weights(&config, &weights, "enc.").unwrap();
        assert_eq!(attn.num_heads(), 2);

        let query = random_tensor(&[3, 8], 1);
        let key = random_tensor(&[3, 4, 8], 2);
        let out = attn.forward(&query, &key, None, &query, &key, false).unwrap();
        assert_eq!(out.shape(), &[3, 8]);
    }

    #[test]
    fn test_from_weights_missing_parameter() {
        let mut weights = ModelWeights::default();
        for (i, name) in ["q", "k", "v1"].iter().enumerate() {
            insert_unit(&mut weights, name, i, 8);
        }
        match LowRankAttention::from_weights(&basic_config(), &weights, "enc.").unwrap_err() {
            LowRankError::MissingWeight(name) => assert_eq!(name, "enc.in_proj_v2.0.weight"),
            other => panic!("Expected MissingWeight, got {:?}", other),
        }
    }

    #[test]
    fn test_from_weights_validates_config() {
        let mut config = basic_config();
        config.att_heads = 3;
        let result = LowRankAttention::from_weights(&config, &ModelWeights::default(), "");
        assert!(matches!(result, Err(LowRankError::InvalidConfig(_))));
    }
}
