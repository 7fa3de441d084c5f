//! Low-rank cosine-direction attention
//!
//! Pure Rust implementation of a multi-head attention block that scores each
//! (query, key) pair with the query's direction scaled by their cosine
//! similarity, instead of a scalar dot product. Supports single-step and
//! sequence scoring, precomputed key/value projections for a fixed context,
//! and an incremental decode cache.
//!
//! # Example
//!
//! ```rust,no_run
//! use lowrank_attention::config::LowRankConfig;
//! use lowrank_attention::loader::ModelWeights;
//! use lowrank_attention::lowrank::LowRankAttention;
//! use lowrank_attention::tensor::Tensor;
//!
//! let config = LowRankConfig::from_file("checkpoints/attention.json")?;
//! let weights = ModelWeights::from_safetensors("checkpoints/decoder.safetensors")?;
//! let attn = LowRankAttention::from_weights(&config, &weights, "decoder.layers.0.attn.")?;
//!
//! // Project the image regions once, then decode word by word.
//! let regions = Tensor::zeros(&[1, 36, config.embed_dim]);
//! let (keys, values) = attn.precompute(&regions, &regions)?;
//! let word = Tensor::zeros(&[1, config.embed_dim]);
//! let context = attn.forward(&word, &keys, None, &word, &values, true)?;
//! assert_eq!(context.shape(), &[1, config.embed_dim]);
//! # Ok::<(), lowrank_attention::error::LowRankError>(())
//! ```

#![warn(missing_docs)]

pub mod activation;
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod dropout;
pub mod error;
pub mod group_norm;
pub mod heads;
pub mod linear;
pub mod loader;
pub mod lowrank;
pub mod projection;
pub mod scorer;
pub mod tensor;
