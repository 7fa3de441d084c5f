//! SafeTensors weight loader.
//!
//! Memory-maps a `.safetensors` checkpoint and converts every tensor to f32.
//! F32, F16 and BF16 are supported; half-precision values are widened with
//! the `half` crate.
//!
//! Besides raw lookup, the loader knows how to assemble the layers this crate
//! is built from ([`ModelWeights::linear`], [`ModelWeights::group_norm`]) so
//! that model builders only deal in parameter names.
//!
//! # Example
//!
//! ```rust,no_run
//! use lowrank_attention::loader::ModelWeights;
//!
//! let weights = ModelWeights::from_safetensors("checkpoints/decoder.safetensors")?;
//! let q = weights.linear("decoder.layers.0.attn.in_proj_q.0")?;
//! assert_eq!(q.out_features(), 512);
//! # Ok::<(), lowrank_attention::error::LowRankError>(())
//! ```

use std::collections::HashMap;
use std::path::Path;

use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::info;

use crate::error::{LowRankError, Result};
use crate::group_norm::GroupNorm;
use crate::linear::Linear;
use crate::tensor::Tensor;

/// Named f32 tensors loaded from a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct ModelWeights {
    weights: HashMap<String, Tensor>,
}

impl ModelWeights {
    /// Load every tensor from a SafeTensors file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - the file cannot be opened or mapped
    /// - the SafeTensors header is invalid
    /// - a tensor has an unsupported dtype (only F32, F16 and BF16 are accepted)
    pub fn from_safetensors(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let file = std::fs::File::open(path)?;
        // SAFETY: the map is read-only and dropped before this function returns;
        // every tensor is copied out into owned f32 storage.
        let mmap = unsafe { Mmap::map(&file)? };

        let tensors = SafeTensors::deserialize(&mmap)
            .map_err(|e| LowRankError::SafeTensors(format!("Failed to parse SafeTensors: {}", e)))?;

        let mut weights = HashMap::new();
        for (name, view) in tensors.tensors() {
            let tensor = load_tensor(&name, &view)?;
            weights.insert(name, tensor);
        }

        info!(path = %path.display(), tensors = weights.len(), "loaded weights");
        Ok(ModelWeights { weights })
    }

    /// Wrap tensors that are already in memory.
    pub fn from_tensors(weights: HashMap<String, Tensor>) -> Self {
        ModelWeights { weights }
    }

    /// Add or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.weights.insert(name.into(), tensor);
    }

    /// Get a tensor by name, if present.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.weights.get(name)
    }

    /// Get a tensor by name.
    ///
    /// # Errors
    ///
    /// Returns `MissingWeight(name)` if the tensor isn't in the checkpoint.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .ok_or_else(|| LowRankError::MissingWeight(name.to_string()))
    }

    /// Number of tensors loaded.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Build a [`Linear`] from `{prefix}.weight` and, if present, `{prefix}.bias`.
    pub fn linear(&self, prefix: &str) -> Result<Linear> {
        let weight = self.require(&format!("{}.weight", prefix))?.clone();
        let bias = self.get(&format!("{}.bias", prefix)).cloned();
        Linear::new(weight, bias)
    }

    /// Build a [`GroupNorm`] from `{prefix}.weight` and `{prefix}.bias`.
    pub fn group_norm(&self, prefix: &str, num_groups: usize, eps: f64) -> Result<GroupNorm> {
        let weight = self.require(&format!("{}.weight", prefix))?.clone();
        let bias = self.require(&format!("{}.bias", prefix))?.clone();
        GroupNorm::new(weight, bias, num_groups, eps)
    }
}

/// Convert a SafeTensors view to an owned f32 tensor.
fn load_tensor(name: &str, view: &TensorView) -> Result<Tensor> {
    let shape = view.shape().to_vec();
    let num_elements = shape.iter().product::<usize>();
    let bytes = view.data();

    let width = match view.dtype() {
        Dtype::F32 => 4,
        Dtype::F16 | Dtype::BF16 => 2,
        other => {
            return Err(LowRankError::SafeTensors(format!(
                "{}: unsupported dtype {:?}. Only F32, F16 and BF16 are supported.",
                name, other
            )))
        }
    };

    if bytes.len() != num_elements * width {
        return Err(LowRankError::SafeTensors(format!(
            "{}: {:?} tensor size mismatch: expected {} bytes, got {}",
            name,
            view.dtype(),
            num_elements * width,
            bytes.len()
        )));
    }

    let data: Vec<f32> = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        _ => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
    };

    Tensor::new(data, shape)
}
