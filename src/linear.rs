//! Affine layer: `x @ weight.T + bias`.
//!
//! Weights are stored as `[out_features, in_features]` (PyTorch convention),
//! so tensors loaded from a checkpoint can be used without transposing on disk.

use crate::error::{LowRankError, Result};
use crate::tensor::Tensor;

/// Linear transformation layer with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix [out_features, in_features]
    weight: Tensor,
    /// Bias vector [out_features]
    bias: Option<Tensor>,
}

impl Linear {
    /// Create a new linear layer.
    ///
    /// # Arguments
    ///
    /// * `weight` - Weight tensor of shape [out_features, in_features]
    /// * `bias` - Optional bias tensor of shape [out_features]
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if weight is not 2D or bias length differs from out_features.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::linear::Linear;
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// // 4 inputs -> 8 outputs
    /// let weight = Tensor::new(vec![0.0; 32], vec![8, 4]).unwrap();
    /// let bias = Tensor::new(vec![0.0; 8], vec![8]).unwrap();
    /// let linear = Linear::new(weight, Some(bias)).unwrap();
    /// assert_eq!(linear.out_features(), 8);
    /// ```
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![0, 0], // Expect 2D
                got: weight.shape().to_vec(),
            });
        }
        if let Some(b) = &bias {
            if b.ndim() != 1 || b.shape()[0] != weight.shape()[0] {
                return Err(LowRankError::ShapeMismatch {
                    expected: vec![weight.shape()[0]],
                    got: b.shape().to_vec(),
                });
            }
        }
        Ok(Linear { weight, bias })
    }

    /// Number of input features.
    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Number of output features.
    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Forward pass: `[..., in_features] -> [..., out_features]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the last dimension of `x` doesn't match in_features.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_shape = x.shape();
        let in_features = self.in_features();
        let out_features = self.out_features();

        let last = input_shape.last().copied().unwrap_or(0);
        if last != in_features {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![in_features],
                got: vec![last],
            });
        }

        // [..., in] -> [rows, in] @ [in, out] -> [rows, out]
        let rows: usize = input_shape[..input_shape.len() - 1].iter().product();
        let x_2d = x.reshape(&[rows, in_features])?;
        let mut output = x_2d.matmul(&self.weight.transpose()?)?;
        if let Some(bias) = &self.bias {
            output = output.add(bias)?;
        }

        let mut output_shape = input_shape[..input_shape.len() - 1].to_vec();
        output_shape.push(out_features);
        output.reshape(&output_shape)
    }
}
