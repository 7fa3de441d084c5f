//! Activation functions for the projection units.
//!
//! The activation is chosen by name from the config (`"RELU"`, `"GLU"`, ...).
//! `"NONE"` means no activation module at all; the projection unit then goes
//! straight from the linear layer to the group norm.
//!
//! GLU is the only gated variant: it halves the channel dimension, so a
//! projection using it needs a linear layer twice as wide as the embedding.

use crate::error::{LowRankError, Result};
use crate::tensor::Tensor;

/// Default alpha for ELU / CELU when the config doesn't set one.
pub const DEFAULT_ELU_ALPHA: f32 = 1.3;

/// Element-wise (or gated) nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// max(0, x)
    Relu,
    /// tanh(x)
    Tanh,
    /// Gated linear unit over the last dim: `a * sigmoid(b)` where `[a, b] = split(x)`
    Glu,
    /// x if x > 0, else alpha * (exp(x) - 1)
    Elu(f32),
    /// max(0, x) + min(0, alpha * (exp(x / alpha) - 1))
    Celu(f32),
    /// x * 0.5 * (1 + erf(x / sqrt(2)))
    Gelu,
}

impl Activation {
    /// Look up an activation by config name.
    ///
    /// Names are case-insensitive. `"NONE"` (or an empty string) yields `Ok(None)`.
    /// `alpha` is only used by ELU and CELU.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an unknown name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::activation::Activation;
    ///
    /// assert_eq!(Activation::from_name("GLU", 1.3).unwrap(), Some(Activation::Glu));
    /// assert_eq!(Activation::from_name("CELU", 1.3).unwrap(), Some(Activation::Celu(1.3)));
    /// assert_eq!(Activation::from_name("NONE", 1.3).unwrap(), None);
    /// assert!(Activation::from_name("SWISH", 1.3).is_err());
    /// ```
    pub fn from_name(name: &str, alpha: f32) -> Result<Option<Activation>> {
        let act = match name.to_ascii_uppercase().as_str() {
            "" | "NONE" => return Ok(None),
            "RELU" => Activation::Relu,
            "TANH" => Activation::Tanh,
            "GLU" => Activation::Glu,
            "ELU" => Activation::Elu(alpha),
            "CELU" => Activation::Celu(alpha),
            "GELU" => Activation::Gelu,
            other => {
                return Err(LowRankError::InvalidConfig(format!(
                    "unknown activation: {}",
                    other
                )))
            }
        };
        Ok(Some(act))
    }

    /// Whether this activation halves the channel dimension.
    pub fn is_gated(&self) -> bool {
        matches!(self, Activation::Glu)
    }

    /// Apply the activation to `x`.
    ///
    /// For GLU the output's last dimension is half of the input's.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if GLU receives an odd-sized or missing last dimension.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let out = match *self {
            Activation::Relu => x.map(|v| v.max(0.0)),
            Activation::Tanh => x.map(f32::tanh),
            Activation::Elu(alpha) => x.map(|v| if v > 0.0 { v } else { alpha * v.exp_m1() }),
            Activation::Celu(alpha) => {
                x.map(|v| v.max(0.0) + (alpha * (v / alpha).exp_m1()).min(0.0))
            }
            Activation::Gelu => x.map(|v| {
                let vd = v as f64;
                (vd * 0.5 * (1.0 + libm::erf(vd / std::f64::consts::SQRT_2))) as f32
            }),
            Activation::Glu => return glu(x),
        };
        Ok(out)
    }
}

/// Logistic sigmoid: 1 / (1 + exp(-x))
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// GLU over the last dimension.
fn glu(x: &Tensor) -> Result<Tensor> {
    let last_dim = x.ndim().checked_sub(1).ok_or(LowRankError::DimOutOfRange {
        dim: 0,
        ndim: 0,
    })?;
    let channels = x.shape()[last_dim];
    if channels % 2 != 0 {
        return Err(LowRankError::ShapeMismatch {
            expected: vec![channels + 1],
            got: vec![channels],
        });
    }

    let half = channels / 2;
    let a = x.narrow(last_dim, 0, half)?;
    let gate = x.narrow(last_dim, half, half)?.map(sigmoid);
    a.mul(&gate)
}
