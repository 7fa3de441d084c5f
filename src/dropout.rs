//! Inverted dropout.
//!
//! In training mode each element is zeroed with probability `p` and the
//! survivors are scaled by `1 / (1 - p)`, so inference needs no rescaling.
//! In inference mode (the default) dropout is the identity.

use rand::Rng;

use crate::error::{LowRankError, Result};
use crate::tensor::Tensor;

/// Dropout layer.
///
/// The default layer has `p = 0` and is in inference mode.
#[derive(Debug, Clone, Default)]
pub struct Dropout {
    /// Probability of zeroing an element.
    p: f32,
    /// Dropout only fires when training.
    training: bool,
}

impl Dropout {
    /// Create a dropout layer in inference mode.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` unless `0.0 <= p <= 1.0`.
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(LowRankError::InvalidConfig(format!(
                "dropout probability must be in [0, 1], got {}",
                p
            )));
        }
        Ok(Dropout { p, training: false })
    }

    /// Dropout probability.
    pub fn p(&self) -> f32 {
        self.p
    }

    /// Whether the layer is in training mode.
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switch between training and inference mode.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Apply dropout using the thread-local RNG.
    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.forward_with_rng(x, &mut rand::thread_rng())
    }

    /// Apply dropout drawing from the given RNG.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::dropout::Dropout;
    /// use lowrank_attention::tensor::Tensor;
    /// use rand::SeedableRng;
    ///
    /// let mut dropout = Dropout::new(0.5).unwrap();
    /// dropout.set_training(true);
    ///
    /// let x = Tensor::full(&[100], 1.0);
    /// let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    /// let y = dropout.forward_with_rng(&x, &mut rng);
    /// assert!(y.data().iter().all(|&v| v == 0.0 || v == 2.0));
    /// ```
    pub fn forward_with_rng<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Tensor {
        if !self.training || self.p == 0.0 {
            return x.clone();
        }
        if self.p >= 1.0 {
            return x.map(|_| 0.0);
        }

        let scale = 1.0 / (1.0 - self.p);
        x.map(|v| if rng.gen::<f32>() < self.p { 0.0 } else { v * scale })
    }
}
