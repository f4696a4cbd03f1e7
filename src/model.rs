//! Model contract for the training loop
//!
//! The transformer/adapter architecture is an external collaborator. The
//! trainer only needs the narrow surface defined here: a forward pass that
//! yields logits plus latent posterior parameters, a reparameterization
//! sample, a backward pass that fills parameter gradients, and name-addressable
//! parameters so the freeze controller and checkpointing can operate by
//! substring match.

use crate::{Error, Result};
use ndarray::{Array1, Array2, Array3};

/// A named model parameter with an optional gradient buffer
///
/// Parameters are flat `f32` vectors; shape bookkeeping is the model's
/// concern. The `trainable` flag is what the freeze controller toggles and
/// what the optimizer honors.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    value: Array1<f32>,
    grad: Option<Array1<f32>>,
    trainable: bool,
}

impl Parameter {
    /// Create a trainable parameter
    pub fn new(name: impl Into<String>, value: Array1<f32>) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
            trainable: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Array1<f32> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Array1<f32> {
        &mut self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn grad(&self) -> Option<&Array1<f32>> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Array1<f32>> {
        self.grad.as_mut()
    }

    /// Replace the gradient buffer
    pub fn set_grad(&mut self, grad: Array1<f32>) {
        self.grad = Some(grad);
    }

    /// Add into the gradient buffer, creating it if absent
    pub fn accumulate_grad(&mut self, grad: &Array1<f32>) {
        match &mut self.grad {
            Some(existing) => *existing += grad,
            None => self.grad = Some(grad.clone()),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }
}

/// Regularization term returned by the model's forward pass
///
/// A tagged union rather than a shape inspection: the KL-style term carries
/// one value per example, the adversarial (WAE) variant carries the
/// discriminator/generator pair. Loss composition dispatches on this once.
#[derive(Debug, Clone)]
pub enum RegTerm {
    /// Per-example KL divergence between posterior and prior
    Kl(Array1<f32>),
    /// Adversarial regularization: discriminator and generator losses
    Adversarial { discriminator: f32, generator: f32 },
}

impl RegTerm {
    /// Batch mean of the KL term, or `None` for the adversarial variant
    pub fn kl_mean(&self) -> Option<f32> {
        match self {
            RegTerm::Kl(kl) => kl.mean(),
            RegTerm::Adversarial { .. } => None,
        }
    }

    /// Single scalar for logging: mean KL, or the summed adversarial pair
    pub fn scalar(&self) -> f32 {
        match self {
            RegTerm::Kl(kl) => kl.mean().unwrap_or(0.0),
            RegTerm::Adversarial {
                discriminator,
                generator,
            } => discriminator + generator,
        }
    }
}

/// Output of one model forward pass
///
/// `logits` is `[batch, seq, vocab]`; `mean` and `logvar` are the diagonal
/// Gaussian posterior parameters, `[batch, latent_dim]` each.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub logits: Array3<f32>,
    pub reg: RegTerm,
    pub mean: Array2<f32>,
    pub logvar: Array2<f32>,
}

impl ModelOutput {
    /// Check the internal shape invariants (batch dims agree, mean/logvar
    /// have the same latent dimensionality).
    pub fn validate(&self) -> Result<()> {
        let batch = self.logits.shape()[0];
        if self.mean.nrows() != batch || self.logvar.nrows() != batch {
            return Err(Error::Model(format!(
                "posterior batch {}x{} does not match logits batch {batch}",
                self.mean.nrows(),
                self.logvar.nrows()
            )));
        }
        if self.mean.ncols() != self.logvar.ncols() {
            return Err(Error::Model(format!(
                "mean dim {} != logvar dim {}",
                self.mean.ncols(),
                self.logvar.ncols()
            )));
        }
        Ok(())
    }
}

/// The conditional VAE model seen by the trainer
///
/// Implementations own the architecture, the autograd state for the most
/// recent forward pass, and their sampling RNG. The trainer drives this
/// interface and nothing else.
pub trait CvaeModel {
    /// Run the model on a batch of token ids
    ///
    /// * `attention_mask` - `true` marks valid positions; `None` means every
    ///   position is valid
    /// * `label_onehot` - `[batch, class_count]` one-hot class conditioning
    /// * `from_mean` - decode from the posterior mean instead of a sample
    fn forward(
        &mut self,
        input_ids: &Array2<u32>,
        attention_mask: Option<&Array2<bool>>,
        label_onehot: &Array2<f32>,
        from_mean: bool,
    ) -> Result<ModelOutput>;

    /// Draw one latent sample per row: `mean + exp(logvar/2) * noise`
    fn reparameterize(&mut self, mean: &Array2<f32>, logvar: &Array2<f32>) -> Array2<f32>;

    /// Backpropagate the most recent forward pass
    ///
    /// `upstream` is the gradient of the (possibly scaled) loss with respect
    /// to the unscaled loss; gradients accumulate into the parameters.
    fn backward(&mut self, upstream: f32) -> Result<()>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// Toggle training mode (dropout etc. are the model's business)
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Next-token logits for label-conditioned sampling
    fn next_token_logits(&mut self, prefix: &[u32], label_onehot: &Array1<f32>)
        -> Result<Array1<f32>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_parameter_grad_accumulation() {
        let mut p = Parameter::new("adapter.w", arr1(&[1.0, 2.0]));
        assert!(p.grad().is_none());

        p.accumulate_grad(&arr1(&[0.5, 0.5]));
        p.accumulate_grad(&arr1(&[0.5, 1.0]));
        assert_eq!(p.grad().unwrap(), &arr1(&[1.0, 1.5]));

        p.zero_grad();
        assert!(p.grad().is_none());
    }

    #[test]
    fn test_parameter_trainable_flag() {
        let mut p = Parameter::new("encoder.h.0.weight", arr1(&[0.0]));
        assert!(p.is_trainable());
        p.set_trainable(false);
        assert!(!p.is_trainable());
    }

    #[test]
    fn test_reg_term_scalar() {
        let kl = RegTerm::Kl(arr1(&[1.0, 3.0]));
        assert_eq!(kl.scalar(), 2.0);
        assert_eq!(kl.kl_mean(), Some(2.0));

        let adv = RegTerm::Adversarial {
            discriminator: 0.25,
            generator: 0.5,
        };
        assert_eq!(adv.scalar(), 0.75);
        assert!(adv.kl_mean().is_none());
    }

    #[test]
    fn test_model_output_validate_mismatch() {
        let out = ModelOutput {
            logits: Array3::zeros((2, 3, 5)),
            reg: RegTerm::Kl(arr1(&[0.0, 0.0])),
            mean: Array2::zeros((3, 4)),
            logvar: Array2::zeros((2, 4)),
        };
        assert!(out.validate().is_err());
    }
}
