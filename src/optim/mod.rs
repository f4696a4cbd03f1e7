//! Optimizers and gradient hygiene for the training step
//!
//! The trainer drives these through the [`Optimizer`] trait: gradients are
//! unscaled and checked by the [`GradScaler`], clipped by global norm, then
//! applied by [`AdamW`].

mod adamw;
mod clip;
mod scaler;

pub use adamw::AdamW;
pub use clip::clip_grad_norm;
pub use scaler::GradScaler;

use crate::model::Parameter;

/// First-order optimizer over named parameters
///
/// Implementations must skip parameters that are frozen or carry no gradient.
pub trait Optimizer {
    /// Apply one update from the gradients currently stored on `params`
    fn step(&mut self, params: &mut [Parameter]);

    /// Clear all gradients
    fn zero_grad(&self, params: &mut [Parameter]) {
        for p in params {
            p.zero_grad();
        }
    }

    /// Current learning rate
    fn lr(&self) -> f32;

    /// Update the learning rate (driven by the schedule each iteration)
    fn set_lr(&mut self, lr: f32);
}
