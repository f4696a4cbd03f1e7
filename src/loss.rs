//! Loss composition: masked cross-entropy plus weighted regularization
//!
//! The total loss is `mean(ce) + beta * max(mean(kl), rate_floor)` in the
//! KL-regularized case, or `mean(ce) + beta * g_loss + d_loss` when the model
//! reports an adversarial term. Which formula applies is decided once, by
//! matching on the [`RegTerm`] variant — never by inspecting tensor shapes.
//!
//! Masking happens *before* the cross-entropy: only (position, target) pairs
//! where the attention mask is true contribute, so tokens behind the mask can
//! hold arbitrary ids without touching the loss. An absent mask selects every
//! position.

use crate::batch::TokenBatch;
use crate::model::{CvaeModel, ModelOutput, RegTerm};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2};

/// Everything the loss composition produces
///
/// Validation consumes `mean`/`logvar` separately from the scalar loss, so
/// all of these travel together.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Total loss driving the backward pass
    pub total: f32,
    /// Per-token cross-entropy over the mask-selected positions (no reduction)
    pub token_ce: Array1<f32>,
    /// Raw regularization term as the model reported it
    pub reg: RegTerm,
    /// Posterior means, `[batch, latent_dim]`
    pub mean: Array2<f32>,
    /// Posterior log-variances, `[batch, latent_dim]`
    pub logvar: Array2<f32>,
}

impl LossBreakdown {
    /// Mean cross-entropy over the selected tokens
    pub fn ce_mean(&self) -> f32 {
        self.token_ce.mean().unwrap_or(0.0)
    }
}

/// Forward the model on a batch and compose the loss
pub fn compute_loss<M: CvaeModel + ?Sized>(
    model: &mut M,
    batch: &TokenBatch,
    beta: f32,
    rate_floor: f32,
    from_mean: bool,
) -> Result<LossBreakdown> {
    let output = model.forward(
        &batch.input_ids,
        batch.mask.as_ref(),
        &batch.label_onehot,
        from_mean,
    )?;
    compose_loss(output, &batch.target_ids, batch.mask.as_ref(), beta, rate_floor)
}

/// Compose the total loss from a model output and targets
pub fn compose_loss(
    output: ModelOutput,
    target_ids: &Array2<u32>,
    mask: Option<&Array2<bool>>,
    beta: f32,
    rate_floor: f32,
) -> Result<LossBreakdown> {
    output.validate()?;
    let (batch, seq, vocab) = {
        let sh = output.logits.shape();
        (sh[0], sh[1], sh[2])
    };
    if target_ids.dim() != (batch, seq) {
        return Err(Error::Model(format!(
            "target shape {:?} does not match logits {batch}x{seq}",
            target_ids.dim()
        )));
    }
    if let Some(mask) = mask {
        if mask.dim() != (batch, seq) {
            return Err(Error::Model(format!(
                "mask shape {:?} does not match logits {batch}x{seq}",
                mask.dim()
            )));
        }
    }

    let mut token_ce = Vec::new();
    for b in 0..batch {
        for t in 0..seq {
            if let Some(mask) = mask {
                if !mask[[b, t]] {
                    continue;
                }
            }
            let target = target_ids[[b, t]] as usize;
            if target >= vocab {
                return Err(Error::Model(format!(
                    "target id {target} out of range for vocab {vocab}"
                )));
            }
            let row = output.logits.slice(s![b, t, ..]);
            // Stable log-softmax: ce = logsumexp(row) - row[target]
            let max = row.fold(f32::NEG_INFINITY, |a, &x| a.max(x));
            let lse = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
            token_ce.push(lse - row[target]);
        }
    }
    if token_ce.is_empty() {
        return Err(Error::Degenerate(
            "attention mask selected zero tokens".to_string(),
        ));
    }
    let token_ce = Array1::from(token_ce);
    let ce_mean = token_ce.mean().unwrap_or(0.0);

    let total = match &output.reg {
        RegTerm::Kl(kl) => {
            let kl_mean = kl.mean().unwrap_or(0.0);
            ce_mean + beta * kl_mean.max(rate_floor)
        }
        RegTerm::Adversarial {
            discriminator,
            generator,
        } => ce_mean + beta * generator + discriminator,
    };

    Ok(LossBreakdown {
        total,
        token_ce,
        reg: output.reg,
        mean: output.mean,
        logvar: output.logvar,
    })
}
