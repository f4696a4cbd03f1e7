//! Validation engine
//!
//! One bounded pass over the held-out split scores the model at full beta
//! with no rate floor, then the pooled posteriors feed the collapse
//! diagnostics: mutual information and active units.

mod density;
mod guard;
mod stats;

pub use density::{active_units, log_sum_exp, mutual_information, neg_entropy, pooled_log_density};
pub use guard::EvalGuard;
pub use stats::{bpe_token_count, word_count, PosteriorPool, ValStats, ValSummary};

use crate::batch::TokenBatch;
use crate::data::{LabeledText, Tokenizer};
use crate::error::Result;
use crate::loss::compute_loss;
use crate::model::CvaeModel;

/// Validation-pass controls
#[derive(Debug, Clone, Copy)]
pub struct ValOptions {
    /// Hard cap on evaluated batches
    pub max_batches: usize,
    /// Truncation length passed to the tokenizer
    pub max_length: usize,
    /// Number of conditioning classes
    pub class_count: usize,
    /// Minimum posterior-mean variance for a latent dimension to count as active
    pub au_threshold: f32,
}

impl ValOptions {
    pub fn new(class_count: usize) -> Self {
        Self {
            max_batches: 20_000,
            max_length: 50,
            class_count,
            au_threshold: 0.01,
        }
    }
}

/// Full validation report for one checkpointable moment
#[derive(Debug, Clone, Copy)]
pub struct ValReport {
    pub loss_bpe: f32,
    pub ppl_bpe: f64,
    pub ppl_word: f64,
    pub reg: f32,
    pub mutual_information: f32,
    pub active_units: usize,
    pub n_examples: usize,
}

/// Score the model over a validation split
///
/// Batches are scored with `beta = 1.0` and no rate floor so the reported
/// loss is the unmodified objective. The model runs in eval mode for the
/// duration and decodes from the posterior mean; latent samples for the
/// mutual-information estimate still go through the model's own
/// reparameterization.
pub fn run_validation<M, T, I>(
    model: &mut M,
    tokenizer: &T,
    batches: I,
    opts: &ValOptions,
) -> Result<ValReport>
where
    M: CvaeModel + ?Sized,
    T: Tokenizer + ?Sized,
    I: IntoIterator<Item = Vec<LabeledText>>,
{
    let mut guard = EvalGuard::new(model);
    let mut stats = ValStats::new();

    for (i, records) in batches.into_iter().enumerate() {
        if i >= opts.max_batches {
            break;
        }
        let batch =
            TokenBatch::from_records(&records, tokenizer, opts.max_length, opts.class_count)?;
        let breakdown = compute_loss(&mut *guard, &batch, 1.0, 0.0, true)?;
        stats.observe_batch(&breakdown, &batch.target_ids, tokenizer);
    }

    let summary = stats.summarize()?;
    let (means, logvars) = stats.pool().concat()?;
    let mi = mutual_information(stats.avg_neg_entropy(), &means, &logvars, |m, lv| {
        guard.reparameterize(m, lv)
    })?;
    let (au, _) = active_units(&means, opts.au_threshold)?;

    Ok(ValReport {
        loss_bpe: summary.loss_bpe,
        ppl_bpe: summary.ppl_bpe,
        ppl_word: summary.ppl_word,
        reg: summary.reg,
        mutual_information: mi,
        active_units: au,
        n_examples: stats.n_examples,
    })
}
