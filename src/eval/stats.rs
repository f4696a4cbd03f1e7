//! Validation accumulators
//!
//! One pass over the validation split accumulates everything the report
//! needs: token and word counts for the two perplexities, summed losses,
//! the posterior entropy term, and the pooled posterior parameters that the
//! mutual-information and active-unit diagnostics consume afterwards.

use std::sync::LazyLock;

use ndarray::{concatenate, Array2, ArrayView1, Axis};
use regex::Regex;

use crate::data::Tokenizer;
use crate::error::{Error, Result};
use crate::eval::density::neg_entropy;
use crate::loss::LossBreakdown;

/// Perplexity exponents are capped here to keep early-training reports finite
const PPL_EXP_CAP: f64 = 100.0;

// A word is a run of word characters or a single punctuation mark;
// whitespace separates, it is never counted.
static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+|[^\w\s]").unwrap_or_else(|e| panic!("word regex: {e}")));

/// Count words in a text, punctuation marks included
pub fn word_count(text: &str) -> usize {
    WORD_RE.find_iter(text).count()
}

/// Tokens in a sequence up to and including the first EOS
///
/// With no EOS present the whole row counts.
pub fn bpe_token_count(row: ArrayView1<u32>, eos_id: u32) -> usize {
    match row.iter().position(|&t| t == eos_id) {
        Some(pos) => pos + 1,
        None => row.len(),
    }
}

/// Posterior parameters retained across validation batches
#[derive(Debug, Default, Clone)]
pub struct PosteriorPool {
    means: Vec<Array2<f32>>,
    logvars: Vec<Array2<f32>>,
    rows: usize,
}

impl PosteriorPool {
    pub fn push(&mut self, mean: Array2<f32>, logvar: Array2<f32>) {
        self.rows += mean.nrows();
        self.means.push(mean);
        self.logvars.push(logvar);
    }

    /// Total number of pooled examples
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Stack the per-batch arrays into `[rows, latent_dim]` matrices
    pub fn concat(&self) -> Result<(Array2<f32>, Array2<f32>)> {
        if self.is_empty() {
            return Err(Error::Degenerate(
                "posterior pool is empty; validation saw no batches".to_string(),
            ));
        }
        let mean_views: Vec<_> = self.means.iter().map(Array2::view).collect();
        let logvar_views: Vec<_> = self.logvars.iter().map(Array2::view).collect();
        let means = concatenate(Axis(0), &mean_views)
            .map_err(|e| Error::Model(format!("posterior pool shapes disagree: {e}")))?;
        let logvars = concatenate(Axis(0), &logvar_views)
            .map_err(|e| Error::Model(format!("posterior pool shapes disagree: {e}")))?;
        Ok((means, logvars))
    }
}

/// Scalar summary of one validation pass
#[derive(Debug, Clone, Copy)]
pub struct ValSummary {
    /// Cross-entropy per BPE token
    pub loss_bpe: f32,
    /// Perplexity over BPE tokens (f64: the capped exponent still overflows f32)
    pub ppl_bpe: f64,
    /// Perplexity over whitespace/punctuation words
    pub ppl_word: f64,
    /// Mean regularization term per batch
    pub reg: f32,
}

/// Running accumulators over validation batches
#[derive(Debug, Default)]
pub struct ValStats {
    pub n_examples: usize,
    pub n_batches: usize,
    pub n_tokens_bpe: usize,
    pub n_words: usize,
    logp_sum: f64,
    reg_sum: f64,
    neg_entropy_sum: f64,
    pool: PosteriorPool,
}

impl ValStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one evaluated batch into the accumulators
    ///
    /// `target_ids` is the shifted `[batch, seq-1]` target matrix the loss
    /// was scored on. Both denominators come from it: BPE tokens up to and
    /// including the first EOS of each row, and words counted on the decoded
    /// pre-EOS content, so truncation never inflates the word count past
    /// what the model actually saw.
    pub fn observe_batch<T: Tokenizer + ?Sized>(
        &mut self,
        breakdown: &LossBreakdown,
        target_ids: &Array2<u32>,
        tokenizer: &T,
    ) {
        let eos_id = tokenizer.eos_id();
        let mut batch_bpe = 0usize;
        for row in target_ids.rows() {
            batch_bpe += bpe_token_count(row, eos_id);
            let content: Vec<u32> = row.iter().copied().take_while(|&t| t != eos_id).collect();
            self.n_words += word_count(&tokenizer.decode(&content));
        }
        self.n_tokens_bpe += batch_bpe;
        self.logp_sum += f64::from(breakdown.ce_mean()) * batch_bpe as f64;

        self.reg_sum += f64::from(breakdown.reg.scalar());

        self.n_examples += breakdown.mean.nrows();
        self.n_batches += 1;
        self.neg_entropy_sum += neg_entropy(&breakdown.logvar)
            .iter()
            .map(|&x| f64::from(x))
            .sum::<f64>();
        self.pool
            .push(breakdown.mean.clone(), breakdown.logvar.clone());
    }

    pub fn pool(&self) -> &PosteriorPool {
        &self.pool
    }

    /// Average posterior negative entropy per example
    pub fn avg_neg_entropy(&self) -> f64 {
        if self.n_examples == 0 {
            0.0
        } else {
            self.neg_entropy_sum / self.n_examples as f64
        }
    }

    /// Reduce the accumulators to the scalar report values
    pub fn summarize(&self) -> Result<ValSummary> {
        if self.n_batches == 0 {
            return Err(Error::Degenerate("validation saw no batches".to_string()));
        }
        if self.n_tokens_bpe == 0 || self.n_words == 0 {
            return Err(Error::Degenerate(format!(
                "validation counted {} BPE tokens and {} words; both must be nonzero",
                self.n_tokens_bpe, self.n_words
            )));
        }
        let per_bpe = self.logp_sum / self.n_tokens_bpe as f64;
        let per_word = self.logp_sum / self.n_words as f64;
        Ok(ValSummary {
            loss_bpe: per_bpe as f32,
            ppl_bpe: per_bpe.min(PPL_EXP_CAP).exp(),
            ppl_word: per_word.min(PPL_EXP_CAP).exp(),
            reg: (self.reg_sum / self.n_batches as f64) as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array1, Array2};

    use crate::batch::TokenBatch;
    use crate::data::{Encoding, LabeledText};
    use crate::model::RegTerm;

    /// Maps word `k` of a text to id `k + 1`, truncates, closes with EOS 0.
    /// Decoding renders id `n` as the word `w<n>`.
    struct IdTokenizer;

    impl Tokenizer for IdTokenizer {
        fn encode_batch(&self, texts: &[String], max_length: usize) -> Encoding {
            let rows: Vec<Vec<u32>> = texts
                .iter()
                .map(|t| {
                    let mut ids: Vec<u32> = t
                        .split_whitespace()
                        .enumerate()
                        .map(|(k, _)| k as u32 + 1)
                        .take(max_length - 1)
                        .collect();
                    ids.push(0);
                    ids
                })
                .collect();
            let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(2);
            let mut ids = Array2::zeros((rows.len(), width));
            let mut mask = Array2::from_elem((rows.len(), width), false);
            for (i, row) in rows.iter().enumerate() {
                for (j, &id) in row.iter().enumerate() {
                    ids[[i, j]] = id;
                    mask[[i, j]] = true;
                }
            }
            Encoding { ids, mask }
        }

        fn decode(&self, ids: &[u32]) -> String {
            ids.iter()
                .map(|i| format!("w{i}"))
                .collect::<Vec<_>>()
                .join(" ")
        }

        fn eos_id(&self) -> u32 {
            0
        }
    }

    #[test]
    fn test_word_count_includes_punctuation() {
        assert_eq!(word_count("hello, world!"), 4);
        assert_eq!(word_count("one two three"), 3);
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("  \n "), 0);
        assert_eq!(word_count("don't stop"), 4);
    }

    #[test]
    fn test_bpe_count_stops_at_first_eos() {
        let row = arr1(&[5u32, 8, 0, 0, 3]);
        assert_eq!(bpe_token_count(row.view(), 0), 3);
        let no_eos = arr1(&[5u32, 8, 3]);
        assert_eq!(bpe_token_count(no_eos.view(), 0), 3);
    }

    fn breakdown(ce: &[f32], kl: &[f32], logvar: Array2<f32>) -> LossBreakdown {
        let mean = Array2::zeros(logvar.dim());
        LossBreakdown {
            total: 0.0,
            token_ce: Array1::from_vec(ce.to_vec()),
            reg: RegTerm::Kl(Array1::from_vec(kl.to_vec())),
            mean,
            logvar,
        }
    }

    #[test]
    fn test_summary_normalizes_by_counts() {
        let mut stats = ValStats::new();
        // Shifted target rows: EOS (id 0) terminates both sequences.
        let targets = arr2(&[[7u32, 8, 0], [9, 0, 0]]);
        let bd = breakdown(&[2.0, 2.0, 2.0], &[0.5, 0.5], Array2::zeros((2, 4)));
        stats.observe_batch(&bd, &targets, &IdTokenizer);

        assert_eq!(stats.n_examples, 2);
        assert_eq!(stats.n_tokens_bpe, 5);
        // Decoded pre-EOS content: "w7 w8" and "w9".
        assert_eq!(stats.n_words, 3);

        let s = stats.summarize().unwrap();
        // logp_sum = mean_ce(2.0) * 5 tokens; per-token loss is back at 2.0.
        assert_abs_diff_eq!(s.loss_bpe, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(s.ppl_bpe, 2.0f64.exp(), epsilon = 1e-3);
        assert_abs_diff_eq!(s.ppl_word, (10.0f64 / 3.0).exp(), epsilon = 1e-3);
        assert_abs_diff_eq!(s.reg, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_word_denominator_counts_decoded_tokens_after_truncation() {
        // Eight raw words, but the tokenizer keeps only two plus EOS. The
        // word denominator must follow the decoded targets, not the raw text.
        let records = vec![LabeledText {
            text: "a b c d e f g h".to_string(),
            label: 0,
        }];
        let batch = TokenBatch::from_records(&records, &IdTokenizer, 3, 1).unwrap();
        assert_eq!(batch.target_ids.row(0).to_vec(), vec![2, 0]);

        let bd = breakdown(&[1.0, 1.0], &[0.0], Array2::zeros((1, 2)));
        let mut stats = ValStats::new();
        stats.observe_batch(&bd, &batch.target_ids, &IdTokenizer);
        assert_eq!(stats.n_words, 1);
        assert_eq!(stats.n_tokens_bpe, 2);
    }

    #[test]
    fn test_perplexity_exponent_is_capped() {
        let mut stats = ValStats::new();
        let targets = arr2(&[[7u32, 0]]);
        let bd = breakdown(&[500.0], &[0.0], Array2::zeros((1, 2)));
        stats.observe_batch(&bd, &targets, &IdTokenizer);

        let s = stats.summarize().unwrap();
        assert!(s.ppl_bpe.is_finite());
        assert_abs_diff_eq!(s.ppl_bpe, 100.0f64.exp(), epsilon = 1e30);
    }

    #[test]
    fn test_avg_neg_entropy_matches_closed_form() {
        // Standard-normal posteriors over 2 dims: -0.5*D*ln(2*pi) - D/2.
        let mut stats = ValStats::new();
        let targets = arr2(&[[7u32, 0], [8, 0]]);
        let bd = breakdown(&[1.0, 1.0], &[0.0, 0.0], Array2::zeros((2, 2)));
        stats.observe_batch(&bd, &targets, &IdTokenizer);

        let expected = -(2.0f64 * std::f64::consts::PI).ln() - 1.0;
        assert_abs_diff_eq!(stats.avg_neg_entropy(), expected, epsilon = 1e-5);
    }

    #[test]
    fn test_empty_stats_is_degenerate() {
        let stats = ValStats::new();
        assert!(stats.summarize().is_err());
        assert!(stats.pool().concat().is_err());
    }

    #[test]
    fn test_pool_concatenates_batches() {
        let mut pool = PosteriorPool::default();
        pool.push(Array2::zeros((2, 3)), Array2::zeros((2, 3)));
        pool.push(Array2::ones((1, 3)), Array2::zeros((1, 3)));
        assert_eq!(pool.rows(), 3);
        let (means, logvars) = pool.concat().unwrap();
        assert_eq!(means.dim(), (3, 3));
        assert_eq!(logvars.dim(), (3, 3));
        assert_abs_diff_eq!(means[[2, 0]], 1.0);
    }
}
