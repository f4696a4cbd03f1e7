//! Conditional sequence sampling
//!
//! Greedy-free decoding from a trained model: logits are filtered with
//! top-k and nucleus (top-p) truncation, then the next token is drawn from
//! the renormalized distribution. Sequences start from the EOS token and end
//! at the first generated EOS or the length cap.

use ndarray::Array1;
use rand::Rng;

use crate::data::Tokenizer;
use crate::error::Result;
use crate::model::CvaeModel;

/// Decoding controls
#[derive(Debug, Clone, Copy)]
pub struct SampleOptions {
    pub top_k: usize,
    pub top_p: f32,
    pub max_length: usize,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            top_k: 100,
            top_p: 0.95,
            max_length: 50,
        }
    }
}

/// Mask logits outside the top-k set and outside the top-p nucleus
///
/// `top_k == 0` disables the k cutoff; `top_p >= 1.0` disables the nucleus
/// cutoff. The highest-probability token always survives.
pub fn filter_top_k_top_p(logits: &mut Array1<f32>, top_k: usize, top_p: f32) {
    let n = logits.len();
    if n == 0 {
        return;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = vec![false; n];
    let k_limit = if top_k == 0 { n } else { top_k.min(n) };

    if top_p < 1.0 {
        // Softmax over the sorted logits, stabilized by the max.
        let max = logits[order[0]];
        let exps: Vec<f32> = order.iter().map(|&i| (logits[i] - max).exp()).collect();
        let z: f32 = exps.iter().sum();

        let mut cum = 0.0f32;
        for (rank, &i) in order.iter().enumerate() {
            if rank >= k_limit {
                break;
            }
            keep[i] = true;
            cum += exps[rank] / z;
            if cum > top_p {
                break;
            }
        }
    } else {
        for &i in order.iter().take(k_limit) {
            keep[i] = true;
        }
    }

    for (i, l) in logits.iter_mut().enumerate() {
        if !keep[i] {
            *l = f32::NEG_INFINITY;
        }
    }
}

/// Draw a token index from filtered logits
pub fn sample_from_logits<R: Rng>(rng: &mut R, logits: &Array1<f32>) -> usize {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let z: f32 = exps.iter().sum();

    let draw: f32 = rng.random_range(0.0..1.0);
    let mut cum = 0.0f32;
    for (i, &e) in exps.iter().enumerate() {
        cum += e / z;
        if draw < cum {
            return i;
        }
    }
    // Rounding can leave cum fractionally below 1; fall back to the argmax.
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map_or(0, |(i, _)| i)
}

/// Generate one sequence conditioned on a class one-hot
///
/// The returned token ids exclude the leading EOS prompt and the terminating
/// EOS, so they decode directly to text.
pub fn sample_sequence<M, R>(
    model: &mut M,
    label_onehot: &Array1<f32>,
    eos_id: u32,
    opts: &SampleOptions,
    rng: &mut R,
) -> Result<Vec<u32>>
where
    M: CvaeModel + ?Sized,
    R: Rng,
{
    let mut prefix = vec![eos_id];
    let mut generated = Vec::new();

    for _ in 0..opts.max_length {
        let mut logits = model.next_token_logits(&prefix, label_onehot)?;
        filter_top_k_top_p(&mut logits, opts.top_k, opts.top_p);
        let next = sample_from_logits(rng, &logits) as u32;
        if next == eos_id {
            break;
        }
        generated.push(next);
        prefix.push(next);
    }
    Ok(generated)
}

/// Sample `per_class` decoded texts for every class label
pub fn sample_conditional<M, T, R>(
    model: &mut M,
    tokenizer: &T,
    class_count: usize,
    per_class: usize,
    opts: &SampleOptions,
    rng: &mut R,
) -> Result<Vec<(usize, String)>>
where
    M: CvaeModel + ?Sized,
    T: Tokenizer + ?Sized,
    R: Rng,
{
    let eos = tokenizer.eos_id();
    let mut out = Vec::with_capacity(class_count * per_class);
    for class in 0..class_count {
        let mut onehot = Array1::zeros(class_count);
        onehot[class] = 1.0;
        for _ in 0..per_class {
            let ids = sample_sequence(model, &onehot, eos, opts, rng)?;
            out.push((class, tokenizer.decode(&ids)));
        }
    }
    Ok(out)
}
