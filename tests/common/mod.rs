//! Shared deterministic toy model and tokenizer for integration tests
//!
//! The toy model honors the full `CvaeModel` contract with hand-rolled,
//! fully reproducible arithmetic: logits biased by a trainable head, a
//! posterior whose mean tracks the input tokens, and a closed-form diagonal
//! KL. Gradients are synthetic but flow through every trainable parameter,
//! which is all the loop plumbing needs.

use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use afinar::data::{ConditionalDataset, Encoding, LabeledText, Tokenizer};
use afinar::error::Result;
use afinar::metrics::{MemorySink, MetricsSink};
use afinar::model::{CvaeModel, ModelOutput, Parameter, RegTerm};

use std::sync::{Arc, Mutex};

pub const VOCAB: usize = 16;
pub const LATENT: usize = 4;
pub const EOS: u32 = 0;

pub struct ToyCvae {
    params: Vec<Parameter>,
    training: bool,
    rng: StdRng,
    /// When set, backward produces infinite gradients (overflow injection)
    pub poison_gradients: bool,
}

impl ToyCvae {
    pub fn new(seed: u64) -> Self {
        let params = vec![
            Parameter::new("encoder.h.0.attn.c_attn.weight", Array1::from_elem(8, 0.5)),
            Parameter::new("decoder.h.0.mlp.c_fc.weight", Array1::from_elem(8, 0.5)),
            Parameter::new("encoder_adapter.down.weight", Array1::from_elem(8, 0.1)),
            Parameter::new("decoder_adapter.up.weight", Array1::from_elem(8, 0.1)),
            Parameter::new("prefix.control_trans.weight", Array1::from_elem(4, 0.2)),
            Parameter::new("latent_proj.weight", Array1::from_elem(LATENT, 0.3)),
            Parameter::new("posterior_mean.weight", Array1::from_elem(LATENT, 0.05)),
            Parameter::new("posterior_logvar.weight", Array1::from_elem(LATENT, -1.0)),
            Parameter::new("label_embedding.weight", Array1::from_elem(4, 0.05)),
            Parameter::new("lm_head_rep.bias", Array1::zeros(VOCAB)),
        ];
        Self {
            params,
            training: true,
            rng: StdRng::seed_from_u64(seed),
            poison_gradients: false,
        }
    }

    pub fn param(&self, name: &str) -> &Parameter {
        self.params
            .iter()
            .find(|p| p.name() == name)
            .unwrap_or_else(|| panic!("no parameter named {name}"))
    }

    fn head(&self) -> Array1<f32> {
        self.param("lm_head_rep.bias").value().clone()
    }

    fn gaussian(&mut self) -> f32 {
        // Box-Muller from two uniforms.
        let u1: f32 = self.rng.random_range(f32::EPSILON..1.0);
        let u2: f32 = self.rng.random_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    }
}

impl CvaeModel for ToyCvae {
    fn forward(
        &mut self,
        input_ids: &Array2<u32>,
        _attention_mask: Option<&Array2<bool>>,
        label_onehot: &Array2<f32>,
        _from_mean: bool,
    ) -> Result<ModelOutput> {
        let (batch, seq) = input_ids.dim();
        let head = self.head();
        let pm = self.param("posterior_mean.weight").value().clone();
        let plv = self.param("posterior_logvar.weight").value().clone();

        let mut logits = Array3::zeros((batch, seq, VOCAB));
        for b in 0..batch {
            for t in 0..seq {
                for v in 0..VOCAB {
                    let match_bonus = if input_ids[[b, t]] == v as u32 { 1.0 } else { 0.0 };
                    logits[[b, t, v]] = head[v] + match_bonus;
                }
            }
        }

        // Posterior mean tracks the token content so it varies per example.
        let mut mean = Array2::zeros((batch, LATENT));
        let mut logvar = Array2::zeros((batch, LATENT));
        for b in 0..batch {
            let row_sum: u32 = input_ids.row(b).iter().sum();
            let label_shift = label_onehot.row(b)[0] * 0.1;
            for d in 0..LATENT {
                mean[[b, d]] = pm[d] * (row_sum as f32 / 10.0) + label_shift;
                logvar[[b, d]] = plv[d];
            }
        }

        // Closed-form KL(q || N(0, I)) per example.
        let kl = Array1::from_iter((0..batch).map(|b| {
            (0..LATENT)
                .map(|d| {
                    let m = mean[[b, d]];
                    let lv = logvar[[b, d]];
                    0.5 * (m * m + lv.exp() - 1.0 - lv)
                })
                .sum::<f32>()
        }));

        Ok(ModelOutput {
            logits,
            reg: RegTerm::Kl(kl),
            mean,
            logvar,
        })
    }

    fn reparameterize(&mut self, mean: &Array2<f32>, logvar: &Array2<f32>) -> Array2<f32> {
        let mut z = mean.clone();
        for (zi, &lv) in z.iter_mut().zip(logvar.iter()) {
            let noise = self.gaussian();
            *zi += (0.5 * lv).exp() * noise;
        }
        z
    }

    fn backward(&mut self, upstream: f32) -> Result<()> {
        let grad_value = if self.poison_gradients {
            f32::INFINITY
        } else {
            0.01 * upstream
        };
        for p in &mut self.params {
            if p.is_trainable() {
                let g = Array1::from_elem(p.len(), grad_value);
                p.accumulate_grad(&g);
            }
        }
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn next_token_logits(
        &mut self,
        prefix: &[u32],
        label_onehot: &Array1<f32>,
    ) -> Result<Array1<f32>> {
        let mut logits = self.head();
        logits[1] += 2.0 + label_onehot[0];
        if prefix.len() >= 3 {
            // Steer hard toward EOS so sampling terminates quickly.
            logits[EOS as usize] += 20.0;
        }
        Ok(logits)
    }
}

/// Hash-bucket word tokenizer: ids 1..VOCAB, EOS/pad = 0
pub struct ToyTokenizer;

fn bucket(word: &str) -> u32 {
    let h = word
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    (h % (VOCAB as u32 - 1)) + 1
}

impl Tokenizer for ToyTokenizer {
    fn encode_batch(&self, texts: &[String], max_length: usize) -> Encoding {
        let rows: Vec<Vec<u32>> = texts
            .iter()
            .map(|t| {
                let mut ids: Vec<u32> = t
                    .split_whitespace()
                    .map(bucket)
                    .take(max_length.saturating_sub(1))
                    .collect();
                ids.push(EOS);
                ids
            })
            .collect();
        let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(2);

        let mut ids = Array2::from_elem((rows.len(), width), EOS);
        let mut mask = Array2::from_elem((rows.len(), width), false);
        for (b, row) in rows.iter().enumerate() {
            for (j, &id) in row.iter().enumerate() {
                ids[[b, j]] = id;
                mask[[b, j]] = true;
            }
        }
        Encoding { ids, mask }
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&i| i != EOS)
            .map(|i| format!("t{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn eos_id(&self) -> u32 {
        EOS
    }
}

/// Small two-class dataset with per-record variation
pub fn make_dataset(n: usize) -> ConditionalDataset {
    let records = (0..n)
        .map(|i| LabeledText {
            text: format!("sample text number {i} with a few more words {}", i * 7),
            label: i % 2,
        })
        .collect();
    ConditionalDataset::new(records)
}

/// Metrics sink the test keeps a handle on after the trainer takes ownership
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<MemorySink>>);

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, name: &str) -> Option<f32> {
        self.0.lock().unwrap().latest(name)
    }

    pub fn series_len(&self, name: &str) -> usize {
        self.0.lock().unwrap().series(name).len()
    }

    pub fn series(&self, name: &str) -> Vec<(usize, f32)> {
        self.0.lock().unwrap().series(name).to_vec()
    }
}

impl MetricsSink for SharedSink {
    fn record(&mut self, name: &str, iteration: usize, value: f32) {
        self.0.lock().unwrap().record(name, iteration, value);
    }
}
