//! Two-phase parameter freezing
//!
//! At startup everything outside the always-trainable set (latent projections,
//! posterior heads, conditioning layers) is frozen, leaving the pretrained
//! transformer untouched. Once the configured iteration threshold is reached,
//! the encoder/decoder adapter stacks are unfrozen too and the controller
//! stays in that state for the rest of the run. Strictly monotonic: nothing
//! is ever re-frozen.

use crate::model::Parameter;

/// Attention-transfer mode of the adapter stack
///
/// Only `Prefix` changes freezing behavior here: prefix modules join the
/// second-stage unfreeze set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AttnMode {
    Prefix,
    Adapter,
    Lora,
    None,
}

/// Two-state freeze controller over named parameters
#[derive(Debug, Clone)]
pub struct FreezeController {
    always_trainable: Vec<String>,
    stage_two: Vec<String>,
    threshold: usize,
    tuning_all: bool,
}

impl FreezeController {
    /// Build from explicit substring lists
    pub fn new(always_trainable: Vec<String>, stage_two: Vec<String>, threshold: usize) -> Self {
        Self {
            always_trainable,
            stage_two,
            threshold,
            tuning_all: false,
        }
    }

    /// The standard adapter-CVAE freeze plan
    ///
    /// Always trainable: latent projection, averaged-attention weights,
    /// posterior mean/logvar heads, input/attention fusion projections, the
    /// representation head; plus the discriminator in adversarial mode and
    /// the label embedding when label-conditioning is on. Stage two unfreezes
    /// the encoder/decoder adapters, and prefix modules in prefix mode.
    pub fn standard(
        adversarial: bool,
        label_cond: bool,
        attn_mode: AttnMode,
        threshold: usize,
    ) -> Self {
        let mut always: Vec<String> = [
            "latent_proj",
            "attention_weights",
            "posterior_mean",
            "posterior_logvar",
            "input_proj",
            "attn_proj",
            "lm_head_rep",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        if adversarial {
            always.push("discriminator".to_string());
        }
        if label_cond {
            always.push("label_embedding".to_string());
        }

        let mut stage_two = vec![
            "encoder_adapter".to_string(),
            "decoder_adapter".to_string(),
        ];
        if attn_mode == AttnMode::Prefix {
            stage_two.push("prefix".to_string());
        }

        Self::new(always, stage_two, threshold)
    }

    /// Freeze every parameter whose name matches none of the always-trainable
    /// substrings. Called once before the first iteration.
    pub fn apply_initial(&self, params: &mut [Parameter]) {
        for p in params {
            if !matches_any(&self.always_trainable, p.name()) {
                p.set_trainable(false);
            }
        }
    }

    /// Consult the controller for one iteration
    ///
    /// Fires the second transition exactly once, at the first iteration at or
    /// past the threshold: stage-two modules become trainable in addition to
    /// the always-trainable set, and `tuning_all` flips permanently. Returns
    /// whether the transition fired on this call.
    pub fn on_iteration(&mut self, iteration: usize, params: &mut [Parameter]) -> bool {
        if self.tuning_all || iteration < self.threshold {
            return false;
        }
        for p in params.iter_mut() {
            if matches_any(&self.stage_two, p.name()) {
                p.set_trainable(true);
            }
        }
        self.tuning_all = true;
        true
    }

    pub fn tuning_all(&self) -> bool {
        self.tuning_all
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

fn matches_any(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| name.contains(p.as_str()))
}
