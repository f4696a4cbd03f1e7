//! CLI surface and run configuration
//!
//! The command line mirrors the hyperparameters of the adapter-CVAE recipe.
//! `TrainOptions::from_cli` validates everything fail-fast and derives the
//! schedule constants tied to the iteration budget: freeze threshold and beta
//! warmup at one sixth, annealing cycle at one third.

use std::path::PathBuf;

use chrono::Local;
use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};
use crate::freeze::AttnMode;

/// Adapter feed-forward wiring options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FfnOption {
    Sequential,
    ParallelAttn,
    ParallelFfn,
    Pfeiffer,
}

/// Adapter weight initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AdapterInit {
    Lora,
    Bert,
    Lisa,
    Other,
}

#[derive(Debug, Parser)]
#[command(name = "afinar", about = "Adapter-based conditional VAE fine-tuning")]
pub struct Cli {
    /// Training split, one `<label>\t<text>` record per line
    #[arg(long, default_value = "data/train.txt")]
    pub train_file: PathBuf,

    /// Validation split, same format
    #[arg(long, default_value = "data/test.txt")]
    pub val_file: PathBuf,

    /// Root directory for run outputs (checkpoints, metrics)
    #[arg(long, default_value = "out")]
    pub out_dir: PathBuf,

    /// Total training iterations
    #[arg(long, default_value_t = 6000)]
    pub iterations: usize,

    /// Batch size schedule (at most two entries; the last applies)
    #[arg(long = "batch-sizes", num_args = 1.., default_values_t = [1usize])]
    pub batch_sizes: Vec<usize>,

    /// Sequence length schedule, parallel to `--batch-sizes`
    #[arg(long = "seq-lens", num_args = 1.., default_values_t = [30usize])]
    pub seq_lens: Vec<usize>,

    /// Max token length of every input sentence
    #[arg(long, default_value_t = 25)]
    pub max_length: usize,

    /// Number of classes for controllable generation
    #[arg(long, default_value_t = 2)]
    pub class_num: usize,

    #[arg(long, default_value_t = 5e-5)]
    pub lr: f32,

    #[arg(long, default_value_t = 0.01)]
    pub weight_decay: f32,

    /// Starting beta of each annealing cycle
    #[arg(long, default_value_t = 1.0)]
    pub beta_0: f32,

    /// Rate floor applied to the KL term
    #[arg(long, default_value_t = 0.0)]
    pub kl_rate: f32,

    /// Posterior-mean variance threshold for the active-unit count
    #[arg(long, default_value_t = 0.01)]
    pub au_delta: f32,

    /// Attention transfer type of the adapter stack
    #[arg(long, value_enum, default_value_t = AttnMode::Prefix)]
    pub attn_mode: AttnMode,

    /// Adapter feed-forward option
    #[arg(long, value_enum, default_value_t = FfnOption::ParallelFfn)]
    pub ffn_option: FfnOption,

    /// Parameter initialization for adapter layers
    #[arg(long, value_enum, default_value_t = AdapterInit::Lora)]
    pub adapter_init: AdapterInit,

    /// Hidden size of the encoder/decoder adapters
    #[arg(long, default_value_t = 256)]
    pub adapter_size: usize,

    /// Latent code dimensionality
    #[arg(long, default_value_t = 768)]
    pub latent_size: usize,

    /// Label embedding size (label-conditioned mode)
    #[arg(long, default_value_t = 8)]
    pub label_emb_size: usize,

    /// Train the regularizer adversarially instead of with KL
    #[arg(long)]
    pub adv_loss: bool,

    /// Condition the latent on the class label
    #[arg(long)]
    pub label_cond: bool,

    /// Checkpoint frozen parameters too, not just trainable ones
    #[arg(long)]
    pub save_all: bool,

    /// Resume from the latest snapshot in the run directory
    #[arg(long)]
    pub load: bool,

    /// Mixed-precision training with dynamic loss scaling
    #[arg(long)]
    pub fp16: bool,

    /// Data-loading worker threads (0 = load on the training thread)
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// Iterations between validation passes
    #[arg(long, default_value_t = 500)]
    pub val_every: usize,

    /// Iterations between checkpoints
    #[arg(long, default_value_t = 5000)]
    pub save_every: usize,

    /// Hard cap on validation batches per pass
    #[arg(long, default_value_t = 20_000)]
    pub max_val_batches: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

/// Validated, derived run configuration
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub train_file: PathBuf,
    pub val_file: PathBuf,
    pub run_dir: PathBuf,
    pub iterations: usize,
    pub batch_size: usize,
    pub seq_len: usize,
    pub max_length: usize,
    pub class_count: usize,
    pub lr: f32,
    pub weight_decay: f32,
    pub beta0: f32,
    pub rate_floor: f32,
    pub au_threshold: f32,
    pub attn_mode: AttnMode,
    pub ffn_option: FfnOption,
    pub adapter_init: AdapterInit,
    pub adapter_size: usize,
    pub latent_size: usize,
    pub label_emb_size: usize,
    pub adversarial: bool,
    pub label_cond: bool,
    pub save_all: bool,
    pub load: bool,
    pub fp16: bool,
    pub workers: usize,
    pub val_every: usize,
    pub save_every: usize,
    pub max_val_batches: usize,
    pub seed: u64,
    // Derived from the iteration budget.
    pub beta_warmup: usize,
    pub cycle: usize,
    pub freeze_threshold: usize,
    pub lr_warmup: usize,
}

impl TrainOptions {
    /// Validate the CLI and derive the budget-tied constants
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.iterations == 0 {
            return Err(Error::Config("iterations must be nonzero".to_string()));
        }
        if cli.class_num == 0 {
            return Err(Error::Config("class_num must be nonzero".to_string()));
        }
        if cli.batch_sizes.len() != cli.seq_lens.len() {
            return Err(Error::Config(format!(
                "batch-sizes has {} entries but seq-lens has {}",
                cli.batch_sizes.len(),
                cli.seq_lens.len()
            )));
        }
        if cli.batch_sizes.len() > 2 {
            return Err(Error::Config(
                "schedules with more than two entries are not supported".to_string(),
            ));
        }
        if cli.batch_sizes.iter().any(|&b| b == 0) {
            return Err(Error::Config("batch sizes must be nonzero".to_string()));
        }
        if cli.max_length < 2 {
            return Err(Error::Config(
                "max_length must be at least 2 to form input/target pairs".to_string(),
            ));
        }
        if !(cli.lr > 0.0) {
            return Err(Error::Config(format!("lr must be positive, got {}", cli.lr)));
        }
        if !(0.0..=1.0).contains(&cli.beta_0) {
            return Err(Error::Config(format!(
                "beta_0 must lie in [0, 1], got {}",
                cli.beta_0
            )));
        }

        // Last schedule entry is the long-sequence regime the run settles in.
        let batch_size = *cli.batch_sizes.last().unwrap_or(&1);
        let seq_len = *cli.seq_lens.last().unwrap_or(&30);

        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let run_dir = cli.out_dir.join(format!("afinar-{stamp}"));

        let sixth = (cli.iterations / 6).max(1);
        Ok(Self {
            train_file: cli.train_file.clone(),
            val_file: cli.val_file.clone(),
            run_dir,
            iterations: cli.iterations,
            batch_size,
            seq_len,
            max_length: cli.max_length,
            class_count: cli.class_num,
            lr: cli.lr,
            weight_decay: cli.weight_decay,
            beta0: cli.beta_0,
            rate_floor: cli.kl_rate,
            au_threshold: cli.au_delta,
            attn_mode: cli.attn_mode,
            ffn_option: cli.ffn_option,
            adapter_init: cli.adapter_init,
            adapter_size: cli.adapter_size,
            latent_size: cli.latent_size,
            label_emb_size: cli.label_emb_size,
            adversarial: cli.adv_loss,
            label_cond: cli.label_cond,
            save_all: cli.save_all,
            load: cli.load,
            fp16: cli.fp16,
            workers: cli.workers,
            val_every: cli.val_every,
            save_every: cli.save_every,
            max_val_batches: cli.max_val_batches,
            seed: cli.seed,
            beta_warmup: sixth,
            cycle: (cli.iterations / 3).max(1),
            freeze_threshold: sixth,
            lr_warmup: sixth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("afinar").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_derive_budget_constants() {
        let cli = parse(&["--iterations", "6000"]);
        let opts = TrainOptions::from_cli(&cli).unwrap();
        assert_eq!(opts.freeze_threshold, 1000);
        assert_eq!(opts.beta_warmup, 1000);
        assert_eq!(opts.cycle, 2000);
        assert_eq!(opts.batch_size, 1);
        assert_eq!(opts.seq_len, 30);
    }

    #[test]
    fn test_two_stage_schedule_uses_last_entry() {
        let cli = parse(&[
            "--batch-sizes", "64", "16", "--seq-lens", "16", "64",
        ]);
        let opts = TrainOptions::from_cli(&cli).unwrap();
        assert_eq!(opts.batch_size, 16);
        assert_eq!(opts.seq_len, 64);
    }

    #[test]
    fn test_schedule_length_mismatch_rejected() {
        let cli = parse(&["--batch-sizes", "8", "4", "--seq-lens", "32"]);
        assert!(TrainOptions::from_cli(&cli).is_err());
    }

    #[test]
    fn test_three_entry_schedule_rejected() {
        let cli = parse(&[
            "--batch-sizes", "8", "4", "2", "--seq-lens", "16", "32", "64",
        ]);
        assert!(TrainOptions::from_cli(&cli).is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let cli = parse(&["--iterations", "0"]);
        assert!(TrainOptions::from_cli(&cli).is_err());
    }

    #[test]
    fn test_invalid_attn_mode_rejected_at_parse() {
        let result =
            Cli::try_parse_from(["afinar", "--attn-mode", "sideways"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_beta_outside_unit_interval_rejected() {
        let cli = parse(&["--beta-0", "1.5"]);
        assert!(TrainOptions::from_cli(&cli).is_err());
    }

    #[test]
    fn test_run_dir_under_out_dir() {
        let cli = parse(&["--out-dir", "/tmp/runs"]);
        let opts = TrainOptions::from_cli(&cli).unwrap();
        assert!(opts.run_dir.starts_with("/tmp/runs"));
    }
}
