//! Training step executor and run loop
//!
//! `train_step` is the inner loop contract: zero grads, compose the loss,
//! backward under loss scaling, unscale and overflow-check, clip by global
//! norm, apply the optimizer, update the scaler. `Trainer::run` drives it
//! across epochs with the annealing schedule, the freeze controller, periodic
//! validation, and checkpointing.

use std::fs;
use std::io::Write;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::batch::TokenBatch;
use crate::checkpoint::{latest_path, save_checkpoint, Snapshot};
use crate::config::TrainOptions;
use crate::data::{BatchPrefetcher, ConditionalDataset, LabeledText, Tokenizer};
use crate::error::{Error, Result};
use crate::eval::{run_validation, ValOptions, ValReport};
use crate::freeze::FreezeController;
use crate::loss::compute_loss;
use crate::metrics::MetricsSink;
use crate::model::CvaeModel;
use crate::optim::{clip_grad_norm, AdamW, GradScaler, Optimizer};
use crate::sample::{sample_conditional, SampleOptions};
use crate::schedule::{CyclicalBeta, LrSchedule, WarmupLinearDecayLR};

/// Gradient clipping bound used by every training step
const MAX_GRAD_NORM: f32 = 1.0;

/// Training-side perplexity exponent cap
const TRAIN_PPL_EXP_CAP: f32 = 10.0;

/// Narrow a report scalar for the `f32` metrics sink without landing on
/// infinity (the capped validation perplexities exceed `f32::MAX`).
fn sink_value(v: f64) -> f32 {
    v.min(f64::from(f32::MAX)) as f32
}

/// Per-step scalars handed back for recording
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub loss: f32,
    pub ce: f32,
    pub reg: f32,
    /// Pre-clip global gradient norm; zero when the step was skipped
    pub grad_norm: f32,
    /// Step skipped because scaled gradients overflowed
    pub skipped: bool,
}

/// Execute one optimization step on a prepared batch
pub fn train_step<M: CvaeModel + ?Sized>(
    model: &mut M,
    optimizer: &mut dyn Optimizer,
    scaler: &mut GradScaler,
    batch: &TokenBatch,
    beta: f32,
    rate_floor: f32,
    max_grad_norm: f32,
) -> Result<StepStats> {
    optimizer.zero_grad(model.parameters_mut());
    let breakdown = compute_loss(model, batch, beta, rate_floor, true)?;
    model.backward(scaler.loss_scale())?;

    let finite = scaler.unscale_and_check(model.parameters_mut());
    let mut grad_norm = 0.0;
    if finite {
        grad_norm = clip_grad_norm(model.parameters_mut(), max_grad_norm);
        optimizer.step(model.parameters_mut());
    }
    scaler.update(finite);

    Ok(StepStats {
        loss: breakdown.total,
        ce: breakdown.ce_mean(),
        reg: breakdown.reg.scalar(),
        grad_norm,
        skipped: !finite,
    })
}

/// Mutable loop state, survives across epochs
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainState {
    pub iteration: usize,
    pub epoch: usize,
    pub beta: f32,
    pub tuning_all: bool,
}

/// The full training driver
pub struct Trainer<M: CvaeModel, T: Tokenizer> {
    model: M,
    tokenizer: T,
    optimizer: Box<dyn Optimizer>,
    scaler: GradScaler,
    beta_schedule: CyclicalBeta,
    lr_schedule: Box<dyn LrSchedule>,
    freeze: FreezeController,
    sink: Box<dyn MetricsSink>,
    opts: TrainOptions,
    state: TrainState,
    rng: StdRng,
}

impl<M: CvaeModel, T: Tokenizer> Trainer<M, T> {
    pub fn new(model: M, tokenizer: T, sink: Box<dyn MetricsSink>, opts: TrainOptions) -> Self {
        let optimizer = Box::new(AdamW::new(opts.lr, opts.weight_decay));
        let scaler = if opts.fp16 {
            GradScaler::new(65536.0)
        } else {
            GradScaler::disabled()
        };
        let beta_schedule = CyclicalBeta::new(opts.beta0, opts.beta_warmup, opts.cycle);
        let lr_schedule = Box::new(WarmupLinearDecayLR::new(
            opts.lr,
            opts.lr_warmup,
            opts.iterations,
        ));
        let freeze = FreezeController::standard(
            opts.adversarial,
            opts.label_cond,
            opts.attn_mode,
            opts.freeze_threshold,
        );
        let rng = StdRng::seed_from_u64(opts.seed);
        Self {
            model,
            tokenizer,
            optimizer,
            scaler,
            beta_schedule,
            lr_schedule,
            freeze,
            sink,
            opts,
            state: TrainState::default(),
            rng,
        }
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Run the training loop to the iteration budget
    ///
    /// Epochs over the training split repeat until the budget is reached.
    /// Every `val_every` iterations the validation engine runs; every
    /// `save_every` iterations (and at the end) a snapshot is written to the
    /// run directory.
    pub fn run(
        &mut self,
        train: &ConditionalDataset,
        val: &ConditionalDataset,
    ) -> Result<TrainState> {
        // Full batches are dropped from the tail, so a split smaller than
        // one batch would spin through empty epochs forever.
        if train.len() < self.opts.batch_size {
            return Err(Error::Dataset(format!(
                "training split has {} records, fewer than the batch size {}",
                train.len(),
                self.opts.batch_size
            )));
        }
        fs::create_dir_all(&self.opts.run_dir)?;

        self.freeze.apply_initial(self.model.parameters_mut());
        if self.opts.load {
            let path = latest_path(&self.opts.run_dir);
            if path.exists() {
                let snap = Snapshot::load(&path)?;
                snap.apply(self.model.parameters_mut())?;
                self.state.iteration = snap.iteration;
            }
        }
        self.model.set_training(true);

        'training: loop {
            self.state.epoch += 1;
            let batches: Box<dyn Iterator<Item = Vec<LabeledText>>> = if self.opts.workers > 0 {
                Box::new(BatchPrefetcher::spawn(
                    train.clone(),
                    self.opts.batch_size,
                    true,
                    self.opts.workers * 2,
                ))
            } else {
                Box::new(
                    train
                        .batches(self.opts.batch_size, true)
                        .collect::<Vec<_>>()
                        .into_iter(),
                )
            };

            for records in batches {
                let iteration = self.state.iteration;
                self.state.beta = self.beta_schedule.beta_for(iteration);
                if self.freeze.on_iteration(iteration, self.model.parameters_mut()) {
                    self.state.tuning_all = true;
                }
                self.optimizer.set_lr(self.lr_schedule.lr());

                let batch = TokenBatch::from_records(
                    &records,
                    &self.tokenizer,
                    self.opts.max_length,
                    self.opts.class_count,
                )?;
                let started = Instant::now();
                let stats = train_step(
                    &mut self.model,
                    self.optimizer.as_mut(),
                    &mut self.scaler,
                    &batch,
                    self.state.beta,
                    self.opts.rate_floor,
                    MAX_GRAD_NORM,
                )?;
                let elapsed = started.elapsed().as_secs_f32();

                self.sink.record("train/loss", iteration, stats.loss);
                self.sink.record(
                    "train/ppl",
                    iteration,
                    stats.ce.min(TRAIN_PPL_EXP_CAP).exp(),
                );
                self.sink.record("train/kl", iteration, stats.reg);
                self.sink.record("train/beta", iteration, self.state.beta);
                self.sink.record("train/lr", iteration, self.lr_schedule.lr());
                self.sink
                    .record("train/grad_norm", iteration, stats.grad_norm);
                self.sink.record("train/iter_time", iteration, elapsed);

                self.lr_schedule.step();
                self.state.iteration += 1;

                if self.state.iteration % self.opts.val_every == 0 {
                    self.validate(val)?;
                }
                if self.state.iteration % self.opts.save_every == 0 {
                    save_checkpoint(
                        &self.opts.run_dir,
                        self.state.iteration,
                        self.model.parameters(),
                        self.opts.save_all,
                    )?;
                }
                if self.state.iteration >= self.opts.iterations {
                    break 'training;
                }
            }
        }

        save_checkpoint(
            &self.opts.run_dir,
            self.state.iteration,
            self.model.parameters(),
            self.opts.save_all,
        )?;
        self.sink.flush();
        Ok(self.state)
    }

    /// Run the validation engine, record its report, and emit conditional
    /// samples for qualitative inspection
    pub fn validate(&mut self, val: &ConditionalDataset) -> Result<ValReport> {
        let vopts = ValOptions {
            max_batches: self.opts.max_val_batches,
            max_length: self.opts.max_length,
            class_count: self.opts.class_count,
            au_threshold: self.opts.au_threshold,
        };
        let report = run_validation(
            &mut self.model,
            &self.tokenizer,
            val.batches(self.opts.batch_size, true),
            &vopts,
        )?;

        let iteration = self.state.iteration;
        self.sink.record("val/loss", iteration, report.loss_bpe);
        self.sink
            .record("val/ppl_bpe", iteration, sink_value(report.ppl_bpe));
        self.sink
            .record("val/ppl_word", iteration, sink_value(report.ppl_word));
        self.sink.record("val/reg", iteration, report.reg);
        self.sink
            .record("val/mi", iteration, report.mutual_information);
        self.sink
            .record("val/au", iteration, report.active_units as f32);

        self.write_samples(iteration)?;
        Ok(report)
    }

    // Qualitative conditional samples alongside each validation pass. The
    // file write is best effort like the metrics sink.
    fn write_samples(&mut self, iteration: usize) -> Result<()> {
        let sample_opts = SampleOptions {
            max_length: self.opts.max_length,
            ..SampleOptions::default()
        };
        let samples = sample_conditional(
            &mut self.model,
            &self.tokenizer,
            self.opts.class_count,
            2,
            &sample_opts,
            &mut self.rng,
        )?;
        let path = self
            .opts
            .run_dir
            .join(format!("samples_{iteration:07}.txt"));
        if let Ok(mut file) = fs::File::create(path) {
            for (class, text) in &samples {
                let _ = writeln!(file, "[{class}] {text}");
            }
        }
        Ok(())
    }
}
