//! afinar — training-loop control for adapter-based conditional VAEs
//!
//! The crate drives fine-tuning of a conditional VAE built on a frozen
//! pretrained language model steered by adapters. The model architecture and
//! tokenizer live behind narrow traits ([`model::CvaeModel`],
//! [`data::Tokenizer`]); everything around them is here:
//!
//! - [`loss`]: masked cross-entropy plus beta-weighted regularization with a
//!   rate floor, or the adversarial variant
//! - [`schedule`]: cyclical beta annealing and the LR schedule
//! - [`freeze`]: two-phase parameter freezing
//! - [`optim`]: AdamW, global-norm clipping, dynamic loss scaling
//! - [`trainer`]: the step executor and run loop
//! - [`eval`]: validation with mutual-information and active-unit diagnostics
//! - [`sample`] / [`checkpoint`]: conditional sampling and JSON snapshots

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod freeze;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod sample;
pub mod schedule;
pub mod trainer;

pub use error::{Error, Result};
