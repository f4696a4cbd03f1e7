//! Dynamic loss scaling for mixed-precision training
//!
//! Gradients computed in reduced precision underflow easily; scaling the loss
//! up before backward and unscaling gradients before the optimizer step keeps
//! small gradients representable. The scale adapts: halve on overflow, double
//! after a run of clean steps.

use crate::model::Parameter;

const GROWTH_FACTOR: f32 = 2.0;
const BACKOFF_FACTOR: f32 = 0.5;
const GROWTH_INTERVAL: u32 = 2000;
const MIN_SCALE: f32 = 1.0;
const MAX_SCALE: f32 = 65536.0;

/// Dynamic gradient scaler
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    good_steps: u32,
    enabled: bool,
    skipped: u64,
}

impl GradScaler {
    /// Scaler for mixed-precision runs, starting at the given scale
    pub fn new(init_scale: f32) -> Self {
        Self {
            scale: init_scale.clamp(MIN_SCALE, MAX_SCALE),
            good_steps: 0,
            enabled: true,
            skipped: 0,
        }
    }

    /// Pass-through scaler for full-precision runs
    pub fn disabled() -> Self {
        Self {
            scale: 1.0,
            good_steps: 0,
            enabled: false,
            skipped: 0,
        }
    }

    /// Factor to multiply the loss (or upstream gradient) by before backward
    pub fn loss_scale(&self) -> f32 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Divide all stored gradients by the current scale and report whether
    /// every gradient is finite. A `false` return means the step must be
    /// skipped; the caller then reports the outcome via [`GradScaler::update`].
    pub fn unscale_and_check(&self, params: &mut [Parameter]) -> bool {
        let inv = 1.0 / self.loss_scale();
        let mut finite = true;
        for p in params.iter_mut() {
            if let Some(g) = p.grad_mut() {
                g.mapv_inplace(|x| x * inv);
                if !g.iter().all(|x| x.is_finite()) {
                    finite = false;
                }
            }
        }
        finite
    }

    /// Adjust the scale after a step: backoff on overflow, grow after a run
    /// of `GROWTH_INTERVAL` clean steps.
    pub fn update(&mut self, step_was_finite: bool) {
        if !self.enabled {
            return;
        }
        if step_was_finite {
            self.good_steps += 1;
            if self.good_steps >= GROWTH_INTERVAL {
                self.scale = (self.scale * GROWTH_FACTOR).min(MAX_SCALE);
                self.good_steps = 0;
            }
        } else {
            self.scale = (self.scale * BACKOFF_FACTOR).max(MIN_SCALE);
            self.good_steps = 0;
            self.skipped += 1;
        }
    }

    pub fn skipped_steps(&self) -> u64 {
        self.skipped
    }
}
