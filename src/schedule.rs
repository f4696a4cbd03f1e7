//! Iteration-driven schedules: cyclical beta annealing and learning rate
//!
//! Cyclical annealing counters posterior collapse by periodically re-weakening
//! the regularization pressure: beta ramps toward 1.0 over the last `warmup`
//! iterations of each cycle and snaps back to `beta0` at every cycle boundary.

/// Cyclical annealing schedule for the regularization weight
#[derive(Debug, Clone)]
pub struct CyclicalBeta {
    beta0: f32,
    warmup: usize,
    cycle: usize,
    beta: f32,
}

impl CyclicalBeta {
    /// Create a schedule starting at `beta0` (clamped to at most 1.0)
    pub fn new(beta0: f32, warmup: usize, cycle: usize) -> Self {
        let beta0 = beta0.min(1.0);
        Self {
            beta0,
            warmup,
            cycle,
            beta: beta0,
        }
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    /// Advance to `iteration` and return the beta to use for it
    ///
    /// Exactly at a cycle boundary (`iteration % cycle == 0`) beta resets to
    /// `beta0`; within the final `warmup` iterations of a cycle it steps by
    /// `(1 - beta0) / warmup`, clamped at 1.0. `warmup == 0` never ramps.
    pub fn beta_for(&mut self, iteration: usize) -> f32 {
        if self.cycle > 0 {
            if iteration % self.cycle == 0 {
                self.beta = self.beta0;
            }
            if self.warmup > 0
                && iteration % self.cycle >= self.cycle.saturating_sub(self.warmup)
            {
                let step = (1.0 - self.beta0) / self.warmup as f32;
                self.beta = (self.beta + step).min(1.0);
            }
        }
        self.beta
    }
}

/// Learning-rate schedule trait
pub trait LrSchedule {
    /// Current learning rate
    fn lr(&self) -> f32;

    /// Advance one iteration
    fn step(&mut self);
}

/// Linear warmup to the target rate, then linear decay to zero
///
/// The decay phase spans the remainder of the iteration budget, i.e.
/// `lr(t) = target * (total - t) / (total - warmup)` for `t >= warmup`.
#[derive(Debug, Clone)]
pub struct WarmupLinearDecayLR {
    lr_target: f32,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl WarmupLinearDecayLR {
    pub fn new(lr_target: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            lr_target,
            warmup_steps,
            total_steps: total_steps.max(1),
            current_step: 0,
        }
    }
}

impl LrSchedule for WarmupLinearDecayLR {
    fn lr(&self) -> f32 {
        let t = self.current_step;
        if t < self.warmup_steps {
            return self.lr_target * t as f32 / self.warmup_steps as f32;
        }
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = self.total_steps.saturating_sub(t);
        self.lr_target * remaining as f32 / span as f32
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}
