//! AdamW with decoupled weight decay
//!
//! Classic Adam moment estimation plus weight decay applied directly to the
//! weights before the adaptive update, so decay strength is independent of
//! the gradient magnitude.

use ndarray::Array1;

use super::Optimizer;
use crate::model::Parameter;

/// AdamW optimizer state
///
/// Moment buffers are allocated lazily per parameter slot on the first step
/// that sees a gradient for that slot.
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    t: u64,
    m: Vec<Option<Array1<f32>>>,
    v: Vec<Option<Array1<f32>>>,
}

impl AdamW {
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        Self::with_betas(lr, 0.9, 0.999, 1e-8, weight_decay)
    }

    pub fn with_betas(lr: f32, beta1: f32, beta2: f32, eps: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    fn ensure_slots(&mut self, n: usize) {
        if self.m.len() < n {
            self.m.resize(n, None);
            self.v.resize(n, None);
        }
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [Parameter]) {
        self.ensure_slots(params.len());
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (i, p) in params.iter_mut().enumerate() {
            if !p.is_trainable() {
                continue;
            }
            let Some(grad) = p.grad().cloned() else {
                continue;
            };

            let mut m = self
                .m[i]
                .take()
                .unwrap_or_else(|| Array1::zeros(grad.len()));
            let mut v = self
                .v[i]
                .take()
                .unwrap_or_else(|| Array1::zeros(grad.len()));

            m.zip_mut_with(&grad, |mi, gi| {
                *mi = self.beta1 * *mi + (1.0 - self.beta1) * gi;
            });
            v.zip_mut_with(&grad, |vi, gi| {
                *vi = self.beta2 * *vi + (1.0 - self.beta2) * gi * gi;
            });

            let lr = self.lr;
            let wd = self.weight_decay;
            let eps = self.eps;
            {
                let value = p.value_mut();
                if wd > 0.0 {
                    value.mapv_inplace(|w| w * (1.0 - lr * wd));
                }
                for ((w, mi), vi) in value.iter_mut().zip(m.iter()).zip(v.iter()) {
                    let m_hat = mi / bc1;
                    let v_hat = vi / bc2;
                    *w -= lr * m_hat / (v_hat.sqrt() + eps);
                }
            }

            self.m[i] = Some(m);
            self.v[i] = Some(v);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
