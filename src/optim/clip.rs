//! Global-norm gradient clipping

use crate::model::Parameter;

/// Clip gradients so their combined L2 norm does not exceed `max_norm`
///
/// Two passes: first compute the global norm over every stored gradient, then
/// rescale all of them with a single factor when the norm exceeds the bound.
/// Returns the pre-clip norm, which the trainer logs as its gradient-health
/// signal.
pub fn clip_grad_norm(params: &mut [Parameter], max_norm: f32) -> f32 {
    let mut sq_sum = 0.0f64;
    for p in params.iter() {
        if let Some(g) = p.grad() {
            sq_sum += g.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>();
        }
    }
    let total_norm = sq_sum.sqrt() as f32;

    if total_norm > max_norm && total_norm > 0.0 {
        let scale = max_norm / total_norm;
        for p in params.iter_mut() {
            if let Some(g) = p.grad_mut() {
                g.mapv_inplace(|x| x * scale);
            }
        }
    }
    total_norm
}
