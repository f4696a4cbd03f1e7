//! Aggregate-posterior density estimates
//!
//! Importance-weighted mutual information between data and latent code:
//! MI = E_q[log q(z|x)] - E_q[log q(z)], where the aggregate posterior q(z)
//! is approximated by a uniform mixture over the pooled per-example
//! posteriors. Active units measure how many latent dimensions actually vary
//! with the input.

use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::{Error, Result};

const LN_2PI: f32 = 1.837_877_1;

/// Numerically stable `log(sum(exp(values)))`
///
/// All-`-inf` inputs (an empty mixture) collapse to `-inf` rather than NaN.
pub fn log_sum_exp(values: ArrayView1<f32>) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f32 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Per-example negative entropy of a diagonal Gaussian posterior
///
/// `E_q[log q(z|x)] = -0.5 * D * ln(2*pi) - 0.5 * sum_d(1 + logvar_d)`
pub fn neg_entropy(logvar: &Array2<f32>) -> Array1<f32> {
    let d = logvar.ncols() as f32;
    logvar.map_axis(Axis(1), |row| {
        -0.5 * d * LN_2PI - 0.5 * row.iter().map(|&lv| 1.0 + lv).sum::<f32>()
    })
}

/// Log-density of each `z` row under the pooled aggregate posterior
///
/// For each z: `log(1/N * sum_i N(z; mu_i, diag(exp(logvar_i))))`, computed
/// through a stable log-sum-exp over the pool.
pub fn pooled_log_density(
    pool_means: &Array2<f32>,
    pool_logvars: &Array2<f32>,
    z: &Array2<f32>,
) -> Result<Array1<f32>> {
    let n = pool_means.nrows();
    let d = pool_means.ncols();
    if n == 0 {
        return Err(Error::Degenerate("empty posterior pool".to_string()));
    }
    if pool_logvars.dim() != pool_means.dim() || z.ncols() != d {
        return Err(Error::Model(format!(
            "pool {:?}/{:?} and samples {:?} disagree on latent dim",
            pool_means.dim(),
            pool_logvars.dim(),
            z.dim()
        )));
    }

    // Per-component constant: -0.5 * (D * ln(2*pi) + sum_d logvar_d)
    let consts: Array1<f32> =
        pool_logvars.map_axis(Axis(1), |row| -0.5 * (d as f32 * LN_2PI + row.sum()));
    let ln_n = (n as f32).ln();

    let mut out = Array1::zeros(z.nrows());
    let mut log_density = Array1::zeros(n);
    for (zi, z_row) in z.rows().into_iter().enumerate() {
        for (j, (mu, lv)) in pool_means
            .rows()
            .into_iter()
            .zip(pool_logvars.rows())
            .enumerate()
        {
            let mahal: f32 = z_row
                .iter()
                .zip(mu.iter())
                .zip(lv.iter())
                .map(|((&zd, &md), &lvd)| {
                    let dev = zd - md;
                    dev * dev / lvd.exp()
                })
                .sum();
            log_density[j] = consts[j] - 0.5 * mahal;
        }
        out[zi] = log_sum_exp(log_density.view()) - ln_n;
    }
    Ok(out)
}

/// Importance-weighted mutual information over a pooled validation split
///
/// `avg_neg_entropy` is the per-example `E_q[log q(z|x)]` already accumulated
/// while the batches were scored. `sampler` draws one z per posterior row
/// (the model's reparameterization); the aggregate density is evaluated
/// against the full pool.
pub fn mutual_information<F>(
    avg_neg_entropy: f64,
    pool_means: &Array2<f32>,
    pool_logvars: &Array2<f32>,
    mut sampler: F,
) -> Result<f32>
where
    F: FnMut(&Array2<f32>, &Array2<f32>) -> Array2<f32>,
{
    let n = pool_means.nrows();
    if n == 0 {
        return Err(Error::Degenerate("empty posterior pool".to_string()));
    }

    let z = sampler(pool_means, pool_logvars);
    let log_qz = pooled_log_density(pool_means, pool_logvars, &z)?;
    let avg_log_qz = log_qz.iter().map(|&x| f64::from(x)).sum::<f64>() / n as f64;

    Ok((avg_neg_entropy - avg_log_qz) as f32)
}

/// Count latent dimensions whose posterior mean varies across the data
///
/// A unit is active when the variance of its posterior mean over the pool,
/// with an `n - 1` denominator, reaches `threshold`. Returns the count and
/// the per-dimension variances.
pub fn active_units(pool_means: &Array2<f32>, threshold: f32) -> Result<(usize, Array1<f32>)> {
    let n = pool_means.nrows();
    if n < 2 {
        return Err(Error::Degenerate(format!(
            "active-unit variance needs at least 2 pooled examples, got {n}"
        )));
    }
    let mean_of_means = pool_means
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::Degenerate("empty posterior pool".to_string()))?;
    let centered = pool_means - &mean_of_means;
    let var = centered.mapv(|x| x * x).sum_axis(Axis(0)) / (n - 1) as f32;
    let count = var.iter().filter(|&&v| v >= threshold).count();
    Ok((count, var))
}
