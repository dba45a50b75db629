use std::f64::consts::SQRT_2;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Discrete, Normal, Poisson};
use statrs::function::erf as sf;

// batches shorter than this are evaluated element-wise with the direct formulas
const PMF_BATCH_CUTOFF: usize = 100;
const QUANTILE_BATCH_CUTOFF: usize = 50;

// Acklam's rational approximation of the standard normal quantile
const ACKLAM_A: [f64; 6] = [
    -3.969683028665376e1,
    2.209460984245205e2,
    -2.759285104469687e2,
    1.383577518672690e2,
    -3.066479806614716e1,
    2.506628277459239,
];
const ACKLAM_B: [f64; 6] = [
    -5.447609879822406e1,
    1.615858368580409e2,
    -1.556989798598866e2,
    6.680131188771972e1,
    -1.328068155288572e1,
    1.0,
];
const ACKLAM_C: [f64; 6] = [
    -7.784894002430293e-3,
    -3.223964580411365e-1,
    -2.400758277161838,
    -2.549732539343734,
    4.374664141464968,
    2.938163982698783,
];
const ACKLAM_D: [f64; 5] = [
    7.784695709041462e-3,
    3.224671290700398e-1,
    2.445134137142996,
    3.754408661907416,
    1.0,
];
const ACKLAM_P_LOW: f64 = 0.02425;
const ACKLAM_P_HIGH: f64 = 1.0 - ACKLAM_P_LOW;

#[inline]
pub fn erf(x: f64) -> f64 {
    sf::erf(x)
}

#[inline]
pub fn erfinv(x: f64) -> f64 {
    sf::erf_inv(x)
}

/// cumulative distribution function of a lognormal with log-mean `mu` and log-std `sigma`
///
/// Arguments:
///
/// * `x` - value at which to evaluate the cdf
/// * `mu` - mean of the underlying normal
/// * `sigma` - standard deviation of the underlying normal
///
/// Returns:
///
/// * `f64` - probability mass below `x`, 0 for `x <= 0`
///
/// # Examples
///
/// ```
/// use spcore::algorithm::stats::lognormal_cdf;
///
/// let p = lognormal_cdf(1.0, 0.0, 0.5);
/// assert!((p - 0.5).abs() < 1e-12);
/// ```
pub fn lognormal_cdf(x: f64, mu: f64, sigma: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let z = x.ln() - mu;
    if sigma <= 0.0 {
        return if z >= 0.0 { 1.0 } else { 0.0 };
    }
    0.5 * sf::erfc(-z / (sigma * SQRT_2))
}

/// quantile function of a lognormal with log-mean `mu` and log-std `sigma`
///
/// Arguments:
///
/// * `q` - probability in [0, 1]
/// * `mu` - mean of the underlying normal
/// * `sigma` - standard deviation of the underlying normal
///
/// Returns:
///
/// * `f64` - value below which a fraction `q` of the mass lies
pub fn lognormal_quantile(q: f64, mu: f64, sigma: f64) -> f64 {
    if q <= 0.0 {
        return 0.0;
    }
    if q >= 1.0 {
        return f64::INFINITY;
    }
    (mu + sigma * probit(q)).exp()
}

// exact standard normal quantile on top of erfc_inv; the branch keeps the
// erfc_inv argument small so that q close to one does not lose precision
#[inline]
fn probit(q: f64) -> f64 {
    if q < 0.5 {
        -SQRT_2 * sf::erfc_inv(2.0 * q)
    } else {
        SQRT_2 * sf::erfc_inv(2.0 * (1.0 - q))
    }
}

/// Poisson probability mass function evaluated by the direct log-factorial recurrence.
///
/// Returns 0 for `k < 0`. A non-positive rate puts all mass on `k = 0`.
pub fn poisson_pmf(k: i64, lambda: f64) -> f64 {
    if k < 0 {
        return 0.0;
    }
    if lambda <= 0.0 {
        return if k == 0 { 1.0 } else { 0.0 };
    }
    if k == 0 {
        return (-lambda).exp();
    }
    let mut log_pmf = k as f64 * lambda.ln() - lambda;
    for i in 1..=k {
        log_pmf -= (i as f64).ln();
    }
    log_pmf.exp()
}

/// Poisson probability mass function over a batch of counts.
///
/// Short batches use the recurrence of [`poisson_pmf`], long batches go through
/// statrs; both agree to floating point tolerance.
pub fn poisson_pmf_many(ks: &[i64], lambda: f64) -> Vec<f64> {
    if ks.len() < PMF_BATCH_CUTOFF || lambda <= 0.0 || !lambda.is_finite() {
        return ks.iter().map(|&k| poisson_pmf(k, lambda)).collect();
    }

    match Poisson::new(lambda) {
        Ok(dist) => ks
            .iter()
            .map(|&k| if k < 0 { 0.0 } else { dist.pmf(k as u64) })
            .collect(),
        Err(_) => ks.iter().map(|&k| poisson_pmf(k, lambda)).collect(),
    }
}

/// standard normal quantile using Acklam's rational approximation
///
/// Arguments:
///
/// * `p` - probability
///
/// Returns:
///
/// * `f64` - `-inf` for `p <= 0`, `+inf` for `p >= 1`, exactly 0 at `p = 0.5`
///
/// # Examples
///
/// ```
/// use spcore::algorithm::stats::standard_normal_quantile;
///
/// assert_eq!(standard_normal_quantile(0.5), 0.0);
/// assert!((standard_normal_quantile(0.975) - 1.959964).abs() < 1e-6);
/// ```
pub fn standard_normal_quantile(p: f64) -> f64 {
    if p.is_nan() {
        return f64::NAN;
    }
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if p == 0.5 {
        return 0.0;
    }

    if p < ACKLAM_P_LOW {
        let z = (-2.0 * p.ln()).sqrt();
        acklam_tail(z)
    } else if p > ACKLAM_P_HIGH {
        let z = (-2.0 * (1.0 - p).ln()).sqrt();
        -acklam_tail(z)
    } else {
        let q = p - 0.5;
        let r = q * q;
        let num = ACKLAM_A.iter().skip(1).fold(ACKLAM_A[0], |acc, c| acc * r + c);
        let den = ACKLAM_B.iter().skip(1).fold(ACKLAM_B[0], |acc, c| acc * r + c);
        q * num / den
    }
}

#[inline]
fn acklam_tail(z: f64) -> f64 {
    let num = ACKLAM_C.iter().skip(1).fold(ACKLAM_C[0], |acc, c| acc * z + c);
    let den = ACKLAM_D.iter().skip(1).fold(ACKLAM_D[0], |acc, c| acc * z + c);
    num / den
}

/// Standard normal quantiles for a batch of probabilities.
///
/// Small batches use [`standard_normal_quantile`], larger ones the statrs
/// inverse cdf. Edge probabilities always take the scalar path.
pub fn standard_normal_quantiles(ps: &[f64]) -> Vec<f64> {
    if ps.len() < QUANTILE_BATCH_CUTOFF {
        return ps.iter().map(|&p| standard_normal_quantile(p)).collect();
    }

    let normal = Normal::new(0.0, 1.0).ok();
    ps.iter()
        .map(|&p| match normal {
            Some(ref n) if p > 0.0 && p < 1.0 && p != 0.5 => n.inverse_cdf(p),
            _ => standard_normal_quantile(p),
        })
        .collect()
}

/// maps a quantile of the full Poisson onto the zero-truncated Poisson
#[inline]
pub fn zero_truncated_quantile(lambda: f64, y: f64) -> f64 {
    let k0 = (-lambda).exp();
    ((y - k0) / (1.0 - k0)).max(0.0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LognormalSumMethod {
    FentonWilkinson,
    Lo,
}

/// approximates the sum of `n` iid lognormal(mu, sigma) variables by a single lognormal
///
/// Arguments:
///
/// * `n` - number of summands, values below 1 are treated as 1
/// * `mu` - log-mean of one summand
/// * `sigma` - log-std of one summand
/// * `method` - moment matching scheme
///
/// Returns:
///
/// * `(f64, f64)` - log-mean and log-std of the approximating lognormal
///
/// # Examples
///
/// ```
/// use spcore::algorithm::stats::{sum_iid_lognormals, LognormalSumMethod};
///
/// let (mu, sigma) = sum_iid_lognormals(1.0, 0.2, 0.47, LognormalSumMethod::FentonWilkinson);
/// assert!((mu - 0.2).abs() < 1e-12);
/// assert!((sigma - 0.47).abs() < 1e-12);
/// ```
pub fn sum_iid_lognormals(n: f64, mu: f64, sigma: f64, method: LognormalSumMethod) -> (f64, f64) {
    let n = n.max(1.0);
    let s2 = sigma * sigma;

    match method {
        LognormalSumMethod::FentonWilkinson => {
            // ln((e^{s2} - 1) / n + 1) without cancellation for large n
            let sigma2_x = (s2.exp_m1() / n).ln_1p();
            let mu_x = n.ln() + mu + 0.5 * (s2 - sigma2_x);
            (mu_x, sigma2_x.sqrt())
        }
        LognormalSumMethod::Lo => {
            // S = n e^{mu + s2/2}, sigma_s^2 = n s2 e^{2(mu + s2/2)} / S^2 = s2 / n
            let sigma2_s = s2 / n;
            let ln_s = n.ln() + mu + 0.5 * s2;
            (ln_s - 0.5 * sigma2_s, sigma2_s.sqrt())
        }
    }
}
