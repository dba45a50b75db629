use serde::{Deserialize, Serialize};
use statrs::distribution::{DiscreteCDF, Poisson};
use tracing::warn;

use crate::algorithm::stats::{
    lognormal_cdf, lognormal_quantile, poisson_pmf_many, sum_iid_lognormals,
    zero_truncated_quantile, LognormalSumMethod,
};

/// log-std of the single-ion signal used when nothing better is known
pub const DEFAULT_SIGMA: f64 = 0.47;

// Poisson mass left out above the largest ion count considered
const TAIL_MASS: f64 = 1e-12;
const DEFAULT_GRID_POINTS: usize = 10_000;

/// Why the compound quantile had to fall back to `lambda + 3 * sqrt(lambda)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantileFallback {
    NonPositiveBackground,
    NonFiniteWeights,
    DegenerateGrid,
    NonFiniteResult,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompoundThreshold {
    pub value: f64,
    pub fallback: Option<QuantileFallback>,
}

impl CompoundThreshold {
    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Simple detection limit used whenever a statistical threshold cannot be computed.
#[inline]
pub fn fallback_threshold(lambda: f64) -> f64 {
    let lambda = if lambda.is_finite() {
        lambda.max(0.0)
    } else {
        0.0
    };
    lambda + 3.0 * lambda.sqrt()
}

/// Background model where the number of detected ions is Poisson distributed and
/// every ion adds a lognormally distributed signal.
///
/// The lognormal is normalised to unit mean (`mu = -sigma^2 / 2`), so the
/// background rate `lambda` is directly comparable to signal intensities.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompoundPoissonLognormal {
    pub sigma: f64,
    pub sum_method: LognormalSumMethod,
    pub grid_points: usize,
}

impl Default for CompoundPoissonLognormal {
    fn default() -> Self {
        CompoundPoissonLognormal {
            sigma: DEFAULT_SIGMA,
            sum_method: LognormalSumMethod::FentonWilkinson,
            grid_points: DEFAULT_GRID_POINTS,
        }
    }
}

impl CompoundPoissonLognormal {
    pub fn new(sigma: f64) -> Self {
        CompoundPoissonLognormal { sigma, ..Default::default() }
    }

    /// log-mean of a single ion's signal
    #[inline]
    pub fn mu(&self) -> f64 {
        -0.5 * self.sigma * self.sigma
    }

    /// detection threshold at significance `alpha` for background rate `lambda_bkgd`
    ///
    /// Arguments:
    ///
    /// * `lambda_bkgd` - Poisson background rate (mean signal)
    /// * `alpha` - false positive rate, the `1 - alpha` quantile is returned
    ///
    /// Returns:
    ///
    /// * `CompoundThreshold` - always finite and non-negative, with the reason
    ///   if the simple `lambda + 3 * sqrt(lambda)` limit had to be used
    ///
    /// # Examples
    ///
    /// ```
    /// use spcore::algorithm::compound_poisson::CompoundPoissonLognormal;
    ///
    /// let model = CompoundPoissonLognormal::new(0.47);
    /// let t = model.threshold(2.0, 1e-6);
    /// assert!(t.value > 2.0);
    /// assert!(!t.is_fallback());
    /// ```
    pub fn threshold(&self, lambda_bkgd: f64, alpha: f64) -> CompoundThreshold {
        let outcome = if !lambda_bkgd.is_finite() {
            Err(QuantileFallback::NonFiniteResult)
        } else if lambda_bkgd <= 0.0 {
            Err(QuantileFallback::NonPositiveBackground)
        } else {
            self.quantile(1.0 - alpha, lambda_bkgd)
        };

        match outcome {
            Ok(value) if value.is_finite() && value >= 0.0 => {
                CompoundThreshold { value, fallback: None }
            }
            Ok(_) => self.fall_back(lambda_bkgd, alpha, QuantileFallback::NonFiniteResult),
            Err(reason) => self.fall_back(lambda_bkgd, alpha, reason),
        }
    }

    fn fall_back(
        &self,
        lambda_bkgd: f64,
        alpha: f64,
        reason: QuantileFallback,
    ) -> CompoundThreshold {
        if reason != QuantileFallback::NonPositiveBackground {
            warn!(
                lambda = lambda_bkgd,
                alpha,
                sigma = self.sigma,
                ?reason,
                "compound Poisson lognormal quantile failed, using lambda + 3 sqrt(lambda)"
            );
        }
        CompoundThreshold {
            value: fallback_threshold(lambda_bkgd),
            fallback: Some(reason),
        }
    }

    fn quantile(&self, q: f64, lambda: f64) -> Result<f64, QuantileFallback> {
        let q0 = zero_truncated_quantile(lambda, q);
        if !q0.is_finite() {
            return Err(QuantileFallback::NonFiniteResult);
        }
        // the zero-ion outcome alone already covers the requested quantile
        if q0 <= 0.0 {
            return Ok(0.0);
        }

        let k_max = upper_ion_count(lambda).ok_or(QuantileFallback::NonFiniteWeights)?;
        let ks: Vec<i64> = (1..=k_max as i64).collect();
        let pmf = poisson_pmf_many(&ks, lambda);

        let (ks, pmf): (Vec<i64>, Vec<f64>) = ks
            .into_iter()
            .zip(pmf)
            .filter(|(_, p)| p.is_finite() && *p > 0.0)
            .unzip();

        let total: f64 = pmf.iter().sum();
        if ks.is_empty() || !total.is_finite() || total <= 0.0 {
            return Err(QuantileFallback::NonFiniteWeights);
        }

        let mu = self.mu();
        let components: Vec<(f64, f64, f64)> = ks
            .iter()
            .zip(pmf.iter())
            .map(|(&k, &p)| {
                let (m, s) = sum_iid_lognormals(k as f64, mu, self.sigma, self.sum_method);
                (p / total, m, s)
            })
            .collect();

        let (_, mu_last, sigma_last) = components[components.len() - 1];
        let upper = lognormal_quantile(q0, mu_last, sigma_last);
        let n = self.grid_points.max(2);
        if !upper.is_finite() || upper <= lambda {
            return Err(QuantileFallback::DegenerateGrid);
        }

        let step = (upper - lambda) / (n - 1) as f64;
        let mixture_cdf = |x: f64| -> f64 {
            components.iter().map(|&(w, m, s)| w * lognormal_cdf(x, m, s)).sum()
        };

        // the mixture cdf is monotone, so the first grid point above q0 is found by bisection
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if mixture_cdf(lambda + step * mid as f64) > q0 {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }

        if lo == n {
            // the largest component dominates the mixture, so its quantile bounds it
            return Ok(upper);
        }
        Ok(lambda + step * lo as f64)
    }
}

// smallest k with P(K <= k) >= 1 - TAIL_MASS
fn upper_ion_count(lambda: f64) -> Option<u64> {
    let dist = Poisson::new(lambda).ok()?;
    let target = 1.0 - TAIL_MASS;

    let mut lo: u64 = 0;
    let mut hi: u64 = (lambda + 20.0 * lambda.sqrt() + 30.0).ceil() as u64;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if dist.cdf(mid) >= target {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Some(lo.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_above_background() {
        let model = CompoundPoissonLognormal::default();
        for &lambda in &[0.05, 0.5, 2.0, 20.0, 150.0] {
            let t = model.threshold(lambda, 1e-6);
            assert!(t.value.is_finite());
            assert!(t.value > lambda, "lambda = {}: {}", lambda, t.value);
            assert!(!t.is_fallback());
        }
    }

    #[test]
    fn test_threshold_non_decreasing_as_alpha_shrinks() {
        let model = CompoundPoissonLognormal::default();
        let alphas = [1e-2, 1e-3, 1e-4, 1e-6, 1e-8];
        for &lambda in &[0.1, 1.0, 5.0, 40.0] {
            let values: Vec<f64> =
                alphas.iter().map(|&a| model.threshold(lambda, a).value).collect();
            for w in values.windows(2) {
                assert!(w[1] >= w[0], "lambda = {}: {:?}", lambda, values);
            }
            assert!(values.iter().all(|v| v.is_finite() && *v >= 0.0));
        }
    }

    #[test]
    fn test_narrow_single_ion_distribution_recovers_poisson_quantile() {
        // with an almost constant single-ion signal the compound model collapses to
        // a plain Poisson: P(K <= 12) = 0.99798 and P(K <= 13) = 0.99930 for lambda = 5
        let model = CompoundPoissonLognormal::new(0.001);
        let t = model.threshold(5.0, 1e-3);
        assert!(!t.is_fallback());
        assert!((t.value - 13.0).abs() < 0.1, "{}", t.value);
    }

    #[test]
    fn test_tiny_background_is_covered_by_zero_ions() {
        let model = CompoundPoissonLognormal::default();
        let t = model.threshold(1e-8, 1e-2);
        assert_eq!(t.value, 0.0);
        assert!(!t.is_fallback());
    }

    #[test]
    fn test_zero_and_non_finite_background_fall_back() {
        let model = CompoundPoissonLognormal::default();

        let zero = model.threshold(0.0, 1e-6);
        assert_eq!(zero.value, 0.0);
        assert_eq!(zero.fallback, Some(QuantileFallback::NonPositiveBackground));

        let negative = model.threshold(-3.0, 1e-6);
        assert_eq!(negative.value, 0.0);

        let nan = model.threshold(f64::NAN, 1e-6);
        assert!(nan.value.is_finite());
        assert!(nan.is_fallback());
    }

    #[test]
    fn test_minimal_grid_stays_finite() {
        // a zero-point grid is bumped to two points
        let model =
            CompoundPoissonLognormal { grid_points: 0, ..CompoundPoissonLognormal::new(1e-9) };
        let t = model.threshold(3.0, 0.2);
        assert!(t.value.is_finite() && t.value >= 0.0);
    }

    #[test]
    fn test_upper_ion_count_covers_tail() {
        let k = upper_ion_count(10.0).unwrap();
        let dist = Poisson::new(10.0).unwrap();
        assert!(dist.cdf(k) >= 1.0 - TAIL_MASS);
        assert!(dist.cdf(k - 1) < 1.0 - TAIL_MASS);
        assert!(upper_ion_count(0.0).is_none());
    }

    #[test]
    fn test_fallback_threshold() {
        assert_eq!(fallback_threshold(4.0), 10.0);
        assert_eq!(fallback_threshold(-1.0), 0.0);
        assert_eq!(fallback_threshold(f64::INFINITY), 0.0);
    }
}
