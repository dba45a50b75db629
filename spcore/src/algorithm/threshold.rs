use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::algorithm::compound_poisson::{
    fallback_threshold, CompoundPoissonLognormal, DEFAULT_SIGMA,
};
use crate::algorithm::stats::standard_normal_quantile;
use crate::data::config::DetectionMethod;
use crate::data::results::{BackgroundSource, Convergence, ThresholdResult};
use crate::data::signal::{centered_window, mean, mean_below};

/// iteration stops once the threshold moves by less than this
pub const CONVERGENCE_EPS: f64 = 1e-3;

// alpha is kept inside (0, 1) so that z_alpha stays finite
const MIN_ALPHA: f64 = 1e-15;

// rates up to this are cached in buckets of 1e-9, larger ones by their exact bits
const LAMBDA_BUCKET_LIMIT: f64 = 1e9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdParams {
    pub method: DetectionMethod,
    pub alpha: f64,
    pub max_iterations: usize,
    pub manual_threshold: f64,
    pub sigma: f64,
    /// centered window used for all statistics, `None` for the whole signal
    pub window: Option<usize>,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        ThresholdParams {
            method: DetectionMethod::CompoundPoissonLogNormal,
            alpha: 1e-6,
            max_iterations: 4,
            manual_threshold: 10.0,
            sigma: DEFAULT_SIGMA,
            window: None,
        }
    }
}

/// one-sided standard normal quantile for significance `alpha`
#[inline]
pub fn z_alpha(alpha: f64) -> f64 {
    -standard_normal_quantile(alpha)
}

/// Currie critical level for a Poisson background `lambda`
///
/// Arguments:
///
/// * `lambda` - background rate
/// * `z_a` - standard normal quantile at `1 - alpha`
///
/// Returns:
///
/// * `f64` - `lambda + z_a * sqrt(2 (lambda + eps))` with `eps = 0.5` below
///   a rate of 10, 0 for a non-positive background
pub fn currie_threshold(lambda: f64, z_a: f64) -> f64 {
    if lambda <= 0.0 {
        return 0.0;
    }
    let epsilon = if lambda < 10.0 { 0.5 } else { 0.0 };
    let eta = 2.0;
    lambda + z_a * ((lambda + epsilon) * eta).sqrt()
}

/// "Formula C" critical level with a unit time ratio between sample and blank
pub fn formula_c_threshold(lambda: f64, z_a: f64) -> f64 {
    if lambda <= 0.0 {
        return 0.0;
    }
    let tr = 1.0;
    let z2 = z_a * z_a;
    lambda + z2 / 2.0 * tr + z_a * (z2 / 4.0 * tr * tr + lambda * tr * (1.0 + tr)).sqrt()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum LambdaKey {
    Bucket(i64),
    Bits(u64),
}

impl LambdaKey {
    fn new(lambda: f64) -> Self {
        if lambda.is_finite() && lambda.abs() <= LAMBDA_BUCKET_LIMIT {
            LambdaKey::Bucket((lambda * 1e9).round() as i64)
        } else {
            LambdaKey::Bits(lambda.to_bits())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    lambda: LambdaKey,
    method: DetectionMethod,
    alpha_bits: u64,
    sigma_bits: u64,
}

impl CacheKey {
    fn new(lambda: f64, method: DetectionMethod, alpha: f64, sigma: f64) -> Self {
        CacheKey {
            lambda: LambdaKey::new(lambda),
            method,
            alpha_bits: alpha.to_bits(),
            sigma_bits: sigma.to_bits(),
        }
    }
}

/// Bounded memo table for single-threshold evaluations.
///
/// Oldest entries are evicted first. A capacity of 0 disables caching.
#[derive(Clone, Debug, Default)]
pub struct ThresholdCache {
    capacity: usize,
    entries: FxHashMap<CacheKey, f64>,
    order: VecDeque<CacheKey>,
    hits: u64,
    misses: u64,
}

impl ThresholdCache {
    pub fn new(capacity: usize) -> Self {
        ThresholdCache { capacity, ..Default::default() }
    }

    fn get_or_insert_with<F: FnOnce() -> f64>(&mut self, key: CacheKey, compute: F) -> f64 {
        if let Some(&value) = self.entries.get(&key) {
            self.hits += 1;
            return value;
        }
        self.misses += 1;
        let value = compute();
        if self.capacity == 0 {
            return value;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
        self.entries.insert(key, value);
        self.order.push_back(key);
        value
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Iterative background and threshold solver.
///
/// Each estimator owns its memo table; give every worker its own estimator.
#[derive(Clone, Debug)]
pub struct ThresholdEstimator {
    cache: ThresholdCache,
}

impl Default for ThresholdEstimator {
    fn default() -> Self {
        ThresholdEstimator::new(10_000)
    }
}

impl ThresholdEstimator {
    pub fn new(cache_capacity: usize) -> Self {
        ThresholdEstimator { cache: ThresholdCache::new(cache_capacity) }
    }

    pub fn cache(&self) -> &ThresholdCache {
        &self.cache
    }

    /// threshold for a known background rate, without any refinement
    pub fn single_threshold(&mut self, lambda: f64, params: &ThresholdParams) -> f64 {
        let alpha = params.alpha.clamp(MIN_ALPHA, 1.0 - MIN_ALPHA);
        let sigma = params.sigma;
        match params.method {
            DetectionMethod::Manual => params.manual_threshold,
            DetectionMethod::Fallback => fallback_threshold(lambda),
            method => {
                let key = CacheKey::new(lambda, method, alpha, sigma);
                self.cache.get_or_insert_with(key, || match method {
                    DetectionMethod::Currie => currie_threshold(lambda, z_alpha(alpha)),
                    DetectionMethod::FormulaC => formula_c_threshold(lambda, z_alpha(alpha)),
                    _ => CompoundPoissonLognormal::new(sigma).threshold(lambda, alpha).value,
                })
            }
        }
    }

    /// estimates background and detection threshold of one signal
    ///
    /// Arguments:
    ///
    /// * `signal` - raw intensities
    /// * `params` - method, significance, iteration cap, manual threshold, sigma and window
    ///
    /// Returns:
    ///
    /// * `ThresholdResult` - always structurally valid; empty or all-zero
    ///   signals give `threshold = background = 0`
    ///
    /// # Examples
    ///
    /// ```
    /// use spcore::algorithm::threshold::{ThresholdEstimator, ThresholdParams};
    /// use spcore::data::config::DetectionMethod;
    ///
    /// let signal = vec![2.0, 1.0, 3.0, 2.0, 40.0, 2.0, 1.0, 2.0];
    /// let params = ThresholdParams { method: DetectionMethod::Currie, ..Default::default() };
    /// let result = ThresholdEstimator::default().estimate(&signal, &params);
    /// assert!(result.threshold > result.background);
    /// assert!(result.threshold < 40.0);
    /// ```
    pub fn estimate(&mut self, signal: &[f64], params: &ThresholdParams) -> ThresholdResult {
        let working = centered_window(signal, params.window);
        let overall_mean = mean(working);

        let mut result = ThresholdResult {
            threshold: 0.0,
            background: 0.0,
            lod_counts: 0.0,
            lod_mdl: 0.0,
            iterations_performed: 0,
            convergence: Convergence::Degenerate,
            background_source: None,
            method_used: Some(params.method),
            window_applied: params.window.is_some(),
            window_size_used: params.window,
            overall_mean,
        };

        // an all-zero window inside a nonzero trace is left to the escape path
        if signal.iter().all(|&x| x <= 0.0) {
            debug!(
                method = %params.method,
                "empty or all-zero signal, threshold and background set to 0"
            );
            return result;
        }

        let (threshold, iterations, convergence) = match params.method {
            DetectionMethod::Manual => (params.manual_threshold, 1, Convergence::Manual),
            _ if params.max_iterations == 0 => self.single_pass(overall_mean, params),
            _ => self.iterate(working, overall_mean, params),
        };

        let (background, source) = match mean_below(working, threshold) {
            Some(b) => (b, BackgroundSource::ExcludingPeaks),
            None => (overall_mean, BackgroundSource::FallbackToMean),
        };

        result.threshold = threshold;
        result.background = background;
        result.lod_counts = threshold;
        result.lod_mdl = (threshold - background).max(0.0);
        result.iterations_performed = iterations;
        result.convergence = convergence;
        if convergence != Convergence::Manual {
            result.background_source = Some(source);
        }

        debug!(
            method = %params.method,
            iterations,
            threshold,
            background,
            convergence = %result.convergence_tag(),
            "threshold estimated"
        );
        result
    }

    fn single_pass(&mut self, lambda: f64, params: &ThresholdParams) -> (f64, usize, Convergence) {
        let threshold = self.single_threshold(lambda, params);
        if threshold <= 0.0 || threshold.is_nan() {
            let escape = escape_threshold(lambda);
            warn!(
                method = %params.method,
                lambda,
                escape,
                "non-positive single-pass threshold, using lambda + 3 sqrt(max(lambda, 1))"
            );
            return (escape, 0, Convergence::Escaped { iterations: 0 });
        }
        (threshold, 0, Convergence::SinglePass)
    }

    fn iterate(
        &mut self,
        working: &[f64],
        overall_mean: f64,
        params: &ThresholdParams,
    ) -> (f64, usize, Convergence) {
        let max_iterations = params.max_iterations;
        let mut threshold = f64::INFINITY;
        let mut iterations = 0;

        loop {
            let prev = threshold;
            let lambda = if threshold.is_infinite() {
                overall_mean
            } else {
                mean_below(working, threshold).unwrap_or(overall_mean)
            };

            threshold = self.single_threshold(lambda, params);
            iterations += 1;

            if threshold <= 0.0 || threshold.is_nan() {
                let escape = escape_threshold(lambda);
                warn!(
                    method = %params.method,
                    lambda,
                    iterations,
                    escape,
                    "non-positive threshold, leaving iteration with lambda + 3 sqrt(max(lambda, 1))"
                );
                return (escape, iterations, Convergence::Escaped { iterations });
            }

            if (prev - threshold).abs() <= CONVERGENCE_EPS || iterations >= max_iterations {
                break;
            }
        }

        let convergence = if iterations < max_iterations {
            Convergence::Converged { iterations }
        } else {
            Convergence::MaxIterationsReached { max_iterations }
        };
        (threshold, iterations, convergence)
    }
}

// replacement for a non-positive threshold, never below 3
fn escape_threshold(lambda: f64) -> f64 {
    lambda + 3.0 * lambda.max(1.0).sqrt()
}

/// Result used when processing an element failed: `mean + 3 * sqrt(mean)`, no iterations.
pub fn error_fallback(signal: &[f64], params: &ThresholdParams) -> ThresholdResult {
    let working = centered_window(signal, params.window);
    let finite: Vec<f64> = working.iter().copied().filter(|x| x.is_finite()).collect();
    let background = mean(&finite);
    let threshold = fallback_threshold(background);

    ThresholdResult {
        threshold,
        background,
        lod_counts: threshold,
        lod_mdl: (threshold - background).max(0.0),
        iterations_performed: 0,
        convergence: Convergence::FallbackDueToError,
        background_source: None,
        method_used: Some(params.method),
        window_applied: params.window.is_some(),
        window_size_used: params.window,
        overall_mean: background,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // deterministic background that cycles through 0..=4 with mean 2
    fn background(n: usize) -> Vec<f64> {
        (0..n).map(|i| ((i * 7) % 5) as f64).collect()
    }

    fn params(method: DetectionMethod) -> ThresholdParams {
        ThresholdParams { method, ..Default::default() }
    }

    #[test]
    fn test_currie_and_formula_c() {
        assert_relative_eq!(currie_threshold(4.0, 3.0), 13.0);
        assert_relative_eq!(currie_threshold(16.0, 2.0), 16.0 + 2.0 * 32.0_f64.sqrt());
        assert_relative_eq!(formula_c_threshold(4.0, 3.0), 8.5 + 3.0 * 10.25_f64.sqrt());
        assert_eq!(currie_threshold(0.0, 3.0), 0.0);
        assert_eq!(formula_c_threshold(-1.0, 3.0), 0.0);
    }

    #[test]
    fn test_z_alpha() {
        assert_relative_eq!(z_alpha(0.05), 1.6448536, epsilon = 1e-6);
        assert_relative_eq!(z_alpha(1e-6), 4.7534243, epsilon = 1e-6);
    }

    #[test]
    fn test_manual_threshold_background() {
        let mut estimator = ThresholdEstimator::default();
        let signal = vec![1.0, 2.0, 3.0, 50.0];
        let p = ThresholdParams { manual_threshold: 10.0, ..params(DetectionMethod::Manual) };
        let result = estimator.estimate(&signal, &p);
        assert_eq!(result.threshold, 10.0);
        assert_relative_eq!(result.background, 2.0);
        assert_eq!(result.iterations_performed, 1);
        assert_eq!(result.convergence_tag(), "manual_threshold_with_background_correction");

        // nothing below the manual threshold: overall mean
        let p = ThresholdParams { manual_threshold: 0.5, ..params(DetectionMethod::Manual) };
        let result = estimator.estimate(&signal, &p);
        assert_relative_eq!(result.background, 14.0);
        assert_eq!(result.lod_mdl, 0.0);
    }

    #[test]
    fn test_zero_iterations_single_pass() {
        let mut estimator = ThresholdEstimator::default();
        let signal = background(1000);
        let methods = [
            DetectionMethod::Currie,
            DetectionMethod::FormulaC,
            DetectionMethod::CompoundPoissonLogNormal,
        ];
        for method in methods {
            let p = ThresholdParams { max_iterations: 0, ..params(method) };
            let result = estimator.estimate(&signal, &p);
            assert_eq!(result.iterations_performed, 0);
            assert_eq!(result.convergence, Convergence::SinglePass);
            assert!(result.threshold >= 0.0);
            assert!(result.threshold >= result.background);
        }
    }

    #[test]
    fn test_iteration_excludes_spikes_from_background() {
        let mut estimator = ThresholdEstimator::default();
        let mut signal = background(2000);
        for i in (100..2000).step_by(100) {
            signal[i] = 400.0;
        }
        let p = ThresholdParams { max_iterations: 10, ..params(DetectionMethod::Currie) };
        let result = estimator.estimate(&signal, &p);

        assert!(result.overall_mean > 5.0);
        assert!((result.background - 2.0).abs() < 0.1, "{}", result.background);
        assert!(result.threshold < 400.0);
        assert!(matches!(result.convergence, Convergence::Converged { .. }));
        assert_eq!(result.background_source, Some(BackgroundSource::ExcludingPeaks));
    }

    #[test]
    fn test_iteration_capped_by_max_iterations() {
        let mut estimator = ThresholdEstimator::default();
        let mut signal = background(2000);
        for i in (100..2000).step_by(100) {
            signal[i] = 400.0;
        }
        let p = ThresholdParams { max_iterations: 1, ..params(DetectionMethod::FormulaC) };
        let result = estimator.estimate(&signal, &p);
        assert_eq!(result.iterations_performed, 1);
        assert_eq!(result.convergence, Convergence::MaxIterationsReached { max_iterations: 1 });
    }

    #[test]
    fn test_converged_threshold_is_manual_fixed_point() {
        let mut estimator = ThresholdEstimator::default();
        let mut signal = background(3000);
        signal[1500] = 90.0;
        signal[1501] = 120.0;

        let methods = [
            DetectionMethod::Currie,
            DetectionMethod::FormulaC,
            DetectionMethod::CompoundPoissonLogNormal,
        ];
        for method in methods {
            let iterative = estimator.estimate(&signal, &params(method));
            let manual_params = ThresholdParams {
                manual_threshold: iterative.threshold,
                ..params(DetectionMethod::Manual)
            };
            let manual = estimator.estimate(&signal, &manual_params);
            assert!((manual.background - iterative.background).abs() <= 1e-3);
        }
    }

    #[test]
    fn test_escape_path_for_non_positive_threshold() {
        // the second pass only sees zeros below the first threshold, Currie gives 0
        // and the loop leaves with lambda + 3 sqrt(max(lambda, 1)); this escape is
        // the one place where the threshold is not derived from the method formula
        let mut signal = vec![0.0; 99];
        signal.push(50.0);
        let mut estimator = ThresholdEstimator::default();
        let result = estimator.estimate(&signal, &params(DetectionMethod::Currie));

        assert_eq!(result.convergence, Convergence::Escaped { iterations: 2 });
        assert_relative_eq!(result.threshold, 3.0);
        assert_eq!(result.background, 0.0);
        assert!(result
            .convergence_tag()
            .starts_with("escaped_non_positive_threshold_after_2_iterations"));
    }

    #[test]
    fn test_degenerate_signals() {
        let mut estimator = ThresholdEstimator::default();
        for signal in [vec![], vec![0.0; 50]] {
            let result =
                estimator.estimate(&signal, &params(DetectionMethod::CompoundPoissonLogNormal));
            assert_eq!(result.threshold, 0.0);
            assert_eq!(result.background, 0.0);
            assert_eq!(result.convergence, Convergence::Degenerate);
        }
    }

    #[test]
    fn test_zero_window_in_nonzero_signal_escapes() {
        let mut estimator = ThresholdEstimator::default();
        let mut signal = background(1000);
        for x in signal.iter_mut().skip(450).take(100) {
            *x = 0.0;
        }
        let p = ThresholdParams { window: Some(100), ..params(DetectionMethod::Currie) };
        let result = estimator.estimate(&signal, &p);

        assert_eq!(result.overall_mean, 0.0);
        assert_eq!(result.convergence, Convergence::Escaped { iterations: 1 });
        assert_relative_eq!(result.threshold, 3.0);
        assert_eq!(result.background, 0.0);
    }

    #[test]
    fn test_zero_single_pass_escapes() {
        let mut estimator = ThresholdEstimator::default();
        let mut signal = background(200);
        for x in signal.iter_mut().skip(50).take(100) {
            *x = 0.0;
        }
        let p = ThresholdParams {
            window: Some(100),
            max_iterations: 0,
            ..params(DetectionMethod::FormulaC)
        };
        let result = estimator.estimate(&signal, &p);
        assert_eq!(result.convergence, Convergence::Escaped { iterations: 0 });
        assert_eq!(result.iterations_performed, 0);
        assert_relative_eq!(result.threshold, 3.0);
    }

    #[test]
    fn test_window_restricts_statistics() {
        let mut estimator = ThresholdEstimator::default();
        let mut signal = vec![100.0; 100];
        for x in signal.iter_mut().skip(40).take(20) {
            *x = 2.0;
        }
        let p = ThresholdParams { window: Some(20), ..params(DetectionMethod::Currie) };
        let result = estimator.estimate(&signal, &p);
        assert!(result.window_applied);
        assert_eq!(result.window_size_used, Some(20));
        assert_relative_eq!(result.overall_mean, 2.0);
        assert_relative_eq!(result.background, 2.0);
    }

    #[test]
    fn test_fallback_method() {
        let mut estimator = ThresholdEstimator::default();
        let signal = vec![4.0; 10];
        let p = ThresholdParams { max_iterations: 0, ..params(DetectionMethod::Fallback) };
        let result = estimator.estimate(&signal, &p);
        assert_relative_eq!(result.threshold, 10.0);
    }

    #[test]
    fn test_cache_hits_and_capacity() {
        let mut estimator = ThresholdEstimator::new(2);
        let p = params(DetectionMethod::CompoundPoissonLogNormal);
        let a = estimator.single_threshold(2.0, &p);
        let b = estimator.single_threshold(2.0, &p);
        assert_eq!(a, b);
        assert_eq!(estimator.cache().hits(), 1);
        assert_eq!(estimator.cache().misses(), 1);

        estimator.single_threshold(3.0, &p);
        estimator.single_threshold(4.0, &p);
        assert_eq!(estimator.cache().len(), 2);

        let mut uncached = ThresholdEstimator::new(0);
        uncached.single_threshold(2.0, &p);
        assert!(uncached.cache().is_empty());
    }

    #[test]
    fn test_cache_keeps_huge_rates_apart() {
        let mut estimator = ThresholdEstimator::new(16);
        let p = params(DetectionMethod::Currie);
        let a = estimator.single_threshold(1e10, &p);
        let b = estimator.single_threshold(2e10, &p);
        assert!(b > a);
        assert_eq!(estimator.cache().misses(), 2);
        assert_eq!(estimator.cache().hits(), 0);

        assert_eq!(estimator.single_threshold(2e10, &p), b);
        assert_eq!(estimator.cache().hits(), 1);
        assert_ne!(LambdaKey::new(1e10), LambdaKey::new(1e10 + 1.0));
        assert_eq!(LambdaKey::new(2.0), LambdaKey::new(2.0 + 1e-12));
    }

    #[test]
    fn test_error_fallback() {
        let result = error_fallback(&[4.0, 4.0, f64::NAN, 4.0], &params(DetectionMethod::Currie));
        assert_relative_eq!(result.background, 4.0);
        assert_relative_eq!(result.threshold, 10.0);
        assert_eq!(result.iterations_performed, 0);
        assert_eq!(result.convergence_tag(), "fallback_due_to_error");
    }
}
