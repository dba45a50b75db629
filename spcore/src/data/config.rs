use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::algorithm::compound_poisson::DEFAULT_SIGMA;
use crate::algorithm::particle::ExtractionParams;
use crate::algorithm::threshold::ThresholdParams;
use crate::error::DetectionError;

/// Threshold formula used for one element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionMethod {
    #[serde(rename = "Manual")]
    Manual,
    #[serde(rename = "Currie")]
    Currie,
    #[serde(rename = "Formula_C")]
    FormulaC,
    #[serde(rename = "Compound Poisson LogNormal")]
    CompoundPoissonLogNormal,
    /// `mean + 3 * sqrt(mean)`, used for labels that name no known method
    #[serde(rename = "Fallback")]
    Fallback,
}

impl DetectionMethod {
    pub fn label(&self) -> &'static str {
        match self {
            DetectionMethod::Manual => "Manual",
            DetectionMethod::Currie => "Currie",
            DetectionMethod::FormulaC => "Formula_C",
            DetectionMethod::CompoundPoissonLogNormal => "Compound Poisson LogNormal",
            DetectionMethod::Fallback => "Fallback",
        }
    }

    /// Parses a method label, mapping anything unknown to [`DetectionMethod::Fallback`].
    pub fn from_label(label: &str) -> DetectionMethod {
        label.parse().unwrap_or_else(|_| {
            warn!(label, "unknown detection method, using mean + 3 sqrt(mean)");
            DetectionMethod::Fallback
        })
    }
}

impl FromStr for DetectionMethod {
    type Err = DetectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Manual" => Ok(DetectionMethod::Manual),
            "Currie" => Ok(DetectionMethod::Currie),
            "Formula_C" | "FormulaC" => Ok(DetectionMethod::FormulaC),
            "Compound Poisson LogNormal" | "CompoundPoissonLogNormal" => {
                Ok(DetectionMethod::CompoundPoissonLogNormal)
            }
            "Fallback" => Ok(DetectionMethod::Fallback),
            other => Err(DetectionError::UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Detection settings for one (sample, element) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementConfig {
    pub method: DetectionMethod,
    /// significance level of the threshold, 0 < alpha < 1 (default: 1e-6)
    pub alpha: f64,
    /// when false the threshold is computed once from the overall mean
    pub iterative: bool,
    pub max_iterations: usize,
    pub manual_threshold: f64,
    /// log-std of the single-ion signal (default: 0.47)
    pub sigma: f64,
    pub use_window: bool,
    pub window_size: usize,
    pub apply_smoothing: bool,
    pub smooth_window: usize,
    pub smoothing_iterations: usize,
    pub min_continuous_points: usize,
    pub include: bool,
}

impl Default for ElementConfig {
    fn default() -> Self {
        ElementConfig {
            method: DetectionMethod::CompoundPoissonLogNormal,
            alpha: 1e-6,
            iterative: true,
            max_iterations: 4,
            manual_threshold: 10.0,
            sigma: DEFAULT_SIGMA,
            use_window: false,
            window_size: 5000,
            apply_smoothing: false,
            smooth_window: 3,
            smoothing_iterations: 1,
            min_continuous_points: 1,
            include: true,
        }
    }
}

impl ElementConfig {
    pub fn with_method(method: DetectionMethod) -> Self {
        ElementConfig { method, ..Default::default() }
    }

    #[inline]
    pub fn effective_max_iterations(&self) -> usize {
        if self.iterative {
            self.max_iterations
        } else {
            0
        }
    }

    /// centered window length for background statistics, if enabled
    #[inline]
    pub fn window(&self) -> Option<usize> {
        if self.use_window && self.window_size > 0 {
            Some(self.window_size)
        } else {
            None
        }
    }

    pub fn threshold_params(&self) -> ThresholdParams {
        ThresholdParams {
            method: self.method,
            alpha: self.alpha,
            max_iterations: self.effective_max_iterations(),
            manual_threshold: self.manual_threshold,
            sigma: self.sigma,
            window: self.window(),
        }
    }

    pub fn extraction_params(&self) -> ExtractionParams {
        ExtractionParams {
            min_continuous_points: self.min_continuous_points,
            smoothing: if self.apply_smoothing {
                Some((self.smooth_window, self.smoothing_iterations))
            } else {
                None
            },
        }
    }

    /// Hash over every field that changes threshold estimation or particle extraction.
    ///
    /// Fields are hashed one by one; a new detection field has to be added here.
    pub fn parameter_hash(&self) -> u64 {
        let mut h = FxHasher::default();
        self.method.hash(&mut h);
        self.alpha.to_bits().hash(&mut h);
        self.iterative.hash(&mut h);
        self.max_iterations.hash(&mut h);
        self.manual_threshold.to_bits().hash(&mut h);
        self.sigma.to_bits().hash(&mut h);
        self.use_window.hash(&mut h);
        self.window_size.hash(&mut h);
        self.apply_smoothing.hash(&mut h);
        self.smooth_window.hash(&mut h);
        self.smoothing_iterations.hash(&mut h);
        self.min_continuous_points.hash(&mut h);
        self.include.hash(&mut h);
        h.finish()
    }
}

/// Engine-wide settings that are not tied to a single element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// worker threads for batch detection, `None` uses available parallelism - 1
    pub num_threads: Option<usize>,
    /// signals longer than this are scanned by the scalar extractor
    pub scalar_scan_cutoff: usize,
    pub threshold_cache_capacity: usize,
    pub min_overlap_fraction: f64,
    /// only particles with `snr >= 3` take part in coincidence clustering,
    /// switch off to cluster every extracted region
    pub cluster_valid_only: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            num_threads: None,
            scalar_scan_cutoff: 500,
            threshold_cache_capacity: 10_000,
            min_overlap_fraction: 0.5,
            cluster_valid_only: true,
        }
    }
}

impl EngineConfig {
    pub fn worker_threads(&self) -> usize {
        match self.num_threads {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1),
        }
    }
}

/// Caller-owned element settings for every sample.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSet {
    pub default: ElementConfig,
    pub by_sample: FxHashMap<String, FxHashMap<String, ElementConfig>>,
}

impl ParameterSet {
    pub fn new(default: ElementConfig) -> Self {
        ParameterSet { default, by_sample: FxHashMap::default() }
    }

    pub fn set(&mut self, sample: &str, label: &str, config: ElementConfig) {
        self.by_sample
            .entry(sample.to_string())
            .or_default()
            .insert(label.to_string(), config);
    }

    pub fn get(&self, sample: &str, label: &str) -> Option<&ElementConfig> {
        self.by_sample.get(sample).and_then(|m| m.get(label))
    }

    pub fn get_mut(&mut self, sample: &str, label: &str) -> Option<&mut ElementConfig> {
        self.by_sample.get_mut(sample).and_then(|m| m.get_mut(label))
    }

    /// settings for the pair, or the default settings if none were stored
    pub fn config_for(&self, sample: &str, label: &str) -> &ElementConfig {
        self.get(sample, label).unwrap_or(&self.default)
    }
}
