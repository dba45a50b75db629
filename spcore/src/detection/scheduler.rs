use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::algorithm::coincidence::CoincidenceClusterer;
use crate::algorithm::particle::extractor_for;
use crate::algorithm::threshold::{error_fallback, ThresholdEstimator};
use crate::data::config::{ElementConfig, EngineConfig, ParameterSet};
use crate::data::results::{Convergence, ElementDetection, SampleDetection};
use crate::data::signal::{validate_signal, Channel, Sample};
use crate::detection::state::{ChangeKind, DetectionState};
use crate::error::{DetectionError, Result};

/// Reported once per finished sample of a batch run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionProgress {
    pub completed: usize,
    pub total: usize,
    pub sample: String,
    pub succeeded: bool,
}

/// What an incremental run touched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalSummary {
    /// samples with at least one element detected again
    pub samples_updated: usize,
    pub elements_detected: usize,
    pub elements_excluded: usize,
    /// the stop flag ended the run before every sample was visited
    pub cancelled: bool,
}

/// Runs threshold estimation, particle extraction and coincidence clustering
/// over samples, either as a parallel batch or incrementally.
#[derive(Clone, Debug, Default)]
pub struct DetectionScheduler {
    config: EngineConfig,
    stop: Arc<AtomicBool>,
}

impl DetectionScheduler {
    pub fn new(config: EngineConfig) -> Self {
        DetectionScheduler { config, stop: Arc::new(AtomicBool::new(false)) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// shared stop flag, checked before each sample is started
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn reset_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn clusterer(&self) -> CoincidenceClusterer {
        CoincidenceClusterer::new(self.config.min_overlap_fraction, self.config.cluster_valid_only)
    }

    fn try_detect_element(
        &self,
        estimator: &mut ThresholdEstimator,
        time: &[f64],
        channel: &Channel,
        config: &ElementConfig,
    ) -> Result<ElementDetection> {
        validate_signal(&channel.label, time, &channel.signal)?;

        let threshold = estimator.estimate(&channel.signal, &config.threshold_params());
        // an empty or all-zero trace has nothing to extract against
        if threshold.convergence == Convergence::Degenerate {
            return Ok(ElementDetection {
                label: channel.label.clone(),
                threshold,
                particles: Vec::new(),
            });
        }

        let extractor = extractor_for(channel.signal.len(), self.config.scalar_scan_cutoff);
        let particles = extractor.extract(
            time,
            &channel.signal,
            threshold.background,
            threshold.threshold,
            &config.extraction_params(),
        );

        Ok(ElementDetection { label: channel.label.clone(), threshold, particles })
    }

    /// detects one element of one sample
    ///
    /// Excluded elements get the excluded result. A failing or panicking
    /// element gets the `mean + 3 * sqrt(mean)` fallback threshold and no
    /// particles, the other elements of the sample are unaffected.
    pub fn detect_element(
        &self,
        estimator: &mut ThresholdEstimator,
        time: &[f64],
        channel: &Channel,
        config: &ElementConfig,
    ) -> ElementDetection {
        if !config.include {
            return ElementDetection::excluded(channel.label.as_str());
        }

        isolate_element(channel, config, || {
            self.try_detect_element(estimator, time, channel, config)
        })
    }

    /// detects every element of `sample` in channel order, then clusters them
    #[tracing::instrument(skip_all, fields(sample = %sample.name))]
    pub fn detect_sample(&self, sample: &Sample, params: &ParameterSet) -> SampleDetection {
        let mut estimator = ThresholdEstimator::new(self.config.threshold_cache_capacity);
        let mut detection = SampleDetection::new(sample.name.as_str());

        for channel in &sample.channels {
            let config = params.config_for(&sample.name, &channel.label);
            detection.upsert(self.detect_element(&mut estimator, &sample.time, channel, config));
        }
        detection.multi_element = self.clusterer().cluster_sample(&detection);

        debug!(
            particles = detection.particle_count(),
            valid = detection.valid_particle_count(),
            multi_element = detection.multi_element.len(),
            "sample detected"
        );
        detection
    }

    fn detect_sample_isolated(
        &self,
        sample: &Sample,
        params: &ParameterSet,
    ) -> Result<SampleDetection> {
        if self.is_stopped() {
            return Err(DetectionError::Cancelled { sample: sample.name.clone() });
        }
        catch_unwind(AssertUnwindSafe(|| self.detect_sample(sample, params))).map_err(|_| {
            error!(sample = %sample.name, "worker panicked during detection");
            DetectionError::WorkerPanicked { sample: sample.name.clone() }
        })
    }

    /// detects all samples in parallel
    ///
    /// Arguments:
    ///
    /// * `samples` - samples to process
    /// * `params` - element settings per sample
    /// * `progress` - called from the worker threads after every finished sample
    ///
    /// Returns:
    ///
    /// * `Result<Vec<(String, Result<SampleDetection>)>>` - one entry per sample in input
    ///   order; `Err` only if the worker pool could not be built
    ///
    /// # Examples
    ///
    /// ```
    /// use spcore::data::config::{DetectionMethod, ElementConfig, EngineConfig, ParameterSet};
    /// use spcore::data::signal::Sample;
    /// use spcore::detection::scheduler::DetectionScheduler;
    ///
    /// let time: Vec<f64> = (0..100).map(|i| i as f64 * 1e-3).collect();
    /// let mut signal = vec![1.0; 100];
    /// signal[50] = 80.0;
    /// let samples = vec![Sample::new("s1", time).with_channel("Ag107", signal)];
    ///
    /// let scheduler = DetectionScheduler::new(EngineConfig::default());
    /// let params = ParameterSet::new(ElementConfig::with_method(DetectionMethod::Currie));
    /// let results = scheduler.detect_all(&samples, &params, None).unwrap();
    /// let detection = results[0].1.as_ref().unwrap();
    /// assert_eq!(detection.get("Ag107").unwrap().particles.len(), 1);
    /// ```
    pub fn detect_all(
        &self,
        samples: &[Sample],
        params: &ParameterSet,
        progress: Option<&(dyn Fn(&DetectionProgress) + Sync)>,
    ) -> Result<Vec<(String, Result<SampleDetection>)>> {
        let num_threads = self.config.worker_threads();
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| DetectionError::ThreadPool(e.to_string()))?;

        let total = samples.len();
        let completed = AtomicUsize::new(0);

        let results: Vec<(String, Result<SampleDetection>)> = pool.install(|| {
            samples
                .par_iter()
                .map(|sample| {
                    let outcome = self.detect_sample_isolated(sample, params);
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(report) = progress {
                        report(&DetectionProgress {
                            completed: done,
                            total,
                            sample: sample.name.clone(),
                            succeeded: outcome.is_ok(),
                        });
                    }
                    (sample.name.clone(), outcome)
                })
                .collect()
        });

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(samples = total, failed, num_threads, "batch detection finished");
        Ok(results)
    }

    /// re-detects only what changed since the last run
    ///
    /// Elements are selected by `state`, elements missing from `store` are
    /// detected as well. Results are merged into `store` by label and every
    /// touched sample is clustered again. Runs on the calling thread.
    pub fn detect_incremental(
        &self,
        samples: &[Sample],
        params: &ParameterSet,
        state: &mut DetectionState,
        store: &mut FxHashMap<String, SampleDetection>,
    ) -> IncrementalSummary {
        let mut estimator = ThresholdEstimator::new(self.config.threshold_cache_capacity);
        let mut summary = IncrementalSummary::default();

        for sample in samples {
            if self.is_stopped() {
                summary.cancelled = true;
                break;
            }

            let mut pending = state.changed_elements(&sample.name, sample.labels(), params);
            let stored = store.get(&sample.name);
            for label in sample.labels() {
                let missing = stored.map_or(true, |s| s.get(label).is_none());
                if missing && !pending.iter().any(|(l, _)| l == label) {
                    pending.push((label.to_string(), ChangeKind::Changed));
                }
            }
            if pending.is_empty() {
                continue;
            }

            let detection = store
                .entry(sample.name.clone())
                .or_insert_with(|| SampleDetection::new(sample.name.as_str()));

            for (label, kind) in &pending {
                let Some(channel) = sample.channel(label) else { continue };
                let config = params.config_for(&sample.name, label);
                let element = self.detect_element(&mut estimator, &sample.time, channel, config);
                if element.threshold.is_excluded() {
                    summary.elements_excluded += 1;
                } else {
                    summary.elements_detected += 1;
                }
                debug!(sample = %sample.name, label = %label, ?kind, "element detected again");
                detection.upsert(element);
            }
            detection.multi_element = self.clusterer().cluster_sample(detection);
            summary.samples_updated += 1;
        }

        info!(
            samples_updated = summary.samples_updated,
            elements_detected = summary.elements_detected,
            elements_excluded = summary.elements_excluded,
            cancelled = summary.cancelled,
            "incremental detection finished"
        );
        summary
    }
}

// runs one element's detection, turning an error or a panic into the fallback result
fn isolate_element<F>(channel: &Channel, config: &ElementConfig, run: F) -> ElementDetection
where
    F: FnOnce() -> Result<ElementDetection>,
{
    match catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(detection)) => return detection,
        Ok(Err(e)) => warn!(
            label = %channel.label,
            error = %e,
            "element detection failed, using fallback threshold"
        ),
        Err(_) => error!(
            label = %channel.label,
            "element detection panicked, using fallback threshold"
        ),
    }

    ElementDetection {
        label: channel.label.clone(),
        threshold: error_fallback(&channel.signal, &config.threshold_params()),
        particles: Vec::new(),
    }
}
