use std::iter::once;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::algorithm::smoothing::moving_average;
use crate::data::results::{Particle, MIN_VALID_SNR};

/// signals longer than this are scanned with [`ScalarExtractor`] by default
pub const DEFAULT_SCALAR_CUTOFF: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionParams {
    /// shortest run above threshold that validates a region, values below 1 count as 1
    pub min_continuous_points: usize,
    /// `(window, iterations)` of the moving average used for region boundaries
    pub smoothing: Option<(usize, usize)>,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        ExtractionParams { min_continuous_points: 1, smoothing: None }
    }
}

/// A validated region, indices inclusive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParticleRegion {
    pub left: usize,
    pub right: usize,
    pub peak_index: usize,
    pub max_height: f64,
    pub total_counts: f64,
}

/// Finds particle regions in one trace.
///
/// Regions are maximal runs where `boundary > background`. A region survives if
/// `raw` stays above `threshold` for at least `min_continuous_points`
/// consecutive points and its background-subtracted raw sum is positive.
/// Implementations must return identical regions for identical input.
pub trait ParticleExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn regions(
        &self,
        boundary: &[f64],
        raw: &[f64],
        background: f64,
        threshold: f64,
        min_continuous_points: usize,
    ) -> Vec<ParticleRegion>;

    /// particles of `signal`, left to right
    fn extract(
        &self,
        time: &[f64],
        signal: &[f64],
        background: f64,
        threshold: f64,
        params: &ExtractionParams,
    ) -> Vec<Particle> {
        let smoothed = params
            .smoothing
            .map(|(window, iterations)| moving_average(signal, window, iterations));
        let boundary = smoothed.as_deref().unwrap_or(signal);

        if time.len() != signal.len() {
            warn!(
                time_len = time.len(),
                signal_len = signal.len(),
                "time axis does not match signal, reporting index positions as time"
            );
        }
        let time_at = |i: usize| -> f64 {
            if time.len() == signal.len() {
                time[i]
            } else {
                i as f64
            }
        };

        self.regions(boundary, signal, background, threshold, params.min_continuous_points)
            .into_iter()
            .map(|r| {
                let snr = if threshold > 0.0 {
                    r.max_height / threshold
                } else {
                    0.0
                };
                Particle {
                    peak_time: time_at(r.peak_index),
                    peak_index: r.peak_index,
                    start_time: time_at(r.left),
                    end_time: time_at(r.right),
                    max_height: r.max_height,
                    total_counts: r.total_counts,
                    snr,
                    left_index: r.left,
                    right_index: r.right,
                    is_valid: snr >= MIN_VALID_SNR,
                }
            })
            .collect()
    }
}

/// Single pass over the trace, cheapest for long signals.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScalarExtractor;

/// Edge detection on the padded above-background mask, then per-region reductions.
#[derive(Clone, Copy, Debug, Default)]
pub struct VectorizedExtractor;

impl ParticleExtractor for ScalarExtractor {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn regions(
        &self,
        boundary: &[f64],
        raw: &[f64],
        background: f64,
        threshold: f64,
        min_continuous_points: usize,
    ) -> Vec<ParticleRegion> {
        let n = boundary.len().min(raw.len());
        let min_points = min_continuous_points.max(1);
        let mut regions = Vec::new();

        let mut i = 0;
        while i < n {
            if boundary[i] <= background {
                i += 1;
                continue;
            }

            let start = i;
            while i < n && boundary[i] > background {
                i += 1;
            }
            let end = i - 1;

            let mut run = 0usize;
            let mut longest = 0usize;
            for &x in &raw[start..=end] {
                if x > threshold {
                    run += 1;
                    longest = longest.max(run);
                } else {
                    run = 0;
                }
            }
            if longest < min_points {
                continue;
            }

            let mut peak_index = start;
            let mut max_height = raw[start];
            let mut total_counts = 0.0;
            for j in start..=end {
                if raw[j] > max_height {
                    max_height = raw[j];
                    peak_index = j;
                }
                total_counts += raw[j] - background;
            }

            if total_counts > 0.0 {
                regions.push(ParticleRegion {
                    left: start,
                    right: end,
                    peak_index,
                    max_height,
                    total_counts,
                });
            }
        }
        regions
    }
}

impl ParticleExtractor for VectorizedExtractor {
    fn name(&self) -> &'static str {
        "vectorized"
    }

    fn regions(
        &self,
        boundary: &[f64],
        raw: &[f64],
        background: f64,
        threshold: f64,
        min_continuous_points: usize,
    ) -> Vec<ParticleRegion> {
        let n = boundary.len().min(raw.len());
        let min_points = min_continuous_points.max(1);

        // rising edge at i: region starts at i; falling edge at i: region ends at i - 1
        let (starts, ends): (Vec<(usize, bool)>, Vec<(usize, bool)>) = once(false)
            .chain(boundary[..n].iter().map(|&x| x > background))
            .chain(once(false))
            .tuple_windows()
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, (_, b))| (i, b))
            .partition(|&(_, rising)| rising);

        starts
            .into_iter()
            .zip(ends)
            .filter_map(|((start, _), (stop, _))| {
                let end = stop - 1;
                let region = &raw[start..=end];

                let (_, longest) = region.iter().fold((0usize, 0usize), |(run, best), &x| {
                    let run = if x > threshold { run + 1 } else { 0 };
                    (run, best.max(run))
                });
                if longest < min_points {
                    return None;
                }

                let (peak_offset, max_height) = region
                    .iter()
                    .enumerate()
                    .fold((0usize, region[0]), |(bi, bv), (j, &x)| {
                        if x > bv {
                            (j, x)
                        } else {
                            (bi, bv)
                        }
                    });
                let total_counts = region.iter().fold(0.0, |acc, &x| acc + (x - background));

                if total_counts > 0.0 {
                    Some(ParticleRegion {
                        left: start,
                        right: end,
                        peak_index: start + peak_offset,
                        max_height,
                        total_counts,
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

/// extractor used for a signal of `len` points
pub fn extractor_for(len: usize, scalar_cutoff: usize) -> &'static dyn ParticleExtractor {
    if len > scalar_cutoff {
        &ScalarExtractor
    } else {
        &VectorizedExtractor
    }
}

/// extracts particles from one trace
///
/// Arguments:
///
/// * `time` - acquisition times, same length as `signal`
/// * `signal` - raw intensities
/// * `background` - level that delimits candidate regions
/// * `threshold` - level a region has to exceed for `min_continuous_points` points
/// * `params` - continuity requirement and optional boundary smoothing
///
/// Returns:
///
/// * `Vec<Particle>` - particles in left-to-right order
///
/// # Examples
///
/// ```
/// use spcore::algorithm::particle::{extract_particles, ExtractionParams};
///
/// let time: Vec<f64> = (0..8).map(|i| i as f64 * 0.1).collect();
/// let signal = vec![1.0, 1.0, 12.0, 40.0, 15.0, 1.0, 1.0, 1.0];
/// let particles = extract_particles(&time, &signal, 1.0, 10.0, &ExtractionParams::default());
/// assert_eq!(particles.len(), 1);
/// assert_eq!(particles[0].left_index, 2);
/// assert_eq!(particles[0].right_index, 4);
/// assert!(particles[0].is_valid);
/// ```
pub fn extract_particles(
    time: &[f64],
    signal: &[f64],
    background: f64,
    threshold: f64,
    params: &ExtractionParams,
) -> Vec<Particle> {
    extractor_for(signal.len(), DEFAULT_SCALAR_CUTOFF)
        .extract(time, signal, background, threshold, params)
}
