use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::config::DetectionMethod;

/// particles at or above this signal-to-noise ratio are reported as valid
pub const MIN_VALID_SNR: f64 = 3.0;

/// Where the reported background level came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackgroundSource {
    /// mean of the points below the final threshold
    ExcludingPeaks,
    /// no point was below the threshold, the overall mean was used
    FallbackToMean,
}

impl BackgroundSource {
    fn tag(&self) -> &'static str {
        match self {
            BackgroundSource::ExcludingPeaks => "background_calculated_excluding_peaks",
            BackgroundSource::FallbackToMean => "background_fallback_to_mean",
        }
    }
}

/// How the threshold search ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Convergence {
    Manual,
    /// `max_iterations == 0`, threshold taken from the overall mean
    SinglePass,
    Converged { iterations: usize },
    MaxIterationsReached { max_iterations: usize },
    /// a non-positive threshold stopped the loop early and
    /// `lambda + 3 * sqrt(max(lambda, 1))` was used instead
    Escaped { iterations: usize },
    /// empty or all-zero signal
    Degenerate,
    Excluded,
    FallbackDueToError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub threshold: f64,
    pub background: f64,
    pub lod_counts: f64,
    pub lod_mdl: f64,
    pub iterations_performed: usize,
    pub convergence: Convergence,
    pub background_source: Option<BackgroundSource>,
    /// `None` for excluded elements
    pub method_used: Option<DetectionMethod>,
    pub window_applied: bool,
    pub window_size_used: Option<usize>,
    pub overall_mean: f64,
}

impl ThresholdResult {
    /// result for an element the caller switched off
    pub fn excluded() -> Self {
        ThresholdResult {
            threshold: 0.0,
            background: 0.0,
            lod_counts: 0.0,
            lod_mdl: 0.0,
            iterations_performed: 0,
            convergence: Convergence::Excluded,
            background_source: None,
            method_used: None,
            window_applied: false,
            window_size_used: None,
            overall_mean: 0.0,
        }
    }

    #[inline]
    pub fn is_excluded(&self) -> bool {
        self.convergence == Convergence::Excluded
    }

    /// Text tag describing the outcome, e.g.
    /// `converged_after_2_iterations_with_background_calculated_excluding_peaks`.
    pub fn convergence_tag(&self) -> String {
        let with_background = |head: String| match self.background_source {
            Some(source) => format!("{}_with_{}", head, source.tag()),
            None => head,
        };

        match self.convergence {
            Convergence::Manual => "manual_threshold_with_background_correction".to_string(),
            Convergence::SinglePass => with_background("no_iteration_for_threshold".to_string()),
            Convergence::Converged { iterations } => {
                with_background(format!("converged_after_{}_iterations", iterations))
            }
            Convergence::MaxIterationsReached { max_iterations } => {
                with_background(format!("max_iters_reached_{}", max_iterations))
            }
            Convergence::Escaped { iterations } => with_background(format!(
                "escaped_non_positive_threshold_after_{}_iterations",
                iterations
            )),
            Convergence::Degenerate => "degenerate_signal".to_string(),
            Convergence::Excluded => "element_excluded".to_string(),
            Convergence::FallbackDueToError => "fallback_due_to_error".to_string(),
        }
    }
}

/// A contiguous burst above background in one isotope trace.
///
/// `left_index` and `right_index` are inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub peak_time: f64,
    pub peak_index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub max_height: f64,
    /// background-subtracted sum over the region, always positive
    pub total_counts: f64,
    pub snr: f64,
    pub left_index: usize,
    pub right_index: usize,
    pub is_valid: bool,
}

impl Particle {
    #[inline]
    pub fn width(&self) -> usize {
        self.right_index - self.left_index + 1
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Bursts of several elements that overlap in time and are taken as one physical particle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiElementParticle {
    pub start_time: f64,
    pub end_time: f64,
    /// summed counts per element label
    pub elements: BTreeMap<String, f64>,
}

impl MultiElementParticle {
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn is_multi_element(&self) -> bool {
        self.elements.len() > 1
    }

    pub fn total_counts(&self) -> f64 {
        self.elements.values().sum()
    }

    pub fn counts(&self, label: &str) -> Option<f64> {
        self.elements.get(label).copied()
    }
}

impl fmt::Display for MultiElementParticle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.4}, {:.4}]", self.start_time, self.end_time)?;
        for (label, counts) in &self.elements {
            write!(f, " {}={:.0}", label, counts)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementDetection {
    pub label: String,
    pub threshold: ThresholdResult,
    pub particles: Vec<Particle>,
}

impl ElementDetection {
    pub fn excluded(label: impl Into<String>) -> Self {
        ElementDetection {
            label: label.into(),
            threshold: ThresholdResult::excluded(),
            particles: Vec::new(),
        }
    }
}

/// Detection output of one sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleDetection {
    pub sample: String,
    /// per-element results in channel order
    pub elements: Vec<ElementDetection>,
    pub multi_element: Vec<MultiElementParticle>,
}

impl SampleDetection {
    pub fn new(sample: impl Into<String>) -> Self {
        SampleDetection { sample: sample.into(), ..Default::default() }
    }

    pub fn get(&self, label: &str) -> Option<&ElementDetection> {
        self.elements.iter().find(|e| e.label == label)
    }

    /// replaces the entry with the same label, or appends a new one
    pub fn upsert(&mut self, detection: ElementDetection) {
        match self.elements.iter_mut().find(|e| e.label == detection.label) {
            Some(slot) => *slot = detection,
            None => self.elements.push(detection),
        }
    }

    pub fn particle_count(&self) -> usize {
        self.elements.iter().map(|e| e.particles.len()).sum()
    }

    pub fn valid_particle_count(&self) -> usize {
        self.elements
            .iter()
            .flat_map(|e| e.particles.iter())
            .filter(|p| p.is_valid)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(convergence: Convergence, source: Option<BackgroundSource>) -> ThresholdResult {
        ThresholdResult {
            convergence,
            background_source: source,
            method_used: Some(DetectionMethod::Currie),
            ..ThresholdResult::excluded()
        }
    }

    #[test]
    fn test_convergence_tags() {
        let converged = Convergence::Converged { iterations: 2 };
        let t = threshold(converged, Some(BackgroundSource::ExcludingPeaks));
        assert_eq!(
            t.convergence_tag(),
            "converged_after_2_iterations_with_background_calculated_excluding_peaks"
        );

        let capped = Convergence::MaxIterationsReached { max_iterations: 4 };
        let t = threshold(capped, Some(BackgroundSource::FallbackToMean));
        assert_eq!(t.convergence_tag(), "max_iters_reached_4_with_background_fallback_to_mean");

        let t = threshold(Convergence::FallbackDueToError, None);
        assert_eq!(t.convergence_tag(), "fallback_due_to_error");
        assert_eq!(ThresholdResult::excluded().convergence_tag(), "element_excluded");
    }

    #[test]
    fn test_upsert_replaces_by_label() {
        let mut detection = SampleDetection::new("s1");
        detection.upsert(ElementDetection::excluded("Ag107"));
        detection.upsert(ElementDetection::excluded("Au197"));

        let mut replacement = ElementDetection::excluded("Ag107");
        replacement.threshold.threshold = 5.0;
        detection.upsert(replacement);

        assert_eq!(detection.elements.len(), 2);
        assert_eq!(detection.elements[0].label, "Ag107");
        assert!(detection.get("Ag107").unwrap().threshold.threshold == 5.0);
    }

    #[test]
    fn test_multi_element_particle_helpers() {
        let mut elements = BTreeMap::new();
        elements.insert("Ag107".to_string(), 12.0);
        elements.insert("Au197".to_string(), 30.0);
        let particle = MultiElementParticle { start_time: 0.0, end_time: 1.0, elements };

        assert!(particle.is_multi_element());
        assert_eq!(particle.element_count(), 2);
        assert_eq!(particle.total_counts(), 42.0);
        assert_eq!(particle.counts("Au197"), Some(30.0));
        assert_eq!(particle.to_string(), "[0.0000, 1.0000] Ag107=12 Au197=30");
    }
}
