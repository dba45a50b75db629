use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::data::results::{MultiElementParticle, Particle, SampleDetection};

/// Time range of one element's particle, the unit the sweep works on.
#[derive(Clone, Debug, PartialEq)]
struct RangeRecord<'a> {
    start_time: f64,
    end_time: f64,
    label: &'a str,
    counts: f64,
}

/// fraction of the shorter-covered range shared by `a` and `b`
///
/// Returns `None` if the ranges do not overlap or one of them has no duration.
pub fn overlap_fraction(a: (f64, f64), b: (f64, f64)) -> Option<f64> {
    let overlap_start = a.0.max(b.0);
    let overlap_end = a.1.min(b.1);
    if overlap_start >= overlap_end {
        return None;
    }
    let overlap = overlap_end - overlap_start;
    let (d1, d2) = (a.1 - a.0, b.1 - b.0);
    if d1 <= 0.0 || d2 <= 0.0 {
        return None;
    }
    Some((overlap / d1).max(overlap / d2))
}

/// Merges per-element particles that overlap in time into multi-element particles.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoincidenceClusterer {
    pub min_overlap_fraction: f64,
    /// skip particles below the validity SNR
    pub valid_only: bool,
}

impl Default for CoincidenceClusterer {
    fn default() -> Self {
        CoincidenceClusterer { min_overlap_fraction: 0.5, valid_only: true }
    }
}

impl CoincidenceClusterer {
    pub fn new(min_overlap_fraction: f64, valid_only: bool) -> Self {
        CoincidenceClusterer { min_overlap_fraction, valid_only }
    }

    fn is_overlapping(&self, record: &RangeRecord, open: &MultiElementParticle) -> bool {
        overlap_fraction((record.start_time, record.end_time), (open.start_time, open.end_time))
            .is_some_and(|f| f >= self.min_overlap_fraction)
    }

    /// clusters particles of several elements
    ///
    /// Arguments:
    ///
    /// * `per_element` - element label and its particles, in any order
    ///
    /// Returns:
    ///
    /// * `Vec<MultiElementParticle>` - coincidence records sorted by start time
    ///
    /// # Examples
    ///
    /// ```
    /// use spcore::algorithm::coincidence::CoincidenceClusterer;
    /// use spcore::algorithm::particle::{extract_particles, ExtractionParams};
    ///
    /// let time: Vec<f64> = (0..6).map(|i| i as f64).collect();
    /// let params = ExtractionParams::default();
    /// let ag = extract_particles(&time, &[0.0, 40.0, 40.0, 40.0, 0.0, 0.0], 1.0, 10.0, &params);
    /// let au = extract_particles(&time, &[0.0, 0.0, 35.0, 35.0, 0.0, 0.0], 1.0, 10.0, &params);
    ///
    /// let per_element = [("Ag107", ag.as_slice()), ("Au197", au.as_slice())];
    /// let records = CoincidenceClusterer::default().cluster(per_element);
    /// assert_eq!(records.len(), 1);
    /// assert!(records[0].is_multi_element());
    /// ```
    pub fn cluster<'a, I>(&self, per_element: I) -> Vec<MultiElementParticle>
    where
        I: IntoIterator<Item = (&'a str, &'a [Particle])>,
    {
        let mut records: Vec<RangeRecord<'a>> = per_element
            .into_iter()
            .flat_map(|(label, particles)| {
                particles
                    .iter()
                    .filter(move |p| !self.valid_only || p.is_valid)
                    .map(move |p| RangeRecord {
                        start_time: p.start_time,
                        end_time: p.end_time,
                        label,
                        counts: p.total_counts,
                    })
            })
            .collect();
        records.sort_by_key(|r| OrderedFloat(r.start_time));

        let mut clustered: Vec<MultiElementParticle> = Vec::new();
        for record in records {
            match clustered.last_mut() {
                Some(open) if self.is_overlapping(&record, open) => {
                    open.start_time = open.start_time.min(record.start_time);
                    open.end_time = open.end_time.max(record.end_time);
                    *open.elements.entry(record.label.to_string()).or_insert(0.0) += record.counts;
                }
                _ => {
                    let mut elements = BTreeMap::new();
                    elements.insert(record.label.to_string(), record.counts);
                    clustered.push(MultiElementParticle {
                        start_time: record.start_time,
                        end_time: record.end_time,
                        elements,
                    });
                }
            }
        }
        clustered
    }

    /// clusters the included elements of a sample's detection
    pub fn cluster_sample(&self, detection: &SampleDetection) -> Vec<MultiElementParticle> {
        self.cluster(
            detection
                .elements
                .iter()
                .filter(|e| !e.threshold.is_excluded())
                .map(|e| (e.label.as_str(), e.particles.as_slice())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::results::ElementDetection;
    use approx::assert_relative_eq;

    fn particle(start: f64, end: f64, counts: f64) -> Particle {
        Particle {
            peak_time: start,
            peak_index: 0,
            start_time: start,
            end_time: end,
            max_height: 30.0,
            total_counts: counts,
            snr: 3.0,
            left_index: 0,
            right_index: 0,
            is_valid: true,
        }
    }

    #[test]
    fn test_sixty_percent_overlap_merges() {
        let a = vec![particle(0.0, 10.0, 5.0)];
        let b = vec![particle(4.0, 14.0, 7.0)];
        let per_element = [("A", a.as_slice()), ("B", b.as_slice())];
        let out = CoincidenceClusterer::default().cluster(per_element);

        assert_eq!(out.len(), 1);
        assert_eq!((out[0].start_time, out[0].end_time), (0.0, 14.0));
        assert_eq!(out[0].counts("A"), Some(5.0));
        assert_eq!(out[0].counts("B"), Some(7.0));
        assert!(out[0].is_multi_element());
    }

    #[test]
    fn test_ten_percent_overlap_stays_separate() {
        let a = vec![particle(0.0, 10.0, 5.0)];
        let b = vec![particle(9.0, 20.0, 7.0)];
        let per_element = [("B", b.as_slice()), ("A", a.as_slice())];
        let out = CoincidenceClusterer::default().cluster(per_element);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].counts("A"), Some(5.0));
        assert_eq!(out[1].counts("B"), Some(7.0));
    }

    #[test]
    fn test_repeated_element_counts_are_summed() {
        let a = vec![particle(0.0, 10.0, 5.0), particle(2.0, 8.0, 3.0)];
        let out = CoincidenceClusterer::default().cluster(vec![("A", a.as_slice())]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].element_count(), 1);
        assert_relative_eq!(out[0].total_counts(), 8.0);
    }

    #[test]
    fn test_zero_duration_is_its_own_record() {
        let a = vec![particle(0.0, 10.0, 5.0)];
        let b = vec![particle(5.0, 5.0, 1.0)];
        let per_element = [("A", a.as_slice()), ("B", b.as_slice())];
        let out = CoincidenceClusterer::default().cluster(per_element);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].counts("B"), Some(1.0));
        assert_eq!(overlap_fraction((5.0, 5.0), (0.0, 10.0)), None);
    }

    #[test]
    fn test_invalid_particles_filtered() {
        let mut weak = particle(4.0, 14.0, 2.0);
        weak.is_valid = false;
        weak.snr = 1.2;
        let a = vec![particle(0.0, 10.0, 5.0)];
        let b = vec![weak];

        let per_element = [("A", a.as_slice()), ("B", b.as_slice())];
        let strict = CoincidenceClusterer::default().cluster(per_element);
        assert_eq!(strict.len(), 1);
        assert!(!strict[0].is_multi_element());

        let all = CoincidenceClusterer::new(0.5, false).cluster(per_element);
        assert!(all[0].is_multi_element());
    }

    #[test]
    fn test_cluster_sample_skips_excluded() {
        let mut detection = SampleDetection::new("s1");
        let mut a = ElementDetection::excluded("A");
        a.threshold.convergence = crate::data::results::Convergence::SinglePass;
        a.particles = vec![particle(0.0, 10.0, 5.0)];
        let mut b = ElementDetection::excluded("B");
        b.particles = vec![particle(1.0, 9.0, 4.0)];
        detection.upsert(a);
        detection.upsert(b);

        let out = CoincidenceClusterer::default().cluster_sample(&detection);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].element_count(), 1);
        assert_eq!(out[0].counts("A"), Some(5.0));
    }
}
