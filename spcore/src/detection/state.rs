use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::data::config::ParameterSet;

/// Why an element is scheduled for detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// the sample was loaded since the last run, every element is detected
    NewSample,
    /// settings hash differs from the stored one, or the caller flagged the element
    Changed,
}

/// Per (sample, element) bookkeeping for incremental detection.
///
/// Stores the settings hash each element was last detected with plus
/// explicit change flags set by the caller.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectionState {
    hashes: FxHashMap<String, FxHashMap<String, u64>>,
    flagged: FxHashMap<String, FxHashSet<String>>,
    new_samples: FxHashSet<String>,
}

impl DetectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// every element of `sample` is detected on the next incremental run
    pub fn mark_new_sample(&mut self, sample: &str) {
        self.new_samples.insert(sample.to_string());
    }

    /// `label` of `sample` is detected on the next run even if its settings are unchanged
    pub fn mark_changed(&mut self, sample: &str, label: &str) {
        self.flagged
            .entry(sample.to_string())
            .or_default()
            .insert(label.to_string());
    }

    pub fn is_new_sample(&self, sample: &str) -> bool {
        self.new_samples.contains(sample)
    }

    pub fn is_flagged(&self, sample: &str, label: &str) -> bool {
        self.flagged.get(sample).is_some_and(|s| s.contains(label))
    }

    pub fn stored_hash(&self, sample: &str, label: &str) -> Option<u64> {
        self.hashes.get(sample).and_then(|m| m.get(label)).copied()
    }

    /// drops everything recorded for `sample`
    pub fn forget_sample(&mut self, sample: &str) {
        self.hashes.remove(sample);
        self.flagged.remove(sample);
        self.new_samples.remove(sample);
    }

    /// elements of `sample` that need detection, in the order of `labels`
    ///
    /// Consumes the new-sample mark and change flags of the returned elements and
    /// stores their current settings hash, so a second call with unchanged
    /// settings returns nothing.
    pub fn changed_elements<'a, I>(
        &mut self,
        sample: &str,
        labels: I,
        params: &ParameterSet,
    ) -> Vec<(String, ChangeKind)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let new_sample = self.new_samples.remove(sample);
        let mut changed = Vec::new();

        for label in labels {
            let current = params.config_for(sample, label).parameter_hash();
            let kind = if new_sample {
                Some(ChangeKind::NewSample)
            } else if self.stored_hash(sample, label) != Some(current)
                || self.is_flagged(sample, label)
            {
                Some(ChangeKind::Changed)
            } else {
                None
            };

            if let Some(kind) = kind {
                self.hashes
                    .entry(sample.to_string())
                    .or_default()
                    .insert(label.to_string(), current);
                if let Some(flags) = self.flagged.get_mut(sample) {
                    flags.remove(label);
                }
                changed.push((label.to_string(), kind));
            }
        }
        changed
    }
}
