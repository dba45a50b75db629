use serde::{Deserialize, Serialize};

use crate::error::{DetectionError, Result};

/// One isotope trace of a sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub label: String,
    pub signal: Vec<f64>,
}

impl Channel {
    pub fn new(label: impl Into<String>, signal: Vec<f64>) -> Self {
        Channel { label: label.into(), signal }
    }
}

/// Time axis plus every isotope trace acquired for one sample.
///
/// Channels keep the order in which they were added; detection processes
/// and stores them in that order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub time: Vec<f64>,
    pub channels: Vec<Channel>,
}

impl Sample {
    pub fn new(name: impl Into<String>, time: Vec<f64>) -> Self {
        Sample { name: name.into(), time, channels: Vec::new() }
    }

    pub fn with_channel(mut self, label: impl Into<String>, signal: Vec<f64>) -> Self {
        self.channels.push(Channel::new(label, signal));
        self
    }

    pub fn channel(&self, label: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.label == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.label.as_str())
    }
}

/// checks that a trace lines up with its time axis and holds finite values only
pub fn validate_signal(label: &str, time: &[f64], signal: &[f64]) -> Result<()> {
    if time.len() != signal.len() {
        return Err(DetectionError::LengthMismatch {
            label: label.to_string(),
            time_len: time.len(),
            signal_len: signal.len(),
        });
    }
    if let Some(index) = signal.iter().position(|x| !x.is_finite()) {
        return Err(DetectionError::NonFiniteSignal { label: label.to_string(), index });
    }
    Ok(())
}

/// arithmetic mean, 0 for an empty slice
#[inline]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// mean of the values strictly below `level`, `None` if there are none
pub fn mean_below(values: &[f64], level: f64) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .filter(|&&x| x < level)
        .fold((0.0, 0usize), |(s, c), &x| (s + x, c + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Centered sub-slice of `size` points.
///
/// Returns the whole signal when no window is requested or the window is at
/// least as long as the signal.
pub fn centered_window(signal: &[f64], size: Option<usize>) -> &[f64] {
    match size {
        Some(size) if size > 0 && size < signal.len() => {
            let start = (signal.len() - size) / 2;
            &signal[start..start + size]
        }
        _ => signal,
    }
}
