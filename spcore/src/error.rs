use thiserror::Error;

/// Errors raised by the detection engine.
///
/// Numerical degeneracy is never reported here; it is resolved by fallback
/// thresholds. Element-level errors are turned into fallback results by the
/// scheduler, so only sample-level failures reach the caller.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("time and signal of '{label}' differ in length: {time_len} vs {signal_len}")]
    LengthMismatch {
        label: String,
        time_len: usize,
        signal_len: usize,
    },

    #[error("signal of '{label}' holds a non-finite value at index {index}")]
    NonFiniteSignal { label: String, index: usize },

    #[error("unknown detection method: {0}")]
    UnknownMethod(String),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),

    #[error("worker panicked while processing sample '{sample}'")]
    WorkerPanicked { sample: String },

    #[error("detection cancelled before sample '{sample}' was started")]
    Cancelled { sample: String },
}

pub type Result<T> = std::result::Result<T, DetectionError>;
