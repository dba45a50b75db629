pub mod error;

// algorithm module
pub mod algorithm {
    pub mod stats;
    pub mod compound_poisson;
    pub mod threshold;
    pub mod smoothing;
    pub mod particle;
    pub mod coincidence;
}

// data module
pub mod data {
    pub mod signal;
    pub mod config;
    pub mod results;
}

// detection module
pub mod detection {
    pub mod state;
    pub mod scheduler;
}

pub use error::{DetectionError, Result};
