// swar-core/src/lib.rs

//! The core logic for the swar monitor.
//! This crate is responsible for audio capture, pitch detection,
//! and naming pitches as scale degrees relative to a tonic. It is
//! completely headless and contains no presentation code.

use serde::Serialize;

pub mod audio;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod fft;
pub mod pipeline;
pub mod pitch;
pub mod synthetic;
pub mod tuning;

pub use config::{PipelineConfig, SharedTuning, TuningConfig};
pub use error::{CaptureError, TuningError};
pub use pipeline::{PitchObserver, PitchPipeline};
pub use pitch::{PitchEstimate, PitchEstimator};
pub use tuning::{Accuracy, Register, ScaleDegree, ScaleSystem};

/// The result of analyzing one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PitchReading {
    /// What the estimator found in the current window.
    pub estimate: PitchEstimate,
    /// The nearest scale degree. Present exactly when a pitch was detected.
    pub degree: Option<ScaleDegree>,
}
