//! # Error Types
//!
//! Typed errors for the two failure domains of the core: the capture device
//! and the tuning configuration boundary. A missing pitch is not an error and
//! has no variant here.

use thiserror::Error;

/// Failures of the audio capture path.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The host has no input device (or none matching the configured name).
    #[error("no input device available")]
    NoInputDevice,

    /// The device offers no stream configuration we can use.
    #[error("no supported input configuration: {0}")]
    UnsupportedConfig(String),

    /// The platform refused to build or start the input stream.
    #[error("failed to open input stream: {0}")]
    StreamOpen(String),

    /// The stream reported an I/O failure while capturing.
    #[error("input stream failed: {0}")]
    StreamFailure(String),

    /// The capture worker panicked (usually inside the frame consumer).
    #[error("capture worker panicked")]
    WorkerPanicked,

    /// The capture worker thread could not be spawned.
    #[error("failed to spawn capture worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Rejections at the tuning configuration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TuningError {
    #[error("tonic frequency must be positive, got {0} Hz")]
    NonPositiveTonic(f32),

    #[error("tolerance must not be negative, got {0} cents")]
    NegativeTolerance(f32),

    #[error("tuning values must be finite")]
    NonFinite,
}
