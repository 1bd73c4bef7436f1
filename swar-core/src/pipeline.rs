//! # Pipeline Module
//!
//! Wires capture, estimation and scale mapping together. Each captured frame
//! goes through the sliding window, the estimator and (when a pitch was
//! found) the mapper, synchronously on the capture worker, and the result is
//! published to an observer before the next frame is taken.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use log::{debug, info};

use crate::PitchReading;
use crate::audio::{AudioSource, CaptureDevice, FrameConsumer};
use crate::buffer::SlidingSampleBuffer;
use crate::config::{PipelineConfig, SharedTuning, TuningConfig};
use crate::error::CaptureError;
use crate::pitch::{PitchEstimate, PitchEstimator};
use crate::tuning::map_frequency;

/// Receives pipeline output on the capture worker thread.
///
/// Implementations must return quickly and must not call back into the
/// pipeline's `start`/`stop`.
pub trait PitchObserver: Send + Sync {
    fn publish(&self, reading: &PitchReading);

    /// The session ended because capture failed. Capture is already released.
    fn capture_failed(&self, _error: &CaptureError) {}
}

impl<F> PitchObserver for F
where
    F: Fn(&PitchReading) + Send + Sync,
{
    fn publish(&self, reading: &PitchReading) {
        self(reading)
    }
}

/// Observer that forwards readings into a channel without blocking.
///
/// When a bounded channel is full the reading is skipped; the next frame
/// brings a fresher one.
pub fn channel_observer(sender: Sender<PitchReading>) -> impl PitchObserver + 'static {
    move |reading: &PitchReading| {
        let _ = sender.try_send(reading.clone());
    }
}

/// Estimates the pitch of `window` and names it under `tuning`.
///
/// The same step the pipeline runs per frame, for callers that hold their
/// own samples.
pub fn analyze(window: &[f32], estimator: &PitchEstimator, tuning: &TuningConfig) -> PitchReading {
    let estimate = estimator.estimate(window);
    let degree = estimate.frequency.map(|freq| map_frequency(freq, tuning));
    PitchReading { estimate, degree }
}

/// Per-session state living on the capture worker.
struct FrameProcessor {
    buffer: SlidingSampleBuffer,
    estimator: PitchEstimator,
    tuning: SharedTuning,
    observer: Arc<dyn PitchObserver>,
}

impl FrameConsumer for FrameProcessor {
    fn on_frame(&mut self, samples: &[f32]) {
        self.buffer.push_frame(samples);

        let reading = if self.buffer.has_at_least(self.estimator.config().effective_min_window()) {
            // Read the tuning per frame so external changes apply immediately.
            let tuning = self.tuning.get();
            analyze(self.buffer.window(), &self.estimator, &tuning)
        } else {
            PitchReading { estimate: PitchEstimate::NONE, degree: None }
        };
        self.observer.publish(&reading);
    }

    fn on_capture_error(&mut self, error: &CaptureError) {
        self.observer.capture_failed(error);
    }
}

/// The capture → estimate → map → publish orchestrator.
pub struct PitchPipeline {
    source: AudioSource,
    estimator: PitchEstimator,
    buffer_capacity: usize,
    tuning: SharedTuning,
    observer: Arc<dyn PitchObserver>,
    lifecycle: Mutex<()>,
}

impl PitchPipeline {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        config: &PipelineConfig,
        tuning: SharedTuning,
        observer: Arc<dyn PitchObserver>,
    ) -> Self {
        Self {
            source: AudioSource::new(device, config.capture.clone()),
            estimator: PitchEstimator::new(config.capture.sample_rate, config.estimator.clone()),
            buffer_capacity: config.effective_buffer_capacity(),
            tuning,
            observer,
            lifecycle: Mutex::new(()),
        }
    }

    /// Starts capturing. A no-op while already capturing.
    ///
    /// Capture failures to open are returned; the pipeline is then simply
    /// not capturing.
    pub fn start(&self) -> Result<(), CaptureError> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.source.is_capturing() {
            debug!("[PIPELINE] Already capturing");
            return Ok(());
        }

        let processor = FrameProcessor {
            buffer: SlidingSampleBuffer::new(self.buffer_capacity),
            estimator: self.estimator.clone(),
            tuning: self.tuning.clone(),
            observer: Arc::clone(&self.observer),
        };
        self.source.start(processor)?;
        info!("[PIPELINE] Started with a {}-sample window", self.buffer_capacity);
        Ok(())
    }

    /// Stops capturing and releases the device. Safe to call repeatedly.
    ///
    /// Returns the failure that ended the session early, if one did.
    pub fn stop(&self) -> Result<(), CaptureError> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let outcome = self.source.stop();
        info!("[PIPELINE] Stopped");
        outcome
    }

    pub fn is_capturing(&self) -> bool {
        self.source.is_capturing()
    }

    /// The live tuning; changes take effect on the next frame.
    pub fn tuning(&self) -> &SharedTuning {
        &self.tuning
    }

    pub fn estimator(&self) -> &PitchEstimator {
        &self.estimator
    }

    /// Frames dropped by the current session because processing fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.source.dropped_frames()
    }
}
