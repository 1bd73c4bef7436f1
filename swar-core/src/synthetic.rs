//! Deterministic signal source for running the pipeline without a microphone.
//!
//! [`SyntheticDevice`] generates a sine tone, quantizes it to 16-bit PCM and
//! pushes it through the same framing path as a real device, paced in real
//! time unless told otherwise.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::audio::{ActiveCapture, CaptureDevice, FrameAssembler, FrameSink, frame_size_for};
use crate::config::CaptureConfig;
use crate::error::CaptureError;

/// `len` samples of a sine at `frequency` Hz, starting at phase zero.
pub fn sine_wave(frequency: f32, amplitude: f32, sample_rate: u32, len: usize) -> Vec<f32> {
    let step = TAU * frequency as f64 / sample_rate as f64;
    (0..len)
        .map(|i| (amplitude as f64 * (step * i as f64).sin()) as f32)
        .collect()
}

/// A capture device that plays a fixed sine tone (or silence).
#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    frequency: f32,
    amplitude: f32,
    chunk_len: usize,
    chunk_interval: Option<Duration>,
    chunk_limit: Option<usize>,
}

impl SyntheticDevice {
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            amplitude: 0.8,
            chunk_len: 512,
            chunk_interval: None,
            chunk_limit: None,
        }
    }

    pub fn silence() -> Self {
        Self::new(0.0).with_amplitude(0.0)
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    /// Samples per simulated callback.
    pub fn with_chunk_len(mut self, chunk_len: usize) -> Self {
        self.chunk_len = chunk_len.max(1);
        self
    }

    /// Delay between callbacks. Defaults to real time for the configured rate.
    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = Some(interval);
        self
    }

    /// Ends the stream after this many callbacks.
    pub fn with_chunk_limit(mut self, chunks: usize) -> Self {
        self.chunk_limit = Some(chunks);
        self
    }
}

struct SyntheticCapture {
    running: Arc<AtomicBool>,
    generator: Option<JoinHandle<()>>,
    frame_size: usize,
}

impl ActiveCapture for SyntheticCapture {
    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(generator) = self.generator.take() {
            let _ = generator.join();
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn open(&self, config: &CaptureConfig, sink: FrameSink) -> Result<Box<dyn ActiveCapture>, CaptureError> {
        let frame_size = frame_size_for(None, config);
        let sample_rate = config.sample_rate.max(1);
        let interval = self
            .chunk_interval
            .unwrap_or_else(|| Duration::from_secs_f64(self.chunk_len as f64 / sample_rate as f64));
        let running = Arc::new(AtomicBool::new(true));

        let generator = thread::Builder::new()
            .name("swar-synthetic".into())
            .spawn({
                let device = self.clone();
                let running = Arc::clone(&running);
                move || device.generate(sample_rate, frame_size, interval, &running, &sink)
            })?;

        Ok(Box::new(SyntheticCapture {
            running,
            generator: Some(generator),
            frame_size,
        }))
    }
}

impl SyntheticDevice {
    fn generate(&self, sample_rate: u32, frame_size: usize, interval: Duration, running: &AtomicBool, sink: &FrameSink) {
        let mut assembler = FrameAssembler::new(frame_size, 1);
        let step = TAU * self.frequency as f64 / sample_rate as f64;
        let mut phase = 0.0_f64;
        let mut chunk = vec![0i16; self.chunk_len];
        let mut produced = 0usize;

        while running.load(Ordering::SeqCst) && self.chunk_limit.is_none_or(|limit| produced < limit) {
            for sample in chunk.iter_mut() {
                *sample = (self.amplitude as f64 * phase.sin() * i16::MAX as f64).round() as i16;
                phase = (phase + step) % TAU;
            }

            let mut connected = true;
            assembler.push_i16(&chunk, |frame| connected &= sink.deliver(frame));
            if !connected {
                break;
            }
            produced += 1;
            thread::sleep(interval);
        }
        debug!("[CAPTURE] Synthetic source finished after {produced} chunks");
    }
}
