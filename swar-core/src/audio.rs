//! # Audio Capture Module
//!
//! Continuous capture on a dedicated worker thread, delivering fixed-size,
//! normalized frames to a consumer until stopped.
//!
//! ## Threads
//! - **Platform callback**: converts raw PCM into frames ([`FrameAssembler`])
//!   and hands them over a bounded channel ([`FrameSink`]). When the worker
//!   falls behind, new frames are dropped rather than queued.
//! - **Capture worker**: opens the device, then runs the consumer once per
//!   frame, in arrival order, until shutdown or a stream failure. The device
//!   is opened and released on this thread, so platform streams that are not
//!   `Send` never cross threads.
//!
//! ## Lifecycle
//! An [`AudioSource`] owns at most one [`CaptureSession`]. Starting again
//! stops the previous session first; sessions never overlap. Dropping a
//! session joins its worker, and the worker drops the device handle on every
//! exit path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use log::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::error::CaptureError;

/// Largest magnitude of signed 16-bit PCM.
const I16_SCALE: f32 = 32768.0;

/// One fixed-length block of samples in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Frame length for a device whose smallest safe buffer is `min_buffer` samples.
///
/// The platform minimum is scaled by the safety factor and never goes below
/// the configured floor. Without a reported minimum the floor is used.
pub fn frame_size_for(min_buffer: Option<u32>, config: &CaptureConfig) -> usize {
    let scaled = min_buffer.map_or(0, |min| min as usize * config.buffer_safety_factor.max(1));
    scaled.max(config.frame_floor).max(1)
}

pub fn normalize_i16(sample: i16) -> f32 {
    sample as f32 / I16_SCALE
}

pub fn normalize_u16(sample: u16) -> f32 {
    (sample as f32 - I16_SCALE) / I16_SCALE
}

pub fn normalize_f32(sample: f32) -> f32 {
    if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 }
}

/// Accumulates platform callback chunks into fixed-size mono frames.
///
/// Interleaved multichannel input is reduced to its first channel.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    channels: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, channels: u16) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            channels: (channels as usize).max(1),
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn push_i16(&mut self, data: &[i16], emit: impl FnMut(AudioFrame)) {
        self.push_with(data, normalize_i16, emit);
    }

    pub fn push_u16(&mut self, data: &[u16], emit: impl FnMut(AudioFrame)) {
        self.push_with(data, normalize_u16, emit);
    }

    pub fn push_f32(&mut self, data: &[f32], emit: impl FnMut(AudioFrame)) {
        self.push_with(data, normalize_f32, emit);
    }

    fn push_with<T: Copy>(&mut self, data: &[T], convert: impl Fn(T) -> f32, mut emit: impl FnMut(AudioFrame)) {
        self.pending
            .extend(data.chunks(self.channels).filter_map(|frame| frame.first().copied().map(&convert)));

        // While we have enough data for a full frame, hand it out.
        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            emit(AudioFrame::new(frame));
        }
    }
}

/// Producer end of the handoff from the platform callback to the worker.
#[derive(Debug, Clone)]
pub struct FrameSink {
    frames: Sender<AudioFrame>,
    // Lets the producer evict the oldest queued frame when the queue is full.
    backlog: Receiver<AudioFrame>,
    errors: Sender<CaptureError>,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl FrameSink {
    /// Hands a frame to the worker without blocking.
    ///
    /// When the queue is full the oldest queued frame is discarded (counted,
    /// not an error) so the worker always sees the freshest audio. Returns
    /// `false` once the worker is gone and capture should wind down.
    pub fn deliver(&self, frame: AudioFrame) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                if self.backlog.try_recv().is_ok() {
                    self.count_drop();
                }
                if self.frames.try_send(frame).is_err() {
                    self.count_drop();
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Reports a stream failure. The worker stops at its next iteration.
    pub fn fail(&self, error: CaptureError) {
        // Only the first failure matters; later ones are dropped.
        let _ = self.errors.try_send(error);
    }

    fn count_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("[CAPTURE] Worker behind, dropped stale frame ({total} total)");
    }
}

/// Worker end of a [`FrameSink`].
struct SinkReceivers {
    frames: Receiver<AudioFrame>,
    errors: Receiver<CaptureError>,
    closed: Arc<AtomicBool>,
}

fn frame_channel(capacity: usize, dropped: Arc<AtomicU64>) -> (FrameSink, SinkReceivers) {
    let (frame_tx, frame_rx) = bounded::<AudioFrame>(capacity.max(1));
    let (error_tx, error_rx) = bounded::<CaptureError>(1);
    let closed = Arc::new(AtomicBool::new(false));
    let sink = FrameSink {
        frames: frame_tx,
        backlog: frame_rx.clone(),
        errors: error_tx,
        dropped,
        closed: Arc::clone(&closed),
    };
    (sink, SinkReceivers { frames: frame_rx, errors: error_rx, closed })
}

/// A device that is open and capturing. Dropping it releases the device.
pub trait ActiveCapture {
    /// Length of the frames this capture delivers, in samples.
    fn frame_size(&self) -> usize;
}

/// Something that can be opened for capture.
///
/// `open` runs on the capture worker thread and must start delivering
/// frames into `sink` before returning.
pub trait CaptureDevice: Send + Sync {
    fn open(&self, config: &CaptureConfig, sink: FrameSink) -> Result<Box<dyn ActiveCapture>, CaptureError>;
}

/// Receives captured frames on the worker thread.
pub trait FrameConsumer: Send + 'static {
    fn on_frame(&mut self, samples: &[f32]);

    /// Called once if the session ends because of a capture failure.
    fn on_capture_error(&mut self, _error: &CaptureError) {}
}

impl<F> FrameConsumer for F
where
    F: FnMut(&[f32]) + Send + 'static,
{
    fn on_frame(&mut self, samples: &[f32]) {
        self(samples)
    }
}

/// Raises the shared capturing flag and clears it on drop, panics included.
struct CapturingFlag<'a>(&'a AtomicBool);

impl<'a> CapturingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for CapturingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One running capture: a worker thread and the device it holds open.
#[derive(Debug)]
pub struct CaptureSession {
    shutdown_tx: Sender<()>,
    worker: Option<JoinHandle<Result<(), CaptureError>>>,
    capturing: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    frame_size: usize,
}

impl CaptureSession {
    /// Spawns the worker and waits until the device is open.
    ///
    /// If the device cannot be opened the worker exits, the consumer is never
    /// called, and the open error is returned.
    fn spawn<C: FrameConsumer>(
        device: Arc<dyn CaptureDevice>,
        config: CaptureConfig,
        capturing: Arc<AtomicBool>,
        consumer: C,
    ) -> Result<Self, CaptureError> {
        let (ready_tx, ready_rx) = bounded::<Result<usize, CaptureError>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = thread::Builder::new().name("swar-capture".into()).spawn({
            let capturing = Arc::clone(&capturing);
            let dropped = Arc::clone(&dropped);
            move || run_worker(device, config, consumer, ready_tx, shutdown_rx, capturing, dropped)
        })?;

        match ready_rx.recv() {
            Ok(Ok(frame_size)) => Ok(Self {
                shutdown_tx,
                worker: Some(worker),
                capturing,
                dropped,
                frame_size,
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            // The worker died before reporting, which only a panic in `open` does.
            Err(_) => match worker.join() {
                Ok(Err(err)) => Err(err),
                _ => Err(CaptureError::WorkerPanicked),
            },
        }
    }

    /// False once the worker has exited, whether stopped or failed.
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Frames discarded because the worker was busy.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the worker and waits for it to release the device.
    ///
    /// Returns the failure that ended the session, if one did.
    pub fn stop(mut self) -> Result<(), CaptureError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), CaptureError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if worker.thread().id() == thread::current().id() {
            // Stopping from inside the consumer: the loop sees the signal
            // after this frame, and nobody can join a thread from itself.
            warn!("[CAPTURE] Stop requested from the capture thread; not joining");
            let _ = self.shutdown_tx.try_send(());
            return Ok(());
        }
        // The worker may already be gone after a failure; the join below still reports it.
        let _ = self.shutdown_tx.try_send(());
        match worker.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(CaptureError::WorkerPanicked),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("[CAPTURE] Session ended with error: {err}");
        }
    }
}

fn run_worker<C: FrameConsumer>(
    device: Arc<dyn CaptureDevice>,
    config: CaptureConfig,
    mut consumer: C,
    ready_tx: Sender<Result<usize, CaptureError>>,
    shutdown_rx: Receiver<()>,
    capturing: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) -> Result<(), CaptureError> {
    let (sink, receivers) = frame_channel(config.max_pending_frames, dropped);

    let capture = match device.open(&config, sink) {
        Ok(capture) => capture,
        Err(err) => {
            error!("[CAPTURE] Failed to open input: {err}");
            let _ = ready_tx.send(Err(err));
            return Ok(());
        }
    };

    let _flag = CapturingFlag::raise(&capturing);
    info!("[CAPTURE] Capturing {} Hz in frames of {} samples", config.sample_rate, capture.frame_size());
    let _ = ready_tx.send(Ok(capture.frame_size()));

    let outcome = loop {
        select! {
            recv(shutdown_rx) -> _ => break Ok(()),
            recv(receivers.errors) -> msg => match msg {
                Ok(err) => break Err(err),
                Err(_) => break Ok(()),
            },
            recv(receivers.frames) -> msg => match msg {
                Ok(frame) => consumer.on_frame(frame.samples()),
                Err(_) => {
                    info!("[CAPTURE] Source ended");
                    break Ok(());
                }
            },
        }
    };

    // Producers still running see this on their next delivery and wind down.
    receivers.closed.store(true, Ordering::SeqCst);

    if let Err(err) = &outcome {
        error!("[CAPTURE] Stopping after stream failure: {err}");
        consumer.on_capture_error(err);
    }
    drop(capture);
    info!("[CAPTURE] Input released");
    outcome
}

/// Owner of the capture device and its (at most one) running session.
///
/// Lifecycle calls may come from any thread; they are serialized so a new
/// session only begins after the previous one has released the device.
pub struct AudioSource {
    device: Arc<dyn CaptureDevice>,
    config: CaptureConfig,
    session: Mutex<Option<CaptureSession>>,
    capturing: Arc<AtomicBool>,
}

impl AudioSource {
    pub fn new(device: Arc<dyn CaptureDevice>, config: CaptureConfig) -> Self {
        Self {
            device,
            config,
            session: Mutex::new(None),
            capturing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Starts capturing into `consumer`, stopping any previous session first.
    ///
    /// This function:
    /// 1. Stops and joins the previous session, logging how it ended
    /// 2. Spawns a worker that opens the device and feeds `consumer`
    /// 3. Waits until the device is open or has failed to open
    ///
    /// # Arguments
    /// * `consumer` - Receives every frame on the worker thread
    ///
    /// # Returns
    /// * `Ok(())` - The device is open and frames are flowing
    /// * `Err(CaptureError)` - No device, permission denied, or the stream
    ///   could not be built; nothing is left running
    pub fn start<C: FrameConsumer>(&self, consumer: C) -> Result<(), CaptureError> {
        let mut session = self.lock_session();
        if let Some(previous) = session.take() {
            if let Err(err) = previous.stop() {
                warn!("[CAPTURE] Previous session had failed: {err}");
            }
        }
        *session = Some(CaptureSession::spawn(
            Arc::clone(&self.device),
            self.config.clone(),
            Arc::clone(&self.capturing),
            consumer,
        )?);
        Ok(())
    }

    /// Stops the current session, if any, and releases the device.
    ///
    /// Returns the failure that ended the session early, if one did. Calling
    /// `stop` again is a no-op.
    pub fn stop(&self) -> Result<(), CaptureError> {
        let mut session = self.lock_session();
        match session.take() {
            Some(running) => running.stop(),
            None => Ok(()),
        }
    }

    /// True while a worker holds the device open.
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Frame size of the current session.
    pub fn frame_size(&self) -> Option<usize> {
        self.lock_session().as_ref().map(CaptureSession::frame_size)
    }

    /// Frames dropped by the current session.
    pub fn dropped_frames(&self) -> u64 {
        self.lock_session().as_ref().map_or(0, CaptureSession::dropped_frames)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<CaptureSession>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("[CAPTURE] Capture ended with error: {err}");
        }
    }
}
