//! # Microphone Device Module
//!
//! The cpal-backed [`CaptureDevice`]: picks an input device and a stream
//! configuration close to the request, sizes frames from the device's
//! minimum buffer, and feeds normalized frames into the capture worker.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedBufferSize, SupportedStreamConfigRange};
use log::{info, warn};

use crate::audio::{ActiveCapture, CaptureDevice, FrameAssembler, FrameSink, frame_size_for};
use crate::config::CaptureConfig;
use crate::error::CaptureError;

/// Sample formats we can normalize, most preferred first.
const ACCEPTED_FORMATS: [SampleFormat; 3] = [SampleFormat::I16, SampleFormat::F32, SampleFormat::U16];

/// The platform microphone through the default cpal host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalDevice;

/// An open cpal input stream. Dropping it stops and releases the stream.
struct CpalCapture {
    stream: cpal::Stream,
    frame_size: usize,
}

impl ActiveCapture for CpalCapture {
    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        if let Err(err) = self.stream.pause() {
            warn!("[CAPTURE] Error pausing stream: {err}");
        }
    }
}

impl CaptureDevice for CpalDevice {
    fn open(&self, config: &CaptureConfig, sink: FrameSink) -> Result<Box<dyn ActiveCapture>, CaptureError> {
        let host = cpal::default_host();
        let device = select_input_device(&host, config.device_name.as_deref())?;
        info!(
            "[CAPTURE] Using audio input device: {}",
            device.name().unwrap_or_else(|_| "<unnamed>".to_string())
        );

        let ranges = device
            .supported_input_configs()
            .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?
            .collect::<Vec<_>>();
        let range = find_supported_config(ranges, config.sample_rate, config.channels).ok_or_else(|| {
            CaptureError::UnsupportedConfig(format!("no i16, f32 or u16 input at {} Hz", config.sample_rate))
        })?;

        let min_buffer = match range.buffer_size() {
            SupportedBufferSize::Range { min, .. } => Some(*min),
            SupportedBufferSize::Unknown => None,
        };
        let frame_size = frame_size_for(min_buffer, config);
        let sample_format = range.sample_format();
        let stream_config: StreamConfig = range.with_sample_rate(SampleRate(config.sample_rate)).into();

        info!(
            "[CAPTURE] Stream config: {} Hz, {} channel(s), {:?}, frame {} samples",
            stream_config.sample_rate.0, stream_config.channels, sample_format, frame_size
        );

        let mut assembler = FrameAssembler::new(frame_size, stream_config.channels);
        let error_sink = sink.clone();
        let err_fn = move |err: cpal::StreamError| error_sink.fail(CaptureError::StreamFailure(err.to_string()));

        let stream = match sample_format {
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    assembler.push_i16(data, |frame| {
                        sink.deliver(frame);
                    })
                },
                err_fn,
                None,
            ),
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    assembler.push_f32(data, |frame| {
                        sink.deliver(frame);
                    })
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &stream_config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    assembler.push_u16(data, |frame| {
                        sink.deliver(frame);
                    })
                },
                err_fn,
                None,
            ),
            other => return Err(CaptureError::UnsupportedConfig(format!("sample format {other:?}"))),
        }
        .map_err(|e| CaptureError::StreamOpen(e.to_string()))?;

        stream.play().map_err(|e| CaptureError::StreamOpen(e.to_string()))?;

        Ok(Box::new(CpalCapture { stream, frame_size }))
    }
}

/// Names of the host's input devices, for display.
pub fn list_input_devices() -> Result<Vec<String>, CaptureError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::StreamOpen(e.to_string()))?;
    Ok(devices.filter_map(|device| device.name().ok()).collect())
}

fn select_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    match name {
        None => host.default_input_device().ok_or(CaptureError::NoInputDevice),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| CaptureError::StreamOpen(e.to_string()))?
            .find(|device| device.name().is_ok_and(|n| n == wanted))
            .ok_or(CaptureError::NoInputDevice),
    }
}

/// Picks the configuration range that covers `target_rate`, preferring the
/// requested channel count, then the sample format order of [`ACCEPTED_FORMATS`].
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
    channels: u16,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0)
        .filter_map(|c| {
            let format_rank = ACCEPTED_FORMATS.iter().position(|&f| f == c.sample_format())?;
            Some(((c.channels() != channels, format_rank), c))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, c)| c)
}
