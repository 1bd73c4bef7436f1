//! # Configuration Module
//!
//! Runtime configuration for capture, estimation and tuning. Everything is
//! serde (de)serializable so a JSON file can override any subset of the
//! defaults.
//!
//! [`TuningConfig`] is the validation boundary: its fields are private and
//! every constructor (including deserialization) rejects a non-positive tonic
//! or a negative tolerance, so the mapper never sees an invalid one.

use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TuningError;
use crate::tuning::{ScaleSystem, TonicPreset};

/// Tonic, tolerance and tuning system used to name detected pitches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTuningConfig", into = "RawTuningConfig")]
pub struct TuningConfig {
    tonic_hz: f32,
    tolerance_cents: f32,
    system: ScaleSystem,
}

impl TuningConfig {
    pub fn new(tonic_hz: f32, tolerance_cents: f32, system: ScaleSystem) -> Result<Self, TuningError> {
        if !tonic_hz.is_finite() || !tolerance_cents.is_finite() {
            return Err(TuningError::NonFinite);
        }
        if tonic_hz <= 0.0 {
            return Err(TuningError::NonPositiveTonic(tonic_hz));
        }
        if tolerance_cents < 0.0 {
            return Err(TuningError::NegativeTolerance(tolerance_cents));
        }
        Ok(Self { tonic_hz, tolerance_cents, system })
    }

    /// Builds a config whose tonic is one of the standard presets.
    pub fn from_preset(preset: TonicPreset, tolerance_cents: f32, system: ScaleSystem) -> Result<Self, TuningError> {
        Self::new(preset.frequency, tolerance_cents, system)
    }

    pub fn tonic_hz(&self) -> f32 {
        self.tonic_hz
    }

    pub fn tolerance_cents(&self) -> f32 {
        self.tolerance_cents
    }

    pub fn system(&self) -> ScaleSystem {
        self.system
    }
}

impl Default for TuningConfig {
    /// C3 tonic, 15 cent tolerance, 12-tone just intonation.
    fn default() -> Self {
        Self {
            tonic_hz: 130.81,
            tolerance_cents: 15.0,
            system: ScaleSystem::JustIntonation12,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawTuningConfig {
    tonic_hz: f32,
    tolerance_cents: f32,
    #[serde(default)]
    system: ScaleSystem,
}

impl TryFrom<RawTuningConfig> for TuningConfig {
    type Error = TuningError;

    fn try_from(raw: RawTuningConfig) -> Result<Self, Self::Error> {
        TuningConfig::new(raw.tonic_hz, raw.tolerance_cents, raw.system)
    }
}

impl From<TuningConfig> for RawTuningConfig {
    fn from(config: TuningConfig) -> Self {
        Self {
            tonic_hz: config.tonic_hz,
            tolerance_cents: config.tolerance_cents,
            system: config.system,
        }
    }
}

/// The externally owned, always-current tuning.
///
/// Cloning shares the same value. The pipeline reads it once per frame, so a
/// `set` takes effect on the next captured frame.
#[derive(Debug, Clone, Default)]
pub struct SharedTuning {
    inner: Arc<RwLock<TuningConfig>>,
}

impl SharedTuning {
    pub fn new(config: TuningConfig) -> Self {
        Self { inner: Arc::new(RwLock::new(config)) }
    }

    pub fn get(&self) -> TuningConfig {
        // The guarded value is plain data; a poisoned lock still holds a valid config.
        *self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, config: TuningConfig) {
        *self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    /// Validates raw values and stores them, leaving the old config in place on error.
    pub fn update(&self, tonic_hz: f32, tolerance_cents: f32, system: ScaleSystem) -> Result<(), TuningError> {
        self.set(TuningConfig::new(tonic_hz, tolerance_cents, system)?);
        Ok(())
    }
}

/// Audio capture parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Requested capture rate in Hz.
    pub sample_rate: u32,
    /// Preferred channel count. Multichannel input is reduced to its first channel.
    pub channels: u16,
    /// Smallest frame the source will deliver, in samples.
    pub frame_floor: usize,
    /// Multiplier applied to the platform's minimum buffer size.
    pub buffer_safety_factor: usize,
    /// Frames that may queue between the platform callback and the worker.
    pub max_pending_frames: usize,
    /// Input device to open; the host default when `None`.
    pub device_name: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
            frame_floor: 1024,
            buffer_safety_factor: 2,
            max_pending_frames: 1,
            device_name: None,
        }
    }
}

/// How the YIN difference function is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifferenceMethod {
    /// Direct O(M·N) summation.
    #[default]
    Direct,
    /// FFT autocorrelation with prefix energy sums.
    Fft,
}

/// Smallest window the estimator will analyse, whatever `min_window` says.
pub const MIN_ANALYSIS_WINDOW: usize = 2048;

/// Pitch estimator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// CMND value below which a dip counts as a candidate period.
    pub threshold: f32,
    /// Windows shorter than this are rejected without analysis. Values below
    /// [`MIN_ANALYSIS_WINDOW`] are raised to it.
    pub min_window: usize,
    /// Upper bound on the number of lags examined.
    pub max_lag: usize,
    pub method: DifferenceMethod,
}

impl EstimatorConfig {
    /// The minimum window actually enforced.
    pub fn effective_min_window(&self) -> usize {
        self.min_window.max(MIN_ANALYSIS_WINDOW)
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.15,
            min_window: 2048,
            max_lag: 2048,
            method: DifferenceMethod::Direct,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub estimator: EstimatorConfig,
    /// Capacity of the sliding sample window.
    pub buffer_capacity: usize,
    /// Initial tuning; the live value is held by a [`SharedTuning`].
    pub tuning: TuningConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            estimator: EstimatorConfig::default(),
            buffer_capacity: 2048,
            tuning: TuningConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Sliding window capacity, never smaller than the estimator's minimum window.
    pub fn effective_buffer_capacity(&self) -> usize {
        self.buffer_capacity.max(self.estimator.effective_min_window())
    }

    /// Loads configuration from a JSON file. Missing fields take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        log::info!("[CONFIG] Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Like [`load_from_file`](Self::load_from_file), falling back to defaults on any error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load_from_file(path).unwrap_or_else(|err| {
            log::warn!("[CONFIG] {err:#}. Using defaults.");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_tuning_at_construction() {
        assert_eq!(
            TuningConfig::new(0.0, 10.0, ScaleSystem::Shruti22),
            Err(TuningError::NonPositiveTonic(0.0))
        );
        assert_eq!(
            TuningConfig::new(-110.0, 10.0, ScaleSystem::Shruti22),
            Err(TuningError::NonPositiveTonic(-110.0))
        );
        assert_eq!(
            TuningConfig::new(110.0, -1.0, ScaleSystem::Shruti22),
            Err(TuningError::NegativeTolerance(-1.0))
        );
        assert_eq!(
            TuningConfig::new(f32::NAN, 10.0, ScaleSystem::Shruti22),
            Err(TuningError::NonFinite)
        );
        assert!(TuningConfig::new(110.0, 0.0, ScaleSystem::Shruti22).is_ok());
    }

    #[test]
    fn deserialization_goes_through_validation() {
        let ok: TuningConfig =
            serde_json::from_str(r#"{"tonic_hz": 220.0, "tolerance_cents": 10.0, "system": "Shruti22"}"#).unwrap();
        assert_eq!(ok.system(), ScaleSystem::Shruti22);

        let bad = serde_json::from_str::<TuningConfig>(r#"{"tonic_hz": -1.0, "tolerance_cents": 10.0}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn shared_tuning_update_keeps_old_value_on_error() {
        let shared = SharedTuning::default();
        let before = shared.get();

        assert!(shared.update(0.0, 10.0, ScaleSystem::JustIntonation12).is_err());
        assert_eq!(shared.get(), before);

        shared.update(220.0, 5.0, ScaleSystem::Shruti22).unwrap();
        let clone = shared.clone();
        assert_eq!(clone.get().tonic_hz(), 220.0);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"estimator": {"method": "fft"}, "capture": {"sample_rate": 48000}}"#).unwrap();

        assert_eq!(config.estimator.method, DifferenceMethod::Fft);
        assert_eq!(config.estimator.threshold, 0.15);
        assert_eq!(config.capture.sample_rate, 48000);
        assert_eq!(config.capture.frame_floor, 1024);
        assert_eq!(config.tuning, TuningConfig::default());
    }

    #[test]
    fn buffer_capacity_never_below_min_window() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.effective_buffer_capacity(), 2048);

        config.buffer_capacity = 4096;
        assert_eq!(config.effective_buffer_capacity(), 4096);

        config.buffer_capacity = 256;
        config.estimator.min_window = 512;
        assert_eq!(config.effective_buffer_capacity(), MIN_ANALYSIS_WINDOW);
    }

    #[test]
    fn min_window_is_raised_to_the_analysis_floor() {
        let small = EstimatorConfig { min_window: 512, ..EstimatorConfig::default() };
        assert_eq!(small.effective_min_window(), 2048);

        let large = EstimatorConfig { min_window: 8192, ..EstimatorConfig::default() };
        assert_eq!(large.effective_min_window(), 8192);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        assert!(PipelineConfig::load_from_file("/nonexistent/swar.json").is_err());
        assert_eq!(PipelineConfig::load_or_default("/nonexistent/swar.json"), PipelineConfig::default());
    }

    #[test]
    fn loads_config_from_json_file() {
        let path = std::env::temp_dir().join(format!("swar-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"buffer_capacity": 3000, "tuning": {"tonic_hz": 146.83, "tolerance_cents": 8.0}}"#)
            .unwrap();

        let config = PipelineConfig::load_from_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(config.buffer_capacity, 3000);
        assert_eq!(config.tuning.tonic_hz(), 146.83);
        assert_eq!(config.tuning.system(), ScaleSystem::JustIntonation12);
    }
}
