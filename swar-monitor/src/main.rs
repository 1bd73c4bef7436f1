//! # Swar Monitor
//!
//! Console front end for the pitch pipeline. Captures from the microphone (or
//! a simulated tone), and prints one line per reading: the detected
//! frequency, its confidence, and the scale degree it lands on relative to
//! the chosen tonic.
//!
//! ## Threads
//! - **Main thread**: argument handling, printing, shutdown
//! - **Capture thread**: owned by the core pipeline; runs estimation per frame
//! - **Stdin thread**: waits for Enter and signals shutdown

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use crossbeam_channel::{Receiver, Sender, after, bounded, never, select};
use log::{error, info};

use swar_core::config::{DifferenceMethod, PipelineConfig};
use swar_core::device::{CpalDevice, list_input_devices};
use swar_core::synthetic::SyntheticDevice;
use swar_core::tuning::TonicPreset;
use swar_core::{CaptureError, PitchObserver, PitchPipeline, PitchReading, ScaleSystem, SharedTuning, TuningConfig};

/// Readings buffered between the capture thread and the printer.
const READING_QUEUE: usize = 32;

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("[MAIN] {err:#}");
            ExitCode::from(1)
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "swar-monitor", about = "Live pitch and scale-degree monitor")]
struct Cli {
    /// JSON pipeline configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Tonic (Sa) frequency in Hz.
    #[arg(long, conflicts_with = "preset")]
    tonic: Option<f32>,
    /// Tonic by note name, e.g. C3 or "C#3".
    #[arg(long)]
    preset: Option<String>,
    /// Allowed deviation in cents before a note counts as flat or sharp.
    #[arg(long)]
    tolerance: Option<f32>,
    /// Tuning system used to name degrees.
    #[arg(long, value_enum)]
    system: Option<SystemArg>,
    /// How the difference function is computed.
    #[arg(long, value_enum)]
    method: Option<MethodArg>,
    /// Play a synthetic sine at this frequency instead of using the microphone.
    #[arg(long, value_name = "HZ")]
    simulate: Option<f32>,
    /// Stop after this many seconds instead of waiting for Enter.
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,
    /// Print readings as JSON objects, one per line.
    #[arg(long, default_value_t = false)]
    json: bool,
    /// Hide readings below this confidence.
    #[arg(long, default_value_t = 0.5)]
    min_confidence: f32,
    /// List input devices and exit.
    #[arg(long, default_value_t = false)]
    list_devices: bool,
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SystemArg {
    Just12,
    Shruti22,
}

impl From<SystemArg> for ScaleSystem {
    fn from(arg: SystemArg) -> Self {
        match arg {
            SystemArg::Just12 => ScaleSystem::JustIntonation12,
            SystemArg::Shruti22 => ScaleSystem::Shruti22,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MethodArg {
    Direct,
    Fft,
}

impl From<MethodArg> for DifferenceMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Direct => DifferenceMethod::Direct,
            MethodArg::Fft => DifferenceMethod::Fft,
        }
    }
}

/// Forwards readings and capture failures to the main thread.
struct MonitorObserver {
    readings: Sender<PitchReading>,
    failures: Sender<String>,
}

impl PitchObserver for MonitorObserver {
    fn publish(&self, reading: &PitchReading) {
        let _ = self.readings.try_send(reading.clone());
    }

    fn capture_failed(&self, error: &CaptureError) {
        let _ = self.failures.try_send(error.to_string());
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.list_devices {
        for name in list_input_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let config = build_config(&cli)?;
    let tuning = SharedTuning::new(config.tuning);

    let (reading_tx, reading_rx) = bounded(READING_QUEUE);
    let (failure_tx, failure_rx) = bounded(1);
    let observer = Arc::new(MonitorObserver { readings: reading_tx, failures: failure_tx });

    let pipeline = match cli.simulate {
        Some(frequency) => {
            if !(frequency.is_finite() && frequency > 0.0) {
                bail!("--simulate needs a positive frequency, got {frequency}");
            }
            info!("[MAIN] Simulating a {frequency} Hz tone");
            PitchPipeline::new(Arc::new(SyntheticDevice::new(frequency)), &config, tuning, observer)
        }
        None => PitchPipeline::new(Arc::new(CpalDevice), &config, tuning, observer),
    };
    log_setup(&pipeline);

    pipeline.start().context("could not start capture")?;

    let (deadline, enter) = match cli.duration {
        Some(secs) => (after(Duration::try_from_secs_f64(secs).context("invalid --duration")?), never()),
        None => {
            eprintln!("Listening. Press Enter to stop.");
            (never(), spawn_enter_listener())
        }
    };

    let outcome = print_readings(&cli, &reading_rx, &failure_rx, &enter, &deadline);
    let stopped = pipeline.stop();
    info!("[MAIN] {} frames dropped", pipeline.dropped_frames());

    outcome?;
    stopped.context("capture ended with an error")?;
    Ok(())
}

/// Loads the config file (if any) and applies command line overrides.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from_file(path)?,
        None => PipelineConfig::default(),
    };

    if let Some(method) = cli.method {
        config.estimator.method = method.into();
    }

    let current = config.tuning;
    let tonic = match (&cli.preset, cli.tonic) {
        (Some(name), _) => {
            TonicPreset::find(name)
                .with_context(|| format!("unknown tonic preset {name:?}"))?
                .frequency
        }
        (None, Some(hz)) => hz,
        (None, None) => current.tonic_hz(),
    };
    let tolerance = cli.tolerance.unwrap_or(current.tolerance_cents());
    let system = cli.system.map_or(current.system(), ScaleSystem::from);
    config.tuning = TuningConfig::new(tonic, tolerance, system).context("invalid tuning")?;

    Ok(config)
}

fn log_setup(pipeline: &PitchPipeline) {
    let tuning = pipeline.tuning().get();
    info!(
        "[MAIN] Tonic {:.2} Hz, {:?}, tolerance {} cents",
        tuning.tonic_hz(),
        tuning.system(),
        tuning.tolerance_cents()
    );
    let estimator = pipeline.estimator().config();
    info!(
        "[MAIN] {:?} difference, threshold {}, window {}+ samples",
        estimator.method,
        estimator.threshold,
        estimator.effective_min_window()
    );
}

fn spawn_enter_listener() -> Receiver<()> {
    let (tx, rx) = bounded(1);
    // Detached: it stays blocked on stdin until the process exits.
    let spawned = thread::Builder::new().name("swar-stdin".into()).spawn(move || {
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_ok() {
            let _ = tx.send(());
        }
    });
    if let Err(err) = spawned {
        error!("[MAIN] Could not watch stdin, stopping: {err}");
    }
    rx
}

fn print_readings(
    cli: &Cli,
    readings: &Receiver<PitchReading>,
    failures: &Receiver<String>,
    enter: &Receiver<()>,
    deadline: &Receiver<std::time::Instant>,
) -> Result<()> {
    let mut stdout = io::stdout().lock();
    loop {
        select! {
            recv(readings) -> msg => {
                let Ok(reading) = msg else { return Ok(()) };
                if reading.estimate.confidence < cli.min_confidence {
                    continue;
                }
                if cli.json {
                    serde_json::to_writer(&mut stdout, &reading)?;
                    writeln!(stdout)?;
                } else {
                    writeln!(stdout, "{}", format_reading(&reading))?;
                }
            }
            recv(failures) -> msg => {
                if let Ok(failure) = msg {
                    bail!("capture stopped: {failure}");
                }
            }
            recv(enter) -> _ => return Ok(()),
            recv(deadline) -> _ => return Ok(()),
        }
    }
}

fn format_reading(reading: &PitchReading) -> String {
    let confidence = reading.estimate.confidence;
    match (reading.estimate.frequency, &reading.degree) {
        (Some(frequency), Some(degree)) => format!(
            "{frequency:8.2} Hz  conf {confidence:.2}  {:<3} {:<6}  {:+6.1} cents  {:?}",
            degree.label,
            format!("{:?}", degree.register),
            degree.cents_deviation,
            degree.classification
        ),
        _ => format!("      -- Hz  conf {confidence:.2}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swar_core::pitch::PitchEstimate;
    use swar_core::tuning::{Accuracy, Register, ScaleDegree};

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("swar-monitor").chain(args.iter().copied()))
    }

    #[test]
    fn overrides_replace_config_defaults() {
        let config = build_config(&parse(&["--preset", "A2", "--tolerance", "10", "--system", "shruti22", "--method", "fft"])).unwrap();
        assert_eq!(config.tuning.tonic_hz(), 110.0);
        assert_eq!(config.tuning.tolerance_cents(), 10.0);
        assert_eq!(config.tuning.system(), ScaleSystem::Shruti22);
        assert_eq!(config.estimator.method, DifferenceMethod::Fft);
    }

    #[test]
    fn defaults_without_overrides() {
        let config = build_config(&parse(&[])).unwrap();
        assert_eq!(config.tuning, TuningConfig::default());
    }

    #[test]
    fn rejects_bad_tuning_and_unknown_presets() {
        assert!(build_config(&parse(&["--tonic", "0"])).is_err());
        assert!(build_config(&parse(&["--preset", "H9"])).is_err());
    }

    #[test]
    fn formats_named_and_unpitched_readings() {
        let named = PitchReading {
            estimate: PitchEstimate { frequency: Some(196.2), confidence: 0.95 },
            degree: Some(ScaleDegree {
                label: "P",
                degree: 8,
                register: Register::Middle,
                target_frequency: 196.215,
                cents_deviation: -0.1,
                classification: Accuracy::Perfect,
            }),
        };
        let line = format_reading(&named);
        assert!(line.contains("196.20 Hz"));
        assert!(line.contains("P"));
        assert!(line.contains("Perfect"));

        let silent = PitchReading { estimate: PitchEstimate::NONE, degree: None };
        assert!(format_reading(&silent).contains("--"));
    }
}
