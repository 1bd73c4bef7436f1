//! # Tuning Module
//!
//! Maps a detected frequency onto the nearest scale degree (swar) relative to
//! a tonic (Sa), in one of two tuning systems, across three octave registers.
//!
//! ## Features
//! - Ordered ratio tables for 12-tone just intonation and the 22 shrutis
//! - Exhaustive nearest-target search in log-frequency (cents) space
//! - Signed cents deviation and tolerance classification
//! - The standard set of tonic presets (G#2 to A#3)
//!
//! The tables are slices, not maps: search order is the table order, so ties
//! between equidistant targets always resolve to the earlier entry.

use serde::{Deserialize, Serialize};

use crate::config::TuningConfig;

/// One named degree of a tuning table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleEntry {
    /// Degree label (e.g. "S", "r", "R", "g2").
    pub label: &'static str,
    /// Frequency ratio to the tonic, within one octave.
    pub ratio: f64,
}

const fn entry(label: &'static str, num: f64, den: f64) -> ScaleEntry {
    ScaleEntry { label, ratio: num / den }
}

/// Twelve just-intonation swars in chromatic order.
pub const JUST_INTONATION_12: [ScaleEntry; 12] = [
    entry("S", 1.0, 1.0),
    entry("r", 16.0, 15.0), // komal Re
    entry("R", 9.0, 8.0),   // shuddh Re
    entry("g", 6.0, 5.0),   // komal Ga
    entry("G", 5.0, 4.0),   // shuddh Ga
    entry("m", 4.0, 3.0),   // shuddh Ma
    entry("M", 45.0, 32.0), // teevra Ma
    entry("P", 3.0, 2.0),
    entry("d", 8.0, 5.0),   // komal Dha
    entry("D", 5.0, 3.0),   // shuddh Dha
    entry("n", 16.0, 9.0),  // komal Ni
    entry("N", 15.0, 8.0),  // shuddh Ni
];

/// The 22 shrutis in ascending order.
pub const SHRUTI_22: [ScaleEntry; 22] = [
    entry("S", 1.0, 1.0),
    entry("r1", 256.0, 243.0),
    entry("r2", 16.0, 15.0),
    entry("R1", 10.0, 9.0),
    entry("R2", 9.0, 8.0),
    entry("g1", 32.0, 27.0),
    entry("g2", 6.0, 5.0),
    entry("G1", 5.0, 4.0),
    entry("G2", 81.0, 64.0),
    entry("m1", 4.0, 3.0),
    entry("m2", 27.0, 20.0),
    entry("M1", 45.0, 32.0),
    entry("M2", 729.0, 512.0),
    entry("P", 3.0, 2.0),
    entry("d1", 128.0, 81.0),
    entry("d2", 8.0, 5.0),
    entry("D1", 5.0, 3.0),
    entry("D2", 27.0, 16.0),
    entry("n1", 16.0, 9.0),
    entry("n2", 9.0, 5.0),
    entry("N1", 15.0, 8.0),
    entry("N2", 243.0, 128.0),
];

/// Which ratio table the mapper searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScaleSystem {
    #[default]
    JustIntonation12,
    Shruti22,
}

impl ScaleSystem {
    /// The ordered ratio table for this system.
    pub fn table(self) -> &'static [ScaleEntry] {
        match self {
            ScaleSystem::JustIntonation12 => &JUST_INTONATION_12,
            ScaleSystem::Shruti22 => &SHRUTI_22,
        }
    }
}

/// Octave register (saptak) relative to the tonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Register {
    Lower,
    Middle,
    Upper,
}

impl Register {
    /// Search order of the registers.
    pub const ALL: [Register; 3] = [Register::Lower, Register::Middle, Register::Upper];

    /// Octave multiplier applied to the tonic for this register.
    pub fn multiplier(self) -> f64 {
        match self {
            Register::Lower => 0.5,
            Register::Middle => 1.0,
            Register::Upper => 2.0,
        }
    }
}

/// Tolerance classification of a cents deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accuracy {
    Perfect,
    Flat,
    Sharp,
}

impl Accuracy {
    /// Classifies `cents` against `tolerance`. The Perfect band is inclusive.
    pub fn classify(cents: f32, tolerance: f32) -> Accuracy {
        if cents.abs() <= tolerance {
            Accuracy::Perfect
        } else if cents < 0.0 {
            Accuracy::Flat
        } else {
            Accuracy::Sharp
        }
    }
}

/// The nearest scale degree to a detected frequency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleDegree {
    /// Degree label from the active table.
    pub label: &'static str,
    /// 1-based position of the degree in its table (the swar number).
    pub degree: usize,
    pub register: Register,
    /// Frequency of the winning target in Hz.
    pub target_frequency: f32,
    /// Signed deviation from the target: positive = sharp, negative = flat.
    pub cents_deviation: f32,
    pub classification: Accuracy,
}

/// Calculates the deviation of `freq` from `target_freq` in cents.
///
/// Positive values indicate sharpness, negative values flatness.
pub fn cents_between(freq: f32, target_freq: f32) -> f32 {
    (1200.0 * (freq as f64 / target_freq as f64).log2()) as f32
}

/// Finds the scale degree nearest to `frequency` under `tuning`.
///
/// Every table entry is tried in every register; the target with the smallest
/// absolute cents distance wins, earlier candidates winning exact ties.
///
/// # Arguments
/// * `frequency` - A detected pitch in Hz. Must be positive.
/// * `tuning` - Tonic, tolerance and scale system. The tonic is positive by
///   construction of [`TuningConfig`].
///
/// # Returns
/// * The nearest [`ScaleDegree`], with its register, target frequency,
///   signed cents deviation and accuracy class
pub fn map_frequency(frequency: f32, tuning: &TuningConfig) -> ScaleDegree {
    debug_assert!(frequency > 0.0, "frequency must be positive, got {frequency}");

    let freq = frequency as f64;
    let tonic = tuning.tonic_hz() as f64;
    let table = tuning.system().table();

    let (mut index, mut register, mut target) = (0, Register::Lower, tonic * table[0].ratio * 0.5);
    let mut best_distance = f64::INFINITY;
    for (i, entry) in table.iter().enumerate() {
        for reg in Register::ALL {
            let candidate = tonic * entry.ratio * reg.multiplier();
            let distance = (1200.0 * (freq / candidate).log2()).abs();
            // Strict comparison: the first of two equidistant targets is kept.
            if distance < best_distance {
                (index, register, target) = (i, reg, candidate);
                best_distance = distance;
            }
        }
    }

    let cents_deviation = (1200.0 * (freq / target).log2()) as f32;

    ScaleDegree {
        label: table[index].label,
        degree: index + 1,
        register,
        target_frequency: target as f32,
        cents_deviation,
        classification: Accuracy::classify(cents_deviation, tuning.tolerance_cents()),
    }
}

/// A standard tonic (Sa) choice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TonicPreset {
    pub name: &'static str,
    pub frequency: f32,
}

impl TonicPreset {
    /// The fifteen tonic choices from G#2 to A#3.
    pub const ALL: [TonicPreset; 15] = [
        TonicPreset { name: "G#2", frequency: 103.83 },
        TonicPreset { name: "A2", frequency: 110.00 },
        TonicPreset { name: "A#2", frequency: 116.54 },
        TonicPreset { name: "B2", frequency: 123.47 },
        TonicPreset { name: "C3", frequency: 130.81 },
        TonicPreset { name: "C#3", frequency: 138.59 },
        TonicPreset { name: "D3", frequency: 146.83 },
        TonicPreset { name: "D#3", frequency: 155.56 },
        TonicPreset { name: "E3", frequency: 164.81 },
        TonicPreset { name: "F3", frequency: 174.61 },
        TonicPreset { name: "F#3", frequency: 185.00 },
        TonicPreset { name: "G3", frequency: 196.00 },
        TonicPreset { name: "G#3", frequency: 207.65 },
        TonicPreset { name: "A3", frequency: 220.00 },
        TonicPreset { name: "A#3", frequency: 233.08 },
    ];

    /// Looks a preset up by name. Case-insensitive; "Cs3" and "C#3" are equivalent.
    pub fn find(name: &str) -> Option<TonicPreset> {
        let wanted = normalize_preset_name(name);
        Self::ALL
            .iter()
            .copied()
            .find(|preset| normalize_preset_name(preset.name) == wanted)
    }
}

fn normalize_preset_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('#', "s")
}
