//! # Pitch Detection Module
//!
//! Probabilistic YIN fundamental-frequency estimation over a window of
//! recent samples.
//!
//! ## Steps
//! 1. Difference function `d(τ)` over lags `[0, M)`, `M = min(N/2, max_lag)`
//! 2. Cumulative mean normalized difference `d'(τ)`
//! 3. Candidate periods: strict local minima of `d'` below the threshold,
//!    each with probability `1 − d'(τ)`; the global minimum as a fallback
//! 4. Parabolic interpolation of every candidate for sub-sample periods
//! 5. Best candidate by probability, then moved down to the fundamental
//!    while its period is a whole multiple (two or more) of an earlier one
//! 6. Confidence from dip depth and the margin over the best competing period
//!
//! The estimator holds configuration only. Every call allocates its own
//! scratch buffers, so identical input always gives identical output.

use serde::Serialize;

use crate::config::{DifferenceMethod, EstimatorConfig};
use crate::fft;

/// Share of the confidence given to dip depth; the rest rewards separation.
const DEPTH_WEIGHT: f64 = 0.7;
const SEPARATION_WEIGHT: f64 = 0.3;

/// How far (in periods) a refined period may sit from a whole multiple of
/// another and still describe the same pitch.
const MULTIPLE_TOLERANCE: f64 = 0.1;

/// Result of one estimation: a frequency when the window is periodic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PitchEstimate {
    /// Fundamental frequency in Hz. Always positive when present.
    pub frequency: Option<f32>,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl PitchEstimate {
    /// No periodic pitch in the window.
    pub const NONE: PitchEstimate = PitchEstimate { frequency: None, confidence: 0.0 };

    pub fn is_pitched(&self) -> bool {
        self.frequency.is_some()
    }
}

/// A candidate period found in the CMND curve.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    lag: usize,
    /// Interpolated period in samples.
    period: f64,
    probability: f64,
}

impl Candidate {
    fn at(cmnd: &[f64], lag: usize) -> Self {
        Candidate { lag, period: refine_lag(cmnd, lag), probability: 1.0 - cmnd[lag] }
    }
}

/// Stateless probabilistic YIN estimator.
#[derive(Debug, Clone)]
pub struct PitchEstimator {
    sample_rate: u32,
    config: EstimatorConfig,
}

impl PitchEstimator {
    pub fn new(sample_rate: u32, config: EstimatorConfig) -> Self {
        Self { sample_rate, config }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimates the fundamental frequency of `buffer`.
    ///
    /// # Arguments
    /// * `buffer` - The most recent samples, oldest first. Windows shorter
    ///   than [`EstimatorConfig::effective_min_window`] are not analysed.
    ///
    /// # Returns
    /// * `PitchEstimate { frequency: Some(hz), .. }` - The fundamental and a
    ///   confidence in `[0, 1]`
    /// * [`PitchEstimate::NONE`] - Too few samples or no detectable periodicity
    pub fn estimate(&self, buffer: &[f32]) -> PitchEstimate {
        if buffer.len() < self.config.effective_min_window() {
            return PitchEstimate::NONE;
        }

        let max_lag = (buffer.len() / 2).min(self.config.max_lag);
        let difference = match self.config.method {
            DifferenceMethod::Direct => difference_function(buffer, max_lag),
            DifferenceMethod::Fft => fft::difference_function(buffer, max_lag),
        };
        let cmnd = cumulative_mean_normalized_difference(&difference);

        let candidates = find_candidates(&cmnd, self.config.threshold as f64);
        let Some(best) = select_best(&candidates) else {
            return PitchEstimate::NONE;
        };

        let second_best = candidates
            .iter()
            .filter(|c| !is_period_multiple(c.period, best.period, 1))
            .map(|c| c.probability)
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))));
        let separation = second_best.map_or(1.0, |p| (2.0 * (best.probability - p).abs()).min(1.0));
        let confidence =
            (DEPTH_WEIGHT * (1.0 - cmnd[best.lag]) + SEPARATION_WEIGHT * separation).clamp(0.0, 1.0);

        let frequency = self.sample_rate as f64 / best.period;
        if !frequency.is_finite() || frequency <= 0.0 {
            return PitchEstimate::NONE;
        }

        PitchEstimate {
            frequency: Some(frequency as f32),
            confidence: confidence as f32,
        }
    }
}

/// Direct difference function: `d(τ) = Σ (x[i] − x[i+τ])²` for `i` in `[0, N − τ − 1)`.
pub fn difference_function(signal: &[f32], max_lag: usize) -> Vec<f64> {
    let len = signal.len();
    (0..max_lag.min(len))
        .map(|tau| {
            let terms = len.saturating_sub(tau + 1);
            signal[..terms]
                .iter()
                .zip(&signal[tau..tau + terms])
                .map(|(&a, &b)| {
                    let delta = a as f64 - b as f64;
                    delta * delta
                })
                .sum()
        })
        .collect()
}

/// Normalizes `d(τ)` by its running mean so that smaller always means more periodic.
pub fn cumulative_mean_normalized_difference(difference: &[f64]) -> Vec<f64> {
    let mut cmnd = Vec::with_capacity(difference.len());
    if difference.is_empty() {
        return cmnd;
    }
    cmnd.push(1.0);

    let mut running_sum = 0.0;
    for (tau, &d) in difference.iter().enumerate().skip(1) {
        running_sum += d;
        cmnd.push(if running_sum > 0.0 { d * tau as f64 / running_sum } else { 1.0 });
    }
    cmnd
}

/// Strict local minima below `threshold`, or the global minimum when none qualify.
fn find_candidates(cmnd: &[f64], threshold: f64) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = (2..cmnd.len().saturating_sub(1))
        .filter(|&tau| cmnd[tau] < threshold && cmnd[tau] < cmnd[tau - 1] && cmnd[tau] < cmnd[tau + 1])
        .map(|lag| Candidate::at(cmnd, lag))
        .collect();

    if candidates.is_empty() {
        // First occurrence of the minimum; a flat curve resolves to lag 0 and yields nothing.
        let global_min = cmnd
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (tau, &v)| match best {
                Some((_, min)) if v >= min => best,
                _ => Some((tau, v)),
            });
        if let Some((lag, _)) = global_min {
            if lag >= 2 {
                candidates.push(Candidate::at(cmnd, lag));
            }
        }
    }
    candidates
}

/// Highest-probability candidate (first wins ties), moved down the chain of
/// earlier candidates whose period it is a whole multiple of.
fn select_best(candidates: &[Candidate]) -> Option<Candidate> {
    let mut best = *candidates.first()?;
    for candidate in &candidates[1..] {
        if candidate.probability > best.probability {
            best = *candidate;
        }
    }

    // A dip at k·P is the same pitch as the dip at P, seen k periods later.
    // Each step strictly lowers the lag, so the walk ends.
    while let Some(fundamental) = candidates
        .iter()
        .take_while(|c| c.lag < best.lag)
        .find(|c| is_period_multiple(best.period, c.period, 2))
    {
        best = *fundamental;
    }
    Some(best)
}

/// True when `lag` lies within tolerance of `k · period` for some whole
/// `k ≥ min_multiple`.
fn is_period_multiple(lag: f64, period: f64, min_multiple: u32) -> bool {
    if period <= 0.0 {
        return false;
    }
    let ratio = lag / period;
    let k = ratio.round();
    k >= min_multiple as f64 && (ratio - k).abs() <= MULTIPLE_TOLERANCE
}

/// Parabolic interpolation of the dip at `tau`. Boundary lags are returned as-is.
fn refine_lag(cmnd: &[f64], tau: usize) -> f64 {
    if tau == 0 || tau + 1 >= cmnd.len() {
        return tau as f64;
    }

    let (before, at, after) = (cmnd[tau - 1], cmnd[tau], cmnd[tau + 1]);
    let denominator = 2.0 * (2.0 * at - after - before);
    if denominator.abs() < f64::EPSILON {
        return tau as f64;
    }
    tau as f64 + (after - before) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::sine_wave;
    use proptest::prelude::*;

    const SAMPLE_RATE: u32 = 44100;

    fn estimator() -> PitchEstimator {
        PitchEstimator::new(SAMPLE_RATE, EstimatorConfig::default())
    }

    fn fft_estimator() -> PitchEstimator {
        PitchEstimator::new(
            SAMPLE_RATE,
            EstimatorConfig { method: DifferenceMethod::Fft, ..EstimatorConfig::default() },
        )
    }

    fn estimator_with(method: DifferenceMethod) -> PitchEstimator {
        PitchEstimator::new(SAMPLE_RATE, EstimatorConfig { method, ..EstimatorConfig::default() })
    }

    fn assert_detects(estimator: &PitchEstimator, freq: f32, window: usize) {
        let signal = sine_wave(freq, 0.8, SAMPLE_RATE, window);
        let estimate = estimator.estimate(&signal);

        let detected = estimate.frequency.unwrap_or_else(|| panic!("no pitch for {freq} Hz ({window})"));
        let error = (detected - freq).abs() / freq;
        assert!(error < 0.01, "{freq} Hz detected as {detected} Hz ({window})");
        assert!(estimate.confidence > 0.8, "{freq} Hz confidence {} ({window})", estimate.confidence);
    }

    /// Frequencies from `low` to `high` Hz in `step` Hz increments.
    fn sweep(low: f32, high: f32, step: f32) -> impl Iterator<Item = f32> {
        let count = ((high - low) / step) as usize;
        (0..=count).map(move |i| low + i as f32 * step)
    }

    #[test]
    fn detects_pure_sines_across_the_vocal_range() {
        let estimator = estimator();
        for freq in [80.0, 82.41, 110.0, 146.83, 196.0, 261.63, 440.0, 659.25, 987.77, 1000.0] {
            assert_detects(&estimator, freq, 2048);
        }
    }

    #[test]
    fn high_harmonic_dips_do_not_report_a_subharmonic() {
        // Periods whose integer lag drifts far enough to mislead a k·lag
        // test at high multiples.
        for method in [DifferenceMethod::Direct, DifferenceMethod::Fft] {
            let estimator = estimator_with(method);
            for freq in [653.0, 653.3, 497.7, 730.1, 881.6] {
                assert_detects(&estimator, freq, 2048);
                assert_detects(&estimator, freq, 4096);
            }
        }
    }

    #[test]
    fn fft_sweep_finds_every_sine_in_the_vocal_range() {
        let estimator = fft_estimator();
        for freq in sweep(80.0, 1000.0, 0.7) {
            assert_detects(&estimator, freq, 2048);
            assert_detects(&estimator, freq, 4096);
        }
    }

    #[test]
    fn direct_sweep_finds_every_sine_in_the_vocal_range() {
        let estimator = estimator();
        for freq in sweep(80.0, 1000.0, 3.1) {
            assert_detects(&estimator, freq, 2048);
        }
        for freq in sweep(80.3, 1000.0, 11.3) {
            assert_detects(&estimator, freq, 4096);
        }
    }

    #[test]
    fn interpolation_is_sub_sample_accurate() {
        let signal = sine_wave(440.0, 0.5, SAMPLE_RATE, 2048);
        let detected = estimator().estimate(&signal).frequency.unwrap();
        assert!((detected - 440.0).abs() < 0.5, "{detected}");
    }

    #[test]
    fn short_buffers_are_rejected() {
        let signal = sine_wave(440.0, 0.8, SAMPLE_RATE, 2047);
        assert_eq!(estimator().estimate(&signal), PitchEstimate::NONE);
        assert_eq!(estimator().estimate(&[]), PitchEstimate::NONE);
    }

    #[test]
    fn small_configured_window_still_needs_the_full_analysis_window() {
        let estimator =
            PitchEstimator::new(SAMPLE_RATE, EstimatorConfig { min_window: 512, ..EstimatorConfig::default() });
        let signal = sine_wave(440.0, 0.8, SAMPLE_RATE, 2047);
        assert_eq!(estimator.estimate(&signal), PitchEstimate::NONE);
        assert!(estimator.estimate(&sine_wave(440.0, 0.8, SAMPLE_RATE, 2048)).is_pitched());
    }

    #[test]
    fn silence_has_no_pitch() {
        let estimate = estimator().estimate(&vec![0.0; 2048]);
        assert_eq!(estimate.frequency, None);
        assert_eq!(estimate.confidence, 0.0);
    }

    #[test]
    fn constant_offset_has_no_pitch() {
        assert_eq!(estimator().estimate(&vec![0.25; 4096]).frequency, None);
    }

    #[test]
    fn identical_input_gives_identical_output() {
        let signal = sine_wave(293.66, 0.7, SAMPLE_RATE, 2048);
        let estimator = estimator();
        assert_eq!(estimator.estimate(&signal), estimator.estimate(&signal));
    }

    #[test]
    fn fft_method_agrees_with_direct() {
        for freq in [98.0, 220.0, 523.25] {
            let signal = sine_wave(freq, 0.8, SAMPLE_RATE, 2048);
            let direct = estimator().estimate(&signal).frequency.unwrap();
            let fast = fft_estimator().estimate(&signal).frequency.unwrap();
            assert!((direct - fast).abs() < 0.05, "{freq}: {direct} vs {fast}");
        }
    }

    #[test]
    fn harmonic_rich_tone_reports_its_fundamental() {
        let fundamental = 164.81;
        let signal: Vec<f32> = sine_wave(fundamental, 0.5, SAMPLE_RATE, 2048)
            .iter()
            .zip(sine_wave(fundamental * 2.0, 0.3, SAMPLE_RATE, 2048))
            .zip(sine_wave(fundamental * 3.0, 0.2, SAMPLE_RATE, 2048))
            .map(|((a, b), c)| a + b + c)
            .collect();

        let detected = estimator().estimate(&signal).frequency.unwrap();
        assert!((detected - fundamental).abs() / fundamental < 0.01, "{detected}");
    }

    #[test]
    fn cmnd_starts_at_one_and_handles_zero_energy() {
        assert_eq!(cumulative_mean_normalized_difference(&[0.0, 0.0, 0.0]), vec![1.0, 1.0, 1.0]);
        assert_eq!(cumulative_mean_normalized_difference(&[5.0, 2.0, 2.0]), vec![1.0, 1.0, 1.0]);
        let cmnd = cumulative_mean_normalized_difference(&[0.0, 4.0, 1.0]);
        assert!((cmnd[2] - 0.4).abs() < 1e-12);
        assert!(cumulative_mean_normalized_difference(&[]).is_empty());
    }

    #[test]
    fn candidates_need_a_strict_local_minimum_below_threshold() {
        let cmnd = [1.0, 0.9, 0.5, 0.1, 0.3, 0.05, 0.05, 0.4, 0.12, 0.6];
        let candidates = find_candidates(&cmnd, 0.15);
        let lags: Vec<usize> = candidates.iter().map(|c| c.lag).collect();
        // 5 and 6 tie, so neither is strict.
        assert_eq!(lags, vec![3, 8]);
        assert!((candidates[0].probability - 0.9).abs() < 1e-12);
    }

    #[test]
    fn falls_back_to_global_minimum() {
        let cmnd = [1.0, 0.8, 0.6, 0.4, 0.5, 0.7];
        let fallback = find_candidates(&cmnd, 0.15);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].lag, 3);
        assert!((fallback[0].probability - 0.6).abs() < 1e-12);

        // A global minimum below lag 2 gives nothing.
        let cmnd = [1.0, 0.2, 0.6, 0.7, 0.9];
        assert!(find_candidates(&cmnd, 0.15).is_empty());
    }

    fn candidate(lag: usize, period: f64, probability: f64) -> Candidate {
        Candidate { lag, period, probability }
    }

    #[test]
    fn best_candidate_prefers_first_on_ties_and_the_fundamental_period() {
        let tied = [candidate(10, 10.0, 0.9), candidate(17, 17.0, 0.9)];
        assert_eq!(select_best(&tied).map(|c| c.lag), Some(10));

        let multiples = [candidate(50, 50.0, 0.95), candidate(100, 100.0, 0.99)];
        assert_eq!(select_best(&multiples).map(|c| c.lag), Some(50));

        let unrelated = [candidate(40, 40.0, 0.9), candidate(100, 100.0, 0.99)];
        assert_eq!(select_best(&unrelated).map(|c| c.lag), Some(100));
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn a_nearby_period_is_not_a_fundamental() {
        // 100 / 95 rounds to a single period; only whole multiples of two or
        // more move the choice.
        let neighbours = [candidate(95, 95.0, 0.90), candidate(100, 100.0, 0.99)];
        assert_eq!(select_best(&neighbours).map(|c| c.lag), Some(100));
    }

    #[test]
    fn multiples_are_judged_on_interpolated_periods() {
        // 1013 / 68 is 14.90 periods, but 1012.95 / 67.53 is exactly 15.
        let dips = [candidate(68, 67.53, 0.97), candidate(1013, 1012.95, 0.99)];
        assert_eq!(select_best(&dips).map(|c| c.lag), Some(68));
    }

    #[test]
    fn fundamental_is_found_through_a_chain_of_multiples() {
        // 418 is 4.18 periods of 100, too far off to match directly, but it
        // is twice 209, which is itself about twice 100.
        let chain = [
            candidate(100, 100.0, 0.90),
            candidate(209, 209.0, 0.95),
            candidate(418, 418.0, 0.99),
        ];
        assert_eq!(select_best(&chain).map(|c| c.lag), Some(100));
    }

    #[test]
    fn period_multiples_respect_the_minimum_count() {
        assert!(is_period_multiple(100.0, 95.0, 1));
        assert!(!is_period_multiple(100.0, 95.0, 2));
        assert!(is_period_multiple(201.0, 100.0, 2));
        assert!(!is_period_multiple(215.0, 100.0, 1));
        assert!(!is_period_multiple(100.0, 0.0, 1));
    }

    #[test]
    fn refinement_skips_boundaries() {
        let cmnd = [1.0, 0.5, 0.2, 0.4];
        assert_eq!(refine_lag(&cmnd, 0), 0.0);
        assert_eq!(refine_lag(&cmnd, 3), 3.0);

        // Symmetric neighbours leave the lag untouched.
        assert_eq!(refine_lag(&[1.0, 0.4, 0.1, 0.4], 2), 2.0);
        // A lower right neighbour pulls the minimum right.
        assert!(refine_lag(&[1.0, 0.5, 0.1, 0.3], 2) > 2.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_short_buffer_has_no_pitch(samples in prop::collection::vec(-1.0f32..=1.0, 0..2048)) {
            prop_assert_eq!(estimator().estimate(&samples), PitchEstimate::NONE);
        }

        #[test]
        fn confidence_stays_in_unit_range(samples in prop::collection::vec(-1.0f32..=1.0, 2048)) {
            let estimate = estimator().estimate(&samples);
            prop_assert!((0.0..=1.0).contains(&estimate.confidence));
            if let Some(freq) = estimate.frequency {
                prop_assert!(freq > 0.0 && freq.is_finite());
            } else {
                prop_assert_eq!(estimate.confidence, 0.0);
            }
        }
    }
}
