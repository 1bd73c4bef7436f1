//! # Fast Fourier Transform (FFT) Module
//!
//! FFT-based evaluation of the YIN difference function.
//!
//! The direct difference function costs O(M·N). Expanding the square,
//!
//! ```text
//! d(τ) = Σ x[i]² + Σ x[i+τ]² − 2 Σ x[i]·x[i+τ]      for i in [0, N − τ − 1)
//! ```
//!
//! the two energy terms come from one prefix sum of squares and the cross
//! term is the autocorrelation of the first `N − 1` samples, which one
//! forward and one inverse FFT give for every lag at once. The summation
//! ranges match the direct form exactly, so both agree up to rounding.

use rustfft::{FftPlanner, num_complex::Complex};

/// Computes `d(τ)` for `τ` in `[0, max_lag)` via FFT autocorrelation.
///
/// `max_lag` is clamped to the signal length. Returns an empty vector for
/// signals shorter than two samples.
pub fn difference_function(signal: &[f32], max_lag: usize) -> Vec<f64> {
    let len = signal.len();
    if len < 2 {
        return Vec::new();
    }
    let max_lag = max_lag.min(len);

    // Every lag sums over i in [0, len - τ - 1), so the last sample never
    // appears as x[i] and the series is effectively signal[..len - 1].
    let used = len - 1;

    let mut prefix = Vec::with_capacity(len + 1);
    prefix.push(0.0_f64);
    let mut energy = 0.0_f64;
    for &sample in signal {
        energy += sample as f64 * sample as f64;
        prefix.push(energy);
    }

    let autocorrelation = autocorrelate(&signal[..used]);

    (0..max_lag)
        .map(|tau| {
            if tau >= used {
                return 0.0;
            }
            let terms = used - tau;
            let head = prefix[terms];
            let tail = prefix[used] - prefix[tau];
            // Rounding can push an exact zero slightly negative.
            (head + tail - 2.0 * autocorrelation[tau]).max(0.0)
        })
        .collect()
}

/// Linear (non-circular) autocorrelation `r(τ) = Σ x[i]·x[i+τ]` for every lag.
fn autocorrelate(signal: &[f32]) -> Vec<f64> {
    let len = signal.len();
    // Zero padding to at least 2N keeps the circular correlation from wrapping.
    let fft_len = (2 * len).next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(fft_len);
    let inverse = planner.plan_fft_inverse(fft_len);

    let mut buffer: Vec<Complex<f64>> = signal
        .iter()
        .map(|&sample| Complex { re: sample as f64, im: 0.0 })
        .chain(std::iter::repeat(Complex { re: 0.0, im: 0.0 }))
        .take(fft_len)
        .collect();

    forward.process(&mut buffer);
    for bin in buffer.iter_mut() {
        *bin = Complex { re: bin.norm_sqr(), im: 0.0 };
    }
    inverse.process(&mut buffer);

    // rustfft leaves the inverse unnormalized.
    let scale = fft_len as f64;
    buffer.iter().take(len).map(|c| c.re / scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(signal: &[f32], max_lag: usize) -> Vec<f64> {
        (0..max_lag)
            .map(|tau| {
                (0..signal.len() - tau - 1)
                    .map(|i| {
                        let delta = signal[i] as f64 - signal[i + tau] as f64;
                        delta * delta
                    })
                    .sum()
            })
            .collect()
    }

    #[test]
    fn matches_direct_summation() {
        let signal: Vec<f32> = (0..512)
            .map(|i| {
                let t = i as f32 / 44100.0;
                0.6 * (2.0 * std::f32::consts::PI * 330.0 * t).sin()
                    + 0.2 * (2.0 * std::f32::consts::PI * 990.0 * t).sin()
            })
            .collect();

        let expected = direct(&signal, 256);
        let actual = difference_function(&signal, 256);

        assert_eq!(actual.len(), expected.len());
        for (tau, (a, e)) in actual.iter().zip(&expected).enumerate() {
            assert!((a - e).abs() < 1e-6 * (1.0 + e), "lag {tau}: {a} vs {e}");
        }
    }

    #[test]
    fn lag_zero_is_zero() {
        let signal = [0.3_f32, -0.2, 0.9, 0.1, -0.7, 0.4];
        let d = difference_function(&signal, 3);
        assert!(d[0].abs() < 1e-12);
    }

    #[test]
    fn autocorrelation_of_impulse_pair() {
        let r = autocorrelate(&[1.0, 0.0, 2.0]);
        assert!((r[0] - 5.0).abs() < 1e-9);
        assert!(r[1].abs() < 1e-9);
        assert!((r[2] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn short_signals_yield_nothing() {
        assert!(difference_function(&[], 10).is_empty());
        assert!(difference_function(&[0.5], 10).is_empty());
    }
}
