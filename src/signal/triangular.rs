//! Fourier series of an asymmetric triangular wave.
//!
//! The wave rises linearly from 0 to 1 over `rise_time` and falls back to 0 at the end
//! of `period`. Its series is
//!
//! ```text
//! x(t) = a0 + Σ a_n cos(ω_n t) + b_n sin(ω_n t),   ω_n = 2πn / T
//! a0   = 1/2
//! a_n  = 2 / (T ω_n²) · (cos(ω_n ts) − 1) · (1/ts + 1/(T − ts))
//! b_n  = 2 / (T ω_n²) ·  sin(ω_n ts)      · (1/ts + 1/(T − ts))
//! ```

use super::CommandSequence;
use crate::error::{AppResult, DaqError};
use std::f64::consts::PI;

/// Cosine and sine coefficients of one harmonic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Harmonic {
    pub n: usize,
    pub a: f64,
    pub b: f64,
}

/// Mean value of the wave.
pub const MEAN: f64 = 0.5;

fn check(rise_time: f64, period: f64) -> AppResult<()> {
    if !(period > 0.0 && rise_time > 0.0 && rise_time < period) {
        return Err(DaqError::Configuration(format!(
            "triangular wave needs 0 < rise_time < period (got rise_time={rise_time}, period={period})"
        )));
    }
    Ok(())
}

/// Coefficients of harmonic `n`; `n = 0` yields the mean.
pub fn coefficient(n: usize, rise_time: f64, period: f64) -> AppResult<Harmonic> {
    check(rise_time, period)?;
    if n == 0 {
        return Ok(Harmonic { n, a: MEAN, b: 0.0 });
    }
    let omega = 2.0 * PI * n as f64 / period;
    let k = 2.0 / period / (omega * omega) * (1.0 / rise_time + 1.0 / (period - rise_time));
    let phase = omega * rise_time;
    Ok(Harmonic {
        n,
        a: k * (phase.cos() - 1.0),
        b: k * phase.sin(),
    })
}

/// Harmonics `1..=n_max`.
pub fn coefficients(n_max: usize, rise_time: f64, period: f64) -> AppResult<Vec<Harmonic>> {
    (1..=n_max)
        .map(|n| coefficient(n, rise_time, period))
        .collect()
}

/// Truncated series evaluated at `t`.
pub fn evaluate(harmonics: &[Harmonic], period: f64, t: f64) -> f64 {
    harmonics.iter().fold(MEAN, |acc, h| {
        let omega = 2.0 * PI * h.n as f64 / period;
        acc + h.a * (omega * t).cos() + h.b * (omega * t).sin()
    })
}

/// Sample the truncated series every `sample_time` for `samples` points, scaled to
/// `low..=high`.
pub fn synthesize(
    n_max: usize,
    rise_time: f64,
    period: f64,
    sample_time: f64,
    samples: usize,
    (low, high): (f64, f64),
) -> AppResult<CommandSequence> {
    if sample_time <= 0.0 {
        return Err(DaqError::Configuration(
            "sample_time must be positive".to_string(),
        ));
    }
    let harmonics = coefficients(n_max, rise_time, period)?;
    let values = (0..samples)
        .map(|i| {
            let unit = evaluate(&harmonics, period, i as f64 * sample_time);
            low + (high - low) * unit
        })
        .collect();
    Ok(CommandSequence::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_reconstructs_the_corners() {
        let (ts, period) = (3.0, 10.0);
        let harmonics = coefficients(400, ts, period).unwrap();
        assert!(evaluate(&harmonics, period, 0.0).abs() < 0.01);
        assert!((evaluate(&harmonics, period, ts) - 1.0).abs() < 0.01);
        // Midway up the ramp.
        assert!((evaluate(&harmonics, period, ts / 2.0) - 0.5).abs() < 0.01);
    }

    #[test]
    fn even_harmonics_vanish_for_symmetric_wave() {
        let h = coefficient(2, 5.0, 10.0).unwrap();
        assert!(h.b.abs() < 1e-12);
        assert!(h.a.abs() < 1e-12);
    }

    #[test]
    fn dc_term_is_the_mean() {
        assert_eq!(coefficient(0, 1.0, 4.0).unwrap().a, MEAN);
    }

    #[test]
    fn rejects_degenerate_shapes() {
        assert!(coefficient(1, 0.0, 10.0).is_err());
        assert!(coefficient(1, 10.0, 10.0).is_err());
        assert!(coefficient(1, 1.0, -1.0).is_err());
    }

    #[test]
    fn synthesized_sequence_spans_requested_range() {
        let seq = synthesize(200, 20.0, 60.0, 2.0, 30, (10.0, 50.0)).unwrap();
        assert_eq!(seq.len(), 30);
        let max = seq.values().iter().copied().fold(f64::MIN, f64::max);
        let min = seq.values().iter().copied().fold(f64::MAX, f64::min);
        assert!((max - 50.0).abs() < 0.5);
        assert!((min - 10.0).abs() < 0.5);
    }
}
