//! Welch averaged-periodogram PSD estimator.
//!
//! Turns a block of complex baseband samples into a two-sided,
//! center-DC power spectral density with a guaranteed upper bound on
//! resolution bandwidth and the unit scaling the collector asked for.

use num_complex::Complex;
use rustfft::FftPlanner;
use thiserror::Error;
use tracing::debug;

use crate::params::{Scale, Window};
use crate::{IqSample, DEFAULT_IMPEDANCE_OHM, LOG_FLOOR};

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error("no samples to estimate from")]
    EmptyInput,
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub center_freq_hz: f64,
    pub sample_rate_hz: f64,
    /// Upper bound on the resolution bandwidth; the actual RBW is
    /// `sample_rate_hz / nperseg` and never exceeds this.
    pub rbw_hz: f64,
    pub window: Window,
    pub overlap: f64,
    pub scale: Scale,
    /// Antenna termination. When set, raw power is divided by it before
    /// any unit conversion; when unset, 50 ohms is assumed only for dBm.
    pub impedance_ohm: Option<f64>,
    pub emit_freq_axis: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EstimateMeta {
    pub nperseg: usize,
    pub actual_rbw_hz: f64,
    pub segments: usize,
}

#[derive(Debug, Clone)]
pub struct Estimate {
    pub freqs: Option<Vec<f64>>,
    pub pxx: Vec<f64>,
    pub meta: EstimateMeta,
}

/// Smallest power of two whose bin width is at or below the requested
/// resolution bandwidth.
pub fn segment_len(sample_rate_hz: f64, rbw_hz: f64) -> usize {
    ((sample_rate_hz / rbw_hz).ceil() as usize).max(1).next_power_of_two()
}

/// Welch PSD over complex input, spectrum-shifted so DC sits at the
/// array midpoint.
pub fn estimate(samples: &[IqSample], cfg: &EstimatorConfig) -> Result<Estimate, EstimateError> {
    if samples.is_empty() {
        return Err(EstimateError::EmptyInput);
    }

    let mut nperseg = segment_len(cfg.sample_rate_hz, cfg.rbw_hz);
    if samples.len() < nperseg {
        // Degraded resolution, not an error
        debug!(
            requested = nperseg,
            available = samples.len(),
            "shrinking segment to sample count"
        );
        nperseg = samples.len();
    }

    // dBFS is referenced to the input's own full scale
    let normalized;
    let input = if cfg.scale == Scale::Dbfs {
        let peak = samples.iter().map(|s| s.norm()).fold(0.0f64, f64::max);
        if peak > 0.0 {
            normalized = samples.iter().map(|s| s / peak).collect::<Vec<_>>();
            &normalized[..]
        } else {
            samples
        }
    } else {
        samples
    };

    let window = window_coeffs(cfg.window, nperseg);
    let win_power: f64 = window.iter().map(|w| w * w).sum();
    let overlap_samples = (nperseg as f64 * cfg.overlap).floor() as usize;
    let step = (nperseg - overlap_samples).max(1);

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(nperseg);
    let mut accum = vec![0.0f64; nperseg];
    let mut buf = vec![Complex::new(0.0, 0.0); nperseg];
    let mut segments = 0usize;

    let mut start = 0usize;
    while start + nperseg <= input.len() {
        for (i, s) in input[start..start + nperseg].iter().enumerate() {
            buf[i] = s * window[i];
        }
        fft.process(&mut buf);
        for (a, x) in accum.iter_mut().zip(buf.iter()) {
            *a += x.norm_sqr() / (cfg.sample_rate_hz * win_power);
        }
        segments += 1;
        start += step;
    }

    for a in accum.iter_mut() {
        *a /= segments as f64;
    }
    // Move the zero-frequency bin to the midpoint
    let half = accum.len() - accum.len() / 2;
    accum.rotate_left(half);

    let pxx = accum.iter().map(|&p| convert(p, cfg)).collect();

    let freqs = cfg.emit_freq_axis.then(|| {
        let df = cfg.sample_rate_hz / nperseg as f64;
        (0..nperseg)
            .map(|i| (i as f64 - (nperseg / 2) as f64) * df + cfg.center_freq_hz)
            .collect()
    });

    Ok(Estimate {
        freqs,
        pxx,
        meta: EstimateMeta {
            nperseg,
            actual_rbw_hz: cfg.sample_rate_hz / nperseg as f64,
            segments,
        },
    })
}

/// Apply the configured unit scaling to one raw density value (V^2/Hz).
fn convert(raw: f64, cfg: &EstimatorConfig) -> f64 {
    let p = match cfg.impedance_ohm {
        Some(r) => raw / r,
        None => raw,
    };
    match cfg.scale {
        Scale::Db => 10.0 * (p + LOG_FLOOR).log10(),
        // Full-scale power is 1.0 after the peak normalization above
        Scale::Dbfs => 10.0 * (p + LOG_FLOOR).log10(),
        Scale::Dbm => {
            let watts = match cfg.impedance_ohm {
                Some(_) => p,
                None => raw / DEFAULT_IMPEDANCE_OHM,
            };
            10.0 * (watts * 1e3 + LOG_FLOOR).log10()
        }
        Scale::V2PerHz => match cfg.impedance_ohm {
            Some(r) => p * r,
            None => raw,
        },
    }
}

fn window_coeffs(window: Window, n: usize) -> Vec<f64> {
    use std::f64::consts::PI;
    if n == 1 {
        return vec![1.0];
    }
    let m = (n - 1) as f64;
    (0..n)
        .map(|i| {
            let x = 2.0 * PI * i as f64 / m;
            match window {
                Window::Rectangular => 1.0,
                Window::Hann => 0.5 * (1.0 - x.cos()),
                Window::Hamming => 0.54 - 0.46 * x.cos(),
                Window::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(scale: Scale) -> EstimatorConfig {
        EstimatorConfig {
            center_freq_hz: 915e6,
            sample_rate_hz: 20e6,
            rbw_hz: 10e3,
            window: Window::Hann,
            overlap: 0.5,
            scale,
            impedance_ohm: None,
            emit_freq_axis: false,
        }
    }

    #[test]
    fn test_segment_len_bounds_rbw() {
        assert_eq!(segment_len(20e6, 10e3), 2048);
        assert!((20e6_f64 / 2048.0 - 9765.625).abs() < 1e-9);
        for &(fs, rbw) in &[(2e6, 1e3), (8e6, 12.5e3), (20e6, 977.0), (2.4e6, 7.3)] {
            let n = segment_len(fs, rbw);
            assert!(n.is_power_of_two());
            assert!(fs / n as f64 <= rbw);
            // One halving up would violate the bound
            assert!(fs / (n / 2) as f64 > rbw);
        }
    }

    #[test]
    fn test_zero_input_stays_finite_in_every_scale() {
        let samples = vec![Complex::new(0.0, 0.0); 4096];
        for scale in [Scale::Db, Scale::Dbm, Scale::Dbfs, Scale::V2PerHz] {
            let est = estimate(&samples, &config(scale)).unwrap();
            assert!(est.pxx.iter().all(|p| p.is_finite()), "{scale:?}");
        }
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(matches!(
            estimate(&[], &config(Scale::Db)),
            Err(EstimateError::EmptyInput)
        ));
    }

    #[test]
    fn test_short_input_degrades_resolution() {
        let samples = vec![Complex::new(1.0, 0.0); 100];
        let est = estimate(&samples, &config(Scale::Db)).unwrap();
        assert_eq!(est.meta.nperseg, 100);
        assert_eq!(est.pxx.len(), 100);
        assert_eq!(est.meta.segments, 1);
    }

    #[test]
    fn test_freq_axis_centered_on_tuned_freq() {
        let mut cfg = config(Scale::Db);
        cfg.emit_freq_axis = true;
        let samples = vec![Complex::new(1.0, 0.0); 8192];
        let est = estimate(&samples, &cfg).unwrap();
        let freqs = est.freqs.unwrap();
        assert_eq!(freqs.len(), est.pxx.len());
        let n = freqs.len();
        // DC bin sits at the midpoint after the shift
        assert_eq!(freqs[n / 2], 915e6);
        assert!(freqs.windows(2).all(|w| w[1] > w[0]));
        let df = 20e6 / n as f64;
        assert!((freqs[1] - freqs[0] - df).abs() < 1e-6);
    }

    #[test]
    fn test_dbfs_is_amplitude_invariant() {
        let loud: Vec<IqSample> = (0..4096)
            .map(|i| Complex::new(5.0 * (i as f64 * 0.01).cos(), 5.0 * (i as f64 * 0.01).sin()))
            .collect();
        let quiet: Vec<IqSample> = loud.iter().map(|s| s * 0.02).collect();
        let a = estimate(&loud, &config(Scale::Dbfs)).unwrap();
        let b = estimate(&quiet, &config(Scale::Dbfs)).unwrap();
        for (x, y) in a.pxx.iter().zip(b.pxx.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_dbm_default_impedance_matches_explicit_50_ohm() {
        let samples: Vec<IqSample> = (0..4096)
            .map(|i| Complex::new((i as f64 * 0.3).cos(), (i as f64 * 0.3).sin()))
            .collect();
        let mut with = config(Scale::Dbm);
        with.impedance_ohm = Some(50.0);
        let a = estimate(&samples, &with).unwrap();
        let b = estimate(&samples, &config(Scale::Dbm)).unwrap();
        for (x, y) in a.pxx.iter().zip(b.pxx.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_dc_energy_lands_at_midpoint() {
        // A pure DC signal concentrates power at the zero-frequency bin
        let samples = vec![Complex::new(1.0, 0.0); 4096];
        let mut cfg = config(Scale::Db);
        cfg.window = Window::Rectangular;
        let est = estimate(&samples, &cfg).unwrap();
        let n = est.pxx.len();
        let (peak_idx, _) = est
            .pxx
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert_eq!(peak_idx, n / 2);
    }

    #[test]
    fn test_window_coeffs() {
        let hann = window_coeffs(Window::Hann, 64);
        assert!(hann[0].abs() < 1e-12);
        assert!((hann[32] - 1.0).abs() < 1e-2);
        let rect = window_coeffs(Window::Rectangular, 8);
        assert!(rect.iter().all(|&w| w == 1.0));
    }
}
