//! Dual-acquisition DC-spike correction.
//!
//! Direct-conversion front-ends leave a fixed artifact at baseband DC.
//! The fix is a second capture retuned upward by a known offset: the
//! bins that are corrupted in the primary are clean in the secondary,
//! so the clean region is level-aligned and spliced over the spike.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{EngineError, EngineLink, ACQUIRE_TIMEOUT};
use crate::frame::PsdFrame;
use crate::params::AcquisitionParams;

/// Pause between front-end commands so PLL transients from the previous
/// retune cannot leak into the next capture.
pub const SETTLE: Duration = Duration::from_millis(250);

/// Offset/patch pairs per sample-rate tier.
#[derive(Debug, Clone, Copy)]
pub struct StitchBand {
    pub offset_hz: f64,
    pub patch_bw_hz: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct StitchTiers {
    /// Sample rates at or above this use the wide tier.
    pub wideband_threshold_hz: f64,
    pub wide: StitchBand,
    pub narrow: StitchBand,
}

impl Default for StitchTiers {
    fn default() -> Self {
        StitchTiers {
            wideband_threshold_hz: 4e6,
            wide: StitchBand {
                offset_hz: 2e6,
                patch_bw_hz: 1e6,
            },
            narrow: StitchBand {
                offset_hz: 5e5,
                patch_bw_hz: 2e5,
            },
        }
    }
}

/// Geometry of one splice. Derived from the sample rate at the start of
/// each correction, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct StitchConfig {
    pub offset_hz: f64,
    pub patch_bw_hz: f64,
    /// Bins averaged on each side of the patch start for level alignment.
    pub boundary_window: usize,
    /// Portion of the patch width ramped at each edge.
    pub blend_fraction: f64,
}

impl StitchConfig {
    pub fn for_sample_rate(sample_rate_hz: f64, tiers: &StitchTiers) -> Self {
        let band = if sample_rate_hz >= tiers.wideband_threshold_hz {
            tiers.wide
        } else {
            tiers.narrow
        };
        StitchConfig {
            offset_hz: band.offset_hz,
            patch_bw_hz: band.patch_bw_hz,
            boundary_window: 5,
            blend_fraction: 0.10,
        }
    }
}

pub struct Corrector {
    pub tiers: StitchTiers,
    pub settle: Duration,
    pub acquire_timeout: Duration,
}

impl Default for Corrector {
    fn default() -> Self {
        Corrector {
            tiers: StitchTiers::default(),
            settle: SETTLE,
            acquire_timeout: ACQUIRE_TIMEOUT,
        }
    }
}

impl Corrector {
    /// Acquire the primary and the frequency-offset secondary capture,
    /// strictly in sequence (they share one front-end), and splice out
    /// the DC spike. A timeout aborts the whole cycle; any stitch
    /// geometry failure degrades to the uncorrected primary.
    pub fn correct(
        &self,
        link: &EngineLink,
        params: &AcquisitionParams,
    ) -> Result<PsdFrame, EngineError> {
        let cfg = StitchConfig::for_sample_rate(params.sample_rate_hz, &self.tiers);

        let primary = link.acquire(params, self.acquire_timeout)?;
        thread::sleep(self.settle);

        let shifted = match params.with_center_freq(params.center_freq_hz + cfg.offset_hz) {
            Ok(p) => p,
            Err(e) => {
                warn!(%e, "offset retune not tunable, returning uncorrected frame");
                return Ok(primary);
            }
        };
        let secondary = link.acquire(&shifted, self.acquire_timeout)?;
        thread::sleep(self.settle);

        Ok(stitch(primary, &secondary, &cfg))
    }
}

/// Splice the secondary's clean bins over the primary's DC region.
///
/// Precondition: both captures share the same span and array length;
/// replies that violate this produce an out-of-bounds window and the
/// primary is returned untouched.
pub fn stitch(mut primary: PsdFrame, secondary: &PsdFrame, cfg: &StitchConfig) -> PsdFrame {
    let n = primary.pxx.len();
    let df = primary.bin_hz();

    let bin_shift = (cfg.offset_hz / df).round() as isize;
    let center = n / 2;
    let half_patch = (cfg.patch_bw_hz / df / 2.0).floor() as usize;
    if half_patch == 0 || half_patch > center || center + half_patch > n {
        warn!(n, half_patch, "patch window does not fit, returning uncorrected frame");
        return primary;
    }
    let lo = center - half_patch;
    let hi = center + half_patch;

    // The secondary's center moved up, so the same physical frequencies
    // sit earlier in its array
    let s_lo = lo as isize - bin_shift;
    let s_hi = hi as isize - bin_shift;
    if s_lo < 0 || s_hi as usize > secondary.pxx.len() {
        warn!(bin_shift, s_lo, s_hi, "shifted window outside secondary, returning uncorrected frame");
        return primary;
    }
    let s_lo = s_lo as usize;

    // Level alignment: match the averages just before the patch start
    let b = cfg.boundary_window.min(lo).min(s_lo);
    let db_offset = if b > 0 {
        let p_mean: f64 = primary.pxx[lo - b..lo].iter().sum::<f64>() / b as f64;
        let s_mean: f64 = secondary.pxx[s_lo - b..s_lo].iter().sum::<f64>() / b as f64;
        p_mean - s_mean
    } else {
        0.0
    };
    debug!(bin_shift, lo, hi, db_offset, "stitching DC patch");

    let patch_len = hi - lo;
    let ramp = (patch_len as f64 * cfg.blend_fraction).floor() as usize;
    for j in 0..patch_len {
        // 0->1 over the leading ramp, 1 in the middle, 1->0 over the tail
        let w = if ramp > 0 && j < ramp {
            j as f64 / ramp as f64
        } else if ramp > 0 && j >= patch_len - ramp {
            (patch_len - 1 - j) as f64 / ramp as f64
        } else {
            1.0
        };
        let adjusted = secondary.pxx[s_lo + j] + db_offset;
        primary.pxx[lo + j] = primary.pxx[lo + j] * (1.0 - w) + adjusted * w;
    }
    primary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pxx: Vec<f64>, start: f64, end: f64) -> PsdFrame {
        PsdFrame::new(pxx, start, end, "aa:bb:cc:dd:ee:ff".to_string(), None).unwrap()
    }

    #[test]
    fn test_tier_selection() {
        let tiers = StitchTiers::default();
        let wide = StitchConfig::for_sample_rate(20e6, &tiers);
        assert_eq!(wide.offset_hz, 2e6);
        assert_eq!(wide.patch_bw_hz, 1e6);
        let narrow = StitchConfig::for_sample_rate(2e6, &tiers);
        assert_eq!(narrow.offset_hz, 5e5);
        assert_eq!(narrow.patch_bw_hz, 2e5);
        // Threshold itself is wide-band
        let edge = StitchConfig::for_sample_rate(4e6, &tiers);
        assert_eq!(edge.offset_hz, 2e6);
    }

    // 1000 bins over 10 MHz: df = 10 kHz. offset 2 MHz -> shift 200 bins,
    // patch 1 MHz -> half_patch 50.
    fn cfg() -> StitchConfig {
        StitchConfig {
            offset_hz: 2e6,
            patch_bw_hz: 1e6,
            boundary_window: 5,
            blend_fraction: 0.10,
        }
    }

    #[test]
    fn test_stitch_touches_only_the_patch() {
        let base: Vec<f64> = (0..1000).map(|i| -100.0 + (i % 7) as f64).collect();
        let primary = frame(base.clone(), 910e6, 920e6);
        // Secondary sees the same physical spectrum shifted 200 bins down
        let mut shifted = vec![-120.0; 1000];
        for i in 0..800 {
            shifted[i] = base[i + 200];
        }
        let secondary = frame(shifted, 912e6, 922e6);

        let out = stitch(primary, &secondary, &cfg());
        for (i, (a, b)) in out.pxx.iter().zip(base.iter()).enumerate() {
            if !(450..550).contains(&i) {
                assert_eq!(a, b, "bin {i} outside the patch changed");
            }
        }
        assert_eq!(out.start_freq_hz, 910e6);
        assert_eq!(out.end_freq_hz, 920e6);
    }

    #[test]
    fn test_stitch_replaces_spike_with_aligned_secondary() {
        // Flat floor at -100 with a DC spike in the primary
        let mut base = vec![-100.0f64; 1000];
        for v in base.iter_mut().take(520).skip(480) {
            *v = -40.0;
        }
        let primary = frame(base, 910e6, 920e6);
        // Secondary is spike-free over the patch but 6 dB low overall
        let secondary = frame(vec![-106.0; 1000], 912e6, 922e6);

        let out = stitch(primary, &secondary, &cfg());
        // Level alignment cancels the 6 dB bias, so the patched middle
        // lands back on the floor
        for &v in &out.pxx[460..540] {
            assert!((v + 100.0).abs() < 1e-9, "got {v}");
        }
    }

    #[test]
    fn test_blend_weights_ramp_at_edges() {
        // Primary all zero, aligned secondary all ten: output equals the
        // weight mask scaled by ten
        let mut primary_pxx = vec![0.0f64; 1000];
        // Kill boundary alignment by matching the bins before the patch
        let secondary_pxx = vec![10.0f64; 1000];
        for v in primary_pxx.iter_mut().take(450).skip(445) {
            *v = 10.0;
        }
        let primary = frame(primary_pxx, 910e6, 920e6);
        let secondary = frame(secondary_pxx, 912e6, 922e6);

        let out = stitch(primary, &secondary, &cfg());
        // patch is bins 450..550, ramp is 10 bins on each side
        assert_eq!(out.pxx[450], 0.0); // w = 0
        assert!((out.pxx[455] - 5.0).abs() < 1e-9); // w = 0.5
        assert_eq!(out.pxx[460], 10.0); // w = 1
        assert_eq!(out.pxx[500], 10.0); // middle
        assert_eq!(out.pxx[549], 0.0); // tail w = 0
    }

    #[test]
    fn test_out_of_bounds_window_degrades_to_primary() {
        let base: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let primary = frame(base.clone(), 910e6, 920e6);
        let secondary = frame(vec![0.0; 1000], 912e6, 922e6);
        // Oversized offset pushes the shifted window below zero
        let mut bad = cfg();
        bad.offset_hz = 8e6;
        let out = stitch(primary, &secondary, &bad);
        assert_eq!(out.pxx, base);
    }

    #[test]
    fn test_tiny_patch_degrades_to_primary() {
        let base = vec![1.0f64; 10];
        let primary = frame(base.clone(), 910e6, 920e6);
        let secondary = frame(vec![2.0; 10], 912e6, 922e6);
        // df = 1 MHz, patch 1 MHz -> half_patch = 0
        let out = stitch(primary, &secondary, &cfg());
        assert_eq!(out.pxx, base);
    }
}
