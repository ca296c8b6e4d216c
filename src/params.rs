//! Validation boundary between the loosely-typed configuration served by
//! the collector and the strongly-typed acquisition parameters the rest
//! of the node runs on. Everything is range-checked here, before any
//! hardware command is issued.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// Front-end tuning and gain limits
pub const MIN_CENTER_FREQ_HZ: f64 = 1e6;
pub const MAX_CENTER_FREQ_HZ: f64 = 6e9;
pub const MIN_SAMPLE_RATE_HZ: f64 = 2e6;
pub const MAX_SAMPLE_RATE_HZ: f64 = 20e6;
pub const LNA_GAIN_MAX_DB: u32 = 40;
pub const LNA_GAIN_STEP_DB: u32 = 8;
pub const VGA_GAIN_MAX_DB: u32 = 62;
pub const VGA_GAIN_STEP_DB: u32 = 2;
pub const ANTENNA_PORTS: [u8; 3] = [0, 1, 2];
pub const MAX_PPM_ERROR: i32 = 100;

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("missing configuration key `{0}`")]
    MissingKey(&'static str),
    #[error("configuration key `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("center frequency {0} Hz outside tunable range")]
    CenterFreqOutOfRange(f64),
    #[error("sample rate {0} Hz outside supported range")]
    SampleRateOutOfRange(f64),
    #[error("resolution bandwidth {0} Hz must be positive")]
    BadRbw(f64),
    #[error("span {0} Hz must be positive")]
    BadSpan(f64),
    #[error("overlap {0} outside [0, 1)")]
    OverlapOutOfRange(f64),
    #[error("LNA gain {0} dB not a multiple of {LNA_GAIN_STEP_DB} within 0..={LNA_GAIN_MAX_DB}")]
    BadLnaGain(u32),
    #[error("VGA gain {0} dB not a multiple of {VGA_GAIN_STEP_DB} within 0..={VGA_GAIN_MAX_DB}")]
    BadVgaGain(u32),
    #[error("antenna port {0} not one of {ANTENNA_PORTS:?}")]
    BadAntennaPort(u8),
    #[error("ppm error {0} outside ±{MAX_PPM_ERROR}")]
    BadPpmError(i32),
    #[error("unknown scale `{0}`")]
    UnknownScale(String),
    #[error("unknown window `{0}`")]
    UnknownWindow(String),
}

/// Output unit for PSD values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scale {
    Dbm,
    Dbfs,
    Db,
    V2PerHz,
}

impl FromStr for Scale {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dBm" => Ok(Scale::Dbm),
            "dBFS" => Ok(Scale::Dbfs),
            "dB" => Ok(Scale::Db),
            "V2/Hz" => Ok(Scale::V2PerHz),
            other => Err(ParamError::UnknownScale(other.to_string())),
        }
    }
}

/// Tapering function applied to each averaging segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Window {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl FromStr for Window {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rectangular" | "boxcar" => Ok(Window::Rectangular),
            "hann" | "hanning" => Ok(Window::Hann),
            "hamming" => Ok(Window::Hamming),
            "blackman" => Ok(Window::Blackman),
            other => Err(ParamError::UnknownWindow(other.to_string())),
        }
    }
}

/// One acquisition's worth of front-end and estimator settings.
/// Immutable once the acquisition starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParams {
    pub center_freq_hz: f64,
    pub sample_rate_hz: f64,
    pub rbw_hz: f64,
    pub span_hz: f64,
    pub window: Window,
    pub overlap: f64,
    pub scale: Scale,
    pub lna_gain: u32,
    pub vga_gain: u32,
    pub antenna_amp: bool,
    pub antenna_port: u8,
    pub ppm_error: i32,
}

impl AcquisitionParams {
    /// Validate a loosely-typed configuration object into typed,
    /// range-checked parameters. Every violation is rejected here,
    /// before any acquisition is attempted.
    pub fn from_config(cfg: &Value) -> Result<Self, ParamError> {
        let center_freq_hz = req_f64(cfg, "center_freq_hz")?;
        if !(MIN_CENTER_FREQ_HZ..=MAX_CENTER_FREQ_HZ).contains(&center_freq_hz) {
            return Err(ParamError::CenterFreqOutOfRange(center_freq_hz));
        }
        let sample_rate_hz = req_f64(cfg, "sample_rate_hz")?;
        if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&sample_rate_hz) {
            return Err(ParamError::SampleRateOutOfRange(sample_rate_hz));
        }
        let rbw_hz = opt_f64(cfg, "rbw_hz")?.unwrap_or(10_000.0);
        if rbw_hz <= 0.0 {
            return Err(ParamError::BadRbw(rbw_hz));
        }
        let span_hz = opt_f64(cfg, "span_hz")?.unwrap_or(sample_rate_hz);
        if span_hz <= 0.0 {
            return Err(ParamError::BadSpan(span_hz));
        }
        let overlap = opt_f64(cfg, "overlap")?.unwrap_or(0.5);
        if !(0.0..1.0).contains(&overlap) {
            return Err(ParamError::OverlapOutOfRange(overlap));
        }
        let window = opt_str(cfg, "window")?.unwrap_or("hann").parse()?;
        let scale = opt_str(cfg, "scale")?.unwrap_or("dBm").parse()?;
        let lna_gain = opt_u32(cfg, "lna_gain")?.unwrap_or(16);
        if lna_gain > LNA_GAIN_MAX_DB || lna_gain % LNA_GAIN_STEP_DB != 0 {
            return Err(ParamError::BadLnaGain(lna_gain));
        }
        let vga_gain = opt_u32(cfg, "vga_gain")?.unwrap_or(20);
        if vga_gain > VGA_GAIN_MAX_DB || vga_gain % VGA_GAIN_STEP_DB != 0 {
            return Err(ParamError::BadVgaGain(vga_gain));
        }
        let antenna_port = opt_u32(cfg, "antenna_port")?.unwrap_or(0) as u8;
        if !ANTENNA_PORTS.contains(&antenna_port) {
            return Err(ParamError::BadAntennaPort(antenna_port));
        }
        let ppm_error = opt_i64(cfg, "ppm_error")?.unwrap_or(0) as i32;
        if ppm_error.abs() > MAX_PPM_ERROR {
            return Err(ParamError::BadPpmError(ppm_error));
        }
        Ok(AcquisitionParams {
            center_freq_hz,
            sample_rate_hz,
            rbw_hz,
            span_hz,
            window,
            overlap,
            scale,
            lna_gain,
            vga_gain,
            antenna_amp: cfg.get("antenna_amp").and_then(Value::as_bool).unwrap_or(false),
            antenna_port,
            ppm_error,
        })
    }

    /// Copy of these parameters retuned to a different center frequency,
    /// re-checked against the tunable range.
    pub fn with_center_freq(&self, center_freq_hz: f64) -> Result<Self, ParamError> {
        if !(MIN_CENTER_FREQ_HZ..=MAX_CENTER_FREQ_HZ).contains(&center_freq_hz) {
            return Err(ParamError::CenterFreqOutOfRange(center_freq_hz));
        }
        let mut shifted = self.clone();
        shifted.center_freq_hz = center_freq_hz;
        Ok(shifted)
    }
}

fn req_f64(cfg: &Value, key: &'static str) -> Result<f64, ParamError> {
    cfg.get(key)
        .ok_or(ParamError::MissingKey(key))?
        .as_f64()
        .ok_or(ParamError::WrongType(key))
}

fn opt_f64(cfg: &Value, key: &'static str) -> Result<Option<f64>, ParamError> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or(ParamError::WrongType(key)),
    }
}

fn opt_u32(cfg: &Value, key: &'static str) -> Result<Option<u32>, ParamError> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or(ParamError::WrongType(key)),
    }
}

fn opt_i64(cfg: &Value, key: &'static str) -> Result<Option<i64>, ParamError> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or(ParamError::WrongType(key)),
    }
}

fn opt_str<'a>(cfg: &'a Value, key: &'static str) -> Result<Option<&'a str>, ParamError> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_str().map(Some).ok_or(ParamError::WrongType(key)),
    }
}
