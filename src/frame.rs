//! A finished spectrum frame and its collector wire format.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("frame has no power values")]
    EmptyPxx,
    #[error("frame span is inverted ({start} .. {end})")]
    InvertedSpan { start: f64, end: f64 },
}

/// One acquired spectrum, owned by exactly one pipeline stage at a time.
///
/// Serializes to the collector payload: `Pxx`, `start_freq_hz`,
/// `end_freq_hz`, `timestamp` (ms since epoch), `mac`, and an optional
/// `campaign_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsdFrame {
    #[serde(rename = "Pxx")]
    pub pxx: Vec<f64>,
    pub start_freq_hz: f64,
    pub end_freq_hz: f64,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    #[serde(rename = "mac")]
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub campaign_id: Option<String>,
}

impl PsdFrame {
    pub fn new(
        pxx: Vec<f64>,
        start_freq_hz: f64,
        end_freq_hz: f64,
        device_id: String,
        campaign_id: Option<String>,
    ) -> Result<Self, FrameError> {
        if pxx.is_empty() {
            return Err(FrameError::EmptyPxx);
        }
        if end_freq_hz <= start_freq_hz {
            return Err(FrameError::InvertedSpan {
                start: start_freq_hz,
                end: end_freq_hz,
            });
        }
        Ok(PsdFrame {
            pxx,
            start_freq_hz,
            end_freq_hz,
            timestamp_ms: Utc::now().timestamp_millis(),
            device_id,
            campaign_id,
        })
    }

    /// Width of one bin in Hz.
    pub fn bin_hz(&self) -> f64 {
        (self.end_freq_hz - self.start_freq_hz) / self.pxx.len() as f64
    }

    /// The frame's natural ordering key and unique id on disk.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.timestamp_ms)
    }
}
