//! Request/reply link to the external acquisition engine.
//!
//! The engine owns the radio front-end and runs out of process; this
//! side holds one end of a pair of bounded channels and imposes the
//! timeouts. Replies carry either a ready-made PSD or raw IQ samples,
//! in which case the estimator runs here with the requested settings.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::estimator::{estimate, EstimatorConfig};
use crate::frame::PsdFrame;
use crate::params::AcquisitionParams;

/// How long one full acquisition may take before the cycle aborts.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(20);
/// Budget for lighter realtime queries against the engine.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("acquisition engine timed out")]
    Timeout,
    #[error("acquisition engine channel closed")]
    Disconnected,
    #[error("unusable engine reply: {0}")]
    BadReply(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    pub params: AcquisitionParams,
}

/// What comes back over the channel for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineReply {
    /// Engine already reduced the capture to a PSD
    Psd {
        pxx: Vec<f64>,
        start_freq_hz: f64,
        end_freq_hz: f64,
    },
    /// Raw complex samples, interleaved as (re, im) pairs
    Iq { samples: Vec<(f64, f64)> },
}

/// Far-side endpoints, handed to whatever bridges the engine process.
pub struct EngineServer {
    pub requests: Receiver<EngineRequest>,
    pub replies: Sender<EngineReply>,
}

/// Near side of the engine channel. The only blocking operation in the
/// acquisition path, and it always carries a timeout.
pub struct EngineLink {
    requests: Sender<EngineRequest>,
    replies: Receiver<EngineReply>,
    device_id: String,
    campaign_id: Option<String>,
}

impl EngineLink {
    /// Build both ends of the link. `capacity` bounds in-flight requests;
    /// the cycle is sequential so 1 is the normal choice.
    pub fn pair(
        capacity: usize,
        device_id: String,
        campaign_id: Option<String>,
    ) -> (EngineLink, EngineServer) {
        let (req_tx, req_rx) = bounded(capacity);
        let (rep_tx, rep_rx) = bounded(capacity);
        (
            EngineLink {
                requests: req_tx,
                replies: rep_rx,
                device_id,
                campaign_id,
            },
            EngineServer {
                requests: req_rx,
                replies: rep_tx,
            },
        )
    }

    /// Command one capture and wait for its spectrum, at most `timeout`.
    pub fn acquire(
        &self,
        params: &AcquisitionParams,
        timeout: Duration,
    ) -> Result<PsdFrame, EngineError> {
        let request = EngineRequest {
            params: params.clone(),
        };
        self.requests
            .send_timeout(request, timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => EngineError::Timeout,
                SendTimeoutError::Disconnected(_) => EngineError::Disconnected,
            })?;
        let reply = self.replies.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => EngineError::Timeout,
            RecvTimeoutError::Disconnected => EngineError::Disconnected,
        })?;
        self.frame_from(reply, params)
    }

    fn frame_from(
        &self,
        reply: EngineReply,
        params: &AcquisitionParams,
    ) -> Result<PsdFrame, EngineError> {
        let (pxx, start, end) = match reply {
            EngineReply::Psd {
                pxx,
                start_freq_hz,
                end_freq_hz,
            } => (pxx, start_freq_hz, end_freq_hz),
            EngineReply::Iq { samples } => {
                let iq: Vec<_> = samples
                    .into_iter()
                    .map(|(re, im)| Complex::new(re, im))
                    .collect();
                let cfg = EstimatorConfig {
                    center_freq_hz: params.center_freq_hz,
                    sample_rate_hz: params.sample_rate_hz,
                    rbw_hz: params.rbw_hz,
                    window: params.window,
                    overlap: params.overlap,
                    scale: params.scale,
                    impedance_ohm: None,
                    emit_freq_axis: false,
                };
                let est = estimate(&iq, &cfg).map_err(|e| EngineError::BadReply(e.to_string()))?;
                let half_span = params.sample_rate_hz / 2.0;
                (
                    est.pxx,
                    params.center_freq_hz - half_span,
                    params.center_freq_hz + half_span,
                )
            }
        };
        PsdFrame::new(
            pxx,
            start,
            end,
            self.device_id.clone(),
            self.campaign_id.clone(),
        )
        .map_err(|e| EngineError::BadReply(e.to_string()))
    }
}
