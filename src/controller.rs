//! One acquisition cycle: fetch parameters, correct, deliver.
//!
//! The cycle itself never panics and never blocks without a timeout;
//! every failure is classed as transient or permanent so the supervising
//! loop can pick the right backoff instead of a catch-all sleep.

use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::corrector::Corrector;
use crate::delivery::{Delivery, DeliveryOutcome, PostError, Poster};
use crate::engine::{EngineError, EngineLink};
use crate::params::AcquisitionParams;
use crate::store::FileStore;

#[derive(Debug, Error)]
pub enum CycleError {
    /// Worth retrying after a short backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Will not succeed until the configuration (or the engine bridge)
    /// changes.
    #[error("permanent: {0}")]
    Permanent(String),
}

pub struct Controller {
    pub params_endpoint: String,
    pub corrector: Corrector,
    pub delivery: Delivery,
    pub store: FileStore,
}

impl Controller {
    pub fn run_cycle(
        &self,
        link: &EngineLink,
        poster: &dyn Poster,
    ) -> Result<DeliveryOutcome, CycleError> {
        let started = Instant::now();
        let raw = poster.get_json(&self.params_endpoint).map_err(|e| {
            let msg = format!("parameter fetch: {e}");
            match e {
                PostError::Network(_) => CycleError::Transient(msg),
                PostError::Payload(_) => CycleError::Permanent(msg),
            }
        })?;
        let rtt_ms = started.elapsed().as_secs_f64() * 1e3;
        if let Err(e) = self.store.put("last_fetch_rtt_ms", rtt_ms) {
            warn!(error = %e, "state store write failed");
        }

        // Reject bad configuration before any hardware command
        let params = AcquisitionParams::from_config(&raw)
            .map_err(|e| CycleError::Permanent(e.to_string()))?;
        debug!(
            center_freq_hz = params.center_freq_hz,
            sample_rate_hz = params.sample_rate_hz,
            "starting acquisition cycle"
        );

        let frame = self.corrector.correct(link, &params).map_err(|e| match e {
            EngineError::Timeout | EngineError::BadReply(_) => {
                CycleError::Transient(e.to_string())
            }
            EngineError::Disconnected => CycleError::Permanent(e.to_string()),
        })?;

        let outcome = self.delivery.deliver(poster, &frame);
        if let Err(e) = self.store.update("cycles_completed", |v| v.unwrap_or(0.0) + 1.0) {
            warn!(error = %e, "state store write failed");
        }
        Ok(outcome)
    }
}
