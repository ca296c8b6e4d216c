//! Durable delivery of finished frames to the collector.
//!
//! Every frame ends in exactly one of three terminal states: delivered,
//! queued for retry, or dropped with a logged reason. Delivered frames
//! get a best-effort historic copy governed by a disk-usage watermark;
//! failed frames land in a hard-capped retry queue that evicts its
//! single oldest entry rather than ever refusing the newest frame.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame::PsdFrame;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_QUEUE_CAP: usize = 50;
pub const DEFAULT_EVICT_BATCH: usize = 10;
pub const DEFAULT_HIGH_WATERMARK: f64 = 0.8;

#[derive(Debug, Error)]
pub enum PostError {
    /// Connection refused, timeout, or a server-side (5xx) response.
    /// Worth retrying later.
    #[error("network: {0}")]
    Network(String),
    /// The collector rejected the request (4xx) or the payload could
    /// not be encoded. Retrying the same bytes will not help.
    #[error("payload: {0}")]
    Payload(String),
}

impl PostError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PostError::Network(_))
    }
}

/// The node's one outward interface. Kept narrow so the pipeline and
/// the retry processor can be driven by a scripted stand-in under test.
pub trait Poster: Send + Sync {
    fn post_json(&self, url: &str, body: &Value) -> Result<(), PostError>;
    fn get_json(&self, url: &str) -> Result<Value, PostError>;
}

/// Blocking reqwest client with bounded connect/read timeouts.
pub struct HttpPoster {
    client: reqwest::blocking::Client,
}

impl HttpPoster {
    pub fn new() -> Result<Self, PostError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| PostError::Network(e.to_string()))?;
        Ok(HttpPoster { client })
    }
}

impl Poster for HttpPoster {
    fn post_json(&self, url: &str, body: &Value) -> Result<(), PostError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| PostError::Network(e.to_string()))?;
        status_check(resp.status())
    }

    fn get_json(&self, url: &str) -> Result<Value, PostError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| PostError::Network(e.to_string()))?;
        status_check(resp.status())?;
        resp.json().map_err(|e| PostError::Payload(e.to_string()))
    }
}

fn status_check(status: reqwest::StatusCode) -> Result<(), PostError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() {
        Err(PostError::Payload(format!("collector rejected request: {status}")))
    } else {
        Err(PostError::Network(format!("collector returned {status}")))
    }
}

/// Fraction of the filesystem under `dir` currently in use.
pub trait DiskGauge: Send + Sync {
    fn usage_fraction(&self, dir: &Path) -> io::Result<f64>;
}

pub struct StatvfsGauge;

impl DiskGauge for StatvfsGauge {
    fn usage_fraction(&self, dir: &Path) -> io::Result<f64> {
        let stats = fs2::statvfs(dir)?;
        Ok(1.0 - stats.available_space() as f64 / stats.total_space() as f64)
    }
}

/// Terminal state of one frame's lifecycle.
#[derive(Debug, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    Queued,
    Dropped(String),
}

/// Whether the historic copy of a delivered frame was written.
/// `Skipped` is a documented degradation, never an error.
#[derive(Debug, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Saved,
    Skipped,
}

pub struct Delivery {
    pub endpoint: String,
    pub queue_dir: PathBuf,
    pub historic_dir: PathBuf,
    /// Hard cap on queued entries, enforced at insertion.
    pub queue_cap: usize,
    /// Historic entries evicted per reclaim attempt.
    pub evict_batch: usize,
    /// Disk usage fraction above which historic copies stop.
    pub high_watermark: f64,
    pub gauge: Box<dyn DiskGauge>,
}

impl Delivery {
    pub fn new(endpoint: String, queue_dir: PathBuf, historic_dir: PathBuf) -> Self {
        Delivery {
            endpoint,
            queue_dir,
            historic_dir,
            queue_cap: DEFAULT_QUEUE_CAP,
            evict_batch: DEFAULT_EVICT_BATCH,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            gauge: Box::new(StatvfsGauge),
        }
    }

    /// Drive one frame to its terminal state.
    pub fn deliver(&self, poster: &dyn Poster, frame: &PsdFrame) -> DeliveryOutcome {
        let body = match serde_json::to_value(frame) {
            Ok(body) => body,
            Err(e) => return DeliveryOutcome::Dropped(format!("encode: {e}")),
        };
        match poster.post_json(&self.endpoint, &body) {
            Ok(()) => {
                // Delivery already succeeded; the archive is best-effort
                match self.archive(frame) {
                    Ok(ArchiveOutcome::Saved) => debug!(entry = %frame.file_name(), "archived"),
                    Ok(ArchiveOutcome::Skipped) => {
                        info!(entry = %frame.file_name(), "historic archive over quota, copy skipped")
                    }
                    Err(e) => warn!(error = %e, "historic archive failed"),
                }
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                warn!(error = %e, "delivery failed, queuing for retry");
                match self.enqueue(frame) {
                    Ok(()) => DeliveryOutcome::Queued,
                    Err(e) => DeliveryOutcome::Dropped(format!("enqueue: {e}")),
                }
            }
        }
    }

    /// Persist a historic copy unless disk usage sits at or above the
    /// watermark; evict a batch of oldest entries and re-check once
    /// before giving up.
    fn archive(&self, frame: &PsdFrame) -> io::Result<ArchiveOutcome> {
        fs::create_dir_all(&self.historic_dir)?;
        let bytes = encode(frame)?;
        let target = self.historic_dir.join(frame.file_name());

        if self.gauge.usage_fraction(&self.historic_dir)? < self.high_watermark {
            atomic_write(&target, &bytes)?;
            return Ok(ArchiveOutcome::Saved);
        }
        for old in list_entries(&self.historic_dir)?.iter().take(self.evict_batch) {
            debug!(entry = %old.display(), "evicting historic entry");
            fs::remove_file(old)?;
        }
        if self.gauge.usage_fraction(&self.historic_dir)? < self.high_watermark {
            atomic_write(&target, &bytes)?;
            return Ok(ArchiveOutcome::Saved);
        }
        Ok(ArchiveOutcome::Skipped)
    }

    /// Append to the retry queue, evicting the single oldest entry when
    /// at capacity. The cap is never exceeded, even transiently.
    fn enqueue(&self, frame: &PsdFrame) -> io::Result<()> {
        fs::create_dir_all(&self.queue_dir)?;
        let mut entries = list_entries(&self.queue_dir)?;
        while entries.len() >= self.queue_cap {
            let oldest = entries.remove(0);
            warn!(evicted = %oldest.display(), "retry queue at capacity");
            fs::remove_file(&oldest)?;
        }
        atomic_write(&self.queue_dir.join(frame.file_name()), &encode(frame)?)
    }
}

fn encode(frame: &PsdFrame) -> io::Result<Vec<u8>> {
    serde_json::to_vec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write-to-temp, flush to stable storage, rename over the target.
/// A reader listing the directory never observes a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Entries of a queue/historic directory, oldest first. Ordering key is
/// the filename-encoded timestamp, falling back to mtime when the name
/// does not parse. Dotfiles and in-flight `.tmp` files are ignored.
pub fn list_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut keyed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if name.starts_with('.') || name.ends_with(".tmp") {
            continue;
        }
        let key = match name.strip_suffix(".json").and_then(|s| s.parse::<i64>().ok()) {
            Some(ts) => ts,
            None => entry
                .metadata()?
                .modified()
                .ok()
                .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(i64::MAX),
        };
        keyed.push((key, path));
    }
    keyed.sort();
    Ok(keyed.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedPoster {
        // Front of the queue is the next outcome; empty means success
        outcomes: Mutex<VecDeque<Result<(), PostError>>>,
    }

    impl ScriptedPoster {
        fn new(outcomes: Vec<Result<(), PostError>>) -> Self {
            ScriptedPoster {
                outcomes: Mutex::new(outcomes.into()),
            }
        }
    }

    impl Poster for ScriptedPoster {
        fn post_json(&self, _url: &str, _body: &Value) -> Result<(), PostError> {
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        fn get_json(&self, _url: &str) -> Result<Value, PostError> {
            Err(PostError::Network("not scripted".into()))
        }
    }

    struct FixedGauge(f64);

    impl DiskGauge for FixedGauge {
        fn usage_fraction(&self, _dir: &Path) -> io::Result<f64> {
            Ok(self.0)
        }
    }

    fn frame(timestamp_ms: i64) -> PsdFrame {
        let mut f = PsdFrame::new(
            vec![-90.0; 8],
            905e6,
            925e6,
            "aa:bb:cc:dd:ee:ff".to_string(),
            None,
        )
        .unwrap();
        f.timestamp_ms = timestamp_ms;
        f
    }

    fn delivery(usage: f64) -> (Delivery, TempDir, TempDir) {
        let queue = TempDir::new().unwrap();
        let historic = TempDir::new().unwrap();
        let mut d = Delivery::new(
            "http://collector.test/psd".to_string(),
            queue.path().to_path_buf(),
            historic.path().to_path_buf(),
        );
        d.gauge = Box::new(FixedGauge(usage));
        (d, queue, historic)
    }

    fn names(dir: &Path) -> Vec<String> {
        list_entries(dir)
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_success_archives_below_watermark() {
        let (d, _q, historic) = delivery(0.2);
        let poster = ScriptedPoster::new(vec![Ok(())]);
        assert_eq!(d.deliver(&poster, &frame(1000)), DeliveryOutcome::Delivered);
        assert_eq!(names(historic.path()), vec!["1000.json"]);
        // Entry is valid JSON and round-trips
        let bytes = fs::read(historic.path().join("1000.json")).unwrap();
        let back: PsdFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.timestamp_ms, 1000);
    }

    #[test]
    fn test_over_watermark_evicts_then_skips_without_failing_delivery() {
        let (d, _q, historic) = delivery(0.95);
        // Preload 12 historic entries
        for ts in 0..12 {
            atomic_write(
                &historic.path().join(format!("{ts}.json")),
                &serde_json::to_vec(&frame(ts)).unwrap(),
            )
            .unwrap();
        }
        let poster = ScriptedPoster::new(vec![Ok(())]);
        // Still Delivered even though the archive copy is skipped
        assert_eq!(d.deliver(&poster, &frame(5000)), DeliveryOutcome::Delivered);
        // The 10 oldest entries were reclaimed, the new copy was not saved
        assert_eq!(names(historic.path()), vec!["10.json", "11.json"]);
    }

    #[test]
    fn test_failure_queues_frame() {
        let (d, queue, _h) = delivery(0.2);
        let poster = ScriptedPoster::new(vec![Err(PostError::Network("refused".into()))]);
        assert_eq!(d.deliver(&poster, &frame(777)), DeliveryOutcome::Queued);
        assert_eq!(names(queue.path()), vec!["777.json"]);
    }

    #[test]
    fn test_queue_cap_evicts_single_oldest() {
        let (d, queue, _h) = delivery(0.2);
        for ts in 0..51 {
            d.enqueue(&frame(1000 + ts)).unwrap();
        }
        let remaining = names(queue.path());
        assert_eq!(remaining.len(), 50);
        assert!(!remaining.contains(&"1000.json".to_string()));
        assert_eq!(remaining.first().unwrap(), "1001.json");
        assert_eq!(remaining.last().unwrap(), "1050.json");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("42.json");
        atomic_write(&target, b"{\"ok\":true}").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{\"ok\":true}");
        let all: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_list_entries_orders_by_encoded_timestamp() {
        let dir = TempDir::new().unwrap();
        for name in ["900.json", "10.json", "5000.json", ".retry.lock", "77.tmp"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(names(dir.path()), vec!["10.json", "900.json", "5000.json"]);
    }
}
