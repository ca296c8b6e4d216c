//! Periodic redelivery of queued frames, oldest first.
//!
//! The pass stops dead at the first entry that exhausts its attempts:
//! skipping it and delivering newer entries would reorder the device's
//! frames at the collector. Corrupt entries are unrecoverable and are
//! purged instead. A pass takes an advisory lock on the queue directory
//! so overlapping invocations cannot race each other's deletions.

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::delivery::{list_entries, Poster};
use crate::frame::PsdFrame;

pub const DEFAULT_ATTEMPTS: u32 = 2;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

const LOCK_FILE: &str = ".retry.lock";

#[derive(Debug, Default)]
pub struct RetryReport {
    pub delivered: usize,
    pub purged: usize,
    pub remaining: usize,
    /// Entry that exhausted its attempts and halted the pass.
    pub stopped_on: Option<String>,
    /// Another pass held the run-lock; nothing was touched.
    pub locked_out: bool,
}

pub struct RetryProcessor {
    pub queue_dir: PathBuf,
    pub endpoint: String,
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryProcessor {
    pub fn new(queue_dir: PathBuf, endpoint: String) -> Self {
        RetryProcessor {
            queue_dir,
            endpoint,
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// One pass over the queue. At most one pass runs at a time; a
    /// locked-out invocation reports itself and leaves the queue alone.
    pub fn run(&self, poster: &dyn Poster) -> io::Result<RetryReport> {
        fs::create_dir_all(&self.queue_dir)?;
        let lock = File::create(self.queue_dir.join(LOCK_FILE))?;
        if lock.try_lock_exclusive().is_err() {
            debug!("retry pass already running, skipping");
            return Ok(RetryReport {
                locked_out: true,
                ..RetryReport::default()
            });
        }

        let mut report = RetryReport::default();
        for path in list_entries(&self.queue_dir)? {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("?")
                .to_string();
            let body = match fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<PsdFrame>(&bytes).ok())
                .and_then(|frame| serde_json::to_value(&frame).ok())
            {
                Some(body) => body,
                None => {
                    warn!(entry = %name, "purging unreadable queue entry");
                    fs::remove_file(&path)?;
                    report.purged += 1;
                    continue;
                }
            };

            let mut delivered = false;
            for attempt in 1..=self.attempts {
                match poster.post_json(&self.endpoint, &body) {
                    Ok(()) => {
                        fs::remove_file(&path)?;
                        report.delivered += 1;
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        warn!(entry = %name, attempt, error = %e, "redelivery failed");
                        if attempt < self.attempts {
                            thread::sleep(self.backoff);
                        }
                    }
                }
            }
            if !delivered {
                // Halt here; this entry and everything newer stay put
                report.stopped_on = Some(name);
                break;
            }
        }
        report.remaining = list_entries(&self.queue_dir)?.len();
        Ok(report)
    }
}
