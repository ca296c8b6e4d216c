//! Small cross-process value store.
//!
//! A handful of values (accumulated clock offset, last fetch round-trip
//! time, cycle counter) are shared with sibling processes on the node.
//! The core only depends on this narrow read/modify/write contract; the
//! backing is a single JSON object file guarded by an advisory lock.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs2::FileExt;
use tracing::warn;

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }

    pub fn get(&self, key: &str) -> io::Result<Option<f64>> {
        let mut file = match OpenOptions::new().read(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        file.lock_shared()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(parse(&contents).get(key).copied())
    }

    pub fn put(&self, key: &str, value: f64) -> io::Result<()> {
        self.update(key, |_| value).map(|_| ())
    }

    /// Read-modify-write under the exclusive lock; returns the stored
    /// value.
    pub fn update(&self, key: &str, f: impl FnOnce(Option<f64>) -> f64) -> io::Result<f64> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let mut map = parse(&contents);
        let next = f(map.get(key).copied());
        map.insert(key.to_string(), next);
        let encoded = serde_json::to_string(&map)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        Ok(next)
    }
}

fn parse(contents: &str) -> BTreeMap<String, f64> {
    if contents.trim().is_empty() {
        return BTreeMap::new();
    }
    serde_json::from_str(contents).unwrap_or_else(|e| {
        warn!(error = %e, "state store unreadable, starting fresh");
        BTreeMap::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path().join("state.json"))
    }

    #[test]
    fn test_missing_file_reads_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir).get("clock_offset_ms").unwrap(), None);
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.put("last_fetch_rtt_ms", 41.5).unwrap();
        s.put("clock_offset_ms", -12.0).unwrap();
        assert_eq!(s.get("last_fetch_rtt_ms").unwrap(), Some(41.5));
        assert_eq!(s.get("clock_offset_ms").unwrap(), Some(-12.0));
    }

    #[test]
    fn test_update_accumulates() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        for _ in 0..3 {
            s.update("cycles_completed", |v| v.unwrap_or(0.0) + 1.0).unwrap();
        }
        assert_eq!(s.get("cycles_completed").unwrap(), Some(3.0));
    }

    #[test]
    fn test_corrupt_store_recovers() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("state.json"), b"not json at all").unwrap();
        let s = store(&dir);
        assert_eq!(s.get("anything").unwrap(), None);
        s.put("fresh", 7.0).unwrap();
        assert_eq!(s.get("fresh").unwrap(), Some(7.0));
    }
}
