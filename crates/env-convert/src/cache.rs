//! File-backed metadata cache with time-based expiry.
//!
//! Each entry is one JSON file named by the SHA-256 of its key:
//!
//! ```text
//! <root>/
//!   3f9a1c...json   # {"key": ..., "payload": ..., "written_at": ...}
//! ```
//!
//! Reads never fail: a missing, unreadable, malformed or expired entry is
//! simply absent. Writes go to a temp file in the cache directory and are
//! renamed into place, so concurrent readers never see partial entries.
//! There is no locking between writers; the last rename wins.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default entry lifetime.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// One cached payload with the time it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: serde_json::Value,
    pub written_at: DateTime<Utc>,
}

impl CacheEntry {
    fn age(&self) -> Duration {
        (Utc::now() - self.written_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// TTL key/value store on disk.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    root: PathBuf,
    max_age: Duration,
}

impl MetadataCache {
    /// Create a cache rooted at `root`.
    ///
    /// The directory is created lazily on first `set()`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(format!("{}.json", &hash[..32]))
    }

    fn read_entry(path: &Path) -> Option<CacheEntry> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("[cache] Could not read {:?}: {}", path, e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("[cache] Ignoring malformed entry {:?}: {}", path, e);
                None
            }
        }
    }

    /// Look up `key`. Expired entries read as absent.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = Self::read_entry(&self.entry_path(key))?;
        if entry.key != key {
            warn!("[cache] Hash collision for {}, ignoring entry", key);
            return None;
        }
        if entry.age() > self.max_age {
            debug!("[cache] Entry for {} expired", key);
            return None;
        }
        Some(entry.payload)
    }

    /// Store `payload` under `key` with the current time.
    pub fn set(&self, key: &str, payload: serde_json::Value) -> io::Result<()> {
        self.write_entry(&CacheEntry {
            key: key.to_string(),
            payload,
            written_at: Utc::now(),
        })
    }

    fn write_entry(&self, entry: &CacheEntry) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;

        let json = serde_json::to_vec(entry).map_err(io::Error::other)?;
        let path = self.entry_path(&entry.key);

        // Write to temp file, then atomic rename
        let tmp = self.root.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
        if let Err(e) = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &path)) {
            std::fs::remove_file(&tmp).ok();
            return Err(e);
        }
        Ok(())
    }

    /// Delete entries older than `older_than`, or every entry when `None`.
    ///
    /// Returns the number of entries removed. Unparseable files count as
    /// old.
    pub fn clear(&self, older_than: Option<Duration>) -> usize {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("[cache] Could not read cache directory {:?}: {}", self.root, e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = match older_than {
                None => true,
                Some(threshold) => Self::read_entry(&path)
                    .map(|e| e.age() > threshold)
                    .unwrap_or(true),
            };
            if !expired {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("[cache] Could not remove {:?}: {}", path, e),
            }
        }

        debug!("[cache] Removed {} entries", removed);
        removed
    }
}
