//! Filesystem response cache with TTL expiry.
//!
//! Each cached response is a single JSON file named after its cache key.
//! Expired entries are never deleted: they are renamed aside with an
//! `-expired_by-<run id>` suffix so a stale response can be inspected after
//! the run that evicted it. Zero-byte files (from an interrupted write) are
//! removed lazily on the next read.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Longest accepted cache key, in bytes. Keys embed two fixed-width digests,
/// so anything longer indicates a caller bug rather than a long input.
pub const MAX_KEY_LEN: usize = 265;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache key exceeds {MAX_KEY_LEN} bytes (got {len}): {key}")]
    InvalidKey { key: String, len: usize },
}

/// On-disk JSON cache scoped to one directory and one run id.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
    run_id: String,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            run_id: run_id.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Fetch a cached response if one exists and is younger than `ttl_secs`.
    pub fn get(&self, key: &str, ttl_secs: u64) -> Option<Value> {
        self.get_at(key, ttl_secs, Utc::now())
    }

    /// [`get`](Self::get) with an explicit notion of "now".
    pub fn get_at(&self, key: &str, ttl_secs: u64, now: DateTime<Utc>) -> Option<Value> {
        if key.is_empty() {
            return None;
        }
        let path = self.entry_path(key);
        let meta = fs::metadata(&path).ok()?;

        if meta.len() == 0 {
            debug!(key, "removing empty cache entry");
            let _ = fs::remove_file(&path);
            return None;
        }

        let written: DateTime<Utc> = meta.modified().ok()?.into();
        let age = now.signed_duration_since(written);
        if age.num_seconds() > ttl_secs as i64 {
            let aside = self.expired_path(&path);
            debug!(key, age_secs = age.num_seconds(), "cache entry expired, setting aside");
            if let Err(err) = fs::rename(&path, &aside) {
                warn!(key, error = %err, "failed to set aside expired cache entry");
            }
            return None;
        }

        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "cache entry is not valid JSON, ignoring");
                None
            }
        }
    }

    fn expired_path(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dir.join(format!("{name}-expired_by-{}", self.run_id))
    }

    /// Write `value` through the cache and hand it back.
    ///
    /// An empty key skips the write entirely. I/O failures are logged and
    /// swallowed: a broken cache never fails the call that produced the
    /// response. An over-long key is the one fatal case.
    pub fn put(&self, key: &str, value: Value) -> Result<Value, CacheError> {
        if key.is_empty() {
            debug!("empty cache key, skipping write");
            return Ok(value);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(CacheError::InvalidKey {
                key: key.to_string(),
                len: key.len(),
            });
        }
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %err, "failed to create cache directory");
            return Ok(value);
        }
        let path = self.entry_path(key);
        match serde_json::to_vec_pretty(&value) {
            Ok(bytes) => {
                if let Err(err) = fs::write(&path, bytes) {
                    warn!(key, error = %err, "failed to write cache entry");
                }
            }
            Err(err) => warn!(key, error = %err, "failed to serialize cache entry"),
        }
        Ok(value)
    }

    /// Append a JSON line to an audit log file in the cache directory.
    pub fn append_log(&self, name: &str, value: &Value) {
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %err, "failed to create cache directory");
            return;
        }
        let path = self.dir.join(format!("{name}.log"));
        let line = match serde_json::to_string(value) {
            Ok(line) => line,
            Err(err) => {
                warn!(name, error = %err, "failed to serialize audit record");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            warn!(log = %path.display(), error = %err, "failed to append audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> ResponseCache {
        ResponseCache::new(dir.path(), "run-test")
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let value = json!({"Snapshots": [{"SnapshotId": "snap-1"}]});
        cache.put("aws.abc.def", value.clone()).unwrap();
        assert_eq!(cache.get("aws.abc.def", 3600), Some(value));
    }

    #[test]
    fn put_returns_value_unchanged() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let value = json!([1, 2, 3]);
        let returned = cache.put("aws.k1.k2", value.clone()).unwrap();
        assert_eq!(returned, value);
    }

    #[test]
    fn missing_entry_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cache(&dir).get("aws.nope.nope", 3600), None);
    }

    #[test]
    fn empty_key_skips_cache_entirely() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.put("", json!({"x": 1})).unwrap();
        assert_eq!(cache.get("", 3600), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn over_long_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let key = "k".repeat(MAX_KEY_LEN + 1);
        let err = cache.put(&key, json!(null)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { len, .. } if len == MAX_KEY_LEN + 1));
    }

    #[test]
    fn empty_file_is_removed_and_treated_as_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let path = dir.path().join("aws.empty.entry.json");
        fs::write(&path, b"").unwrap();
        assert_eq!(cache.get("aws.empty.entry", 3600), None);
        assert!(!path.exists());
    }

    #[test]
    fn expired_entry_is_renamed_not_deleted() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.put("aws.old.entry", json!({"stale": true})).unwrap();

        let future = Utc::now() + Duration::seconds(120);
        assert_eq!(cache.get_at("aws.old.entry", 60, future), None);

        let aside = dir
            .path()
            .join("aws.old.entry.json-expired_by-run-test");
        assert!(aside.exists(), "expired entry should be set aside");
        assert!(!dir.path().join("aws.old.entry.json").exists());
    }

    #[test]
    fn fresh_entry_survives_get() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.put("aws.fresh.entry", json!(42)).unwrap();
        let soon = Utc::now() + Duration::seconds(10);
        assert_eq!(cache.get_at("aws.fresh.entry", 60, soon), Some(json!(42)));
        assert!(dir.path().join("aws.fresh.entry.json").exists());
    }

    #[test]
    fn append_log_accumulates_json_lines() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.append_log("deleted-snapshots", &json!({"id": "one"}));
        cache.append_log("deleted-snapshots", &json!({"id": "two"}));
        let contents = fs::read_to_string(dir.path().join("deleted-snapshots.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            serde_json::from_str::<Value>(lines[1]).unwrap(),
            json!({"id": "two"})
        );
    }
}
