//! Disk-resident evaluation cache, shared between island processes.
//!
//! One JSON file per evaluation key, under a two-hex-digit prefix shard
//! directory. Writes go to a temp file first and are published with an
//! atomic rename, so a reader never observes a torn record and concurrent
//! writers from separate processes converge on the first durably-named
//! value.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use kaizen_core::{EvaluationResult, Fingerprint};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("conflicting write for key {0}")]
    Conflict(String),
}

fn io_err(err: std::io::Error) -> CacheError {
    CacheError::Io(err.to_string())
}

pub struct DiskCache {
    root: PathBuf,
    index: Mutex<HashMap<String, EvaluationResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let prefix = &key[..key.len().min(2)];
        self.root.join(prefix).join(format!("{key}.json"))
    }

    fn candidate_marker_path(&self, fingerprint: &str) -> PathBuf {
        let prefix = &fingerprint[..fingerprint.len().min(2)];
        self.root
            .join("candidates")
            .join(prefix)
            .join(fingerprint)
    }

    /// Lookup by evaluation key. Any unreadable or corrupt file counts as a
    /// miss; the next `put` overwrites it.
    pub fn get(&self, key: &str) -> Option<EvaluationResult> {
        if let Some(result) = self
            .index
            .lock()
            .ok()
            .and_then(|index| index.get(key).cloned())
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(result);
        }
        let path = self.entry_path(key);
        let Ok(bytes) = fs::read(&path) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        match serde_json::from_slice::<EvaluationResult>(&bytes) {
            Ok(result) => {
                if let Ok(mut index) = self.index.lock() {
                    index.insert(key.to_string(), result.clone());
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "corrupt cache entry treated as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write-once insert. A re-put with an equal value is a no-op; an
    /// unequal value is rejected. A corrupt existing file is overwritten.
    pub fn put(&self, key: &str, result: &EvaluationResult) -> Result<(), CacheError> {
        if let Ok(index) = self.index.lock() {
            if let Some(existing) = index.get(key) {
                if existing.value_equal(result) {
                    return Ok(());
                }
                tracing::warn!(key, "rejected conflicting cache write");
                return Err(CacheError::Conflict(key.to_string()));
            }
        }
        let path = self.entry_path(key);
        if let Ok(bytes) = fs::read(&path) {
            match serde_json::from_slice::<EvaluationResult>(&bytes) {
                Ok(existing) => {
                    if existing.value_equal(result) {
                        if let Ok(mut index) = self.index.lock() {
                            index.insert(key.to_string(), existing);
                        }
                        return Ok(());
                    }
                    tracing::warn!(key, "rejected conflicting cache write");
                    return Err(CacheError::Conflict(key.to_string()));
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "overwriting corrupt cache entry");
                }
            }
        }
        self.write_atomic(&path, result)?;
        if let Ok(mut index) = self.index.lock() {
            index.insert(key.to_string(), result.clone());
        }
        Ok(())
    }

    fn write_atomic(&self, path: &Path, result: &EvaluationResult) -> Result<(), CacheError> {
        let parent = path
            .parent()
            .ok_or_else(|| CacheError::Io("cache path has no parent".into()))?;
        fs::create_dir_all(parent).map_err(io_err)?;
        let bytes =
            serde_json::to_vec(result).map_err(|err| CacheError::Serde(err.to_string()))?;
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    /// Marks a candidate fingerprint as fully raced on this cache. Used to
    /// deduplicate offspring and migrants across processes sharing the
    /// cache directory.
    pub fn record_candidate(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        let path = self.candidate_marker_path(fingerprint);
        if path.exists() {
            return Ok(());
        }
        let parent = path
            .parent()
            .ok_or_else(|| CacheError::Io("marker path has no parent".into()))?;
        fs::create_dir_all(parent).map_err(io_err)?;
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, b"").map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn has_candidate(&self, fingerprint: &Fingerprint) -> bool {
        self.candidate_marker_path(fingerprint).exists()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate since process start. A cache that was never consulted
    /// reports 0.0.
    pub fn warm_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use kaizen_core::QUALITY;

    fn temp_root(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("kaizen-cache-{name}-{nanos:x}"))
    }

    fn sample(quality: f64) -> EvaluationResult {
        let mut objectives = BTreeMap::new();
        objectives.insert(QUALITY.to_string(), quality);
        EvaluationResult::new("ex-1", objectives, None, 0.5)
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = DiskCache::new(temp_root("roundtrip"));
        let result = sample(0.8);
        cache.put("aabbcc", &result).unwrap();
        assert_eq!(cache.get("aabbcc"), Some(result));
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn get_counts_misses_and_warm_rate() {
        let cache = DiskCache::new(temp_root("warm"));
        assert!(cache.get("missing").is_none());
        cache.put("aa11", &sample(0.5)).unwrap();
        cache.get("aa11");
        assert_eq!(cache.misses(), 1);
        assert!((cache.warm_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn equal_reput_is_noop_and_unequal_is_rejected() {
        let cache = DiskCache::new(temp_root("monotonic"));
        cache.put("aa22", &sample(0.5)).unwrap();
        cache.put("aa22", &sample(0.5)).unwrap();
        let rejected = cache.put("aa22", &sample(0.9));
        assert!(matches!(rejected, Err(CacheError::Conflict(_))));
        assert_eq!(cache.get("aa22"), Some(sample(0.5)));
    }

    #[test]
    fn disk_conflict_is_detected_without_index() {
        let first = DiskCache::new(temp_root("disk-conflict"));
        first.put("bb33", &sample(0.5)).unwrap();
        // A second process opens the same directory with a cold index.
        let second = DiskCache::new(first.root().to_path_buf());
        second.put("bb33", &sample(0.5)).unwrap();
        assert!(matches!(
            second.put("bb33", &sample(0.1)),
            Err(CacheError::Conflict(_))
        ));
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_gets_overwritten() {
        let cache = DiskCache::new(temp_root("corrupt"));
        cache.put("cc44", &sample(0.7)).unwrap();
        let path = cache.entry_path("cc44");
        fs::write(&path, b"{ not json").unwrap();
        let fresh = DiskCache::new(cache.root().to_path_buf());
        assert!(fresh.get("cc44").is_none());
        fresh.put("cc44", &sample(0.2)).unwrap();
        assert_eq!(fresh.get("cc44"), Some(sample(0.2)));
    }

    #[test]
    fn candidate_markers_persist_across_instances() {
        let cache = DiskCache::new(temp_root("markers"));
        let fp = "deadbeef".to_string();
        assert!(!cache.has_candidate(&fp));
        cache.record_candidate(&fp).unwrap();
        cache.record_candidate(&fp).unwrap();
        let other = DiskCache::new(cache.root().to_path_buf());
        assert!(other.has_candidate(&fp));
    }
}
