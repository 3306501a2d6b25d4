//! Payload cache
//!
//! Object bodies materialized on local disk, accounted per inode against the
//! configured quota. The cache monitor calls [`FileCache::evict_if_needed`]
//! to drop the least recently opened payloads.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Suffix of in-flight downloads; leftovers are removed on startup
const TEMP_SUFFIX: &str = ".tmp";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
struct Payload {
    path: PathBuf,
    size: u64,
    opened_at: SystemTime,
}

pub struct FileCache {
    cache_dir: PathBuf,
    quota: u64,
    payloads: Mutex<HashMap<u64, Payload>>,
}

impl FileCache {
    /// Open the cache under `cache_dir`, creating it if needed, with a quota
    /// of `quota` bytes. Stale downloads are swept immediately.
    pub fn with_config(cache_dir: PathBuf, quota: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create cache directory {}", cache_dir.display()))?;

        let cache = Self {
            cache_dir,
            quota,
            payloads: Mutex::new(HashMap::new()),
        };
        cache.cleanup();

        info!(
            cache_dir = %cache.cache_dir.display(),
            quota_mb = quota / MIB,
            "Payload cache ready"
        );
        Ok(cache)
    }

    fn payloads(&self) -> MutexGuard<'_, HashMap<u64, Payload>> {
        self.payloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `path` holds a complete copy of `expected_size` bytes. A copy
    /// of the wrong size is deleted.
    pub fn is_valid(&self, path: &Path, expected_size: u64) -> bool {
        let Ok(metadata) = fs::metadata(path) else {
            return false;
        };
        if metadata.len() == expected_size {
            return true;
        }
        debug!(
            path = %path.display(),
            on_disk = metadata.len(),
            expected = expected_size,
            "Discarding truncated payload"
        );
        let _ = fs::remove_file(path);
        false
    }

    /// Write `data` to `path` atomically
    pub fn store(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.cache_dir)?;
        tmp.write_all(data)?;
        tmp.persist(path)?;

        debug!(path = %path.display(), bytes = data.len(), "Payload written");
        Ok(())
    }

    /// Account `size` bytes at `path` to `ino`, replacing any earlier entry
    pub fn track(&self, ino: u64, path: PathBuf, size: u64) {
        let payload = Payload {
            path,
            size,
            opened_at: SystemTime::now(),
        };
        self.payloads().insert(ino, payload);
    }

    pub fn touch(&self, ino: u64) {
        if let Some(payload) = self.payloads().get_mut(&ino) {
            payload.opened_at = SystemTime::now();
        }
    }

    /// Remove least recently opened payloads until usage fits the quota.
    ///
    /// `claim` is asked for each candidate; `None` keeps the payload, and a
    /// returned guard is held until its file is gone. Returns the inodes
    /// whose payloads were removed.
    pub fn evict_if_needed<G>(&self, claim: impl Fn(u64) -> Option<G>) -> Vec<u64> {
        let mut payloads = self.payloads();

        let used: u64 = payloads.values().map(|p| p.size).sum();
        let Some(excess) = used.checked_sub(self.quota).filter(|excess| *excess > 0) else {
            return Vec::new();
        };
        info!(used_mb = used / MIB, quota_mb = self.quota / MIB, "Cache over quota");

        let mut candidates: Vec<(u64, SystemTime)> = payloads
            .iter()
            .map(|(ino, p)| (*ino, p.opened_at))
            .collect();
        candidates.sort_by_key(|(_, opened_at)| *opened_at);

        let mut evicted = Vec::new();
        let mut released = 0;
        for (ino, _) in candidates {
            if released >= excess {
                break;
            }
            let Some(_claimed) = claim(ino) else {
                continue;
            };
            let Some(payload) = payloads.get(&ino) else {
                continue;
            };
            if let Err(e) = fs::remove_file(&payload.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(ino = ino, path = %payload.path.display(), error = %e, "Could not evict payload");
                    continue;
                }
            }
            released += payload.size;
            debug!(ino = ino, bytes = payload.size, "Evicted payload");
            payloads.remove(&ino);
            evicted.push(ino);
        }
        evicted
    }

    /// Delete `*.tmp` leftovers of interrupted downloads
    pub fn cleanup(&self) {
        let Ok(read_dir) = fs::read_dir(&self.cache_dir) else {
            return;
        };
        for path in read_dir.flatten().map(|entry| entry.path()) {
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
            if stale {
                debug!(path = %path.display(), "Removing partial download");
                let _ = fs::remove_file(&path);
            }
        }
    }

    /// Drop the payload of `ino` from disk and from accounting
    pub fn invalidate(&self, ino: u64) {
        let removed = self.payloads().remove(&ino);
        if let Some(payload) = removed {
            let _ = fs::remove_file(&payload.path);
            debug!(ino = ino, "Invalidated payload");
        }
    }

    pub fn total_size(&self) -> u64 {
        self.payloads().values().map(|p| p.size).sum()
    }

    pub fn len(&self) -> usize {
        self.payloads().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn cached(cache: &FileCache, ino: u64, size: usize) -> PathBuf {
        let path = cache.cache_dir().join(format!("blob-{}", ino));
        cache.store(&path, &vec![0u8; size]).unwrap();
        cache.track(ino, path.clone(), size as u64);
        path
    }

    #[test]
    fn test_store_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::with_config(dir.path().to_path_buf(), 1024).unwrap();

        let path = dir.path().join("payload");
        cache.store(&path, b"hello").unwrap();

        assert!(cache.is_valid(&path, 5));
        // Wrong size removes the stale copy
        assert!(!cache.is_valid(&path, 6));
        assert!(!path.exists());
    }

    #[test]
    fn test_evicts_oldest_and_skips_busy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::with_config(dir.path().to_path_buf(), 250).unwrap();

        let oldest = cached(&cache, 1, 100);
        sleep(Duration::from_millis(5));
        let busy = cached(&cache, 2, 100);
        sleep(Duration::from_millis(5));
        let newest = cached(&cache, 3, 100);

        let evicted = cache.evict_if_needed(|ino| (ino != 2).then_some(()));

        assert_eq!(evicted, vec![1]);
        assert!(!oldest.exists());
        assert!(busy.exists());
        assert!(newest.exists());
        assert_eq!(cache.total_size(), 200);
    }

    #[test]
    fn test_under_quota_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::with_config(dir.path().to_path_buf(), 1000).unwrap();
        cached(&cache, 1, 100);
        cached(&cache, 2, 100);

        assert!(cache.evict_if_needed(|_| Some(())).is_empty());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cleanup_removes_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("partial.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("keep"), b"x").unwrap();

        let _cache = FileCache::with_config(dir.path().to_path_buf(), 1000).unwrap();

        assert!(!dir.path().join("partial.tmp").exists());
        assert!(dir.path().join("keep").exists());
    }
}
