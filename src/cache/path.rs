//! Cache path allocation
//!
//! Generates collision-free file names under the cache directory for
//! materialized object payloads.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

/// Hands out unused paths under a cache directory
pub struct CachePathAllocator {
    dir: PathBuf,
    counter: AtomicU64,
}

impl CachePathAllocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Directory the paths are allocated in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return a path under the cache directory that does not exist right now.
    ///
    /// Candidates that collide with an existing entry are skipped; only real
    /// I/O errors (anything but "not found") are returned.
    pub fn new_cache_path(&self) -> io::Result<PathBuf> {
        self.next_free(|| self.next_suffix())
    }

    fn next_suffix(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}{:08x}", seq, rand::random::<u32>())
    }

    fn next_free(&self, mut suffix: impl FnMut() -> String) -> io::Result<PathBuf> {
        loop {
            let candidate = self.dir.join(suffix());
            match std::fs::symlink_metadata(&candidate) {
                Ok(_) => {
                    trace!(path = %candidate.display(), "Cache path taken, retrying");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(candidate),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_paths_distinct_and_free() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = CachePathAllocator::new(dir.path());

        let first = alloc.new_cache_path().unwrap();
        let second = alloc.new_cache_path().unwrap();

        assert_ne!(first, second);
        for path in [&first, &second] {
            assert!(!path.exists());
            assert_eq!(path.parent(), Some(dir.path()));
        }
    }

    #[test]
    fn test_many_paths_never_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = CachePathAllocator::new(dir.path());

        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(alloc.new_cache_path().unwrap()));
        }
    }

    #[test]
    fn test_collision_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("taken"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("also-taken")).unwrap();
        let alloc = CachePathAllocator::new(dir.path());

        let mut names = vec!["free", "also-taken", "taken"];
        let path = alloc
            .next_free(|| names.pop().unwrap().to_string())
            .unwrap();

        assert_eq!(path, dir.path().join("free"));
    }

    #[test]
    fn test_io_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file used as a directory makes stat fail with NotADirectory
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let alloc = CachePathAllocator::new(&file);

        let err = alloc.new_cache_path().unwrap_err();
        assert_ne!(err.kind(), io::ErrorKind::NotFound);
    }
}
