//! File Handle Tracking
//!
//! Each open()/create() acquires a handle, read()/write() use it, release()
//! removes it. Handle ids come from an atomic counter so allocation never
//! waits on the table lock.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// State of one open session on a cached file
#[derive(Debug)]
pub struct OpenFile {
    /// Resource key (`bucket/path`) the keyed lock uses for this file
    pub resource_key: String,
    /// Path relative to the mount root at open time
    pub path: String,
    /// Path to the local cached copy
    pub cache_path: PathBuf,
    /// Open file descriptor for the local copy
    pub file: File,
    /// Whether the file was opened for writing
    pub writable: bool,
    /// Whether the cached copy changed since it was last queued for upload
    pub dirty: AtomicBool,
}

impl OpenFile {
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

/// An acquired handle
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub handle_id: u64,
    pub ino: u64,
    pub open: Arc<OpenFile>,
}

/// Registry of all open handles
pub struct HandleRegistry {
    /// Map from handle id to handle
    handles: Mutex<HashMap<u64, FileHandle>>,
    /// Next handle id to assign
    next_id: AtomicU64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            // Start at 1 (0 is sometimes special in FUSE)
            next_id: AtomicU64::new(1),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, FileHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an open session and return its handle
    ///
    /// # Arguments
    /// * `ino` - Inode number of the file
    /// * `open` - Open-file state shared by readers and writers of the handle
    pub fn acquire(&self, ino: u64, open: OpenFile) -> FileHandle {
        let handle_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = FileHandle {
            handle_id,
            ino,
            open: Arc::new(open),
        };

        debug!(
            fh = handle_id,
            ino = ino,
            key = %handle.open.resource_key,
            writable = handle.open.writable,
            "Acquired file handle"
        );

        self.handles().insert(handle_id, handle.clone());
        handle
    }

    /// Remove a handle. Unknown ids are ignored.
    pub fn release(&self, handle_id: u64) -> Option<FileHandle> {
        let handle = self.handles().remove(&handle_id);
        match &handle {
            Some(h) => debug!(
                fh = handle_id,
                ino = h.ino,
                dirty = h.open.is_dirty(),
                "Released file handle"
            ),
            None => debug!(fh = handle_id, "Release of unknown file handle ignored"),
        }
        handle
    }

    pub fn get(&self, handle_id: u64) -> Option<FileHandle> {
        self.handles().get(&handle_id).cloned()
    }

    /// Whether any handle is open on `ino`
    pub fn is_open(&self, ino: u64) -> bool {
        self.handles().values().any(|h| h.ino == ino)
    }

    /// Whether a handle on `ino` holds writes not yet queued for upload
    pub fn has_dirty(&self, ino: u64) -> bool {
        self.handles()
            .values()
            .any(|h| h.ino == ino && h.open.is_dirty())
    }

    /// Any handle open on `ino`, preferring writable ones
    pub fn find_by_ino(&self, ino: u64) -> Option<FileHandle> {
        self.handles()
            .values()
            .filter(|h| h.ino == ino)
            .max_by_key(|h| h.open.writable)
            .cloned()
    }

    /// Ids of all live handles
    pub fn live(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.handles().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn open_file(dir: &tempfile::TempDir, name: &str) -> OpenFile {
        let cache_path = dir.path().join(name);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&cache_path)
            .unwrap();
        OpenFile {
            resource_key: format!("bucket/{}", name),
            path: name.to_string(),
            cache_path,
            file,
            writable: true,
            dirty: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_live_set_tracks_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandleRegistry::new();

        let a = registry.acquire(2, open_file(&dir, "a"));
        let b = registry.acquire(3, open_file(&dir, "b"));
        assert_eq!(registry.live(), vec![a.handle_id, b.handle_id]);
        assert!(registry.is_open(2));

        registry.release(a.handle_id);
        assert_eq!(registry.live(), vec![b.handle_id]);
        assert!(!registry.is_open(2));
        assert!(registry.get(a.handle_id).is_none());
        assert_eq!(registry.get(b.handle_id).unwrap().ino, 3);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandleRegistry::new();
        let h = registry.acquire(2, open_file(&dir, "a"));

        assert!(registry.release(9999).is_none());
        assert!(registry.release(h.handle_id).is_some());
        assert!(registry.release(h.handle_id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(HandleRegistry::new());

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let opens: Vec<OpenFile> = (0..25)
                    .map(|i| open_file(&dir, &format!("f{}-{}", t, i)))
                    .collect();
                thread::spawn(move || {
                    opens
                        .into_iter()
                        .map(|open| registry.acquire(t, open).handle_id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(ids.insert(id), "duplicate handle id {}", id);
            }
        }
        assert_eq!(ids.len(), 200);
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn test_dirty_flag() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandleRegistry::new();
        let h = registry.acquire(2, open_file(&dir, "a"));

        assert!(!h.open.take_dirty());
        h.open.mark_dirty();
        // Shared through the registry
        assert!(registry.get(h.handle_id).unwrap().open.is_dirty());
        assert!(h.open.take_dirty());
        assert!(!h.open.is_dirty());
    }

    #[test]
    fn test_has_dirty_looks_at_every_handle_of_inode() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandleRegistry::new();
        let reader = registry.acquire(2, open_file(&dir, "a"));
        let writer = registry.acquire(2, open_file(&dir, "a"));
        registry.acquire(3, open_file(&dir, "b")).open.mark_dirty();

        assert!(!registry.has_dirty(2));
        writer.open.mark_dirty();
        assert!(registry.has_dirty(2));
        assert!(!reader.open.is_dirty());

        registry.release(writer.handle_id);
        assert!(!registry.has_dirty(2));
    }
}
