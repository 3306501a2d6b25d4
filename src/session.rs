//! Daemon session context
//!
//! One `Session` is built by the lifecycle controller and shared as
//! `Arc<Session>` by every FUSE worker, the write-back consumer and the cache
//! monitor. Nothing here is global.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CachePathAllocator, FileCache, MetadataCache};
use crate::config::Config;
use crate::fs::handles::HandleRegistry;
use crate::fs::inode::{InodeTable, ROOT_INO};
use crate::lock::{KeyedGuard, KeyedMutex};
use crate::meta::{MetaError, MetaRecord, MetaStore, RecordsMut};
use crate::remote::RemoteStore;
use crate::writeback::WriteBack;

/// Create the root bucket and the root directory record if missing
pub fn init_root(store: &MetaStore, config: &Config) -> Result<MetaRecord, MetaError> {
    store.update(|tx| {
        let bucket = tx.create_bucket_if_not_exists(&config.bucket)?;
        if let Some(root) = bucket.load("")? {
            return Ok(root);
        }

        let ino = bucket.next_sequence()?;
        let root = MetaRecord::directory(ino, config.dir_mode(), config.uid, config.gid);
        bucket.store("", &root)?;
        info!(bucket = %config.bucket, ino = ino, "Created root record");
        Ok(root)
    })
}

/// Everything a filesystem operation needs
pub struct Session {
    pub(crate) config: Config,
    pub(crate) store: MetaStore,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) handles: HandleRegistry,
    pub(crate) locks: KeyedMutex,
    pub(crate) writeback: WriteBack,
    pub(crate) cache: FileCache,
    pub(crate) paths: CachePathAllocator,
    pub(crate) attrs: MetadataCache,
    inodes: Mutex<InodeTable>,
    /// Runtime used to drive remote calls from blocking workers
    pub(crate) runtime: Handle,
}

impl Session {
    pub fn new(
        config: Config,
        store: MetaStore,
        remote: Arc<dyn RemoteStore>,
        writeback: WriteBack,
        cache: FileCache,
        runtime: Handle,
    ) -> Self {
        let paths = CachePathAllocator::new(cache.cache_dir().to_path_buf());

        Self {
            config,
            store,
            remote,
            handles: HandleRegistry::new(),
            locks: KeyedMutex::new(),
            writeback,
            cache,
            paths,
            attrs: MetadataCache::new(),
            inodes: Mutex::new(InodeTable::new()),
            runtime,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn writeback(&self) -> &WriteBack {
        &self.writeback
    }

    pub fn handles(&self) -> &HandleRegistry {
        &self.handles
    }

    pub(crate) fn inodes(&self) -> MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock key for a path: `bucket/path`
    pub fn resource_key(&self, path: &str) -> String {
        format!("{}/{}", self.config.bucket, path)
    }

    /// Take the keyed lock of the file behind `ino` so its payload can be
    /// removed. Open files, queued uploads and paths another operation is
    /// working on are refused.
    fn claim_for_eviction(&self, ino: u64) -> Option<KeyedGuard<'_>> {
        if ino == ROOT_INO {
            return None;
        }
        let path = self.inodes().get_path(ino).map(str::to_string)?;
        let guard = self.locks.try_lock(&self.resource_key(&path))?;

        // Renamed between the lookup and the lock
        if self.inodes().get_path(ino) != Some(path.as_str()) {
            return None;
        }
        if self.handles.is_open(ino) || self.writeback.pending().has_upload(&path) {
            return None;
        }
        Some(guard)
    }

    /// One cache monitor pass: enforce the quota and log metrics
    pub fn check_cache(&self) -> Vec<u64> {
        let evicted = self.cache.evict_if_needed(|ino| self.claim_for_eviction(ino));
        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                total_mb = self.cache.total_size() / (1024 * 1024),
                "Cache quota enforced"
            );
        }
        debug!(
            cached_files = self.cache.len(),
            open_handles = self.handles.len(),
            live_locks = self.locks.len(),
            "Cache monitor tick"
        );
        self.attrs.log_metrics();
        evicted
    }

    /// Start the periodic cache monitor on the session runtime
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let interval = self.config.monitor_interval;

        self.runtime.spawn(async move {
            info!(interval_secs = interval.as_secs(), "Cache monitor started");
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let session = Arc::clone(&session);
                // Eviction touches the disk and takes blocking locks
                if let Err(e) = tokio::task::spawn_blocking(move || session.check_cache()).await {
                    warn!(error = %e, "Cache monitor pass failed");
                }
            }
        })
    }

    /// Give back the metadata store once no other reference to the session
    /// remains.
    pub fn into_store(self) -> MetaStore {
        self.store
    }
}
