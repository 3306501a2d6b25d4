//! Filesystem operations
//!
//! Plain blocking methods on [`Session`], driven by FUSE worker threads (and
//! directly by tests). Remote reads go through the session runtime; remote
//! mutations only ever go through the write-back pipeline.
//!
//! Any operation that populates or mutates the cached content of a path holds
//! the keyed lock on its resource key for the duration.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::SystemTime;

use fuser::{FileAttr, FileType};
use tracing::{debug, info, warn};

use super::attr::{file_type, record_to_attr};
use super::handles::{FileHandle, OpenFile};
use crate::cache::DirListing;
use crate::config::Config;
use crate::lock::KeyedGuard;
use crate::meta::record::{base_name, child_prefix, join_path};
use crate::meta::{MetaError, MetaRecord, NodeKind, Records, RecordsMut};
use crate::remote::{Listing, ObjectInfo, RemoteError};
use crate::session::Session;
use crate::writeback::{PendingOp, PipelineError};

/// Objects inspected when probing whether a prefix is a directory
const DISCOVERY_LIMIT: usize = 64;

/// Fixed capacity reported by statfs
const STATFS_BLOCKS: u64 = 0x1000000000;
const STATFS_BSIZE: u32 = 1024;
const STATFS_NAMELEN: u32 = 32768;

/// Filesystem operation errors
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("No such file or directory")]
    NotFound,

    #[error("File exists")]
    Exists,

    #[error("Not a directory")]
    NotDir,

    #[error("Is a directory")]
    IsDir,

    #[error("Directory not empty")]
    NotEmpty,

    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Write-back error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl FsError {
    /// Map the error to the errno returned to the kernel
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotDir => libc::ENOTDIR,
            FsError::IsDir => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Meta(_) => libc::EIO,
            FsError::Remote(e) => e.to_errno(),
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Pipeline(_) => libc::EIO,
        }
    }
}

/// Requested attribute changes
#[derive(Debug, Default, Clone, Copy)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    /// Handle the change was issued through, if any
    pub fh: Option<u64>,
}

/// Values reported by statfs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// A node found in the remote store but not yet in the metadata index
#[derive(Debug, Clone)]
struct Discovered {
    kind: NodeKind,
    size: u64,
    etag: Option<String>,
    mtime: Option<SystemTime>,
}

impl Discovered {
    fn file(info: &ObjectInfo) -> Self {
        Self {
            kind: NodeKind::File,
            size: info.size,
            etag: info.etag.clone(),
            mtime: info.last_modified,
        }
    }

    fn directory() -> Self {
        Self {
            kind: NodeKind::Directory,
            size: 0,
            etag: None,
            mtime: None,
        }
    }

    fn to_record(&self, ino: u64, config: &Config) -> MetaRecord {
        let mut record = match self.kind {
            NodeKind::File => MetaRecord::file(ino, self.size, config.mode, config.uid, config.gid),
            NodeKind::Directory => {
                MetaRecord::directory(ino, config.dir_mode(), config.uid, config.gid)
            }
        };
        record.etag = self.etag.clone();
        if let Some(mtime) = self.mtime {
            record.mtime = mtime;
        }
        record
    }
}

/// `path` moved from under `from` to under `to`
fn rebase(path: &str, from: &str, to: &str) -> String {
    format!("{}{}", to, &path[from.len()..])
}

impl Session {
    fn path_of(&self, ino: u64) -> Result<String, FsError> {
        self.inodes()
            .get_path(ino)
            .map(str::to_string)
            .ok_or(FsError::NotFound)
    }

    fn handle(&self, fh: u64) -> Result<FileHandle, FsError> {
        self.handles.get(fh).ok_or(FsError::BadHandle(fh))
    }

    fn load(&self, path: &str) -> Result<Option<MetaRecord>, FsError> {
        let bucket = self.config.bucket.as_str();
        self.store.view(|tx| {
            let records = tx.require_bucket(bucket)?;
            let record = records.load(path)?;
            Ok(record)
        })
    }

    fn save(&self, path: &str, record: &MetaRecord) -> Result<(), FsError> {
        let bucket = self.config.bucket.as_str();
        self.store.update(|tx| {
            tx.require_bucket(bucket)?.store(path, record)?;
            Ok(())
        })
    }

    /// Path of a directory inode
    fn dir_path(&self, ino: u64) -> Result<String, FsError> {
        let path = self.path_of(ino)?;
        match self.load(&path)? {
            Some(record) if record.is_dir() => Ok(path),
            Some(_) => Err(FsError::NotDir),
            None => Err(FsError::NotFound),
        }
    }

    /// Attributes with the size of an open cached copy, which may be ahead
    /// of the record while writes are in flight
    fn live_attr(&self, record: &MetaRecord) -> FileAttr {
        let mut attr = record_to_attr(record);
        if let Some(handle) = self.handles.find_by_ino(record.ino) {
            if let Ok(metadata) = handle.open.file.metadata() {
                attr.size = metadata.len();
                attr.blocks = attr.size.div_ceil(512);
            }
        }
        attr
    }

    fn remember(&self, path: &str, record: &MetaRecord) -> FileAttr {
        self.inodes().insert(record.ino, path);
        let attr = self.live_attr(record);
        self.attrs.insert_attr(attr);
        attr
    }

    /// Drop the in-memory state of a removed entry
    fn forget(&self, parent: u64, path: &str, ino: u64) {
        self.inodes().remove_by_path(path);
        self.attrs.invalidate_entry(parent, ino);
    }

    /// Probe the remote store for `path`, ignoring objects whose removal is
    /// still queued
    fn discover(&self, path: &str) -> Result<Option<Discovered>, FsError> {
        let pending = self.writeback.pending();

        if !pending.has_removal(path) {
            if let Some(info) = self.runtime.block_on(self.remote.head(path))? {
                return Ok(Some(Discovered::file(&info)));
            }
        }

        // A directory exists remotely as a marker or as a common key prefix
        let visible = self.any_visible_under(&child_prefix(path), true)?;
        Ok(visible.then(Discovered::directory))
    }

    /// Whether a key under `prefix` is not queued for removal. The first
    /// page is small; a full listing follows only when that page is entirely
    /// hidden.
    fn any_visible_under(&self, prefix: &str, with_marker: bool) -> Result<bool, FsError> {
        let pending = self.writeback.pending();
        let visible = |listing: &Listing| {
            listing.objects.iter().any(|object| {
                (with_marker || object.key != prefix) && !pending.has_removal(&object.key)
            })
        };

        let first = self
            .runtime
            .block_on(self.remote.list(prefix, false, Some(DISCOVERY_LIMIT)))?;
        if visible(&first) {
            return Ok(true);
        }
        if first.objects.len() < DISCOVERY_LIMIT {
            return Ok(false);
        }

        let all = self.runtime.block_on(self.remote.list(prefix, false, None))?;
        Ok(visible(&all))
    }

    /// Direct children in a delimited listing that are not queued for removal
    fn visible_children(&self, prefix: &str, listing: Listing) -> Vec<(String, Discovered)> {
        let pending = self.writeback.pending();
        let mut found = Vec::new();

        for object in &listing.objects {
            let name = &object.key[prefix.len().min(object.key.len())..];
            if name.is_empty() || name.contains('/') || pending.has_removal(&object.key) {
                continue;
            }
            found.push((object.key.clone(), Discovered::file(object)));
        }
        for common in &listing.prefixes {
            if pending.has_removal(common) {
                continue;
            }
            let path = common.trim_end_matches('/');
            if path.len() > prefix.len() {
                found.push((path.to_string(), Discovered::directory()));
            }
        }

        found
    }

    /// Give every discovered node a record, allocating inodes in one
    /// transaction. Nodes that already have a record keep it.
    fn adopt(&self, found: &[(String, Discovered)]) -> Result<Vec<MetaRecord>, FsError> {
        let config = &self.config;
        self.store.update(|tx| {
            let bucket = tx.require_bucket(&config.bucket)?;
            let mut records = Vec::with_capacity(found.len());
            for (path, discovered) in found {
                if let Some(existing) = bucket.load(path)? {
                    records.push(existing);
                    continue;
                }
                let ino = bucket.next_sequence()?;
                let record = discovered.to_record(ino, config);
                bucket.store(path, &record)?;
                debug!(path = %path, ino = ino, "Adopted remote object");
                records.push(record);
            }
            Ok(records)
        })
    }

    /// Whether anything other than the directory marker lives under `path`
    /// remotely
    fn has_remote_children(&self, path: &str) -> Result<bool, FsError> {
        self.any_visible_under(&child_prefix(path), false)
    }

    /// Current path of `ino` with its keyed lock held, following renames
    /// that land while waiting. `None` once the file is unlinked.
    fn lock_current_path(&self, ino: u64) -> Option<(String, KeyedGuard<'_>)> {
        loop {
            let path = self.inodes().get_path(ino).map(str::to_string)?;
            let guard = self.locks.lock(&self.resource_key(&path));
            if self.inodes().get_path(ino) == Some(path.as_str()) {
                return Some((path, guard));
            }
        }
    }

    /// Make sure the content of `path` is on local disk and return its cache
    /// path. The caller holds the keyed lock for `path`.
    fn populate(&self, path: &str, record: &mut MetaRecord) -> Result<PathBuf, FsError> {
        if let Some(cache_path) = record.cache_path.clone() {
            // An open copy is authoritative even if its size moved on
            let open = self.handles.is_open(record.ino) && cache_path.exists();
            if open || self.cache.is_valid(&cache_path, record.size) {
                self.cache.touch(record.ino);
                return Ok(cache_path);
            }
        }

        let data = match self.runtime.block_on(self.remote.get(path)) {
            Ok(data) => data,
            Err(e) if e.is_not_found() && record.size == 0 => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let cache_path = self.paths.new_cache_path()?;
        self.cache.store(&cache_path, &data)?;
        self.cache.track(record.ino, cache_path.clone(), data.len() as u64);

        record.cache_path = Some(cache_path.clone());
        record.size = data.len() as u64;
        self.save(path, record)?;

        info!(
            path = %path,
            size = data.len(),
            local = %cache_path.display(),
            "Populated cache"
        );
        Ok(cache_path)
    }

    /// Queue the content of a released dirty handle for upload. The caller
    /// holds the keyed lock for `path`.
    fn upload(&self, handle: &FileHandle, path: &str) -> Result<(), FsError> {
        let Some(mut record) = self.load(path)? else {
            return Ok(());
        };
        if record.ino != handle.ino {
            debug!(path = %path, "Released file was replaced, not uploading");
            return Ok(());
        }

        let payload = fs::read(&handle.open.cache_path)?;
        record.size = payload.len() as u64;
        record.mtime = SystemTime::now();
        record.cache_path = Some(handle.open.cache_path.clone());
        self.save(path, &record)?;
        self.cache
            .track(handle.ino, handle.open.cache_path.clone(), record.size);
        self.attrs.invalidate(handle.ino);

        info!(path = %path, size = record.size, "Queueing upload");
        self.writeback.enqueue(PendingOp::Put {
            path: path.to_string(),
            payload,
        })?;
        Ok(())
    }

    /// Look up a file by name in a directory
    pub fn lookup(&self, parent: u64, name: &str) -> Result<FileAttr, FsError> {
        let parent_path = self.path_of(parent)?;
        let path = join_path(&parent_path, name);

        if let Some(record) = self.load(&path)? {
            return Ok(self.remember(&path, &record));
        }

        let Some(found) = self.discover(&path)? else {
            return Err(FsError::NotFound);
        };
        let records = self.adopt(&[(path.clone(), found)])?;
        let record = records.into_iter().next().ok_or(FsError::NotFound)?;
        Ok(self.remember(&path, &record))
    }

    pub fn getattr(&self, ino: u64) -> Result<FileAttr, FsError> {
        if let Some(attr) = self.attrs.get_attr(ino) {
            return Ok(attr);
        }
        let path = self.path_of(ino)?;
        let record = self.load(&path)?.ok_or(FsError::NotFound)?;
        Ok(self.remember(&path, &record))
    }

    pub fn setattr(&self, ino: u64, changes: SetAttr) -> Result<FileAttr, FsError> {
        let path = self.path_of(ino)?;
        let _guard = self.locks.lock(&self.resource_key(&path));
        let mut record = self.load(&path)?.ok_or(FsError::NotFound)?;

        if let Some(size) = changes.size {
            if record.is_dir() {
                return Err(FsError::IsDir);
            }
            let cache_path = self.populate(&path, &mut record)?;
            OpenOptions::new()
                .write(true)
                .open(&cache_path)?
                .set_len(size)?;
            record.size = size;
            record.mtime = SystemTime::now();
            self.cache.track(ino, cache_path.clone(), size);

            let handle = changes
                .fh
                .and_then(|fh| self.handles.get(fh))
                .filter(|h| h.open.writable)
                .or_else(|| self.handles.find_by_ino(ino).filter(|h| h.open.writable));
            match handle {
                Some(handle) => handle.open.mark_dirty(),
                None => {
                    let payload = fs::read(&cache_path)?;
                    self.writeback.enqueue(PendingOp::Put {
                        path: path.clone(),
                        payload,
                    })?;
                }
            }
            debug!(path = %path, size = size, "Truncated file");
        }

        if let Some(mode) = changes.mode {
            record.mode = mode & 0o7777;
        }
        if let Some(uid) = changes.uid {
            record.uid = uid;
        }
        if let Some(gid) = changes.gid {
            record.gid = gid;
        }
        if let Some(mtime) = changes.mtime {
            record.mtime = mtime;
        }

        self.save(&path, &record)?;
        self.attrs.invalidate(ino);
        Ok(self.remember(&path, &record))
    }

    /// Directory entries including `.` and `..`
    pub fn readdir(&self, ino: u64) -> Result<DirListing, FsError> {
        if let Some(listing) = self.attrs.get_dir(ino) {
            return Ok(listing);
        }

        let dir = self.dir_path(ino)?;
        let prefix = child_prefix(&dir);

        let found = match self.runtime.block_on(self.remote.list(&prefix, true, None)) {
            Ok(listing) => self.visible_children(&prefix, listing),
            Err(e) => {
                warn!(dir = %dir, error = %e, "Remote listing failed, showing local entries only");
                Vec::new()
            }
        };

        // Only take the write lock when something is actually new
        let bucket = self.config.bucket.as_str();
        let missing: Vec<(String, Discovered)> = self.store.view(|tx| {
            let records = tx.require_bucket(bucket)?;
            let mut missing = Vec::new();
            for (path, discovered) in found {
                if records.load(&path)?.is_none() {
                    missing.push((path, discovered));
                }
            }
            Ok::<_, FsError>(missing)
        })?;
        if !missing.is_empty() {
            self.adopt(&missing)?;
        }

        let children = self.store.view(|tx| {
            let records = tx.require_bucket(bucket)?;
            let children = records.children(&dir)?;
            Ok::<_, FsError>(children)
        })?;

        let mut entries: DirListing = Vec::with_capacity(children.len() + 2);
        {
            let mut inodes = self.inodes();
            let parent_ino = inodes.get_parent_ino(ino);
            entries.push((".".to_string(), ino, FileType::Directory));
            entries.push(("..".to_string(), parent_ino, FileType::Directory));
            for (path, record) in &children {
                inodes.insert(record.ino, path);
                entries.push((
                    base_name(path).to_string(),
                    record.ino,
                    file_type(record.kind),
                ));
            }
        }

        debug!(dir = %dir, entries = entries.len(), "Listed directory");
        self.attrs.insert_dir(ino, entries.clone());
        Ok(entries)
    }

    /// Open a file, populating the cache on first use
    pub fn open(&self, ino: u64, flags: i32) -> Result<u64, FsError> {
        let path = self.path_of(ino)?;
        let resource_key = self.resource_key(&path);
        let _guard = self.locks.lock(&resource_key);

        let mut record = self.load(&path)?.ok_or(FsError::NotFound)?;
        if record.is_dir() {
            return Err(FsError::IsDir);
        }
        let cache_path = self.populate(&path, &mut record)?;

        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&cache_path)?;
        let truncated = writable && flags & libc::O_TRUNC != 0;
        if truncated {
            file.set_len(0)?;
            self.attrs.invalidate(ino);
        }

        let handle = self.handles.acquire(
            ino,
            OpenFile {
                resource_key,
                path,
                cache_path,
                file,
                writable,
                dirty: AtomicBool::new(truncated),
            },
        );
        Ok(handle.handle_id)
    }

    /// Read from the cached copy
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let handle = self.handle(fh)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;

        while filled < buf.len() {
            match handle
                .open
                .file
                .read_at(&mut buf[filled..], offset + filled as u64)
            {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        buf.truncate(filled);
        self.cache.touch(handle.ino);
        Ok(buf)
    }

    /// Write to the cached copy; the upload happens on release
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let handle = self.handle(fh)?;
        if !handle.open.writable {
            return Err(FsError::BadHandle(fh));
        }

        handle.open.file.write_all_at(data, offset)?;
        handle.open.mark_dirty();
        self.attrs.invalidate(handle.ino);
        Ok(data.len() as u32)
    }

    /// Sync the cached copy to local disk (flush and fsync)
    pub fn flush(&self, fh: u64) -> Result<(), FsError> {
        let handle = self.handle(fh)?;
        handle.open.file.sync_data()?;
        Ok(())
    }

    /// Release a handle, queueing an upload if it was written to.
    ///
    /// The handle leaves the registry under the file's keyed lock, so other
    /// operations on the path see it either still open and dirty or with its
    /// upload already queued.
    pub fn release(&self, fh: u64) -> Result<(), FsError> {
        let Some(ino) = self.handles.get(fh).map(|h| h.ino) else {
            self.handles.release(fh);
            return Ok(());
        };

        // Paths follow renames made while the file was open
        let Some((path, _guard)) = self.lock_current_path(ino) else {
            // Unlinked while open
            if let Some(handle) = self.handles.release(fh) {
                if !self.handles.is_open(ino) {
                    self.cache.invalidate(ino);
                    let _ = fs::remove_file(&handle.open.cache_path);
                }
            }
            return Ok(());
        };

        let Some(handle) = self.handles.release(fh) else {
            return Ok(());
        };
        if handle.open.take_dirty() {
            self.upload(&handle, &path)?;
        }
        Ok(())
    }

    pub fn create(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        flags: i32,
    ) -> Result<(FileAttr, u64), FsError> {
        let parent_path = self.dir_path(parent)?;
        let path = join_path(&parent_path, name);
        let resource_key = self.resource_key(&path);
        let _guard = self.locks.lock(&resource_key);

        let cache_path = self.paths.new_cache_path()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&cache_path)?;

        let config = &self.config;
        let created = self.store.update(|tx| {
            let bucket = tx.require_bucket(&config.bucket)?;
            if bucket.load(&path)?.is_some() {
                return Err(FsError::Exists);
            }
            let ino = bucket.next_sequence()?;
            let mut record = MetaRecord::file(ino, 0, mode & 0o7777, config.uid, config.gid);
            record.cache_path = Some(cache_path.clone());
            bucket.store(&path, &record)?;
            Ok(record)
        });
        let record = match created {
            Ok(record) => record,
            Err(e) => {
                let _ = fs::remove_file(&cache_path);
                return Err(e);
            }
        };

        self.cache.track(record.ino, cache_path.clone(), 0);
        let attr = self.remember(&path, &record);
        self.attrs.invalidate(parent);

        info!(path = %path, ino = record.ino, "Created file");
        // Dirty from the start so even an empty file gets uploaded
        let handle = self.handles.acquire(
            record.ino,
            OpenFile {
                resource_key,
                path,
                cache_path,
                file,
                writable: flags & libc::O_ACCMODE != libc::O_RDONLY,
                dirty: AtomicBool::new(true),
            },
        );
        Ok((attr, handle.handle_id))
    }

    pub fn mkdir(&self, parent: u64, name: &str, mode: u32) -> Result<FileAttr, FsError> {
        let parent_path = self.dir_path(parent)?;
        let path = join_path(&parent_path, name);
        let _guard = self.locks.lock(&self.resource_key(&path));

        let config = &self.config;
        let record = self.store.update(|tx| {
            let bucket = tx.require_bucket(&config.bucket)?;
            if bucket.load(&path)?.is_some() {
                return Err(FsError::Exists);
            }
            let ino = bucket.next_sequence()?;
            let record = MetaRecord::directory(ino, mode & 0o7777, config.uid, config.gid);
            bucket.store(&path, &record)?;
            Ok(record)
        })?;

        self.writeback.enqueue(PendingOp::Put {
            path: child_prefix(&path),
            payload: Vec::new(),
        })?;
        self.attrs.invalidate(parent);

        info!(path = %path, ino = record.ino, "Created directory");
        Ok(self.remember(&path, &record))
    }

    pub fn unlink(&self, parent: u64, name: &str) -> Result<(), FsError> {
        let parent_path = self.dir_path(parent)?;
        let path = join_path(&parent_path, name);
        let _guard = self.locks.lock(&self.resource_key(&path));

        let config = &self.config;
        let record = self.store.update(|tx| {
            let bucket = tx.require_bucket(&config.bucket)?;
            let record = bucket.load(&path)?.ok_or(FsError::NotFound)?;
            if record.is_dir() {
                return Err(FsError::IsDir);
            }
            bucket.delete(&path)?;
            Ok(record)
        })?;

        self.forget(parent, &path, record.ino);
        if !self.handles.is_open(record.ino) {
            self.cache.invalidate(record.ino);
        }

        info!(path = %path, "Removed file");
        self.writeback.enqueue(PendingOp::Delete { path })?;
        Ok(())
    }

    pub fn rmdir(&self, parent: u64, name: &str) -> Result<(), FsError> {
        let parent_path = self.dir_path(parent)?;
        let path = join_path(&parent_path, name);
        let _guard = self.locks.lock(&self.resource_key(&path));

        let record = self.load(&path)?.ok_or(FsError::NotFound)?;
        if !record.is_dir() {
            return Err(FsError::NotDir);
        }
        if self.has_remote_children(&path)? {
            return Err(FsError::NotEmpty);
        }

        let config = &self.config;
        self.store.update(|tx| {
            let bucket = tx.require_bucket(&config.bucket)?;
            if !bucket.children(&path)?.is_empty() {
                return Err(FsError::NotEmpty);
            }
            bucket.delete(&path)?;
            Ok(())
        })?;

        self.forget(parent, &path, record.ino);

        info!(path = %path, "Removed directory");
        self.writeback.enqueue(PendingOp::Delete {
            path: child_prefix(&path),
        })?;
        Ok(())
    }

    /// Keys under a directory in the remote store, minus queued removals
    fn remote_subtree(&self, dir: &str) -> Result<Vec<String>, FsError> {
        let listing = self
            .runtime
            .block_on(self.remote.list(&child_prefix(dir), false, None))?;
        let pending = self.writeback.pending();

        Ok(listing
            .objects
            .into_iter()
            .map(|object| object.key)
            .filter(|key| !pending.has_removal(key))
            .collect())
    }

    /// Whether `path` exists remotely or is about to. Lookup failures count
    /// as present so the move is still attempted.
    fn has_remote_object(&self, path: &str) -> bool {
        let pending = self.writeback.pending();
        if pending.has_upload(path) {
            return true;
        }
        if pending.has_removal(path) {
            return false;
        }
        !matches!(self.runtime.block_on(self.remote.head(path)), Ok(None))
    }

    /// Rename a file or directory. Inode numbers are kept; an existing
    /// destination is replaced.
    pub fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(), FsError> {
        let from = join_path(&self.dir_path(parent)?, name);
        let to = join_path(&self.dir_path(new_parent)?, new_name);
        if from == to {
            return Ok(());
        }
        if to.starts_with(&child_prefix(&from)) {
            return Err(FsError::InvalidArgument("cannot move a directory into itself"));
        }

        // Fixed order so two opposite renames cannot deadlock
        let (first, second) = if from < to { (&from, &to) } else { (&to, &from) };
        let _first = self.locks.lock(&self.resource_key(first));
        let _second = self.locks.lock(&self.resource_key(second));

        let source = self.load(&from)?.ok_or(FsError::NotFound)?;
        if let Some(dest) = self.load(&to)? {
            match (source.is_dir(), dest.is_dir()) {
                (false, true) => return Err(FsError::IsDir),
                (true, false) => return Err(FsError::NotDir),
                (true, true) if self.has_remote_children(&to)? => return Err(FsError::NotEmpty),
                _ => {}
            }
        }
        let remote_keys = if source.is_dir() {
            self.remote_subtree(&from)?
        } else {
            Vec::new()
        };
        // A file still waiting for its first upload has nothing to move; the
        // upload on release goes to the new path
        let stored_remotely = source.is_dir() || self.has_remote_object(&from);

        let config = &self.config;
        let (moved, replaced) = self.store.update(|tx| {
            let bucket = tx.require_bucket(&config.bucket)?;
            let source = bucket.load(&from)?.ok_or(FsError::NotFound)?;

            let replaced = bucket.load(&to)?;
            if let Some(dest) = &replaced {
                if dest.is_dir() && !bucket.children(&to)?.is_empty() {
                    return Err(FsError::NotEmpty);
                }
                bucket.delete(&to)?;
            }

            let is_dir = source.is_dir();
            let mut moved = vec![(from.clone(), source)];
            if is_dir {
                moved.extend(bucket.descendants(&from)?);
            }
            for (path, _) in &moved {
                bucket.delete(path)?;
            }
            for (path, record) in &moved {
                bucket.store(&rebase(path, &from, &to), record)?;
            }
            Ok((moved, replaced))
        })?;

        {
            let mut inodes = self.inodes();
            inodes.remove_by_path(&to);
            inodes.rename(&from, &to);
        }
        if let Some(dest) = &replaced {
            if !self.handles.is_open(dest.ino) {
                self.cache.invalidate(dest.ino);
            }
        }
        self.attrs.clear();

        let ops = if source.is_dir() {
            let mut dirs = BTreeSet::new();
            let mut files = BTreeSet::new();
            let pending = self.writeback.pending();
            for (path, record) in &moved {
                if record.is_dir() {
                    dirs.insert(path.clone());
                } else if pending.has_upload(path) {
                    files.insert(path.clone());
                }
            }
            for key in remote_keys {
                match key.strip_suffix('/') {
                    Some(dir) => dirs.insert(dir.to_string()),
                    None => files.insert(key),
                };
            }

            // Directory markers are recreated rather than moved; implicit
            // directories have no marker to move
            let mut ops = Vec::with_capacity(2 * dirs.len() + files.len());
            for dir in &dirs {
                ops.push(PendingOp::Put {
                    path: child_prefix(&rebase(dir, &from, &to)),
                    payload: Vec::new(),
                });
            }
            for file in files {
                ops.push(PendingOp::Move {
                    destination: rebase(&file, &from, &to),
                    source: file,
                });
            }
            for dir in dirs {
                ops.push(PendingOp::Delete {
                    path: child_prefix(&dir),
                });
            }
            ops
        } else if stored_remotely {
            vec![PendingOp::Move {
                source: from.clone(),
                destination: to.clone(),
            }]
        } else {
            debug!(path = %from, "Renamed file has not been uploaded yet");
            Vec::new()
        };

        info!(from = %from, to = %to, objects = ops.len(), "Renamed");
        for op in ops {
            self.writeback.enqueue(op)?;
        }
        Ok(())
    }

    /// Copy a byte range between two open files.
    ///
    /// The bytes are always copied into the destination's cached copy. When
    /// that copy ends up equal to the source object as stored remotely, the
    /// upload becomes a server-side copy; otherwise the destination is
    /// uploaded on release.
    pub fn copy_file_range(
        &self,
        fh_in: u64,
        offset_in: u64,
        fh_out: u64,
        offset_out: u64,
        len: u64,
    ) -> Result<u32, FsError> {
        let src = self.handle(fh_in)?;
        let dst = self.handle(fh_out)?;
        if !dst.open.writable {
            return Err(FsError::BadHandle(fh_out));
        }

        let paths = {
            let inodes = self.inodes();
            let source = inodes.get_path(src.ino).map(str::to_string);
            let destination = inodes.get_path(dst.ino).map(str::to_string);
            source.zip(destination)
        };
        let candidate = paths
            .filter(|_| offset_in == 0 && offset_out == 0 && src.ino != dst.ino);

        // Uploads of either file are ordered against the check below
        let mut guards = Vec::with_capacity(2);
        if let Some((source, destination)) = &candidate {
            let (first, second) = if source < destination {
                (source, destination)
            } else {
                (destination, source)
            };
            guards.push(self.locks.lock(&self.resource_key(first)));
            guards.push(self.locks.lock(&self.resource_key(second)));
        }

        let src_size = src.open.file.metadata()?.len();
        let dst_size = dst.open.file.metadata()?.len();
        let count = len
            .min(src_size.saturating_sub(offset_in))
            .min(u32::MAX as u64) as usize;
        let mut buf = vec![0u8; count];
        src.open.file.read_exact_at(&mut buf, offset_in)?;
        dst.open.file.write_all_at(&buf, offset_out)?;

        let server_side = candidate.filter(|(source, _)| {
            // Bytes past the copied range would survive locally but not remotely
            len >= src_size
                && dst_size <= src_size
                && !self.handles.has_dirty(src.ino)
                && !self.writeback.pending().has_upload(source)
        });

        match server_side {
            Some((source, destination)) => {
                if let Some(mut record) = self.load(&destination)? {
                    record.size = src_size;
                    record.mtime = SystemTime::now();
                    record.cache_path = Some(dst.open.cache_path.clone());
                    self.save(&destination, &record)?;
                }
                self.cache
                    .track(dst.ino, dst.open.cache_path.clone(), src_size);
                // The local copy now equals what the server-side copy produces
                dst.open.take_dirty();

                debug!(source = %source, destination = %destination, "Server-side copy");
                self.writeback.enqueue(PendingOp::Copy {
                    source,
                    destination,
                })?;
            }
            None => dst.open.mark_dirty(),
        }
        drop(guards);

        self.attrs.invalidate(dst.ino);
        Ok(count as u32)
    }

    pub fn statfs(&self) -> FsStats {
        FsStats {
            blocks: STATFS_BLOCKS,
            bfree: STATFS_BLOCKS,
            bavail: STATFS_BLOCKS,
            files: 0,
            ffree: 0,
            bsize: STATFS_BSIZE,
            namelen: STATFS_NAMELEN,
            frsize: STATFS_BSIZE,
        }
    }
}
