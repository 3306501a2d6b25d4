//! FUSE adapter
//!
//! Every callback hands its request to a blocking worker on the session
//! runtime and replies from there, so a slow remote fetch never holds up the
//! FUSE session loop.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, warn};

use super::ops::{FsError, SetAttr};
use crate::session::Session;

/// How long the kernel may cache attributes and entries
const TTL: Duration = Duration::from_secs(1);

/// Filesystem handed to `fuser`
pub struct BucketFs {
    session: Arc<Session>,
}

impl BucketFs {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Run `op` on a blocking worker
    fn dispatch<F>(&self, op: F)
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        session.runtime.clone().spawn_blocking(move || op(&session));
    }
}

/// Entry names must be UTF-8 to become object keys
fn entry_name(name: &OsStr) -> Result<String, FsError> {
    name.to_str()
        .map(str::to_string)
        .ok_or(FsError::InvalidArgument("name is not valid UTF-8"))
}

fn offset(value: i64) -> Result<u64, FsError> {
    u64::try_from(value).map_err(|_| FsError::InvalidArgument("negative offset"))
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Log a failed operation at a level matching how unusual it is
fn log_failure(op: &str, err: &FsError) {
    match err {
        FsError::NotFound | FsError::Exists | FsError::NotEmpty => {
            debug!(op = op, error = %err, "Operation failed")
        }
        _ => warn!(op = op, error = %err, errno = err.errno(), "Operation failed"),
    }
}

macro_rules! reply_err {
    ($reply:expr, $op:expr, $err:expr) => {{
        let err = $err;
        log_failure($op, &err);
        $reply.error(err.errno());
    }};
}

impl Filesystem for BucketFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = entry_name(name);
        self.dispatch(move |s| match name.and_then(|n| s.lookup(parent, &n)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply_err!(reply, "lookup", e),
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.dispatch(move |s| match s.getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply_err!(reply, "getattr", e),
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            mtime: mtime.map(resolve_time),
            fh,
        };
        self.dispatch(move |s| match s.setattr(ino, changes) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply_err!(reply, "setattr", e),
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!(ino = ino, flags = flags, "open");
        self.dispatch(move |s| match s.open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply_err!(reply, "open", e),
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset_in: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.dispatch(move |s| match offset(offset_in).and_then(|o| s.read(fh, o, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply_err!(reply, "read", e),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset_in: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        self.dispatch(move |s| match offset(offset_in).and_then(|o| s.write(fh, o, &data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply_err!(reply, "write", e),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.dispatch(move |s| match s.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "flush", e),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch(move |s| match s.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "release", e),
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.dispatch(move |s| match s.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "fsync", e),
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        // Listings are served from the directory cache, no per-open state
        self.dispatch(move |s| match s.getattr(ino) {
            Ok(attr) if attr.kind == fuser::FileType::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply_err!(reply, "opendir", e),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.dispatch(move |s| {
            let entries = match s.readdir(ino) {
                Ok(entries) => entries,
                Err(e) => {
                    reply_err!(reply, "readdir", e);
                    return;
                }
            };

            let skip = usize::try_from(offset).unwrap_or(0);
            for (i, (name, entry_ino, kind)) in entries.iter().enumerate().skip(skip) {
                // reply.add returns true once the buffer is full
                if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.session.statfs();
        reply.statfs(
            stats.blocks,
            stats.bfree,
            stats.bavail,
            stats.files,
            stats.ffree,
            stats.bsize,
            stats.namelen,
            stats.frsize,
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = entry_name(name);
        self.dispatch(move |s| {
            match name.and_then(|n| s.create(parent, &n, mode & !umask, flags)) {
                Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
                Err(e) => reply_err!(reply, "create", e),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = entry_name(name);
        self.dispatch(move |s| match name.and_then(|n| s.mkdir(parent, &n, mode & !umask)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply_err!(reply, "mkdir", e),
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = entry_name(name);
        self.dispatch(move |s| match name.and_then(|n| s.unlink(parent, &n)) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "unlink", e),
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = entry_name(name);
        self.dispatch(move |s| match name.and_then(|n| s.rmdir(parent, &n)) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "rmdir", e),
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE / RENAME_EXCHANGE are not supported
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let names = entry_name(name).and_then(|n| Ok((n, entry_name(newname)?)));
        self.dispatch(move |s| {
            match names.and_then(|(from, to)| s.rename(parent, &from, newparent, &to)) {
                Ok(()) => reply.ok(),
                Err(e) => reply_err!(reply, "rename", e),
            }
        });
    }

    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        _ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        _ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        self.dispatch(move |s| {
            let result = offset(offset_in).and_then(|o_in| {
                let o_out = offset(offset_out)?;
                s.copy_file_range(fh_in, o_in, fh_out, o_out, len)
            });
            match result {
                Ok(written) => reply.written(written),
                Err(e) => reply_err!(reply, "copy_file_range", e),
            }
        });
    }
}
