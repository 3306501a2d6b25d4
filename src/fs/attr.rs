//! Conversion of metadata records to FUSE attributes

use fuser::{FileAttr, FileType};

use crate::meta::{MetaRecord, NodeKind};

/// Preferred I/O block size reported to the kernel
const BLOCK_SIZE: u32 = 4096;

pub fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
    }
}

/// Convert a metadata record to a FUSE FileAttr
pub fn record_to_attr(record: &MetaRecord) -> FileAttr {
    let is_dir = record.is_dir();

    FileAttr {
        ino: record.ino,
        size: record.size,
        // 512-byte blocks as per POSIX
        blocks: record.size.div_ceil(512),
        atime: record.mtime,
        mtime: record.mtime,
        ctime: record.mtime,
        crtime: record.mtime,
        kind: file_type(record.kind),
        perm: (record.mode & 0o7777) as u16,
        nlink: if is_dir { 2 } else { 1 },
        uid: record.uid,
        gid: record.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}
