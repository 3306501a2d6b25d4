//! Metadata records stored per path in the index

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::store::{Bucket, BucketMut, MetaError};

/// Kind of node a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Directory,
}

/// Persisted state of one file or directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRecord {
    /// Inode number allocated from the bucket sequence
    pub ino: u64,
    pub kind: NodeKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    /// Entity tag reported by the remote store, if the object came from there
    #[serde(default)]
    pub etag: Option<String>,
    /// Local materialization of the object content
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

impl MetaRecord {
    pub fn file(ino: u64, size: u64, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            ino,
            kind: NodeKind::File,
            size,
            mode,
            uid,
            gid,
            mtime: SystemTime::now(),
            etag: None,
            cache_path: None,
        }
    }

    pub fn directory(ino: u64, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            ino,
            kind: NodeKind::Directory,
            size: 0,
            mode,
            uid,
            gid,
            mtime: SystemTime::now(),
            etag: None,
            cache_path: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Self, MetaError> {
        serde_json::from_slice(bytes).map_err(|source| MetaError::Corrupt {
            key: key.to_string(),
            source,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, MetaError> {
        serde_json::to_vec(self).map_err(MetaError::Encode)
    }
}

/// Typed record access on a read-write bucket
pub trait RecordsMut {
    fn load(&self, path: &str) -> Result<Option<MetaRecord>, MetaError>;
    fn store(&self, path: &str, record: &MetaRecord) -> Result<(), MetaError>;
    fn children(&self, dir: &str) -> Result<Vec<(String, MetaRecord)>, MetaError>;
    fn descendants(&self, dir: &str) -> Result<Vec<(String, MetaRecord)>, MetaError>;
}

impl RecordsMut for BucketMut<'_> {
    fn load(&self, path: &str) -> Result<Option<MetaRecord>, MetaError> {
        self.get(path)?
            .map(|bytes| MetaRecord::decode(path, &bytes))
            .transpose()
    }

    fn store(&self, path: &str, record: &MetaRecord) -> Result<(), MetaError> {
        self.put(path, &record.encode()?)
    }

    fn children(&self, dir: &str) -> Result<Vec<(String, MetaRecord)>, MetaError> {
        let entries = self.scan_prefix(&child_prefix(dir))?;
        decode_children(dir, entries)
    }

    fn descendants(&self, dir: &str) -> Result<Vec<(String, MetaRecord)>, MetaError> {
        self.scan_prefix(&child_prefix(dir))?
            .into_iter()
            .map(|(key, bytes)| MetaRecord::decode(&key, &bytes).map(|r| (key, r)))
            .collect()
    }
}

/// Typed record access on a read-only bucket
pub trait Records {
    fn load(&self, path: &str) -> Result<Option<MetaRecord>, MetaError>;
    fn children(&self, dir: &str) -> Result<Vec<(String, MetaRecord)>, MetaError>;
}

impl Records for Bucket<'_> {
    fn load(&self, path: &str) -> Result<Option<MetaRecord>, MetaError> {
        self.get(path)?
            .map(|bytes| MetaRecord::decode(path, &bytes))
            .transpose()
    }

    fn children(&self, dir: &str) -> Result<Vec<(String, MetaRecord)>, MetaError> {
        let entries = self.scan_prefix(&child_prefix(dir))?;
        decode_children(dir, entries)
    }
}

/// Key prefix shared by everything below `dir` ("" is the root)
pub fn child_prefix(dir: &str) -> String {
    if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    }
}

/// Join a directory path and an entry name
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last component of a path
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent directory of a path ("" for top-level entries)
pub fn parent_path(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

fn decode_children(
    dir: &str,
    entries: Vec<(String, Vec<u8>)>,
) -> Result<Vec<(String, MetaRecord)>, MetaError> {
    let prefix_len = child_prefix(dir).len();
    let mut children = Vec::new();
    for (key, bytes) in entries {
        // The root record lives at "" and is not its own child
        if key.is_empty() || key[prefix_len..].contains('/') {
            continue;
        }
        children.push((key.clone(), MetaRecord::decode(&key, &bytes)?));
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaStore;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
        assert_eq!(base_name("a/b/c"), "c");
        assert_eq!(base_name("c"), "c");
        assert_eq!(parent_path("a/b/c"), "a/b");
        assert_eq!(parent_path("c"), "");
        assert_eq!(child_prefix(""), "");
        assert_eq!(child_prefix("a"), "a/");
    }

    #[test]
    fn test_children_are_direct_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("cache.db")).unwrap();

        store
            .update(|tx| {
                let bucket = tx.create_bucket_if_not_exists("root")?;
                bucket.store("", &MetaRecord::directory(1, 0o755, 0, 0))?;
                bucket.store("docs", &MetaRecord::directory(2, 0o755, 0, 0))?;
                bucket.store("docs/a.txt", &MetaRecord::file(3, 10, 0o644, 0, 0))?;
                bucket.store("docs/sub", &MetaRecord::directory(4, 0o755, 0, 0))?;
                bucket.store("docs/sub/b.txt", &MetaRecord::file(5, 1, 0o644, 0, 0))?;
                bucket.store("docsx", &MetaRecord::file(6, 1, 0o644, 0, 0))
            })
            .unwrap();

        let names = |dir: &str| -> Vec<String> {
            store
                .view(|tx| tx.require_bucket("root")?.children(dir))
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect()
        };

        assert_eq!(names(""), vec!["docs", "docsx"]);
        assert_eq!(names("docs"), vec!["docs/a.txt", "docs/sub"]);

        let all = store
            .update(|tx| tx.require_bucket("root")?.descendants("docs"))
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_record_roundtrip_keeps_cache_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("cache.db")).unwrap();

        let mut record = MetaRecord::file(7, 42, 0o600, 501, 20);
        record.cache_path = Some(dir.path().join("blob"));
        record.etag = Some("\"abc\"".into());

        store
            .update(|tx| tx.create_bucket_if_not_exists("root")?.store("f", &record))
            .unwrap();
        let loaded = store
            .view(|tx| tx.require_bucket("root")?.load("f"))
            .unwrap();
        assert_eq!(loaded, Some(record));
    }
}
