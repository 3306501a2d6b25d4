//! Remote store value types

use std::time::SystemTime;

/// One stored object as reported by a listing or a head request
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    /// Key relative to the mount's base path
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

impl ObjectInfo {
    /// Directory marker objects end with a slash
    pub fn is_dir_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// Result of a delimited listing
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Objects directly under the prefix
    pub objects: Vec<ObjectInfo>,
    /// Common prefixes ("sub-directories"), relative keys ending in '/'
    pub prefixes: Vec<String>,
}
