//! Inode table mapping inode numbers to paths
//!
//! Inode numbers themselves are allocated from the metadata store sequence
//! and persisted there; this table is the in-memory reverse index the kernel
//! needs, filled as records are looked up.

use std::collections::HashMap;

/// Root inode number (always 1 per FUSE convention)
pub const ROOT_INO: u64 = 1;

/// Bidirectional path/inode index
pub struct InodeTable {
    /// Map from path (relative to mount root) to inode number
    path_to_ino: HashMap<String, u64>,
    /// Map from inode number to path
    ino_to_path: HashMap<u64, String>,
}

impl InodeTable {
    /// Create a table holding only the root (empty path)
    pub fn new() -> Self {
        let mut table = Self {
            path_to_ino: HashMap::new(),
            ino_to_path: HashMap::new(),
        };
        table.insert(ROOT_INO, "");
        table
    }

    /// Record that `path` has inode `ino`, replacing stale mappings of either
    pub fn insert(&mut self, ino: u64, path: &str) {
        if let Some(old_path) = self.ino_to_path.insert(ino, path.to_string()) {
            if old_path != path {
                self.path_to_ino.remove(&old_path);
            }
        }
        if let Some(old_ino) = self.path_to_ino.insert(path.to_string(), ino) {
            if old_ino != ino {
                self.ino_to_path.remove(&old_ino);
            }
        }
    }

    /// Get the path for an inode number
    pub fn get_path(&self, ino: u64) -> Option<&str> {
        self.ino_to_path.get(&ino).map(|s| s.as_str())
    }

    /// Get the inode for a path
    pub fn get_ino(&self, path: &str) -> Option<u64> {
        self.path_to_ino.get(path).copied()
    }

    /// Get parent inode for a given inode
    pub fn get_parent_ino(&self, ino: u64) -> u64 {
        let Some(path) = self.get_path(ino) else {
            return ROOT_INO;
        };
        match path.rfind('/') {
            Some(last_slash) => self.get_ino(&path[..last_slash]).unwrap_or(ROOT_INO),
            None => ROOT_INO,
        }
    }

    /// Remove a path mapping and return its inode number
    pub fn remove_by_path(&mut self, path: &str) -> Option<u64> {
        let ino = self.path_to_ino.remove(path)?;
        self.ino_to_path.remove(&ino);
        Some(ino)
    }

    /// Move `from` and every path below it under `to`, keeping inode numbers
    pub fn rename(&mut self, from: &str, to: &str) {
        let prefix = format!("{}/", from);
        let moved: Vec<(String, u64)> = self
            .path_to_ino
            .iter()
            .filter(|(path, _)| path.as_str() == from || path.starts_with(&prefix))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (path, _) in &moved {
            self.path_to_ino.remove(path);
        }
        for (path, ino) in moved {
            let new_path = format!("{}{}", to, &path[from.len()..]);
            self.insert(ino, &new_path);
        }
    }

    pub fn len(&self) -> usize {
        self.ino_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ino_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
