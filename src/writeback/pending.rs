//! Paths with queued but not yet applied write-back operations
//!
//! Remote discovery must not resurrect a path whose removal is still queued,
//! and the cache must not evict content whose upload is still queued.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Effect of a queued operation on one remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Touch {
    Removal(String),
    Upload(String),
}

#[derive(Debug, Default, Clone, Copy)]
struct Marks {
    removals: usize,
    uploads: usize,
}

/// Reference counts of queued removals and uploads per path
#[derive(Default)]
pub struct PendingPaths {
    paths: Mutex<HashMap<String, Marks>>,
}

impl PendingPaths {
    pub fn new() -> Self {
        Self::default()
    }

    fn paths(&self) -> MutexGuard<'_, HashMap<String, Marks>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, touches: &[Touch]) {
        let mut paths = self.paths();
        for touch in touches {
            match touch {
                Touch::Removal(path) => paths.entry(path.clone()).or_default().removals += 1,
                Touch::Upload(path) => paths.entry(path.clone()).or_default().uploads += 1,
            }
        }
    }

    pub fn complete(&self, touches: &[Touch]) {
        let mut paths = self.paths();
        for touch in touches {
            let path = match touch {
                Touch::Removal(path) | Touch::Upload(path) => path,
            };
            let Some(marks) = paths.get_mut(path) else {
                continue;
            };
            match touch {
                Touch::Removal(_) => marks.removals = marks.removals.saturating_sub(1),
                Touch::Upload(_) => marks.uploads = marks.uploads.saturating_sub(1),
            }
            if marks.removals == 0 && marks.uploads == 0 {
                paths.remove(path);
            }
        }
    }

    /// Whether a queued operation will remove `path` from the remote store
    pub fn has_removal(&self, path: &str) -> bool {
        self.paths().get(path).is_some_and(|m| m.removals > 0)
    }

    /// Whether a queued operation will write `path` to the remote store
    pub fn has_upload(&self, path: &str) -> bool {
        self.paths().get(path).is_some_and(|m| m.uploads > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.paths().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_are_counted() {
        let pending = PendingPaths::new();
        let delete = [Touch::Removal("a".into())];

        pending.register(&delete);
        pending.register(&delete);
        assert!(pending.has_removal("a"));
        assert!(!pending.has_upload("a"));

        pending.complete(&delete);
        assert!(pending.has_removal("a"));
        pending.complete(&delete);
        assert!(!pending.has_removal("a"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_move_marks_both_paths() {
        let pending = PendingPaths::new();
        let touches = [Touch::Removal("old".into()), Touch::Upload("new".into())];

        pending.register(&touches);
        assert!(pending.has_removal("old"));
        assert!(pending.has_upload("new"));
        assert!(!pending.has_removal("new"));

        pending.complete(&touches);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unknown_completion_ignored() {
        let pending = PendingPaths::new();
        pending.complete(&[Touch::Upload("x".into())]);
        assert!(pending.is_empty());
    }
}
