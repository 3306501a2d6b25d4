//! Attribute and directory listing cache
//!
//! Short-lived in-memory layer in front of the metadata store and remote
//! listings, so repeated `getattr`/`readdir` calls from the kernel do not
//! hit redb or the object store. Built on synchronous moka caches since FUSE
//! workers are blocking threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fuser::{FileAttr, FileType};
use moka::sync::Cache;
use tracing::{debug, trace};

/// One directory entry: (name, inode, kind)
pub type DirListing = Vec<(String, u64, FileType)>;

/// Attributes change locally only through this daemon, so they can live longer
const ATTR_TTL: Duration = Duration::from_secs(60);

/// Listings also reflect remote changes made by other clients
const DIR_TTL: Duration = Duration::from_secs(10);

const MAX_ATTRS: u64 = 100_000;
const MAX_LISTINGS: u64 = 10_000;

#[derive(Default)]
struct Counter {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counter {
    fn record(&self, hit: bool) {
        let slot = if hit { &self.hits } else { &self.misses };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    fn load(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of cache effectiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub attr_hits: u64,
    pub attr_misses: u64,
    pub dir_hits: u64,
    pub dir_misses: u64,
}

impl CacheStats {
    /// Overall hit rate in percent
    pub fn hit_rate(&self) -> f64 {
        let hits = self.attr_hits + self.dir_hits;
        let total = hits + self.attr_misses + self.dir_misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 * 100.0 / total as f64
    }
}

/// Attribute cache keyed by inode, plus listings keyed by directory inode
pub struct MetadataCache {
    attrs: Cache<u64, FileAttr>,
    listings: Cache<u64, DirListing>,
    attr_counter: Counter,
    dir_counter: Counter,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::with_ttls(ATTR_TTL, DIR_TTL)
    }

    pub fn with_ttls(attr_ttl: Duration, dir_ttl: Duration) -> Self {
        Self {
            attrs: Cache::builder()
                .time_to_live(attr_ttl)
                .max_capacity(MAX_ATTRS)
                .name("attr_cache")
                .build(),
            listings: Cache::builder()
                .time_to_live(dir_ttl)
                .max_capacity(MAX_LISTINGS)
                .name("dir_listing_cache")
                .build(),
            attr_counter: Counter::default(),
            dir_counter: Counter::default(),
        }
    }

    pub fn get_attr(&self, ino: u64) -> Option<FileAttr> {
        let attr = self.attrs.get(&ino);
        self.attr_counter.record(attr.is_some());
        trace!(ino = ino, hit = attr.is_some(), "Attribute cache lookup");
        attr
    }

    pub fn insert_attr(&self, attr: FileAttr) {
        self.attrs.insert(attr.ino, attr);
    }

    pub fn get_dir(&self, ino: u64) -> Option<DirListing> {
        let listing = self.listings.get(&ino);
        self.dir_counter.record(listing.is_some());
        trace!(ino = ino, hit = listing.is_some(), "Directory cache lookup");
        listing
    }

    pub fn insert_dir(&self, ino: u64, entries: DirListing) {
        debug!(ino = ino, entries = entries.len(), "Cached directory listing");
        self.listings.insert(ino, entries);
    }

    /// Drop everything cached for `ino`, attributes and (for a directory)
    /// its listing
    pub fn invalidate(&self, ino: u64) {
        self.attrs.invalidate(&ino);
        self.listings.invalidate(&ino);
        trace!(ino = ino, "Invalidated metadata cache for inode");
    }

    /// An entry was added to or removed from `parent`
    pub fn invalidate_entry(&self, parent: u64, ino: u64) {
        self.invalidate(ino);
        self.listings.invalidate(&parent);
        self.attrs.invalidate(&parent);
    }

    /// Drop everything, e.g. after a rename moved a whole subtree
    pub fn clear(&self) {
        self.attrs.invalidate_all();
        self.listings.invalidate_all();
        debug!("Cleared metadata caches");
    }

    pub fn stats(&self) -> CacheStats {
        let (attr_hits, attr_misses) = self.attr_counter.load();
        let (dir_hits, dir_misses) = self.dir_counter.load();
        CacheStats {
            attr_hits,
            attr_misses,
            dir_hits,
            dir_misses,
        }
    }

    /// Log and reset the counters for the next monitor period
    pub fn log_metrics(&self) {
        let stats = self.stats();
        debug!(
            attr_hits = stats.attr_hits,
            attr_misses = stats.attr_misses,
            dir_hits = stats.dir_hits,
            dir_misses = stats.dir_misses,
            hit_rate = format!("{:.1}%", stats.hit_rate()),
            attr_entries = self.attrs.entry_count(),
            dir_entries = self.listings.entry_count(),
            "Metadata cache metrics"
        );
        self.attr_counter.reset();
        self.dir_counter.reset();
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::SystemTime;

    fn attr(ino: u64, kind: FileType) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size: 1024,
            blocks: 2,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: 0o644,
            nlink: 1,
            uid: 501,
            gid: 20,
            rdev: 0,
            flags: 0,
            blksize: 4096,
        }
    }

    #[test]
    fn test_hits_and_misses_counted_per_kind() {
        let cache = MetadataCache::new();

        assert!(cache.get_attr(2).is_none());
        cache.insert_attr(attr(2, FileType::RegularFile));
        assert_eq!(cache.get_attr(2).unwrap().ino, 2);
        assert!(cache.get_dir(1).is_none());

        let stats = cache.stats();
        assert_eq!((stats.attr_hits, stats.attr_misses), (1, 1));
        assert_eq!((stats.dir_hits, stats.dir_misses), (0, 1));
        assert!((stats.hit_rate() - 100.0 / 3.0).abs() < 0.01);

        cache.log_metrics();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_invalidate_entry_drops_child_and_parent_listing() {
        let cache = MetadataCache::new();
        cache.insert_attr(attr(1, FileType::Directory));
        cache.insert_attr(attr(3, FileType::RegularFile));
        cache.insert_attr(attr(4, FileType::RegularFile));
        cache.insert_dir(1, vec![("file.txt".to_string(), 3, FileType::RegularFile)]);

        cache.invalidate_entry(1, 3);

        assert!(cache.get_attr(3).is_none());
        assert!(cache.get_dir(1).is_none());
        assert!(cache.get_attr(1).is_none());
        assert!(cache.get_attr(4).is_some());
    }

    #[test]
    fn test_listing_expires() {
        let cache = MetadataCache::with_ttls(Duration::from_secs(60), Duration::from_millis(50));
        cache.insert_dir(1, vec![(".".to_string(), 1, FileType::Directory)]);
        assert!(cache.get_dir(1).is_some());

        thread::sleep(Duration::from_millis(120));
        assert!(cache.get_dir(1).is_none());
    }

    #[test]
    fn test_clear() {
        let cache = MetadataCache::new();
        cache.insert_attr(attr(1, FileType::Directory));
        cache.insert_dir(1, Vec::new());

        cache.clear();

        assert!(cache.get_attr(1).is_none());
        assert!(cache.get_dir(1).is_none());
    }
}
