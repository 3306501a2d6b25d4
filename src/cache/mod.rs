//! Local caching layer
//!
//! Cache path allocation, on-disk payload cache with quota eviction, and a
//! short-lived attribute cache built on Moka.

pub mod file_cache;
pub mod metadata;
pub mod path;

pub use file_cache::FileCache;
pub use metadata::{DirListing, MetadataCache};
pub use path::CachePathAllocator;
