//! Persistent metadata index
//!
//! Maps paths to records carrying stable inode numbers, backed by an embedded
//! transactional key-value store that survives restarts.

pub mod record;
pub mod store;

pub use record::{MetaRecord, NodeKind, Records, RecordsMut};
pub use store::{MetaError, MetaStore};
