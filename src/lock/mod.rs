//! Per-resource locking

pub mod keyed;

pub use keyed::{KeyedGuard, KeyedMutex};
