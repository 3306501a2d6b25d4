//! Remote object store access

pub mod client;
pub mod errors;
#[cfg(test)]
pub mod memory;
pub mod types;

pub use client::{RemoteStore, S3Remote};
pub use errors::RemoteError;
pub use types::{Listing, ObjectInfo};
