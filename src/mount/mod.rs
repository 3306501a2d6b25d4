//! Mount lifecycle and FUSE transport

pub mod controller;
pub mod transport;

pub use controller::{Controller, Lifecycle, LifecycleError, State};
pub use transport::FuseTransport;
