//! Asynchronous write-back of filesystem mutations to the remote store

pub mod pending;
pub mod pipeline;
pub mod retry;

pub use pending::{PendingPaths, Touch};
pub use pipeline::{PendingOp, PipelineError, WriteBack};
pub use retry::{FailureEntry, FailureLog, RetryPolicy};
