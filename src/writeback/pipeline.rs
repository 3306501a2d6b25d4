//! Write-back pipeline
//!
//! Filesystem mutations are queued here instead of being sent to the remote
//! store inline. A single consumer task applies them strictly in queue order,
//! one at a time. Closing the pipeline stops intake; whatever is already
//! queued is still applied before the consumer exits.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pending::{PendingPaths, Touch};
use super::retry::{FailureEntry, FailureLog, RetryPolicy};
use crate::remote::RemoteStore;

/// A deferred mutation of the remote store. Consumed exactly once.
pub enum PendingOp {
    /// Rename an object (copy, then delete the source)
    Move { source: String, destination: String },
    /// Server-side copy
    Copy { source: String, destination: String },
    /// Upload the full content of an object
    Put { path: String, payload: Vec<u8> },
    Delete { path: String },
}

impl PendingOp {
    pub fn name(&self) -> &'static str {
        match self {
            PendingOp::Move { .. } => "move",
            PendingOp::Copy { .. } => "copy",
            PendingOp::Put { .. } => "put",
            PendingOp::Delete { .. } => "delete",
        }
    }

    /// Remote paths this operation removes or writes
    pub fn touches(&self) -> Vec<Touch> {
        match self {
            PendingOp::Move {
                source,
                destination,
            } => vec![
                Touch::Removal(source.clone()),
                Touch::Upload(destination.clone()),
            ],
            PendingOp::Copy { destination, .. } => vec![Touch::Upload(destination.clone())],
            PendingOp::Put { path, .. } => vec![Touch::Upload(path.clone())],
            PendingOp::Delete { path } => vec![Touch::Removal(path.clone())],
        }
    }
}

impl fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOp::Move {
                source,
                destination,
            } => write!(f, "Move({} -> {})", source, destination),
            PendingOp::Copy {
                source,
                destination,
            } => write!(f, "Copy({} -> {})", source, destination),
            PendingOp::Put { path, payload } => write!(f, "Put({}, {} bytes)", path, payload.len()),
            PendingOp::Delete { path } => write!(f, "Delete({})", path),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Write-back pipeline is closed")]
    Closed,
}

/// Producer side of the pipeline plus the consumer task handle
pub struct WriteBack {
    /// `None` once closed
    sender: Mutex<Option<mpsc::Sender<PendingOp>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<PendingPaths>,
    failures: Arc<FailureLog>,
}

impl WriteBack {
    /// Create the queue and spawn its consumer on `runtime`
    ///
    /// # Arguments
    /// * `remote` - Store the operations are applied to
    /// * `capacity` - Queue bound; producers block while it is full
    /// * `retry` - Backoff for retryable remote errors
    /// * `runtime` - Runtime running the consumer task
    pub fn start(
        remote: Arc<dyn RemoteStore>,
        capacity: usize,
        retry: RetryPolicy,
        runtime: &Handle,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let pending = Arc::new(PendingPaths::new());
        let failures = Arc::new(FailureLog::new());

        let consumer = Consumer {
            remote,
            retry,
            pending: Arc::clone(&pending),
            failures: Arc::clone(&failures),
        };
        let task = runtime.spawn(consumer.run(receiver));

        info!(capacity = capacity, "Write-back pipeline started");

        Self {
            sender: Mutex::new(Some(sender)),
            consumer: Mutex::new(Some(task)),
            pending,
            failures,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<PendingOp>, PipelineError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PipelineError::Closed)
    }

    fn consumer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an operation, blocking while the queue is full.
    ///
    /// Must be called from a blocking context (a worker thread), never from
    /// inside an async task.
    pub fn enqueue(&self, op: PendingOp) -> Result<(), PipelineError> {
        let sender = self.sender()?;
        let touches = op.touches();
        self.pending.register(&touches);

        debug!(op = ?op, "Queueing write-back operation");
        if sender.blocking_send(op).is_err() {
            self.pending.complete(&touches);
            return Err(PipelineError::Closed);
        }
        Ok(())
    }

    /// Async variant of [`WriteBack::enqueue`]
    pub async fn submit(&self, op: PendingOp) -> Result<(), PipelineError> {
        let sender = self.sender()?;
        let touches = op.touches();
        self.pending.register(&touches);

        debug!(op = ?op, "Queueing write-back operation");
        if sender.send(op).await.is_err() {
            self.pending.complete(&touches);
            return Err(PipelineError::Closed);
        }
        Ok(())
    }

    /// Stop accepting operations. Already queued ones are still applied.
    pub fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            info!("Write-back pipeline closed, draining");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Wait for the consumer to finish. Returns immediately if the pipeline
    /// is still open and only after the drain once it has been closed.
    pub async fn join(&self) {
        let task = self.consumer().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Write-back consumer task failed");
            }
        }
    }

    /// Paths with queued operations
    pub fn pending(&self) -> &PendingPaths {
        &self.pending
    }

    /// Recent permanent failures, oldest first
    pub fn failures(&self) -> Vec<FailureEntry> {
        self.failures.recent()
    }
}

/// Applies queued operations to the remote store
struct Consumer {
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    pending: Arc<PendingPaths>,
    failures: Arc<FailureLog>,
}

impl Consumer {
    async fn run(self, mut receiver: mpsc::Receiver<PendingOp>) {
        debug!("Write-back consumer running");
        let mut applied: u64 = 0;

        while let Some(op) = receiver.recv().await {
            let touches = op.touches();
            self.apply(op).await;
            self.pending.complete(&touches);
            applied += 1;
        }

        info!(applied = applied, "Write-back consumer drained");
    }

    async fn apply(&self, op: PendingOp) {
        debug!(op = ?op, "Applying write-back operation");
        match op {
            PendingOp::Move {
                source,
                destination,
            } => self.apply_move(&source, &destination).await,
            PendingOp::Copy {
                source,
                destination,
            } => self.apply_copy(&source, &destination).await,
            PendingOp::Put { path, payload } => self.apply_put(&path, &payload).await,
            PendingOp::Delete { path } => self.apply_delete(&path).await,
        }
    }

    async fn apply_put(&self, path: &str, payload: &[u8]) {
        let remote = self.remote.as_ref();
        let result = self
            .retry
            .run("put", path, move || async move {
                remote.put(path, payload.to_vec()).await
            })
            .await;

        if let Err(e) = result {
            self.failures.record("put", path, &e);
        }
    }

    async fn apply_copy(&self, source: &str, destination: &str) {
        let remote = self.remote.as_ref();
        let result = self
            .retry
            .run("copy", source, move || async move {
                remote.copy(source, destination).await
            })
            .await;

        if let Err(e) = result {
            self.failures.record("copy", source, &e);
        }
    }

    /// Copy then delete; the delete is retried on its own so a failing
    /// delete never repeats the copy.
    async fn apply_move(&self, source: &str, destination: &str) {
        let remote = self.remote.as_ref();
        let copied = self
            .retry
            .run("move", source, move || async move {
                remote.copy(source, destination).await
            })
            .await;
        if let Err(e) = copied {
            self.failures.record("move", source, &e);
            return;
        }

        let deleted = self
            .retry
            .run("move", source, move || async move { remote.delete(source).await })
            .await;
        match deleted {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(source = source, "Move source already gone");
            }
            Err(e) => self.failures.record("move", source, &e),
        }
    }

    async fn apply_delete(&self, path: &str) {
        let remote = self.remote.as_ref();
        let result = self
            .retry
            .run("delete", path, move || async move { remote.delete(path).await })
            .await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(path = path, "Object already deleted");
            }
            Err(e) => self.failures.record("delete", path, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryRemote;
    use crate::remote::RemoteError;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn put(path: &str, payload: &[u8]) -> PendingOp {
        PendingOp::Put {
            path: path.to_string(),
            payload: payload.to_vec(),
        }
    }

    fn start(rt: &tokio::runtime::Runtime, remote: &Arc<MemoryRemote>) -> WriteBack {
        let remote: Arc<dyn RemoteStore> = remote.clone();
        WriteBack::start(remote, 16, fast_policy(), rt.handle())
    }

    fn drain(rt: &tokio::runtime::Runtime, writeback: &WriteBack) {
        writeback.close();
        rt.block_on(writeback.join());
    }

    #[test]
    fn test_operations_applied_in_queue_order() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        let writeback = start(&rt, &remote);

        writeback.enqueue(put("a", b"A")).unwrap();
        writeback
            .enqueue(PendingOp::Copy {
                source: "a".into(),
                destination: "b".into(),
            })
            .unwrap();
        writeback
            .enqueue(PendingOp::Move {
                source: "b".into(),
                destination: "c".into(),
            })
            .unwrap();
        writeback
            .enqueue(PendingOp::Delete { path: "a".into() })
            .unwrap();
        drain(&rt, &writeback);

        assert_eq!(
            remote.calls(),
            vec!["put:a", "copy:a->b", "copy:b->c", "delete:b", "delete:a"]
        );
        assert_eq!(remote.keys(), vec!["c"]);
        assert_eq!(remote.object("c").unwrap(), b"A");
        assert!(writeback.failures().is_empty());
    }

    #[test]
    fn test_close_drains_queue_then_rejects() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        let writeback = start(&rt, &remote);

        for i in 0..50 {
            writeback.enqueue(put(&format!("f{:02}", i), b"x")).unwrap();
        }
        drain(&rt, &writeback);

        assert_eq!(remote.keys().len(), 50);
        assert!(writeback.is_closed());
        assert!(writeback.pending().is_empty());
        assert!(matches!(
            writeback.enqueue(put("late", b"")),
            Err(PipelineError::Closed)
        ));
        assert!(matches!(
            rt.block_on(writeback.submit(put("late", b""))),
            Err(PipelineError::Closed)
        ));
        assert!(remote.object("late").is_none());
    }

    #[test]
    fn test_submit_from_async_context() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        let writeback = start(&rt, &remote);

        rt.block_on(async {
            writeback.submit(put("one", b"1")).await.unwrap();
            writeback.submit(put("two", b"2")).await.unwrap();
        });
        drain(&rt, &writeback);

        assert_eq!(remote.calls(), vec!["put:one", "put:two"]);
    }

    #[test]
    fn test_retryable_failure_is_retried() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next(
            "put",
            vec![
                RemoteError::Timeout,
                RemoteError::Server(503, "busy".into()),
            ],
        );
        let writeback = start(&rt, &remote);

        writeback.enqueue(put("a", b"data")).unwrap();
        drain(&rt, &writeback);

        assert_eq!(remote.object("a").unwrap(), b"data");
        assert_eq!(remote.calls(), vec!["put:a", "put:a", "put:a"]);
        assert!(writeback.failures().is_empty());
    }

    #[test]
    fn test_permanent_failure_recorded_and_queue_continues() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next("put", vec![RemoteError::Forbidden("a".into())]);
        let writeback = start(&rt, &remote);

        writeback.enqueue(put("a", b"1")).unwrap();
        writeback.enqueue(put("b", b"2")).unwrap();
        drain(&rt, &writeback);

        assert!(remote.object("a").is_none());
        assert_eq!(remote.object("b").unwrap(), b"2");

        let failures = writeback.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].operation, "put");
        assert_eq!(failures[0].path, "a");
        assert!(writeback.pending().is_empty());
    }

    #[test]
    fn test_failed_delete_does_not_repeat_copy() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        remote.insert("src", b"payload");
        remote.fail_next(
            "delete",
            (0..4)
                .map(|_| RemoteError::Server(500, "boom".into()))
                .collect(),
        );
        let writeback = start(&rt, &remote);

        writeback
            .enqueue(PendingOp::Move {
                source: "src".into(),
                destination: "dst".into(),
            })
            .unwrap();
        drain(&rt, &writeback);

        let calls = remote.calls();
        assert_eq!(calls.iter().filter(|c| *c == "copy:src->dst").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "delete:src").count(), 4);
        assert_eq!(remote.object("dst").unwrap(), b"payload");
        assert_eq!(writeback.failures().len(), 1);
    }

    #[test]
    fn test_move_of_missing_source_fails_without_delete() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        let writeback = start(&rt, &remote);

        writeback
            .enqueue(PendingOp::Move {
                source: "ghost".into(),
                destination: "x".into(),
            })
            .unwrap();
        drain(&rt, &writeback);

        assert_eq!(remote.calls(), vec!["copy:ghost->x"]);
        assert_eq!(writeback.failures()[0].operation, "move");
    }

    #[test]
    fn test_delete_of_missing_object_is_success() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next("delete", vec![RemoteError::NotFound("gone".into())]);
        let writeback = start(&rt, &remote);

        writeback
            .enqueue(PendingOp::Delete {
                path: "gone".into(),
            })
            .unwrap();
        drain(&rt, &writeback);

        assert!(writeback.failures().is_empty());
    }

    #[test]
    fn test_pending_marks_follow_queue() {
        let rt = runtime();
        let remote = Arc::new(MemoryRemote::new());
        remote.insert("old", b"1");
        let writeback = start(&rt, &remote);

        let op = PendingOp::Move {
            source: "old".into(),
            destination: "new".into(),
        };
        assert_eq!(
            op.touches(),
            vec![Touch::Removal("old".into()), Touch::Upload("new".into())]
        );
        writeback.enqueue(op).unwrap();
        drain(&rt, &writeback);

        assert!(!writeback.pending().has_removal("old"));
        assert!(!writeback.pending().has_upload("new"));
    }
}
