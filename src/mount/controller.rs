//! Daemon lifecycle
//!
//! Drives the daemon from configuration to a served mount and back down:
//! `Created -> Configured -> CacheReady -> StoreOpen -> Mounted -> Serving ->
//! ShuttingDown -> Stopped`. Any failure before the mount is terminal and
//! goes straight to `Stopped`.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use super::transport::{FuseTransport, Unmount};
use crate::cache::FileCache;
use crate::config::{Config, ConfigOptions};
use crate::fs::BucketFs;
use crate::meta::MetaStore;
use crate::remote::{RemoteStore, S3Remote};
use crate::session::{init_root, Session};
use crate::writeback::WriteBack;

/// How long to wait for the session loop after unmounting
const SERVE_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Configured,
    CacheReady,
    StoreOpen,
    Mounted,
    Serving,
    ShuttingDown,
    Stopped,
}

impl State {
    fn can_advance_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Created, Configured)
                | (Configured, CacheReady)
                | (CacheReady, StoreOpen)
                | (StoreOpen, Mounted)
                | (Mounted, Serving)
                | (Mounted | Serving, ShuttingDown)
                | (ShuttingDown, Stopped)
                | (Created | Configured | CacheReady | StoreOpen, Stopped)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Illegal lifecycle transition from {from} to {to}")]
    IllegalTransition { from: State, to: State },
}

/// State machine guarding the order of startup and shutdown steps
#[derive(Debug)]
pub struct Lifecycle {
    state: State,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: State::Created,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Move to `next`, rejecting transitions out of order
    pub fn advance(&mut self, next: State) -> Result<(), LifecycleError> {
        if !self.state.can_advance_to(next) {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        info!(from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything opened before the mount
struct Prepared {
    config: Config,
    store: MetaStore,
    cache: FileCache,
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Outcome of the task running the session loop
type ServeResult = Result<io::Result<()>, JoinError>;

/// Unmount and wait for the session loop to end. `finished` carries the
/// loop's result when it already ended on its own; the unmount is issued
/// either way so the kernel mount does not outlive the daemon.
async fn stop_serving<U: Unmount>(
    unmounter: &mut U,
    mountpoint: &Path,
    finished: Option<ServeResult>,
    serve_task: JoinHandle<io::Result<()>>,
) -> Option<ServeResult> {
    if let Err(e) = unmounter.unmount() {
        // The kernel may already have dropped the mount
        warn!(mountpoint = %mountpoint.display(), error = %e, "Unmount failed (possibly ok)");
    }

    if finished.is_some() {
        return finished;
    }
    match tokio::time::timeout(SERVE_EXIT_TIMEOUT, serve_task).await {
        Ok(result) => Some(result),
        Err(_) => {
            warn!(
                timeout_secs = SERVE_EXIT_TIMEOUT.as_secs(),
                "FUSE session did not stop in time"
            );
            None
        }
    }
}

/// Runs one mount from configuration to shutdown
pub struct Controller {
    lifecycle: Lifecycle,
}

impl Controller {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Start the daemon and serve until a shutdown signal or the end of the
    /// FUSE session.
    pub async fn run(&mut self, options: ConfigOptions) -> Result<()> {
        let prepared = match self.prepare(options) {
            Ok(prepared) => prepared,
            Err(e) => return self.abort(e),
        };

        let runtime = Handle::current();
        let (session, transport) = match self.mount(prepared, &runtime) {
            Ok(mounted) => mounted,
            Err(e) => return self.abort(e),
        };

        self.serve(session, transport, &runtime).await
    }

    /// Terminal failure before the mount
    fn abort(&mut self, err: anyhow::Error) -> Result<()> {
        error!(state = %self.lifecycle.state(), error = %err, "Startup failed");
        self.lifecycle.advance(State::Stopped)?;
        Err(err)
    }

    fn prepare(&mut self, options: ConfigOptions) -> Result<Prepared> {
        let config = options.build().context("Invalid configuration")?;
        info!(
            endpoint = %config.endpoint(),
            bucket = %config.bucket,
            base_path = %config.base_path,
            mountpoint = %config.mountpoint.display(),
            "Configuration loaded"
        );
        self.lifecycle.advance(State::Configured)?;

        let cache = FileCache::with_config(config.cache_dir.clone(), config.quota)?;
        self.lifecycle.advance(State::CacheReady)?;

        let store = MetaStore::open(config.store_path()).context("Failed to open metadata store")?;
        let root = init_root(&store, &config).context("Failed to initialize root record")?;
        info!(ino = root.ino, path = %store.path().display(), "Metadata store ready");
        self.lifecycle.advance(State::StoreOpen)?;

        Ok(Prepared {
            config,
            store,
            cache,
        })
    }

    fn mount(
        &mut self,
        prepared: Prepared,
        runtime: &Handle,
    ) -> Result<(Arc<Session>, FuseTransport)> {
        let Prepared {
            config,
            store,
            cache,
        } = prepared;

        // The filesystem object is bound at mount time, so everything it
        // needs is built here
        let remote: Arc<dyn RemoteStore> = Arc::new(S3Remote::new(&config));
        let writeback = WriteBack::start(
            Arc::clone(&remote),
            config.queue_capacity,
            config.retry,
            runtime,
        );
        let session = Arc::new(Session::new(
            config,
            store,
            remote,
            writeback,
            cache,
            runtime.clone(),
        ));

        let transport = FuseTransport::mount(BucketFs::new(Arc::clone(&session)), session.config())
            .with_context(|| {
                format!(
                    "Failed to mount at {}",
                    session.config().mountpoint.display()
                )
            })?;
        self.lifecycle.advance(State::Mounted)?;

        Ok((session, transport))
    }

    async fn serve(
        &mut self,
        session: Arc<Session>,
        transport: FuseTransport,
        runtime: &Handle,
    ) -> Result<()> {
        let mountpoint = transport.mountpoint().to_path_buf();
        let monitor = session.spawn_monitor();
        let (mut unmounter, mut serve_task) = transport.serve(runtime);
        self.lifecycle.advance(State::Serving)?;

        let finished = tokio::select! {
            _ = shutdown_signal() => None,
            result = &mut serve_task => Some(result),
        };
        self.lifecycle.advance(State::ShuttingDown)?;

        let served = stop_serving(&mut unmounter, &mountpoint, finished, serve_task).await;

        session.writeback().close();
        session.writeback().join().await;
        let failures = session.writeback().failures();
        if !failures.is_empty() {
            warn!(count = failures.len(), "Some changes could not be written back");
        }

        monitor.abort();
        // Wait for the aborted task so it releases its session reference
        let _ = monitor.await;

        match Arc::try_unwrap(session) {
            Ok(session) => session.into_store().close(),
            Err(_) => warn!("Session still referenced, metadata store left to close on exit"),
        }
        self.lifecycle.advance(State::Stopped)?;
        info!("Shutdown complete");

        match served {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(e))) => Err(e).context("FUSE session failed"),
            Some(Err(e)) => Err(e).context("FUSE session task panicked"),
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}
