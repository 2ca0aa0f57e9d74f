//! Cluster Coordination
//!
//! Several worker processes share one logical cache. One process is the
//! coordinator and owns the real backend; every other process runs a
//! [`ClusterWorker`] that forwards each contract call over a channel.
//!
//! ```text
//!   worker A ──┐                       ┌──────────────────────┐
//!   worker B ──┼── unix socket / pipe ─▶│ coordinator          │
//!   worker C ──┘   (framed JSON + raw)  │ MembufBackend (pool) │
//!                                       └──────────────────────┘
//! ```
//!
//! The coordinator is chosen once, by whichever process binds the socket
//! first. Losing it is terminal for the workers: their calls fail with
//! `CoordinatorUnavailable` and no new coordinator is elected.

pub mod coordinator;
pub mod protocol;
pub mod worker;

use std::fmt;
#[cfg(unix)]
use std::io::ErrorKind;
#[cfg(unix)]
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use tokio_util::sync::CancellationToken;
#[cfg(unix)]
use tracing::{info, warn};

pub use worker::ClusterWorker;

use crate::cache::backend::CacheBackend;
use crate::error::Result;

/// Buffer size of in-process channels
const LOCAL_CHANNEL_BUFFER: usize = 256 * 1024;

/// Byte stream a worker channel runs over
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Coordinator-side end of one worker channel
pub struct WorkerHandle {
    label: String,
    io: Box<dyn ChannelIo>,
}

impl WorkerHandle {
    /// Wrap a connected stream
    pub fn new(label: impl Into<String>, io: impl ChannelIo) -> Self {
        Self {
            label: label.into(),
            io: Box::new(io),
        }
    }

    /// Label used in logs
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn into_io(self) -> Box<dyn ChannelIo> {
        self.io
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("label", &self.label)
            .finish()
    }
}

/// In-process channel: the handle for the coordinator and the raw worker end
pub fn channel_pair() -> (WorkerHandle, DuplexStream) {
    let (coordinator_end, worker_end) = tokio::io::duplex(LOCAL_CHANNEL_BUFFER);
    (WorkerHandle::new("local", coordinator_end), worker_end)
}

/// Attach an in-process worker to `backend`
pub fn local_pair(backend: &dyn CacheBackend) -> Result<ClusterWorker> {
    let (handle, worker_end) = channel_pair();
    backend.register_worker(handle)?;
    ClusterWorker::connect(worker_end)
}

/// Outcome of an election
#[cfg(unix)]
#[derive(Debug)]
pub enum Role {
    /// This process owns the cache and accepts workers on the listener
    Coordinator(UnixListener),
    /// Another process owns the cache
    Worker(UnixStream),
}

/// Elect a coordinator through a Unix socket path.
///
/// Binding wins. If the path is taken by a live coordinator this process
/// becomes a worker; a stale socket file left by a dead one is removed and
/// the bind is retried once.
#[cfg(unix)]
pub async fn elect(path: &Path) -> Result<Role> {
    match UnixListener::bind(path) {
        Ok(listener) => {
            info!(socket = %path.display(), "Elected cluster coordinator");
            return Ok(Role::Coordinator(listener));
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => {}
        Err(e) => return Err(e.into()),
    }

    match UnixStream::connect(path).await {
        Ok(stream) => {
            info!(socket = %path.display(), "Joined cluster as worker");
            Ok(Role::Worker(stream))
        }
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
            warn!(socket = %path.display(), "Removing stale coordinator socket");
            std::fs::remove_file(path)?;
            let listener = UnixListener::bind(path)?;
            info!(socket = %path.display(), "Elected cluster coordinator");
            Ok(Role::Coordinator(listener))
        }
        Err(e) => Err(e.into()),
    }
}

/// Register every connection on `listener` as a worker until cancelled
#[cfg(unix)]
pub async fn accept_workers(
    listener: &UnixListener,
    backend: &dyn CacheBackend,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut accepted = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            connection = listener.accept() => {
                let (stream, _) = connection?;
                accepted += 1;
                backend.register_worker(WorkerHandle::new(format!("unix-{}", accepted), stream))?;
            }
        }
    }
    info!(workers = accepted, "Stopped accepting workers");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
