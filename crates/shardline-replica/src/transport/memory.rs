//! In-process transport.
//!
//! Connects replicators to receivers through tokio channels. Used by tests
//! and by single-process deployments; `set_available(false)` and
//! `disconnect_all()` simulate an unreachable or failing peer.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ReplicaBatch, ReplicaConnection, ReplicaResponse, ReplicaStream, ReplicaTarget, StreamFactory,
};
use crate::error::{Error, Result};

struct Inner {
    available: AtomicBool,
    connects: AtomicUsize,
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    live: SyncMutex<Vec<CancellationToken>>,
}

/// Stream factory whose peers live in the same process
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                available: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
                live: SyncMutex::new(Vec::new()),
            }),
        }
    }

    /// Refuse new connections while `false`
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::Acquire)
    }

    /// Wait for the next inbound stream
    pub async fn accept(&self) -> Option<MemoryConnection> {
        self.inner.accept_rx.lock().await.recv().await
    }

    /// Break every open stream from both ends
    pub fn disconnect_all(&self) {
        let live: Vec<_> = self.inner.live.lock().drain(..).collect();
        for token in &live {
            token.cancel();
        }
        debug!(streams = live.len(), "Disconnected in-memory streams");
    }
}

#[async_trait]
impl StreamFactory for MemoryTransport {
    async fn connect(&self, target: &ReplicaTarget) -> Result<Arc<dyn ReplicaStream>> {
        if !self.inner.available.load(Ordering::Acquire) {
            return Err(Error::Transport(format!("{} is unreachable", target.endpoint)));
        }

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let connection = MemoryConnection {
            target: target.clone(),
            batches: Mutex::new(batch_rx),
            responses: response_tx,
            closed: closed.clone(),
        };
        self.inner
            .accept_tx
            .send(connection)
            .map_err(|_| Error::Transport("transport is shut down".to_string()))?;

        self.inner.live.lock().push(closed.clone());
        self.inner.connects.fetch_add(1, Ordering::AcqRel);

        Ok(Arc::new(MemoryStream {
            batches: batch_tx,
            responses: Mutex::new(response_rx),
            closed,
        }))
    }
}

/// Sender end handed to a replicator
struct MemoryStream {
    batches: mpsc::UnboundedSender<ReplicaBatch>,
    responses: Mutex<mpsc::UnboundedReceiver<ReplicaResponse>>,
    closed: CancellationToken,
}

#[async_trait]
impl ReplicaStream for MemoryStream {
    async fn send(&self, batch: ReplicaBatch) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Transport("stream closed".to_string()));
        }
        self.batches
            .send(batch)
            .map_err(|_| Error::Transport("receiver hung up".to_string()))
    }

    async fn recv(&self) -> Result<ReplicaResponse> {
        let mut responses = self.responses.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Transport("stream closed".to_string())),
            response = responses.recv() => {
                response.ok_or_else(|| Error::Transport("receiver hung up".to_string()))
            }
        }
    }
}

/// Receiver end of an in-memory stream
pub struct MemoryConnection {
    target: ReplicaTarget,
    batches: Mutex<mpsc::UnboundedReceiver<ReplicaBatch>>,
    responses: mpsc::UnboundedSender<ReplicaResponse>,
    closed: CancellationToken,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("target", &self.target)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl MemoryConnection {
    /// Break this stream from the receiving side
    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl ReplicaConnection for MemoryConnection {
    fn target(&self) -> &ReplicaTarget {
        &self.target
    }

    async fn recv(&self) -> Result<Option<ReplicaBatch>> {
        let mut batches = self.batches.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            batch = batches.recv() => Ok(batch),
        }
    }

    async fn send(&self, response: ReplicaResponse) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Transport("stream closed".to_string()));
        }
        self.responses
            .send(response)
            .map_err(|_| Error::Transport("sender hung up".to_string()))
    }
}
