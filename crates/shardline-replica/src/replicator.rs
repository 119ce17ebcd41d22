//! Replicator - Ships One Shard's Log to One Target
//!
//! Each replication target of a shard gets its own `Replicator`, reading
//! the shard's log through a dedicated [`FanOut`] cursor.
//!
//! ## Loops
//!
//! ```text
//!            ┌──────────────┐   send(batch)   ┌─────────────┐
//! FanOut ───▶│  send loop   │────────────────▶│             │
//! consume    └──────────────┘                 │   stream    │
//!                                             │   client    │
//!            ┌──────────────┐   recv()        │             │
//! FanOut ◀───│  recv loop   │◀────────────────│             │
//! ack/reset  └──────┬───────┘                 └─────────────┘
//!                   │ error
//!                   ▼
//!              reconnect (fixed backoff), rewind to ack
//! ```
//!
//! - **send loop**: consumes up to `batch_size` records and sends them
//!   without waiting for confirmation. While no client is connected it
//!   consumes nothing.
//! - **recv loop**: applies `Ack` and `Reset` responses. On a stream error
//!   it drops the client and reconnects, rewinding the cursor to the last
//!   ack so nothing unconfirmed is lost.
//!
//! Both loops run under a supervisor that restarts them after a panic.
//!
//! ## Delivery
//!
//! At-least-once. The cursor's consume position is never persisted; after
//! a restart or reconnect everything from the last ack is sent again and
//! the receiver drops duplicates.

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use shardline_storage::{FanOut, SEQ_NONE};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ReplicationConfig;
use crate::transport::{
    ReplicaBatch, ReplicaEntry, ReplicaResponse, ReplicaStream, ReplicaTarget, StreamFactory,
};

/// Snapshot of one target's progress, for monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaState {
    pub target: String,
    pub database: String,
    pub shard: u32,
    pub head_seq: i64,
    pub consume_seq: i64,
    pub ack_seq: i64,
    pub pending: i64,
    pub connected: bool,
}

/// A supervised loop: the supervisor task plus the loop it is running
struct Supervised {
    supervisor: JoinHandle<()>,
    current: Arc<SyncMutex<Option<AbortHandle>>>,
}

pub struct Replicator {
    target: ReplicaTarget,
    fan_out: Arc<FanOut>,
    factory: Arc<dyn StreamFactory>,
    client: RwLock<Option<Arc<dyn ReplicaStream>>>,
    connected: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    batch_size: usize,
    idle_interval: Duration,
    reconnect_backoff: Duration,
    loops: SyncMutex<Vec<Supervised>>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("target", &self.target)
            .field("fan_out", &self.fan_out)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Replicator {
    pub fn new(
        target: ReplicaTarget,
        fan_out: Arc<FanOut>,
        factory: Arc<dyn StreamFactory>,
        config: &ReplicationConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            fan_out,
            factory,
            client: RwLock::new(None),
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel,
            batch_size: config.batch_size,
            idle_interval: config.idle_interval(),
            reconnect_backoff: config.reconnect_backoff(),
            loops: SyncMutex::new(Vec::new()),
        }
    }

    pub fn target(&self) -> &ReplicaTarget {
        &self.target
    }

    pub fn fan_out(&self) -> &Arc<FanOut> {
        &self.fan_out
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Spawn the send and receive loops
    pub fn start(self: &Arc<Self>) {
        info!(
            replica = %self.target,
            consume_seq = self.fan_out.consume_seq(),
            ack_seq = self.fan_out.ack_seq(),
            "Starting replicator"
        );

        let mut loops = self.loops.lock();
        loops.push(self.supervise("send", |r| r.send_loop()));
        loops.push(self.supervise("recv", |r| r.recv_loop()));
    }

    /// Ask both loops to exit.
    ///
    /// Sleeps and reconnect attempts end immediately; a receive call that is
    /// already waiting on the stream is left to finish on its own.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        info!(replica = %self.target, "Stopping replicator");
    }

    /// Stop and wait up to `timeout` for the loops to exit, aborting any
    /// that are still blocked afterwards.
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop();
        let loops: Vec<Supervised> = self.loops.lock().drain(..).collect();

        for Supervised {
            mut supervisor,
            current,
        } in loops
        {
            if tokio::time::timeout(timeout, &mut supervisor).await.is_err() {
                debug!(replica = %self.target, "Aborting blocked replicator loop");
                if let Some(handle) = current.lock().take() {
                    handle.abort();
                }
                supervisor.abort();
            }
        }

        *self.client.write().await = None;
        self.connected.store(false, Ordering::Release);
    }

    pub fn state(&self) -> ReplicaState {
        let fan_out = self.fan_out.state();
        ReplicaState {
            target: self.target.endpoint.clone(),
            database: self.target.database.clone(),
            shard: self.target.shard,
            head_seq: fan_out.head_seq,
            consume_seq: fan_out.consume_seq,
            ack_seq: fan_out.ack_seq,
            pending: fan_out.head_seq - fan_out.ack_seq,
            connected: self.is_connected(),
        }
    }

    /// Run `body` in its own task and start it again if it panics
    fn supervise<F, Fut>(self: &Arc<Self>, name: &'static str, body: F) -> Supervised
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let replicator = Arc::clone(self);
        let current = Arc::new(SyncMutex::new(None));
        let slot = Arc::clone(&current);

        let supervisor = tokio::spawn(async move {
            loop {
                let task = tokio::spawn(body(Arc::clone(&replicator)));
                *slot.lock() = Some(task.abort_handle());

                match task.await {
                    Ok(()) => break,
                    Err(e) if e.is_panic() => {
                        error!(
                            replica = %replicator.target,
                            loop_name = name,
                            "Replicator loop panicked, restarting"
                        );
                        if replicator.is_stopped() {
                            break;
                        }
                        replicator.pause(replicator.reconnect_backoff).await;
                    }
                    Err(_) => break,
                }
            }
            trace!(replica = %replicator.target, loop_name = name, "Replicator loop exited");
        });

        Supervised {
            supervisor,
            current,
        }
    }

    /// Sleep unless stopped first
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn current_client(&self) -> Option<Arc<dyn ReplicaStream>> {
        self.client.read().await.clone()
    }

    async fn send_loop(self: Arc<Self>) {
        while !self.is_stopped() {
            let Some(client) = self.current_client().await else {
                self.pause(self.idle_interval).await;
                continue;
            };

            let Some(batch) = self.next_batch() else {
                self.pause(self.idle_interval).await;
                continue;
            };

            let (first, last) = (batch.first_seq(), batch.last_seq());
            match client.send(batch).await {
                Ok(()) => trace!(replica = %self.target, ?first, ?last, "Sent batch"),
                Err(e) => {
                    // The recv loop sees the broken stream and reconnects.
                    warn!(replica = %self.target, ?first, error = %e, "Failed to send batch");
                    self.pause(self.idle_interval).await;
                }
            }
        }
    }

    /// Consume up to `batch_size` records from the cursor
    fn next_batch(&self) -> Option<ReplicaBatch> {
        let mut entries = Vec::with_capacity(self.batch_size);
        while entries.len() < self.batch_size {
            let seq = self.fan_out.consume();
            if seq == SEQ_NONE {
                break;
            }
            match self.fan_out.get(seq) {
                Ok(payload) => entries.push(ReplicaEntry { seq, payload }),
                Err(e) => {
                    // The receiver reports the hole and asks for a reset.
                    warn!(replica = %self.target, seq, error = %e, "Failed to read log record");
                    break;
                }
            }
        }

        if entries.is_empty() {
            return None;
        }
        Some(ReplicaBatch {
            entries,
            tail_seq: self.fan_out.tail_seq(),
        })
    }

    async fn recv_loop(self: Arc<Self>) {
        while !self.is_stopped() {
            let client = match self.current_client().await {
                Some(client) => client,
                None => {
                    if !self.reconnect().await {
                        break;
                    }
                    continue;
                }
            };

            match client.recv().await {
                Ok(ReplicaResponse::Ack(seq)) => {
                    self.fan_out.ack(seq);
                    trace!(replica = %self.target, seq, "Received ack");
                }
                Ok(ReplicaResponse::Reset(seq)) => self.apply_reset(seq),
                Err(e) => {
                    if self.is_stopped() {
                        break;
                    }
                    warn!(replica = %self.target, error = %e, "Replication stream failed");
                    self.connected.store(false, Ordering::Release);
                    *self.client.write().await = None;
                }
            }
        }
    }

    /// Open a new stream, retrying every `reconnect_backoff` until it
    /// succeeds or the replicator stops. Returns `false` when stopped.
    async fn reconnect(&self) -> bool {
        let mut attempt: u64 = 0;
        while !self.is_stopped() {
            attempt += 1;
            match self.factory.connect(&self.target).await {
                Ok(client) => {
                    // Rewind before the send loop can see the new client
                    let resume = self.fan_out.ack_seq();
                    self.rewind(resume);

                    *self.client.write().await = Some(client);
                    self.connected.store(true, Ordering::Release);
                    info!(
                        replica = %self.target,
                        attempt,
                        resume_seq = self.fan_out.consume_seq(),
                        "Replication stream connected"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        replica = %self.target,
                        attempt,
                        error = %e,
                        "Failed to connect replication stream"
                    );
                    self.pause(self.reconnect_backoff).await;
                }
            }
        }
        false
    }

    fn apply_reset(&self, seq: i64) {
        info!(
            replica = %self.target,
            seq,
            consume_seq = self.fan_out.consume_seq(),
            "Received reset"
        );
        self.rewind(seq);
    }

    /// Move the cursor back to `seq`, or to the oldest retained record if
    /// `seq` has already been reclaimed.
    fn rewind(&self, seq: i64) {
        match self.fan_out.set_head_seq(seq) {
            Ok(()) => {}
            Err(shardline_storage::Error::BelowRetention { floor, .. }) => {
                warn!(
                    replica = %self.target,
                    seq,
                    floor,
                    "Requested records were reclaimed, resuming from oldest retained"
                );
                if let Err(e) = self.fan_out.set_head_seq(floor) {
                    error!(replica = %self.target, floor, error = %e, "Failed to rewind to floor");
                }
            }
            Err(e) => {
                warn!(replica = %self.target, seq, error = %e, "Ignoring invalid reset");
            }
        }
    }
}
