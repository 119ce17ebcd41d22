//! Channel - One Shard's Write Path
//!
//! A `Channel` owns one shard of a database: the chunk producers fill, the
//! shard's [`FanOutQueue`], and one [`Replicator`] per target.
//!
//! ## Write Path
//!
//! ```text
//! write(record)
//!     │
//!     ▼
//! ┌─────────┐  full or stale   ┌──────────────────┐   ┌──────────────┐
//! │  Chunk  │─────────────────▶│ bounded handoff  │──▶│ writer task  │──▶ FanOutQueue::append
//! └─────────┘  marshal (LZ4)   │ (buffer_size)    │   └──────────────┘
//!      ▲                       └──────────────────┘
//!      │ flush timer: every flush_check_interval, flush if older
//!      │ than flush_interval
//! ```
//!
//! Producers block once `buffer_size` chunks are waiting for the writer.
//! Cancelling the channel's token wakes blocked producers with
//! [`Error::Cancelled`]; the chunk they were holding is kept and written
//! out by [`Channel::close`].
//!
//! A chunk is also cut early when the next record could push its
//! marshalled size past the log's data page size, and a record too large
//! for any chunk is rejected before it is buffered. If an append fails, the
//! writer keeps that chunk and every later one, in order, and retries them
//! on the next handoff and again on close.
//!
//! ## Targets
//!
//! The configured targets are authoritative: on open, cursors left behind
//! by targets that are no longer configured are deleted so they stop
//! pinning old segments.
//!
//! ## Shutdown
//!
//! `close` stops the replicators, drains every chunk into the log, stops
//! the background tasks and finally closes the log. Every step runs even
//! if an earlier one failed; the first failure is returned.

use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use shardline_core::Record;
use shardline_storage::{path_component, FanOutQueue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::chunk::Chunk;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::replicator::{ReplicaState, Replicator};
use crate::transport::{ReplicaTarget, StreamFactory};

struct ChunkState {
    chunk: Chunk,
    last_flush: Instant,
    /// Marshalled chunks that could not be handed off, in write order
    stranded: Vec<Bytes>,
}

/// Handed-off chunks the writer could not append yet, oldest first
type Backlog = Arc<SyncMutex<VecDeque<Bytes>>>;

pub struct Channel {
    database: String,
    shard: u32,
    dir: PathBuf,
    queue: Arc<FanOutQueue>,
    factory: Arc<dyn StreamFactory>,
    config: ReplicationConfig,
    cancel: CancellationToken,
    state: Mutex<ChunkState>,
    sender: RwLock<Option<mpsc::Sender<Bytes>>>,
    writer: SyncMutex<Option<JoinHandle<()>>>,
    backlog: Backlog,
    background: SyncMutex<Vec<JoinHandle<()>>>,
    replicators: RwLock<HashMap<String, Arc<Replicator>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("database", &self.database)
            .field("shard", &self.shard)
            .field("dir", &self.dir)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    /// Open the shard's log under `<directory>/<database>/<shard>`, start
    /// the writer, flush timer and reclamation tasks, and one replicator per
    /// configured target.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        database: &str,
        shard: u32,
        config: &ReplicationConfig,
        factory: Arc<dyn StreamFactory>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let dir = config
            .directory
            .join(path_component(database))
            .join(shard.to_string());
        let queue = Arc::new(FanOutQueue::open(&dir, config.queue.clone())?);
        prune_fan_outs(&queue, &config.targets, database, shard)?;
        let (tx, rx) = mpsc::channel(config.buffer_size);
        let backlog = Backlog::default();

        let channel = Arc::new(Self {
            database: database.to_string(),
            shard,
            dir,
            queue: Arc::clone(&queue),
            factory,
            config: config.clone(),
            cancel,
            state: Mutex::new(ChunkState {
                chunk: Chunk::with_max_bytes(
                    config.chunk_capacity,
                    config.queue.data_page_size,
                ),
                last_flush: Instant::now(),
                stranded: Vec::new(),
            }),
            sender: RwLock::new(Some(tx)),
            writer: SyncMutex::new(None),
            backlog: Arc::clone(&backlog),
            background: SyncMutex::new(Vec::new()),
            replicators: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        *channel.writer.lock() = Some(tokio::spawn(run_writer(
            Arc::clone(&queue),
            rx,
            backlog,
            database.to_string(),
            shard,
        )));
        {
            let mut background = channel.background.lock();
            background.push(tokio::spawn(run_flush_timer(
                Arc::downgrade(&channel),
                config.flush_check_interval(),
                channel.cancel.clone(),
            )));
            background.push(queue.start_gc(channel.cancel.child_token()));
        }

        for endpoint in &config.targets {
            channel.add_replica(endpoint)?;
        }

        info!(
            database = %channel.database,
            shard,
            dir = %channel.dir.display(),
            head_seq = queue.head_seq(),
            tail_seq = queue.tail_seq(),
            replicas = config.targets.len(),
            "Opened channel"
        );
        Ok(channel)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn queue(&self) -> &Arc<FanOutQueue> {
        &self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffer one record, handing the chunk to the writer once it is full.
    ///
    /// Blocks while the handoff buffer is full. Fails with
    /// [`Error::RecordTooLarge`] if the record cannot fit in one log entry.
    pub async fn write(&self, record: Record) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut state = self.state.lock().await;
        // Checked under the lock so close never misses a buffered record
        if self.is_closed() {
            return Err(Error::ChannelClosed(self.shard));
        }

        if !state.chunk.fits(&record) && state.chunk.fits_empty(&record) {
            // Byte limit reached before the record count
            self.flush_locked(&mut state).await?;
        }
        // Rejects a record that fits in no chunk before anything is buffered
        state.chunk.push(record)?;
        if state.chunk.is_full() {
            self.flush_locked(&mut state).await?;
        }
        Ok(())
    }

    /// Hand the current partial chunk to the writer
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_if_stale(&self, max_age: Duration) {
        let mut state = self.state.lock().await;
        if state.chunk.is_empty() || state.last_flush.elapsed() < max_age {
            return;
        }
        trace!(
            database = %self.database,
            shard = self.shard,
            records = state.chunk.size(),
            "Flushing stale chunk"
        );
        if let Err(e) = self.flush_locked(&mut state).await {
            warn!(
                database = %self.database,
                shard = self.shard,
                error = %e,
                "Timed chunk flush failed"
            );
        }
    }

    async fn flush_locked(&self, state: &mut ChunkState) -> Result<()> {
        if state.chunk.is_empty() {
            return Ok(());
        }

        let records = state.chunk.size();
        let data = state.chunk.marshal();
        state.chunk.reset();
        state.last_flush = Instant::now();

        let sender = self.sender.read().clone();
        let Some(sender) = sender else {
            state.stranded.push(data);
            return Err(Error::ChannelClosed(self.shard));
        };

        tokio::select! {
            biased;
            permit = sender.reserve() => match permit {
                Ok(permit) => {
                    trace!(
                        database = %self.database,
                        shard = self.shard,
                        records,
                        bytes = data.len(),
                        "Handed chunk to writer"
                    );
                    permit.send(data);
                    Ok(())
                }
                Err(_) => {
                    state.stranded.push(data);
                    Err(Error::ChannelClosed(self.shard))
                }
            },
            _ = self.cancel.cancelled() => {
                state.stranded.push(data);
                Err(Error::Cancelled)
            }
        }
    }

    /// Start replicating this shard to `endpoint`. Returns the running
    /// replicator if one already exists.
    pub fn add_replica(&self, endpoint: &str) -> Result<Arc<Replicator>> {
        {
            let replicators = self.replicators.read();
            if let Some(replicator) = replicators.get(endpoint) {
                return Ok(Arc::clone(replicator));
            }
        }

        let mut replicators = self.replicators.write();

        // Double-check in case another caller added it while we waited
        if let Some(replicator) = replicators.get(endpoint) {
            return Ok(Arc::clone(replicator));
        }
        if self.is_closed() {
            return Err(Error::ChannelClosed(self.shard));
        }

        let fan_out = self.queue.get_or_create_fan_out(&path_component(endpoint))?;
        let target = ReplicaTarget {
            endpoint: endpoint.to_string(),
            database: self.database.clone(),
            shard: self.shard,
            source: self.config.node_id.clone(),
        };
        let replicator = Arc::new(Replicator::new(
            target,
            fan_out,
            Arc::clone(&self.factory),
            &self.config,
            self.cancel.child_token(),
        ));
        replicator.start();

        replicators.insert(endpoint.to_string(), Arc::clone(&replicator));
        Ok(replicator)
    }

    pub fn replicator(&self, endpoint: &str) -> Option<Arc<Replicator>> {
        self.replicators.read().get(endpoint).cloned()
    }

    /// Progress of every replicator, ordered by endpoint
    pub fn replica_states(&self) -> Vec<ReplicaState> {
        let mut states: Vec<_> = self
            .replicators
            .read()
            .values()
            .map(|r| r.state())
            .collect();
        states.sort_by(|a, b| a.target.cmp(&b.target));
        states
    }

    /// Stop replicating, write every buffered record to the log and close
    /// it. Idempotent.
    ///
    /// Chunks that still cannot be appended stay in memory and the first
    /// failure is returned; the log and background tasks are shut down
    /// regardless.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(database = %self.database, shard = self.shard, "Closing channel");
        let mut first_error: Option<Error> = None;

        let replicators: Vec<_> = self.replicators.write().drain().map(|(_, r)| r).collect();
        for replicator in &replicators {
            replicator.shutdown(self.config.shutdown_timeout()).await;
        }

        let stranded = {
            let mut state = self.state.lock().await;
            if !state.chunk.is_empty() {
                let data = state.chunk.marshal();
                state.chunk.reset();
                state.stranded.push(data);
            }
            std::mem::take(&mut state.stranded)
        };

        // Dropping the last sender lets the writer drain and exit
        self.sender.write().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!(database = %self.database, shard = self.shard, error = %e, "Writer task failed");
            }
        }

        // Handed-off chunks were queued first; stranded ones come after them
        {
            let mut backlog = self.backlog.lock();
            if !stranded.is_empty() {
                debug!(
                    database = %self.database,
                    shard = self.shard,
                    chunks = stranded.len(),
                    "Writing stranded chunks"
                );
            }
            backlog.extend(stranded);
            if let Err(e) = append_backlog(&self.queue, &mut backlog) {
                error!(
                    database = %self.database,
                    shard = self.shard,
                    chunks = backlog.len(),
                    error = %e,
                    "Failed to write buffered chunks on close"
                );
                first_error.get_or_insert(e.into());
            }
        }

        self.cancel.cancel();
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                error!(database = %self.database, shard = self.shard, error = %e, "Background task failed");
            }
        }

        if let Err(e) = self.queue.close() {
            first_error.get_or_insert(e.into());
        }
        info!(
            database = %self.database,
            shard = self.shard,
            head_seq = self.queue.head_seq(),
            "Closed channel"
        );
        first_error.map_or(Ok(()), Err)
    }
}

/// Delete cursors of targets that are no longer configured
fn prune_fan_outs(
    queue: &FanOutQueue,
    targets: &[String],
    database: &str,
    shard: u32,
) -> Result<()> {
    let configured: HashSet<String> = targets.iter().map(|t| path_component(t)).collect();
    for name in queue.fan_out_names() {
        if !configured.contains(&name) {
            queue.remove_fan_out(&name)?;
            info!(database, shard, fan_out = %name, "Removed cursor of unconfigured target");
        }
    }
    Ok(())
}

/// Append queued chunks oldest first, stopping at the first failure
fn append_backlog(
    queue: &FanOutQueue,
    backlog: &mut VecDeque<Bytes>,
) -> shardline_storage::Result<()> {
    while let Some(data) = backlog.front() {
        let seq = queue.append(data)?;
        trace!(seq, bytes = data.len(), "Appended chunk");
        backlog.pop_front();
    }
    Ok(())
}

/// Append handed-off chunks until every sender is gone
async fn run_writer(
    queue: Arc<FanOutQueue>,
    mut rx: mpsc::Receiver<Bytes>,
    backlog: Backlog,
    database: String,
    shard: u32,
) {
    while let Some(data) = rx.recv().await {
        let mut pending = backlog.lock();
        pending.push_back(data);
        if let Err(e) = append_backlog(&queue, &mut pending) {
            error!(
                database = %database,
                shard,
                chunks = pending.len(),
                error = %e,
                "Failed to append chunk, keeping it for retry"
            );
        }
    }
    trace!(database = %database, shard, "Chunk writer exited");
}

async fn run_flush_timer(channel: Weak<Channel>, check: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(check);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(channel) = channel.upgrade() else {
            break;
        };
        channel.flush_if_stale(channel.config.flush_interval()).await;
    }
}
