//! Shardline Replication Layer
//!
//! Takes producer writes, buffers them per shard, stores them in the
//! shard's durable log and ships the log to every replication target.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │  Producers  │
//! └──────┬──────┘
//!        │ write(database, record)
//!        ▼
//! ┌─────────────────┐
//! │ ChannelManager  │  SipHash(key) % shards
//! │ DatabaseChannel │
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │ Channel         │  Chunk (LZ4 + CRC32) → bounded handoff → writer task
//! └────────┬────────┘
//!          │ append
//!          ▼
//! ┌─────────────────┐
//! │ FanOutQueue     │  one FanOut cursor per target
//! └────────┬────────┘
//!          │ consume / ack / reset
//!          ▼
//! ┌─────────────────┐   ReplicaBatch    ┌─────────────────┐
//! │ Replicator      │──────────────────▶│ ReplicaReceiver │──▶ ReplicaSink
//! │ send + recv     │◀──────────────────│ Sequence        │
//! └─────────────────┘   Ack / Reset     └─────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### Channel / Chunk
//! Amortizes log appends: records collect in a chunk that is compressed
//! and appended as one log entry once full or older than the flush
//! interval.
//!
//! ### Replicator
//! One per (shard, target). Sends batches without waiting for the remote
//! and applies acks and resets as they arrive; reconnects with a fixed
//! backoff and resumes from the last ack.
//!
//! ### ReplicaReceiver
//! The remote end. Applies records in sequence order, persists how far it
//! got in a [`Sequence`](shardline_storage::Sequence), and asks for a
//! resend when it sees a gap.
//!
//! ### Transport
//! [`ReplicaStream`], [`StreamFactory`] and [`ReplicaConnection`] abstract
//! the network; [`MemoryTransport`] connects both ends inside one process.
//!
//! ## Usage Example
//!
//! ```ignore
//! use shardline_replica::{ChannelManager, ReplicationConfig, MemoryTransport};
//! use shardline_core::Record;
//!
//! let config = ReplicationConfig {
//!     directory: "/var/lib/shardline".into(),
//!     targets: vec!["10.0.0.2:7400".to_string()],
//!     ..Default::default()
//! };
//! let manager = ChannelManager::new(config, Arc::new(MemoryTransport::new()))?;
//!
//! manager.write("metrics", Record::new(key, payload)).await?;
//! manager.close().await?;
//! ```

pub mod channel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod manager;
pub mod receiver;
pub mod replicator;
pub mod transport;

pub use channel::Channel;
pub use chunk::{decode_chunk, marshalled_bound, Chunk, MAX_CHUNK_BYTES};
pub use config::ReplicationConfig;
pub use error::{Error, Result};
pub use manager::{shard_for_key, ChannelManager, DatabaseChannel};
pub use receiver::{ReplicaReceiver, ReplicaSink};
pub use replicator::{ReplicaState, Replicator};
pub use transport::{
    MemoryConnection, MemoryTransport, ReplicaBatch, ReplicaConnection, ReplicaEntry,
    ReplicaResponse, ReplicaStream, ReplicaTarget, StreamFactory,
};
