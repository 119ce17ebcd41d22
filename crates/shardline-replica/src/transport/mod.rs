//! Replication Transport
//!
//! The replicator only needs a bidirectional, ordered message stream to
//! each target. These traits describe that stream from both ends so the
//! network layer can be swapped without touching replication logic.
//!
//! ## Protocol
//!
//! ```text
//! sender (Replicator)                      receiver (ReplicaReceiver)
//!        │  ReplicaBatch { entries, tail_seq }  │
//!        │─────────────────────────────────────▶│
//!        │                                      │ apply + sync Sequence
//!        │  ReplicaResponse::Ack(next)          │
//!        │◀─────────────────────────────────────│
//!        │  ReplicaResponse::Reset(next)        │ gap detected
//!        │◀─────────────────────────────────────│
//! ```
//!
//! Every position in the protocol is the next sequence the receiver needs:
//! `Ack(20)` means everything below 20 is durable, `Reset(12)` asks the
//! sender to resend from 12.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

pub use memory::{MemoryConnection, MemoryTransport};

/// Where one shard's log is replicated to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaTarget {
    /// Address of the receiving node
    pub endpoint: String,
    pub database: String,
    pub shard: u32,
    /// Identity of the sending node, used by the receiver to key its state
    pub source: String,
}

impl fmt::Display for ReplicaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -> {}", self.database, self.shard, self.endpoint)
    }
}

/// One log record on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEntry {
    pub seq: i64,
    pub payload: Bytes,
}

/// Ordered run of log records plus the sender's retention floor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaBatch {
    pub entries: Vec<ReplicaEntry>,
    /// Oldest sequence the sender can still replay
    pub tail_seq: i64,
}

impl ReplicaBatch {
    pub fn first_seq(&self) -> Option<i64> {
        self.entries.first().map(|e| e.seq)
    }

    pub fn last_seq(&self) -> Option<i64> {
        self.entries.last().map(|e| e.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaResponse {
    /// Everything below this sequence is durably applied
    Ack(i64),
    /// Resend starting at this sequence
    Reset(i64),
}

/// Sender's half of a replication stream
#[async_trait]
pub trait ReplicaStream: Send + Sync {
    async fn send(&self, batch: ReplicaBatch) -> Result<()>;

    /// Wait for the next response. Errors mean the stream is broken.
    async fn recv(&self) -> Result<ReplicaResponse>;
}

/// Opens sender streams to targets
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn connect(&self, target: &ReplicaTarget) -> Result<Arc<dyn ReplicaStream>>;
}

/// Receiver's half of a replication stream
#[async_trait]
pub trait ReplicaConnection: Send + Sync {
    /// Stream identity announced by the sender
    fn target(&self) -> &ReplicaTarget;

    /// Next batch, or `None` once the sender has gone away
    async fn recv(&self) -> Result<Option<ReplicaBatch>>;

    async fn send(&self, response: ReplicaResponse) -> Result<()>;
}
