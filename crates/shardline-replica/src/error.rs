//! Replication Error Types
//!
//! ## Error Handling Strategy
//!
//! - **Producer-visible**: `Cancelled`, `ChannelClosed`, `InvalidShard`,
//!   `DatabaseNotFound`, `ChunkFull`, `RecordTooLarge`
//! - **Recovered inside the replicator**: `Transport` (reconnect with
//!   backoff), `BelowRetention` from storage (rewind to the floor instead)
//! - **Data integrity**: `Corrupted`, `Compression`
//! - **Fatal at startup**: `Storage`, `InvalidConfig`

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] shardline_storage::Error),

    #[error("Framing error: {0}")]
    Core(#[from] shardline_core::Error),

    /// The owning context was cancelled before the write was handed off
    #[error("Operation cancelled: shutting down")]
    Cancelled,

    #[error("Channel for shard {0} is closed")]
    ChannelClosed(u32),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Invalid shard {shard}: database has {count} shards")]
    InvalidShard { shard: u32, count: u32 },

    #[error("Chunk is full ({capacity} records)")]
    ChunkFull { capacity: usize },

    /// The record cannot fit in a chunk even on its own
    #[error("Record of {len} bytes cannot fit in a chunk of at most {limit} bytes")]
    RecordTooLarge { len: usize, limit: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Corrupted chunk: {0}")]
    Corrupted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
