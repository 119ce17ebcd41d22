//! Replication Configuration
//!
//! One `ReplicationConfig` drives every database channel a
//! [`ChannelManager`](crate::ChannelManager) opens.
//!
//! ## Tuning
//!
//! - **chunk_capacity**: records per chunk. Larger chunks compress better
//!   and cost fewer log appends, but hold data in memory longer.
//! - **flush_interval_ms**: upper bound on how long a record waits in a
//!   partially filled chunk.
//! - **buffer_size**: compressed chunks waiting for the log writer. Writers
//!   block once it is full.
//! - **batch_size**: log records per replication batch.
//! - **reconnect_backoff_ms**: pause between reconnect attempts.
//! - **shutdown_timeout_ms**: how long close waits for a replicator that
//!   is blocked on a live stream before aborting it.
//!
//! ## Usage
//!
//! ```ignore
//! let config = ReplicationConfig {
//!     directory: PathBuf::from("/var/lib/shardline"),
//!     targets: vec!["10.0.0.2:7400".to_string()],
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use serde::{Deserialize, Serialize};
use shardline_storage::QueueConfig;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Root directory; each shard's log lives at `<directory>/<database>/<shard>`
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Segment layout and reclamation interval of each shard's log
    #[serde(default)]
    pub queue: QueueConfig,

    /// Shards per database (default: 4)
    #[serde(default = "default_shards")]
    pub shards: u32,

    /// Identity this node announces to its replication targets
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Endpoints every shard replicates to
    #[serde(default)]
    pub targets: Vec<String>,

    /// Records per chunk (default: 1024)
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: usize,

    /// Chunks buffered between producers and the log writer (default: 32)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Flush a partial chunk once it is this old (default: 5s)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// How often the flush timer checks chunk age (default: 1s)
    #[serde(default = "default_flush_check_interval_ms")]
    pub flush_check_interval_ms: u64,

    /// Log records per replication batch (default: 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Send loop pause when the log has nothing new (default: 10ms)
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// Pause between reconnect attempts (default: 1s)
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// How long close waits for a replicator blocked on the network (default: 1s)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            queue: QueueConfig::default(),
            shards: default_shards(),
            node_id: default_node_id(),
            targets: Vec::new(),
            chunk_capacity: default_chunk_capacity(),
            buffer_size: default_buffer_size(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_check_interval_ms: default_flush_check_interval_ms(),
            batch_size: default_batch_size(),
            idle_interval_ms: default_idle_interval_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl ReplicationConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("shards", self.shards as u64),
            ("chunk_capacity", self.chunk_capacity as u64),
            ("buffer_size", self.buffer_size as u64),
            ("flush_interval_ms", self.flush_interval_ms),
            ("flush_check_interval_ms", self.flush_check_interval_ms),
            ("batch_size", self.batch_size as u64),
            ("idle_interval_ms", self.idle_interval_ms),
            ("reconnect_backoff_ms", self.reconnect_backoff_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id must not be empty".to_string()));
        }
        self.queue.validate()?;
        Ok(())
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from("./data/shardline")
}

fn default_shards() -> u32 {
    4
}

fn default_node_id() -> String {
    "shardline".to_string()
}

fn default_chunk_capacity() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    32
}

fn default_flush_interval_ms() -> u64 {
    5 * 1000 // 5 seconds
}

fn default_flush_check_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_idle_interval_ms() -> u64 {
    10
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}
