//! Record Data Structure
//!
//! A `Record` is the unit a producer writes into shardline.
//!
//! ## Structure
//! - **key**: grouping key used to route the record to a shard (for metrics,
//!   typically the series identity: metric name plus tags)
//! - **payload**: the encoded record itself; shardline never looks inside it
//!
//! Routing is a deterministic function of the key, so every record of one
//! series lands on the same shard and is replicated in append order.
//!
//! ## Example
//! ```ignore
//! let record = Record::new(
//!     Bytes::from("cpu.load,host=web-1"),
//!     Bytes::from(encoded_point),
//! );
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single producer write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Grouping key, hashed to pick a shard
    pub key: Bytes,

    /// Opaque encoded payload
    pub payload: Bytes,
}

impl Record {
    pub fn new(key: Bytes, payload: Bytes) -> Self {
        Self { key, payload }
    }

    /// Bytes this record contributes to a chunk before compression
    /// (payload plus the worst-case length prefix).
    pub fn encoded_len(&self) -> usize {
        self.payload.len() + crate::varint::MAX_VARINT_LEN
    }
}
