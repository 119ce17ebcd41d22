//! Shared building blocks for shardline.
//!
//! The storage and replication crates agree on two things defined here:
//! the [`Record`] a producer hands to a shard, and the varint framing used
//! when records are packed into chunks.

pub mod error;
pub mod record;
pub mod varint;

pub use error::{Error, Result};
pub use record::Record;
