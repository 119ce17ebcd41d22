//! Error Types for shardline-core
//!
//! Only framing can fail at this level:
//! - `Truncated`: a buffer ended in the middle of a varint or a length-prefixed field
//! - `VarintOverflow`: a varint ran past 64 bits, which only happens on corrupt input

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Varint exceeds 64 bits")]
    VarintOverflow,
}

pub type Result<T> = std::result::Result<T, Error>;
