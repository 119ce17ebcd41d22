//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Capacity Errors
//! - `ExceedPageSize`: the record does not fit in the segment's remaining space;
//!   the log answers this by rolling to a fresh segment
//! - `MessageTooLarge`: the record does not fit even in an empty segment
//!
//! ### Range Errors
//! - `OutOfRange`: read of a sequence outside `[begin, end)` of a segment
//! - `SegmentNotFound`: the sequence belongs to a segment that was reclaimed
//!   or was never written
//!
//! ### I/O Errors
//! - `Io`: file creation, mapping, deletion or msync failed
//! - `InvalidPageFile`: a file in a page directory has an unparsable name
//! - `PageClosed`: the page was unmapped while a caller still held it
//!
//! ### Ordering Violations
//! - `SegmentOrder`: a new segment must begin after every existing one
//! - `BelowRetention`: a cursor reset below the oldest retained sequence
//!
//! ### Lifecycle
//! - `QueueClosed`: the log was closed
//! - `InvalidName`: a fan-out name that is not a single path component
//! - `InvalidConfig`: page sizes or intervals that cannot work

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message of {len} bytes exceeds remaining page space ({remaining} bytes)")]
    ExceedPageSize { len: usize, remaining: usize },

    #[error("Message of {len} bytes exceeds page size {page_size}")]
    MessageTooLarge { len: usize, page_size: usize },

    #[error("Sequence {seq} out of range [{begin}, {end})")]
    OutOfRange { seq: i64, begin: i64, end: i64 },

    #[error("No segment holds sequence {0}")]
    SegmentNotFound(i64),

    #[error("Segment begin {begin} must exceed last segment begin {last}")]
    SegmentOrder { begin: i64, last: i64 },

    #[error("Sequence {seq} is below retention floor {floor}")]
    BelowRetention { seq: i64, floor: i64 },

    #[error("Page {0} is closed")]
    PageClosed(i64),

    #[error("Page range {offset}+{len} exceeds page size {size}")]
    PageBounds { offset: usize, len: usize, size: usize },

    #[error("Invalid page file name: {0}")]
    InvalidPageFile(PathBuf),

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
