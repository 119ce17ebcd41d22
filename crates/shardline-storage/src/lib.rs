//! Shardline Storage Layer
//!
//! Durable, memory-mapped building blocks for shardline's replication path:
//! a segmented log that one writer appends to and any number of named
//! cursors read from, plus the receive-side bookkeeping a replica keeps per
//! stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────┐
//! │  Channel writer  │
//! └────────┬─────────┘
//!          │ append(chunk bytes)
//!          ▼
//! ┌──────────────────┐      ┌───────────────────────────┐
//! │   FanOutQueue    │─────▶│ SegmentFactory            │
//! │ - head / tail    │      │ - Segment [begin, end)    │
//! │ - FanOut cursors │      │   - index page ({b}.idx)  │
//! │ - reclamation    │      │   - data page  ({b}.dat)  │
//! └────────┬─────────┘      └─────────────┬─────────────┘
//!          │ consume / ack / reset        │
//!          ▼                              ▼
//! ┌──────────────────┐      ┌───────────────────────────┐
//! │   Replicators    │      │ PageFactory / MappedPage  │
//! └──────────────────┘      │ (memmap2)                 │
//!                           └───────────────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### MappedPage / PageFactory
//! Fixed-size files mapped into memory, created on demand and re-mapped on
//! restart. Reads borrow the mapping through a guard, so no view outlives
//! an unmapped page.
//!
//! ### Segment / SegmentFactory
//! A bounded range of sequences backed by one index page and one data
//! page. The factory rebuilds the live run on restart and deletes segments
//! once they are fully acknowledged.
//!
//! ### FanOutQueue / FanOut
//! The log itself. Each replication target owns a `FanOut` with its own
//! consume and ack positions; segments are reclaimed below the slowest ack.
//!
//! ### Sequence / SequenceManager
//! Used by the receiving side of a replication stream to remember how far
//! it has durably applied, and so where the sender must resume.
//!
//! ## Usage Example
//!
//! ```ignore
//! use shardline_storage::{FanOutQueue, QueueConfig, SEQ_NONE};
//!
//! let queue = FanOutQueue::open("/var/lib/shardline/metrics/0", QueueConfig::default())?;
//! queue.append(b"chunk bytes")?;
//!
//! let fan_out = queue.get_or_create_fan_out("10.0.0.2:7400")?;
//! let seq = fan_out.consume();
//! if seq != SEQ_NONE {
//!     let data = fan_out.get(seq)?;
//!     ship(data).await?;
//!     fan_out.ack(seq + 1);
//! }
//! ```

pub mod config;
pub mod error;
pub mod page;
pub mod queue;
pub mod segment;
pub mod sequence;

pub use config::QueueConfig;
pub use error::{Error, Result};
pub use page::{FilePageIo, MappedPage, PageFactory, PageIo, PageView};
pub use queue::{FanOut, FanOutQueue, FanOutState, SEQ_NONE};
pub use segment::{Segment, SegmentFactory};
pub use sequence::{path_component, Sequence, SequenceKey, SequenceManager};
