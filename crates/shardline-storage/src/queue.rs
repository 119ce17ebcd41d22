//! Fan-Out Queue - Single-Writer, Multi-Reader Durable Log
//!
//! `FanOutQueue` is the log a shard's channel appends to. Every replication
//! target reads it through its own named [`FanOut`] cursor, so one slow or
//! disconnected target never holds back the others. Segments are reclaimed
//! only once every cursor has acknowledged them.
//!
//! ## Architecture
//!
//! ```text
//!                 append()
//!                    │
//!                    ▼
//! ┌──────────────────────────────────────────────┐
//! │ segments/  [0,4096) [4096,8192) [8192,head)  │
//! └──────────────────────────────────────────────┘
//!        ▲                  ▲              ▲
//!        │ ack              │ ack          │ consume
//!   fan-out "node-2"   fan-out "node-3"    │
//!                                          │
//!             reclaim segments with end <= min(ack)
//! ```
//!
//! ## Directory Layout
//!
//! ```text
//! <dir>/
//!   meta/0.meta             head seq (i64 LE) + tail seq (i64 LE)
//!   segments/{begin}.idx
//!   segments/{begin}.dat
//!   fanout/<name>/0.meta    ack seq (i64 LE)
//! ```
//!
//! ## Sequence Positions
//!
//! All positions are "next sequence": `head` is the next sequence to
//! assign, `ack_seq` is the first sequence not yet acknowledged. Cursors
//! keep `tail <= ack_seq <= consume_seq <= head`, except that a reset may
//! lower both `consume_seq` and `ack_seq` to any retained sequence.
//!
//! ## Restart
//!
//! A fan-out persists only its ack position. After a restart it resumes
//! consuming from `ack_seq`, so anything consumed but never acknowledged is
//! shipped again.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::page::{FilePageIo, MappedPage, PageFactory, PageIo};
use crate::segment::SegmentFactory;

/// Returned by [`FanOut::consume`] when nothing new has been appended
pub const SEQ_NONE: i64 = -1;

const META_SUFFIX: &str = "meta";
const QUEUE_META_SIZE: usize = 16;
const HEAD_OFFSET: usize = 0;
const TAIL_OFFSET: usize = 8;
const FAN_OUT_META_SIZE: usize = 8;

/// State shared between the queue and its cursors
#[derive(Debug)]
struct Shared {
    head: AtomicI64,
    segments: SegmentFactory,
    gc_signal: Notify,
    /// Held while retention is computed or a cursor is rewound
    retention: Mutex<()>,
}

/// Snapshot of one cursor, for monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanOutState {
    pub name: String,
    pub head_seq: i64,
    pub tail_seq: i64,
    pub consume_seq: i64,
    pub ack_seq: i64,
}

/// Durable single-writer log with named read cursors
pub struct FanOutQueue {
    dir: PathBuf,
    config: QueueConfig,
    io: Arc<dyn PageIo>,
    shared: Arc<Shared>,
    meta_pages: PageFactory,
    meta: Arc<MappedPage>,
    write_lock: Mutex<()>,
    fan_outs: RwLock<HashMap<String, Arc<FanOut>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FanOutQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutQueue")
            .field("dir", &self.dir)
            .field("head_seq", &self.head_seq())
            .field("tail_seq", &self.tail_seq())
            .field("fan_outs", &self.fan_out_names())
            .finish()
    }
}

impl FanOutQueue {
    /// Open or create a queue in `dir`
    pub fn open(dir: impl Into<PathBuf>, config: QueueConfig) -> Result<Self> {
        Self::open_with_io(dir, config, Arc::new(FilePageIo))
    }

    pub fn open_with_io(
        dir: impl Into<PathBuf>,
        config: QueueConfig,
        io: Arc<dyn PageIo>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();

        let meta_pages =
            PageFactory::with_io(dir.join("meta"), META_SUFFIX, QUEUE_META_SIZE, io.clone())?;
        let meta = meta_pages.acquire_page(0)?;
        let head = meta.read_i64(HEAD_OFFSET)?;
        let tail = meta.read_i64(TAIL_OFFSET)?;
        if tail < 0 || tail > head {
            return Err(Error::OutOfRange {
                seq: tail,
                begin: 0,
                end: head,
            });
        }

        let segments =
            SegmentFactory::open(dir.join("segments"), &config, io.clone(), head, tail)?;

        let queue = Self {
            dir,
            config,
            io,
            shared: Arc::new(Shared {
                head: AtomicI64::new(head),
                segments,
                gc_signal: Notify::new(),
                retention: Mutex::new(()),
            }),
            meta_pages,
            meta,
            write_lock: Mutex::new(()),
            fan_outs: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        queue.load_fan_outs()?;

        info!(
            dir = %queue.dir.display(),
            head_seq = head,
            tail_seq = tail,
            fan_outs = queue.fan_outs.read().len(),
            "Opened fan-out queue"
        );
        Ok(queue)
    }

    fn fan_out_root(&self) -> PathBuf {
        self.dir.join("fanout")
    }

    fn load_fan_outs(&self) -> Result<()> {
        let root = self.fan_out_root();
        self.io.create_dir(&root)?;

        let mut fan_outs = self.fan_outs.write();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let fan_out = FanOut::open(&entry.path(), &name, &self.shared, self.io.clone())?;
            debug!(
                fan_out = %name,
                ack_seq = fan_out.ack_seq(),
                "Restored fan-out"
            );
            fan_outs.insert(name, Arc::new(fan_out));
        }
        Ok(())
    }

    /// Next sequence to be assigned
    pub fn head_seq(&self) -> i64 {
        self.shared.head.load(Ordering::Acquire)
    }

    /// Oldest sequence still on disk
    pub fn tail_seq(&self) -> i64 {
        self.shared.segments.first_begin()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append a record and return its sequence.
    ///
    /// Rolls to a new segment when the current one is exhausted. A record
    /// that does not fit in an empty segment is rejected.
    pub fn append(&self, data: &[u8]) -> Result<i64> {
        let _guard = self.write_lock.lock();
        if self.is_closed() {
            return Err(Error::QueueClosed);
        }

        if data.len() > self.config.data_page_size {
            return Err(Error::MessageTooLarge {
                len: data.len(),
                page_size: self.config.data_page_size,
            });
        }

        let segments = &self.shared.segments;
        let tail = segments
            .current()
            .ok_or_else(|| Error::SegmentNotFound(self.head_seq()))?;

        let seq = match tail.append(data) {
            Ok(seq) => seq,
            Err(Error::ExceedPageSize { .. }) if !tail.is_empty() => {
                let segment = segments.new_segment(tail.end())?;
                debug!(
                    dir = %self.dir.display(),
                    begin = segment.begin(),
                    "Rolled to new segment"
                );
                segment
                    .append(data)
                    .map_err(|e| self.too_large(e, data.len()))?
            }
            Err(e) => return Err(self.too_large(e, data.len())),
        };

        self.shared.head.store(seq + 1, Ordering::Release);
        self.meta.write_i64(HEAD_OFFSET, seq + 1)?;
        Ok(seq)
    }

    fn too_large(&self, error: Error, len: usize) -> Error {
        match error {
            Error::ExceedPageSize { .. } => Error::MessageTooLarge {
                len,
                page_size: self.config.data_page_size,
            },
            other => other,
        }
    }

    /// Read the record at `seq`
    pub fn get(&self, seq: i64) -> Result<Bytes> {
        self.shared.segments.read(seq)
    }

    /// Return the named cursor, creating it at the current head
    pub fn get_or_create_fan_out(&self, name: &str) -> Result<Arc<FanOut>> {
        validate_name(name)?;
        if self.is_closed() {
            return Err(Error::QueueClosed);
        }

        {
            let fan_outs = self.fan_outs.read();
            if let Some(fan_out) = fan_outs.get(name) {
                return Ok(Arc::clone(fan_out));
            }
        }

        let mut fan_outs = self.fan_outs.write();

        // Double-check in case another caller created it while we waited
        if let Some(fan_out) = fan_outs.get(name) {
            return Ok(Arc::clone(fan_out));
        }

        let fan_out = Arc::new(FanOut::open(
            &self.fan_out_root().join(name),
            name,
            &self.shared,
            self.io.clone(),
        )?);
        fan_outs.insert(name.to_string(), Arc::clone(&fan_out));

        info!(
            dir = %self.dir.display(),
            fan_out = %name,
            start_seq = fan_out.consume_seq(),
            "Created fan-out"
        );
        Ok(fan_out)
    }

    /// Delete a cursor and its persisted position so it stops holding back
    /// reclamation. Returns whether the cursor existed.
    pub fn remove_fan_out(&self, name: &str) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::QueueClosed);
        }

        let mut fan_outs = self.fan_outs.write();
        let Some(fan_out) = fan_outs.remove(name) else {
            return Ok(false);
        };
        fan_out.close();
        fs::remove_dir_all(self.fan_out_root().join(name))?;

        info!(
            dir = %self.dir.display(),
            fan_out = %name,
            ack_seq = fan_out.ack_seq(),
            "Removed fan-out"
        );
        self.shared.gc_signal.notify_one();
        Ok(true)
    }

    pub fn fan_out(&self, name: &str) -> Option<Arc<FanOut>> {
        self.fan_outs.read().get(name).cloned()
    }

    pub fn fan_out_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fan_outs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Reclaim segments every cursor has acknowledged.
    ///
    /// Without any cursor, everything but the writable segment is
    /// reclaimable since a new cursor starts at head.
    pub fn gc(&self) -> Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let _retention = self.shared.retention.lock();

        let min_ack = self
            .fan_outs
            .read()
            .values()
            .map(|f| f.ack_seq())
            .min()
            .unwrap_or_else(|| self.head_seq());

        let segments = &self.shared.segments;
        let floor = segments.retained_floor(min_ack);
        if floor > segments.first_begin() {
            // Persist the new tail before deleting anything so a restart
            // never looks for a segment that is already gone.
            self.meta.write_i64(TAIL_OFFSET, floor)?;
            self.meta.sync()?;
        }

        let removed = segments.remove_segments(min_ack);
        if removed > 0 {
            debug!(
                dir = %self.dir.display(),
                removed,
                ack_seq = min_ack,
                tail_seq = segments.first_begin(),
                "Reclaimed segments"
            );
        }
        Ok(removed)
    }

    /// Run reclamation on every ack signal and every `gc_interval`
    pub fn start_gc(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let interval = self.config.gc_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = queue.shared.gc_signal.notified() => {}
                }

                if let Err(e) = queue.gc() {
                    warn!(dir = %queue.dir.display(), error = %e, "Segment reclamation failed");
                }
            }

            debug!(dir = %queue.dir.display(), "Reclamation task stopped");
        })
    }

    /// `(begin, end)` of every retained segment
    pub fn segment_ranges(&self) -> Vec<(i64, i64)> {
        self.shared.segments.ranges()
    }

    /// Bytes currently mapped by segments
    pub fn size(&self) -> usize {
        self.shared.segments.size()
    }

    /// Flush the writable segment and the head/tail metadata
    pub fn sync(&self) -> Result<()> {
        self.shared.segments.sync()?;
        self.meta.sync()
    }

    /// Sync and unmap everything. Later appends fail with `QueueClosed`.
    pub fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let result = self.sync();
        if let Err(e) = &result {
            warn!(dir = %self.dir.display(), error = %e, "Failed to sync queue on close");
        }

        for fan_out in self.fan_outs.read().values() {
            fan_out.close();
        }
        self.shared.segments.close();
        self.meta_pages.close();

        info!(
            dir = %self.dir.display(),
            head_seq = self.head_seq(),
            "Closed fan-out queue"
        );
        result
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || Path::new(name).components().count() != 1
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Independent read/ack cursor over a [`FanOutQueue`]
pub struct FanOut {
    name: String,
    consume_seq: AtomicI64,
    ack_seq: AtomicI64,
    shared: Arc<Shared>,
    pages: PageFactory,
    meta: Arc<MappedPage>,
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("name", &self.name)
            .field("consume_seq", &self.consume_seq())
            .field("ack_seq", &self.ack_seq())
            .finish()
    }
}

impl FanOut {
    fn open(path: &Path, name: &str, shared: &Arc<Shared>, io: Arc<dyn PageIo>) -> Result<Self> {
        let pages = PageFactory::with_io(path, META_SUFFIX, FAN_OUT_META_SIZE, io)?;
        let existed = pages.get_page(0).is_some();
        let meta = pages.acquire_page(0)?;

        let head = shared.head.load(Ordering::Acquire);
        let tail = shared.segments.first_begin();
        let ack = if existed {
            meta.read_i64(0)?.clamp(tail, head)
        } else {
            meta.write_i64(0, head)?;
            head
        };

        Ok(Self {
            name: name.to_string(),
            consume_seq: AtomicI64::new(ack),
            ack_seq: AtomicI64::new(ack),
            shared: Arc::clone(shared),
            pages,
            meta,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn head_seq(&self) -> i64 {
        self.shared.head.load(Ordering::Acquire)
    }

    /// Oldest sequence the queue still retains
    pub fn tail_seq(&self) -> i64 {
        self.shared.segments.first_begin()
    }

    pub fn consume_seq(&self) -> i64 {
        self.consume_seq.load(Ordering::Acquire)
    }

    pub fn ack_seq(&self) -> i64 {
        self.ack_seq.load(Ordering::Acquire)
    }

    /// Records appended but not yet acknowledged
    pub fn pending(&self) -> i64 {
        self.head_seq() - self.ack_seq()
    }

    /// Claim the next unconsumed sequence, or [`SEQ_NONE`] if caught up
    pub fn consume(&self) -> i64 {
        loop {
            let current = self.consume_seq.load(Ordering::Acquire);
            if current >= self.head_seq() {
                return SEQ_NONE;
            }
            if self
                .consume_seq
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return current;
            }
        }
    }

    /// Read a record; `seq` must not have been reclaimed
    pub fn get(&self, seq: i64) -> Result<Bytes> {
        self.shared.segments.read(seq)
    }

    /// Raise the ack position. Lower values are ignored, and the position
    /// never passes what has been consumed.
    pub fn ack(&self, seq: i64) {
        // A concurrent reset may lower consume_seq between the read and the store
        let _retention = self.shared.retention.lock();
        let target = seq.min(self.consume_seq());
        let previous = self.ack_seq.fetch_max(target, Ordering::AcqRel);
        if target <= previous {
            return;
        }

        self.persist_ack();
        self.shared.gc_signal.notify_one();
    }

    fn persist_ack(&self) {
        if let Err(e) = self.meta.write_i64(0, self.ack_seq()) {
            warn!(fan_out = %self.name, error = %e, "Failed to persist ack position");
        }
    }

    /// Move the consume position to `seq` so everything from there is
    /// shipped again. The ack position follows if it was beyond `seq`.
    ///
    /// Fails when `seq` is below the oldest retained sequence or beyond head.
    pub fn set_head_seq(&self, seq: i64) -> Result<()> {
        let _retention = self.shared.retention.lock();

        let floor = self.tail_seq();
        if seq < floor {
            return Err(Error::BelowRetention { seq, floor });
        }
        let head = self.head_seq();
        if seq > head {
            return Err(Error::OutOfRange {
                seq,
                begin: floor,
                end: head,
            });
        }

        let previous = self.consume_seq.swap(seq, Ordering::AcqRel);
        if self.ack_seq() > seq {
            self.ack_seq.store(seq, Ordering::Release);
            self.persist_ack();
        }

        info!(
            fan_out = %self.name,
            from = previous,
            to = seq,
            "Reset fan-out position"
        );
        Ok(())
    }

    pub fn state(&self) -> FanOutState {
        FanOutState {
            name: self.name.clone(),
            head_seq: self.head_seq(),
            tail_seq: self.tail_seq(),
            consume_seq: self.consume_seq(),
            ack_seq: self.ack_seq(),
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.meta.sync()
    }

    fn close(&self) {
        self.pages.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 8 byte data pages: four 2-byte records per segment
    fn tiny_config() -> QueueConfig {
        QueueConfig {
            data_page_size: 8,
            index_page_size: 8 * 64,
            gc_interval_ms: 10,
        }
    }

    fn open(dir: &TempDir) -> FanOutQueue {
        FanOutQueue::open(dir.path(), tiny_config()).unwrap()
    }

    fn append_n(queue: &FanOutQueue, n: usize) {
        for i in 0..n {
            queue.append(format!("{:02}", i % 100).as_bytes()).unwrap();
        }
    }

    #[test]
    fn test_append_assigns_sequences() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);

        assert_eq!(queue.append(b"aa").unwrap(), 0);
        assert_eq!(queue.append(b"bb").unwrap(), 1);
        assert_eq!(queue.head_seq(), 2);
        assert_eq!(queue.get(1).unwrap(), Bytes::from_static(b"bb"));
    }

    #[test]
    fn test_append_rolls_segments() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        append_n(&queue, 10);

        assert_eq!(queue.segment_ranges(), vec![(0, 4), (4, 8), (8, 10)]);
        for seq in 0..10 {
            let expected = format!("{:02}", seq);
            assert_eq!(queue.get(seq).unwrap(), Bytes::from(expected));
        }
    }

    #[test]
    fn test_oversized_message_rejected() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        queue.append(b"aa").unwrap();

        let result = queue.append(b"123456789");
        assert!(matches!(
            result,
            Err(Error::MessageTooLarge {
                len: 9,
                page_size: 8
            })
        ));
        // Rejected before rolling, so no empty segment is left behind
        assert_eq!(queue.segment_ranges(), vec![(0, 1)]);
        assert_eq!(queue.head_seq(), 1);
        assert_eq!(queue.append(b"bb").unwrap(), 1);
    }

    #[test]
    fn test_consume_until_caught_up() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        let fan_out = queue.get_or_create_fan_out("node-1").unwrap();

        assert_eq!(fan_out.consume(), SEQ_NONE);
        append_n(&queue, 3);
        assert_eq!(fan_out.consume(), 0);
        assert_eq!(fan_out.consume(), 1);
        assert_eq!(fan_out.consume(), 2);
        assert_eq!(fan_out.consume(), SEQ_NONE);
        assert_eq!(fan_out.get(2).unwrap(), Bytes::from_static(b"02"));
    }

    #[test]
    fn test_new_fan_out_starts_at_head() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        append_n(&queue, 5);

        let fan_out = queue.get_or_create_fan_out("late").unwrap();
        assert_eq!(fan_out.consume_seq(), 5);
        assert_eq!(fan_out.ack_seq(), 5);
        assert_eq!(fan_out.consume(), SEQ_NONE);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);

        let a = queue.get_or_create_fan_out("node-1").unwrap();
        let b = queue.get_or_create_fan_out("node-1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(queue.fan_out_names(), vec!["node-1".to_string()]);
    }

    #[test]
    fn test_invalid_fan_out_names() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);

        for name in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(
                queue.get_or_create_fan_out(name),
                Err(Error::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_ack_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        let fan_out = queue.get_or_create_fan_out("node-1").unwrap();
        append_n(&queue, 6);
        for _ in 0..6 {
            fan_out.consume();
        }

        fan_out.ack(4);
        assert_eq!(fan_out.ack_seq(), 4);
        fan_out.ack(2);
        assert_eq!(fan_out.ack_seq(), 4);
        assert_eq!(fan_out.pending(), 2);
    }

    #[test]
    fn test_ack_bounded_by_consume() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        let fan_out = queue.get_or_create_fan_out("node-1").unwrap();
        append_n(&queue, 6);
        fan_out.consume();
        fan_out.consume();

        fan_out.ack(100);
        assert_eq!(fan_out.ack_seq(), 2);
    }

    #[test]
    fn test_ack_never_passes_consume_during_reset() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            data_page_size: 4096,
            index_page_size: 8 * 1024,
            gc_interval_ms: 10,
        };
        let queue = FanOutQueue::open(dir.path(), config).unwrap();
        let fan_out = queue.get_or_create_fan_out("node-1").unwrap();
        for _ in 0..200 {
            queue.append(b"x").unwrap();
        }
        while fan_out.consume() != SEQ_NONE {}

        let acker = {
            let fan_out = Arc::clone(&fan_out);
            std::thread::spawn(move || {
                for seq in 0..=200 {
                    fan_out.ack(seq);
                }
            })
        };
        let resetter = {
            let fan_out = Arc::clone(&fan_out);
            std::thread::spawn(move || {
                for i in 0..200 {
                    fan_out.set_head_seq(i % 50).unwrap();
                }
            })
        };
        acker.join().unwrap();
        resetter.join().unwrap();

        assert!(fan_out.ack_seq() <= fan_out.consume_seq());
    }

    #[test]
    fn test_set_head_seq_rewinds() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        let fan_out = queue.get_or_create_fan_out("node-1").unwrap();
        append_n(&queue, 6);
        for _ in 0..6 {
            fan_out.consume();
        }
        fan_out.ack(5);

        fan_out.set_head_seq(3).unwrap();
        assert_eq!(fan_out.consume_seq(), 3);
        assert_eq!(fan_out.ack_seq(), 3);
        assert_eq!(fan_out.consume(), 3);

        assert!(matches!(
            fan_out.set_head_seq(7),
            Err(Error::OutOfRange { seq: 7, .. })
        ));
    }

    #[test]
    fn test_set_head_seq_below_retention() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        let fan_out = queue.get_or_create_fan_out("node-1").unwrap();
        append_n(&queue, 10);
        for _ in 0..10 {
            fan_out.consume();
        }
        fan_out.ack(9);
        queue.gc().unwrap();
        assert_eq!(queue.tail_seq(), 8);

        assert!(matches!(
            fan_out.set_head_seq(2),
            Err(Error::BelowRetention { seq: 2, floor: 8 })
        ));
        assert_eq!(fan_out.consume_seq(), 10);
        fan_out.set_head_seq(8).unwrap();
    }

    #[test]
    fn test_gc_waits_for_slowest_fan_out() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        let fast = queue.get_or_create_fan_out("fast").unwrap();
        let slow = queue.get_or_create_fan_out("slow").unwrap();
        append_n(&queue, 12);
        for _ in 0..12 {
            fast.consume();
            slow.consume();
        }

        fast.ack(10);
        slow.ack(3);
        assert_eq!(queue.gc().unwrap(), 0);
        assert_eq!(queue.segment_ranges(), vec![(0, 4), (4, 8), (8, 12)]);

        slow.ack(4);
        assert_eq!(queue.gc().unwrap(), 1);
        assert_eq!(queue.segment_ranges(), vec![(4, 8), (8, 12)]);
        for seq in 4..=10 {
            assert!(queue.get(seq).is_ok());
        }
    }

    #[test]
    fn test_gc_without_fan_outs_keeps_tail() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        append_n(&queue, 9);

        queue.gc().unwrap();
        assert_eq!(queue.segment_ranges(), vec![(8, 9)]);
        assert_eq!(queue.tail_seq(), 8);
    }

    #[test]
    fn test_removed_fan_out_no_longer_holds_retention() {
        let dir = TempDir::new().unwrap();
        {
            let queue = open(&dir);
            let live = queue.get_or_create_fan_out("live").unwrap();
            queue.get_or_create_fan_out("gone").unwrap();
            append_n(&queue, 12);
            while live.consume() != SEQ_NONE {}
            live.ack(12);

            assert_eq!(queue.gc().unwrap(), 0);
            assert!(queue.remove_fan_out("gone").unwrap());
            assert!(!queue.remove_fan_out("gone").unwrap());
            assert_eq!(queue.gc().unwrap(), 2);
            assert_eq!(queue.segment_ranges(), vec![(8, 12)]);
            queue.close().unwrap();
        }

        // The removed cursor is not restored on restart
        let queue = open(&dir);
        assert_eq!(queue.fan_out_names(), vec!["live".to_string()]);
        assert!(!dir.path().join("fanout").join("gone").exists());
    }

    #[test]
    fn test_restart_restores_positions() {
        let dir = TempDir::new().unwrap();
        {
            let queue = open(&dir);
            let fan_out = queue.get_or_create_fan_out("node-1").unwrap();
            append_n(&queue, 10);
            for _ in 0..7 {
                fan_out.consume();
            }
            fan_out.ack(5);
            queue.gc().unwrap();
            queue.close().unwrap();
        }

        let queue = open(&dir);
        assert_eq!(queue.head_seq(), 10);
        assert_eq!(queue.tail_seq(), 4);
        assert_eq!(queue.segment_ranges(), vec![(4, 8), (8, 10)]);

        let fan_out = queue.fan_out("node-1").unwrap();
        assert_eq!(fan_out.ack_seq(), 5);
        // Consumed-but-unacked records are shipped again
        assert_eq!(fan_out.consume(), 5);

        assert_eq!(queue.append(b"zz").unwrap(), 10);
        assert_eq!(queue.get(10).unwrap(), Bytes::from_static(b"zz"));
    }

    #[test]
    fn test_closed_queue_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir);
        queue.append(b"aa").unwrap();

        queue.close().unwrap();
        queue.close().unwrap();
        assert!(matches!(queue.append(b"bb"), Err(Error::QueueClosed)));
        assert!(matches!(
            queue.get_or_create_fan_out("node-1"),
            Err(Error::QueueClosed)
        ));
    }

    #[test]
    fn test_concurrent_consumers_never_share_a_sequence() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            data_page_size: 4096,
            index_page_size: 8 * 1024,
            gc_interval_ms: 10,
        };
        let queue = FanOutQueue::open(dir.path(), config).unwrap();
        let fan_out = queue.get_or_create_fan_out("node-1").unwrap();
        for _ in 0..500 {
            queue.append(b"x").unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let fan_out = Arc::clone(&fan_out);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        let seq = fan_out.consume();
                        if seq == SEQ_NONE {
                            break;
                        }
                        seen.push(seq);
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        assert_eq!(all, (0..500).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_background_gc_reclaims_on_ack() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(open(&dir));
        let fan_out = queue.get_or_create_fan_out("node-1").unwrap();
        append_n(&queue, 12);
        for _ in 0..12 {
            fan_out.consume();
        }

        let cancel = CancellationToken::new();
        let handle = queue.start_gc(cancel.clone());
        fan_out.ack(12);

        let reclaimed = tokio::time::timeout(Duration::from_secs(5), async {
            while queue.segment_ranges().len() > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reclaimed.is_ok(), "segments were not reclaimed");
        assert_eq!(queue.segment_ranges(), vec![(8, 12)]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
