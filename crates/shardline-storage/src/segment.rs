//! Log Segments
//!
//! A segment holds a contiguous range of sequence numbers `[begin, end)`
//! backed by two pages named after `begin`:
//!
//! ```text
//! {begin}.idx   index page, one 8-byte record per sequence
//! {begin}.dat   data page, record bytes concatenated from offset 0
//!
//! Index record for sequence s, at byte (s - begin) * 8:
//! ┌──────────────────┬──────────────────┐
//! │ data offset      │ data length      │
//! │ (i32 LE)         │ (i32 LE)         │
//! └──────────────────┴──────────────────┘
//! ```
//!
//! The segment never grows. When a record does not fit, `append` fails with
//! `ExceedPageSize` and the queue rolls to a new segment.
//!
//! ## Write Ordering
//!
//! An append writes the data bytes, then the index record, then publishes
//! the new `end`. The queue persists its head only after `append` returns,
//! so on restart every sequence below the persisted head has a complete
//! index record and data, and the write cursor is recomputed from the last
//! index record.

use bytes::Bytes;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::page::{MappedPage, PageFactory, PageIo, PageView};

/// Size of one index record
pub const INDEX_ENTRY_SIZE: usize = 8;

const INDEX_SUFFIX: &str = "idx";
const DATA_SUFFIX: &str = "dat";

/// One bounded range of the log
#[derive(Debug)]
pub struct Segment {
    begin: i64,
    end: AtomicI64,
    index_page: Arc<MappedPage>,
    data_page: Arc<MappedPage>,
    data_offset: AtomicUsize,
}

impl Segment {
    /// Empty segment starting at `begin`
    pub fn new(begin: i64, index_page: Arc<MappedPage>, data_page: Arc<MappedPage>) -> Self {
        Self {
            begin,
            end: AtomicI64::new(begin),
            index_page,
            data_page,
            data_offset: AtomicUsize::new(0),
        }
    }

    /// Segment recovered from disk holding `[begin, end)`
    pub fn restore(
        begin: i64,
        end: i64,
        index_page: Arc<MappedPage>,
        data_page: Arc<MappedPage>,
    ) -> Result<Self> {
        if end < begin {
            return Err(Error::OutOfRange {
                seq: end,
                begin,
                end: begin,
            });
        }
        let capacity = (index_page.size() / INDEX_ENTRY_SIZE) as i64;
        if end - begin > capacity {
            return Err(Error::OutOfRange {
                seq: end,
                begin,
                end: begin + capacity,
            });
        }

        let segment = Self {
            begin,
            end: AtomicI64::new(end),
            index_page,
            data_page,
            data_offset: AtomicUsize::new(0),
        };
        segment.adjust_offset()?;
        Ok(segment)
    }

    /// Recompute the write cursor from the last index record
    fn adjust_offset(&self) -> Result<()> {
        let end = self.end();
        if end == self.begin {
            self.data_offset.store(0, Ordering::Release);
            return Ok(());
        }

        let (offset, len) = self.index_entry(end - 1)?;
        let cursor = offset + len;
        if cursor > self.data_page.size() {
            return Err(Error::PageBounds {
                offset,
                len,
                size: self.data_page.size(),
            });
        }
        self.data_offset.store(cursor, Ordering::Release);
        Ok(())
    }

    fn index_entry(&self, seq: i64) -> Result<(usize, usize)> {
        let slot = (seq - self.begin) as usize * INDEX_ENTRY_SIZE;
        let view = self.index_page.read(slot, INDEX_ENTRY_SIZE)?;
        let offset = i32::from_le_bytes([view[0], view[1], view[2], view[3]]);
        let len = i32::from_le_bytes([view[4], view[5], view[6], view[7]]);
        if offset < 0 || len < 0 {
            return Err(Error::PageBounds {
                offset: offset.max(0) as usize,
                len: len.max(0) as usize,
                size: self.data_page.size(),
            });
        }
        Ok((offset as usize, len as usize))
    }

    pub fn begin(&self) -> i64 {
        self.begin
    }

    pub fn end(&self) -> i64 {
        self.end.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.end() == self.begin
    }

    pub fn contains(&self, seq: i64) -> bool {
        self.begin <= seq && seq < self.end()
    }

    /// Bytes of the data page already written
    pub fn data_offset(&self) -> usize {
        self.data_offset.load(Ordering::Acquire)
    }

    /// Append one record and return its sequence.
    ///
    /// Single writer only; the queue serializes calls.
    pub fn append(&self, message: &[u8]) -> Result<i64> {
        let offset = self.data_offset();
        let remaining = self.data_page.size() - offset;
        if message.len() > remaining {
            return Err(Error::ExceedPageSize {
                len: message.len(),
                remaining,
            });
        }

        let seq = self.end();
        let slot = (seq - self.begin) as usize * INDEX_ENTRY_SIZE;
        if slot + INDEX_ENTRY_SIZE > self.index_page.size() {
            return Err(Error::ExceedPageSize {
                len: message.len(),
                remaining: 0,
            });
        }

        self.data_page.write(offset, message)?;

        let mut entry = [0u8; INDEX_ENTRY_SIZE];
        entry[..4].copy_from_slice(&(offset as i32).to_le_bytes());
        entry[4..].copy_from_slice(&(message.len() as i32).to_le_bytes());
        self.index_page.write(slot, &entry)?;

        self.data_offset
            .store(offset + message.len(), Ordering::Release);
        self.end.store(seq + 1, Ordering::Release);
        Ok(seq)
    }

    /// Borrow the record at `seq` straight from the mapped data page
    pub fn read(&self, seq: i64) -> Result<PageView<'_>> {
        if !self.contains(seq) {
            return Err(Error::OutOfRange {
                seq,
                begin: self.begin,
                end: self.end(),
            });
        }
        let (offset, len) = self.index_entry(seq)?;
        self.data_page.read(offset, len)
    }

    pub fn sync(&self) -> Result<()> {
        self.data_page.sync()?;
        self.index_page.sync()
    }
}

/// Ascending `begin` values of the live segments
#[derive(Debug, Default, Clone)]
pub struct SeqRange(Vec<i64>);

impl SeqRange {
    /// Position of the last range whose begin is `<= seq`
    pub fn find(&self, seq: i64) -> Option<usize> {
        match self.0.partition_point(|begin| *begin <= seq) {
            0 => None,
            n => Some(n - 1),
        }
    }

    fn push(&mut self, begin: i64) {
        self.0.push(begin);
    }

    fn remove_first(&mut self) {
        self.0.remove(0);
    }

    fn last(&self) -> Option<i64> {
        self.0.last().copied()
    }
}

#[derive(Debug, Default)]
struct SegmentList {
    segments: Vec<Arc<Segment>>,
    seq_range: SeqRange,
}

/// Ordered set of segments for one queue
pub struct SegmentFactory {
    path: PathBuf,
    index_pages: PageFactory,
    data_pages: PageFactory,
    list: RwLock<SegmentList>,
}

impl std::fmt::Debug for SegmentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentFactory")
            .field("path", &self.path)
            .field("segments", &self.ranges())
            .finish()
    }
}

impl SegmentFactory {
    /// Open the segment directory and rebuild the run covering
    /// `[tail_seq, head_seq]`.
    ///
    /// An empty directory yields one empty segment at `head_seq`. A boundary
    /// sequence with no segment on disk means the log cannot be rebuilt.
    pub fn open(
        path: impl Into<PathBuf>,
        config: &QueueConfig,
        io: Arc<dyn PageIo>,
        head_seq: i64,
        tail_seq: i64,
    ) -> Result<Self> {
        let path = path.into();
        let index_pages =
            PageFactory::with_io(&path, INDEX_SUFFIX, config.index_page_size, io.clone())?;
        let data_pages = PageFactory::with_io(&path, DATA_SUFFIX, config.data_page_size, io)?;

        let factory = Self {
            path,
            index_pages,
            data_pages,
            list: RwLock::new(SegmentList::default()),
        };
        factory.load(head_seq, tail_seq)?;
        Ok(factory)
    }

    fn load(&self, head_seq: i64, tail_seq: i64) -> Result<()> {
        let begins = self.data_pages.page_indexes();
        if begins.is_empty() {
            if head_seq != tail_seq {
                return Err(Error::SegmentNotFound(tail_seq));
            }
            self.new_segment(head_seq)?;
            return Ok(());
        }

        let on_disk = SeqRange(begins.clone());
        let first = on_disk.find(tail_seq).ok_or(Error::SegmentNotFound(tail_seq))?;
        let last = on_disk.find(head_seq).ok_or(Error::SegmentNotFound(head_seq))?;

        let mut list = self.list.write();
        for pos in first..=last {
            let begin = begins[pos];
            let end = if pos == last { head_seq } else { begins[pos + 1] };
            let index_page = self
                .index_pages
                .get_page(begin)
                .ok_or(Error::SegmentNotFound(begin))?;
            let data_page = self
                .data_pages
                .get_page(begin)
                .ok_or(Error::SegmentNotFound(begin))?;

            let segment = Segment::restore(begin, end, index_page, data_page)?;
            debug!(begin, end, "Restored segment");
            list.segments.push(Arc::new(segment));
            list.seq_range.push(begin);
        }
        drop(list);

        // Anything outside the recovered run is left over from an
        // interrupted reclamation or rollover.
        for begin in begins
            .iter()
            .enumerate()
            .filter(|(pos, _)| *pos < first || *pos > last)
            .map(|(_, begin)| *begin)
        {
            warn!(path = %self.path.display(), begin, "Removing stale segment");
            self.release_pages(begin);
        }

        info!(
            path = %self.path.display(),
            segments = last - first + 1,
            head_seq,
            tail_seq,
            "Loaded segments"
        );
        Ok(())
    }

    /// Create an empty segment; `begin` must exceed every existing begin
    pub fn new_segment(&self, begin: i64) -> Result<Arc<Segment>> {
        let mut list = self.list.write();
        if let Some(last) = list.seq_range.last() {
            if begin <= last {
                return Err(Error::SegmentOrder { begin, last });
            }
        }

        let index_page = self.index_pages.acquire_page(begin)?;
        let data_page = self.data_pages.acquire_page(begin)?;
        let segment = Arc::new(Segment::new(begin, index_page, data_page));

        list.segments.push(Arc::clone(&segment));
        list.seq_range.push(begin);

        debug!(path = %self.path.display(), begin, "Created segment");
        Ok(segment)
    }

    /// The writable segment
    pub fn current(&self) -> Option<Arc<Segment>> {
        self.list.read().segments.last().cloned()
    }

    /// Segment whose range starts at or before `seq`
    pub fn find(&self, seq: i64) -> Option<Arc<Segment>> {
        let list = self.list.read();
        list.seq_range
            .find(seq)
            .map(|pos| Arc::clone(&list.segments[pos]))
    }

    /// Copy the record at `seq` out of its segment
    pub fn read(&self, seq: i64) -> Result<Bytes> {
        let segment = self.find(seq).ok_or(Error::SegmentNotFound(seq))?;
        let view = segment.read(seq)?;
        Ok(Bytes::copy_from_slice(&view))
    }

    /// Oldest retained sequence
    pub fn first_begin(&self) -> i64 {
        self.list
            .read()
            .segments
            .first()
            .map(|s| s.begin())
            .unwrap_or(0)
    }

    /// First sequence still retained after `remove_segments(ack_seq)`
    pub fn retained_floor(&self, ack_seq: i64) -> i64 {
        let list = self.list.read();
        let keep = Self::removable(&list.segments, ack_seq);
        list.segments
            .get(keep)
            .map(|s| s.begin())
            .unwrap_or(0)
    }

    fn removable(segments: &[Arc<Segment>], ack_seq: i64) -> usize {
        // The writable segment always stays.
        let candidates = segments.len().saturating_sub(1);
        segments[..candidates]
            .iter()
            .take_while(|s| s.end() <= ack_seq)
            .count()
    }

    /// Delete every segment fully below `ack_seq`, oldest first.
    ///
    /// File deletion failures are logged; the segment is dropped from the
    /// list either way and its pages are retried by the next call.
    pub fn remove_segments(&self, ack_seq: i64) -> usize {
        let removed: Vec<Arc<Segment>> = {
            let mut list = self.list.write();
            let count = Self::removable(&list.segments, ack_seq);
            for _ in 0..count {
                list.seq_range.remove_first();
            }
            list.segments.drain(..count).collect()
        };

        for segment in &removed {
            self.release_pages(segment.begin());
            debug!(
                begin = segment.begin(),
                end = segment.end(),
                ack_seq,
                "Removed segment"
            );
        }

        // Retry pages whose deletion failed earlier.
        let floor = self.first_begin();
        for begin in self.data_pages.page_indexes() {
            if begin < floor {
                self.release_pages(begin);
            }
        }
        for begin in self.index_pages.page_indexes() {
            if begin < floor {
                self.release_pages(begin);
            }
        }

        removed.len()
    }

    fn release_pages(&self, begin: i64) {
        if let Err(e) = self.index_pages.release_page(begin) {
            warn!(path = %self.path.display(), begin, error = %e, "Failed to delete index page");
        }
        if let Err(e) = self.data_pages.release_page(begin) {
            warn!(path = %self.path.display(), begin, error = %e, "Failed to delete data page");
        }
    }

    /// `(begin, end)` of every live segment
    pub fn ranges(&self) -> Vec<(i64, i64)> {
        self.list
            .read()
            .segments
            .iter()
            .map(|s| (s.begin(), s.end()))
            .collect()
    }

    pub fn segment_count(&self) -> usize {
        self.list.read().segments.len()
    }

    /// Bytes mapped by all segments
    pub fn size(&self) -> usize {
        self.index_pages.size() + self.data_pages.size()
    }

    pub fn sync(&self) -> Result<()> {
        match self.current() {
            Some(segment) => segment.sync(),
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        self.index_pages.close();
        self.data_pages.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::tests::StubbornIo;
    use crate::page::FilePageIo;
    use tempfile::TempDir;

    fn small_config(data_page_size: usize) -> QueueConfig {
        QueueConfig {
            data_page_size,
            index_page_size: 8 * 16,
            ..Default::default()
        }
    }

    fn open(dir: &TempDir, config: &QueueConfig, head: i64, tail: i64) -> SegmentFactory {
        SegmentFactory::open(dir.path(), config, Arc::new(FilePageIo), head, tail).unwrap()
    }

    #[test]
    fn test_fresh_segment_capacity() {
        let dir = TempDir::new().unwrap();
        let factory = open(&dir, &small_config(10), 0, 0);
        assert_eq!(factory.ranges(), vec![(0, 0)]);

        let segment = factory.current().unwrap();
        assert_eq!(segment.append(b"a").unwrap(), 0);
        assert_eq!(segment.append(b"bc").unwrap(), 1);
        assert_eq!(segment.append(b"d").unwrap(), 2);

        let result = segment.append(b"1234567");
        assert!(matches!(
            result,
            Err(Error::ExceedPageSize {
                len: 7,
                remaining: 6
            })
        ));
        assert_eq!(segment.end(), 3);
        assert_eq!(segment.data_offset(), 4);
    }

    #[test]
    fn test_read_returns_appended_bytes() {
        let dir = TempDir::new().unwrap();
        let factory = open(&dir, &small_config(64), 0, 0);
        let segment = factory.current().unwrap();

        segment.append(b"first").unwrap();
        segment.append(b"").unwrap();
        segment.append(b"third").unwrap();

        assert_eq!(&*segment.read(0).unwrap(), b"first");
        assert_eq!(&*segment.read(1).unwrap(), b"");
        assert_eq!(&*segment.read(2).unwrap(), b"third");
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = TempDir::new().unwrap();
        let factory = open(&dir, &small_config(64), 0, 0);
        let segment = factory.current().unwrap();
        segment.append(b"x").unwrap();

        assert!(matches!(segment.read(-1), Err(Error::OutOfRange { .. })));
        assert!(matches!(
            segment.read(1),
            Err(Error::OutOfRange {
                seq: 1,
                begin: 0,
                end: 1
            })
        ));
    }

    #[test]
    fn test_index_page_exhaustion() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            data_page_size: 1024,
            index_page_size: 8 * 2,
            ..Default::default()
        };
        let factory = open(&dir, &config, 0, 0);
        let segment = factory.current().unwrap();

        segment.append(b"a").unwrap();
        segment.append(b"b").unwrap();
        assert!(matches!(
            segment.append(b"c"),
            Err(Error::ExceedPageSize { .. })
        ));
    }

    #[test]
    fn test_new_segment_must_advance() {
        let dir = TempDir::new().unwrap();
        let factory = open(&dir, &small_config(64), 0, 0);

        assert!(matches!(
            factory.new_segment(0),
            Err(Error::SegmentOrder { begin: 0, last: 0 })
        ));
        factory.new_segment(10).unwrap();
        assert!(matches!(
            factory.new_segment(7),
            Err(Error::SegmentOrder { begin: 7, last: 10 })
        ));
    }

    #[test]
    fn test_find_uses_begin_ranges() {
        let range = SeqRange(vec![0, 10, 20]);
        assert_eq!(range.find(-1), None);
        assert_eq!(range.find(0), Some(0));
        assert_eq!(range.find(9), Some(0));
        assert_eq!(range.find(10), Some(1));
        assert_eq!(range.find(25), Some(2));
    }

    fn fill(factory: &SegmentFactory, count: i64) {
        // Two records per segment with a 4 byte data page
        let mut head = factory.current().unwrap().end();
        for _ in 0..count {
            let segment = factory.current().unwrap();
            match segment.append(b"xy") {
                Ok(seq) => head = seq + 1,
                Err(Error::ExceedPageSize { .. }) => {
                    let segment = factory.new_segment(head).unwrap();
                    head = segment.append(b"xy").unwrap() + 1;
                }
                Err(e) => panic!("append failed: {e}"),
            }
        }
    }

    #[test]
    fn test_remove_segments_idempotent() {
        let dir = TempDir::new().unwrap();
        let factory = open(&dir, &small_config(4), 0, 0);
        fill(&factory, 6);
        assert_eq!(factory.ranges(), vec![(0, 2), (2, 4), (4, 6)]);

        assert_eq!(factory.remove_segments(3), 1);
        assert_eq!(factory.ranges(), vec![(2, 4), (4, 6)]);
        assert_eq!(factory.remove_segments(3), 0);
        assert_eq!(factory.ranges(), vec![(2, 4), (4, 6)]);

        assert!(!dir.path().join("0.dat").exists());
        assert!(!dir.path().join("0.idx").exists());
        assert!(matches!(factory.read(1), Err(Error::SegmentNotFound(1))));
        assert_eq!(factory.read(2).unwrap(), Bytes::from_static(b"xy"));
    }

    #[test]
    fn test_remove_keeps_writable_segment() {
        let dir = TempDir::new().unwrap();
        let factory = open(&dir, &small_config(4), 0, 0);
        fill(&factory, 4);

        assert_eq!(factory.retained_floor(100), 2);
        factory.remove_segments(100);
        assert_eq!(factory.ranges(), vec![(2, 4)]);
        assert_eq!(factory.first_begin(), 2);
    }

    #[test]
    fn test_failed_deletion_is_retried() {
        let dir = TempDir::new().unwrap();
        let io = Arc::new(StubbornIo::default());
        let factory =
            SegmentFactory::open(dir.path(), &small_config(4), io.clone(), 0, 0).unwrap();
        fill(&factory, 6);

        io.keep.lock().insert(dir.path().join("0.dat"));
        assert_eq!(factory.remove_segments(2), 1);
        assert!(dir.path().join("0.dat").exists());
        assert!(!dir.path().join("0.idx").exists());

        io.keep.lock().clear();
        factory.remove_segments(2);
        assert!(!dir.path().join("0.dat").exists());
        assert_eq!(factory.ranges(), vec![(2, 4), (4, 6)]);
    }

    #[test]
    fn test_reload_recomputes_cursor() {
        let dir = TempDir::new().unwrap();
        let config = small_config(4);
        {
            let factory = open(&dir, &config, 0, 0);
            fill(&factory, 5);
            factory.close();
        }

        let factory = open(&dir, &config, 5, 0);
        assert_eq!(factory.ranges(), vec![(0, 2), (2, 4), (4, 5)]);
        let tail = factory.current().unwrap();
        assert_eq!(tail.data_offset(), 2);
        assert_eq!(tail.append(b"zz").unwrap(), 5);
        assert_eq!(factory.read(5).unwrap(), Bytes::from_static(b"zz"));
        assert_eq!(factory.read(0).unwrap(), Bytes::from_static(b"xy"));
    }

    #[test]
    fn test_reload_drops_stale_segments() {
        let dir = TempDir::new().unwrap();
        let config = small_config(4);
        {
            let factory = open(&dir, &config, 0, 0);
            fill(&factory, 6);
            factory.close();
        }

        // Tail was advanced to 2 but segment 0 was never deleted
        let factory = open(&dir, &config, 6, 2);
        assert_eq!(factory.ranges(), vec![(2, 4), (4, 6)]);
        assert!(!dir.path().join("0.dat").exists());
    }

    #[test]
    fn test_reload_missing_boundary_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = small_config(4);
        {
            let factory = open(&dir, &config, 0, 0);
            fill(&factory, 4);
            factory.remove_segments(2);
            factory.close();
        }

        let result = SegmentFactory::open(dir.path(), &config, Arc::new(FilePageIo), 4, 0);
        assert!(matches!(result, Err(Error::SegmentNotFound(0))));
    }

    #[test]
    fn test_empty_directory_with_gap_is_fatal() {
        let dir = TempDir::new().unwrap();
        let result =
            SegmentFactory::open(dir.path(), &small_config(4), Arc::new(FilePageIo), 10, 3);
        assert!(matches!(result, Err(Error::SegmentNotFound(3))));
    }
}
