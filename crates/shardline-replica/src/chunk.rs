//! Chunks
//!
//! A chunk collects record payloads for one shard until it is full or old
//! enough, then becomes a single log entry. One log append per chunk keeps
//! the write path cheap and gives LZ4 enough data to compress well.
//!
//! ## Wire Format
//!
//! ```text
//! ┌────────────────┬──────────────────────────────────────────┐
//! │ CRC32 (4, LE)  │ LZ4 block, uncompressed size prepended   │
//! └────────────────┴──────────────────────────────────────────┘
//!
//! Uncompressed body:
//! ┌──────────────┬───────────────┬─────────┬───────────────┬─────────┬───
//! │ count varint │ len_0 varint  │ bytes_0 │ len_1 varint  │ bytes_1 │ ...
//! └──────────────┴───────────────┴─────────┴───────────────┴─────────┴───
//! ```
//!
//! The checksum covers the compressed bytes, so corruption is caught before
//! anything is decompressed.
//!
//! ## Size Limit
//!
//! A chunk may be given a byte limit, normally the log's data page size.
//! Records are admitted only while the worst-case marshalled size (LZ4's
//! bound on incompressible input) stays within it, so a marshalled chunk
//! always fits in one log entry.

use bytes::{BufMut, Bytes, BytesMut};
use shardline_core::varint::{
    decode_varint_u64, encode_varint_u64, get_length_prefixed, put_length_prefixed,
    MAX_VARINT_LEN,
};
use shardline_core::Record;

use crate::error::{Error, Result};

const CHECKSUM_LEN: usize = 4;
const SIZE_PREFIX_LEN: usize = 4;

/// Decompressed chunks larger than this are rejected as corrupt
pub const MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

/// Upper bound on the marshalled size of a body of `body_len` bytes
pub fn marshalled_bound(body_len: usize) -> usize {
    CHECKSUM_LEN + SIZE_PREFIX_LEN + lz4_flex::block::get_maximum_output_size(body_len)
}

/// Bounded buffer of record payloads
#[derive(Debug)]
pub struct Chunk {
    capacity: usize,
    max_bytes: usize,
    records: Vec<Bytes>,
    /// Worst-case body size of the buffered records
    body_bound: usize,
    body: BytesMut,
}

impl Chunk {
    /// A chunk limited only by record count and [`MAX_CHUNK_BYTES`]
    pub fn new(capacity: usize) -> Self {
        Self::with_max_bytes(capacity, usize::MAX)
    }

    /// A chunk whose marshalled form never exceeds `max_bytes`
    pub fn with_max_bytes(capacity: usize, max_bytes: usize) -> Self {
        Self {
            capacity,
            max_bytes,
            records: Vec::with_capacity(capacity),
            body_bound: MAX_VARINT_LEN,
            body: BytesMut::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Records currently buffered
    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() == self.capacity
    }

    pub fn records(&self) -> &[Bytes] {
        &self.records
    }

    fn within_limits(&self, body_bound: usize) -> bool {
        body_bound <= MAX_CHUNK_BYTES && marshalled_bound(body_bound) <= self.max_bytes
    }

    /// Whether `record` fits next to the records already buffered
    pub fn fits(&self, record: &Record) -> bool {
        self.within_limits(self.body_bound.saturating_add(record.encoded_len()))
    }

    /// Whether `record` would fit in an empty chunk
    pub fn fits_empty(&self, record: &Record) -> bool {
        self.within_limits(MAX_VARINT_LEN.saturating_add(record.encoded_len()))
    }

    /// Add a record's payload.
    ///
    /// Fails with `ChunkFull` once the chunk holds `capacity` records or the
    /// record would push it past its byte limit, and with `RecordTooLarge`
    /// if the record does not fit even in an empty chunk.
    pub fn push(&mut self, record: Record) -> Result<()> {
        if !self.fits_empty(&record) {
            return Err(Error::RecordTooLarge {
                len: record.encoded_len(),
                limit: self.max_bytes.min(MAX_CHUNK_BYTES),
            });
        }
        if self.is_full() || !self.fits(&record) {
            return Err(Error::ChunkFull {
                capacity: self.capacity,
            });
        }
        self.body_bound += record.encoded_len();
        self.records.push(record.payload);
        Ok(())
    }

    /// Encode, compress and checksum the buffered records.
    ///
    /// The chunk keeps its records; call [`reset`](Self::reset) afterwards.
    pub fn marshal(&mut self) -> Bytes {
        self.body.clear();
        encode_varint_u64(&mut self.body, self.records.len() as u64);
        for record in &self.records {
            put_length_prefixed(&mut self.body, record);
        }
        debug_assert!(self.body.len() <= self.body_bound);

        let compressed = lz4_flex::compress_prepend_size(&self.body);
        let crc = crc32fast::hash(&compressed);

        let mut out = BytesMut::with_capacity(CHECKSUM_LEN + compressed.len());
        out.put_u32_le(crc);
        out.put_slice(&compressed);
        out.freeze()
    }

    /// Drop the buffered records, keeping the allocations
    pub fn reset(&mut self) {
        self.records.clear();
        self.body.clear();
        self.body_bound = MAX_VARINT_LEN;
    }
}

/// Verify and unpack a marshalled chunk into its record payloads
pub fn decode_chunk(data: &[u8]) -> Result<Vec<Bytes>> {
    if data.len() < CHECKSUM_LEN + SIZE_PREFIX_LEN {
        return Err(Error::Corrupted(format!("chunk of {} bytes is too short", data.len())));
    }

    let (header, compressed) = data.split_at(CHECKSUM_LEN);
    let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let actual = crc32fast::hash(compressed);
    if expected != actual {
        return Err(Error::Corrupted(format!(
            "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
        )));
    }

    let declared =
        u32::from_le_bytes([compressed[0], compressed[1], compressed[2], compressed[3]]) as usize;
    if declared > MAX_CHUNK_BYTES {
        return Err(Error::Corrupted(format!(
            "declared size {declared} exceeds {MAX_CHUNK_BYTES}"
        )));
    }

    let body = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| Error::Compression(e.to_string()))?;
    let mut body = Bytes::from(body);

    let count = decode_varint_u64(&mut body)?;
    // Every record takes at least one length byte
    if count > body.len() as u64 {
        return Err(Error::Corrupted(format!(
            "record count {count} exceeds body of {} bytes",
            body.len()
        )));
    }

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(get_length_prefixed(&mut body)?);
    }
    if !body.is_empty() {
        return Err(Error::Corrupted(format!(
            "{} trailing bytes after {count} records",
            body.len()
        )));
    }
    Ok(records)
}
