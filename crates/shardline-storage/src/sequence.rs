//! Replica Sequences
//!
//! The receiving side of a replication stream tracks two positions per
//! `(database, shard, endpoint)`:
//!
//! - **head**: next sequence it expects to receive
//! - **ack**: next sequence not yet durably applied
//!
//! Only `ack` is persisted, as an 8-byte little-endian page at
//! `<dir>/<database>/<shard>/<endpoint>/0.seq`. On restart both positions
//! start from the persisted ack, so anything received but not applied
//! before the crash is requested again from the sender.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::page::{FilePageIo, MappedPage, PageFactory, PageIo};

const SEQUENCE_SUFFIX: &str = "seq";
const SEQUENCE_PAGE_SIZE: usize = 8;

/// Persisted receive/apply positions of one replication stream
pub struct Sequence {
    head_seq: AtomicI64,
    ack_seq: AtomicI64,
    synced: AtomicBool,
    fresh: AtomicBool,
    pages: PageFactory,
    page: Arc<MappedPage>,
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("head_seq", &self.head_seq())
            .field("ack_seq", &self.ack_seq())
            .field("synced", &self.synced())
            .finish()
    }
}

impl Sequence {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_io(dir, Arc::new(FilePageIo))
    }

    pub fn open_with_io(dir: impl Into<PathBuf>, io: Arc<dyn PageIo>) -> Result<Self> {
        let pages = PageFactory::with_io(dir, SEQUENCE_SUFFIX, SEQUENCE_PAGE_SIZE, io)?;
        let existed = pages.get_page(0).is_some();
        let page = pages.acquire_page(0)?;
        let ack = if existed { page.read_i64(0)? } else { 0 };

        Ok(Self {
            head_seq: AtomicI64::new(ack),
            ack_seq: AtomicI64::new(ack),
            synced: AtomicBool::new(false),
            fresh: AtomicBool::new(!existed),
            pages,
            page,
        })
    }

    pub fn head_seq(&self) -> i64 {
        self.head_seq.load(Ordering::Acquire)
    }

    pub fn set_head_seq(&self, seq: i64) {
        self.head_seq.store(seq, Ordering::Release);
    }

    pub fn ack_seq(&self) -> i64 {
        self.ack_seq.load(Ordering::Acquire)
    }

    /// Record `seq` as durably applied. Head is raised to match if needed.
    pub fn set_ack_seq(&self, seq: i64) {
        if self.ack_seq.swap(seq, Ordering::AcqRel) != seq {
            self.synced.store(false, Ordering::Release);
        }
        self.head_seq.fetch_max(seq, Ordering::AcqRel);
    }

    /// Persist the ack position
    pub fn sync(&self) -> Result<()> {
        self.page.write_i64(0, self.ack_seq())?;
        self.page.sync()?;
        self.synced.store(true, Ordering::Release);
        self.fresh.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether the ack position has been persisted since it last changed
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn reset_synced(&self) {
        self.synced.store(false, Ordering::Release);
    }

    /// True until the first sync of a sequence that had no file on disk
    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.pages.close();
    }
}

/// Identity of one replication stream on the receiving side
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceKey {
    pub database: String,
    pub shard: u32,
    pub endpoint: String,
}

/// Lazily opened [`Sequence`]s under one directory
pub struct SequenceManager {
    dir: PathBuf,
    io: Arc<dyn PageIo>,
    sequences: RwLock<HashMap<SequenceKey, Arc<Sequence>>>,
}

impl SequenceManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_io(dir, Arc::new(FilePageIo))
    }

    pub fn with_io(dir: impl Into<PathBuf>, io: Arc<dyn PageIo>) -> Self {
        Self {
            dir: dir.into(),
            io,
            sequences: RwLock::new(HashMap::new()),
        }
    }

    fn sequence_dir(&self, key: &SequenceKey) -> PathBuf {
        self.dir
            .join(path_component(&key.database))
            .join(key.shard.to_string())
            .join(path_component(&key.endpoint))
    }

    /// Return the sequence for a stream, opening its file on first use
    pub fn get_or_create(&self, database: &str, shard: u32, endpoint: &str) -> Result<Arc<Sequence>> {
        let key = SequenceKey {
            database: database.to_string(),
            shard,
            endpoint: endpoint.to_string(),
        };

        {
            let sequences = self.sequences.read();
            if let Some(sequence) = sequences.get(&key) {
                return Ok(Arc::clone(sequence));
            }
        }

        let mut sequences = self.sequences.write();

        // Double-check in case another caller opened it while we waited
        if let Some(sequence) = sequences.get(&key) {
            return Ok(Arc::clone(sequence));
        }

        let sequence = Arc::new(Sequence::open_with_io(
            self.sequence_dir(&key),
            self.io.clone(),
        )?);
        debug!(
            database = %database,
            shard,
            endpoint = %endpoint,
            ack_seq = sequence.ack_seq(),
            "Opened replica sequence"
        );
        sequences.insert(key, Arc::clone(&sequence));
        Ok(sequence)
    }

    pub fn get(&self, database: &str, shard: u32, endpoint: &str) -> Option<Arc<Sequence>> {
        let key = SequenceKey {
            database: database.to_string(),
            shard,
            endpoint: endpoint.to_string(),
        };
        self.sequences.read().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.sequences.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sync every sequence, returning the first failure
    pub fn sync_all(&self) -> Result<()> {
        let mut result = Ok(());
        for (key, sequence) in self.sequences.read().iter() {
            if let Err(e) = sequence.sync() {
                warn!(
                    database = %key.database,
                    shard = key.shard,
                    endpoint = %key.endpoint,
                    error = %e,
                    "Failed to sync replica sequence"
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn close(&self) {
        if let Err(e) = self.sync_all() {
            warn!(dir = %self.dir.display(), error = %e, "Closing with unsynced sequences");
        }
        let sequences = self.sequences.read();
        for sequence in sequences.values() {
            sequence.close();
        }
        info!(dir = %self.dir.display(), sequences = sequences.len(), "Closed sequence manager");
    }
}

/// Map a name to a single path component.
///
/// Bytes outside `[A-Za-z0-9.-]` are written as `%XX`, so distinct names
/// never share a directory. The empty name and the dot names, which cannot
/// be used as-is, map to forms no other name produces.
pub fn path_component(name: &str) -> String {
    match name {
        "" => return "%".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }

    let mut component = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' => component.push(byte as char),
            _ => component.push_str(&format!("%{byte:02X}")),
        }
    }
    component
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_sequence_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let sequence = Sequence::open(dir.path()).unwrap();

        assert_eq!(sequence.head_seq(), 0);
        assert_eq!(sequence.ack_seq(), 0);
        assert!(sequence.is_fresh());
        assert!(!sequence.synced());

        sequence.sync().unwrap();
        assert!(!sequence.is_fresh());
        assert!(sequence.synced());
    }

    #[test]
    fn test_restart_from_persisted_ack() {
        let dir = TempDir::new().unwrap();
        {
            let sequence = Sequence::open(dir.path()).unwrap();
            sequence.set_head_seq(9);
            sequence.set_ack_seq(5);
            sequence.sync().unwrap();
            sequence.close();
        }

        let sequence = Sequence::open(dir.path()).unwrap();
        assert_eq!(sequence.head_seq(), 5);
        assert_eq!(sequence.ack_seq(), 5);
        assert!(!sequence.synced());
        assert!(!sequence.is_fresh());

        sequence.sync().unwrap();
        assert!(sequence.synced());
    }

    #[test]
    fn test_ack_change_clears_synced() {
        let dir = TempDir::new().unwrap();
        let sequence = Sequence::open(dir.path()).unwrap();
        sequence.set_ack_seq(3);
        sequence.sync().unwrap();

        sequence.set_ack_seq(3);
        assert!(sequence.synced());
        sequence.set_ack_seq(4);
        assert!(!sequence.synced());
        assert_eq!(sequence.head_seq(), 4);

        sequence.sync().unwrap();
        sequence.reset_synced();
        assert!(!sequence.synced());
    }

    #[test]
    fn test_unsynced_ack_is_lost_on_restart() {
        let dir = TempDir::new().unwrap();
        {
            let sequence = Sequence::open(dir.path()).unwrap();
            sequence.set_ack_seq(2);
            sequence.sync().unwrap();
            sequence.set_ack_seq(8);
        }

        let sequence = Sequence::open(dir.path()).unwrap();
        assert_eq!(sequence.ack_seq(), 2);
        assert_eq!(sequence.head_seq(), 2);
    }

    #[test]
    fn test_manager_reuses_sequences() {
        let dir = TempDir::new().unwrap();
        let manager = SequenceManager::new(dir.path());

        let a = manager.get_or_create("metrics", 3, "10.0.0.1:9000").unwrap();
        let b = manager.get_or_create("metrics", 3, "10.0.0.1:9000").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.get("metrics", 4, "10.0.0.1:9000").is_none());
        assert_eq!(manager.len(), 1);

        assert!(dir.path().join("metrics/3/10.0.0.1%3A9000/0.seq").exists());
    }

    #[test]
    fn test_manager_restores_after_close() {
        let dir = TempDir::new().unwrap();
        {
            let manager = SequenceManager::new(dir.path());
            let sequence = manager.get_or_create("db", 0, "node-a").unwrap();
            sequence.set_ack_seq(42);
            manager.close();
        }

        let manager = SequenceManager::new(dir.path());
        let sequence = manager.get_or_create("db", 0, "node-a").unwrap();
        assert_eq!(sequence.ack_seq(), 42);
        assert!(!sequence.is_fresh());
    }

    #[test]
    fn test_concurrent_get_or_create() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(SequenceManager::new(dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || manager.get_or_create("db", 1, "peer").unwrap())
            })
            .collect();
        let sequences: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for sequence in &sequences[1..] {
            assert!(Arc::ptr_eq(&sequences[0], sequence));
        }
    }

    #[test]
    fn test_path_component() {
        assert_eq!(path_component("10.0.0.1:9000"), "10.0.0.1%3A9000");
        assert_eq!(path_component("node-2.local"), "node-2.local");
        assert_eq!(path_component("a/b"), "a%2Fb");
        assert_eq!(path_component("a_b"), "a%5Fb");
        assert_eq!(path_component("%"), "%25");
        assert_eq!(path_component("é"), "%C3%A9");
        assert_eq!(path_component(".."), "%2E%2E");
        assert_eq!(path_component("."), "%2E");
        assert_eq!(path_component(""), "%");
    }

    #[test]
    fn test_path_component_keeps_names_apart() {
        let names = [
            "host:7400", "host_7400", "host%3A7400", "host%5F7400", "a:b", "a_b", "a/b", "",
            "%", ".", "..", "%2E", "_", "__",
        ];
        let mut components: Vec<_> = names.iter().map(|n| path_component(n)).collect();
        components.sort();
        components.dedup();
        assert_eq!(components.len(), names.len());
    }

    #[test]
    fn test_similar_endpoints_get_separate_sequences() {
        let dir = TempDir::new().unwrap();
        {
            let manager = SequenceManager::new(dir.path());
            let colon = manager.get_or_create("db", 0, "host:7400").unwrap();
            let underscore = manager.get_or_create("db", 0, "host_7400").unwrap();
            colon.set_ack_seq(7);
            underscore.set_ack_seq(3);
            manager.close();
        }

        let manager = SequenceManager::new(dir.path());
        assert_eq!(manager.get_or_create("db", 0, "host:7400").unwrap().ack_seq(), 7);
        assert_eq!(manager.get_or_create("db", 0, "host_7400").unwrap().ack_seq(), 3);
    }
}
