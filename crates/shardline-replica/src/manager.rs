//! Channel Manager - Routing Writes to Shards
//!
//! A [`ChannelManager`] lazily opens one [`DatabaseChannel`] per database.
//! Each database is split into `shards` channels; a record's shard is a
//! deterministic hash of its grouping key:
//!
//! ```text
//! shard = SipHash(record.key) % shards
//! ```
//!
//! so every record of one series goes through the same channel, log and
//! replicators, and is delivered in write order.
//!
//! ## Directory Layout
//!
//! ```text
//! <directory>/
//! └── <database>/
//!     ├── 0/          FanOutQueue of shard 0
//!     ├── 1/
//!     └── ...
//! ```
//!
//! ## Shutdown
//!
//! [`ChannelManager::close`] cancels the shared token, which stops every
//! replicator and wakes producers blocked on a full handoff, then closes
//! every channel so buffered chunks reach the log before it is closed.

use parking_lot::RwLock;
use shardline_core::Record;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::channel::Channel;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::replicator::ReplicaState;
use crate::transport::StreamFactory;

/// Shard a grouping key routes to
pub fn shard_for_key(key: &[u8], shards: u32) -> u32 {
    let mut hasher = siphasher::sip::SipHasher::new();
    key.hash(&mut hasher);
    let hash = hasher.finish();
    (hash % shards as u64) as u32
}

/// The shard channels of one database
#[derive(Debug)]
pub struct DatabaseChannel {
    database: String,
    channels: Vec<Arc<Channel>>,
}

impl DatabaseChannel {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn shard_count(&self) -> u32 {
        self.channels.len() as u32
    }

    pub fn shard_for(&self, key: &[u8]) -> u32 {
        shard_for_key(key, self.shard_count())
    }

    pub fn channel(&self, shard: u32) -> Result<&Arc<Channel>> {
        self.channels
            .get(shard as usize)
            .ok_or(Error::InvalidShard {
                shard,
                count: self.shard_count(),
            })
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    /// Route a record to its shard's channel
    pub async fn write(&self, record: Record) -> Result<()> {
        let shard = self.shard_for(&record.key);
        self.channel(shard)?.write(record).await
    }

    /// Hand every shard's partial chunk to its writer
    pub async fn flush(&self) -> Result<()> {
        for channel in &self.channels {
            channel.flush().await?;
        }
        Ok(())
    }

    pub fn replica_states(&self) -> Vec<ReplicaState> {
        self.channels
            .iter()
            .flat_map(|channel| channel.replica_states())
            .collect()
    }

    /// Close every shard, returning the first failure after trying all
    async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for channel in &self.channels {
            if let Err(e) = channel.close().await {
                error!(
                    database = %self.database,
                    shard = channel.shard(),
                    error = %e,
                    "Failed to close channel"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

pub struct ChannelManager {
    config: ReplicationConfig,
    factory: Arc<dyn StreamFactory>,
    cancel: CancellationToken,
    databases: RwLock<HashMap<String, Arc<DatabaseChannel>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("directory", &self.config.directory)
            .field("databases", &self.databases.read().len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ChannelManager {
    pub fn new(config: ReplicationConfig, factory: Arc<dyn StreamFactory>) -> Result<Self> {
        Self::with_cancel(config, factory, CancellationToken::new())
    }

    /// Like [`new`](Self::new), stopping when `cancel` (typically the
    /// process-wide token) is cancelled
    pub fn with_cancel(
        config: ReplicationConfig,
        factory: Arc<dyn StreamFactory>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            directory = %config.directory.display(),
            shards = config.shards,
            targets = config.targets.len(),
            "Created channel manager"
        );
        Ok(Self {
            config,
            factory,
            cancel,
            databases: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Return the database's channels, opening every shard on first use.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_or_create(&self, database: &str) -> Result<Arc<DatabaseChannel>> {
        if self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        {
            let databases = self.databases.read();
            if let Some(db) = databases.get(database) {
                return Ok(Arc::clone(db));
            }
        }

        let mut databases = self.databases.write();

        // Double-check in case another writer opened it while we waited
        if let Some(db) = databases.get(database) {
            return Ok(Arc::clone(db));
        }

        let db_cancel = self.cancel.child_token();
        let mut channels = Vec::with_capacity(self.config.shards as usize);
        for shard in 0..self.config.shards {
            match Channel::open(
                database,
                shard,
                &self.config,
                Arc::clone(&self.factory),
                db_cancel.child_token(),
            ) {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    error!(database, shard, error = %e, "Failed to open channel");
                    // Stops the tasks of the shards opened so far
                    db_cancel.cancel();
                    return Err(e);
                }
            }
        }

        let db = Arc::new(DatabaseChannel {
            database: database.to_string(),
            channels,
        });
        databases.insert(database.to_string(), Arc::clone(&db));

        info!(database, shards = self.config.shards, "Opened database channel");
        Ok(db)
    }

    pub fn get(&self, database: &str) -> Result<Arc<DatabaseChannel>> {
        self.databases
            .read()
            .get(database)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))
    }

    /// Open databases, sorted
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<_> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Route a record to its database and shard
    pub async fn write(&self, database: &str, record: Record) -> Result<()> {
        self.get_or_create(database)?.write(record).await
    }

    /// Progress of every replicator, ordered by database, shard and target
    pub fn replica_states(&self) -> Vec<ReplicaState> {
        let databases: Vec<_> = self.databases.read().values().cloned().collect();
        let mut states: Vec<_> = databases
            .iter()
            .flat_map(|db| db.replica_states())
            .collect();
        states.sort_by(|a, b| {
            (&a.database, a.shard, &a.target).cmp(&(&b.database, b.shard, &b.target))
        });
        states
    }

    /// Stop replication, drain every channel into its log and close the
    /// logs. Later writes fail with `Cancelled`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing channel manager");
        self.cancel.cancel();

        let databases: Vec<_> = self.databases.write().drain().map(|(_, db)| db).collect();
        let mut first_error = None;
        for db in &databases {
            if let Err(e) = db.close().await {
                first_error.get_or_insert(e);
            }
        }

        info!(databases = databases.len(), "Closed channel manager");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::decode_chunk;
    use crate::transport::MemoryTransport;
    use bytes::Bytes;
    use shardline_storage::QueueConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ReplicationConfig {
        ReplicationConfig {
            directory: dir.path().to_path_buf(),
            queue: QueueConfig {
                data_page_size: 64 * 1024,
                index_page_size: 8 * 1024,
                gc_interval_ms: 10,
            },
            shards: 4,
            chunk_capacity: 1,
            flush_check_interval_ms: 5,
            shutdown_timeout_ms: 50,
            ..Default::default()
        }
    }

    fn manager(dir: &TempDir) -> ChannelManager {
        ChannelManager::new(config(dir), Arc::new(MemoryTransport::new())).unwrap()
    }

    #[test]
    fn test_shard_for_key_is_deterministic() {
        for key in [&b"cpu,host=a"[..], b"mem,host=b", b""] {
            let shard = shard_for_key(key, 8);
            assert!(shard < 8);
            assert_eq!(shard_for_key(key, 8), shard);
        }
        assert_eq!(shard_for_key(b"anything", 1), 0);
    }

    #[test]
    fn test_shard_for_key_spreads_keys() {
        let mut used = [false; 4];
        for i in 0..100 {
            used[shard_for_key(format!("series-{i}").as_bytes(), 4) as usize] = true;
        }
        assert!(used.iter().all(|u| *u));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = ReplicationConfig {
            shards: 0,
            ..config(&dir)
        };
        assert!(matches!(
            ChannelManager::new(config, Arc::new(MemoryTransport::new())),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let first = manager.get_or_create("metrics").unwrap();
        let second = manager.get_or_create("metrics").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.shard_count(), 4);
        for shard in 0..4 {
            assert!(dir.path().join("metrics").join(shard.to_string()).is_dir());
        }
        assert_eq!(manager.databases(), vec!["metrics".to_string()]);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_database_and_shard() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        assert!(matches!(
            manager.get("metrics"),
            Err(Error::DatabaseNotFound(name)) if name == "metrics"
        ));

        let db = manager.get_or_create("metrics").unwrap();
        assert!(matches!(
            db.channel(4),
            Err(Error::InvalidShard { shard: 4, count: 4 })
        ));

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_routes_by_key() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let key = Bytes::from("cpu,host=a");

        for i in 0..3 {
            manager
                .write("metrics", Record::new(key.clone(), Bytes::from(format!("{i}"))))
                .await
                .unwrap();
        }

        let db = manager.get("metrics").unwrap();
        let shard = db.shard_for(&key);
        let channel = db.channel(shard).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.queue().head_seq() < 3 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        for (seq, expected) in ["0", "1", "2"].into_iter().enumerate() {
            let records = decode_chunk(&channel.queue().get(seq as i64).unwrap()).unwrap();
            assert_eq!(records, vec![Bytes::from(expected)]);
        }
        for other in db.channels().iter().filter(|c| c.shard() != shard) {
            assert_eq!(other.queue().head_seq(), 0);
        }

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.get_or_create("metrics").unwrap();
        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert!(matches!(
            manager
                .write("metrics", Record::new(Bytes::from("k"), Bytes::from("v")))
                .await,
            Err(Error::Cancelled)
        ));
        assert!(manager.databases().is_empty());
    }

    #[tokio::test]
    async fn test_replica_states_cover_every_shard() {
        let dir = TempDir::new().unwrap();
        let config = ReplicationConfig {
            targets: vec!["node-2:7400".to_string(), "node-3:7400".to_string()],
            ..config(&dir)
        };
        let transport = MemoryTransport::new();
        transport.set_available(false);
        let manager = ChannelManager::new(config, Arc::new(transport)).unwrap();
        manager.get_or_create("metrics").unwrap();

        let states = manager.replica_states();
        assert_eq!(states.len(), 8);
        assert_eq!(states[0].shard, 0);
        assert_eq!(states[0].target, "node-2:7400");
        assert_eq!(states[1].target, "node-3:7400");
        assert!(states.iter().all(|s| s.pending == 0 && !s.connected));

        manager.close().await.unwrap();
    }
}
