//! Durable snapshot cache.
//!
//! Column families:
//! - `snapshots`: latest whiteboard / code / media blob per session (LZ4)
//! - `metadata` : sizes and write time per entry (bincode)
//!
//! Keys are `<session_id:8 bytes big-endian><slot:1 byte>`, so every slot of
//! one session sits next to the others.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::{Result, SyncError};
use crate::protocol::SessionId;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// What a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheSlot {
    Whiteboard,
    Code,
    /// Mute / camera preferences.
    Media,
}

impl CacheSlot {
    fn tag(self) -> u8 {
        match self {
            CacheSlot::Whiteboard => 1,
            CacheSlot::Code => 2,
            CacheSlot::Media => 3,
        }
    }
}

/// Snapshot storage keyed by session and slot.
pub trait SnapshotCache: Send + Sync {
    fn load(&self, session: SessionId, slot: CacheSlot) -> Result<Option<Vec<u8>>>;

    fn store(&self, session: SessionId, slot: CacheSlot, bytes: &[u8]) -> Result<()>;

    fn evict(&self, session: SessionId, slot: CacheSlot) -> Result<()>;
}

/// Read a JSON entry. A corrupt entry reads as absent.
pub fn load_json<T: DeserializeOwned>(cache: &dyn SnapshotCache, session: SessionId, slot: CacheSlot) -> Result<Option<T>> {
    let Some(bytes) = cache.load(session, slot)? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            log::warn!("Ignoring unreadable {slot:?} cache entry for session {session}: {e}");
            Ok(None)
        }
    }
}

pub fn store_json<T: Serialize>(cache: &dyn SnapshotCache, session: SessionId, slot: CacheSlot, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    cache.store(session, slot, &bytes)
}

// ─── In-memory ───────────────────────────────────────────────────────

/// Process-local cache for tests and clients without a cache directory.
#[derive(Default)]
pub struct MemorySnapshotCache {
    entries: RwLock<HashMap<(SessionId, CacheSlot), Vec<u8>>>,
}

impl MemorySnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotCache for MemorySnapshotCache {
    fn load(&self, session: SessionId, slot: CacheSlot) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| SyncError::Cache("cache lock poisoned".into()))?;
        Ok(entries.get(&(session, slot)).cloned())
    }

    fn store(&self, session: SessionId, slot: CacheSlot, bytes: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| SyncError::Cache("cache lock poisoned".into()))?;
        entries.insert((session, slot), bytes.to_vec());
        Ok(())
    }

    fn evict(&self, session: SessionId, slot: CacheSlot) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| SyncError::Cache("cache lock poisoned".into()))?;
        entries.remove(&(session, slot));
        Ok(())
    }
}

// ─── RocksDB ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files (default: 128)
    pub max_open_files: i32,
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 128,
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 32,
            ..Self::new(path)
        }
    }
}

/// Bookkeeping stored beside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub session_id: SessionId,
    pub slot: CacheSlot,
    pub raw_size: u64,
    pub compressed_size: u64,
    /// Unix seconds
    pub updated_at: i64,
}

impl EntryMetadata {
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| SyncError::Cache(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Cache(e.to_string()))?;
        Ok(meta)
    }
}

pub struct RocksSnapshotCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
}

impl RocksSnapshotCache {
    /// Open (or create) the cache at `config.path`.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, descriptors)?;
        log::debug!("Snapshot cache opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &CacheConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    pub fn metadata(&self, session: SessionId, slot: CacheSlot) -> Result<Option<EntryMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, Self::key(session, slot))? {
            Some(bytes) => Ok(Some(EntryMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Sessions with at least one cached entry, ascending.
    pub fn sessions(&self) -> Result<Vec<SessionId>> {
        let cf = self.cf(CF_METADATA)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() != 9 {
                continue;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[..8]);
            let session = u64::from_be_bytes(buf);
            if sessions.last() != Some(&session) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SyncError::Cache(format!("column family '{name}' not found")))
    }

    fn key(session: SessionId, slot: CacheSlot) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[..8].copy_from_slice(&session.to_be_bytes());
        key[8] = slot.tag();
        key
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl SnapshotCache for RocksSnapshotCache {
    fn load(&self, session: SessionId, slot: CacheSlot) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, Self::key(session, slot))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| SyncError::Cache(e.to_string())),
            None => Ok(None),
        }
    }

    fn store(&self, session: SessionId, slot: CacheSlot, bytes: &[u8]) -> Result<()> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(bytes);
        let meta = EntryMetadata {
            session_id: session,
            slot,
            raw_size: bytes.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: chrono::Utc::now().timestamp(),
        };

        let key = Self::key(session, slot);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, key, &compressed);
        batch.put_cf(cf_meta, key, meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn evict(&self, session: SessionId, slot: CacheSlot) -> Result<()> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = Self::key(session, slot);
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_snapshots, key);
        batch.delete_cf(cf_meta, key);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CodeWorkspace;

    fn open_temp() -> (tempfile::TempDir, RocksSnapshotCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = RocksSnapshotCache::open(CacheConfig::for_testing(dir.path().join("cache"))).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_rocks_store_load() {
        let (_dir, cache) = open_temp();
        let payload = br#"{"elements":[],"appState":{}}"#.repeat(50);
        cache.store(7, CacheSlot::Whiteboard, &payload).unwrap();

        assert_eq!(cache.load(7, CacheSlot::Whiteboard).unwrap().unwrap(), payload);
        assert!(cache.load(7, CacheSlot::Code).unwrap().is_none());
        assert!(cache.load(8, CacheSlot::Whiteboard).unwrap().is_none());

        let meta = cache.metadata(7, CacheSlot::Whiteboard).unwrap().unwrap();
        assert_eq!(meta.raw_size, payload.len() as u64);
        assert!(meta.compressed_size < meta.raw_size);
    }

    #[test]
    fn test_rocks_evict() {
        let (_dir, cache) = open_temp();
        cache.store(3, CacheSlot::Code, b"{}").unwrap();
        cache.evict(3, CacheSlot::Code).unwrap();
        assert!(cache.load(3, CacheSlot::Code).unwrap().is_none());
        assert!(cache.metadata(3, CacheSlot::Code).unwrap().is_none());
    }

    #[test]
    fn test_rocks_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        {
            let cache = RocksSnapshotCache::open(CacheConfig::for_testing(&path)).unwrap();
            store_json(&cache, 11, CacheSlot::Code, &CodeWorkspace::starter()).unwrap();
            cache.store(2, CacheSlot::Media, b"{}").unwrap();
        }
        let cache = RocksSnapshotCache::open(CacheConfig::for_testing(&path)).unwrap();
        let restored: CodeWorkspace = load_json(&cache, 11, CacheSlot::Code).unwrap().unwrap();
        assert_eq!(restored, CodeWorkspace::starter());
        assert_eq!(cache.sessions().unwrap(), vec![2, 11]);
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemorySnapshotCache::new();
        assert!(cache.is_empty());
        cache.store(1, CacheSlot::Whiteboard, b"a").unwrap();
        cache.store(1, CacheSlot::Whiteboard, b"b").unwrap();
        assert_eq!(cache.load(1, CacheSlot::Whiteboard).unwrap().unwrap(), b"b");
        assert_eq!(cache.len(), 1);
        cache.evict(1, CacheSlot::Whiteboard).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_corrupt_json_reads_as_absent() {
        let cache = MemorySnapshotCache::new();
        cache.store(1, CacheSlot::Code, b"not json").unwrap();
        let loaded: Option<CodeWorkspace> = load_json(&cache, 1, CacheSlot::Code).unwrap();
        assert!(loaded.is_none());
    }
}
