//! RocksDB-backed room store.
//!
//! Column families:
//! - `documents`: full-state record per room (LZ4 compressed)
//! - `deltas`: appended deltas (LZ4 compressed, keyed by room prefix + sequence)
//! - `metadata`: per-room counters and sizes (bincode)
//! - `rooms`: room directory records (bincode)
//!
//! Room identifiers are arbitrary strings, so delta keys use a length-prefixed
//! room id: `<len:4 bytes BE><room id><seq:8 bytes BE>`. No room's prefix can
//! be a prefix of another room's keys.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{unix_now, DocumentStore, RoomDirectory, RoomRecord, StoreError};
use crate::document::{is_empty_update, merge_updates};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";
const CF_ROOMS: &str = "rooms";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA, CF_ROOMS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Default tuning at the given path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-room bookkeeping stored alongside the full-state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Deltas appended since the last compaction
    pub delta_count: u64,
    /// Uncompressed full-state size in bytes
    pub state_size: u64,
    /// Compressed full-state size in bytes
    pub compressed_size: u64,
    /// Number of completed compactions
    pub compactions: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        let now = unix_now();
        Self {
            room_id: room_id.to_string(),
            delta_count: 0,
            state_size: 0,
            compressed_size: 0,
            compactions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = unix_now();
    }
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| e.to_string())
}

fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| e.to_string())
}

/// RocksDB-backed store.
///
/// Safe for concurrent use across rooms. Appends take their sequence numbers
/// from one store-wide counter, so keys within a room are strictly
/// increasing in append order.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next delta sequence number
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| StoreError::read("*", e))?;

        let sequence = Self::recover_sequence(&db);
        log::info!(
            "Opened room store at {} (next delta sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            closed: AtomicBool::new(false),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed before they reach RocksDB
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA | CF_ROOMS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Many small writes, range-scanned per room
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next sequence number from the highest delta key.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_DELTAS) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut next = 0u64;
        for (key, _) in db.iterator_cf(&cf, IteratorMode::Start).flatten() {
            if let Some(seq) = Self::sequence_of(&key) {
                next = next.max(seq + 1);
            }
        }
        next
    }

    // ─── Full State ───────────────────────────────────────────────────

    /// Load the full-state record alone, without pending deltas.
    pub fn load_snapshot(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS, room)?;
        match self.db.get_cf(&cf, room.as_bytes()).map_err(|e| StoreError::read(room, e))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::read(room, e)),
            None => Ok(None),
        }
    }

    fn put_full_state(
        &self,
        batch: &mut WriteBatch,
        room: &str,
        state: &[u8],
        meta: &mut RoomMetadata,
    ) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS, room)?;
        let compressed = lz4_flex::compress_prepend_size(state);
        meta.state_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        batch.put_cf(&cf_docs, room.as_bytes(), &compressed);
        Ok(())
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// All pending deltas for a room in append order, with their sequence numbers.
    pub fn load_deltas(&self, room: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS, room)?;
        let prefix = Self::room_prefix(room);

        let mut deltas = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::read(room, e))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let seq = Self::sequence_of(&key)
                .ok_or_else(|| StoreError::read(room, "malformed delta key"))?;
            let delta = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::read(room, e))?;
            deltas.push((seq, delta));
        }

        Ok(deltas)
    }

    /// Number of pending deltas for a room.
    pub fn delta_count(&self, room: &str) -> Result<u64, StoreError> {
        Ok(self.load_metadata(room)?.map_or(0, |m| m.delta_count))
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, room: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA, room)?;
        match self.db.get_cf(&cf, room.as_bytes()).map_err(|e| StoreError::read(room, e))? {
            Some(bytes) => decode_record(&bytes)
                .map(Some)
                .map_err(|e| StoreError::read(room, e)),
            None => Ok(None),
        }
    }

    fn metadata_for_write(&self, room: &str) -> Result<RoomMetadata, StoreError> {
        match self.load_metadata(room) {
            Ok(Some(meta)) => Ok(meta),
            Ok(None) => Ok(RoomMetadata::new(room)),
            Err(e) => Err(StoreError::write(room, e)),
        }
    }

    fn put_metadata(
        &self,
        batch: &mut WriteBatch,
        room: &str,
        meta: &RoomMetadata,
    ) -> Result<(), StoreError> {
        let cf_meta = self.cf(CF_METADATA, room)?;
        let bytes = encode_record(meta).map_err(|e| StoreError::write(room, e))?;
        batch.put_cf(&cf_meta, room.as_bytes(), &bytes);
        Ok(())
    }

    /// List every room with stored state.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA, "*")?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::read("*", e))?;
            match String::from_utf8(key.to_vec()) {
                Ok(room) => rooms.push(room),
                Err(_) => log::warn!("Skipping non-UTF-8 room key in metadata"),
            }
        }
        Ok(rooms)
    }

    /// Delete a room's full state, deltas and metadata.
    pub fn delete_room(&self, room: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let cf_docs = self.cf(CF_DOCUMENTS, room)?;
        let cf_meta = self.cf(CF_METADATA, room)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, room.as_bytes());
        batch.delete_cf(&cf_meta, room.as_bytes());
        self.delete_deltas_through(&mut batch, room, u64::MAX)?;

        self.write(batch, room)
    }

    fn delete_deltas_through(
        &self,
        batch: &mut WriteBatch,
        room: &str,
        up_to_seq: u64,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS, room)?;
        let prefix = Self::room_prefix(room);

        let mut count = 0u64;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::write(room, e))?;
            if !key.starts_with(&prefix) {
                break;
            }
            match Self::sequence_of(&key) {
                Some(seq) if seq <= up_to_seq => {
                    batch.delete_cf(&cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }
        Ok(count)
    }

    /// Force memtables of every column family to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name, "*")?;
            self.db
                .flush_cf(&cf)
                .map_err(|e| StoreError::write("*", e))?;
        }
        Ok(())
    }

    /// Next delta sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn write(&self, batch: WriteBatch, room: &str) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .write_opt(batch, &write_opts)
            .map_err(|e| StoreError::write(room, e))
    }

    fn cf(&self, name: &str, room: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or_else(|| StoreError::Read {
            room: room.to_string(),
            reason: format!("column family '{name}' not found"),
        })
    }

    /// `<len:4 bytes BE><room id>`
    fn room_prefix(room: &str) -> Vec<u8> {
        let bytes = room.as_bytes();
        let mut prefix = Vec::with_capacity(4 + bytes.len() + 8);
        prefix.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        prefix.extend_from_slice(bytes);
        prefix
    }

    fn delta_key(room: &str, seq: u64) -> Vec<u8> {
        let mut key = Self::room_prefix(room);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn sequence_of(key: &[u8]) -> Option<u64> {
        if key.len() < 12 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[key.len() - 8..]);
        Some(u64::from_be_bytes(buf))
    }
}

impl DocumentStore for RocksStore {
    fn load_full_state(&self, room: &str) -> Result<Vec<u8>, StoreError> {
        let snapshot = self.load_snapshot(room)?;
        let deltas = self.load_deltas(room)?;

        if deltas.is_empty() {
            return Ok(snapshot.unwrap_or_default());
        }

        let parts = snapshot
            .iter()
            .map(|s| s.as_slice())
            .chain(deltas.iter().map(|(_, d)| d.as_slice()));
        Ok(merge_updates(parts))
    }

    fn append_delta(&self, room: &str, delta: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let cf_deltas = self.cf(CF_DELTAS, room)?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let compressed = lz4_flex::compress_prepend_size(delta);

        let mut meta = self.metadata_for_write(room)?;
        meta.delta_count += 1;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, Self::delta_key(room, seq), &compressed);
        self.put_metadata(&mut batch, room, &meta)?;
        self.write(batch, room)
    }

    fn compact(&self, room: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let to_write = |e: StoreError| match e {
            StoreError::Read { room, reason } => StoreError::Write { room, reason },
            other => other,
        };

        let deltas = self.load_deltas(room).map_err(to_write)?;
        let Some(&(last_seq, _)) = deltas.last() else {
            return Ok(());
        };
        let snapshot = self.load_snapshot(room).map_err(to_write)?;

        let parts = snapshot
            .iter()
            .map(|s| s.as_slice())
            .chain(deltas.iter().map(|(_, d)| d.as_slice()));
        let merged = merge_updates(parts);

        let mut meta = self.metadata_for_write(room)?;
        let mut batch = WriteBatch::default();
        if !is_empty_update(&merged) {
            self.put_full_state(&mut batch, room, &merged, &mut meta)?;
        }
        let removed = self.delete_deltas_through(&mut batch, room, last_seq)?;
        meta.delta_count = meta.delta_count.saturating_sub(removed);
        meta.compactions += 1;
        meta.touch();
        self.put_metadata(&mut batch, room, &meta)?;
        self.write(batch, room)?;

        log::debug!("Compacted {removed} deltas for room '{room}'");
        Ok(())
    }

    fn write_full_state(&self, room: &str, state: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut meta = self.metadata_for_write(room)?;
        meta.touch();

        let mut batch = WriteBatch::default();
        self.put_full_state(&mut batch, room, state, &mut meta)?;
        self.put_metadata(&mut batch, room, &meta)?;
        self.write(batch, room)
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sync()?;
        log::info!("Closed room store at {}", self.config.path.display());
        Ok(())
    }
}

impl RoomDirectory for RocksStore {
    fn create_room(&self, owner_id: Option<String>) -> Result<RoomRecord, StoreError> {
        self.ensure_open()?;
        let record = RoomRecord::generate(owner_id);
        let cf = self.cf(CF_ROOMS, &record.room_id)?;
        let bytes = encode_record(&record).map_err(|e| StoreError::write(&record.room_id, e))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, record.room_id.as_bytes(), &bytes);
        self.write(batch, &record.room_id)?;
        Ok(record)
    }

    fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let cf = self.cf(CF_ROOMS, room_id)?;
        match self
            .db
            .get_cf(&cf, room_id.as_bytes())
            .map_err(|e| StoreError::read(room_id, e))?
        {
            Some(bytes) => decode_record(&bytes)
                .map(Some)
                .map_err(|e| StoreError::read(room_id, e)),
            None => Ok(None),
        }
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
