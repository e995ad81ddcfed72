//! RocksDB persistence for the message table.
//!
//! Column families:
//! - `messages`: bincode-encoded rows keyed by the 16-byte item id
//! - `sequence`: insertion order, big-endian `u64` sequence to item id
//!
//! Creates write both families in one batch. Edits and soft deletes only
//! rewrite the row, so a row keeps its original position across restarts.

use std::path::{Path, PathBuf};

use palaver_core::{ItemId, TimelineItem};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use thiserror::Error;

const CF_MESSAGES: &str = "messages";
const CF_SEQUENCE: &str = "sequence";

const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_SEQUENCE];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory.
    pub path: PathBuf,
    pub block_cache_size: usize,
    /// fsync every write.
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("palaver_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Rows read back by [`MessageStore::open`], in insertion order.
#[derive(Debug, Default)]
pub struct Restored {
    pub rows: Vec<TimelineItem>,
    /// Sequence entries whose row was missing or undecodable.
    pub skipped: usize,
}

pub struct MessageStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    next_sequence: u64,
}

impl MessageStore {
    /// Open (or create) the store and read every stored row back.
    pub fn open(config: StoreConfig) -> Result<(Self, Restored), StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, descriptors)?;

        let mut store = Self {
            db,
            config,
            next_sequence: 0,
        };
        let restored = store.restore()?;
        log::info!(
            "Opened message store at {} ({} rows, {} skipped)",
            store.config.path.display(),
            restored.rows.len(),
            restored.skipped
        );
        Ok((store, restored))
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_MESSAGES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SEQUENCE => {
                // Tiny values, read sequentially on open.
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }
        opts
    }

    /// Walk the sequence family and load each row it points at.
    fn restore(&mut self) -> Result<Restored, StoreError> {
        let messages = self.cf(CF_MESSAGES)?;
        let order = self.cf(CF_SEQUENCE)?;

        let mut restored = Restored::default();
        let mut next_sequence = 0;
        for entry in self.db.iterator_cf(&order, IteratorMode::Start) {
            let (key, value) = entry?;
            if let Some(sequence) = decode_sequence(&key) {
                next_sequence = sequence + 1;
            }

            let Some(id) = decode_id(&value) else {
                log::warn!("Skipping sequence entry with a malformed id ({} bytes)", value.len());
                restored.skipped += 1;
                continue;
            };
            match self.db.get_cf(&messages, id_key(&id))? {
                Some(bytes) => match decode_row(&bytes) {
                    Ok(row) => restored.rows.push(row),
                    Err(e) => {
                        log::warn!("Skipping undecodable row {id}: {e}");
                        restored.skipped += 1;
                    }
                },
                None => {
                    log::warn!("Sequence entry points at missing row {id}");
                    restored.skipped += 1;
                }
            }
        }

        self.next_sequence = next_sequence;
        Ok(restored)
    }

    /// Store a new row at the end of the sequence.
    pub fn insert(&mut self, row: &TimelineItem) -> Result<u64, StoreError> {
        let sequence = self.next_sequence;
        let value = encode_row(row)?;
        {
            let messages = self.cf(CF_MESSAGES)?;
            let order = self.cf(CF_SEQUENCE)?;
            let key = id_key(&row.id);

            let mut batch = WriteBatch::default();
            batch.put_cf(&messages, key, &value);
            batch.put_cf(&order, sequence.to_be_bytes(), key);
            self.db.write_opt(batch, &self.write_options())?;
        }
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Overwrite an existing row in place.
    pub fn update(&self, row: &TimelineItem) -> Result<(), StoreError> {
        let messages = self.cf(CF_MESSAGES)?;
        let value = encode_row(row)?;
        self.db
            .put_cf_opt(&messages, id_key(&row.id), value, &self.write_options())?;
        Ok(())
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }
}

fn id_key(id: &ItemId) -> [u8; 16] {
    id.to_bytes()
}

fn decode_id(bytes: &[u8]) -> Option<ItemId> {
    bytes.try_into().ok().map(ItemId::from_bytes)
}

fn decode_sequence(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

fn encode_row(row: &TimelineItem) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_row(bytes: &[u8]) -> Result<TimelineItem, StoreError> {
    let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(row)
}
