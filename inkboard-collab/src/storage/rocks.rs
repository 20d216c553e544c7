//! RocksDB-backed durable store.
//!
//! Column families:
//! - `chats`: chat records keyed by `<room_id><0x00><id:8 BE>` (prefix-scannable per room)
//! - `shapes`: shape records keyed by `<id:8 BE>` (bincode, LZ4 compressed)
//! - `meta`: id counters (`chat_seq`, `shape_seq`)
//!
//! Every write goes through a single `WriteBatch` together with its counter
//! update, so a record and the id sequence never diverge after a crash.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{unix_now, ChatRecord, ShapeRecord, Storage, StorageError};
use crate::shape::{ShapeFields, ShapeId, ShapePatch};

const CF_CHATS: &str = "chats";
const CF_SHAPES: &str = "shapes";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_CHATS, CF_SHAPES, CF_META];

const KEY_CHAT_SEQ: &[u8] = b"chat_seq";
const KEY_SHAPE_SEQ: &[u8] = b"shape_seq";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("inkboard_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Durable [`Storage`] implementation on RocksDB.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    chat_seq: AtomicU64,
    shape_seq: AtomicU64,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let chat_seq = Self::read_seq(&db, KEY_CHAT_SEQ)?;
        let shape_seq = Self::read_seq(&db, KEY_SHAPE_SEQ)?;
        log::info!(
            "Opened store at {} (chat_seq={chat_seq}, shape_seq={shape_seq})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            chat_seq: AtomicU64::new(chat_seq),
            shape_seq: AtomicU64::new(shape_seq),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are LZ4-compressed by us already
            CF_SHAPES => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    fn read_seq(db: &DBWithThreadMode<SingleThreaded>, key: &[u8]) -> Result<u64, StorageError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StorageError::Database(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(&cf, key)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    // ─── Records ──────────────────────────────────────────────────────

    /// All chats of a room in id order.
    pub fn load_chats(&self, room_id: &str) -> Result<Vec<ChatRecord>, StorageError> {
        let cf = self.cf(CF_CHATS)?;
        let prefix = Self::chat_prefix(room_id);

        let mut chats = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            chats.push(decode_record(&value)?);
        }
        Ok(chats)
    }

    pub fn load_shape(&self, id: ShapeId) -> Result<Option<ShapeRecord>, StorageError> {
        let cf = self.cf(CF_SHAPES)?;
        match self.db.get_cf(&cf, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_shape(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All shapes of a room in id order.
    pub fn load_shapes(&self, room_id: &str) -> Result<Vec<ShapeRecord>, StorageError> {
        let cf = self.cf(CF_SHAPES)?;
        let mut shapes = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let shape = decode_shape(&value)?;
            if shape.room_id == room_id {
                shapes.push(shape);
            }
        }
        Ok(shapes)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn chat_prefix(room_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(room_id.len() + 1);
        key.extend_from_slice(room_id.as_bytes());
        key.push(0);
        key
    }

    fn chat_key(room_id: &str, id: u64) -> Vec<u8> {
        let mut key = Self::chat_prefix(room_id);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn put_shape(&self, batch: &mut WriteBatch, record: &ShapeRecord) -> Result<(), StorageError> {
        let cf = self.cf(CF_SHAPES)?;
        let encoded = encode_record(record)?;
        batch.put_cf(&cf, record.id.to_be_bytes(), lz4_flex::compress_prepend_size(&encoded));
        Ok(())
    }
}

#[async_trait]
impl Storage for RocksStore {
    async fn create_chat(
        &self,
        room_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<ChatRecord, StorageError> {
        let id = self.chat_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ChatRecord {
            id,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            created_at: unix_now(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_CHATS)?, Self::chat_key(room_id, id), encode_record(&record)?);
        batch.put_cf(&self.cf(CF_META)?, KEY_CHAT_SEQ, id.to_be_bytes());
        self.write(batch)?;

        Ok(record)
    }

    async fn create_shape(
        &self,
        room_id: &str,
        user_id: &str,
        fields: &ShapeFields,
    ) -> Result<ShapeRecord, StorageError> {
        let id = self.shape_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ShapeRecord {
            id,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            fields: fields.clone(),
        };

        let mut batch = WriteBatch::default();
        self.put_shape(&mut batch, &record)?;
        batch.put_cf(&self.cf(CF_META)?, KEY_SHAPE_SEQ, id.to_be_bytes());
        self.write(batch)?;

        Ok(record)
    }

    async fn update_shape(
        &self,
        room_id: &str,
        patch: &ShapePatch,
    ) -> Result<ShapeRecord, StorageError> {
        let mut record = match self.load_shape(patch.id)? {
            Some(record) if record.room_id == room_id => record,
            _ => {
                return Err(StorageError::NotFound {
                    room_id: room_id.to_string(),
                    shape_id: patch.id,
                })
            }
        };
        record.fields.apply(patch);

        let mut batch = WriteBatch::default();
        self.put_shape(&mut batch, &record)?;
        self.write(batch)?;
        Ok(record)
    }
}

fn encode_record<T: serde::Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(record)
}

fn decode_shape(bytes: &[u8]) -> Result<ShapeRecord, StorageError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    decode_record(&raw)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StorageError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Serialization("Invalid sequence value".into()))?;
    Ok(u64::from_be_bytes(buf))
}
