//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: one JSON record per document, keyed by the document id
//!
//! Records are small JSON objects; the bulk is the base64 replica state in
//! `content`. Blocks are LZ4-compressed by RocksDB itself.
//!
//! Merges are read-modify-write under a process-local lock so concurrent
//! merges into the same record cannot lose fields.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{merge_fields, DocumentRecord, DocumentStore, StoreError};
use crate::ids::DocumentId;

const CF_DOCUMENTS: &str = "documents";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, each save is a durability point)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// RocksDB-backed [`DocumentStore`].
pub struct RocksDocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write merges.
    write_lock: Mutex<()>,
}

impl RocksDocumentStore {
    /// Open the store, creating the database and column family if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf = ColumnFamilyDescriptor::new(CF_DOCUMENTS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![cf],
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    /// All document ids with a stored record.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf()?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(DocumentId::new(String::from_utf8_lossy(&key).into_owned()));
        }
        Ok(ids)
    }

    /// Force buffered writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_DOCUMENTS)
            .ok_or_else(|| StoreError::Unavailable(format!("column family '{CF_DOCUMENTS}' not found")))
    }

    fn read(&self, document: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, document.as_str().as_bytes())? {
            Some(bytes) => serde_json::from_slice::<DocumentRecord>(&bytes)
                .map(Some)
                .map_err(|e| StoreError::CorruptRecord {
                    document: document.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}

impl DocumentStore for RocksDocumentStore {
    fn get(&self, document: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        self.read(document)
    }

    fn merge(&self, document: &DocumentId, fields: DocumentRecord) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("store write lock poisoned".into()))?;

        // An unreadable record is replaced rather than blocking every save.
        let mut record = match self.read(document) {
            Ok(existing) => existing.unwrap_or_default(),
            Err(StoreError::CorruptRecord { reason, .. }) => {
                log::warn!("Overwriting unreadable record for document {document}: {reason}");
                DocumentRecord::new()
            }
            Err(e) => return Err(e),
        };
        merge_fields(&mut record, fields);

        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StoreError::Unavailable(format!("encode record: {e}")))?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(self.cf()?, document.as_str().as_bytes(), bytes, &write_opts)?;
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
