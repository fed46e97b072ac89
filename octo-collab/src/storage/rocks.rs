//! RocksDB-backed durable tier.
//!
//! Column families:
//! - `spaces`: graph document rows, keyed by document id
//! - `notes`:  log document rows, keyed by document id
//!
//! Values are `DurableRecord<P>` encoded with bincode and LZ4 compressed.
//! Repository calls run on tokio's blocking pool, so a slow read or fsync
//! never stalls a runtime worker.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Options, SingleThreaded, WriteOptions,
};

use super::repository::{DocumentRepository, DurableRecord};
use super::{unix_now, StoreError, StoredPayload};
use crate::codec::{GraphPayload, LogPayload};
use crate::identity::DocumentKind;

const CF_SPACES: &str = "spaces";
const CF_NOTES: &str = "notes";

const COLUMN_FAMILIES: &[&str] = &[CF_SPACES, CF_NOTES];

type Db = DBWithThreadMode<SingleThreaded>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every content write (default: true, teardown flushes must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("octo_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

fn cf_name(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Graph => CF_SPACES,
        DocumentKind::Log => CF_NOTES,
    }
}

/// Shared RocksDB instance holding both document tables.
pub struct DocumentStore {
    db: Arc<Db>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config, &cache)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn cf_options(config: &StoreConfig, cache: &Cache) -> Options {
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(f64::from(config.bloom_filter_bits), false);

        let mut opts = Options::default();
        opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn spaces(&self) -> RocksRepository<GraphPayload> {
        RocksRepository::new(Arc::clone(&self.db), self.config.sync_writes)
    }

    pub fn notes(&self) -> RocksRepository<LogPayload> {
        RocksRepository::new(Arc::clone(&self.db), self.config.sync_writes)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

/// Durable repository for one payload type over a shared [`DocumentStore`].
pub struct RocksRepository<P> {
    db: Arc<Db>,
    sync_writes: bool,
    _payload: PhantomData<fn() -> P>,
}

impl<P: StoredPayload> RocksRepository<P> {
    fn new(db: Arc<Db>, sync_writes: bool) -> Self {
        Self {
            db,
            sync_writes,
            _payload: PhantomData,
        }
    }

    /// Create or replace a row. Used by the CRUD side and by tests.
    pub fn insert(&self, record: &DurableRecord<P>) -> Result<(), StoreError> {
        let cf = column_family::<P>(&self.db)?;
        put(&self.db, cf, record, self.sync_writes)
    }

    /// Run `op` against the database on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Db, &ColumnFamily) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let cf = column_family::<P>(&db)?;
            op(&db, cf)
        })
        .await
        .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl<P: StoredPayload> DocumentRepository<P> for RocksRepository<P> {
    async fn exists_by_id(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_owned();
        self.blocking(move |db, cf| Ok(db.get_pinned_cf(cf, id.as_bytes())?.is_some()))
            .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<DurableRecord<P>>, StoreError> {
        let id = id.to_owned();
        self.blocking(move |db, cf| load(db, cf, &id)).await
    }

    async fn update_content(&self, id: &str, content: &P) -> Result<(), StoreError> {
        let id = id.to_owned();
        let content = content.clone();
        let sync_writes = self.sync_writes;
        self.blocking(move |db, cf| {
            let mut record: DurableRecord<P> =
                load(db, cf, &id)?.ok_or_else(|| StoreError::NotFound(format!("{}:{id}", P::KIND)))?;
            record.content = Some(content);
            record.updated_at = unix_now();
            put(db, cf, &record, sync_writes)
        })
        .await
    }
}

fn column_family<P: StoredPayload>(db: &Db) -> Result<&ColumnFamily, StoreError> {
    let name = cf_name(P::KIND);
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
}

fn load<P: StoredPayload>(db: &Db, cf: &ColumnFamily, id: &str) -> Result<Option<DurableRecord<P>>, StoreError> {
    match db.get_cf(cf, id.as_bytes())? {
        Some(bytes) => decode_record(&bytes).map(Some),
        None => Ok(None),
    }
}

fn put<P: StoredPayload>(
    db: &Db,
    cf: &ColumnFamily,
    record: &DurableRecord<P>,
    sync_writes: bool,
) -> Result<(), StoreError> {
    let value = encode_record(record)?;
    let mut write_opts = WriteOptions::default();
    write_opts.set_sync(sync_writes);
    db.put_cf_opt(cf, record.id.as_bytes(), value, &write_opts)?;
    Ok(())
}

fn encode_record<P: StoredPayload>(record: &DurableRecord<P>) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_record<P: StoredPayload>(bytes: &[u8]) -> Result<DurableRecord<P>, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}
