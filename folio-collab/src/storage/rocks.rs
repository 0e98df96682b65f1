//! RocksDB-backed notebook persistence.
//!
//! Column families:
//! - `snapshots`: Full notebook snapshots plus deleted cell ids (bincode, LZ4 compressed)
//! - `ops`      : Checksummed op records, keyed by doc_id:version
//! - `metadata` : Notebook metadata (title, owner, version, timestamps)
//! - `audit`    : Audit trail, keyed by doc_id:sequence

use folio_core::{CellId, Notebook};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

use super::wal::{OpRecord, recover_records};
use folio_core::Operation;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPS: &str = "ops";
const CF_METADATA: &str = "metadata";
const CF_AUDIT: &str = "audit";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPS, CF_METADATA, CF_AUDIT];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory (None = in-memory only)
    pub path: Option<PathBuf>,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every op record (default: true, ops are acknowledged only once durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Operations between snapshot + op compaction
    pub snapshot_every: u64,
    /// Unacknowledged operations a session may lag before it is resynced
    pub max_unacknowledged: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            snapshot_every: 500,
            max_unacknowledged: folio_core::merge::DEFAULT_MAX_UNSEEN,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            snapshot_every: 8,
            max_unacknowledged: 64,
        }
    }

    /// In-memory store with testing limits.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            ..Self::for_testing(PathBuf::new())
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A stored snapshot: the notebook and the cells deleted before it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub notebook: Notebook,
    /// Late operations aimed at these cells are dropped rather than failing.
    pub removed: Vec<CellId>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    notebook: &'a Notebook,
    removed: &'a [CellId],
}

/// Notebook metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookMetadata {
    pub doc_id: Uuid,
    pub title: String,
    pub owner: String,
    /// Latest durably logged version
    pub version: u64,
    /// Version of the stored snapshot
    pub snapshot_version: u64,
    /// Op records currently stored past the snapshot
    pub op_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl NotebookMetadata {
    pub fn new(doc_id: Uuid, title: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            title: title.into(),
            owner: owner.into(),
            version: 0,
            snapshot_version: 0,
            op_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Created,
    Exported,
}

/// One audit trail entry. `details` is a JSON object rendered as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub doc_id: Uuid,
    pub action: AuditAction,
    pub who: String,
    pub timestamp: u64,
    pub details: String,
}

impl AuditEntry {
    pub fn new(doc_id: Uuid, action: AuditAction, who: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            doc_id,
            action,
            who: who.into(),
            timestamp: now_secs(),
            details: details.to_string(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Notebook not found
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Notebook not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Result of reading a notebook's op records back.
#[derive(Debug, Default)]
pub struct RecoveredOps {
    pub ops: Vec<(u64, Operation)>,
    pub corrupted: usize,
}

/// RocksDB-backed notebook database.
///
/// Writes go through atomic batches: an op record always lands together
/// with the metadata version it advances.
pub struct NotebookDb {
    /// Single-threaded mode: column families are fixed at open
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    path: PathBuf,
    /// Next audit sequence number
    audit_sequence: AtomicU64,
}

impl NotebookDb {
    /// Open the database at `config.path`, creating column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| StoreError::DatabaseError("no storage path configured".into()))?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &path, cf_descriptors)?;
        let audit_sequence = Self::recover_audit_sequence(&db);

        Ok(Self {
            db,
            config,
            path,
            audit_sequence: AtomicU64::new(audit_sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPS | CF_AUDIT => {
                // Many small appends, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    fn recover_audit_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_AUDIT) else {
            return 0;
        };
        db.iterator_cf(cf, IteratorMode::Start)
            .filter_map(|item| item.ok())
            .filter(|(key, _)| key.len() == 24)
            .map(|(key, _)| suffix_u64(&key) + 1)
            .max()
            .unwrap_or(0)
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Store a full snapshot and point metadata at its version.
    pub fn save_snapshot(&self, notebook: &Notebook, removed: &[CellId]) -> Result<NotebookMetadata, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let snapshot = SnapshotRef { notebook, removed };
        let encoded = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_metadata(notebook.id)
            .unwrap_or_else(|_| NotebookMetadata::new(notebook.id, notebook.title.clone(), ""));
        meta.version = meta.version.max(notebook.version);
        meta.snapshot_version = notebook.version;
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        let key = notebook.id.as_bytes().to_vec();
        batch.put_cf(&cf_snap, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(meta)
    }

    pub fn load_snapshot(&self, doc_id: Uuid) -> Result<Snapshot, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = self
            .db
            .get_cf(&cf, doc_id.as_bytes())?
            .ok_or(StoreError::NotFound(doc_id))?;
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(snapshot)
    }

    // ─── Op records ───────────────────────────────────────────────────

    /// Durably append a sequenced operation.
    ///
    /// Key format: `<doc_id:16 bytes><version:8 bytes big-endian>`.
    pub fn append_op(&self, doc_id: Uuid, version: u64, op: &Operation) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let record = OpRecord::new(doc_id, version, op)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let value = record
            .encode()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut meta = self.load_metadata(doc_id)?;
        meta.version = version;
        meta.op_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, prefixed_key(doc_id, version), &value);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    /// Verified op records with a version strictly greater than `since`.
    pub fn load_ops_since(&self, doc_id: Uuid, since: u64) -> Result<RecoveredOps, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let start_key = prefixed_key(doc_id, since.saturating_add(1));

        let mut serialized = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            serialized.push(value.to_vec());
        }

        let (ops, corrupted) = recover_records(&serialized);
        Ok(RecoveredOps { ops, corrupted })
    }

    /// Delete op records up to and including `up_to` (folded into a snapshot).
    pub fn compact_ops(&self, doc_id: Uuid, up_to: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let start_key = prefixed_key(doc_id, 0);
        let end_key = prefixed_key(doc_id, up_to.saturating_add(1));

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() || key.as_ref() >= end_key.as_slice() {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            if let Ok(mut meta) = self.load_metadata(doc_id) {
                meta.op_count = meta.op_count.saturating_sub(count);
                batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
            }
            self.db.write(batch)?;
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn save_metadata(&self, meta: &NotebookMetadata) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .put_cf_opt(&cf, meta.doc_id.as_bytes(), meta.encode()?, &self.write_opts())?;
        Ok(())
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<NotebookMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => NotebookMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    /// Metadata of every stored notebook.
    pub fn list_notebooks(&self) -> Result<Vec<NotebookMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut all = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            if key.len() == 16 {
                all.push(NotebookMetadata::decode(&value)?);
            }
        }
        Ok(all)
    }

    // ─── Audit ────────────────────────────────────────────────────────

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let cf = self.cf(CF_AUDIT)?;
        let seq = self.audit_sequence.fetch_add(1, Ordering::SeqCst);
        let value = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.db
            .put_cf_opt(&cf, prefixed_key(entry.doc_id, seq), value, &self.write_opts())?;
        Ok(())
    }

    /// Audit entries for a notebook in the order they were written.
    pub fn load_audit(&self, doc_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let cf = self.cf(CF_AUDIT)?;
        let start_key = prefixed_key(doc_id, 0);
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let (entry, _) = bincode::serde::decode_from_slice(&value, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// `doc_id (16 bytes) + n (8 bytes big-endian)`; sorts by doc then n.
fn prefixed_key(doc_id: Uuid, n: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&n.to_be_bytes());
    key
}

fn suffix_u64(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..24]);
    u64::from_be_bytes(buf)
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{CellKind, OpKind};

    fn open_temp() -> (tempfile::TempDir, NotebookDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = NotebookDb::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, db)
    }

    fn insert_cell(doc_id: Uuid, counter: u64) -> Operation {
        Operation::new(doc_id, Uuid::new_v4(), counter, 0, OpKind::InsertCell {
            cell: Uuid::new_v4(),
            index: 0,
            kind: CellKind::Code,
            content: "SELECT 1".into(),
        })
    }

    #[test]
    fn test_open_requires_path() {
        assert!(NotebookDb::open(StoreConfig::in_memory()).is_err());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, db) = open_temp();
        let mut nb = Notebook::new(Uuid::new_v4(), "Revenue");
        nb.apply_sequenced(&insert_cell(nb.id, 1).kind).unwrap();

        let gone = Uuid::new_v4();
        let meta = db.save_snapshot(&nb, &[gone]).unwrap();
        assert_eq!(meta.snapshot_version, 1);
        assert!(meta.compressed_size > 0);

        let snapshot = db.load_snapshot(nb.id).unwrap();
        assert_eq!(snapshot.notebook, nb);
        assert_eq!(snapshot.removed, vec![gone]);
        assert!(matches!(db.load_snapshot(Uuid::new_v4()), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_ops_append_load_compact() {
        let (_dir, db) = open_temp();
        let doc_id = Uuid::new_v4();
        db.save_metadata(&NotebookMetadata::new(doc_id, "Ops", "ana")).unwrap();

        for v in 1..=5 {
            db.append_op(doc_id, v, &insert_cell(doc_id, v)).unwrap();
        }
        // Records of another document never leak into the scan.
        let other = Uuid::new_v4();
        db.save_metadata(&NotebookMetadata::new(other, "Other", "bo")).unwrap();
        db.append_op(other, 1, &insert_cell(other, 1)).unwrap();

        let recovered = db.load_ops_since(doc_id, 2).unwrap();
        assert_eq!(recovered.corrupted, 0);
        let versions: Vec<u64> = recovered.ops.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, vec![3, 4, 5]);
        assert_eq!(db.load_metadata(doc_id).unwrap().version, 5);

        assert_eq!(db.compact_ops(doc_id, 3).unwrap(), 3);
        assert_eq!(db.load_ops_since(doc_id, 0).unwrap().ops.len(), 2);
        assert_eq!(db.load_metadata(doc_id).unwrap().op_count, 2);
    }

    #[test]
    fn test_append_op_requires_metadata() {
        let (_dir, db) = open_temp();
        let doc_id = Uuid::new_v4();
        assert!(matches!(
            db.append_op(doc_id, 1, &insert_cell(doc_id, 1)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_notebooks() {
        let (_dir, db) = open_temp();
        for title in ["a", "b", "c"] {
            db.save_metadata(&NotebookMetadata::new(Uuid::new_v4(), title, "ana")).unwrap();
        }
        let mut titles: Vec<String> = db.list_notebooks().unwrap().into_iter().map(|m| m.title).collect();
        titles.sort();
        assert_eq!(titles, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_audit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let doc_id = Uuid::new_v4();
        {
            let db = NotebookDb::open(StoreConfig::for_testing(&path)).unwrap();
            db.append_audit(&AuditEntry::new(doc_id, AuditAction::Created, "ana", serde_json::json!({"title": "Q1"})))
                .unwrap();
        }
        let db = NotebookDb::open(StoreConfig::for_testing(&path)).unwrap();
        db.append_audit(&AuditEntry::new(doc_id, AuditAction::Exported, "bo", serde_json::json!({"version": 3})))
            .unwrap();

        let trail = db.load_audit(doc_id).unwrap();
        let actions: Vec<AuditAction> = trail.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Created, AuditAction::Exported]);
        assert!(trail[0].details.contains("Q1"));
    }
}
