// # Database Engine
//
// A database directory holds one heap file per collection, a shared WAL
// and a `meta.db` registry (collection names, entity types, index specs).
// Opening runs recovery: verified WAL records past the latest checkpoint
// are replayed for committed transactions, stale indexes are rebuilt, and
// a fresh checkpoint is appended. A clean close flushes everything and
// truncates the WAL to a single checkpoint; an unclean close simply leaves
// the log for the next open.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collection::{commit_transaction, rollback_transaction, Collection};
use crate::error::{DbError, Result};
use crate::index::IndexKind;
use crate::transaction::recovery::plan_redo;
use crate::transaction::types::IsolationLevel;
use crate::transaction::TransactionManager;
use crate::value::TypeRegistry;
use crate::wal::{TxnId, Wal, WalRecord};
use crate::DbConfig;

const SCHEMA_VERSION: u32 = 1;
const META_FILE: &str = "meta.db";
const WAL_FILE: &str = "wal.log";
const DEFAULT_ENTITY_TYPE: &str = "entity";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionMeta {
    entity_type: String,
    indexes: Vec<(String, IndexKind)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaFile {
    schema_version: u32,
    collections: BTreeMap<String, CollectionMeta>,
}

impl Default for MetaFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            collections: BTreeMap::new(),
        }
    }
}

pub struct Database {
    dir: PathBuf,
    config: DbConfig,
    registry: Arc<TypeRegistry>,
    wal: Arc<Wal>,
    txns: Arc<TransactionManager>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    meta: RwLock<MetaFile>,
    closed: AtomicBool,
}

impl Database {
    /// Open a database directory with an empty type registry.
    pub fn open(dir: impl AsRef<Path>, config: DbConfig) -> Result<Self> {
        Self::open_with_registry(dir, config, TypeRegistry::new())
    }

    /// Open a database directory. The registry is an explicit dependency:
    /// custom value types are resolved through it, never through process
    /// globals.
    pub fn open_with_registry(
        dir: impl AsRef<Path>,
        config: DbConfig,
        registry: TypeRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let meta = Self::read_meta(&dir)?;
        let wal = Arc::new(Wal::open(dir.join(WAL_FILE))?);
        let txns = Arc::new(TransactionManager::new(config.default_isolation));
        let registry = Arc::new(registry);

        let db = Self {
            dir,
            config,
            registry,
            wal,
            txns,
            collections: RwLock::new(HashMap::new()),
            meta: RwLock::new(meta),
            closed: AtomicBool::new(false),
        };

        let names: Vec<String> = db.meta.read().collections.keys().cloned().collect();
        for name in names {
            let collection = db.open_collection_core(&name)?;
            db.collections.write().insert(name, collection);
        }

        db.recover()?;
        Ok(db)
    }

    fn meta_path(dir: &Path) -> PathBuf {
        dir.join(META_FILE)
    }

    fn read_meta(dir: &Path) -> Result<MetaFile> {
        let path = Self::meta_path(dir);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(MetaFile::default()),
        };
        let (meta, _): (MetaFile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        if meta.schema_version != SCHEMA_VERSION {
            return Err(DbError::Corruption(format!(
                "unsupported schema version {}",
                meta.schema_version
            )));
        }
        Ok(meta)
    }

    fn write_meta(&self) -> Result<()> {
        let bytes = {
            let meta = self.meta.read();
            bincode::serde::encode_to_vec(&*meta, bincode::config::standard())?
        };
        std::fs::write(Self::meta_path(&self.dir), bytes)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::NotOpen);
        }
        Ok(())
    }

    fn open_collection_core(&self, name: &str) -> Result<Arc<Collection>> {
        Ok(Arc::new(Collection::open(
            &self.dir,
            name,
            &self.config,
            Arc::clone(&self.wal),
            Arc::clone(&self.txns),
            Arc::clone(&self.registry),
        )?))
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn recover(&self) -> Result<()> {
        let entries = self.wal.records()?;
        let plan = plan_redo(&entries);
        debug!(
            committed = plan.committed.len(),
            ops = plan.ops.len(),
            checkpoint = ?plan.checkpoint_lsn,
            "recovery scan complete"
        );

        // Redo committed operations. A collection named only in the WAL
        // (meta write raced the crash) is registered on the fly.
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for op in &plan.ops {
            let collection = match self.lookup(&op.collection) {
                Some(c) => c,
                None => {
                    warn!(collection = %op.collection, "WAL names an unregistered collection; registering");
                    self.register_collection(&op.collection, DEFAULT_ENTITY_TYPE)?
                }
            };
            collection.recover_apply(op)?;
            touched.insert(op.collection.clone());
        }

        // Replayed state must be durable before the checkpoint makes the
        // log before it unnecessary.
        for name in &touched {
            if let Some(collection) = self.lookup(name) {
                collection.flush()?;
            }
        }

        // Indexes: sidecars stamped with the heap's durable LSN load
        // as-is; anything stale (including every replayed collection) is
        // rebuilt from the locator map.
        let specs: Vec<(String, Vec<(String, IndexKind)>)> = {
            let meta = self.meta.read();
            meta.collections
                .iter()
                .map(|(name, m)| (name.clone(), m.indexes.clone()))
                .collect()
        };
        for (name, index_specs) in specs {
            if index_specs.is_empty() {
                continue;
            }
            if let Some(collection) = self.lookup(&name) {
                collection.load_indexes(&index_specs)?;
            }
        }
        for name in &touched {
            if let Some(collection) = self.lookup(name) {
                collection.flush()?;
            }
        }

        if !plan.ops.is_empty() {
            info!(ops = plan.ops.len(), "recovery replayed committed operations");
        }
        self.append_checkpoint()?;
        Ok(())
    }

    /// Append a CHECKPOINT record. Skipped with a warning while staged
    /// transactions are live, since their earlier records must stay
    /// reachable by the recovery scan.
    fn append_checkpoint(&self) -> Result<()> {
        if self.txns.active_count() > 0 {
            warn!(
                active = self.txns.active_count(),
                "checkpoint skipped: transactions in flight"
            );
            return Ok(());
        }
        let lsn = self.wal.next_lsn();
        self.wal.append_sync(
            0,
            &WalRecord::Checkpoint {
                lsn,
                live_txns: Vec::new(),
                durable_pages: Vec::new(),
            },
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    fn lookup(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    fn register_collection(&self, name: &str, entity_type: &str) -> Result<Arc<Collection>> {
        let collection = self.open_collection_core(name)?;
        self.collections
            .write()
            .insert(name.to_string(), Arc::clone(&collection));
        self.meta.write().collections.insert(
            name.to_string(),
            CollectionMeta {
                entity_type: entity_type.to_string(),
                indexes: Vec::new(),
            },
        );
        self.write_meta()?;
        Ok(collection)
    }

    /// Get or create a collection under the default entity type.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.ensure_open()?;
        if let Some(existing) = self.lookup(name) {
            return Ok(existing);
        }
        self.register_collection(name, DEFAULT_ENTITY_TYPE)
    }

    /// Get or create a collection, checking the registered entity type.
    pub fn open_collection(&self, name: &str, entity_type: &str) -> Result<Arc<Collection>> {
        self.ensure_open()?;
        if let Some(registered) = self
            .meta
            .read()
            .collections
            .get(name)
            .map(|m| m.entity_type.clone())
        {
            if registered != entity_type {
                return Err(DbError::TypeMismatch {
                    collection: name.to_string(),
                    registered,
                    requested: entity_type.to_string(),
                });
            }
            if let Some(existing) = self.lookup(name) {
                return Ok(existing);
            }
        }
        self.register_collection(name, entity_type)
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Record a collection's index specs in the registry so they are
    /// reloaded (or rebuilt) on the next open.
    pub fn persist_index_specs(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let specs = self
            .lookup(name)
            .ok_or_else(|| DbError::NotFound(format!("collection {name}")))?
            .index_specs();
        if let Some(meta) = self.meta.write().collections.get_mut(name) {
            meta.indexes = specs;
        }
        self.write_meta()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin(&self) -> Result<TxnId> {
        self.begin_with(None)
    }

    pub fn begin_with_isolation(&self, isolation: IsolationLevel) -> Result<TxnId> {
        self.begin_with(Some(isolation))
    }

    fn begin_with(&self, isolation: Option<IsolationLevel>) -> Result<TxnId> {
        self.ensure_open()?;
        if !self.config.enable_transactions {
            return Err(DbError::InvalidOperation(
                "explicit transactions are disabled; operations auto-commit".to_string(),
            ));
        }
        Ok(self.txns.begin(isolation))
    }

    pub fn commit(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_open()?;
        let guard = self.collections.read();
        let map: HashMap<String, &Collection> = guard
            .iter()
            .map(|(name, collection)| (name.clone(), collection.as_ref()))
            .collect();
        commit_transaction(&self.txns, &self.wal, &map, txn_id)
    }

    pub fn rollback(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_open()?;
        rollback_transaction(&self.txns, &self.wal, txn_id)
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    // ------------------------------------------------------------------
    // Flush / checkpoint / close
    // ------------------------------------------------------------------

    /// Flush every collection, sync its index specs into the registry, and
    /// fsync the WAL.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let collections = self.collections.read().clone();
        {
            let mut meta = self.meta.write();
            for (name, collection) in &collections {
                if let Some(entry) = meta.collections.get_mut(name) {
                    entry.indexes = collection.index_specs();
                }
            }
        }
        self.write_meta()?;
        for collection in collections.values() {
            collection.flush()?;
        }
        self.wal.sync()
    }

    /// Explicit flush-with-checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        self.flush()?;
        self.append_checkpoint()
    }

    /// Clean close: flush (configurable), checkpoint-truncate the WAL, and
    /// dispose collections. Flush failures are logged and do not abort the
    /// close.
    pub fn close(self) -> Result<()> {
        self.ensure_open()?;

        let collections = self.collections.read().clone();
        let mut flush_ok = true;
        if self.config.auto_flush_on_close {
            if let Err(e) = self.flush() {
                warn!(error = %e, "flush during close failed");
                flush_ok = false;
            }
        }

        // Truncate the log only when everything it covers is durable and
        // no staged transaction still needs its records.
        if flush_ok && self.config.auto_flush_on_close && self.txns.active_count() == 0 {
            self.wal.reset_with_checkpoint(Vec::new(), Vec::new())?;
            for collection in collections.values() {
                if let Err(e) = collection.flush() {
                    warn!(collection = collection.name(), error = %e, "post-truncation flush failed");
                }
            }
        }

        for collection in collections.values() {
            if let Err(e) = collection.dispose() {
                warn!(collection = collection.name(), error = %e, "dispose during close failed");
            }
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.dir)
            .field("collections", &self.collection_names())
            .field("active_txns", &self.txns.active_count())
            .finish()
    }
}
