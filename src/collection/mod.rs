// # Collection Core
//
// Typed CRUD over one record heap plus its secondary indexes. Every write
// stages in a transaction (caller-supplied or an implicit auto-commit one)
// and reaches the heap only through the commit pipeline at the bottom of
// this file. Reads go through the primary locator map; records handed out
// are deep copies.
//
// Lock order, here and everywhere: commit lock -> per-id locks in
// ascending (collection, id) order -> buffer -> pager. The schema lock
// guards index DDL only and is never taken inside the commit path.

pub mod planner;
pub mod query;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffer::manager::BufferManager;
use crate::cache::FingerprintCache;
use crate::codec::RecordCodec;
use crate::collection::planner::{IndexStats, PlannerContext, QueryPlan};
use crate::collection::query::{Query, QueryOptions, SortOrder};
use crate::error::{DbError, Result};
use crate::index::{IndexKey, IndexKind, IndexManager};
use crate::storage::heap::{RecordHeap, RecordLocator};
use crate::storage::pager::Pager;
use crate::transaction::recovery::{RedoKind, RedoOp};
use crate::transaction::types::{IsolationLevel, TransactionState, WriteOp};
use crate::transaction::TransactionManager;
use crate::value::{Entity, Value};
use crate::wal::{TxnId, Wal, WalRecord};
use crate::DbConfig;

const LOCATOR_FILE_MAGIC: u32 = 0x444C_4F43; // "DLOC"

/// Primary locator entry: where the record lives and its cached version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LocatorEntry {
    locator: RecordLocator,
    version: u64,
}

#[derive(Serialize, Deserialize)]
struct LocatorSnapshot {
    magic: u32,
    last_applied_lsn: u64,
    entries: Vec<(String, LocatorEntry)>,
}

pub struct Collection {
    name: String,
    dir: PathBuf,
    wal: Arc<Wal>,
    txns: Arc<TransactionManager>,
    registry: Arc<crate::value::TypeRegistry>,
    codec: RecordCodec,
    heap: RecordHeap,
    indexes: IndexManager,
    primary: RwLock<HashMap<String, LocatorEntry>>,
    id_locks: DashMap<String, Arc<Mutex<()>>>,
    schema_lock: Mutex<()>,
    plan_cache: FingerprintCache<QueryPlan>,
    result_cache: FingerprintCache<Vec<String>>,
    disposed: AtomicBool,
}

impl Collection {
    pub(crate) fn open(
        dir: &Path,
        name: &str,
        config: &DbConfig,
        wal: Arc<Wal>,
        txns: Arc<TransactionManager>,
        registry: Arc<crate::value::TypeRegistry>,
    ) -> Result<Self> {
        let pager = Arc::new(Pager::open(
            dir.join(format!("{name}.db")),
            config.page_size,
            config.verify_checksums,
        )?);
        let buffer = Arc::new(BufferManager::new(pager, config.buffer_pool_size));
        let heap = RecordHeap::open(buffer)?;

        let collection = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            wal,
            txns,
            registry,
            codec: RecordCodec::new(
                config.compression_level,
                config.encryption.clone(),
                config.max_entity_size,
            ),
            heap,
            indexes: IndexManager::new(dir, name),
            primary: RwLock::new(HashMap::new()),
            id_locks: DashMap::new(),
            schema_lock: Mutex::new(()),
            plan_cache: FingerprintCache::new(&config.plan_cache),
            result_cache: FingerprintCache::new(&config.result_cache),
            disposed: AtomicBool::new(false),
        };

        let durable = collection.heap.durable_lsn()?;
        if collection.load_locator(durable)? {
            collection.heap.load_freespace()?;
        } else {
            // Stale or missing snapshot: rebuild the locator map (and the
            // free-space map as a side effect) from a verified heap scan.
            debug!(collection = name, "rebuilding locator map from heap scan");
            let mut primary = HashMap::new();
            for (locator, bytes) in collection.heap.scan(true)? {
                let entity = collection.codec.decode(&bytes)?;
                primary.insert(
                    entity.id.clone(),
                    LocatorEntry {
                        locator,
                        version: entity.version,
                    },
                );
            }
            *collection.primary.write() = primary;
        }
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DbError::Disposed(self.name.clone()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn get_committed(&self, id: &str) -> Result<Option<Entity>> {
        let entry = match self.primary.read().get(id) {
            Some(entry) => *entry,
            None => return Ok(None),
        };
        let bytes = self.heap.get(entry.locator)?;
        let entity = self.codec.decode(&bytes)?;
        if entity.id != id {
            return Err(DbError::Corruption(format!(
                "locator for {id} points at record {}",
                entity.id
            )));
        }
        Ok(Some(entity))
    }

    pub(crate) fn current_version(&self, id: &str) -> Option<u64> {
        self.primary.read().get(id).map(|e| e.version)
    }

    /// Committed-state read.
    pub fn get(&self, id: &str) -> Result<Option<Entity>> {
        self.ensure_open()?;
        self.get_committed(id)
    }

    /// Transactional read honoring the transaction's isolation level and
    /// its own staged writes.
    pub fn get_in(&self, txn_id: TxnId, id: &str) -> Result<Option<Entity>> {
        self.ensure_open()?;
        let txn_arc = self.txns.get(txn_id)?;
        let mut txn = txn_arc.lock();

        if let Some(own) = txn.own_write(&self.name, id) {
            return Ok(own);
        }
        if txn.uses_snapshot() {
            if let Some(snapshot) = txn.snapshot_get(&self.name, id) {
                return Ok(snapshot.clone());
            }
        }

        let entity = self.get_committed(id)?;
        let version = entity.as_ref().map(|e| e.version).unwrap_or(0);
        txn.record_read(&self.name, id, version);
        if txn.uses_snapshot() {
            txn.snapshot_put(&self.name, id, entity.clone());
        }
        Ok(entity)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.primary.read().contains_key(id))
    }

    pub fn count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.primary.read().len())
    }

    // ------------------------------------------------------------------
    // Staged writes
    // ------------------------------------------------------------------

    /// The entity's version as this transaction sees it: own staged write,
    /// then snapshot, then committed state.
    fn visible_version(
        &self,
        txn: &crate::transaction::types::Transaction,
        id: &str,
    ) -> Option<u64> {
        match txn.own_write(&self.name, id) {
            Some(Some(entity)) => return Some(entity.version),
            Some(None) => return None,
            None => {}
        }
        if txn.uses_snapshot() {
            if let Some(snapshot) = txn.snapshot_get(&self.name, id) {
                return snapshot.as_ref().map(|e| e.version);
            }
        }
        self.current_version(id)
    }

    fn validate_fields(&self, entity: &Entity) -> Result<()> {
        for value in entity.fields.values() {
            self.registry.validate(value)?;
        }
        Ok(())
    }

    fn wal_stage(
        &self,
        txn: &mut crate::transaction::types::Transaction,
        record: &WalRecord,
    ) -> Result<()> {
        if !txn.wal_begun {
            self.wal.append(txn.id, &WalRecord::Begin)?;
            txn.wal_begun = true;
        }
        self.wal.append(txn.id, record)?;
        Ok(())
    }

    /// Stage an insert into an explicit transaction. Fails fast on
    /// duplicate ids; the check is repeated under lock at commit.
    pub fn insert_in(&self, txn_id: TxnId, mut entity: Entity) -> Result<Entity> {
        self.ensure_open()?;
        self.validate_fields(&entity)?;

        let txn_arc = self.txns.get(txn_id)?;
        let mut txn = txn_arc.lock();
        if !txn.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "transaction {txn_id} is not active"
            )));
        }

        if self.visible_version(&txn, &entity.id).is_some() {
            return Err(DbError::DuplicateKey(entity.id));
        }

        entity.version = 1;
        let record = self.codec.encode(&entity)?;
        self.wal_stage(
            &mut txn,
            &WalRecord::Insert {
                collection: self.name.clone(),
                id: entity.id.clone(),
                record: record.clone(),
            },
        )?;
        txn.stage(WriteOp::Insert {
            collection: self.name.clone(),
            id: entity.id.clone(),
            entity: entity.clone(),
            record,
        });
        Ok(entity)
    }

    /// Stage an optimistic update: the new field map replaces the old one,
    /// and `expected_version` must match the version this transaction sees.
    pub fn update_in(
        &self,
        txn_id: TxnId,
        id: &str,
        fields: std::collections::BTreeMap<String, Value>,
        expected_version: u64,
    ) -> Result<Entity> {
        self.ensure_open()?;

        let txn_arc = self.txns.get(txn_id)?;
        let mut txn = txn_arc.lock();
        if !txn.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "transaction {txn_id} is not active"
            )));
        }

        let actual = self
            .visible_version(&txn, id)
            .ok_or_else(|| DbError::NotFound(id.to_string()))?;
        if actual != expected_version {
            return Err(DbError::ConcurrencyConflict {
                id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let mut entity = Entity::with_id(id, fields);
        entity.version = expected_version + 1;
        self.validate_fields(&entity)?;
        let record = self.codec.encode(&entity)?;
        self.wal_stage(
            &mut txn,
            &WalRecord::Update {
                collection: self.name.clone(),
                id: id.to_string(),
                old_version: expected_version,
                record: record.clone(),
            },
        )?;
        txn.stage(WriteOp::Update {
            collection: self.name.clone(),
            id: id.to_string(),
            expected_version,
            entity: entity.clone(),
            record,
        });
        Ok(entity)
    }

    pub fn upsert_in(&self, txn_id: TxnId, entity: Entity) -> Result<Entity> {
        self.ensure_open()?;
        let version = {
            let txn_arc = self.txns.get(txn_id)?;
            let txn = txn_arc.lock();
            self.visible_version(&txn, &entity.id)
        };
        match version {
            Some(version) => {
                let id = entity.id.clone();
                self.update_in(txn_id, &id, entity.fields, version)
            }
            None => self.insert_in(txn_id, entity),
        }
    }

    pub fn delete_in(&self, txn_id: TxnId, id: &str) -> Result<()> {
        self.ensure_open()?;

        let txn_arc = self.txns.get(txn_id)?;
        let mut txn = txn_arc.lock();
        if !txn.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "transaction {txn_id} is not active"
            )));
        }
        if self.visible_version(&txn, id).is_none() {
            return Err(DbError::NotFound(id.to_string()));
        }

        self.wal_stage(
            &mut txn,
            &WalRecord::Delete {
                collection: self.name.clone(),
                id: id.to_string(),
            },
        )?;
        txn.stage(WriteOp::Delete {
            collection: self.name.clone(),
            id: id.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Auto-commit surface
    // ------------------------------------------------------------------

    fn finish_auto<T>(&self, txn_id: TxnId, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                let collections = HashMap::from([(self.name.clone(), self)]);
                commit_transaction(&self.txns, &self.wal, &collections, txn_id)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = rollback_transaction(&self.txns, &self.wal, txn_id) {
                    warn!(txn_id, error = %rollback_err, "rollback after failed stage");
                }
                Err(e)
            }
        }
    }

    pub fn insert(&self, entity: Entity) -> Result<Entity> {
        let txn_id = self.txns.begin(None);
        let result = self.insert_in(txn_id, entity);
        self.finish_auto(txn_id, result)
    }

    /// Insert a batch atomically: one implicit transaction, all or nothing.
    pub fn insert_many(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        let txn_id = self.txns.begin(None);
        let result = entities
            .into_iter()
            .map(|e| self.insert_in(txn_id, e))
            .collect::<Result<Vec<_>>>();
        self.finish_auto(txn_id, result)
    }

    pub fn update(
        &self,
        id: &str,
        fields: std::collections::BTreeMap<String, Value>,
        expected_version: u64,
    ) -> Result<Entity> {
        let txn_id = self.txns.begin(None);
        let result = self.update_in(txn_id, id, fields, expected_version);
        self.finish_auto(txn_id, result)
    }

    pub fn upsert(&self, entity: Entity) -> Result<Entity> {
        let txn_id = self.txns.begin(None);
        let result = self.upsert_in(txn_id, entity);
        self.finish_auto(txn_id, result)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let txn_id = self.txns.begin(None);
        let result = self.delete_in(txn_id, id);
        self.finish_auto(txn_id, result)
    }

    pub fn delete_all(&self) -> Result<usize> {
        let mut ids: Vec<String> = {
            let primary = self.primary.read();
            primary.keys().cloned().collect()
        };
        ids.sort();

        let txn_id = self.txns.begin(None);
        let result = ids
            .iter()
            .try_for_each(|id| self.delete_in(txn_id, id))
            .map(|()| ids.len());
        self.finish_auto(txn_id, result)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn planner_context(&self) -> PlannerContext {
        let mut indexes = HashMap::new();
        for field in self.indexes.fields() {
            if let Some(index) = self.indexes.get(&field) {
                indexes.insert(
                    field,
                    IndexStats {
                        kind: index.kind(),
                        cardinality: index.cardinality(),
                        total: index.total(),
                    },
                );
            }
        }
        PlannerContext {
            indexes,
            entity_count: self.primary.read().len(),
        }
    }

    /// All leaves of the tree probing `field`, skipping negated subtrees.
    fn leaves_for<'q>(query: &'q Query, field: &str, out: &mut Vec<&'q Query>) {
        match query {
            Query::And(children) | Query::Or(children) => {
                for child in children {
                    Self::leaves_for(child, field, out);
                }
            }
            Query::Not(_) => {}
            leaf => {
                if planner::classify(leaf).map(|(f, _)| f == field).unwrap_or(false) {
                    out.push(leaf);
                }
            }
        }
    }

    /// Candidate ids for one indexed field, in index order, already probed
    /// against the primary locator map.
    fn probe_field(&self, query: &Query, field: &str) -> Result<Vec<String>> {
        let index = self
            .indexes
            .get(field)
            .ok_or_else(|| DbError::IndexNotFound(field.to_string()))?;
        let mut leaves = Vec::new();
        Self::leaves_for(query, field, &mut leaves);

        let mut out = Vec::new();
        for leaf in leaves {
            let ids = match leaf {
                Query::Equals { value, .. } => match IndexKey::from_value(value) {
                    Some(key) => index.equals(&key),
                    None => Vec::new(),
                },
                Query::Range {
                    low,
                    high,
                    include_low,
                    include_high,
                    ..
                } => {
                    let low_key = low.as_ref().and_then(IndexKey::from_value);
                    let high_key = high.as_ref().and_then(IndexKey::from_value);
                    index.range(
                        low_key.as_ref(),
                        high_key.as_ref(),
                        *include_low,
                        *include_high,
                    )?
                }
                Query::In { values, .. } => {
                    let keys: Vec<IndexKey> =
                        values.iter().filter_map(IndexKey::from_value).collect();
                    index.keys_in(&keys)
                }
                Query::Prefix { prefix, .. } => index.prefix(prefix)?,
                _ => Vec::new(),
            };
            out.extend(ids);
        }

        // Stale entries are tolerated here and filtered by a locator probe.
        let primary = self.primary.read();
        out.retain(|id| primary.contains_key(id));
        let mut seen = BTreeSet::new();
        out.retain(|id| seen.insert(id.clone()));
        Ok(out)
    }

    fn execute_plan(&self, plan: &QueryPlan, query: &Query) -> Result<Vec<String>> {
        match plan {
            QueryPlan::FullScan => {
                let mut ids: Vec<String> = self.primary.read().keys().cloned().collect();
                ids.sort();
                Ok(ids)
            }
            QueryPlan::IndexEquals { field }
            | QueryPlan::IndexRange { field }
            | QueryPlan::IndexIn { field }
            | QueryPlan::IndexPrefix { field }
            | QueryPlan::IndexProbeResidual { field } => self.probe_field(query, field),
            QueryPlan::IndexIntersection { fields } => {
                let mut iter = fields.iter();
                let first = match iter.next() {
                    Some(f) => f,
                    None => return Ok(Vec::new()),
                };
                let mut ids = self.probe_field(query, first)?;
                for field in iter {
                    let other: BTreeSet<String> =
                        self.probe_field(query, field)?.into_iter().collect();
                    ids.retain(|id| other.contains(id));
                }
                Ok(ids)
            }
            QueryPlan::IndexUnion { fields } => {
                let mut out = Vec::new();
                let mut seen = BTreeSet::new();
                for field in fields {
                    for id in self.probe_field(query, field)? {
                        if seen.insert(id.clone()) {
                            out.push(id);
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Evaluate a query. Whatever plan the optimizer picks, every realized
    /// entity is re-checked against the full predicate, so results are
    /// plan-independent; plans only shape cost and natural ordering.
    pub fn find(&self, query: &Query, options: &QueryOptions) -> Result<Vec<Entity>> {
        self.ensure_open()?;
        let query = query.normalized();
        let literal_fp = query.literal_fingerprint();

        let mut entities: Vec<Entity> = Vec::new();
        let cached = self.result_cache.get(literal_fp);
        match cached {
            Some(ids) => {
                for id in &ids {
                    if let Some(entity) = self.get_committed(id)? {
                        entities.push(entity);
                    }
                }
            }
            None => {
                let structural_fp = query.fingerprint();
                let plan = match self.plan_cache.get(structural_fp) {
                    Some(plan) => plan,
                    None => {
                        let plan = planner::plan(&query, &self.planner_context());
                        self.plan_cache
                            .put(structural_fp, query.fields(), plan.clone());
                        plan
                    }
                };
                debug!(collection = %self.name, ?plan, "executing query");

                let mut ids = Vec::new();
                for id in self.execute_plan(&plan, &query)? {
                    if let Some(entity) = self.get_committed(&id)? {
                        if query.matches(&entity) {
                            ids.push(id);
                            entities.push(entity);
                        }
                    }
                }
                self.result_cache.put(literal_fp, query.fields(), ids);
            }
        }

        if let Some((field, order)) = &options.sort_by {
            entities.sort_by(|a, b| {
                let ka = a.field(field).and_then(IndexKey::from_value);
                let kb = b.field(field).and_then(IndexKey::from_value);
                // Missing keys sort last regardless of direction.
                let ordering = match (ka, kb) {
                    (Some(ka), Some(kb)) => match order {
                        SortOrder::Ascending => ka.cmp(&kb),
                        SortOrder::Descending => kb.cmp(&ka),
                    },
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                ordering.then_with(|| a.id.cmp(&b.id))
            });
        }

        let entities: Vec<Entity> = entities
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(entities)
    }

    // ------------------------------------------------------------------
    // Index DDL
    // ------------------------------------------------------------------

    pub fn create_index(&self, field: &str, kind: IndexKind) -> Result<()> {
        self.ensure_open()?;
        let _schema = self.schema_lock.lock();
        let index = self.indexes.create(field, kind);
        index.clear();

        let ids: Vec<String> = self.primary.read().keys().cloned().collect();
        for id in ids {
            if let Some(entity) = self.get_committed(&id)? {
                if let Some(key) = entity.field(field).and_then(IndexKey::from_value) {
                    index.insert(key, &id);
                }
            }
        }
        self.plan_cache.clear();
        Ok(())
    }

    pub fn drop_index(&self, field: &str) -> Result<()> {
        self.ensure_open()?;
        let _schema = self.schema_lock.lock();
        self.indexes.drop_index(field)?;
        self.plan_cache.clear();
        Ok(())
    }

    pub fn index_specs(&self) -> Vec<(String, IndexKind)> {
        self.indexes.specs()
    }

    // ------------------------------------------------------------------
    // Commit plumbing (called with commit + per-id locks held)
    // ------------------------------------------------------------------

    pub(crate) fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.id_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn top_level_fields(entities: [Option<&Entity>; 2]) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for entity in entities.into_iter().flatten() {
            out.extend(entity.fields.keys().cloned());
        }
        out
    }

    /// Apply one validated committed write to heap, locator map, indexes
    /// and caches.
    pub(crate) fn apply_op(&self, op: &WriteOp) -> Result<()> {
        let touched = match op {
            WriteOp::Insert { id, entity, record, .. } => {
                let locator = self.heap.put(record)?;
                self.primary.write().insert(
                    id.clone(),
                    LocatorEntry {
                        locator,
                        version: entity.version,
                    },
                );
                self.indexes.apply(id, None, Some(entity));
                Self::top_level_fields([None, Some(entity)])
            }
            WriteOp::Update { id, entity, record, .. } => {
                let old_entry = self
                    .primary
                    .read()
                    .get(id)
                    .copied()
                    .ok_or_else(|| DbError::NotFound(id.to_string()))?;
                let old_entity = self.codec.decode(&self.heap.get(old_entry.locator)?)?;
                let locator = self.heap.update(old_entry.locator, record)?;
                self.primary.write().insert(
                    id.clone(),
                    LocatorEntry {
                        locator,
                        version: entity.version,
                    },
                );
                self.indexes.apply(id, Some(&old_entity), Some(entity));
                Self::top_level_fields([Some(&old_entity), Some(entity)])
            }
            WriteOp::Delete { id, .. } => {
                let entry = match self.primary.read().get(id).copied() {
                    Some(entry) => entry,
                    // Deleted concurrently; nothing to redo.
                    None => return Ok(()),
                };
                let old_entity = self.codec.decode(&self.heap.get(entry.locator)?)?;
                self.heap.delete(entry.locator)?;
                self.primary.write().remove(id);
                self.indexes.apply(id, Some(&old_entity), None);
                Self::top_level_fields([Some(&old_entity), None])
            }
        };

        self.plan_cache.invalidate_fields(&touched);
        self.result_cache.invalidate_fields(&touched);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recovery hooks (crash replay; no transactions, no WAL traffic)
    // ------------------------------------------------------------------

    /// Idempotent redo of one committed operation.
    pub(crate) fn recover_apply(&self, op: &RedoOp) -> Result<()> {
        match &op.kind {
            RedoKind::Upsert(bytes) => {
                let entity = self.codec.decode(bytes)?;
                let existing = self.primary.read().get(&op.id).copied();
                let locator = match existing {
                    Some(entry) => self.heap.update(entry.locator, bytes)?,
                    None => self.heap.put(bytes)?,
                };
                self.primary.write().insert(
                    op.id.clone(),
                    LocatorEntry {
                        locator,
                        version: entity.version,
                    },
                );
            }
            RedoKind::Delete => {
                let existing = self.primary.read().get(&op.id).copied();
                if let Some(entry) = existing {
                    self.heap.delete(entry.locator)?;
                    self.primary.write().remove(&op.id);
                }
            }
        }
        Ok(())
    }

    /// Load registered indexes from sidecars; rebuild the stale ones from
    /// the locator map.
    pub(crate) fn load_indexes(&self, specs: &[(String, IndexKind)]) -> Result<()> {
        let heap_lsn = self.heap.durable_lsn()?;
        let stale = self.indexes.load(specs, heap_lsn);
        for field in stale {
            self.rebuild_index(&field)?;
        }
        Ok(())
    }

    fn rebuild_index(&self, field: &str) -> Result<()> {
        let index = self
            .indexes
            .get(field)
            .ok_or_else(|| DbError::IndexNotFound(field.to_string()))?;
        index.clear();
        let ids: Vec<String> = self.primary.read().keys().cloned().collect();
        for id in ids {
            if let Some(entity) = self.get_committed(&id)? {
                if let Some(key) = entity.field(field).and_then(IndexKey::from_value) {
                    index.insert(key, &id);
                }
            }
        }
        debug!(collection = %self.name, field, "rebuilt index");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flush / lifecycle
    // ------------------------------------------------------------------

    fn locator_path(&self) -> PathBuf {
        self.dir.join(format!("{}.loc", self.name))
    }

    fn load_locator(&self, durable_lsn: u64) -> Result<bool> {
        let path = self.locator_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        let decoded: std::result::Result<(LocatorSnapshot, usize), _> =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard());
        let snapshot = match decoded {
            Ok((snapshot, _)) => snapshot,
            Err(e) => {
                warn!(collection = %self.name, error = %e, "locator snapshot unreadable");
                return Ok(false);
            }
        };
        if snapshot.magic != LOCATOR_FILE_MAGIC || snapshot.last_applied_lsn != durable_lsn {
            return Ok(false);
        }
        *self.primary.write() = snapshot.entries.into_iter().collect();
        Ok(true)
    }

    fn persist_locator(&self, durable_lsn: u64) -> Result<()> {
        let entries: Vec<(String, LocatorEntry)> = {
            let primary = self.primary.read();
            primary.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        let snapshot = LocatorSnapshot {
            magic: LOCATOR_FILE_MAGIC,
            last_applied_lsn: durable_lsn,
            entries,
        };
        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
        std::fs::write(self.locator_path(), bytes)?;
        Ok(())
    }

    /// Flush dirty pages, the free-space chain and both sidecars, stamped
    /// with the current WAL position.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let durable_lsn = self.wal.next_lsn().saturating_sub(1);
        self.heap.flush(durable_lsn)?;
        self.indexes.persist(durable_lsn)?;
        self.persist_locator(durable_lsn)?;
        Ok(())
    }

    /// Flush and release. Further operations fail with `Disposed`.
    pub fn dispose(&self) -> Result<()> {
        self.ensure_open()?;
        if let Err(e) = self.flush() {
            warn!(collection = %self.name, error = %e, "flush during dispose failed");
        }
        self.heap.buffer().close()?;
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("count", &self.primary.read().len())
            .field("indexes", &self.indexes.fields())
            .finish()
    }
}

// ----------------------------------------------------------------------
// Commit pipeline
// ----------------------------------------------------------------------

/// Commit a transaction against the collections its write set touches.
///
/// Sequence: commit-serialization lock -> per-id locks in ascending
/// (collection, id) order -> validation (Serializable read set, then the
/// write set against projected state) -> WAL COMMIT + fsync (durability
/// point) -> apply in program order. A crash after the fsync is repaired
/// by replay on the next open.
pub(crate) fn commit_transaction(
    txns: &TransactionManager,
    wal: &Wal,
    collections: &HashMap<String, &Collection>,
    txn_id: TxnId,
) -> Result<()> {
    let txn_arc = txns.get(txn_id)?;
    let (write_set, read_checks, isolation) = {
        let mut txn = txn_arc.lock();
        if !txn.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "transaction {txn_id} is not active"
            )));
        }
        txn.state = TransactionState::Committing;
        let reads: Vec<(String, String, u64)> = txn
            .read_versions()
            .map(|((c, i), v)| (c.clone(), i.clone(), *v))
            .collect();
        (txn.write_set().to_vec(), reads, txn.isolation)
    };

    // Read-only transactions have nothing to validate or apply.
    if write_set.is_empty() {
        txn_arc.lock().state = TransactionState::Committed;
        txns.retire(txn_id);
        return Ok(());
    }

    let resolve = |name: &str| -> Result<&Collection> {
        collections
            .get(name)
            .copied()
            .ok_or_else(|| DbError::NotFound(format!("collection {name}")))
    };

    let _commit_guard = txns.commit_lock().lock();

    let mut keys: Vec<(String, String)> = write_set
        .iter()
        .map(|op| (op.collection().to_string(), op.id().to_string()))
        .collect();
    keys.sort();
    keys.dedup();
    let locks = keys
        .iter()
        .map(|(collection, id)| Ok(resolve(collection)?.id_lock(id)))
        .collect::<Result<Vec<_>>>()?;
    let _guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();

    if isolation == IsolationLevel::Serializable {
        for (collection, id, seen) in &read_checks {
            let current = resolve(collection)?.current_version(id).unwrap_or(0);
            if current != *seen {
                abort_staged(txns, wal, txn_id);
                return Err(DbError::TransactionConflict { txn_id });
            }
        }
    }

    // Validate the whole write set against projected state before the
    // durability point, so a committed log never carries invalid ops.
    let mut projected: HashMap<(String, String), Option<u64>> = HashMap::new();
    for op in &write_set {
        let key = (op.collection().to_string(), op.id().to_string());
        let state = match projected.get(&key) {
            Some(state) => *state,
            None => resolve(op.collection())?.current_version(op.id()),
        };
        let next = match op {
            WriteOp::Insert { id, .. } => {
                if state.is_some() {
                    abort_staged(txns, wal, txn_id);
                    return Err(DbError::DuplicateKey(id.clone()));
                }
                Some(1)
            }
            WriteOp::Update {
                id,
                expected_version,
                ..
            } => match state {
                Some(actual) if actual == *expected_version => Some(expected_version + 1),
                Some(actual) => {
                    abort_staged(txns, wal, txn_id);
                    return Err(DbError::ConcurrencyConflict {
                        id: id.clone(),
                        expected: *expected_version,
                        actual,
                    });
                }
                None => {
                    abort_staged(txns, wal, txn_id);
                    return Err(DbError::NotFound(id.clone()));
                }
            },
            WriteOp::Delete { .. } => None,
        };
        projected.insert(key, next);
    }

    // Durability point.
    wal.append(txn_id, &WalRecord::Commit)?;
    wal.sync()?;

    for op in &write_set {
        resolve(op.collection())?.apply_op(op)?;
    }

    txn_arc.lock().state = TransactionState::Committed;
    txns.retire(txn_id);
    Ok(())
}

/// Roll back a transaction: best-effort ROLLBACK record, then discard.
pub(crate) fn rollback_transaction(
    txns: &TransactionManager,
    wal: &Wal,
    txn_id: TxnId,
) -> Result<()> {
    if !txns.is_active(txn_id) {
        return Ok(());
    }
    abort_staged(txns, wal, txn_id);
    Ok(())
}

fn abort_staged(txns: &TransactionManager, wal: &Wal, txn_id: TxnId) {
    if let Ok(txn_arc) = txns.get(txn_id) {
        let wal_begun = {
            let mut txn = txn_arc.lock();
            txn.state = TransactionState::Aborted;
            txn.wal_begun
        };
        // Not required for correctness; replay ignores transactions
        // without a COMMIT record.
        if wal_begun {
            if let Err(e) = wal.append(txn_id, &WalRecord::Rollback) {
                warn!(txn_id, error = %e, "could not append rollback record");
            }
        }
    }
    txns.retire(txn_id);
}
