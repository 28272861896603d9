//! In-memory transactional store.
//!
//! Reference implementation of [`TransactionalStore`] used by tests and
//! single-process deployments. It honours the isolation contract the
//! catalog relies on:
//!
//! - **Serializable** transactions work on a private snapshot taken at their
//!   first data statement. At commit, any table the transaction touched that
//!   another transaction committed to after the snapshot fails the commit
//!   with a serialization conflict.
//! - **Read-committed** transactions run exclusively against the committed
//!   state for their whole duration.
//! - [`Statement::LockTable`] takes a per-table mutex held until the
//!   transaction ends; the snapshot is deferred until after it, so callers
//!   that lock first never conflict with each other.
//! - The array id sequence is not transactional.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::id::{ArrayId, InstanceId, VersionId};
use crate::lock_mode::InstanceRole;
use crate::store::{
    ArrayRecord, AttributeRecord, ClusterRecord, DimensionRecord, InstanceRecord,
    IsolationLevel, LockRecord, QueryResult, Record, Row, Statement, StoreError, StoreResult,
    StoreTransaction, Table, TransactionalStore, VersionRecord,
};

const ALL_TABLES: [Table; 8] = [
    Table::Array,
    Table::ArrayAttribute,
    Table::ArrayDimension,
    Table::ArrayVersion,
    Table::ArrayVersionLock,
    Table::Instance,
    Table::Library,
    Table::Cluster,
];

#[derive(Debug, Clone, Default)]
struct Tables {
    arrays: BTreeMap<ArrayId, ArrayRecord>,
    attributes: Vec<AttributeRecord>,
    dimensions: Vec<DimensionRecord>,
    versions: Vec<VersionRecord>,
    locks: Vec<LockRecord>,
    instances: BTreeMap<InstanceId, InstanceRecord>,
    libraries: BTreeSet<String>,
    cluster: Option<ClusterRecord>,
}

#[derive(Debug, Default)]
struct Committed {
    tables: Tables,
    seq: u64,
    modified_at: HashMap<Table, u64>,
}

impl Committed {
    fn install(&mut self, mut working: Tables, written: &BTreeSet<Table>) {
        if written.is_empty() {
            return;
        }
        self.seq += 1;
        for table in written {
            self.tables.take_table(&mut working, *table);
            self.modified_at.insert(*table, self.seq);
        }
    }

    fn modified_since(&self, table: Table, seq: u64) -> bool {
        self.modified_at.get(&table).is_some_and(|at| *at > seq)
    }
}

#[derive(Debug)]
struct Shared {
    state: Arc<Mutex<Committed>>,
    table_locks: HashMap<Table, Arc<Mutex<()>>>,
    next_array_id: AtomicU64,
    next_instance_id: AtomicU64,
}

/// An in-memory [`TransactionalStore`].
///
/// Cloning is cheap; clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let table_locks = ALL_TABLES
            .iter()
            .map(|table| (*table, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            shared: Arc::new(Shared {
                state: Arc::new(Mutex::new(Committed::default())),
                table_locks,
                next_array_id: AtomicU64::new(1),
                next_instance_id: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the committed lock rows (for test assertions).
    pub async fn lock_rows(&self) -> Vec<LockRecord> {
        self.shared.state.lock().await.tables.locks.clone()
    }

    /// Returns the committed version rows (for test assertions).
    pub async fn version_rows(&self) -> Vec<VersionRecord> {
        self.shared.state.lock().await.tables.versions.clone()
    }

    /// Returns the largest committed array id, or `0` if there are none.
    pub async fn max_array_id(&self) -> ArrayId {
        self.shared
            .state
            .lock()
            .await
            .tables
            .arrays
            .keys()
            .next_back()
            .copied()
            .unwrap_or(ArrayId::INVALID)
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn StoreTransaction>> {
        let mut tx = MemoryTransaction {
            shared: Arc::clone(&self.shared),
            isolation,
            exclusive: None,
            working: None,
            snapshot_seq: 0,
            touched: BTreeSet::new(),
            written: BTreeSet::new(),
            table_guards: Vec::new(),
            aborted: false,
        };
        if isolation == IsolationLevel::ReadCommitted {
            let guard = Arc::clone(&self.shared.state).lock_owned().await;
            tx.working = Some(guard.tables.clone());
            tx.exclusive = Some(guard);
        }
        Ok(Box::new(tx))
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    isolation: IsolationLevel,
    exclusive: Option<OwnedMutexGuard<Committed>>,
    working: Option<Tables>,
    snapshot_seq: u64,
    touched: BTreeSet<Table>,
    written: BTreeSet<Table>,
    table_guards: Vec<OwnedMutexGuard<()>>,
    aborted: bool,
}

impl MemoryTransaction {
    async fn lock_table(&mut self, table: Table) -> StoreResult<()> {
        if self.isolation == IsolationLevel::ReadCommitted {
            return Ok(());
        }
        let mutex = self
            .shared
            .table_locks
            .get(&table)
            .ok_or_else(|| StoreError::other(format!("unknown table {table}")))?;
        let guard = Arc::clone(mutex).lock_owned().await;
        self.table_guards.push(guard);
        Ok(())
    }

    async fn working(&mut self) -> &mut Tables {
        if self.working.is_none() {
            let state = self.shared.state.lock().await;
            self.snapshot_seq = state.seq;
            self.working = Some(state.tables.clone());
        }
        self.working.get_or_insert_with(Tables::default)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn execute(&mut self, statement: &Statement) -> StoreResult<QueryResult> {
        if self.aborted {
            return Err(StoreError::other(
                "current transaction is aborted, commands ignored until end of transaction block",
            )
            .with_statement(statement.name()));
        }
        tracing::trace!(statement = statement.name(), "executing statement");

        if let Statement::LockTable(table) = statement {
            self.lock_table(*table).await?;
            return Ok(QueryResult::default());
        }

        let shared = Arc::clone(&self.shared);
        let tables = self.working().await;
        let result = tables.execute(statement, &shared);
        match result {
            Ok(result) => {
                self.touched.extend(statement.tables());
                if is_mutation(statement) && result.affected_rows > 0 {
                    self.written.extend(statement.tables());
                }
                Ok(result)
            }
            Err(e) => {
                self.aborted = true;
                Err(e.with_statement(statement.name()))
            }
        }
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        if self.aborted {
            return Err(StoreError::other("cannot commit an aborted transaction"));
        }
        let Some(working) = self.working.take() else {
            return Ok(());
        };

        if let Some(mut guard) = self.exclusive.take() {
            guard.install(working, &self.written);
            return Ok(());
        }

        let mut state = self.shared.state.lock().await;
        if let Some(table) = self
            .touched
            .iter()
            .find(|table| state.modified_since(**table, self.snapshot_seq))
        {
            return Err(StoreError::serialization_conflict(format!(
                "could not serialize access due to concurrent update of {table}"
            )));
        }
        state.install(working, &self.written);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

fn is_mutation(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::InsertLockUnless { .. }
            | Statement::CopyCoordinatorLock { .. }
            | Statement::UpdateLock { .. }
            | Statement::DeleteLock { .. }
            | Statement::DeleteInstanceLocks { .. }
            | Statement::InsertVersion(_)
            | Statement::DeleteVersion { .. }
            | Statement::WidenDimensionLow { .. }
            | Statement::WidenDimensionHigh { .. }
            | Statement::InsertArray(_)
            | Statement::InsertAttribute(_)
            | Statement::InsertDimension(_)
            | Statement::DeleteArrayFamily { .. }
            | Statement::DeleteArrayVersionsBelow { .. }
            | Statement::DeleteArrayById { .. }
            | Statement::RenameArrayFamily { .. }
            | Statement::UpdateArrayFlags { .. }
            | Statement::InsertInstance { .. }
            | Statement::MarkInstanceOnline { .. }
            | Statement::MarkInstanceOffline { .. }
            | Statement::InsertLibrary { .. }
            | Statement::DeleteLibrary { .. }
            | Statement::InsertCluster(_)
    )
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

fn duplicate_key(constraint: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::uniqueness_violation(format!(
        "duplicate key value violates unique constraint \"{constraint}\": {detail}"
    ))
}

impl Tables {
    fn take_table(&mut self, from: &mut Self, table: Table) {
        match table {
            Table::Array => self.arrays = std::mem::take(&mut from.arrays),
            Table::ArrayAttribute => self.attributes = std::mem::take(&mut from.attributes),
            Table::ArrayDimension => self.dimensions = std::mem::take(&mut from.dimensions),
            Table::ArrayVersion => self.versions = std::mem::take(&mut from.versions),
            Table::ArrayVersionLock => self.locks = std::mem::take(&mut from.locks),
            Table::Instance => self.instances = std::mem::take(&mut from.instances),
            Table::Library => self.libraries = std::mem::take(&mut from.libraries),
            Table::Cluster => self.cluster = from.cluster.take(),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, statement: &Statement, shared: &Shared) -> StoreResult<QueryResult> {
        match statement {
            Statement::LockTable(_) => Ok(QueryResult::default()),

            Statement::InsertLockUnless { lock, conflict } => {
                if self
                    .locks
                    .iter()
                    .any(|existing| conflict.matches(&lock.array_name, existing))
                {
                    return Ok(QueryResult::affected(0));
                }
                self.insert_lock(lock.clone())?;
                Ok(QueryResult::affected(1))
            }
            Statement::CopyCoordinatorLock {
                array_name,
                query_id,
                instance_id,
                modes,
                unless_present,
            } => {
                let copies: Vec<LockRecord> = self
                    .locks
                    .iter()
                    .filter(|r| {
                        r.array_name == *array_name
                            && r.query_id == *query_id
                            && r.instance_role == InstanceRole::Coord
                            && modes.contains(&r.lock_mode)
                    })
                    .map(|coord| LockRecord {
                        instance_id: *instance_id,
                        instance_role: InstanceRole::Worker,
                        ..coord.clone()
                    })
                    .collect();
                let mut affected = 0;
                for copy in copies {
                    let present = self
                        .locks
                        .iter()
                        .any(|r| r.has_key(&copy.array_name, copy.query_id, copy.instance_id));
                    if present && *unless_present {
                        continue;
                    }
                    self.insert_lock(copy)?;
                    affected += 1;
                }
                Ok(QueryResult::affected(affected))
            }
            Statement::SelectLock {
                array_name,
                query_id,
                instance_id,
            } => Ok(QueryResult::rows(
                self.locks
                    .iter()
                    .filter(|r| r.has_key(array_name, *query_id, *instance_id))
                    .map(Record::to_row)
                    .collect(),
            )),
            Statement::SelectCoordinatorLock {
                array_name,
                query_id,
            } => Ok(QueryResult::rows(
                self.locks
                    .iter()
                    .filter(|r| {
                        r.array_name == *array_name
                            && r.query_id == *query_id
                            && r.instance_role == InstanceRole::Coord
                    })
                    .map(Record::to_row)
                    .collect(),
            )),
            Statement::UpdateLock { lock } => {
                let mut affected = 0;
                for row in self
                    .locks
                    .iter_mut()
                    .filter(|r| r.has_key(&lock.array_name, lock.query_id, lock.instance_id))
                {
                    row.array_id = lock.array_id;
                    row.array_version_id = lock.array_version_id;
                    row.array_version = lock.array_version;
                    row.lock_mode = lock.lock_mode;
                    affected += 1;
                }
                Ok(QueryResult::affected(affected))
            }
            Statement::DeleteLock {
                array_name,
                query_id,
                instance_id,
            } => {
                let before = self.locks.len();
                self.locks
                    .retain(|r| !r.has_key(array_name, *query_id, *instance_id));
                Ok(QueryResult::affected(count(before - self.locks.len())))
            }
            Statement::SelectInstanceLocks { instance_id } => {
                let mut rows: Vec<&LockRecord> = self
                    .locks
                    .iter()
                    .filter(|r| r.instance_id == *instance_id)
                    .collect();
                rows.sort_by(|a, b| {
                    (a.query_id, &a.array_name).cmp(&(b.query_id, &b.array_name))
                });
                Ok(QueryResult::rows(rows.into_iter().map(Record::to_row).collect()))
            }
            Statement::DeleteInstanceLocks {
                instance_id,
                query_id,
                role,
            } => {
                let before = self.locks.len();
                self.locks.retain(|r| {
                    !(r.instance_id == *instance_id
                        && query_id.is_none_or(|q| r.query_id == q)
                        && role.is_none_or(|role| r.instance_role == role))
                });
                Ok(QueryResult::affected(count(before - self.locks.len())))
            }

            Statement::SelectMaxVersionId { array_id } => {
                let max = self
                    .versions
                    .iter()
                    .filter(|v| v.array_id == *array_id)
                    .map(|v| v.version_id)
                    .max()
                    .unwrap_or(VersionId::NONE);
                Ok(QueryResult::rows(vec![Row::new().with("max_version_id", max)]))
            }
            Statement::InsertVersion(record) => {
                if self.versions.iter().any(|v| {
                    v.array_id == record.array_id && v.version_id == record.version_id
                }) {
                    return Err(duplicate_key(
                        "array_version_pkey",
                        format!("({}, {})", record.array_id, record.version_id),
                    ));
                }
                self.versions.push(record.clone());
                Ok(QueryResult::affected(1))
            }
            Statement::SelectLastVersion { array_id, horizon } => {
                let last = self
                    .versions
                    .iter()
                    .filter(|v| v.array_id == *array_id && v.version_array_id <= *horizon)
                    .map(|v| v.version_id)
                    .max()
                    .unwrap_or(VersionId::NONE);
                Ok(QueryResult::rows(vec![Row::new().with("version_id", last)]))
            }
            Statement::SelectOldestVersion { array_id } => {
                let oldest = self
                    .versions
                    .iter()
                    .filter(|v| v.array_id == *array_id)
                    .map(|v| v.version_array_id)
                    .min()
                    .unwrap_or(ArrayId::INVALID);
                Ok(QueryResult::rows(vec![
                    Row::new().with("version_array_id", oldest),
                ]))
            }
            Statement::SelectVersionByTimestamp {
                array_id,
                time_stamp,
            } => {
                let found = self
                    .versions
                    .iter()
                    .filter(|v| v.array_id == *array_id && v.time_stamp <= *time_stamp)
                    .map(|v| v.version_id)
                    .max()
                    .unwrap_or(VersionId::NONE);
                Ok(QueryResult::rows(vec![Row::new().with("version_id", found)]))
            }
            Statement::SelectVersions { array_id } => {
                let mut rows: Vec<&VersionRecord> = self
                    .versions
                    .iter()
                    .filter(|v| v.array_id == *array_id)
                    .collect();
                rows.sort_by_key(|v| v.version_id);
                Ok(QueryResult::rows(rows.into_iter().map(Record::to_row).collect()))
            }
            Statement::DeleteVersion {
                array_id,
                version_id,
            } => {
                let before = self.versions.len();
                self.versions
                    .retain(|v| !(v.array_id == *array_id && v.version_id == *version_id));
                Ok(QueryResult::affected(count(before - self.versions.len())))
            }
            Statement::SelectMaxArrayIds { pattern } => {
                let regex = Regex::new(pattern)
                    .map_err(|e| StoreError::other(format!("invalid regular expression: {e}")))?;
                let mut max_ids: BTreeMap<&str, ArrayId> = BTreeMap::new();
                for array in self.arrays.values().filter(|a| regex.is_match(&a.name)) {
                    let base = array.name.split('@').next().unwrap_or(&array.name);
                    let entry = max_ids.entry(base).or_insert(array.id);
                    *entry = (*entry).max(array.id);
                }
                Ok(QueryResult::rows(
                    max_ids
                        .into_iter()
                        .map(|(base, id)| Row::new().with("base_name", base).with("max_id", id))
                        .collect(),
                ))
            }

            Statement::WidenDimensionLow {
                array_id,
                ordinal,
                bound,
            } => {
                let mut affected = 0;
                for dim in self.dimensions.iter_mut().filter(|d| {
                    d.array_id == *array_id && d.ordinal == *ordinal && d.curr_start > *bound
                }) {
                    dim.curr_start = *bound;
                    affected += 1;
                }
                Ok(QueryResult::affected(affected))
            }
            Statement::WidenDimensionHigh {
                array_id,
                ordinal,
                bound,
            } => {
                let mut affected = 0;
                for dim in self.dimensions.iter_mut().filter(|d| {
                    d.array_id == *array_id && d.ordinal == *ordinal && d.curr_end < *bound
                }) {
                    dim.curr_end = *bound;
                    affected += 1;
                }
                Ok(QueryResult::affected(affected))
            }

            Statement::NextArrayId => {
                let id = shared.next_array_id.fetch_add(1, Ordering::SeqCst);
                Ok(QueryResult::rows(vec![
                    Row::new().with("array_id", ArrayId::new(id)),
                ]))
            }
            Statement::InsertArray(record) => {
                if self.arrays.contains_key(&record.id) {
                    return Err(duplicate_key("array_pkey", record.id));
                }
                if self.arrays.values().any(|a| a.name == record.name) {
                    return Err(duplicate_key("array_name_key", &record.name));
                }
                self.arrays.insert(record.id, record.clone());
                Ok(QueryResult::affected(1))
            }
            Statement::InsertAttribute(record) => {
                if self.attributes.iter().any(|a| {
                    a.array_id == record.array_id
                        && (a.ordinal == record.ordinal || a.name == record.name)
                }) {
                    return Err(duplicate_key("array_attribute_pkey", &record.name));
                }
                self.attributes.push(record.clone());
                Ok(QueryResult::affected(1))
            }
            Statement::InsertDimension(record) => {
                if self.dimensions.iter().any(|d| {
                    d.array_id == record.array_id
                        && (d.ordinal == record.ordinal || d.name == record.name)
                }) {
                    return Err(duplicate_key("array_dimension_pkey", &record.name));
                }
                self.dimensions.push(record.clone());
                Ok(QueryResult::affected(1))
            }
            Statement::SelectArrayByName { name, horizon } => Ok(QueryResult::rows(
                self.arrays
                    .values()
                    .filter(|a| a.name == *name && a.id <= *horizon)
                    .map(Record::to_row)
                    .collect(),
            )),
            Statement::SelectArrayById { id } => Ok(QueryResult::rows(
                self.arrays.get(id).map(Record::to_row).into_iter().collect(),
            )),
            Statement::SelectArrays => {
                let mut rows: Vec<&ArrayRecord> = self.arrays.values().collect();
                rows.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(QueryResult::rows(rows.into_iter().map(Record::to_row).collect()))
            }
            Statement::SelectAttributes { array_id } => {
                let mut rows: Vec<&AttributeRecord> = self
                    .attributes
                    .iter()
                    .filter(|a| a.array_id == *array_id)
                    .collect();
                rows.sort_by_key(|a| a.ordinal);
                Ok(QueryResult::rows(rows.into_iter().map(Record::to_row).collect()))
            }
            Statement::SelectDimensions { array_id } => {
                let mut rows: Vec<&DimensionRecord> = self
                    .dimensions
                    .iter()
                    .filter(|d| d.array_id == *array_id)
                    .collect();
                rows.sort_by_key(|d| d.ordinal);
                Ok(QueryResult::rows(rows.into_iter().map(Record::to_row).collect()))
            }
            Statement::DeleteArrayFamily { name } => {
                let prefix = format!("{name}@");
                let ids = self.array_ids_where(|a| a.name == *name || a.name.starts_with(&prefix));
                Ok(QueryResult::affected(self.remove_arrays(&ids)))
            }
            Statement::DeleteArrayVersionsBelow { name, below } => {
                let prefix = format!("{name}@");
                let ids = self.array_ids_where(|a| a.name.starts_with(&prefix) && a.id < *below);
                Ok(QueryResult::affected(self.remove_arrays(&ids)))
            }
            Statement::DeleteArrayById { id } => {
                Ok(QueryResult::affected(self.remove_arrays(&[*id])))
            }
            Statement::RenameArrayFamily { old_name, new_name } => {
                let pattern = format!("^{}(@.+)?$", regex::escape(old_name));
                let regex = Regex::new(&pattern)
                    .map_err(|e| StoreError::other(format!("invalid regular expression: {e}")))?;
                let renames: Vec<(ArrayId, String)> = self
                    .arrays
                    .values()
                    .filter_map(|a| {
                        regex.captures(&a.name).map(|caps| {
                            let suffix = caps.get(1).map_or("", |m| m.as_str());
                            (a.id, format!("{new_name}{suffix}"))
                        })
                    })
                    .collect();
                for (id, renamed) in &renames {
                    if self
                        .arrays
                        .values()
                        .any(|a| a.name == *renamed && renames.iter().all(|(r, _)| *r != a.id))
                    {
                        return Err(duplicate_key(
                            "array_name_key",
                            format!("{renamed} (renaming array {id})"),
                        ));
                    }
                }
                for (id, renamed) in &renames {
                    if let Some(array) = self.arrays.get_mut(id) {
                        array.name.clone_from(renamed);
                    }
                }
                Ok(QueryResult::affected(count(renames.len())))
            }
            Statement::UpdateArrayFlags {
                having_flags,
                set_flags,
            } => {
                let mut affected = 0;
                for array in self
                    .arrays
                    .values_mut()
                    .filter(|a| a.flags & *having_flags != 0)
                {
                    array.flags |= *set_flags;
                    affected += 1;
                }
                Ok(QueryResult::affected(affected))
            }

            Statement::InsertInstance { host, port, path } => {
                let instance_id =
                    InstanceId::new(shared.next_instance_id.fetch_add(1, Ordering::SeqCst));
                self.instances.insert(
                    instance_id,
                    InstanceRecord {
                        instance_id,
                        host: host.clone(),
                        port: *port,
                        path: path.clone(),
                        online_since: None,
                    },
                );
                Ok(QueryResult {
                    rows: vec![Row::new().with("instance_id", instance_id)],
                    affected_rows: 1,
                })
            }
            Statement::SelectInstances => Ok(QueryResult::rows(
                self.instances.values().map(Record::to_row).collect(),
            )),
            Statement::SelectInstance { instance_id } => Ok(QueryResult::rows(
                self.instances
                    .get(instance_id)
                    .map(Record::to_row)
                    .into_iter()
                    .collect(),
            )),
            Statement::MarkInstanceOnline {
                instance_id,
                host,
                port,
                online_since,
            } => Ok(QueryResult::affected(
                self.instances.get_mut(instance_id).map_or(0, |instance| {
                    instance.host.clone_from(host);
                    instance.port = *port;
                    instance.online_since = Some(*online_since);
                    1
                }),
            )),
            Statement::MarkInstanceOffline { instance_id } => Ok(QueryResult::affected(
                self.instances.get_mut(instance_id).map_or(0, |instance| {
                    instance.online_since = None;
                    1
                }),
            )),

            Statement::InsertLibrary { name } => {
                if !self.libraries.insert(name.clone()) {
                    return Err(duplicate_key("libraries_name_key", name));
                }
                Ok(QueryResult::affected(1))
            }
            Statement::SelectLibraries => Ok(QueryResult::rows(
                self.libraries
                    .iter()
                    .map(|name| Row::new().with("name", name.as_str()))
                    .collect(),
            )),
            Statement::DeleteLibrary { name } => {
                Ok(QueryResult::affected(u64::from(self.libraries.remove(name))))
            }

            Statement::SelectCluster => Ok(QueryResult::rows(
                self.cluster.iter().map(Record::to_row).collect(),
            )),
            Statement::InsertCluster(record) => {
                if self.cluster.is_some() {
                    return Err(duplicate_key("cluster_pkey", &record.cluster_uuid));
                }
                self.cluster = Some(record.clone());
                Ok(QueryResult::affected(1))
            }
        }
    }

    fn insert_lock(&mut self, lock: LockRecord) -> StoreResult<()> {
        if self
            .locks
            .iter()
            .any(|r| r.has_key(&lock.array_name, lock.query_id, lock.instance_id))
        {
            return Err(duplicate_key(
                "array_version_lock_pkey",
                format!(
                    "({}, {}, {})",
                    lock.array_name, lock.query_id, lock.instance_id
                ),
            ));
        }
        self.locks.push(lock);
        Ok(())
    }

    fn array_ids_where(&self, predicate: impl Fn(&ArrayRecord) -> bool) -> Vec<ArrayId> {
        self.arrays
            .values()
            .filter(|a| predicate(a))
            .map(|a| a.id)
            .collect()
    }

    fn remove_arrays(&mut self, ids: &[ArrayId]) -> u64 {
        let removed = ids
            .iter()
            .filter(|id| self.arrays.remove(*id).is_some())
            .count();
        self.attributes.retain(|a| !ids.contains(&a.array_id));
        self.dimensions.retain(|d| !ids.contains(&d.array_id));
        self.versions
            .retain(|v| !ids.contains(&v.array_id) && !ids.contains(&v.version_array_id));
        count(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::QueryId;
    use crate::lock_mode::LockMode;
    use crate::store::{FailureKind, LockConflict};

    fn coord_lock(name: &str, query: u64, mode: LockMode) -> LockRecord {
        LockRecord {
            array_name: name.to_string(),
            array_id: ArrayId::INVALID,
            query_id: QueryId::new(query),
            instance_id: InstanceId::new(0),
            array_version_id: ArrayId::INVALID,
            array_version: VersionId::NONE,
            instance_role: InstanceRole::Coord,
            lock_mode: mode,
        }
    }

    fn array(id: u64, uaid: u64, name: &str) -> ArrayRecord {
        ArrayRecord {
            id: ArrayId::new(id),
            uaid: ArrayId::new(uaid),
            name: name.to_string(),
            flags: 0,
            partitioning: 0,
        }
    }

    async fn exec(store: &MemoryStore, isolation: IsolationLevel, stmt: Statement) -> QueryResult {
        let mut tx = store.begin(isolation).await.expect("begin");
        let result = tx.execute(&stmt).await.expect("execute");
        tx.commit().await.expect("commit");
        result
    }

    #[tokio::test]
    async fn test_insert_lock_unless_conflict() {
        let store = MemoryStore::new();
        let first = exec(
            &store,
            IsolationLevel::Serializable,
            Statement::InsertLockUnless {
                lock: coord_lock("A", 1, LockMode::Crt),
                conflict: LockConflict::any().from_other_query(QueryId::new(1)),
            },
        )
        .await;
        assert_eq!(first.affected_rows, 1);

        let second = exec(
            &store,
            IsolationLevel::Serializable,
            Statement::InsertLockUnless {
                lock: coord_lock("A", 2, LockMode::Wr),
                conflict: LockConflict::any()
                    .from_other_query(QueryId::new(2))
                    .above(LockMode::Rd),
            },
        )
        .await;
        assert_eq!(second.affected_rows, 0);
        assert_eq!(store.lock_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_lock_key_is_uniqueness_violation() {
        let store = MemoryStore::new();
        let stmt = Statement::InsertLockUnless {
            lock: coord_lock("A", 1, LockMode::Xcl),
            conflict: LockConflict::any().from_other_query(QueryId::new(1)),
        };
        exec(&store, IsolationLevel::Serializable, stmt.clone()).await;

        let mut tx = store
            .begin(IsolationLevel::Serializable)
            .await
            .expect("begin");
        let err = tx.execute(&stmt).await.expect_err("duplicate");
        assert_eq!(err.kind(), FailureKind::UniquenessViolation);
        assert_eq!(err.statement(), Some("insert_array_lock"));
        tx.rollback().await.expect("rollback");
    }

    #[tokio::test]
    async fn test_concurrent_serializable_writers_conflict() {
        let store = MemoryStore::new();
        let mut tx1 = store
            .begin(IsolationLevel::Serializable)
            .await
            .expect("begin");
        let mut tx2 = store
            .begin(IsolationLevel::Serializable)
            .await
            .expect("begin");

        let max1 = tx1
            .execute(&Statement::SelectMaxVersionId {
                array_id: ArrayId::new(100),
            })
            .await
            .expect("select");
        let max2 = tx2
            .execute(&Statement::SelectMaxVersionId {
                array_id: ArrayId::new(100),
            })
            .await
            .expect("select");
        assert_eq!(
            max1.scalar::<VersionId>("max_version_id").expect("max"),
            VersionId::NONE
        );
        assert_eq!(
            max2.scalar::<VersionId>("max_version_id").expect("max"),
            VersionId::NONE
        );

        for (tx, version_array_id) in [(&mut tx1, 101), (&mut tx2, 102)] {
            tx.execute(&Statement::InsertVersion(VersionRecord {
                array_id: ArrayId::new(100),
                version_array_id: ArrayId::new(version_array_id),
                version_id: VersionId::new(1),
                time_stamp: 0,
            }))
            .await
            .expect("insert");
        }

        tx1.commit().await.expect("first commit wins");
        let err = tx2.commit().await.expect_err("second commit conflicts");
        assert_eq!(err.kind(), FailureKind::SerializationConflict);
        assert_eq!(store.version_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_but_not_sequence() {
        let store = MemoryStore::new();
        let mut tx = store
            .begin(IsolationLevel::ReadCommitted)
            .await
            .expect("begin");
        let id = tx
            .execute(&Statement::NextArrayId)
            .await
            .expect("next id")
            .scalar::<ArrayId>("array_id")
            .expect("id");
        tx.execute(&Statement::InsertArray(array(id.get(), id.get(), "A")))
            .await
            .expect("insert");
        tx.rollback().await.expect("rollback");

        assert_eq!(store.max_array_id().await, ArrayId::INVALID);
        let next = exec(&store, IsolationLevel::ReadCommitted, Statement::NextArrayId).await;
        assert_eq!(next.scalar::<ArrayId>("array_id").expect("id"), ArrayId::new(id.get() + 1));
    }

    #[tokio::test]
    async fn test_rename_family_keeps_version_suffix() {
        let store = MemoryStore::new();
        for record in [array(1, 1, "A"), array(2, 1, "A@1"), array(3, 3, "AB")] {
            exec(&store, IsolationLevel::ReadCommitted, Statement::InsertArray(record)).await;
        }
        let renamed = exec(
            &store,
            IsolationLevel::ReadCommitted,
            Statement::RenameArrayFamily {
                old_name: "A".to_string(),
                new_name: "Z".to_string(),
            },
        )
        .await;
        assert_eq!(renamed.affected_rows, 2);

        let names: Vec<String> = exec(&store, IsolationLevel::ReadCommitted, Statement::SelectArrays)
            .await
            .decode::<ArrayRecord>()
            .expect("decode")
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["AB", "Z", "Z@1"]);
    }

    #[tokio::test]
    async fn test_max_array_ids_grouped_by_base_name() {
        let store = MemoryStore::new();
        for record in [
            array(1, 1, "A"),
            array(2, 1, "A@1"),
            array(5, 1, "A@2"),
            array(3, 3, "B"),
            array(4, 4, "AB"),
        ] {
            exec(&store, IsolationLevel::ReadCommitted, Statement::InsertArray(record)).await;
        }
        let result = exec(
            &store,
            IsolationLevel::Serializable,
            Statement::SelectMaxArrayIds {
                pattern: "^(?:A|B)(?:@[^@]*)?$".to_string(),
            },
        )
        .await;
        let pairs: Vec<(String, ArrayId)> = result
            .rows
            .iter()
            .map(|row| {
                (
                    row.get::<String>("base_name").expect("base"),
                    row.get::<ArrayId>("max_id").expect("max"),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), ArrayId::new(5)),
                ("B".to_string(), ArrayId::new(3)),
            ]
        );
    }
}
