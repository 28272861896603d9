//! Array version locks.
//!
//! Structural operations on an array (create, write, remove, rename) are
//! serialized across the cluster through one shared lock table. There is no
//! in-memory lock table: every acquisition is a conditional insert executed
//! under serializable isolation, so two conflicting acquisitions from
//! different processes cannot both commit.
//!
//! # Protocol
//!
//! A query's coordinator inserts the authoritative row for each array it
//! touches. The insert succeeds unless a conflicting row already exists:
//!
//! | Mode | Conflicts with |
//! |------|----------------|
//! | `RD` | any coordinator row held above `RD` |
//! | `WR`, `CRT` | a row of another query held above `RD` |
//! | `XCL`, `RM`, `RNF` | any row of another query |
//!
//! Workers never originate locks. A worker copies the coordinator's row for
//! the same query, stamped with its own instance id, so its ids and version
//! always mirror the coordinator's. Workers may request `WR` (copying a
//! coordinator `WR` or `CRT` row), `XCL` or `RNF`.
//!
//! The table lock taken at the start of each acquisition keeps contending
//! acquirers from thrashing; exclusion itself comes from the predicate.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut lock = LockDesc::new("A", query_id, instance_id, InstanceRole::Coord, LockMode::Wr);
//! if manager.wait_for_lock(&mut lock, &|_| !query_cancelled()).await? {
//!     // ... write the new version ...
//!     manager.unlock_array(&mut lock).await?;
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use quiver_core::config::CatalogConfig;
use quiver_core::id::{ArrayId, InstanceId, QueryId, VersionId};
use quiver_core::lock_mode::{InstanceRole, LockMode};
use quiver_core::observability::lock_span;
use quiver_core::store::{IsolationLevel, LockConflict, LockRecord, Statement, Table};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::connection::{CatalogConnection, ScopedTransaction};
use crate::error::{CatalogError, Result};
use crate::executor::RestartableExecutor;
use crate::metrics;

/// Predicate consulted when a coordinator's lock is busy: `true` keeps
/// trying, `false` abandons the acquisition.
pub type LockContinuation<'a> = dyn Fn(&LockDesc) -> bool + Send + Sync + 'a;

/// A lock on one array, held by one instance on behalf of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDesc {
    /// Locked array name.
    pub array_name: String,
    /// Array row the lock refers to.
    pub array_id: ArrayId,
    /// Owning query.
    pub query_id: QueryId,
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Array row of the version being produced.
    pub array_version_id: ArrayId,
    /// Version being produced.
    pub array_version: VersionId,
    /// Largest catalog row id of the array when the query resolved it.
    pub array_catalog_id: ArrayId,
    /// Role of the owning instance.
    pub instance_role: InstanceRole,
    /// Mode the lock is held in.
    pub lock_mode: LockMode,
    /// Whether this process believes it holds the lock. Never persisted.
    #[serde(skip)]
    pub is_locked: bool,
}

impl LockDesc {
    /// Creates an unlocked request.
    #[must_use]
    pub fn new(
        array_name: impl Into<String>,
        query_id: QueryId,
        instance_id: InstanceId,
        instance_role: InstanceRole,
        lock_mode: LockMode,
    ) -> Self {
        Self {
            array_name: array_name.into(),
            array_id: ArrayId::INVALID,
            query_id,
            instance_id,
            array_version_id: ArrayId::INVALID,
            array_version: VersionId::NONE,
            array_catalog_id: ArrayId::INVALID,
            instance_role,
            lock_mode,
            is_locked: false,
        }
    }

    /// Sets the array row the lock refers to.
    #[must_use]
    pub fn with_array_id(mut self, array_id: ArrayId) -> Self {
        self.array_id = array_id;
        self
    }

    /// Sets the version being produced.
    #[must_use]
    pub fn with_version(mut self, array_version_id: ArrayId, array_version: VersionId) -> Self {
        self.array_version_id = array_version_id;
        self.array_version = array_version;
        self
    }

    fn to_record(&self) -> LockRecord {
        LockRecord {
            array_name: self.array_name.clone(),
            array_id: self.array_id,
            query_id: self.query_id,
            instance_id: self.instance_id,
            array_version_id: self.array_version_id,
            array_version: self.array_version,
            instance_role: self.instance_role,
            lock_mode: self.lock_mode,
        }
    }

    fn from_record(record: LockRecord) -> Self {
        Self {
            array_name: record.array_name,
            array_id: record.array_id,
            query_id: record.query_id,
            instance_id: record.instance_id,
            array_version_id: record.array_version_id,
            array_version: record.array_version,
            array_catalog_id: ArrayId::INVALID,
            instance_role: record.instance_role,
            lock_mode: record.lock_mode,
            is_locked: true,
        }
    }

    fn adopt(&mut self, granted: &LockRecord) {
        self.array_id = granted.array_id;
        self.array_version_id = granted.array_version_id;
        self.array_version = granted.array_version;
        self.is_locked = true;
    }
}

impl fmt::Display for LockDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock(array={}, arrayId={}, query={}, instance={}, role={}, mode={}, \
             versionArrayId={}, version={}, catalogId={}, locked={})",
            self.array_name,
            self.array_id,
            self.query_id,
            self.instance_id,
            self.instance_role,
            self.lock_mode,
            self.array_version_id,
            self.array_version,
            self.array_catalog_id,
            self.is_locked,
        )
    }
}

/// Locks held by one instance, split by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceLocks {
    /// Locks held as a query coordinator.
    pub coordinator: Vec<LockDesc>,
    /// Locks held as a worker.
    pub worker: Vec<LockDesc>,
}

/// How a request is turned into a conditional insert.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AcquirePlan {
    Insert(LockConflict),
    Copy {
        modes: Vec<LockMode>,
        unless_present: bool,
    },
}

impl AcquirePlan {
    fn for_request(desc: &LockDesc) -> Result<Self> {
        if desc.array_name.is_empty() {
            return Err(CatalogError::protocol("array lock requested without an array name"));
        }
        match (desc.instance_role, desc.lock_mode) {
            (InstanceRole::Coord, LockMode::Rd) => Ok(Self::Insert(
                LockConflict::any()
                    .above(LockMode::Rd)
                    .held_by(InstanceRole::Coord),
            )),
            (InstanceRole::Coord, LockMode::Wr | LockMode::Crt) => Ok(Self::Insert(
                LockConflict::any()
                    .from_other_query(desc.query_id)
                    .above(LockMode::Rd),
            )),
            (InstanceRole::Coord, LockMode::Xcl | LockMode::Rm | LockMode::Rnf) => Ok(Self::Insert(
                LockConflict::any().from_other_query(desc.query_id),
            )),
            (InstanceRole::Worker, LockMode::Wr) => Ok(Self::Copy {
                modes: vec![LockMode::Wr, LockMode::Crt],
                unless_present: false,
            }),
            (InstanceRole::Worker, LockMode::Xcl) => Ok(Self::Copy {
                modes: vec![LockMode::Xcl],
                unless_present: true,
            }),
            (InstanceRole::Worker, LockMode::Rnf) => Ok(Self::Copy {
                modes: vec![LockMode::Rnf],
                unless_present: false,
            }),
            (InstanceRole::Worker, mode @ (LockMode::Rd | LockMode::Crt | LockMode::Rm)) => {
                Err(CatalogError::protocol(format!(
                    "a worker cannot originate a {mode} lock on '{}'",
                    desc.array_name
                )))
            }
        }
    }
}

#[derive(Debug)]
enum Acquisition {
    Granted(LockRecord),
    NotGranted,
}

async fn try_acquire(
    tx: &mut ScopedTransaction,
    request: &LockRecord,
    plan: &AcquirePlan,
) -> Result<Acquisition> {
    tx.execute(Statement::LockTable(Table::ArrayVersionLock))
        .await?;

    match plan {
        AcquirePlan::Insert(conflict) => {
            let inserted = tx
                .execute(Statement::InsertLockUnless {
                    lock: request.clone(),
                    conflict: *conflict,
                })
                .await?;
            Ok(if inserted.affected_rows == 1 {
                Acquisition::Granted(request.clone())
            } else {
                Acquisition::NotGranted
            })
        }
        AcquirePlan::Copy {
            modes,
            unless_present,
        } => {
            let copied = tx
                .execute(Statement::CopyCoordinatorLock {
                    array_name: request.array_name.clone(),
                    query_id: request.query_id,
                    instance_id: request.instance_id,
                    modes: modes.clone(),
                    unless_present: *unless_present,
                })
                .await?;
            // XCL tolerates an existing worker row: a store and a scan of the
            // same temporary array in one query both lock it on each worker.
            let copied_or_present =
                copied.affected_rows == 1 || (*unless_present && copied.affected_rows == 0);
            if !copied_or_present {
                return Ok(Acquisition::NotGranted);
            }
            let own = tx
                .execute(Statement::SelectLock {
                    array_name: request.array_name.clone(),
                    query_id: request.query_id,
                    instance_id: request.instance_id,
                })
                .await?
                .decode::<LockRecord>()?;
            Ok(own
                .into_iter()
                .next()
                .map_or(Acquisition::NotGranted, Acquisition::Granted))
        }
    }
}

/// Acquires, updates and releases array locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    connection: CatalogConnection,
    executor: RestartableExecutor,
    retry_base: Duration,
    retry_max: Duration,
}

impl LockManager {
    /// Creates a lock manager over a catalog connection.
    #[must_use]
    pub fn new(connection: CatalogConnection, config: &CatalogConfig) -> Self {
        Self {
            connection,
            executor: RestartableExecutor::from_config(config),
            retry_base: config.lock_retry_base(),
            retry_max: config.lock_retry_max(),
        }
    }

    /// Attempts to acquire `desc` once.
    ///
    /// On success the lock row is committed, `desc.is_locked` is set and, for
    /// workers, `desc` takes the ids and version of the coordinator's row.
    /// A worker's requested mode is kept. A coordinator that re-acquires a lock it already holds (and whose
    /// `desc` says so) succeeds again.
    ///
    /// Returns `Ok(false)` when a worker finds no coordinator row to copy, or
    /// when a coordinator's lock is busy and `continuation` says to give up.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::LockBusy`] when a coordinator's lock conflicts and
    ///   there is no continuation, or the continuation says to keep trying.
    /// - [`CatalogError::ProtocolViolation`] for an invalid mode/role
    ///   combination, or a worker acquiring a lock it already holds.
    /// - A uniqueness-violation store error when the row exists but `desc`
    ///   was not locked.
    /// - Exhausted retry errors from the executor.
    pub async fn lock_array(
        &self,
        desc: &mut LockDesc,
        continuation: Option<&LockContinuation<'_>>,
    ) -> Result<bool> {
        let span = lock_span("lock_array", &desc.array_name, desc.query_id, desc.instance_id);
        self.lock_array_inner(desc, continuation)
            .instrument(span)
            .await
    }

    async fn lock_array_inner(
        &self,
        desc: &mut LockDesc,
        continuation: Option<&LockContinuation<'_>>,
    ) -> Result<bool> {
        let plan = AcquirePlan::for_request(desc)?;
        let request = desc.to_record();
        let mode = desc.lock_mode.as_str();
        let role = desc.instance_role.as_str();

        let connection = &self.connection;
        let request_ref = &request;
        let plan_ref = &plan;
        let outcome = self
            .executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let acquired = try_acquire(&mut tx, request_ref, plan_ref).await;
                tx.finish(acquired).await
            })
            .await;

        match outcome {
            Ok(Acquisition::Granted(granted)) => {
                desc.adopt(&granted);
                metrics::record_lock_outcome(mode, role, "granted");
                tracing::debug!(lock = %desc, "array lock granted");
                Ok(true)
            }
            Ok(Acquisition::NotGranted) => match desc.instance_role {
                InstanceRole::Worker => {
                    metrics::record_lock_outcome(mode, role, "missing_coordinator");
                    tracing::debug!(lock = %desc, "no coordinator lock to copy");
                    Ok(false)
                }
                InstanceRole::Coord => {
                    if let Some(keep_trying) = continuation {
                        if !keep_trying(desc) {
                            metrics::record_lock_outcome(mode, role, "abandoned");
                            tracing::debug!(lock = %desc, "busy array lock abandoned");
                            return Ok(false);
                        }
                    }
                    metrics::record_lock_outcome(mode, role, "busy");
                    tracing::debug!(lock = %desc, "array lock busy");
                    Err(CatalogError::LockBusy {
                        array_name: desc.array_name.clone(),
                    })
                }
            },
            Err(err) if err.is_uniqueness_violation() => {
                if !desc.is_locked {
                    metrics::record_lock_outcome(mode, role, "rejected");
                    tracing::error!(lock = %desc, error = %err, "conflicting array lock row");
                    Err(err)
                } else if desc.instance_role == InstanceRole::Worker {
                    metrics::record_lock_outcome(mode, role, "rejected");
                    Err(CatalogError::protocol(format!(
                        "worker lock on '{}' for query {} cannot be acquired more than once",
                        desc.array_name, desc.query_id
                    )))
                } else {
                    metrics::record_lock_outcome(mode, role, "reacquired");
                    tracing::debug!(lock = %desc, "array lock already held");
                    Ok(true)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Acquires `desc`, backing off while the lock is busy.
    ///
    /// Retries with capped exponential backoff plus jitter for as long as
    /// `continuation` returns `true`; returns `Ok(false)` once it returns
    /// `false`.
    ///
    /// # Errors
    ///
    /// Any error from [`LockManager::lock_array`] other than
    /// [`CatalogError::LockBusy`].
    pub async fn wait_for_lock(
        &self,
        desc: &mut LockDesc,
        continuation: &LockContinuation<'_>,
    ) -> Result<bool> {
        let mut backoff = self.retry_base;
        let mut attempts = 1_u32;
        loop {
            match self.lock_array(desc, Some(continuation)).await {
                Err(CatalogError::LockBusy { .. }) => {
                    let delay = backoff.min(self.retry_max) + jitter(self.retry_base);
                    tracing::trace!(
                        array = %desc.array_name,
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "waiting for busy array lock"
                    );
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                    attempts = attempts.saturating_add(1);
                }
                other => return other,
            }
        }
    }

    /// Releases `desc`.
    ///
    /// Returns whether a row was actually removed; `desc.is_locked` is
    /// cleared either way.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn unlock_array(&self, desc: &mut LockDesc) -> Result<bool> {
        let connection = &self.connection;
        let (array_name, query_id, instance_id) =
            (desc.array_name.as_str(), desc.query_id, desc.instance_id);
        let removed = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let deleted = tx
                    .execute(Statement::DeleteLock {
                        array_name: array_name.to_string(),
                        query_id,
                        instance_id,
                    })
                    .await
                    .map(|r| r.affected_rows == 1);
                tx.finish(deleted).await
            })
            .await?;
        desc.is_locked = false;
        tracing::debug!(lock = %desc, removed, "array lock released");
        Ok(removed)
    }

    /// Writes the ids, version and mode of `desc` into its held row.
    ///
    /// Used when a `CRT` lock learns the array id of the new array.
    /// Returns whether a row was updated.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn update_array_lock(&self, desc: &LockDesc) -> Result<bool> {
        let connection = &self.connection;
        let record = desc.to_record();
        let record = &record;
        let updated = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let updated = tx
                    .execute(Statement::UpdateLock {
                        lock: record.clone(),
                    })
                    .await
                    .map(|r| r.affected_rows == 1);
                tx.finish(updated).await
            })
            .await?;
        if !updated {
            tracing::warn!(lock = %desc, "no array lock row to update");
        }
        Ok(updated)
    }

    /// Returns every lock held by `instance_id`, split by role.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn read_array_locks(&self, instance_id: InstanceId) -> Result<InstanceLocks> {
        let connection = &self.connection;
        let records = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let rows = tx
                    .execute(Statement::SelectInstanceLocks { instance_id })
                    .await
                    .and_then(|r| r.decode::<LockRecord>().map_err(CatalogError::from));
                tx.finish(rows).await
            })
            .await?;

        let (coordinator, worker) = records
            .into_iter()
            .map(LockDesc::from_record)
            .partition(|lock| lock.instance_role == InstanceRole::Coord);
        Ok(InstanceLocks {
            coordinator,
            worker,
        })
    }

    /// Deletes locks held by `instance_id`, optionally only those of one
    /// query and/or one role. Returns the number of rows removed.
    ///
    /// An invalid query id means "any query".
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn delete_array_locks(
        &self,
        instance_id: InstanceId,
        query_id: Option<QueryId>,
        role: Option<InstanceRole>,
    ) -> Result<u64> {
        let connection = &self.connection;
        let query_id = query_id.filter(|q| q.is_valid());
        let removed = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let deleted = tx
                    .execute(Statement::DeleteInstanceLocks {
                        instance_id,
                        query_id,
                        role,
                    })
                    .await
                    .map(|r| r.affected_rows);
                tx.finish(deleted).await
            })
            .await?;
        tracing::info!(
            instance_id = instance_id.get(),
            query_id = query_id.map(QueryId::get),
            role = role.map(InstanceRole::as_str),
            removed,
            "deleted array locks"
        );
        Ok(removed)
    }

    /// Deletes every coordinator lock held by `instance_id`.
    ///
    /// # Errors
    ///
    /// See [`LockManager::delete_array_locks`].
    pub async fn delete_coord_array_locks(&self, instance_id: InstanceId) -> Result<u64> {
        self.delete_array_locks(instance_id, None, Some(InstanceRole::Coord))
            .await
    }

    /// Deletes every worker lock held by `instance_id`.
    ///
    /// # Errors
    ///
    /// See [`LockManager::delete_array_locks`].
    pub async fn delete_worker_array_locks(&self, instance_id: InstanceId) -> Result<u64> {
        self.delete_array_locks(instance_id, None, Some(InstanceRole::Worker))
            .await
    }

    /// Returns the coordinator's lock on `array_name` for `query_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn check_for_coordinator_lock(
        &self,
        array_name: &str,
        query_id: QueryId,
    ) -> Result<Option<LockDesc>> {
        let connection = &self.connection;
        let records = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let rows = tx
                    .execute(Statement::SelectCoordinatorLock {
                        array_name: array_name.to_string(),
                        query_id,
                    })
                    .await
                    .and_then(|r| r.decode::<LockRecord>().map_err(CatalogError::from));
                tx.finish(rows).await
            })
            .await?;
        Ok(records.into_iter().next().map(LockDesc::from_record))
    }
}

impl LockManager {
    /// Creates a lock manager that owns a new connection to `store`.
    #[must_use]
    pub fn for_store(
        store: Arc<dyn quiver_core::store::TransactionalStore>,
        config: &CatalogConfig,
    ) -> Self {
        Self::new(CatalogConnection::new(store), config)
    }
}

fn jitter(base: Duration) -> Duration {
    let cap = u64::try_from(base.as_millis()).unwrap_or(u64::MAX).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
}
