//! Array schemas, instances, libraries and cluster identity.
//!
//! These are plain statement mappings with no cross-node race beyond what
//! the store's unique constraints already catch. Multi-row writes run at
//! serializable isolation so a descriptor is never half-stored; everything
//! else runs read-committed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quiver_core::config::CatalogConfig;
use quiver_core::id::{ArrayId, InstanceId, VersionId};
use quiver_core::store::{
    ArrayRecord, AttributeRecord, ClusterRecord, DimensionRecord, InstanceRecord,
    IsolationLevel, Statement, TransactionalStore,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::array::{ArrayDesc, base_name, make_versioned_name};
use crate::connection::{CatalogConnection, ScopedTransaction};
use crate::error::{CatalogError, Result};
use crate::executor::RestartableExecutor;

/// Catalog layout version written by [`MetadataStore::initialize_cluster`].
pub const METADATA_VERSION: i64 = 1;

/// Which version of an array a lookup resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    /// The newest version visible within the catalog horizon, or the base
    /// array when it has no visible versions.
    #[default]
    Latest,
    /// One specific version; [`VersionId::NONE`] selects the base array.
    Exact(VersionId),
}

/// A registered cluster instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDesc {
    /// Instance id.
    pub instance_id: InstanceId,
    /// Host name.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// Data directory path.
    pub path: String,
    /// When the instance last came online; `None` while offline.
    pub online_since: Option<DateTime<Utc>>,
}

impl InstanceDesc {
    /// Returns whether the instance is marked online.
    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.online_since.is_some()
    }

    fn from_record(record: InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id,
            host: record.host,
            port: record.port,
            path: record.path,
            online_since: record
                .online_since
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        }
    }
}

/// Identity of the cluster a catalog belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIdentity {
    /// Cluster UUID, generated once.
    pub uuid: Uuid,
    /// Catalog layout version.
    pub metadata_version: i64,
}

// ============================================================================
// Row helpers shared with the version catalog
// ============================================================================

/// Inserts the array, attribute and dimension rows of `desc`.
pub(crate) async fn insert_array_rows(tx: &mut ScopedTransaction, desc: &ArrayDesc) -> Result<()> {
    desc.validate()?;
    tx.execute(Statement::InsertArray(desc.to_record()))
        .await
        .map_err(|err| already_exists_on_duplicate(err, &desc.name))?;
    for attribute in desc.attribute_records() {
        tx.execute(Statement::InsertAttribute(attribute)).await?;
    }
    for dimension in desc.dimension_records() {
        tx.execute(Statement::InsertDimension(dimension)).await?;
    }
    Ok(())
}

pub(crate) async fn select_array_by_name(
    tx: &mut ScopedTransaction,
    name: &str,
    horizon: ArrayId,
) -> Result<Option<ArrayRecord>> {
    let rows = tx
        .execute(Statement::SelectArrayByName {
            name: name.to_string(),
            horizon,
        })
        .await?
        .decode::<ArrayRecord>()?;
    Ok(rows.into_iter().next())
}

pub(crate) async fn load_array(tx: &mut ScopedTransaction, array: ArrayRecord) -> Result<ArrayDesc> {
    let attributes = tx
        .execute(Statement::SelectAttributes { array_id: array.id })
        .await?
        .decode::<AttributeRecord>()?;
    let dimensions = tx
        .execute(Statement::SelectDimensions { array_id: array.id })
        .await?
        .decode::<DimensionRecord>()?;
    Ok(ArrayDesc::from_records(array, attributes, dimensions))
}

fn already_exists_on_duplicate(err: CatalogError, name: &str) -> CatalogError {
    if err.is_uniqueness_violation() {
        CatalogError::already_exists("array", name)
    } else {
        err
    }
}

async fn resolve_array(
    tx: &mut ScopedTransaction,
    name: &str,
    horizon: ArrayId,
    selector: VersionSelector,
) -> Result<Option<ArrayDesc>> {
    let lookup = match selector {
        VersionSelector::Exact(version) if version == VersionId::NONE => {
            base_name(name).to_string()
        }
        VersionSelector::Exact(version) => make_versioned_name(base_name(name), version),
        VersionSelector::Latest => {
            let Some(array) = select_array_by_name(tx, name, horizon).await? else {
                return Ok(None);
            };
            if array.id != array.uaid {
                return load_array(tx, array).await.map(Some);
            }
            let last = tx
                .execute(Statement::SelectLastVersion {
                    array_id: array.id,
                    horizon,
                })
                .await?
                .scalar::<VersionId>("version_id")?;
            if last == VersionId::NONE {
                return load_array(tx, array).await.map(Some);
            }
            make_versioned_name(name, last)
        }
    };
    match select_array_by_name(tx, &lookup, horizon).await? {
        Some(array) => load_array(tx, array).await.map(Some),
        None => Ok(None),
    }
}

// ============================================================================
// MetadataStore
// ============================================================================

/// Schema, instance, library and cluster catalog operations.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    connection: CatalogConnection,
    executor: RestartableExecutor,
}

impl MetadataStore {
    /// Creates a metadata store over a catalog connection.
    #[must_use]
    pub fn new(connection: CatalogConnection, config: &CatalogConfig) -> Self {
        Self {
            connection,
            executor: RestartableExecutor::from_config(config),
        }
    }

    /// Creates a metadata store that owns a new connection to `store`.
    #[must_use]
    pub fn for_store(store: Arc<dyn TransactionalStore>, config: &CatalogConfig) -> Self {
        Self::new(CatalogConnection::new(store), config)
    }

    // ------------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------------

    /// Draws a fresh array id from the cluster-wide sequence.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn get_next_array_id(&self) -> Result<ArrayId> {
        let connection = &self.connection;
        self.executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let id = next_array_id(&mut tx).await;
                tx.finish(id).await
            })
            .await
    }

    /// Stores a new array descriptor.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::InvalidDescriptor`] if `desc` fails validation.
    /// - [`CatalogError::AlreadyExists`] if the name or id is taken.
    pub async fn add_array(&self, desc: &ArrayDesc) -> Result<()> {
        let connection = &self.connection;
        self.executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let inserted = insert_array_rows(&mut tx, desc).await;
                tx.finish(inserted).await
            })
            .await?;
        tracing::debug!(array = %desc.name, id = %desc.id, "array added");
        Ok(())
    }

    /// Returns the array named `name` whose id is within `horizon`.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when no such row is visible.
    pub async fn get_array_desc(&self, name: &str, horizon: ArrayId) -> Result<ArrayDesc> {
        self.find_array_desc(name, horizon)
            .await?
            .ok_or_else(|| CatalogError::not_found("array", name))
    }

    /// Like [`MetadataStore::get_array_desc`] but returns `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted retries.
    pub async fn find_array_desc(&self, name: &str, horizon: ArrayId) -> Result<Option<ArrayDesc>> {
        let connection = &self.connection;
        self.executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let found = match select_array_by_name(&mut tx, name, horizon).await {
                    Ok(Some(array)) => load_array(&mut tx, array).await.map(Some),
                    other => other.map(|_| None),
                };
                tx.finish(found).await
            })
            .await
    }

    /// Resolves `name` to a version within `horizon` and returns its
    /// descriptor. All reads happen in one serializable transaction.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the array or the selected version is
    /// not visible.
    pub async fn get_array_desc_at(
        &self,
        name: &str,
        horizon: ArrayId,
        selector: VersionSelector,
    ) -> Result<ArrayDesc> {
        self.find_array_desc_at(name, horizon, selector)
            .await?
            .ok_or_else(|| match selector {
                VersionSelector::Exact(v) if v != VersionId::NONE => {
                    CatalogError::not_found("array version", make_versioned_name(base_name(name), v))
                }
                _ => CatalogError::not_found("array", name),
            })
    }

    /// Like [`MetadataStore::get_array_desc_at`] but returns `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted retries.
    pub async fn find_array_desc_at(
        &self,
        name: &str,
        horizon: ArrayId,
        selector: VersionSelector,
    ) -> Result<Option<ArrayDesc>> {
        let connection = &self.connection;
        self.executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let found = resolve_array(&mut tx, name, horizon, selector).await;
                tx.finish(found).await
            })
            .await
    }

    /// Returns the array stored at row `id`.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when there is no such row.
    pub async fn get_array_desc_by_id(&self, id: ArrayId) -> Result<ArrayDesc> {
        let connection = &self.connection;
        self.executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let found = select_array_by_id(&mut tx, id).await;
                tx.finish(found).await
            })
            .await?
            .ok_or_else(|| CatalogError::not_found("array", id))
    }

    /// Returns whether an array row named `name` exists.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn contains_array(&self, name: &str) -> Result<bool> {
        let connection = &self.connection;
        self.executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let found = select_array_by_name(&mut tx, name, ArrayId::MAX)
                    .await
                    .map(|r| r.is_some());
                tx.finish(found).await
            })
            .await
    }

    /// Returns every array name, versions included, in name order.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn get_array_names(&self) -> Result<Vec<String>> {
        let connection = &self.connection;
        let records = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let rows = select_arrays(&mut tx).await;
                tx.finish(rows).await
            })
            .await?;
        Ok(records.into_iter().map(|r| r.name).collect())
    }

    /// Returns full descriptors of every array, optionally skipping versions.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted retries.
    pub async fn get_arrays(&self, ignore_versions: bool) -> Result<Vec<ArrayDesc>> {
        let connection = &self.connection;
        self.executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let arrays = load_arrays(&mut tx, ignore_versions).await;
                tx.finish(arrays).await
            })
            .await
    }

    /// Deletes `name` and all of its versions. Returns whether anything
    /// was removed.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted retries.
    pub async fn delete_array(&self, name: &str) -> Result<bool> {
        let removed = self
            .execute_affected(
                IsolationLevel::Serializable,
                &Statement::DeleteArrayFamily {
                    name: name.to_string(),
                },
            )
            .await?;
        tracing::debug!(array = name, removed, "array deleted");
        Ok(removed > 0)
    }

    /// Deletes the versions of `name` stored below row `below`.
    ///
    /// Returns the number of version rows removed.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted retries.
    pub async fn delete_array_versions(&self, name: &str, below: ArrayId) -> Result<u64> {
        let removed = self
            .execute_affected(
                IsolationLevel::Serializable,
                &Statement::DeleteArrayVersionsBelow {
                    name: name.to_string(),
                    below,
                },
            )
            .await?;
        tracing::debug!(array = name, below = %below, removed, "array versions deleted");
        Ok(removed)
    }

    /// Deletes the array row `id`. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted retries.
    pub async fn delete_array_by_id(&self, id: ArrayId) -> Result<bool> {
        self.execute_affected(IsolationLevel::Serializable, &Statement::DeleteArrayById { id })
            .await
            .map(|removed| removed > 0)
    }

    /// Renames `old_name` and every `old_name@version` row.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::NotFound`] if nothing is named `old_name`.
    /// - [`CatalogError::AlreadyExists`] if a renamed row would clash.
    pub async fn rename_array(&self, old_name: &str, new_name: &str) -> Result<()> {
        let connection = &self.connection;
        self.executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let renamed = match tx
                    .execute(Statement::RenameArrayFamily {
                        old_name: old_name.to_string(),
                        new_name: new_name.to_string(),
                    })
                    .await
                {
                    Ok(r) if r.affected_rows == 0 => Err(CatalogError::not_found("array", old_name)),
                    Ok(_) => Ok(()),
                    Err(err) => Err(already_exists_on_duplicate(err, new_name)),
                };
                tx.finish(renamed).await
            })
            .await?;
        tracing::info!(from = old_name, to = new_name, "array renamed");
        Ok(())
    }

    /// Marks every transient array invalid. Run once at startup, since
    /// transient arrays do not survive a restart.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted retries.
    pub async fn invalidate_temp_arrays(&self) -> Result<u64> {
        let invalidated = self
            .execute_affected(
                IsolationLevel::Serializable,
                &Statement::UpdateArrayFlags {
                    having_flags: ArrayDesc::TRANSIENT,
                    set_flags: ArrayDesc::INVALID,
                },
            )
            .await?;
        if invalidated > 0 {
            tracing::info!(invalidated, "invalidated transient arrays");
        }
        Ok(invalidated)
    }

    // ------------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------------

    /// Registers an instance and returns its assigned id.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn add_instance(&self, host: &str, port: u16, path: &str) -> Result<InstanceId> {
        let connection = &self.connection;
        let instance_id = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let id = tx
                    .execute(Statement::InsertInstance {
                        host: host.to_string(),
                        port,
                        path: path.to_string(),
                    })
                    .await
                    .and_then(|r| r.scalar::<InstanceId>("instance_id").map_err(Into::into));
                tx.finish(id).await
            })
            .await?;
        tracing::info!(instance_id = instance_id.get(), host, port, "instance registered");
        Ok(instance_id)
    }

    /// Returns every registered instance in id order.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn get_instances(&self) -> Result<Vec<InstanceDesc>> {
        let records = self
            .select_instances(Statement::SelectInstances)
            .await?;
        Ok(records.into_iter().map(InstanceDesc::from_record).collect())
    }

    /// Returns one instance.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] for an unknown id.
    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceDesc> {
        self.select_instances(Statement::SelectInstance { instance_id })
            .await?
            .into_iter()
            .next()
            .map(InstanceDesc::from_record)
            .ok_or_else(|| CatalogError::not_found("instance", instance_id))
    }

    /// Records `instance_id` as online at `host:port` from now.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] for an unknown id.
    pub async fn mark_instance_online(
        &self,
        instance_id: InstanceId,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let updated = self
            .execute_affected(
                IsolationLevel::ReadCommitted,
                &Statement::MarkInstanceOnline {
                    instance_id,
                    host: host.to_string(),
                    port,
                    online_since: Utc::now().timestamp(),
                },
            )
            .await?;
        if updated == 0 {
            return Err(CatalogError::not_found("instance", instance_id));
        }
        tracing::info!(instance_id = instance_id.get(), host, port, "instance online");
        Ok(())
    }

    /// Records `instance_id` as offline.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] for an unknown id.
    pub async fn mark_instance_offline(&self, instance_id: InstanceId) -> Result<()> {
        let updated = self
            .execute_affected(
                IsolationLevel::ReadCommitted,
                &Statement::MarkInstanceOffline { instance_id },
            )
            .await?;
        if updated == 0 {
            return Err(CatalogError::not_found("instance", instance_id));
        }
        tracing::info!(instance_id = instance_id.get(), "instance offline");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Libraries
    // ------------------------------------------------------------------------

    /// Registers a plugin library.
    ///
    /// # Errors
    ///
    /// [`CatalogError::AlreadyExists`] if it is already registered.
    pub async fn add_library(&self, name: &str) -> Result<()> {
        self.execute_affected(
            IsolationLevel::ReadCommitted,
            &Statement::InsertLibrary {
                name: name.to_string(),
            },
        )
        .await
        .map_err(|err| {
            if err.is_uniqueness_violation() {
                CatalogError::already_exists("library", name)
            } else {
                err
            }
        })?;
        Ok(())
    }

    /// Returns registered library names in order.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn get_libraries(&self) -> Result<Vec<String>> {
        let connection = &self.connection;
        self.executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let names = match tx.execute(Statement::SelectLibraries).await {
                    Ok(result) => result
                        .rows
                        .iter()
                        .map(|row| row.get::<String>("name").map_err(CatalogError::from))
                        .collect(),
                    Err(err) => Err(err),
                };
                tx.finish(names).await
            })
            .await
    }

    /// Unregisters a library. Returns whether it was registered.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn remove_library(&self, name: &str) -> Result<bool> {
        self.execute_affected(
            IsolationLevel::ReadCommitted,
            &Statement::DeleteLibrary {
                name: name.to_string(),
            },
        )
        .await
        .map(|removed| removed > 0)
    }

    // ------------------------------------------------------------------------
    // Cluster
    // ------------------------------------------------------------------------

    /// Returns the cluster identity, creating it on first call.
    ///
    /// # Errors
    ///
    /// Returns store errors, exhausted retries, or
    /// [`CatalogError::Internal`] if the stored UUID is malformed.
    pub async fn initialize_cluster(&self) -> Result<ClusterIdentity> {
        let connection = &self.connection;
        let record = self
            .executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let record = select_or_create_cluster(&mut tx).await;
                tx.finish(record).await
            })
            .await?;
        let uuid = Uuid::parse_str(&record.cluster_uuid).map_err(|e| {
            CatalogError::internal(format!(
                "malformed cluster uuid '{}': {e}",
                record.cluster_uuid
            ))
        })?;
        tracing::info!(cluster_uuid = %uuid, metadata_version = record.metadata_version, "cluster identity");
        Ok(ClusterIdentity {
            uuid,
            metadata_version: record.metadata_version,
        })
    }

    async fn execute_affected(&self, isolation: IsolationLevel, statement: &Statement) -> Result<u64> {
        let connection = &self.connection;
        let work = move || async move {
            let mut tx = connection.begin(isolation).await?;
            let affected = tx.execute(statement.clone()).await.map(|r| r.affected_rows);
            tx.finish(affected).await
        };
        match isolation {
            IsolationLevel::Serializable => self.executor.run_serializable(work).await,
            IsolationLevel::ReadCommitted => self.executor.run(work).await,
        }
    }

    async fn select_instances(&self, statement: Statement) -> Result<Vec<InstanceRecord>> {
        let connection = &self.connection;
        let statement = &statement;
        self.executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let rows = tx
                    .execute(statement.clone())
                    .await
                    .and_then(|r| r.decode::<InstanceRecord>().map_err(CatalogError::from));
                tx.finish(rows).await
            })
            .await
    }
}

async fn next_array_id(tx: &mut ScopedTransaction) -> Result<ArrayId> {
    Ok(tx
        .execute(Statement::NextArrayId)
        .await?
        .scalar::<ArrayId>("array_id")?)
}

async fn select_array_by_id(tx: &mut ScopedTransaction, id: ArrayId) -> Result<Option<ArrayDesc>> {
    let rows = tx
        .execute(Statement::SelectArrayById { id })
        .await?
        .decode::<ArrayRecord>()?;
    match rows.into_iter().next() {
        Some(array) => load_array(tx, array).await.map(Some),
        None => Ok(None),
    }
}

async fn select_arrays(tx: &mut ScopedTransaction) -> Result<Vec<ArrayRecord>> {
    Ok(tx.execute(Statement::SelectArrays).await?.decode::<ArrayRecord>()?)
}

async fn load_arrays(tx: &mut ScopedTransaction, ignore_versions: bool) -> Result<Vec<ArrayDesc>> {
    let records = select_arrays(tx).await?;
    let mut arrays = Vec::with_capacity(records.len());
    for record in records {
        if ignore_versions && record.id != record.uaid {
            continue;
        }
        arrays.push(load_array(tx, record).await?);
    }
    Ok(arrays)
}

async fn select_or_create_cluster(tx: &mut ScopedTransaction) -> Result<ClusterRecord> {
    let existing = tx
        .execute(Statement::SelectCluster)
        .await?
        .decode::<ClusterRecord>()?;
    if let Some(record) = existing.into_iter().next() {
        return Ok(record);
    }
    let record = ClusterRecord {
        cluster_uuid: Uuid::new_v4().to_string(),
        metadata_version: METADATA_VERSION,
    };
    tx.execute(Statement::InsertCluster(record.clone())).await?;
    Ok(record)
}
