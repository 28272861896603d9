//! Array version lineage and batched version resolution.
//!
//! Versions are numbered per base array starting at 1. A version number is
//! issued in the same transaction that inserts the versioned array row, so
//! neither can exist without the other.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quiver_core::config::CatalogConfig;
use quiver_core::id::{ArrayId, VersionId};
use quiver_core::store::{
    DimensionRecord, IsolationLevel, Statement, TransactionalStore, VersionRecord,
};
use serde::{Deserialize, Serialize};

use crate::array::{ArrayDesc, PhysicalBoundaries, base_name};
use crate::connection::{CatalogConnection, ScopedTransaction};
use crate::error::{CatalogError, Result};
use crate::executor::RestartableExecutor;
use crate::lock::LockDesc;
use crate::metadata::insert_array_rows;
use crate::metrics;

/// One version of a base array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDesc {
    /// Array row holding the version.
    pub version_array_id: ArrayId,
    /// Version number.
    pub version_id: VersionId,
    /// Creation time.
    pub time_stamp: DateTime<Utc>,
}

impl VersionDesc {
    fn from_record(record: &VersionRecord) -> Self {
        Self {
            version_array_id: record.version_array_id,
            version_id: record.version_id,
            time_stamp: DateTime::from_timestamp(record.time_stamp, 0).unwrap_or_default(),
        }
    }
}

/// Issues the next version number of `base` for the array row
/// `version_array_id`, inside the caller's transaction.
///
/// The caller must insert the versioned array row in the same transaction.
///
/// # Errors
///
/// Returns store errors; a concurrent issuer surfaces as a serialization
/// conflict or uniqueness violation at the store.
pub async fn create_new_version(
    tx: &mut ScopedTransaction,
    base: ArrayId,
    version_array_id: ArrayId,
) -> Result<VersionId> {
    let current = tx
        .execute(Statement::SelectMaxVersionId { array_id: base })
        .await?
        .scalar::<VersionId>("max_version_id")?;
    let version_id = current.next();
    tx.execute(Statement::InsertVersion(VersionRecord {
        array_id: base,
        version_array_id,
        version_id,
        time_stamp: Utc::now().timestamp(),
    }))
    .await?;
    Ok(version_id)
}

async fn add_version_rows(
    tx: &mut ScopedTransaction,
    unversioned: Option<&ArrayDesc>,
    versioned: &ArrayDesc,
) -> Result<VersionId> {
    if let Some(base) = unversioned {
        insert_array_rows(tx, base).await?;
    }
    let version_id = create_new_version(tx, versioned.uaid, versioned.id).await?;
    if versioned.version != VersionId::NONE && versioned.version != version_id {
        return Err(CatalogError::invalid_argument(format!(
            "array '{}' expected version {} but the next version is {version_id}",
            versioned.name, versioned.version
        )));
    }
    insert_array_rows(tx, &versioned.versioned(versioned.id, version_id)).await?;
    Ok(version_id)
}

async fn select_max_ids(
    tx: &mut ScopedTransaction,
    pattern: String,
) -> Result<HashMap<String, ArrayId>> {
    let result = tx.execute(Statement::SelectMaxArrayIds { pattern }).await?;
    result
        .rows
        .iter()
        .map(|row| -> Result<(String, ArrayId)> {
            Ok((row.get("base_name")?, row.get("max_id")?))
        })
        .collect()
}

fn max_id_pattern<'a>(base_names: impl IntoIterator<Item = &'a str>) -> String {
    let alternatives: Vec<String> = base_names.into_iter().map(regex::escape).collect();
    format!("^(?:{})(?:@[^@]*)?$", alternatives.join("|"))
}

/// Version lineage, boundaries and "as of" resolution.
#[derive(Debug, Clone)]
pub struct VersionCatalog {
    connection: CatalogConnection,
    executor: RestartableExecutor,
}

impl VersionCatalog {
    /// Creates a version catalog over a catalog connection.
    #[must_use]
    pub fn new(connection: CatalogConnection, config: &CatalogConfig) -> Self {
        Self {
            connection,
            executor: RestartableExecutor::from_config(config),
        }
    }

    /// Creates a version catalog that owns a new connection to `store`.
    #[must_use]
    pub fn for_store(store: Arc<dyn TransactionalStore>, config: &CatalogConfig) -> Self {
        Self::new(CatalogConnection::new(store), config)
    }

    /// Stores a new version of an array in one serializable transaction.
    ///
    /// `unversioned`, when given, is the base array row created alongside
    /// its first version. `versioned` supplies the new row's id (`id`), its
    /// base (`uaid`) and its schema; its row is stored as `base@version`.
    /// If `versioned.version` is set it must equal the version issued.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::InvalidDescriptor`] if a descriptor fails validation.
    /// - [`CatalogError::InvalidArgument`] if a preset version is stale.
    /// - [`CatalogError::AlreadyExists`] if a row id or name is taken.
    /// - Exhausted retry errors.
    pub async fn add_array_version(
        &self,
        unversioned: Option<&ArrayDesc>,
        versioned: &ArrayDesc,
    ) -> Result<VersionId> {
        let connection = &self.connection;
        let version_id = self
            .executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let added = add_version_rows(&mut tx, unversioned, versioned).await;
                tx.finish(added).await
            })
            .await?;
        metrics::record_version_created();
        tracing::debug!(
            array = versioned.base_name(),
            base_id = %versioned.uaid,
            version_array_id = %versioned.id,
            version = %version_id,
            "array version created"
        );
        Ok(version_id)
    }

    /// Returns the newest version of `base` whose row is within `horizon`,
    /// or [`VersionId::NONE`].
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn get_last_version(&self, base: ArrayId, horizon: ArrayId) -> Result<VersionId> {
        self.read_scalar(
            Statement::SelectLastVersion {
                array_id: base,
                horizon,
            },
            "version_id",
        )
        .await
    }

    /// Stamps each lock's `array_catalog_id` with the largest row id of its
    /// array, resolving every lock in one serializable round trip.
    ///
    /// Locks on arrays absent from the catalog are left unchanged.
    ///
    /// # Errors
    ///
    /// [`CatalogError::InvalidArgument`] for an empty batch; store errors and
    /// exhausted retries otherwise.
    pub async fn get_current_version(&self, locks: &mut [LockDesc]) -> Result<()> {
        if locks.is_empty() {
            return Err(CatalogError::invalid_argument(
                "current version requested for an empty lock set",
            ));
        }
        let names: BTreeSet<&str> = locks.iter().map(|l| base_name(&l.array_name)).collect();
        let pattern = max_id_pattern(names);

        let connection = &self.connection;
        let pattern = &pattern;
        let max_ids = self
            .executor
            .run_serializable(move || async move {
                let mut tx = connection.begin(IsolationLevel::Serializable).await?;
                let found = select_max_ids(&mut tx, pattern.clone()).await;
                tx.finish(found).await
            })
            .await?;

        for lock in locks.iter_mut() {
            if let Some(id) = max_ids.get(base_name(&lock.array_name)) {
                lock.array_catalog_id = *id;
            }
        }
        tracing::debug!(locks = locks.len(), resolved = max_ids.len(), "resolved current versions");
        Ok(())
    }

    /// Returns the row id of the oldest version of `base`, or
    /// [`ArrayId::INVALID`] if it has none.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn get_oldest_array_version(&self, base: ArrayId) -> Result<ArrayId> {
        self.read_scalar(
            Statement::SelectOldestVersion { array_id: base },
            "version_array_id",
        )
        .await
    }

    /// Returns the newest version of `base` created at or before `at`, or
    /// [`VersionId::NONE`].
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn lookup_version_by_timestamp(
        &self,
        base: ArrayId,
        at: DateTime<Utc>,
    ) -> Result<VersionId> {
        self.read_scalar(
            Statement::SelectVersionByTimestamp {
                array_id: base,
                time_stamp: at.timestamp(),
            },
            "version_id",
        )
        .await
    }

    /// Returns every version of `base` in version order.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn get_array_versions(&self, base: ArrayId) -> Result<Vec<VersionDesc>> {
        let connection = &self.connection;
        let records = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let rows = tx
                    .execute(Statement::SelectVersions { array_id: base })
                    .await
                    .and_then(|r| r.decode::<VersionRecord>().map_err(CatalogError::from));
                tx.finish(rows).await
            })
            .await?;
        Ok(records.iter().map(VersionDesc::from_record).collect())
    }

    /// Deletes one version row. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn delete_version(&self, base: ArrayId, version_id: VersionId) -> Result<bool> {
        let connection = &self.connection;
        self.executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let deleted = tx
                    .execute(Statement::DeleteVersion {
                        array_id: base,
                        version_id,
                    })
                    .await
                    .map(|r| r.affected_rows > 0);
                tx.finish(deleted).await
            })
            .await
    }

    /// Widens the stored current bounds of the array row `desc` names to
    /// cover `bounds`. Bounds only ever move outward; narrower values are
    /// ignored. Coordinates are first trimmed to the declared dimensions.
    ///
    /// # Errors
    ///
    /// Returns store errors and exhausted connection retries.
    pub async fn update_array_boundaries(
        &self,
        desc: &ArrayDesc,
        bounds: &PhysicalBoundaries,
    ) -> Result<()> {
        if bounds.is_empty() {
            return Ok(());
        }
        let trimmed = bounds.trim_to_dims(&desc.dimensions);
        let bounds = &trimmed;

        let connection = &self.connection;
        let array_id = desc.id;
        let widened = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let widened = widen_boundaries(&mut tx, array_id, bounds).await;
                tx.finish(widened).await
            })
            .await?;
        tracing::trace!(array = %desc.name, widened, "array boundaries updated");
        Ok(())
    }

    /// Returns the current low coordinate of each dimension of `array_id`.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the array has no dimensions.
    pub async fn get_low_boundary(&self, array_id: ArrayId) -> Result<Vec<i64>> {
        let dims = self.select_dimensions(array_id).await?;
        Ok(dims.iter().map(|d| d.curr_start).collect())
    }

    /// Returns the current high coordinate of each dimension of `array_id`.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the array has no dimensions.
    pub async fn get_high_boundary(&self, array_id: ArrayId) -> Result<Vec<i64>> {
        let dims = self.select_dimensions(array_id).await?;
        Ok(dims.iter().map(|d| d.curr_end).collect())
    }

    async fn select_dimensions(&self, array_id: ArrayId) -> Result<Vec<DimensionRecord>> {
        let connection = &self.connection;
        let dims = self
            .executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let rows = tx
                    .execute(Statement::SelectDimensions { array_id })
                    .await
                    .and_then(|r| r.decode::<DimensionRecord>().map_err(CatalogError::from));
                tx.finish(rows).await
            })
            .await?;
        if dims.is_empty() {
            return Err(CatalogError::not_found("array dimensions", array_id));
        }
        Ok(dims)
    }

    async fn read_scalar<T>(&self, statement: Statement, column: &'static str) -> Result<T>
    where
        T: quiver_core::store::FromValue,
    {
        let connection = &self.connection;
        let statement = &statement;
        self.executor
            .run(move || async move {
                let mut tx = connection.begin(IsolationLevel::ReadCommitted).await?;
                let value = tx
                    .execute(statement.clone())
                    .await
                    .and_then(|r| r.scalar::<T>(column).map_err(CatalogError::from));
                tx.finish(value).await
            })
            .await
    }
}

async fn widen_boundaries(
    tx: &mut ScopedTransaction,
    array_id: ArrayId,
    bounds: &PhysicalBoundaries,
) -> Result<u64> {
    let mut widened = 0;
    for ((ordinal, low), high) in (0_u32..).zip(&bounds.start).zip(&bounds.end) {
        widened += tx
            .execute(Statement::WidenDimensionLow {
                array_id,
                ordinal,
                bound: *low,
            })
            .await?
            .affected_rows;
        widened += tx
            .execute(Statement::WidenDimensionHigh {
                array_id,
                ordinal,
                bound: *high,
            })
            .await?
            .affected_rows;
    }
    Ok(widened)
}

#[cfg(test)]
mod tests {
    use quiver_core::id::{InstanceId, QueryId};
    use quiver_core::lock_mode::{InstanceRole, LockMode};
    use quiver_core::memory::MemoryStore;

    use super::*;
    use crate::array::{AttributeDesc, DimensionDesc, MAX_COORDINATE, MIN_COORDINATE};
    use crate::metadata::MetadataStore;

    struct Fixture {
        meta: MetadataStore,
        versions: VersionCatalog,
    }

    fn fixture() -> Fixture {
        let connection = CatalogConnection::new(Arc::new(MemoryStore::new()));
        let config = CatalogConfig::default();
        Fixture {
            meta: MetadataStore::new(connection.clone(), &config),
            versions: VersionCatalog::new(connection, &config),
        }
    }

    fn schema(name: &str) -> ArrayDesc {
        ArrayDesc::new(
            name,
            vec![AttributeDesc::new("v", "double")],
            vec![
                DimensionDesc::new("i", 0, 999, 100),
                DimensionDesc::new("j", 0, 999, 100),
            ],
        )
    }

    async fn create_base(fx: &Fixture, name: &str) -> ArrayDesc {
        let id = fx.meta.get_next_array_id().await.expect("id");
        let base = schema(name).with_ids(id, id);
        fx.meta.add_array(&base).await.expect("add base");
        base
    }

    async fn new_version(fx: &Fixture, base: &ArrayDesc) -> (ArrayId, VersionId) {
        let id = fx.meta.get_next_array_id().await.expect("id");
        let versioned = base.clone().with_ids(id, base.id);
        let version = fx
            .versions
            .add_array_version(None, &versioned)
            .await
            .expect("add version");
        (id, version)
    }

    #[test]
    fn test_max_id_pattern_escapes_names() {
        let pattern = max_id_pattern(["A", "b.c"]);
        assert_eq!(pattern, r"^(?:A|b\.c)(?:@[^@]*)?$");
        let regex = regex::Regex::new(&pattern).expect("valid");
        assert!(regex.is_match("A@12"));
        assert!(regex.is_match("b.c"));
        assert!(!regex.is_match("bxc"));
        assert!(!regex.is_match("AB"));
    }

    #[tokio::test]
    async fn test_versions_are_sequential() {
        let fx = fixture();
        let base = create_base(&fx, "A").await;
        let (first_id, first) = new_version(&fx, &base).await;
        let (second_id, second) = new_version(&fx, &base).await;
        assert_eq!(first, VersionId::new(1));
        assert_eq!(second, VersionId::new(2));

        let versions = fx.versions.get_array_versions(base.id).await.expect("list");
        let ids: Vec<_> = versions.iter().map(|v| (v.version_array_id, v.version_id)).collect();
        assert_eq!(ids, vec![(first_id, first), (second_id, second)]);

        let row = fx
            .meta
            .get_array_desc("A@2", ArrayId::MAX)
            .await
            .expect("versioned row");
        assert_eq!(row.id, second_id);
        assert_eq!(row.uaid, base.id);
        assert_eq!(row.version, second);
    }

    #[tokio::test]
    async fn test_first_version_with_base_in_one_transaction() {
        let fx = fixture();
        let base_id = fx.meta.get_next_array_id().await.expect("id");
        let version_id = fx.meta.get_next_array_id().await.expect("id");
        let base = schema("B").with_ids(base_id, base_id);
        let versioned = base.clone().with_ids(version_id, base_id);

        let version = fx
            .versions
            .add_array_version(Some(&base), &versioned)
            .await
            .expect("add");
        assert_eq!(version, VersionId::new(1));
        assert!(fx.meta.contains_array("B").await.expect("base"));
        assert!(fx.meta.contains_array("B@1").await.expect("version"));
    }

    #[tokio::test]
    async fn test_stale_preset_version_is_rejected_atomically() {
        let fx = fixture();
        let base = create_base(&fx, "A").await;
        new_version(&fx, &base).await;

        let id = fx.meta.get_next_array_id().await.expect("id");
        let stale = base.versioned(id, VersionId::new(1));
        let err = fx
            .versions
            .add_array_version(None, &stale)
            .await
            .expect_err("stale");
        assert!(matches!(err, CatalogError::InvalidArgument { .. }));
        assert_eq!(fx.versions.get_array_versions(base.id).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_last_version_respects_horizon() {
        let fx = fixture();
        let base = create_base(&fx, "A").await;
        assert_eq!(
            fx.versions.get_last_version(base.id, ArrayId::MAX).await.expect("last"),
            VersionId::NONE
        );
        let (first_id, _) = new_version(&fx, &base).await;
        new_version(&fx, &base).await;

        assert_eq!(
            fx.versions.get_last_version(base.id, first_id).await.expect("last"),
            VersionId::new(1)
        );
        assert_eq!(
            fx.versions.get_last_version(base.id, ArrayId::MAX).await.expect("last"),
            VersionId::new(2)
        );
        assert_eq!(
            fx.versions.get_oldest_array_version(base.id).await.expect("oldest"),
            first_id
        );
    }

    #[tokio::test]
    async fn test_lookup_by_timestamp_and_delete() {
        let fx = fixture();
        let base = create_base(&fx, "A").await;
        assert_eq!(
            fx.versions
                .lookup_version_by_timestamp(base.id, Utc::now())
                .await
                .expect("lookup"),
            VersionId::NONE
        );
        new_version(&fx, &base).await;
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(
            fx.versions
                .lookup_version_by_timestamp(base.id, later)
                .await
                .expect("lookup"),
            VersionId::new(1)
        );
        let long_ago = DateTime::from_timestamp(0, 0).expect("epoch");
        assert_eq!(
            fx.versions
                .lookup_version_by_timestamp(base.id, long_ago)
                .await
                .expect("lookup"),
            VersionId::NONE
        );

        assert!(fx.versions.delete_version(base.id, VersionId::new(1)).await.expect("delete"));
        assert!(!fx.versions.delete_version(base.id, VersionId::new(1)).await.expect("gone"));
        assert_eq!(
            fx.versions.get_oldest_array_version(base.id).await.expect("oldest"),
            ArrayId::INVALID
        );
    }

    #[tokio::test]
    async fn test_current_version_stamps_locks() {
        let fx = fixture();
        let a = create_base(&fx, "A").await;
        let (a_latest, _) = new_version(&fx, &a).await;
        let b = create_base(&fx, "B").await;
        create_base(&fx, "AB").await;

        let lock = |name: &str| {
            LockDesc::new(
                name,
                QueryId::new(1),
                InstanceId::new(0),
                InstanceRole::Coord,
                LockMode::Rd,
            )
        };
        let mut locks = vec![lock("A"), lock("B"), lock("missing")];
        fx.versions
            .get_current_version(&mut locks)
            .await
            .expect("resolve");

        assert_eq!(locks[0].array_catalog_id, a_latest);
        assert_eq!(locks[1].array_catalog_id, b.id);
        assert_eq!(locks[2].array_catalog_id, ArrayId::INVALID);

        let mut none: Vec<LockDesc> = Vec::new();
        assert!(matches!(
            fx.versions.get_current_version(&mut none).await,
            Err(CatalogError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_boundaries_only_widen() {
        let fx = fixture();
        let base = create_base(&fx, "A").await;

        let bounds = PhysicalBoundaries::new(vec![10, 20], vec![30, 40]);
        fx.versions
            .update_array_boundaries(&base, &bounds)
            .await
            .expect("widen");
        assert_eq!(fx.versions.get_low_boundary(base.id).await.expect("low"), vec![10, 20]);
        assert_eq!(fx.versions.get_high_boundary(base.id).await.expect("high"), vec![30, 40]);

        let narrower = PhysicalBoundaries::new(vec![15, 25], vec![25, 35]);
        fx.versions
            .update_array_boundaries(&base, &narrower)
            .await
            .expect("no-op");
        assert_eq!(fx.versions.get_low_boundary(base.id).await.expect("low"), vec![10, 20]);
        assert_eq!(fx.versions.get_high_boundary(base.id).await.expect("high"), vec![30, 40]);

        let wider = PhysicalBoundaries::new(vec![5, 20], vec![30, 90]);
        fx.versions
            .update_array_boundaries(&base, &wider)
            .await
            .expect("widen");
        assert_eq!(fx.versions.get_low_boundary(base.id).await.expect("low"), vec![5, 20]);
        assert_eq!(fx.versions.get_high_boundary(base.id).await.expect("high"), vec![30, 90]);

        fx.versions
            .update_array_boundaries(&base, &PhysicalBoundaries::default())
            .await
            .expect("empty is a no-op");
        let out_of_range = PhysicalBoundaries::new(vec![-50, 20, 3], vec![5000, 90, 4]);
        fx.versions
            .update_array_boundaries(&base, &out_of_range)
            .await
            .expect("trimmed");
        assert_eq!(fx.versions.get_low_boundary(base.id).await.expect("low"), vec![0, 20]);
        assert_eq!(fx.versions.get_high_boundary(base.id).await.expect("high"), vec![999, 90]);
        assert!(matches!(
            fx.versions.get_low_boundary(ArrayId::new(999)).await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_boundaries_widen_the_given_version_row() {
        let fx = fixture();
        let base = create_base(&fx, "A").await;
        let (id, version) = new_version(&fx, &base).await;
        let versioned = base.versioned(id, version);

        let bounds = PhysicalBoundaries::new(vec![1, 2], vec![10, 20]);
        fx.versions
            .update_array_boundaries(&versioned, &bounds)
            .await
            .expect("widen");

        assert_eq!(fx.versions.get_low_boundary(id).await.expect("low"), vec![1, 2]);
        assert_eq!(fx.versions.get_high_boundary(id).await.expect("high"), vec![10, 20]);
        assert_eq!(
            fx.versions.get_low_boundary(base.id).await.expect("low"),
            vec![MAX_COORDINATE, MAX_COORDINATE]
        );
        assert_eq!(
            fx.versions.get_high_boundary(base.id).await.expect("high"),
            vec![MIN_COORDINATE, MIN_COORDINATE]
        );
    }
}
