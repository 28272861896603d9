//! Transactional store contract required by the catalog.
//!
//! The catalog never talks to a concrete database. It opens scoped
//! transactions through [`TransactionalStore`], executes named, parameterised
//! [`Statement`]s and reads back [`Row`]s plus an affected-row count.
//! Failures come back as [`StoreError`] carrying a [`FailureKind`], which is
//! the only classification the retry layer looks at.
//!
//! # Compare-and-insert
//!
//! The array lock protocol is expressed entirely as conditional inserts:
//! [`Statement::InsertLockUnless`] inserts a lock row unless a conflicting row
//! (described by [`LockConflict`]) already exists, and
//! [`Statement::CopyCoordinatorLock`] copies the coordinator's row for a
//! worker. Under [`IsolationLevel::Serializable`] two conflicting attempts
//! cannot both commit; an implementation must guarantee that.

use std::fmt;

use async_trait::async_trait;

use crate::id::{ArrayId, InstanceId, QueryId, VersionId};
use crate::lock_mode::{InstanceRole, LockMode};

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Failure classification
// ============================================================================

/// How a store failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The connection to the store dropped; the transaction may be retried.
    ConnectionLost,
    /// The transaction lost a serialization race; it may be retried.
    SerializationConflict,
    /// A unique key was violated.
    UniquenessViolation,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Maps a SQLSTATE code onto a failure kind.
    ///
    /// Class `08` (connection exception) and the admin shutdown codes are
    /// connection losses; `40001` and `40P01` are serialization conflicts;
    /// `23505` is a unique violation.
    #[must_use]
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "40001" | "40P01" => Self::SerializationConflict,
            "23505" => Self::UniquenessViolation,
            "57P01" | "57P02" | "57P03" => Self::ConnectionLost,
            c if c.starts_with("08") => Self::ConnectionLost,
            _ => Self::Other,
        }
    }

    /// Returns a stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection_lost",
            Self::SerializationConflict => "serialization_conflict",
            Self::UniquenessViolation => "uniqueness_violation",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the store.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} in statement '{}': {message}", .statement.unwrap_or("<none>"))]
pub struct StoreError {
    kind: FailureKind,
    statement: Option<&'static str>,
    message: String,
}

impl StoreError {
    /// Creates a new store error.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            statement: None,
            message: message.into(),
        }
    }

    /// Creates a store error from a driver SQLSTATE code.
    #[must_use]
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        Self::new(FailureKind::from_sqlstate(code), message)
    }

    /// Creates a connection-lost error.
    #[must_use]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ConnectionLost, message)
    }

    /// Creates a serialization-conflict error.
    #[must_use]
    pub fn serialization_conflict(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SerializationConflict, message)
    }

    /// Creates a uniqueness-violation error.
    #[must_use]
    pub fn uniqueness_violation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UniquenessViolation, message)
    }

    /// Creates an unclassified error.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }

    /// Attaches the name of the statement that failed.
    #[must_use]
    pub fn with_statement(mut self, statement: &'static str) -> Self {
        self.statement = Some(statement);
        self
    }

    /// Classifies this failure.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Returns the failing statement name, if known.
    #[must_use]
    pub const fn statement(&self) -> Option<&'static str> {
        self.statement
    }

    /// Returns the driver message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

// ============================================================================
// Values and rows
// ============================================================================

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// A 64-bit signed integer.
    Int(i64),
    /// A text value.
    Text(String),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

macro_rules! id_value {
    ($($id:ty),*) => {
        $(
            impl From<$id> for Value {
                fn from(value: $id) -> Self {
                    Self::from(value.get())
                }
            }

            impl FromValue for $id {
                fn from_value(value: &Value) -> std::result::Result<Self, String> {
                    u64::from_value(value).map(<$id>::new)
                }
            }
        )*
    };
}

id_value!(ArrayId, VersionId, QueryId, InstanceId);

impl From<LockMode> for Value {
    fn from(value: LockMode) -> Self {
        Self::Int(value.code())
    }
}

impl From<InstanceRole> for Value {
    fn from(value: InstanceRole) -> Self {
        Self::Int(value.code())
    }
}

/// Decodes a column value into a Rust type.
pub trait FromValue: Sized {
    /// Converts the value, describing the mismatch on failure.
    ///
    /// # Errors
    ///
    /// Returns a description when the value has the wrong type or range.
    fn from_value(value: &Value) -> std::result::Result<Self, String>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Int(v) => Ok(*v),
            other => Err(format!("expected integer, got {other:?}")),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let v = i64::from_value(value)?;
        Self::try_from(v).map_err(|_| format!("expected non-negative integer, got {v}"))
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let v = i64::from_value(value)?;
        Self::try_from(v).map_err(|_| format!("integer {v} out of range"))
    }
}

impl FromValue for u16 {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let v = i64::from_value(value)?;
        Self::try_from(v).map_err(|_| format!("integer {v} out of range"))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Text(v) => Ok(v.clone()),
            other => Err(format!("expected text, got {other:?}")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for LockMode {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        Self::from_code(i64::from_value(value)?).map_err(|e| e.to_string())
    }
}

impl FromValue for InstanceRole {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        Self::from_code(i64::from_value(value)?).map_err(|e| e.to_string())
    }
}

/// A result row: named columns in select order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(&'static str, Value)>,
}

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column.
    #[must_use]
    pub fn with(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.columns.push((column, value.into()));
        self
    }

    /// Returns the raw value of a column.
    #[must_use]
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }

    /// Decodes a column.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is missing or has the wrong type.
    pub fn get<T: FromValue>(&self, column: &str) -> StoreResult<T> {
        let value = self
            .value(column)
            .ok_or_else(|| StoreError::other(format!("column '{column}' not in result row")))?;
        T::from_value(value)
            .map_err(|e| StoreError::other(format!("column '{column}': {e}")))
    }
}

/// A persisted record that round-trips through [`Row`].
pub trait Record: Sized {
    /// Encodes the record as a result row.
    fn to_row(&self) -> Row;

    /// Decodes the record from a result row.
    ///
    /// # Errors
    ///
    /// Returns an error if a column is missing or malformed.
    fn from_row(row: &Row) -> StoreResult<Self>;
}

/// Rows and affected-row count returned by a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Rows produced by the statement, if any.
    pub rows: Vec<Row>,
    /// Number of rows inserted, updated or deleted.
    pub affected_rows: u64,
}

impl QueryResult {
    /// A result carrying only an affected-row count.
    #[must_use]
    pub fn affected(affected_rows: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows,
        }
    }

    /// A result carrying rows.
    #[must_use]
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            affected_rows: 0,
        }
    }

    /// Returns the first row, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Decodes a single column of the first row.
    ///
    /// # Errors
    ///
    /// Returns an error if the result is empty or the column is malformed.
    pub fn scalar<T: FromValue>(&self, column: &str) -> StoreResult<T> {
        self.first()
            .ok_or_else(|| StoreError::other(format!("expected a row with column '{column}'")))?
            .get(column)
    }

    /// Decodes every row as a record.
    ///
    /// # Errors
    ///
    /// Returns an error if any row is malformed.
    pub fn decode<R: Record>(&self) -> StoreResult<Vec<R>> {
        self.rows.iter().map(R::from_row).collect()
    }
}

// ============================================================================
// Persisted layout
// ============================================================================

/// Tables the catalog persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Array descriptors, base and versioned.
    Array,
    /// Array attributes.
    ArrayAttribute,
    /// Array dimensions with current boundaries.
    ArrayDimension,
    /// Version lineage per base array.
    ArrayVersion,
    /// Array version locks keyed by (array name, query, instance).
    ArrayVersionLock,
    /// Cluster instances.
    Instance,
    /// Registered shared libraries.
    Library,
    /// Cluster identity.
    Cluster,
}

impl Table {
    /// Returns the table name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::ArrayAttribute => "array_attribute",
            Self::ArrayDimension => "array_dimension",
            Self::ArrayVersion => "array_version",
            Self::ArrayVersionLock => "array_version_lock",
            Self::Instance => "instance",
            Self::Library => "libraries",
            Self::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `array` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayRecord {
    /// Catalog row id.
    pub id: ArrayId,
    /// Base array id; equals `id` for unversioned rows.
    pub uaid: ArrayId,
    /// Array name, `base@version` for versioned rows.
    pub name: String,
    /// Array flag bits.
    pub flags: u32,
    /// Partitioning scheme code.
    pub partitioning: i64,
}

impl Record for ArrayRecord {
    fn to_row(&self) -> Row {
        Row::new()
            .with("id", self.id)
            .with("uaid", self.uaid)
            .with("name", self.name.as_str())
            .with("flags", self.flags)
            .with("partitioning", self.partitioning)
    }

    fn from_row(row: &Row) -> StoreResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            uaid: row.get("uaid")?,
            name: row.get("name")?,
            flags: row.get("flags")?,
            partitioning: row.get("partitioning")?,
        })
    }
}

/// A row of the `array_attribute` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRecord {
    /// Owning array row.
    pub array_id: ArrayId,
    /// Position within the array.
    pub ordinal: u32,
    /// Attribute name.
    pub name: String,
    /// Type name.
    pub type_name: String,
    /// Attribute flag bits.
    pub flags: u32,
    /// Compression method code.
    pub default_compression: i64,
    /// Default value expression.
    pub default_value: Option<String>,
}

impl Record for AttributeRecord {
    fn to_row(&self) -> Row {
        Row::new()
            .with("array_id", self.array_id)
            .with("id", self.ordinal)
            .with("name", self.name.as_str())
            .with("type", self.type_name.as_str())
            .with("flags", self.flags)
            .with("default_compression_method", self.default_compression)
            .with("default_value", self.default_value.clone())
    }

    fn from_row(row: &Row) -> StoreResult<Self> {
        Ok(Self {
            array_id: row.get("array_id")?,
            ordinal: row.get("id")?,
            name: row.get("name")?,
            type_name: row.get("type")?,
            flags: row.get("flags")?,
            default_compression: row.get("default_compression_method")?,
            default_value: row.get("default_value")?,
        })
    }
}

/// A row of the `array_dimension` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionRecord {
    /// Owning array row.
    pub array_id: ArrayId,
    /// Position within the array.
    pub ordinal: u32,
    /// Dimension name.
    pub name: String,
    /// Declared lower bound.
    pub start_min: i64,
    /// Current low coordinate, widened downward only.
    pub curr_start: i64,
    /// Current high coordinate, widened upward only.
    pub curr_end: i64,
    /// Declared upper bound.
    pub end_max: i64,
    /// Chunk length.
    pub chunk_interval: i64,
    /// Chunk overlap.
    pub chunk_overlap: i64,
}

impl Record for DimensionRecord {
    fn to_row(&self) -> Row {
        Row::new()
            .with("array_id", self.array_id)
            .with("id", self.ordinal)
            .with("name", self.name.as_str())
            .with("startmin", self.start_min)
            .with("currstart", self.curr_start)
            .with("currend", self.curr_end)
            .with("endmax", self.end_max)
            .with("chunk_interval", self.chunk_interval)
            .with("chunk_overlap", self.chunk_overlap)
    }

    fn from_row(row: &Row) -> StoreResult<Self> {
        Ok(Self {
            array_id: row.get("array_id")?,
            ordinal: row.get("id")?,
            name: row.get("name")?,
            start_min: row.get("startmin")?,
            curr_start: row.get("currstart")?,
            curr_end: row.get("currend")?,
            end_max: row.get("endmax")?,
            chunk_interval: row.get("chunk_interval")?,
            chunk_overlap: row.get("chunk_overlap")?,
        })
    }
}

/// A row of the `array_version` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    /// Base array.
    pub array_id: ArrayId,
    /// Array row holding this version.
    pub version_array_id: ArrayId,
    /// Version number within the base array.
    pub version_id: VersionId,
    /// Creation time, seconds since the Unix epoch.
    pub time_stamp: i64,
}

impl Record for VersionRecord {
    fn to_row(&self) -> Row {
        Row::new()
            .with("array_id", self.array_id)
            .with("version_array_id", self.version_array_id)
            .with("version_id", self.version_id)
            .with("time_stamp", self.time_stamp)
    }

    fn from_row(row: &Row) -> StoreResult<Self> {
        Ok(Self {
            array_id: row.get("array_id")?,
            version_array_id: row.get("version_array_id")?,
            version_id: row.get("version_id")?,
            time_stamp: row.get("time_stamp")?,
        })
    }
}

/// A row of the `array_version_lock` table.
///
/// The natural key is `(array_name, query_id, instance_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Locked array name.
    pub array_name: String,
    /// Array row the lock refers to.
    pub array_id: ArrayId,
    /// Owning query.
    pub query_id: QueryId,
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Array row of the version being produced, if any.
    pub array_version_id: ArrayId,
    /// Version being produced, if any.
    pub array_version: VersionId,
    /// Role of the owning instance.
    pub instance_role: InstanceRole,
    /// Mode the lock is held in.
    pub lock_mode: LockMode,
}

impl LockRecord {
    /// Returns whether this row has the given natural key.
    #[must_use]
    pub fn has_key(&self, array_name: &str, query_id: QueryId, instance_id: InstanceId) -> bool {
        self.array_name == array_name && self.query_id == query_id && self.instance_id == instance_id
    }
}

impl Record for LockRecord {
    fn to_row(&self) -> Row {
        Row::new()
            .with("array_name", self.array_name.as_str())
            .with("array_id", self.array_id)
            .with("query_id", self.query_id)
            .with("instance_id", self.instance_id)
            .with("array_version_id", self.array_version_id)
            .with("array_version", self.array_version)
            .with("instance_role", self.instance_role)
            .with("lock_mode", self.lock_mode)
    }

    fn from_row(row: &Row) -> StoreResult<Self> {
        Ok(Self {
            array_name: row.get("array_name")?,
            array_id: row.get("array_id")?,
            query_id: row.get("query_id")?,
            instance_id: row.get("instance_id")?,
            array_version_id: row.get("array_version_id")?,
            array_version: row.get("array_version")?,
            instance_role: row.get("instance_role")?,
            lock_mode: row.get("lock_mode")?,
        })
    }
}

/// A row of the `instance` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Instance id, assigned by the store on insert.
    pub instance_id: InstanceId,
    /// Host name.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// Data directory path.
    pub path: String,
    /// Seconds since the epoch at which the instance came online; `None` when offline.
    pub online_since: Option<i64>,
}

impl Record for InstanceRecord {
    fn to_row(&self) -> Row {
        Row::new()
            .with("instance_id", self.instance_id)
            .with("host", self.host.as_str())
            .with("port", self.port)
            .with("instance_path", self.path.as_str())
            .with("online_since", self.online_since)
    }

    fn from_row(row: &Row) -> StoreResult<Self> {
        Ok(Self {
            instance_id: row.get("instance_id")?,
            host: row.get("host")?,
            port: row.get("port")?,
            path: row.get("instance_path")?,
            online_since: row.get("online_since")?,
        })
    }
}

/// The single row of the `cluster` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    /// Cluster UUID in hyphenated form.
    pub cluster_uuid: String,
    /// Catalog layout version.
    pub metadata_version: i64,
}

impl Record for ClusterRecord {
    fn to_row(&self) -> Row {
        Row::new()
            .with("cluster_uuid", self.cluster_uuid.as_str())
            .with("metadata_version", self.metadata_version)
    }

    fn from_row(row: &Row) -> StoreResult<Self> {
        Ok(Self {
            cluster_uuid: row.get("cluster_uuid")?,
            metadata_version: row.get("metadata_version")?,
        })
    }
}

// ============================================================================
// Statements
// ============================================================================

/// The predicate of a coordinator's compare-and-insert.
///
/// An existing lock row on the same array conflicts when it satisfies every
/// filter that is set. With no filters set, any row on the array conflicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockConflict {
    /// Only rows from a query other than this one conflict.
    pub other_than_query: Option<QueryId>,
    /// Only rows held in a mode strictly above this one conflict.
    pub mode_above: Option<LockMode>,
    /// Only rows held in this role conflict.
    pub role: Option<InstanceRole>,
}

impl LockConflict {
    /// Any row on the array conflicts.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            other_than_query: None,
            mode_above: None,
            role: None,
        }
    }

    /// Restricts conflicts to rows from other queries.
    #[must_use]
    pub const fn from_other_query(mut self, query_id: QueryId) -> Self {
        self.other_than_query = Some(query_id);
        self
    }

    /// Restricts conflicts to rows held above the given mode.
    #[must_use]
    pub const fn above(mut self, mode: LockMode) -> Self {
        self.mode_above = Some(mode);
        self
    }

    /// Restricts conflicts to rows held in the given role.
    #[must_use]
    pub const fn held_by(mut self, role: InstanceRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Returns whether `existing` conflicts with an insert on `array_name`.
    #[must_use]
    pub fn matches(&self, array_name: &str, existing: &LockRecord) -> bool {
        existing.array_name == array_name
            && self.other_than_query.is_none_or(|q| existing.query_id != q)
            && self.mode_above.is_none_or(|m| existing.lock_mode > m)
            && self.role.is_none_or(|r| existing.instance_role == r)
    }
}

/// A named, parameterised catalog statement.
///
/// Each variant corresponds to one prepared statement; [`Statement::name`]
/// is its stable name for logs and fault injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Take a table-level exclusive lock until the transaction ends.
    LockTable(Table),

    // -- array_version_lock --------------------------------------------------
    /// Insert `lock` unless a row matching `conflict` exists on the same array.
    InsertLockUnless {
        /// Row to insert.
        lock: LockRecord,
        /// Rows that block the insert.
        conflict: LockConflict,
    },
    /// Copy the coordinator's row for `(array_name, query_id)` as a worker row
    /// owned by `instance_id`, provided the coordinator holds one of `modes`.
    CopyCoordinatorLock {
        /// Locked array name.
        array_name: String,
        /// Owning query.
        query_id: QueryId,
        /// Worker instance that will own the copy.
        instance_id: InstanceId,
        /// Coordinator modes that may be copied.
        modes: Vec<LockMode>,
        /// Skip the insert when the worker row already exists.
        unless_present: bool,
    },
    /// Select one lock row by natural key.
    SelectLock {
        /// Locked array name.
        array_name: String,
        /// Owning query.
        query_id: QueryId,
        /// Owning instance.
        instance_id: InstanceId,
    },
    /// Select the coordinator's lock row for a query.
    SelectCoordinatorLock {
        /// Locked array name.
        array_name: String,
        /// Owning query.
        query_id: QueryId,
    },
    /// Update ids, version and mode of the row keyed like `lock`.
    UpdateLock {
        /// New field values and the natural key.
        lock: LockRecord,
    },
    /// Delete one lock row by natural key.
    DeleteLock {
        /// Locked array name.
        array_name: String,
        /// Owning query.
        query_id: QueryId,
        /// Owning instance.
        instance_id: InstanceId,
    },
    /// Select every lock row held by an instance.
    SelectInstanceLocks {
        /// Owning instance.
        instance_id: InstanceId,
    },
    /// Delete lock rows held by an instance, optionally filtered.
    DeleteInstanceLocks {
        /// Owning instance.
        instance_id: InstanceId,
        /// Only rows of this query.
        query_id: Option<QueryId>,
        /// Only rows held in this role.
        role: Option<InstanceRole>,
    },

    // -- array_version ---------------------------------------------------------
    /// `COALESCE(max(version_id), 0)` for a base array, as `max_version_id`.
    SelectMaxVersionId {
        /// Base array.
        array_id: ArrayId,
    },
    /// Insert a version row.
    InsertVersion(VersionRecord),
    /// Greatest version whose array row is within the horizon, as `version_id`.
    SelectLastVersion {
        /// Base array.
        array_id: ArrayId,
        /// Catalog horizon.
        horizon: ArrayId,
    },
    /// `COALESCE(min(version_array_id), 0)` for a base array, as `version_array_id`.
    SelectOldestVersion {
        /// Base array.
        array_id: ArrayId,
    },
    /// Greatest version created at or before a timestamp, as `version_id`.
    SelectVersionByTimestamp {
        /// Base array.
        array_id: ArrayId,
        /// Seconds since the epoch.
        time_stamp: i64,
    },
    /// All versions of a base array, ordered by version id.
    SelectVersions {
        /// Base array.
        array_id: ArrayId,
    },
    /// Delete one version row.
    DeleteVersion {
        /// Base array.
        array_id: ArrayId,
        /// Version to delete.
        version_id: VersionId,
    },
    /// Max array id per base name over names matching `pattern`.
    ///
    /// Rows carry `base_name` (the name up to its first `@`) and `max_id`.
    SelectMaxArrayIds {
        /// Anchored regular expression over array names.
        pattern: String,
    },

    // -- array_dimension boundaries --------------------------------------------
    /// `currstart = bound WHERE currstart > bound`.
    WidenDimensionLow {
        /// Owning array row.
        array_id: ArrayId,
        /// Dimension position.
        ordinal: u32,
        /// New candidate low coordinate.
        bound: i64,
    },
    /// `currend = bound WHERE currend < bound`.
    WidenDimensionHigh {
        /// Owning array row.
        array_id: ArrayId,
        /// Dimension position.
        ordinal: u32,
        /// New candidate high coordinate.
        bound: i64,
    },

    // -- array -----------------------------------------------------------------
    /// Draw the next value of the array id sequence, as `array_id`.
    ///
    /// The sequence is not transactional: rollback does not return values.
    NextArrayId,
    /// Insert an array row.
    InsertArray(ArrayRecord),
    /// Insert an attribute row.
    InsertAttribute(AttributeRecord),
    /// Insert a dimension row.
    InsertDimension(DimensionRecord),
    /// Select an array row by exact name with `id <= horizon`.
    SelectArrayByName {
        /// Array name.
        name: String,
        /// Catalog horizon.
        horizon: ArrayId,
    },
    /// Select an array row by id.
    SelectArrayById {
        /// Array row id.
        id: ArrayId,
    },
    /// Select every array row, ordered by name.
    SelectArrays,
    /// Attributes of an array row, ordered by position.
    SelectAttributes {
        /// Owning array row.
        array_id: ArrayId,
    },
    /// Dimensions of an array row, ordered by position.
    SelectDimensions {
        /// Owning array row.
        array_id: ArrayId,
    },
    /// Delete `name` and every `name@version` row.
    DeleteArrayFamily {
        /// Base array name.
        name: String,
    },
    /// Delete `name@version` rows whose id is below `below`.
    DeleteArrayVersionsBelow {
        /// Base array name.
        name: String,
        /// Exclusive id ceiling.
        below: ArrayId,
    },
    /// Delete one array row by id.
    DeleteArrayById {
        /// Array row id.
        id: ArrayId,
    },
    /// Rename `old_name` and every `old_name@version` row, keeping suffixes.
    RenameArrayFamily {
        /// Current base name.
        old_name: String,
        /// New base name.
        new_name: String,
    },
    /// `flags = flags | set_flags WHERE flags & having_flags <> 0`.
    UpdateArrayFlags {
        /// Rows must carry one of these bits.
        having_flags: u32,
        /// Bits to set.
        set_flags: u32,
    },

    // -- instance ----------------------------------------------------------------
    /// Insert an instance, returning its assigned `instance_id`.
    InsertInstance {
        /// Host name.
        host: String,
        /// Listening port.
        port: u16,
        /// Data directory path.
        path: String,
    },
    /// Every instance, ordered by id.
    SelectInstances,
    /// One instance by id.
    SelectInstance {
        /// Instance id.
        instance_id: InstanceId,
    },
    /// Record an instance as online at an address.
    MarkInstanceOnline {
        /// Instance id.
        instance_id: InstanceId,
        /// Host name.
        host: String,
        /// Listening port.
        port: u16,
        /// Seconds since the epoch.
        online_since: i64,
    },
    /// Record an instance as offline.
    MarkInstanceOffline {
        /// Instance id.
        instance_id: InstanceId,
    },

    // -- libraries ---------------------------------------------------------------
    /// Register a library.
    InsertLibrary {
        /// Library name.
        name: String,
    },
    /// Every library name, ordered.
    SelectLibraries,
    /// Unregister a library.
    DeleteLibrary {
        /// Library name.
        name: String,
    },

    // -- cluster -----------------------------------------------------------------
    /// The cluster identity row, if initialised.
    SelectCluster,
    /// Insert the cluster identity row.
    InsertCluster(ClusterRecord),
}

impl Statement {
    /// Returns the stable prepared-statement name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LockTable(_) => "lock_table",
            Self::InsertLockUnless { .. } => "insert_array_lock",
            Self::CopyCoordinatorLock { .. } => "copy_coordinator_lock",
            Self::SelectLock { .. } => "select_array_lock",
            Self::SelectCoordinatorLock { .. } => "select_coordinator_lock",
            Self::UpdateLock { .. } => "update_array_lock",
            Self::DeleteLock { .. } => "delete_array_lock",
            Self::SelectInstanceLocks { .. } => "select_instance_locks",
            Self::DeleteInstanceLocks { .. } => "delete_instance_locks",
            Self::SelectMaxVersionId { .. } => "select_max_version_id",
            Self::InsertVersion(_) => "insert_array_version",
            Self::SelectLastVersion { .. } => "select_last_version",
            Self::SelectOldestVersion { .. } => "select_oldest_version",
            Self::SelectVersionByTimestamp { .. } => "select_version_by_timestamp",
            Self::SelectVersions { .. } => "select_array_versions",
            Self::DeleteVersion { .. } => "delete_array_version",
            Self::SelectMaxArrayIds { .. } => "select_max_array_ids",
            Self::WidenDimensionLow { .. } => "widen_dimension_low",
            Self::WidenDimensionHigh { .. } => "widen_dimension_high",
            Self::NextArrayId => "next_array_id",
            Self::InsertArray(_) => "insert_array",
            Self::InsertAttribute(_) => "insert_array_attribute",
            Self::InsertDimension(_) => "insert_array_dimension",
            Self::SelectArrayByName { .. } => "select_array_by_name",
            Self::SelectArrayById { .. } => "select_array_by_id",
            Self::SelectArrays => "select_arrays",
            Self::SelectAttributes { .. } => "select_array_attributes",
            Self::SelectDimensions { .. } => "select_array_dimensions",
            Self::DeleteArrayFamily { .. } => "delete_array_family",
            Self::DeleteArrayVersionsBelow { .. } => "delete_array_versions_below",
            Self::DeleteArrayById { .. } => "delete_array_by_id",
            Self::RenameArrayFamily { .. } => "rename_array_family",
            Self::UpdateArrayFlags { .. } => "update_array_flags",
            Self::InsertInstance { .. } => "insert_instance",
            Self::SelectInstances => "select_instances",
            Self::SelectInstance { .. } => "select_instance",
            Self::MarkInstanceOnline { .. } => "mark_instance_online",
            Self::MarkInstanceOffline { .. } => "mark_instance_offline",
            Self::InsertLibrary { .. } => "insert_library",
            Self::SelectLibraries => "select_libraries",
            Self::DeleteLibrary { .. } => "delete_library",
            Self::SelectCluster => "select_cluster",
            Self::InsertCluster(_) => "insert_cluster",
        }
    }

    /// Returns the tables this statement reads or writes.
    #[must_use]
    pub const fn tables(&self) -> &'static [Table] {
        match self {
            Self::LockTable(_) | Self::NextArrayId => &[],
            Self::InsertLockUnless { .. }
            | Self::CopyCoordinatorLock { .. }
            | Self::SelectLock { .. }
            | Self::SelectCoordinatorLock { .. }
            | Self::UpdateLock { .. }
            | Self::DeleteLock { .. }
            | Self::SelectInstanceLocks { .. }
            | Self::DeleteInstanceLocks { .. } => &[Table::ArrayVersionLock],
            Self::SelectMaxVersionId { .. }
            | Self::InsertVersion(_)
            | Self::SelectLastVersion { .. }
            | Self::SelectOldestVersion { .. }
            | Self::SelectVersionByTimestamp { .. }
            | Self::SelectVersions { .. }
            | Self::DeleteVersion { .. } => &[Table::ArrayVersion],
            Self::SelectMaxArrayIds { .. }
            | Self::InsertArray(_)
            | Self::SelectArrayByName { .. }
            | Self::SelectArrayById { .. }
            | Self::SelectArrays
            | Self::RenameArrayFamily { .. }
            | Self::UpdateArrayFlags { .. } => &[Table::Array],
            Self::WidenDimensionLow { .. }
            | Self::WidenDimensionHigh { .. }
            | Self::InsertDimension(_)
            | Self::SelectDimensions { .. } => &[Table::ArrayDimension],
            Self::InsertAttribute(_) | Self::SelectAttributes { .. } => &[Table::ArrayAttribute],
            Self::DeleteArrayFamily { .. }
            | Self::DeleteArrayVersionsBelow { .. }
            | Self::DeleteArrayById { .. } => &[
                Table::Array,
                Table::ArrayAttribute,
                Table::ArrayDimension,
                Table::ArrayVersion,
            ],
            Self::InsertInstance { .. }
            | Self::SelectInstances
            | Self::SelectInstance { .. }
            | Self::MarkInstanceOnline { .. }
            | Self::MarkInstanceOffline { .. } => &[Table::Instance],
            Self::InsertLibrary { .. } | Self::SelectLibraries | Self::DeleteLibrary { .. } => {
                &[Table::Library]
            }
            Self::SelectCluster | Self::InsertCluster(_) => &[Table::Cluster],
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Store traits
// ============================================================================

/// Transaction isolation levels the catalog uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Statements see data committed before each statement.
    ReadCommitted,
    /// The transaction behaves as if run alone; conflicting commits fail with
    /// [`FailureKind::SerializationConflict`].
    Serializable,
}

impl IsolationLevel {
    /// Returns a stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadCommitted => "read_committed",
            Self::Serializable => "serializable",
        }
    }
}

/// A store that can open scoped transactions.
#[async_trait]
pub trait TransactionalStore: Send + Sync + 'static {
    /// Begins a transaction at the given isolation level.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// An open transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Returns the isolation level this transaction was opened with.
    fn isolation(&self) -> IsolationLevel;

    /// Executes a statement.
    ///
    /// # Errors
    ///
    /// Returns a classified error; after an error the transaction can only
    /// be rolled back.
    async fn execute(&mut self, statement: &Statement) -> StoreResult<QueryResult>;

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`FailureKind::SerializationConflict`] when a serializable
    /// transaction cannot be ordered after concurrent commits.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(query: u64, instance: u64, role: InstanceRole, mode: LockMode) -> LockRecord {
        LockRecord {
            array_name: "A".to_string(),
            array_id: ArrayId::new(1),
            query_id: QueryId::new(query),
            instance_id: InstanceId::new(instance),
            array_version_id: ArrayId::INVALID,
            array_version: VersionId::NONE,
            instance_role: role,
            lock_mode: mode,
        }
    }

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(FailureKind::from_sqlstate("08006"), FailureKind::ConnectionLost);
        assert_eq!(FailureKind::from_sqlstate("57P01"), FailureKind::ConnectionLost);
        assert_eq!(
            FailureKind::from_sqlstate("40001"),
            FailureKind::SerializationConflict
        );
        assert_eq!(
            FailureKind::from_sqlstate("23505"),
            FailureKind::UniquenessViolation
        );
        assert_eq!(FailureKind::from_sqlstate("42P01"), FailureKind::Other);
    }

    #[test]
    fn test_store_error_display_names_statement() {
        let err = StoreError::serialization_conflict("could not serialize access")
            .with_statement("insert_array_lock");
        assert_eq!(err.kind(), FailureKind::SerializationConflict);
        assert_eq!(
            err.to_string(),
            "serialization_conflict in statement 'insert_array_lock': could not serialize access"
        );
    }

    #[test]
    fn test_lock_record_row_round_trip() {
        let record = lock(3, 4, InstanceRole::Worker, LockMode::Xcl);
        let decoded = LockRecord::from_row(&record.to_row()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_row_get_reports_missing_column() {
        let row = Row::new().with("id", 1_u64);
        let err = row.get::<String>("name").expect_err("missing");
        assert!(err.message().contains("'name'"));
        let err = row.get::<String>("id").expect_err("wrong type");
        assert!(err.message().contains("expected text"));
    }

    #[test]
    fn test_conflict_any_row_from_other_query() {
        let conflict = LockConflict::any().from_other_query(QueryId::new(1));
        assert!(!conflict.matches("A", &lock(1, 1, InstanceRole::Coord, LockMode::Rd)));
        assert!(conflict.matches("A", &lock(2, 1, InstanceRole::Coord, LockMode::Rd)));
        assert!(!conflict.matches("B", &lock(2, 1, InstanceRole::Coord, LockMode::Rd)));
    }

    #[test]
    fn test_conflict_mode_and_role_filters() {
        let conflict = LockConflict::any()
            .above(LockMode::Rd)
            .held_by(InstanceRole::Coord);
        assert!(!conflict.matches("A", &lock(2, 1, InstanceRole::Coord, LockMode::Rd)));
        assert!(conflict.matches("A", &lock(2, 1, InstanceRole::Coord, LockMode::Wr)));
        assert!(!conflict.matches("A", &lock(2, 1, InstanceRole::Worker, LockMode::Wr)));
    }
}
