//! Array descriptors and versioned-name helpers.
//!
//! A versioned array row is named `base@version`; its `uaid` points at the
//! base row and its `id` is always greater than the `uaid`.

use std::collections::HashSet;

use quiver_core::id::{ArrayId, VersionId};
use quiver_core::store::{ArrayRecord, AttributeRecord, DimensionRecord};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Separator between a base array name and its version number.
pub const VERSION_SEPARATOR: char = '@';

/// Largest representable coordinate.
pub const MAX_COORDINATE: i64 = (1 << 62) - 1;

/// Smallest representable coordinate.
pub const MIN_COORDINATE: i64 = -MAX_COORDINATE;

/// Builds `name@version`.
#[must_use]
pub fn make_versioned_name(name: &str, version: VersionId) -> String {
    format!("{name}{VERSION_SEPARATOR}{version}")
}

/// Returns the part of `name` before the version separator.
#[must_use]
pub fn base_name(name: &str) -> &str {
    name.split_once(VERSION_SEPARATOR)
        .map_or(name, |(base, _)| base)
}

/// Returns the version encoded in `name`, if it is a versioned name.
#[must_use]
pub fn version_from_name(name: &str) -> Option<VersionId> {
    let (_, version) = name.split_once(VERSION_SEPARATOR)?;
    version.parse::<u64>().ok().map(VersionId::new)
}

/// One attribute of an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDesc {
    /// Attribute name.
    pub name: String,
    /// Type name.
    pub type_name: String,
    /// Attribute flag bits.
    #[serde(default)]
    pub flags: u32,
    /// Compression method code.
    #[serde(default)]
    pub default_compression: i64,
    /// Default value expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl AttributeDesc {
    /// Creates an attribute with default flags and compression.
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            flags: 0,
            default_compression: 0,
            default_value: None,
        }
    }
}

/// One dimension of an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionDesc {
    /// Dimension name.
    pub name: String,
    /// Declared lower bound.
    pub start_min: i64,
    /// Current low coordinate.
    pub curr_start: i64,
    /// Current high coordinate.
    pub curr_end: i64,
    /// Declared upper bound.
    pub end_max: i64,
    /// Chunk length.
    pub chunk_interval: i64,
    /// Chunk overlap.
    #[serde(default)]
    pub chunk_overlap: i64,
}

impl DimensionDesc {
    /// Creates a dimension with no data yet: the current boundaries start
    /// inverted so the first boundary update sets both.
    #[must_use]
    pub fn new(name: impl Into<String>, start_min: i64, end_max: i64, chunk_interval: i64) -> Self {
        Self {
            name: name.into(),
            start_min,
            curr_start: MAX_COORDINATE,
            curr_end: MIN_COORDINATE,
            end_max,
            chunk_interval,
            chunk_overlap: 0,
        }
    }
}

/// Low and high coordinates of the data actually present in an array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalBoundaries {
    /// Low coordinate per dimension.
    pub start: Vec<i64>,
    /// High coordinate per dimension.
    pub end: Vec<i64>,
}

impl PhysicalBoundaries {
    /// Creates boundaries from per-dimension low and high coordinates.
    #[must_use]
    pub fn new(start: Vec<i64>, end: Vec<i64>) -> Self {
        Self { start, end }
    }

    /// Returns whether there are no coordinates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Clamps each coordinate pair into the declared range of its dimension.
    ///
    /// Coordinates beyond the rank of `dimensions` are dropped; dimensions
    /// without a coordinate pair are left out.
    #[must_use]
    pub fn trim_to_dims(&self, dimensions: &[DimensionDesc]) -> Self {
        let (start, end) = dimensions
            .iter()
            .zip(&self.start)
            .zip(&self.end)
            .map(|((dim, low), high)| {
                (
                    (*low).max(dim.start_min),
                    (*high).min(dim.end_max),
                )
            })
            .unzip();
        Self { start, end }
    }
}

/// A catalog array descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayDesc {
    /// Catalog row id.
    pub id: ArrayId,
    /// Base array id; equals `id` for unversioned arrays.
    pub uaid: ArrayId,
    /// Version number; `0` for unversioned arrays.
    pub version: VersionId,
    /// Array name, `base@version` for versions.
    pub name: String,
    /// Array flag bits.
    #[serde(default)]
    pub flags: u32,
    /// Partitioning scheme code.
    #[serde(default)]
    pub partitioning: i64,
    /// Attributes in order.
    pub attributes: Vec<AttributeDesc>,
    /// Dimensions in order.
    pub dimensions: Vec<DimensionDesc>,
}

impl ArrayDesc {
    /// The array lives only for the duration of a query.
    pub const TRANSIENT: u32 = 0x10;

    /// The array must not be read; set on transient arrays after a restart.
    pub const INVALID: u32 = 0x20;

    /// Creates a descriptor with unassigned ids.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        attributes: Vec<AttributeDesc>,
        dimensions: Vec<DimensionDesc>,
    ) -> Self {
        let name = name.into();
        let version = version_from_name(&name).unwrap_or(VersionId::NONE);
        Self {
            id: ArrayId::INVALID,
            uaid: ArrayId::INVALID,
            version,
            name,
            flags: 0,
            partitioning: 0,
            attributes,
            dimensions,
        }
    }

    /// Sets the row id and base id.
    #[must_use]
    pub fn with_ids(mut self, id: ArrayId, uaid: ArrayId) -> Self {
        self.id = id;
        self.uaid = uaid;
        self
    }

    /// Sets the flag bits.
    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Derives the descriptor of version `version` stored at row `id`.
    #[must_use]
    pub fn versioned(&self, id: ArrayId, version: VersionId) -> Self {
        Self {
            id,
            uaid: self.uaid,
            version,
            name: make_versioned_name(self.base_name(), version),
            ..self.clone()
        }
    }

    /// Returns whether this descriptor names a specific version.
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.name.contains(VERSION_SEPARATOR)
    }

    /// Returns the unversioned name.
    #[must_use]
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }

    /// Returns whether the transient flag is set.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.flags & Self::TRANSIENT != 0
    }

    /// Returns whether the invalid flag is set.
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        self.flags & Self::INVALID != 0
    }

    /// Checks the id and naming invariants before the descriptor is stored.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidDescriptor`] when the id is unset, the
    /// base id does not fit the name, or attribute and dimension names clash.
    pub fn validate(&self) -> Result<()> {
        if !self.id.is_valid() {
            return Err(CatalogError::invalid_descriptor(format!(
                "array '{}' has no id",
                self.name
            )));
        }
        if self.is_versioned() {
            let Some(version) = version_from_name(&self.name) else {
                return Err(CatalogError::invalid_descriptor(format!(
                    "versioned array name '{}' has no version number",
                    self.name
                )));
            };
            if version == VersionId::NONE || version != self.version {
                return Err(CatalogError::invalid_descriptor(format!(
                    "array '{}' carries version {} but its name says {version}",
                    self.name, self.version
                )));
            }
            if !self.uaid.is_valid() || self.uaid >= self.id {
                return Err(CatalogError::invalid_descriptor(format!(
                    "versioned array '{}' must have 0 < uaid ({}) < id ({})",
                    self.name, self.uaid, self.id
                )));
            }
        } else if self.uaid != self.id {
            return Err(CatalogError::invalid_descriptor(format!(
                "unversioned array '{}' must have uaid ({}) == id ({})",
                self.name, self.uaid, self.id
            )));
        }

        let mut names = HashSet::new();
        for name in self
            .dimensions
            .iter()
            .map(|d| d.name.as_str())
            .chain(self.attributes.iter().map(|a| a.name.as_str()))
        {
            if !names.insert(name) {
                return Err(CatalogError::invalid_descriptor(format!(
                    "array '{}' uses the name '{name}' more than once across attributes and dimensions",
                    self.name
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn to_record(&self) -> ArrayRecord {
        ArrayRecord {
            id: self.id,
            uaid: self.uaid,
            name: self.name.clone(),
            flags: self.flags,
            partitioning: self.partitioning,
        }
    }

    pub(crate) fn attribute_records(&self) -> impl Iterator<Item = AttributeRecord> + '_ {
        (0_u32..).zip(&self.attributes).map(|(ordinal, a)| AttributeRecord {
            array_id: self.id,
            ordinal,
            name: a.name.clone(),
            type_name: a.type_name.clone(),
            flags: a.flags,
            default_compression: a.default_compression,
            default_value: a.default_value.clone(),
        })
    }

    pub(crate) fn dimension_records(&self) -> impl Iterator<Item = DimensionRecord> + '_ {
        (0_u32..).zip(&self.dimensions).map(|(ordinal, d)| DimensionRecord {
            array_id: self.id,
            ordinal,
            name: d.name.clone(),
            start_min: d.start_min,
            curr_start: d.curr_start,
            curr_end: d.curr_end,
            end_max: d.end_max,
            chunk_interval: d.chunk_interval,
            chunk_overlap: d.chunk_overlap,
        })
    }

    pub(crate) fn from_records(
        array: ArrayRecord,
        attributes: Vec<AttributeRecord>,
        dimensions: Vec<DimensionRecord>,
    ) -> Self {
        Self {
            id: array.id,
            uaid: array.uaid,
            version: version_from_name(&array.name).unwrap_or(VersionId::NONE),
            name: array.name,
            flags: array.flags,
            partitioning: array.partitioning,
            attributes: attributes
                .into_iter()
                .map(|a| AttributeDesc {
                    name: a.name,
                    type_name: a.type_name,
                    flags: a.flags,
                    default_compression: a.default_compression,
                    default_value: a.default_value,
                })
                .collect(),
            dimensions: dimensions
                .into_iter()
                .map(|d| DimensionDesc {
                    name: d.name,
                    start_min: d.start_min,
                    curr_start: d.curr_start,
                    curr_end: d.curr_end,
                    end_max: d.end_max,
                    chunk_interval: d.chunk_interval,
                    chunk_overlap: d.chunk_overlap,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(name: &str) -> ArrayDesc {
        ArrayDesc::new(
            name,
            vec![AttributeDesc::new("v", "double")],
            vec![DimensionDesc::new("i", 0, 999, 100)],
        )
    }

    #[test]
    fn test_versioned_name_helpers() {
        assert_eq!(make_versioned_name("A", VersionId::new(3)), "A@3");
        assert_eq!(base_name("A@3"), "A");
        assert_eq!(base_name("A"), "A");
        assert_eq!(version_from_name("A@3"), Some(VersionId::new(3)));
        assert_eq!(version_from_name("A"), None);
        assert_eq!(version_from_name("A@x"), None);
    }

    #[test]
    fn test_validate_unversioned() {
        let desc = dense("A").with_ids(ArrayId::new(5), ArrayId::new(5));
        desc.validate().expect("valid");

        let unset = dense("A");
        assert!(matches!(
            unset.validate(),
            Err(CatalogError::InvalidDescriptor { .. })
        ));

        let mismatched = dense("A").with_ids(ArrayId::new(5), ArrayId::new(4));
        assert!(mismatched.validate().is_err());
    }

    #[test]
    fn test_validate_versioned() {
        let base = dense("A").with_ids(ArrayId::new(5), ArrayId::new(5));
        let version = base.versioned(ArrayId::new(6), VersionId::new(1));
        assert_eq!(version.name, "A@1");
        assert_eq!(version.uaid, ArrayId::new(5));
        version.validate().expect("valid");

        let backwards = base.versioned(ArrayId::new(4), VersionId::new(1));
        assert!(backwards.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_name_clash() {
        let desc = ArrayDesc::new(
            "A",
            vec![AttributeDesc::new("i", "int64")],
            vec![DimensionDesc::new("i", 0, 9, 10)],
        )
        .with_ids(ArrayId::new(1), ArrayId::new(1));
        let err = desc.validate().expect_err("clash");
        assert!(err.to_string().contains("'i'"));
    }

    #[test]
    fn test_trim_to_dims_clamps_and_drops_extra_coordinates() {
        let dims = vec![
            DimensionDesc::new("i", 0, 999, 100),
            DimensionDesc::new("j", -10, 10, 5),
        ];
        let bounds = PhysicalBoundaries::new(vec![-5, -3, 7], vec![2000, 4, 9]);

        let trimmed = bounds.trim_to_dims(&dims);
        assert_eq!(trimmed, PhysicalBoundaries::new(vec![0, -3], vec![999, 4]));
        assert!(PhysicalBoundaries::default().trim_to_dims(&dims).is_empty());
    }

    #[test]
    fn test_flags() {
        let desc = dense("T").with_flags(ArrayDesc::TRANSIENT);
        assert!(desc.is_transient());
        assert!(!desc.is_invalid());
    }

    #[test]
    fn test_records_round_trip_through_descriptor() {
        let desc = dense("A").with_ids(ArrayId::new(2), ArrayId::new(2));
        let rebuilt = ArrayDesc::from_records(
            desc.to_record(),
            desc.attribute_records().collect(),
            desc.dimension_records().collect(),
        );
        assert_eq!(rebuilt, desc);
    }
}
