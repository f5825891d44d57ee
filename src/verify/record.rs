//! Master records and field identifiers.
//!
//! A [`TargetRecord`] is the master-data row currently bound for verification.
//! It is immutable once built and shared by reference (`Arc`) between the
//! session, audit records and snapshots.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a configured field (a master-data column mapping).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(String);

impl FieldId {
    /// Create a field id from anything string-like.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FieldId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for FieldId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for FieldId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A configured field that participates in verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field identifier.
    pub id: FieldId,
    /// Human-readable label (used as the column header in audit logs).
    #[serde(default)]
    pub label: String,
}

impl FieldSpec {
    /// Create a field spec.
    #[must_use]
    pub fn new(id: impl Into<FieldId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// The label, or the id when no label was configured.
    #[must_use]
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.label
        }
    }
}

/// An immutable mapping from field id to value, plus the master row it came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetRecord {
    values: BTreeMap<FieldId, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    row_index: Option<usize>,
}

impl TargetRecord {
    /// Build a record from field/value pairs.
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<FieldId>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            row_index: None,
        }
    }

    /// Attach the master-data row index this record was read from.
    #[must_use]
    pub fn with_row_index(mut self, row_index: usize) -> Self {
        self.row_index = Some(row_index);
        self
    }

    /// Master-data row index, when known.
    #[must_use]
    pub fn row_index(&self) -> Option<usize> {
        self.row_index
    }

    /// Raw value stored for a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    /// Value for a field, treating blank cells as absent.
    #[must_use]
    pub fn value(&self, field: &str) -> Option<&str> {
        self.get(field).filter(|v| !v.trim().is_empty())
    }

    /// Identity key: the trimmed value of the primary-key field.
    #[must_use]
    pub fn key(&self, primary_key: &str) -> Option<&str> {
        self.value(primary_key).map(str::trim)
    }

    /// Whether `other` denotes the same master row as `self`.
    ///
    /// Records that both lack a key value fall back to comparing contents.
    #[must_use]
    pub fn same_identity(&self, other: &TargetRecord, primary_key: &str) -> bool {
        match (self.key(primary_key), other.key(primary_key)) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.values == other.values,
            _ => false,
        }
    }

    /// Iterate over all field/value pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldId, &str)> {
        self.values.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Number of fields in the record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the record holds no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
