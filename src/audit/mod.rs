//! Audit records and the sinks that persist them.
//!
//! Two kinds of record are produced:
//!
//! * [`CompletionRecord`] - written once every required field of a unit has
//!   passed, with the final value of each field and the full attempt sequence.
//! * [`MismatchRecord`] - written immediately on each failed scan, with raw and
//!   normalized values and their character codes.
//!
//! # Sinks
//!
//! * [`jsonl`]: one checksummed JSON envelope per line.
//! * [`csv`]: flat rows with field labels as columns, for spreadsheets.
//! * [`MemoryAuditSink`]: keeps records in memory (tests, embedding).

pub mod csv;
pub mod jsonl;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::verify::collaborators::{AuditSink, PersistenceError};
use crate::verify::compare::{ComparisonOperator, MismatchDiagnosis};
use crate::verify::record::FieldId;
use crate::verify::sequence::ScanAttempt;

pub use self::csv::CsvAuditSink;
pub use jsonl::{verify_audit_log, JsonLinesAuditSink};

/// Where a reported field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// The bound master record.
    Record,
    /// The live value the operator saw.
    Live,
    /// Neither had a value.
    Empty,
}

/// Value of one field at audit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    /// Field id
    pub id: FieldId,
    /// Field label (column header in flat logs)
    pub label: String,
    /// Record value if present, else live value, else empty
    pub value: String,
    /// Origin of `value`
    pub source: ValueSource,
}

/// Outcome recorded in an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    /// Every required field passed.
    AllFieldsMatched,
    /// A scan failed its field.
    NotMatched,
}

/// Consolidated record of a fully verified unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// When the unit completed
    pub timestamp: DateTime<Utc>,
    /// Always [`AuditStatus::AllFieldsMatched`]
    pub status: AuditStatus,
    /// Identity key of the record
    pub record_key: Option<String>,
    /// Master-data row index
    pub row_index: Option<usize>,
    /// The scan that completed the unit
    pub scanned_code: String,
    /// Operator/station identity
    pub scanned_by: Option<String>,
    /// Comparison operator in effect
    pub operator: ComparisonOperator,
    /// Final value of every required field
    pub values: Vec<FieldValue>,
    /// Every attempt in the session, in order
    pub sequence: Vec<ScanAttempt>,
}

/// Diagnostic record of one failed scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchRecord {
    /// When the scan failed
    pub timestamp: DateTime<Utc>,
    /// Always [`AuditStatus::NotMatched`]
    pub status: AuditStatus,
    /// Identity key of the record
    pub record_key: Option<String>,
    /// Master-data row index
    pub row_index: Option<usize>,
    /// Field the scan was checked against
    pub field_id: FieldId,
    /// Label of that field
    pub field_label: String,
    /// Operator/station identity
    pub scanned_by: Option<String>,
    /// Comparison operator in effect
    pub operator: ComparisonOperator,
    /// Raw/normalized values and char codes
    #[serde(flatten)]
    pub diagnosis: MismatchDiagnosis,
    /// Value of every required field
    pub values: Vec<FieldValue>,
    /// Required-field sequence at the time
    pub required_fields: Vec<FieldId>,
}

/// A persisted audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    /// Unit fully verified.
    Completed(CompletionRecord),
    /// Scan mismatch.
    Mismatch(MismatchRecord),
}

impl AuditRecord {
    /// Status of the record.
    #[must_use]
    pub fn status(&self) -> AuditStatus {
        match self {
            AuditRecord::Completed(r) => r.status,
            AuditRecord::Mismatch(r) => r.status,
        }
    }

    /// Timestamp of the record.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditRecord::Completed(r) => r.timestamp,
            AuditRecord::Mismatch(r) => r.timestamp,
        }
    }

    /// Identity key of the audited record.
    #[must_use]
    pub fn record_key(&self) -> Option<&str> {
        match self {
            AuditRecord::Completed(r) => r.record_key.as_deref(),
            AuditRecord::Mismatch(r) => r.record_key.as_deref(),
        }
    }
}

/// Audit sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records persisted so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn persist(&self, record: &AuditRecord) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .map_err(|_| PersistenceError::Closed("memory audit sink poisoned".into()))?
            .push(record.clone());
        Ok(())
    }
}
