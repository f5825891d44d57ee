//! CSV audit log for spreadsheet review.
//!
//! One row per audit record. The fixed columns are followed by one column per
//! field label, taken from the first record written to a new file (or from the
//! header of an existing file). Later records fill those columns by label;
//! labels the header does not know are dropped with a warning.
//!
//! # Columns
//!
//! - `timestamp`: RFC 3339
//! - `status`: `ALL_FIELDS_MATCHED` or `NOT_MATCHED`
//! - `record_key`, `row_index`, `scanned_by`, `operator`
//! - `field`: label of the failed field (mismatches only)
//! - `scanned_code`: the completing scan, or the failed raw scan
//! - `expected`: expected raw value (mismatches only)
//! - `reason`: mismatch classification (mismatches only)
//! - one column per field label

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{AuditRecord, FieldValue};
use crate::verify::collaborators::{AuditSink, PersistenceError};

const FIXED_COLUMNS: [&str; 10] = [
    "timestamp",
    "status",
    "record_key",
    "row_index",
    "scanned_by",
    "operator",
    "field",
    "scanned_code",
    "expected",
    "reason",
];

/// Appends audit records as CSV rows.
#[derive(Debug)]
pub struct CsvAuditSink {
    path: PathBuf,
    header: Mutex<Option<Vec<String>>>,
}

impl CsvAuditSink {
    /// Sink appending to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header: Mutex::new(None),
        }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn existing_header(&self) -> Result<Option<Vec<String>>, PersistenceError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        if content.is_empty() {
            return Ok(None);
        }
        let mut reader = csv::Reader::from_reader(content.as_slice());
        let header = reader.headers()?.iter().map(str::to_string).collect();
        Ok(Some(header))
    }
}

fn header_for(record: &AuditRecord) -> Vec<String> {
    FIXED_COLUMNS
        .iter()
        .map(|c| (*c).to_string())
        .chain(values_of(record).iter().map(|v| v.label.clone()))
        .collect()
}

fn values_of(record: &AuditRecord) -> &[FieldValue] {
    match record {
        AuditRecord::Completed(r) => &r.values,
        AuditRecord::Mismatch(r) => &r.values,
    }
}

fn row_for(record: &AuditRecord, header: &[String]) -> Vec<String> {
    let fixed: Vec<String> = match record {
        AuditRecord::Completed(r) => vec![
            r.timestamp.to_rfc3339(),
            "ALL_FIELDS_MATCHED".to_string(),
            r.record_key.clone().unwrap_or_default(),
            r.row_index.map(|i| i.to_string()).unwrap_or_default(),
            r.scanned_by.clone().unwrap_or_default(),
            r.operator.to_string(),
            String::new(),
            r.scanned_code.clone(),
            String::new(),
            String::new(),
        ],
        AuditRecord::Mismatch(r) => vec![
            r.timestamp.to_rfc3339(),
            "NOT_MATCHED".to_string(),
            r.record_key.clone().unwrap_or_default(),
            r.row_index.map(|i| i.to_string()).unwrap_or_default(),
            r.scanned_by.clone().unwrap_or_default(),
            r.operator.to_string(),
            r.field_label.clone(),
            r.diagnosis.scanned_raw.clone(),
            r.diagnosis.expected_raw.clone(),
            format!("{:?}", r.diagnosis.reason),
        ],
    };

    let values = values_of(record);
    let labels = header.get(FIXED_COLUMNS.len()..).unwrap_or_default();
    for value in values {
        if !labels.contains(&value.label) {
            log::warn!(
                "Audit CSV has no column for field '{}', value dropped",
                value.label
            );
        }
    }

    fixed
        .into_iter()
        .chain(labels.iter().map(|label| {
            values
                .iter()
                .find(|v| &v.label == label)
                .map(|v| v.value.clone())
                .unwrap_or_default()
        }))
        .collect()
}

#[async_trait]
impl AuditSink for CsvAuditSink {
    async fn persist(&self, record: &AuditRecord) -> Result<(), PersistenceError> {
        let mut header_slot = self.header.lock().await;

        let (header, write_header) = match header_slot.as_ref() {
            Some(cached) => (cached.clone(), false),
            None => match self.existing_header().await? {
                Some(existing) => (existing, false),
                None => (header_for(record), true),
            },
        };

        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        if write_header {
            writer.write_record(&header)?;
        }
        writer.write_record(row_for(record, &header))?;
        let bytes = writer
            .into_inner()
            .map_err(|e| PersistenceError::Closed(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&bytes).await.map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;

        // Only a header that reached the file is reused.
        *header_slot = Some(header);
        Ok(())
    }
}
