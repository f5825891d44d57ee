//! JSON-lines audit log with per-line integrity checksums.
//!
//! Each line is an envelope holding the record and the SHA-256 of the record's
//! compact JSON. [`verify_audit_log`] re-serializes each record and compares
//! checksums, flagging lines edited after the fact.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::AuditRecord;
use crate::verify::collaborators::{AuditSink, PersistenceError};

/// Envelope for one audit line.
#[derive(Debug, Serialize, Deserialize)]
struct AuditEnvelope {
    /// SHA256 checksum of the compact record JSON.
    checksum: String,
    /// The record itself.
    record: AuditRecord,
}

/// Appends checksummed audit records to a JSON-lines file.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesAuditSink {
    /// Sink appending to `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
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
}

/// Serialize a record as one envelope line (without trailing newline).
///
/// # Errors
///
/// Returns a serialization error if the record cannot be encoded.
pub fn to_line(record: &AuditRecord) -> Result<String, serde_json::Error> {
    let record_json = serde_json::to_string(record)?;
    let envelope = AuditEnvelope {
        checksum: checksum(&record_json),
        record: record.clone(),
    };
    serde_json::to_string(&envelope)
}

fn checksum(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn persist(&self, record: &AuditRecord) -> Result<(), PersistenceError> {
        let mut line = to_line(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
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
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

/// Result of checking an audit log.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AuditLogReport {
    /// Records whose checksum matched
    pub valid: usize,
    /// 1-based line numbers that failed to parse or verify
    pub invalid_lines: Vec<usize>,
}

impl AuditLogReport {
    /// Whether every line verified.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.invalid_lines.is_empty()
    }
}

/// Check every line of an audit log.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read. Bad lines are reported in
/// the [`AuditLogReport`], not as errors.
pub fn verify_audit_log(path: &Path) -> std::io::Result<AuditLogReport> {
    let content = std::fs::read_to_string(path)?;
    let mut report = AuditLogReport::default();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let ok = serde_json::from_str::<AuditEnvelope>(line)
            .ok()
            .and_then(|envelope| {
                serde_json::to_string(&envelope.record)
                    .ok()
                    .map(|json| checksum(&json) == envelope.checksum)
            })
            .unwrap_or(false);

        if ok {
            report.valid += 1;
        } else {
            log::warn!("Audit log {} line {} failed verification", path.display(), idx + 1);
            report.invalid_lines.push(idx + 1);
        }
    }

    Ok(report)
}
