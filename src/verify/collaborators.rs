//! External collaborators consumed by the session manager.
//!
//! Each collaborator is a narrow trait so the engine never depends on how
//! records are selected, where audit records land, how the supervisor PIN is
//! collected or how session state reaches other screens.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::record::{FieldId, TargetRecord};
use super::session::SessionSnapshot;
use crate::audit::AuditRecord;

/// Failures of audit and broadcast sinks. Logged, never propagated.
#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    /// I/O error writing a sink's backing file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path being written
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The record could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV encoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The sink is closed or its receiver went away.
    #[error("Sink closed: {0}")]
    Closed(String),
}

/// Persists audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one record.
    async fn persist(&self, record: &AuditRecord) -> Result<(), PersistenceError>;
}

/// Secondary authorization requested after a mismatch.
#[async_trait]
pub trait PinGate: Send + Sync {
    /// Ask for authorization to clear the failure on `field`.
    ///
    /// `true` clears the failed mark; `false` leaves the field failed.
    async fn verify(&self, field: &FieldId) -> bool;
}

/// Best-effort publisher of session snapshots (companion displays, panels).
pub trait BroadcastSink: Send + Sync {
    /// Publish a snapshot.
    fn publish(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError>;
}

/// Supplies the currently selected master record and live field values.
pub trait TargetRecordSource: Send + Sync {
    /// Record currently selected by the operator, if any.
    fn selected_record(&self) -> Option<Arc<TargetRecord>>;

    /// Currently displayed primary-field value, used for implicit binds when
    /// nothing is selected.
    fn primary_value(&self) -> Option<String> {
        None
    }

    /// Look a record up by its primary-field value.
    fn find_by_primary(&self, _value: &str) -> Option<Arc<TargetRecord>> {
        None
    }

    /// Last-known live value of a field (what the operator currently sees),
    /// used when the record itself has no value.
    fn live_value(&self, _field: &FieldId) -> Option<String> {
        None
    }
}

/// Audit sink that drops every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAudit;

#[async_trait]
impl AuditSink for NoAudit {
    async fn persist(&self, _record: &AuditRecord) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Broadcast sink that publishes nowhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBroadcast;

impl BroadcastSink for NoBroadcast {
    fn publish(&self, _snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// PIN gate with a fixed answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPinGate {
    approve: bool,
}

impl StaticPinGate {
    /// Gate that always authorizes.
    #[must_use]
    pub fn approve() -> Self {
        Self { approve: true }
    }

    /// Gate that never authorizes.
    #[must_use]
    pub fn deny() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl PinGate for StaticPinGate {
    async fn verify(&self, field: &FieldId) -> bool {
        log::debug!("PIN gate for '{}' answered {}", field, self.approve);
        self.approve
    }
}

/// Broadcast sink that keeps every published snapshot in memory.
#[derive(Debug, Default)]
pub struct SnapshotLog {
    snapshots: Mutex<Vec<SessionSnapshot>>,
}

impl SnapshotLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All snapshots published so far.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.snapshots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Most recent snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<SessionSnapshot> {
        self.snapshots.lock().ok().and_then(|s| s.last().cloned())
    }
}

impl BroadcastSink for SnapshotLog {
    fn publish(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        self.snapshots
            .lock()
            .map_err(|_| PersistenceError::Closed("snapshot log poisoned".into()))?
            .push(snapshot.clone());
        Ok(())
    }
}

/// Record source over a single fixed record.
#[derive(Debug, Clone)]
pub struct FixedRecord(pub Arc<TargetRecord>);

impl TargetRecordSource for FixedRecord {
    fn selected_record(&self) -> Option<Arc<TargetRecord>> {
        Some(self.0.clone())
    }
}
