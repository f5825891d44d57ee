//! Multi-field sequential scan verification.
//!
//! An operator binds a master record and then scans one code per required
//! field, in configuration order. Each scan is compared against the active
//! field's expected value; matches advance the session, mismatches mark the
//! field failed and ask a [`PinGate`] for recovery.
//!
//! # Architecture
//!
//! - [`compare`]: normalization and the four comparison operators
//! - [`fields`]: required-field resolution from configuration collaborators
//! - [`sequence`]: ordered log of every scan attempt
//! - [`session`]: the [`ScanSession`] entity and derived per-field states
//! - [`manager`]: [`SessionManager`], the only code that mutates a session
//! - [`collaborators`]: traits for audit, PIN, broadcast and record sources
//! - [`events`]: events delivered to subscribers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scanverify::verify::fields::PrimaryFields;
//! use scanverify::verify::{
//!     FieldResolver, SessionConfig, SessionManager, StaticPinGate, TargetRecord,
//! };
//! use scanverify::config::Config;
//!
//! # async fn demo() -> Result<(), scanverify::verify::VerifyError> {
//! let config = Config {
//!     primary_fields: Some(PrimaryFields::List(vec!["part".into(), "lot".into()])),
//!     ..Config::default()
//! };
//! let manager = SessionManager::new(FieldResolver::new(Arc::new(config)))
//!     .with_pin_gate(Arc::new(StaticPinGate::deny()));
//!
//! let record = TargetRecord::new([("part", "P-100"), ("lot", "L7")]);
//! manager.bind(Arc::new(record), SessionConfig::default()).await;
//!
//! let outcome = manager.handle_scan("P-100").await?;
//! assert!(outcome.matched());
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod compare;
pub mod events;
pub mod fields;
pub mod manager;
pub mod record;
pub mod sequence;
pub mod session;

use serde::Serialize;

pub use collaborators::{
    AuditSink, BroadcastSink, FixedRecord, NoAudit, NoBroadcast, PersistenceError, PinGate,
    SnapshotLog, StaticPinGate, TargetRecordSource,
};
pub use compare::{compare, diagnose, normalize, ComparisonOperator, MismatchReason};
pub use events::{CompletionSummary, SessionEvent};
pub use fields::{
    CachedConfigSource, ConfigSource, FallbackStore, FieldResolver, JsonSettingsFile,
    Resolution, StaticSurface, TargetSurface,
};
pub use manager::SessionManager;
pub use record::{FieldId, FieldSpec, TargetRecord};
pub use sequence::{ScanAttempt, SequenceTracker};
pub use session::{FieldState, ScanSession, SessionConfig, SessionPhase, SessionSnapshot};

/// Errors surfaced to the caller of [`SessionManager::handle_scan`].
///
/// Everything else (empty scans, comparison failures, sink failures, stale
/// PIN results) is absorbed by the engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Required fields have no resolvable target; scanning is blocked.
    #[error("Required fields cannot be targeted: {}", join_ids(.missing))]
    Configuration {
        /// The offending field ids
        missing: Vec<FieldId>,
    },
}

fn join_ids(ids: &[FieldId]) -> String {
    ids.iter().map(FieldId::as_str).collect::<Vec<_>>().join(", ")
}

/// Why a scan changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Blank input.
    EmptyScan,
    /// No record bound and none could be bound implicitly.
    NoTarget,
    /// The required-field sequence is empty.
    NoRequiredFields,
    /// Every required field is already matched.
    AllMatched,
}

/// What became of a failed field after the PIN gate answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Authorized; the failed mark is cleared and the field is active again.
    Cleared,
    /// Not authorized (or no gate); the field stays failed.
    Pending,
    /// The session moved on while the gate was open; the answer was discarded.
    Stale,
}

/// Result of one [`SessionManager::handle_scan`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// No state changed.
    Ignored {
        /// Why
        reason: IgnoreReason,
    },
    /// The scan matched the active field.
    Matched {
        /// Field that passed
        field: FieldId,
        /// Whether this scan completed the session
        session_complete: bool,
    },
    /// The scan did not match the active field.
    Mismatched {
        /// Field that failed
        field: FieldId,
        /// PIN gate result
        recovery: Recovery,
    },
}

impl ScanOutcome {
    pub(crate) fn ignored(reason: IgnoreReason) -> Self {
        ScanOutcome::Ignored { reason }
    }

    /// Whether the scan matched.
    #[must_use]
    pub fn matched(&self) -> bool {
        matches!(self, ScanOutcome::Matched { .. })
    }

    /// Field the scan was checked against.
    #[must_use]
    pub fn field_id(&self) -> Option<&FieldId> {
        match self {
            ScanOutcome::Ignored { .. } => None,
            ScanOutcome::Matched { field, .. } | ScanOutcome::Mismatched { field, .. } => {
                Some(field)
            }
        }
    }

    /// Whether the session is complete after this scan.
    #[must_use]
    pub fn session_complete(&self) -> bool {
        matches!(
            self,
            ScanOutcome::Matched {
                session_complete: true,
                ..
            }
        )
    }
}
