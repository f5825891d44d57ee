//! The scan session entity and its derived states.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::compare::ComparisonOperator;
use super::fields::Resolution;
use super::record::{FieldId, FieldSpec, TargetRecord};
use super::sequence::SequenceTracker;

/// Per-bind session configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Comparison operator for every field.
    #[serde(default)]
    pub operator: ComparisonOperator,
    /// Field whose value identifies the record. Defaults to the first
    /// required field.
    #[serde(default)]
    pub primary_key: Option<FieldId>,
    /// Operator/station identity recorded in audit records.
    #[serde(default)]
    pub scanned_by: Option<String>,
}

impl SessionConfig {
    /// Config with the given operator and defaults elsewhere.
    #[must_use]
    pub fn with_operator(operator: ComparisonOperator) -> Self {
        Self {
            operator,
            ..Self::default()
        }
    }
}

/// Verification state of one required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    /// Waiting its turn.
    Pending,
    /// Expecting the next scan.
    Active,
    /// Verified.
    Passed,
    /// Last scan did not match; awaiting recovery.
    Failed,
}

/// Overall progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No field verified yet.
    Waiting,
    /// Some fields verified.
    InProgress,
    /// Every required field verified.
    Complete,
}

/// Verification state for the currently bound record.
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub(crate) target: Arc<TargetRecord>,
    pub(crate) config: SessionConfig,
    pub(crate) fields: Vec<FieldSpec>,
    pub(crate) required_fields: Vec<FieldId>,
    pub(crate) matched_fields: BTreeSet<FieldId>,
    pub(crate) failed_fields: BTreeSet<FieldId>,
    pub(crate) manual_active_field: Option<FieldId>,
    pub(crate) sequence: SequenceTracker,
    pub(crate) missing_fields: Vec<FieldId>,
    pub(crate) epoch: u64,
}

impl ScanSession {
    pub(crate) fn new(
        target: Arc<TargetRecord>,
        config: SessionConfig,
        resolution: Resolution,
        epoch: u64,
    ) -> Self {
        Self {
            target,
            config,
            fields: resolution.fields,
            required_fields: resolution.required_fields,
            matched_fields: BTreeSet::new(),
            failed_fields: BTreeSet::new(),
            manual_active_field: None,
            sequence: SequenceTracker::new(),
            missing_fields: resolution.missing_fields,
            epoch,
        }
    }

    /// The bound record.
    #[must_use]
    pub fn target(&self) -> &Arc<TargetRecord> {
        &self.target
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Ordered required-field sequence.
    #[must_use]
    pub fn required_fields(&self) -> &[FieldId] {
        &self.required_fields
    }

    /// Specs of the required fields, in order.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Fields verified so far.
    #[must_use]
    pub fn matched_fields(&self) -> &BTreeSet<FieldId> {
        &self.matched_fields
    }

    /// Fields whose last scan failed and have not recovered.
    #[must_use]
    pub fn failed_fields(&self) -> &BTreeSet<FieldId> {
        &self.failed_fields
    }

    /// Operator-selected field, if any.
    #[must_use]
    pub fn manual_active_field(&self) -> Option<&FieldId> {
        self.manual_active_field.as_ref()
    }

    /// Every attempt made in this session.
    #[must_use]
    pub fn sequence(&self) -> &SequenceTracker {
        &self.sequence
    }

    /// Whether any required field is unresolvable.
    #[must_use]
    pub fn has_missing_fields(&self) -> bool {
        !self.missing_fields.is_empty()
    }

    /// Unresolvable required fields.
    #[must_use]
    pub fn missing_fields(&self) -> &[FieldId] {
        &self.missing_fields
    }

    /// Field expecting the next scan.
    ///
    /// The manual override wins while it is unmatched; otherwise the first
    /// unmatched field in configuration order. `None` when all are matched.
    #[must_use]
    pub fn active_field(&self) -> Option<&FieldId> {
        if let Some(manual) = &self.manual_active_field {
            if !self.matched_fields.contains(manual) {
                return Some(manual);
            }
        }
        self.required_fields
            .iter()
            .find(|f| !self.matched_fields.contains(*f))
    }

    /// State of one field. `None` for ids outside the required sequence.
    #[must_use]
    pub fn field_state(&self, field: &str) -> Option<FieldState> {
        let field = self.required_fields.iter().find(|f| f.as_str() == field)?;
        Some(if self.matched_fields.contains(field) {
            FieldState::Passed
        } else if self.failed_fields.contains(field) {
            FieldState::Failed
        } else if self.active_field() == Some(field) {
            FieldState::Active
        } else {
            FieldState::Pending
        })
    }

    /// Overall progress.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        if self.is_complete() {
            SessionPhase::Complete
        } else if self.matched_fields.is_empty() {
            SessionPhase::Waiting
        } else {
            SessionPhase::InProgress
        }
    }

    /// Whether every required field is matched (and there is at least one).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.required_fields.is_empty()
            && self
                .required_fields
                .iter()
                .all(|f| self.matched_fields.contains(f))
    }

    /// Effective primary-key field.
    #[must_use]
    pub fn primary_key(&self) -> Option<&FieldId> {
        self.config
            .primary_key
            .as_ref()
            .or_else(|| self.required_fields.first())
    }

    /// Identity key of the bound record.
    #[must_use]
    pub fn record_key(&self) -> Option<&str> {
        self.primary_key().and_then(|pk| self.target.key(pk.as_str()))
    }

    /// Label of a field, defaulting to its id.
    #[must_use]
    pub fn label_of(&self, field: &str) -> String {
        self.fields
            .iter()
            .find(|f| f.id.as_str() == field)
            .map(|f| f.display_label().to_string())
            .unwrap_or_else(|| field.to_string())
    }

    /// Serializable view for broadcast consumers.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            record_key: self.record_key().map(str::to_string),
            row_index: self.target.row_index(),
            required_fields: self.required_fields.clone(),
            fields: self
                .required_fields
                .iter()
                .map(|id| FieldStatus {
                    id: id.clone(),
                    label: self.label_of(id.as_str()),
                    state: self.field_state(id.as_str()).unwrap_or(FieldState::Pending),
                })
                .collect(),
            matched_fields: self.matched_fields.iter().cloned().collect(),
            active_field: self.active_field().cloned(),
            missing_fields: self.missing_fields.clone(),
            phase: self.phase(),
            attempts: self.sequence.len(),
        }
    }
}

/// Label and state of one field inside a [`SessionSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStatus {
    /// Field id
    pub id: FieldId,
    /// Display label
    pub label: String,
    /// Current state
    pub state: FieldState,
}

/// Point-in-time view of a session, published to broadcast consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Identity key of the bound record
    pub record_key: Option<String>,
    /// Master-data row index
    pub row_index: Option<usize>,
    /// Ordered required fields
    pub required_fields: Vec<FieldId>,
    /// Per-field label and state
    pub fields: Vec<FieldStatus>,
    /// Verified fields
    pub matched_fields: Vec<FieldId>,
    /// Field expecting the next scan
    pub active_field: Option<FieldId>,
    /// Unresolvable required fields
    pub missing_fields: Vec<FieldId>,
    /// Overall progress
    pub phase: SessionPhase,
    /// Number of attempts so far
    pub attempts: usize,
}
