//! Ordered log of scan attempts for the active session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::FieldId;

/// One `handle_scan` evaluation, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAttempt {
    /// 1-based position within the session.
    pub sequence_number: u64,
    /// When the scan was evaluated.
    pub timestamp: DateTime<Utc>,
    /// The code exactly as received.
    pub scanned_code: String,
    /// Field the scan was checked against.
    pub field_id: FieldId,
    /// Label of that field at scan time.
    pub field_label: String,
    /// Value the scan was compared with.
    pub expected_value: String,
    /// Comparison result.
    pub matched: bool,
}

/// Append-only, per-session list of [`ScanAttempt`]s.
///
/// Not persisted by itself; the session manager copies it into the
/// completion audit record.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    attempts: Vec<ScanAttempt>,
    next_number: u64,
}

impl SequenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt, assigning the next sequence number.
    pub fn record(
        &mut self,
        scanned_code: &str,
        field_id: &FieldId,
        field_label: &str,
        expected_value: &str,
        matched: bool,
    ) -> &ScanAttempt {
        self.next_number += 1;
        self.attempts.push(ScanAttempt {
            sequence_number: self.next_number,
            timestamp: Utc::now(),
            scanned_code: scanned_code.to_string(),
            field_id: field_id.clone(),
            field_label: field_label.to_string(),
            expected_value: expected_value.to_string(),
            matched,
        });
        &self.attempts[self.attempts.len() - 1]
    }

    /// All attempts in scan order.
    #[must_use]
    pub fn attempts(&self) -> &[ScanAttempt] {
        &self.attempts
    }

    /// The most recent attempt.
    #[must_use]
    pub fn last(&self) -> Option<&ScanAttempt> {
        self.attempts.last()
    }

    /// Attempts made against one field.
    pub fn for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a ScanAttempt> + 'a {
        self.attempts
            .iter()
            .filter(move |a| a.field_id.as_str() == field)
    }

    /// Number of failed attempts in the session.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.attempts.iter().filter(|a| !a.matched).count()
    }

    /// Number of attempts recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Drop all attempts and restart numbering.
    pub fn clear(&mut self) {
        self.attempts.clear();
        self.next_number = 0;
    }
}
