//! Events emitted by the session manager.
//!
//! Rendering layers subscribe with [`SessionManager::subscribe`] and react to
//! these; the engine never touches presentation itself.
//!
//! [`SessionManager::subscribe`]: super::SessionManager::subscribe

use serde::{Deserialize, Serialize};

use super::record::FieldId;
use crate::audit::FieldValue;

/// Something observable happened in the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A scan matched its field.
    FieldMatched {
        /// Field that passed
        field: FieldId,
    },
    /// A scan did not match its field.
    FieldFailed {
        /// Field that failed
        field: FieldId,
    },
    /// A failed field was cleared by the PIN gate and is active again.
    FieldRecovered {
        /// Field that recovered
        field: FieldId,
    },
    /// Every required field passed.
    SessionComplete(CompletionSummary),
    /// Required fields cannot be targeted; scanning is blocked.
    SessionInvalid {
        /// Unresolvable field ids
        missing: Vec<FieldId>,
    },
}

/// Summary carried by [`SessionEvent::SessionComplete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSummary {
    /// Identity key of the verified record
    pub record_key: Option<String>,
    /// Master-data row index
    pub row_index: Option<usize>,
    /// Final value of each required field
    pub values: Vec<FieldValue>,
    /// Scan attempts in the session
    pub attempts: usize,
    /// Failed attempts in the session
    pub failures: usize,
    /// Units completed by this manager, including this one
    pub completed_units: u64,
}
