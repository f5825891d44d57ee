//! The session manager: owns the bound [`ScanSession`] and applies scans to it.
//!
//! # Locking
//!
//! All session state sits behind one `std::sync::Mutex`. Every method takes
//! the lock, mutates, builds whatever has to be published and releases the lock
//! before awaiting anything (field resolution, the PIN gate). The active field
//! is re-derived from session data on every call, so a scan arriving while a
//! PIN prompt is open is scored against the current state.
//!
//! # Epochs
//!
//! Each bind that resets progress starts a new epoch. A PIN answer is applied
//! only if the session still has the epoch it was requested under and the
//! field is still failed; otherwise it is reported as [`Recovery::Stale`].
//!
//! # Side effects
//!
//! Audit writes run detached on the runtime and are tracked in a `JoinSet`;
//! [`SessionManager::flush`] waits for them. Audit and broadcast failures are
//! logged and never reach the caller.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use super::collaborators::{
    AuditSink, BroadcastSink, NoAudit, NoBroadcast, PinGate, TargetRecordSource,
};
use super::compare::{compare, diagnose};
use super::events::{CompletionSummary, SessionEvent};
use super::fields::{FieldResolver, Resolution};
use super::record::{FieldId, TargetRecord};
use super::session::{ScanSession, SessionConfig, SessionSnapshot};
use super::{IgnoreReason, Recovery, ScanOutcome, VerifyError};
use crate::audit::{
    AuditRecord, AuditStatus, CompletionRecord, FieldValue, MismatchRecord, ValueSource,
};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct ManagerState {
    session: Option<ScanSession>,
    epoch: u64,
    completed_units: u64,
}

/// A scored scan, ready to be published once the lock is released.
struct Scored {
    outcome: ScanOutcome,
    epoch: u64,
    audit: Option<AuditRecord>,
    events: Vec<SessionEvent>,
    snapshot: SessionSnapshot,
}

enum Evaluation {
    Ignored(IgnoreReason),
    Scored(Scored),
}

impl ManagerState {
    fn bind(
        &mut self,
        target: Arc<TargetRecord>,
        config: SessionConfig,
        resolution: Resolution,
    ) -> SessionSnapshot {
        let primary_key = config
            .primary_key
            .clone()
            .or_else(|| resolution.required_fields.first().cloned());
        let keep = self
            .session
            .as_ref()
            .is_some_and(|s| same_record(&s.target, &target, primary_key.as_ref()));

        if keep {
            if let Some(session) = self.session.as_mut() {
                carry_progress(session, target, config, resolution);
                log::debug!(
                    "Rebound same record {:?}, progress kept",
                    session.record_key()
                );
                return session.snapshot();
            }
        }

        self.epoch += 1;
        let session = ScanSession::new(target, config, resolution, self.epoch);
        log::info!(
            "Bound record {} ({} required fields)",
            session.record_key().unwrap_or("<no key>"),
            session.required_fields().len()
        );
        let snapshot = session.snapshot();
        self.session = Some(session);
        snapshot
    }

    fn evaluate(
        &mut self,
        raw: &str,
        records: Option<&dyn TargetRecordSource>,
    ) -> Result<Evaluation, VerifyError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(Evaluation::Ignored(IgnoreReason::NoTarget));
        };
        if session.has_missing_fields() {
            return Err(VerifyError::Configuration {
                missing: session.missing_fields.clone(),
            });
        }
        if session.required_fields.is_empty() {
            return Ok(Evaluation::Ignored(IgnoreReason::NoRequiredFields));
        }
        let Some(field) = session.active_field().cloned() else {
            return Ok(Evaluation::Ignored(IgnoreReason::AllMatched));
        };

        let label = session.label_of(field.as_str());
        let expected = expected_value(session, &field, records);
        let matched = compare(raw, &expected, session.config.operator);
        session
            .sequence
            .record(raw, &field, &label, &expected, matched);

        let mut events = Vec::new();
        let mut audit = None;
        let outcome = if matched {
            session.matched_fields.insert(field.clone());
            session.failed_fields.remove(&field);
            if session.manual_active_field.as_ref() == Some(&field) {
                session.manual_active_field = None;
            }
            log::debug!("Field '{}' passed", field);
            events.push(SessionEvent::FieldMatched {
                field: field.clone(),
            });

            let complete = session.is_complete();
            if complete {
                self.completed_units += 1;
                let values = field_values(session, records);
                let attempts = session.sequence.attempts();
                log::info!(
                    "All fields matched for {} after {} scans",
                    session.record_key().unwrap_or("<no key>"),
                    attempts.len()
                );
                audit = Some(AuditRecord::Completed(CompletionRecord {
                    timestamp: Utc::now(),
                    status: AuditStatus::AllFieldsMatched,
                    record_key: session.record_key().map(str::to_string),
                    row_index: session.target.row_index(),
                    scanned_code: raw.to_string(),
                    scanned_by: session.config.scanned_by.clone(),
                    operator: session.config.operator,
                    values: values.clone(),
                    sequence: attempts.to_vec(),
                }));
                events.push(SessionEvent::SessionComplete(CompletionSummary {
                    record_key: session.record_key().map(str::to_string),
                    row_index: session.target.row_index(),
                    values,
                    attempts: attempts.len(),
                    failures: session.sequence.failure_count(),
                    completed_units: self.completed_units,
                }));
            }
            ScanOutcome::Matched {
                field,
                session_complete: complete,
            }
        } else {
            session.failed_fields.insert(field.clone());
            session.manual_active_field = Some(field.clone());

            let diagnosis = diagnose(raw, &expected);
            log::warn!(
                "Scan '{}' does not match '{}' (expected '{}', {})",
                raw,
                label,
                expected,
                diagnosis.reason
            );
            audit = Some(AuditRecord::Mismatch(MismatchRecord {
                timestamp: Utc::now(),
                status: AuditStatus::NotMatched,
                record_key: session.record_key().map(str::to_string),
                row_index: session.target.row_index(),
                field_id: field.clone(),
                field_label: label,
                scanned_by: session.config.scanned_by.clone(),
                operator: session.config.operator,
                diagnosis,
                values: field_values(session, records),
                required_fields: session.required_fields.clone(),
            }));
            events.push(SessionEvent::FieldFailed {
                field: field.clone(),
            });
            ScanOutcome::Mismatched {
                field,
                recovery: Recovery::Pending,
            }
        };

        Ok(Evaluation::Scored(Scored {
            outcome,
            epoch: session.epoch,
            audit,
            events,
            snapshot: session.snapshot(),
        }))
    }
}

fn same_record(bound: &TargetRecord, other: &TargetRecord, primary_key: Option<&FieldId>) -> bool {
    match primary_key {
        Some(pk) => bound.same_identity(other, pk.as_str()),
        None => bound == other,
    }
}

/// Re-resolve a session in place, keeping progress on fields still required.
fn carry_progress(
    session: &mut ScanSession,
    target: Arc<TargetRecord>,
    config: SessionConfig,
    resolution: Resolution,
) {
    let required: BTreeSet<&FieldId> = resolution.required_fields.iter().collect();
    session.matched_fields.retain(|f| required.contains(f));
    session.failed_fields.retain(|f| required.contains(f));
    if session
        .manual_active_field
        .as_ref()
        .is_some_and(|f| !required.contains(f))
    {
        session.manual_active_field = None;
    }
    session.target = target;
    session.config = config;
    session.fields = resolution.fields;
    session.required_fields = resolution.required_fields;
    session.missing_fields = resolution.missing_fields;
}

/// Record value if present, else the live value, else empty.
fn expected_value(
    session: &ScanSession,
    field: &FieldId,
    records: Option<&dyn TargetRecordSource>,
) -> String {
    session
        .target
        .value(field.as_str())
        .map(str::to_string)
        .or_else(|| records.and_then(|r| r.live_value(field)))
        .unwrap_or_default()
}

fn field_values(
    session: &ScanSession,
    records: Option<&dyn TargetRecordSource>,
) -> Vec<FieldValue> {
    session
        .required_fields
        .iter()
        .map(|id| {
            let (value, source) = match session.target.value(id.as_str()) {
                Some(v) => (v.to_string(), ValueSource::Record),
                None => match records.and_then(|r| r.live_value(id)) {
                    Some(v) => (v, ValueSource::Live),
                    None => (String::new(), ValueSource::Empty),
                },
            };
            FieldValue {
                id: id.clone(),
                label: session.label_of(id.as_str()),
                value,
                source,
            }
        })
        .collect()
}

/// Owns the scan session and applies bind, scan and override operations.
pub struct SessionManager {
    resolver: FieldResolver,
    audit: Arc<dyn AuditSink>,
    pin_gate: Option<Arc<dyn PinGate>>,
    broadcast: Arc<dyn BroadcastSink>,
    records: Option<Arc<dyn TargetRecordSource>>,
    default_config: SessionConfig,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<SessionEvent>,
    pending: Mutex<JoinSet<()>>,
}

impl SessionManager {
    /// Manager with no audit, no broadcast, no PIN gate and no record source.
    #[must_use]
    pub fn new(resolver: FieldResolver) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            resolver,
            audit: Arc::new(NoAudit),
            pin_gate: None,
            broadcast: Arc::new(NoBroadcast),
            records: None,
            default_config: SessionConfig::default(),
            state: Mutex::new(ManagerState::default()),
            events,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    /// Persist audit records through `sink`.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Ask `gate` for recovery after each mismatch.
    #[must_use]
    pub fn with_pin_gate(mut self, gate: Arc<dyn PinGate>) -> Self {
        self.pin_gate = Some(gate);
        self
    }

    /// Publish snapshots through `sink`.
    #[must_use]
    pub fn with_broadcast_sink(mut self, sink: Arc<dyn BroadcastSink>) -> Self {
        self.broadcast = sink;
        self
    }

    /// Follow the operator's selection and read live values from `source`.
    #[must_use]
    pub fn with_record_source(mut self, source: Arc<dyn TargetRecordSource>) -> Self {
        self.records = Some(source);
        self
    }

    /// Config used for implicit binds.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.default_config = config;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a record, resolving the required fields afresh.
    ///
    /// A record with a different identity key resets progress and starts a new
    /// epoch. The same key keeps matched fields that are still required.
    pub async fn bind(&self, target: Arc<TargetRecord>, config: SessionConfig) -> SessionSnapshot {
        let resolution = self.resolver.resolve().await;
        let missing = resolution.missing_fields.clone();

        let snapshot = self.lock().bind(target, config, resolution);

        if !missing.is_empty() {
            log::error!(
                "Session blocked: required fields {:?} cannot be targeted",
                missing
            );
            self.emit(SessionEvent::SessionInvalid { missing });
        }
        self.publish(&snapshot);
        snapshot
    }

    /// Re-resolve the required fields for the bound record, keeping progress.
    ///
    /// Returns `None` when nothing is bound.
    pub async fn refresh(&self) -> Option<SessionSnapshot> {
        let (target, config) = {
            let state = self.lock();
            let session = state.session.as_ref()?;
            (Arc::clone(&session.target), session.config.clone())
        };
        Some(self.bind(target, config).await)
    }

    /// Score one scanned code against the active field.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Configuration`] while required fields are
    /// unresolvable. Nothing is mutated in that case.
    pub async fn handle_scan(&self, raw: &str) -> Result<ScanOutcome, VerifyError> {
        if raw.trim().is_empty() {
            log::trace!("Ignoring empty scan");
            return Ok(ScanOutcome::ignored(IgnoreReason::EmptyScan));
        }

        self.follow_selection().await;

        let evaluation = self.lock().evaluate(raw, self.records.as_deref());
        let scored = match evaluation {
            Err(err) => {
                match &err {
                    VerifyError::Configuration { missing } => {
                        log::error!("Scan refused: {}", err);
                        self.emit(SessionEvent::SessionInvalid {
                            missing: missing.clone(),
                        });
                    }
                }
                if let Some(snapshot) = self.snapshot() {
                    self.publish(&snapshot);
                }
                return Err(err);
            }
            Ok(Evaluation::Ignored(reason)) => {
                log::debug!("Scan '{}' ignored: {:?}", raw, reason);
                if let Some(snapshot) = self.snapshot() {
                    self.publish(&snapshot);
                }
                return Ok(ScanOutcome::ignored(reason));
            }
            Ok(Evaluation::Scored(scored)) => scored,
        };

        if let Some(record) = scored.audit {
            self.persist_detached(record);
        }
        for event in scored.events {
            self.emit(event);
        }
        self.publish(&scored.snapshot);

        match scored.outcome {
            ScanOutcome::Mismatched { field, .. } => {
                let recovery = self.run_pin_gate(field.clone(), scored.epoch).await;
                Ok(ScanOutcome::Mismatched { field, recovery })
            }
            outcome => Ok(outcome),
        }
    }

    /// Ask the PIN gate again for the active field, if it is failed.
    ///
    /// Returns `None` when the active field is not failed.
    pub async fn retry_recovery(&self) -> Option<Recovery> {
        let (field, epoch) = {
            let state = self.lock();
            let session = state.session.as_ref()?;
            let field = session.active_field()?;
            if !session.failed_fields.contains(field) {
                return None;
            }
            (field.clone(), session.epoch)
        };
        Some(self.run_pin_gate(field, epoch).await)
    }

    /// Make `field` the target of the next scan.
    ///
    /// A passed field is un-passed so it can be verified again, and a failed
    /// mark is cleared. Returns `false` (and changes nothing) when `field` is
    /// not in the required sequence or nothing is bound.
    pub fn set_manual_active_field(&self, field: &str) -> bool {
        let snapshot = {
            let mut state = self.lock();
            let Some(session) = state.session.as_mut() else {
                return false;
            };
            let Some(id) = session
                .required_fields
                .iter()
                .find(|f| f.as_str() == field)
                .cloned()
            else {
                log::debug!("Ignoring manual selection of '{}': not required", field);
                return false;
            };
            if session.matched_fields.remove(&id) {
                log::info!("Field '{}' reopened for re-verification", id);
            }
            session.failed_fields.remove(&id);
            session.manual_active_field = Some(id);
            session.snapshot()
        };
        self.publish(&snapshot);
        true
    }

    /// Drop the manual override, returning to configuration order.
    ///
    /// Returns `false` when there was no override.
    pub fn clear_manual_active_field(&self) -> bool {
        let snapshot = {
            let mut state = self.lock();
            let Some(session) = state.session.as_mut() else {
                return false;
            };
            if session.manual_active_field.take().is_none() {
                return false;
            }
            session.snapshot()
        };
        self.publish(&snapshot);
        true
    }

    /// Field expecting the next scan.
    #[must_use]
    pub fn get_active_field(&self) -> Option<FieldId> {
        self.lock()
            .session
            .as_ref()
            .and_then(|s| s.active_field().cloned())
    }

    /// Copy of the bound session.
    #[must_use]
    pub fn session(&self) -> Option<ScanSession> {
        self.lock().session.clone()
    }

    /// Snapshot of the bound session.
    #[must_use]
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.lock().session.as_ref().map(ScanSession::snapshot)
    }

    /// Current epoch; increments on every resetting bind.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Number of sessions that reached completion.
    #[must_use]
    pub fn completed_units(&self) -> u64 {
        self.lock().completed_units
    }

    /// Receive every event emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait for all outstanding audit writes.
    pub async fn flush(&self) {
        let mut pending = {
            let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                log::error!("Audit write task failed: {}", e);
            }
        }
    }

    async fn follow_selection(&self) {
        let Some(records) = self.records.clone() else {
            return;
        };
        let bound = {
            let state = self.lock();
            state.session.as_ref().map(|s| {
                (
                    Arc::clone(&s.target),
                    s.primary_key().cloned(),
                    s.config.clone(),
                )
            })
        };

        match bound {
            None => {
                let target = records.selected_record().or_else(|| {
                    records
                        .primary_value()
                        .and_then(|value| records.find_by_primary(value.trim()))
                });
                match target {
                    Some(target) => {
                        log::info!("No record bound, binding the current selection");
                        self.bind(target, self.default_config.clone()).await;
                    }
                    None => log::debug!("No record bound and nothing selected"),
                }
            }
            Some((target, primary_key, config)) => {
                let Some(selected) = records.selected_record() else {
                    return;
                };
                if Arc::ptr_eq(&target, &selected)
                    || same_record(&target, &selected, primary_key.as_ref())
                {
                    return;
                }
                log::info!("Selection changed, rebinding");
                self.bind(selected, config).await;
            }
        }
    }

    async fn run_pin_gate(&self, field: FieldId, epoch: u64) -> Recovery {
        let Some(gate) = self.pin_gate.clone() else {
            return Recovery::Pending;
        };
        let authorized = gate.verify(&field).await;

        let snapshot = {
            let mut state = self.lock();
            let Some(session) = state
                .session
                .as_mut()
                .filter(|s| s.epoch == epoch && s.failed_fields.contains(&field))
            else {
                log::debug!("Discarding stale PIN result for '{}'", field);
                return Recovery::Stale;
            };
            if !authorized {
                log::info!("PIN not accepted, '{}' stays failed", field);
                return Recovery::Pending;
            }
            session.failed_fields.remove(&field);
            session.snapshot()
        };

        log::info!("PIN accepted, '{}' cleared for rescan", field);
        self.emit(SessionEvent::FieldRecovered { field });
        self.publish(&snapshot);
        Recovery::Cleared
    }

    fn persist_detached(&self, record: AuditRecord) {
        let sink = Arc::clone(&self.audit);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            if let Err(e) = sink.persist(&record).await {
                log::error!("Failed to persist audit record: {}", e);
            }
        });
    }

    fn publish(&self, snapshot: &SessionSnapshot) {
        if let Err(e) = self.broadcast.publish(snapshot) {
            log::error!("Failed to publish session snapshot: {}", e);
        }
    }

    fn emit(&self, event: SessionEvent) {
        log::trace!("Emitting {:?}", event);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
