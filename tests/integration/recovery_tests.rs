use async_trait::async_trait;
use scanverify::audit::AuditRecord;
use scanverify::config::Config;
use scanverify::verify::fields::PrimaryFields;
use scanverify::verify::{
    AuditSink, BroadcastSink, FieldId, FieldResolver, FieldState, PersistenceError, PinGate,
    Recovery, ScanOutcome, SessionConfig, SessionEvent, SessionManager, SessionSnapshot,
    StaticPinGate, TargetRecord,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

fn resolver(ids: &[&str]) -> FieldResolver {
    Config {
        primary_fields: Some(PrimaryFields::List(
            ids.iter().map(|s| (*s).to_string()).collect(),
        )),
        ..Config::default()
    }
    .field_resolver()
}

fn record(pairs: &[(&str, &str)]) -> Arc<TargetRecord> {
    Arc::new(TargetRecord::new(pairs.iter().copied()))
}

/// Gate that reports entry and answers only when released.
struct HeldGate {
    approve: bool,
    calls: AtomicUsize,
    entered: Notify,
    release: Notify,
}

impl HeldGate {
    fn new(approve: bool) -> Self {
        Self {
            approve,
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl PinGate for HeldGate {
    async fn verify(&self, _field: &FieldId) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        self.approve
    }
}

struct CountingGate {
    approve: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl PinGate for CountingGate {
    async fn verify(&self, _field: &FieldId) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.approve
    }
}

struct BrokenAudit;

#[async_trait]
impl AuditSink for BrokenAudit {
    async fn persist(&self, _record: &AuditRecord) -> Result<(), PersistenceError> {
        Err(PersistenceError::Closed("disk full".into()))
    }
}

struct BrokenBroadcast;

impl BroadcastSink for BrokenBroadcast {
    fn publish(&self, _snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        Err(PersistenceError::Closed("no listener".into()))
    }
}

#[tokio::test]
async fn test_gate_asked_once_per_mismatch() {
    let gate = Arc::new(CountingGate {
        approve: false,
        calls: AtomicUsize::new(0),
    });
    let manager = SessionManager::new(resolver(&["a", "b"])).with_pin_gate(gate.clone());
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;

    let outcome = manager.handle_scan("WRONG").await.unwrap();
    assert_eq!(
        outcome,
        ScanOutcome::Mismatched {
            field: "a".into(),
            recovery: Recovery::Pending,
        }
    );
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);

    manager.handle_scan("X1").await.unwrap();
    manager.handle_scan("Y1").await.unwrap();
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_denied_field_recovers_by_rescan() {
    let manager = SessionManager::new(resolver(&["a", "b"]))
        .with_pin_gate(Arc::new(StaticPinGate::deny()));
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;

    manager.handle_scan("WRONG").await.unwrap();
    assert_eq!(
        manager.session().unwrap().field_state("a"),
        Some(FieldState::Failed)
    );

    assert!(manager.handle_scan("X1").await.unwrap().matched());
    let session = manager.session().unwrap();
    assert_eq!(session.field_state("a"), Some(FieldState::Passed));
    assert_eq!(session.field_state("b"), Some(FieldState::Active));
}

#[tokio::test]
async fn test_approved_gate_emits_recovery() {
    let manager = SessionManager::new(resolver(&["a"]))
        .with_pin_gate(Arc::new(StaticPinGate::approve()));
    let mut events = manager.subscribe();
    manager
        .bind(record(&[("a", "X1")]), SessionConfig::default())
        .await;

    manager.handle_scan("WRONG").await.unwrap();
    assert_eq!(
        events.try_recv().unwrap(),
        SessionEvent::FieldFailed { field: "a".into() }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        SessionEvent::FieldRecovered { field: "a".into() }
    );
    assert_eq!(manager.get_active_field().unwrap().as_str(), "a");
}

#[tokio::test]
async fn test_pin_answer_after_rebind_is_stale() {
    let gate = Arc::new(HeldGate::new(true));
    let manager = SessionManager::new(resolver(&["a", "b"])).with_pin_gate(gate.clone());
    let mut events = manager.subscribe();
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;

    let scan = manager.handle_scan("WRONG");
    let rebind = async {
        gate.entered.notified().await;
        manager
            .bind(record(&[("a", "X2"), ("b", "Y2")]), SessionConfig::default())
            .await;
        gate.release.notify_one();
    };
    let (outcome, ()) = tokio::join!(scan, rebind);

    assert_eq!(
        outcome.unwrap(),
        ScanOutcome::Mismatched {
            field: "a".into(),
            recovery: Recovery::Stale,
        }
    );
    let session = manager.session().unwrap();
    assert_eq!(session.record_key(), Some("X2"));
    assert!(session.failed_fields().is_empty());

    let mut recovered = false;
    while let Ok(event) = events.try_recv() {
        recovered |= matches!(event, SessionEvent::FieldRecovered { .. });
    }
    assert!(!recovered);
}

#[tokio::test]
async fn test_scan_during_pin_prompt_is_evaluated() {
    let gate = Arc::new(HeldGate::new(true));
    let manager = SessionManager::new(resolver(&["a", "b"])).with_pin_gate(gate.clone());
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;

    let first = manager.handle_scan("WRONG");
    let second = async {
        gate.entered.notified().await;
        let outcome = manager.handle_scan("X1").await;
        gate.release.notify_one();
        outcome
    };
    let (first, second) = tokio::join!(first, second);

    assert!(second.unwrap().matched());
    assert_eq!(
        first.unwrap(),
        ScanOutcome::Mismatched {
            field: "a".into(),
            recovery: Recovery::Stale,
        }
    );
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_active_field().unwrap().as_str(), "b");
}

#[tokio::test]
async fn test_selecting_other_field_during_prompt_keeps_answer() {
    let gate = Arc::new(HeldGate::new(true));
    let manager = SessionManager::new(resolver(&["a", "b"])).with_pin_gate(gate.clone());
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;

    let scan = manager.handle_scan("WRONG");
    let reselect = async {
        gate.entered.notified().await;
        assert!(manager.set_manual_active_field("b"));
        gate.release.notify_one();
    };
    let (outcome, ()) = tokio::join!(scan, reselect);

    assert_eq!(
        outcome.unwrap(),
        ScanOutcome::Mismatched {
            field: "a".into(),
            recovery: Recovery::Cleared,
        }
    );
    let session = manager.session().unwrap();
    assert!(session.failed_fields().is_empty());
    assert_eq!(manager.get_active_field().unwrap().as_str(), "b");
}

#[tokio::test]
async fn test_reselecting_prompted_field_makes_answer_stale() {
    let gate = Arc::new(HeldGate::new(true));
    let manager = SessionManager::new(resolver(&["a", "b"])).with_pin_gate(gate.clone());
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;

    let scan = manager.handle_scan("WRONG");
    let reselect = async {
        gate.entered.notified().await;
        assert!(manager.set_manual_active_field("a"));
        gate.release.notify_one();
    };
    let (outcome, ()) = tokio::join!(scan, reselect);

    assert_eq!(
        outcome.unwrap(),
        ScanOutcome::Mismatched {
            field: "a".into(),
            recovery: Recovery::Stale,
        }
    );
    let session = manager.session().unwrap();
    assert!(session.failed_fields().is_empty());
    assert_eq!(manager.get_active_field().unwrap().as_str(), "a");
}

#[tokio::test]
async fn test_sink_failures_do_not_stop_session() {
    let manager = SessionManager::new(resolver(&["a", "b"]))
        .with_audit_sink(Arc::new(BrokenAudit))
        .with_broadcast_sink(Arc::new(BrokenBroadcast));
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;

    assert!(!manager.handle_scan("WRONG").await.unwrap().matched());
    assert!(manager.handle_scan("X1").await.unwrap().matched());
    assert!(manager.handle_scan("Y1").await.unwrap().session_complete());
    manager.flush().await;
    assert_eq!(manager.completed_units(), 1);
}
