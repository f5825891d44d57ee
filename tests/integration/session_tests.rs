use scanverify::audit::{AuditRecord, MemoryAuditSink};
use scanverify::config::Config;
use scanverify::verify::fields::PrimaryFields;
use scanverify::verify::{
    ComparisonOperator, FieldResolver, FieldSpec, FieldState, IgnoreReason, ScanOutcome,
    SessionConfig, SessionEvent, SessionManager, SessionPhase, SnapshotLog, TargetRecord,
};
use std::sync::Arc;

fn resolver(ids: &[&str]) -> FieldResolver {
    Config {
        primary_fields: Some(PrimaryFields::List(
            ids.iter().map(|s| (*s).to_string()).collect(),
        )),
        fields: ids
            .iter()
            .map(|id| FieldSpec::new(*id, id.to_uppercase()))
            .collect(),
        ..Config::default()
    }
    .field_resolver()
}

fn record(pairs: &[(&str, &str)]) -> Arc<TargetRecord> {
    Arc::new(TargetRecord::new(pairs.iter().copied()))
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_happy_path_completes_in_order() {
    let audit = Arc::new(MemoryAuditSink::new());
    let manager = SessionManager::new(resolver(&["a", "b"])).with_audit_sink(audit.clone());
    let mut events = manager.subscribe();

    let snapshot = manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;
    assert_eq!(snapshot.active_field.as_ref().map(|f| f.as_str()), Some("a"));
    assert_eq!(snapshot.phase, SessionPhase::Waiting);

    let first = manager.handle_scan("X1").await.unwrap();
    assert_eq!(
        first,
        ScanOutcome::Matched {
            field: "a".into(),
            session_complete: false,
        }
    );
    assert_eq!(manager.get_active_field().unwrap().as_str(), "b");

    let second = manager.handle_scan("Y1").await.unwrap();
    assert!(second.session_complete());
    manager.flush().await;

    let session = manager.session().unwrap();
    assert!(session.is_complete());
    assert_eq!(session.phase(), SessionPhase::Complete);
    assert_eq!(manager.completed_units(), 1);

    let events = drain(&mut events);
    assert!(matches!(events[0], SessionEvent::FieldMatched { .. }));
    assert!(matches!(events[1], SessionEvent::FieldMatched { .. }));
    match &events[2] {
        SessionEvent::SessionComplete(summary) => {
            assert_eq!(summary.record_key.as_deref(), Some("X1"));
            assert_eq!(summary.attempts, 2);
            assert_eq!(summary.failures, 0);
            assert_eq!(summary.values[1].label, "B");
        }
        other => panic!("expected completion, got {:?}", other),
    }

    let records = audit.records();
    assert_eq!(records.len(), 1);
    match &records[0] {
        AuditRecord::Completed(done) => {
            assert_eq!(done.scanned_code, "Y1");
            assert_eq!(done.sequence.len(), 2);
        }
        other => panic!("expected completion record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_scan_after_completion_is_ignored() {
    let manager = SessionManager::new(resolver(&["a"]));
    manager
        .bind(record(&[("a", "X1")]), SessionConfig::default())
        .await;
    manager.handle_scan("X1").await.unwrap();

    let outcome = manager.handle_scan("X1").await.unwrap();
    assert_eq!(
        outcome,
        ScanOutcome::Ignored {
            reason: IgnoreReason::AllMatched
        }
    );
    assert_eq!(manager.session().unwrap().sequence().len(), 1);
}

#[tokio::test]
async fn test_mismatch_marks_only_active_field() {
    let audit = Arc::new(MemoryAuditSink::new());
    let manager = SessionManager::new(resolver(&["a", "b"])).with_audit_sink(audit.clone());
    let mut events = manager.subscribe();
    manager
        .bind(record(&[("a", "L7"), ("b", "Y1")]), SessionConfig::default())
        .await;

    let outcome = manager.handle_scan("L8").await.unwrap();
    assert!(!outcome.matched());
    assert_eq!(outcome.field_id().map(|f| f.as_str()), Some("a"));
    manager.flush().await;

    let session = manager.session().unwrap();
    assert_eq!(session.field_state("a"), Some(FieldState::Failed));
    assert_eq!(session.field_state("b"), Some(FieldState::Pending));
    assert_eq!(session.manual_active_field().map(|f| f.as_str()), Some("a"));
    assert_eq!(session.sequence().failure_count(), 1);

    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::FieldFailed { field: "a".into() }]
    );

    let records = audit.records();
    match &records[..] {
        [AuditRecord::Mismatch(m)] => {
            assert_eq!(m.field_id.as_str(), "a");
            assert_eq!(m.field_label, "A");
            assert_eq!(m.diagnosis.scanned_char_codes, vec![76, 56]);
            assert_eq!(m.diagnosis.expected_char_codes, vec![76, 55]);
            assert_eq!(m.required_fields.len(), 2);
        }
        other => panic!("expected one mismatch record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_normalized_equality() {
    let manager = SessionManager::new(resolver(&["a"]));
    manager
        .bind(record(&[("a", "abc")]), SessionConfig::default())
        .await;
    assert!(manager.handle_scan(" Abc ").await.unwrap().matched());
}

#[tokio::test]
async fn test_contains_accepts_either_direction() {
    let config = SessionConfig::with_operator(ComparisonOperator::Contains);
    let manager = SessionManager::new(resolver(&["a"]));

    manager.bind(record(&[("a", "LOT-123")]), config.clone()).await;
    assert!(manager.handle_scan("lot-123-A").await.unwrap().matched());

    manager.bind(record(&[("a", "LOT-999-XL")]), config).await;
    assert!(manager.handle_scan("999").await.unwrap().matched());
}

#[tokio::test]
async fn test_invalid_regex_falls_back_to_equality() {
    let config = SessionConfig::with_operator(ComparisonOperator::Regex);
    let manager = SessionManager::new(resolver(&["a"]));
    manager.bind(record(&[("a", "([")]), config).await;

    assert!(!manager.handle_scan("x").await.unwrap().matched());
    assert!(manager.handle_scan(" ([ ").await.unwrap().matched());
}

#[tokio::test]
async fn test_manual_reselect_reopens_passed_field() {
    let manager = SessionManager::new(resolver(&["a", "b"]));
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;
    manager.handle_scan("X1").await.unwrap();

    assert!(manager.set_manual_active_field("a"));
    let session = manager.session().unwrap();
    assert!(!session.matched_fields().contains("a"));
    assert_eq!(manager.get_active_field().unwrap().as_str(), "a");

    assert!(manager.handle_scan("X1").await.unwrap().matched());
    assert_eq!(manager.get_active_field().unwrap().as_str(), "b");
    assert_eq!(manager.session().unwrap().manual_active_field(), None);
}

#[tokio::test]
async fn test_clear_manual_returns_to_order() {
    let manager = SessionManager::new(resolver(&["a", "b", "c"]));
    manager
        .bind(
            record(&[("a", "1"), ("b", "2"), ("c", "3")]),
            SessionConfig::default(),
        )
        .await;

    assert!(manager.set_manual_active_field("c"));
    assert_eq!(manager.get_active_field().unwrap().as_str(), "c");
    assert!(manager.clear_manual_active_field());
    assert!(!manager.clear_manual_active_field());
    assert_eq!(manager.get_active_field().unwrap().as_str(), "a");
}

#[tokio::test]
async fn test_rebind_different_record_resets_progress() {
    let manager = SessionManager::new(resolver(&["a", "b"]));
    let config = SessionConfig::default();
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), config.clone())
        .await;
    manager.handle_scan("X1").await.unwrap();
    manager.handle_scan("bad").await.unwrap();
    let epoch = manager.epoch();

    manager
        .bind(record(&[("a", "X2"), ("b", "Y2")]), config)
        .await;
    let session = manager.session().unwrap();
    assert!(session.matched_fields().is_empty());
    assert!(session.failed_fields().is_empty());
    assert_eq!(session.manual_active_field(), None);
    assert!(session.sequence().is_empty());
    assert_eq!(manager.epoch(), epoch + 1);
    assert_eq!(manager.get_active_field().unwrap().as_str(), "a");
}

#[tokio::test]
async fn test_rebind_same_record_is_idempotent() {
    let manager = SessionManager::new(resolver(&["a", "b"]));
    let target = record(&[("a", "X1"), ("b", "Y1")]);
    manager.bind(target.clone(), SessionConfig::default()).await;
    manager.handle_scan("X1").await.unwrap();

    let before = manager.snapshot().unwrap();
    let after = manager.bind(target, SessionConfig::default()).await;
    assert_eq!(before.matched_fields, after.matched_fields);
    assert_eq!(before.active_field, after.active_field);
    assert_eq!(before.attempts, after.attempts);
}

#[tokio::test]
async fn test_no_required_fields_ignores_scans() {
    let manager = SessionManager::new(FieldResolver::new(Arc::new(Config::default())));
    let snapshot = manager
        .bind(record(&[("a", "X1")]), SessionConfig::default())
        .await;
    assert!(snapshot.required_fields.is_empty());

    let outcome = manager.handle_scan("X1").await.unwrap();
    assert_eq!(
        outcome,
        ScanOutcome::Ignored {
            reason: IgnoreReason::NoRequiredFields
        }
    );
    assert!(!manager.session().unwrap().is_complete());
}

#[tokio::test]
async fn test_every_change_is_broadcast() {
    let log = Arc::new(SnapshotLog::new());
    let manager = SessionManager::new(resolver(&["a", "b"])).with_broadcast_sink(log.clone());
    manager
        .bind(record(&[("a", "X1"), ("b", "Y1")]), SessionConfig::default())
        .await;
    manager.handle_scan("X1").await.unwrap();
    manager.set_manual_active_field("a");

    let snapshots = log.snapshots();
    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots[1].matched_fields.len(), 1);
    assert_eq!(
        log.latest().unwrap().active_field.map(|f| f.to_string()),
        Some("a".to_string())
    );
}

#[tokio::test]
async fn test_missing_expected_value_compares_against_empty() {
    let audit = Arc::new(MemoryAuditSink::new());
    let manager = SessionManager::new(resolver(&["a", "b"])).with_audit_sink(audit.clone());
    manager
        .bind(record(&[("a", "X1")]), SessionConfig::default())
        .await;
    manager.handle_scan("X1").await.unwrap();

    assert!(!manager.handle_scan("Y1").await.unwrap().matched());
    manager.flush().await;
    match audit.records().last() {
        Some(AuditRecord::Mismatch(m)) => {
            assert_eq!(m.diagnosis.reason, scanverify::verify::MismatchReason::EmptyExpected);
        }
        other => panic!("expected mismatch record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_expected_value_is_contained_in_any_scan() {
    let config = SessionConfig::with_operator(ComparisonOperator::Contains);
    let manager = SessionManager::new(resolver(&["a", "b"]));
    manager.bind(record(&[("a", "X1")]), config).await;
    manager.handle_scan("X1").await.unwrap();

    assert_eq!(
        manager.handle_scan("ANYTHING").await.unwrap(),
        ScanOutcome::Matched {
            field: "b".into(),
            session_complete: true,
        }
    );
}
