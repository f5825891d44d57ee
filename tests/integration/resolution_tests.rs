use scanverify::config::Config;
use scanverify::verify::fields::{FieldListSource, PrimaryFields};
use scanverify::verify::{
    FieldId, FieldSpec, IgnoreReason, ScanOutcome, SessionConfig, SessionEvent, SessionManager,
    SnapshotLog, TargetRecord, TargetSurface, VerifyError,
};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

/// Surface where `lot` only becomes targetable once switched on.
struct LateSurface {
    lot_ready: AtomicBool,
}

impl TargetSurface for LateSurface {
    fn is_resolvable(&self, field: &FieldId) -> bool {
        field.as_str() != "lot" || self.lot_ready.load(Ordering::SeqCst)
    }
}

fn record() -> Arc<TargetRecord> {
    Arc::new(TargetRecord::new([("part", "P-100"), ("lot", "L7")]))
}

#[tokio::test]
async fn test_delimited_setting_is_cleaned() {
    let config = Config {
        primary_fields: Some(PrimaryFields::Delimited(" part, lot,,part ".into())),
        ..Config::default()
    };
    let resolution = config.field_resolver().resolve().await;
    assert_eq!(resolution.required_fields, vec![FieldId::from("part"), "lot".into()]);
    assert_eq!(resolution.source, FieldListSource::Delimited);
}

#[tokio::test]
async fn test_legacy_single_field() {
    let config = Config {
        primary_field: Some(" part ".into()),
        ..Config::default()
    };
    let resolution = config.field_resolver().resolve().await;
    assert_eq!(resolution.required_fields, vec![FieldId::from("part")]);
    assert_eq!(resolution.source, FieldListSource::LegacySingle);
}

#[tokio::test]
async fn test_unknown_ids_dropped_against_metadata() {
    let config = Config {
        primary_fields: Some(vec!["part".to_string(), "lott".to_string()].into()),
        fields: vec![FieldSpec::new("part", "Part No"), FieldSpec::new("lot", "")],
        ..Config::default()
    };
    let resolution = config.field_resolver().resolve().await;
    assert_eq!(resolution.required_fields, vec![FieldId::from("part")]);
    assert_eq!(resolution.dropped_fields, vec![FieldId::from("lott")]);
    assert_eq!(resolution.label_of("part"), "Part No");
}

#[tokio::test]
async fn test_settings_file_fallback() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(
        &path,
        r#"{
            "primaryFields": ["lot", "part"],
            "fields": [{"id": "lot", "label": "Lot"}, {"id": "part", "label": "Part"}]
        }"#,
    )
    .unwrap();

    let config = Config {
        settings_fallback: Some(path),
        ..Config::default()
    };
    let resolution = config.field_resolver().resolve().await;
    assert_eq!(resolution.source, FieldListSource::Fallback);
    assert_eq!(resolution.required_fields, vec![FieldId::from("lot"), "part".into()]);
    assert_eq!(resolution.label_of("lot"), "Lot");
}

#[tokio::test]
async fn test_unreadable_fallback_leaves_session_unconfigured() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(&path, "{ not json").unwrap();

    let config = Config {
        settings_fallback: Some(path),
        ..Config::default()
    };
    let manager = SessionManager::new(config.field_resolver());
    let snapshot = manager.bind(record(), SessionConfig::default()).await;
    assert!(snapshot.required_fields.is_empty());
    assert_eq!(
        manager.handle_scan("P-100").await.unwrap(),
        ScanOutcome::Ignored {
            reason: IgnoreReason::NoRequiredFields
        }
    );
}

#[tokio::test]
async fn test_missing_target_blocks_until_refresh() {
    let surface = Arc::new(LateSurface {
        lot_ready: AtomicBool::new(false),
    });
    let config = Config {
        primary_fields: Some(vec!["part".to_string(), "lot".to_string()].into()),
        ..Config::default()
    };
    let manager = SessionManager::new(config.field_resolver().with_surface(surface.clone()));
    let mut events = manager.subscribe();

    let snapshot = manager.bind(record(), SessionConfig::default()).await;
    assert_eq!(snapshot.missing_fields, vec![FieldId::from("lot")]);
    assert_eq!(
        events.try_recv().unwrap(),
        SessionEvent::SessionInvalid {
            missing: vec!["lot".into()]
        }
    );

    let err = manager.handle_scan("P-100").await.unwrap_err();
    assert_eq!(
        err,
        VerifyError::Configuration {
            missing: vec!["lot".into()]
        }
    );
    assert!(err.to_string().contains("lot"));
    assert!(manager.session().unwrap().sequence().is_empty());

    surface.lot_ready.store(true, Ordering::SeqCst);
    let snapshot = manager.refresh().await.unwrap();
    assert!(snapshot.missing_fields.is_empty());
    assert!(manager.handle_scan("P-100").await.unwrap().matched());
    assert!(manager.handle_scan("L7").await.unwrap().session_complete());
}

#[tokio::test]
async fn test_refused_scan_republishes_snapshot() {
    let surface = Arc::new(LateSurface {
        lot_ready: AtomicBool::new(false),
    });
    let config = Config {
        primary_fields: Some(vec!["part".to_string(), "lot".to_string()].into()),
        ..Config::default()
    };
    let log = Arc::new(SnapshotLog::new());
    let manager = SessionManager::new(config.field_resolver().with_surface(surface))
        .with_broadcast_sink(log.clone());
    manager.bind(record(), SessionConfig::default()).await;
    let published = log.snapshots().len();

    assert!(manager.handle_scan("P-100").await.is_err());
    assert_eq!(log.snapshots().len(), published + 1);
    assert_eq!(
        log.latest().unwrap().missing_fields,
        vec![FieldId::from("lot")]
    );
}

#[tokio::test]
async fn test_refresh_without_binding() {
    let manager = SessionManager::new(Config::default().field_resolver());
    assert!(manager.refresh().await.is_none());
}
