use scanverify::audit::{verify_audit_log, CsvAuditSink, JsonLinesAuditSink};
use scanverify::config::Config;
use scanverify::verify::fields::PrimaryFields;
use scanverify::verify::{FieldSpec, SessionManager, TargetRecord};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn config() -> Config {
    Config {
        primary_fields: Some(PrimaryFields::List(vec!["part".into(), "lot".into()])),
        fields: vec![FieldSpec::new("part", "Part No"), FieldSpec::new("lot", "Lot")],
        scanned_by: Some("station-2".into()),
        ..Config::default()
    }
}

async fn run_unit(manager: &SessionManager, config: &Config) {
    manager
        .bind(
            Arc::new(TargetRecord::new([("part", "P-100"), ("lot", "L7")]).with_row_index(2)),
            config.session_config(),
        )
        .await;
    manager.handle_scan("P-100").await.unwrap();
    manager.handle_scan("L8").await.unwrap();
    manager.handle_scan("L7").await.unwrap();
    manager.flush().await;
}

fn lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_jsonl_log_records_mismatch_and_completion() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("logs").join("audit.jsonl");
    let config = config();
    let manager = SessionManager::new(config.field_resolver())
        .with_audit_sink(Arc::new(JsonLinesAuditSink::new(&path)));

    run_unit(&manager, &config).await;

    let lines = lines(&path);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"NOT_MATCHED\""));
    assert!(lines[0].contains("\"station-2\""));
    assert!(lines[1].contains("\"ALL_FIELDS_MATCHED\""));

    let report = verify_audit_log(&path).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.valid, 2);
}

#[tokio::test]
async fn test_jsonl_log_detects_edited_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let config = config();
    let manager = SessionManager::new(config.field_resolver())
        .with_audit_sink(Arc::new(JsonLinesAuditSink::new(&path)));
    run_unit(&manager, &config).await;

    let edited = fs::read_to_string(&path).unwrap().replace("station-2", "station-9");
    fs::write(&path, edited).unwrap();

    let report = verify_audit_log(&path).unwrap();
    assert_eq!(report.valid, 0);
    assert_eq!(report.invalid_lines, vec![1, 2]);
}

#[tokio::test]
async fn test_csv_log_uses_field_labels() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("audit.csv");
    let config = config();
    let manager = SessionManager::new(config.field_resolver())
        .with_audit_sink(Arc::new(CsvAuditSink::new(&path)));

    run_unit(&manager, &config).await;

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let header: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
    assert_eq!(header.first().map(String::as_str), Some("timestamp"));
    assert_eq!(&header[header.len() - 2..], ["Part No", "Lot"]);

    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(&rows[0][1], "NOT_MATCHED");
    assert_eq!(&rows[0][3], "2");
    assert_eq!(&rows[0][6], "Lot");
    assert_eq!(&rows[0][7], "L8");
    assert_eq!(&rows[1][1], "ALL_FIELDS_MATCHED");
    assert_eq!(&rows[1][11], "L7");
}

#[tokio::test]
async fn test_csv_log_appends_under_existing_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("audit.csv");
    let config = config();

    for _ in 0..2 {
        let manager = SessionManager::new(config.field_resolver())
            .with_audit_sink(Arc::new(CsvAuditSink::new(&path)));
        run_unit(&manager, &config).await;
    }

    let lines = lines(&path);
    assert_eq!(lines.len(), 5);
    assert_eq!(lines.iter().filter(|l| l.starts_with("timestamp")).count(), 1);
}
