//! scanverify - Multi-field sequential scan verification
//!
//! An operator binds a master record and scans one code per configured field,
//! in order. Mismatches are flagged immediately, can be cleared by a
//! supervisor PIN, and every attempt ends up in an audit log.
//!
//! The engine lives in [`verify`]; [`audit`] holds the record types and sinks;
//! the remaining modules make up the command-line application.

pub mod audit;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod master;
pub mod signal;
pub mod verify;

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use yansi::Paint;

use crate::audit::{verify_audit_log, CsvAuditSink, JsonLinesAuditSink};
use crate::cli::{AuditFormat, AuditVerifyArgs, Cli, Commands, CompareArgs, VerifyArgs};
use crate::config::Config;
use crate::console::{
    shared_lines, Console, ConsoleOptions, JsonSnapshotSink, LinePinGate, ScanInput,
};
use crate::error::ExitCode;
use crate::master::MasterTable;
use crate::signal::ShutdownHandler;
use crate::verify::compare::{diagnose, try_compare};
use crate::verify::fields::PrimaryFields;
use crate::verify::{
    compare, AuditSink, ComparisonOperator, NoAudit, SessionManager, TargetRecord, VerifyError,
};

/// Run the application for parsed arguments.
///
/// # Errors
///
/// Returns configuration, I/O and input errors; the caller maps them to exit
/// codes with [`ExitCode::for_error`].
pub fn run_app(cli: Cli) -> Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet);
    if cli.no_color {
        yansi::disable();
    }

    match cli.command {
        Commands::Compare(args) => Ok(run_compare(&args)),
        Commands::AuditVerify(args) => run_audit_verify(&args),
        Commands::Verify(args) => {
            let config = Config::load(cli.config.as_deref())
                .context("Failed to load configuration")?;
            let shutdown = signal::install_handler()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(run_verify(config, args, shutdown))
        }
    }
}

fn run_compare(args: &CompareArgs) -> ExitCode {
    let operator = ComparisonOperator::from(args.operator);
    let matched = compare(&args.scanned, &args.expected, operator);
    if let Err(e) = try_compare(&args.scanned, &args.expected, operator) {
        println!("{} {}", "note:".yellow(), e);
    }

    if matched {
        println!("{} ({})", "MATCH".green().bold(), operator);
        return ExitCode::Success;
    }

    let diagnosis = diagnose(&args.scanned, &args.expected);
    println!("{} ({}): {}", "NO MATCH".red().bold(), operator, diagnosis.reason);
    println!(
        "  scanned  {:?} -> {:?} {:?}",
        diagnosis.scanned_raw, diagnosis.scanned_normalized, diagnosis.scanned_char_codes
    );
    println!(
        "  expected {:?} -> {:?} {:?}",
        diagnosis.expected_raw, diagnosis.expected_normalized, diagnosis.expected_char_codes
    );
    ExitCode::Incomplete
}

fn run_audit_verify(args: &AuditVerifyArgs) -> Result<ExitCode> {
    let report = verify_audit_log(&args.path)
        .with_context(|| format!("Failed to read {}", args.path.display()))?;
    if report.is_clean() {
        println!("{} {} records verified", "OK".green().bold(), report.valid);
        Ok(ExitCode::Success)
    } else {
        println!(
            "{} {} valid, bad lines: {:?}",
            "TAMPERED".red().bold(),
            report.valid,
            report.invalid_lines
        );
        Ok(ExitCode::Incomplete)
    }
}

/// Fold `verify` flags into the loaded configuration.
fn apply_overrides(config: &mut Config, args: &VerifyArgs) {
    if let Some(fields) = &args.fields {
        config.primary_fields = Some(PrimaryFields::Delimited(fields.clone()));
    }
    if let Some(operator) = args.operator {
        config.scan_operation = operator.into();
    }
    if let Some(primary_key) = &args.primary_key {
        config.primary_key = Some(primary_key.clone());
    }
    if let Some(scanned_by) = &args.scanned_by {
        config.scanned_by = Some(scanned_by.clone());
    }
    if let Some(audit_log) = &args.audit_log {
        config.audit_log = Some(audit_log.clone());
    }
    if let Some(format) = args.audit_format {
        config.audit_format = format;
    }
}

fn audit_sink(config: &Config) -> Arc<dyn AuditSink> {
    match (&config.audit_log, config.audit_format) {
        (Some(path), AuditFormat::Jsonl) => Arc::new(JsonLinesAuditSink::new(path)),
        (Some(path), AuditFormat::Csv) => Arc::new(CsvAuditSink::new(path)),
        (None, _) => Arc::new(NoAudit),
    }
}

/// Read a record from a JSON object of field id to value.
///
/// Non-string values are stored in their JSON text form; `null` is blank.
fn read_record_file(path: &Path) -> Result<TargetRecord> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let object: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON object", path.display()))?;
    Ok(TargetRecord::new(object.into_iter().map(|(k, v)| {
        let value = match v {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        (k, value)
    })))
}

async fn run_verify(
    mut config: Config,
    args: VerifyArgs,
    shutdown: ShutdownHandler,
) -> Result<ExitCode> {
    apply_overrides(&mut config, &args);
    let session_config = config.session_config();

    let lines = args
        .scans
        .is_empty()
        .then(|| shared_lines(BufReader::new(tokio::io::stdin())));

    let mut master = None;
    if let Some(path) = &args.master {
        let primary_key = match session_config.primary_key.clone() {
            Some(pk) => pk,
            None => config
                .field_resolver()
                .resolve()
                .await
                .required_fields
                .first()
                .cloned()
                .context("Master tables need a primary key or at least one required field")?,
        };
        let table = Arc::new(MasterTable::from_path(path, primary_key)?);
        if let Some(key) = &args.select {
            if table.select(key).is_none() {
                bail!("No row with key '{}' in {}", key, path.display());
            }
        }
        master = Some(table);
    }

    // Master columns are the fields an operator can scan against.
    let resolver = match &master {
        Some(table) => config.field_resolver().with_surface(table.clone()),
        None => config.field_resolver(),
    };
    let mut manager = SessionManager::new(resolver)
        .with_audit_sink(audit_sink(&config))
        .with_config(session_config.clone());
    if let Some(table) = &master {
        manager = manager.with_record_source(table.clone());
    }
    if args.json {
        manager = manager.with_broadcast_sink(Arc::new(JsonSnapshotSink));
    }
    match (config.supervisor_pin.as_deref().map(str::trim), &lines) {
        (Some(pin), Some(lines)) if !pin.is_empty() => {
            manager = manager.with_pin_gate(Arc::new(LinePinGate::new(pin, Arc::clone(lines))));
        }
        (Some(pin), None) if !pin.is_empty() => {
            log::warn!("Supervisor PIN needs interactive input; failed fields stay failed");
        }
        _ => {}
    }

    let record = if let Some(path) = &args.record {
        Some(read_record_file(path)?)
    } else if !args.set.is_empty() {
        Some(TargetRecord::new(args.set.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
    } else {
        None
    };
    let initial = match (&record, &master) {
        (Some(record), _) => Some(Arc::new(record.clone())),
        (None, Some(table)) => verify::TargetRecordSource::selected_record(table.as_ref()),
        (None, None) => bail!("No record to verify: use --record, --set or --master"),
    };

    if let Some(target) = initial {
        let snapshot = manager.bind(target, session_config).await;
        if !snapshot.missing_fields.is_empty() {
            return Err(VerifyError::Configuration {
                missing: snapshot.missing_fields,
            }
            .into());
        }
        if snapshot.required_fields.is_empty() {
            bail!("No required fields configured (set primary_fields or use --fields)");
        }
        if !args.json {
            println!("{}", console::render_snapshot(&snapshot));
        }
    }

    let input = match lines {
        Some(lines) => ScanInput::Lines(lines),
        None => ScanInput::List(args.scans.clone()),
    };
    let mut console = Console::new(&manager, ConsoleOptions { json: args.json });
    if let Some(table) = master {
        console = console.with_master(table);
    }
    let result = console.run(input, &shutdown).await;
    manager.flush().await;
    let summary = result?;

    log::info!("{} units verified", summary.completed_units);
    Ok(if summary.interrupted {
        ExitCode::Interrupted
    } else if summary.complete {
        ExitCode::Success
    } else {
        ExitCode::Incomplete
    })
}
