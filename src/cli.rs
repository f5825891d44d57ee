//! Command-line interface definitions for scanverify.
//!
//! Global options (verbosity, color, config file, structured errors) apply to
//! every subcommand.
//!
//! # Example
//!
//! ```bash
//! # Verify a record given inline, scans from the command line
//! scanverify verify --set part=P-100 --set lot=L7 --scan P-100 --scan L7
//!
//! # Verify rows of a master table interactively (scans on stdin)
//! scanverify verify --master parts.csv --select P-100
//!
//! # Explain why two codes do not match
//! scanverify compare "L7\u{200b}" L7
//!
//! # Check the integrity of an audit log
//! scanverify audit-verify audit.jsonl
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::verify::ComparisonOperator;

/// Multi-field sequential scan verification.
///
/// Binds a master record and checks scanned codes against its configured
/// fields in order, with supervisor recovery on mismatch and an audit trail.
#[derive(Debug, Parser)]
#[command(name = "scanverify")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Report fatal errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Configuration file (TOML); defaults to the platform config directory
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Bind a record and verify scanned codes against it
    Verify(VerifyArgs),
    /// Compare one scanned code with an expected value
    Compare(CompareArgs),
    /// Check the checksums of a JSON-lines audit log
    AuditVerify(AuditVerifyArgs),
}

/// Arguments for the verify subcommand.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// JSON file holding the record as an object of field id to value
    #[arg(long, value_name = "PATH", conflicts_with_all = ["set", "master"])]
    pub record: Option<PathBuf>,

    /// Record field given inline (can be repeated)
    #[arg(long, value_name = "ID=VALUE", value_parser = parse_assignment)]
    pub set: Vec<(String, String)>,

    /// Master table (CSV with a header row) to select records from
    #[arg(long, value_name = "PATH", conflicts_with = "set")]
    pub master: Option<PathBuf>,

    /// Primary-key value of the master row to select first
    #[arg(long, value_name = "KEY", requires = "master")]
    pub select: Option<String>,

    /// Scanned code (can be repeated); reads stdin when omitted
    #[arg(long = "scan", value_name = "CODE")]
    pub scans: Vec<String>,

    /// Required fields, comma separated (overrides configuration)
    #[arg(long, value_name = "IDS")]
    pub fields: Option<String>,

    /// Comparison operator (overrides configuration)
    #[arg(long, value_enum)]
    pub operator: Option<OperatorArg>,

    /// Field identifying the record (defaults to the first required field)
    #[arg(long, value_name = "ID")]
    pub primary_key: Option<String>,

    /// Operator or station identity written to audit records
    #[arg(long, value_name = "NAME")]
    pub scanned_by: Option<String>,

    /// Audit log path (overrides configuration)
    #[arg(long, value_name = "PATH")]
    pub audit_log: Option<PathBuf>,

    /// Audit log format (overrides configuration)
    #[arg(long, value_enum)]
    pub audit_format: Option<AuditFormat>,

    /// Print session snapshots as JSON lines instead of colored status
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the compare subcommand.
#[derive(Debug, Args)]
pub struct CompareArgs {
    /// Code as scanned
    #[arg(value_name = "SCANNED")]
    pub scanned: String,

    /// Expected value
    #[arg(value_name = "EXPECTED")]
    pub expected: String,

    /// Comparison operator
    #[arg(long, value_enum, default_value = "equals")]
    pub operator: OperatorArg,
}

/// Arguments for the audit-verify subcommand.
#[derive(Debug, Args)]
pub struct AuditVerifyArgs {
    /// JSON-lines audit log to check
    #[arg(value_name = "PATH")]
    pub path: PathBuf,
}

/// Comparison operator as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperatorArg {
    /// Normalized equality
    Equals,
    /// Either value contains the other
    Contains,
    /// Either value starts with the other
    StartsWith,
    /// Expected value is a case-insensitive pattern
    Regex,
}

impl From<OperatorArg> for ComparisonOperator {
    fn from(arg: OperatorArg) -> Self {
        match arg {
            OperatorArg::Equals => ComparisonOperator::Equals,
            OperatorArg::Contains => ComparisonOperator::Contains,
            OperatorArg::StartsWith => ComparisonOperator::StartsWith,
            OperatorArg::Regex => ComparisonOperator::Regex,
        }
    }
}

/// On-disk format of the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditFormat {
    /// Checksummed JSON lines
    #[default]
    Jsonl,
    /// Flat CSV rows, one column per field label
    Csv,
}

impl std::fmt::Display for AuditFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditFormat::Jsonl => write!(f, "jsonl"),
            AuditFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Parse an `id=value` pair.
///
/// The id is trimmed; the value is kept verbatim and may contain `=`.
///
/// # Examples
///
/// ```
/// use scanverify::cli::parse_assignment;
///
/// assert_eq!(
///     parse_assignment("part=P-100").unwrap(),
///     ("part".to_string(), "P-100".to_string())
/// );
/// assert_eq!(parse_assignment("q= a=b").unwrap().1, " a=b");
/// ```
///
/// # Errors
///
/// Returns an error if there is no `=` or the id is empty.
pub fn parse_assignment(s: &str) -> Result<(String, String), String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected ID=VALUE, got '{s}'"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err("Field id cannot be empty".to_string());
    }
    Ok((id.to_string(), value.to_string()))
}
