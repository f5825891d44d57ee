//! Structured error handling and exit codes.

use serde::Serialize;

use crate::config::ConfigError;
use crate::verify::VerifyError;

/// Exit codes for scanverify.
///
/// - 0: Success (every bound record fully verified, or the check passed)
/// - 1: General error (unexpected failure)
/// - 2: Incomplete (input ended before verification finished, or the check failed)
/// - 3: Configuration error (bad config, or required fields cannot be targeted)
/// - 130: Interrupted by user (Ctrl+C)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    /// Success: verification completed.
    Success = 0,
    /// General error: An unexpected error occurred.
    GeneralError = 1,
    /// Incomplete: not every required field passed.
    Incomplete = 2,
    /// Configuration error: scanning was blocked by configuration.
    ConfigurationError = 3,
    /// Interrupted: the run was interrupted by user (Ctrl+C).
    Interrupted = 130,
}

impl ExitCode {
    /// Get the numeric exit code.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Get the machine-readable code prefix.
    #[must_use]
    pub fn code_prefix(self) -> &'static str {
        match self {
            Self::Success => "SV000",
            Self::GeneralError => "SV001",
            Self::Incomplete => "SV002",
            Self::ConfigurationError => "SV003",
            Self::Interrupted => "SV130",
        }
    }

    /// Exit code for an application error.
    #[must_use]
    pub fn for_error(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<VerifyError>().is_some()
            || err.downcast_ref::<ConfigError>().is_some()
        {
            Self::ConfigurationError
        } else {
            Self::GeneralError
        }
    }
}

/// Structured error information for JSON output.
#[derive(Debug, Serialize)]
pub struct StructuredError {
    /// The error code (e.g., "SV001")
    pub code: String,
    /// The exit code number
    pub exit_code: i32,
    /// Human-readable error message
    pub message: String,
    /// Whether the run was interrupted
    pub interrupted: bool,
}

impl StructuredError {
    /// Create a new structured error from an anyhow error and an exit code.
    #[must_use]
    pub fn new(err: &anyhow::Error, exit_code: ExitCode) -> Self {
        Self {
            code: exit_code.code_prefix().to_string(),
            exit_code: exit_code.as_i32(),
            message: format!("{:#}", err),
            interrupted: exit_code == ExitCode::Interrupted,
        }
    }
}
