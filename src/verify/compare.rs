//! Scanned-code comparison and mismatch diagnosis.
//!
//! Hardware scanners and camera decoders rarely hand back the exact bytes that
//! sit in the master sheet: full-width digits, stray whitespace, prefix or
//! suffix characters and case differences are all common. Comparison therefore
//! runs on a normalized form:
//!
//! - NFKC (compatibility composition), so `１２３` equals `123`
//! - trimmed of surrounding whitespace
//! - lowercased
//!
//! The [`ComparisonOperator::Regex`] operator is the exception: the expected
//! value is a case-insensitive pattern tested against the trimmed, raw scan.
//!
//! # Example
//!
//! ```
//! use scanverify::verify::compare::{compare, ComparisonOperator};
//!
//! assert!(compare(" Abc ", "abc", ComparisonOperator::Equals));
//! assert!(compare("X12345Y", "12345", ComparisonOperator::Contains));
//! assert!(compare("PN-778", "^pn-\\d+$", ComparisonOperator::Regex));
//! ```

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use unicode_normalization::UnicodeNormalization;

/// Upper bound on compiled pattern size for the regex operator.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// How a scanned code is compared against the expected value.
///
/// This is a session-wide setting; every field uses the same operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// Normalized values are equal.
    #[default]
    #[serde(rename = "equals")]
    Equals,
    /// Either normalized value contains the other.
    #[serde(rename = "contains")]
    Contains,
    /// Either normalized value is a prefix of the other.
    #[serde(rename = "startsWith", alias = "starts_with", alias = "starts-with")]
    StartsWith,
    /// Expected value is a case-insensitive regular expression.
    #[serde(rename = "regex")]
    Regex,
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOperator::Equals => write!(f, "equals"),
            ComparisonOperator::Contains => write!(f, "contains"),
            ComparisonOperator::StartsWith => write!(f, "startsWith"),
            ComparisonOperator::Regex => write!(f, "regex"),
        }
    }
}

impl FromStr for ComparisonOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equals" | "eq" => Ok(Self::Equals),
            "contains" => Ok(Self::Contains),
            "startswith" | "starts_with" | "starts-with" => Ok(Self::StartsWith),
            "regex" | "re" => Ok(Self::Regex),
            other => Err(format!(
                "Unknown comparison operator: '{other}' (expected equals, contains, startsWith or regex)"
            )),
        }
    }
}

/// Internal comparison failures. Never escapes [`compare`].
#[derive(thiserror::Error, Debug)]
pub enum ComparisonError {
    /// The expected value is not a valid regular expression.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// The pattern compiled past the size limit.
    #[error("Pattern too large to compile (limit {limit} bytes)")]
    PatternTooLarge {
        /// Configured size limit
        limit: usize,
    },
}

/// Normalize a value for comparison: NFKC, trim, lowercase.
#[must_use]
pub fn normalize(s: &str) -> String {
    let composed: String = s.nfkc().collect();
    composed.trim().to_lowercase()
}

/// Normalize without case folding (NFKC + trim). Used for diagnostics.
#[must_use]
pub fn normalize_preserving_case(s: &str) -> String {
    let composed: String = s.nfkc().collect();
    composed.trim().to_string()
}

/// Compare a scanned code against the expected value.
///
/// Never fails: an invalid regex degrades to normalized equality and any other
/// internal failure degrades to strict raw-string equality.
#[must_use]
pub fn compare(scanned: &str, expected: &str, operator: ComparisonOperator) -> bool {
    match try_compare(scanned, expected, operator) {
        Ok(matched) => matched,
        Err(ComparisonError::InvalidPattern(reason)) => {
            log::debug!(
                "Invalid pattern {:?} ({}), falling back to normalized equals",
                expected,
                reason
            );
            normalize(scanned) == normalize(expected)
        }
        Err(e) => {
            log::warn!("Comparison failed ({}), falling back to strict equality", e);
            scanned == expected
        }
    }
}

/// Compare, surfacing internal failures as typed errors.
///
/// # Errors
///
/// Returns [`ComparisonError`] when the regex operator cannot build a pattern
/// from `expected`.
pub fn try_compare(
    scanned: &str,
    expected: &str,
    operator: ComparisonOperator,
) -> Result<bool, ComparisonError> {
    if operator == ComparisonOperator::Regex {
        let pattern = RegexBuilder::new(expected)
            .case_insensitive(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| match e {
                regex::Error::CompiledTooBig(limit) => ComparisonError::PatternTooLarge { limit },
                other => ComparisonError::InvalidPattern(other.to_string()),
            })?;
        return Ok(pattern.is_match(scanned.trim()));
    }

    let a = normalize(scanned);
    let b = normalize(expected);

    Ok(match operator {
        ComparisonOperator::Equals => a == b,
        ComparisonOperator::Contains => a.contains(&b) || b.contains(&a),
        ComparisonOperator::StartsWith => a.starts_with(&b) || b.starts_with(&a),
        ComparisonOperator::Regex => unreachable!("regex handled above"),
    })
}

/// Why a scan did not match its expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MismatchReason {
    /// The expected value is empty: master data has no value for the field.
    EmptyExpected,
    /// Values are equal after NFKC and trim; the raw strings differ only in
    /// invisible or compatibility characters.
    InvisibleDifference,
    /// Values differ only by letter case.
    CaseMismatch,
    /// Values are genuinely different.
    ValueMismatch,
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchReason::EmptyExpected => write!(f, "expected value is empty"),
            MismatchReason::InvisibleDifference => {
                write!(f, "normalized values are equal but raw values differ")
            }
            MismatchReason::CaseMismatch => write!(f, "values differ only by case"),
            MismatchReason::ValueMismatch => write!(f, "values differ"),
        }
    }
}

/// Character-level breakdown of a scan mismatch.
///
/// Char codes are Unicode scalar values of the NFKC+trim form; they surface
/// zero-width spaces, BOMs and look-alike characters that render identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchDiagnosis {
    /// Scanned value as received
    pub scanned_raw: String,
    /// Scanned value after NFKC + trim
    pub scanned_normalized: String,
    /// Unicode scalar values of the normalized scan
    pub scanned_char_codes: Vec<u32>,
    /// Expected value as stored
    pub expected_raw: String,
    /// Expected value after NFKC + trim
    pub expected_normalized: String,
    /// Unicode scalar values of the normalized expected value
    pub expected_char_codes: Vec<u32>,
    /// Classified reason
    pub reason: MismatchReason,
}

/// Build a diagnosis for a scanned/expected pair.
#[must_use]
pub fn diagnose(scanned: &str, expected: &str) -> MismatchDiagnosis {
    let scanned_normalized = normalize_preserving_case(scanned);
    let expected_normalized = normalize_preserving_case(expected);

    let reason = if expected.is_empty() {
        MismatchReason::EmptyExpected
    } else if scanned_normalized == expected_normalized {
        MismatchReason::InvisibleDifference
    } else if scanned_normalized.to_lowercase() == expected_normalized.to_lowercase() {
        MismatchReason::CaseMismatch
    } else {
        MismatchReason::ValueMismatch
    };

    MismatchDiagnosis {
        scanned_char_codes: char_codes(&scanned_normalized),
        expected_char_codes: char_codes(&expected_normalized),
        scanned_raw: scanned.to_string(),
        scanned_normalized,
        expected_raw: expected.to_string(),
        expected_normalized,
        reason,
    }
}

fn char_codes(s: &str) -> Vec<u32> {
    s.chars().map(u32::from).collect()
}
