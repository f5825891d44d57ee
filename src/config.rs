//! Application configuration management.
//!
//! Settings are layered with figment, later layers winning:
//!
//! 1. Built-in defaults
//! 2. A TOML file (`--config`, or `config.toml` in the platform config dir)
//! 3. `SCANVERIFY_` environment variables, `__` separating nested keys
//!
//! CLI flags are applied on top by the caller.
//!
//! # Example file
//!
//! ```toml
//! scan_operation = "startsWith"
//! primary_fields = ["part", "lot"]
//! scanned_by = "station-2"
//! audit_log = "/var/log/scanverify/audit.jsonl"
//!
//! [[fields]]
//! id = "part"
//! label = "Part No"
//! ```

use async_trait::async_trait;
use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::AuditFormat;
use crate::verify::fields::{
    ConfigSource, ConfigSourceError, FieldResolver, JsonSettingsFile, PrimaryFields,
    RequiredFieldSettings,
};
use crate::verify::{ComparisonOperator, FieldId, FieldSpec, SessionConfig};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SCANVERIFY_";

/// Errors loading or saving configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// A layer could not be parsed or has the wrong shape.
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    /// The platform config directory could not be determined.
    #[error("Failed to determine project directories")]
    NoProjectDirs,

    /// Serializing to TOML failed.
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Writing the file failed.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path being written
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Comparison operator for every field.
    pub scan_operation: ComparisonOperator,
    /// Required fields, as a list or a legacy comma-separated string.
    pub primary_fields: Option<PrimaryFields>,
    /// Legacy single required field.
    pub primary_field: Option<String>,
    /// Field identifying the record; defaults to the first required field.
    pub primary_key: Option<String>,
    /// Field metadata (ids and labels).
    pub fields: Vec<FieldSpec>,
    /// `settings.json` consulted when nothing above is configured.
    pub settings_fallback: Option<PathBuf>,
    /// Operator or station identity written to audit records.
    pub scanned_by: Option<String>,
    /// Supervisor PIN that clears a failed field. No prompt when unset.
    pub supervisor_pin: Option<String>,
    /// Audit log path. No audit log when unset.
    pub audit_log: Option<PathBuf>,
    /// Audit log format.
    pub audit_format: AuditFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_operation: ComparisonOperator::Equals,
            primary_fields: None,
            primary_field: None,
            primary_key: None,
            fields: Vec::new(),
            settings_fallback: None,
            scanned_by: None,
            supervisor_pin: None,
            audit_log: None,
            audit_format: AuditFormat::Jsonl,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`.
    ///
    /// # Errors
    ///
    /// Fails if an explicit `path` does not exist or any layer is malformed.
    /// A missing default file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if !path.exists() => Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Self::load_from_path(path),
            None => match Self::config_path() {
                Ok(path) => Self::load_from_path(&path),
                Err(e) => {
                    log::debug!("{}, using defaults and environment only", e);
                    Self::figment().extract().map_err(|e| Box::new(e).into())
                }
            },
        }
    }

    /// Load configuration with the given TOML file as the file layer.
    ///
    /// # Errors
    ///
    /// Fails if the file or the environment overrides are malformed.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        log::debug!("Loading config from {}", path.display());
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Box::new(e).into())
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Save the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Fails if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_error)?;
        Ok(())
    }

    /// Default platform-specific configuration path.
    ///
    /// # Errors
    ///
    /// Fails when the platform has no home directory.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let project_dirs = ProjectDirs::from("com", "scanverify", "scanverify")
            .ok_or(ConfigError::NoProjectDirs)?;
        Ok(project_dirs.config_dir().join("config.toml"))
    }

    /// Per-bind session settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            operator: self.scan_operation,
            primary_key: self
                .primary_key
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(FieldId::from),
            scanned_by: self.scanned_by.clone(),
        }
    }

    /// Field resolver reading this configuration, with the settings fallback
    /// when one is configured.
    #[must_use]
    pub fn field_resolver(&self) -> FieldResolver {
        let resolver = FieldResolver::new(Arc::new(self.clone()));
        match &self.settings_fallback {
            Some(path) => resolver.with_fallback(Arc::new(JsonSettingsFile::new(path))),
            None => resolver,
        }
    }
}

#[async_trait]
impl ConfigSource for Config {
    async fn required_fields(&self) -> Result<RequiredFieldSettings, ConfigSourceError> {
        Ok(RequiredFieldSettings {
            primary_fields: self.primary_fields.clone(),
            primary_field: self.primary_field.clone(),
        })
    }

    async fn field_metadata(&self) -> Result<Vec<FieldSpec>, ConfigSourceError> {
        Ok(self.fields.clone())
    }
}
