//! Required-field resolution.
//!
//! Determines which fields must be verified, in which order, and whether each
//! of them can actually be targeted.
//!
//! # Priority
//!
//! The candidate list comes from the first source that yields at least one id:
//!
//! 1. An explicit ordered list (`primary_fields = ["a", "b"]`)
//! 2. A legacy delimited string (`primary_fields = "a, b"`)
//! 3. A single legacy field (`primary_field = "a"`)
//! 4. The [`FallbackStore`] (a stored `settings.json`), using the same order
//!
//! Ids are trimmed, blanks are dropped and duplicates keep their first
//! position. When field metadata is available, ids it does not know are
//! dropped with a warning. When no metadata exists at all, the candidate list
//! is trusted verbatim.
//!
//! Finally every id is checked against the [`TargetSurface`]. Unresolvable ids
//! are reported as missing, which blocks scanning until configuration is fixed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::record::{FieldId, FieldSpec};

/// Similarity above which an unknown id gets a "did you mean" hint.
const SUGGESTION_THRESHOLD: f64 = 0.8;

/// The required-field setting in either of its accepted shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryFields {
    /// Ordered list of ids.
    List(Vec<String>),
    /// Legacy comma-separated string.
    Delimited(String),
}

impl From<Vec<String>> for PrimaryFields {
    fn from(ids: Vec<String>) -> Self {
        PrimaryFields::List(ids)
    }
}

impl PrimaryFields {
    fn ids(&self) -> Vec<FieldId> {
        match self {
            PrimaryFields::List(ids) => clean_ids(ids.iter().map(String::as_str)),
            PrimaryFields::Delimited(s) => clean_ids(s.split(',')),
        }
    }
}

/// Required-field settings as read from a [`ConfigSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredFieldSettings {
    /// Explicit list or legacy delimited string.
    #[serde(default, alias = "primaryFields")]
    pub primary_fields: Option<PrimaryFields>,
    /// Legacy single field.
    #[serde(default, alias = "primaryField")]
    pub primary_field: Option<String>,
}

/// Contents of a last-resort settings store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSettings {
    /// Required-field settings.
    #[serde(flatten)]
    pub required: RequiredFieldSettings,
    /// Field metadata.
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// Where the required-field list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldListSource {
    /// Explicit ordered list.
    ExplicitList,
    /// Legacy delimited string.
    Delimited,
    /// Legacy single field.
    LegacySingle,
    /// Fallback store.
    Fallback,
    /// Nothing was configured anywhere.
    Unconfigured,
}

/// Errors reading configuration collaborators.
#[derive(thiserror::Error, Debug)]
pub enum ConfigSourceError {
    /// The source cannot currently answer.
    #[error("Configuration source unavailable: {0}")]
    Unavailable(String),

    /// A settings file could not be read.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path of the settings file
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A settings file is not valid JSON.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// Path of the settings file
        path: PathBuf,
        /// The underlying parse error
        #[source]
        source: serde_json::Error,
    },
}

/// Errors rebuilding the target surface.
#[derive(thiserror::Error, Debug)]
#[error("Target surface rebuild failed: {0}")]
pub struct SurfaceError(pub String);

/// Supplies required-field settings and field metadata.
///
/// Both reads may be unavailable or stale; the resolver tolerates either.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Required-field settings.
    async fn required_fields(&self) -> Result<RequiredFieldSettings, ConfigSourceError>;

    /// Known field metadata (ids and labels).
    async fn field_metadata(&self) -> Result<Vec<FieldSpec>, ConfigSourceError>;
}

/// Last-resort store consulted when the [`ConfigSource`] has no field list.
#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// Load stored settings.
    async fn load(&self) -> Result<StoredSettings, ConfigSourceError>;
}

/// The place a scan is directed at for each field (an input box, a panel row).
pub trait TargetSurface: Send + Sync {
    /// Whether a field can be targeted.
    fn is_resolvable(&self, field: &FieldId) -> bool;

    /// Rebuild the surface from current configuration. Called at most once per
    /// resolution, before ids are declared missing.
    fn rebuild(&self) -> Result<(), SurfaceError> {
        Ok(())
    }
}

/// A fixed set of resolvable fields.
#[derive(Debug, Clone, Default)]
pub struct StaticSurface {
    fields: HashSet<FieldId>,
}

impl StaticSurface {
    /// Surface that resolves exactly the given ids.
    pub fn new<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldId>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl TargetSurface for StaticSurface {
    fn is_resolvable(&self, field: &FieldId) -> bool {
        self.fields.contains(field)
    }
}

/// A `settings.json` file used as the fallback store.
///
/// Accepts both `primaryFields`/`primaryField` and snake_case keys.
#[derive(Debug, Clone)]
pub struct JsonSettingsFile {
    path: PathBuf,
}

impl JsonSettingsFile {
    /// Fallback store backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the settings file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FallbackStore for JsonSettingsFile {
    async fn load(&self) -> Result<StoredSettings, ConfigSourceError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoredSettings::default());
            }
            Err(source) => {
                return Err(ConfigSourceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(StoredSettings::default());
        }
        serde_json::from_str(&content).map_err(|source| ConfigSourceError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// In-memory cache over a [`ConfigSource`].
///
/// Successful reads are kept until [`invalidate`](Self::invalidate); failed
/// reads are retried on the next call.
pub struct CachedConfigSource<S> {
    inner: S,
    required: Mutex<Option<RequiredFieldSettings>>,
    metadata: Mutex<Option<Vec<FieldSpec>>>,
}

impl<S: ConfigSource> CachedConfigSource<S> {
    /// Wrap a source.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            required: Mutex::new(None),
            metadata: Mutex::new(None),
        }
    }

    /// Drop cached values so the next read hits the inner source.
    pub async fn invalidate(&self) {
        *self.required.lock().await = None;
        *self.metadata.lock().await = None;
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ConfigSource> ConfigSource for CachedConfigSource<S> {
    async fn required_fields(&self) -> Result<RequiredFieldSettings, ConfigSourceError> {
        let mut cached = self.required.lock().await;
        if let Some(value) = cached.as_ref() {
            return Ok(value.clone());
        }
        let value = self.inner.required_fields().await?;
        *cached = Some(value.clone());
        Ok(value)
    }

    async fn field_metadata(&self) -> Result<Vec<FieldSpec>, ConfigSourceError> {
        let mut cached = self.metadata.lock().await;
        if let Some(value) = cached.as_ref() {
            return Ok(value.clone());
        }
        let value = self.inner.field_metadata().await?;
        *cached = Some(value.clone());
        Ok(value)
    }
}

/// Outcome of resolving the required-field sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Ordered required-field sequence.
    pub required_fields: Vec<FieldId>,
    /// Specs for the required fields, same order, labels filled in.
    pub fields: Vec<FieldSpec>,
    /// Required ids that have no resolvable target.
    pub missing_fields: Vec<FieldId>,
    /// Ids dropped because metadata did not know them.
    pub dropped_fields: Vec<FieldId>,
    /// Which setting supplied the list.
    pub source: FieldListSource,
}

impl Resolution {
    /// Whether any required field is unresolvable.
    #[must_use]
    pub fn has_missing_fields(&self) -> bool {
        !self.missing_fields.is_empty()
    }

    /// Label for a field, defaulting to its id.
    #[must_use]
    pub fn label_of(&self, field: &str) -> String {
        self.fields
            .iter()
            .find(|f| f.id.as_str() == field)
            .map(|f| f.display_label().to_string())
            .unwrap_or_else(|| field.to_string())
    }
}

/// Resolves the required-field sequence from configuration collaborators.
#[derive(Clone)]
pub struct FieldResolver {
    source: Arc<dyn ConfigSource>,
    fallback: Option<Arc<dyn FallbackStore>>,
    surface: Option<Arc<dyn TargetSurface>>,
}

impl FieldResolver {
    /// Resolver over a configuration source, with no fallback and no surface
    /// check.
    #[must_use]
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            fallback: None,
            surface: None,
        }
    }

    /// Add a last-resort fallback store.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Check ids against a target surface.
    #[must_use]
    pub fn with_surface(mut self, surface: Arc<dyn TargetSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Resolve the required-field sequence.
    pub async fn resolve(&self) -> Resolution {
        let settings = self.source.required_fields().await.unwrap_or_else(|e| {
            log::warn!("Required-field settings unavailable: {}", e);
            RequiredFieldSettings::default()
        });

        let mut stored: Option<StoredSettings> = None;

        let (mut candidates, source) = match candidates_from(&settings) {
            Some(found) => found,
            None => {
                let fallback = self.load_fallback().await;
                let found = candidates_from(&fallback.required)
                    .map(|(ids, _)| (ids, FieldListSource::Fallback));
                stored = Some(fallback);
                found.unwrap_or((Vec::new(), FieldListSource::Unconfigured))
            }
        };

        let mut metadata = self.source.field_metadata().await.unwrap_or_else(|e| {
            log::warn!("Field metadata unavailable: {}", e);
            Vec::new()
        });
        if metadata.is_empty() {
            let fallback = match stored.take() {
                Some(s) => s,
                None => self.load_fallback().await,
            };
            metadata = fallback.fields;
        }

        let mut dropped = Vec::new();
        if !metadata.is_empty() {
            let known: HashSet<&str> = metadata.iter().map(|f| f.id.as_str()).collect();
            candidates.retain(|id| {
                if known.contains(id.as_str()) {
                    return true;
                }
                match suggest(id.as_str(), &known) {
                    Some(hint) => log::warn!(
                        "Required field '{}' is not a configured field (did you mean '{}'?), ignoring",
                        id,
                        hint
                    ),
                    None => log::warn!(
                        "Required field '{}' is not a configured field, ignoring",
                        id
                    ),
                }
                dropped.push(id.clone());
                false
            });
        }

        let missing_fields = self.find_missing(&candidates);

        let labels: HashMap<&str, &FieldSpec> =
            metadata.iter().map(|f| (f.id.as_str(), f)).collect();
        let fields = candidates
            .iter()
            .map(|id| match labels.get(id.as_str()) {
                Some(spec) => FieldSpec::new(id.clone(), spec.display_label()),
                None => FieldSpec::new(id.clone(), id.as_str()),
            })
            .collect();

        log::debug!(
            "Resolved required fields {:?} from {:?} (missing: {:?})",
            candidates,
            source,
            missing_fields
        );

        Resolution {
            required_fields: candidates,
            fields,
            missing_fields,
            dropped_fields: dropped,
            source,
        }
    }

    async fn load_fallback(&self) -> StoredSettings {
        let Some(fallback) = &self.fallback else {
            return StoredSettings::default();
        };
        fallback.load().await.unwrap_or_else(|e| {
            log::warn!("Fallback settings store unreadable: {}", e);
            StoredSettings::default()
        })
    }

    fn find_missing(&self, candidates: &[FieldId]) -> Vec<FieldId> {
        let Some(surface) = &self.surface else {
            return Vec::new();
        };
        let unresolved = |ids: &[FieldId]| -> Vec<FieldId> {
            ids.iter()
                .filter(|id| !surface.is_resolvable(id))
                .cloned()
                .collect()
        };

        let missing = unresolved(candidates);
        if missing.is_empty() {
            return missing;
        }

        log::warn!(
            "Required fields {:?} have no target, rebuilding surface",
            missing
        );
        if let Err(e) = surface.rebuild() {
            log::warn!("{}", e);
        }

        let missing = unresolved(candidates);
        if !missing.is_empty() {
            log::error!(
                "Required fields {:?} still unresolvable after rebuild",
                missing
            );
        }
        missing
    }
}

fn candidates_from(settings: &RequiredFieldSettings) -> Option<(Vec<FieldId>, FieldListSource)> {
    if let Some(primary) = &settings.primary_fields {
        let ids = primary.ids();
        if !ids.is_empty() {
            let source = match primary {
                PrimaryFields::List(_) => FieldListSource::ExplicitList,
                PrimaryFields::Delimited(_) => FieldListSource::Delimited,
            };
            return Some((ids, source));
        }
    }
    settings
        .primary_field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|id| (vec![FieldId::from(id)], FieldListSource::LegacySingle))
}

fn clean_ids<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<FieldId> {
    let mut seen = HashSet::new();
    raw.map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(FieldId::from)
        .collect()
}

fn suggest<'a>(id: &str, known: &HashSet<&'a str>) -> Option<&'a str> {
    known
        .iter()
        .map(|k| (*k, strsim::jaro_winkler(id, k)))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(k, _)| k)
}
