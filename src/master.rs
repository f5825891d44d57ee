//! Master table loaded from CSV.
//!
//! Each data row becomes a [`TargetRecord`] keyed by header name. Row indices
//! are spreadsheet row numbers: the header is row 1, the first data row is 2.
//! The table tracks which row the operator has selected and serves it to the
//! session manager as a [`TargetRecordSource`]. Its columns are the
//! [`TargetSurface`]: a required field without a column cannot be scanned.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::verify::{FieldId, TargetRecord, TargetRecordSource, TargetSurface};

/// Errors loading a master table.
#[derive(thiserror::Error, Debug)]
pub enum MasterError {
    /// The file could not be opened.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path of the table
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The CSV is malformed.
    #[error("Malformed master table: {0}")]
    Csv(#[from] csv::Error),

    /// The key column is not in the header.
    #[error("Master table has no '{0}' column")]
    MissingKeyColumn(FieldId),
}

/// Rows of a master table plus the operator's current selection.
#[derive(Debug)]
pub struct MasterTable {
    headers: Vec<String>,
    rows: Vec<Arc<TargetRecord>>,
    primary_key: FieldId,
    selected: Mutex<Option<usize>>,
}

impl MasterTable {
    /// Load a CSV file whose rows are identified by the `primary_key` column.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, is not valid CSV, or lacks the key
    /// column.
    pub fn from_path(path: &Path, primary_key: FieldId) -> Result<Self, MasterError> {
        let file = std::fs::File::open(path).map_err(|source| MasterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_reader(file, primary_key)?;
        log::info!("Loaded {} rows from {}", table.len(), path.display());
        Ok(table)
    }

    /// Load CSV from any reader.
    ///
    /// # Errors
    ///
    /// Fails if the input is not valid CSV or lacks the key column.
    pub fn from_reader<R: Read>(reader: R, primary_key: FieldId) -> Result<Self, MasterError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(reader);
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if !headers.iter().any(|h| h == primary_key.as_str()) {
            return Err(MasterError::MissingKeyColumn(primary_key));
        }

        let mut rows = Vec::new();
        for (idx, row) in reader.records().enumerate() {
            let row = row?;
            let record = TargetRecord::new(
                headers
                    .iter()
                    .zip(row.iter())
                    .map(|(h, v)| (h.as_str(), v)),
            )
            .with_row_index(idx + 2);
            rows.push(Arc::new(record));
        }

        Ok(Self {
            headers,
            rows,
            primary_key,
            selected: Mutex::new(None),
        })
    }

    /// Column names in file order.
    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Key column.
    #[must_use]
    pub fn primary_key(&self) -> &FieldId {
        &self.primary_key
    }

    /// Number of data rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no data rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        let key = key.trim();
        let mut matches = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.key(self.primary_key.as_str()) == Some(key))
            .map(|(i, _)| i);
        let first = matches.next()?;
        if matches.next().is_some() {
            log::warn!("Key '{}' appears on several rows, using the first", key);
        }
        Some(first)
    }

    /// Row with the given key.
    #[must_use]
    pub fn find(&self, key: &str) -> Option<Arc<TargetRecord>> {
        self.position(key).map(|i| Arc::clone(&self.rows[i]))
    }

    /// Select the row with the given key. Returns it, or `None` (keeping the
    /// previous selection) when no row has that key.
    pub fn select(&self, key: &str) -> Option<Arc<TargetRecord>> {
        let idx = self.position(key)?;
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = Some(idx);
        log::debug!("Selected master row {}", idx + 2);
        Some(Arc::clone(&self.rows[idx]))
    }
}

impl TargetRecordSource for MasterTable {
    fn selected_record(&self) -> Option<Arc<TargetRecord>> {
        let selected = *self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        selected.and_then(|i| self.rows.get(i).cloned())
    }

    fn find_by_primary(&self, value: &str) -> Option<Arc<TargetRecord>> {
        self.find(value)
    }
}

impl TargetSurface for MasterTable {
    fn is_resolvable(&self, field: &FieldId) -> bool {
        self.headers.iter().any(|h| h == field.as_str())
    }
}
