//! Loading product records from a CSV catalog.
//!
//! The first row is the header. One column (default `product_id`) identifies the
//! product; every other column is a free-form attribute. Bad rows are skipped and
//! reported, the rest of the file still loads.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Column that identifies a product unless configured otherwise.
pub const DEFAULT_ID_COLUMN: &str = "product_id";

/// One catalog row: ordered `(column, value)` pairs plus the product identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRecord {
    pub product_id: String,
    /// All columns in file order, including the identifier column.
    pub fields: Vec<(String, String)>,
}

impl ProductRecord {
    /// Builds a record from ordered fields, pulling the identifier out of `id_column`.
    pub fn from_fields(
        fields: Vec<(String, String)>,
        id_column: &str,
        line: u64,
    ) -> Result<Self, RecordError> {
        let product_id = fields
            .iter()
            .find(|(k, _)| k == id_column)
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RecordError::MissingId {
                line,
                column: id_column.to_string(),
            })?;
        Ok(Self { product_id, fields })
    }

    /// Serializes the record into the text blob that gets chunked and embedded:
    /// one `column: value` line per field, in column order.
    pub fn to_document_text(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v).trim_end().to_string())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// Result of loading a catalog: the good records plus what was skipped.
#[derive(Debug, Default)]
pub struct CatalogLoad {
    pub records: Vec<ProductRecord>,
    pub skipped: Vec<RecordError>,
    /// Number of records whose identifier was already seen earlier in the file.
    /// They are kept and produce redundant index entries.
    pub duplicate_ids: usize,
}

/// Loads the catalog at `path`. See [load_catalog_from_reader].
pub fn load_catalog(path: &Path, id_column: &str) -> Result<CatalogLoad, CatalogError> {
    let file = std::fs::File::open(path).map_err(|e| CatalogError::Open(path.to_path_buf(), e))?;
    let load = load_catalog_from_reader(file, id_column)?;
    info!(
        path = %path.display(),
        records = load.records.len(),
        skipped = load.skipped.len(),
        duplicates = load.duplicate_ids,
        "loaded catalog"
    );
    Ok(load)
}

/// Reads CSV rows from `reader`. Rows with the wrong field count, invalid UTF-8 or
/// no identifier are skipped and logged; I/O failures abort.
pub fn load_catalog_from_reader<R: io::Read>(
    reader: R,
    id_column: &str,
) -> Result<CatalogLoad, CatalogError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(CatalogError::Header)?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
            h.trim().to_string()
        })
        .collect();
    if !headers.iter().any(|h| h == id_column) {
        return Err(CatalogError::MissingIdColumn(id_column.to_string()));
    }

    let mut load = CatalogLoad::default();
    let mut seen = HashSet::new();
    for (row, result) in rdr.records().enumerate() {
        // header is line 1
        let fallback_line = row as u64 + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) if e.is_io_error() => return Err(CatalogError::Read(e)),
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(fallback_line);
                let err = RecordError::Malformed {
                    line,
                    reason: e.to_string(),
                };
                warn!("skipping catalog row: {}", err);
                load.skipped.push(err);
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);
        let fields = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|v| v.trim().to_string()))
            .collect();
        match ProductRecord::from_fields(fields, id_column, line) {
            Ok(r) => {
                if !seen.insert(r.product_id.clone()) {
                    load.duplicate_ids += 1;
                }
                load.records.push(r);
            }
            Err(err) => {
                warn!("skipping catalog row: {}", err);
                load.skipped.push(err);
            }
        }
    }
    Ok(load)
}

/// A single catalog row that could not be used. Ingestion continues past it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("line {line}: malformed row: {reason}")]
    Malformed { line: u64, reason: String },
    #[error("line {line}: missing value for identifier column `{column}`")]
    MissingId { line: u64, column: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to open catalog {0}: {1}")]
    Open(PathBuf, io::Error),
    #[error("failed to read catalog header: {0}")]
    Header(csv::Error),
    #[error("catalog header has no `{0}` column")]
    MissingIdColumn(String),
    #[error("failed to read catalog: {0}")]
    Read(csv::Error),
}
