use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ERR_SHEET_INVALID;
use crate::{AppError, AppResult};

pub const DEFAULT_HEADER: &str = "Foglio Senza Nome";
pub const NEW_SHEET_HEADER: &str = "Nuovo Foglio";
pub const MAX_HEADER_CHARS: usize = 100;

/// Columns every sheet created through [`AssetSheet::create_new`] starts with.
/// The UI refuses to remove them; the store does not care.
pub const STANDARD_COLUMNS: [&str; 7] = [
    "Tipo asset",
    "Marca",
    "Modello",
    "Seriale",
    "Rif inventario",
    "Descrizione",
    "Causa dismissione",
];
pub const STANDARD_COLUMN_COUNT: usize = STANDARD_COLUMNS.len();

pub const COLUMN_TIPO_ASSET: &str = "Tipo asset";
pub const COLUMN_CAUSA_DISMISSIONE: &str = "Causa dismissione";

/// Case-insensitive column name equality.
pub fn column_eq(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// One record: column name to string value. Missing keys read as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Asset {
    values: BTreeMap<String, String>,
}

impl Asset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, column: &str) -> &str {
        self.values.get(column).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn remove(&mut self, column: &str) -> Option<String> {
        self.values.remove(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

/// An asset sheet: header, ordered columns and ordered records.
///
/// `file_name` and `is_archived` are derived from where the sheet lives on
/// disk and are only reassigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSheet {
    header: String,
    pub columns: Vec<String>,
    pub rows: Vec<Asset>,
    pub(crate) file_name: String,
    pub(crate) is_archived: bool,
    /// Set once the backing file has been deleted; the store refuses to
    /// save the sheet again.
    pub(crate) is_deleted: bool,
}

impl Default for AssetSheet {
    fn default() -> Self {
        Self {
            header: NEW_SHEET_HEADER.to_string(),
            columns: Vec::new(),
            rows: Vec::new(),
            file_name: String::new(),
            is_archived: false,
            is_deleted: false,
        }
    }
}

impl AssetSheet {
    /// A fresh, not yet persisted sheet with the standard columns.
    pub fn create_new(header: &str) -> Self {
        let mut sheet = AssetSheet::default();
        sheet.set_header(header);
        sheet.columns = STANDARD_COLUMNS.iter().map(|c| c.to_string()).collect();
        sheet
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    /// Blank headers fall back to [`DEFAULT_HEADER`]; headers longer than
    /// [`MAX_HEADER_CHARS`] are truncated. Neither is an error.
    pub fn set_header(&mut self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            warn!(
                target: "cespiti",
                event = "sheet_header_defaulted",
                fallback = DEFAULT_HEADER
            );
            self.header = DEFAULT_HEADER.to_string();
            return;
        }

        if value.chars().count() > MAX_HEADER_CHARS {
            let truncated: String = value.chars().take(MAX_HEADER_CHARS).collect();
            warn!(
                target: "cespiti",
                event = "sheet_header_truncated",
                original = value,
                max_chars = MAX_HEADER_CHARS
            );
            // Starts with a non-blank char, so never empty after trimming.
            self.header = truncated.trim_end().to_string();
            return;
        }

        self.header = value.to_string();
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn is_archived(&self) -> bool {
        self.is_archived
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn has_file_name(&self) -> bool {
        !self.file_name.trim().is_empty()
    }

    /// Declared column matching `name` case-insensitively.
    pub fn find_column(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| column_eq(c, name))
            .map(String::as_str)
    }

    pub fn add_column(&mut self, name: &str) -> AppResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::new(
                ERR_SHEET_INVALID,
                "Column name cannot be empty.",
            ));
        }
        if self.find_column(name).is_some() {
            return Err(
                AppError::new(ERR_SHEET_INVALID, format!("Column '{name}' already exists."))
                    .with_context("column", name),
            );
        }
        self.columns.push(name.to_string());
        Ok(())
    }

    /// Remove a column and the values every record holds for it.
    pub fn remove_column(&mut self, name: &str) -> AppResult<()> {
        let index = self
            .columns
            .iter()
            .position(|c| column_eq(c, name))
            .ok_or_else(|| {
                AppError::new(ERR_SHEET_INVALID, format!("Column '{name}' does not exist."))
                    .with_context("column", name)
            })?;
        let removed = self.columns.remove(index);
        for row in &mut self.rows {
            row.remove(&removed);
        }
        Ok(())
    }

    /// Append an empty record and return its index.
    pub fn add_row(&mut self) -> usize {
        self.rows.push(Asset::new());
        self.rows.len() - 1
    }

    pub fn remove_row(&mut self, index: usize) -> AppResult<Asset> {
        if index >= self.rows.len() {
            return Err(row_out_of_range(index, self.rows.len()));
        }
        Ok(self.rows.remove(index))
    }

    pub fn set_cell(&mut self, row: usize, column: &str, value: &str) -> AppResult<()> {
        let declared = self
            .find_column(column)
            .map(str::to_owned)
            .ok_or_else(|| {
                AppError::new(
                    ERR_SHEET_INVALID,
                    format!("Column '{column}' does not exist."),
                )
                .with_context("column", column)
            })?;
        let len = self.rows.len();
        let record = self
            .rows
            .get_mut(row)
            .ok_or_else(|| row_out_of_range(row, len))?;
        record.set(declared, value);
        Ok(())
    }

    /// Structural validity: a header and at least one column.
    pub fn is_valid(&self) -> Result<(), String> {
        if self.header.trim().is_empty() {
            return Err("Header non può essere vuoto".to_string());
        }
        if self.header.chars().count() > MAX_HEADER_CHARS {
            return Err(format!(
                "Header troppo lungo (max {MAX_HEADER_CHARS} caratteri)"
            ));
        }
        if self.columns.is_empty() {
            return Err("Il foglio deve avere almeno una colonna".to_string());
        }
        Ok(())
    }
}

fn row_out_of_range(index: usize, len: usize) -> AppError {
    AppError::new(ERR_SHEET_INVALID, "Row index is out of range.")
        .with_context("row", index.to_string())
        .with_context("rows", len.to_string())
}

/// A sheet shared between the UI, the autosave worker and the search cursor.
pub type SharedSheet = Arc<Mutex<AssetSheet>>;

pub fn share(sheet: AssetSheet) -> SharedSheet {
    Arc::new(Mutex::new(sheet))
}

/// Lock a shared sheet, recovering the data if a previous holder panicked.
pub fn lock_sheet(sheet: &SharedSheet) -> MutexGuard<'_, AssetSheet> {
    sheet.lock().unwrap_or_else(|err| err.into_inner())
}
