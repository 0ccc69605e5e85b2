//! Single-sheet Excel export.
//!
//! One worksheet named after the header, a header row of column names with
//! the first row frozen, then one row per record. The workbook is built in
//! memory and written through the same temp-and-rename path as sheet saves.

use std::borrow::Cow;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use fs2::available_space;
use tracing::{error, info};
use rust_xlsxwriter::{ColNum, RowNum, Workbook, XlsxError};

use crate::security::fs_policy::{
    ensure_directory_exists, is_invalid_file_name_char, resolve_lexically,
};
use crate::sheet::AssetSheet;
use crate::store::atomic::AtomicWrite;
use crate::{AppError, AppResult};

pub const ERR_EXPORT_INVALID_SHEET: &str = "EXPORT/INVALID_SHEET";
pub const ERR_EXPORT_INVALID_PATH: &str = "EXPORT/INVALID_PATH";
pub const ERR_EXPORT_LOW_DISK: &str = "EXPORT/LOW_DISK";
pub const ERR_EXPORT_IO: &str = "EXPORT/IO";

pub const XLSX_EXTENSION: &str = "xlsx";
const FALLBACK_WORKSHEET_NAME: &str = "Cespiti";
const FALLBACK_FILE_STEM: &str = "foglio";
const MAX_WORKSHEET_NAME_CHARS: usize = 31;
/// Fixed overhead of the package parts, on top of cell content.
const PACKAGE_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Write `sheet` to `dest` as an `.xlsx` workbook and return the absolute
/// path written. An existing `dest` is kept as `<dest>.bak`.
pub fn export_sheet_xlsx(sheet: &AssetSheet, dest: &Path) -> AppResult<PathBuf> {
    if sheet.columns.is_empty() {
        return Err(AppError::new(
            ERR_EXPORT_INVALID_SHEET,
            "The sheet has no columns to export.",
        )
        .with_context("sheet", sheet.header()));
    }
    if dest.as_os_str().is_empty() || dest.to_string_lossy().trim().is_empty() {
        return Err(AppError::new(
            ERR_EXPORT_INVALID_PATH,
            "The export path cannot be empty.",
        ));
    }

    let dest = resolve_lexically(dest).map_err(|err| invalid_path(dest, err))?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            AppError::new(
                ERR_EXPORT_INVALID_PATH,
                "The export directory cannot be determined.",
            )
            .with_context("path", dest.display().to_string())
        })?;
    ensure_directory_exists(parent).map_err(|err| invalid_path(&dest, err))?;

    let required = estimate_size(sheet);
    let available = free_disk_space(parent).map_err(|err| {
        AppError::new(ERR_EXPORT_IO, "Unable to determine free disk space.")
            .with_context("operation", "available_space")
            .with_cause(err)
    })?;
    if available < required {
        return Err(AppError::new(
            ERR_EXPORT_LOW_DISK,
            "Not enough disk space for the export.",
        )
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }

    let worksheet_name = build_safe_worksheet_name(sheet.header());
    let bytes = build_workbook(sheet, &worksheet_name)?;
    AtomicWrite::new(&dest)
        .temp_path(temp_export_path(&dest))
        .keep_backup()
        .write_bytes(&bytes)
        .map_err(|err| {
            error!(
                target: "cespiti",
                event = "export_failed",
                sheet = sheet.header(),
                path = %dest.display(),
                error = %err
            );
            AppError::new(
                ERR_EXPORT_IO,
                "Unable to write the Excel file. It may be open in another program.",
            )
            .with_context("path", dest.display().to_string())
            .with_cause(err)
        })?;

    info!(
        target: "cespiti",
        event = "export_completed",
        sheet = sheet.header(),
        rows = sheet.rows.len(),
        path = %dest.display()
    );
    Ok(dest)
}

/// Default export file name for a sheet header.
pub fn suggested_export_file_name(header: &str) -> String {
    let trimmed = header.trim();
    let mut safe: String = trimmed
        .chars()
        .map(|c| if is_invalid_file_name_char(c) { '_' } else { c })
        .collect();
    if safe.trim().is_empty() {
        safe = FALLBACK_FILE_STEM.to_string();
    }
    format!("{safe}.{XLSX_EXTENSION}")
}

/// Excel worksheet names: no `:\/?*[]`, no leading or trailing apostrophe,
/// at most 31 characters, never blank.
pub fn build_safe_worksheet_name(header: &str) -> String {
    let trimmed = header.trim();
    if trimmed.is_empty() {
        return FALLBACK_WORKSHEET_NAME.to_string();
    }
    let name: String = trimmed
        .chars()
        .map(|c| match c {
            ':' | '\\' | '/' | '?' | '*' | '[' | ']' => '_',
            other => other,
        })
        .take(MAX_WORKSHEET_NAME_CHARS)
        .collect();
    let name = name.trim_matches('\'');
    if name.trim().is_empty() {
        FALLBACK_WORKSHEET_NAME.to_string()
    } else {
        name.to_string()
    }
}

fn invalid_path(dest: &Path, err: impl Into<AppError>) -> AppError {
    AppError::new(ERR_EXPORT_INVALID_PATH, "Invalid export path.")
        .with_context("path", dest.display().to_string())
        .with_cause(err)
}

/// `report.xlsx` -> `report.xlsx.tmp.xlsx`, so the temp file keeps an
/// extension spreadsheet tools recognise.
fn temp_export_path(dest: &Path) -> PathBuf {
    let mut os = OsString::from(dest.as_os_str());
    os.push(".tmp");
    if let Some(ext) = dest.extension() {
        os.push(".");
        os.push(ext);
    }
    PathBuf::from(os)
}

fn estimate_size(sheet: &AssetSheet) -> u64 {
    let header: usize = sheet.columns.iter().map(String::len).sum();
    let cells: usize = sheet
        .rows
        .iter()
        .flat_map(|row| sheet.columns.iter().map(move |c| row.get(c).len() + 48))
        .sum();
    PACKAGE_OVERHEAD_BYTES + ((header + cells) as u64).saturating_mul(2)
}

fn free_disk_space(path: &Path) -> std::io::Result<u64> {
    let target: Cow<'_, Path> = if path.exists() {
        Cow::Borrowed(path)
    } else if let Some(parent) = path.parent() {
        Cow::Owned(parent.to_path_buf())
    } else {
        Cow::Owned(std::env::current_dir()?)
    };
    available_space(target.as_ref())
}

fn map_xlsx_error(err: XlsxError, operation: &'static str) -> AppError {
    AppError::new(ERR_EXPORT_IO, "Failed to build the workbook.")
        .with_context("operation", operation)
        .with_context("error", err.to_string())
}

fn too_large(what: &'static str, count: usize) -> AppError {
    AppError::new(
        ERR_EXPORT_INVALID_SHEET,
        "The sheet is too large for an Excel worksheet.",
    )
    .with_context(what, count.to_string())
}

fn build_workbook(sheet: &AssetSheet, worksheet_name: &str) -> AppResult<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name(worksheet_name)
        .map_err(|err| map_xlsx_error(err, "set_name"))?;

    for (index, column) in sheet.columns.iter().enumerate() {
        let col = ColNum::try_from(index).map_err(|_| too_large("columns", sheet.columns.len()))?;
        worksheet
            .write_string(0, col, column.as_str())
            .map_err(|err| map_xlsx_error(err, "write_header"))?;
    }

    for (index, record) in sheet.rows.iter().enumerate() {
        let row = RowNum::try_from(index + 1).map_err(|_| too_large("rows", sheet.rows.len()))?;
        for (col, column) in sheet.columns.iter().enumerate() {
            let value = record.get(column);
            if value.is_empty() {
                continue;
            }
            // Column count was checked on the header row.
            let col = col as ColNum;
            worksheet
                .write_string(row, col, value)
                .map_err(|err| map_xlsx_error(err, "write_cell"))?;
        }
    }

    worksheet
        .set_freeze_panes(1, 0)
        .map_err(|err| map_xlsx_error(err, "freeze_panes"))?;
    workbook
        .save_to_buffer()
        .map_err(|err| map_xlsx_error(err, "save"))
}
