//! Sheet persistence: one JSON file per sheet under an active and an archived
//! root, written atomically and moved between roots on archive/unarchive.

pub(crate) mod atomic;
pub mod normalize;

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::error::{ERR_PARSE, ERR_SHEET_DELETED, ERR_TOO_MANY_COLLISIONS};
use crate::security::fs_policy::{ensure_directory_exists, validate_and_get_safe_path};
use crate::sheet::AssetSheet;
use crate::{AppError, AppResult};

use self::atomic::AtomicWrite;
use self::normalize::{
    drop_null_rows, migrate_legacy_column, remove_duplicate_columns, RawSheet, SheetDocument,
};

pub const SHEET_EXTENSION: &str = "json";
pub const ARCHIVED_DIR_NAME: &str = "archived";
/// Fresh name attempts when the chosen destination is taken mid-move.
const MAX_MOVE_RETRIES: usize = 3;
pub const MAX_COLLISION_ATTEMPTS: u32 = 1000;
const MAX_SLUG_CHARS: usize = 50;
const FALLBACK_SLUG: &str = "foglio";

static INVALID_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Loads, saves, deletes and relocates sheet files.
///
/// When the session does not hold the instance lock the store is switched to
/// read-only and every mutating call fails with `STORE/READ_ONLY`.
#[derive(Debug)]
pub struct SheetStore {
    active_root: PathBuf,
    archived_root: PathBuf,
    read_only: AtomicBool,
}

impl SheetStore {
    /// Open the store rooted at `data_root`, creating `data_root` and
    /// `data_root/archived` when missing.
    pub fn open(data_root: &Path) -> AppResult<Self> {
        let active_root = crate::security::fs_policy::resolve_lexically(data_root)?;
        let archived_root = active_root.join(ARCHIVED_DIR_NAME);
        ensure_directory_exists(&active_root)?;
        ensure_directory_exists(&archived_root)?;
        Ok(Self {
            active_root,
            archived_root,
            read_only: AtomicBool::new(false),
        })
    }

    pub fn active_root(&self) -> &Path {
        &self.active_root
    }

    pub fn archived_root(&self) -> &Path {
        &self.archived_root
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn ensure_writable(&self, operation: &str) -> AppResult<()> {
        if self.is_read_only() {
            return Err(AppError::read_only(operation));
        }
        Ok(())
    }

    fn root_for(&self, archived: bool) -> &Path {
        if archived {
            &self.archived_root
        } else {
            &self.active_root
        }
    }

    /// Every readable sheet in the active root, followed by the archived ones
    /// when requested. Unreadable files are logged and skipped.
    pub fn load_all(&self, include_archived: bool) -> Vec<AssetSheet> {
        let mut sheets = self.load_folder(&self.active_root, false);
        if include_archived {
            sheets.extend(self.load_folder(&self.archived_root, true));
        }
        sheets
    }

    /// Load a single sheet by file name from the active or archived root.
    pub fn load_one(&self, file_name: &str, archived: bool) -> AppResult<AssetSheet> {
        let path = validate_and_get_safe_path(self.root_for(archived), file_name)?;
        load_sheet_file(&path, archived)
    }

    fn load_folder(&self, folder: &Path, archived: bool) -> Vec<AssetSheet> {
        if !folder.is_dir() {
            return Vec::new();
        }

        let mut sheets = Vec::new();
        let entries = WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(
                        target: "cespiti",
                        event = "sheet_enumerate_failed",
                        folder = %folder.display(),
                        error = %err
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_sheet_file(entry.path()) {
                continue;
            }

            match load_sheet_file(entry.path(), archived) {
                Ok(sheet) => sheets.push(sheet),
                Err(err) => error!(
                    target: "cespiti",
                    event = "sheet_load_skipped",
                    path = %entry.path().display(),
                    code = err.code(),
                    error = %err
                ),
            }
        }
        sheets
    }

    /// Persist `sheet`, assigning a file name derived from the header when it
    /// has none yet.
    pub fn save(&self, sheet: &mut AssetSheet) -> AppResult<()> {
        self.ensure_writable("save")?;
        if sheet.is_deleted {
            return Err(AppError::new(ERR_SHEET_DELETED, "The sheet has been deleted.")
                .with_context("sheet", sheet.header())
                .with_context("file_name", sheet.file_name()));
        }

        let root = self.root_for(sheet.is_archived).to_path_buf();
        ensure_directory_exists(&root)?;

        if !sheet.has_file_name() {
            let generated = format!("{}.{SHEET_EXTENSION}", generate_safe_stem(sheet.header()));
            let unique = unique_destination(&root, &generated)?;
            sheet.file_name = file_name_of(&unique);
        }

        let path = validate_and_get_safe_path(&root, &sheet.file_name)?;
        let bytes = serde_json::to_vec_pretty(&SheetDocument::from(&*sheet))
            .map_err(|err| AppError::persistence("serialize", &path, err))?;

        AtomicWrite::new(&path).write_bytes(&bytes).map_err(|err| {
            error!(
                target: "cespiti",
                event = "sheet_save_failed",
                header = sheet.header(),
                path = %path.display(),
                error = %err
            );
            err.with_context("sheet", sheet.header())
        })?;

        info!(
            target: "cespiti",
            event = "sheet_saved",
            header = sheet.header(),
            path = %path.display()
        );
        Ok(())
    }

    /// Remove the sheet's file and mark the sheet deleted so it is never
    /// saved again. A file that is already gone is not an error.
    pub fn delete(&self, sheet: &mut AssetSheet) -> AppResult<()> {
        self.ensure_writable("delete")?;
        if !sheet.has_file_name() {
            sheet.is_deleted = true;
            return Ok(());
        }

        let path = validate_and_get_safe_path(self.root_for(sheet.is_archived), &sheet.file_name)?;
        let removed = fs::remove_file(&path);
        if removed.is_ok() || matches!(&removed, Err(err) if err.kind() == io::ErrorKind::NotFound) {
            sheet.is_deleted = true;
        }
        match removed {
            Ok(()) => {
                info!(
                    target: "cespiti",
                    event = "sheet_deleted",
                    header = sheet.header(),
                    path = %path.display()
                );
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    target: "cespiti",
                    event = "sheet_delete_missing",
                    path = %path.display()
                );
                Ok(())
            }
            Err(err) => Err(AppError::persistence("delete", &path, err)),
        }
    }

    /// Move the sheet file into the archived root.
    pub fn archive(&self, sheet: &mut AssetSheet) -> AppResult<()> {
        self.relocate(sheet, true)
    }

    /// Move the sheet file back into the active root.
    pub fn unarchive(&self, sheet: &mut AssetSheet) -> AppResult<()> {
        self.relocate(sheet, false)
    }

    fn relocate(&self, sheet: &mut AssetSheet, to_archived: bool) -> AppResult<()> {
        let operation = if to_archived { "archive" } else { "unarchive" };
        self.ensure_writable(operation)?;
        if sheet.is_archived == to_archived {
            return Ok(());
        }
        if !sheet.has_file_name() {
            warn!(
                target: "cespiti",
                event = "sheet_relocate_unsaved",
                operation,
                header = sheet.header()
            );
            return Ok(());
        }

        let source = validate_and_get_safe_path(self.root_for(!to_archived), &sheet.file_name)?;
        if !source.exists() {
            warn!(
                target: "cespiti",
                event = "sheet_relocate_source_missing",
                operation,
                path = %source.display()
            );
            return Ok(());
        }

        let dest_root = self.root_for(to_archived).to_path_buf();
        ensure_directory_exists(&dest_root)?;
        let mut attempt = 0;
        let (new_name, dest) = loop {
            let candidate = unique_destination(&dest_root, &sheet.file_name)?;
            let new_name = file_name_of(&candidate);
            let dest = validate_and_get_safe_path(&dest_root, &new_name)?;
            match move_no_clobber(&source, &dest) {
                Ok(()) => break (new_name, dest),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_MOVE_RETRIES => {
                    attempt += 1;
                    warn!(
                        target: "cespiti",
                        event = "sheet_relocate_destination_taken",
                        operation,
                        path = %dest.display()
                    );
                }
                Err(err) => {
                    return Err(AppError::persistence(operation, &source, err)
                        .with_context("destination", dest.display().to_string()));
                }
            }
        };

        sheet.file_name = new_name;
        sheet.is_archived = to_archived;
        info!(
            target: "cespiti",
            event = "sheet_relocated",
            operation,
            header = sheet.header(),
            path = %dest.display()
        );
        Ok(())
    }
}

/// Move `source` to `dest`, failing with `AlreadyExists` instead of
/// replacing a file that appeared at `dest`. Filesystems without hard links
/// fall back to a rename after a final existence check.
pub(crate) fn move_no_clobber(source: &Path, dest: &Path) -> io::Result<()> {
    match fs::hard_link(source, dest) {
        Ok(()) => {
            if let Err(err) = fs::remove_file(source) {
                if let Err(unlink_err) = fs::remove_file(dest) {
                    error!(
                        target: "cespiti",
                        event = "sheet_move_unlink_failed",
                        path = %dest.display(),
                        error = %unlink_err
                    );
                }
                return Err(err);
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(err),
        Err(_) => match fs::symlink_metadata(dest) {
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", dest.display()),
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => fs::rename(source, dest),
            Err(err) => Err(err),
        },
    }
}

fn is_sheet_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| ext.eq_ignore_ascii_case(SHEET_EXTENSION))
        .unwrap_or(false)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parse_error(path: &Path, message: &str) -> AppError {
    AppError::new(ERR_PARSE, message).with_context("path", path.display().to_string())
}

fn load_sheet_file(path: &Path, archived: bool) -> AppResult<AssetSheet> {
    let text = fs::read_to_string(path)
        .map_err(|err| parse_error(path, "Unable to read sheet file.").with_cause(err))?;
    if text.trim().is_empty() {
        return Err(parse_error(path, "Sheet file is empty."));
    }

    let raw: RawSheet = serde_json::from_str(&text)
        .map_err(|err| parse_error(path, "Sheet file is not valid JSON.").with_cause(err))?;
    let Some(columns) = raw.columns else {
        return Err(parse_error(path, "Sheet file has no Columns."));
    };

    let rows = match raw.rows {
        Some(rows) => rows,
        None => {
            warn!(
                target: "cespiti",
                event = "sheet_rows_missing",
                path = %path.display()
            );
            Vec::new()
        }
    };

    let mut sheet = AssetSheet::default();
    sheet.set_header(raw.header.as_deref().unwrap_or_default());
    sheet.columns = columns;

    let (rows, dropped) = drop_null_rows(rows);
    if dropped > 0 {
        warn!(
            target: "cespiti",
            event = "sheet_null_rows_dropped",
            path = %path.display(),
            dropped
        );
    }
    sheet.rows = rows;

    if migrate_legacy_column(&mut sheet) {
        info!(
            target: "cespiti",
            event = "sheet_legacy_column_migrated",
            path = %path.display()
        );
    }
    for column in remove_duplicate_columns(&mut sheet) {
        warn!(
            target: "cespiti",
            event = "sheet_duplicate_column_removed",
            path = %path.display(),
            column = %column
        );
    }

    sheet.file_name = file_name_of(path);
    sheet.is_archived = archived;
    Ok(sheet)
}

/// File-name stem derived from a header: characters outside `[\w\s-]` are
/// stripped, whitespace runs become `_`, the result is capped at 50 chars and
/// suffixed with a local timestamp.
pub fn generate_safe_stem(header: &str) -> String {
    let stripped = INVALID_CHARS.replace_all(header.trim(), "");
    let collapsed = WHITESPACE.replace_all(&stripped, "_");
    let mut slug: String = collapsed.chars().take(MAX_SLUG_CHARS).collect();
    if slug.is_empty() {
        slug = FALLBACK_SLUG.to_string();
    }
    format!("{slug}_{}", Local::now().format("%Y%m%d%H%M%S"))
}

/// `folder/file_name` if free, otherwise the first free `stem_N.ext` for
/// `N` in `1..=MAX_COLLISION_ATTEMPTS`.
pub(crate) fn unique_destination(folder: &Path, file_name: &str) -> AppResult<PathBuf> {
    let direct = folder.join(file_name);
    if !path_taken(&direct)? {
        return Ok(direct);
    }

    let original = Path::new(file_name);
    let stem = original
        .file_stem()
        .and_then(OsStr::to_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(FALLBACK_SLUG);
    let extension = original
        .extension()
        .and_then(OsStr::to_str)
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();

    for suffix in 1..=MAX_COLLISION_ATTEMPTS {
        let candidate = folder.join(format!("{stem}_{suffix}{extension}"));
        if !path_taken(&candidate)? {
            return Ok(candidate);
        }
    }

    Err(AppError::new(
        ERR_TOO_MANY_COLLISIONS,
        "Too many files with the same name in the destination folder.",
    )
    .with_context("folder", folder.display().to_string())
    .with_context("file_name", file_name)
    .with_context("attempts", MAX_COLLISION_ATTEMPTS.to_string()))
}

fn path_taken(path: &Path) -> AppResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AppError::from(err)
            .with_context("operation", "check_destination")
            .with_context("path", path.display().to_string())),
    }
}

#[cfg(test)]
mod tests;
