//! Option lists offered by the editing UI, stored globally and per sheet.
//!
//! Both files use the same recovery chain on load: primary file, then its
//! `.bak` (restoring the primary from it), then defaults.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{ERR_SETTINGS_INVALID, ERR_SETTINGS_PERSISTENCE};
use crate::security::fs_policy::{ensure_directory_exists, is_invalid_file_name_char};
use crate::store::atomic::{sibling, AtomicWrite, BACKUP_SUFFIX};
use crate::{AppError, AppResult};

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SHEET_SETTINGS_DIR_NAME: &str = "sheets";
const SHEET_SETTINGS_SUFFIX: &str = ".settings.json";
const FALLBACK_SHEET_STEM: &str = "foglio";

pub const DEFAULT_CAUSE_DISMISSIONE_OPTIONS: [&str; 3] = ["Obsolescenza", "Guasto", "Non conforme"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppSettings {
    pub cause_dismissione_options: Vec<String>,
    pub tipo_asset_options: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            cause_dismissione_options: default_cause_options(),
            tipo_asset_options: Vec::new(),
        }
    }
}

impl AppSettings {
    /// Whether `option` is one of the built-in dismissal causes.
    pub fn is_default_option(option: &str) -> bool {
        DEFAULT_CAUSE_DISMISSIONE_OPTIONS
            .iter()
            .any(|o| o.to_lowercase() == option.to_lowercase())
    }

    /// Trim, drop blanks and case-insensitive duplicates, keeping first
    /// occurrences in order.
    pub fn sanitize(&mut self) {
        self.cause_dismissione_options = sanitize_options(&self.cause_dismissione_options);
        self.tipo_asset_options = sanitize_options(&self.tipo_asset_options);
    }
}

fn default_cause_options() -> Vec<String> {
    DEFAULT_CAUSE_DISMISSIONE_OPTIONS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn sanitize_options(options: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    options
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .filter(|o| seen.insert(o.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Settings file as read: either list may be absent or `null`, and so may
/// individual entries.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSettings {
    #[serde(default)]
    cause_dismissione_options: Option<Vec<Option<String>>>,
    #[serde(default)]
    tipo_asset_options: Option<Vec<Option<String>>>,
}

impl RawSettings {
    fn into_settings(self) -> AppSettings {
        let causes = match self.cause_dismissione_options {
            Some(list) => list.into_iter().flatten().collect(),
            None => {
                warn!(
                    target: "cespiti",
                    event = "settings_causes_defaulted"
                );
                default_cause_options()
            }
        };
        let tipi = self
            .tipo_asset_options
            .map(|list| list.into_iter().flatten().collect())
            .unwrap_or_default();
        let mut settings = AppSettings {
            cause_dismissione_options: causes,
            tipo_asset_options: tipi,
        };
        settings.sanitize();
        settings
    }
}

#[derive(Debug)]
pub struct SettingsService {
    config_dir: PathBuf,
    sheets_dir: PathBuf,
    read_only: AtomicBool,
}

impl SettingsService {
    /// Settings rooted at `config_dir`; creates it and its `sheets/` child.
    pub fn new(config_dir: &Path) -> AppResult<Self> {
        let sheets_dir = config_dir.join(SHEET_SETTINGS_DIR_NAME);
        ensure_directory_exists(config_dir)?;
        ensure_directory_exists(&sheets_dir)?;
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            sheets_dir,
            read_only: AtomicBool::new(false),
        })
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE_NAME)
    }

    /// `sheets/<stem>.settings.json` for a sheet file name; characters that
    /// are not valid in file names become `_`.
    pub fn sheet_settings_path(&self, sheet_file_name: &str) -> PathBuf {
        let stem = Path::new(sheet_file_name.trim())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut safe: String = stem
            .chars()
            .map(|c| if is_invalid_file_name_char(c) { '_' } else { c })
            .collect();
        if safe.trim().is_empty() {
            safe = FALLBACK_SHEET_STEM.to_string();
        }
        self.sheets_dir.join(format!("{safe}{SHEET_SETTINGS_SUFFIX}"))
    }

    /// Global settings. Never fails; problems are logged and defaults used.
    pub fn load(&self) -> AppSettings {
        self.load_from(&self.settings_path(), "global", AppSettings::default())
    }

    pub fn save(&self, settings: &AppSettings) -> AppResult<AppSettings> {
        self.save_to(settings, &self.settings_path(), "global")
    }

    /// Per-sheet settings, seeded from a copy of `defaults`.
    pub fn load_for_sheet(&self, sheet_file_name: &str, defaults: &AppSettings) -> AppSettings {
        if sheet_file_name.trim().is_empty() {
            return defaults.clone();
        }
        let path = self.sheet_settings_path(sheet_file_name);
        self.load_from(&path, "sheet", defaults.clone())
    }

    pub fn save_for_sheet(&self, settings: &AppSettings, sheet_file_name: &str) -> AppResult<AppSettings> {
        if sheet_file_name.trim().is_empty() {
            return Err(AppError::new(
                ERR_SETTINGS_INVALID,
                "Sheet file name cannot be empty.",
            ));
        }
        let path = self.sheet_settings_path(sheet_file_name);
        self.save_to(settings, &path, "sheet")
    }

    fn load_from(&self, path: &Path, scope: &'static str, defaults: AppSettings) -> AppSettings {
        if !path.exists() {
            if self.is_read_only() {
                return defaults;
            }
            return match self.save_to(&defaults, path, scope) {
                Ok(saved) => saved,
                Err(err) => {
                    error!(
                        target: "cespiti",
                        event = "settings_initial_write_failed",
                        scope,
                        path = %path.display(),
                        error = %err
                    );
                    defaults
                }
            };
        }

        if let Some(settings) = read_settings(path, scope) {
            return settings;
        }

        let backup = sibling(path, BACKUP_SUFFIX);
        if let Some(settings) = read_settings(&backup, scope) {
            warn!(
                target: "cespiti",
                event = "settings_recovered_from_backup",
                scope,
                path = %backup.display()
            );
            if !self.is_read_only() {
                // The corrupt primary must not replace the good backup.
                let restored = fs::remove_file(path)
                    .map_err(AppError::from)
                    .and_then(|()| self.save_to(&settings, path, scope));
                if let Err(err) = restored {
                    error!(
                        target: "cespiti",
                        event = "settings_restore_failed",
                        scope,
                        path = %path.display(),
                        error = %err
                    );
                }
            }
            return settings;
        }

        warn!(
            target: "cespiti",
            event = "settings_defaulted",
            scope,
            path = %path.display()
        );
        defaults
    }

    /// Sanitize and persist; returns the settings as written. The previous
    /// file is kept as `.bak`.
    fn save_to(&self, settings: &AppSettings, path: &Path, scope: &'static str) -> AppResult<AppSettings> {
        if self.is_read_only() {
            return Err(AppError::read_only("save_settings"));
        }

        let mut sanitized = settings.clone();
        sanitized.sanitize();

        let result = serde_json::to_vec_pretty(&sanitized)
            .map_err(AppError::from)
            .and_then(|bytes| AtomicWrite::new(path).keep_backup().write_bytes(&bytes));

        match result {
            Ok(()) => {
                info!(
                    target: "cespiti",
                    event = "settings_saved",
                    scope,
                    path = %path.display()
                );
                Ok(sanitized)
            }
            Err(err) => {
                error!(
                    target: "cespiti",
                    event = "settings_save_failed",
                    scope,
                    path = %path.display(),
                    error = %err
                );
                Err(AppError::new(ERR_SETTINGS_PERSISTENCE, "Unable to save settings.")
                    .with_context("path", path.display().to_string())
                    .with_context("scope", scope)
                    .with_cause(err))
            }
        }
    }
}

fn read_settings(path: &Path, scope: &'static str) -> Option<AppSettings> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            error!(
                target: "cespiti",
                event = "settings_read_failed",
                scope,
                path = %path.display(),
                error = %err
            );
            return None;
        }
    };
    if text.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Option<RawSettings>>(&text) {
        Ok(Some(raw)) => Some(raw.into_settings()),
        Ok(None) => None,
        Err(err) => {
            error!(
                target: "cespiti",
                event = "settings_parse_failed",
                scope,
                path = %path.display(),
                error = %err
            );
            None
        }
    }
}

/// Per-sheet settings keyed by sheet file name. Reads hand out clones so a
/// caller's edits never leak into the cache until [`SettingsCache::put`].
#[derive(Debug)]
pub struct SettingsCache {
    service: Arc<SettingsService>,
    entries: HashMap<String, AppSettings>,
}

impl SettingsCache {
    pub fn new(service: Arc<SettingsService>) -> Self {
        Self {
            service,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, sheet_file_name: &str, defaults: &AppSettings) -> AppSettings {
        if let Some(settings) = self.entries.get(sheet_file_name) {
            return settings.clone();
        }
        let loaded = self.service.load_for_sheet(sheet_file_name, defaults);
        if !sheet_file_name.trim().is_empty() {
            self.entries
                .insert(sheet_file_name.to_string(), loaded.clone());
        }
        loaded
    }

    pub fn put(&mut self, sheet_file_name: &str, settings: &AppSettings) {
        self.entries
            .insert(sheet_file_name.to_string(), settings.clone());
    }

    pub fn evict(&mut self, sheet_file_name: &str) -> Option<AppSettings> {
        self.entries.remove(sheet_file_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
