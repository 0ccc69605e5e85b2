use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::autosave::{AutosaveScheduler, FlushOutcome};
use crate::config::Config;
use crate::error::ERR_SHEET_DELETED;
use crate::events::{CoreEvent, SharedSink};
use crate::export::export_sheet_xlsx;
use crate::lock::{AppLock, LockService};
use crate::search::SearchManager;
use crate::settings::{AppSettings, SettingsCache, SettingsService};
use crate::sheet::{lock_sheet, share, AssetSheet, SharedSheet};
use crate::store::SheetStore;
use crate::{AppError, AppResult};

pub const APP_TITLE: &str = "Gestione Cespiti - Dismissioni";
pub const READ_ONLY_SUFFIX: &str = " [SOLA LETTURA]";

/// Everything one running instance owns: the instance lock, the store, the
/// autosave worker, settings and the search cursor.
///
/// When another live instance holds the lock the session opens read-only:
/// the store and settings refuse writes and autosave ignores marks.
pub struct Session {
    config: Config,
    store: Arc<SheetStore>,
    lock: LockService,
    lock_holder: Option<AppLock>,
    read_only: bool,
    autosave: AutosaveScheduler,
    settings: Arc<SettingsService>,
    global_settings: Mutex<AppSettings>,
    sheet_settings: Mutex<SettingsCache>,
    search: Mutex<SearchManager>,
    sink: SharedSink,
    closed: AtomicBool,
}

impl Session {
    pub fn open(config: Config, sink: SharedSink) -> AppResult<Self> {
        let lock = LockService::new(&config.config_dir())?
            .with_retry_policy(config.lock_retries, config.lock_retry_delay);
        Self::open_with_lock(config, sink, lock)
    }

    /// Open with an explicitly configured lock service.
    pub fn open_with_lock(config: Config, sink: SharedSink, lock: LockService) -> AppResult<Self> {
        let store = Arc::new(SheetStore::open(config.data_dir())?);
        let settings = Arc::new(SettingsService::new(&config.config_dir())?);

        let acquired = lock.try_acquire();
        let read_only = !acquired;
        let lock_holder = if read_only { lock.current_lock() } else { None };

        let autosave = if read_only {
            store.set_read_only(true);
            settings.set_read_only(true);
            warn!(
                target: "cespiti",
                event = "session_read_only",
                holder = %lock_holder.as_ref().map(AppLock::holder).unwrap_or_default()
            );
            sink.emit(CoreEvent::ReadOnly {
                holder: lock_holder.as_ref().map(AppLock::holder),
            });
            AutosaveScheduler::disabled(store.clone(), sink.clone())
        } else {
            AutosaveScheduler::start(store.clone(), sink.clone(), config.autosave_debounce)?
        };

        let global_settings = settings.load();
        let sheet_settings = SettingsCache::new(settings.clone());
        let search = SearchManager::new(store.clone(), sink.clone());

        info!(
            target: "cespiti",
            event = "session_opened",
            data_dir = %store.active_root().display(),
            read_only
        );

        Ok(Self {
            config,
            store,
            lock,
            lock_holder,
            read_only,
            autosave,
            settings,
            global_settings: Mutex::new(global_settings),
            sheet_settings: Mutex::new(sheet_settings),
            search: Mutex::new(search),
            sink,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn title(&self) -> String {
        if self.read_only {
            format!("{APP_TITLE}{READ_ONLY_SUFFIX}")
        } else {
            APP_TITLE.to_string()
        }
    }

    /// Who held the lock when this session fell back to read-only.
    pub fn lock_holder(&self) -> Option<&AppLock> {
        self.lock_holder.as_ref()
    }

    pub fn store(&self) -> &Arc<SheetStore> {
        &self.store
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    pub fn load_sheets(&self, include_archived: bool) -> Vec<SharedSheet> {
        self.store
            .load_all(include_archived)
            .into_iter()
            .map(share)
            .collect()
    }

    fn ensure_writable(&self, operation: &str) -> AppResult<()> {
        if self.read_only {
            return Err(AppError::read_only(operation));
        }
        Ok(())
    }

    /// Create a sheet with the standard columns and persist it immediately.
    pub fn create_sheet(&self, header: &str) -> AppResult<SharedSheet> {
        self.ensure_writable("create_sheet")?;
        let mut sheet = AssetSheet::create_new(header);
        self.store.save(&mut sheet)?;
        info!(
            target: "cespiti",
            event = "sheet_created",
            header = sheet.header(),
            file_name = sheet.file_name()
        );
        Ok(share(sheet))
    }

    pub fn mark_dirty(&self, sheet: &SharedSheet) {
        self.autosave.mark_dirty(sheet);
    }

    pub fn pending_autosaves(&self) -> usize {
        self.autosave.pending_count()
    }

    /// Persist `sheets` now, together with anything already pending.
    /// Deleted sheets are refused before anything is written.
    pub fn save_all(&self, sheets: &[SharedSheet]) -> AppResult<FlushOutcome> {
        self.ensure_writable("save_all")?;
        if let Some(deleted) = sheets.iter().find(|s| lock_sheet(s).is_deleted()) {
            let guard = lock_sheet(deleted);
            return Err(AppError::new(ERR_SHEET_DELETED, "The sheet has been deleted.")
                .with_context("sheet", guard.header())
                .with_context("file_name", guard.file_name()));
        }
        for sheet in sheets {
            self.autosave.mark_dirty(sheet);
        }
        Ok(self.autosave.flush_now())
    }

    /// Delete the sheet's file. The handle stays usable for reading but is
    /// never saved again.
    pub fn delete_sheet(&self, sheet: &SharedSheet) -> AppResult<()> {
        self.ensure_writable("delete_sheet")?;
        self.autosave.forget(sheet);
        let mut guard = lock_sheet(sheet);
        self.store.delete(&mut guard)?;
        self.sheet_settings().evict(guard.file_name());
        Ok(())
    }

    pub fn archive_sheet(&self, sheet: &SharedSheet) -> AppResult<()> {
        self.relocate(sheet, true)
    }

    pub fn unarchive_sheet(&self, sheet: &SharedSheet) -> AppResult<()> {
        self.relocate(sheet, false)
    }

    fn relocate(&self, sheet: &SharedSheet, to_archived: bool) -> AppResult<()> {
        let operation = if to_archived { "archive_sheet" } else { "unarchive_sheet" };
        self.ensure_writable(operation)?;
        let mut guard = lock_sheet(sheet);
        let previous = guard.file_name().to_string();
        if to_archived {
            self.store.archive(&mut guard)?;
        } else {
            self.store.unarchive(&mut guard)?;
        }
        if guard.file_name() != previous {
            self.sheet_settings().evict(&previous);
        }
        Ok(())
    }

    pub fn export_sheet(&self, sheet: &SharedSheet, dest: &Path) -> AppResult<PathBuf> {
        let guard = lock_sheet(sheet);
        export_sheet_xlsx(&guard, dest)
    }

    pub fn global_settings(&self) -> AppSettings {
        self.global_settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn save_global_settings(&self, settings: &AppSettings) -> AppResult<()> {
        let saved = self.settings.save(settings)?;
        *self.global_settings.lock().unwrap_or_else(|e| e.into_inner()) = saved;
        Ok(())
    }

    fn sheet_settings(&self) -> MutexGuard<'_, SettingsCache> {
        self.sheet_settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Option lists for `sheet`: its own overrides, else the global lists.
    /// The returned value is a copy.
    pub fn settings_for(&self, sheet: &AssetSheet) -> AppSettings {
        let global = self.global_settings();
        self.sheet_settings().get(sheet.file_name(), &global)
    }

    pub fn save_settings_for(&self, sheet: &AssetSheet, settings: &AppSettings) -> AppResult<()> {
        let saved = self.settings.save_for_sheet(settings, sheet.file_name())?;
        self.sheet_settings().put(sheet.file_name(), &saved);
        Ok(())
    }

    pub fn search(&self) -> MutexGuard<'_, SearchManager> {
        self.search.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Final autosave flush, then release the lock. Later calls do nothing.
    pub fn shutdown(&self) -> FlushOutcome {
        if self.closed.swap(true, Ordering::SeqCst) {
            return FlushOutcome::default();
        }
        let outcome = self.autosave.shutdown();
        if !self.read_only {
            self.lock.release();
        }
        info!(
            target: "cespiti",
            event = "session_closed",
            saved = outcome.saved,
            failed = outcome.failed.len()
        );
        outcome
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
