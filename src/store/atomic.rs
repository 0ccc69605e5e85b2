use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::ERR_PERSISTENCE;
use crate::{AppError, AppResult};

pub(crate) const TEMP_SUFFIX: &str = ".tmp";
pub(crate) const BACKUP_SUFFIX: &str = ".bak";

/// `path` with `suffix` appended to the full file name (`a.json` -> `a.json.bak`).
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

fn sync_file(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn step_error(operation: &str, path: &Path, err: impl Into<AppError>) -> AppError {
    AppError::new(ERR_PERSISTENCE, "Unable to write file atomically.")
        .with_context("operation", operation)
        .with_context("path", path.display().to_string())
        .with_cause(err)
}

/// Replace a file's contents without a window where neither the old file nor
/// a backup of it exists.
///
/// The new content goes to a temp sibling first. If the target exists it is
/// copied to `<target>.bak`, then the temp file is renamed over the target.
/// Unless [`AtomicWrite::keep_backup`] is set the backup is removed once the
/// rename succeeded. Failures before the rename leave the target untouched.
pub(crate) struct AtomicWrite<'a> {
    target: &'a Path,
    temp: PathBuf,
    keep_backup: bool,
}

impl<'a> AtomicWrite<'a> {
    pub(crate) fn new(target: &'a Path) -> Self {
        Self {
            target,
            temp: sibling(target, TEMP_SUFFIX),
            keep_backup: false,
        }
    }

    pub(crate) fn temp_path(mut self, temp: PathBuf) -> Self {
        self.temp = temp;
        self
    }

    pub(crate) fn keep_backup(mut self) -> Self {
        self.keep_backup = true;
        self
    }

    pub(crate) fn backup_path(&self) -> PathBuf {
        sibling(self.target, BACKUP_SUFFIX)
    }

    pub(crate) fn write_bytes(&self, bytes: &[u8]) -> AppResult<()> {
        self.write_with(|file| file.write_all(bytes).map_err(AppError::from))
    }

    /// Stream content into the temp file through `fill`, then promote it.
    pub(crate) fn write_with<F>(&self, fill: F) -> AppResult<()>
    where
        F: FnOnce(&mut File) -> AppResult<()>,
    {
        let result = self.stage(fill).and_then(|()| self.promote());
        if result.is_err() {
            if let Err(err) = remove_if_present(&self.temp) {
                warn!(
                    target: "cespiti",
                    event = "atomic_write_temp_cleanup_failed",
                    path = %self.temp.display(),
                    error = %err
                );
            }
        }
        result
    }

    fn stage<F>(&self, fill: F) -> AppResult<()>
    where
        F: FnOnce(&mut File) -> AppResult<()>,
    {
        let mut file =
            File::create(&self.temp).map_err(|err| step_error("create_temp", &self.temp, err))?;
        fill(&mut file).map_err(|err| step_error("write_temp", &self.temp, err))?;
        file.flush()
            .map_err(|err| step_error("flush_temp", &self.temp, err))?;
        file.sync_all()
            .map_err(|err| step_error("sync_temp", &self.temp, err))?;
        Ok(())
    }

    fn promote(&self) -> AppResult<()> {
        let backup = self.backup_path();
        let had_target = self.target.exists();
        if had_target {
            fs::copy(self.target, &backup)
                .map_err(|err| step_error("backup_existing", &backup, err))?;
        }

        fs::rename(&self.temp, self.target)
            .map_err(|err| step_error("replace_target", self.target, err))?;

        if let Some(parent) = self.target.parent() {
            if let Err(err) = sync_file(self.target).and_then(|()| sync_dir(parent)) {
                warn!(
                    target: "cespiti",
                    event = "atomic_write_sync_failed",
                    path = %self.target.display(),
                    error = %err
                );
            }
        }

        if had_target && !self.keep_backup {
            if let Err(err) = remove_if_present(&backup) {
                warn!(
                    target: "cespiti",
                    event = "atomic_write_backup_cleanup_failed",
                    path = %backup.display(),
                    error = %err
                );
            }
        }
        Ok(())
    }
}
