//! Cross-process instance lock.
//!
//! The lock is a JSON file under the config directory; its existence is the
//! mutex. Creation uses create-new semantics so two processes can never both
//! believe they created it. A lock left behind by a dead process is removed
//! and acquisition retried a bounded number of times.

pub mod process;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::security::fs_policy::ensure_directory_exists;
use crate::AppResult;

pub use process::is_process_running;

pub const LOCK_FILE_NAME: &str = "lock.json";
pub const DEFAULT_LOCK_RETRIES: u32 = 3;
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppLock {
    pub user_name: String,
    pub host_name: String,
    pub lock_time: DateTime<Local>,
    pub process_id: String,
}

impl Default for AppLock {
    fn default() -> Self {
        Self {
            user_name: String::new(),
            host_name: String::new(),
            lock_time: Local::now(),
            process_id: String::new(),
        }
    }
}

impl AppLock {
    /// `user@host (PID n)`, used in logs and the read-only banner.
    pub fn holder(&self) -> String {
        format!("{}@{} (PID {})", self.user_name, self.host_name, self.process_id)
    }
}

/// Who this process claims to be when it writes the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockIdentity {
    pub user_name: String,
    pub host_name: String,
    pub process_id: String,
}

impl LockIdentity {
    pub fn current() -> Self {
        Self {
            user_name: process::current_user_name(),
            host_name: process::current_host_name(),
            process_id: std::process::id().to_string(),
        }
    }

    fn owns(&self, lock: &AppLock) -> bool {
        lock.user_name == self.user_name
            && lock.host_name == self.host_name
            && lock.process_id == self.process_id
    }
}

#[derive(Debug)]
pub struct LockService {
    lock_path: PathBuf,
    identity: LockIdentity,
    retries: u32,
    retry_delay: Duration,
}

impl LockService {
    /// Lock service for `config_dir/lock.json`; creates `config_dir`.
    pub fn new(config_dir: &Path) -> AppResult<Self> {
        ensure_directory_exists(config_dir)?;
        Ok(Self {
            lock_path: config_dir.join(LOCK_FILE_NAME),
            identity: LockIdentity::current(),
            retries: DEFAULT_LOCK_RETRIES,
            retry_delay: DEFAULT_LOCK_RETRY_DELAY,
        })
    }

    pub fn with_identity(mut self, identity: LockIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_retry_policy(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    /// Try to become the single writer. Never errors: any failure to take
    /// the lock is logged and answered with `false`.
    pub fn try_acquire(&self) -> bool {
        let mut attempt = 0;
        loop {
            let err = match self.create_lock_file() {
                Ok(()) => {
                    info!(
                        target: "cespiti",
                        event = "lock_acquired",
                        holder = %self.describe_self(),
                        path = %self.lock_path.display()
                    );
                    return true;
                }
                Err(err) => err,
            };

            if err.kind() != io::ErrorKind::AlreadyExists {
                error!(
                    target: "cespiti",
                    event = "lock_acquire_failed",
                    path = %self.lock_path.display(),
                    error = %err
                );
                return false;
            }

            if attempt >= self.retries {
                self.log_holder("lock_retries_exhausted");
                return false;
            }
            attempt += 1;
            thread::sleep(self.retry_delay);

            if !self.lock_path.exists() {
                continue;
            }

            let Some(current) = self.current_lock() else {
                self.log_holder("lock_unreadable");
                return false;
            };
            if is_process_running(&current.process_id) {
                self.log_holder("lock_held");
                return false;
            }

            warn!(
                target: "cespiti",
                event = "lock_stale_removed",
                holder = %current.holder(),
                pid = %current.process_id
            );
            if let Err(err) = remove_lock_file(&self.lock_path) {
                error!(
                    target: "cespiti",
                    event = "lock_stale_remove_failed",
                    path = %self.lock_path.display(),
                    error = %err
                );
                return false;
            }
        }
    }

    fn create_lock_file(&self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)?;

        let record = AppLock {
            user_name: self.identity.user_name.clone(),
            host_name: self.identity.host_name.clone(),
            lock_time: Local::now(),
            process_id: self.identity.process_id.clone(),
        };
        let written = serde_json::to_vec_pretty(&record)
            .map_err(io::Error::from)
            .and_then(|bytes| file.write_all(&bytes))
            .and_then(|()| file.sync_all());

        if let Err(err) = written {
            drop(file);
            // A half-written lock would look malformed to every other instance.
            if let Err(remove_err) = remove_lock_file(&self.lock_path) {
                error!(
                    target: "cespiti",
                    event = "lock_partial_remove_failed",
                    path = %self.lock_path.display(),
                    error = %remove_err
                );
            }
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("failed to write lock record: {err}"),
            ));
        }
        Ok(())
    }

    fn describe_self(&self) -> String {
        format!(
            "{}@{} (PID {})",
            self.identity.user_name, self.identity.host_name, self.identity.process_id
        )
    }

    fn log_holder(&self, event: &'static str) {
        match self.current_lock() {
            Some(lock) => info!(
                target: "cespiti",
                event,
                holder = %lock.holder(),
                since = %lock.lock_time.to_rfc3339()
            ),
            None => info!(target: "cespiti", event, holder = "unknown"),
        }
    }

    /// The recorded holder, if the lock file exists and parses.
    pub fn current_lock(&self) -> Option<AppLock> {
        let text = match fs::read_to_string(&self.lock_path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                error!(
                    target: "cespiti",
                    event = "lock_read_failed",
                    path = %self.lock_path.display(),
                    error = %err
                );
                return None;
            }
        };

        if text.trim().is_empty() {
            warn!(target: "cespiti", event = "lock_file_empty");
            return None;
        }

        match serde_json::from_str::<AppLock>(&text) {
            Ok(lock) => Some(lock),
            Err(err) => {
                error!(
                    target: "cespiti",
                    event = "lock_file_malformed",
                    path = %self.lock_path.display(),
                    error = %err
                );
                None
            }
        }
    }

    pub fn is_own_lock(&self) -> bool {
        self.current_lock()
            .map(|lock| self.identity.owns(&lock))
            .unwrap_or(false)
    }

    /// Remove the lock if this process holds it. Foreign or missing locks are
    /// left alone; failures are logged only.
    pub fn release(&self) {
        if !self.lock_path.exists() {
            warn!(target: "cespiti", event = "lock_release_missing");
            return;
        }
        if !self.is_own_lock() {
            warn!(
                target: "cespiti",
                event = "lock_release_foreign",
                holder = %self.current_lock().map(|l| l.holder()).unwrap_or_default()
            );
            return;
        }
        match remove_lock_file(&self.lock_path) {
            Ok(()) => info!(
                target: "cespiti",
                event = "lock_released",
                holder = %self.describe_self()
            ),
            Err(err) => error!(
                target: "cespiti",
                event = "lock_release_failed",
                path = %self.lock_path.display(),
                error = %err
            ),
        }
    }

    /// Remove a lock whose holder is no longer running. Returns whether a
    /// file was removed; a live holder's lock is left in place.
    pub fn clear_stale(&self) -> AppResult<bool> {
        if !self.lock_path.exists() {
            return Ok(false);
        }
        if let Some(current) = self.current_lock() {
            if is_process_running(&current.process_id) {
                return Ok(false);
            }
            warn!(
                target: "cespiti",
                event = "lock_stale_removed",
                holder = %current.holder(),
                pid = %current.process_id
            );
        } else {
            warn!(target: "cespiti", event = "lock_unreadable_removed");
        }
        remove_lock_file(&self.lock_path)?;
        Ok(true)
    }
}

fn remove_lock_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests;
