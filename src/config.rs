use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::autosave::DEFAULT_DEBOUNCE;
use crate::lock::{DEFAULT_LOCK_RETRIES, DEFAULT_LOCK_RETRY_DELAY};

pub const ENV_DATA_DIR: &str = "CESPITI_DATA_DIR";
pub const ENV_AUTOSAVE_DEBOUNCE_MS: &str = "CESPITI_AUTOSAVE_DEBOUNCE_MS";
pub const ENV_LOCK_RETRIES: &str = "CESPITI_LOCK_RETRIES";
pub const ENV_LOCK_RETRY_DELAY_MS: &str = "CESPITI_LOCK_RETRY_DELAY_MS";

pub const DATA_DIR_NAME: &str = "data";
pub const CONFIG_DIR_NAME: &str = "config";
pub const APP_DIR_NAME: &str = "cespiti";
const HARD_MAX_LOCK_RETRIES: u32 = 10;
const HARD_MAX_RETRY_DELAY_MS: u64 = 5_000;

/// Runtime settings resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub autosave_debounce: Duration,
    pub lock_retries: u32,
    pub lock_retry_delay: Duration,
}

impl Config {
    pub fn load() -> Self {
        let data_dir = env::var_os(ENV_DATA_DIR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let autosave_debounce = env_parse::<u64>(ENV_AUTOSAVE_DEBOUNCE_MS)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DEBOUNCE);

        let lock_retries = env_parse::<u32>(ENV_LOCK_RETRIES)
            .map(|value| value.min(HARD_MAX_LOCK_RETRIES))
            .unwrap_or(DEFAULT_LOCK_RETRIES);

        let lock_retry_delay = env_parse::<u64>(ENV_LOCK_RETRY_DELAY_MS)
            .map(|ms| Duration::from_millis(ms.min(HARD_MAX_RETRY_DELAY_MS)))
            .unwrap_or(DEFAULT_LOCK_RETRY_DELAY);

        Self {
            data_dir,
            autosave_debounce,
            lock_retries,
            lock_retry_delay,
        }
    }

    /// Defaults rooted at an explicit data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            autosave_debounce: DEFAULT_DEBOUNCE,
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_retry_delay: DEFAULT_LOCK_RETRY_DELAY,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join(CONFIG_DIR_NAME)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

/// `<exe dir>/data`, or the platform data directory when the executable
/// location cannot be resolved.
fn default_data_dir() -> PathBuf {
    if let Some(dir) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        return dir.join(DATA_DIR_NAME);
    }
    dirs::data_dir()
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(DATA_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global.
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    fn clear() {
        for key in [
            ENV_DATA_DIR,
            ENV_AUTOSAVE_DEBOUNCE_MS,
            ENV_LOCK_RETRIES,
            ENV_LOCK_RETRY_DELAY_MS,
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_without_environment() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        let config = Config::load();
        assert_eq!(config.autosave_debounce, Duration::from_millis(2000));
        assert_eq!(config.lock_retries, 3);
        assert_eq!(config.lock_retry_delay, Duration::from_millis(100));
        assert!(config.data_dir.ends_with(DATA_DIR_NAME));
    }

    #[test]
    fn environment_overrides_are_clamped() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        env::set_var(ENV_DATA_DIR, "/tmp/cespiti-data");
        env::set_var(ENV_AUTOSAVE_DEBOUNCE_MS, "250");
        env::set_var(ENV_LOCK_RETRIES, "99");
        env::set_var(ENV_LOCK_RETRY_DELAY_MS, "garbage");

        let config = Config::load();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/cespiti-data"));
        assert_eq!(config.config_dir(), PathBuf::from("/tmp/cespiti-data/config"));
        assert_eq!(config.autosave_debounce, Duration::from_millis(250));
        assert_eq!(config.lock_retries, 10);
        assert_eq!(config.lock_retry_delay, Duration::from_millis(100));
        clear();
    }
}
