use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::Path;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;

use crate::security::fs_policy::PathPolicyError;

/// Malformed sheet content. Recovered by the store: the file is skipped and logged.
pub const ERR_PARSE: &str = "STORE/PARSE";
/// Write, copy, rename or delete failure while mutating the store.
pub const ERR_PERSISTENCE: &str = "STORE/PERSISTENCE";
/// Archive/unarchive could not find a free destination name.
pub const ERR_TOO_MANY_COLLISIONS: &str = "STORE/TOO_MANY_COLLISIONS";
/// The session does not own the instance lock.
pub const ERR_READ_ONLY: &str = "STORE/READ_ONLY";
/// A resolved path escaped its base directory.
pub const ERR_SECURITY_VIOLATION: &str = "PATH/SECURITY_VIOLATION";
pub const ERR_PATH_INVALID: &str = "PATH/INVALID";
pub const ERR_SETTINGS_PERSISTENCE: &str = "SETTINGS/PERSISTENCE";
pub const ERR_SETTINGS_INVALID: &str = "SETTINGS/INVALID";
pub const ERR_SHEET_INVALID: &str = "SHEET/INVALID";
/// Save attempted on a sheet whose file was deleted.
pub const ERR_SHEET_DELETED: &str = "SHEET/DELETED";

/// A structured application error that can be serialized and surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message that can be shown directly to the user.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;
pub type Result<T> = AppResult<T>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    /// Wrap a failed mutation of `path` as a persistence error, keeping the
    /// underlying error as the cause.
    pub fn persistence(operation: &str, path: &Path, cause: impl Into<AppError>) -> Self {
        AppError::new(ERR_PERSISTENCE, format!("Unable to {operation} sheet file."))
            .with_context("operation", operation)
            .with_context("path", path.display().to_string())
            .with_cause(cause)
    }

    pub fn read_only(operation: &str) -> Self {
        AppError::new(
            ERR_READ_ONLY,
            "The application is open in read-only mode; another instance holds the lock.",
        )
        .with_context("operation", operation)
    }

    /// Returns the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the contextual metadata associated with the error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Returns the nested cause if one is present.
    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<PathPolicyError> for AppError {
    fn from(error: PathPolicyError) -> Self {
        let code = match &error {
            PathPolicyError::OutsideBase { .. } => ERR_SECURITY_VIOLATION,
            PathPolicyError::Empty(_) | PathPolicyError::Unresolvable(_) => ERR_PATH_INVALID,
            PathPolicyError::Io(_) => "IO/PATH",
        };
        AppError::new(code, error.to_string()).with_context("policy", error.name())
    }
}
