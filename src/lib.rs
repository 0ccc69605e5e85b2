//! Asset decommissioning ledger.
//!
//! Sheets of decommissioned assets are persisted as JSON files under a data
//! directory, guarded by a single-instance lock, saved in the background by
//! a debounced autosave worker and searchable cell by cell.

pub mod autosave;
pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod lock;
pub mod logging;
pub mod search;
pub mod security;
pub mod session;
pub mod settings;
pub mod sheet;
pub mod store;

pub use error::{AppError, AppResult};
pub use logging::{flush_file_logs, init_file_logging, init_logging};
pub use session::Session;
