use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use cespiti_lib::config::Config;
use cespiti_lib::events::TracingSink;
use cespiti_lib::export::export_sheet_xlsx;
use cespiti_lib::lock::{is_process_running, LockService};
use cespiti_lib::search::SearchManager;
use cespiti_lib::sheet::{lock_sheet, share};
use cespiti_lib::store::SheetStore;
use cespiti_lib::Session;

/// Exit code when another instance holds the lock.
const EXIT_LOCKED: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "cespiti",
    about = concat!(
        "Asset decommissioning ledger (commit ",
        env!("CESPITI_GIT_HASH"),
        ")"
    ),
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Inspect or clear the instance lock.
    #[command(subcommand)]
    Lock(LockCommand),
    /// Sheet inspection commands.
    #[command(subcommand)]
    Sheets(SheetsCommand),
    /// Search every cell for a substring.
    Search {
        text: String,
        /// Include archived sheets.
        #[arg(long)]
        archived: bool,
        /// Compare case-sensitively.
        #[arg(long)]
        match_case: bool,
        /// Emit the results as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Export one sheet to an .xlsx workbook.
    Export {
        /// Sheet file name, as shown by `sheets list`.
        file_name: String,
        dest: PathBuf,
        /// Look the sheet up among archived sheets.
        #[arg(long)]
        archived: bool,
    },
    /// Move a sheet into the archive.
    Archive { file_name: String },
    /// Move a sheet back out of the archive.
    Unarchive { file_name: String },
}

#[derive(Debug, Subcommand)]
enum LockCommand {
    /// Show who holds the lock.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remove the lock if its holder is no longer running.
    Release,
}

#[derive(Debug, Subcommand)]
enum SheetsCommand {
    /// List stored sheets.
    List {
        /// Include archived sheets.
        #[arg(long)]
        archived: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    cespiti_lib::init_logging();

    let cli = Cli::parse();
    let config = Config::load();
    if let Err(err) = cespiti_lib::init_file_logging(config.data_dir()) {
        tracing::warn!(target: "cespiti", event = "file_logging_disabled", error = %err);
    }
    tracing::debug!(target: "cespiti", event = "cli_started", data_dir = %config.data_dir().display());

    let code = match handle_cli(cli.command, config) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    cespiti_lib::flush_file_logs();
    process::exit(code);
}

fn handle_cli(command: Commands, config: Config) -> Result<i32> {
    match command {
        Commands::Lock(lock) => handle_lock_command(lock, &config),
        Commands::Sheets(SheetsCommand::List { archived, json }) => {
            handle_sheets_list(&config, archived, json)
        }
        Commands::Search {
            text,
            archived,
            match_case,
            json,
        } => handle_search(&config, &text, archived, match_case, json),
        Commands::Export {
            file_name,
            dest,
            archived,
        } => handle_export(&config, &file_name, &dest, archived),
        Commands::Archive { file_name } => handle_relocate(config, &file_name, true),
        Commands::Unarchive { file_name } => handle_relocate(config, &file_name, false),
    }
}

fn lock_service(config: &Config) -> Result<LockService> {
    Ok(LockService::new(&config.config_dir())
        .context("open lock directory")?
        .with_retry_policy(config.lock_retries, config.lock_retry_delay))
}

fn open_store(config: &Config) -> Result<Arc<SheetStore>> {
    let store = SheetStore::open(config.data_dir())
        .with_context(|| format!("open data directory {}", config.data_dir().display()))?;
    Ok(Arc::new(store))
}

fn handle_lock_command(command: LockCommand, config: &Config) -> Result<i32> {
    let lock = lock_service(config)?;
    match command {
        LockCommand::Status { json } => {
            let current = lock.current_lock();
            let alive = current
                .as_ref()
                .map(|l| is_process_running(&l.process_id))
                .unwrap_or(false);
            if json {
                let payload = json!({
                    "path": lock.lock_path(),
                    "locked": current.is_some(),
                    "holder": current,
                    "holderRunning": alive,
                });
                let serialized =
                    serde_json::to_string_pretty(&payload).context("serialize lock status")?;
                println!("{serialized}");
            } else {
                match &current {
                    Some(l) => println!(
                        "Locked by {} since {}{}",
                        l.holder(),
                        l.lock_time.to_rfc3339(),
                        if alive { "" } else { " (stale)" }
                    ),
                    None if lock.lock_path().exists() => println!("Lock file is unreadable."),
                    None => println!("Not locked."),
                }
            }
            Ok(0)
        }
        LockCommand::Release => {
            if lock.clear_stale().context("remove stale lock")? {
                println!("Stale lock removed.");
                Ok(0)
            } else if lock.lock_path().exists() {
                let holder = lock.current_lock().map(|l| l.holder()).unwrap_or_default();
                eprintln!("Lock is held by a running process: {holder}");
                Ok(EXIT_LOCKED)
            } else {
                println!("Not locked.");
                Ok(0)
            }
        }
    }
}

fn handle_sheets_list(config: &Config, archived: bool, emit_json: bool) -> Result<i32> {
    let store = open_store(config)?;
    let sheets = store.load_all(archived);
    if emit_json {
        let payload: Vec<_> = sheets
            .iter()
            .map(|sheet| {
                json!({
                    "fileName": sheet.file_name(),
                    "header": sheet.header(),
                    "archived": sheet.is_archived(),
                    "columns": sheet.columns,
                    "rows": sheet.rows.len(),
                })
            })
            .collect();
        let serialized = serde_json::to_string_pretty(&payload).context("serialize sheet list")?;
        println!("{serialized}");
    } else {
        for sheet in &sheets {
            println!(
                "{}\t{}\t{} rows{}",
                sheet.file_name(),
                sheet.header(),
                sheet.rows.len(),
                if sheet.is_archived() { "\t[archived]" } else { "" }
            );
        }
    }
    Ok(0)
}

fn handle_search(
    config: &Config,
    text: &str,
    archived: bool,
    match_case: bool,
    emit_json: bool,
) -> Result<i32> {
    let store = open_store(config)?;
    let mut search = SearchManager::new(store, Arc::new(TracingSink));
    let results = search.search(text, archived, match_case);
    if emit_json {
        let serialized =
            serde_json::to_string_pretty(results).context("serialize search results")?;
        println!("{serialized}");
    } else if results.is_empty() {
        println!("No results.");
    } else {
        for result in results {
            println!(
                "{}\trow {}\t{}\t{}",
                result.file_name,
                result.row_index + 1,
                result.column,
                result.value
            );
        }
    }
    Ok(0)
}

fn handle_export(
    config: &Config,
    file_name: &str,
    dest: &std::path::Path,
    archived: bool,
) -> Result<i32> {
    let store = open_store(config)?;
    let sheet = store
        .load_one(file_name, archived)
        .with_context(|| format!("load sheet {file_name}"))?;
    let written = export_sheet_xlsx(&sheet, dest).context("export sheet")?;
    println!("Exported to {}", written.display());
    Ok(0)
}

fn handle_relocate(config: Config, file_name: &str, to_archived: bool) -> Result<i32> {
    let session = Session::open(config, Arc::new(TracingSink)).context("open session")?;
    if session.is_read_only() {
        let holder = session.lock_holder().map(|l| l.holder()).unwrap_or_default();
        eprintln!("Another instance holds the lock: {holder}");
        return Ok(EXIT_LOCKED);
    }

    let sheet = session
        .store()
        .load_one(file_name, !to_archived)
        .with_context(|| format!("load sheet {file_name}"))?;
    let sheet = share(sheet);
    if to_archived {
        session.archive_sheet(&sheet).context("archive sheet")?;
    } else {
        session.unarchive_sheet(&sheet).context("unarchive sheet")?;
    }
    println!("{}", lock_sheet(&sheet).file_name());
    session.shutdown();
    Ok(0)
}
