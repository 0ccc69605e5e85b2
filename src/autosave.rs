//! Debounced background persistence of edited sheets.
//!
//! Every edit marks its sheet dirty and pushes the flush deadline out by the
//! debounce interval, so a burst of edits produces one flush. A single worker
//! thread waits on the deadline; the pending set and the deadline share one
//! mutex so marks may come from any thread.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::events::{CoreEvent, SharedSink};
use crate::sheet::{lock_sheet, AssetSheet, SharedSheet};
use crate::store::SheetStore;
use crate::{AppError, AppResult};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Where the scheduler persists sheets.
pub trait SheetWriter: Send + Sync {
    fn save_sheet(&self, sheet: &mut AssetSheet) -> AppResult<()>;
}

impl SheetWriter for SheetStore {
    fn save_sheet(&self, sheet: &mut AssetSheet) -> AppResult<()> {
        self.save(sheet)
    }
}

/// Result of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub saved: usize,
    /// Headers of the sheets that failed and were queued again.
    pub failed: Vec<String>,
}

impl FlushOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct State {
    pending: Vec<SharedSheet>,
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    // Serializes worker flushes with `flush_now` and the shutdown flush.
    flushing: Mutex<()>,
    writer: Arc<dyn SheetWriter>,
    sink: SharedSink,
    debounce: Duration,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self) -> FlushOutcome {
        let _flushing = self.flushing.lock().unwrap_or_else(|e| e.into_inner());
        let batch = std::mem::take(&mut self.state().pending);
        if batch.is_empty() {
            return FlushOutcome::default();
        }

        let mut outcome = FlushOutcome::default();
        let mut retry = Vec::new();
        for handle in &batch {
            let mut sheet = lock_sheet(handle);
            if sheet.is_deleted() {
                debug!(
                    target: "cespiti",
                    event = "autosave_skipped_deleted",
                    sheet = sheet.header()
                );
                continue;
            }
            match self.writer.save_sheet(&mut sheet) {
                Ok(()) => outcome.saved += 1,
                Err(err) => {
                    error!(
                        target: "cespiti",
                        event = "autosave_sheet_failed",
                        sheet = sheet.header(),
                        code = err.code(),
                        error = %err
                    );
                    outcome.failed.push(sheet.header().to_string());
                    retry.push(Arc::clone(handle));
                }
            }
        }

        if !retry.is_empty() {
            let mut state = self.state();
            for handle in retry {
                if !state.pending.iter().any(|p| Arc::ptr_eq(p, &handle)) {
                    state.pending.push(handle);
                }
            }
            if !state.shutdown {
                state.deadline = Some(Instant::now() + self.debounce);
                self.wake.notify_all();
            }
        }

        info!(
            target: "cespiti",
            event = "autosave_flushed",
            saved = outcome.saved,
            failed = outcome.failed.len()
        );
        if outcome.saved > 0 {
            self.sink.emit(CoreEvent::AutosaveCompleted {
                saved: outcome.saved,
            });
        }
        if !outcome.failed.is_empty() {
            self.sink.emit(CoreEvent::AutosaveFailed {
                failed: outcome.failed.clone(),
            });
        }
        outcome
    }

    fn run(&self) {
        let mut state = self.state();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                None => {
                    state = self.wake.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.deadline = None;
                        drop(state);
                        self.flush();
                        state = self.state();
                    } else {
                        state = self
                            .wake
                            .wait_timeout(state, deadline - now)
                            .map(|(guard, _)| guard)
                            .unwrap_or_else(|e| e.into_inner().0);
                    }
                }
            }
        }
    }
}

pub struct AutosaveScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    enabled: bool,
}

impl AutosaveScheduler {
    /// Start the worker thread.
    pub fn start(writer: Arc<dyn SheetWriter>, sink: SharedSink, debounce: Duration) -> AppResult<Self> {
        let scheduler = Self::build(writer, sink, debounce, true);
        let shared = Arc::clone(&scheduler.shared);
        let handle = thread::Builder::new()
            .name("cespiti-autosave".into())
            .spawn(move || shared.run())
            .map_err(|err| {
                AppError::from(err).with_context("operation", "spawn_autosave_worker")
            })?;
        *scheduler.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(
            target: "cespiti",
            event = "autosave_started",
            debounce_ms = debounce.as_millis() as u64
        );
        Ok(scheduler)
    }

    /// A scheduler that ignores every mark. Used in read-only sessions.
    pub fn disabled(writer: Arc<dyn SheetWriter>, sink: SharedSink) -> Self {
        info!(target: "cespiti", event = "autosave_disabled");
        Self::build(writer, sink, DEFAULT_DEBOUNCE, false)
    }

    fn build(writer: Arc<dyn SheetWriter>, sink: SharedSink, debounce: Duration, enabled: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wake: Condvar::new(),
                flushing: Mutex::new(()),
                writer,
                sink,
                debounce,
            }),
            worker: Mutex::new(None),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queue `sheet` and restart the debounce timer.
    pub fn mark_dirty(&self, sheet: &SharedSheet) {
        if !self.enabled {
            debug!(target: "cespiti", event = "autosave_mark_ignored", reason = "disabled");
            return;
        }
        let mut state = self.shared.state();
        if state.shutdown {
            debug!(target: "cespiti", event = "autosave_mark_ignored", reason = "shutdown");
            return;
        }
        if !state.pending.iter().any(|p| Arc::ptr_eq(p, sheet)) {
            state.pending.push(Arc::clone(sheet));
        }
        state.deadline = Some(Instant::now() + self.shared.debounce);
        self.shared.wake.notify_all();
    }

    /// Drop `sheet` from the pending set. Returns whether it was queued.
    pub fn forget(&self, sheet: &SharedSheet) -> bool {
        let mut state = self.shared.state();
        let before = state.pending.len();
        state.pending.retain(|p| !Arc::ptr_eq(p, sheet));
        if state.pending.is_empty() {
            state.deadline = None;
        }
        before != state.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Flush the pending set on the calling thread.
    pub fn flush_now(&self) -> FlushOutcome {
        if !self.enabled || self.shared.state().shutdown {
            return FlushOutcome::default();
        }
        self.shared.flush()
    }

    /// Stop the worker and run one last flush. Later calls do nothing.
    pub fn shutdown(&self) -> FlushOutcome {
        let handle = {
            let mut state = self.shared.state();
            if state.shutdown {
                return FlushOutcome::default();
            }
            state.shutdown = true;
            state.deadline = None;
            self.shared.wake.notify_all();
            self.worker
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(target: "cespiti", event = "autosave_worker_panicked");
            }
        }

        if !self.enabled {
            return FlushOutcome::default();
        }
        let outcome = self.shared.flush();
        info!(
            target: "cespiti",
            event = "autosave_stopped",
            saved = outcome.saved,
            failed = outcome.failed.len()
        );
        outcome
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
