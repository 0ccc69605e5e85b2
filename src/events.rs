use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::search::SearchResult;

/// Notifications the core pushes to whatever front end is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    SearchCompleted { count: usize },
    Navigated { index: usize, result: SearchResult },
    AutosaveCompleted { saved: usize },
    AutosaveFailed { failed: Vec<String> },
    ReadOnly { holder: Option<String> },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::SearchCompleted { .. } => "search_completed",
            CoreEvent::Navigated { .. } => "navigated",
            CoreEvent::AutosaveCompleted { .. } => "autosave_completed",
            CoreEvent::AutosaveFailed { .. } => "autosave_failed",
            CoreEvent::ReadOnly { .. } => "read_only",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CoreEvent) {}
}

/// Writes each event to the log. Used by the headless binary.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CoreEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(
            target: "cespiti",
            event = "core_event",
            name = event.name(),
            payload = %payload
        );
    }
}

/// Forwards events over an mpsc channel. A hung-up receiver is logged, not fatal.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Mutex<Sender<CoreEvent>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<CoreEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: CoreEvent) {
        let name = event.name();
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = tx.send(event) {
            warn!(
                target: "cespiti",
                event = "core_event_emit_failed",
                name,
                error = %err
            );
        }
    }
}

/// Keeps every event in memory for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn take(&self) -> Vec<CoreEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: CoreEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
