use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::events::{CoreEvent, SharedSink};
use crate::sheet::AssetSheet;
use crate::store::SheetStore;

/// One matching cell. Results are recomputed on every search; the row index
/// is only meaningful for the document shape at search time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub file_name: String,
    pub header: String,
    pub is_archived: bool,
    pub row_index: usize,
    pub column: String,
    pub value: String,
}

impl SearchResult {
    /// Current value of the matched cell in `sheet`, or `None` when `sheet`
    /// is a different document or no longer has that row or column.
    pub fn resolve<'a>(&self, sheet: &'a AssetSheet) -> Option<&'a str> {
        if sheet.file_name() != self.file_name || sheet.is_archived() != self.is_archived {
            return None;
        }
        let row = sheet.rows.get(self.row_index)?;
        let column = sheet.find_column(&self.column)?;
        Some(row.get(column))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Moved(SearchResult),
    NoMoreResults,
    NoResults,
}

pub struct SearchManager {
    store: Arc<SheetStore>,
    sink: SharedSink,
    results: Vec<SearchResult>,
    current: Option<usize>,
}

impl SearchManager {
    pub fn new(store: Arc<SheetStore>, sink: SharedSink) -> Self {
        Self {
            store,
            sink,
            results: Vec::new(),
            current: None,
        }
    }

    /// Scan every record of every loaded document for `text`.
    ///
    /// A blank query clears the results. Matches are ordered by document load
    /// order, then row, then column.
    pub fn search(&mut self, text: &str, include_archived: bool, match_case: bool) -> &[SearchResult] {
        self.results.clear();
        self.current = None;

        if text.trim().is_empty() {
            self.sink.emit(CoreEvent::SearchCompleted { count: 0 });
            return &self.results;
        }

        let sheets = self.store.load_all(include_archived);
        self.results = find_matches(&sheets, text, match_case);

        info!(
            target: "cespiti",
            event = "search_completed",
            include_archived,
            match_case,
            results = self.results.len()
        );

        if let Some(first) = self.results.first() {
            self.current = Some(0);
            self.sink.emit(CoreEvent::Navigated {
                index: 0,
                result: first.clone(),
            });
        }
        self.sink.emit(CoreEvent::SearchCompleted {
            count: self.results.len(),
        });
        &self.results
    }

    pub fn navigate_next(&mut self) -> Navigation {
        if self.results.is_empty() {
            return Navigation::NoResults;
        }
        let next = self.current.map_or(0, |i| i + 1);
        let Some(result) = self.results.get(next).cloned() else {
            return Navigation::NoMoreResults;
        };
        self.current = Some(next);
        self.sink.emit(CoreEvent::Navigated {
            index: next,
            result: result.clone(),
        });
        Navigation::Moved(result)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&SearchResult> {
        self.current.and_then(|i| self.results.get(i))
    }

    pub fn total_results(&self) -> usize {
        self.results.len()
    }

    pub fn has_results(&self) -> bool {
        !self.results.is_empty()
    }

    pub fn results(&self) -> &[SearchResult] {
        &self.results
    }
}

pub fn find_matches(sheets: &[AssetSheet], text: &str, match_case: bool) -> Vec<SearchResult> {
    let needle = if match_case {
        text.to_string()
    } else {
        text.to_lowercase()
    };

    let mut results = Vec::new();
    for sheet in sheets {
        for (row_index, row) in sheet.rows.iter().enumerate() {
            for column in &sheet.columns {
                let value = row.get(column);
                let hit = if match_case {
                    value.contains(&needle)
                } else {
                    value.to_lowercase().contains(&needle)
                };
                if hit {
                    results.push(SearchResult {
                        file_name: sheet.file_name().to_string(),
                        header: sheet.header().to_string(),
                        is_archived: sheet.is_archived(),
                        row_index,
                        column: column.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }
    }
    results
}
