#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::Path;

use cespiti_lib::sheet::AssetSheet;
use cespiti_lib::store::SheetStore;
use serde_json::Value;
use tempfile::tempdir;

fn json_lines(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .expect("read application.log")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("json log line"))
        .collect()
}

fn events(lines: &[Value]) -> Vec<&str> {
    lines.iter().filter_map(|v| v["event"].as_str()).collect()
}

#[test]
fn store_operations_land_in_application_log() {
    cespiti_lib::init_logging();
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("data");

    tracing::info!(target: "cespiti", event = "before_sink_attached");

    let log_path = cespiti_lib::init_file_logging(&data_dir).expect("attach file sink");
    assert_eq!(log_path, data_dir.join("application.log"));

    let store = SheetStore::open(&data_dir).unwrap();
    let mut sheet = AssetSheet::create_new("Cespiti sala server");
    store.save(&mut sheet).unwrap();
    store.delete(&mut sheet).unwrap();
    store.delete(&mut sheet).unwrap();
    cespiti_lib::flush_file_logs();

    tracing::info!(target: "cespiti", event = "after_sink_detached");

    let lines = json_lines(&log_path);
    let seen = events(&lines);
    assert_eq!(seen.first(), Some(&"file_logging_started"));
    assert!(seen.contains(&"sheet_saved"));
    assert!(seen.contains(&"sheet_deleted"));
    assert!(!seen.contains(&"before_sink_attached"));
    assert!(!seen.contains(&"after_sink_detached"));

    for line in &lines {
        assert_eq!(line["target"], "cespiti");
        let stamp = line["timestamp"].as_str().expect("timestamp");
        assert!(stamp.ends_with('Z'), "utc timestamp expected: {stamp}");
    }

    let saved = lines
        .iter()
        .find(|l| l["event"] == "sheet_saved")
        .expect("save line");
    assert_eq!(saved["level"], "INFO");
    assert_eq!(saved["header"], "Cespiti sala server");

    let missing = lines
        .iter()
        .find(|l| l["event"] == "sheet_delete_missing")
        .expect("second delete warns");
    assert_eq!(missing["level"], "WARN");

    let started = &lines[0];
    assert_eq!(started["version"], env!("CARGO_PKG_VERSION"));
    assert!(started["commit"].is_string());
}
