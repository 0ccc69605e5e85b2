//! On-disk sheet format and the normalization passes applied on load.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::sheet::{column_eq, Asset, AssetSheet};

pub const LEGACY_INVENTORY_COLUMN: &str = "Rif inv biofer";
pub const INVENTORY_COLUMN: &str = "Rif inventario";

/// A record as it may appear on disk: either a flat map or the older
/// `{"Values": {...}}` wrapper. `null` values read as empty strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawAsset {
    Wrapped(WrappedAsset),
    Flat(BTreeMap<String, Option<String>>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct WrappedAsset {
    #[serde(rename = "Values")]
    values: Option<BTreeMap<String, Option<String>>>,
}

impl RawAsset {
    fn into_asset(self) -> Asset {
        let values = match self {
            RawAsset::Wrapped(wrapped) => wrapped.values.unwrap_or_default(),
            RawAsset::Flat(values) => values,
        };
        Asset::from_values(
            values
                .into_iter()
                .map(|(k, v)| (k, v.unwrap_or_default()))
                .collect(),
        )
    }
}

/// Sheet file as read. `FileName`/`IsArchived` from older files are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct RawSheet {
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub rows: Option<Vec<Option<RawAsset>>>,
}

/// Sheet file as written.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SheetDocument<'a> {
    pub header: &'a str,
    pub columns: &'a [String],
    pub rows: &'a [Asset],
}

impl<'a> From<&'a AssetSheet> for SheetDocument<'a> {
    fn from(sheet: &'a AssetSheet) -> Self {
        Self {
            header: sheet.header(),
            columns: &sheet.columns,
            rows: &sheet.rows,
        }
    }
}

/// Drop `null` record entries. Returns the surviving records and how many
/// were dropped.
pub(crate) fn drop_null_rows(rows: Vec<Option<RawAsset>>) -> (Vec<Asset>, usize) {
    let total = rows.len();
    let kept: Vec<Asset> = rows
        .into_iter()
        .flatten()
        .map(RawAsset::into_asset)
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Rename the legacy inventory column to its current name, merging record
/// values when both exist. The current value wins; an empty or missing current
/// value is filled from the legacy one. Returns whether anything changed.
pub fn migrate_legacy_column(sheet: &mut AssetSheet) -> bool {
    let has_legacy = sheet
        .columns
        .iter()
        .any(|c| column_eq(c, LEGACY_INVENTORY_COLUMN));
    if !has_legacy {
        return false;
    }

    let has_current = sheet.columns.iter().any(|c| column_eq(c, INVENTORY_COLUMN));
    if has_current {
        sheet
            .columns
            .retain(|c| !column_eq(c, LEGACY_INVENTORY_COLUMN));
    } else {
        for column in sheet.columns.iter_mut() {
            if column_eq(column, LEGACY_INVENTORY_COLUMN) {
                *column = INVENTORY_COLUMN.to_string();
            }
        }
    }

    for row in &mut sheet.rows {
        let legacy_keys: Vec<String> = row
            .values()
            .keys()
            .filter(|k| column_eq(k, LEGACY_INVENTORY_COLUMN))
            .cloned()
            .collect();
        for key in legacy_keys {
            let Some(legacy_value) = row.remove(&key) else {
                continue;
            };
            if row.get(INVENTORY_COLUMN).is_empty() && !legacy_value.is_empty() {
                row.set(INVENTORY_COLUMN, legacy_value);
            } else if !row.contains(INVENTORY_COLUMN) {
                row.set(INVENTORY_COLUMN, legacy_value);
            }
        }
    }
    true
}

/// Drop columns whose name already appeared earlier (case-insensitively).
/// Record values are only removed when no surviving column still carries
/// the name. Returns the removed column names.
pub fn remove_duplicate_columns(sheet: &mut AssetSheet) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(sheet.columns.len());
    let mut removed = Vec::new();
    for column in sheet.columns.drain(..) {
        if seen.insert(column.to_lowercase()) {
            kept.push(column);
        } else {
            removed.push(column);
        }
    }
    sheet.columns = kept;

    for column in &removed {
        let still_present = sheet.columns.iter().any(|c| column_eq(c, column));
        if still_present {
            continue;
        }
        for row in &mut sheet.rows {
            row.remove(column);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sheet_with(columns: &[&str], rows: Vec<Vec<(&str, &str)>>) -> AssetSheet {
        let mut sheet = AssetSheet::default();
        sheet.columns = columns.iter().map(|c| c.to_string()).collect();
        sheet.rows = rows
            .into_iter()
            .map(|pairs| {
                let mut asset = Asset::new();
                for (k, v) in pairs {
                    asset.set(k, v);
                }
                asset
            })
            .collect();
        sheet
    }

    #[test]
    fn flat_and_wrapped_rows_both_parse() {
        let raw: RawSheet = serde_json::from_str(
            r#"{"Header":"h","Columns":["Marca"],"Rows":[{"Marca":"HP"},{"Values":{"Marca":"Dell"}},null,{"Marca":null}]}"#,
        )
        .unwrap();
        let (rows, dropped) = drop_null_rows(raw.rows.unwrap());
        assert_eq!(dropped, 1);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("Marca"), "HP");
        assert_eq!(rows[1].get("Marca"), "Dell");
        assert_eq!(rows[2].get("Marca"), "");
    }

    #[test]
    fn flat_row_with_values_column_is_not_mistaken_for_wrapper() {
        let raw: RawSheet = serde_json::from_str(
            r#"{"Columns":["Values"],"Rows":[{"Values":"42","Other":"x"}]}"#,
        )
        .unwrap();
        let (rows, _) = drop_null_rows(raw.rows.unwrap());
        assert_eq!(rows[0].get("Values"), "42");
        assert_eq!(rows[0].get("Other"), "x");
    }

    #[test]
    fn legacy_column_renamed_when_current_absent() {
        let mut sheet = sheet_with(
            &["Marca", "Rif inv biofer"],
            vec![vec![("Rif inv biofer", "INV-1")]],
        );
        assert!(migrate_legacy_column(&mut sheet));
        assert_eq!(sheet.columns, vec!["Marca", "Rif inventario"]);
        assert_eq!(sheet.rows[0].get("Rif inventario"), "INV-1");
        assert!(!sheet.rows[0].contains("Rif inv biofer"));
    }

    #[test]
    fn legacy_values_merge_current_wins() {
        let mut sheet = sheet_with(
            &["Rif inventario", "Rif inv biofer"],
            vec![
                vec![("Rif inventario", "NEW"), ("Rif inv biofer", "OLD")],
                vec![("Rif inv biofer", "ONLY-OLD")],
                vec![("Rif inventario", ""), ("Rif inv biofer", "GAP")],
            ],
        );
        migrate_legacy_column(&mut sheet);
        assert_eq!(sheet.columns, vec!["Rif inventario"]);
        assert_eq!(sheet.rows[0].get("Rif inventario"), "NEW");
        assert_eq!(sheet.rows[1].get("Rif inventario"), "ONLY-OLD");
        assert_eq!(sheet.rows[2].get("Rif inventario"), "GAP");
        assert!(sheet.rows.iter().all(|r| !r.contains("Rif inv biofer")));
    }

    #[test]
    fn duplicate_columns_keep_first_and_values() {
        let mut sheet = sheet_with(
            &["Marca", "MARCA", "Modello", "marca"],
            vec![vec![("Marca", "HP"), ("Modello", "X1")]],
        );
        let removed = remove_duplicate_columns(&mut sheet);
        assert_eq!(removed, vec!["MARCA", "marca"]);
        assert_eq!(sheet.columns, vec!["Marca", "Modello"]);
        assert_eq!(sheet.rows[0].get("Marca"), "HP");
    }

    fn column_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("Marca".to_string()),
            Just("marca".to_string()),
            Just("Rif inventario".to_string()),
            Just("Rif inv biofer".to_string()),
            Just("RIF INV BIOFER".to_string()),
            "[A-Za-z]{1,6}",
        ]
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(
            columns in proptest::collection::vec(column_name(), 1..8),
            cells in proptest::collection::vec(
                proptest::collection::vec((column_name(), "[a-z0-9]{0,4}"), 0..5),
                0..4,
            ),
        ) {
            let mut sheet = AssetSheet::default();
            sheet.columns = columns;
            sheet.rows = cells
                .into_iter()
                .map(|pairs| {
                    let mut asset = Asset::new();
                    for (k, v) in pairs {
                        asset.set(k, v);
                    }
                    asset
                })
                .collect();

            migrate_legacy_column(&mut sheet);
            remove_duplicate_columns(&mut sheet);
            let once = sheet.clone();

            migrate_legacy_column(&mut sheet);
            remove_duplicate_columns(&mut sheet);
            prop_assert_eq!(once, sheet);
        }
    }
}
