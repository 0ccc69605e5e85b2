use super::*;
use crate::error::{ERR_PERSISTENCE, ERR_READ_ONLY, ERR_SECURITY_VIOLATION};
use crate::sheet::Asset;
use tempfile::tempdir;

fn store_in(dir: &Path) -> SheetStore {
    SheetStore::open(&dir.join("data")).expect("open store")
}

fn sample_sheet(header: &str) -> AssetSheet {
    let mut sheet = AssetSheet::create_new(header);
    let row = sheet.add_row();
    sheet.set_cell(row, "Marca", "HP").expect("set marca");
    sheet.set_cell(row, "Seriale", "SN-001").expect("set seriale");
    sheet
}

#[test]
fn open_creates_active_and_archived_roots() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    assert!(store.active_root().is_dir());
    assert!(store.archived_root().is_dir());
    assert_eq!(store.archived_root(), store.active_root().join("archived"));
}

#[test]
fn save_assigns_file_name_and_reloads() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Dismissioni 2024!");

    store.save(&mut sheet).expect("save");
    assert!(sheet.file_name().starts_with("Dismissioni_2024_"));
    assert!(sheet.file_name().ends_with(".json"));
    assert!(store.active_root().join(sheet.file_name()).is_file());

    let loaded = store.load_all(false);
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0], sheet);
}

#[test]
fn saved_rows_are_flat_objects() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Flat");
    store.save(&mut sheet).expect("save");

    let text = fs::read_to_string(store.active_root().join(sheet.file_name())).expect("read");
    let value: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(value["Header"], "Flat");
    assert_eq!(value["Columns"][0], "Tipo asset");
    assert_eq!(value["Rows"][0]["Marca"], "HP");
    assert!(value["Rows"][0].get("Values").is_none());
    assert!(value.get("FileName").is_none());
}

#[test]
fn second_save_overwrites_without_leftovers() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Magazzino");
    store.save(&mut sheet).expect("first save");
    let first_name = sheet.file_name().to_string();

    sheet.set_cell(0, "Marca", "Lenovo").expect("edit");
    store.save(&mut sheet).expect("second save");
    assert_eq!(sheet.file_name(), first_name);

    let names: Vec<String> = fs::read_dir(store.active_root())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec![first_name]);
    assert_eq!(store.load_all(false)[0].rows[0].get("Marca"), "Lenovo");
}

#[test]
fn same_header_saved_twice_gets_distinct_files() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut a = sample_sheet("Gemello");
    let mut b = sample_sheet("Gemello");
    store.save(&mut a).expect("save a");
    store.save(&mut b).expect("save b");
    assert_ne!(a.file_name(), b.file_name());
    assert_eq!(store.load_all(false).len(), 2);
}

#[test]
fn failed_write_keeps_existing_content() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Bloccato");
    store.save(&mut sheet).expect("save");
    let path = store.active_root().join(sheet.file_name());
    let before = fs::read(&path).expect("read before");

    // A directory where the temp file should go makes staging fail.
    fs::create_dir(atomic::sibling(&path, atomic::TEMP_SUFFIX)).expect("block temp");
    sheet.set_cell(0, "Marca", "Dell").expect("edit");
    let err = store.save(&mut sheet).expect_err("save must fail");

    assert_eq!(err.code(), ERR_PERSISTENCE);
    assert_eq!(fs::read(&path).expect("read after"), before);
}

#[test]
fn load_skips_unreadable_files_and_sorts_by_name() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let root = store.active_root();
    fs::write(root.join("b.json"), r#"{"Header":"B","Columns":["X"],"Rows":[]}"#).unwrap();
    fs::write(root.join("a.json"), r#"{"Header":"A","Columns":["X"],"Rows":[]}"#).unwrap();
    fs::write(root.join("empty.json"), "  \n").unwrap();
    fs::write(root.join("broken.json"), "{not json").unwrap();
    fs::write(root.join("nocolumns.json"), r#"{"Header":"N","Rows":[]}"#).unwrap();
    fs::write(root.join("notes.txt"), "ignored").unwrap();

    let loaded = store.load_all(false);
    let headers: Vec<&str> = loaded.iter().map(|s| s.header()).collect();
    assert_eq!(headers, vec!["A", "B"]);
    assert_eq!(loaded[0].file_name(), "a.json");
}

#[test]
fn load_normalizes_legacy_content() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    fs::write(
        store.active_root().join("legacy.json"),
        r#"{
            "Header": "",
            "Columns": ["Marca", "Rif inv biofer", "MARCA"],
            "Rows": [null, {"Values": {"Marca": "HP", "Rif inv biofer": "INV-9"}}]
        }"#,
    )
    .unwrap();
    fs::write(
        store.active_root().join("norows.json"),
        r#"{"Header":"Senza righe","Columns":["Marca"]}"#,
    )
    .unwrap();

    let loaded = store.load_all(false);
    assert_eq!(loaded.len(), 2);
    let legacy = &loaded[0];
    assert_eq!(legacy.header(), crate::sheet::DEFAULT_HEADER);
    assert_eq!(legacy.columns, vec!["Marca", "Rif inventario"]);
    assert_eq!(legacy.rows.len(), 1);
    assert_eq!(legacy.rows[0].get("Rif inventario"), "INV-9");
    assert!(loaded[1].rows.is_empty());
}

#[test]
fn archived_sheets_only_when_requested() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut active = sample_sheet("Attivo");
    let mut old = sample_sheet("Vecchio");
    store.save(&mut active).expect("save active");
    store.save(&mut old).expect("save old");
    store.archive(&mut old).expect("archive");

    assert_eq!(store.load_all(false).len(), 1);
    let all = store.load_all(true);
    assert_eq!(all.len(), 2);
    assert!(!all[0].is_archived());
    assert!(all[1].is_archived());
    assert_eq!(all[1].header(), "Vecchio");
}

#[test]
fn archive_and_unarchive_resolve_name_collisions() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Rotto");
    store.save(&mut sheet).expect("save");
    let original = sheet.file_name().to_string();
    let stem = original.trim_end_matches(".json").to_string();

    fs::write(store.archived_root().join(&original), "{}").unwrap();
    store.archive(&mut sheet).expect("archive");
    assert!(sheet.is_archived());
    assert_eq!(sheet.file_name(), format!("{stem}_1.json"));
    assert!(!store.active_root().join(&original).exists());
    assert!(store.archived_root().join(sheet.file_name()).is_file());

    store.unarchive(&mut sheet).expect("unarchive");
    assert!(!sheet.is_archived());
    assert_eq!(sheet.file_name(), format!("{stem}_1.json"));
    assert!(store.active_root().join(sheet.file_name()).is_file());
}

#[test]
fn archive_with_missing_source_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Sparito");
    store.save(&mut sheet).expect("save");
    fs::remove_file(store.active_root().join(sheet.file_name())).unwrap();

    store.archive(&mut sheet).expect("archive");
    assert!(!sheet.is_archived());
}

#[test]
fn unique_destination_gives_up_after_limit() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("pieno.json"), "").unwrap();
    for n in 1..=MAX_COLLISION_ATTEMPTS {
        fs::write(dir.path().join(format!("pieno_{n}.json")), "").unwrap();
    }
    let err = unique_destination(dir.path(), "pieno.json").expect_err("exhausted");
    assert_eq!(err.code(), ERR_TOO_MANY_COLLISIONS);
}

#[test]
fn delete_removes_file_and_tolerates_missing() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Da eliminare");
    store.save(&mut sheet).expect("save");
    let path = store.active_root().join(sheet.file_name());

    store.delete(&mut sheet).expect("delete");
    assert!(!path.exists());
    assert!(sheet.is_deleted());
    store.delete(&mut sheet).expect("delete again");
    store.delete(&mut AssetSheet::create_new("mai salvato")).expect("unsaved");
}

#[test]
fn deleted_sheet_is_never_written_back() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Rottamato");
    store.save(&mut sheet).expect("save");
    let path = store.active_root().join(sheet.file_name());

    store.delete(&mut sheet).expect("delete");
    sheet.add_row();
    let err = store.save(&mut sheet).expect_err("save after delete");
    assert_eq!(err.code(), ERR_SHEET_DELETED);
    assert!(!path.exists());
    assert!(store.load_all(true).is_empty());
}

#[test]
fn traversal_file_name_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Evasione");
    sheet.file_name = "../../evil.json".into();

    let err = store.save(&mut sheet).expect_err("traversal");
    assert_eq!(err.code(), ERR_SECURITY_VIOLATION);
    assert!(!dir.path().join("evil.json").exists());
}

#[test]
fn read_only_store_rejects_mutations() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Protetto");
    store.save(&mut sheet).expect("save");

    store.set_read_only(true);
    assert_eq!(store.save(&mut sheet).unwrap_err().code(), ERR_READ_ONLY);
    assert_eq!(store.delete(&mut sheet).unwrap_err().code(), ERR_READ_ONLY);
    assert!(!sheet.is_deleted());
    assert_eq!(store.archive(&mut sheet).unwrap_err().code(), ERR_READ_ONLY);
    assert_eq!(store.load_all(false).len(), 1);
}

#[test]
fn safe_stem_strips_and_caps() {
    let stem = generate_safe_stem("  PC / ufficio: 3°piano  ");
    assert!(stem.starts_with("PC_ufficio_3piano_"), "{stem}");

    let long = generate_safe_stem(&"a".repeat(80));
    let slug = long.rsplit_once('_').map(|(s, _)| s).unwrap_or_default();
    assert_eq!(slug.len(), 50);

    assert!(generate_safe_stem("???").starts_with("foglio_"));
}

#[test]
fn load_one_reads_by_name() {
    let dir = tempdir().expect("tempdir");
    let store = store_in(dir.path());
    let mut sheet = sample_sheet("Singolo");
    sheet.rows.push(Asset::new());
    store.save(&mut sheet).expect("save");

    let loaded = store.load_one(sheet.file_name(), false).expect("load one");
    assert_eq!(loaded.rows.len(), 2);
    assert!(store.load_one("../x.json", false).is_err());
}

#[test]
fn move_refuses_to_replace_an_existing_destination() {
    let dir = tempdir().expect("tempdir");
    let source = dir.path().join("a.json");
    let dest = dir.path().join("b.json");
    fs::write(&source, "nuovo").unwrap();
    fs::write(&dest, "esistente").unwrap();

    let err = move_no_clobber(&source, &dest).expect_err("must not clobber");
    assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    assert_eq!(fs::read_to_string(&source).unwrap(), "nuovo");
    assert_eq!(fs::read_to_string(&dest).unwrap(), "esistente");

    let free = dir.path().join("c.json");
    move_no_clobber(&source, &free).expect("move");
    assert!(!source.exists());
    assert_eq!(fs::read_to_string(&free).unwrap(), "nuovo");
}
