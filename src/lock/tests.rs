use super::*;
use tempfile::tempdir;

fn identity(user: &str, pid: &str) -> LockIdentity {
    LockIdentity {
        user_name: user.to_string(),
        host_name: "test-host".to_string(),
        process_id: pid.to_string(),
    }
}

fn service(dir: &Path, ident: LockIdentity) -> LockService {
    LockService::new(&dir.join("config"))
        .expect("lock service")
        .with_identity(ident)
        .with_retry_policy(3, Duration::from_millis(5))
}

fn own_pid() -> String {
    std::process::id().to_string()
}

#[test]
fn acquire_writes_pascal_case_record() {
    let dir = tempdir().expect("tempdir");
    let lock = service(dir.path(), identity("mario", &own_pid()));
    assert!(lock.try_acquire());
    assert!(lock.is_own_lock());

    let text = fs::read_to_string(lock.lock_path()).expect("lock file");
    let value: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(value["UserName"], "mario");
    assert_eq!(value["HostName"], "test-host");
    assert_eq!(value["ProcessId"], own_pid());
    assert!(value["LockTime"].is_string());
}

#[test]
fn second_instance_is_refused_while_holder_lives() {
    let dir = tempdir().expect("tempdir");
    let first = service(dir.path(), identity("mario", &own_pid()));
    // Same live pid, different user: looks like another running instance.
    let second = service(dir.path(), identity("luigi", &own_pid()));

    assert!(first.try_acquire());
    assert!(!second.try_acquire());
    assert!(first.is_own_lock());
    assert!(!second.is_own_lock());
    assert_eq!(second.current_lock().expect("holder").user_name, "mario");
}

#[test]
fn stale_lock_from_dead_process_is_replaced() {
    let dir = tempdir().expect("tempdir");
    let dead = service(dir.path(), identity("ghost", &u32::MAX.to_string()));
    assert!(dead.try_acquire());

    let alive = service(dir.path(), identity("mario", &own_pid()));
    assert!(alive.try_acquire());
    assert!(alive.is_own_lock());
    assert!(!dead.is_own_lock());
}

#[test]
fn stale_lock_with_blank_pid_is_replaced() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("config");
    fs::create_dir_all(&config).unwrap();
    fs::write(
        config.join(LOCK_FILE_NAME),
        r#"{"UserName":"x","HostName":"y","LockTime":"2024-01-01T10:00:00+01:00","ProcessId":""}"#,
    )
    .unwrap();

    let lock = service(dir.path(), identity("mario", &own_pid()));
    assert!(lock.try_acquire());
}

#[test]
fn malformed_lock_is_not_overwritten() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("config");
    fs::create_dir_all(&config).unwrap();
    fs::write(config.join(LOCK_FILE_NAME), "{ not json").unwrap();

    let lock = service(dir.path(), identity("mario", &own_pid()));
    assert!(lock.current_lock().is_none());
    assert!(!lock.try_acquire());
    assert_eq!(
        fs::read_to_string(config.join(LOCK_FILE_NAME)).unwrap(),
        "{ not json"
    );
}

#[test]
fn empty_lock_reads_as_none() {
    let dir = tempdir().expect("tempdir");
    let lock = service(dir.path(), identity("mario", &own_pid()));
    assert!(lock.current_lock().is_none());
    fs::write(lock.lock_path(), "   ").unwrap();
    assert!(lock.current_lock().is_none());
    assert!(!lock.is_own_lock());
}

#[test]
fn release_only_removes_own_lock() {
    let dir = tempdir().expect("tempdir");
    let owner = service(dir.path(), identity("mario", &own_pid()));
    let other = service(dir.path(), identity("luigi", "1"));
    assert!(owner.try_acquire());

    other.release();
    assert!(owner.lock_path().exists());

    owner.release();
    assert!(!owner.lock_path().exists());

    // Releasing again is a logged no-op.
    owner.release();
}

#[test]
fn release_then_reacquire_by_another_instance() {
    let dir = tempdir().expect("tempdir");
    let first = service(dir.path(), identity("mario", &own_pid()));
    let second = service(dir.path(), identity("luigi", &own_pid()));

    assert!(first.try_acquire());
    first.release();
    assert!(second.try_acquire());
    assert!(second.is_own_lock());
}

#[test]
fn concurrent_acquirers_have_a_single_winner() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    let handles: Vec<_> = (0..8)
        .map(|n| {
            let root = root.clone();
            std::thread::spawn(move || {
                service(&root, identity(&format!("user{n}"), &own_pid())).try_acquire()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().expect("join"))
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn holder_formats_identity() {
    let lock = AppLock {
        user_name: "mario".into(),
        host_name: "pc01".into(),
        process_id: "42".into(),
        ..AppLock::default()
    };
    assert_eq!(lock.holder(), "mario@pc01 (PID 42)");
}

#[test]
fn clear_stale_only_removes_dead_holders() {
    let dir = tempdir().expect("tempdir");
    let holder = service(dir.path(), identity("mario", &own_pid()));
    assert!(holder.try_acquire());

    let admin = service(dir.path(), identity("admin", "1"));
    assert!(!admin.clear_stale().expect("clear"));
    assert!(holder.is_own_lock());

    let dead = service(dir.path(), identity("ghost", &u32::MAX.to_string()));
    fs::remove_file(holder.lock_path()).expect("remove");
    assert!(dead.try_acquire());
    assert!(admin.clear_stale().expect("clear"));
    assert!(!admin.lock_path().exists());
    assert!(!admin.clear_stale().expect("nothing left"));
}
