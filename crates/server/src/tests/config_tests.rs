use super::{load_settings_from, normalize_database_url, prepare_database_url, Settings};

use std::{
    collections::HashMap,
    env, fs,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_root(label: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("registry_server_{label}_{suffix}"))
}

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:data/test.db"),
        "sqlite://data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let root = temp_root("prepare");
    let db_path = root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(root.join("data").exists());

    fs::remove_dir_all(root).expect("cleanup");
}

#[test]
fn missing_file_and_env_yield_defaults() {
    let settings =
        load_settings_from(Path::new("/nonexistent/registry.toml"), no_env).expect("settings");
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.aggregate_config().child_age_threshold, 18);
    assert_eq!(settings.flush_interval_secs, 15);
}

#[test]
fn env_overrides_file_values() {
    let root = temp_root("layers");
    fs::create_dir_all(&root).expect("root");
    let file = root.join("registry.toml");
    fs::write(
        &file,
        "bind_addr = \"0.0.0.0:9000\"\nretirement_age = 62\ndatabase_url = \"sqlite://file.db\"\n",
    )
    .expect("write");

    let env: HashMap<&str, &str> = HashMap::from([
        ("APP__DATABASE_URL", "sqlite://env.db"),
        ("DATABASE_URL", "sqlite://ignored.db"),
        ("APP__CHILD_AGE_THRESHOLD", "16"),
        ("APP__FLUSH_INTERVAL_SECS", "not-a-number"),
    ]);
    let settings =
        load_settings_from(&file, |name| env.get(name).map(|v| v.to_string())).expect("settings");

    assert_eq!(settings.bind_addr, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite://env.db");
    assert_eq!(settings.retirement_age, 62);
    assert_eq!(settings.child_age_threshold, 16);
    assert_eq!(settings.flush_interval_secs, 15);

    fs::remove_dir_all(root).expect("cleanup");
}

#[test]
fn inverted_age_thresholds_are_rejected() {
    let env = |name: &str| (name == "APP__CHILD_AGE_THRESHOLD").then(|| "70".to_string());
    assert!(load_settings_from(Path::new("/nonexistent/registry.toml"), env).is_err());
}

#[test]
fn zero_flush_interval_is_rejected() {
    let env = |name: &str| (name == "APP__FLUSH_INTERVAL_SECS").then(|| "0".to_string());
    assert!(load_settings_from(Path::new("/nonexistent/registry.toml"), env).is_err());
}

#[test]
fn retired_retry_setting_is_an_unknown_key() {
    let root = temp_root("retired");
    fs::create_dir_all(&root).expect("root");
    let file = root.join("registry.toml");
    fs::write(&file, "max_commit_retries = 3\n").expect("write");

    assert!(load_settings_from(&file, no_env).is_err());

    fs::remove_dir_all(root).expect("cleanup");
}

#[test]
fn database_paths_come_from_storage() {
    let url = normalize_database_url("./data/registry.db");
    assert_eq!(
        storage::sqlite_path(&url),
        Some(std::path::PathBuf::from("./data/registry.db"))
    );
    assert_eq!(storage::sqlite_path(&normalize_database_url("sqlite::memory:")), None);
}

#[test]
fn unknown_file_keys_are_rejected() {
    let root = temp_root("unknown");
    fs::create_dir_all(&root).expect("root");
    let file = root.join("registry.toml");
    fs::write(&file, "session_secret = \"hunter2\"\n").expect("write");

    assert!(load_settings_from(&file, no_env).is_err());

    fs::remove_dir_all(root).expect("cleanup");
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let root = temp_root("open");
    let db_path = root.join("nested").join("registry.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(root).expect("cleanup");
}
