use bytes::Bytes;
use pacsnode::config::Config;
use pacsnode::storage::{create_payload_store, StorageConfig};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_storage_configuration_parsing() {
    let toml = r#"
        [node]
        id = "test"

        [storage]
        backend = "filesystem"

        [storage.options]
        path = "./tmp/test"

        [capabilities.VERIFY]
        encodings = ["RAW"]
        handler = "echo"
    "#;

    let config = Config::from_toml_str(toml).expect("Config validation failed");

    assert_eq!(config.storage.backend, "filesystem");
    let path = config
        .storage
        .options
        .get("path")
        .unwrap()
        .as_str()
        .unwrap();
    assert_eq!(path, "./tmp/test");
}

#[test]
fn test_storage_defaults_when_section_missing() {
    let toml = r#"
        [node]
        id = "test"

        [capabilities.VERIFY]
        encodings = ["RAW"]
        handler = "echo"
    "#;

    let config = Config::from_toml_str(toml).expect("Config validation failed");
    assert_eq!(config.storage.backend, "filesystem");
    assert_eq!(
        config.storage.options.get("path").and_then(|v| v.as_str()),
        Some("./data")
    );
}

#[test]
fn test_unknown_backend_fails_validation() {
    let toml = r#"
        [node]
        id = "test"

        [storage]
        backend = "tape-robot"

        [capabilities.VERIFY]
        encodings = ["RAW"]
        handler = "echo"
    "#;

    assert_err!(Config::from_toml_str(toml));
}

#[tokio::test]
async fn test_store_created_from_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path().join("payloads");

    let mut config = StorageConfig::default();
    config.options.insert(
        "path".to_string(),
        serde_json::Value::String(root.to_string_lossy().into_owned()),
    );

    let store = create_payload_store(&config).expect("Failed to create payload store");
    assert_eq!(store.base_path(), root.as_path());

    let written = assert_ok!(store.store("1.2.3", Bytes::from_static(b"payload")).await);
    assert!(written.starts_with(&root));
    assert!(store.contains("1.2.3"));
    assert_eq!(assert_ok!(store.load("1.2.3").await), b"payload");
}
