#![cfg(test)]

use crate::config::config::{Config, ConfigError};

const BASIC: &str = r#"
    [node]
    id = "archive-1"
    log_level = "debug"

    [listener]
    local_entity = "ARCHIVE"
    port = 11112
    max_associations = 8

    [capabilities.VERIFY]
    encodings = ["RAW"]
    handler = "echo"

    [capabilities.STORE]
    encodings = ["COMPRESSED", "RAW"]
    mandatory = true
    handler = "store"

    [capabilities.NOTIFY]
    encodings = ["RAW"]
    handler = "notify"

    [storage]
    backend = "filesystem"
    [storage.options]
    path = "/tmp/pacsnode"

    [locations.nearline]
    path = "/srv/nearline"

    [remotes.scanner]
    entity = "SCANNER"
    host = "10.0.0.5"
    port = 104
"#;

#[test]
fn test_basic_config() {
    let config = Config::from_toml_str(BASIC).expect("configuration should parse and validate");

    assert_eq!(config.node.id, "archive-1");
    assert_eq!(config.node.log_level, "debug");
    assert_eq!(config.listener.local_entity, "ARCHIVE");
    assert_eq!(config.listener.max_associations, 8);
    assert_eq!(config.capabilities.len(), 3);
    assert_eq!(config.capabilities["STORE"].encodings, vec!["COMPRESSED", "RAW"]);
    assert!(config.capabilities["STORE"].mandatory);
    assert_eq!(config.locations["nearline"].path.to_str(), Some("/srv/nearline"));
    assert_eq!(config.remote("scanner").unwrap().port, 104);
    assert!(!config.logging.log_to_file);
}

#[test]
fn test_policy_follows_capabilities() {
    let config = Config::from_toml_str(BASIC).unwrap();
    let policy = config.acceptance_policy();

    let store = policy.capability("STORE").expect("STORE is accepted");
    assert_eq!(store.encodings, vec!["COMPRESSED", "RAW"]);
    assert!(store.mandatory);
    assert!(policy.capability("FIND").is_none());
}

#[test]
fn test_missing_node_section_fails_to_parse() {
    let err = Config::from_toml_str("[listener]\nlocal_entity = \"A\"").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_unknown_handler_is_rejected() {
    let toml = r#"
        [node]
        id = "n"

        [capabilities.FIND]
        encodings = ["RAW"]
        handler = "query"
    "#;
    let err = Config::from_toml_str(toml).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownHandler { ref handler, .. } if handler == "query"));
}

#[test]
fn test_capabilities_are_required() {
    let err = Config::from_toml_str("[node]\nid = \"n\"").unwrap_err();
    assert!(matches!(err, ConfigError::NoCapabilities));
}

#[test]
fn test_empty_encodings_are_rejected() {
    let toml = r#"
        [node]
        id = "n"

        [capabilities.VERIFY]
        encodings = []
        handler = "echo"
    "#;
    assert!(matches!(
        Config::from_toml_str(toml),
        Err(ConfigError::EmptyEncodings(name)) if name == "VERIFY"
    ));
}

#[test]
fn test_invalid_listener_is_reported() {
    let toml = r#"
        [node]
        id = "n"

        [listener]
        local_entity = "AN_ENTITY_TITLE_THAT_IS_TOO_LONG"

        [capabilities.VERIFY]
        encodings = ["RAW"]
        handler = "echo"
    "#;
    assert!(matches!(Config::from_toml_str(toml), Err(ConfigError::Listener(_))));
}

#[test]
fn test_file_logging_requires_path() {
    let toml = r#"
        [node]
        id = "n"

        [logging]
        log_to_file = true

        [capabilities.VERIFY]
        encodings = ["RAW"]
        handler = "echo"
    "#;
    assert!(matches!(Config::from_toml_str(toml), Err(ConfigError::MissingLogFile)));
}

#[test]
fn test_unknown_remote_lookup() {
    let config = Config::from_toml_str(BASIC).unwrap();
    assert!(matches!(config.remote("nobody"), Err(ConfigError::UnknownRemote(_))));
}
