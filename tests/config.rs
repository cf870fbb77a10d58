//! Layered configuration loading.

use std::io::Write;
use std::path::PathBuf;

use skymirror::ClientConfig;
use skymirror::ConfigError;
use skymirror::config::load_server_config;
use skymirror::config::validate_server_config;

fn toml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_toml_file_overrides_defaults() {
    let file = toml_file(
        r#"
        remote_url = "tcp://store.internal:4222"
        leaf_url = "tcp://hub.internal:7422"
        credentials_file = "/etc/skymirror/node.creds"
        connect_timeout_ms = 2500

        [warmup]
        enabled = true
        filter = "flights.>"
        "#,
    );

    let config = ClientConfig::from_toml_file(file.path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.remote_url, "tcp://store.internal:4222");
    assert_eq!(config.leaf_url(), "tcp://hub.internal:7422");
    assert_eq!(config.leaf_credentials_file(), Some(PathBuf::from("/etc/skymirror/node.creds").as_path()));
    assert_eq!(config.connect_timeout_ms, 2500);
    assert_eq!(config.mirror_bucket, "inMemoryFlights");
    assert!(config.warmup.enabled);
    assert_eq!(config.warmup.filter, "flights.>");
    assert_eq!(config.warmup.timeout_ms, 30_000);
}

#[test]
fn test_layers_merge_in_precedence_order() {
    let env_layer = ClientConfig {
        remote_url: "tcp://env:4222".to_string(),
        domain: "hub".to_string(),
        ..ClientConfig::default()
    };
    let file = toml_file("remote_url = \"tcp://file:4222\"\n");
    let cli_layer = ClientConfig {
        leaf_url: Some("tcp://cli:7422".to_string()),
        ..ClientConfig::default()
    };

    let mut config = env_layer;
    config.merge(ClientConfig::from_toml_file(file.path()).unwrap());
    config.merge(cli_layer);

    assert_eq!(config.remote_url, "tcp://file:4222");
    assert_eq!(config.domain, "hub");
    assert_eq!(config.leaf_url(), "tcp://cli:7422");
}

#[test]
fn test_missing_and_malformed_files_are_distinguished() {
    let missing = ClientConfig::from_toml_file(std::path::Path::new("/nonexistent/skymirror.toml"));
    assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));

    let file = toml_file("connect_timeout_ms = \"soon\"\n");
    let malformed = ClientConfig::from_toml_file(file.path());
    assert!(matches!(malformed, Err(ConfigError::ParseToml { .. })));
}

#[test]
fn test_server_config_from_file() {
    let file = toml_file(
        r#"
        listen_addr = "0.0.0.0:4222"
        buckets = ["flights", "users"]
        token = "s3cret"
        "#,
    );

    let config = load_server_config(file.path()).unwrap();
    validate_server_config(&config).unwrap();
    assert_eq!(config.listen_addr, "0.0.0.0:4222");
    assert_eq!(config.buckets, vec!["flights".to_string(), "users".to_string()]);
    assert_eq!(config.token.as_deref(), Some("s3cret"));
    assert_eq!(config.server_name, "skymirror-server");

    let file = toml_file("buckets = [\"flights.live\"]\n");
    let config = load_server_config(file.path()).unwrap();
    assert!(matches!(validate_server_config(&config), Err(ConfigError::Validation { .. })));
}
