// Integration tests for the auction sync scaffold.

use std::path::Path;

/// Verify that the project scaffold compiles successfully.
#[test]
fn project_compiles() {
    assert!(true);
}

/// Verify that defaults/client.toml is valid TOML.
#[test]
fn default_client_toml_is_valid() {
    let content = std::fs::read_to_string("defaults/client.toml")
        .expect("defaults/client.toml should exist");
    let parsed: Result<toml::Value, _> = toml::from_str(&content);
    assert!(
        parsed.is_ok(),
        "defaults/client.toml is not valid TOML: {:?}",
        parsed.err()
    );
}

/// Verify that the shipped default config passes the full typed load path.
#[test]
fn default_client_toml_deserializes_as_config() {
    let content = std::fs::read_to_string("defaults/client.toml")
        .expect("defaults/client.toml should exist");
    let config: Result<auction_sync::config::Config, _> = toml::from_str(&content);
    assert!(
        config.is_ok(),
        "defaults/client.toml does not deserialize: {:?}",
        config.err()
    );
}

/// Verify the defaults directory layout the config loader copies from.
#[test]
fn defaults_directory_exists() {
    assert!(Path::new("defaults").is_dir());
    assert!(Path::new("defaults/client.toml").is_file());
}
