// Configuration loading and parsing (config/client.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// client.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire client.toml file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub autobid: AutoBidConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint for the event channel, e.g. `wss://host/ws`.
    pub ws_url: String,
    /// REST base URL, e.g. `https://host/api`.
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Host-app-issued identity token, sent as `Authorization: tma <token>`.
    pub token: String,
    /// Fallback developer identity for non-production environments,
    /// sent as `X-Dev-User-Id`.
    #[serde(default)]
    pub dev_user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local timer tick interval. Display granularity is bounded below by
    /// this value.
    pub tick_ms: u64,
    pub event_channel_capacity: usize,
    pub command_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tick_ms: 250,
            event_channel_capacity: 256,
            command_channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoBidConfig {
    /// How long a cached auto-bid status stays fresh.
    pub status_ttl_secs: u64,
    /// How often the engine sweeps joined auctions for stale statuses.
    pub poll_interval_secs: u64,
}

impl Default for AutoBidConfig {
    fn default() -> Self {
        AutoBidConfig {
            status_ttl_secs: 10,
            poll_interval_secs: 10,
        }
    }
}

/// Auctions the monitor binary joins at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub auction_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/client.toml`, relative to
/// the given `base_dir`.
///
/// This is the lower-level loading primitive that does not auto-copy
/// defaults. Prefer `load_config()` which handles default initialization.
pub(crate) fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join("client.toml");
    let text = std::fs::read_to_string(&path).map_err(|_| ConfigError::FileNotFound {
        path: path.clone(),
    })?;

    let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Skips `.example` files.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the project root or ensure defaults/ is present",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let mut copied = Vec::new();

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();

        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };

        // Skip .example template files
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // File already exists in config/, skip it
            }
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Convenience wrapper: loads config relative to the current working
/// directory. Ensures default config files are copied before loading.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let ws = &config.server.ws_url;
    if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
        return Err(ConfigError::ValidationError {
            field: "server.ws_url".into(),
            message: format!("must start with ws:// or wss://, got `{ws}`"),
        });
    }

    let api = &config.server.api_url;
    if !(api.starts_with("http://") || api.starts_with("https://")) {
        return Err(ConfigError::ValidationError {
            field: "server.api_url".into(),
            message: format!("must start with http:// or https://, got `{api}`"),
        });
    }

    // An identity is required: either the host-app token or, for
    // development, a dev user id.
    if config.auth.token.is_empty() && config.auth.dev_user_id.is_none() {
        return Err(ConfigError::ValidationError {
            field: "auth.token".into(),
            message: "must be set (or provide auth.dev_user_id for development)".into(),
        });
    }

    if config.reconnect.max_attempts == 0 {
        return Err(ConfigError::ValidationError {
            field: "reconnect.max_attempts".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.reconnect.base_delay_ms == 0 {
        return Err(ConfigError::ValidationError {
            field: "reconnect.base_delay_ms".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.reconnect.max_delay_ms < config.reconnect.base_delay_ms {
        return Err(ConfigError::ValidationError {
            field: "reconnect.max_delay_ms".into(),
            message: format!(
                "must be >= base_delay_ms ({})",
                config.reconnect.base_delay_ms
            ),
        });
    }

    if config.engine.tick_ms == 0 {
        return Err(ConfigError::ValidationError {
            field: "engine.tick_ms".into(),
            message: "must be greater than 0".into(),
        });
    }

    let caps: &[(&str, usize)] = &[
        (
            "engine.event_channel_capacity",
            config.engine.event_channel_capacity,
        ),
        (
            "engine.command_channel_capacity",
            config.engine.command_channel_capacity,
        ),
    ];
    for (name, val) in caps {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    if config.autobid.status_ttl_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "autobid.status_ttl_secs".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.autobid.poll_interval_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "autobid.poll_interval_secs".into(),
            message: "must be greater than 0".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// Helper: returns the path to the auction-sync project root
    /// (works whether `cargo test` runs from the crate root or repo root).
    fn project_root() -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        if cwd.join("defaults").exists() {
            cwd
        } else if cwd.join("auction-sync/defaults").exists() {
            cwd.join("auction-sync")
        } else {
            panic!("Cannot locate defaults/ directory from CWD {:?}", cwd);
        }
    }

    /// Helper: write `content` as config/client.toml under a fresh temp dir
    /// and return the dir.
    fn temp_config(name: &str, content: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let config_dir = tmp.join("config");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("client.toml"), content).unwrap();
        tmp
    }

    const VALID_TOML: &str = r#"
[server]
ws_url = "wss://auctions.example.com/ws"
api_url = "https://auctions.example.com/api"

[auth]
token = "tma-test-token"
dev_user_id = "dev-7"

[reconnect]
max_attempts = 3
base_delay_ms = 100
max_delay_ms = 1000

[engine]
tick_ms = 100

[autobid]
status_ttl_secs = 10
poll_interval_secs = 10

[watch]
auction_ids = ["a1", "a2"]
"#;

    #[test]
    fn load_valid_config() {
        let tmp = temp_config("sync_config_valid", VALID_TOML);
        let config = load_config_from(&tmp).expect("should load valid config");

        assert_eq!(config.server.ws_url, "wss://auctions.example.com/ws");
        assert_eq!(config.server.api_url, "https://auctions.example.com/api");
        assert_eq!(config.auth.token, "tma-test-token");
        assert_eq!(config.auth.dev_user_id.as_deref(), Some("dev-7"));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.engine.tick_ms, 100);
        // Omitted engine capacities fall back to defaults
        assert_eq!(config.engine.event_channel_capacity, 256);
        assert_eq!(config.engine.command_channel_capacity, 64);
        assert_eq!(config.watch.auction_ids, vec!["a1", "a2"]);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn load_default_config_from_project_files() {
        let root = project_root();
        ensure_config_files(&root).expect("should copy default configs");
        let config = load_config_from(&root).expect("should load default config");

        assert!(config.server.ws_url.starts_with("ws"));
        assert_eq!(config.autobid.status_ttl_secs, 10);
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn rejects_bad_ws_url_scheme() {
        let bad = VALID_TOML.replace("wss://auctions.example.com/ws", "ftp://nope");
        let tmp = temp_config("sync_config_bad_ws", &bad);

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "server.ws_url"),
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_bad_api_url_scheme() {
        let bad = VALID_TOML.replace("https://auctions.example.com/api", "auctions.example.com");
        let tmp = temp_config("sync_config_bad_api", &bad);

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "server.api_url"),
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_missing_identity() {
        let bad = VALID_TOML
            .replace("token = \"tma-test-token\"", "token = \"\"")
            .replace("dev_user_id = \"dev-7\"\n", "");
        let tmp = temp_config("sync_config_no_identity", &bad);

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "auth.token"),
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn empty_token_with_dev_user_is_ok() {
        let toml = VALID_TOML.replace("token = \"tma-test-token\"", "token = \"\"");
        let tmp = temp_config("sync_config_dev_identity", &toml);

        let config = load_config_from(&tmp).expect("dev identity should satisfy validation");
        assert!(config.auth.token.is_empty());
        assert_eq!(config.auth.dev_user_id.as_deref(), Some("dev-7"));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_reconnect_attempts() {
        let bad = VALID_TOML.replace("max_attempts = 3", "max_attempts = 0");
        let tmp = temp_config("sync_config_zero_attempts", &bad);

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "reconnect.max_attempts")
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_max_delay_below_base_delay() {
        let bad = VALID_TOML.replace("max_delay_ms = 1000", "max_delay_ms = 50");
        let tmp = temp_config("sync_config_delay_order", &bad);

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "reconnect.max_delay_ms")
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_tick() {
        let bad = VALID_TOML.replace("tick_ms = 100", "tick_ms = 0");
        let tmp = temp_config("sync_config_zero_tick", &bad);

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "engine.tick_ms"),
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_autobid_ttl() {
        let bad = VALID_TOML.replace("status_ttl_secs = 10", "status_ttl_secs = 0");
        let tmp = temp_config("sync_config_zero_ttl", &bad);

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "autobid.status_ttl_secs")
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn file_not_found_for_missing_client_toml() {
        let tmp = std::env::temp_dir().join("sync_config_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::FileNotFound { path } => assert!(path.ends_with("client.toml")),
            other => panic!("expected FileNotFound, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn parse_error_for_invalid_toml() {
        let tmp = temp_config("sync_config_invalid", "this is not valid [[[ toml");

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ParseError { path, .. } => assert!(path.ends_with("client.toml")),
            other => panic!("expected ParseError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_copies_missing_files() {
        let tmp = std::env::temp_dir().join("sync_config_ensure_copies");
        let _ = fs::remove_dir_all(&tmp);

        let defaults_dir = tmp.join("defaults");
        fs::create_dir_all(&defaults_dir).unwrap();

        let root = project_root();
        fs::copy(
            root.join("defaults/client.toml"),
            defaults_dir.join("client.toml"),
        )
        .unwrap();
        // Add an example file that should NOT be copied
        fs::write(
            defaults_dir.join("client.toml.example"),
            "# template only\n",
        )
        .unwrap();

        assert!(!tmp.join("config").exists());

        let copied = ensure_config_files(&tmp).expect("should succeed");
        assert_eq!(copied.len(), 1);
        assert!(tmp.join("config/client.toml").exists());
        assert!(!tmp.join("config/client.toml.example").exists());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_skips_existing() {
        let tmp = std::env::temp_dir().join("sync_config_ensure_skips");
        let _ = fs::remove_dir_all(&tmp);

        let defaults_dir = tmp.join("defaults");
        let config_dir = tmp.join("config");
        fs::create_dir_all(&defaults_dir).unwrap();
        fs::create_dir_all(&config_dir).unwrap();

        let root = project_root();
        fs::copy(
            root.join("defaults/client.toml"),
            defaults_dir.join("client.toml"),
        )
        .unwrap();

        // Pre-create client.toml in config/ with custom content
        fs::write(config_dir.join("client.toml"), "# custom\n").unwrap();

        let copied = ensure_config_files(&tmp).expect("should succeed");
        assert!(copied.is_empty());

        let content = fs::read_to_string(config_dir.join("client.toml")).unwrap();
        assert_eq!(content, "# custom\n");

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_errors_when_both_dirs_missing() {
        let tmp = std::env::temp_dir().join("sync_config_both_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let err = ensure_config_files(&tmp).unwrap_err();
        match &err {
            ConfigError::DefaultsCopyError { message } => {
                assert!(message.contains("neither defaults/ nor config/"));
            }
            other => panic!("expected DefaultsCopyError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }
}
