//! Service configuration for scriptbox.
//!
//! Configuration is read from an optional YAML file, then overridden by
//! environment variables, then validated once at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub mod languages;
pub use languages::{LanguageSpec, LanguageTable};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
/// The engine's default local endpoint.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Config parsing failed: {message}")]
    Parse { message: String },

    #[error("Config validation failed: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },
}

/// A login allowed to use the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub id: i64,
    pub username: String,
    /// bcrypt hash, e.g. `$2b$10$...`
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub docker_host: String,
    pub languages: LanguageTable,
    pub users: Vec<UserEntry>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            data_dir: PathBuf::from("data"),
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            languages: LanguageTable::default(),
            users: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Load from `path` (YAML) when given, else defaults, then apply env overrides.
    #[instrument]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        debug!("Loading service config from {}", path.display());
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_env("SCRIPTBOX_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(dir) = non_empty_env("SCRIPTBOX_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = non_empty_env("DOCKER_HOST") {
            self.docker_host = normalize_docker_host(&host);
        }
    }

    /// Check the whole config, collecting every problem rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.languages.problems();

        if self.bind_addr.trim().is_empty() {
            errors.push("bindAddr cannot be empty".to_string());
        }

        if !is_docker_host(&self.docker_host) {
            errors.push(format!(
                "dockerHost '{}' must be unix://<socket path>, http:// or https://",
                self.docker_host
            ));
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for user in &self.users {
            if user.username.trim().is_empty() {
                errors.push(format!("users[{}]: username cannot be empty", user.id));
            }
            if !names.insert(user.username.as_str()) {
                errors.push(format!("users: duplicate username '{}'", user.username));
            }
            if !ids.insert(user.id) {
                errors.push(format!("users: duplicate id {}", user.id));
            }
            if !is_password_hash(&user.password_hash) {
                errors.push(format!(
                    "users.{}: passwordHash must be a bcrypt hash ($2a$, $2b$ or $2y$)",
                    user.username
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { errors })
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Docker clients accept `tcp://host:port`; the engine API is plain HTTP on that socket.
pub fn normalize_docker_host(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    match trimmed.strip_prefix("tcp://") {
        Some(rest) => format!("http://{}", rest),
        None => trimmed.to_string(),
    }
}

fn is_docker_host(host: &str) -> bool {
    match host.strip_prefix("unix://") {
        Some(socket) => socket.starts_with('/'),
        None => host.starts_with("http://") || host.starts_with("https://"),
    }
}

/// Modular crypt bcrypt: `$2b$<cost>$<53 chars of salt and digest>`.
fn is_password_hash(value: &str) -> bool {
    let mut parts = value.split('$');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(""), Some(version), Some(cost), Some(rest), None) => {
            matches!(version, "2a" | "2b" | "2y")
                && cost.len() == 2
                && cost.parse::<u32>().map(|c| (4..=31).contains(&c)).unwrap_or(false)
                && rest.len() == 53
                && rest
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '/')
        }
        _ => false,
    }
}
