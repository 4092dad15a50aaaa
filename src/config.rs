/*!
Agent configuration: YAML file, `.env` and `MINION_*` overrides, loaded once at startup.

The resulting [`Config`] is immutable; the server shares it as `Arc<Config>` and never
mutates it while serving requests.
*/
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::server::paths::normalize_path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/minion/minion.yaml";
pub const DEFAULT_AUTH_HEADER: &str = "X-Auth";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_OFFLOAD_DELAY_SECS: u64 = 20;
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub common: CommonConfig,
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    /// Trust every caller; bypasses the authentication gate.
    pub debug: bool,
    /// Root under which group directories may be created or removed.
    pub base_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    /// Deadline for receiving one whole request (headers and body).
    pub read_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub header: String,
    pub key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: DEFAULT_AUTH_HEADER.to_string(),
            key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker slots for offloaded manager calls.
    pub workers: usize,
    /// Pause taken inside a worker slot before each offloaded call. Zero disables it.
    pub offload_delay_secs: u64,
    /// How long finished commands stay queryable before eviction.
    pub retention_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            offload_delay_secs: DEFAULT_OFFLOAD_DELAY_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

impl ExecutorConfig {
    pub fn offload_delay(&self) -> Duration {
        Duration::from_secs(self.offload_delay_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl HttpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Config {
    /// Resolve the config path: explicit flag, then MINION_CONFIG, then the default location.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        env::var("MINION_CONFIG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load `.env` (best-effort), the YAML file (defaults when absent), then env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        let _ = dotenvy::dotenv();
        let path = Self::resolve_path(explicit);
        let mut cfg = match fs::read_to_string(&path) {
            Ok(text) => Self::from_yaml_str(&text)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound && explicit.is_none() => {
                Config::default()
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        cfg.apply_env_overrides(|k| env::var(k).ok());
        cfg.finalize()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(text: &str) -> Result<Config, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply MINION_* overrides from the given lookup (the process environment in production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(v) = get("MINION_DEBUG") {
            self.common.debug = parse_bool(&v);
        }
        if let Some(v) = get("MINION_BASE_PATH") {
            self.common.base_path = Some(v);
        }
        if let Some(v) = get("MINION_HOST") {
            self.http.host = v;
        }
        if let Some(p) = get("MINION_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.http.port = p;
        }
        if let Some(v) = get("MINION_AUTH_HEADER") {
            self.auth.header = v;
        }
        if let Some(v) = lookup("MINION_AUTH_KEY") {
            self.auth.key = v;
        }
        if let Some(n) = get("MINION_WORKERS").and_then(|v| v.parse::<usize>().ok()) {
            self.executor.workers = n;
        }
        if let Some(n) = get("MINION_OFFLOAD_DELAY_SECS").and_then(|v| v.parse::<u64>().ok()) {
            self.executor.offload_delay_secs = n;
        }
        if let Some(n) = get("MINION_RETENTION_SECS").and_then(|v| v.parse::<u64>().ok()) {
            self.executor.retention_secs = n;
        }
        if let Some(n) = get("MINION_READ_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
            self.http.read_timeout_secs = n;
        }
    }

    /// Validate and normalize; called once before the config is frozen.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.executor.workers == 0 {
            return Err(ConfigError::Invalid("executor.workers must be >= 1".into()));
        }
        if self.http.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("http.read_timeout_secs must be >= 1".into()));
        }
        if self.auth.header.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.header must not be empty".into()));
        }
        if let Some(bp) = self.common.base_path.take() {
            let bp = bp.trim();
            if !bp.is_empty() {
                if !bp.starts_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "common.base_path must be absolute, got {bp}"
                    )));
                }
                self.common.base_path = Some(normalize_path(bp));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
