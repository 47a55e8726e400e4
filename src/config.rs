// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration management with layered defaults and validation.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FetchError, FetchResult};

const DEFAULT_LOCAL_DIR: &str = "~/.rally/storage";
const DEFAULT_MAX_CONNECTIONS: usize = 4;
const DEFAULT_MULTIPART_SIZE: u64 = 8 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_MONITOR_INTERVAL_SECS: f64 = 2.0;
const DEFAULT_HEAD_TTL_SECS: f64 = 60.0;
const DEFAULT_RESOLVE_TTL_SECS: f64 = 60.0;
const DEFAULT_MAX_RETRIES: usize = 10;

/// Top-level configuration for the transfer manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the local cache directory.
    pub local_dir: PathBuf,

    /// Global per-transfer upper bound on concurrent range fetches.
    pub max_connections: usize,

    /// Target size of each range-fetch task, in bytes. Must be >= 1 MiB.
    pub multipart_size: u64,

    /// Bytes per stream chunk read from the adapter.
    pub chunk_size: usize,

    /// Monitor tick period, in seconds. Must be > 0.
    pub monitor_interval_secs: f64,

    /// HEAD response cache TTL, in seconds.
    pub head_ttl_secs: f64,

    /// Mirror resolution cache TTL, in seconds.
    pub resolve_ttl_secs: f64,

    /// Mirror rotation budget per request.
    pub max_retries: usize,

    /// Paths to mirror map files (JSON).
    pub mirror_files: Vec<PathBuf>,

    /// Seed for mirror selection; fixed for deterministic tests.
    pub random_seed: Option<u64>,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from(DEFAULT_LOCAL_DIR),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            multipart_size: DEFAULT_MULTIPART_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            head_ttl_secs: DEFAULT_HEAD_TTL_SECS,
            resolve_ttl_secs: DEFAULT_RESOLVE_TTL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            mirror_files: vec![PathBuf::from("~/.rally/storage-mirrors.json")],
            random_seed: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration, read from the `[logging]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log file path (none = console only).
    pub file: Option<PathBuf>,

    /// Enable structured JSON logging.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. built-in defaults
    /// 2. `~/.config/rally-fetch/config.toml`, if present
    /// 3. `RALLY_FETCH_*` environment variables
    pub fn load() -> Self {
        let mut config = Config::default();

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("rally-fetch").join("config.toml");
            if user_config.exists() {
                if let Ok(content) = fs::read_to_string(&user_config) {
                    match toml::from_str::<Config>(&content) {
                        Ok(parsed) => config = parsed,
                        Err(e) => {
                            tracing::warn!(path = %user_config.display(), error = %e, "ignoring malformed config file");
                        }
                    }
                }
            }
        }

        config.apply_env_overrides()
    }

    /// Load configuration from an explicit TOML file.
    pub fn load_from(path: &Path) -> FetchResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| FetchError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| FetchError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config.apply_env_overrides())
    }

    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("RALLY_FETCH_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                self.max_connections = n;
            }
        }
        if let Ok(val) = std::env::var("RALLY_FETCH_MULTIPART_SIZE") {
            if let Ok(n) = val.parse() {
                self.multipart_size = n;
            }
        }
        if let Ok(val) = std::env::var("RALLY_FETCH_LOCAL_DIR") {
            self.local_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RALLY_FETCH_LOG_LEVEL") {
            self.logging.level = val;
        }
        self
    }

    /// Validate the configuration, matching the invariants the supervisor enforces
    /// on startup.
    pub fn validate(&self) -> FetchResult<()> {
        if self.max_connections < 1 {
            return Err(FetchError::Config(format!(
                "invalid max_connections: {} < 1",
                self.max_connections
            )));
        }
        if self.multipart_size < 1024 * 1024 {
            return Err(FetchError::Config(format!(
                "invalid multipart_size: {} < {}",
                self.multipart_size,
                1024 * 1024
            )));
        }
        if self.monitor_interval_secs <= 0.0 {
            return Err(FetchError::Config(format!(
                "invalid monitor_interval_secs: {} <= 0",
                self.monitor_interval_secs
            )));
        }
        Ok(())
    }

    /// Canonical local directory with `~` expanded.
    pub fn local_dir(&self) -> PathBuf {
        expand_tilde(&self.local_dir)
    }

    /// Resolve a path for a `GetRequest`: use the caller-supplied path if present,
    /// otherwise derive one from `local_dir` and the URL's path component.
    pub fn local_path(&self, path: Option<&str>, url: &str) -> PathBuf {
        let raw = match path {
            Some(p) => PathBuf::from(p),
            None => {
                let parsed = url::Url::parse(url).ok();
                let url_path = parsed
                    .as_ref()
                    .map(|u| u.path().trim_start_matches('/').to_string())
                    .unwrap_or_else(|| url.to_string());
                self.local_dir().join(url_path)
            }
        };
        normalize(&expand_tilde(&raw))
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Normalize a path the way `os.path.normpath` does: collapse `.` and resolve `..`
/// lexically, without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
