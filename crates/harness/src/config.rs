//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Options for one managed Home Assistant instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Python interpreter used to create the runtime environment
    pub python: String,

    /// Extra arguments passed to `hass`
    pub hass_args: Vec<String>,

    /// Address the server binds to
    pub host: String,

    /// Fixed port of an existing instance (only used by `connect`)
    pub port: Option<u16>,

    pub username: String,
    pub password: String,
    pub user_language: String,
    pub user_display_name: String,

    /// Integration packages symlinked into `custom_components/`
    pub custom_components: Vec<PathBuf>,

    /// Machine-wide coordination between concurrently starting instances
    pub coordination: CoordinationConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            hass_args: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: None,
            username: "dev".to_string(),
            password: "dev".to_string(),
            user_language: "en".to_string(),
            user_display_name: "Developer".to_string(),
            custom_components: Vec::new(),
            coordination: CoordinationConfig::default(),
        }
    }
}

/// Shared locations and timings used while holding the machine-wide lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Python virtual environment shared by all instances
    pub runtime_dir: PathBuf,

    /// Persisted `{latest version, next port}` record
    pub cache_path: PathBuf,

    /// Cross-process lock file
    pub lock_path: PathBuf,

    /// Validity window of the cache record
    pub cache_ttl_ms: u64,

    /// First port handed out when no counter has been persisted yet
    pub base_port: u16,

    /// Package index endpoint for the latest release
    pub registry_url: String,

    /// Skip the runtime install/upgrade step (server already on PATH or in runtime_dir)
    pub skip_provisioning: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            runtime_dir: tmp.join("hasstest-venv"),
            cache_path: tmp.join("hasstest-cache"),
            lock_path: tmp.join("hasstest.lock"),
            cache_ttl_ms: 2000,
            base_port: 8130,
            registry_url: "https://pypi.org/pypi/homeassistant/json".to_string(),
            skip_provisioning: false,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file, falling back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults with `HASSTEST_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(python) = std::env::var("HASSTEST_PYTHON") {
            config.python = python;
        }
        if let Ok(host) = std::env::var("HASSTEST_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("HASSTEST_PORT") {
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("HASSTEST_PORT is not a port: {}", port)))?;
            config.port = Some(port);
        }
        if let Ok(dir) = std::env::var("HASSTEST_RUNTIME_DIR") {
            config.coordination.runtime_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// `hass` executable inside the runtime environment
    pub fn hass_binary(&self) -> PathBuf {
        self.coordination.runtime_dir.join("bin").join("hass")
    }

    /// `pip` executable inside the runtime environment
    pub fn pip_binary(&self) -> PathBuf {
        self.coordination.runtime_dir.join("bin").join("pip")
    }
}

/// Concatenate `n` generated configuration fragments, numbered from 1, each
/// followed by a newline
pub fn multiply<F>(n: usize, fragment: F) -> String
where
    F: Fn(usize) -> String,
{
    (1..=n).map(|i| fragment(i) + "\n").collect()
}
