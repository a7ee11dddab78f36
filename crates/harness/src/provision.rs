//! Runtime provisioning and the lock-protected startup section
//!
//! Concurrent starts on one machine are serialised by [`LockGuard`]. While the
//! lock is held an instance refreshes the version/port record, claims a port,
//! writes its configuration, and installs or upgrades the shared runtime.

use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

use crate::cache::PortCache;
use crate::config::{CoordinationConfig, HarnessConfig};
use crate::config_dir::ConfigDir;
use crate::error::{Error, Result};
use crate::lock::LockGuard;
use crate::network::find_port;
use crate::retry::RetryPolicy;

const PACKAGE: &str = "homeassistant";

/// Result of one pass through the locked startup section
#[derive(Debug, Clone)]
pub struct Reservation {
    pub port: u16,
    pub latest_version: String,
    /// Whether the runtime was installed or upgraded
    pub upgraded: bool,
    /// Start of the critical section
    pub locked_at: Instant,
    /// End of the critical section, taken just before unlocking
    pub released_at: Instant,
}

#[derive(Debug, Deserialize)]
struct RegistryRelease {
    info: RegistryInfo,
}

#[derive(Debug, Deserialize)]
struct RegistryInfo {
    version: String,
}

pub struct Provisioner {
    python: String,
    pip: PathBuf,
    host: String,
    coordination: CoordinationConfig,
    http: reqwest::Client,
}

impl Provisioner {
    pub fn new(config: &HarnessConfig, http: reqwest::Client) -> Self {
        Self {
            python: config.python.clone(),
            pip: config.pip_binary(),
            host: config.host.clone(),
            coordination: config.coordination.clone(),
            http,
        }
    }

    fn runtime_dir(&self) -> &Path {
        &self.coordination.runtime_dir
    }

    fn pip(&self) -> &Path {
        &self.pip
    }

    /// Claim a port, write `configuration.yaml`, and bring the runtime up to
    /// date, all under the machine-wide lock.
    ///
    /// The lock is released exactly once whether or not the section succeeds.
    pub async fn reserve(&self, dir: &ConfigDir, extra_yaml: &str) -> Result<Reservation> {
        let lock = LockGuard::acquire(&self.coordination.lock_path, RetryPolicy::lock()).await?;
        let locked_at = Instant::now();

        let outcome = self.reserve_locked(dir, extra_yaml).await;

        let released_at = Instant::now();
        let released = lock.release();
        let (port, latest_version, upgraded) = outcome?;
        released?;

        Ok(Reservation {
            port,
            latest_version,
            upgraded,
            locked_at,
            released_at,
        })
    }

    async fn reserve_locked(&self, dir: &ConfigDir, extra_yaml: &str) -> Result<(u16, String, bool)> {
        let mut cache = self.resolve_cache().await?;
        let latest = cache.latest_upstream_version.clone();
        let base = self.coordination.base_port;

        let (port, upgraded) = tokio::try_join!(
            async {
                let port = find_port(&mut cache, &self.host, base).await?;
                dir.write_configuration(&self.host, port, extra_yaml).await?;
                Ok::<_, Error>(port)
            },
            self.provision(&latest),
        )?;

        cache.write(&self.coordination.cache_path).await?;
        Ok((port, latest, upgraded))
    }

    /// Fresh record as is; otherwise refresh the version and keep the counter
    async fn resolve_cache(&self) -> Result<PortCache> {
        let path = &self.coordination.cache_path;
        let ttl = Duration::from_millis(self.coordination.cache_ttl_ms);
        if let Some(cache) = PortCache::read_fresh(path, ttl).await {
            debug!(version = %cache.latest_upstream_version, next_port = cache.next_port, "port cache is fresh");
            return Ok(cache);
        }

        let stale = PortCache::read(path).await;
        let next_port = stale
            .as_ref()
            .map_or(self.coordination.base_port, |c| c.next_port);
        let latest = if self.coordination.skip_provisioning {
            stale.map_or_else(|| "unknown".to_string(), |c| c.latest_upstream_version)
        } else {
            self.latest_upstream_version().await?
        };
        Ok(PortCache::new(latest, next_port))
    }

    /// Query the package index for the newest release
    pub async fn latest_upstream_version(&self) -> Result<String> {
        let release: RegistryRelease = self
            .http
            .get(&self.coordination.registry_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(version = %release.info.version, "latest upstream release");
        Ok(release.info.version)
    }

    /// Create the runtime if needed and upgrade it when it lags `latest`
    pub async fn provision(&self, latest: &str) -> Result<bool> {
        if self.coordination.skip_provisioning {
            return Ok(false);
        }
        self.ensure_runtime().await?;
        self.upgrade_if_needed(latest).await
    }

    /// Create the virtual environment if its directory does not exist yet
    pub async fn ensure_runtime(&self) -> Result<()> {
        if tokio::fs::try_exists(self.runtime_dir()).await? {
            return Ok(());
        }
        info!("Creating runtime environment at {}", self.runtime_dir().display());
        let runtime_dir = self.runtime_dir().to_string_lossy().into_owned();
        run(&self.python, &["-m", "venv", runtime_dir.as_str()]).await
    }

    /// Version recorded by the installed package metadata, if any
    pub async fn installed_version(&self) -> Result<Option<String>> {
        installed_version(self.runtime_dir()).await
    }

    /// Install the server package unless the installed version equals `latest`
    pub async fn upgrade_if_needed(&self, latest: &str) -> Result<bool> {
        let installed = self.installed_version().await?;
        if installed.as_deref() == Some(latest) {
            debug!(version = latest, "runtime is up to date");
            return Ok(false);
        }

        info!(
            "Upgrading Home Assistant from {} to {}",
            installed.as_deref().unwrap_or("nothing"),
            latest
        );
        let pip = self.pip().to_string_lossy().into_owned();
        run(&pip, &["install", "--upgrade", "wheel"]).await?;
        run(&pip, &["install", "--upgrade", "mutagen", PACKAGE]).await?;
        Ok(true)
    }
}

/// Scan `lib/*/site-packages` for `homeassistant-<version>.dist-info`
pub async fn installed_version(runtime_dir: &Path) -> Result<Option<String>> {
    let pattern = Regex::new(&format!(r"^{}-(.*)\.dist-info$", PACKAGE))
        .map_err(|e| Error::Config(e.to_string()))?;

    let lib = runtime_dir.join("lib");
    let mut interpreters = match tokio::fs::read_dir(&lib).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    while let Some(interpreter) = interpreters.next_entry().await? {
        let site_packages = interpreter.path().join("site-packages");
        let Ok(mut packages) = tokio::fs::read_dir(&site_packages).await else {
            continue;
        };
        while let Some(package) = packages.next_entry().await? {
            let name = package.file_name();
            if let Some(captures) = pattern.captures(&name.to_string_lossy()) {
                return Ok(Some(captures[1].to_string()));
            }
        }
    }
    Ok(None)
}

/// Run a provisioning command with inherited stdio
async fn run(program: &str, args: &[&str]) -> Result<()> {
    debug!("Running {} {}", program, args.join(" "));
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::ProcessFailure {
            code: status.code(),
        })
    }
}
