//! Per-instance configuration directory

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

use crate::error::{Error, Result};

/// Base configuration every instance starts from. The HTTP section pins the
/// address chosen under the coordination lock.
pub fn configuration_yaml(host: &str, port: u16, extra: &str) -> String {
    format!(
        "frontend:\nhttp:\n  server_host: {}\n  server_port: {}\n{}",
        host, port, extra
    )
}

/// Fresh temporary directory holding `configuration.yaml`, `www/` and
/// `custom_components/`
pub struct ConfigDir {
    dir: TempDir,
}

impl ConfigDir {
    pub async fn create() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("hasstest-").tempdir()?;
        tokio::fs::create_dir(dir.path().join("www")).await?;
        tokio::fs::create_dir(dir.path().join("custom_components")).await?;
        debug!(path = %dir.path().display(), "created config directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn configuration_file(&self) -> PathBuf {
        self.path().join("configuration.yaml")
    }

    /// Served by Home Assistant under `/local/`
    pub fn www_dir(&self) -> PathBuf {
        self.path().join("www")
    }

    pub fn components_dir(&self) -> PathBuf {
        self.path().join("custom_components")
    }

    /// Symlink each integration package into `custom_components/` under its
    /// own directory name
    pub async fn link_components(&self, components: &[PathBuf]) -> Result<()> {
        for component in components {
            let source = tokio::fs::canonicalize(component).await?;
            let name = source.file_name().ok_or_else(|| {
                Error::Config(format!("{} has no directory name", component.display()))
            })?;
            tokio::fs::symlink(&source, self.components_dir().join(name)).await?;
            debug!(component = %source.display(), "linked custom component");
        }
        Ok(())
    }

    pub async fn write_configuration(&self, host: &str, port: u16, extra: &str) -> Result<()> {
        tokio::fs::write(
            self.configuration_file(),
            configuration_yaml(host, port, extra),
        )
        .await?;
        Ok(())
    }

    /// Copy a frontend module into `www/`, returning the URL it is served at
    pub async fn publish(&self, file: &Path) -> Result<String> {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("{} has no file name", file.display())))?;
        tokio::fs::copy(file, self.www_dir().join(name)).await?;
        Ok(format!("/local/{}", name))
    }

    /// Delete the directory tree
    pub fn remove(self) -> Result<()> {
        let path = self.path().to_path_buf();
        self.dir.close()?;
        debug!(path = %path.display(), "removed config directory");
        Ok(())
    }
}
