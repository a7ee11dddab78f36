//! Server process management - spawning, readiness racing, and shutdown

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::{Attempt, RetryPolicy};

const STOP_GRACE: Duration = Duration::from_secs(30);

/// Handle to a running `hass` process
pub struct ServerProcess {
    child: Child,
    host: String,
    port: u16,
    config_dir: PathBuf,
}

impl ServerProcess {
    /// Spawn `binary -c <config_dir> -v <extra_args>` with inherited stdio and
    /// wait until it accepts TCP connections.
    ///
    /// Fails with [`Error::ProcessFailure`] if the process exits before the
    /// port opens, and [`Error::Timeout`] if `readiness` runs out first.
    pub async fn spawn(
        binary: &Path,
        config_dir: &Path,
        host: &str,
        port: u16,
        extra_args: &[String],
        readiness: RetryPolicy,
    ) -> Result<Self> {
        info!("Spawning {} on {}:{}", binary.display(), host, port);

        let child = Command::new(binary)
            .arg("-c")
            .arg(config_dir)
            .arg("-v")
            .args(extra_args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(
                    "Failed to spawn {}; the runtime environment may be missing or broken",
                    binary.display()
                );
                Error::Io(e)
            })?;

        let mut process = Self {
            child,
            host: host.to_string(),
            port,
            config_dir: config_dir.to_path_buf(),
        };
        process.wait_until_ready(readiness).await?;

        info!("Home Assistant is accepting connections on port {}", port);
        Ok(process)
    }

    /// Race process exit against the connect probe
    async fn wait_until_ready(&mut self, readiness: RetryPolicy) -> Result<()> {
        let host = self.host.as_str();
        let port = self.port;
        let probe = readiness.run("Home Assistant to accept connections", move |_| async move {
            match TcpStream::connect((host, port)).await {
                Ok(_) => Ok(Attempt::Ready(())),
                Err(e) => Ok(Attempt::Retry(e.to_string())),
            }
        });

        tokio::select! {
            status = self.child.wait() => {
                let status = status?;
                warn!("Home Assistant exited before opening its port: {}", status);
                Err(Error::ProcessFailure { code: status.code() })
            }
            ready = probe => ready,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send SIGINT and wait for the process to exit
    pub async fn stop(&mut self) -> Result<()> {
        self.stop_within(STOP_GRACE).await
    }

    /// Like [`ServerProcess::stop`], killing the process if it outlives `grace`
    pub async fn stop_within(&mut self, grace: Duration) -> Result<()> {
        if let Some(pid) = self.child.id() {
            info!("Stopping Home Assistant (pid: {})", pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!("Failed to interrupt pid {}: {}", pid, e);
                self.child.start_kill()?;
            }
        }

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("Home Assistant ignored SIGINT for {:?}, killing", grace);
                self.child.start_kill()?;
                self.child.wait().await?
            }
        };
        debug!("Home Assistant exited: {}", status);
        Ok(())
    }
}
