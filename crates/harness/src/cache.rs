//! Persisted version/port record shared by concurrently starting instances
//!
//! Only read or written while the machine-wide lock is held.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortCache {
    /// Latest release published upstream
    pub latest_upstream_version: String,

    /// Next candidate port for the port scan
    pub next_port: u16,
}

impl PortCache {
    pub fn new(latest_upstream_version: impl Into<String>, next_port: u16) -> Self {
        Self {
            latest_upstream_version: latest_upstream_version.into(),
            next_port,
        }
    }

    /// Read the record if it exists, parses, and was written within `ttl`
    pub async fn read_fresh(path: &Path, ttl: Duration) -> Option<Self> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        let age = SystemTime::now()
            .duration_since(metadata.modified().ok()?)
            .unwrap_or_default();
        if age >= ttl {
            trace!(path = %path.display(), ?age, "port cache is stale");
            return None;
        }
        Self::read(path).await
    }

    /// Read the record regardless of age
    pub async fn read(path: &Path) -> Option<Self> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(cache) => Some(cache),
            Err(e) => {
                debug!(path = %path.display(), "ignoring unreadable port cache: {}", e);
                None
            }
        }
    }

    /// Persist the record, replacing the previous one atomically
    pub async fn write(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Hand out the current candidate and advance the counter.
    ///
    /// The counter wraps back to `base` instead of overflowing.
    pub fn claim_port(&mut self, base: u16) -> u16 {
        let port = self.next_port;
        self.next_port = match port.checked_add(1) {
            Some(next) => next,
            None => base,
        };
        port
    }
}
