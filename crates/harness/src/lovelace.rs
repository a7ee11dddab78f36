//! Dashboards, frontend resources, and integrations

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

use crate::auth::{AuthClient, Tokens};
use crate::config_dir::ConfigDir;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// Frontend resource kinds known to the dashboard system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Css,
    Js,
    Module,
    Html,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Css => "css",
            ResourceType::Js => "js",
            ResourceType::Module => "module",
            ResourceType::Html => "html",
        }
    }
}

/// Options for a new storage-mode dashboard
#[derive(Debug, Clone, Serialize)]
pub struct DashboardCreate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub require_admin: bool,
    pub show_in_sidebar: bool,
}

impl Default for DashboardCreate {
    fn default() -> Self {
        Self {
            title: None,
            icon: None,
            require_admin: false,
            show_in_sidebar: true,
        }
    }
}

impl DashboardCreate {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }
}

/// Per-instance dashboard bookkeeping
#[derive(Debug, Default)]
pub struct Lovelace {
    created: AtomicU32,
}

impl Lovelace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dashboard at the next `lovelace-N` path, counting from 1, and
    /// return the path
    pub async fn create_dashboard(&self, connection: &Connection, options: DashboardCreate) -> Result<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let url_path = format!("lovelace-{}", n);
        let title = options
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("Dashboard {}", n));

        let mut command = json!({
            "type": "lovelace/dashboards/create",
            "url_path": url_path,
            "mode": "storage",
        });
        if let (Value::Object(command), Value::Object(options)) = (&mut command, serde_json::to_value(&options)?) {
            command.extend(options);
        }
        command["title"] = Value::String(title);

        connection.call(command).await?;
        info!("Created dashboard {}", url_path);
        Ok(url_path)
    }

    /// Replace the dashboard's configuration with a single view of `cards`
    pub async fn set_dashboard_view(&self, connection: &Connection, url_path: &str, cards: &[Value]) -> Result<()> {
        connection
            .call(json!({
                "type": "lovelace/config/save",
                "url_path": url_path,
                "config": {
                    "title": "View",
                    "views": [{
                        "path": "default_view",
                        "title": "View",
                        "cards": cards,
                    }],
                },
            }))
            .await?;
        Ok(())
    }

    /// Publish `file` under `/local/` and register it as a dashboard resource.
    ///
    /// Only ES modules are accepted. `dir` is `None` for instances the
    /// harness did not start, which have no `www/` to publish into.
    pub async fn add_resource(
        &self,
        connection: &Connection,
        dir: Option<&ConfigDir>,
        file: &Path,
        kind: ResourceType,
    ) -> Result<String> {
        if kind != ResourceType::Module {
            return Err(Error::Unsupported(format!(
                "resource type {} (only module resources are supported)",
                kind.as_str()
            )));
        }
        let dir = dir.ok_or_else(|| {
            Error::Precondition("resources can only be added to an instance this harness started".into())
        })?;
        let url = dir.publish(file).await?;
        connection
            .call(json!({
                "type": "lovelace/resources/create",
                "res_type": kind.as_str(),
                "url": url,
            }))
            .await?;
        info!("Registered resource {}", url);
        Ok(url)
    }
}

/// Start a config flow for `name` and require it to finish in one step
pub async fn add_integration(auth: &AuthClient, tokens: &Tokens, name: &str) -> Result<Value> {
    let reply = auth
        .post(
            "/api/config/config_entries/flow",
            json!({ "handler": name, "show_advanced_options": false }),
            Some(tokens),
        )
        .await?;

    if let Some(message) = reply.get("message") {
        return Err(Error::Protocol(format!("integration {} failed: {}", name, message)));
    }
    match reply.get("result") {
        Some(entry) => {
            info!("Added integration {}", name);
            Ok(entry.clone())
        }
        None => Err(Error::Unsupported(format!(
            "integration {} needs a multi-step config flow (step {})",
            name,
            reply.get("step_id").and_then(Value::as_str).unwrap_or("unknown")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dashboard_defaults() {
        let options = serde_json::to_value(DashboardCreate::default()).unwrap();
        assert_eq!(options, json!({"require_admin": false, "show_in_sidebar": true}));

        let options = serde_json::to_value(DashboardCreate::titled("Cards")).unwrap();
        assert_eq!(options["title"], "Cards");
    }

    #[test]
    fn test_resource_type_wire_names() {
        assert_eq!(serde_json::to_value(ResourceType::Module).unwrap(), "module");
        assert_eq!(ResourceType::Css.as_str(), "css");
    }
}
