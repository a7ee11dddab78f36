//! Playwright backend
//!
//! A long-lived node process runs `driver.js` and answers line-delimited JSON
//! requests. Pages and elements live in the driver and are referred to by
//! numeric handles.

use async_trait::async_trait;
use base64::Engine;
use hasstest_dom::{diffable_html, DiffOptions, Node};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrowserIntegration, BrowserPage, DashboardOptions};
use crate::error::{Error, Result};
use crate::rpc::PendingCalls;

const DRIVER_SCRIPT: &str = include_str!("driver.js");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

impl FromStr for BrowserKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(BrowserKind::Chromium),
            "firefox" => Ok(BrowserKind::Firefox),
            "webkit" | "safari" => Ok(BrowserKind::Webkit),
            other => Err(Error::Config(format!("unknown browser: {}", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: BrowserKind,
    pub headless: bool,
    /// Node executable
    pub node: String,
    /// Directory whose `node_modules` provides `playwright`
    pub working_dir: PathBuf,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: BrowserKind::Chromium,
            headless: true,
            node: "node".to_string(),
            working_dir: PathBuf::from("."),
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

impl PlaywrightConfig {
    /// Defaults with the engine taken from `BROWSER` when set
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(browser) = std::env::var("BROWSER") {
            config.browser = browser.parse()?;
        }
        Ok(config)
    }
}

/// Handle to an element held by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle(u64);

struct Driver {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Child>,
    pending: Arc<PendingCalls>,
    reader: JoinHandle<()>,
    _script_dir: TempDir,
}

impl Driver {
    async fn spawn(config: &PlaywrightConfig) -> Result<Self> {
        let script_dir = tempfile::tempdir()?;
        let script = script_dir.path().join("driver.js");
        tokio::fs::write(&script, DRIVER_SCRIPT).await?;

        let mut child = Command::new(&config.node)
            .arg(&script)
            .arg(config.browser.as_str())
            .arg(config.headless.to_string())
            .current_dir(&config.working_dir)
            .env("NODE_PATH", config.working_dir.join("node_modules"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Browser(format!("failed to start {}: {}", config.node, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Browser("driver stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Browser("driver stdout unavailable".into()))?;

        let pending = Arc::new(PendingCalls::new());
        let reader = tokio::spawn(read_replies(stdout, Arc::clone(&pending)));

        Ok(Self {
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(child),
            pending,
            reader,
            _script_dir: script_dir,
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (id, reply) = self.pending.register();
        let line = format!("{}\n", json!({ "id": id, "method": method, "params": params }));

        {
            let mut stdin = self.stdin.lock().await;
            let Some(stdin) = stdin.as_mut() else {
                self.pending.cancel(id);
                return Err(Error::Browser("browser has been closed".into()));
            };
            write_request(stdin, &self.pending, id, &line).await?;
        }

        reply
            .await
            .map_err(|_| Error::Browser(format!("driver exited during {}", method)))?
    }

    /// Close stdin and wait for the node process to exit
    async fn shutdown(&self) -> Result<()> {
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(status) => {
                debug!("browser driver exited: {}", status?);
            }
            Err(_) => {
                warn!("browser driver did not exit, killing it");
                child.start_kill()?;
                child.wait().await?;
            }
        }
        self.reader.abort();
        self.pending.fail_all();
        Ok(())
    }
}

/// Send one request line; `id` is cancelled if the driver cannot take it
async fn write_request<W: AsyncWrite + Unpin>(
    stdin: &mut W,
    pending: &PendingCalls,
    id: u64,
    line: &str,
) -> Result<()> {
    let written = match stdin.write_all(line.as_bytes()).await {
        Ok(()) => stdin.flush().await,
        Err(e) => Err(e),
    };
    written.map_err(|e| {
        pending.cancel(id);
        Error::Browser(format!("driver is gone: {}", e))
    })
}

async fn read_replies(stdout: ChildStdout, pending: Arc<PendingCalls>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Ok(reply) = serde_json::from_str::<Value>(&line) else {
                    debug!("driver: {}", line);
                    continue;
                };
                let Some(id) = reply.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                let result = match reply.get("error") {
                    Some(error) => Err(Error::Browser(
                        error.as_str().map_or_else(|| error.to_string(), String::from),
                    )),
                    None => Ok(reply.get("result").cloned().unwrap_or(Value::Null)),
                };
                pending.resolve(id, result);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("failed to read from browser driver: {}", e);
                break;
            }
        }
    }
    pending.fail_all();
}

/// Browser driven by a Playwright node process
pub struct PlaywrightBrowser {
    driver: Arc<Driver>,
    config: PlaywrightConfig,
    closed: AtomicBool,
}

impl PlaywrightBrowser {
    /// Check Playwright is resolvable and start the driver
    pub async fn launch(config: PlaywrightConfig) -> Result<Self> {
        Self::check_installed(&config).await?;
        let driver = Driver::spawn(&config).await?;
        info!("Launched {} via Playwright", config.browser.as_str());
        Ok(Self {
            driver: Arc::new(driver),
            config,
            closed: AtomicBool::new(false),
        })
    }

    async fn check_installed(config: &PlaywrightConfig) -> Result<()> {
        let status = Command::new(&config.node)
            .args(["-e", "require.resolve('playwright')"])
            .current_dir(&config.working_dir)
            .env("NODE_PATH", config.working_dir.join("node_modules"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(Error::Browser(
                "Playwright not found. Install with: npm install playwright".into(),
            )),
        }
    }

    pub fn config(&self) -> &PlaywrightConfig {
        &self.config
    }
}

#[async_trait]
impl BrowserIntegration for PlaywrightBrowser {
    type Page = PlaywrightPage;

    async fn open(&self, url: &str, options: &DashboardOptions) -> Result<PlaywrightPage> {
        let page = self
            .driver
            .request(
                "open",
                json!({
                    "url": url,
                    "colorScheme": options.color_scheme,
                    "viewport": {
                        "width": self.config.viewport_width,
                        "height": self.config.viewport_height,
                    },
                }),
            )
            .await?;
        let page = page
            .as_u64()
            .ok_or_else(|| Error::Browser(format!("driver returned no page handle: {}", page)))?;
        Ok(PlaywrightPage {
            driver: Arc::clone(&self.driver),
            page,
        })
    }

    async fn open_in_headed(&self, url: &str) -> Result<()> {
        self.driver
            .request("openHeaded", json!({ "url": url }))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.driver.request("close", json!({})).await {
            warn!("browser close failed: {}", e);
        }
        self.driver.shutdown().await
    }
}

/// Page opened through [`PlaywrightBrowser`]
pub struct PlaywrightPage {
    driver: Arc<Driver>,
    page: u64,
}

fn element_handle(value: Value) -> Result<ElementHandle> {
    value
        .as_u64()
        .map(ElementHandle)
        .ok_or_else(|| Error::Browser(format!("driver returned no element handle: {}", value)))
}

#[async_trait]
impl BrowserPage for PlaywrightPage {
    type Element = ElementHandle;

    async fn nth_card(&self, n: usize) -> Result<ElementHandle> {
        let handle = self
            .driver
            .request("nthCard", json!({ "page": self.page, "n": n }))
            .await?;
        element_handle(handle)
    }

    async fn shadow_html(&self, element: &ElementHandle, options: &DiffOptions) -> Result<String> {
        let snapshot = self
            .driver
            .request("snapshot", json!({ "element": element.0 }))
            .await?;
        let root = Node::from_value(snapshot)?;
        Ok(diffable_html(&root, options)?)
    }

    async fn text_content(&self, element: &ElementHandle) -> Result<String> {
        let text = self
            .driver
            .request("textContent", json!({ "element": element.0 }))
            .await?;
        Ok(text.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&self, element: &ElementHandle) -> Result<Vec<u8>> {
        let encoded = self
            .driver
            .request("screenshot", json!({ "element": element.0 }))
            .await?;
        let encoded = encoded
            .as_str()
            .ok_or_else(|| Error::Browser("driver returned no screenshot".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Browser(format!("screenshot is not base64: {}", e)))
    }

    async fn find(&self, element: &ElementHandle, selector: &str) -> Result<Option<ElementHandle>> {
        let handle = self
            .driver
            .request("find", json!({ "element": element.0, "selector": selector }))
            .await?;
        match handle {
            Value::Null => Ok(None),
            handle => element_handle(handle).map(Some),
        }
    }

    async fn release(&self, element: ElementHandle) -> Result<()> {
        self.driver
            .request("dispose", json!({ "element": element.0 }))
            .await?;
        Ok(())
    }
}
