//! Disposable Home Assistant instance
//!
//! [`HomeAssistant::create`] provisions and starts a private server, onboards
//! an owner account and connects to the realtime API.
//! [`HomeAssistant::connect`] logs in to an instance that is already running.
//! Either way the handle is torn down with [`HomeAssistant::close`].

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::{AuthClient, Onboarding, Tokens};
use crate::browser::{no_browser, BrowserIntegration, DashboardOptions, NoBrowser};
use crate::config::HarnessConfig;
use crate::config_dir::ConfigDir;
use crate::connection::Connection;
use crate::dashboard::Dashboard;
use crate::error::{Error, Result};
use crate::lovelace::{self, DashboardCreate, Lovelace, ResourceType};
use crate::process::ServerProcess;
use crate::provision::Provisioner;
use crate::retry::RetryPolicy;
use crate::states::{EntityState, EntityStateTable};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of an instance handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Provisioning,
    Starting,
    Onboarding,
    Ready,
    Closing,
    Closed,
}

pub struct HomeAssistant<B: BrowserIntegration = NoBrowser> {
    config: HarnessConfig,
    state: InstanceState,
    http: reqwest::Client,
    port: Option<u16>,
    dir: Option<ConfigDir>,
    process: Option<ServerProcess>,
    auth: Option<AuthClient>,
    tokens: Option<Tokens>,
    connection: Option<Connection>,
    lovelace: Lovelace,
    browser: Option<Arc<B>>,
}

impl HomeAssistant<NoBrowser> {
    /// Start a private instance whose configuration is the base HTTP setup
    /// followed by `extra_yaml`
    pub async fn create(extra_yaml: &str, config: HarnessConfig) -> Result<Self> {
        Self::launch(extra_yaml, config, None).await
    }

    /// Log in to the running instance at `config.host:config.port`
    pub async fn connect(config: HarnessConfig) -> Result<Self> {
        Self::attach(config, None).await
    }
}

impl<B: BrowserIntegration> HomeAssistant<B> {
    pub async fn create_with_browser(extra_yaml: &str, config: HarnessConfig, browser: B) -> Result<Self> {
        Self::launch(extra_yaml, config, Some(browser)).await
    }

    pub async fn connect_with_browser(config: HarnessConfig, browser: B) -> Result<Self> {
        Self::attach(config, Some(browser)).await
    }

    fn new(config: HarnessConfig, browser: Option<B>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            config,
            state: InstanceState::Created,
            http,
            port: None,
            dir: None,
            process: None,
            auth: None,
            tokens: None,
            connection: None,
            lovelace: Lovelace::new(),
            browser: browser.map(Arc::new),
        })
    }

    async fn launch(extra_yaml: &str, config: HarnessConfig, browser: Option<B>) -> Result<Self> {
        let mut hass = Self::new(config, browser)?;
        if let Err(e) = hass.start(extra_yaml).await {
            warn!("Startup failed while {:?}: {}", hass.state, e);
            if let Err(cleanup) = hass.shutdown().await {
                warn!("Cleanup after failed startup also failed: {}", cleanup);
            }
            return Err(e);
        }
        Ok(hass)
    }

    async fn attach(config: HarnessConfig, browser: Option<B>) -> Result<Self> {
        let port = config.port.ok_or_else(|| {
            Error::Precondition("connecting to a running instance requires a port".into())
        })?;
        let mut hass = Self::new(config, browser)?;
        hass.port = Some(port);
        if let Err(e) = hass.login().await {
            warn!("Login to {} failed: {}", hass.url().unwrap_or_default(), e);
            if let Err(cleanup) = hass.shutdown().await {
                warn!("Cleanup after failed login also failed: {}", cleanup);
            }
            return Err(e);
        }
        Ok(hass)
    }

    fn transition(&mut self, next: InstanceState) {
        info!(
            port = ?self.port,
            dir = ?self.config_dir(),
            from = ?self.state,
            to = ?next,
            "instance state"
        );
        self.state = next;
    }

    async fn start(&mut self, extra_yaml: &str) -> Result<()> {
        self.transition(InstanceState::Provisioning);
        let dir = ConfigDir::create().await?;
        dir.link_components(&self.config.custom_components).await?;
        let provisioner = Provisioner::new(&self.config, self.http.clone());
        let reservation = provisioner.reserve(&dir, extra_yaml).await?;
        let config_dir = dir.path().to_path_buf();
        self.dir = Some(dir);
        self.port = Some(reservation.port);

        self.transition(InstanceState::Starting);
        let process = ServerProcess::spawn(
            &self.config.hass_binary(),
            &config_dir,
            &self.config.host,
            reservation.port,
            &self.config.hass_args,
            RetryPolicy::readiness(),
        )
        .await?;
        self.process = Some(process);

        self.transition(InstanceState::Onboarding);
        let auth = AuthClient::new(self.http.clone(), self.url()?, &self.config);
        let mut onboarding = Onboarding::new(auth.clone());
        onboarding.create_user(RetryPolicy::account_creation()).await?;
        let tokens = onboarding.issue_token().await?;
        self.connection = Some(Connection::open(auth.base_url(), &tokens).await?);
        onboarding.configure_core().await?;
        onboarding.configure_analytics().await?;
        onboarding.link_integration().await?;
        self.auth = Some(auth);
        self.tokens = Some(tokens);

        self.transition(InstanceState::Ready);
        info!("Home Assistant is ready at {}", self.url()?);
        Ok(())
    }

    async fn login(&mut self) -> Result<()> {
        self.transition(InstanceState::Onboarding);
        let auth = AuthClient::new(self.http.clone(), self.url()?, &self.config);
        let code = auth.fetch_login_code().await?;
        let tokens = auth.exchange_code(code).await?;
        self.connection = Some(Connection::open(auth.base_url(), &tokens).await?);
        self.auth = Some(auth);
        self.tokens = Some(tokens);
        self.transition(InstanceState::Ready);
        Ok(())
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Base URL, e.g. `http://127.0.0.1:8130`
    pub fn url(&self) -> Result<String> {
        let port = self
            .port
            .ok_or_else(|| Error::Precondition("no port has been assigned yet".into()))?;
        Ok(format!("http://{}:{}", self.config.host, port))
    }

    /// Configuration directory of an instance this handle started
    pub fn config_dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(ConfigDir::path)
    }

    pub fn connection(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| Error::Precondition("not connected to Home Assistant".into()))
    }

    fn auth(&self) -> Result<(&AuthClient, &Tokens)> {
        match (&self.auth, &self.tokens) {
            (Some(auth), Some(tokens)) => Ok((auth, tokens)),
            _ => Err(Error::Precondition("not logged in to Home Assistant".into())),
        }
    }

    /// Logged-in link to the default dashboard
    pub async fn link(&self) -> Result<String> {
        self.deep_link("").await
    }

    /// Logged-in link to `path`; a fresh code is minted for every link
    pub async fn deep_link(&self, path: &str) -> Result<String> {
        let (auth, _) = self.auth()?;
        let code = auth.fetch_login_code().await?;
        auth.deep_link(path, code)
    }

    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
        target: Option<Value>,
    ) -> Result<Value> {
        self.connection()?
            .call_service(domain, service, data, target)
            .await
    }

    /// Copy of the current entity table
    pub fn states(&self) -> Result<HashMap<String, EntityState>> {
        Ok(self.connection()?.states().snapshot())
    }

    /// Live entity table
    pub fn entity_states(&self) -> Result<&EntityStateTable> {
        Ok(self.connection()?.states())
    }

    pub async fn wait_for_state(&self, entity_id: &str, state: &str, timeout: Duration) -> Result<()> {
        self.connection()?
            .states()
            .wait_for_state(entity_id, state, timeout)
            .await
    }

    /// Serve `file` from the instance and register it as a dashboard module
    pub async fn add_resource(&self, file: &Path, kind: ResourceType) -> Result<String> {
        self.lovelace
            .add_resource(self.connection()?, self.dir.as_ref(), file, kind)
            .await
    }

    /// Add an integration whose config flow completes in one step
    pub async fn add_integration(&self, name: &str) -> Result<Value> {
        let (auth, tokens) = self.auth()?;
        lovelace::add_integration(auth, tokens, name).await
    }

    pub async fn create_dashboard(&self, options: DashboardCreate) -> Result<String> {
        self.lovelace
            .create_dashboard(self.connection()?, options)
            .await
    }

    pub async fn set_dashboard_view(&self, url_path: &str, cards: &[Value]) -> Result<()> {
        self.lovelace
            .set_dashboard_view(self.connection()?, url_path, cards)
            .await
    }

    /// Create a dashboard showing `cards` and open it in the browser
    pub async fn dashboard(&self, cards: Vec<Value>, options: DashboardOptions) -> Result<Dashboard<B>> {
        let browser = self.browser.as_ref().ok_or_else(no_browser)?;
        let connection = self.connection()?;
        let (auth, _) = self.auth()?;

        let create = DashboardCreate {
            title: options.title.clone(),
            ..Default::default()
        };
        let path = self.lovelace.create_dashboard(connection, create).await?;
        self.lovelace
            .set_dashboard_view(connection, &path, &cards)
            .await?;

        let link = auth.deep_link(&path, auth.fetch_login_code().await?)?;
        let page = browser.open(&link, &options).await?;
        Ok(Dashboard::new(
            path,
            cards.len(),
            page,
            auth.clone(),
            Arc::clone(browser),
        ))
    }

    /// Tear the instance down: browser, connection, process, then directory.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned.
    pub async fn close(mut self) -> Result<()> {
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.state == InstanceState::Closed {
            return Ok(());
        }
        self.transition(InstanceState::Closing);

        let mut first_error: Option<Error> = None;
        let mut record = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!("Failed to {}: {}", step, e);
                first_error.get_or_insert(e);
            }
        };

        if let Some(browser) = self.browser.take() {
            record("close the browser", browser.close().await);
        }
        if let Some(connection) = self.connection.take() {
            record("close the connection", connection.close().await);
        }
        if let Some(mut process) = self.process.take() {
            record("stop Home Assistant", process.stop().await);
        }
        if let Some(dir) = self.dir.take() {
            record("remove the config directory", dir.remove());
        }

        self.transition(InstanceState::Closed);
        first_error.map_or(Ok(()), Err)
    }
}
