//! Account onboarding and token exchange over the HTTP API

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::retry::{Attempt, RetryPolicy};

/// Single-use authorization code.
///
/// Exchanging it or embedding it in a link consumes it; it cannot be cloned.
#[derive(PartialEq, Eq)]
pub struct AuthCode(String);

impl AuthCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for AuthCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthCode(..)")
    }
}

/// Tokens issued for an authorization code
#[derive(Clone, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for Tokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokens")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct LinkState<'a> {
    #[serde(rename = "hassUrl")]
    hass_url: &'a str,
    #[serde(rename = "clientId")]
    client_id: &'a str,
}

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: String,
    language: String,
    display_name: String,
}

/// HTTP client bound to one server and one account
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, config: &HarnessConfig) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            credentials: Credentials {
                username: config.username.clone(),
                password: config.password.clone(),
                language: config.user_language.clone(),
                display_name: config.user_display_name.clone(),
            },
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// OAuth client id: the server URL with a trailing slash
    pub fn client_id(&self) -> String {
        format!("{}/", self.base_url)
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}/?auth_callback=1", self.base_url)
    }

    /// POST a JSON body with `client_id` merged in
    pub async fn post(&self, path: &str, body: Value, token: Option<&Tokens>) -> Result<Value> {
        let mut payload = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::Config(format!(
                    "request body for {} must be an object, got {}",
                    path, other
                )))
            }
        };
        payload.insert("client_id".to_string(), Value::String(self.client_id()));

        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&payload);
        if let Some(token) = token {
            request = request.bearer_auth(&token.access_token);
        }
        let response = request.send().await?;
        decode(path, response).await
    }

    /// Create the owner account, retrying while the onboarding endpoint is
    /// not yet answering with a code
    pub async fn create_user(&self, policy: RetryPolicy) -> Result<AuthCode> {
        let body = json!({
            "language": self.credentials.language,
            "name": self.credentials.display_name,
            "username": self.credentials.username,
            "password": self.credentials.password,
        });

        let code = policy
            .run("owner account creation", |attempt| {
                let body = body.clone();
                async move {
                    match self.post("/api/onboarding/users", body, None).await {
                        Ok(reply) => match reply.get("auth_code").and_then(Value::as_str) {
                            Some(code) => Ok(Attempt::Ready(AuthCode::new(code))),
                            None => Ok(Attempt::Retry(format!("no auth code yet: {}", reply))),
                        },
                        Err(e) => {
                            debug!(attempt, "account creation failed: {}", e);
                            Ok(Attempt::Retry(e.to_string()))
                        }
                    }
                }
            })
            .await?;

        info!("Created user {}", self.credentials.username);
        Ok(code)
    }

    /// Exchange a code for tokens, consuming it
    pub async fn exchange_code(&self, code: AuthCode) -> Result<Tokens> {
        let client_id = self.client_id();
        let form = [
            ("client_id", client_id.as_str()),
            ("code", code.as_str()),
            ("grant_type", "authorization_code"),
        ];
        let response = self
            .http
            .post(format!("{}/auth/token", self.base_url))
            .form(&form)
            .send()
            .await?;
        let reply = decode("/auth/token", response).await?;

        if let Some(error) = reply.get("error") {
            let description = reply
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Err(Error::Protocol(format!(
                "token exchange failed with {}: {}",
                error, description
            )));
        }
        Ok(serde_json::from_value(reply)?)
    }

    /// Run an onboarding step that needs the owner's token
    pub async fn onboarding_step(&self, step: &str, body: Value, token: &Tokens) -> Result<Value> {
        let path = format!("/api/onboarding/{}", step);
        let reply = self.post(&path, body, Some(token)).await?;
        if let Some(error) = reply.get("error").or_else(|| reply.get("message")) {
            return Err(Error::Protocol(format!("onboarding step {} failed: {}", step, error)));
        }
        Ok(reply)
    }

    /// Mint a fresh code by walking the login flow with the configured account
    pub async fn fetch_login_code(&self) -> Result<AuthCode> {
        let flow = self
            .post(
                "/auth/login_flow",
                json!({
                    "handler": ["homeassistant", null],
                    "redirect_uri": self.redirect_uri(),
                }),
                None,
            )
            .await?;
        let flow_id = flow
            .get("flow_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol(format!("login flow was not started: {}", flow)))?;

        let reply = self
            .post(
                &format!("/auth/login_flow/{}", flow_id),
                json!({
                    "username": self.credentials.username,
                    "password": self.credentials.password,
                }),
                None,
            )
            .await?;
        if let Some(error) = reply.get("error") {
            return Err(Error::Protocol(format!("login flow failed: {}", error)));
        }
        match reply.get("result").and_then(Value::as_str) {
            Some(code) => Ok(AuthCode::new(code)),
            None => Err(Error::Protocol(format!(
                "login flow did not return a code: {}",
                reply.get("errors").unwrap_or(&reply)
            ))),
        }
    }

    /// URL that logs a browser in and lands on `path`.
    ///
    /// `path` is relative to the server root, without a leading slash.
    pub fn deep_link(&self, path: &str, code: AuthCode) -> Result<String> {
        let client_id = self.client_id();
        let state = serde_json::to_vec(&LinkState {
            hass_url: &self.base_url,
            client_id: &client_id,
        })?;
        let state = base64::engine::general_purpose::STANDARD.encode(state);
        Ok(format!(
            "{}/{}?auth_callback=1&code={}&state={}",
            self.base_url,
            path.trim_start_matches('/'),
            urlencoding::encode(&code.into_inner()),
            urlencoding::encode(&state)
        ))
    }
}

/// Parse a reply body as JSON, reporting non-JSON bodies with their status
async fn decode(path: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|_| {
        Error::Protocol(format!("{} answered {} with a non-JSON body: {}", path, status, text))
    })
}

/// Progress through first-run onboarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OnboardingState {
    Unauthenticated,
    UserCreated,
    TokenIssued,
    CoreConfigured,
    AnalyticsConfigured,
    IntegrationLinked,
}

/// Onboarding driven one step at a time; steps must run in order
pub struct Onboarding {
    client: AuthClient,
    state: OnboardingState,
    code: Option<AuthCode>,
    tokens: Option<Tokens>,
}

impl Onboarding {
    pub fn new(client: AuthClient) -> Self {
        Self {
            client,
            state: OnboardingState::Unauthenticated,
            code: None,
            tokens: None,
        }
    }

    pub fn state(&self) -> OnboardingState {
        self.state
    }

    pub fn tokens(&self) -> Option<&Tokens> {
        self.tokens.as_ref()
    }

    fn require_state(&self, expected: OnboardingState, step: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::Precondition(format!(
                "{} requires onboarding state {:?}, found {:?}",
                step, expected, self.state
            )))
        }
    }

    fn advance(&mut self, next: OnboardingState) {
        debug!(from = ?self.state, to = ?next, "onboarding");
        self.state = next;
    }

    pub async fn create_user(&mut self, policy: RetryPolicy) -> Result<()> {
        self.require_state(OnboardingState::Unauthenticated, "user creation")?;
        self.code = Some(self.client.create_user(policy).await?);
        self.advance(OnboardingState::UserCreated);
        Ok(())
    }

    pub async fn issue_token(&mut self) -> Result<Tokens> {
        self.require_state(OnboardingState::UserCreated, "token exchange")?;
        let code = self
            .code
            .take()
            .ok_or_else(|| Error::Precondition("no authorization code to exchange".into()))?;
        let tokens = self.client.exchange_code(code).await?;
        self.tokens = Some(tokens.clone());
        self.advance(OnboardingState::TokenIssued);
        Ok(tokens)
    }

    fn issued(&self) -> Result<&Tokens> {
        self.tokens
            .as_ref()
            .ok_or_else(|| Error::Precondition("no access token issued".into()))
    }

    pub async fn configure_core(&mut self) -> Result<()> {
        self.require_state(OnboardingState::TokenIssued, "core config")?;
        self.client
            .onboarding_step("core_config", json!({}), self.issued()?)
            .await?;
        self.advance(OnboardingState::CoreConfigured);
        Ok(())
    }

    pub async fn configure_analytics(&mut self) -> Result<()> {
        self.require_state(OnboardingState::CoreConfigured, "analytics")?;
        self.client
            .onboarding_step("analytics", json!({}), self.issued()?)
            .await?;
        self.advance(OnboardingState::AnalyticsConfigured);
        Ok(())
    }

    /// Finish onboarding; the returned code belongs to the integration step
    pub async fn link_integration(&mut self) -> Result<AuthCode> {
        self.require_state(OnboardingState::AnalyticsConfigured, "integration")?;
        let body = json!({ "redirect_uri": self.client.redirect_uri() });
        let reply = self
            .client
            .onboarding_step("integration", body, self.issued()?)
            .await?;
        let code = reply
            .get("auth_code")
            .and_then(Value::as_str)
            .map(AuthCode::new)
            .ok_or_else(|| {
                warn!("integration step returned no code: {}", reply);
                Error::Protocol(format!("integration step returned no auth code: {}", reply))
            })?;
        self.advance(OnboardingState::IntegrationLinked);
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AuthClient {
        AuthClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:8130",
            &HarnessConfig::default(),
        )
    }

    #[test]
    fn test_client_id_and_redirect() {
        let client = client();
        assert_eq!(client.client_id(), "http://127.0.0.1:8130/");
        assert_eq!(client.redirect_uri(), "http://127.0.0.1:8130/?auth_callback=1");
    }

    #[test]
    fn test_deep_link_shape() {
        let link = client()
            .deep_link("lovelace-1", AuthCode::new("abc/123"))
            .unwrap();
        assert!(link.starts_with("http://127.0.0.1:8130/lovelace-1?auth_callback=1&code=abc%2F123&state="));

        let state = link.split("&state=").nth(1).unwrap();
        let state = urlencoding::decode(state).unwrap();
        let state = base64::engine::general_purpose::STANDARD
            .decode(state.as_bytes())
            .unwrap();
        let state: Value = serde_json::from_slice(&state).unwrap();
        assert_eq!(state["hassUrl"], "http://127.0.0.1:8130");
        assert_eq!(state["clientId"], "http://127.0.0.1:8130/");
    }

    #[test]
    fn test_root_link() {
        let link = client().deep_link("", AuthCode::new("c")).unwrap();
        assert!(link.starts_with("http://127.0.0.1:8130/?auth_callback=1&code=c&state="));
    }

    #[test]
    fn test_secrets_not_debug_printed() {
        assert_eq!(format!("{:?}", AuthCode::new("secret")), "AuthCode(..)");
        let tokens = Tokens {
            access_token: "secret".into(),
            token_type: Some("Bearer".into()),
            refresh_token: Some("secret".into()),
            expires_in: Some(1800),
        };
        assert!(!format!("{:?}", tokens).contains("secret"));
    }

    #[tokio::test]
    async fn test_steps_out_of_order_are_rejected() {
        let mut onboarding = Onboarding::new(client());
        let result = onboarding.configure_core().await;
        assert!(matches!(result, Err(Error::Precondition(_))));
        let result = onboarding.issue_token().await;
        assert!(matches!(result, Err(Error::Precondition(_))));
        assert_eq!(onboarding.state(), OnboardingState::Unauthenticated);
    }
}
