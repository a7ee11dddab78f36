//! In-process stand-in for a Home Assistant server and a browser
//!
//! Implements just enough of the onboarding, auth, config-flow and realtime
//! APIs for the harness to run end to end without Python.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures::{SinkExt, StreamExt};
use hasstest_dom::{diffable_html, DiffOptions, Element, Node};
use hasstest_harness::browser::{BrowserIntegration, BrowserPage, DashboardOptions};
use hasstest_harness::{Error, HarnessConfig, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const USERNAME: &str = "dev";
pub const PASSWORD: &str = "dev";

/// Observable server-side state
#[derive(Default)]
pub struct FakeState {
    /// Account creation attempts answered without a code
    pub user_attempts_before_ready: u32,
    pub user_attempts: u32,
    pub onboarding_steps: Vec<String>,
    pub issued_codes: Vec<String>,
    pub redeemed_codes: Vec<String>,
    unused_codes: HashSet<String>,
    tokens: HashSet<String>,
    flows: HashSet<String>,
    counter: u64,
    /// Entity id to compressed state (`s`, `a`, `lu`)
    pub entities: BTreeMap<String, Value>,
    pub dashboards: Vec<Value>,
    pub views: HashMap<String, Value>,
    pub resources: Vec<Value>,
    pub service_calls: Vec<Value>,
}

impl FakeState {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn issue_code(&mut self) -> String {
        let code = format!("code-{}", self.next());
        self.unused_codes.insert(code.clone());
        self.issued_codes.push(code.clone());
        code
    }

    /// Redeem a code once; later attempts fail
    pub fn redeem(&mut self, code: &str) -> bool {
        if self.unused_codes.remove(code) {
            self.redeemed_codes.push(code.to_string());
            true
        } else {
            false
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| self.tokens.contains(token))
    }
}

type Shared = Arc<Mutex<FakeState>>;

pub struct FakeHass {
    pub addr: SocketAddr,
    pub state: Shared,
    task: JoinHandle<()>,
}

impl FakeHass {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(setup: impl FnOnce(&mut FakeState)) -> Self {
        let mut state = FakeState::default();
        state.entities.insert(
            "input_number.slider1".to_string(),
            json!({
                "s": "30.0",
                "a": {"min": 0.0, "max": 100.0, "step": 1.0, "friendly_name": "Slider 1"},
                "lc": 1700000000.0
            }),
        );
        setup(&mut state);
        let state = Arc::new(Mutex::new(state));

        let app = Router::new()
            .route("/api/onboarding/users", post(create_user))
            .route("/api/onboarding/:step", post(onboarding_step))
            .route("/auth/token", post(token))
            .route("/auth/login_flow", post(start_login_flow))
            .route("/auth/login_flow/:flow_id", post(finish_login_flow))
            .route("/api/config/config_entries/flow", post(config_flow))
            .route("/api/websocket", get(websocket))
            .route("/pypi/homeassistant/json", get(registry))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Harness configuration pointing at this server
    pub fn config(&self) -> HarnessConfig {
        HarnessConfig {
            host: self.addr.ip().to_string(),
            port: Some(self.addr.port()),
            username: USERNAME.to_string(),
            password: PASSWORD.to_string(),
            ..Default::default()
        }
    }

    pub fn entity_state(&self, entity_id: &str) -> Option<String> {
        self.state
            .lock()
            .entities
            .get(entity_id)
            .and_then(|e| e["s"].as_str())
            .map(String::from)
    }
}

impl Drop for FakeHass {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn create_user(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock();
    state.user_attempts += 1;
    if state.user_attempts <= state.user_attempts_before_ready || body.get("client_id").is_none() {
        return Json(json!({}));
    }
    if body["username"] != USERNAME {
        return Json(json!({"message": "unexpected username"}));
    }
    state.onboarding_steps.push("user".to_string());
    let code = state.issue_code();
    Json(json!({ "auth_code": code }))
}

async fn onboarding_step(
    State(state): State<Shared>,
    Path(step): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock();
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "401: Unauthorized").into_response();
    }
    state.onboarding_steps.push(step.clone());
    match step.as_str() {
        "core_config" | "analytics" => Json(json!({})).into_response(),
        "integration" if body.get("redirect_uri").is_some() => {
            let code = state.issue_code();
            Json(json!({ "auth_code": code })).into_response()
        }
        _ => (StatusCode::NOT_FOUND, Json(json!({"message": "Unknown step"}))).into_response(),
    }
}

async fn token(State(state): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Response {
    let mut state = state.lock();
    let code = form.get("code").cloned().unwrap_or_default();
    if form.get("grant_type").map(String::as_str) != Some("authorization_code") || !state.redeem(&code) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_request", "error_description": "Invalid code"})),
        )
            .into_response();
    }
    let token = format!("token-{}", state.next());
    state.tokens.insert(token.clone());
    Json(json!({
        "access_token": token,
        "token_type": "Bearer",
        "refresh_token": "refresh",
        "expires_in": 1800
    }))
    .into_response()
}

async fn start_login_flow(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock();
    assert_eq!(body["handler"], json!(["homeassistant", null]));
    let flow_id = format!("flow-{}", state.next());
    state.flows.insert(flow_id.clone());
    Json(json!({"type": "form", "flow_id": flow_id, "step_id": "init"}))
}

async fn finish_login_flow(
    State(state): State<Shared>,
    Path(flow_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock();
    if !state.flows.remove(&flow_id) {
        return (StatusCode::NOT_FOUND, Json(json!({"message": "Invalid flow specified"}))).into_response();
    }
    if body["username"] != USERNAME || body["password"] != PASSWORD {
        return Json(json!({"type": "form", "errors": {"base": "invalid_auth"}})).into_response();
    }
    let code = state.issue_code();
    Json(json!({"type": "create_entry", "result": code})).into_response()
}

async fn config_flow(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let state = state.lock();
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "401: Unauthorized").into_response();
    }
    match body["handler"].as_str() {
        Some("demo") => Json(json!({
            "type": "create_entry",
            "result": {"entry_id": "entry-demo", "domain": "demo", "title": "Demo"}
        }))
        .into_response(),
        Some("hue") => Json(json!({"type": "form", "flow_id": "flow-hue", "step_id": "init"})).into_response(),
        _ => (StatusCode::BAD_REQUEST, Json(json!({"message": "Invalid handler specified"}))).into_response(),
    }
}

async fn registry() -> Json<Value> {
    Json(json!({"info": {"name": "homeassistant", "version": "2024.5.3"}}))
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<Shared>) -> Response {
    ws.on_upgrade(move |socket| session(socket, state))
}

fn result(id: u64, value: Value) -> Value {
    json!({"id": id, "type": "result", "success": true, "result": value})
}

fn failure(id: u64, code: &str, message: &str) -> Value {
    json!({"id": id, "type": "result", "success": false, "error": {"code": code, "message": message}})
}

async fn session(socket: WebSocket, state: Shared) {
    let (mut tx, mut rx) = socket.split();
    let send = |value: Value| Message::Text(value.to_string());

    if tx.send(send(json!({"type": "auth_required", "ha_version": "2024.5.3"}))).await.is_err() {
        return;
    }
    let Some(Ok(Message::Text(auth))) = rx.next().await else {
        return;
    };
    let auth: Value = serde_json::from_str(&auth).unwrap_or_default();
    let valid = auth["type"] == "auth"
        && auth["access_token"]
            .as_str()
            .is_some_and(|t| state.lock().tokens.contains(t));
    if !valid {
        let _ = tx
            .send(send(json!({"type": "auth_invalid", "message": "Invalid access token or password"})))
            .await;
        return;
    }
    if tx.send(send(json!({"type": "auth_ok", "ha_version": "2024.5.3"}))).await.is_err() {
        return;
    }

    let mut subscription: Option<u64> = None;
    while let Some(Ok(message)) = rx.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let command: Value = serde_json::from_str(&text).unwrap_or_default();
        let id = command["id"].as_u64().unwrap_or_default();
        let replies = handle(&state, &command, id, &mut subscription);
        for reply in replies {
            if tx.send(send(reply)).await.is_err() {
                return;
            }
        }
    }
}

fn handle(state: &Shared, command: &Value, id: u64, subscription: &mut Option<u64>) -> Vec<Value> {
    let mut state = state.lock();
    match command["type"].as_str().unwrap_or_default() {
        "subscribe_entities" => {
            *subscription = Some(id);
            let added: serde_json::Map<String, Value> = state
                .entities
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            vec![
                result(id, Value::Null),
                json!({"id": id, "type": "event", "event": {"a": added}}),
            ]
        }
        "call_service" => {
            state.service_calls.push(command.clone());
            let domain = command["domain"].as_str().unwrap_or_default();
            let service = command["service"].as_str().unwrap_or_default();
            if (domain, service) != ("input_number", "set_value") {
                return vec![failure(id, "not_found", &format!("Service {}.{} not found.", domain, service))];
            }
            let entity_id = command["target"]["entity_id"].as_str().unwrap_or_default().to_string();
            let Some(value) = command["service_data"]["value"].as_f64() else {
                return vec![failure(id, "invalid_format", "value is required")];
            };
            let Some(entity) = state.entities.get_mut(&entity_id) else {
                return vec![failure(id, "not_found", "Entity not found")];
            };
            let new_state = format!("{:.1}", value);
            entity["s"] = Value::String(new_state.clone());
            entity["lu"] = json!(1700000100.0);

            let mut replies = vec![result(id, json!({"context": {"id": "ctx-1"}}))];
            if let Some(sub) = subscription {
                replies.push(json!({
                    "id": sub,
                    "type": "event",
                    "event": {"c": {entity_id: {"+": {"s": new_state, "lc": 1700000100.0}}}}
                }));
            }
            replies
        }
        "lovelace/dashboards/create" => {
            let mut dashboard = command.clone();
            if let Some(map) = dashboard.as_object_mut() {
                map.remove("id");
                map.remove("type");
            }
            state.dashboards.push(dashboard.clone());
            vec![result(id, dashboard)]
        }
        "lovelace/config/save" => {
            let url_path = command["url_path"].as_str().unwrap_or_default().to_string();
            state.views.insert(url_path, command["config"].clone());
            vec![result(id, Value::Null)]
        }
        "lovelace/resources/create" => {
            let resource = json!({"res_type": command["res_type"], "url": command["url"]});
            state.resources.push(resource.clone());
            vec![result(id, resource)]
        }
        "ping" => vec![json!({"id": id, "type": "pong"})],
        other => vec![failure(id, "unknown_command", &format!("Unknown command {}", other))],
    }
}

/// Browser stand-in that renders entities cards from the fake's stored views
#[derive(Clone)]
pub struct FakeBrowser {
    pub state: Shared,
    pub opened: Arc<Mutex<Vec<String>>>,
    pub headed: Arc<Mutex<Vec<String>>>,
    pub closes: Arc<Mutex<u32>>,
    /// Element handles handed out and not yet released
    pub live_elements: Arc<Mutex<i64>>,
}

impl FakeBrowser {
    pub fn new(fake: &FakeHass) -> Self {
        Self {
            state: Arc::clone(&fake.state),
            opened: Arc::default(),
            headed: Arc::default(),
            closes: Arc::default(),
            live_elements: Arc::default(),
        }
    }
}

fn query_param<'a>(url: &'a str, name: &str) -> Option<&'a str> {
    let query = url.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(name)?.strip_prefix('='))
}

#[async_trait]
impl BrowserIntegration for FakeBrowser {
    type Page = FakePage;

    async fn open(&self, url: &str, _options: &DashboardOptions) -> Result<FakePage> {
        self.opened.lock().push(url.to_string());
        let code = query_param(url, "code")
            .ok_or_else(|| Error::Browser(format!("not a login link: {}", url)))?;
        let code = urlencoding::decode(code).map_err(|e| Error::Browser(e.to_string()))?;
        if !self.state.lock().redeem(&code) {
            return Err(Error::Browser(format!("code {} rejected", code)));
        }
        let path = url
            .split_once("://")
            .and_then(|(_, rest)| rest.split_once('/'))
            .map(|(_, path)| path.split('?').next().unwrap_or_default().to_string())
            .unwrap_or_default();
        Ok(FakePage {
            state: Arc::clone(&self.state),
            path,
            live_elements: Arc::clone(&self.live_elements),
        })
    }

    async fn open_in_headed(&self, url: &str) -> Result<()> {
        self.headed.lock().push(url.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.closes.lock() += 1;
        Ok(())
    }
}

pub struct FakePage {
    state: Shared,
    pub path: String,
    live_elements: Arc<Mutex<i64>>,
}

/// Card index plus the selectors narrowing it
#[derive(Debug, Clone)]
pub struct FakeElement {
    card: usize,
    selectors: Vec<String>,
}

impl FakePage {
    fn render_card(&self, n: usize) -> Result<Node> {
        let state = self.state.lock();
        let card = state
            .views
            .get(&self.path)
            .and_then(|config| config["views"][0]["cards"].get(n))
            .cloned()
            .ok_or_else(|| Error::Browser(format!("no card {} on {}", n, self.path)))?;

        let mut content = Element::new("div").attr("class", "card-content");
        for entity_id in card["entities"].as_array().into_iter().flatten() {
            let entity_id = entity_id.as_str().unwrap_or_default();
            let entity = state.entities.get(entity_id).cloned().unwrap_or_default();
            let name = entity["a"]["friendly_name"].as_str().unwrap_or(entity_id).to_string();
            let value = entity["s"].as_str().unwrap_or("unavailable").to_string();
            content = content.child(
                Element::new("hui-input-number-entity-row")
                    .attr("class", "entity  row")
                    .attr("data-entity", entity_id)
                    .child(Element::new("span").attr("class", "name").text(name))
                    .child(Element::new("ha-slider").attr("value", value.clone()).child(Element::new("div").attr("class", "knob")))
                    .child(Element::new("span").attr("class", "state").text(format!(" {} ", value))),
            );
        }

        let tag = format!("hui-{}-card", card["type"].as_str().unwrap_or("unknown"));
        Ok(Element::new(tag)
            .shadow(vec![Element::new("ha-card")
                .attr("class", "type-entities")
                .attr("id", "")
                .child(Element::new("style").text(".card-content { padding: 16px; }"))
                .child(content)
                .into()])
            .into())
    }

    fn resolve(&self, element: &FakeElement) -> Result<Node> {
        let mut node = self.render_card(element.card)?;
        for selector in &element.selectors {
            node = find_in(&node, selector)
                .cloned()
                .ok_or_else(|| Error::Browser(format!("nothing matches {}", selector)))?;
        }
        Ok(node)
    }
}

fn matches(element: &Element, selector: &str) -> bool {
    match selector.strip_prefix('.') {
        Some(class) => element
            .attribute("class")
            .is_some_and(|c| c.split_whitespace().any(|token| token == class)),
        None => element.tag == selector,
    }
}

/// Depth-first search through shadow roots and light children
fn find_in<'a>(node: &'a Node, selector: &str) -> Option<&'a Node> {
    let Node::Element(element) = node else {
        return None;
    };
    let descendants = element.shadow_root.iter().flatten().chain(element.children.iter());
    for child in descendants {
        if let Node::Element(candidate) = child {
            if matches(candidate, selector) {
                return Some(child);
            }
        }
        if let Some(found) = find_in(child, selector) {
            return Some(found);
        }
    }
    None
}

fn text_of(node: &Node, out: &mut String) {
    match node {
        Node::Text { text } => out.push_str(text),
        Node::Element(element) => {
            for child in element.shadow_root.iter().flatten().chain(element.children.iter()) {
                text_of(child, out);
            }
        }
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    type Element = FakeElement;

    async fn nth_card(&self, n: usize) -> Result<FakeElement> {
        self.render_card(n)?;
        *self.live_elements.lock() += 1;
        Ok(FakeElement {
            card: n,
            selectors: Vec::new(),
        })
    }

    async fn shadow_html(&self, element: &FakeElement, options: &DiffOptions) -> Result<String> {
        Ok(diffable_html(&self.resolve(element)?, options)?)
    }

    async fn text_content(&self, element: &FakeElement) -> Result<String> {
        let mut text = String::new();
        text_of(&self.resolve(element)?, &mut text);
        Ok(text)
    }

    async fn screenshot(&self, element: &FakeElement) -> Result<Vec<u8>> {
        self.resolve(element)?;
        Ok(b"\x89PNG\r\n\x1a\n".to_vec())
    }

    async fn find(&self, element: &FakeElement, selector: &str) -> Result<Option<FakeElement>> {
        let node = self.resolve(element)?;
        Ok(find_in(&node, selector).map(|_| {
            *self.live_elements.lock() += 1;
            let mut selectors = element.selectors.clone();
            selectors.push(selector.to_string());
            FakeElement {
                card: element.card,
                selectors,
            }
        }))
    }

    async fn release(&self, _element: FakeElement) -> Result<()> {
        *self.live_elements.lock() -= 1;
        Ok(())
    }
}
