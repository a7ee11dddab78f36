//! Authenticated WebSocket connection to the server's realtime API
//!
//! Commands carry an incrementing `id` and are answered by a `result` frame
//! with the same id. A background reader routes results to their callers and
//! entity events into the shared [`EntityStateTable`].

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, protocol::Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::auth::Tokens;
use crate::error::{Error, Result};
use crate::rpc::PendingCalls;
use crate::states::{EntityDelta, EntityStateTable};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Derive the realtime endpoint from an `http(s)://host:port` base URL
pub fn websocket_url(base_url: &str) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        Ok(format!("wss://{}/api/websocket", rest))
    } else if let Some(rest) = base.strip_prefix("http://") {
        Ok(format!("ws://{}/api/websocket", rest))
    } else {
        Err(Error::Config(format!("not an http(s) URL: {}", base_url)))
    }
}

struct Shared {
    pending: PendingCalls,
    states: EntityStateTable,
    /// Message id of the entity subscription; 0 until subscribed
    entity_subscription: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn dispatch(&self, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable frame: {}", e);
                return;
            }
        };
        match message {
            Value::Array(batch) => batch.into_iter().for_each(|m| self.route(m)),
            message => self.route(message),
        }
    }

    fn route(&self, mut message: Value) {
        let id = message.get("id").and_then(Value::as_u64).unwrap_or_default();
        match message.get("type").and_then(Value::as_str) {
            Some("result") => {
                let reply = if message.get("success").and_then(Value::as_bool) == Some(true) {
                    Ok(message.get_mut("result").map(Value::take).unwrap_or(Value::Null))
                } else {
                    Err(command_error(&message))
                };
                if !self.pending.resolve(id, reply) {
                    trace!(id, "result for unknown command");
                }
            }
            Some("event") if id != 0 && id == self.entity_subscription.load(Ordering::SeqCst) => {
                let event = message.get_mut("event").map(Value::take).unwrap_or(Value::Null);
                match serde_json::from_value::<EntityDelta>(event) {
                    Ok(delta) => self.states.apply(delta),
                    Err(e) => warn!("Malformed entity event: {}", e),
                }
            }
            Some("pong") => {
                self.pending.resolve(id, Ok(Value::Null));
            }
            other => trace!(id, kind = ?other, "ignoring message"),
        }
    }
}

fn command_error(message: &Value) -> Error {
    let error = message.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let text = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("no message");
    Error::Protocol(format!("{}: {}", code, text))
}

/// Live connection; cheap to share behind `&`
pub struct Connection {
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, WsMessage>>>,
    shared: Arc<Shared>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    server_version: Option<String>,
}

impl Connection {
    /// Connect, authenticate with `tokens`, and subscribe to entity changes
    pub async fn open(base_url: &str, tokens: &Tokens) -> Result<Self> {
        let url = websocket_url(base_url)?;
        debug!("Connecting to {}", url);
        let (mut ws, _) = connect_async(url.as_str()).await?;

        let greeting = next_json(&mut ws).await?;
        if greeting.get("type").and_then(Value::as_str) != Some("auth_required") {
            return Err(Error::Protocol(format!("unexpected greeting: {}", greeting)));
        }
        let auth = json!({ "type": "auth", "access_token": tokens.access_token });
        ws.send(WsMessage::Text(auth.to_string())).await?;

        let reply = next_json(&mut ws).await?;
        match reply.get("type").and_then(Value::as_str) {
            Some("auth_ok") => {}
            Some("auth_invalid") => {
                return Err(Error::Protocol(format!(
                    "authentication rejected: {}",
                    reply.get("message").and_then(Value::as_str).unwrap_or("no reason given")
                )))
            }
            _ => return Err(Error::Protocol(format!("unexpected auth reply: {}", reply))),
        }
        let server_version = reply
            .get("ha_version")
            .and_then(Value::as_str)
            .map(String::from);
        info!(
            "Connected to Home Assistant {}",
            server_version.as_deref().unwrap_or("(unknown version)")
        );

        let (sink, stream) = ws.split();
        let shared = Arc::new(Shared {
            pending: PendingCalls::new(),
            states: EntityStateTable::new(),
            entity_subscription: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&shared)));

        let connection = Self {
            sink: tokio::sync::Mutex::new(Some(sink)),
            shared,
            reader: parking_lot::Mutex::new(Some(reader)),
            server_version,
        };
        connection.subscribe_entities().await?;
        Ok(connection)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn states(&self) -> &EntityStateTable {
        &self.shared.states
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn subscribe_entities(&self) -> Result<()> {
        let (id, reply) = self.shared.pending.register();
        self.shared.entity_subscription.store(id, Ordering::SeqCst);
        self.send_with_id(id, json!({ "type": "subscribe_entities" }))
            .await?;
        reply.await.map_err(|_| Error::Disconnected)??;
        debug!(id, "subscribed to entity changes");
        Ok(())
    }

    /// Send a command and wait for its result.
    ///
    /// Unsuccessful results become [`Error::Protocol`] carrying the server's
    /// code and message.
    pub async fn call(&self, command: Value) -> Result<Value> {
        let (id, reply) = self.shared.pending.register();
        if let Err(e) = self.send_with_id(id, command).await {
            self.shared.pending.cancel(id);
            return Err(e);
        }
        reply.await.map_err(|_| Error::Disconnected)?
    }

    async fn send_with_id(&self, id: u64, command: Value) -> Result<()> {
        let Value::Object(mut message) = command else {
            return Err(Error::Config(format!("command must be an object: {}", command)));
        };
        message.insert("id".to_string(), Value::from(id));
        let text = Value::Object(message).to_string();
        trace!(id, "-> {}", text);

        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(Error::Disconnected)?;
        sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(json!({ "type": "ping" })).await.map(|_| ())
    }

    /// Invoke a service, e.g. `input_number.set_value`
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
        target: Option<Value>,
    ) -> Result<Value> {
        let mut command = json!({
            "type": "call_service",
            "domain": domain,
            "service": service,
        });
        if let Some(data) = data {
            command["service_data"] = data;
        }
        if let Some(target) = target {
            command["target"] = target;
        }
        debug!("Calling service {}.{}", domain, service);
        self.call(command).await
    }

    /// Close the socket; later calls are no-ops
    pub async fn close(&self) -> Result<()> {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return Ok(());
        };
        let result = sink.close().await;

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.pending.fail_all();
        debug!("WebSocket connection closed");

        match result {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => shared.dispatch(&text),
            Ok(WsMessage::Close(frame)) => {
                debug!("Server closed the connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket read failed: {}", e);
                break;
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.pending.fail_all();
}

/// Next text frame parsed as JSON, skipping control frames
async fn next_json(ws: &mut WsStream) -> Result<Value> {
    while let Some(frame) = ws.next().await {
        match frame? {
            WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
            WsMessage::Close(_) => return Err(Error::Disconnected),
            _ => continue,
        }
    }
    Err(Error::Disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    #[test_case("http://127.0.0.1:8130", "ws://127.0.0.1:8130/api/websocket" ; "plain")]
    #[test_case("https://hass.local/", "wss://hass.local/api/websocket" ; "tls with trailing slash")]
    fn test_websocket_url(base: &str, expected: &str) {
        assert_eq!(websocket_url(base).unwrap(), expected);
    }

    #[test]
    fn test_websocket_url_rejects_other_schemes() {
        assert!(matches!(websocket_url("ftp://x"), Err(Error::Config(_))));
    }

    fn shared() -> Shared {
        Shared {
            pending: PendingCalls::new(),
            states: EntityStateTable::new(),
            entity_subscription: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn test_result_routing() {
        let shared = shared();
        let (ok_id, ok) = shared.pending.register();
        let (err_id, err) = shared.pending.register();

        shared.dispatch(&format!(
            r#"{{"id":{},"type":"result","success":true,"result":{{"url_path":"lovelace-1"}}}}"#,
            ok_id
        ));
        shared.dispatch(&format!(
            r#"{{"id":{},"type":"result","success":false,"error":{{"code":"not_found","message":"Service not found"}}}}"#,
            err_id
        ));

        assert_eq!(ok.await.unwrap().unwrap()["url_path"], "lovelace-1");
        match err.await.unwrap() {
            Err(Error::Protocol(message)) => assert_eq!(message, "not_found: Service not found"),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_entity_events_only_from_subscription() {
        let shared = shared();
        shared.entity_subscription.store(7, Ordering::SeqCst);

        shared.dispatch(r#"{"id":3,"type":"event","event":{"a":{"light.a":{"s":"on"}}}}"#);
        assert!(shared.states.is_empty());

        shared.dispatch(r#"[{"id":7,"type":"event","event":{"a":{"light.a":{"s":"on"}}}}]"#);
        assert_eq!(shared.states.get("light.a").unwrap().state, "on");
    }
}
