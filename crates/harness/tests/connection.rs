//! Realtime API against the fake server

mod support;

use serde_json::json;
use std::time::Duration;

use hasstest_harness::{AuthClient, Connection, Error, Tokens};
use support::FakeHass;

async fn login(fake: &FakeHass) -> Tokens {
    let client = AuthClient::new(reqwest::Client::new(), fake.url(), &fake.config());
    let code = client.fetch_login_code().await.unwrap();
    client.exchange_code(code).await.unwrap()
}

#[tokio::test]
async fn test_initial_states_arrive() {
    support::init_tracing();
    let fake = FakeHass::start().await;
    let tokens = login(&fake).await;
    let connection = Connection::open(&fake.url(), &tokens).await.unwrap();

    assert_eq!(connection.server_version(), Some("2024.5.3"));
    connection
        .states()
        .wait_for(Duration::from_secs(5), |entities| {
            entities.contains_key("input_number.slider1")
        })
        .await
        .unwrap();
    let slider = connection.states().get("input_number.slider1").unwrap();
    assert_eq!(slider.state, "30.0");
    assert_eq!(slider.attribute("friendly_name"), Some(&json!("Slider 1")));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_service_call_updates_table() {
    let fake = FakeHass::start().await;
    let tokens = login(&fake).await;
    let connection = Connection::open(&fake.url(), &tokens).await.unwrap();

    let reply = connection
        .call_service(
            "input_number",
            "set_value",
            Some(json!({"value": 5})),
            Some(json!({"entity_id": "input_number.slider1"})),
        )
        .await
        .unwrap();
    assert_eq!(reply["context"]["id"], "ctx-1");

    connection
        .states()
        .wait_for_state("input_number.slider1", "5.0", Duration::from_secs(5))
        .await
        .unwrap();
    let slider = connection.states().get("input_number.slider1").unwrap();
    assert_eq!(slider.attribute("max"), Some(&json!(100.0)));
    assert_eq!(fake.entity_state("input_number.slider1").as_deref(), Some("5.0"));
}

#[tokio::test]
async fn test_failed_command_is_protocol_error() {
    let fake = FakeHass::start().await;
    let tokens = login(&fake).await;
    let connection = Connection::open(&fake.url(), &tokens).await.unwrap();

    let result = connection.call_service("light", "turn_on", None, None).await;
    match result {
        Err(Error::Protocol(message)) => assert!(message.starts_with("not_found:")),
        other => panic!("expected protocol error, got {:?}", other),
    }

    connection.ping().await.unwrap();
}

#[tokio::test]
async fn test_invalid_token_is_rejected() {
    let fake = FakeHass::start().await;
    let mut tokens = login(&fake).await;
    tokens.access_token = "forged".to_string();

    let result = Connection::open(&fake.url(), &tokens).await;
    match result {
        Err(Error::Protocol(message)) => assert!(message.contains("Invalid access token")),
        Err(other) => panic!("expected protocol error, got {:?}", other),
        Ok(_) => panic!("forged token was accepted"),
    }
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let fake = FakeHass::start().await;
    let tokens = login(&fake).await;
    let connection = Connection::open(&fake.url(), &tokens).await.unwrap();

    connection.close().await.unwrap();
    connection.close().await.unwrap();
    assert!(connection.is_closed());

    let result = connection.ping().await;
    assert!(matches!(result, Err(Error::Disconnected)));
}
