#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use homehub_client_sdk::config::RefreshConfig;
use homehub_client_sdk::error::Kind;
use homehub_client_sdk::protocol::ProtocolError;
use homehub_client_sdk::protocol::message::OutboundMessage;
use homehub_client_sdk::rest::RestClient;
use homehub_client_sdk::{Config, ConnectionState, EntityStore, LifecycleEvent, ProtocolClient};
use secrecy::SecretString;
use serde_json::json;
use tokio::time::timeout;

use common::{MockHubServer, record_json, state_changed_frame, test_config};

/// Build a protocol client against the mock controller. The REST endpoint is
/// a dead address; these tests never touch the non-realtime channel.
fn client_for(server: &MockHubServer, config: Config) -> (ProtocolClient, Arc<EntityStore>) {
    let token = SecretString::from("test-token");
    let rest = RestClient::new("http://127.0.0.1:9/", &token).unwrap();
    let store = Arc::new(EntityStore::new(rest, RefreshConfig::default()));
    let client = ProtocolClient::new(server.ws_url(), token, config, Arc::clone(&store));
    (client, store)
}

/// Drive the standard handshake: connection, credential frame, `auth_ok`.
async fn handshake(server: &mut MockHubServer) -> serde_json::Value {
    assert!(server.wait_connection().await, "no connection accepted");
    let auth = server.recv_frame_of("auth").await.expect("no auth frame");
    server.send(&json!({ "type": "auth_ok" }));
    auth
}

async fn connect_and_authenticate(
    server: &mut MockHubServer,
    client: &ProtocolClient,
) -> serde_json::Value {
    let connector = client.clone();
    let task = tokio::spawn(async move { connector.connect().await });
    let auth = handshake(server).await;
    task.await.unwrap().unwrap();
    auth
}

#[tokio::test]
async fn connect_resolves_after_auth_ok() {
    let mut server = MockHubServer::start().await;
    let (client, _store) = client_for(&server, test_config());
    let mut lifecycle = client.lifecycle();

    let auth = connect_and_authenticate(&mut server, &client).await;

    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["access_token"], "test-token");
    assert!(
        auth.get("id").is_none(),
        "credential frame must not carry a correlation id"
    );
    assert_eq!(client.state(), ConnectionState::Authenticated);
    assert_eq!(
        lifecycle.recv().await.unwrap(),
        LifecycleEvent::Authenticated
    );
}

#[tokio::test]
async fn initial_open_failure_reports_the_transport_error() {
    let token = SecretString::from("test-token");
    let rest = RestClient::new("http://127.0.0.1:9/", &token).unwrap();
    let store = Arc::new(EntityStore::new(rest, RefreshConfig::default()));
    // Nothing listens on the discard port; the open itself must fail
    let client = ProtocolClient::new(
        "ws://127.0.0.1:9/".to_owned(),
        token,
        test_config(),
        store,
    );

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), Kind::WebSocket);
    assert!(
        matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Connection(_))
        ),
        "an unreachable controller must be distinguishable from a teardown"
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn request_without_connection_fails_fast() {
    let server = MockHubServer::start().await;
    let (client, _store) = client_for(&server, test_config());

    let err = client.get_services().await.unwrap_err();
    assert_eq!(err.kind(), Kind::WebSocket);
    assert!(matches!(
        err.downcast_ref::<ProtocolError>(),
        Some(ProtocolError::NotConnected)
    ));
}

#[tokio::test]
async fn replies_resolve_by_correlation_id_out_of_order() {
    let mut server = MockHubServer::start().await;
    let (client, _store) = client_for(&server, test_config());
    connect_and_authenticate(&mut server, &client).await;

    let requester = client.clone();
    let first = tokio::spawn(async move { requester.get_services().await });
    let first_id = server.recv_frame_of("get_services").await.unwrap()["id"]
        .as_u64()
        .unwrap();

    let requester = client.clone();
    let second = tokio::spawn(async move { requester.get_services().await });
    let second_id = server.recv_frame_of("get_services").await.unwrap()["id"]
        .as_u64()
        .unwrap();
    assert_ne!(first_id, second_id);

    // Replies arrive in reverse order; each resolves its own caller
    server.send(&json!({
        "id": second_id, "type": "result", "success": true, "result": { "tag": "second" }
    }));
    server.send(&json!({
        "id": first_id, "type": "result", "success": true, "result": { "tag": "first" }
    }));

    assert_eq!(second.await.unwrap().unwrap(), json!({ "tag": "second" }));
    assert_eq!(first.await.unwrap().unwrap(), json!({ "tag": "first" }));
}

#[tokio::test]
async fn send_assigns_increasing_correlation_ids() {
    let mut server = MockHubServer::start().await;
    let (client, _store) = client_for(&server, test_config());
    connect_and_authenticate(&mut server, &client).await;

    let first = client.send(OutboundMessage::ping()).await.unwrap();
    let frame = server.recv_frame_of("ping").await.unwrap();
    assert_eq!(frame["id"].as_u64().unwrap(), first);
    server.send(&json!({ "id": first, "type": "pong" }));

    let second = client.send(OutboundMessage::ping()).await.unwrap();
    assert!(second > first);
    let frame = server.recv_frame_of("ping").await.unwrap();
    assert_eq!(frame["id"].as_u64().unwrap(), second);
}

#[tokio::test]
async fn error_reply_rejects_the_request() {
    let mut server = MockHubServer::start().await;
    let (client, _store) = client_for(&server, test_config());
    connect_and_authenticate(&mut server, &client).await;

    let caller = client.clone();
    let pending = tokio::spawn(async move {
        caller
            .call_service("light", "turn_on", None, Some("light.kitchen"))
            .await
    });

    let frame = server.recv_frame_of("call_service").await.unwrap();
    assert_eq!(frame["domain"], "light");
    assert_eq!(frame["service"], "turn_on");
    assert_eq!(frame["target"]["entity_id"], "light.kitchen");

    let id = frame["id"].as_u64().unwrap();
    server.send(&json!({
        "id": id, "type": "result", "success": false,
        "error": { "code": "not_found", "message": "no such service" }
    }));

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), Kind::WebSocket);
    match err.downcast_ref::<ProtocolError>() {
        Some(ProtocolError::Remote { code, message }) => {
            assert_eq!(code, "not_found");
            assert_eq!(message, "no such service");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn destroy_fails_every_pending_request() {
    let mut server = MockHubServer::start().await;
    let (client, _store) = client_for(&server, test_config());
    connect_and_authenticate(&mut server, &client).await;

    let mut pending = Vec::new();
    for _ in 0..3 {
        let caller = client.clone();
        pending.push(tokio::spawn(async move { caller.get_services().await }));
    }
    for _ in 0..3 {
        assert!(server.recv_frame_of("get_services").await.is_some());
    }

    client.destroy().await;

    for handle in pending {
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Kind::WebSocket);
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::ConnectionClosed)
        ));
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // Idempotent, and no reconnect after an explicit teardown
    client.destroy().await;
    assert!(
        !server.wait_connection_for(Duration::from_millis(300)).await,
        "destroy must not trigger a reconnect"
    );
}

#[tokio::test]
async fn unknown_and_malformed_frames_do_not_disturb_the_session() {
    let mut server = MockHubServer::start().await;
    let (client, _store) = client_for(&server, test_config());
    connect_and_authenticate(&mut server, &client).await;

    server.send(&json!({ "type": "zone_registry_updated", "detail": 7 }));
    server.send_raw("{ not json");
    server.send(&json!({ "no_type_field": true }));

    // The session survives and ordinary traffic still flows
    let caller = client.clone();
    let pending = tokio::spawn(async move { caller.get_services().await });
    let id = server.recv_frame_of("get_services").await.unwrap()["id"]
        .as_u64()
        .unwrap();
    server.send(&json!({ "id": id, "type": "result", "success": true, "result": {} }));
    assert_eq!(pending.await.unwrap().unwrap(), json!({}));
}

#[tokio::test]
async fn rejected_credential_is_fatal() {
    let mut server = MockHubServer::start().await;
    let (client, _store) = client_for(&server, test_config());

    let connector = client.clone();
    let task = tokio::spawn(async move { connector.connect().await });

    assert!(server.wait_connection().await);
    assert!(server.recv_frame_of("auth").await.is_some());
    server.send(&json!({ "type": "auth_invalid", "message": "invalid access token" }));

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), Kind::Auth);
    assert!(err.to_string().contains("invalid access token"));

    assert!(
        !server.wait_connection_for(Duration::from_millis(400)).await,
        "a rejected credential must never be retried"
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn credentials_resent_until_verdict() {
    let mut server = MockHubServer::start().await;
    let config = Config {
        auth_retry_interval: Duration::from_millis(150),
        ..test_config()
    };
    let (client, _store) = client_for(&server, config);

    let connector = client.clone();
    let task = tokio::spawn(async move { connector.connect().await });

    assert!(server.wait_connection().await);
    assert!(server.recv_frame_of("auth").await.is_some());
    // No verdict; a second credential frame must follow on its own
    assert!(server.recv_frame_of("auth").await.is_some());

    server.send(&json!({ "type": "auth_ok" }));
    task.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Authenticated);
}

#[tokio::test]
async fn heartbeat_timeout_tears_down_and_reconnects() {
    let mut server = MockHubServer::start().await;
    let config = Config {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (client, _store) = client_for(&server, config);
    let mut lifecycle = client.lifecycle();

    connect_and_authenticate(&mut server, &client).await;

    // A ping goes out and is never answered
    assert!(server.recv_frame_of("ping").await.is_some());

    loop {
        if lifecycle.recv().await.unwrap() == LifecycleEvent::ConnectionLost {
            break;
        }
    }

    // The replacement connection completes its own handshake
    assert!(server.wait_connection().await, "no reconnect attempt");
    assert!(server.recv_frame_of("auth").await.is_some());
    server.send(&json!({ "type": "auth_ok" }));

    loop {
        if lifecycle.recv().await.unwrap() == LifecycleEvent::Authenticated {
            break;
        }
    }
    assert_eq!(client.state(), ConnectionState::Authenticated);
}

#[tokio::test]
async fn events_update_the_store_before_handlers_run() {
    let mut server = MockHubServer::start().await;
    let (client, store) = client_for(&server, test_config());
    connect_and_authenticate(&mut server, &client).await;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let handler_store = Arc::clone(&store);
    let subscriber = client.clone();
    let subscribe = tokio::spawn(async move {
        subscriber
            .subscribe_events(Some("state_changed"), move |event| {
                let stored = handler_store
                    .entity_ids()
                    .contains(&"light.kitchen".to_owned());
                drop(seen_tx.send((stored, event.event_type.clone())));
            })
            .await
    });

    let frame = server.recv_frame_of("subscribe_events").await.unwrap();
    assert_eq!(frame["event_type"], "state_changed");
    let subscription_id = frame["id"].as_u64().unwrap();
    server.send(&json!({
        "id": subscription_id, "type": "result", "success": true, "result": null
    }));
    assert_eq!(subscribe.await.unwrap().unwrap(), subscription_id);

    server.send(&state_changed_frame(
        subscription_id,
        "light.kitchen",
        None,
        &record_json("light.kitchen", "on", "2026-08-23T10:00:00Z"),
    ));

    let (stored, event_type) = timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(stored, "store must be updated before the handler runs");
    assert_eq!(event_type, "state_changed");
}
