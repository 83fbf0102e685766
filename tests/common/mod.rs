#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    dead_code,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt as _, StreamExt as _};
use homehub_client_sdk::Config;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Mock controller WebSocket server.
///
/// Speaks first on every connection, greeting the client with
/// `auth_required`, then forwards every inbound frame to the test and
/// broadcasts test-supplied frames to all connected clients.
pub struct MockHubServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Frames received from clients
    inbound_rx: mpsc::UnboundedReceiver<String>,
    /// One item per accepted connection
    connection_rx: mpsc::UnboundedReceiver<()>,
}

/// Route crate logs to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

impl MockHubServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel::<()>();

        let broadcast_tx = message_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let in_tx = inbound_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                drop(connection_tx.send(()));

                // The controller speaks first
                let greeting = json!({ "type": "auth_required" }).to_string();
                if write.send(Message::Text(greeting.into())).await.is_err() {
                    continue;
                }

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    drop(in_tx.send(text.to_string()));
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            msg = msg_rx.recv() => match msg {
                                Ok(text) => {
                                    if write.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            inbound_rx,
            connection_rx,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/websocket", self.addr)
    }

    /// Broadcast a frame to all connected clients.
    pub fn send(&self, frame: &Value) {
        drop(self.message_tx.send(frame.to_string()));
    }

    /// Broadcast a raw text frame, bypassing JSON serialization.
    pub fn send_raw(&self, text: &str) {
        drop(self.message_tx.send(text.to_owned()));
    }

    /// Receive the next inbound frame, parsed.
    pub async fn recv_frame(&mut self) -> Option<Value> {
        let text = timeout(Duration::from_secs(2), self.inbound_rx.recv())
            .await
            .ok()
            .flatten()?;
        serde_json::from_str(&text).ok()
    }

    /// Receive the next inbound frame of the given kind, skipping others
    /// (e.g. interleaved pings).
    pub async fn recv_frame_of(&mut self, kind: &str) -> Option<Value> {
        loop {
            let frame = self.recv_frame().await?;
            if frame["type"] == kind {
                return Some(frame);
            }
        }
    }

    /// Wait for the next accepted connection.
    pub async fn wait_connection(&mut self) -> bool {
        timeout(Duration::from_secs(2), self.connection_rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
    }

    /// Check whether another connection arrives within the window.
    pub async fn wait_connection_for(&mut self, window: Duration) -> bool {
        timeout(window, self.connection_rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
    }
}

/// Config with timings tightened for tests and service discovery disabled.
pub fn test_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(60),
        auth_retry_interval: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(100),
        build_service_proxy: false,
        ..Config::default()
    }
}

pub fn ts(rfc3339: &str) -> DateTime<Utc> {
    rfc3339.parse().unwrap()
}

/// An entity record as the controller serializes it.
pub fn record_json(entity_id: &str, state: &str, updated: &str) -> Value {
    json!({
        "entity_id": entity_id,
        "state": state,
        "attributes": {},
        "last_changed": updated,
        "last_updated": updated,
        "context": { "id": "ctx-1", "parent_id": null, "user_id": null }
    })
}

/// A `state_changed` event frame for the given subscription id.
pub fn state_changed_frame(
    subscription_id: u64,
    entity_id: &str,
    old: Option<&Value>,
    new: &Value,
) -> Value {
    json!({
        "id": subscription_id,
        "type": "event",
        "event": {
            "event_type": "state_changed",
            "data": {
                "entity_id": entity_id,
                "old_state": old,
                "new_state": new
            }
        }
    })
}
