//! Wire frames exchanged with the controller.
//!
//! Outbound frames are `{id?, type, ...fields}`; the correlation `id` is
//! assigned by the protocol client at send time for everything except the auth
//! frame, which is uncorrelated by protocol convention. Inbound frames echo
//! the outbound id exactly.

use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::Result;
use crate::protocol::error::ProtocolError;
use crate::types::StateChange;

/// An outbound frame, ready for correlation-id assignment and serialization.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    /// Correlation id; assigned at send time, never by constructors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Frame discriminator
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining fields, flattened alongside `id` and `type`
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl OutboundMessage {
    /// A bare frame of the given kind with no extra fields.
    #[must_use]
    pub fn new<S: Into<String>>(kind: S) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// The credential frame. Deliberately uncorrelated.
    #[must_use]
    pub fn auth(token: &SecretString) -> Self {
        let mut payload = Map::new();
        payload.insert(
            "access_token".to_owned(),
            Value::String(token.expose_secret().to_owned()),
        );
        Self {
            id: None,
            kind: "auth".to_owned(),
            payload,
        }
    }

    /// Heartbeat probe.
    #[must_use]
    pub fn ping() -> Self {
        Self::new("ping")
    }

    /// Standing subscription to the controller's event stream.
    ///
    /// `event_type = None` subscribes to every event.
    #[must_use]
    pub fn subscribe_events(event_type: Option<&str>) -> Self {
        let mut message = Self::new("subscribe_events");
        if let Some(event_type) = event_type {
            message
                .payload
                .insert("event_type".to_owned(), Value::String(event_type.to_owned()));
        }
        message
    }

    /// Remote method invocation.
    #[must_use]
    pub fn call_service(
        domain: &str,
        service: &str,
        data: Option<Value>,
        target_entity: Option<&str>,
    ) -> Self {
        let mut message = Self::new("call_service");
        message
            .payload
            .insert("domain".to_owned(), Value::String(domain.to_owned()));
        message
            .payload
            .insert("service".to_owned(), Value::String(service.to_owned()));
        if let Some(data) = data {
            message.payload.insert("service_data".to_owned(), data);
        }
        if let Some(entity_id) = target_entity {
            message.payload.insert(
                "target".to_owned(),
                json!({ "entity_id": entity_id }),
            );
        }
        message
    }

    /// Service discovery request.
    #[must_use]
    pub fn get_services() -> Self {
        Self::new("get_services")
    }
}

/// Error payload carried by a failed `result` frame.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteError {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable description
    pub message: String,
}

/// Event payload carried by an `event` frame.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    /// Event discriminator, e.g. `state_changed`
    pub event_type: String,
    /// Event-specific data object
    #[serde(default)]
    pub data: Value,
}

impl EventPayload {
    /// Extract the payload as an entity state change, if it is one.
    ///
    /// Returns `None` for other event types and for `state_changed` events
    /// whose `new_state` is null (the upstream signals entity removal that
    /// way, which this store does not model).
    #[must_use]
    pub fn as_state_change(&self) -> Option<StateChange> {
        if self.event_type == "state_changed" {
            serde_json::from_value(self.data.clone()).ok()
        } else {
            None
        }
    }
}

/// A parsed inbound frame.
#[non_exhaustive]
#[derive(Debug)]
pub enum ServerMessage {
    /// Handshake opener; the client must answer with the credential frame
    AuthRequired,
    /// Handshake success
    AuthOk,
    /// Handshake rejection; not retryable with the same credential
    AuthInvalid {
        /// Controller-supplied reason
        message: String,
    },
    /// Standing-subscription delivery
    Event {
        /// Correlation id of the owning subscription
        id: u64,
        /// The event itself
        event: EventPayload,
    },
    /// Reply to a correlated request
    CallResult {
        /// Correlation id of the originating request
        id: u64,
        /// Whether the call succeeded
        success: bool,
        /// Result payload on success
        result: Option<Value>,
        /// Error payload on failure
        error: Option<RemoteError>,
    },
    /// Heartbeat reply
    Pong {
        /// Correlation id of the originating ping
        id: u64,
    },
    /// Frame kind this client does not recognize; logged, never fatal
    Unknown {
        /// The unrecognized `type` value
        kind: String,
    },
}

/// Parse one inbound text frame.
///
/// Frames without a `type` field are malformed. Frames with an unrecognized
/// `type` parse into [`ServerMessage::Unknown`] so the caller can log the
/// anomaly and keep the connection up.
pub fn parse_frame(text: &str) -> Result<ServerMessage> {
    let raw: Value = serde_json::from_str(text).map_err(ProtocolError::MessageParse)?;

    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidMessage("frame has no type field".to_owned()))?;

    let correlation = || {
        raw.get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::InvalidMessage(format!("{kind} frame has no id")))
    };

    let message = match kind {
        "auth_required" => ServerMessage::AuthRequired,
        "auth_ok" => ServerMessage::AuthOk,
        "auth_invalid" => ServerMessage::AuthInvalid {
            message: raw
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no reason given")
                .to_owned(),
        },
        "event" => ServerMessage::Event {
            id: correlation()?,
            event: serde_json::from_value(raw.get("event").cloned().unwrap_or(Value::Null))
                .map_err(ProtocolError::MessageParse)?,
        },
        "result" => ServerMessage::CallResult {
            id: correlation()?,
            success: raw.get("success").and_then(Value::as_bool).unwrap_or(false),
            result: raw.get("result").cloned().filter(|v| !v.is_null()),
            error: raw
                .get("error")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok()),
        },
        "pong" => ServerMessage::Pong { id: correlation()? },
        other => ServerMessage::Unknown {
            kind: other.to_owned(),
        },
    };

    Ok(message)
}
