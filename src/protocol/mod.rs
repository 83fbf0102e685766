//! The realtime protocol client.
//!
//! # Architecture
//!
//! - [`ProtocolClient`]: handle to the protocol task (handshake, correlation
//!   ids, standing subscriptions, heartbeat, reconnection)
//! - [`message`]: wire frames and the inbound parser
//!
//! All protocol and store mutation happens on one spawned task; the handle
//! only moves commands onto it and waits on oneshot replies.

pub mod client;
pub mod error;
pub mod message;

pub use client::{ConnectionState, LifecycleEvent, ProtocolClient};
#[expect(
    clippy::module_name_repetitions,
    reason = "ProtocolError includes module name for clarity when used outside this module"
)]
pub use error::ProtocolError;
