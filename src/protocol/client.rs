//! The protocol state machine.
//!
//! One spawned task owns the socket, the correlation-id counter, the
//! pending-request map, the persistent subscriptions, and the traffic guard.
//! Callers talk to it through a command channel and suspend on oneshot
//! replies; all inbound frames are processed to completion on that task, which
//! is what guarantees the entity store is consistent before any waiter
//! observes a reply.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};

use crate::Result;
use crate::config::Config;
use crate::error::Error;
use crate::guard::{Level, TrafficGuard};
use crate::protocol::error::ProtocolError;
use crate::protocol::message::{OutboundMessage, ServerMessage, parse_frame};
use crate::store::EntityStore;
use crate::transport::{Transport, TransportEvent};

/// Lifecycle fan-out capacity.
const LIFECYCLE_CAPACITY: usize = 64;

/// Connection state, owned exclusively by the protocol client.
///
/// Transitions are one-directional except `Authenticated -> Disconnected`,
/// which always clears all pending correlation state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Socket opening
    Connecting,
    /// Socket open, handshake in progress
    AwaitingAuth,
    /// Handshake complete; normal traffic flows
    Authenticated,
}

impl ConnectionState {
    /// Whether the handshake has completed.
    #[must_use]
    pub const fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

/// Signals the rest of the application may depend on.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Handshake completed (internal precursor to `Ready`)
    Authenticated,
    /// Connection is authenticated and entity state is loaded
    Ready,
    /// An established connection went away; reconnect is in progress
    ConnectionLost,
}

/// Callback invoked for every delivery on a standing subscription.
pub type EventHandler = Arc<dyn Fn(crate::protocol::message::EventPayload) + Send + Sync>;

enum Command {
    Connect {
        ack: oneshot::Sender<Result<()>>,
    },
    Send {
        message: OutboundMessage,
        reply: Option<oneshot::Sender<Result<Value>>>,
        ack: oneshot::Sender<Result<u64>>,
    },
    Subscribe {
        message: OutboundMessage,
        handler: EventHandler,
        ack: oneshot::Sender<Result<u64>>,
    },
    Destroy {
        ack: oneshot::Sender<()>,
    },
}

enum Pending {
    Call(oneshot::Sender<Result<Value>>),
    Subscribe {
        handler: EventHandler,
        ack: oneshot::Sender<Result<u64>>,
    },
}

enum SessionEnd {
    /// Explicit `destroy()`; no reconnect
    Destroyed,
    /// Credential rejected; no reconnect, operator intervention required
    AuthInvalid(String),
    /// Socket error/close or heartbeat timeout; reconnect after delay
    ConnectionLost,
    /// Every client handle dropped
    HandlesDropped,
}

/// Handle to the protocol task. Cheap to clone.
#[derive(Clone)]
pub struct ProtocolClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl ProtocolClient {
    /// Create the client and spawn its task. Does not open a socket;
    /// call [`connect`](Self::connect) for that.
    #[must_use]
    pub fn new(
        endpoint: String,
        token: SecretString,
        config: Config,
        store: Arc<EntityStore>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CAPACITY);

        let guard = Arc::new(TrafficGuard::new(&config));
        guard.start_prune_task();

        let task = ClientTask {
            endpoint,
            token,
            config,
            store,
            guard,
            state_tx,
            lifecycle_tx: lifecycle_tx.clone(),
            cmd_rx,
            next_id: 1,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            connect_waiters: Vec::new(),
        };
        tokio::spawn(task.run());

        Self {
            cmd_tx,
            state_rx,
            lifecycle_tx,
        }
    }

    /// Open the socket and complete the handshake.
    ///
    /// Resolves once `Authenticated` is reached, not merely socket-open.
    pub async fn connect(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Connect { ack })?;
        done.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Fire-and-forget send. Returns the assigned correlation id so the
    /// caller can later match deliveries against it.
    pub async fn send(&self, message: OutboundMessage) -> Result<u64> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Send {
            message,
            reply: None,
            ack,
        })?;
        done.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Correlated request; suspends until the reply with the same id arrives.
    ///
    /// A `result` frame carrying an error payload resolves this future to an
    /// error, never to a value.
    pub async fn request(&self, message: OutboundMessage) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (ack, done) = oneshot::channel();
        self.command(Command::Send {
            message,
            reply: Some(reply_tx),
            ack,
        })?;
        // First failure point: the send itself
        let _id = done.await.map_err(|_| ProtocolError::ConnectionClosed)??;
        // Second: the reply, or connection teardown failing all pending
        reply_rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Install a standing event subscription.
    ///
    /// Sends `subscribe_events`, awaits the ack, then invokes `handler` for
    /// every event frame whose id matches, until disconnect.
    pub async fn subscribe_events<F>(&self, event_type: Option<&str>, handler: F) -> Result<u64>
    where
        F: Fn(crate::protocol::message::EventPayload) + Send + Sync + 'static,
    {
        let (ack, done) = oneshot::channel();
        self.command(Command::Subscribe {
            message: OutboundMessage::subscribe_events(event_type),
            handler: Arc::new(handler),
            ack,
        })?;
        done.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Invoke a remote service.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
        target_entity: Option<&str>,
    ) -> Result<Value> {
        self.request(OutboundMessage::call_service(
            domain,
            service,
            data,
            target_entity,
        ))
        .await
    }

    /// Fetch the controller's service registry.
    pub async fn get_services(&self) -> Result<Value> {
        self.request(OutboundMessage::get_services()).await
    }

    /// Tear the connection down. Idempotent; safe when already disconnected.
    ///
    /// Every outstanding request fails with a connection-closed error before
    /// this returns.
    pub async fn destroy(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Command::Destroy { ack }).is_ok() {
            let _acked = done.await;
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to lifecycle signals. Each call returns an independent
    /// receiver.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    pub(crate) fn lifecycle_sender(&self) -> broadcast::Sender<LifecycleEvent> {
        self.lifecycle_tx.clone()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }
}

struct ClientTask {
    endpoint: String,
    token: SecretString,
    config: Config,
    store: Arc<EntityStore>,
    guard: Arc<TrafficGuard>,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    subscriptions: HashMap<u64, EventHandler>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ClientTask {
    async fn run(mut self) {
        loop {
            match self.cmd_rx.recv().await {
                None => return,
                Some(Command::Connect { ack }) => {
                    self.connect_waiters.push(ack);
                    if self.run_connected().await {
                        return;
                    }
                }
                Some(Command::Destroy { ack }) => {
                    // Already disconnected; destroy is idempotent
                    let _acked = ack.send(());
                }
                Some(Command::Send { reply, ack, .. }) => {
                    let _acked = ack.send(Err(ProtocolError::NotConnected.into()));
                    drop(reply);
                }
                Some(Command::Subscribe { ack, .. }) => {
                    let _acked = ack.send(Err(ProtocolError::NotConnected.into()));
                }
            }
        }
    }

    /// Connect-and-reconnect loop. Returns `true` when the task should exit.
    async fn run_connected(&mut self) -> bool {
        loop {
            let _changed = self.state_tx.send_replace(ConnectionState::Connecting);

            match Transport::open(&self.endpoint).await {
                Ok(transport) => {
                    let end = self.session(transport).await;
                    self.teardown();

                    match end {
                        SessionEnd::Destroyed => {
                            for waiter in self.connect_waiters.drain(..) {
                                let _sent =
                                    waiter.send(Err(ProtocolError::ConnectionClosed.into()));
                            }
                            return false;
                        }
                        SessionEnd::HandlesDropped => return true,
                        SessionEnd::AuthInvalid(message) => {
                            tracing::error!(%message, "credential rejected by controller");
                            for waiter in self.connect_waiters.drain(..) {
                                let _sent = waiter.send(Err(Error::auth(message.clone())));
                            }
                            return false;
                        }
                        SessionEnd::ConnectionLost => {
                            let _receivers = self.lifecycle_tx.send(LifecycleEvent::ConnectionLost);
                            tracing::warn!(
                                delay = ?self.config.reconnect_delay,
                                "connection lost, reconnecting"
                            );
                            match self.reconnect_pause().await {
                                PauseOutcome::Elapsed => {}
                                PauseOutcome::Destroyed => return false,
                                PauseOutcome::HandlesDropped => return true,
                            }
                        }
                    }
                }
                Err(e) => {
                    if self.connect_waiters.is_empty() {
                        // Reconnect attempt against an unreachable controller
                        tracing::warn!(error = %e, "reconnect attempt failed");
                        match self.reconnect_pause().await {
                            PauseOutcome::Elapsed => {}
                            PauseOutcome::Destroyed => return false,
                            PauseOutcome::HandlesDropped => return true,
                        }
                    } else {
                        // Initial connect: surface the failure to the caller
                        let _changed = self.state_tx.send_replace(ConnectionState::Disconnected);
                        tracing::error!(error = %e, "unable to open connection");
                        // The open error is not cloneable; the first waiter
                        // gets it, any later ones see a generic closure
                        let mut failure = Some(e);
                        for waiter in self.connect_waiters.drain(..) {
                            let error = failure
                                .take()
                                .unwrap_or_else(|| ProtocolError::ConnectionClosed.into());
                            let _sent = waiter.send(Err(error));
                        }
                        return false;
                    }
                }
            }
        }
    }

    /// Wait out the reconnect delay while still honoring commands, so
    /// `destroy()` cannot hang behind an unreachable controller.
    async fn reconnect_pause(&mut self) -> PauseOutcome {
        let deadline = Instant::now() + self.config.reconnect_delay;

        loop {
            tokio::select! {
                () = sleep_until(deadline) => return PauseOutcome::Elapsed,
                command = self.cmd_rx.recv() => match command {
                    None => return PauseOutcome::HandlesDropped,
                    Some(Command::Destroy { ack }) => {
                        for waiter in self.connect_waiters.drain(..) {
                            let _sent = waiter.send(Err(ProtocolError::ConnectionClosed.into()));
                        }
                        let _acked = ack.send(());
                        return PauseOutcome::Destroyed;
                    }
                    Some(Command::Connect { ack }) => self.connect_waiters.push(ack),
                    Some(Command::Send { ack, .. }) => {
                        let _acked = ack.send(Err(ProtocolError::NotConnected.into()));
                    }
                    Some(Command::Subscribe { ack, .. }) => {
                        let _acked = ack.send(Err(ProtocolError::NotConnected.into()));
                    }
                }
            }
        }
    }

    /// Drive one live socket until it ends.
    async fn session(&mut self, mut transport: Transport) -> SessionEnd {
        let _changed = self.state_tx.send_replace(ConnectionState::AwaitingAuth);

        // Armed once credentials go out; re-arms on every resend. The retry
        // loop is intentionally unbounded.
        let mut auth_deadline: Option<Instant> = None;
        let mut awaiting_pong: Option<(u64, Instant)> = None;

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately
        heartbeat.tick().await;

        loop {
            let authenticated = self.state_tx.borrow().is_authenticated();

            tokio::select! {
                event = transport.next() => match event {
                    TransportEvent::Message(text) => {
                        match self
                            .route_frame(&text, &mut transport, &mut auth_deadline, &mut awaiting_pong)
                            .await
                        {
                            FrameOutcome::Continue => {}
                            FrameOutcome::AuthInvalid(message) => {
                                return SessionEnd::AuthInvalid(message);
                            }
                            FrameOutcome::TransportFailed => return SessionEnd::ConnectionLost,
                        }
                    }
                    TransportEvent::Error(e) => {
                        tracing::warn!(error = %e, "socket error");
                        return SessionEnd::ConnectionLost;
                    }
                    TransportEvent::Closed => {
                        tracing::warn!("socket closed by peer");
                        return SessionEnd::ConnectionLost;
                    }
                },

                command = self.cmd_rx.recv() => match command {
                    None => {
                        transport.close().await;
                        return SessionEnd::HandlesDropped;
                    }
                    Some(Command::Destroy { ack }) => {
                        transport.close().await;
                        let _acked = ack.send(());
                        return SessionEnd::Destroyed;
                    }
                    Some(Command::Connect { ack }) => {
                        if authenticated {
                            let _acked = ack.send(Ok(()));
                        } else {
                            self.connect_waiters.push(ack);
                        }
                    }
                    Some(Command::Send { message, reply, ack }) => {
                        self.handle_send(&mut transport, message, reply, ack).await;
                    }
                    Some(Command::Subscribe { message, handler, ack }) => {
                        self.handle_subscribe(&mut transport, message, handler, ack).await;
                    }
                },

                // Resend credentials when no verdict arrives in time
                () = sleep_until(auth_deadline.unwrap_or_else(Instant::now)),
                    if auth_deadline.is_some() && !authenticated =>
                {
                    tracing::warn!("no auth verdict received, resending credentials");
                    let auth = OutboundMessage::auth(&self.token);
                    if self.send_frame(&mut transport, &auth).await.is_err() {
                        return SessionEnd::ConnectionLost;
                    }
                    auth_deadline = Some(Instant::now() + self.config.auth_retry_interval);
                }

                // Heartbeat probe
                _ = heartbeat.tick(), if authenticated && awaiting_pong.is_none() => {
                    let id = self.assign_id();
                    let mut ping = OutboundMessage::ping();
                    ping.id = Some(id);
                    if self.send_frame(&mut transport, &ping).await.is_err() {
                        return SessionEnd::ConnectionLost;
                    }
                    awaiting_pong = Some((id, Instant::now() + self.config.heartbeat_timeout));
                }

                // Rather than accumulate a silently-dead connection, tear down
                () = sleep_until(awaiting_pong.map_or_else(Instant::now, |(_, deadline)| deadline)),
                    if awaiting_pong.is_some() =>
                {
                    tracing::warn!(timeout = ?self.config.heartbeat_timeout, "heartbeat timeout");
                    return SessionEnd::ConnectionLost;
                }
            }
        }
    }

    async fn route_frame(
        &mut self,
        text: &str,
        transport: &mut Transport,
        auth_deadline: &mut Option<Instant>,
        awaiting_pong: &mut Option<(u64, Instant)>,
    ) -> FrameOutcome {
        tracing::trace!(%text, "inbound frame");

        let message = match parse_frame(text) {
            Ok(message) => message,
            Err(e) => {
                // Protocol anomaly: logged, dropped, connection stays up
                tracing::warn!(error = %e, "dropping malformed frame");
                return FrameOutcome::Continue;
            }
        };

        match message {
            ServerMessage::AuthRequired => {
                let auth = OutboundMessage::auth(&self.token);
                if self.send_frame(transport, &auth).await.is_err() {
                    return FrameOutcome::TransportFailed;
                }
                *auth_deadline = Some(Instant::now() + self.config.auth_retry_interval);
            }
            ServerMessage::AuthOk => {
                *auth_deadline = None;
                let _changed = self.state_tx.send_replace(ConnectionState::Authenticated);
                tracing::debug!("authenticated");
                let _receivers = self.lifecycle_tx.send(LifecycleEvent::Authenticated);
                for waiter in self.connect_waiters.drain(..) {
                    let _sent = waiter.send(Ok(()));
                }
            }
            ServerMessage::AuthInvalid { message } => {
                *auth_deadline = None;
                return FrameOutcome::AuthInvalid(message);
            }
            ServerMessage::Event { id, event } => {
                // State must be consistent before dependents observe the event
                if let Some(change) = event.as_state_change() {
                    self.store.apply_change(change);
                }
                if let Some(handler) = self.subscriptions.get(&id) {
                    handler(event);
                } else {
                    tracing::debug!(id, "event for unknown subscription");
                }
            }
            ServerMessage::Pong { id } => match awaiting_pong.take() {
                Some((expected, _)) if expected == id => {}
                other => {
                    *awaiting_pong = other;
                    tracing::debug!(id, "unexpected pong");
                }
            },
            ServerMessage::CallResult {
                id,
                success,
                result,
                error,
            } => self.resolve_pending(id, success, result, error),
            ServerMessage::Unknown { kind } => {
                tracing::warn!(%kind, "unrecognized frame kind");
            }
        }

        FrameOutcome::Continue
    }

    fn resolve_pending(
        &mut self,
        id: u64,
        success: bool,
        result: Option<Value>,
        error: Option<crate::protocol::message::RemoteError>,
    ) {
        let outcome = if success {
            Ok(result.unwrap_or(Value::Null))
        } else {
            let (code, message) = match error {
                Some(e) => (e.code, e.message),
                None => ("unknown".to_owned(), "no error payload".to_owned()),
            };
            Err(ProtocolError::Remote { code, message }.into())
        };

        match self.pending.remove(&id) {
            Some(Pending::Call(reply)) => {
                let _sent = reply.send(outcome);
            }
            Some(Pending::Subscribe { handler, ack }) => match outcome {
                Ok(_) => {
                    self.subscriptions.insert(id, handler);
                    let _sent = ack.send(Ok(id));
                }
                Err(e) => {
                    let _sent = ack.send(Err(e));
                }
            },
            None => {
                tracing::warn!(id, "reply with unknown correlation id");
            }
        }
    }

    async fn handle_send(
        &mut self,
        transport: &mut Transport,
        mut message: OutboundMessage,
        reply: Option<oneshot::Sender<Result<Value>>>,
        ack: oneshot::Sender<Result<u64>>,
    ) {
        if !self.state_tx.borrow().is_authenticated() {
            let _acked = ack.send(Err(ProtocolError::NotConnected.into()));
            return;
        }

        let id = self.assign_id();
        message.id = Some(id);

        // A send failure is request-scoped: it fails this caller only and
        // never takes the connection down.
        match self.send_frame(transport, &message).await {
            Ok(()) => {
                if let Some(reply) = reply {
                    self.pending.insert(id, Pending::Call(reply));
                }
                let _acked = ack.send(Ok(id));
            }
            Err(e) => {
                let _acked = ack.send(Err(e));
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        transport: &mut Transport,
        mut message: OutboundMessage,
        handler: EventHandler,
        ack: oneshot::Sender<Result<u64>>,
    ) {
        if !self.state_tx.borrow().is_authenticated() {
            let _acked = ack.send(Err(ProtocolError::NotConnected.into()));
            return;
        }

        let id = self.assign_id();
        message.id = Some(id);

        match self.send_frame(transport, &message).await {
            Ok(()) => {
                self.pending.insert(id, Pending::Subscribe { handler, ack });
            }
            Err(e) => {
                let _acked = ack.send(Err(e));
            }
        }
    }

    /// Serialize, gate through the traffic guard, and write one frame.
    #[expect(
        clippy::exit,
        reason = "crossing the crash threshold is a deliberate fail-fast abort"
    )]
    async fn send_frame(&self, transport: &mut Transport, message: &OutboundMessage) -> Result<()> {
        match self.guard.record_and_check() {
            Level::Fatal => {
                tracing::error!(
                    threshold = self.config.crash_per_second,
                    "outbound message rate crossed the crash threshold; terminating"
                );
                std::process::exit(1);
            }
            Level::Warn => {
                tracing::warn!(
                    threshold = self.config.warn_per_second,
                    "outbound message rate above warn threshold"
                );
            }
            Level::Normal => {}
        }

        let text = serde_json::to_string(message)?;
        transport.send(text).await
    }

    fn assign_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Fail all pending correlation state with a connection-closed error.
    ///
    /// Hard correctness requirement: no future may be left unresolved.
    fn teardown(&mut self) {
        let _changed = self.state_tx.send_replace(ConnectionState::Disconnected);

        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Call(reply) => {
                    let _sent = reply.send(Err(ProtocolError::ConnectionClosed.into()));
                }
                Pending::Subscribe { ack, .. } => {
                    let _sent = ack.send(Err(ProtocolError::ConnectionClosed.into()));
                }
            }
        }
        self.subscriptions.clear();
    }
}

enum FrameOutcome {
    Continue,
    AuthInvalid(String),
    TransportFailed,
}

enum PauseOutcome {
    Elapsed,
    Destroyed,
    HandlesDropped,
}
