//! Connection lifecycle orchestration.
//!
//! Sits above the protocol client: owns the connect/disconnect surface, the
//! post-auth step (event subscription, initial state load, service
//! discovery), and the `Ready`/`ConnectionLost` signals the rest of the
//! application depends on. Callers never observe a ready connection whose
//! entity state has not loaded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::Result;
use crate::config::Config;
use crate::error::Error;
use crate::protocol::{LifecycleEvent, ProtocolClient};
use crate::rest::RestClient;
use crate::store::EntityStore;

/// Orchestrates the connection lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: ProtocolClient,
    store: Arc<EntityStore>,
    config: Config,
    connected: AtomicBool,
    /// Set while a caller-driven connect is running its post-auth step, so
    /// the reconnect listener does not run it a second time
    connecting: AtomicBool,
    rearm_spawned: AtomicBool,
    services: RwLock<Option<Value>>,
}

impl ConnectionManager {
    /// Wire up the store, REST channel, and protocol client. Does not
    /// connect.
    pub fn new(
        ws_endpoint: &str,
        rest_endpoint: &str,
        token: SecretString,
        config: Config,
    ) -> Result<Self> {
        let rest = RestClient::new(rest_endpoint, &token)?;
        let store = Arc::new(EntityStore::new(rest, config.refresh.clone()));
        let client = ProtocolClient::new(
            ws_endpoint.to_owned(),
            token,
            config.clone(),
            Arc::clone(&store),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                store,
                config,
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                rearm_spawned: AtomicBool::new(false),
                services: RwLock::new(None),
            }),
        })
    }

    /// Connect, authenticate, and load entity state.
    ///
    /// Errors loudly when already connected: no silent no-op, no duplicate
    /// sockets. Resolves only after the post-auth step completes, so a
    /// returned `Ok` means the store is populated.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::validation("already connected"));
        }

        self.inner.connecting.store(true, Ordering::SeqCst);
        let outcome = self.establish().await;
        self.inner.connecting.store(false, Ordering::SeqCst);

        if outcome.is_err() {
            // The post-auth step can fail after the socket authenticated;
            // tear the session down so no live connection outlives a failed
            // connect
            self.inner.client.destroy().await;
            self.inner.connected.store(false, Ordering::SeqCst);
        }
        outcome
    }

    async fn establish(&self) -> Result<()> {
        self.inner.client.connect().await?;
        self.inner.post_auth().await?;

        let _receivers = self
            .inner
            .client
            .lifecycle_sender()
            .send(LifecycleEvent::Ready);

        // One listener re-runs the post-auth step after every reconnect
        if !self.inner.rearm_spawned.swap(true, Ordering::SeqCst) {
            self.spawn_rearm_listener();
        }
        Ok(())
    }

    /// Tear the connection down. All pending requests fail before this
    /// returns.
    pub async fn disconnect(&self) {
        self.inner.client.destroy().await;
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    /// Whether a connect has completed and not been torn down.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The entity mirror.
    #[must_use]
    pub fn store(&self) -> Arc<EntityStore> {
        Arc::clone(&self.inner.store)
    }

    /// The underlying protocol client, for service calls and raw requests.
    #[must_use]
    pub fn client(&self) -> &ProtocolClient {
        &self.inner.client
    }

    /// Service registry discovered at connect time, when
    /// `build_service_proxy` is enabled.
    #[must_use]
    pub fn services(&self) -> Option<Value> {
        self.inner
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to `Ready`/`ConnectionLost` signals.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.client.lifecycle()
    }

    fn spawn_rearm_listener(&self) {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut lifecycle = inner.client.lifecycle();

            loop {
                match lifecycle.recv().await {
                    Ok(LifecycleEvent::Authenticated) => {
                        if !inner.connected.load(Ordering::SeqCst)
                            || inner.connecting.load(Ordering::SeqCst)
                        {
                            continue;
                        }
                        tracing::debug!("reconnected, re-running post-auth step");
                        match inner.post_auth().await {
                            Ok(()) => {
                                let _receivers =
                                    inner.client.lifecycle_sender().send(LifecycleEvent::Ready);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "post-auth step failed after reconnect");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "lifecycle listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Inner {
    /// Subscribe to the event stream, load the state baseline, then discover
    /// services. Order matters: state must be loaded before `Ready`.
    async fn post_auth(&self) -> Result<()> {
        if self.config.auto_subscribe_events {
            let _subscription_id = self
                .client
                .subscribe_events(Some("state_changed"), |event| {
                    // The protocol task has already applied the change to the
                    // store before this runs
                    tracing::trace!(event_type = %event.event_type, "event delivered");
                })
                .await?;
        }

        self.store.refresh().await?;

        if self.config.build_service_proxy {
            let services = self.client.get_services().await?;
            *self
                .services
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(services);
        }

        Ok(())
    }
}
