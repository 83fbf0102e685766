//! The authoritative in-memory mirror of remote entity state.
//!
//! Fed by the protocol client's event routing; read synchronously by the rest
//! of the application. Records are replaced wholesale on full refresh, patched
//! in place on incremental update, and never evicted once seen.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tokio::sync::oneshot;
use tokio::time::sleep;
use uuid::Uuid;

use crate::Result;
use crate::config::RefreshConfig;
use crate::error::{Error, RefreshExhausted};
use crate::rest::RestClient;
use crate::types::{EntityRecord, StateChange, valid_entity_id};

/// Callback fired for every change to a watched entity.
pub type WatchCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Durable registration for one watcher; pass to
/// [`EntityStore::unwatch`] to remove it.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHandle {
    /// Watcher identity
    pub id: Uuid,
    /// Entity the watcher is bound to
    pub entity_id: String,
}

enum WatcherKind {
    /// Fires once, then self-removes
    Once(oneshot::Sender<StateChange>),
    /// Fires on every change until unregistered
    Persistent(WatchCallback),
}

struct Watcher {
    id: Uuid,
    kind: WatcherKind,
}

enum Firing {
    Once(oneshot::Sender<StateChange>),
    Persistent(WatchCallback),
}

/// The entity-state mirror.
pub struct EntityStore {
    entities: DashMap<String, EntityRecord>,
    /// Per-entity watcher lists; same-entity callbacks fire in registration
    /// order
    watchers: DashMap<String, Vec<Watcher>>,
    /// Ids with a delivery pass currently running
    notifying: DashSet<String>,
    /// Per-id delivery queues. Every change passes through its queue, and the
    /// entry lock also serializes the merge, so merge order equals delivery
    /// order
    queued: DashMap<String, VecDeque<StateChange>>,
    initialized: AtomicBool,
    rest: RestClient,
    refresh_config: RefreshConfig,
}

impl EntityStore {
    #[must_use]
    pub fn new(rest: RestClient, refresh_config: RefreshConfig) -> Self {
        Self {
            entities: DashMap::new(),
            watchers: DashMap::new(),
            notifying: DashSet::new(),
            queued: DashMap::new(),
            initialized: AtomicBool::new(false),
            rest,
            refresh_config,
        }
    }

    /// Whether the first full refresh has completed. Reads return nothing
    /// meaningful before then.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Point lookup by entity id.
    #[must_use]
    pub fn state(&self, entity_id: &str) -> Option<EntityRecord> {
        if !self.is_initialized() {
            return None;
        }
        self.entities.get(entity_id).map(|entry| entry.clone())
    }

    /// All records in the given domain, ordered by entity id.
    #[must_use]
    pub fn domain_states(&self, domain: &str) -> Vec<EntityRecord> {
        if !self.is_initialized() {
            return Vec::new();
        }
        let mut records: Vec<EntityRecord> = self
            .entities
            .iter()
            .filter(|entry| entry.domain() == Some(domain))
            .map(|entry| entry.clone())
            .collect();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        records
    }

    /// Every entity id ever observed, sorted.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entities.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Resolves with the next update delivered for the entity.
    ///
    /// The one-shot watcher is registered before this returns; awaiting can
    /// happen later.
    pub fn next_state(&self, entity_id: &str) -> impl Future<Output = Result<StateChange>> + use<> {
        let (tx, rx) = oneshot::channel();
        self.watchers
            .entry(entity_id.to_owned())
            .or_default()
            .push(Watcher {
                id: Uuid::new_v4(),
                kind: WatcherKind::Once(tx),
            });
        async move {
            rx.await
                .map_err(|_| Error::validation("entity store dropped before the next update"))
        }
    }

    /// Durable registration: fire `callback` on every change to the entity
    /// until [`unwatch`](Self::unwatch).
    pub fn watch<F>(&self, entity_id: &str, callback: F) -> WatchHandle
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.watchers
            .entry(entity_id.to_owned())
            .or_default()
            .push(Watcher {
                id,
                kind: WatcherKind::Persistent(Arc::new(callback)),
            });
        WatchHandle {
            id,
            entity_id: entity_id.to_owned(),
        }
    }

    /// Remove a durable watcher.
    pub fn unwatch(&self, handle: &WatchHandle) {
        if let Some(mut watchers) = self.watchers.get_mut(&handle.entity_id) {
            watchers.retain(|w| w.id != handle.id);
        }
    }

    /// Number of watchers currently registered for an entity.
    #[must_use]
    pub fn watcher_count(&self, entity_id: &str) -> usize {
        self.watchers
            .get(entity_id)
            .map_or(0, |watchers| watchers.len())
    }

    /// Update entry point, called from the protocol client's event routing.
    ///
    /// Merges the record, then notifies watchers. Per-id `last_updated` is
    /// monotonic: a delivery older than the stored record is dropped.
    pub fn apply_change(&self, change: StateChange) {
        if !valid_entity_id(&change.entity_id) {
            tracing::warn!(entity = %change.entity_id, "rejecting malformed entity id");
            return;
        }

        let entity_id = change.entity_id.clone();
        if self.merge_and_enqueue(change) {
            self.drain(&entity_id);
        }
    }

    /// Fetch the full snapshot and replace the store wholesale.
    ///
    /// Bounded retries with backoff; an empty snapshot counts as a failed
    /// attempt. Exhausting the budget is fatal to the application, which
    /// cannot run without a state baseline.
    pub async fn refresh(self: &Arc<Self>) -> Result<()> {
        let attempts = self.refresh_config.max_attempts;
        let mut backoff: ExponentialBackoff = self.refresh_config.clone().into();

        for attempt in 1..=attempts {
            match self.rest.states().await {
                Ok(records) if !records.is_empty() => {
                    self.install_snapshot(records);
                    self.initialized.store(true, Ordering::Release);
                    return Ok(());
                }
                Ok(_) => {
                    tracing::warn!(attempt, "state snapshot came back empty");
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "state snapshot fetch failed");
                }
            }

            if attempt < attempts
                && let Some(delay) = backoff.next_backoff()
            {
                sleep(delay).await;
            }
        }

        Err(RefreshExhausted { attempts }.into())
    }

    /// Historical samples for one entity over the non-realtime channel.
    pub async fn history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>> {
        self.rest.history(entity_id, start, end).await
    }

    /// Explicit accessor bound to one entity id.
    #[must_use]
    pub fn view(self: &Arc<Self>, entity_id: &str) -> EntityView {
        EntityView {
            store: Arc::clone(self),
            entity_id: entity_id.to_owned(),
        }
    }

    fn install_snapshot(self: &Arc<Self>, records: Vec<EntityRecord>) {
        let prior: std::collections::HashMap<String, EntityRecord> = self
            .entities
            .iter()
            .map(|entry| (entry.key().clone(), entry.clone()))
            .collect();
        self.entities.clear();

        let mut changed = Vec::new();
        for record in records {
            if !valid_entity_id(&record.entity_id) {
                tracing::warn!(entity = %record.entity_id, "skipping record with malformed id");
                continue;
            }
            let old = prior.get(&record.entity_id).cloned();
            if old.as_ref() != Some(&record) {
                changed.push(StateChange {
                    entity_id: record.entity_id.clone(),
                    old_state: old,
                    new_state: record.clone(),
                });
            }
            self.entities.insert(record.entity_id.clone(), record);
        }

        // Notifications are scheduled, not called synchronously, so they
        // cannot interleave with the refresh that produced them. Enqueueing
        // happens here, though, so a live update arriving after the install
        // is delivered after the snapshot change it supersedes.
        if !changed.is_empty() {
            tracing::debug!(count = changed.len(), "scheduling refresh notifications");
            let mut ids = Vec::with_capacity(changed.len());
            for change in changed {
                ids.push(change.entity_id.clone());
                self.queued
                    .entry(change.entity_id.clone())
                    .or_default()
                    .push_back(change);
            }
            let store = Arc::clone(self);
            tokio::spawn(async move {
                for id in ids {
                    store.drain(&id);
                }
            });
        }
    }

    /// Merge the record and append the change to the entity's delivery queue.
    ///
    /// The queue entry lock is held across the staleness check, the record
    /// insert, and the enqueue, so concurrent updates for one id merge and
    /// enqueue in the same order. Returns `false` for a stale update.
    fn merge_and_enqueue(&self, change: StateChange) -> bool {
        let mut queue = self.queued.entry(change.entity_id.clone()).or_default();

        let prior = self
            .entities
            .get(&change.entity_id)
            .map(|entry| entry.clone());

        if let Some(prior) = &prior
            && prior.last_updated > change.new_state.last_updated
        {
            tracing::debug!(
                entity = %change.entity_id,
                "dropping stale update older than stored record"
            );
            return false;
        }

        self.entities
            .insert(change.entity_id.clone(), change.new_state.clone());

        queue.push_back(StateChange {
            old_state: change.old_state.or(prior),
            ..change
        });
        true
    }

    /// Deliver queued changes for one entity, guarding against overlapping
    /// passes for the same id. A change enqueued while a pass is running is
    /// picked up by that pass or by its retry, never stranded.
    fn drain(&self, entity_id: &str) {
        loop {
            if !self.notifying.insert(entity_id.to_owned()) {
                // The running pass re-checks the queue after it finishes
                tracing::warn!(entity = %entity_id, "notification pass already running, update queued");
                return;
            }

            while let Some(change) = self
                .queued
                .get_mut(entity_id)
                .and_then(|mut queue| queue.pop_front())
            {
                self.fire_watchers(&change);
            }
            self.notifying.remove(entity_id);

            // An enqueue can slip in between the final pop above and the
            // remove; whoever lost that race bailed out at the insert, so
            // retake the pass here instead of leaving the change stranded
            let drained = self
                .queued
                .get(entity_id)
                .is_none_or(|queue| queue.is_empty());
            if drained {
                return;
            }
        }
    }

    fn fire_watchers(&self, change: &StateChange) {
        let mut to_fire = Vec::new();

        if let Some(mut watchers) = self.watchers.get_mut(&change.entity_id) {
            let registered = std::mem::take(&mut *watchers);
            let mut kept = Vec::with_capacity(registered.len());
            for watcher in registered {
                match watcher.kind {
                    // One-shot watchers self-remove before their callback runs
                    WatcherKind::Once(tx) => to_fire.push(Firing::Once(tx)),
                    WatcherKind::Persistent(callback) => {
                        to_fire.push(Firing::Persistent(Arc::clone(&callback)));
                        kept.push(Watcher {
                            id: watcher.id,
                            kind: WatcherKind::Persistent(callback),
                        });
                    }
                }
            }
            *watchers = kept;
        }

        // Invoke outside the map guard, in registration order
        for firing in to_fire {
            match firing {
                Firing::Once(tx) => {
                    let _receiver = tx.send(change.clone());
                }
                Firing::Persistent(callback) => callback(change),
            }
        }
    }
}

/// Read-only live view of one entity.
///
/// Reads always reflect the latest store state. Writes are not supported:
/// entity state is owned by the controller and only changes through service
/// calls.
#[derive(Clone)]
pub struct EntityView {
    store: Arc<EntityStore>,
    entity_id: String,
}

impl EntityView {
    /// The id this view is bound to.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Latest record for the entity, if known.
    #[must_use]
    pub fn get(&self) -> Option<EntityRecord> {
        self.store.state(&self.entity_id)
    }

    /// Always fails: remote entity state cannot be written directly.
    pub fn set(&self, _state: &crate::types::StateValue) -> Result<()> {
        Err(Error::validation(
            "entity state writes are not supported; use a service call",
        ))
    }
}
