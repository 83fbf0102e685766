//! Entity records and state-change types mirrored from the controller.

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A remote entity's state as reported by the controller.
///
/// Identity is the `entity_id`, namespaced as `"<domain>.<name>"`. Records are
/// replaced wholesale on full refresh and patched in place on incremental
/// update; they are never evicted once seen.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Builder)]
pub struct EntityRecord {
    /// Namespaced identifier, e.g. `light.kitchen`
    pub entity_id: String,
    /// Current state value
    pub state: StateValue,
    /// Entity attributes (brightness, unit of measurement, ...)
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// When the state value last changed
    pub last_changed: DateTime<Utc>,
    /// When the record was last written, attribute-only updates included
    pub last_updated: DateTime<Utc>,
    /// Origin of the update
    #[serde(default)]
    pub context: Context,
}

impl EntityRecord {
    /// The `domain` half of the entity id, e.g. `light` for `light.kitchen`.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        domain(&self.entity_id)
    }
}

/// State values are strings or numbers on the wire, nothing else.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Textual state, e.g. `on`, `off`, `unavailable`
    Text(String),
    /// Numeric state, e.g. a sensor reading
    Number(f64),
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<f64> for StateValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

/// Provenance of a state update.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, Builder)]
pub struct Context {
    /// Unique id of the originating operation
    #[serde(default)]
    pub id: Option<String>,
    /// Id of the parent operation, if this update was caused by another
    #[serde(default)]
    pub parent_id: Option<String>,
    /// User that triggered the update, if any
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Delivered to watchers when an entity's state changes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StateChange {
    /// Entity the change applies to
    pub entity_id: String,
    /// Prior record, absent when the entity is first seen
    #[serde(default)]
    pub old_state: Option<EntityRecord>,
    /// New record
    pub new_state: EntityRecord,
}

/// Check that an id is a syntactically valid `domain.name` pair.
///
/// Both halves must be nonempty and restricted to lowercase alphanumerics and
/// underscores. Every key in the entity store satisfies this.
#[must_use]
pub fn valid_entity_id(id: &str) -> bool {
    let Some((domain, name)) = id.split_once('.') else {
        return false;
    };

    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };

    valid_part(domain) && valid_part(name)
}

/// Derive the domain from an entity id by splitting on the first `.`.
#[must_use]
pub fn domain(id: &str) -> Option<&str> {
    id.split_once('.').map(|(domain, _)| domain)
}
