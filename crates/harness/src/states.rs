//! Live entity state table fed by the `subscribe_entities` stream
//!
//! Deltas are merged additively: new and changed fields overwrite, removal
//! markers and removed entities are ignored, so entries are never pruned.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<f64>,
    #[serde(default)]
    pub last_updated: Option<f64>,
    #[serde(default)]
    pub context: Option<Value>,
}

impl EntityState {
    fn empty(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            state: String::new(),
            attributes: Map::new(),
            last_changed: None,
            last_updated: None,
            context: None,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Compressed state event payload
#[derive(Debug, Default, Deserialize)]
pub struct EntityDelta {
    /// Entities added or fully replaced
    #[serde(default, rename = "a")]
    pub added: HashMap<String, CompressedState>,
    /// Field-level changes
    #[serde(default, rename = "c")]
    pub changed: HashMap<String, CompressedDiff>,
    /// Removed entity ids
    #[serde(default, rename = "r")]
    pub removed: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompressedState {
    #[serde(default, rename = "s")]
    pub state: Option<String>,
    #[serde(default, rename = "a")]
    pub attributes: Option<Map<String, Value>>,
    #[serde(default, rename = "c")]
    pub context: Option<Value>,
    #[serde(default, rename = "lc")]
    pub last_changed: Option<f64>,
    #[serde(default, rename = "lu")]
    pub last_updated: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompressedDiff {
    #[serde(default, rename = "+")]
    pub additions: Option<CompressedState>,
    #[serde(default, rename = "-")]
    pub removals: Option<Value>,
}

impl EntityState {
    fn merge(&mut self, update: CompressedState) {
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(attributes) = update.attributes {
            self.attributes.extend(attributes);
        }
        if let Some(context) = update.context {
            self.context = Some(context);
        }
        // An omitted last_changed equals last_updated on the wire
        match (update.last_changed, update.last_updated) {
            (Some(lc), Some(lu)) => {
                self.last_changed = Some(lc);
                self.last_updated = Some(lu);
            }
            (Some(lc), None) => {
                self.last_changed = Some(lc);
                self.last_updated = Some(lc);
            }
            (None, Some(lu)) => self.last_updated = Some(lu),
            (None, None) => {}
        }
    }
}

struct Inner {
    entities: RwLock<HashMap<String, EntityState>>,
    revision: watch::Sender<u64>,
}

/// Shared, concurrently readable entity table
#[derive(Clone)]
pub struct EntityStateTable {
    inner: Arc<Inner>,
}

impl Default for EntityStateTable {
    fn default() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entities: RwLock::new(HashMap::new()),
                revision,
            }),
        }
    }
}

impl EntityStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one delta and wake waiters
    pub fn apply(&self, delta: EntityDelta) {
        {
            let mut entities = self.inner.entities.write();
            for (id, state) in delta.added {
                entities
                    .entry(id.clone())
                    .or_insert_with(|| EntityState::empty(&id))
                    .merge(state);
            }
            for (id, diff) in delta.changed {
                if let Some(additions) = diff.additions {
                    entities
                        .entry(id.clone())
                        .or_insert_with(|| EntityState::empty(&id))
                        .merge(additions);
                }
                if diff.removals.is_some() {
                    trace!(entity_id = %id, "ignoring attribute removals");
                }
            }
        }
        if !delta.removed.is_empty() {
            trace!(count = delta.removed.len(), "ignoring removed entities");
        }
        self.inner.revision.send_modify(|r| *r += 1);
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.inner.entities.read().get(entity_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, EntityState> {
        self.inner.entities.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of deltas applied so far
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Wait until `predicate` holds for the table or `timeout` elapses
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Result<()>
    where
        F: Fn(&HashMap<String, EntityState>) -> bool,
    {
        let mut revisions = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut observed = 0u32;
        loop {
            let satisfied = {
                let entities = self.inner.entities.read();
                predicate(&*entities)
            };
            if satisfied {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, revisions.changed()).await {
                Ok(Ok(())) => observed += 1,
                Ok(Err(_)) => return Err(Error::Disconnected),
                Err(_) => {
                    return Err(Error::Timeout {
                        what: "entity state".to_string(),
                        attempts: observed,
                    })
                }
            }
        }
    }

    /// Wait until `entity_id` reports `state`
    pub async fn wait_for_state(&self, entity_id: &str, state: &str, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, |entities| {
            entities.get(entity_id).is_some_and(|e| e.state == state)
        })
        .await
    }
}
