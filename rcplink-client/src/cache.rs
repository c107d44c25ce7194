//! Last-known device state.
//!
//! The cache stores one value per `(address, row, column)` and broadcasts a
//! [`ChangeEvent`] whenever a stored value actually changes. A lookup that
//! misses schedules a fetch on the command queue so the value arrives later.

use crate::queue::CommandQueue;
use rcplink_protocol::{Catalog, Command, Value};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Identifies one cached parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub address: String,
    pub row: u32,
    pub column: u32,
}

impl CacheKey {
    pub fn new(address: impl Into<String>, row: u32, column: u32) -> Self {
        Self {
            address: address.into(),
            row,
            column,
        }
    }
}

impl From<&Command> for CacheKey {
    fn from(cmd: &Command) -> Self {
        Self::new(cmd.address.clone(), cmd.row, cmd.column)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}:{}]", self.address, self.row, self.column)
    }
}

/// Emitted when a cached value changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub key: CacheKey,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

/// Per-session value store.
pub struct StateCache {
    catalog: Arc<Catalog>,
    entries: HashMap<CacheKey, Value>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl StateCache {
    pub fn new(catalog: Arc<Catalog>, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            catalog,
            entries: HashMap::new(),
            changes,
        }
    }

    /// Subscribes to value changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Returns the cached value without side effects.
    pub fn peek(&self, key: &CacheKey) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Returns the cached value. On a miss for a readable parameter a get is
    /// queued so the device reports the value.
    pub fn get(&self, key: &CacheKey, queue: &mut CommandQueue) -> Option<Value> {
        if let Some(value) = self.entries.get(key) {
            return Some(value.clone());
        }

        let readable = self
            .catalog
            .get(&key.address)
            .map_or(false, |def| def.access.readable());
        if readable {
            tracing::trace!("Cache miss for {}, requesting", key);
            queue.enqueue(Command::get(key.address.clone(), key.row, key.column));
        }
        None
    }

    /// Stores a value, notifying subscribers if it differs from the previous
    /// one. Returns whether the value changed.
    pub fn put(&mut self, key: CacheKey, value: Value) -> bool {
        if let Some(previous) = self.entries.get(&key) {
            let unchanged = match self.catalog.get(&key.address) {
                Some(def) => def.values_equal(previous, &value),
                None => previous == &value,
            };
            if unchanged {
                return false;
            }
        }

        let previous = self.entries.insert(key.clone(), value.clone());
        tracing::trace!("{} = {}", key, value);
        // No subscribers is not an error.
        let _ = self.changes.send(ChangeEvent {
            key,
            value,
            previous,
        });
        true
    }

    /// Removes every entry. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
}
