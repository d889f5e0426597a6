//! Observable keyed map.
//!
//! [`ObservableMap`] is a dictionary that announces every mutation. It backs
//! server-side state published through an [`EventSource`] (for example a
//! registered-users table) and client-side state folded from received pushes.
//!
//! # Change rules
//!
//! - `set` always notifies, whether or not the key existed.
//! - `update` merges into an existing value; absent keys are a silent no-op.
//! - `delete` notifies once per call, and only if something was removed.
//!
//! Keys iterate in insertion order. Replacing a value keeps its position;
//! deleting a key and setting it again moves it to the end.
//!
//! # Ownership
//!
//! Only the holder of the [`ObservableMap`] can mutate it. Everyone else gets
//! a [`MapReader`] (cloneable, read-only), which is also what `Deref` exposes
//! on the owner.

use std::fmt::Display;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::constants::MAP_CHANGE_BUFFER;
use crate::provider::EventSource;

/// Partial update applied by [`ObservableMap::update`].
pub trait Merge {
    /// Merge `partial` into `self`.
    fn merge(&mut self, partial: Self);
}

impl Merge for Value {
    /// Objects merge shallowly key by key; anything else is replaced.
    fn merge(&mut self, partial: Self) {
        match (self, partial) {
            (Value::Object(current), Value::Object(fields)) => {
                for (key, value) in fields {
                    current.insert(key, value);
                }
            }
            (current, partial) => *current = partial,
        }
    }
}

/// What a mutation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapChange<K> {
    /// Keys replaced by `set`, `set_batch` or `atomic_set`.
    Set(Vec<K>),
    /// Keys merged by `update` or `update_batch`.
    Updated(Vec<K>),
    /// Keys removed by `delete`.
    Deleted(Vec<K>),
    /// Every key removed by `clear`.
    Cleared,
}

impl<K: PartialEq> MapChange<K> {
    /// Whether this change may have altered `key`.
    pub fn touches(&self, key: &K) -> bool {
        match self {
            Self::Set(keys) | Self::Updated(keys) | Self::Deleted(keys) => keys.contains(key),
            Self::Cleared => true,
        }
    }
}

struct MapShared<K, V> {
    data: Mutex<IndexMap<K, V>>,
    changes: broadcast::Sender<MapChange<K>>,
}

/// Read-only handle to an [`ObservableMap`].
pub struct MapReader<K, V> {
    shared: Arc<MapShared<K, V>>,
}

impl<K, V> Clone for MapReader<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> std::fmt::Debug for MapReader<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapReader").finish_non_exhaustive()
    }
}

/// Owning, mutable observable map.
pub struct ObservableMap<K, V> {
    reader: MapReader<K, V>,
}

impl<K, V> std::fmt::Debug for ObservableMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableMap").finish_non_exhaustive()
    }
}

impl<K, V> Deref for ObservableMap<K, V> {
    type Target = MapReader<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl<K, V> Default for ObservableMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MapReader<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn lock(&self) -> MutexGuard<'_, IndexMap<K, V>> {
        self.shared.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value at `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    /// Copy of every entry in insertion order.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Subscribe to change notifications (future changes only).
    pub fn changes(&self) -> broadcast::Receiver<MapChange<K>> {
        self.shared.changes.subscribe()
    }

    /// Another read-only handle.
    pub fn reader(&self) -> MapReader<K, V> {
        self.clone()
    }
}

impl<K, V> MapReader<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Stream of whole-map snapshots, starting with the current one.
    pub fn snapshots(&self) -> BoxStream<'static, Vec<(K, V)>> {
        let (rx, first) = {
            let data = self.lock();
            let rx = self.shared.changes.subscribe();
            let first: Vec<(K, V)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            (rx, first)
        };
        let reader = self.clone();
        stream::unfold(
            (rx, Some(first), reader),
            |(mut rx, first, reader)| async move {
                if let Some(first) = first {
                    return Some((first, (rx, None, reader)));
                }
                match rx.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let snapshot = reader.snapshot();
                        Some((snapshot, (rx, None, reader)))
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            },
        )
        .boxed()
    }

    /// Stream of one key's value.
    ///
    /// Starts with the current value if the key is present, then yields the
    /// value after every change touching the key (`None` once removed).
    pub fn watch_key(&self, key: K) -> BoxStream<'static, Option<V>> {
        let (rx, current) = {
            let data = self.lock();
            (self.shared.changes.subscribe(), data.get(&key).cloned())
        };
        let reader = self.clone();
        let first = current.map(Some);
        stream::unfold(
            (rx, first, reader, key),
            |(mut rx, first, reader, key)| async move {
                if let Some(first) = first {
                    return Some((first, (rx, None, reader, key)));
                }
                loop {
                    match rx.recv().await {
                        Ok(change) if change.touches(&key) => {
                            let value = reader.get(&key);
                            return Some((value, (rx, None, reader, key)));
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let value = reader.get(&key);
                            return Some((value, (rx, None, reader, key)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        )
        .boxed()
    }
}

impl<K, V> MapReader<K, V>
where
    K: Hash + Eq + Clone + Display + Send + Sync + 'static,
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Entries as a JSON object keyed by `K`'s `Display`.
    pub fn to_json_table(&self) -> Value {
        table_json(&self.snapshot())
    }

    /// Event source publishing the JSON table, starting with the current one.
    ///
    /// Every subscriber reads this map directly; no extra task is spawned.
    pub fn event_source(&self) -> EventSource {
        let reader = self.clone();
        EventSource::view(move || {
            reader
                .snapshots()
                .map(|snapshot| table_json(&snapshot))
                .boxed()
        })
    }
}

fn table_json<K: Display, V: Serialize>(entries: &[(K, V)]) -> Value {
    let mut table = serde_json::Map::new();
    for (key, value) in entries {
        match serde_json::to_value(value) {
            Ok(value) => {
                table.insert(key.to_string(), value);
            }
            Err(e) => log::warn!("[ObservableMap] Skipping unserializable value for '{}': {}", key, e),
        }
    }
    Value::Object(table)
}

impl<K, V> ObservableMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Empty map.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(MAP_CHANGE_BUFFER);
        Self {
            reader: MapReader {
                shared: Arc::new(MapShared {
                    data: Mutex::new(IndexMap::new()),
                    changes,
                }),
            },
        }
    }

    fn notify(&self, change: MapChange<K>) {
        // No subscribers is not an error.
        let _ = self.reader.shared.changes.send(change);
    }

    /// Replace the value at `key`. Returns whether the key existed before.
    pub fn set(&self, key: K, value: V) -> bool {
        let mut data = self.reader.lock();
        let existed = data.insert(key.clone(), value).is_some();
        self.notify(MapChange::Set(vec![key]));
        existed
    }

    /// Replace several values with a single notification.
    pub fn set_batch<I>(&self, items: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut data = self.reader.lock();
        let mut keys = Vec::new();
        for (key, value) in items {
            data.insert(key.clone(), value);
            keys.push(key);
        }
        self.notify(MapChange::Set(keys));
    }

    /// Compute and store a new value from the current one in one step.
    ///
    /// `f` receives the current value, or `None` if absent. Returns the
    /// stored value.
    pub fn atomic_set<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let mut data = self.reader.lock();
        let value = f(data.get(&key));
        data.insert(key.clone(), value.clone());
        self.notify(MapChange::Set(vec![key]));
        value
    }

    /// Like [`Self::atomic_set`], substituting `default` for an absent value.
    pub fn atomic_set_or<F>(&self, key: K, default: V, f: F) -> V
    where
        F: FnOnce(&V) -> V,
    {
        self.atomic_set(key, |current| f(current.unwrap_or(&default)))
    }

    /// Remove each present key; notifies once if anything was removed.
    pub fn delete(&self, keys: &[K]) -> usize {
        let mut data = self.reader.lock();
        let removed: Vec<K> = keys
            .iter()
            .filter(|key| data.shift_remove(*key).is_some())
            .cloned()
            .collect();
        let count = removed.len();
        if count > 0 {
            self.notify(MapChange::Deleted(removed));
        }
        count
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut data = self.reader.lock();
        data.clear();
        self.notify(MapChange::Cleared);
    }
}

impl<K, V> ObservableMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Merge,
{
    /// Merge `partial` into the value at `key`. No-op if absent.
    pub fn update(&self, key: K, partial: V) -> bool {
        let mut data = self.reader.lock();
        let Some(current) = data.get_mut(&key) else {
            return false;
        };
        current.merge(partial);
        self.notify(MapChange::Updated(vec![key]));
        true
    }

    /// Merge several partial values; notifies once if any key was present.
    pub fn update_batch<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut data = self.reader.lock();
        let mut updated = Vec::new();
        for (key, partial) in items {
            if let Some(current) = data.get_mut(&key) {
                current.merge(partial);
                updated.push(key);
            }
        }
        let count = updated.len();
        if count > 0 {
            self.notify(MapChange::Updated(updated));
        }
        count
    }
}
