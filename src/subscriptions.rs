//! Reference-counted event subscriptions.
//!
//! Many independent `receive()` callers may want the same event type; the
//! peer only needs to hear about the *set* of wanted types. The registry keeps
//! a live count per type and publishes the full key set whenever membership
//! changes (first subscriber added, last subscriber released).
//!
//! The registry never talks to the peer. The session announces
//! [`SubscriptionRegistry::active`] on every open and forwards
//! [`SubscriptionRegistry::changes`] while connected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

/// Live subscription counts for one session.
#[derive(Debug, Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    counts: Mutex<BTreeMap<String, usize>>,
    changes: watch::Sender<BTreeSet<String>>,
}

impl RegistryInner {
    fn publish(&self, counts: &BTreeMap<String, usize>) {
        self.changes.send_replace(counts.keys().cloned().collect());
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(BTreeSet::new());
        Self {
            inner: Arc::new(RegistryInner {
                counts: Mutex::new(BTreeMap::new()),
                changes,
            }),
        }
    }

    /// Register interest in `event`. Interest lasts until the guard is dropped.
    pub fn subscribe(&self, event: &str) -> SubscriptionGuard {
        let mut counts = self.inner.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(event.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            log::debug!("[Subscriptions] First subscriber for '{}'", event);
            self.inner.publish(&counts);
        }
        SubscriptionGuard {
            registry: Arc::clone(&self.inner),
            event: event.to_string(),
        }
    }

    /// Event types with at least one subscriber.
    pub fn active(&self) -> BTreeSet<String> {
        self.inner
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Current subscriber count for `event`.
    pub fn count(&self, event: &str) -> usize {
        self.inner
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .copied()
            .unwrap_or(0)
    }

    /// Watch the active set; notified whenever membership changes.
    pub fn changes(&self) -> watch::Receiver<BTreeSet<String>> {
        self.inner.changes.subscribe()
    }
}

/// Interest in one event type; released on drop.
#[derive(Debug)]
pub struct SubscriptionGuard {
    registry: Arc<RegistryInner>,
    event: String,
}

impl SubscriptionGuard {
    /// Event type this guard holds.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Release interest now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut counts = self
            .registry
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(count) = counts.get_mut(&self.event) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(&self.event);
            log::debug!("[Subscriptions] Last subscriber released '{}'", self.event);
            self.registry.publish(&counts);
        }
    }
}
