//! Named event sources served to subscribed peers.
//!
//! An [`EventProvider`] maps an event name to an [`EventSource`]. The server
//! runtime asks `has_event` when a peer subscribes and binds a forwarder to
//! `observe(name).subscribe()` for that connection.
//!
//! # Sharing
//!
//! Sources are hot and shared: `observe` hands out clones of the same
//! [`EventSource`], so several connections watching one name never repeat
//! the upstream work.
//!
//! | Constructor | Semantics |
//! |---|---|
//! | [`EventSource::channel`] | push-based; subscribers see values published after they subscribed |
//! | [`EventSource::state`] | latest value; every subscriber starts with the current value |
//! | [`EventSource::shared`] | upstream stream started once for the first subscriber, stopped after the last |
//! | [`EventSource::view`] | per-subscriber read of state owned elsewhere (e.g. a keyed map) |
//!
//! Push fan-out is lossless: every subscriber has its own unbounded queue, so
//! a slow subscriber grows its queue instead of skipping values.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Stream of payloads from one source.
pub type EventStream = BoxStream<'static, Value>;

/// Lookup from event name to source.
pub trait EventProvider: Send + Sync {
    /// Whether `name` can be observed.
    fn has_event(&self, name: &str) -> bool;

    /// The source for `name`. Must return the same ongoing source every time.
    fn observe(&self, name: &str) -> Option<EventSource>;
}

/// A hot, shareable source of JSON payloads.
#[derive(Clone)]
pub struct EventSource {
    kind: Arc<SourceKind>,
}

enum SourceKind {
    Channel(Arc<Fanout>),
    State(Arc<watch::Sender<Value>>),
    Shared(Arc<SharedUpstream>),
    View(Box<dyn Fn() -> EventStream + Send + Sync>),
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind.as_ref() {
            SourceKind::Channel(_) => "channel",
            SourceKind::State(_) => "state",
            SourceKind::Shared(_) => "shared",
            SourceKind::View(_) => "view",
        };
        f.debug_struct("EventSource").field("kind", &kind).finish()
    }
}

impl EventSource {
    /// Push-based source; each subscriber queues values without bound.
    pub fn channel() -> (EventPublisher, Self) {
        let fanout = Arc::new(Fanout::default());
        let source = Self {
            kind: Arc::new(SourceKind::Channel(Arc::clone(&fanout))),
        };
        (EventPublisher { fanout }, source)
    }

    /// Latest-value source starting at `initial`.
    pub fn state(initial: Value) -> (StatePublisher, Self) {
        let (tx, _) = watch::channel(initial);
        let tx = Arc::new(tx);
        let source = Self {
            kind: Arc::new(SourceKind::State(Arc::clone(&tx))),
        };
        (StatePublisher { tx }, source)
    }

    /// Source backed by an upstream stream created on demand.
    ///
    /// `factory` runs when the subscriber count goes from zero to one; the
    /// resulting stream is polled by a single task and fanned out to every
    /// subscriber. The task is aborted when the count drops back to zero.
    /// Must be called within a tokio runtime when subscribed.
    pub fn shared<F>(factory: F) -> Self
    where
        F: Fn() -> EventStream + Send + Sync + 'static,
    {
        Self {
            kind: Arc::new(SourceKind::Shared(Arc::new(SharedUpstream {
                factory: Box::new(factory),
                running: Mutex::new(None),
            }))),
        }
    }

    /// Per-subscriber view over state that is already shared elsewhere.
    ///
    /// `view` runs once per subscriber, so it must not start production of
    /// its own; it should only read state owned by someone else (see
    /// [`crate::keyed_map::MapReader::event_source`]).
    pub fn view<F>(view: F) -> Self
    where
        F: Fn() -> EventStream + Send + Sync + 'static,
    {
        Self {
            kind: Arc::new(SourceKind::View(Box::new(view))),
        }
    }

    /// Start receiving values.
    pub fn subscribe(&self) -> EventStream {
        match self.kind.as_ref() {
            SourceKind::View(view) => view(),
            SourceKind::Channel(fanout) => queue_stream(fanout.subscribe(), ()),
            SourceKind::State(tx) => {
                let rx = tx.subscribe();
                stream::unfold((rx, true), |(mut rx, first)| async move {
                    if !first {
                        rx.changed().await.ok()?;
                    }
                    let value = rx.borrow_and_update().clone();
                    Some((value, (rx, false)))
                })
                .boxed()
            }
            SourceKind::Shared(upstream) => {
                let rx = upstream.attach();
                let guard = SharedGuard {
                    upstream: Arc::clone(upstream),
                };
                queue_stream(rx, guard)
            }
        }
    }

    /// Whether two handles refer to the same underlying source.
    pub fn same_source(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.kind, &other.kind)
    }
}

/// Turn a subscriber queue into a stream, keeping `guard` alive with it.
fn queue_stream<G>(rx: mpsc::UnboundedReceiver<Value>, guard: G) -> EventStream
where
    G: Send + 'static,
{
    stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let value = rx.recv().await?;
        Some((value, (rx, guard)))
    })
    .boxed()
}

/// One unbounded queue per subscriber.
#[derive(Debug, Default)]
struct Fanout {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
}

impl Fanout {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping the ones that went away.
    fn publish(&self, value: &Value) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        subscribers.len()
    }

    fn live(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

/// Publishing side of [`EventSource::channel`].
#[derive(Debug, Clone)]
pub struct EventPublisher {
    fanout: Arc<Fanout>,
}

impl EventPublisher {
    /// Publish a value; returns how many subscribers will see it.
    pub fn publish(&self, value: Value) -> usize {
        self.fanout.publish(&value)
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.fanout.live()
    }
}

/// Publishing side of [`EventSource::state`].
#[derive(Debug, Clone)]
pub struct StatePublisher {
    tx: Arc<watch::Sender<Value>>,
}

impl StatePublisher {
    /// Replace the current value and notify subscribers.
    pub fn set(&self, value: Value) {
        self.tx.send_replace(value);
    }

    /// Current value.
    pub fn get(&self) -> Value {
        self.tx.borrow().clone()
    }
}

struct SharedUpstream {
    factory: Box<dyn Fn() -> EventStream + Send + Sync>,
    running: Mutex<Option<RunningUpstream>>,
}

struct RunningUpstream {
    fanout: Arc<Fanout>,
    task: JoinHandle<()>,
    subscribers: usize,
}

impl SharedUpstream {
    fn attach(&self) -> mpsc::UnboundedReceiver<Value> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let upstream = running.get_or_insert_with(|| {
            log::debug!("[EventSource] Starting shared upstream");
            let fanout = Arc::new(Fanout::default());
            let task_fanout = Arc::clone(&fanout);
            let mut source = (self.factory)();
            let task = tokio::spawn(async move {
                while let Some(value) = source.next().await {
                    task_fanout.publish(&value);
                }
            });
            RunningUpstream {
                fanout,
                task,
                subscribers: 0,
            }
        });
        upstream.subscribers += 1;
        upstream.fanout.subscribe()
    }

    fn detach(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(upstream) = running.as_mut() else {
            return;
        };
        upstream.subscribers = upstream.subscribers.saturating_sub(1);
        if upstream.subscribers == 0 {
            log::debug!("[EventSource] Last subscriber gone, stopping shared upstream");
            upstream.task.abort();
            *running = None;
        }
    }
}

struct SharedGuard {
    upstream: Arc<SharedUpstream>,
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        self.upstream.detach();
    }
}

/// Provider over a fixed table of sources.
#[derive(Debug, Clone, Default)]
pub struct StaticEventProvider {
    sources: HashMap<String, EventSource>,
}

impl StaticEventProvider {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source (builder style).
    pub fn with(mut self, name: impl Into<String>, source: EventSource) -> Self {
        self.insert(name, source);
        self
    }

    /// Add or replace a source.
    pub fn insert(&mut self, name: impl Into<String>, source: EventSource) {
        self.sources.insert(name.into(), source);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }
}

impl FromIterator<(String, EventSource)> for StaticEventProvider {
    fn from_iter<I: IntoIterator<Item = (String, EventSource)>>(iter: I) -> Self {
        Self {
            sources: iter.into_iter().collect(),
        }
    }
}

impl EventProvider for StaticEventProvider {
    fn has_event(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    fn observe(&self, name: &str) -> Option<EventSource> {
        self.sources.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn next(stream: &mut EventStream) -> Value {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for value")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_channel_source_delivers_to_all_subscribers() {
        let (publisher, source) = EventSource::channel();
        let mut a = source.subscribe();
        let mut b = source.subscribe();
        assert_eq!(publisher.publish(json!(1)), 2);
        assert_eq!(next(&mut a).await, json!(1));
        assert_eq!(next(&mut b).await, json!(1));
    }

    #[tokio::test]
    async fn test_channel_source_queues_for_slow_subscriber() {
        let (publisher, source) = EventSource::channel();
        let mut slow = source.subscribe();
        for n in 0..3000 {
            publisher.publish(json!(n));
        }
        for n in 0..3000 {
            assert_eq!(next(&mut slow).await, json!(n));
        }
    }

    #[tokio::test]
    async fn test_channel_source_forgets_dropped_subscribers() {
        let (publisher, source) = EventSource::channel();
        let a = source.subscribe();
        let _b = source.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);
        drop(a);
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(publisher.publish(json!(1)), 1);
    }

    #[tokio::test]
    async fn test_state_source_replays_current_value() {
        let (publisher, source) = EventSource::state(json!({ "word": "foo" }));
        publisher.set(json!({ "word": "bar" }));
        let mut stream = source.subscribe();
        assert_eq!(next(&mut stream).await, json!({ "word": "bar" }));
        publisher.set(json!({ "word": "baz" }));
        assert_eq!(next(&mut stream).await, json!({ "word": "baz" }));
        assert_eq!(publisher.get(), json!({ "word": "baz" }));
    }

    #[tokio::test]
    async fn test_shared_source_starts_upstream_once() {
        let starts = Arc::new(AtomicUsize::new(0));
        let (publisher, upstream) = EventSource::channel();
        let counter = Arc::clone(&starts);
        let source = EventSource::shared(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            upstream.subscribe()
        });

        let mut a = source.subscribe();
        let mut b = source.subscribe();
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        assert_eq!(publisher.subscriber_count(), 1);
        publisher.publish(json!("tick"));
        assert_eq!(next(&mut a).await, json!("tick"));
        assert_eq!(next(&mut b).await, json!("tick"));
    }

    #[tokio::test]
    async fn test_shared_source_restarts_after_last_subscriber() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let source = EventSource::shared(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            stream::pending::<Value>().boxed()
        });

        let a = source.subscribe();
        drop(a);
        let _b = source.subscribe();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_static_provider_returns_same_source() {
        let (_publisher, source) = EventSource::channel();
        let provider = StaticEventProvider::new().with("woth", source);
        assert!(provider.has_event("woth"));
        assert!(!provider.has_event("voice"));
        let first = provider.observe("woth").unwrap();
        let second = provider.observe("woth").unwrap();
        assert!(first.same_source(&second));
        assert_eq!(provider.names(), vec!["woth".to_string()]);
    }
}
