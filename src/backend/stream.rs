//! Streaming glue between graph subscriptions and application callbacks.
//!
//! A logical stream owns one [`StreamContext`] that tracks every graph
//! subscription opened on its behalf, so a single `unstream()` detaches all
//! of them. [`Streamer`] counts successful emissions and, after a timeout
//! with none, emits a synthetic empty value so callers can leave the loading
//! state.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::backend::crypto::{self, HashEncoding};
use crate::backend::graph::{Delivery, EventHandle, Subscription};
use crate::config::ChatConfig;
use crate::error::Result;

/// Last raw delivery seen for a key of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamContextItem {
    pub raw: Option<Value>,
    pub soul: String,
}

#[derive(Default)]
struct ContextInner {
    items: Mutex<HashMap<String, StreamContextItem>>,
    events: Mutex<Vec<EventHandle>>,
    children: Mutex<Vec<StreamContext>>,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct StreamContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("items", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ties a graph listener to this stream. A listener tracked after
    /// `unstream()` is detached immediately.
    pub fn track(&self, event: EventHandle) {
        if self.is_closed() {
            event.off();
            return;
        }
        self.inner.events.lock().push(event);
    }

    /// Ties a nested stream to this one so it is unstreamed along with it.
    pub fn attach(&self, child: StreamContext) {
        if self.is_closed() {
            child.unstream();
            return;
        }
        self.inner.children.lock().push(child);
    }

    pub fn record(&self, delivery: &Delivery) {
        self.inner.items.lock().insert(
            delivery.key.clone(),
            StreamContextItem {
                raw: delivery.data.clone(),
                soul: delivery.soul.clone(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<StreamContextItem> {
        self.inner.items.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn unstream(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let events: Vec<EventHandle> = self.inner.events.lock().drain(..).collect();
        for event in &events {
            event.off();
        }
        if !events.is_empty() {
            tracing::trace!(listeners = events.len(), "unstreamed");
        }
        let children: Vec<StreamContext> = self.inner.children.lock().drain(..).collect();
        for child in &children {
            child.unstream();
        }
    }
}

pub struct StreamResult<T> {
    pub data: Option<T>,
    pub context: StreamContext,
}

impl<T> StreamResult<T> {
    pub fn unstream(&self) {
        self.context.unstream();
    }
}

pub type StreamCallback<T> = Arc<dyn Fn(StreamResult<T>) + Send + Sync>;

pub fn callback<T>(f: impl Fn(StreamResult<T>) + Send + Sync + 'static) -> StreamCallback<T> {
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub timeout: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_millis(5000)),
        }
    }
}

impl StreamOptions {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            timeout: config.stream_timeout(),
        }
    }
}

/// Emits `value` outside of any stream; its context detaches nothing.
pub fn emit_static_value<T>(callback: &StreamCallback<T>, value: Option<T>) {
    callback(StreamResult {
        data: value,
        context: StreamContext::new(),
    });
}

pub fn emit_stream_value<T>(data: Option<T>, context: &StreamContext, callback: &StreamCallback<T>) {
    if context.is_closed() {
        return;
    }
    callback(StreamResult {
        data,
        context: context.clone(),
    });
}

pub struct Streamer<T> {
    callback: StreamCallback<T>,
    resolve_count: AtomicUsize,
    context: StreamContext,
}

impl<T> Streamer<T> {
    pub fn context(&self) -> &StreamContext {
        &self.context
    }

    pub fn resolve_count(&self) -> usize {
        self.resolve_count.load(Ordering::Acquire)
    }

    /// `success = false` forwards the value without counting the stream as
    /// resolved, so the timeout can still fire.
    pub fn emit_value(&self, data: Option<T>, success: bool) {
        if self.context.is_closed() {
            return;
        }
        if success {
            self.resolve_count.fetch_add(1, Ordering::AcqRel);
        }
        emit_stream_value(data, &self.context, &self.callback);
    }
}

/// Must be called from inside a tokio runtime when a timeout is set.
pub fn create_streamer<T: Send + 'static>(
    callback: StreamCallback<T>,
    options: StreamOptions,
) -> Arc<Streamer<T>> {
    let streamer = Arc::new(Streamer {
        callback,
        resolve_count: AtomicUsize::new(0),
        context: StreamContext::new(),
    });
    if let Some(timeout) = options.timeout {
        let pending = streamer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if pending.resolve_count() == 0 {
                pending.emit_value(None, false);
            }
        });
    }
    streamer
}

/// Starts a stream and resolves with its first value, detaching it right
/// after.
pub async fn first_value<T, R, F>(start: F) -> Result<Option<T>>
where
    T: Send + 'static,
    F: FnOnce(StreamCallback<T>) -> Result<R>,
{
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    start(callback(move |result: StreamResult<T>| {
        result.unstream();
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(result.data);
        }
    }))?;
    Ok(rx.await.ok().flatten())
}

/// Suppresses re-deliveries whose serialized content did not change.
#[derive(Default)]
pub struct DigestRegistry {
    digests: Mutex<HashMap<String, String>>,
}

impl DigestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn digest<T: Serialize + ?Sized>(data: &T) -> Option<String> {
        match serde_json::to_string(data) {
            Ok(json) => Some(crypto::hash(&json, HashEncoding::Hex)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to digest stream payload");
                None
            }
        }
    }

    /// True when `data` differs from what was last seen under `key`. Payloads
    /// that cannot be digested always count as changed.
    pub fn is_changed<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> bool {
        let Some(digest) = Self::digest(data) else {
            return true;
        };
        let mut digests = self.digests.lock();
        if digests.get(key) == Some(&digest) {
            return false;
        }
        digests.insert(key.to_string(), digest);
        true
    }
}

#[derive(Default)]
pub struct OnceRegistry {
    seen: Mutex<HashSet<String>>,
}

impl OnceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first(&self, id: &str) -> bool {
        self.seen.lock().insert(id.to_string())
    }
}

/// Every stream a long-lived owner opened, so they can be closed together.
#[derive(Default)]
pub struct Subscriptions {
    contexts: Mutex<Vec<StreamContext>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, context: StreamContext) {
        let mut contexts = self.contexts.lock();
        contexts.retain(|c| !c.is_closed());
        contexts.push(context);
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unstream_all(&self) {
        let contexts: Vec<StreamContext> = self.contexts.lock().drain(..).collect();
        for context in &contexts {
            context.unstream();
        }
    }
}

/// Waits for the next delivery. With a debounce window, keeps absorbing
/// deliveries until the window passes quietly, keeping the latest per key.
pub async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<Delivery>,
    debounce: Option<Duration>,
) -> Option<Vec<Delivery>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    if let Some(delay) = debounce {
        while let Ok(Some(next)) = tokio::time::timeout(delay, rx.recv()).await {
            match batch.iter_mut().find(|d| d.key == next.key) {
                Some(slot) => *slot = next,
                None => batch.push(next),
            }
        }
    }
    Some(batch)
}

/// Drives `subscription` on a task, recording each delivery in `context`
/// before handing it to `handler`. Stops once the context is unstreamed.
pub fn pump<F, Fut>(
    subscription: Subscription,
    context: StreamContext,
    debounce: Option<Duration>,
    mut handler: F,
) where
    F: FnMut(Delivery) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Subscription { mut rx, event } = subscription;
    context.track(event);
    tokio::spawn(async move {
        while let Some(batch) = next_batch(&mut rx, debounce).await {
            for delivery in batch {
                if context.is_closed() {
                    return;
                }
                context.record(&delivery);
                handler(delivery).await;
            }
        }
    });
}

pub async fn retry<T, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut remaining = attempts;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if remaining > 0 => {
                tracing::debug!(error = %e, remaining, "retrying");
                remaining -= 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::graph::GraphDb;
    use crate::error::ChatError;
    use serde_json::json;

    fn counting_callback() -> (StreamCallback<Value>, Arc<Mutex<Vec<Option<Value>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb = callback(move |result: StreamResult<Value>| {
            sink.lock().push(result.data);
        });
        (cb, seen)
    }

    fn dedup_stream(db: &GraphDb, soul: &str, streamer: Arc<Streamer<Value>>) {
        let registry = Arc::new(DigestRegistry::new());
        let context = streamer.context().clone();
        pump(db.get(soul).on(), context, None, move |delivery| {
            let registry = registry.clone();
            let streamer = streamer.clone();
            async move {
                if registry.is_changed(&delivery.key, &delivery.data) {
                    streamer.emit_value(delivery.data, true);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_unchanged_redeliveries_emit_once() {
        let db = GraphDb::in_memory();
        let (cb, seen) = counting_callback();
        let streamer = create_streamer(cb, StreamOptions { timeout: None });
        dedup_stream(&db, "node", streamer);

        for _ in 0..3 {
            db.get("node").put(json!({"text": "same"})).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock(), vec![Some(json!({"text": "same"}))]);
    }

    #[tokio::test]
    async fn test_no_emission_after_unstream() {
        let db = GraphDb::in_memory();
        let (cb, seen) = counting_callback();
        let streamer = create_streamer(cb, StreamOptions { timeout: None });
        let context = streamer.context().clone();
        dedup_stream(&db, "node", streamer);

        db.get("node").put(json!({"v": 1})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(context.get("node").unwrap().raw, Some(json!({"v": 1})));

        context.unstream();
        assert_eq!(db.listener_count(), 0);
        db.get("node").put(json!({"v": 2})).unwrap();
        db.get("node").put(json!({"v": 3})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_emits_empty_when_unresolved() {
        let (cb, seen) = counting_callback();
        let streamer = create_streamer(
            cb,
            StreamOptions {
                timeout: Some(Duration::from_millis(10)),
            },
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(*seen.lock(), vec![None]);
        assert_eq!(streamer.resolve_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_skipped_after_resolution() {
        let (cb, seen) = counting_callback();
        let streamer = create_streamer(
            cb,
            StreamOptions {
                timeout: Some(Duration::from_millis(10)),
            },
        );
        streamer.emit_value(Some(json!(1)), true);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(*seen.lock(), vec![Some(json!(1))]);
    }

    #[tokio::test]
    async fn test_unsuccessful_emission_keeps_timeout_armed() {
        let (cb, seen) = counting_callback();
        let streamer = create_streamer(
            cb,
            StreamOptions {
                timeout: Some(Duration::from_millis(10)),
            },
        );
        streamer.emit_value(None, false);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(*seen.lock(), vec![None, None]);
    }

    #[tokio::test]
    async fn test_first_value_resolves_and_detaches() {
        let db = GraphDb::in_memory();
        db.get("node").put(json!({"v": 1})).unwrap();

        let value = first_value(|cb| {
            let streamer = create_streamer(cb, StreamOptions::default());
            dedup_stream(&db, "node", streamer);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(value, Some(json!({"v": 1})));
        assert_eq!(db.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_first_value_propagates_start_error() {
        let result = first_value::<Value, (), _>(|_| Err(ChatError::NoUser)).await;
        assert!(matches!(result, Err(ChatError::NoUser)));
    }

    #[tokio::test]
    async fn test_unstream_reaches_attached_contexts() {
        let db = GraphDb::in_memory();
        let (cb, _) = counting_callback();
        let outer = create_streamer(cb.clone(), StreamOptions { timeout: None });
        let inner = create_streamer(cb, StreamOptions { timeout: None });
        let parent = outer.context().clone();
        parent.attach(inner.context().clone());
        dedup_stream(&db, "a", outer);
        dedup_stream(&db, "b", inner);
        assert_eq!(db.listener_count(), 2);

        parent.unstream();
        assert_eq!(db.listener_count(), 0);

        let late = StreamContext::new();
        parent.attach(late.clone());
        assert!(late.is_closed());
    }

    #[tokio::test]
    async fn test_subscriptions_unstream_all() {
        let db = GraphDb::in_memory();
        let subscriptions = Subscriptions::new();
        for soul in ["a", "b", "c"] {
            let (cb, _) = counting_callback();
            let streamer = create_streamer(cb, StreamOptions { timeout: None });
            subscriptions.track(streamer.context().clone());
            dedup_stream(&db, soul, streamer);
        }
        assert_eq!(subscriptions.len(), 3);
        assert_eq!(db.listener_count(), 3);

        subscriptions.unstream_all();
        assert!(subscriptions.is_empty());
        assert_eq!(db.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_next_batch_coalesces_per_key() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (key, v) in [("a", 1), ("b", 1), ("a", 2), ("a", 3)] {
            tx.send(Delivery {
                data: Some(json!(v)),
                key: key.to_string(),
                soul: key.to_string(),
            })
            .unwrap();
        }

        let batch = next_batch(&mut rx, Some(Duration::from_millis(10))).await.unwrap();
        let summary: Vec<(String, Option<Value>)> =
            batch.into_iter().map(|d| (d.key, d.data)).collect();
        assert_eq!(
            summary,
            vec![("a".to_string(), Some(json!(3))), ("b".to_string(), Some(json!(1)))]
        );

        drop(tx);
        assert!(next_batch(&mut rx, None).await.is_none());
    }

    #[test]
    fn test_digest_registry_tracks_per_key() {
        let registry = DigestRegistry::new();
        assert!(registry.is_changed("a", &json!({"x": 1})));
        assert!(!registry.is_changed("a", &json!({"x": 1})));
        assert!(registry.is_changed("b", &json!({"x": 1})));
        assert!(registry.is_changed("a", &json!({"x": 2})));
    }

    #[test]
    fn test_once_registry() {
        let once = OnceRegistry::new();
        assert!(once.first("id"));
        assert!(!once.first("id"));
        assert!(once.first("other"));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value = retry(3, Duration::from_millis(1), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ChatError::NoBoxPair)
                } else {
                    Ok("loaded")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
