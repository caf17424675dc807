//! Telemetry store seam.
//!
//! Bridges never talk to Zenoh directly. They write through a
//! [`TelemetryStore`], which [`ZenohStore`] implements on top of zenoh-ext
//! advanced publishers (so the latest value of every field stays available to
//! late-joining readers) and which [`MemoryStore`] implements for tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use zenoh::Session;
use zenoh::pubsub::Subscriber;
use zenoh_ext::{AdvancedPublisher, AdvancedPublisherBuilderExt, CacheConfig};

use cryosight_common::{TelemetryPoint, decode_auto};

use crate::error::{BridgeError, Result};

/// A payload delivered to a subscription callback.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSample {
    pub key: String,
    pub payload: Vec<u8>,
}

/// Callback invoked on the store's delivery thread for every matching sample.
///
/// Must not block: post the sample somewhere and return.
pub type SampleCallback = Arc<dyn Fn(StoreSample) + Send + Sync>;

/// Narrow interface to the shared telemetry store.
pub trait TelemetryStore: Send + Sync + 'static {
    /// Write one encoded value under `key`.
    fn put(&self, key: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Deliver every future write matching `key` to `callback`.
    fn subscribe(
        &self,
        key: &str,
        callback: SampleCallback,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Release publishers and subscriptions.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// [`TelemetryStore`] backed by a Zenoh session.
pub struct ZenohStore {
    session: Arc<Session>,
    /// Samples cached per key; 0 means plain `session.put`.
    history: usize,
    publishers: RwLock<HashMap<String, AdvancedPublisher<'static>>>,
    subscribers: Mutex<Vec<Subscriber<()>>>,
}

impl std::fmt::Debug for ZenohStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZenohStore")
            .field("zid", &self.session.zid())
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

impl ZenohStore {
    pub fn new(session: Arc<Session>, history: usize) -> Self {
        Self {
            session,
            history,
            publishers: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Number of cached advanced publishers.
    pub async fn publisher_count(&self) -> usize {
        self.publishers.read().await.len()
    }

    async fn ensure_publisher(&self, key: &str) -> Result<()> {
        if self.publishers.read().await.contains_key(key) {
            return Ok(());
        }

        let publisher: AdvancedPublisher<'_> = self
            .session
            .declare_publisher(key.to_string())
            .cache(CacheConfig::default().max_samples(self.history))
            .publisher_detection()
            .await
            .map_err(|e| {
                BridgeError::publish(key, format!("Failed to create advanced publisher: {}", e))
            })?;

        // Safety: the session outlives every publisher; both are owned by this
        // store and publishers are dropped in `close` before the session is.
        let publisher: AdvancedPublisher<'static> = unsafe { std::mem::transmute(publisher) };

        self.publishers
            .write()
            .await
            .insert(key.to_string(), publisher);

        tracing::debug!(key = %key, history = self.history, "Created advanced publisher");
        Ok(())
    }
}

impl TelemetryStore for ZenohStore {
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        if self.history == 0 {
            return self
                .session
                .put(key, payload)
                .await
                .map_err(|e| BridgeError::publish(key, e));
        }

        self.ensure_publisher(key).await?;

        let publishers = self.publishers.read().await;
        match publishers.get(key) {
            Some(publisher) => publisher
                .put(payload)
                .await
                .map_err(|e| BridgeError::publish(key, e)),
            None => Err(BridgeError::publish(key, "publisher closed")),
        }
    }

    async fn subscribe(&self, key: &str, callback: SampleCallback) -> Result<()> {
        let subscriber = self
            .session
            .declare_subscriber(key.to_string())
            .callback(move |sample| {
                callback(StoreSample {
                    key: sample.key_expr().as_str().to_string(),
                    payload: sample.payload().to_bytes().into_owned(),
                })
            })
            .await
            .map_err(|e| BridgeError::subscribe(key, e))?;

        tracing::debug!(key = %key, "Declared subscriber");

        self.subscribers
            .lock()
            .map_err(|_| BridgeError::subscribe(key, "subscriber list poisoned"))?
            .push(subscriber);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.publishers.write().await.clear();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
        Ok(())
    }
}

/// In-memory [`TelemetryStore`].
///
/// Keeps the latest payload per key and a log of every put. Subscriptions are
/// delivered synchronously from `put` and [`inject`](Self::inject), the way a
/// local Zenoh session delivers to its own subscribers.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    values: Mutex<HashMap<String, Vec<u8>>>,
    log: Mutex<Vec<StoreSample>>,
    subscribers: Mutex<Vec<(String, SampleCallback)>>,
    fail_puts: AtomicUsize,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("puts", &self.put_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest payload written under `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.values.lock().ok()?.get(key).cloned()
    }

    /// Latest value under `key`, decoded as a telemetry point.
    pub fn get_point(&self, key: &str) -> Option<TelemetryPoint> {
        decode_auto(&self.get(key)?).ok()
    }

    /// Every successful put, in order.
    pub fn puts(&self) -> Vec<StoreSample> {
        self.inner
            .log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn put_count(&self) -> usize {
        self.inner.log.lock().map(|log| log.len()).unwrap_or(0)
    }

    /// Make the next `n` puts fail with a publish error.
    pub fn fail_next_puts(&self, n: usize) {
        self.inner.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Simulate a write by another store client.
    pub fn inject(&self, key: &str, payload: impl Into<Vec<u8>>) {
        let sample = StoreSample {
            key: key.to_string(),
            payload: payload.into(),
        };
        self.deliver(&sample);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, sample: &StoreSample) {
        let callbacks: Vec<SampleCallback> = match self.inner.subscribers.lock() {
            Ok(subscribers) => subscribers
                .iter()
                .filter(|(pattern, _)| key_matches(pattern, &sample.key))
                .map(|(_, callback)| Arc::clone(callback))
                .collect(),
            Err(_) => return,
        };

        for callback in callbacks {
            callback(sample.clone());
        }
    }
}

impl TelemetryStore for MemoryStore {
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let should_fail = self
            .inner
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BridgeError::publish(key, "injected failure"));
        }

        let sample = StoreSample {
            key: key.to_string(),
            payload,
        };

        if let Ok(mut values) = self.inner.values.lock() {
            values.insert(sample.key.clone(), sample.payload.clone());
        }
        if let Ok(mut log) = self.inner.log.lock() {
            log.push(sample.clone());
        }
        self.deliver(&sample);
        Ok(())
    }

    async fn subscribe(&self, key: &str, callback: SampleCallback) -> Result<()> {
        self.inner
            .subscribers
            .lock()
            .map_err(|_| BridgeError::subscribe(key, "subscriber list poisoned"))?
            .push((key.to_string(), callback));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.clear();
        }
        Ok(())
    }
}

/// Match a key against a key expression using `*` (one chunk) and `**`
/// (any number of chunks).
pub fn key_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let key: Vec<&str> = key.split('/').collect();
    matches_chunks(&pattern, &key)
}

fn matches_chunks(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"**", rest)), _) => {
            matches_chunks(rest, key) || (!key.is_empty() && matches_chunks(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => matches_chunks(rest, key_rest),
        (Some((p, rest)), Some((k, key_rest))) => p == k && matches_chunks(rest, key_rest),
        _ => false,
    }
}
