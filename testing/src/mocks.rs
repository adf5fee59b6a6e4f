//! Mock transports and storage backends.

use futures::FutureExt;
use futures::future::BoxFuture;
use modelstore_core::{MemoryStorage, OperationError, PersistError, PersistStorage, StorageFuture};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

type Settle<R> = oneshot::Sender<Result<R, OperationError>>;

struct PendingCall<R> {
    label: String,
    settle: Option<Settle<R>>,
}

/// Transport whose calls stay pending until the test settles them.
///
/// Each [`request`](Self::request) records a call; the test then resolves or
/// rejects calls by index, in any order.
///
/// # Example
///
/// ```ignore
/// let transport = DeferredTransport::<Profile>::new();
/// let api = transport.clone();
/// let fetch = model
///     .async_operation("getProfile", move |_: &()| api.request("profile"))
///     .build();
///
/// let call = store.start(&fetch, ());
/// transport.resolve(0, profile);
/// call.wait().await?;
/// ```
pub struct DeferredTransport<R> {
    calls: Arc<Mutex<Vec<PendingCall<R>>>>,
}

impl<R> Clone for DeferredTransport<R> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<R> Default for DeferredTransport<R> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<R: Send + 'static> DeferredTransport<R> {
    /// Create a transport with no calls
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingCall<R>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call and return its pending result
    pub fn request(&self, label: impl Into<String>) -> BoxFuture<'static, Result<R, OperationError>> {
        let (settle, result) = oneshot::channel();
        self.lock().push(PendingCall {
            label: label.into(),
            settle: Some(settle),
        });
        async move {
            result
                .await
                .unwrap_or_else(|_| Err(OperationError::new("transport dropped").with_code("cancelled")))
        }
        .boxed()
    }

    /// Number of recorded calls
    #[must_use]
    pub fn calls(&self) -> usize {
        self.lock().len()
    }

    /// Labels of recorded calls in call order
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.lock().iter().map(|call| call.label.clone()).collect()
    }

    /// Number of calls not settled yet
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().iter().filter(|call| call.settle.is_some()).count()
    }

    /// Settle call `index`; returns `false` if it does not exist or already settled
    pub fn settle(&self, index: usize, result: Result<R, OperationError>) -> bool {
        let settle = self
            .lock()
            .get_mut(index)
            .and_then(|call| call.settle.take());
        settle.is_some_and(|settle| settle.send(result).is_ok())
    }

    /// Resolve call `index` with `response`
    pub fn resolve(&self, index: usize, response: R) -> bool {
        self.settle(index, Ok(response))
    }

    /// Reject call `index` with `error`
    pub fn reject(&self, index: usize, error: OperationError) -> bool {
        self.settle(index, Err(error))
    }
}

/// Storage that records writes and can be told to fail.
///
/// Backed by a [`MemoryStorage`], so a second store can start from what the
/// first one wrote.
#[derive(Clone, Default)]
pub struct RecordingStorage {
    memory: MemoryStorage,
    saves: Arc<AtomicUsize>,
    removes: Arc<AtomicUsize>,
    fail_saves: Arc<AtomicBool>,
    fail_loads: Arc<AtomicBool>,
    next_save_delay: Arc<Mutex<Option<Duration>>>,
}

impl RecordingStorage {
    /// Create an empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying memory storage
    #[must_use]
    pub const fn memory(&self) -> &MemoryStorage {
        &self.memory
    }

    /// Number of successful saves
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of removes
    #[must_use]
    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Make every save fail
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every load fail
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Hold the next save for `delay` before it reaches the memory storage
    pub fn delay_next_save(&self, delay: Duration) {
        *self
            .next_save_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// The stored value under `key`, parsed as JSON
    #[must_use]
    pub fn json(&self, key: &str) -> Option<serde_json::Value> {
        self.memory
            .get(key)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }
}

impl PersistStorage for RecordingStorage {
    fn load<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Box::pin(async { Err(PersistError::Storage("load refused".to_string())) });
        }
        self.memory.load(key)
    }

    fn save<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Box::pin(async { Err(PersistError::Storage("save refused".to_string())) });
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .next_save_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match delay {
            Some(delay) => Box::pin(async move {
                tokio::time::sleep(delay).await;
                self.memory.save(key, value).await
            }),
            None => self.memory.save(key, value),
        }
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.memory.remove(key)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn calls_settle_in_any_order() {
        let transport = DeferredTransport::<u32>::new();
        let first = transport.request("a");
        let second = transport.request("b");

        assert_eq!(transport.calls(), 2);
        assert!(transport.resolve(1, 2));
        assert!(transport.reject(0, OperationError::new("boom")));
        assert!(!transport.resolve(0, 1));
        assert_eq!(transport.pending(), 0);

        assert_eq!(second.await, Ok(2));
        assert_eq!(first.await, Err(OperationError::new("boom")));
        assert_eq!(transport.labels(), ["a", "b"]);
    }

    #[tokio::test]
    async fn dropped_transport_call_fails() {
        let transport = DeferredTransport::<u32>::new();
        let call = transport.request("a");
        drop(transport);

        let error = call.await.unwrap_err();
        assert_eq!(error.code.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn recording_storage_counts_and_fails_on_demand() {
        let storage = RecordingStorage::new();
        tokio_test::assert_ok!(storage.save("k", "{}".to_string()).await);
        assert_eq!(storage.saves(), 1);

        storage.fail_saves(true);
        tokio_test::assert_err!(storage.save("k", "{}".to_string()).await);
        assert_eq!(storage.saves(), 1);
        storage.fail_saves(false);

        storage.delay_next_save(Duration::from_millis(10));
        tokio_test::assert_ok!(storage.save("k", "[1]".to_string()).await);
        assert_eq!(storage.json("k"), Some(serde_json::json!([1])));

        storage.fail_loads(true);
        tokio_test::assert_err!(storage.load("k").await);
        storage.fail_loads(false);
        assert_eq!(storage.load("k").await.unwrap().as_deref(), Some("{}"));
    }
}
