//! Request coalescing and async value caching.
//!
//! [`Request`] ensures a single in-flight call for one resource, [`Coalesce`] does the same
//! for a family of resources keyed by `K`, and [`Cached`] additionally keeps the result
//! around for an optional lifetime.
#![allow(clippy::arc_with_non_send_sync)]

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    ops::Deref,
    pin::Pin,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

/// A boxed, sendable future.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

/// A future resolving to the shared result of an in-flight request.
///
/// Resolves to `Err` only if the task driving the request panicked or was aborted.
pub struct Handle<T> {
    fut: BoxFut<'static, Result<T, RecvError>>,
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, RecvError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<T> Handle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(mut receiver: broadcast::Receiver<T>) -> Self {
        Self {
            fut: Box::pin(async move { receiver.recv().await }),
        }
    }
}

#[derive(Debug)]
struct RequestInner<T> {
    inflight: Option<Weak<broadcast::Sender<T>>>,
}

impl<T> RequestInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get_receiver(&self) -> Option<broadcast::Receiver<T>> {
        self.inflight
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|tx| tx.subscribe())
    }
}

impl<T> Default for RequestInner<T> {
    fn default() -> Self {
        RequestInner { inflight: None }
    }
}

/// A coalesced request, which will ensure that only one of
/// these requests can go through to the endpoint.
#[derive(Debug)]
pub struct Request<T> {
    inner: Arc<Mutex<RequestInner<T>>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Request<T> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
        }
    }
}

impl<T> Request<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Get a handle to the one-and-only inflight request for
    /// this request manager.
    ///
    /// `f` is only called when no request is in flight. The request runs on its own task, so
    /// it completes even if every handle is dropped.
    pub fn handle<F>(&self, f: F) -> Handle<T>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        // Held until the sender is registered, so a concurrent caller can't start a second request.
        let mut inner = self.inner.lock();
        if let Some(rx) = inner.get_receiver() {
            tracing::trace!("Found inflight request");
            return Handle::new(rx);
        }

        let (tx, rx) = broadcast::channel::<T>(1);
        let tx = Arc::new(tx);
        inner.inflight = Some(Arc::downgrade(&tx));

        let fut = (f)();
        let shared = Arc::clone(&self.inner);
        tracing::trace!("Launching new request");
        tokio::spawn(async move {
            let res = fut.await;
            // Clear and send under the lock, so nobody subscribes after the send.
            let mut inner = shared.lock();
            inner.inflight = None;
            let _ = tx.send(res);
        });

        Handle::new(rx)
    }

    /// Run `f`, or join the request already in flight.
    pub async fn get<F>(&self, f: F) -> Result<T, RecvError>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        self.handle(f).await
    }
}

/// Per-key request coalescing.
///
/// At most one request runs per key at a time; callers asking for a key that is already
/// in flight wait for and share its result. Nothing is retained after completion.
#[derive(Debug)]
pub struct Coalesce<K, T> {
    inflight: Arc<Mutex<HashMap<K, Weak<broadcast::Sender<T>>>>>,
}

impl<K, T> Clone for Coalesce<K, T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, T> Default for Coalesce<K, T> {
    fn default() -> Self {
        Self {
            inflight: Default::default(),
        }
    }
}

impl<K, T> Coalesce<K, T>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty coalescing map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a handle to the in-flight request for `key`, starting one with `f` if needed.
    pub fn handle<F>(&self, key: K, f: F) -> Handle<T>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        let mut inflight = self.inflight.lock();
        if let Some(tx) = inflight.get(&key).and_then(Weak::upgrade) {
            tracing::trace!(?key, "joining inflight request");
            return Handle::new(tx.subscribe());
        }

        let (tx, rx) = broadcast::channel::<T>(1);
        let tx = Arc::new(tx);
        inflight.insert(key.clone(), Arc::downgrade(&tx));

        let fut = (f)();
        let shared = Arc::clone(&self.inflight);
        tracing::trace!(?key, "launching request");
        tokio::spawn(async move {
            let res = fut.await;
            let mut inflight = shared.lock();
            if inflight
                .get(&key)
                .is_some_and(|current| Weak::ptr_eq(current, &Arc::downgrade(&tx)))
            {
                inflight.remove(&key);
            }
            let _ = tx.send(res);
        });

        Handle::new(rx)
    }

    /// Run `f` for `key`, or join the request already in flight for it.
    pub async fn get<F>(&self, key: K, f: F) -> Result<T, RecvError>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        self.handle(key, f).await
    }

    /// Number of keys with a request currently in flight.
    pub fn inflight(&self) -> usize {
        self.inflight
            .lock()
            .values()
            .filter(|tx| tx.strong_count() > 0)
            .count()
    }
}

#[derive(Debug, Default)]
enum InnerCache<T> {
    #[default]
    Empty,
    Inflight(Request<T>),
    Cached {
        value: T,
        expires: Option<Instant>,
    },
}

impl<T> InnerCache<T> {
    fn new_with_value(value: T, expiration: Option<Duration>) -> Self {
        let expires = expiration.map(|lifetime| Instant::now() + lifetime);
        InnerCache::Cached { value, expires }
    }

    fn fresh(&self) -> Option<&T> {
        match self {
            InnerCache::Cached { value, expires }
                if expires.map(|e| e >= Instant::now()).unwrap_or(true) =>
            {
                Some(value)
            }
            _ => None,
        }
    }
}

/// A type for caching a value which is fetched via
/// an async function on the tokio runtime.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    inner: Arc<Mutex<InnerCache<T>>>,
    expiration: Option<Duration>,
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
            expiration: None,
        }
    }
}

impl<T> Cached<T> {
    /// An empty cache whose values live for `expiration`, or forever.
    #[must_use]
    pub fn new(expiration: Option<Duration>) -> Self {
        Self {
            inner: Default::default(),
            expiration,
        }
    }

    /// Drop any cached value.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = InnerCache::Empty;
    }

    /// Apply `f` to the cached value, if one is present and fresh.
    pub fn map_cached<F, U>(&self, f: F) -> Option<U>
    where
        F: FnOnce(&T) -> U,
    {
        let inner = self.inner.lock();
        inner.fresh().map(f)
    }
}

impl<T, E> Cached<Result<T, E>>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Return the cached value, or run `f` to fetch it.
    ///
    /// Concurrent callers share one fetch. Only `Ok` values are kept; an `Err` is returned to
    /// everyone waiting on that fetch and the next call tries again.
    pub async fn try_get<F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> BoxFut<'static, Result<T, E>>,
        E: From<RecvError>,
    {
        let handle = {
            let mut inner = self.inner.lock();
            if let Some(value) = inner.fresh() {
                return value.clone();
            }

            match inner.deref() {
                InnerCache::Inflight(request) => request.handle(f),
                _ => {
                    let req = Request::default();
                    let handle = req.handle(|| {
                        let inner = Arc::clone(&self.inner);
                        let expiration = self.expiration;
                        let fut = f();
                        Box::pin(async move {
                            let value = fut.await;
                            let mut inner = inner.lock();
                            *inner = match &value {
                                Ok(_) => InnerCache::new_with_value(value.clone(), expiration),
                                Err(_) => InnerCache::Empty,
                            };
                            value
                        })
                    });

                    *inner = InnerCache::Inflight(req);
                    handle
                }
            }
        };

        match handle.await {
            Ok(value) => value,
            Err(error) => {
                self.clear();
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn coalesce_runs_once_per_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coalesce: Coalesce<String, usize> = Coalesce::new();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let coalesce = coalesce.clone();
            let calls = calls.clone();
            let key = if i % 2 == 0 { "a" } else { "b" }.to_string();
            tasks.push(tokio::spawn(async move {
                coalesce
                    .get(key, move || {
                        Box::pin(async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            calls.fetch_add(1, Ordering::SeqCst)
                        })
                    })
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coalesce.inflight(), 0);
    }

    #[tokio::test]
    async fn coalesce_forgets_completed_requests() {
        let coalesce: Coalesce<u8, u8> = Coalesce::new();
        assert_eq!(coalesce.get(1, || Box::pin(async { 1 })).await.unwrap(), 1);
        assert_eq!(coalesce.get(1, || Box::pin(async { 2 })).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn request_shares_result() {
        let request: Request<u32> = Request::default();
        let first = request.handle(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                7
            })
        });
        let second = request.handle(|| Box::pin(async { 8 }));
        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Failed;

    impl From<RecvError> for Failed {
        fn from(_: RecvError) -> Self {
            Failed
        }
    }

    #[tokio::test]
    async fn cached_keeps_ok_and_retries_err() {
        let cache: Cached<Result<u32, Failed>> = Cached::new(None);

        let err = cache.try_get(|| Box::pin(async { Err(Failed) })).await;
        assert_eq!(err, Err(Failed));
        assert!(cache.map_cached(|_| ()).is_none());

        let ok = cache.try_get(|| Box::pin(async { Ok(3) })).await;
        assert_eq!(ok, Ok(3));

        let again = cache.try_get(|| Box::pin(async { Ok(4) })).await;
        assert_eq!(again, Ok(3));
    }

    #[tokio::test]
    async fn cached_values_expire() {
        let cache: Cached<Result<u32, Failed>> = Cached::new(Some(Duration::from_millis(10)));
        assert_eq!(cache.try_get(|| Box::pin(async { Ok(1) })).await, Ok(1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.try_get(|| Box::pin(async { Ok(2) })).await, Ok(2));
    }
}
