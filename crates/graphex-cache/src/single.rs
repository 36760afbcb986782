use std::future::Future;
use std::sync::Arc;

use futures::{FutureExt, StreamExt, stream};
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};
use crate::notification::Notification;
use crate::shared::{SharedSeries, Subscription};

/// Caches the first successful value of a fallible async computation for the
/// lifetime of the process.
///
/// The computation runs lazily on first demand and is shared between all
/// concurrent callers. Once it has succeeded it never runs again; after a
/// failure it is retried when the next caller arrives. Intended for data that
/// is valid forever once fetched, like static schema metadata.
pub struct ValueCache<T> {
    series: SharedSeries<Arc<T>, Option<Arc<T>>>,
}

impl<T> Clone for ValueCache<T> {
    fn clone(&self) -> Self {
        Self {
            series: self.series.clone(),
        }
    }
}

impl<T> ValueCache<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a cache around `factory`, which is invoked once per run.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let producer = move || stream::once(factory().map(|res| res.map(Arc::new))).boxed();
        let series = SharedSeries::new(None, producer, |state: &mut Option<Arc<T>>, value| {
            *state = Some(value);
        });
        Self { series }
    }

    /// Subscribes to the outcome of the current (or a fresh) run.
    pub fn get(&self) -> ValueSubscription<T> {
        ValueSubscription {
            sub: self.series.subscribe(),
        }
    }

    /// Resolves with the cached value, computing it if necessary.
    ///
    /// Rejects with [`CacheError::Canceled`] when `cancel` fires first; the
    /// computation itself keeps running for other callers.
    pub async fn as_result(&self, cancel: &CancellationToken) -> CacheResult<Arc<T>> {
        let mut sub = self.get();
        tokio::select! {
            _ = cancel.cancelled() => Err(CacheError::Canceled),
            outcome = sub.recv() => outcome.unwrap_or(Err(CacheError::Closed)),
        }
    }
}

/// Observes a [`ValueCache`], yielding one result per producer run.
pub struct ValueSubscription<T> {
    sub: Subscription<Option<Arc<T>>>,
}

impl<T: Send + Sync> ValueSubscription<T> {
    /// The next terminal outcome, or `None` once the cache has been dropped.
    pub async fn recv(&mut self) -> Option<CacheResult<Arc<T>>> {
        loop {
            match self.sub.recv().await? {
                Notification::Loading | Notification::Value(None) => continue,
                Notification::Value(Some(value)) => return Some(Ok(value)),
                Notification::Error(error) => return Some(Err(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_first_success_is_cached_forever() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ValueCache::new({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(42u32)
                }
            }
        });

        let cancel = CancellationToken::new();
        let (a, b) = futures::join!(cache.as_result(&cancel), cache.as_result(&cancel));
        assert_eq!(*a.unwrap(), 42);
        assert_eq!(*b.unwrap(), 42);

        // a later caller is served from the cached value
        assert_eq!(*cache.as_result(&cancel).await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_is_retried_on_next_demand() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ValueCache::new({
            let calls = calls.clone();
            move || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(CacheError::Fetch("flaky".into()))
                    } else {
                        Ok(7u32)
                    }
                }
            }
        });

        let cancel = CancellationToken::new();
        assert_eq!(
            cache.as_result(&cancel).await,
            Err(CacheError::Fetch("flaky".into()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(*cache.as_result(&cancel).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_rejects_only_the_caller() {
        let cache: ValueCache<u32> = ValueCache::new(|| futures::future::pending());

        let cancel = CancellationToken::new();
        let pending = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.as_result(&cancel).await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(pending.await.unwrap(), Err(CacheError::Canceled));
    }

    #[tokio::test]
    async fn test_subscription_yields_value() {
        let cache = ValueCache::new(|| async { Ok("ready".to_string()) });
        let mut sub = cache.get();
        assert_eq!(*sub.recv().await.unwrap().unwrap(), "ready");
    }
}
