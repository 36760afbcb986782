use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, StreamExt};
use rustc_hash::FxHashSet;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::LoaderConfig;
use crate::error::{CacheError, CacheResult};
use crate::keyed::KeyedCache;
use crate::lru::LruMap;
use crate::notification::Notification;
use crate::shared::Subscription;

/// Capacity of the scoped batch-failure broadcast. A waiter that lags behind
/// this many failures re-publishes its lost identifiers instead of stalling.
const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// The bulk-fetch collaborator of a [`BatchLoader`].
///
/// Implementations must tolerate arbitrary non-empty identifier subsets up to
/// the configured batch size. Identifiers unknown to the backend are simply
/// omitted from the response.
pub trait BatchFetcher: Send + Sync + 'static {
    /// Stable unique identifier of an entity.
    type Id: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;
    /// The entity type.
    type Item: Send + Sync + 'static;

    /// Extracts the identifier an entity is keyed under.
    fn id_of(item: &Self::Item) -> Self::Id;

    /// Fetches one batch of entities.
    fn fetch(&self, ids: Vec<Self::Id>) -> BoxFuture<'static, CacheResult<Vec<Self::Item>>>;
}

/// A failed batch, scoped to the identifiers it was fetching.
#[derive(Clone, Debug)]
struct BatchFailure<K> {
    ids: Arc<[K]>,
    error: CacheError,
}

/// Batched, cache-backed entity lookup by identifier.
///
/// [`get_by_id`](Self::get_by_id) serves whatever it can from the shared
/// [`KeyedCache`], splits the remaining identifiers into bounded batches, and
/// waits for the cache to fill up as batch responses are merged in. Batches
/// are shared across concurrent callers: an identifier that is already part
/// of an in-flight batch is awaited, not fetched again.
///
/// A batch failure rejects only the callers that depend on one of the batch's
/// identifiers; the cache and all other in-flight work stay untouched, and
/// the failed identifiers are fetched again the next time somebody asks for
/// them.
pub struct BatchLoader<F: BatchFetcher> {
    cache: KeyedCache<F::Id, F::Item>,
    batch_tx: mpsc::UnboundedSender<Vec<F::Id>>,
    failure_tx: broadcast::Sender<BatchFailure<F::Id>>,
    /// Identifiers published to a batch whose outcome is still outstanding.
    pending: Arc<Mutex<FxHashSet<F::Id>>>,
    config: LoaderConfig,
}

impl<F: BatchFetcher> Clone for BatchLoader<F> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            batch_tx: self.batch_tx.clone(),
            failure_tx: self.failure_tx.clone(),
            pending: Arc::clone(&self.pending),
            config: self.config,
        }
    }
}

impl<F: BatchFetcher> BatchLoader<F> {
    pub fn new(fetcher: F, config: LoaderConfig) -> Self {
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (failure_tx, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let pending = Arc::new(Mutex::new(FxHashSet::default()));

        let producer = {
            let fetcher = Arc::new(fetcher);
            let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
            let failure_tx = failure_tx.clone();
            let pending = Arc::clone(&pending);
            move || {
                batch_pipeline(
                    Arc::clone(&fetcher),
                    Arc::clone(&batch_rx),
                    failure_tx.clone(),
                    Arc::clone(&pending),
                    config,
                )
            }
        };
        let cache = KeyedCache::new(config.capacity, producer, F::id_of);

        Self {
            cache,
            batch_tx,
            failure_tx,
            pending,
            config,
        }
    }

    /// Loads the entities for `ids`, fetching whatever the cache is missing.
    ///
    /// The returned entities carry no positional correspondence to the input
    /// slice; callers that need one must re-map by identifier. Duplicate
    /// identifiers are collapsed, and an empty slice resolves immediately
    /// without touching the backend.
    pub async fn get_by_id(&self, ids: &[F::Id]) -> CacheResult<Vec<Arc<F::Item>>> {
        self.get_by_id_inner(ids, CancellationToken::new()).await
    }

    /// Like [`get_by_id`](Self::get_by_id), but rejects with
    /// [`CacheError::Canceled`] when `cancel` fires first.
    ///
    /// Cancellation settles only this caller: batches already in flight keep
    /// running and their responses still warm the shared cache.
    pub async fn get_by_id_cancelable(
        &self,
        ids: &[F::Id],
        cancel: &CancellationToken,
    ) -> CacheResult<Vec<Arc<F::Item>>> {
        self.get_by_id_inner(ids, cancel.clone()).await
    }

    /// A snapshot of the shared cache, without subscription side effects.
    pub fn state(&self) -> LruMap<F::Id, Arc<F::Item>> {
        self.cache.state()
    }

    /// Subscribes to cache snapshots, for components reacting to cache growth.
    pub fn subscribe(&self) -> Subscription<LruMap<F::Id, Arc<F::Item>>> {
        self.cache.subscribe()
    }

    async fn get_by_id_inner(
        &self,
        ids: &[F::Id],
        cancel: CancellationToken,
    ) -> CacheResult<Vec<Arc<F::Item>>> {
        metric!(counter("loader.requests") += 1);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // Subscribing to failures before the partition means a batch that
        // fails between the partition and the wait loop is still observed.
        let mut failures = self.failure_tx.subscribe();

        let (mut found, mut missing, to_publish) = self.partition(ids, &mut failures);
        metric!(counter("loader.cache.hit") += found.len() as i64);
        metric!(counter("loader.cache.miss") += missing.len() as i64);
        if missing.is_empty() {
            return Ok(found);
        }

        // Starts the batch pipeline on first demand. The subscription replays
        // the current map, so merges landing between the partition and this
        // point are picked up by the first loop turn.
        let mut updates = self.cache.subscribe();
        self.publish(&to_publish)?;
        tracing::debug!(
            requested = ids.len(),
            cached = found.len(),
            missing = missing.len(),
            published = to_publish.len(),
            "cache miss, waiting for batches"
        );

        loop {
            tokio::select! {
                // Failures are drained first: a batch reports its unanswered
                // identifiers before its entities are merged, and the waiter
                // must observe that report before the matching snapshot.
                biased;

                _ = cancel.cancelled() => {
                    metric!(counter("loader.requests.canceled") += 1);
                    return Err(CacheError::Canceled);
                }
                failure = failures.recv() => match failure {
                    Ok(failure) => {
                        if missing.iter().any(|id| failure.ids.contains(id)) {
                            return Err(failure.error);
                        }
                    }
                    // Other callers' failures flooded the channel; any lost
                    // report for our identifiers is recovered by the
                    // re-publish pass below.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(CacheError::Closed),
                },
                notification = updates.recv() => match notification {
                    Some(Notification::Value(map)) => {
                        missing.retain(|id| match map.peek(id) {
                            Some(value) => {
                                found.push(Arc::clone(value));
                                false
                            }
                            None => true,
                        });
                        if missing.is_empty() {
                            return Ok(found);
                        }
                        self.republish_lost(&missing)?;
                    }
                    Some(Notification::Loading) => {}
                    Some(Notification::Error(error)) => return Err(error),
                    None => return Err(CacheError::Closed),
                },
            }
        }
    }

    /// Splits `ids` into cached values and missing identifiers, deduplicating
    /// the input and touching the recency of every hit.
    ///
    /// Missing identifiers that are not yet part of an in-flight batch are
    /// atomically marked pending and returned for publication, so concurrent
    /// callers coalesce on one fetch per identifier.
    ///
    /// Failure reports are published under the pending lock, so draining the
    /// failure queue inside the same critical section gives an exact
    /// dependency cut: every report still queued here predates this call and
    /// concerns batches this caller cannot depend on, while every batch this
    /// caller does depend on reports strictly afterwards.
    fn partition(
        &self,
        ids: &[F::Id],
        failures: &mut broadcast::Receiver<BatchFailure<F::Id>>,
    ) -> (Vec<Arc<F::Item>>, Vec<F::Id>, Vec<F::Id>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        let mut to_publish = Vec::new();
        let mut seen = FxHashSet::default();

        self.cache.with_state(|map| {
            let mut pending = self.pending.lock().unwrap();
            loop {
                match failures.try_recv() {
                    Ok(_) => continue,
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            for id in ids {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(value) = map.get(id) {
                    found.push(Arc::clone(value));
                } else {
                    missing.push(id.clone());
                    if pending.insert(id.clone()) {
                        to_publish.push(id.clone());
                    }
                }
            }
        });

        (found, missing, to_publish)
    }

    /// Publishes `ids` in batches bounded by the configured batch size.
    fn publish(&self, ids: &[F::Id]) -> CacheResult<()> {
        for chunk in ids.chunks(self.config.max_batch_size.max(1)) {
            metric!(counter("loader.batches.published") += 1);
            metric!(histogram("loader.batch.size") = chunk.len() as u64);
            if self.batch_tx.send(chunk.to_vec()).is_err() {
                return Err(CacheError::Closed);
            }
        }
        Ok(())
    }

    /// Re-publishes missing identifiers that are neither cached nor part of
    /// an in-flight batch.
    ///
    /// This only happens when an entity was evicted before this waiter saw
    /// the snapshot containing it, or when a failure report was lost to
    /// broadcast lag; either way a fresh batch makes the wait converge.
    fn republish_lost(&self, missing: &[F::Id]) -> CacheResult<()> {
        let lost: Vec<F::Id> = {
            let mut pending = self.pending.lock().unwrap();
            missing
                .iter()
                .filter(|id| pending.insert((*id).clone()))
                .cloned()
                .collect()
        };
        if !lost.is_empty() {
            tracing::debug!(count = lost.len(), "re-publishing lost identifiers");
            self.publish(&lost)?;
        }
        Ok(())
    }
}

/// Turns the published batches into the cache engine's input stream.
///
/// Each batch is fetched through the collaborator, with up to
/// `max_concurrent_batches` fetches in flight; completions may arrive out of
/// order. Failed batches are reported on the scoped failure channel and
/// yield nothing, so a single bad batch never tears down the shared stream.
fn batch_pipeline<F: BatchFetcher>(
    fetcher: Arc<F>,
    batch_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<F::Id>>>>,
    failure_tx: broadcast::Sender<BatchFailure<F::Id>>,
    pending: Arc<Mutex<FxHashSet<F::Id>>>,
    config: LoaderConfig,
) -> BoxStream<'static, CacheResult<Vec<F::Item>>> {
    let batches = stream::unfold(batch_rx, |rx| async move {
        let batch = rx.lock().await.recv().await;
        batch.map(|batch| (batch, rx))
    });

    batches
        .map(move |ids| {
            let fetcher = Arc::clone(&fetcher);
            let failure_tx = failure_tx.clone();
            let pending = Arc::clone(&pending);
            let fetch_timeout = config.fetch_timeout;

            async move {
                let outcome = match fetch_timeout {
                    Some(timeout) => {
                        match tokio::time::timeout(timeout, fetcher.fetch(ids.clone())).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(CacheError::Timeout(timeout)),
                        }
                    }
                    None => fetcher.fetch(ids.clone()).await,
                };

                match outcome {
                    Ok(items) => {
                        let answered: FxHashSet<F::Id> = items.iter().map(F::id_of).collect();
                        let unanswered: Vec<F::Id> = ids
                            .iter()
                            .filter(|id| !answered.contains(id))
                            .cloned()
                            .collect();

                        // Settling the pending entries and reporting the
                        // unanswered rest is one critical section, so a
                        // concurrent partition either coalesces on this batch
                        // and sees its report, or starts a fresh one.
                        // The report also precedes the merged snapshot.
                        let mut pending = pending.lock().unwrap();
                        for id in &ids {
                            pending.remove(id);
                        }
                        if !unanswered.is_empty() {
                            tracing::debug!(
                                unanswered = ?unanswered,
                                "batch response omitted requested entities"
                            );
                            let _ = failure_tx.send(BatchFailure {
                                ids: unanswered.into(),
                                error: CacheError::NotFound,
                            });
                        }
                        drop(pending);

                        metric!(counter("loader.batches.completed") += 1);
                        Some(Ok(items))
                    }
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            "batch fetch failed"
                        );
                        metric!(counter("loader.batches.failed") += 1);

                        let mut pending = pending.lock().unwrap();
                        for id in &ids {
                            pending.remove(id);
                        }
                        let _ = failure_tx.send(BatchFailure {
                            ids: ids.into(),
                            error,
                        });
                        drop(pending);

                        None
                    }
                }
            }
        })
        .buffer_unordered(config.max_concurrent_batches.max(1))
        .filter_map(future::ready)
        .boxed()
}
