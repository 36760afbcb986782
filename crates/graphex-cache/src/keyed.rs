use std::hash::Hash;
use std::sync::Arc;

use futures::stream::BoxStream;
use rustc_hash::FxHashMap;

use crate::error::CacheResult;
use crate::lru::LruMap;
use crate::shared::{SharedSeries, Subscription};

/// Accumulates streamed entity batches into a bounded, LRU-evicted map.
///
/// Every incoming batch is merged by key and the full map is re-broadcast to
/// subscribers. This is the backing store of
/// [`BatchLoader`](crate::BatchLoader).
pub struct KeyedCache<K, V> {
    series: SharedSeries<Vec<V>, LruMap<K, Arc<V>>>,
}

impl<K, V> Clone for KeyedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            series: self.series.clone(),
        }
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new<P, KF>(capacity: usize, producer: P, key_of: KF) -> Self
    where
        P: Fn() -> BoxStream<'static, CacheResult<Vec<V>>> + Send + Sync + 'static,
        KF: Fn(&V) -> K + Send + Sync + 'static,
    {
        let series = SharedSeries::new(
            LruMap::new(capacity),
            producer,
            move |map: &mut LruMap<K, Arc<V>>, batch: Vec<V>| {
                for item in batch {
                    map.insert(key_of(&item), Arc::new(item));
                }
            },
        );
        Self { series }
    }

    /// Subscribes to map snapshots, starting the producer if necessary.
    pub fn subscribe(&self) -> Subscription<LruMap<K, Arc<V>>> {
        self.series.subscribe()
    }

    /// A snapshot of the current map, without subscription side effects.
    pub fn state(&self) -> LruMap<K, Arc<V>> {
        self.series.state()
    }

    /// Reads or updates the live map under the cache's state lock.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut LruMap<K, Arc<V>>) -> R) -> R {
        self.series.with_state(f)
    }
}

/// Accumulates streamed entity batches into an unbounded map.
///
/// Same merge rule as [`KeyedCache`], no eviction. For data sets whose size
/// is naturally bounded by the domain.
pub struct MergeCache<K, V> {
    series: SharedSeries<Vec<V>, FxHashMap<K, Arc<V>>>,
}

impl<K, V> Clone for MergeCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            series: self.series.clone(),
        }
    }
}

impl<K, V> MergeCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new<P, KF>(producer: P, key_of: KF) -> Self
    where
        P: Fn() -> BoxStream<'static, CacheResult<Vec<V>>> + Send + Sync + 'static,
        KF: Fn(&V) -> K + Send + Sync + 'static,
    {
        let series = SharedSeries::new(
            FxHashMap::default(),
            producer,
            move |map: &mut FxHashMap<K, Arc<V>>, batch: Vec<V>| {
                for item in batch {
                    map.insert(key_of(&item), Arc::new(item));
                }
            },
        );
        Self { series }
    }

    pub fn subscribe(&self) -> Subscription<FxHashMap<K, Arc<V>>> {
        self.series.subscribe()
    }

    pub fn state(&self) -> FxHashMap<K, Arc<V>> {
        self.series.state()
    }
}
