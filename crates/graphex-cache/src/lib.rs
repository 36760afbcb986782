//! # Graphex entity caching infrastructure
//!
//! The graph explorer renders entities that live behind a bulk "fetch by ids"
//! backend endpoint. Views request entities by identifier, often in bursts of
//! overlapping sets, and this crate is the layer that keeps those bursts from
//! turning into redundant network traffic: it deduplicates concurrent
//! requests, coalesces identifier lookups into size-bounded batches, and
//! shares one bounded in-memory cache between all callers.
//!
//! ## Building blocks
//!
//! - [`Notification`] is one discrete state of a producer run: `Loading`,
//!   `Value`, or `Error`.
//! - [`SharedSeries`] is the engine underneath everything: it turns a
//!   producer (a one-shot computation or a continuous batch stream) into a
//!   lazily started pipeline whose notifications are shared by all
//!   subscribers, replayed to late ones, and restarted after an error only
//!   when new demand arrives.
//! - [`ValueCache`], [`KeyedCache`] and [`MergeCache`] are the three flavors
//!   used by the application: cache-one-value-forever, bounded LRU map of
//!   entities, and unbounded map of entities. All three are instantiations of
//!   [`SharedSeries`] with different producers and fold steps.
//! - [`BatchLoader`] is the caller-facing orchestrator: it partitions a
//!   request into cache hits and misses, publishes misses in batches of at
//!   most [`LoaderConfig::max_batch_size`] identifiers, and settles each
//!   caller as soon as the shared cache covers its request.
//!
//! ## Concurrency model
//!
//! The cache map has exactly one writer, the fold step of the engine's run
//! task; everything else reads snapshots. Batch completions may arrive out of
//! order, so waiters never assume arrival order and instead re-check their
//! missing identifiers against every emitted snapshot.
//!
//! Cancellation is cooperative and strictly per caller: a fired
//! [`CancellationToken`](tokio_util::sync::CancellationToken) rejects that
//! caller's pending result and nothing else. In-flight batches keep running
//! and still warm the cache.
//!
//! ## Failure semantics
//!
//! A failed batch fetch is scoped to the identifiers of that batch: only
//! waiters that depend on one of them reject, the shared stream stays alive
//! for everyone else, and the failed identifiers are fetched again the next
//! time they are requested. There is no partial-success reporting; a caller
//! whose request overlaps a failed batch sees the batch's error.
//!
//! ## Metrics
//!
//! When statsd is configured via [`metrics::configure_statsd`], the loader
//! reports `loader.requests`, `loader.cache.hit` / `loader.cache.miss`,
//! `loader.batches.published` / `.completed` / `.failed`, and a
//! `loader.batch.size` histogram.

#[macro_use]
pub mod metrics;

pub mod config;
mod error;
mod keyed;
mod loader;
mod lru;
mod notification;
mod shared;
mod single;


pub use config::LoaderConfig;
pub use error::{CacheError, CacheResult};
pub use keyed::{KeyedCache, MergeCache};
pub use loader::{BatchFetcher, BatchLoader};
pub use lru::LruMap;
pub use notification::Notification;
pub use shared::{SharedSeries, Subscription};
pub use single::{ValueCache, ValueSubscription};
