use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;

use crate::error::CacheResult;
use crate::notification::Notification;

/// A factory for producer runs.
///
/// Called once per run; a new run is only ever started by a subscription that
/// arrives while the series is idle or after a terminal error.
pub type Producer<I> = Box<dyn Fn() -> BoxStream<'static, CacheResult<I>> + Send + Sync>;

type Fold<I, S> = Box<dyn Fn(&mut S, I) + Send + Sync>;

/// Which point of its lifecycle the current producer run is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    /// No run has been started yet.
    Idle,
    /// A run is consuming the producer stream.
    Running,
    /// The producer stream completed. Terminal: new demand never restarts it.
    Done,
    /// The producer stream failed. The next subscription restarts it.
    Failed,
}

/// A lazily started, shared, replayable pipeline around a producer of `I`
/// items folded into an accumulated state `S`.
///
/// The producer starts on the first subscription, and exactly one run is
/// shared by however many subscribers are attached to it. Every item is
/// folded into the state and a snapshot of the full state is broadcast; late
/// subscribers immediately receive the most recent notification before
/// observing new ones.
///
/// A producer error terminates the current run for all of its subscribers and
/// is never retried implicitly. Retry is driven purely by demand: the next
/// [`subscribe`](Self::subscribe) after a failure starts a fresh run and
/// broadcasts a new [`Notification::Loading`]. A run that ends by producer
/// completion is terminal for the lifetime of the series.
///
/// The three cache flavors ([`ValueCache`](crate::ValueCache),
/// [`KeyedCache`](crate::KeyedCache), [`MergeCache`](crate::MergeCache)) are
/// instantiations of this one type with different producers and folds.
pub struct SharedSeries<I, S> {
    inner: Arc<Inner<I, S>>,
}

impl<I, S> Clone for SharedSeries<I, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<I, S> {
    run: Mutex<RunState>,
    state: Mutex<S>,
    tx: watch::Sender<Notification<S>>,
    producer: Producer<I>,
    fold: Fold<I, S>,
}

impl<I, S> SharedSeries<I, S>
where
    I: Send + 'static,
    S: Clone + Send + Sync + 'static,
{
    pub fn new<P, F>(initial: S, producer: P, fold: F) -> Self
    where
        P: Fn() -> BoxStream<'static, CacheResult<I>> + Send + Sync + 'static,
        F: Fn(&mut S, I) + Send + Sync + 'static,
    {
        let (tx, _rx) = watch::channel(Notification::Loading);
        Self {
            inner: Arc::new(Inner {
                run: Mutex::new(RunState::Idle),
                state: Mutex::new(initial),
                tx,
                producer: Box::new(producer),
                fold: Box::new(fold),
            }),
        }
    }

    /// Starts observing the series.
    ///
    /// Starts the producer if no run is active and the series did not already
    /// complete. The most recent notification is replayed as the first
    /// received value. Never fails; producer failures surface as
    /// [`Notification::Error`].
    pub fn subscribe(&self) -> Subscription<S> {
        self.ensure_running();
        let mut rx = self.inner.tx.subscribe();
        rx.mark_changed();
        Subscription { rx }
    }

    /// A snapshot of the accumulated state.
    ///
    /// Does not subscribe and does not start the producer.
    pub fn state(&self) -> S {
        self.inner.state.lock().unwrap().clone()
    }

    /// Runs `f` against the live state under the state lock.
    ///
    /// The fold step of the run task takes the same lock, so `f` observes
    /// either all or none of any concurrent merge.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.state.lock().unwrap())
    }

    fn ensure_running(&self) {
        let mut run = self.inner.run.lock().unwrap();
        match *run {
            RunState::Running | RunState::Done => return,
            RunState::Idle | RunState::Failed => {}
        }
        *run = RunState::Running;
        // Announce the fresh run before its first item, also to subscribers
        // that last observed a terminal error. Sent while holding the run
        // lock so it cannot interleave with a concurrent run's terminal
        // notification.
        self.inner.tx.send_replace(Notification::Loading);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut stream = (inner.producer)();
            loop {
                match stream.next().await {
                    Some(Ok(item)) => {
                        let snapshot = {
                            let mut state = inner.state.lock().unwrap();
                            (inner.fold)(&mut state, item);
                            state.clone()
                        };
                        inner.tx.send_replace(Notification::Value(snapshot));
                    }
                    Some(Err(error)) => {
                        tracing::debug!(%error, "producer run failed");
                        let mut run = inner.run.lock().unwrap();
                        inner.tx.send_replace(Notification::Error(error));
                        *run = RunState::Failed;
                        return;
                    }
                    None => {
                        *inner.run.lock().unwrap() = RunState::Done;
                        return;
                    }
                }
            }
        });
    }
}

/// A handle observing one [`SharedSeries`].
///
/// The first [`recv`](Self::recv) yields the series' most recent notification;
/// subsequent calls wait for changes. Intermediate notifications may be
/// skipped if the subscriber polls slower than the series updates, which is
/// why every notification carries the full accumulated state.
pub struct Subscription<S> {
    rx: watch::Receiver<Notification<S>>,
}

impl<S: Clone> Subscription<S> {
    /// The next notification, or `None` once the series has been dropped.
    pub async fn recv(&mut self) -> Option<Notification<S>> {
        match self.rx.changed().await {
            Ok(()) => Some(self.rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::stream;

    use crate::error::CacheError;

    use super::*;

    fn counting_producer(
        runs: Arc<AtomicUsize>,
        items: Vec<CacheResult<u32>>,
    ) -> impl Fn() -> BoxStream<'static, CacheResult<u32>> + Send + Sync + 'static {
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            let items = items.clone();
            stream::once(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                stream::iter(items)
            })
            .flatten()
            .boxed()
        }
    }

    fn push_series(
        producer: impl Fn() -> BoxStream<'static, CacheResult<u32>> + Send + Sync + 'static,
    ) -> SharedSeries<u32, Vec<u32>> {
        SharedSeries::new(Vec::new(), producer, |state: &mut Vec<u32>, item| {
            state.push(item)
        })
    }

    async fn last_value(sub: &mut Subscription<Vec<u32>>) -> Vec<u32> {
        loop {
            match sub.recv().await.expect("series dropped") {
                Notification::Loading => continue,
                Notification::Value(state) => return state,
                Notification::Error(error) => panic!("unexpected error: {error}"),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_share_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let series = push_series(counting_producer(runs.clone(), vec![Ok(1)]));

        let mut first = series.subscribe();
        let mut second = series.subscribe();

        let (a, b) = futures::join!(last_value(&mut first), last_value(&mut second));
        assert_eq!(a, vec![1]);
        assert_eq!(b, vec![1]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_last_notification() {
        let runs = Arc::new(AtomicUsize::new(0));
        let series = push_series(counting_producer(runs.clone(), vec![Ok(1), Ok(2)]));

        let mut early = series.subscribe();
        while last_value(&mut early).await != vec![1, 2] {}

        // the run completed; a late subscriber sees the final state right away
        // and no new run is started
        let mut late = series.subscribe();
        assert_eq!(last_value(&mut late).await, vec![1, 2]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_restarts_only_on_new_subscription() {
        let runs = Arc::new(AtomicUsize::new(0));
        let producer = {
            let runs = runs.clone();
            move || {
                let attempt = runs.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    stream::iter(vec![Err(CacheError::Fetch("backend down".into()))]).boxed()
                } else {
                    stream::iter(vec![Ok(5)]).boxed()
                }
            }
        };
        let series = push_series(producer);

        let mut first = series.subscribe();
        loop {
            match first.recv().await.unwrap() {
                Notification::Error(error) => {
                    assert_eq!(error, CacheError::Fetch("backend down".into()));
                    break;
                }
                _ => continue,
            }
        }

        // no demand, no retry
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // a new subscription restarts the producer; the existing subscriber
        // observes the fresh run as well
        let mut second = series.subscribe();
        assert_eq!(last_value(&mut second).await, vec![5]);
        assert_eq!(last_value(&mut first).await, vec![5]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_state_does_not_start_the_producer() {
        let runs = Arc::new(AtomicUsize::new(0));
        let series = push_series(counting_producer(runs.clone(), vec![Ok(1)]));

        assert_eq!(series.state(), Vec::<u32>::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
