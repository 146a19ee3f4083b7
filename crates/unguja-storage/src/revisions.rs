//! The optimized-revision cache.
//!
//! Datastores advertise an "optimized" revision separate from head: one
//! that reflects a recent consistent snapshot and can be shared by many
//! requests to maximize cache locality. Fetching it can be expensive, so
//! this component caches the value for its validity window plus a
//! configured staleness budget, and collapses concurrent refreshes into a
//! single flight.
//!
//! The refresh runs on a detached task: a waiter that gives up waiting
//! never cancels the refresh other waiters depend on. A refresh error
//! fails every joined waiter with the same error and caches nothing.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use unguja_core::Revision;

use crate::error::{StorageError, StorageResult};
use crate::traits::Datastore;

/// Produces `(revision, validity)` pairs; usually a thin closure over
/// [`Datastore::optimized_revision`].
pub type OptimizedRevisionFn =
    Arc<dyn Fn() -> BoxFuture<'static, StorageResult<(Revision, Duration)>> + Send + Sync>;

#[derive(Default)]
struct CacheState {
    cached: Option<(Revision, Instant)>,
    in_flight: Option<broadcast::Sender<StorageResult<Revision>>>,
}

/// Caches optimized revisions with single-flight refresh.
pub struct CachedOptimizedRevisions {
    source: OptimizedRevisionFn,
    max_staleness: Duration,
    refresh_timeout: Duration,
    state: Arc<Mutex<CacheState>>,
}

impl CachedOptimizedRevisions {
    pub fn new(source: OptimizedRevisionFn, max_staleness: Duration) -> Self {
        Self {
            source,
            max_staleness,
            refresh_timeout: Duration::from_secs(10),
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Wraps a datastore's own optimized-revision function.
    pub fn for_datastore<D: Datastore>(datastore: Arc<D>, max_staleness: Duration) -> Self {
        let source: OptimizedRevisionFn = Arc::new(move || {
            let datastore = Arc::clone(&datastore);
            Box::pin(async move { datastore.optimized_revision().await })
        });
        Self::new(source, max_staleness)
    }

    /// The refresh deadline, independent of any caller's deadline.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Returns the cached revision while it is valid, otherwise joins or
    /// starts a refresh.
    pub async fn optimized_revision(&self) -> StorageResult<Revision> {
        loop {
            let mut rx = {
                let mut state = self.state.lock().await;
                if let Some((revision, valid_until)) = state.cached {
                    if Instant::now() < valid_until {
                        return Ok(revision);
                    }
                }

                match &state.in_flight {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let (tx, rx) = broadcast::channel(1);
                        state.in_flight = Some(tx.clone());
                        self.spawn_refresh(tx);
                        rx
                    }
                }
            };

            match rx.recv().await {
                Ok(result) => return result,
                // The producer vanished without reporting; retry from the
                // top rather than failing a waiter spuriously.
                Err(_) => continue,
            }
        }
    }

    fn spawn_refresh(&self, tx: broadcast::Sender<StorageResult<Revision>>) {
        let source = Arc::clone(&self.source);
        let max_staleness = self.max_staleness;
        let refresh_timeout = self.refresh_timeout;
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(refresh_timeout, (source)()).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Unavailable {
                    reason: format!(
                        "optimized revision refresh timed out after {refresh_timeout:?}"
                    ),
                }),
            };

            let mut guard = state.lock().await;
            let broadcast_result = match outcome {
                Ok((revision, validity)) => {
                    guard.cached = Some((revision, Instant::now() + validity + max_staleness));
                    Ok(revision)
                }
                Err(e) => Err(e),
            };
            guard.in_flight = None;
            drop(guard);

            // Waiters may all have gone away; that is not an error.
            let _ = tx.send(broadcast_result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A scripted revision source: each call pops the next response and
    /// counts invocations.
    struct Script {
        responses: Mutex<Vec<StorageResult<(Revision, Duration)>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Script {
        fn new(responses: Vec<StorageResult<(Revision, Duration)>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn with_delay(responses: Vec<StorageResult<(Revision, Duration)>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn source(self: &Arc<Self>) -> OptimizedRevisionFn {
            let this = Arc::clone(self);
            Arc::new(move || {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.calls.fetch_add(1, Ordering::SeqCst);
                    if this.delay > Duration::ZERO {
                        tokio::time::sleep(this.delay).await;
                    }
                    this.responses.lock().await.remove(0)
                })
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn rev(n: u64) -> Revision {
        Revision::from_sequence(n)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn zero_validity_refreshes_every_call() {
        let script = Script::new(vec![
            Ok((rev(1), Duration::ZERO)),
            Ok((rev(2), Duration::ZERO)),
            Ok((rev(3), Duration::ZERO)),
        ]);
        let cache = CachedOptimizedRevisions::new(script.source(), Duration::ZERO);

        for expected in [rev(1), rev(2), rev(3)] {
            assert_eq!(cache.optimized_revision().await.unwrap(), expected);
            tokio::time::advance(ms(5)).await;
        }
        assert_eq!(script.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validity_window_serves_from_cache() {
        let script = Script::new(vec![
            Ok((rev(1), ms(7))),
            Ok((rev(2), Duration::ZERO)),
        ]);
        let cache = CachedOptimizedRevisions::new(script.source(), Duration::ZERO);

        assert_eq!(cache.optimized_revision().await.unwrap(), rev(1));
        tokio::time::advance(ms(5)).await;
        assert_eq!(cache.optimized_revision().await.unwrap(), rev(1));
        tokio::time::advance(ms(5)).await;
        assert_eq!(cache.optimized_revision().await.unwrap(), rev(2));
        assert_eq!(script.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_budget_extends_zero_validity() {
        let script = Script::new(vec![
            Ok((rev(1), Duration::ZERO)),
            Ok((rev(2), Duration::ZERO)),
        ]);
        let cache = CachedOptimizedRevisions::new(script.source(), ms(7));

        assert_eq!(cache.optimized_revision().await.unwrap(), rev(1));
        tokio::time::advance(ms(5)).await;
        assert_eq!(cache.optimized_revision().await.unwrap(), rev(1));
        tokio::time::advance(ms(5)).await;
        assert_eq!(cache.optimized_revision().await.unwrap(), rev(2));
        tokio::time::advance(ms(5)).await;
        assert_eq!(cache.optimized_revision().await.unwrap(), rev(2));
        assert_eq!(script.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_a_single_flight() {
        let script = Script::with_delay(vec![Ok((rev(1), Duration::ZERO))], ms(50));
        let cache = Arc::new(CachedOptimizedRevisions::new(script.source(), Duration::ZERO));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.optimized_revision().await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), rev(1));
        }
        assert_eq!(script.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_callers_causes_one_refresh_until_staleness_expires() {
        let script = Script::with_delay(
            vec![Ok((rev(1), Duration::ZERO)), Ok((rev(2), Duration::ZERO))],
            ms(2),
        );
        let cache = Arc::new(CachedOptimizedRevisions::new(script.source(), ms(10)));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.optimized_revision().await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), rev(1));
        }
        assert_eq!(script.call_count(), 1);

        tokio::time::advance(ms(20)).await;
        assert_eq!(cache.optimized_revision().await.unwrap(), rev(2));
        assert_eq!(script.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_errors_fail_all_waiters_and_cache_nothing() {
        let script = Script::with_delay(
            vec![
                Err(StorageError::Unavailable {
                    reason: "down".to_string(),
                }),
                Ok((rev(1), Duration::ZERO)),
            ],
            ms(10),
        );
        let cache = Arc::new(CachedOptimizedRevisions::new(script.source(), Duration::ZERO));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.optimized_revision().await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(StorageError::Unavailable { .. })
            ));
        }

        // The error was not cached; the next call refreshes and succeeds.
        assert_eq!(cache.optimized_revision().await.unwrap(), rev(1));
        assert_eq!(script.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiters_do_not_cancel_the_refresh() {
        let script = Script::with_delay(vec![Ok((rev(1), ms(100)))], ms(20));
        let cache = Arc::new(CachedOptimizedRevisions::new(script.source(), Duration::ZERO));

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.optimized_revision().await })
        };
        tokio::time::advance(ms(5)).await;
        waiter.abort();
        let _ = waiter.await;

        // The detached refresh completed and populated the cache.
        assert_eq!(cache.optimized_revision().await.unwrap(), rev(1));
        assert_eq!(script.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timeout_is_independent_of_callers() {
        let script = Script::with_delay(vec![Ok((rev(1), Duration::ZERO))], ms(500));
        let cache =
            CachedOptimizedRevisions::new(script.source(), Duration::ZERO).with_refresh_timeout(ms(50));

        let result = cache.optimized_revision().await;
        assert!(matches!(result, Err(StorageError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn for_datastore_uses_the_store_head() {
        let ds = Arc::new(crate::memory::MemoryDatastore::new());
        let cache = CachedOptimizedRevisions::for_datastore(Arc::clone(&ds), Duration::ZERO);
        let revision = cache.optimized_revision().await.unwrap();
        assert_eq!(revision, ds.head_revision().await.unwrap());
    }
}
