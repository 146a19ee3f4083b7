//! Dispatch result caching and in-flight deduplication.
//!
//! Two layers cooperate:
//!
//! - A per-request scope memoizes completed sub-dispatches and collapses
//!   concurrent identical sub-requests into a single computation.
//! - An optional shared [`DispatchCache`] memoizes results across requests
//!   with a bounded TTL. Keys include the relation's canonical key, so
//!   schemas that differ only in unrelated definitions share entries.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use moka::future::Cache;
use tokio::sync::broadcast;
use unguja_core::schema::CanonicalKey;
use unguja_core::{ObjectAndRelation, Revision};

use crate::config::DispatchConfig;
use crate::error::DispatchResult;
use crate::types::{DispatchMetadata, Permissionship};

/// Identifies one dispatched sub-problem.
///
/// The relation is represented by its canonical key rather than its name,
/// so renamed-but-identical permissions (and semantically equal relations
/// across schema versions) share cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DispatchKey {
    pub canonical_key: CanonicalKey,
    pub resource_object_id: String,
    pub subject: ObjectAndRelation,
    pub revision: Revision,
}

/// Shared, bounded-TTL cache of check outcomes keyed across requests.
pub struct DispatchCache {
    cache: Cache<DispatchKey, Permissionship>,
}

impl DispatchCache {
    /// `ttl` should match the validity of the revisions being dispatched,
    /// plus any configured staleness budget.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let mut builder = Cache::builder().max_capacity(capacity);
        if ttl > Duration::ZERO {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
        }
    }

    /// Sizes the cache from the dispatch configuration: entries live for
    /// the revision validity plus the configured staleness budget.
    pub fn from_config(config: &DispatchConfig, revision_validity: Duration) -> Self {
        Self::new(
            config.request_cache_capacity,
            revision_validity + config.max_revision_staleness,
        )
    }

    pub(crate) async fn get(&self, key: &DispatchKey) -> Option<Permissionship> {
        self.cache.get(key).await
    }

    pub(crate) async fn insert(&self, key: DispatchKey, value: Permissionship) {
        self.cache.insert(key, value).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

/// Result of trying to acquire a single-flight slot.
pub(crate) enum SingleflightSlot {
    /// This caller computes and broadcasts.
    Leader(broadcast::Sender<DispatchResult<Permissionship>>),
    /// Another caller is computing; wait for its result.
    Follower(broadcast::Receiver<DispatchResult<Permissionship>>),
}

/// The single-flight registry key carries the remaining depth on top of
/// the dispatch key. A dispatch re-entered through a cycle in the stored
/// data arrives with a strictly smaller depth, so it can never become a
/// follower of its own in-flight computation; the recursion bottoms out at
/// the depth limit instead of deadlocking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SingleflightKey {
    pub key: DispatchKey,
    pub depth: u32,
}

/// Deduplicates concurrent identical sub-dispatches within one request.
#[derive(Default)]
pub(crate) struct Singleflight {
    in_flight: DashMap<SingleflightKey, broadcast::Sender<DispatchResult<Permissionship>>>,
}

impl Singleflight {
    /// Atomic check-and-register via the entry API, so two racing callers
    /// cannot both become leader.
    pub(crate) fn acquire(&self, key: SingleflightKey) -> SingleflightSlot {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => SingleflightSlot::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                SingleflightSlot::Leader(tx)
            }
        }
    }

    pub(crate) fn complete(&self, key: &SingleflightKey) {
        self.in_flight.remove(key);
    }
}

/// RAII cleanup so a panicking or errored leader never leaves followers
/// waiting on a dead slot.
pub(crate) struct SingleflightGuard<'a> {
    singleflight: &'a Singleflight,
    key: SingleflightKey,
    completed: bool,
}

impl<'a> SingleflightGuard<'a> {
    pub(crate) fn new(singleflight: &'a Singleflight, key: SingleflightKey) -> Self {
        Self {
            singleflight,
            key,
            completed: false,
        }
    }

    pub(crate) fn complete(mut self) {
        self.singleflight.complete(&self.key);
        self.completed = true;
    }
}

impl Drop for SingleflightGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.singleflight.complete(&self.key);
        }
    }
}

/// State owned by one outer API call: the scoped memo, the single-flight
/// registry, and the metadata counters.
#[derive(Default)]
pub(crate) struct RequestScope {
    memo: DashMap<DispatchKey, Permissionship>,
    pub(crate) singleflight: Singleflight,
    dispatch_count: AtomicU64,
    cache_hit_count: AtomicU64,
    depth_required: AtomicU32,
}

impl RequestScope {
    pub(crate) fn memoized(&self, key: &DispatchKey) -> Option<Permissionship> {
        self.memo.get(key).map(|entry| entry.value().clone())
    }

    pub(crate) fn memoize(&self, key: DispatchKey, value: Permissionship) {
        self.memo.insert(key, value);
    }

    pub(crate) fn count_dispatch(&self) {
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_cache_hit(&self) {
        self.cache_hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_depth(&self, depth: u32) {
        self.depth_required.fetch_max(depth, Ordering::Relaxed);
    }

    pub(crate) fn metadata(&self) -> DispatchMetadata {
        DispatchMetadata {
            dispatch_count: self.dispatch_count.load(Ordering::Relaxed),
            cache_hit_count: self.cache_hit_count.load(Ordering::Relaxed),
            depth_required: self.depth_required.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unguja_core::schema::{
        AllowedRelation, NamespaceDefinition, RelationDef, Schema,
    };

    fn key(resource_object_id: &str, subject: &str) -> DispatchKey {
        let schema = Schema::compile(
            vec![
                NamespaceDefinition::new("user", vec![]),
                NamespaceDefinition::new(
                    "resource",
                    vec![RelationDef::direct(
                        "viewer",
                        vec![AllowedRelation::terminal("user")],
                    )],
                ),
            ],
            vec![],
        )
        .unwrap();
        DispatchKey {
            canonical_key: schema.canonical_key("resource", "viewer").unwrap(),
            resource_object_id: resource_object_id.to_string(),
            subject: ObjectAndRelation::parse(subject).unwrap(),
            revision: Revision::from_sequence(3),
        }
    }

    #[tokio::test]
    async fn shared_cache_round_trips() {
        let cache = DispatchCache::new(16, Duration::from_secs(1));
        let k = key("r1", "user:alice");
        assert!(cache.get(&k).await.is_none());
        cache.insert(k.clone(), Permissionship::HasPermission).await;
        assert_eq!(cache.get(&k).await, Some(Permissionship::HasPermission));
    }

    #[tokio::test]
    async fn first_acquire_leads_second_follows() {
        let singleflight = Singleflight::default();
        let k = SingleflightKey {
            key: key("r1", "user:alice"),
            depth: 10,
        };

        let SingleflightSlot::Leader(tx) = singleflight.acquire(k.clone()) else {
            panic!("first caller must lead");
        };
        let SingleflightSlot::Follower(mut rx) = singleflight.acquire(k.clone()) else {
            panic!("second caller must follow");
        };

        tx.send(Ok(Permissionship::NoPermission)).unwrap();
        assert!(matches!(
            rx.recv().await,
            Ok(Ok(Permissionship::NoPermission))
        ));
    }

    #[test]
    fn reentry_at_a_smaller_depth_is_not_a_follower() {
        let singleflight = Singleflight::default();
        let outer = SingleflightKey {
            key: key("r1", "user:alice"),
            depth: 10,
        };
        let inner = SingleflightKey {
            key: key("r1", "user:alice"),
            depth: 8,
        };

        let SingleflightSlot::Leader(_outer_tx) = singleflight.acquire(outer) else {
            panic!("expected leader");
        };
        assert!(matches!(
            singleflight.acquire(inner),
            SingleflightSlot::Leader(_)
        ));
    }

    #[test]
    fn guard_cleans_up_on_drop() {
        let singleflight = Singleflight::default();
        let k = SingleflightKey {
            key: key("r1", "user:alice"),
            depth: 10,
        };

        {
            let SingleflightSlot::Leader(_tx) = singleflight.acquire(k.clone()) else {
                panic!("expected leader");
            };
            let _guard = SingleflightGuard::new(&singleflight, k.clone());
            // Dropped without completing, as after a panic.
        }

        assert!(matches!(
            singleflight.acquire(k),
            SingleflightSlot::Leader(_)
        ));
    }

    #[test]
    fn scope_counters_aggregate() {
        let scope = RequestScope::default();
        scope.count_dispatch();
        scope.count_dispatch();
        scope.count_cache_hit();
        scope.record_depth(3);
        scope.record_depth(1);

        let metadata = scope.metadata();
        assert_eq!(metadata.dispatch_count, 2);
        assert_eq!(metadata.cache_hit_count, 1);
        assert_eq!(metadata.depth_required, 3);
    }
}
