//! A bounded table of upstreams, keyed by service name.
//!
//! Reads take the shared side of a [RwLock]; inserts, replacements and
//! evictions take the exclusive side. The lazy refresh path holds the
//! exclusive side across its backend lookup, which is why this is an
//! asynchronous lock.

use crate::policy::Policy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::service;
use crate::upstream::AllUpstreams;

use rand::{rng, Rng};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio::time::Instant;
use tracing::{event, Level};

/// The cached upstreams of one service.
#[derive(Clone, Debug)]
pub struct Entry {
    owner: service::Name,
    upstreams: AllUpstreams,
    refreshed_at: Instant,
    ttl: Duration,
}

impl Entry {
    /// The service this entry was resolved for.
    pub fn owner(&self) -> &service::Name {
        &self.owner
    }

    pub fn upstreams(&self) -> &AllUpstreams {
        &self.upstreams
    }

    /// When the entry was last written by either refresh path.
    pub fn refreshed_at(&self) -> Instant {
        self.refreshed_at
    }

    /// Fixed when the entry is created; refreshes keep it.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_fresh(&self) -> bool {
        self.refreshed_at.elapsed() < self.ttl
    }
}

/// The contents of a [Cache], reachable only through its lock.
#[derive(Debug)]
pub struct Table {
    entries: HashMap<service::Name, Entry>,
    capacity: usize,
}

impl Table {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    /// Returns the upstreams of `name`, if they are cached and fresh.
    pub fn fresh(&self, name: &str) -> Option<AllUpstreams> {
        self.entries
            .get(name)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.upstreams.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores `upstreams` for `name`, stamped with the current instant.
    ///
    /// An existing entry is replaced wholesale but keeps its TTL; `ttl` only
    /// applies to a new entry. Inserting a new entry into a full table first
    /// evicts one other entry, chosen at random.
    pub fn put(&mut self, name: &service::Name, upstreams: AllUpstreams, ttl: Duration) -> &Entry {
        let now = Instant::now();
        let (refreshed_at, ttl) = match self.entries.get(name) {
            // Never backdate an entry.
            Some(old) => (std::cmp::max(now, old.refreshed_at), old.ttl),
            None => {
                if self.entries.len() >= self.capacity {
                    self.evict_one(name);
                }
                (now, ttl)
            }
        };

        let entry = Entry {
            owner: name.clone(),
            upstreams,
            refreshed_at,
            ttl,
        };
        self.entries.insert(name.clone(), entry);
        &self.entries[name.as_str()]
    }

    // No recency or frequency is tracked, so any entry may go.
    fn evict_one(&mut self, incoming: &service::Name) {
        if self.entries.is_empty() {
            return;
        }
        let index = rng().random_range(0..self.entries.len());
        let Some(victim) = self.entries.keys().nth(index).cloned() else {
            return;
        };
        self.entries.remove(&victim);

        event!(Level::DEBUG, evicted = %victim, service = %incoming, "Cache full, evicted entry");
        #[cfg(feature = "probes")]
        probes::evict!(|| (incoming.as_str(), victim.as_str()));
    }
}

/// Upstreams shared by every request and every push task.
#[derive(Debug)]
pub struct Cache {
    policy: Policy,
    table: RwLock<Table>,
}

impl Cache {
    /// Creates an empty cache.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(policy: Policy) -> Self {
        let table = RwLock::new(Table::new(policy.capacity.max(1)));
        Self { policy, table }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Returns a copy of the entry for `name`, fresh or not.
    pub async fn get(&self, name: &str) -> Option<Entry> {
        self.table.read().await.get(name).cloned()
    }

    /// Returns the upstreams of `name` if they are fresh, under the shared
    /// lock.
    pub async fn fresh(&self, name: &str) -> Option<AllUpstreams> {
        self.table.read().await.fresh(name)
    }

    /// Stores upstreams under the exclusive lock. See [Table::put].
    pub async fn put(&self, name: &service::Name, upstreams: AllUpstreams, ttl: Duration) -> Entry {
        self.table.write().await.put(name, upstreams, ttl).clone()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }

    /// Takes the exclusive lock, for read-modify-write sequences.
    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().await
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::upstream::Upstream;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn upstreams(dials: &[&str]) -> AllUpstreams {
        Arc::new(dials.iter().map(|d| Upstream::from(*d)).collect())
    }

    fn small_cache(capacity: usize) -> Cache {
        Cache::new(Policy {
            capacity,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_is_fresh_until_ttl() {
        let cache = Cache::default();
        let name = service::Name::new("echo");
        cache
            .put(&name, upstreams(&["a:1"]), Duration::from_secs(10))
            .await;

        assert_eq!(cache.fresh("echo").await, Some(upstreams(&["a:1"])));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.fresh("echo").await.is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.fresh("echo").await.is_none());

        // Stale entries are still held.
        let entry = cache.get("echo").await.expect("stale entry is kept");
        assert!(!entry.is_fresh());
        assert_eq!(entry.owner(), &name);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_ttl_and_advances_timestamp() {
        let cache = Cache::default();
        let name = service::Name::new("echo");
        let first = cache
            .put(&name, upstreams(&["a:1"]), Duration::from_secs(10))
            .await;

        tokio::time::advance(Duration::from_secs(3)).await;
        let second = cache
            .put(&name, upstreams(&["b:2"]), Duration::from_secs(99))
            .await;

        assert_eq!(second.ttl(), Duration::from_secs(10));
        assert!(second.refreshed_at() > first.refreshed_at());
        assert_eq!(second.upstreams(), &upstreams(&["b:2"]));
    }

    #[tokio::test]
    async fn test_empty_upstreams_are_cached() {
        let cache = Cache::default();
        let name = service::Name::new("nobody");
        cache
            .put(&name, upstreams(&[]), Duration::from_secs(10))
            .await;
        let fresh = cache.fresh("nobody").await.expect("empty entry is fresh");
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_new_key_at_capacity_evicts_exactly_one() {
        let cache = small_cache(3);
        let ttl = Duration::from_secs(60);
        for name in ["a", "b", "c"] {
            cache.put(&name.into(), upstreams(&["x:1"]), ttl).await;
        }
        assert_eq!(cache.len().await, 3);

        cache.put(&"d".into(), upstreams(&["x:1"]), ttl).await;
        assert_eq!(cache.len().await, 3);
        assert!(cache.get("d").await.is_some());

        let mut survivors = BTreeSet::new();
        for name in ["a", "b", "c"] {
            if cache.get(name).await.is_some() {
                survivors.insert(name);
            }
        }
        assert_eq!(survivors.len(), 2, "Expected one eviction, saw {survivors:?}");
    }

    #[tokio::test]
    async fn test_size_never_exceeds_capacity() {
        let cache = small_cache(5);
        let ttl = Duration::from_secs(60);
        for i in 0..50 {
            cache
                .put(&service::Name::new(format!("svc-{i}")), upstreams(&[]), ttl)
                .await;
            assert!(cache.len().await <= 5);
        }
        assert_eq!(cache.len().await, 5);
        assert!(cache.get("svc-49").await.is_some());
    }

    #[tokio::test]
    async fn test_update_at_capacity_does_not_evict() {
        let cache = small_cache(2);
        let ttl = Duration::from_secs(60);
        cache.put(&"a".into(), upstreams(&["a:1"]), ttl).await;
        cache.put(&"b".into(), upstreams(&["b:1"]), ttl).await;

        cache.put(&"a".into(), upstreams(&["a:2"]), ttl).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.fresh("a").await, Some(upstreams(&["a:2"])));
        assert_eq!(cache.fresh("b").await, Some(upstreams(&["b:1"])));
    }

    #[tokio::test]
    async fn test_zero_capacity_holds_one() {
        let cache = small_cache(0);
        let ttl = Duration::from_secs(60);
        cache.put(&"a".into(), upstreams(&[]), ttl).await;
        cache.put(&"b".into(), upstreams(&[]), ttl).await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("b").await.is_some());
    }
}
