//! Process-local counter store with sharded-mutex maps and TTL reaping.
//!
//! Counters live in a fixed set of shards, each an
//! `ahash`-keyed map behind its own mutex, so concurrent commits on
//! different keys rarely contend. A commit both increments and stamps the
//! expiration under one lock acquisition, which is the atomicity the
//! [`Store`](super::Store) contract requires. Expired entries are reaped
//! opportunistically during commits, at most once per reap interval.
//!
//! This store is process-local. Deployments with more than one instance
//! must use [`shared::SharedStore`](super::shared::SharedStore) instead or
//! each instance will enforce its own independent budget.

use super::{
    check_window, now_epoch, seconds_until_reset, window_key, CostCommit, CostSnapshot,
    RateCommit, RateSnapshot, Store, StoreError,
};
use ahash::HashMap as AHashMap;
use async_trait::async_trait;
use log::debug;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Mutex;

const SHARD_COUNT: usize = 16;

/// Reap expired entries at most this often, in seconds.
const REAP_INTERVAL_SECS: u64 = 300;

/// One window's counters. Rate commits bump `hits`; cost commits grow
/// `cost`. Both share the window expiration.
#[derive(Debug, Clone, Default)]
struct WindowCounter {
    hits: u64,
    cost: f64,
    expires_at: u64,
}

/// In-memory [`Store`] implementation.
#[derive(Debug)]
pub struct MemoryStore {
    shards: Vec<Mutex<AHashMap<String, WindowCounter>>>,
    hasher: ahash::RandomState,
    last_reap: Mutex<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(AHashMap::default()));
        }
        Self {
            shards,
            hasher: ahash::RandomState::new(),
            last_reap: Mutex::new(now_epoch()),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<AHashMap<String, WindowCounter>> {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    fn lock_err(e: impl std::fmt::Display) -> StoreError {
        StoreError::Unavailable(format!("lock poisoned: {}", e))
    }

    /// Drops expired entries across all shards, at most once per
    /// [`REAP_INTERVAL_SECS`].
    fn maybe_reap(&self, now: u64) {
        let mut last = match self.last_reap.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if now.saturating_sub(*last) < REAP_INTERVAL_SECS {
            return;
        }
        *last = now;
        drop(last);

        let mut retained = 0usize;
        for shard in &self.shards {
            if let Ok(mut entries) = shard.lock() {
                entries.retain(|_, counter| counter.expires_at > now);
                retained += entries.len();
            }
        }
        debug!("memory store reap: {} window counters retained", retained);
    }

    /// Live (non-expired) counter for the current window, if any.
    fn read(&self, full_key: &str, now: u64) -> Result<Option<WindowCounter>, StoreError> {
        let entries = self.shard_for(full_key).lock().map_err(Self::lock_err)?;
        Ok(entries
            .get(full_key)
            .filter(|counter| counter.expires_at > now)
            .cloned())
    }

    /// Runs `apply` on the current window's counter under the shard lock,
    /// creating or resetting the entry as the window dictates.
    fn mutate<T>(
        &self,
        full_key: &str,
        now: u64,
        window_seconds: u64,
        apply: impl FnOnce(&mut WindowCounter) -> T,
    ) -> Result<T, StoreError> {
        let expires_at = now + seconds_until_reset(window_seconds, now);
        let mut entries = self.shard_for(full_key).lock().map_err(Self::lock_err)?;
        let counter = entries
            .entry(full_key.to_string())
            .or_insert_with(WindowCounter::default);
        counter.expires_at = expires_at;
        Ok(apply(counter))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn peek_rate(
        &self,
        key: &str,
        _limit: u64,
        window_seconds: u64,
    ) -> Result<RateSnapshot, StoreError> {
        check_window(window_seconds)?;
        let now = now_epoch();
        let full_key = window_key(key, window_seconds, now);
        let current = self.read(&full_key, now)?.map(|c| c.hits).unwrap_or(0);
        Ok(RateSnapshot {
            current,
            reset_in: seconds_until_reset(window_seconds, now),
        })
    }

    async fn commit_rate(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateCommit, StoreError> {
        check_window(window_seconds)?;
        let now = now_epoch();
        self.maybe_reap(now);
        let full_key = window_key(key, window_seconds, now);
        let current = self.mutate(&full_key, now, window_seconds, |counter| {
            counter.hits += 1;
            counter.hits
        })?;
        Ok(RateCommit {
            current,
            reset_in: seconds_until_reset(window_seconds, now),
            exceeded: current > limit,
        })
    }

    async fn peek_cost(&self, key: &str, window_seconds: u64) -> Result<CostSnapshot, StoreError> {
        check_window(window_seconds)?;
        let now = now_epoch();
        let full_key = window_key(key, window_seconds, now);
        let current = self.read(&full_key, now)?.map(|c| c.cost).unwrap_or(0.0);
        Ok(CostSnapshot {
            current,
            reset_in: seconds_until_reset(window_seconds, now),
        })
    }

    async fn commit_cost(
        &self,
        key: &str,
        amount: f64,
        cap: f64,
        window_seconds: u64,
    ) -> Result<CostCommit, StoreError> {
        check_window(window_seconds)?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(StoreError::Invalid(format!(
                "cost amount {} is not a finite non-negative number",
                amount
            )));
        }
        let now = now_epoch();
        self.maybe_reap(now);
        let full_key = window_key(key, window_seconds, now);
        let current = self.mutate(&full_key, now, window_seconds, |counter| {
            counter.cost += amount;
            counter.cost
        })?;
        Ok(CostCommit {
            current,
            reset_in: seconds_until_reset(window_seconds, now),
            exceeded: current > cap,
            cap,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let prefix = format!("{}:", key);
        for shard in &self.shards {
            let mut entries = shard.lock().map_err(Self::lock_err)?;
            entries.retain(|stored, _| !stored.starts_with(&prefix));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peek_does_not_create_state() {
        let store = MemoryStore::new();
        let snap = store.peek_rate("rate:u:e", 10, 3_600).await.unwrap();
        assert_eq!(snap.current, 0);

        // A second peek still sees nothing: the first one left no entry
        // behind.
        for shard in &store.shards {
            assert!(shard.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn commit_increments_by_exactly_one() {
        let store = MemoryStore::new();
        for expected in 1..=5u64 {
            let commit = store.commit_rate("rate:u:e", 10, 3_600).await.unwrap();
            assert_eq!(commit.current, expected);
            assert!(!commit.exceeded);
        }
        let snap = store.peek_rate("rate:u:e", 10, 3_600).await.unwrap();
        assert_eq!(snap.current, 5);
    }

    #[tokio::test]
    async fn exceeded_is_post_increment_strict_compare() {
        let store = MemoryStore::new();
        let c1 = store.commit_rate("rate:u:e", 1, 3_600).await.unwrap();
        assert!(!c1.exceeded); // current == limit
        let c2 = store.commit_rate("rate:u:e", 1, 3_600).await.unwrap();
        assert!(c2.exceeded); // current > limit
    }

    #[tokio::test]
    async fn rate_and_cost_counters_are_independent_per_key() {
        let store = MemoryStore::new();
        store.commit_rate("rate:u:e", 10, 3_600).await.unwrap();
        let cost = store.commit_cost("cost:u:e", 0.03, 0.10, 3_600).await.unwrap();
        assert!((cost.current - 0.03).abs() < 1e-9);
        assert!(!cost.exceeded);
        assert_eq!(cost.cap, 0.10);
    }

    #[tokio::test]
    async fn windows_of_different_lengths_coexist() {
        let store = MemoryStore::new();
        store.commit_rate("rate:u:e", 10, 3_600).await.unwrap();
        store.commit_rate("rate:u:e", 10, 86_400).await.unwrap();
        store.commit_rate("rate:u:e", 10, 86_400).await.unwrap();
        let hour = store.peek_rate("rate:u:e", 10, 3_600).await.unwrap();
        let day = store.peek_rate("rate:u:e", 10, 86_400).await.unwrap();
        assert_eq!(hour.current, 1);
        assert_eq!(day.current, 2);
    }

    #[tokio::test]
    async fn reset_clears_all_windows_under_the_logical_key() {
        let store = MemoryStore::new();
        store.commit_rate("rate:u:e", 10, 3_600).await.unwrap();
        store.commit_rate("rate:u:e", 10, 86_400).await.unwrap();
        store.commit_rate("rate:other:e", 10, 3_600).await.unwrap();

        store.reset("rate:u:e").await.unwrap();

        assert_eq!(store.peek_rate("rate:u:e", 10, 3_600).await.unwrap().current, 0);
        assert_eq!(store.peek_rate("rate:u:e", 10, 86_400).await.unwrap().current, 0);
        // Unrelated keys survive.
        assert_eq!(store.peek_rate("rate:other:e", 10, 3_600).await.unwrap().current, 1);
    }

    #[tokio::test]
    async fn negative_cost_amount_is_a_contract_violation() {
        let store = MemoryStore::new();
        let err = store.commit_cost("cost:u:e", -1.0, 1.0, 3_600).await;
        assert!(matches!(err, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn counters_expire_with_their_window() {
        let store = MemoryStore::new();
        store.commit_rate("rate:u:e", 10, 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
        let snap = store.peek_rate("rate:u:e", 10, 1).await.unwrap();
        assert_eq!(snap.current, 0);
    }
}
