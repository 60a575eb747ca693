//! Pool manager: one pool per credential set, bounded and swept when idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PoolKey;
use crate::config::PoolSettings;
use crate::db::{
    truncate_statement, DatabasePool, DatabaseSession, PgConnector, PoolConnector, QueryResult,
    Value,
};
use crate::error::{ConsoleError, Result};

/// A cached pool and its bookkeeping.
struct CachedPool {
    key: PoolKey,
    pool: Arc<dyn DatabasePool>,
    last_used: Instant,
    last_used_at: SystemTime,
    in_use: Arc<AtomicUsize>,
}

impl CachedPool {
    fn new(key: PoolKey, pool: Arc<dyn DatabasePool>) -> Self {
        Self {
            key,
            pool,
            last_used: Instant::now(),
            last_used_at: SystemTime::now(),
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = SystemTime::now();
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    fn is_idle_for(&self, timeout: Duration, now: Instant) -> bool {
        self.in_use() == 0 && now.duration_since(self.last_used) > timeout
    }
}

/// Keeps a pool marked busy until dropped.
struct Lease {
    pool: Arc<dyn DatabasePool>,
    in_use: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Cache key (`host:port:database:user:ssl`).
    pub key: String,
    pub total_count: u32,
    pub idle_count: u32,
    pub waiting_count: u32,
    /// Operations currently running against the pool.
    pub in_use: usize,
    /// Last use as unix milliseconds.
    pub last_used: u64,
    /// Time since last use in milliseconds.
    pub idle_ms: u64,
}

/// Caches one database pool per credential set.
///
/// The number of cached pools is soft-capped at `max_pools`: when full, the
/// least recently used pool with no operation in flight is evicted, and when
/// every pool is busy the new pool is admitted anyway. A pool with operations
/// in flight is never closed by eviction or by the idle sweep.
pub struct PoolManager {
    connector: Arc<dyn PoolConnector>,
    settings: PoolSettings,
    pools: Mutex<HashMap<String, CachedPool>>,
}

impl PoolManager {
    /// Creates a manager backed by PostgreSQL.
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_connector(Arc::new(PgConnector), settings)
    }

    /// Creates a manager with a custom pool connector.
    pub fn with_connector(connector: Arc<dyn PoolConnector>, settings: PoolSettings) -> Self {
        Self {
            connector,
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Number of cached pools.
    pub async fn pool_count(&self) -> usize {
        self.pools.lock().await.len()
    }

    /// Returns the pool for `key`, creating it on first use.
    pub async fn get_pool(&self, key: &PoolKey) -> Result<Arc<dyn DatabasePool>> {
        let (pool, _) = self.checkout(key, false).await?;
        Ok(pool)
    }

    /// Executes a single statement on the pool for `key`.
    pub async fn query(&self, key: &PoolKey, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let lease = self.lease(key).await?;

        let start = Instant::now();
        let result = lease.pool.execute(sql, params).await;
        self.log_if_slow(key, sql, start.elapsed());

        if let Err(e) = &result {
            debug!(pool = %key, error = %e, "Query failed");
        }
        result
    }

    /// Runs `work` on one exclusively checked-out session.
    ///
    /// The session is returned to the pool when `work` finishes, whether it
    /// succeeds, fails or is cancelled. The pool counts as in use for the whole
    /// unit of work.
    pub async fn query_with_client<T, F>(&self, key: &PoolKey, work: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut dyn DatabaseSession) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let lease = self.lease(key).await?;
        let mut session = lease.pool.acquire().await?;

        let start = Instant::now();
        let result = work(session.as_mut()).await;
        drop(session);
        self.log_if_slow(key, "<session>", start.elapsed());

        result
    }

    /// Closes and removes pools idle longer than the configured timeout.
    ///
    /// Returns the number of pools closed.
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let timeout = self.settings.pool_idle_timeout;

        let expired: Vec<CachedPool> = {
            let mut pools = self.pools.lock().await;
            let idle_keys: Vec<String> = pools
                .iter()
                .filter(|(_, cached)| cached.is_idle_for(timeout, now))
                .map(|(key, _)| key.clone())
                .collect();
            idle_keys
                .iter()
                .filter_map(|key| pools.remove(key))
                .collect()
        };

        let closed = expired.len();
        join_all(expired.into_iter().map(|cached| close_pool(cached, "idle"))).await;

        if closed > 0 {
            info!(closed, "Idle pool sweep completed");
        }
        closed
    }

    /// Starts the background idle sweep, running every `sweep_interval`
    /// until `token` is cancelled.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.settings.sweep_interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!("Idle pool sweeper stopped");
                        break;
                    }
                    _ = timer.tick() => {
                        manager.sweep_idle().await;
                    }
                }
            }
        })
    }

    /// Closes every pool and empties the cache.
    pub async fn close_all_pools(&self) {
        let all: Vec<CachedPool> = {
            let mut pools = self.pools.lock().await;
            pools.drain().map(|(_, cached)| cached).collect()
        };

        let count = all.len();
        join_all(all.into_iter().map(|cached| close_pool(cached, "shutdown"))).await;
        info!(count, "All pools closed");
    }

    /// Statistics for every cached pool, ordered by key.
    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        let now = Instant::now();
        let pools = self.pools.lock().await;

        let mut stats: Vec<PoolStats> = pools
            .iter()
            .map(|(key, cached)| {
                let counts = cached.pool.connection_counts();
                PoolStats {
                    key: key.clone(),
                    total_count: counts.total,
                    idle_count: counts.idle,
                    waiting_count: counts.waiting,
                    in_use: cached.in_use(),
                    last_used: unix_millis(cached.last_used_at),
                    idle_ms: now.duration_since(cached.last_used).as_millis() as u64,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Looks up or creates the pool and marks it in use.
    async fn lease(&self, key: &PoolKey) -> Result<Lease> {
        let (pool, in_use) = self.checkout(key, true).await?;
        Ok(Lease { pool, in_use })
    }

    /// Looks up or creates the pool for `key`, refreshing its last use.
    ///
    /// With `mark_in_use` the in-use count is incremented before the cache lock
    /// is released, so the sweep cannot close the pool in between.
    async fn checkout(
        &self,
        key: &PoolKey,
        mark_in_use: bool,
    ) -> Result<(Arc<dyn DatabasePool>, Arc<AtomicUsize>)> {
        let cache_key = key.cache_key();
        let mut evicted = None;

        let checked_out = {
            let mut pools = self.pools.lock().await;

            if !pools.contains_key(&cache_key) {
                let pool = self.connector.create_pool(key, &self.settings)?;

                if pools.len() >= self.settings.max_pools {
                    evicted = evict_least_recently_used(&mut pools);
                    if evicted.is_none() {
                        warn!(
                            pool = %key,
                            cached = pools.len(),
                            max_pools = self.settings.max_pools,
                            "All pools busy, exceeding pool limit"
                        );
                    }
                }

                pools.insert(cache_key.clone(), CachedPool::new(key.clone(), pool));
                info!(pool = %key, cached = pools.len(), "Created pool");
            }

            let cached = pools
                .get_mut(&cache_key)
                .ok_or_else(|| ConsoleError::internal("pool missing from cache after insert"))?;
            cached.touch();
            if mark_in_use {
                cached.in_use.fetch_add(1, Ordering::SeqCst);
            }
            (Arc::clone(&cached.pool), Arc::clone(&cached.in_use))
        };

        if let Some(cached) = evicted {
            close_pool(cached, "evicted").await;
        }

        Ok(checked_out)
    }

    fn log_if_slow(&self, key: &PoolKey, sql: &str, elapsed: Duration) {
        if elapsed > self.settings.slow_query_threshold {
            warn!(
                pool = %key,
                elapsed_ms = elapsed.as_millis() as u64,
                sql = %truncate_statement(sql, 200),
                "Slow query"
            );
        }
    }
}

/// Removes the least recently used pool that has nothing in flight.
fn evict_least_recently_used(pools: &mut HashMap<String, CachedPool>) -> Option<CachedPool> {
    let victim = pools
        .iter()
        .filter(|(_, cached)| cached.in_use() == 0)
        .min_by_key(|(_, cached)| cached.last_used)
        .map(|(key, _)| key.clone())?;
    pools.remove(&victim)
}

/// Closes a pool that has already been removed from the cache.
async fn close_pool(cached: CachedPool, reason: &str) {
    match cached.pool.close().await {
        Ok(()) => info!(pool = %cached.key, reason, "Closed pool"),
        Err(e) => warn!(pool = %cached.key, reason, error = %e, "Failed to close pool"),
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
