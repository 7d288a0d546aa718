//! Short-lived per-server memoization of statistics payloads

use crate::coalesce::Coalescer;
use crate::errors::Result;
use crate::profile::ServerKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Category of statistics request, part of the cache key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Dashboard,
    Analytics,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Dashboard => write!(f, "dashboard"),
            QueryKind::Analytics => write!(f, "analytics"),
        }
    }
}

/// Validity windows per query kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTtl {
    pub dashboard: Duration,
    pub analytics: Duration,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            dashboard: Duration::from_secs(30),
            analytics: Duration::from_secs(300),
        }
    }
}

impl CacheTtl {
    pub fn for_kind(&self, kind: QueryKind) -> Duration {
        match kind {
            QueryKind::Dashboard => self.dashboard,
            QueryKind::Analytics => self.analytics,
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    payload: Value,
    captured_at: Instant,
    fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(payload: Value) -> Self {
        Self {
            payload,
            captured_at: Instant::now(),
            fetched_at: Utc::now(),
        }
    }

    fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.captured_at)
    }

    fn is_live(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }

    fn view(&self, from_cache: bool, ttl: Duration) -> CachedStats {
        CachedStats {
            payload: self.payload.clone(),
            captured_at: self.captured_at,
            fetched_at: self.fetched_at,
            from_cache,
            stale: !self.is_live(ttl),
        }
    }
}

/// A statistics payload as handed back to callers
#[derive(Clone, Debug, PartialEq)]
pub struct CachedStats {
    pub payload: Value,
    pub captured_at: Instant,
    pub fetched_at: DateTime<Utc>,
    pub from_cache: bool,
    pub stale: bool,
}

type CacheKey = (ServerKey, QueryKind);

/// One entry per (server, query kind); most recent successful fetch wins.
///
/// Entries are never evicted. They go stale once their TTL passes and are
/// replaced by the next successful fetch. A failed fetch leaves them alone.
#[derive(Debug)]
pub struct StatsCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    ttl: CacheTtl,
    inflight: Coalescer<CacheKey, Result<CachedStats>>,
}

impl StatsCache {
    pub fn new(ttl: CacheTtl) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            inflight: Coalescer::new(),
        }
    }

    /// Live entry for the key, without touching the network
    pub fn lookup(&self, server: ServerKey, kind: QueryKind) -> Option<CachedStats> {
        let ttl = self.ttl.for_kind(kind);
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .get(&(server, kind))
            .filter(|entry| entry.is_live(ttl))
            .map(|entry| entry.view(true, ttl))
    }

    /// Entry for the key even if stale
    pub fn peek(&self, server: ServerKey, kind: QueryKind) -> Option<CachedStats> {
        let ttl = self.ttl.for_kind(kind);
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.get(&(server, kind)).map(|entry| entry.view(true, ttl))
    }

    /// Record a freshly fetched payload.
    pub fn store(&self, server: ServerKey, kind: QueryKind, payload: Value) -> CachedStats {
        store_entry(&self.entries, self.ttl, (server, kind), payload)
    }

    /// Serve from a live entry unless `force_refresh`, otherwise run `fetch`
    /// and store its result.
    ///
    /// Concurrent misses for the same key share a single fetch.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        server: ServerKey,
        kind: QueryKind,
        force_refresh: bool,
        fetch: F,
    ) -> Result<CachedStats>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        if !force_refresh {
            if let Some(hit) = self.lookup(server, kind) {
                debug!("Cache hit for {} {}", server, kind);
                return Ok(hit);
            }
        }

        debug!(
            "Cache {} for {} {}, fetching",
            if force_refresh { "bypass" } else { "miss" },
            server,
            kind
        );

        let entries = Arc::clone(&self.entries);
        let ttl = self.ttl;
        let key = (server, kind);

        self.inflight
            .run(key, move || {
                let work = fetch();
                async move {
                    match work.await {
                        Ok(payload) => Ok(store_entry(&entries, ttl, key, payload)),
                        Err(e) => {
                            warn!("Refresh of {} {} failed, keeping previous entry: {}", key.0, key.1, e);
                            Err(e)
                        }
                    }
                }
            })
            .await
    }
}

impl Default for StatsCache {
    fn default() -> Self {
        Self::new(CacheTtl::default())
    }
}

fn store_entry(
    entries: &RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: CacheTtl,
    key: CacheKey,
    payload: Value,
) -> CachedStats {
    let entry = CacheEntry::new(payload);
    let view = entry.view(false, ttl.for_kind(key.1));
    entries
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .insert(key, entry);
    view
}
