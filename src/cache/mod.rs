//! Key space caching with TTL, bounded size, and single-flight builds.
//!
//! [`KeySpaceCache`] maps a root map path to its built [`KeySpace`] and is
//! the only way consumers obtain one. Three disciplines govern the table:
//!
//! - **TTL**: each entry expires a fixed duration after insertion. The TTL
//!   is captured from the configuration snapshot at insertion time, so a
//!   config reload never shortens or extends entries already in the cache.
//!   Expired entries are treated as absent on lookup and are also swept by a
//!   background task whose period is `ttl / 3` clamped below by a floor, so
//!   very short TTLs cannot cause a cleanup storm.
//! - **Bounded size + LRU**: the cache never holds more than the configured
//!   maximum number of entries; inserting past the limit evicts the least
//!   recently accessed entry, and every hit refreshes recency.
//! - **Single-flight**: concurrent requests to build the same root map share
//!   one in-flight build through a pending-builds table
//!   (`DashMap<PathBuf, Arc<InFlightBuild>>` coordinated with
//!   `tokio::sync::Notify`). All waiters receive the same `Arc<KeySpace>`
//!   (identical `build_time`), and a failed shared build fails every waiter
//!   equivalently.
//!
//! `clear()` drops all entries immediately but never disturbs an in-flight
//! build; a build that completes after a clear may still populate the cache
//! and is then subject to normal expiry and eviction.

use crate::config::{ConfigProvider, EngineConfig};
use crate::core::KeySpaceError;
use crate::keyspace::{KeySpace, KeySpaceBuilder};
use crate::utils::paths::absolutize;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Floor for the background sweep period, regardless of how short the TTL
/// is.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Point-in-time cache statistics for host status displays.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Number of entries currently held (including not-yet-swept expired
    /// ones)
    pub cache_size: usize,
    /// Configured maximum entry count
    pub max_size: usize,
    /// Configured TTL in milliseconds
    pub ttl_ms: u128,
    /// Per-entry detail
    pub entries: Vec<CacheEntryStats>,
}

/// Statistics for one cache entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStats {
    /// Root map the entry was built from
    pub root_map: PathBuf,
    /// Milliseconds since the entry was inserted
    pub age_ms: u128,
    /// Number of keys in the cached space
    pub key_count: usize,
}

struct CacheEntry {
    key_space: Arc<KeySpace>,
    inserted_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
}

/// Coordination cell for one pending build.
///
/// The leader stores the shared outcome exactly once and wakes waiters; a
/// waiter that subscribes after the store sees the result on its pre-wait
/// check, so no wakeup can be missed.
struct InFlightBuild {
    notify: Notify,
    result: OnceLock<Result<Arc<KeySpace>, Arc<KeySpaceError>>>,
}

impl InFlightBuild {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: OnceLock::new(),
        }
    }

    async fn wait(&self) -> Result<Arc<KeySpace>, Arc<KeySpaceError>> {
        loop {
            // Register interest before checking, so a store between the
            // check and the await still wakes us.
            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }
            notified.await;
        }
    }

    fn complete(&self, result: Result<Arc<KeySpace>, Arc<KeySpaceError>>) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }
}

/// The key space cache. See the module docs for the full discipline.
///
/// Constructed inside a Tokio runtime (the background sweeper is spawned at
/// creation) and shared as `Arc<KeySpaceCache>`.
pub struct KeySpaceCache {
    provider: Arc<dyn ConfigProvider>,
    config: RwLock<EngineConfig>,
    entries: DashMap<PathBuf, CacheEntry>,
    in_flight: DashMap<PathBuf, Arc<InFlightBuild>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl KeySpaceCache {
    /// Create a cache reading its settings from `provider`.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`KeySpaceError::ConfigError`] (or an I/O / parse variant)
    /// when the initial configuration cannot be loaded.
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Result<Arc<Self>, KeySpaceError> {
        let config = provider.load()?;
        let cache = Arc::new(Self {
            provider,
            config: RwLock::new(config),
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            sweeper: Mutex::new(None),
        });
        cache.spawn_sweeper();
        Ok(cache)
    }

    /// Get the key space for `root_map`, building it if absent or expired.
    ///
    /// Concurrent callers for the same root share one build; every caller
    /// receives the same `Arc<KeySpace>`.
    ///
    /// # Errors
    ///
    /// Propagates the build failure, identically, to every caller that
    /// awaited the shared build.
    pub async fn get_or_build(&self, root_map: &Path) -> Result<Arc<KeySpace>, KeySpaceError> {
        let root = absolutize(root_map)?;

        if let Some(space) = self.lookup(&root) {
            trace!(root = %root.display(), "key space cache hit");
            return Ok(space);
        }

        // Join an existing flight or become the leader for this root.
        let existing = match self.in_flight.entry(root.clone()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(InFlightBuild::new()));
                None
            }
        };
        if let Some(flight) = existing {
            debug!(root = %root.display(), "awaiting in-flight key space build");
            return flight.wait().await.map_err(|e| shared_failure(&root, &e));
        }

        debug!(root = %root.display(), "key space cache miss, building");
        let snapshot = self.config_snapshot();
        let built = KeySpaceBuilder::new(snapshot.clone())
            .build(&root)
            .await
            .map(Arc::new);

        let shared: Result<Arc<KeySpace>, Arc<KeySpaceError>> = built.map_err(Arc::new);
        if let Ok(space) = &shared {
            self.insert(root.clone(), Arc::clone(space), &snapshot);
        }

        // Remove the flight before completing it: late arrivals start a
        // fresh build (or hit the cache) instead of joining a finished one.
        let flight = self.in_flight.remove(&root).map(|(_, f)| f);
        if let Some(flight) = flight {
            flight.complete(shared.clone());
        }

        shared.map_err(|e| shared_failure(&root, &e))
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let config = self.config_snapshot();
        let entries: Vec<CacheEntryStats> = self
            .entries
            .iter()
            .map(|entry| CacheEntryStats {
                root_map: entry.key().clone(),
                age_ms: entry.value().inserted_at.elapsed().as_millis(),
                key_count: entry.value().key_space.len(),
            })
            .collect();
        CacheStats {
            cache_size: entries.len(),
            max_size: config.max_cache_entries,
            ttl_ms: config.ttl().as_millis(),
            entries,
        }
    }

    /// Drop every entry immediately.
    ///
    /// In-flight builds are not interrupted; their eventual writes land in
    /// the now-empty table and age out normally.
    pub fn clear(&self) {
        let dropped = self.entries.len();
        self.entries.clear();
        debug!(dropped, "key space cache cleared");
    }

    /// Re-read settings from the provider.
    ///
    /// Future builds and insertions use the new snapshot; existing entries
    /// keep the TTL captured when they were inserted. If the new maximum is
    /// smaller than the current size, excess entries are evicted LRU-first.
    ///
    /// # Errors
    ///
    /// Returns the provider's failure; the previous snapshot stays active.
    pub fn reload_config(&self) -> Result<(), KeySpaceError> {
        let fresh = self.provider.load()?;
        debug!(
            ttl_ms = fresh.ttl().as_millis() as u64,
            max_entries = fresh.max_cache_entries,
            "cache configuration reloaded"
        );
        let max = fresh.max_cache_entries;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        self.evict_over_capacity(max);
        Ok(())
    }

    /// Stop the background sweeper and drop all entries.
    ///
    /// The cache is unusable for lookups afterwards only by convention;
    /// calling it again is harmless.
    pub fn dispose(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.entries.clear();
    }

    fn config_snapshot(&self) -> EngineConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fresh-entry lookup; refreshes recency on a hit, drops expired
    /// entries.
    fn lookup(&self, root: &Path) -> Option<Arc<KeySpace>> {
        let mut expired = false;
        let found = self.entries.get_mut(root).and_then(|mut entry| {
            if entry.expires_at <= Instant::now() {
                expired = true;
                None
            } else {
                entry.last_accessed = Instant::now();
                Some(Arc::clone(&entry.key_space))
            }
        });
        if expired {
            self.entries.remove(root);
            trace!(root = %root.display(), "expired cache entry dropped on lookup");
        }
        found
    }

    fn insert(&self, root: PathBuf, key_space: Arc<KeySpace>, config: &EngineConfig) {
        let now = Instant::now();
        self.entries.insert(
            root,
            CacheEntry {
                key_space,
                inserted_at: now,
                expires_at: now + config.ttl(),
                last_accessed: now,
            },
        );
        self.evict_over_capacity(config.max_cache_entries);
    }

    fn evict_over_capacity(&self, max_entries: usize) {
        while self.entries.len() > max_entries {
            let oldest = self
                .entries
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().last_accessed))
                .min_by_key(|(_, accessed)| *accessed)
                .map(|(key, _)| key);
            let Some(key) = oldest else { break };
            self.entries.remove(&key);
            warn!(root = %key.display(), "evicted least recently used key space");
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let swept = before - self.entries.len();
        if swept > 0 {
            debug!(swept, "expired key spaces swept");
        }
    }

    fn sweep_interval(&self) -> Duration {
        (self.config_snapshot().ttl() / 3).max(MIN_SWEEP_INTERVAL)
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(cache) => cache.sweep_interval(),
                    None => return,
                };
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(cache) => cache.sweep_expired(),
                    None => return,
                }
            }
        });
        *self.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}

impl Drop for KeySpaceCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

/// Render a shared build failure identically for every waiter.
///
/// The fatal root-read case keeps its own variant so callers can still
/// match on it; everything else is wrapped.
fn shared_failure(root: &Path, err: &KeySpaceError) -> KeySpaceError {
    match err {
        KeySpaceError::RootMapUnreadable { path, reason } => KeySpaceError::RootMapUnreadable {
            path: path.clone(),
            reason: reason.clone(),
        },
        other => KeySpaceError::BuildFailed {
            root_map: root.to_path_buf(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticProvider;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn write_map(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, format!("<map>{body}</map>")).unwrap();
        path
    }

    fn cache_with(config: EngineConfig) -> (Arc<KeySpaceCache>, Arc<StaticProvider>) {
        let provider = Arc::new(StaticProvider::new(config));
        let cache = KeySpaceCache::new(provider.clone()).unwrap();
        (cache, provider)
    }

    #[tokio::test]
    async fn test_build_and_hit() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("t.dita"), "<topic/>").unwrap();
        let root = write_map(&dir, "root.ditamap", r#"<keydef keys="a" href="t.dita"/>"#);

        let (cache, _) = cache_with(EngineConfig::default());
        let first = cache.get_or_build(&root).await.unwrap();
        let second = cache.get_or_build(&root).await.unwrap();
        assert_eq!(first.build_time, second.build_time);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().cache_size, 1);
    }

    #[tokio::test]
    async fn test_concurrent_builds_share_build_time() {
        let dir = tempdir().unwrap();
        let root = write_map(&dir, "root.ditamap", r#"<keydef keys="a" href="t.dita"/>"#);
        let (cache, _) = cache_with(EngineConfig::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let root = root.clone();
                tokio::spawn(async move { cache.get_or_build(&root).await })
            })
            .collect();

        let mut build_times = Vec::new();
        for handle in handles {
            build_times.push(handle.await.unwrap().unwrap().build_time);
        }
        assert!(build_times.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.stats().cache_size, 1);
    }

    #[tokio::test]
    async fn test_size_never_exceeds_max_and_lru_evicts() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.max_cache_entries = 2;
        let (cache, _) = cache_with(config);

        let a = write_map(&dir, "a.ditamap", "");
        let b = write_map(&dir, "b.ditamap", "");
        let c = write_map(&dir, "c.ditamap", "");

        cache.get_or_build(&a).await.unwrap();
        cache.get_or_build(&b).await.unwrap();
        // Touch `a` so `b` is the LRU victim
        cache.get_or_build(&a).await.unwrap();
        cache.get_or_build(&c).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.cache_size, 2);
        assert!(stats.cache_size <= stats.max_size);
        let roots: Vec<_> = stats.entries.iter().map(|e| e.root_map.clone()).collect();
        assert!(roots.contains(&a));
        assert!(roots.contains(&c));
        assert!(!roots.contains(&b));
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_lookup() {
        let dir = tempdir().unwrap();
        let root = write_map(&dir, "root.ditamap", r#"<keydef keys="a" href="t.dita"/>"#);
        let mut config = EngineConfig::default();
        config.ttl_millis = Some(30);
        let (cache, _) = cache_with(config);

        let first = cache.get_or_build(&root).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = cache.get_or_build(&root).await.unwrap();
        assert_ne!(first.build_time, second.build_time);
    }

    #[tokio::test]
    async fn test_sweep_expired_removes_entries() {
        let dir = tempdir().unwrap();
        let root = write_map(&dir, "root.ditamap", "");
        let mut config = EngineConfig::default();
        config.ttl_millis = Some(10);
        let (cache, _) = cache_with(config);

        cache.get_or_build(&root).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.stats().cache_size, 1, "not swept before the pass runs");
        cache.sweep_expired();
        assert_eq!(cache.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let dir = tempdir().unwrap();
        let root = write_map(&dir, "root.ditamap", "");
        let (cache, _) = cache_with(EngineConfig::default());

        cache.get_or_build(&root).await.unwrap();
        assert_eq!(cache.stats().cache_size, 1);
        cache.clear();
        assert_eq!(cache.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn test_build_failure_propagates() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.ditamap");
        let (cache, _) = cache_with(EngineConfig::default());

        let err = cache.get_or_build(&missing).await.unwrap_err();
        assert!(matches!(err, KeySpaceError::RootMapUnreadable { .. }));
        assert_eq!(cache.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("late.ditamap");
        let (cache, _) = cache_with(EngineConfig::default());

        assert!(cache.get_or_build(&root).await.is_err());
        fs::write(&root, r#"<map><keydef keys="a" href="t.dita"/></map>"#).unwrap();
        let space = cache.get_or_build(&root).await.unwrap();
        assert!(space.get("a").is_some());
    }

    #[tokio::test]
    async fn test_reload_config_applies_new_limits() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.max_cache_entries = 3;
        let (cache, provider) = cache_with(config.clone());

        for name in ["a.ditamap", "b.ditamap", "c.ditamap"] {
            let root = write_map(&dir, name, "");
            cache.get_or_build(&root).await.unwrap();
        }
        assert_eq!(cache.stats().cache_size, 3);

        config.max_cache_entries = 1;
        provider.update(config);
        cache.reload_config().unwrap();
        assert_eq!(cache.stats().cache_size, 1);
        assert_eq!(cache.stats().max_size, 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (cache, _) = cache_with(EngineConfig::default());
        cache.dispose();
        cache.dispose();
        assert_eq!(cache.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn test_stats_entry_detail() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("t.dita"), "<topic/>").unwrap();
        let root = write_map(
            &dir,
            "root.ditamap",
            r#"<keydef keys="a" href="t.dita"/><keydef keys="b" href="t.dita"/>"#,
        );
        let (cache, _) = cache_with(EngineConfig::default());
        cache.get_or_build(&root).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.entries.len(), 1);
        assert_eq!(stats.entries[0].root_map, root);
        assert_eq!(stats.entries[0].key_count, 2);
    }
}
