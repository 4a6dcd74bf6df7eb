//! CacheStorage - Directory of Named Caches for One Origin
//!
//! Owns the ordered set of cache names, the durable index, and a single
//! operation scheduler. The index is loaded lazily by the first operation;
//! everything submitted before that queues behind the init task on the same
//! scheduler.
//!
//! Live caches are tracked by weak reference - a cache can be unloaded from
//! memory while still existing on disk and in the index. In memory-only
//! mode a strong retainer per cache keeps contents alive until deletion,
//! since a memory cache freed early would silently lose its entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::cache::{Cache, MatchResult};
use crate::error::{Error, Result};
use crate::fetch::FetchRequest;
use crate::index::CacheIndex;
use crate::quota::{NoopQuota, QuotaTracker};
use crate::scheduler::OperationScheduler;

/// Default per-cache backend size cap (512 MiB)
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 512 * 1024 * 1024;

/// Configuration for one origin's cache storage
#[derive(Debug, Clone)]
pub struct CacheStorageConfig {
    /// Origin this storage belongs to
    pub origin: String,
    /// Storage root for persistent mode; `None` selects memory-only mode
    pub root: Option<PathBuf>,
    /// Size cap passed to each cache's backend
    pub max_cache_bytes: u64,
}

impl Default for CacheStorageConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost".to_string(),
            root: None,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
        }
    }
}

#[derive(Default)]
struct StorageState {
    initialized: bool,
    initializing: bool,
    /// Enumeration order; preserved across restarts via the index
    ordered_names: Vec<String>,
    /// Weak handles; key set matches `ordered_names` once initialized
    cache_map: HashMap<String, Weak<Cache>>,
    /// Memory-only mode: strong refs keeping cache contents alive
    retained: HashMap<String, Arc<Cache>>,
}

struct StorageInner {
    config: CacheStorageConfig,
    quota: Arc<dyn QuotaTracker>,
    index: CacheIndex,
    scheduler: OperationScheduler,
    state: Mutex<StorageState>,
}

/// The per-origin registry of named caches plus its durable index
pub struct CacheStorage {
    inner: Arc<StorageInner>,
}

impl CacheStorage {
    /// Create cache storage for one origin
    ///
    /// Must be called from within a Tokio runtime; the storage spawns its
    /// scheduler worker immediately.
    pub fn new(config: CacheStorageConfig, quota: Arc<dyn QuotaTracker>) -> Self {
        let index = CacheIndex::new(config.origin.clone(), config.root.clone());
        Self {
            inner: Arc::new(StorageInner {
                config,
                quota,
                index,
                scheduler: OperationScheduler::new(),
                state: Mutex::new(StorageState::default()),
            }),
        }
    }

    /// Memory-only storage with default limits (for testing)
    pub fn in_memory(origin: impl Into<String>) -> Self {
        Self::new(
            CacheStorageConfig {
                origin: origin.into(),
                ..Default::default()
            },
            Arc::new(NoopQuota),
        )
    }

    /// The origin this storage belongs to
    pub fn origin(&self) -> &str {
        &self.inner.config.origin
    }

    /// Open the named cache, creating it if it does not exist
    ///
    /// Creation appends the name to the enumeration order and persists the
    /// index (best-effort).
    pub async fn open_cache(&self, name: impl Into<String>) -> Result<Arc<Cache>> {
        self.lazy_init();
        let inner = self.inner.clone();
        let name = name.into();
        self.inner
            .scheduler
            .run(async move { open_cache_impl(&inner, name).await })
            .await
    }

    /// True if a cache with this name exists
    pub async fn has_cache(&self, name: impl Into<String>) -> Result<bool> {
        self.lazy_init();
        let inner = self.inner.clone();
        let name = name.into();
        self.inner
            .scheduler
            .run(async move { Ok(inner.state.lock().cache_map.contains_key(&name)) })
            .await
    }

    /// Delete the named cache and its stored entries
    ///
    /// `NotFound` if the name is absent. Completes only after the cache is
    /// closed, the index rewritten, and the backend storage cleaned up.
    pub async fn delete_cache(&self, name: impl Into<String>) -> Result<()> {
        self.lazy_init();
        let inner = self.inner.clone();
        let name = name.into();
        self.inner
            .scheduler
            .run(async move { delete_cache_impl(&inner, name).await })
            .await
    }

    /// Cache names in creation order
    pub async fn enumerate_caches(&self) -> Result<Vec<String>> {
        self.lazy_init();
        let inner = self.inner.clone();
        self.inner
            .scheduler
            .run(async move { Ok(inner.state.lock().ordered_names.clone()) })
            .await
    }

    /// Match a request against one named cache
    pub async fn match_cache(
        &self,
        name: impl Into<String>,
        request: &FetchRequest,
    ) -> Result<MatchResult> {
        self.lazy_init();
        let inner = self.inner.clone();
        let name = name.into();
        let request = request.clone();
        self.inner
            .scheduler
            .run(async move {
                let cache = get_loaded_cache(&inner, &name).ok_or(Error::NotFound)?;
                // Hold the Arc for the whole match so the cache stays open.
                cache.match_request(&request).await
            })
            .await
    }

    /// Match a request against every cache, in enumeration order
    ///
    /// All caches are queried concurrently and every branch runs to
    /// completion; exactly one result is delivered - the first hit, or
    /// `NotFound` when every cache misses.
    pub async fn match_all_caches(&self, request: &FetchRequest) -> Result<MatchResult> {
        self.lazy_init();
        let inner = self.inner.clone();
        let request = request.clone();
        self.inner
            .scheduler
            .run(async move { match_all_impl(&inner, request).await })
            .await
    }

    /// Close every currently-loaded cache
    ///
    /// Caches known only by name (never opened in memory) are skipped. A
    /// no-op if the index was never loaded.
    pub async fn close_all_caches(&self) -> Result<()> {
        if !self.inner.state.lock().initialized {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner
            .scheduler
            .run(async move {
                let live: Vec<Arc<Cache>> = {
                    let state = inner.state.lock();
                    state
                        .cache_map
                        .values()
                        .filter_map(Weak::upgrade)
                        .collect()
                };
                join_all(live.iter().map(|cache| cache.close())).await;
                Ok(())
            })
            .await
    }

    /// Sum of in-memory payload bytes across loaded caches
    ///
    /// Always 0 in persistent mode.
    pub fn memory_backed_size(&self) -> u64 {
        if self.inner.config.root.is_some() {
            return 0;
        }
        let state = self.inner.state.lock();
        if !state.initialized {
            return 0;
        }
        state
            .cache_map
            .values()
            .filter_map(Weak::upgrade)
            .map(|cache| cache.memory_backed_size())
            .sum()
    }

    /// Pending operations on this storage's scheduler (diagnostics)
    pub fn pending_operations(&self) -> usize {
        self.inner.scheduler.pending_operations()
    }

    /// Schedule the one-time index load if it has not run yet
    ///
    /// Operations submitted afterwards queue behind the init task by virtue
    /// of sharing the scheduler.
    fn lazy_init(&self) {
        let mut state = self.inner.state.lock();
        if state.initialized || state.initializing {
            return;
        }
        state.initializing = true;

        // Enqueued under the same lock that sets the flag. A caller that
        // observes `initializing` has therefore already lost the race to
        // this send, so its own operation lands behind the init task.
        let inner = self.inner.clone();
        self.inner.scheduler.schedule(async move {
            let names = match inner.index.load().await {
                Ok(names) => names,
                Err(e) => {
                    warn!(origin = %inner.config.origin, error = %e, "index load failed");
                    Vec::new()
                }
            };

            let mut state = inner.state.lock();
            for name in names {
                state.cache_map.insert(name.clone(), Weak::new());
                state.ordered_names.push(name);
            }
            state.initializing = false;
            state.initialized = true;
            info!(origin = %inner.config.origin, caches = state.ordered_names.len(),
                "cache storage initialized");
        });
    }
}

/// Directory name for a cache: lowercase hex hash of its name, so arbitrary
/// name strings are safe as path components
fn cache_dir_name(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

fn cache_path(root: &Path, name: &str) -> PathBuf {
    root.join(cache_dir_name(name))
}

/// Build a cache handle for `name` without touching its backend
fn create_cache_handle(inner: &Arc<StorageInner>, name: &str) -> Arc<Cache> {
    match &inner.config.root {
        Some(root) => Cache::persistent(
            name,
            inner.config.origin.clone(),
            cache_path(root, name),
            inner.config.max_cache_bytes,
            inner.quota.clone(),
        ),
        None => Cache::memory(
            name,
            inner.config.origin.clone(),
            inner.config.max_cache_bytes,
            inner.quota.clone(),
        ),
    }
}

/// Resolve a known name to a live cache, reloading the handle if needed
///
/// `None` if the name is not in the map. At most one live instance per name:
/// the weak slot is refreshed whenever a new handle is created.
fn get_loaded_cache(inner: &Arc<StorageInner>, name: &str) -> Option<Arc<Cache>> {
    let mut state = inner.state.lock();
    let slot = state.cache_map.get(name)?;
    if let Some(cache) = slot.upgrade() {
        return Some(cache);
    }

    let cache = create_cache_handle(inner, name);
    state
        .cache_map
        .insert(name.to_string(), Arc::downgrade(&cache));
    Some(cache)
}

async fn open_cache_impl(inner: &Arc<StorageInner>, name: String) -> Result<Arc<Cache>> {
    if let Some(cache) = get_loaded_cache(inner, &name) {
        return Ok(cache);
    }

    // Brand-new cache. Wipe any stale directory left behind by an earlier
    // deletion that did not finish its cleanup.
    if let Some(root) = &inner.config.root {
        let path = cache_path(root, &name);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::storage(format!("failed to create cache directory: {e}")))?;
    }

    let cache = create_cache_handle(inner, &name);
    let names = {
        let mut state = inner.state.lock();
        state
            .cache_map
            .insert(name.clone(), Arc::downgrade(&cache));
        if inner.config.root.is_none() {
            state.retained.insert(name.clone(), cache.clone());
        }
        state.ordered_names.push(name.clone());
        state.ordered_names.clone()
    };

    // Index persistence is best-effort; the cache itself is already usable.
    if let Err(e) = inner.index.write(&names).await {
        warn!(origin = %inner.config.origin, cache = %name, error = %e, "index write failed");
    }
    info!(origin = %inner.config.origin, cache = %name, "cache created");
    Ok(cache)
}

async fn delete_cache_impl(inner: &Arc<StorageInner>, name: String) -> Result<()> {
    let (live, names) = {
        let mut state = inner.state.lock();
        if !state.cache_map.contains_key(&name) {
            return Err(Error::NotFound);
        }
        let weak = state.cache_map.remove(&name).unwrap_or_default();
        let retained = state.retained.remove(&name);
        state.ordered_names.retain(|n| n != &name);
        (weak.upgrade().or(retained), state.ordered_names.clone())
    };

    if let Err(e) = inner.index.write(&names).await {
        warn!(origin = %inner.config.origin, cache = %name, error = %e, "index write failed");
    }

    // Wait for the cache to close before removing its storage.
    if let Some(cache) = &live {
        cache.close().await?;
    }

    if let Some(root) = &inner.config.root {
        let path = cache_path(root, &name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(origin = %inner.config.origin, cache = %name, error = %e,
                    "failed to remove cache directory");
            }
        }
    }

    info!(origin = %inner.config.origin, cache = %name, "cache deleted");
    Ok(())
}

async fn match_all_impl(inner: &Arc<StorageInner>, request: FetchRequest) -> Result<MatchResult> {
    let caches: Vec<Arc<Cache>> = {
        let names = inner.state.lock().ordered_names.clone();
        names
            .iter()
            .filter_map(|name| get_loaded_cache(inner, name))
            .collect()
    };

    // Fan out concurrently; the join collects every branch before one
    // result is chosen, so no branch is cancelled mid-operation.
    let results = join_all(caches.iter().map(|cache| cache.match_request(&request))).await;

    for result in results {
        match result {
            Err(Error::NotFound) => continue,
            other => return other,
        }
    }
    Err(Error::NotFound)
}

// =============================================================================
// Tests
// =============================================================================
