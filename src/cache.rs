//! Cache - Request/Response Storage for One Named Cache
//!
//! Owns a private entry-store backend and an operation scheduler. Every
//! public operation funnels through the scheduler, so operations on one
//! cache are totally ordered while distinct caches stay concurrent.
//!
//! # Backend lifecycle
//!
//! `Uninitialized -> Open` (backend created by the first operation) or
//! `Uninitialized -> Closed` (creation failed); `Open -> Closed` on close.
//! Closed is absorbing: every later operation fails fast with a storage
//! error.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::body::{BodyHandle, BodySource};
use crate::error::{Error, Result};
use crate::fetch::{EntryMetadata, FetchRequest, FetchResponse, Headers};
use crate::quota::{notify_best_effort, QuotaTracker};
use crate::scheduler::OperationScheduler;
use crate::store::{DiskEntryStore, EntryStore, MemEntryStore, StoreEntry, Stream};

/// Which backend kind a cache creates on first use
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// In-memory entry store; contents do not survive the process
    Memory,
    /// Disk entry store rooted at the given directory
    Disk(PathBuf),
}

enum BackendState {
    Uninitialized,
    Open(Arc<dyn EntryStore>),
    Closed,
}

/// Result of a successful match
#[derive(Debug)]
pub struct MatchResult {
    /// Stored response metadata
    pub response: FetchResponse,
    /// Body handle; `None` for a zero-length body
    pub body: Option<BodyHandle>,
}

/// One item of a put batch
pub struct PutOperation {
    /// Request to store under
    pub request: FetchRequest,
    /// Response metadata to store
    pub response: FetchResponse,
    /// Body payload; `None` stores a bodyless response
    pub body: Option<Box<dyn BodySource>>,
}

/// A batch of homogeneous operations
///
/// The shape is enforced at construction: a batch is either exactly one
/// delete or a list of puts. Mixed batches are unrepresentable.
pub enum BatchOperation {
    /// Delete the entry for one request
    Delete(FetchRequest),
    /// Store one or more request/response pairs
    Puts(Vec<PutOperation>),
}

struct CacheInner {
    name: String,
    origin: String,
    kind: BackendKind,
    max_bytes: u64,
    quota: Arc<dyn QuotaTracker>,
    scheduler: OperationScheduler,
    state: Mutex<BackendState>,
}

/// A named collection of request/response entries
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Create a memory-backed cache
    ///
    /// Must be called from within a Tokio runtime (the cache spawns its
    /// scheduler worker), as must [`Cache::persistent`].
    pub fn memory(
        name: impl Into<String>,
        origin: impl Into<String>,
        max_bytes: u64,
        quota: Arc<dyn QuotaTracker>,
    ) -> Arc<Self> {
        Self::new(name, origin, BackendKind::Memory, max_bytes, quota)
    }

    /// Create a disk-backed cache rooted at `path`
    pub fn persistent(
        name: impl Into<String>,
        origin: impl Into<String>,
        path: PathBuf,
        max_bytes: u64,
        quota: Arc<dyn QuotaTracker>,
    ) -> Arc<Self> {
        Self::new(name, origin, BackendKind::Disk(path), max_bytes, quota)
    }

    fn new(
        name: impl Into<String>,
        origin: impl Into<String>,
        kind: BackendKind,
        max_bytes: u64,
        quota: Arc<dyn QuotaTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                origin: origin.into(),
                kind,
                max_bytes,
                quota,
                scheduler: OperationScheduler::new(),
                state: Mutex::new(BackendState::Uninitialized),
            }),
        })
    }

    /// The cache's name, unique within its `CacheStorage`
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Match a request against the stored entries
    ///
    /// `NotFound` when no entry exists for the URL or the stored response's
    /// Vary headers rule the request out.
    pub async fn match_request(&self, request: &FetchRequest) -> Result<MatchResult> {
        let inner = self.inner.clone();
        let request = request.clone();
        self.inner
            .scheduler
            .run(async move { match_impl(&inner, &request).await })
            .await
    }

    /// Run a batch of operations
    ///
    /// All items are submitted concurrently and all run to completion; the
    /// first failure's error is the one reported. Items that succeeded stay
    /// committed even when the batch as a whole reports a failure.
    pub async fn batch(&self, operation: BatchOperation) -> Result<()> {
        match operation {
            BatchOperation::Delete(request) => self.delete(&request).await,
            BatchOperation::Puts(puts) => {
                let results = join_all(puts.into_iter().map(|put| {
                    self.put(put.request, put.response, put.body)
                }))
                .await;
                results.into_iter().collect()
            }
        }
    }

    /// Store a response for a request, replacing any existing entry
    pub async fn put(
        &self,
        request: FetchRequest,
        response: FetchResponse,
        body: Option<Box<dyn BodySource>>,
    ) -> Result<()> {
        let inner = self.inner.clone();
        self.inner
            .scheduler
            .run(async move { put_impl(&inner, request, response, body).await })
            .await
    }

    /// Delete the entry for a request; `NotFound` if absent
    pub async fn delete(&self, request: &FetchRequest) -> Result<()> {
        let inner = self.inner.clone();
        let url = request.url.clone();
        self.inner
            .scheduler
            .run(async move {
                let store = ensure_open(&inner).await?;
                doom_entry(&inner, &store, &url).await
            })
            .await
    }

    /// Enumerate the stored requests
    ///
    /// Entries whose metadata fails to parse are doomed and excluded.
    pub async fn keys(&self) -> Result<Vec<FetchRequest>> {
        let inner = self.inner.clone();
        self.inner
            .scheduler
            .run(async move { keys_impl(&inner).await })
            .await
    }

    /// Close the cache, releasing its backend
    ///
    /// Every subsequent operation fails with a storage error. Closing an
    /// already-closed cache is a no-op.
    pub async fn close(&self) -> Result<()> {
        let inner = self.inner.clone();
        self.inner
            .scheduler
            .run(async move {
                let mut state = inner.state.lock();
                match *state {
                    BackendState::Closed => {
                        debug!(cache = %inner.name, "close on already-closed cache");
                    }
                    _ => {
                        *state = BackendState::Closed;
                        info!(cache = %inner.name, "cache closed");
                    }
                }
                Ok(())
            })
            .await
    }

    /// Bytes held in memory by this cache's backend (0 unless memory-backed)
    pub fn memory_backed_size(&self) -> u64 {
        match &*self.inner.state.lock() {
            BackendState::Open(store) => store.memory_backed_size(),
            _ => 0,
        }
    }
}

/// Resolve the backend, creating it on the first operation
///
/// Runs under the cache scheduler, so concurrent early callers queue behind
/// a single creation attempt.
async fn ensure_open(inner: &Arc<CacheInner>) -> Result<Arc<dyn EntryStore>> {
    {
        let state = inner.state.lock();
        match &*state {
            BackendState::Open(store) => return Ok(store.clone()),
            BackendState::Closed => return Err(Error::storage("cache is closed")),
            BackendState::Uninitialized => {}
        }
    }

    let created: Result<Arc<dyn EntryStore>> = match &inner.kind {
        BackendKind::Memory => Ok(Arc::new(MemEntryStore::new(inner.max_bytes))),
        BackendKind::Disk(path) => DiskEntryStore::open(path, inner.max_bytes)
            .await
            .map(|store| Arc::new(store) as Arc<dyn EntryStore>),
    };

    match created {
        Ok(store) => {
            *inner.state.lock() = BackendState::Open(store.clone());
            debug!(cache = %inner.name, "backend opened");
            Ok(store)
        }
        Err(e) => {
            // Creation failure is terminal for this instance.
            *inner.state.lock() = BackendState::Closed;
            warn!(cache = %inner.name, error = %e, "backend creation failed");
            Err(Error::storage(format!("backend creation failed: {e}")))
        }
    }
}

async fn read_metadata(entry: &Arc<dyn StoreEntry>) -> Result<EntryMetadata> {
    let size = entry.data_size(Stream::Headers) as usize;
    let raw = entry.read_data(Stream::Headers, 0, size).await?;
    if raw.len() < size {
        return Err(Error::storage("short read of entry metadata"));
    }
    EntryMetadata::from_bytes(&raw)
}

/// Vary matching per the fetch cache-match algorithm
///
/// Every header named by the stored response's `Vary` header must agree
/// between the incoming and the originally-stored request; `*` never
/// matches.
fn vary_matches(request: &Headers, cached_request: &Headers, response: &Headers) -> bool {
    let Some(vary) = response.get("vary") else {
        return true;
    };

    for name in vary.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if name == "*" {
            return false;
        }
        // Present in one but not the other: no match.
        if request.contains(name) != cached_request.contains(name) {
            return false;
        }
        if request.get(name) != cached_request.get(name) {
            return false;
        }
    }
    true
}

async fn match_impl(inner: &Arc<CacheInner>, request: &FetchRequest) -> Result<MatchResult> {
    let store = ensure_open(inner).await?;
    let entry = store.open_entry(&request.url).await?;
    let metadata = read_metadata(&entry).await?;

    if !vary_matches(
        &request.headers,
        &metadata.request.headers,
        &metadata.response.headers,
    ) {
        return Err(Error::NotFound);
    }

    let body = if entry.data_size(Stream::Body) == 0 {
        None
    } else {
        // The handle holds the entry alive for as long as it reads.
        Some(BodyHandle::new(entry))
    };

    Ok(MatchResult {
        response: metadata.response,
        body,
    })
}

async fn put_impl(
    inner: &Arc<CacheInner>,
    request: FetchRequest,
    response: FetchResponse,
    mut body: Option<Box<dyn BodySource>>,
) -> Result<()> {
    let store = ensure_open(inner).await?;

    // Replace semantics: at most one entry per URL, so any existing entry
    // goes first.
    match doom_entry(inner, &store, &request.url).await {
        Ok(()) | Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }

    let entry = store.create_entry(&request.url).await?;

    let metadata = EntryMetadata {
        request: request.clone(),
        response,
    };
    let serialized = metadata.to_bytes()?;
    if let Err(e) = entry
        .write_data(Stream::Headers, 0, &serialized, true)
        .await
    {
        let _ = entry.doom().await;
        return Err(Error::storage(format!("failed to write headers: {e}")));
    }

    if let Some(source) = body.as_mut() {
        let mut offset = 0u64;
        loop {
            let chunk = match source.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    let _ = entry.doom().await;
                    return Err(Error::storage(format!("body source failed: {e}")));
                }
            };
            if let Err(e) = entry.write_data(Stream::Body, offset, &chunk, false).await {
                let _ = entry.doom().await;
                return Err(Error::storage(format!("failed to write body: {e}")));
            }
            offset += chunk.len() as u64;
        }
    }

    let stored = entry.data_size(Stream::Headers) + entry.data_size(Stream::Body);
    notify_best_effort(inner.quota.as_ref(), &inner.origin, stored as i64);
    Ok(())
}

async fn doom_entry(inner: &Arc<CacheInner>, store: &Arc<dyn EntryStore>, url: &str) -> Result<()> {
    let entry = store.open_entry(url).await?;
    let held = entry.data_size(Stream::Headers) + entry.data_size(Stream::Body);
    notify_best_effort(inner.quota.as_ref(), &inner.origin, -(held as i64));
    entry.doom().await?;
    Ok(())
}

async fn keys_impl(inner: &Arc<CacheInner>) -> Result<Vec<FetchRequest>> {
    let store = ensure_open(inner).await?;

    // Collect every entry before touching their data; the store's iteration
    // contract does not allow interleaved reads.
    let entries = store.iterate().await?;

    let mut requests = Vec::with_capacity(entries.len());
    for entry in entries {
        match read_metadata(&entry).await {
            Ok(metadata) => requests.push(FetchRequest {
                url: entry.key().to_string(),
                method: metadata.request.method,
                headers: metadata.request.headers,
            }),
            Err(e) => {
                warn!(cache = %inner.name, key = %entry.key(), error = %e,
                    "dooming entry with corrupt metadata");
                let _ = entry.doom().await;
            }
        }
    }
    Ok(requests)
}

// =============================================================================
// Tests
// =============================================================================
