//! fetchcache - Fetch/Service-Worker-Style Response Cache
//!
//! A persistent response cache: a per-origin [`CacheStorage`] owns an
//! ordered collection of named [`Cache`]s, each storing request/response
//! pairs keyed by URL in a backing entry store. Bodies are streamed into
//! storage and read back lazily; the cache-name index survives restarts via
//! an atomically-replaced index file.
//!
//! # Architecture
//!
//! ```text
//! CacheStorage (one per origin)
//!   ├── OperationScheduler      FIFO, one operation in flight
//!   ├── CacheIndex              index.txt, temp-file + atomic rename
//!   └── named Caches (weak map)
//!         └── Cache
//!               ├── OperationScheduler
//!               └── EntryStore  (memory or disk)
//!                     └── entry = HEADERS stream + BODY stream
//! ```
//!
//! Operations on one `CacheStorage` or one `Cache` are totally ordered
//! through that owner's scheduler; operations on distinct caches run
//! concurrently.
//!
//! # Modules
//!
//! - [`body`] - body sources and lazily-reading body handles
//! - [`cache`] - a single named cache: match, put, delete, keys
//! - [`error`] - error types
//! - [`fetch`] - request/response data model
//! - [`index`] - durable cache-name index
//! - [`quota`] - fire-and-forget storage accounting hook
//! - [`scheduler`] - per-owner FIFO operation queue
//! - [`storage`] - the per-origin directory of caches
//! - [`store`] - the keyed two-stream entry store

pub mod body;
pub mod cache;
pub mod error;
pub mod fetch;
pub mod index;
pub mod quota;
pub mod scheduler;
pub mod storage;
pub mod store;

// Re-export commonly used types
pub use body::{BodyHandle, BodySource, BytesSource};
pub use cache::{BatchOperation, Cache, MatchResult, PutOperation};
pub use error::{Error, Result};
pub use fetch::{FetchRequest, FetchResponse, Headers, ResponseType};
pub use quota::{NoopQuota, QuotaTracker};
pub use storage::{CacheStorage, CacheStorageConfig, DEFAULT_MAX_CACHE_BYTES};
