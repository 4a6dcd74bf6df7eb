//! Entry Store
//!
//! The keyed data-stream storage engine the cache layer is built on. Each
//! entry is addressed by a key (the request URL) and carries two independent
//! data streams: HEADERS (serialized request/response metadata) and BODY
//! (the raw payload).
//!
//! # Design
//!
//! - Pluggable backend behind the [`EntryStore`] trait (memory or disk)
//! - Entry handles are `Arc`s; a doomed entry stays readable for as long as
//!   a handle to it is alive
//! - Enumeration collects all entries up front; interleaving iteration with
//!   reads of other entries is not part of the contract

mod disk;
mod memory;

pub use disk::DiskEntryStore;
pub use memory::MemEntryStore;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// The data streams every entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Serialized request + response metadata
    Headers,
    /// Raw response payload (may be zero length)
    Body,
}

impl Stream {
    /// Stable index of the stream within an entry
    pub fn index(self) -> usize {
        match self {
            Stream::Headers => 0,
            Stream::Body => 1,
        }
    }
}

/// Number of data streams per entry
pub const STREAM_COUNT: usize = 2;

impl std::fmt::Debug for dyn StoreEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEntry").field("key", &self.key()).finish()
    }
}

/// One keyed record in the store
#[async_trait]
pub trait StoreEntry: Send + Sync {
    /// The entry's key (the request URL at the cache layer)
    fn key(&self) -> &str;

    /// Current size of a data stream in bytes
    fn data_size(&self, stream: Stream) -> u64;

    /// Read up to `max_len` bytes from a stream at `offset`
    ///
    /// Returns fewer bytes (possibly zero) at end of stream.
    async fn read_data(&self, stream: Stream, offset: u64, max_len: usize) -> Result<Bytes>;

    /// Write `data` into a stream at `offset`
    ///
    /// With `truncate`, the stream is cut to exactly `offset + data.len()`
    /// bytes. Returns the number of bytes written.
    async fn write_data(&self, stream: Stream, offset: u64, data: &[u8], truncate: bool)
        -> Result<usize>;

    /// Mark the entry for deletion
    ///
    /// The key becomes unavailable immediately; live handles keep the data
    /// readable until dropped.
    async fn doom(&self) -> Result<()>;
}

/// A keyed store of two-stream entries
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Create a new entry; fails with `Exists` if the key is taken
    async fn create_entry(&self, key: &str) -> Result<Arc<dyn StoreEntry>>;

    /// Open an existing entry; fails with `NotFound` if absent
    async fn open_entry(&self, key: &str) -> Result<Arc<dyn StoreEntry>>;

    /// Open every entry in the store
    async fn iterate(&self) -> Result<Vec<Arc<dyn StoreEntry>>>;

    /// Total bytes held in memory (0 for disk-backed stores)
    fn memory_backed_size(&self) -> u64 {
        0
    }
}
