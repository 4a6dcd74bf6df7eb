//! In-memory entry store
//!
//! Backend for memory-only caches and tests. Entries live in a `DashMap`;
//! dooming removes the key while outstanding handles keep the data alive
//! through their `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{EntryStore, StoreEntry, Stream, STREAM_COUNT};
use crate::error::{Error, Result};

/// Shared state of one in-memory entry
struct MemEntryData {
    key: String,
    streams: Mutex<[Vec<u8>; STREAM_COUNT]>,
    doomed: AtomicBool,
}

/// Handle to an in-memory entry
pub struct MemEntry {
    data: Arc<MemEntryData>,
    store: Arc<DashMap<String, Arc<MemEntryData>>>,
    max_bytes: u64,
}

fn total_bytes(entries: &DashMap<String, Arc<MemEntryData>>) -> u64 {
    entries
        .iter()
        .map(|entry| {
            let streams = entry.value().streams.lock();
            streams.iter().map(|s| s.len() as u64).sum::<u64>()
        })
        .sum()
}

#[async_trait]
impl StoreEntry for MemEntry {
    fn key(&self) -> &str {
        &self.data.key
    }

    fn data_size(&self, stream: Stream) -> u64 {
        self.data.streams.lock()[stream.index()].len() as u64
    }

    async fn read_data(&self, stream: Stream, offset: u64, max_len: usize) -> Result<Bytes> {
        let streams = self.data.streams.lock();
        let data = &streams[stream.index()];
        let start = (offset as usize).min(data.len());
        let end = (start + max_len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write_data(
        &self,
        stream: Stream,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        if self.data.doomed.load(Ordering::SeqCst) {
            return Err(Error::storage("write to doomed entry"));
        }

        // Total before taking our own stream lock; the sum locks each
        // entry's streams briefly, including ours.
        let total = total_bytes(&self.store);

        let mut streams = self.data.streams.lock();
        let buf = &mut streams[stream.index()];
        let offset = offset as usize;

        let end = offset + data.len();
        let grown = end.saturating_sub(buf.len()) as u64;
        if grown > 0 && total + grown > self.max_bytes {
            return Err(Error::storage("memory store is full"));
        }

        if buf.len() < offset {
            buf.resize(offset, 0);
        }
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        if truncate {
            buf.truncate(end);
        }
        Ok(data.len())
    }

    async fn doom(&self) -> Result<()> {
        if self.data.doomed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Remove only if the map still points at this entry; a replacement
        // created after our open must not be evicted.
        self.store
            .remove_if(&self.data.key, |_, live| Arc::ptr_eq(live, &self.data));
        Ok(())
    }
}

/// In-memory entry store
pub struct MemEntryStore {
    entries: Arc<DashMap<String, Arc<MemEntryData>>>,
    max_bytes: u64,
}

impl MemEntryStore {
    /// Create an empty store with the given total size cap
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_bytes,
        }
    }

    fn handle(&self, data: Arc<MemEntryData>) -> Arc<dyn StoreEntry> {
        Arc::new(MemEntry {
            data,
            store: self.entries.clone(),
            max_bytes: self.max_bytes,
        })
    }

    fn total_bytes(&self) -> u64 {
        total_bytes(&self.entries)
    }
}

#[async_trait]
impl EntryStore for MemEntryStore {
    async fn create_entry(&self, key: &str) -> Result<Arc<dyn StoreEntry>> {
        if self.total_bytes() >= self.max_bytes {
            return Err(Error::storage("memory store is full"));
        }

        let data = Arc::new(MemEntryData {
            key: key.to_string(),
            streams: Mutex::new(Default::default()),
            doomed: AtomicBool::new(false),
        });

        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(Error::Exists),
            Entry::Vacant(slot) => {
                slot.insert(data.clone());
                Ok(self.handle(data))
            }
        }
    }

    async fn open_entry(&self, key: &str) -> Result<Arc<dyn StoreEntry>> {
        let data = self
            .entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotFound)?;
        Ok(self.handle(data))
    }

    async fn iterate(&self) -> Result<Vec<Arc<dyn StoreEntry>>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| self.handle(entry.value().clone()))
            .collect())
    }

    fn memory_backed_size(&self) -> u64 {
        self.total_bytes()
    }
}

// =============================================================================
// Tests
// =============================================================================
