//! Disk-backed entry store
//!
//! One small meta file plus one file per data stream for every entry, all in
//! a single cache directory. File stems are the lowercase hex SHA-256 of the
//! entry key so arbitrary URLs are safe as path components.
//!
//! Dooming an entry deletes its meta file (the key disappears immediately)
//! and renames the stream files aside; live handles keep reading the renamed
//! files, which are removed when the last handle drops.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use super::{EntryStore, StoreEntry, Stream, STREAM_COUNT};
use crate::error::{Error, Result};

const META_SUFFIX: &str = "meta";
const STREAM_SUFFIXES: [&str; STREAM_COUNT] = ["s0", "s1"];

/// Contents of an entry's meta file
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
}

fn hashed_stem(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// State shared by the store and all of its entry handles
struct DiskStoreShared {
    dir: PathBuf,
    max_bytes: u64,
    total_bytes: AtomicU64,
    live: DashMap<String, Weak<DiskEntryData>>,
    doom_seq: AtomicU64,
}

/// Shared state of one on-disk entry
struct DiskEntryData {
    key: String,
    /// Stream file paths; rewritten when the entry is doomed
    stream_paths: Mutex<[PathBuf; STREAM_COUNT]>,
    sizes: Mutex<[u64; STREAM_COUNT]>,
    doomed: AtomicBool,
    shared: Arc<DiskStoreShared>,
}

impl Drop for DiskEntryData {
    fn drop(&mut self) {
        if self.doomed.load(Ordering::SeqCst) {
            for path in self.stream_paths.lock().iter() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Handle to an on-disk entry
pub struct DiskEntry {
    data: Arc<DiskEntryData>,
}

#[async_trait]
impl StoreEntry for DiskEntry {
    fn key(&self) -> &str {
        &self.data.key
    }

    fn data_size(&self, stream: Stream) -> u64 {
        self.data.sizes.lock()[stream.index()]
    }

    async fn read_data(&self, stream: Stream, offset: u64, max_len: usize) -> Result<Bytes> {
        let path = self.data.stream_paths.lock()[stream.index()].clone();
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            // Never-written stream: zero length.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Bytes::new()),
            Err(e) => return Err(e.into()),
        };

        let mut file = file;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; max_len];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn write_data(
        &self,
        stream: Stream,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        if self.data.doomed.load(Ordering::SeqCst) {
            return Err(Error::storage("entry is doomed"));
        }

        let end = offset + data.len() as u64;
        let old_size = self.data.sizes.lock()[stream.index()];
        let new_size = if truncate { end } else { end.max(old_size) };

        if new_size > old_size {
            let shared = &self.data.shared;
            let grown = new_size - old_size;
            if shared.total_bytes.load(Ordering::SeqCst) + grown > shared.max_bytes {
                return Err(Error::storage("cache backend is full"));
            }
        }

        let path = self.data.stream_paths.lock()[stream.index()].clone();
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        if truncate {
            file.set_len(end).await?;
        }
        file.flush().await?;

        self.data.sizes.lock()[stream.index()] = new_size;
        let shared = &self.data.shared;
        if new_size >= old_size {
            shared
                .total_bytes
                .fetch_add(new_size - old_size, Ordering::SeqCst);
        } else {
            shared
                .total_bytes
                .fetch_sub(old_size - new_size, Ordering::SeqCst);
        }
        Ok(data.len())
    }

    async fn doom(&self) -> Result<()> {
        if self.data.doomed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let shared = &self.data.shared;

        shared.live.remove_if(&self.data.key, |_, live| {
            live.upgrade()
                .map(|data| Arc::ptr_eq(&data, &self.data))
                .unwrap_or(true)
        });

        let stem = hashed_stem(&self.data.key);
        let meta_path = shared.dir.join(format!("{stem}.{META_SUFFIX}"));
        // The key must disappear before the data files do.
        match tokio::fs::remove_file(&meta_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let seq = shared.doom_seq.fetch_add(1, Ordering::SeqCst);
        let mut paths = self.data.stream_paths.lock().clone();
        for (i, suffix) in STREAM_SUFFIXES.iter().enumerate() {
            let doomed_path = shared.dir.join(format!("{stem}.doomed-{seq}.{suffix}"));
            match tokio::fs::rename(&paths[i], &doomed_path).await {
                Ok(()) => paths[i] = doomed_path,
                // Never-written stream has no file to move.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(key = %self.data.key, error = %e, "failed to move doomed stream"),
            }
        }
        *self.data.stream_paths.lock() = paths;

        let sizes = self.data.sizes.lock();
        let held: u64 = sizes.iter().sum();
        shared.total_bytes.fetch_sub(held, Ordering::SeqCst);
        Ok(())
    }
}

/// Disk-backed entry store rooted at one cache directory
pub struct DiskEntryStore {
    shared: Arc<DiskStoreShared>,
}

impl DiskEntryStore {
    /// Open (creating if needed) the store at `dir` with a total size cap
    pub async fn open(dir: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        // Seed the size accounting from what is already on disk.
        let mut total = 0u64;
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = listing.next_entry().await? {
            let name = item.file_name();
            let name = name.to_string_lossy();
            // Doomed stream files from a process that died before its
            // handles dropped; their entries are gone, so sweep them.
            if name.contains(".doomed-") {
                let _ = tokio::fs::remove_file(item.path()).await;
                continue;
            }
            if STREAM_SUFFIXES.iter().any(|s| name.ends_with(&format!(".{s}"))) {
                total += item.metadata().await?.len();
            }
        }

        Ok(Self {
            shared: Arc::new(DiskStoreShared {
                dir,
                max_bytes,
                total_bytes: AtomicU64::new(total),
                live: DashMap::new(),
                doom_seq: AtomicU64::new(0),
            }),
        })
    }

    fn paths_for(&self, stem: &str) -> (PathBuf, [PathBuf; STREAM_COUNT]) {
        let meta = self.shared.dir.join(format!("{stem}.{META_SUFFIX}"));
        let streams = STREAM_SUFFIXES.map(|s| self.shared.dir.join(format!("{stem}.{s}")));
        (meta, streams)
    }

    fn live_entry(&self, key: &str) -> Option<Arc<DiskEntryData>> {
        self.shared.live.get(key).and_then(|weak| weak.upgrade())
    }

    fn register(&self, data: &Arc<DiskEntryData>) {
        self.shared
            .live
            .insert(data.key.clone(), Arc::downgrade(data));
    }
}

#[async_trait]
impl EntryStore for DiskEntryStore {
    async fn create_entry(&self, key: &str) -> Result<Arc<dyn StoreEntry>> {
        if self.live_entry(key).is_some() {
            return Err(Error::Exists);
        }

        let stem = hashed_stem(key);
        let (meta_path, stream_paths) = self.paths_for(&stem);
        if tokio::fs::try_exists(&meta_path).await? {
            return Err(Error::Exists);
        }

        let meta = serde_json::to_vec(&EntryMeta {
            key: key.to_string(),
        })
        .map_err(|e| Error::storage(e.to_string()))?;
        tokio::fs::write(&meta_path, meta).await?;

        let data = Arc::new(DiskEntryData {
            key: key.to_string(),
            stream_paths: Mutex::new(stream_paths),
            sizes: Mutex::new([0; STREAM_COUNT]),
            doomed: AtomicBool::new(false),
            shared: self.shared.clone(),
        });
        self.register(&data);
        Ok(Arc::new(DiskEntry { data }))
    }

    async fn open_entry(&self, key: &str) -> Result<Arc<dyn StoreEntry>> {
        if let Some(data) = self.live_entry(key) {
            return Ok(Arc::new(DiskEntry { data }));
        }

        let stem = hashed_stem(key);
        let (meta_path, stream_paths) = self.paths_for(&stem);
        let raw = match tokio::fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };
        let meta: EntryMeta =
            serde_json::from_slice(&raw).map_err(|e| Error::storage(e.to_string()))?;
        if meta.key != key {
            return Err(Error::storage("entry meta key mismatch"));
        }

        let mut sizes = [0u64; STREAM_COUNT];
        for (i, path) in stream_paths.iter().enumerate() {
            sizes[i] = match tokio::fs::metadata(path).await {
                Ok(stat) => stat.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
        }

        let data = Arc::new(DiskEntryData {
            key: key.to_string(),
            stream_paths: Mutex::new(stream_paths),
            sizes: Mutex::new(sizes),
            doomed: AtomicBool::new(false),
            shared: self.shared.clone(),
        });
        self.register(&data);
        Ok(Arc::new(DiskEntry { data }))
    }

    async fn iterate(&self) -> Result<Vec<Arc<dyn StoreEntry>>> {
        let mut keys = Vec::new();
        let mut listing = tokio::fs::read_dir(&self.shared.dir).await?;
        while let Some(item) = listing.next_entry().await? {
            let name = item.file_name();
            let name = name.to_string_lossy().to_string();
            if !name.ends_with(&format!(".{META_SUFFIX}")) {
                continue;
            }
            match tokio::fs::read(item.path()).await {
                Ok(raw) => match serde_json::from_slice::<EntryMeta>(&raw) {
                    Ok(meta) => keys.push(meta.key),
                    Err(e) => warn!(file = %name, error = %e, "skipping unreadable entry meta"),
                },
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable entry meta"),
            }
        }

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match self.open_entry(&key).await {
                Ok(entry) => entries.push(entry),
                // Doomed between listing and open.
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }
}

// =============================================================================
// Tests
// =============================================================================
