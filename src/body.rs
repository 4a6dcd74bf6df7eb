//! Body Streaming
//!
//! Pull-based byte source for writes and a lazily-reading handle for reads.
//! A [`BodyHandle`] owns an `Arc` to its store entry, so the entry stays
//! alive (even if doomed) for as long as the handle does.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::store::{StoreEntry, Stream};

/// Chunk size used when draining a body stream
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Sequential byte source consumed while writing a body into storage
#[async_trait]
pub trait BodySource: Send {
    /// Next chunk of the body, or `None` once exhausted
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Body source over a single in-memory buffer
pub struct BytesSource {
    data: Option<Bytes>,
}

impl BytesSource {
    /// Wrap a buffer as a one-chunk source
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }
}

#[async_trait]
impl BodySource for BytesSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.data.take().filter(|d| !d.is_empty()))
    }
}

/// Handle to a stored response body
///
/// Reads the entry's BODY stream lazily; nothing is buffered until the
/// caller asks for it.
pub struct BodyHandle {
    entry: Arc<dyn StoreEntry>,
}

impl std::fmt::Debug for BodyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyHandle").field("len", &self.len()).finish()
    }
}

impl BodyHandle {
    pub(crate) fn new(entry: Arc<dyn StoreEntry>) -> Self {
        Self { entry }
    }

    /// Total body length in bytes
    pub fn len(&self) -> u64 {
        self.entry.data_size(Stream::Body)
    }

    /// True for a zero-length body
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `max_len` bytes starting at `offset`
    pub async fn read_at(&self, offset: u64, max_len: usize) -> Result<Bytes> {
        self.entry.read_data(Stream::Body, offset, max_len).await
    }

    /// Drain the whole body into one buffer, reading in chunks
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let mut out = Vec::with_capacity(self.len() as usize);
        let mut offset = 0u64;
        loop {
            let chunk = self.read_at(offset, BODY_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

// =============================================================================
// Tests
// =============================================================================
