//! Content store: the payload every client receives.
//!
//! The payload is loaded once, split into fixed-capacity chunks and never
//! mutated afterwards. Sessions never touch the shared chunks directly;
//! each one takes a deep copy through `clone_chunks` so cursor state stays
//! private to the connection.

use crate::error::StorageError;
use crate::runtime::{Chunk, WriteChunks};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::info;

/// End-of-payload marker appended to every payload.
pub const MARKER: &[u8; 2] = b"\r\n";

/// Immutable, chunked payload.
#[derive(Debug)]
pub struct ContentPayload {
    chunks: Vec<Bytes>,
    chunk_capacity: usize,
    total_len: usize,
}

impl ContentPayload {
    /// Split `content` plus the trailing marker into chunks of
    /// `chunk_capacity` bytes.
    ///
    /// The last chunk holds `total_len % chunk_capacity` bytes, or a full
    /// `chunk_capacity` when that remainder is zero.
    pub fn from_content(content: &[u8], chunk_capacity: usize) -> Self {
        debug_assert!(chunk_capacity > 0);

        let mut data = Vec::with_capacity(content.len() + MARKER.len());
        data.extend_from_slice(content);
        data.extend_from_slice(MARKER);
        let total_len = data.len();

        let data = Bytes::from(data);
        let count = total_len.div_ceil(chunk_capacity);
        let chunks = (0..count)
            .map(|i| {
                let start = i * chunk_capacity;
                let end = (start + chunk_capacity).min(total_len);
                data.slice(start..end)
            })
            .collect();

        Self {
            chunks,
            chunk_capacity,
            total_len,
        }
    }

    /// Total bytes, marker included.
    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Deep copy of every chunk with fresh cursors.
    pub fn clone_chunks(&self) -> WriteChunks {
        let chunks = self.chunks.iter().map(|c| Chunk::copy_from(c)).collect();
        WriteChunks::from_chunks(chunks, self.chunk_capacity)
    }
}

/// Lazily loaded, process-wide payload source.
pub struct ContentStore {
    source: Option<PathBuf>,
    chunk_capacity: usize,
    payload: OnceLock<ContentPayload>,
    init: Mutex<()>,
}

impl ContentStore {
    /// A store that reads `path` on first use.
    pub fn new(path: impl Into<PathBuf>, chunk_capacity: usize) -> Result<Self, StorageError> {
        if chunk_capacity == 0 {
            return Err(StorageError::ZeroChunkSize);
        }
        Ok(Self {
            source: Some(path.into()),
            chunk_capacity,
            payload: OnceLock::new(),
            init: Mutex::new(()),
        })
    }

    /// A store that is already loaded with `content`.
    #[cfg(test)]
    pub fn from_bytes(content: &[u8], chunk_capacity: usize) -> Result<Self, StorageError> {
        if chunk_capacity == 0 {
            return Err(StorageError::ZeroChunkSize);
        }
        Ok(Self {
            source: None,
            chunk_capacity,
            payload: OnceLock::from(ContentPayload::from_content(content, chunk_capacity)),
            init: Mutex::new(()),
        })
    }

    /// Load the payload, reading the source only on the first call.
    ///
    /// Concurrent first callers serialize on `init`; the winner reads the
    /// source and everyone else observes its result. A failed read leaves
    /// the store unloaded.
    pub fn load(&self) -> Result<&ContentPayload, StorageError> {
        if let Some(payload) = self.payload.get() {
            return Ok(payload);
        }

        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(payload) = self.payload.get() {
            return Ok(payload);
        }

        let content = match &self.source {
            Some(path) => read_source(path)?,
            None => Vec::new(),
        };
        let payload = ContentPayload::from_content(&content, self.chunk_capacity);

        info!(
            source = ?self.source,
            bytes = payload.len(),
            chunks = payload.chunks().len(),
            chunk_capacity = self.chunk_capacity,
            "Content loaded"
        );

        Ok(self.payload.get_or_init(|| payload))
    }

    /// Deep copy of the payload chunks for one session.
    pub fn clone_chunks(&self) -> Result<WriteChunks, StorageError> {
        Ok(self.load()?.clone_chunks())
    }

    /// Total payload length, marker included.
    #[cfg(test)]
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.load()?.len())
    }
}

fn read_source(path: &Path) -> Result<Vec<u8>, StorageError> {
    std::fs::read(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })
}
