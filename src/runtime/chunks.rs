//! Cursor-bearing chunk sequences for resumable scatter-gather writes.
//!
//! A `WriteChunks` is one session's private copy of the payload. Each
//! `Chunk` carries its own read cursor, so a partial write only has to
//! advance cursors; the bytes themselves never move.
//!
//! ## Resumption
//!
//! Every chunk except the last has the same capacity, so the first chunk
//! that still holds unsent bytes is `written / chunk_capacity`. The final
//! chunk is never zero-length (a payload that is an exact multiple of the
//! capacity ends in a full chunk), which keeps that division in range.

use bytes::Buf;
use std::io::IoSlice;

/// One fixed-capacity segment with a read cursor.
#[derive(Debug, Clone)]
pub struct Chunk {
    data: Box<[u8]>,
    pos: usize,
}

impl Chunk {
    /// Deep-copy `src` into a new chunk with its cursor at the start.
    pub fn copy_from(src: &[u8]) -> Self {
        Self {
            data: src.into(),
            pos: 0,
        }
    }

    /// Total bytes held, independent of the cursor.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Move the cursor back to the start of the chunk.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Full contents, ignoring the cursor.
    #[cfg(test)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Buf for Chunk {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn chunk(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "cannot advance past end of chunk: {} > {}",
            cnt,
            self.remaining()
        );
        self.pos += cnt;
    }
}

/// An ordered, session-owned sequence of chunks.
#[derive(Debug, Clone)]
pub struct WriteChunks {
    chunks: Vec<Chunk>,
    /// Capacity of every chunk but the last.
    chunk_capacity: usize,
    /// Sum of all chunk capacities.
    len: usize,
}

impl WriteChunks {
    /// Build from chunks whose non-final members all have `chunk_capacity`.
    pub fn from_chunks(chunks: Vec<Chunk>, chunk_capacity: usize) -> Self {
        debug_assert!(chunk_capacity > 0);
        debug_assert!(chunks
            .iter()
            .rev()
            .skip(1)
            .all(|c| c.capacity() == chunk_capacity));

        let len = chunks.iter().map(Chunk::capacity).sum();
        Self {
            chunks,
            chunk_capacity,
            len,
        }
    }

    /// A sequence holding `data` as a single chunk.
    pub fn single(data: &[u8]) -> Self {
        Self::from_chunks(vec![Chunk::copy_from(data)], data.len().max(1))
    }

    /// Total bytes across all chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Capacities of each chunk, in order.
    #[cfg(test)]
    pub fn capacities(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks.iter().map(Chunk::capacity)
    }

    /// Bytes not yet consumed, summed over every chunk.
    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.chunks.iter().map(Buf::remaining).sum()
    }

    /// Rewind every cursor. Called once at the start of a write phase.
    pub fn rewind(&mut self) {
        for chunk in &mut self.chunks {
            chunk.rewind();
        }
    }

    /// Index of the first chunk that can still hold unsent bytes after
    /// `written` bytes of this phase went out.
    pub fn resume_offset(&self, written: usize) -> usize {
        let last = self.chunks.len().saturating_sub(1);
        (written / self.chunk_capacity).min(last)
    }

    /// IoSlice views over the unsent bytes of `chunks[from..]`.
    pub fn io_slices(&self, from: usize) -> Vec<IoSlice<'_>> {
        let tail = self.chunks.get(from..).unwrap_or(&[]);
        let mut slices = Vec::with_capacity(tail.len());
        for chunk in tail {
            if chunk.has_remaining() {
                slices.push(IoSlice::new(chunk.chunk()));
            }
        }
        slices
    }

    /// Advance cursors of `chunks[from..]` by `n` bytes in order.
    ///
    /// Returns how many bytes were actually consumed; less than `n` means
    /// the caller reported more progress than there was data.
    pub fn consume(&mut self, from: usize, n: usize) -> usize {
        let mut left = n;
        for chunk in self.chunks.iter_mut().skip(from) {
            if left == 0 {
                break;
            }
            let step = left.min(chunk.remaining());
            chunk.advance(step);
            left -= step;
        }
        n - left
    }

    /// Concatenated contents of every chunk, ignoring cursors.
    #[cfg(test)]
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.as_slice());
        }
        out
    }
}
