//! Operation token tracking for io_uring completion correlation.
//!
//! Each submitted operation gets a unique token (user_data) that identifies
//! the operation type and the connection it belongs to when the completion
//! arrives.

use slab::Slab;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Accept operation on listener socket.
    Accept,
    /// Receive into the session's read buffer.
    Read {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
    /// Vectored write of the session's unsent chunks.
    Write {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
    /// Idle timeout linked to the preceding read or write.
    Timeout {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
}

/// Allocator for operation tokens with O(1) lookup.
///
/// Uses a slab to efficiently allocate and deallocate tokens,
/// providing stable identifiers for in-flight operations.
pub struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a new token for an operation.
    ///
    /// Returns the token (user_data value for io_uring).
    pub fn alloc(&mut self, op: OpType) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Free a token, making it available for reuse.
    ///
    /// Returns the operation type that was associated with the token.
    pub fn free(&mut self, token: u64) -> Option<OpType> {
        self.ops.try_remove(token as usize)
    }

    /// Number of currently allocated tokens.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}
