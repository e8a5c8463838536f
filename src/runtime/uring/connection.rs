//! Connections owned by one io_uring worker.
//!
//! Each connection pairs the socket with its `Session` and the iovec array
//! the kernel reads during a vectored write. Buffers referenced by an
//! in-flight operation live on the heap inside the session, so they stay
//! put even when the slab reallocates.

use crate::runtime::Session;
use slab::Slab;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Most iovecs one writev accepts (`UIO_MAXIOV`).
const MAX_IOVECS: usize = 1024;

/// A single client connection.
pub struct Connection {
    /// Socket; closed when the connection is dropped.
    fd: OwnedFd,
    session: Session,
    /// Scatter list for the in-flight write.
    iovecs: Vec<libc::iovec>,
}

impl Connection {
    pub fn new(fd: OwnedFd, session: Session) -> Self {
        Self {
            fd,
            session,
            iovecs: Vec::new(),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Target of the next receive: the session's emptied read buffer.
    pub fn read_target(&mut self) -> (*mut u8, u32) {
        let buf = self.session.read_buf_mut();
        (buf.as_mut_ptr(), buf.len() as u32)
    }

    /// Rebuild the iovec array over the session's unsent bytes from chunk
    /// `chunk_offset` on.
    ///
    /// The returned pointer stays valid until the next call or until the
    /// connection is dropped; the session must not advance its cursors
    /// while a write using it is in flight.
    pub fn prepare_writev(&mut self, chunk_offset: usize) -> (*const libc::iovec, u32) {
        self.iovecs.clear();
        for slice in self.session.write_slices(chunk_offset).into_iter().take(MAX_IOVECS) {
            self.iovecs.push(libc::iovec {
                iov_base: slice.as_ptr() as *mut libc::c_void,
                iov_len: slice.len(),
            });
        }
        (self.iovecs.as_ptr(), self.iovecs.len() as u32)
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity; the connection is
    /// dropped, which closes its socket.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection. Removing twice returns `None` the second time.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
