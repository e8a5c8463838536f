//! io_uring event loop for Linux.
//!
//! Completion-based model: each worker owns a ring, submits the op its
//! session asks for, and feeds every completion back to the session's
//! continuation. No thread ever blocks on a single connection; a worker
//! only waits for the next completion of any kind.

use super::connection::{Connection, ConnectionRegistry};
use super::token::{OpType, TokenAllocator};
use crate::config::Config;
use crate::content::ContentStore;
use crate::runtime::{generate_id, num_cpus, tune_socket, Completion, Op, Session};
use io_uring::squeue::{self, Flags};
use io_uring::{opcode, types, IoUring};
use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, trace, warn};

/// Completions handled per wake-up before submitting again.
const BATCH_SIZE: usize = 256;

/// Run the io_uring-based server.
///
/// Blocks until every worker has exited. Fails early if any worker cannot
/// set up its ring.
pub fn run(config: Config, listener: TcpListener, store: Arc<ContentStore>) -> io::Result<()> {
    let num_workers = if config.workers == 0 {
        num_cpus()
    } else {
        config.workers
    };

    // The ring waits for us; a non-blocking listener would only make
    // accepts complete with EAGAIN.
    listener.set_nonblocking(false)?;

    info!(
        workers = num_workers,
        ring_size = config.ring_size,
        max_connections = config.max_connections,
        idle_timeout = ?config.idle_timeout,
        "Starting io_uring runtime"
    );

    let (started_tx, started_rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let config = config.clone();
        let store = Arc::clone(&store);
        let listener = listener.try_clone()?;
        let started = started_tx.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || {
                let mut worker = match Worker::new(worker_id, listener, config, store) {
                    Ok(worker) => {
                        let _ = started.send(Ok(()));
                        worker
                    }
                    Err(e) => {
                        let _ = started.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = worker.run() {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }
    drop(started_tx);

    for _ in 0..num_workers {
        match started_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

/// One ring plus the connections it serves.
struct Worker {
    id: usize,
    ring: IoUring,
    listener: TcpListener,
    tokens: TokenAllocator,
    connections: ConnectionRegistry,
    config: Config,
    store: Arc<ContentStore>,
    /// Idle timeout linked to every read and write. Boxed so the address
    /// handed to the kernel stays fixed.
    timeout: Option<Box<types::Timespec>>,
}

impl Worker {
    fn new(
        id: usize,
        listener: TcpListener,
        config: Config,
        store: Arc<ContentStore>,
    ) -> io::Result<Self> {
        let ring = IoUring::new(config.ring_size)?;
        let timeout = config.idle_timeout.map(|d| {
            Box::new(
                types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos()),
            )
        });

        Ok(Self {
            id,
            ring,
            listener,
            tokens: TokenAllocator::new(config.max_connections.min(4096) * 2),
            connections: ConnectionRegistry::new(config.max_connections),
            config,
            store,
            timeout,
        })
    }

    fn run(&mut self) -> io::Result<()> {
        self.submit_accept()?;
        info!(worker = self.id, "Worker started");

        loop {
            // Submit pending operations and wait for at least one completion
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let mut processed = 0;
            while processed < BATCH_SIZE {
                let cqe = match self.ring.completion().next() {
                    Some(cqe) => cqe,
                    None => break,
                };
                processed += 1;
                self.dispatch(cqe.user_data(), cqe.result())?;
            }
        }
    }

    fn dispatch(&mut self, token: u64, result: i32) -> io::Result<()> {
        // Get and free the operation token
        let op = match self.tokens.free(token) {
            Some(op) => op,
            None => {
                warn!("Unknown token in completion: {}", token);
                return Ok(());
            }
        };

        match op {
            OpType::Accept => self.handle_accept(result),
            OpType::Read { conn_id } => {
                let completion = Completion::from_read(cqe_result(result));
                self.complete(conn_id, |session| match completion {
                    Ok(c) => session.on_read_complete(c),
                    Err(e) => session.on_error(e),
                });
                Ok(())
            }
            OpType::Write { conn_id } => {
                let completion = Completion::from_write(cqe_result(result));
                self.complete(conn_id, |session| match completion {
                    Ok(c) => session.on_write_progress(c),
                    Err(e) => session.on_error(e),
                });
                Ok(())
            }
            OpType::Timeout { conn_id } => {
                // The linked op reports the expiry itself.
                trace!(conn_id, result, "Link timeout completed");
                Ok(())
            }
        }
    }

    fn handle_accept(&mut self, result: i32) -> io::Result<()> {
        // Always re-arm accept
        self.submit_accept()?;

        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            warn!("Accept failed: {}", err);
            return Ok(());
        }

        // SAFETY: a successful accept returns a new descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(result) };
        tune_socket(socket2::SockRef::from(&fd), &self.config);

        let chunks = match self.store.clone_chunks() {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(error = %e, "Content unavailable, dropping connection");
                return Ok(());
            }
        };
        let session = Session::new(generate_id(), chunks, self.config.read_buffer_size);
        let session_id = session.id().to_string();

        let conn_id = match self.connections.insert(Connection::new(fd, session)) {
            Some(id) => id,
            None => {
                warn!(session = %session_id, "Connection limit reached, closing");
                return Ok(());
            }
        };

        debug!(
            worker = self.id,
            conn_id,
            session = %session_id,
            active = self.connections.len(),
            "Accepted connection"
        );

        self.complete(conn_id, Session::on_accept);
        Ok(())
    }

    /// Run a session continuation and issue whatever op it returns.
    fn complete<F>(&mut self, conn_id: usize, continuation: F)
    where
        F: FnOnce(&mut Session) -> Op,
    {
        let op = match self.connections.get_mut(conn_id) {
            Some(conn) => continuation(conn.session_mut()),
            None => {
                debug!(conn_id, "Completion for closed connection");
                return;
            }
        };
        self.issue(conn_id, op);
    }

    fn issue(&mut self, conn_id: usize, op: Op) {
        let submitted = match op {
            Op::Read => self.submit_read(conn_id),
            Op::Write { chunk_offset } => self.submit_write(conn_id, chunk_offset),
            Op::Close => {
                self.close_connection(conn_id);
                return;
            }
        };

        if let Err(e) = submitted {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                conn.session_mut().on_error(e);
            }
            self.close_connection(conn_id);
        }
    }

    fn submit_accept(&mut self) -> io::Result<()> {
        let token = self.tokens.alloc(OpType::Accept);
        let entry = opcode::Accept::new(
            types::Fd(self.listener.as_raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build()
        .user_data(token);

        let result = self.push_entries(&[entry]);
        if result.is_err() {
            self.tokens.free(token);
        }
        result
    }

    fn submit_read(&mut self, conn_id: usize) -> io::Result<()> {
        let (fd, ptr, len) = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                let (ptr, len) = conn.read_target();
                (conn.raw_fd(), ptr, len)
            }
            None => return Ok(()),
        };

        let entry = opcode::Recv::new(types::Fd(fd), ptr, len).build();
        self.push(OpType::Read { conn_id }, conn_id, entry)
    }

    fn submit_write(&mut self, conn_id: usize, chunk_offset: usize) -> io::Result<()> {
        let (fd, iovecs, len) = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                let (iovecs, len) = conn.prepare_writev(chunk_offset);
                (conn.raw_fd(), iovecs, len)
            }
            None => return Ok(()),
        };

        let entry = opcode::Writev::new(types::Fd(fd), iovecs, len).build();
        self.push(OpType::Write { conn_id }, conn_id, entry)
    }

    /// Push one I/O entry, linked to the idle timeout when one is set.
    fn push(&mut self, op: OpType, conn_id: usize, entry: squeue::Entry) -> io::Result<()> {
        let token = self.tokens.alloc(op);
        let entry = entry.user_data(token);

        let timespec = self
            .timeout
            .as_deref()
            .map(|t| t as *const types::Timespec);

        let result = match timespec {
            Some(timespec) => {
                let timeout_token = self.tokens.alloc(OpType::Timeout { conn_id });
                let timeout = opcode::LinkTimeout::new(timespec)
                    .build()
                    .user_data(timeout_token);
                let result = self.push_entries(&[entry.flags(Flags::IO_LINK), timeout]);
                if result.is_err() {
                    self.tokens.free(timeout_token);
                }
                result
            }
            None => self.push_entries(&[entry]),
        };

        if result.is_err() {
            self.tokens.free(token);
        }
        result
    }

    /// Push entries as one group, flushing the submission queue if it is
    /// too full to take them.
    fn push_entries(&mut self, entries: &[squeue::Entry]) -> io::Result<()> {
        // SAFETY: every buffer an entry points at is owned by a connection
        // (or the worker) that outlives the operation.
        if unsafe { self.ring.submission().push_multiple(entries) }.is_ok() {
            return Ok(());
        }

        self.ring.submit()?;

        // SAFETY: as above.
        unsafe { self.ring.submission().push_multiple(entries) }
            .map_err(|_| io::Error::other("submission queue full"))
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.remove(conn_id) {
            let session = conn.session();
            debug_assert!(session.is_closed());
            debug!(
                worker = self.id,
                conn_id,
                session = %session.id(),
                responses = session.responses(),
                bytes_received = session.bytes_received(),
                reason = ?session.close_reason(),
                "Connection closed"
            );
            // Dropping `conn` closes the socket.
        }
    }
}

/// Convert a CQE result to a byte count. A cancelled op lost the race
/// against its linked idle timeout.
fn cqe_result(result: i32) -> io::Result<usize> {
    if result >= 0 {
        return Ok(result as usize);
    }
    if result == -libc::ECANCELED {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "idle timeout waiting for completion",
        ));
    }
    Err(io::Error::from_raw_os_error(-result))
}
