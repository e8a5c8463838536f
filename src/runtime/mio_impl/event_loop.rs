//! mio event loop implementation.
//!
//! Readiness-based model: the acceptor polls the listener, and every
//! accepted connection gets its own thread. That thread waits for the
//! channel to become ready for the session's next op, performs the op
//! with a non-blocking syscall, and feeds the result back to the session.

use super::channel::{PolledStream, ReadyChannel};
use crate::config::Config;
use crate::content::ContentStore;
use crate::runtime::{generate_id, tune_socket, Completion, Op, Session};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Run the readiness-driven server on `listener`.
pub fn run(
    config: Config,
    listener: std::net::TcpListener,
    store: Arc<ContentStore>,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let active = Arc::new(AtomicUsize::new(0));

    info!(
        max_connections = config.max_connections,
        idle_timeout = ?config.idle_timeout,
        "Starting mio runtime"
    );

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_connections(&listener, &config, &store, &active);
            }
        }
    }
}

/// Decrements the live-session count when the session thread ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn accept_connections(
    listener: &TcpListener,
    config: &Config,
    store: &Arc<ContentStore>,
    active: &Arc<AtomicUsize>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if active.load(Ordering::Acquire) >= config.max_connections {
                    warn!(peer = %peer_addr, "Connection limit reached");
                    continue;
                }

                tune_socket(socket2::SockRef::from(&stream), config);

                let chunks = match store.clone_chunks() {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        error!(error = %e, "Content unavailable, dropping connection");
                        continue;
                    }
                };
                let mut session = Session::new(generate_id(), chunks, config.read_buffer_size);

                debug!(
                    session = %session.id(),
                    peer = %peer_addr,
                    "Accepted connection"
                );

                active.fetch_add(1, Ordering::AcqRel);
                let guard = ActiveGuard(Arc::clone(active));
                let idle_timeout = config.idle_timeout;

                let spawned = thread::Builder::new()
                    .name(format!("session-{}", session.id()))
                    .spawn(move || {
                        let _guard = guard;
                        match PolledStream::new(stream, idle_timeout) {
                            Ok(mut channel) => serve(&mut session, &mut channel),
                            Err(e) => {
                                session.on_error(e);
                            }
                        }
                    });

                if let Err(e) = spawned {
                    error!(error = %e, "Failed to spawn session thread");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
}

/// Drive one session to completion on the current thread.
pub(crate) fn serve<C: ReadyChannel>(session: &mut Session, channel: &mut C) {
    let mut op = session.on_accept();
    loop {
        op = match op {
            Op::Read => match read_once(session, channel) {
                Ok(completion) => session.on_read_complete(completion),
                Err(e) => session.on_error(e),
            },
            Op::Write { chunk_offset } => match write_once(session, channel, chunk_offset) {
                Ok(completion) => session.on_write_progress(completion),
                Err(e) => session.on_error(e),
            },
            Op::Close => {
                debug_assert!(session.is_closed());
                channel.close();
                debug!(
                    session = %session.id(),
                    responses = session.responses(),
                    bytes_received = session.bytes_received(),
                    reason = ?session.close_reason(),
                    "Connection closed"
                );
                return;
            }
        };
    }
}

fn read_once<C: ReadyChannel>(session: &mut Session, channel: &mut C) -> io::Result<Completion> {
    channel.await_ready(Interest::READABLE)?;
    Completion::from_read(channel.read(session.read_buf_mut()))
}

fn write_once<C: ReadyChannel>(
    session: &Session,
    channel: &mut C,
    chunk_offset: usize,
) -> io::Result<Completion> {
    channel.await_ready(Interest::WRITABLE)?;
    let slices = session.write_slices(chunk_offset);
    Completion::from_write(channel.write_vectored(&slices))
}
