//! Session runtime for serving the payload.
//!
//! Two drivers share one state machine:
//! - `uring` (Linux): completion callbacks on an io_uring worker pool
//! - `mio_impl`: one thread per connection waiting on mio readiness
//!
//! Both share common abstractions:
//! - `Session`: per-connection state machine returning the next `Op`
//! - `WriteChunks`: cursor-bearing payload copy for resumable writes

mod chunks;
mod session;

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod mio_impl;

#[cfg(target_os = "linux")]
mod uring;

pub(crate) use chunks::{Chunk, WriteChunks};
pub(crate) use session::{generate_id, Completion, Op, Session, DEFAULT_READ_BUFFER_SIZE};

use crate::config::{Config, Style};
use crate::content::ContentStore;
use socket2::SockRef;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, info};

/// Bind the listener and run the configured driver until it fails.
pub fn run(config: Config, store: Arc<ContentStore>) -> io::Result<()> {
    let listener = create_listener(&config)?;
    info!(
        addr = %listener.local_addr()?,
        style = ?config.style,
        mode = ?config.mode,
        "Server listening"
    );

    match config.style {
        Style::Callback => run_callback(config, listener, store),
        Style::Readiness => run_readiness(config, listener, store),
    }
}

#[cfg(target_os = "linux")]
fn run_callback(
    config: Config,
    listener: std::net::TcpListener,
    store: Arc<ContentStore>,
) -> io::Result<()> {
    uring::run(config, listener, store)
}

#[cfg(not(target_os = "linux"))]
fn run_callback(
    _config: Config,
    _listener: std::net::TcpListener,
    _store: Arc<ContentStore>,
) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "callback style requires io_uring (Linux only)",
    ))
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_readiness(
    config: Config,
    listener: std::net::TcpListener,
    store: Arc<ContentStore>,
) -> io::Result<()> {
    mio_impl::run(config, listener, store)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run_readiness(
    _config: Config,
    _listener: std::net::TcpListener,
    _store: Arc<ContentStore>,
) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Unsupported platform: only Linux and macOS are supported",
    ))
}

/// Create a non-blocking TCP listener for the configured address.
pub(crate) fn create_listener(config: &Config) -> io::Result<std::net::TcpListener> {
    let addr: SocketAddr = config
        .listen_addr()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address for {}", config.listen_addr()),
            )
        })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Apply per-connection socket options. Failures are logged and ignored.
pub(crate) fn tune_socket(socket: SockRef<'_>, config: &Config) {
    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size) {
            debug!(error = %e, size, "Failed to set send buffer size");
        }
    }
}

pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Blocking client helpers for end-to-end driver tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    pub fn expected_payload(content: &[u8]) -> Vec<u8> {
        let mut expected = content.to_vec();
        expected.extend_from_slice(b"\r\n");
        expected
    }

    pub fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    pub fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    /// Read the handshake line and return the session id, or `None` if
    /// the server closed the connection first.
    pub fn try_greeting(stream: &mut TcpStream) -> Option<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"\r\n") {
            match stream.read(&mut byte) {
                Ok(0) => return None,
                Ok(_) => line.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("reading greeting: {e}"),
            }
        }
        let line = String::from_utf8(line).unwrap();
        let id = line
            .strip_prefix("session-id: ")
            .and_then(|rest| rest.strip_suffix("\r\n"))
            .unwrap();
        assert!(!id.is_empty());
        Some(id.to_string())
    }

    pub fn read_greeting(stream: &mut TcpStream) -> String {
        try_greeting(stream).expect("connection closed before greeting")
    }

    /// One read that retries `Interrupted`; `Ok(0)` means the server
    /// closed the connection.
    pub fn read_eof(stream: &mut TcpStream) -> io::Result<usize> {
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Send one request byte and read back one payload of `len` bytes.
    pub fn request(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        stream.write_all(b"x").unwrap();
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }
}
