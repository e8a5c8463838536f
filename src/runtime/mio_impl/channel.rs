//! Readiness-gated channel for a single connection.

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, IoSlice, Read, Write};
use std::net::Shutdown;
use std::time::Duration;
use tracing::trace;

const STREAM: Token = Token(0);

/// A channel that must be waited on before each operation.
///
/// `await_ready` blocks the calling thread; `read` and `write_vectored`
/// never do.
pub trait ReadyChannel {
    /// Block until the channel reports `interest`.
    fn await_ready(&mut self, interest: Interest) -> io::Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Close the channel. Calling it again does nothing.
    fn close(&mut self);
}

/// A non-blocking TCP stream with its own private `Poll`.
pub struct PolledStream {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    idle_timeout: Option<Duration>,
    open: bool,
}

impl PolledStream {
    pub fn new(mut stream: TcpStream, idle_timeout: Option<Duration>) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, STREAM, Interest::READABLE)?;
        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(4),
            idle_timeout,
            open: true,
        })
    }
}

impl ReadyChannel for PolledStream {
    fn await_ready(&mut self, interest: Interest) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }

        // Re-arming makes the selector report readiness that already
        // exists, so an edge consumed by an earlier wait is not lost.
        self.poll
            .registry()
            .reregister(&mut self.stream, STREAM, interest)?;

        loop {
            match self.poll.poll(&mut self.events, self.idle_timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if self.events.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "idle timeout waiting for readiness",
                ));
            }

            for event in self.events.iter() {
                if event.token() != STREAM {
                    continue;
                }
                let ready = (interest.is_readable() && event.is_readable())
                    || (interest.is_writable() && event.is_writable())
                    || event.is_error()
                    || event.is_read_closed()
                    || event.is_write_closed();
                if ready {
                    return Ok(());
                }
            }
            trace!(?interest, "Spurious wakeup");
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(bufs)
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.poll.registry().deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for PolledStream {
    fn drop(&mut self) {
        self.close();
    }
}
