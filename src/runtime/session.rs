//! Per-connection session state machine.
//!
//! A `Session` owns everything one connection needs: its read buffer, a
//! private copy of the payload chunks and the handshake line. It performs
//! no I/O itself. Drivers report what happened through the `on_*`
//! continuations, and each continuation returns the single next `Op` to
//! issue. Because a session only ever hands out one op at a time and
//! rejects completions for anything else, I/O on one connection is
//! serialized no matter which backend drives it.
//!
//! ```text
//! Accepted --greeting sent--> Reading --bytes read--> Writing
//!                                ^                       |
//!                                +----payload sent-------+
//! any phase --EOF / fault--> Closed
//! ```

use crate::error::SessionError;
use crate::runtime::WriteChunks;
use chrono::Utc;
use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Prefix of the handshake line sent on connect.
pub const GREETING_PREFIX: &str = "session-id: ";

/// Default read buffer capacity.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 512;

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a diagnostic session id. Unique within this process, not a
/// security token.
pub fn generate_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{millis:011x}-{seq:06x}")
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Connection accepted, handshake line being written.
    Accepted,
    /// Waiting for client bytes.
    Reading,
    /// Sending the payload.
    Writing,
    /// Terminal. No further I/O.
    Closed,
}

/// The operation a driver must issue next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Read into `Session::read_buf_mut`.
    Read,
    /// Write `Session::write_slices(chunk_offset)`.
    Write { chunk_offset: usize },
    /// Close the connection.
    Close,
}

/// Kind of the single operation a session has outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

impl OpKind {
    fn name(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
        }
    }
}

/// Outcome of a read or write as the state machine sees it.
///
/// `Closed` covers what a signed byte count would report as negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Transferred(usize),
    Closed,
}

impl Completion {
    /// Map the result of a non-blocking read. `Ok(0)` is end of stream;
    /// `WouldBlock` and `Interrupted` mean nothing was read yet.
    pub fn from_read(result: io::Result<usize>) -> io::Result<Self> {
        match result {
            Ok(0) => Ok(Completion::Closed),
            Ok(n) => Ok(Completion::Transferred(n)),
            Err(e) if is_transient(&e) => Ok(Completion::Transferred(0)),
            Err(e) => Err(e),
        }
    }

    /// Map the result of a non-blocking write. Zero progress is not an
    /// error; the same resumption point is retried.
    pub fn from_write(result: io::Result<usize>) -> io::Result<Self> {
        match result {
            Ok(n) => Ok(Completion::Transferred(n)),
            Err(e) if is_transient(&e) => Ok(Completion::Transferred(0)),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(Completion::Closed),
            Err(e) => Err(e),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// State of one client connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    phase: Phase,
    pending: Option<OpKind>,
    read_buf: Vec<u8>,
    /// Bytes of `read_buf` filled by the last read.
    filled: usize,
    greeting: WriteChunks,
    chunks: WriteChunks,
    /// Progress of the current write phase.
    bytes_written: usize,
    bytes_received: u64,
    responses: u64,
    close_reason: Option<SessionError>,
}

impl Session {
    /// Create a session that owns `chunks` and a read buffer of
    /// `read_buffer_size` bytes.
    pub fn new(id: String, chunks: WriteChunks, read_buffer_size: usize) -> Self {
        let greeting = WriteChunks::single(format!("{GREETING_PREFIX}{id}\r\n").as_bytes());
        Self {
            id,
            phase: Phase::Accepted,
            pending: None,
            read_buf: vec![0u8; read_buffer_size.max(1)],
            filled: 0,
            greeting,
            chunks,
            bytes_written: 0,
            bytes_received: 0,
            responses: 0,
            close_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// The operation currently outstanding, if any.
    #[cfg(test)]
    pub fn pending(&self) -> Option<OpKind> {
        self.pending
    }

    /// Bytes sent so far in the current write phase.
    #[cfg(test)]
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Length of the current write phase: the greeting while `Accepted`,
    /// the payload otherwise.
    pub fn total_len(&self) -> usize {
        self.outbound().len()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Number of complete payloads sent.
    pub fn responses(&self) -> u64 {
        self.responses
    }

    pub fn close_reason(&self) -> Option<&SessionError> {
        self.close_reason.as_ref()
    }

    /// Bytes received by the last read.
    pub fn received(&self) -> &[u8] {
        &self.read_buf[..self.filled]
    }

    /// The read buffer, emptied for the next read.
    pub fn read_buf_mut(&mut self) -> &mut [u8] {
        self.filled = 0;
        &mut self.read_buf
    }

    /// Unsent bytes of the current write phase, starting at chunk
    /// `chunk_offset` as named by the last `Op::Write`.
    pub fn write_slices(&self, chunk_offset: usize) -> Vec<IoSlice<'_>> {
        self.outbound().io_slices(chunk_offset)
    }

    /// Start the handshake: the greeting line is the first write.
    pub fn on_accept(&mut self) -> Op {
        if self.phase != Phase::Accepted || self.pending.is_some() {
            return self.close(SessionError::OutOfOrder {
                expected: "nothing",
                got: "accept",
            });
        }
        debug!(session = %self.id, "Session accepted");
        self.begin_write()
    }

    /// Continuation for a finished read.
    pub fn on_read_complete(&mut self, completion: Completion) -> Op {
        if let Err(op) = self.take_pending(OpKind::Read) {
            return op;
        }

        match completion {
            Completion::Closed => self.close(SessionError::ChannelClosed),
            Completion::Transferred(0) => self.issue_read(),
            Completion::Transferred(n) => {
                self.filled = n.min(self.read_buf.len());
                self.bytes_received += n as u64;
                trace!(
                    session = %self.id,
                    bytes = n,
                    input = %String::from_utf8_lossy(self.received()).trim_end(),
                    "Request received"
                );
                self.phase = Phase::Writing;
                self.begin_write()
            }
        }
    }

    /// Continuation for a finished (possibly partial) write.
    pub fn on_write_progress(&mut self, completion: Completion) -> Op {
        if let Err(op) = self.take_pending(OpKind::Write) {
            return op;
        }

        let n = match completion {
            Completion::Closed => return self.close(SessionError::ChannelClosed),
            Completion::Transferred(n) => n,
        };

        let from = self.outbound().resume_offset(self.bytes_written);
        let consumed = self.outbound_mut().consume(from, n);
        if consumed < n {
            return self.close(SessionError::Transport(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("write reported {n} bytes but only {consumed} were queued"),
            )));
        }
        self.bytes_written += n;

        let total = self.total_len();
        trace!(
            session = %self.id,
            bytes = n,
            written = self.bytes_written,
            total,
            "Write progress"
        );

        if self.bytes_written < total {
            return self.issue_write();
        }

        match self.phase {
            Phase::Accepted => debug!(session = %self.id, "Handshake complete"),
            _ => self.responses += 1,
        }
        self.bytes_written = 0;
        self.issue_read()
    }

    /// Continuation for an I/O fault.
    pub fn on_error(&mut self, cause: io::Error) -> Op {
        self.close(SessionError::Transport(cause))
    }

    /// Enter `Closed`. Only the first reason is kept; closing again is a
    /// no-op that still answers `Op::Close`.
    pub fn close(&mut self, reason: SessionError) -> Op {
        if self.phase == Phase::Closed {
            return Op::Close;
        }

        match &reason {
            SessionError::OutOfOrder { .. } => {
                warn!(session = %self.id, reason = %reason, "Session closed")
            }
            _ if reason.is_disconnect() => {
                debug!(session = %self.id, responses = self.responses, "Client disconnected")
            }
            _ => debug!(session = %self.id, reason = %reason, "Session closed"),
        }

        self.phase = Phase::Closed;
        self.pending = None;
        self.close_reason = Some(reason);
        Op::Close
    }

    fn outbound(&self) -> &WriteChunks {
        match self.phase {
            Phase::Accepted => &self.greeting,
            _ => &self.chunks,
        }
    }

    fn outbound_mut(&mut self) -> &mut WriteChunks {
        match self.phase {
            Phase::Accepted => &mut self.greeting,
            _ => &mut self.chunks,
        }
    }

    fn begin_write(&mut self) -> Op {
        self.outbound_mut().rewind();
        self.bytes_written = 0;
        self.issue_write()
    }

    fn issue_write(&mut self) -> Op {
        self.pending = Some(OpKind::Write);
        Op::Write {
            chunk_offset: self.outbound().resume_offset(self.bytes_written),
        }
    }

    fn issue_read(&mut self) -> Op {
        self.phase = Phase::Reading;
        self.pending = Some(OpKind::Read);
        Op::Read
    }

    /// Clear the pending op if it matches `got`; otherwise the session is
    /// closed (or already was) and `Err(Op::Close)` is returned.
    fn take_pending(&mut self, got: OpKind) -> Result<(), Op> {
        if self.phase == Phase::Closed {
            return Err(Op::Close);
        }
        match self.pending {
            Some(kind) if kind == got => {
                self.pending = None;
                Ok(())
            }
            other => Err(self.close(SessionError::OutOfOrder {
                expected: other.map_or("nothing", OpKind::name),
                got: got.name(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentPayload;
    use std::collections::{HashMap, VecDeque};

    fn session_for(content: &[u8], cap: usize) -> (Session, Vec<u8>) {
        let payload = ContentPayload::from_content(content, cap);
        let mut expected = content.to_vec();
        expected.extend_from_slice(b"\r\n");
        (
            Session::new("test".to_string(), payload.clone_chunks(), 16),
            expected,
        )
    }

    /// Copy at most `limit` bytes out of the session's current write view.
    fn transmit(session: &Session, chunk_offset: usize, limit: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for slice in session.write_slices(chunk_offset) {
            let take = slice.len().min(limit - out.len());
            out.extend_from_slice(&slice[..take]);
            if out.len() == limit {
                break;
            }
        }
        out
    }

    /// Drive a write phase to completion with the given partial sizes,
    /// cycling through them; returns the bytes the peer would see.
    fn run_write_phase(session: &mut Session, mut op: Op, sizes: &[usize]) -> (Vec<u8>, Op) {
        let mut wire = Vec::new();
        let mut i = 0;
        while let Op::Write { chunk_offset } = op {
            let sent = transmit(session, chunk_offset, sizes[i % sizes.len()]);
            i += 1;
            wire.extend_from_slice(&sent);
            op = session.on_write_progress(Completion::Transferred(sent.len()));
        }
        (wire, op)
    }

    fn handshake(session: &mut Session) -> Vec<u8> {
        let op = session.on_accept();
        let (greeting, op) = run_write_phase(session, op, &[usize::MAX]);
        assert_eq!(op, Op::Read);
        greeting
    }

    #[test]
    fn test_generate_id_is_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }

    #[test]
    fn test_handshake_sends_session_id() {
        let (mut session, _) = session_for(b"body", 8);
        assert_eq!(session.phase(), Phase::Accepted);

        let greeting = handshake(&mut session);
        assert_eq!(greeting, b"session-id: test\r\n");
        assert_eq!(session.phase(), Phase::Reading);
        assert_eq!(session.pending(), Some(OpKind::Read));
        assert_eq!(session.responses(), 0);
    }

    #[test]
    fn test_partial_writes_are_transparent() {
        let content: Vec<u8> = (0..40_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let patterns: [&[usize]; 5] = [
            &[usize::MAX],
            &[1],
            &[16_384],
            &[5_000, 12_000, 1, 20_000, 9_999],
            &[16_383, 16_385, 3, 7_231],
        ];

        for sizes in patterns {
            let (mut session, expected) = session_for(&content, 16_384);
            handshake(&mut session);

            session.read_buf_mut()[0] = b'?';
            let op = session.on_read_complete(Completion::Transferred(1));
            assert_eq!(op, Op::Write { chunk_offset: 0 });
            assert_eq!(session.total_len(), 40_002);

            let (wire, op) = run_write_phase(&mut session, op, sizes);
            assert_eq!(wire.len(), 40_002, "sizes={sizes:?}");
            assert_eq!(wire, expected, "sizes={sizes:?}");
            assert_eq!(op, Op::Read);
            assert_eq!(session.bytes_written(), 0);
        }
    }

    #[test]
    fn test_resumption_offset_follows_progress() {
        let (mut session, _) = session_for(&[0u8; 38], 10);
        handshake(&mut session);
        let op = session.on_read_complete(Completion::Transferred(3));
        assert_eq!(op, Op::Write { chunk_offset: 0 });

        assert_eq!(
            session.on_write_progress(Completion::Transferred(12)),
            Op::Write { chunk_offset: 1 }
        );
        assert_eq!(
            session.on_write_progress(Completion::Transferred(8)),
            Op::Write { chunk_offset: 2 }
        );
        assert_eq!(
            session.on_write_progress(Completion::Transferred(15)),
            Op::Write { chunk_offset: 3 }
        );
        assert_eq!(session.write_slices(3).len(), 1);
        assert_eq!(session.on_write_progress(Completion::Transferred(5)), Op::Read);
    }

    #[test]
    fn test_zero_byte_write_retries_same_point() {
        let (mut session, _) = session_for(&[1u8; 30], 10);
        handshake(&mut session);
        session.on_read_complete(Completion::Transferred(1));
        session.on_write_progress(Completion::Transferred(14));

        let before = transmit(&session, 1, usize::MAX);
        let op = session.on_write_progress(Completion::Transferred(0));
        assert_eq!(op, Op::Write { chunk_offset: 1 });
        assert_eq!(session.bytes_written(), 14);
        assert_eq!(transmit(&session, 1, usize::MAX), before);
    }

    #[test]
    fn test_sequential_reads_resend_full_payload() {
        let (mut session, expected) = session_for(b"repeat me please", 5);
        handshake(&mut session);

        for round in 1..=2 {
            let op = session.on_read_complete(Completion::Transferred(2));
            let (wire, op) = run_write_phase(&mut session, op, &[4, 3]);
            assert_eq!(wire, expected);
            assert_eq!(op, Op::Read);
            assert_eq!(session.responses(), round);
        }
    }

    #[test]
    fn test_empty_read_reissues_read() {
        let (mut session, _) = session_for(b"x", 4);
        handshake(&mut session);
        assert_eq!(session.on_read_complete(Completion::Transferred(0)), Op::Read);
        assert_eq!(session.phase(), Phase::Reading);
        assert_eq!(session.pending(), Some(OpKind::Read));
    }

    #[test]
    fn test_closed_read_closes_once() {
        let (mut session, _) = session_for(b"x", 4);
        handshake(&mut session);

        assert_eq!(session.on_read_complete(Completion::Closed), Op::Close);
        assert!(session.is_closed());
        assert!(matches!(
            session.close_reason(),
            Some(SessionError::ChannelClosed)
        ));
        assert_eq!(session.pending(), None);

        // Late completions and repeated closes stay closed.
        assert_eq!(session.on_read_complete(Completion::Transferred(5)), Op::Close);
        assert_eq!(session.on_write_progress(Completion::Transferred(5)), Op::Close);
        assert_eq!(session.close(SessionError::ChannelClosed), Op::Close);
        assert!(matches!(
            session.close_reason(),
            Some(SessionError::ChannelClosed)
        ));
    }

    #[test]
    fn test_closed_write_and_error_close() {
        let (mut session, _) = session_for(b"abc", 4);
        assert!(matches!(session.on_accept(), Op::Write { .. }));
        assert_eq!(session.on_write_progress(Completion::Closed), Op::Close);

        let (mut session, _) = session_for(b"abc", 4);
        handshake(&mut session);
        let op = session.on_error(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(op, Op::Close);
        assert!(matches!(
            session.close_reason(),
            Some(SessionError::Transport(_))
        ));
    }

    #[test]
    fn test_mismatched_completion_is_rejected() {
        let (mut session, _) = session_for(b"abc", 4);
        handshake(&mut session);
        // A read is pending; a write completion cannot be ours.
        assert_eq!(session.on_write_progress(Completion::Transferred(1)), Op::Close);
        assert!(matches!(
            session.close_reason(),
            Some(SessionError::OutOfOrder {
                expected: "read",
                got: "write"
            })
        ));
    }

    #[test]
    fn test_overreported_write_is_fault() {
        let (mut session, _) = session_for(b"abc", 4);
        handshake(&mut session);
        session.on_read_complete(Completion::Transferred(1));
        assert_eq!(session.on_write_progress(Completion::Transferred(99)), Op::Close);
        assert!(matches!(
            session.close_reason(),
            Some(SessionError::Transport(_))
        ));
    }

    #[test]
    fn test_completion_mapping() {
        use io::ErrorKind::*;
        assert_eq!(Completion::from_read(Ok(0)).unwrap(), Completion::Closed);
        assert_eq!(Completion::from_read(Ok(4)).unwrap(), Completion::Transferred(4));
        assert_eq!(
            Completion::from_read(Err(WouldBlock.into())).unwrap(),
            Completion::Transferred(0)
        );
        assert!(Completion::from_read(Err(ConnectionReset.into())).is_err());

        assert_eq!(Completion::from_write(Ok(0)).unwrap(), Completion::Transferred(0));
        assert_eq!(
            Completion::from_write(Err(Interrupted.into())).unwrap(),
            Completion::Transferred(0)
        );
        assert_eq!(
            Completion::from_write(Err(BrokenPipe.into())).unwrap(),
            Completion::Closed
        );
    }

    /// Interleave completions from several sessions the way a completion
    /// queue would, and check no session ever has two ops in flight.
    #[test]
    fn test_callback_chain_keeps_one_op_in_flight() {
        let content: Vec<u8> = (0..5_000u32).map(|i| (i % 253) as u8).collect();
        let payload = ContentPayload::from_content(&content, 1_024);
        let mut expected = content.clone();
        expected.extend_from_slice(b"\r\n");

        let mut sessions: Vec<Session> = (0..3)
            .map(|i| Session::new(format!("s{i}"), payload.clone_chunks(), 32))
            .collect();
        let mut in_flight: HashMap<usize, Op> = HashMap::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        let mut wire: Vec<Vec<u8>> = vec![Vec::new(); sessions.len()];
        let mut reads = vec![0usize; sessions.len()];

        let issue = |id: usize,
                     op: Op,
                     in_flight: &mut HashMap<usize, Op>,
                     queue: &mut VecDeque<usize>| {
            if op == Op::Close {
                assert!(!in_flight.contains_key(&id));
                return;
            }
            assert!(
                in_flight.insert(id, op).is_none(),
                "session {id} issued a second op while one was in flight"
            );
            queue.push_back(id);
        };

        for (id, session) in sessions.iter_mut().enumerate() {
            let op = session.on_accept();
            issue(id, op, &mut in_flight, &mut queue);
        }

        let sizes = [700usize, 1, 2_048, 333, 0, 4_096];
        let mut step = 0;
        while let Some(id) = queue.pop_front() {
            step += 1;
            let op = in_flight.remove(&id).unwrap();
            let session = &mut sessions[id];
            let next = match op {
                Op::Read => {
                    reads[id] += 1;
                    if reads[id] > 2 {
                        session.on_read_complete(Completion::Closed)
                    } else {
                        session.on_read_complete(Completion::Transferred(1))
                    }
                }
                Op::Write { chunk_offset } => {
                    let sent = transmit(session, chunk_offset, sizes[step % sizes.len()]);
                    wire[id].extend_from_slice(&sent);
                    session.on_write_progress(Completion::Transferred(sent.len()))
                }
                Op::Close => unreachable!(),
            };
            issue(id, next, &mut in_flight, &mut queue);
        }

        for (id, session) in sessions.iter().enumerate() {
            assert!(session.is_closed());
            let greeting = format!("session-id: s{id}\r\n").into_bytes();
            let mut want = greeting;
            want.extend_from_slice(&expected);
            want.extend_from_slice(&expected);
            assert_eq!(wire[id], want, "session {id}");
        }
    }
}
