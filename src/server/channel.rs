//! Per-connection state shared between the poller and the workers.
//!
//! Workers perform reads and writes opportunistically. When the socket is not
//! ready and the caller asked for blocking semantics, the worker parks a
//! [`Pending`] operation on the channel, re-declares interest with the poller
//! and waits on a bounded signal. The poller performs the I/O once the socket
//! is ready and fires the signal.

use crate::server::poller::PollerShared;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use mio::{net::TcpStream, Token};
use parking_lot::Mutex;
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

pub(crate) const OP_READ: u8 = 1 << 0;
pub(crate) const OP_WRITE: u8 = 1 << 1;

const READ_CHUNK_BYTES: usize = 8192;

/// Byte transport as seen by the protocol layer.
///
/// `read` returns `Ok(0)` only in non-blocking mode when nothing is available;
/// end of stream is reported as [`io::ErrorKind::UnexpectedEof`].
pub(crate) trait ChannelIo {
    fn read(&self, dst: &mut [u8], block: bool) -> io::Result<usize>;

    /// Hands `src` to the socket. Bytes the socket cannot take right away are
    /// staged on the channel. Returns `true` when nothing remains staged.
    fn write(&self, src: &[u8], block: bool) -> io::Result<bool>;

    /// Retries staged output. Returns `true` when nothing remains staged.
    fn flush_staged(&self, block: bool) -> io::Result<bool>;

    /// Counts a new request on this connection and returns the running total.
    fn begin_request(&self) -> usize;
}

struct Pending {
    op: u8,
    signal: Sender<io::Result<usize>>,
}

/// Outcome of a readiness event for a channel with a parked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// No worker is waiting; dispatch normally.
    Idle,
    /// A worker waits for `op`, which is not satisfied yet.
    Waiting(u8),
    /// The parked operation ran and its worker was signalled.
    Fired,
}

pub(crate) struct Channel {
    token: Token,
    peer: SocketAddr,
    socket: Mutex<TcpStream>,
    staged_in: Mutex<Vec<u8>>,
    staged_out: Mutex<Vec<u8>>,
    interest: AtomicU8,
    last_access: AtomicU64,
    pending: Mutex<Option<Pending>>,
    closed: AtomicBool,
    requests: AtomicUsize,
    poller: Arc<PollerShared>,
    blocking_timeout: Duration,
}

impl Channel {
    pub(crate) fn new(
        socket: TcpStream,
        peer: SocketAddr,
        token: Token,
        poller: Arc<PollerShared>,
        blocking_timeout: Duration,
    ) -> Self {
        Self {
            token,
            peer,
            socket: Mutex::new(socket),
            staged_in: Mutex::new(Vec::new()),
            staged_out: Mutex::new(Vec::new()),
            interest: AtomicU8::new(0),
            last_access: AtomicU64::new(now_millis()),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            poller,
            blocking_timeout,
        }
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub(crate) fn socket(&self) -> &Mutex<TcpStream> {
        &self.socket
    }

    #[inline]
    pub(crate) fn interest(&self) -> u8 {
        self.interest.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_interest(&self, ops: u8) {
        self.interest.store(ops, Ordering::Release);
    }

    #[inline]
    pub(crate) fn access(&self) {
        self.last_access.store(now_millis(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn idle_for(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_access.load(Ordering::Acquire)))
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn poller(&self) -> &PollerShared {
        &self.poller
    }

    /// Shuts the socket down and wakes any parked worker. Returns `false` if the
    /// channel was already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // dropping the sender disconnects the waiting worker
        drop(self.pending.lock().take());
        let _ = self.socket.lock().shutdown(Shutdown::Both);
        true
    }

    /// Runs the parked operation if `ready` satisfies it. Poller thread only.
    pub(crate) fn complete_pending(&self, ready: u8) -> Completion {
        let mut pending = self.pending.lock();
        let Some(op) = pending.as_ref().map(|p| p.op) else {
            return Completion::Idle;
        };
        if op & ready == 0 {
            return Completion::Waiting(op);
        }

        let result = match op {
            OP_READ => self.read_into_stage(),
            _ => self.write_from_stage(),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Completion::Waiting(op),
            result => {
                if let Some(parked) = pending.take() {
                    let _ = parked.signal.try_send(result);
                }
                Completion::Fired
            }
        }
    }

    fn read_into_stage(&self) -> io::Result<usize> {
        let mut socket = self.socket.lock();
        let mut staged = self.staged_in.lock();
        let start = staged.len();
        staged.resize(start + READ_CHUNK_BYTES, 0);

        let result = loop {
            match socket.read(&mut staged[start..]) {
                Ok(0) => break Err(eof()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => break result,
            }
        };
        staged.truncate(start + *result.as_ref().unwrap_or(&0));
        result
    }

    fn write_from_stage(&self) -> io::Result<usize> {
        let mut staged = self.staged_out.lock();
        if staged.is_empty() {
            return Ok(0);
        }
        let mut socket = self.socket.lock();
        loop {
            match socket.write(&staged) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    staged.drain(..n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn take_staged(&self, dst: &mut [u8]) -> Option<usize> {
        let mut staged = self.staged_in.lock();
        if staged.is_empty() {
            return None;
        }
        let n = staged.len().min(dst.len());
        dst[..n].copy_from_slice(&staged[..n]);
        staged.drain(..n);
        Some(n)
    }

    /// Parks `op` and waits, bounded by the blocking timeout, for the poller
    /// to run it.
    fn await_ready(&self, op: u8) -> io::Result<usize> {
        let (signal, done) = bounded(1);
        *self.pending.lock() = Some(Pending { op, signal });
        if self.is_closed() {
            self.pending.lock().take();
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.poller.declare(self.token, op);

        match done.recv_timeout(self.blocking_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().take();
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for socket readiness",
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err(io::ErrorKind::ConnectionAborted.into()),
        }
    }
}

impl ChannelIo for Channel {
    fn read(&self, dst: &mut [u8], block: bool) -> io::Result<usize> {
        if let Some(n) = self.take_staged(dst) {
            return Ok(n);
        }
        loop {
            let result = self.socket.lock().read(dst);
            match result {
                Ok(0) => return Err(eof()),
                Ok(n) => {
                    self.access();
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if !block {
                return Ok(0);
            }

            self.await_ready(OP_READ)?;
            if let Some(n) = self.take_staged(dst) {
                return Ok(n);
            }
        }
    }

    fn write(&self, src: &[u8], block: bool) -> io::Result<bool> {
        let mut staged = self.staged_out.lock();
        if staged.is_empty() {
            let mut written = 0;
            while written < src.len() {
                let result = self.socket.lock().write(&src[written..]);
                match result {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
            self.access();
            if written == src.len() {
                return Ok(true);
            }
            staged.extend_from_slice(&src[written..]);
        } else {
            staged.extend_from_slice(src);
        }
        drop(staged);

        self.flush_staged(block)
    }

    fn flush_staged(&self, block: bool) -> io::Result<bool> {
        loop {
            match self.write_from_stage() {
                Ok(_) if self.staged_out.lock().is_empty() => return Ok(true),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if !block {
                return Ok(false);
            }
            self.await_ready(OP_WRITE)?;
        }
    }

    #[inline]
    fn begin_request(&self) -> usize {
        self.requests.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[inline]
fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}

/// Milliseconds since the first call in this process.
pub(crate) fn now_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(test)]
mod channel_tests {
    use super::*;
    use crate::server::poller::PollerShared;
    use mio::Poll;
    use std::{
        io::{Read as _, Write as _},
        net::{TcpListener, TcpStream as StdStream},
        thread,
    };

    fn pair(blocking_timeout: Duration) -> (Poll, Arc<Channel>, StdStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let poll = Poll::new().unwrap();
        let shared = Arc::new(PollerShared::new(&poll).unwrap());
        let channel = Channel::new(
            TcpStream::from_std(server),
            peer,
            Token(7),
            shared,
            blocking_timeout,
        );
        (poll, Arc::new(channel), client)
    }

    #[test]
    fn non_blocking_read_reports_nothing() {
        let (_poll, channel, _client) = pair(Duration::from_millis(50));
        let mut buf = [0; 16];
        assert_eq!(channel.read(&mut buf, false).unwrap(), 0);
    }

    #[test]
    fn blocking_read_times_out_without_poller() {
        let (_poll, channel, _client) = pair(Duration::from_millis(50));
        let mut buf = [0; 16];
        let err = channel.read(&mut buf, true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(channel.complete_pending(OP_READ), Completion::Idle);
    }

    #[test]
    fn parked_read_is_completed_by_readiness() {
        let (_poll, channel, mut client) = pair(Duration::from_secs(5));

        let worker = {
            let channel = channel.clone();
            thread::spawn(move || {
                let mut buf = [0; 16];
                let n = channel.read(&mut buf, true).unwrap();
                buf[..n].to_vec()
            })
        };

        // wait until the worker parks
        while channel.pending.lock().is_none() {
            thread::yield_now();
        }
        client.write_all(b"ping").unwrap();

        let mut fired = false;
        for _ in 0..200 {
            match channel.complete_pending(OP_READ) {
                Completion::Fired => {
                    fired = true;
                    break;
                }
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
        assert!(fired);
        assert_eq!(worker.join().unwrap(), b"ping");
    }

    #[test]
    fn close_wakes_parked_worker() {
        let (_poll, channel, _client) = pair(Duration::from_secs(5));

        let worker = {
            let channel = channel.clone();
            thread::spawn(move || channel.read(&mut [0; 4], true).unwrap_err().kind())
        };
        while channel.pending.lock().is_none() {
            thread::yield_now();
        }

        assert!(channel.close());
        assert!(!channel.close());
        assert_eq!(worker.join().unwrap(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn writes_reach_peer_and_requests_are_counted() {
        let (_poll, channel, mut client) = pair(Duration::from_secs(1));

        assert!(channel.write(b"hello", true).unwrap());
        let mut buf = [0; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        assert_eq!(channel.begin_request(), 1);
        assert_eq!(channel.begin_request(), 2);
    }

    #[test]
    fn peer_close_is_end_of_stream() {
        let (_poll, channel, client) = pair(Duration::from_secs(1));
        drop(client);
        thread::sleep(Duration::from_millis(20));

        let err = channel.read(&mut [0; 4], false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
