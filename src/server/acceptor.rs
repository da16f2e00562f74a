use crate::server::{admission::Admission, channel::Channel, poller::PollerShared};
use socket2::{SockAddr, Socket};
use std::{
    io,
    net::{SocketAddr, TcpStream as StdStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{debug, trace, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts connections while admission slots are free and hands them to the
/// poller.
pub(crate) struct Acceptor {
    listener: Socket,
    admission: Arc<Admission>,
    poller: Arc<PollerShared>,
    running: Arc<AtomicBool>,
    accept_timeout: Duration,
    blocking_timeout: Duration,
}

impl Acceptor {
    pub(crate) fn new(
        listener: Socket,
        admission: Arc<Admission>,
        poller: Arc<PollerShared>,
        running: Arc<AtomicBool>,
        accept_timeout: Duration,
        blocking_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            admission,
            poller,
            running,
            accept_timeout,
            blocking_timeout,
        }
    }

    pub(crate) fn run(self) {
        debug!("acceptor started");

        while self.running.load(Ordering::Acquire) {
            // wait for a slot; a full server stops accepting
            if !self.admission.acquire_timeout(self.accept_timeout) {
                continue;
            }

            match self.listener.accept() {
                Ok((socket, addr)) => {
                    if let Err(e) = self.admit(socket, &addr) {
                        warn!(error = %e, "failed to set up accepted connection");
                        self.admission.release();
                    }
                }
                Err(e) if is_timeout(&e) => {
                    trace!("accept timed out");
                    self.admission.release();
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    self.admission.release();
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }
        debug!("acceptor stopped");
    }

    fn admit(&self, socket: Socket, addr: &SockAddr) -> io::Result<()> {
        let peer: SocketAddr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"))?;

        let stream: StdStream = socket.into();
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let token = self.poller.allocate_token();
        let channel = Channel::new(
            mio::net::TcpStream::from_std(stream),
            peer,
            token,
            self.poller.clone(),
            self.blocking_timeout,
        );
        self.poller.register(Arc::new(channel));
        debug!(token = token.0, %peer, "connection accepted");
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
