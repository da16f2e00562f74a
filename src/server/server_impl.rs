use crate::{
    config::Config,
    errors::ErrorKind,
    http::action::Adapter,
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::{
        acceptor::Acceptor,
        admission::Admission,
        connection::{AllLimits, HttpProcessor},
        handler::{Handler, Processor, ProcessorFactory},
        poller::{Poller, PollerConfig, PollerShared},
        pool::WorkerPool,
    },
};
use mio::Poll;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{info, warn};

/// An HTTP/1.1 server: one acceptor thread, one poller thread and a fixed
/// worker pool running [`Adapter`]s.
///
/// # Examples
///
/// ```no_run
/// use minicat::{Adapter, Exchange, Server};
/// use std::sync::Arc;
///
/// struct Hello;
///
/// impl Adapter for Hello {
///     fn service(&self, exchange: &mut Exchange<'_>) -> anyhow::Result<()> {
///         exchange.response_mut().set_content_length(12);
///         exchange.write_body(b"Hello world!")?;
///         Ok(())
///     }
/// }
///
/// let handle = Server::builder()
///     .address("127.0.0.1:8080".parse().unwrap())
///     .adapter(Arc::new(Hello))
///     .build()
///     .launch()
///     .unwrap();
/// handle.join();
/// ```
pub struct Server {
    adapter: Option<Arc<dyn Adapter>>,
    server_limits: ServerLimits,
    limits: AllLimits,
}

impl Server {
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Binds the listener and starts the acceptor, poller and worker threads.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Setup`] when no adapter was set, [`ErrorKind::Io`] when
    /// the listener cannot be bound or a thread cannot be spawned.
    pub fn launch(self) -> Result<ServerHandle, ErrorKind> {
        let adapter = self.adapter.ok_or(ErrorKind::Setup("adapter not set"))?;
        let server = self.server_limits;
        let limits = self.limits;

        let listener = bind(&server)?;
        let local_addr = listener
            .local_addr()?
            .as_socket()
            .ok_or(ErrorKind::Setup("listener is not bound to an inet address"))?;

        let admission = Arc::new(Admission::new(server.max_connections));
        let blocking_timeout = limits.0.blocking_timeout;
        let socket_timeout = limits.0.socket_timeout;
        let factory: ProcessorFactory =
            Box::new(move || -> Box<dyn Processor> { Box::new(HttpProcessor::new(adapter.clone(), &limits)) });
        let handler = Arc::new(Handler::new(
            server.worker_threads.max(server.max_connections),
            factory,
        ));

        let pool = WorkerPool::new(server.worker_threads, server.worker_queue)?;
        let poll = Poll::new()?;
        let shared = Arc::new(PollerShared::new(&poll)?);
        let poller = Poller::new(
            poll,
            shared.clone(),
            handler,
            pool,
            admission.clone(),
            PollerConfig {
                max_events: server.max_events,
                poll_timeout: server.poll_timeout,
                sweep_interval: server.sweep_interval,
                socket_timeout,
            },
        );
        let poller = thread::Builder::new()
            .name("minicat-poller".into())
            .spawn(move || poller.run())?;

        let running = Arc::new(AtomicBool::new(true));
        let acceptor = Acceptor::new(
            listener,
            admission.clone(),
            shared.clone(),
            running.clone(),
            server.accept_timeout,
            blocking_timeout,
        );
        let acceptor = match thread::Builder::new()
            .name("minicat-acceptor".into())
            .spawn(move || acceptor.run())
        {
            Ok(acceptor) => acceptor,
            Err(e) => {
                shared.close();
                let _ = poller.join();
                return Err(e.into());
            }
        };

        info!(
            %local_addr,
            max_connections = server.max_connections,
            workers = server.worker_threads,
            "server started"
        );

        Ok(ServerHandle {
            local_addr,
            admission,
            shared,
            running,
            acceptor: Some(acceptor),
            poller: Some(poller),
        })
    }
}

fn bind(limits: &ServerLimits) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::for_address(limits.address),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&limits.address.into())?;
    socket.listen(i32::try_from(limits.backlog).unwrap_or(i32::MAX))?;
    // a timed accept lets the acceptor notice shutdown
    socket.set_read_timeout(Some(limits.accept_timeout.max(Duration::from_millis(1))))?;
    Ok(socket)
}

/// Control over a running [`Server`]. Dropping the handle shuts the server
/// down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    admission: Arc<Admission>,
    shared: Arc<PollerShared>,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound address, with the real port when port `0` was requested.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Free admission slots, `None` when connections are unlimited.
    ///
    /// While it waits in `accept` the acceptor holds one slot itself.
    #[inline]
    pub fn available_slots(&self) -> Option<usize> {
        self.admission.available()
    }

    /// Stops accepting, closes every connection and joins all threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Blocks until the server threads exit.
    pub fn join(mut self) {
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                warn!("poller thread panicked");
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                warn!("acceptor thread panicked");
            }
        }

        self.shared.close();
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                warn!("poller thread panicked");
            }
            info!(address = %self.local_addr, "server stopped");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builder for [`Server`].
///
/// Every limit group falls back to its defaults when not set.
#[derive(Default)]
pub struct ServerBuilder {
    adapter: Option<Arc<dyn Adapter>>,
    server_limits: ServerLimits,
    connection_limits: ConnLimits,
    request_limits: ReqLimits,
    response_limits: RespLimits,
}

impl ServerBuilder {
    /// Sets the adapter every request is handed to.
    ///
    /// **This is a required component.**
    #[inline]
    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Overrides [`ServerLimits::address`].
    #[inline]
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.server_limits.address = address;
        self
    }

    /// Configures listener, admission and worker pool limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use minicat::{Server, limits::ServerLimits};
    ///
    /// let builder = Server::builder().server_limits(ServerLimits {
    ///     max_connections: 256,
    ///     worker_threads: 8,
    ///     ..ServerLimits::default()
    /// });
    /// ```
    #[inline]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = limits;
        self
    }

    #[inline]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = limits;
        self
    }

    #[inline]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = limits;
        self
    }

    #[inline]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = limits;
        self
    }

    /// Applies every section of a loaded [`Config`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use minicat::{config::Config, Server};
    ///
    /// let config = Config::load("minicat.toml").unwrap();
    /// let builder = Server::builder().config(config);
    /// ```
    pub fn config(self, config: Config) -> Self {
        self.server_limits(config.server)
            .connection_limits(config.connection)
            .request_limits(config.request)
            .response_limits(config.response)
    }

    #[inline]
    pub fn build(self) -> Server {
        Server {
            adapter: self.adapter,
            server_limits: self.server_limits,
            limits: (
                self.connection_limits,
                self.request_limits,
                self.response_limits,
            ),
        }
    }
}
