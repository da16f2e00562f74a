//! Server configuration limits and timeouts
//!
//! # Defaults
//!
//! Defaults are sized for constrained demo and test environments: only two
//! concurrent connections are admitted and a keep-alive connection serves
//! ten requests before it is closed. Production deployments should raise
//! [`ServerLimits::max_connections`] considerably.
//!
//! # Memory Consumption
//!
//! Each live connection owns one processor, which holds:
//!
//! `Total` = [`Input window`](crate::limits::ReqLimits#input-window) +
//!           [`Output buffer`](crate::limits::RespLimits) +
//!           `Header map and parameter cache`
//!
//! # Examples
//!
//! ```no_run
//! use minicat::{Server, PipelineAdapter, Pipeline, limits::{ConnLimits, ServerLimits}};
//! use std::{sync::Arc, time::Duration};
//!
//! let handle = Server::builder()
//!     .adapter(Arc::new(PipelineAdapter::new(Pipeline::new())))
//!     .server_limits(ServerLimits {
//!         max_connections: 512,
//!         worker_threads: 16,
//!         ..ServerLimits::default()
//!     })
//!     .connection_limits(ConnLimits {
//!         socket_timeout: Duration::from_secs(30),
//!         ..ConnLimits::default()
//!     })
//!     .build()
//!     .launch()
//!     .unwrap();
//! handle.join();
//! ```

use serde::{Deserialize, Deserializer};
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 10393;

/// Controls listener, admission, multiplexer and worker pool behavior.
///
/// # Connection management
/// ```text
///  [------------]   slot free?   [--------]   register   [--------]
///  [  acquire   ] =============> [ accept ] ===========> [ poller ]
///  [------------]                [--------]              [--------]
///        /\                                                  ||
///        ||  release on close / eviction                     || ready
///        \\==================================================//
///                                                            \/
///                                                       [--------]
///                                                       [ worker ]
///                                                       [--------]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
    /// Listen address (default: `0.0.0.0:10393`).
    pub address: SocketAddr,

    /// Accept backlog passed to `listen(2)` (default: `100`).
    pub backlog: u32,

    /// Maximum number of concurrently admitted connections (default: `2`).
    ///
    /// The acceptor stops calling `accept` while every slot is taken, so further
    /// clients wait in the kernel backlog. `0` disables admission control.
    pub max_connections: usize,

    /// Number of worker threads executing processors (default: `4`).
    pub worker_threads: usize,

    /// Capacity of the queue between the poller and the workers (default: `64`).
    ///
    /// A ready channel that cannot be queued is closed and its slot released.
    pub worker_queue: usize,

    /// Upper bound of one readiness wait (default: `5 seconds`).
    #[serde(rename = "poll_timeout_ms", deserialize_with = "millis")]
    pub poll_timeout: Duration,

    /// Minimum interval between idle sweeps under load (default: `1 second`).
    #[serde(rename = "sweep_interval_ms", deserialize_with = "millis")]
    pub sweep_interval: Duration,

    /// How long one `accept` call may block before the acceptor re-checks
    /// whether the server is shutting down (default: `1 second`).
    #[serde(rename = "accept_timeout_ms", deserialize_with = "millis")]
    pub accept_timeout: Duration,

    /// Upper bound on readiness events drained per wait (default: `256`).
    pub max_events: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            backlog: 100,
            max_connections: 2, // demo sized
            worker_threads: 4,
            worker_queue: 64,
            poll_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            accept_timeout: Duration::from_secs(1),
            max_events: 256,
        }
    }
}

/// Connection-level limits and timeouts
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnLimits {
    /// Idle time after which the sweep evicts a channel (default: `60 seconds`)
    ///
    /// Only channels waiting for readiness are considered. A channel that a worker
    /// is currently processing is never evicted.
    #[serde(rename = "socket_timeout_ms", deserialize_with = "millis")]
    pub socket_timeout: Duration,

    /// Longest a worker waits for the poller during one blocking read or write
    /// (default: `20 seconds`)
    #[serde(rename = "blocking_timeout_ms", deserialize_with = "millis")]
    pub blocking_timeout: Duration,

    /// Requests served per connection before it is closed (default: `10`)
    ///
    /// `0` leaves the number of keep-alive requests unbounded.
    pub max_keep_alive_requests: usize,
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(60),
            blocking_timeout: Duration::from_secs(20),
            max_keep_alive_requests: 10,
        }
    }
}

/// Request parsing limits
///
/// # Input window
///
/// Each processor allocates one buffer of `max_header_size + body_window`
/// bytes. The request line and headers must fit in the first
/// `max_header_size` bytes; once they are parsed the space after the header
/// region is reused for body bytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReqLimits {
    /// Maximum size of the request line plus headers (default: `8192 B`)
    pub max_header_size: usize,

    /// Room for body bytes after the header region (default: `8192 B`)
    pub body_window: usize,

    /// Unread body bytes discarded after a response before the connection is
    /// given up (default: `1 MB`)
    pub max_swallow_size: usize,

    /// Maximum form body parsed into request parameters (default: `1 MB`)
    pub max_post_size: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_header_size: 8 * 1024,
            body_window: 8 * 1024,
            max_swallow_size: 1024 * 1024,
            max_post_size: 1024 * 1024,
        }
    }
}

impl ReqLimits {
    #[inline(always)]
    pub(crate) fn input_capacity(&self) -> usize {
        self.max_header_size + self.body_window
    }
}

/// Response serialization limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RespLimits {
    /// Output buffer size; a full buffer is flushed to the socket (default: `8192 B`)
    pub buffer_size: usize,

    /// Value of the `Server` header (default: `minicat/<version>`)
    pub server_header: String,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            server_header: concat!("minicat/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod limits_tests {
    use super::*;

    #[test]
    fn defaults() {
        let server = ServerLimits::default();
        assert_eq!(server.address.port(), DEFAULT_PORT);
        assert_eq!(server.max_connections, 2);
        assert_eq!(server.poll_timeout, Duration::from_secs(5));

        let conn = ConnLimits::default();
        assert_eq!(conn.max_keep_alive_requests, 10);

        let req = ReqLimits::default();
        assert_eq!(req.max_header_size, 8192);
        assert_eq!(req.max_swallow_size, 1 << 20);
        assert_eq!(req.input_capacity(), 16 * 1024);

        assert!(RespLimits::default().server_header.starts_with("minicat/"));
    }
}
