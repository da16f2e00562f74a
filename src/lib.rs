//! minicat - request-handling engine of a minimal application server
//!
//! An event-driven network layer and an HTTP/1.1 wire-protocol state machine
//! beneath a servlet-style container: connections are admitted under a
//! connection limit, readiness is demultiplexed by a single `mio` poller, and
//! a bounded worker pool parses pipelined keep-alive requests and hands them
//! to a pluggable [`Adapter`].
//!
//! # Architecture
//!
//! ```text
//!  acceptor ──> poller ──> worker pool ──> handler ──> processor ──> adapter
//!     ^           |                                       |
//!     |           └──── blocking-simulated I/O <──────────┘
//!     └── admission slot released on close / eviction
//! ```
//!
//! - **Acceptor** - blocking accept, gated by admission slots
//! - **Poller** - owns the readiness set, evicts idle connections
//! - **Handler** - binds a processor to a connection while a request is in flight
//! - **Processor** - request-line/header parser, body codecs, keep-alive loop
//! - **Pipeline** - ordered [`Valve`]s ending in a fixed basic valve
//!
//! # Protocol Support
//!
//! - **HTTP/1.1** only; any other version is answered with `505`
//! - `Content-Length` and `chunked` request and response bodies
//! - `Expect: 100-continue`, pipelined requests, bounded keep-alive
//!
//! # Examples
//!
//! ```no_run
//! use minicat::{ErrorReportValve, Exchange, Next, Pipeline, PipelineAdapter, Server, Valve};
//! use std::sync::Arc;
//!
//! struct Hello;
//!
//! impl Valve for Hello {
//!     fn invoke(&self, exchange: &mut Exchange<'_>, _: Next<'_>) -> anyhow::Result<()> {
//!         let body = format!("Hello {}!", exchange.request().uri());
//!         exchange
//!             .response_mut()
//!             .set_content_type("text/plain")
//!             .set_content_length(body.len() as u64);
//!         exchange.write_body(body.as_bytes())?;
//!         Ok(())
//!     }
//! }
//!
//! let mut pipeline = Pipeline::new();
//! pipeline
//!     .set_basic(Arc::new(Hello))
//!     .add_valve(Arc::new(ErrorReportValve));
//!
//! let handle = Server::builder()
//!     .address("127.0.0.1:8080".parse().unwrap())
//!     .adapter(Arc::new(PipelineAdapter::new(pipeline)))
//!     .build()
//!     .launch()
//!     .unwrap();
//! handle.join();
//! ```

pub(crate) mod http {
    pub(crate) mod action;
    pub(crate) mod codec;
    pub(crate) mod input;
    pub(crate) mod output;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod acceptor;
    pub(crate) mod admission;
    pub(crate) mod channel;
    pub(crate) mod connection;
    pub(crate) mod handler;
    pub(crate) mod poller;
    pub(crate) mod pool;
    pub(crate) mod server_impl;
}
pub(crate) mod container {
    pub(crate) mod adapter;
    pub(crate) mod error_report;
    pub(crate) mod pipeline;
}
pub mod config;
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    container::{
        adapter::PipelineAdapter,
        error_report::ErrorReportValve,
        pipeline::{Next, Pipeline, Valve},
    },
    errors::{ErrorKind, IoError},
    http::{
        action::{ActionCode, ActionHook, Adapter, Exchange},
        request::RawRequest,
        response::RawResponse,
        types::StatusCode,
    },
    server::server_impl::{Server, ServerBuilder, ServerHandle},
};

#[cfg(test)]
pub(crate) mod tools {
    use crate::server::channel::ChannelIo;
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        io, mem,
    };

    /// Scripted transport. Every read returns bytes of at most one fragment;
    /// a non-blocking read with nothing left reports `0`, a blocking one
    /// reports end of stream.
    pub(crate) struct MockChannel {
        fragments: RefCell<VecDeque<Vec<u8>>>,
        staged: RefCell<Vec<u8>>,
        written: RefCell<Vec<u8>>,
        stalls: Cell<usize>,
        requests: Cell<usize>,
    }

    impl MockChannel {
        pub(crate) fn new(fragments: &[&[u8]]) -> Self {
            Self {
                fragments: RefCell::new(fragments.iter().map(|f| f.to_vec()).collect()),
                staged: RefCell::default(),
                written: RefCell::default(),
                stalls: Cell::new(0),
                requests: Cell::new(0),
            }
        }

        pub(crate) fn push(&self, fragment: &[u8]) {
            self.fragments.borrow_mut().push_back(fragment.to_vec());
        }

        /// The next `count` non-blocking flushes leave their bytes staged.
        pub(crate) fn stall_writes(&self, count: usize) {
            self.stalls.set(count);
        }

        pub(crate) fn written(&self) -> Vec<u8> {
            self.written.borrow().clone()
        }
    }

    impl ChannelIo for MockChannel {
        fn read(&self, dst: &mut [u8], block: bool) -> io::Result<usize> {
            let mut fragments = self.fragments.borrow_mut();
            while fragments.front().is_some_and(Vec::is_empty) {
                fragments.pop_front();
            }

            let Some(front) = fragments.front_mut() else {
                return match block {
                    true => Err(io::ErrorKind::UnexpectedEof.into()),
                    false => Ok(0),
                };
            };
            let n = front.len().min(dst.len());
            dst[..n].copy_from_slice(&front[..n]);
            front.drain(..n);
            Ok(n)
        }

        fn write(&self, src: &[u8], block: bool) -> io::Result<bool> {
            self.staged.borrow_mut().extend_from_slice(src);
            self.flush_staged(block)
        }

        fn flush_staged(&self, block: bool) -> io::Result<bool> {
            if self.staged.borrow().is_empty() {
                return Ok(true);
            }
            if !block && self.stalls.get() > 0 {
                self.stalls.set(self.stalls.get() - 1);
                return Ok(false);
            }
            let staged = mem::take(&mut *self.staged.borrow_mut());
            self.written.borrow_mut().extend_from_slice(&staged);
            Ok(true)
        }

        fn begin_request(&self) -> usize {
            self.requests.set(self.requests.get() + 1);
            self.requests.get()
        }
    }
}
