use crate::{
    errors::ErrorKind,
    http::{
        action::{ActionCode, ActionHook, Adapter, Exchange},
        codec::{BodyCodec, ChunkedCodec, IdentityCodec},
        input::InputBuffer,
        output::OutputBuffer,
        request::RawRequest,
        response::RawResponse,
        types::{slice_to_usize, CONTINUE, HTTP_11},
    },
    limits::{ConnLimits, ReqLimits, RespLimits},
    server::{
        channel::ChannelIo,
        handler::{Processor, SocketState},
    },
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, error, trace, warn};

pub(crate) type AllLimits = (ConnLimits, ReqLimits, RespLimits);

/// HTTP/1.1 protocol state machine for one connection at a time.
///
/// Owns one request/response pair and both buffers, all reused across the
/// requests of a connection and across connections.
pub(crate) struct HttpProcessor {
    adapter: Arc<dyn Adapter>,
    request: RawRequest,
    response: RawResponse,
    conn: Conn,

    max_keep_alive_requests: usize,
    /// Outcome to report once staged output drains.
    resume: Option<SocketState>,
}

/// Per-request connection state reachable from the action hook.
struct Conn {
    input: InputBuffer,
    output: OutputBuffer,
    keep_alive: bool,
    error: bool,
    acked: bool,
}

impl HttpProcessor {
    pub(crate) fn new(adapter: Arc<dyn Adapter>, limits: &AllLimits) -> Self {
        let (conn_limits, req_limits, resp_limits) = limits;
        Self {
            adapter,
            request: RawRequest::new(),
            response: RawResponse::new(),
            conn: Conn {
                input: InputBuffer::new(req_limits),
                output: OutputBuffer::new(resp_limits),
                keep_alive: false,
                error: false,
                acked: false,
            },
            max_keep_alive_requests: conn_limits.max_keep_alive_requests,
            resume: None,
        }
    }

    fn service(&mut self, io: &dyn ChannelIo) -> SocketState {
        if let Some(resumed) = self.resume {
            match io.flush_staged(false) {
                Ok(false) => return SocketState::WritePending,
                Ok(true) => self.resume = None,
                Err(e) => {
                    debug!(error = %e, "write failed while draining response");
                    return SocketState::Closed;
                }
            }
            if resumed != SocketState::KeepAlive || !self.conn.input.has_buffered() {
                return resumed;
            }
        }

        loop {
            match self.conn.input.parse_headers(&mut self.request, io) {
                Ok(true) => {}
                Ok(false) if self.conn.input.is_idle() => return SocketState::KeepAlive,
                Ok(false) => return SocketState::NeedMoreData,
                Err(e) => {
                    reject(io, &e);
                    return SocketState::Closed;
                }
            }

            self.conn.keep_alive = true;
            self.conn.error = false;
            self.conn.acked = false;
            let served = io.begin_request();

            if let Err(e) = self.prepare_request() {
                debug!(error = %e, uri = self.request.uri(), "request failed validation");
                self.conn.error = true;
                self.response.set_status(e.status()).set_content_length(0);
            }

            if self.max_keep_alive_requests > 0 && served >= self.max_keep_alive_requests {
                self.conn.keep_alive = false;
            }

            if !self.conn.error {
                self.invoke_adapter(io);
            }

            if let Err(e) = self.conn.input.end(io) {
                debug!(error = %e, "failed to finish request body");
                self.conn.error = true;
                if self.response.reset().is_ok() {
                    self.response.set_status(e.status()).set_content_length(0);
                }
            }

            let flushed = match self.finish(io) {
                Ok(flushed) => flushed,
                Err(e) => {
                    debug!(error = %e, "failed to write response");
                    return SocketState::Closed;
                }
            };

            let close = self.conn.error || !self.conn.keep_alive;
            trace!(served, close, flushed, "request complete");
            self.request.recycle();
            self.response.recycle();
            self.conn.output.recycle();
            self.conn.input.recycle();

            if !flushed {
                self.resume = Some(match close {
                    true => SocketState::Closed,
                    false => SocketState::KeepAlive,
                });
                return SocketState::WritePending;
            }
            if close {
                return SocketState::Closed;
            }
            if !self.conn.input.has_buffered() {
                return SocketState::KeepAlive;
            }
            // pipelined request already buffered
        }
    }

    /// Validates the parsed head and selects the body codec.
    fn prepare_request(&mut self) -> Result<(), ErrorKind> {
        let request = &mut self.request;

        if request.protocol() != HTTP_11 {
            return Err(ErrorKind::UnsupportedVersion);
        }

        match request.header("connection") {
            None | Some("close") => self.conn.keep_alive = false,
            Some("keep-alive") => self.conn.keep_alive = true,
            Some(_) => {}
        }

        let chunked = request
            .header("transfer-encoding")
            .is_some_and(|te| te.contains("chunked"));

        let codec: Option<Box<dyn BodyCodec>> = if chunked {
            if request.remove_header("content-length").is_some() {
                debug!("content-length dropped in favour of chunked transfer coding");
            }
            request.content_length = None;
            Some(Box::new(ChunkedCodec::new()))
        } else if let Some(value) = request.header("content-length") {
            let len = slice_to_usize(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?;
            request.content_length = Some(len);
            Some(Box::new(IdentityCodec::new(len as u64)))
        } else {
            None
        };
        self.conn.input.set_codec(codec);

        match request.header("host") {
            Some(host) if !host.is_empty() => Ok(()),
            _ => Err(ErrorKind::MissingHost),
        }
    }

    fn invoke_adapter(&mut self, io: &dyn ChannelIo) {
        let adapter = &self.adapter;
        let mut wire = Wire {
            conn: &mut self.conn,
            io,
        };
        let mut exchange = Exchange::new(&mut self.request, &mut self.response, &mut wire);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| adapter.service(&mut exchange)));

        match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => warn!(error = %e, uri = self.request.uri(), "adapter failed"),
            Err(_) => error!(uri = self.request.uri(), "adapter panicked"),
        }

        self.conn.error = true;
        if self.response.reset().is_ok() {
            self.response.set_status(500u16).set_content_length(0);
        }
    }

    /// Commits if needed, terminates the body and flushes without blocking.
    fn finish(&mut self, io: &dyn ChannelIo) -> Result<bool, ErrorKind> {
        let keep_alive = self.conn.keep_alive && !self.conn.error;
        self.conn.output.commit(&mut self.response, io, keep_alive)?;
        self.conn.output.end(io, false)
    }
}

impl Processor for HttpProcessor {
    #[inline]
    fn process(&mut self, io: &dyn ChannelIo) -> SocketState {
        self.service(io)
    }

    fn recycle(&mut self) {
        self.request.recycle();
        self.response.recycle();
        self.conn.input.reset();
        self.conn.output.recycle();
        self.conn.keep_alive = false;
        self.conn.error = false;
        self.conn.acked = false;
        self.resume = None;
    }
}

/// Best-effort canned response for a request that could not be parsed.
fn reject(io: &dyn ChannelIo, error: &ErrorKind) {
    if error.is_transport() {
        trace!(error = %error, "connection ended");
        return;
    }
    debug!(error = %error, "rejecting malformed request");
    let _ = io.write(error.as_http(), false);
}

/// Action hook handed to the adapter for the duration of one request.
struct Wire<'a> {
    conn: &'a mut Conn,
    io: &'a dyn ChannelIo,
}

impl Wire<'_> {
    /// Sends `100 Continue` once, before anything else was written.
    fn ack(&mut self, request: &RawRequest, response: &RawResponse) -> Result<(), ErrorKind> {
        if self.conn.acked || response.is_committed() {
            return Ok(());
        }
        self.conn.acked = true;
        if request.header("expect") == Some("100-continue") {
            self.io.write(CONTINUE, true)?;
        }
        Ok(())
    }

    #[inline]
    fn commit(&mut self, response: &mut RawResponse) -> Result<(), ErrorKind> {
        self.conn.output.commit(response, self.io, self.conn.keep_alive)
    }
}

impl ActionHook for Wire<'_> {
    fn action(
        &mut self,
        code: ActionCode<'_>,
        request: &mut RawRequest,
        response: &mut RawResponse,
    ) -> Result<usize, ErrorKind> {
        match code {
            ActionCode::Ack => self.ack(request, response).map(|_| 0),
            ActionCode::Commit => self.commit(response).map(|_| 0),
            ActionCode::Close => {
                self.commit(response)?;
                self.conn.output.end(self.io, true)?;
                Ok(0)
            }
            ActionCode::ParseParams => {
                self.ack(request, response)?;
                self.conn.input.parse_parameters(request, self.io)?;
                Ok(0)
            }
            ActionCode::WriteBody(src) => {
                self.commit(response)?;
                self.conn.output.write(self.io, src)
            }
            ActionCode::ReadBody(dst) => {
                if dst.is_empty() {
                    return Ok(0);
                }
                self.ack(request, response)?;
                match self.conn.input.read_body(self.io, dst.len())? {
                    Some(src) => {
                        dst[..src.len()].copy_from_slice(src);
                        Ok(src.len())
                    }
                    None => Ok(0),
                }
            }
            ActionCode::Flush => {
                self.commit(response)?;
                self.conn.output.flush(self.io, true)?;
                Ok(0)
            }
        }
    }
}
