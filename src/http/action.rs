//! The seam between the protocol processor and request-handling code.
//!
//! Adapters never touch sockets. Everything that moves bytes or changes the
//! connection goes through an [`ActionCode`] sent to the processor's
//! [`ActionHook`].

use crate::{
    errors::ErrorKind,
    http::{request::RawRequest, response::RawResponse},
};
use std::collections::HashMap;

/// Operations an adapter can ask of the processor.
#[derive(Debug)]
pub enum ActionCode<'a> {
    /// Sends `100 Continue` if the client asked for it.
    Ack,
    /// Serializes the status line and headers.
    Commit,
    /// Commits, terminates the body and flushes.
    Close,
    /// Parses query and form parameters into the request.
    ParseParams,
    /// Commits, then frames the bytes as body.
    WriteBody(&'a [u8]),
    /// Reads decoded body bytes; `0` marks the end of the body.
    ReadBody(&'a mut [u8]),
    /// Commits and pushes buffered output to the socket.
    Flush,
}

/// Receiver of [`ActionCode`]s. Implemented by the protocol processor.
pub trait ActionHook {
    /// Returns the number of bytes moved for body actions, `0` otherwise.
    fn action(
        &mut self,
        code: ActionCode<'_>,
        request: &mut RawRequest,
        response: &mut RawResponse,
    ) -> Result<usize, ErrorKind>;
}

/// One request/response pair plus the hook that services it.
pub struct Exchange<'a> {
    request: &'a mut RawRequest,
    response: &'a mut RawResponse,
    hook: &'a mut dyn ActionHook,
}

impl<'a> Exchange<'a> {
    pub fn new(
        request: &'a mut RawRequest,
        response: &'a mut RawResponse,
        hook: &'a mut dyn ActionHook,
    ) -> Self {
        Self {
            request,
            response,
            hook,
        }
    }

    #[inline]
    pub fn request(&self) -> &RawRequest {
        self.request
    }

    #[inline]
    pub fn response(&self) -> &RawResponse {
        self.response
    }

    /// Status and headers may be changed until the response is committed.
    #[inline]
    pub fn response_mut(&mut self) -> &mut RawResponse {
        self.response
    }

    #[inline]
    pub fn action(&mut self, code: ActionCode<'_>) -> Result<usize, ErrorKind> {
        self.hook.action(code, self.request, self.response)
    }

    #[inline]
    pub fn ack(&mut self) -> Result<(), ErrorKind> {
        self.action(ActionCode::Ack).map(drop)
    }

    #[inline]
    pub fn commit(&mut self) -> Result<(), ErrorKind> {
        self.action(ActionCode::Commit).map(drop)
    }

    #[inline]
    pub fn write_body(&mut self, src: &[u8]) -> Result<usize, ErrorKind> {
        self.action(ActionCode::WriteBody(src))
    }

    /// Reads into `dst`; `Ok(0)` marks the end of the body (or an empty `dst`).
    #[inline]
    pub fn read_body(&mut self, dst: &mut [u8]) -> Result<usize, ErrorKind> {
        self.action(ActionCode::ReadBody(dst))
    }

    #[inline]
    pub fn flush(&mut self) -> Result<(), ErrorKind> {
        self.action(ActionCode::Flush).map(drop)
    }

    /// Finishes the response. Later writes are dropped.
    #[inline]
    pub fn close(&mut self) -> Result<(), ErrorKind> {
        self.action(ActionCode::Close).map(drop)
    }

    /// Query and form parameters, parsed on first use.
    pub fn parameters(&mut self) -> Result<&HashMap<String, String>, ErrorKind> {
        if !self.request.parameters_parsed {
            self.action(ActionCode::ParseParams)?;
        }
        Ok(&self.request.parameters)
    }

    pub fn parameter(&mut self, name: &str) -> Result<Option<&str>, ErrorKind> {
        Ok(self.parameters()?.get(name).map(String::as_str))
    }
}

/// Entry point of the container layer.
///
/// # Examples
/// ```
/// use minicat::{Adapter, Exchange};
///
/// struct Hello;
///
/// impl Adapter for Hello {
///     fn service(&self, exchange: &mut Exchange<'_>) -> anyhow::Result<()> {
///         exchange
///             .response_mut()
///             .set_content_type("text/plain")
///             .set_content_length(5);
///         exchange.write_body(b"hello")?;
///         Ok(())
///     }
/// }
/// ```
pub trait Adapter: Send + Sync {
    fn service(&self, exchange: &mut Exchange<'_>) -> anyhow::Result<()>;
}
