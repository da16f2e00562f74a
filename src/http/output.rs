//! Response head serialization and body framing over the write window.

use crate::{
    errors::ErrorKind,
    http::{
        codec::{BodyCodec, ChunkedCodec, IdentityCodec},
        response::RawResponse,
        types::{is_bodiless, trim, CRLF, HTTP_11, SEMI_COLON},
    },
    limits::RespLimits,
    server::channel::ChannelIo,
};
use memchr::memchr_iter;
use std::iter;

/// Bounded staging area in front of the channel.
pub(crate) struct WriteWindow {
    buf: Vec<u8>,
    capacity: usize,
}

impl WriteWindow {
    #[inline]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `src`, flushing with blocking semantics whenever the window
    /// fills up.
    pub(crate) fn put(&mut self, io: &dyn ChannelIo, mut src: &[u8]) -> Result<(), ErrorKind> {
        while !src.is_empty() {
            if self.buf.len() >= self.capacity {
                self.flush(io, true)?;
            }
            let n = (self.capacity - self.buf.len()).min(src.len());
            self.buf.extend_from_slice(&src[..n]);
            src = &src[n..];
        }
        Ok(())
    }

    /// Hands the window to the channel. Returns `true` when the channel has
    /// nothing left staged.
    pub(crate) fn flush(&mut self, io: &dyn ChannelIo, block: bool) -> Result<bool, ErrorKind> {
        if self.buf.is_empty() {
            return Ok(io.flush_staged(block)?);
        }
        let done = io.write(&self.buf, block)?;
        self.buf.clear();
        Ok(done)
    }

    #[inline]
    fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Serializes the response head and frames the body.
pub(crate) struct OutputBuffer {
    window: WriteWindow,
    codec: Option<Box<dyn BodyCodec>>,
    finished: bool,
    server_header: String,
}

impl OutputBuffer {
    pub(crate) fn new(limits: &RespLimits) -> Self {
        Self {
            window: WriteWindow::new(limits.buffer_size),
            codec: None,
            finished: false,
            server_header: limits.server_header.clone(),
        }
    }

    /// Writes the status line and headers. A no-op once committed.
    pub(crate) fn commit(
        &mut self,
        response: &mut RawResponse,
        io: &dyn ChannelIo,
        keep_alive: bool,
    ) -> Result<(), ErrorKind> {
        if response.committed {
            return Ok(());
        }
        response.committed = true;
        self.prepare(response, keep_alive);

        let status_line = format!("{HTTP_11} {} {}\r\n", response.status(), response.message());
        self.window.put(io, status_line.as_bytes())?;

        for (name, value) in response.headers() {
            if !name.eq_ignore_ascii_case("set-cookie") {
                self.put_header(io, name, value.as_bytes())?;
                continue;
            }

            // every `;`-separated part becomes its own header line
            let value = value.as_bytes();
            let mut start = 0;
            for end in memchr_iter(SEMI_COLON, value).chain(iter::once(value.len())) {
                let part = trim(&value[start..end]);
                start = end + 1;
                if !part.is_empty() {
                    self.put_header(io, name, part)?;
                }
            }
        }
        self.window.put(io, CRLF)
    }

    /// Derives the framing headers and picks the body codec.
    fn prepare(&mut self, response: &mut RawResponse, keep_alive: bool) {
        if is_bodiless(response.status()) {
            response.remove_header("content-length");
            response.remove_header("transfer-encoding");
            self.codec = None;
        } else {
            if let Some(content_type) = response.content_type() {
                let value = match response.character_encoding() {
                    Some(charset) if !content_type.contains("charset") => {
                        format!("{content_type};charset={charset}")
                    }
                    _ => content_type.to_owned(),
                };
                response.set_header("Content-Type", value);
            }
            if let Some(language) = response.content_language().map(str::to_owned) {
                response.set_header("Content-Language", language);
            }

            match response.content_length() {
                Some(len) => {
                    response.remove_header("transfer-encoding");
                    response.set_header("Content-Length", len.to_string());
                    self.codec = Some(Box::new(IdentityCodec::new(len)));
                }
                None => {
                    response.remove_header("content-length");
                    response.set_header("Transfer-Encoding", "chunked");
                    self.codec = Some(Box::new(ChunkedCodec::new()));
                }
            }
        }

        if !keep_alive {
            response.set_header("Connection", "close");
        }
        if response.header("server").is_none() {
            response.set_header("Server", self.server_header.as_str());
        }
    }

    fn put_header(&mut self, io: &dyn ChannelIo, name: &str, value: &[u8]) -> Result<(), ErrorKind> {
        self.window.put(io, name.as_bytes())?;
        self.window.put(io, b": ")?;
        self.window.put(io, value)?;
        self.window.put(io, CRLF)
    }

    /// Frames `src` as body bytes. Bodies of body-less statuses and writes
    /// after `end` are dropped.
    pub(crate) fn write(&mut self, io: &dyn ChannelIo, src: &[u8]) -> Result<usize, ErrorKind> {
        if self.finished {
            return Ok(0);
        }
        match self.codec.as_mut() {
            Some(codec) => codec.write(&mut self.window, io, src),
            None => Ok(0),
        }
    }

    #[inline]
    pub(crate) fn flush(&mut self, io: &dyn ChannelIo, block: bool) -> Result<bool, ErrorKind> {
        self.window.flush(io, block)
    }

    /// Terminates the body once and flushes. Returns `true` when every byte
    /// reached the socket.
    pub(crate) fn end(&mut self, io: &dyn ChannelIo, block: bool) -> Result<bool, ErrorKind> {
        if !self.finished {
            self.finished = true;
            if let Some(codec) = self.codec.as_mut() {
                codec.end_write(&mut self.window, io)?;
            }
        }
        self.window.flush(io, block)
    }

    pub(crate) fn recycle(&mut self) {
        self.window.clear();
        self.codec = None;
        self.finished = false;
    }
}
