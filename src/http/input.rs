//! Incremental request-line and header parser.
//!
//! ```text
//! method -> uri -> (query) -> version -> header-end <-> header-name -> header-value
//!                                            |
//!                                            v
//!                                          done
//! ```
//!
//! Bytes are consumed one at a time, so a request split at any byte boundary
//! parses exactly like the same request delivered in one read.

use crate::{
    errors::ErrorKind,
    http::{
        codec::BodyCodec,
        request::RawRequest,
        types::{lowercase_text, text, trim, COLON, CR, LF, QUESTION, SP},
    },
    limits::ReqLimits,
    server::channel::ChannelIo,
};
use memchr::memchr;
use std::{collections::HashMap, ops::Range};

/// Cursor over the processor's single input allocation.
///
/// The first `max_header_size` bytes hold the header region. Once headers are
/// parsed, body reads reuse everything after `header_end`.
pub(crate) struct ReadWindow {
    buf: Box<[u8]>,
    pos: usize,
    end: usize,
    header_end: usize,
    parsing_header: bool,
    max_header_size: usize,
}

impl ReadWindow {
    fn new(limits: &ReqLimits) -> Self {
        Self {
            buf: vec![0; limits.input_capacity()].into_boxed_slice(),
            pos: 0,
            end: 0,
            header_end: 0,
            parsing_header: true,
            max_header_size: limits.max_header_size,
        }
    }

    #[inline]
    pub(crate) fn buffered(&self) -> usize {
        self.end - self.pos
    }

    #[inline]
    pub(crate) fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Reads more bytes. Returns `false` if a non-blocking read found nothing.
    pub(crate) fn fill(&mut self, io: &dyn ChannelIo, block: bool) -> Result<bool, ErrorKind> {
        let n = if self.parsing_header {
            if self.end >= self.max_header_size {
                return Err(ErrorKind::HeaderTooLarge);
            }
            io.read(&mut self.buf[self.end..self.max_header_size], block)?
        } else {
            if self.pos >= self.end {
                self.pos = self.header_end;
                self.end = self.header_end;
            }
            io.read(&mut self.buf[self.end..], block)?
        };
        self.end += n;
        Ok(n > 0)
    }

    /// Consumes up to `max` bytes, blocking for more if nothing is buffered.
    pub(crate) fn take(&mut self, max: usize, io: &dyn ChannelIo) -> Result<Range<usize>, ErrorKind> {
        if max == 0 {
            return Ok(self.pos..self.pos);
        }
        if self.pos >= self.end {
            self.fill(io, true)?;
        }
        let n = max.min(self.buffered());
        let range = self.pos..self.pos + n;
        self.pos += n;
        Ok(range)
    }

    /// Consumes whatever is buffered without touching the channel.
    fn take_buffered(&mut self, max: usize) -> Option<Range<usize>> {
        let n = max.min(self.buffered());
        if n == 0 {
            return None;
        }
        let range = self.pos..self.pos + n;
        self.pos += n;
        Some(range)
    }

    pub(crate) fn next_byte(&mut self, io: &dyn ChannelIo) -> Result<u8, ErrorKind> {
        if self.pos >= self.end {
            self.fill(io, true)?;
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Advances to the next `byte` among the buffered bytes (leaving it
    /// unread), or to the end of the buffered bytes.
    pub(crate) fn skip_until(&mut self, byte: u8) {
        match memchr(byte, &self.buf[self.pos..self.end]) {
            Some(i) => self.pos += i,
            None => self.pos = self.end,
        }
    }

    /// Moves pipelined bytes to the front and re-enters header mode.
    fn compact(&mut self) {
        self.buf.copy_within(self.pos..self.end, 0);
        self.end -= self.pos;
        self.pos = 0;
        self.header_end = 0;
        self.parsing_header = true;
    }

    fn clear(&mut self) {
        self.pos = 0;
        self.end = 0;
        self.header_end = 0;
        self.parsing_header = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Method,
    Uri,
    Query,
    Version,
    HeaderName,
    HeaderValue,
    HeaderEnd,
    Done,
}

pub(crate) struct InputBuffer {
    window: ReadWindow,
    state: ParseState,
    mark: usize,
    name: Range<usize>,
    codec: Option<Box<dyn BodyCodec>>,
    max_swallow_size: usize,
    max_post_size: usize,
}

impl InputBuffer {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            window: ReadWindow::new(limits),
            state: ParseState::Method,
            mark: 0,
            name: 0..0,
            codec: None,
            max_swallow_size: limits.max_swallow_size,
            max_post_size: limits.max_post_size,
        }
    }

    /// Parses as far as the buffered and non-blocking readable bytes allow.
    /// Returns `true` once the blank line ending the headers was consumed.
    pub(crate) fn parse_headers(
        &mut self,
        request: &mut RawRequest,
        io: &dyn ChannelIo,
    ) -> Result<bool, ErrorKind> {
        while self.state != ParseState::Done {
            if self.window.pos >= self.window.end && !self.window.fill(io, false)? {
                return Ok(false);
            }

            let byte = self.window.buf[self.window.pos];
            self.window.pos += 1;
            if self.window.pos > self.window.max_header_size {
                return Err(ErrorKind::HeaderTooLarge);
            }
            self.advance(byte, request)?;
        }
        Ok(true)
    }

    fn advance(&mut self, byte: u8, request: &mut RawRequest) -> Result<(), ErrorKind> {
        let pos = self.window.pos;
        // token bytes seen so far, excluding the current delimiter
        let token = self.mark..pos - 1;

        match (self.state, byte) {
            (ParseState::Method, SP) => {
                if token.is_empty() {
                    return Err(ErrorKind::InvalidMethod);
                }
                request.method = self.text(token).ok_or(ErrorKind::InvalidMethod)?;
                self.mark = pos;
                self.state = ParseState::Uri;
            }
            (ParseState::Method, CR | LF) => return Err(ErrorKind::InvalidMethod),

            (ParseState::Uri, SP | QUESTION) => {
                if token.is_empty() {
                    return Err(ErrorKind::InvalidUri);
                }
                request.uri = self.text(token).ok_or(ErrorKind::InvalidUri)?;
                self.mark = pos;
                self.state = match byte {
                    QUESTION => ParseState::Query,
                    _ => ParseState::Version,
                };
            }
            (ParseState::Uri | ParseState::Query, CR | LF) => return Err(ErrorKind::InvalidUri),

            (ParseState::Query, SP) => {
                request.query = Some(self.text(token).ok_or(ErrorKind::InvalidUri)?);
                self.mark = pos;
                self.state = ParseState::Version;
            }

            (ParseState::Version, LF) => {
                let version = trim(&self.window.buf[token]);
                request.protocol = text(version).ok_or(ErrorKind::UnsupportedVersion)?;
                self.state = ParseState::HeaderEnd;
            }

            (ParseState::HeaderEnd, CR) => {}
            (ParseState::HeaderEnd, COLON) => return Err(ErrorKind::InvalidHeader),
            (ParseState::HeaderEnd, LF) => {
                self.window.header_end = pos;
                self.window.parsing_header = false;
                self.state = ParseState::Done;
            }
            (ParseState::HeaderEnd, _) => {
                self.mark = pos - 1;
                self.state = ParseState::HeaderName;
            }

            (ParseState::HeaderName, COLON) => {
                if token.is_empty() {
                    return Err(ErrorKind::InvalidHeader);
                }
                self.name = token;
                self.mark = pos;
                self.state = ParseState::HeaderValue;
            }
            (ParseState::HeaderName, LF) => return Err(ErrorKind::InvalidHeader),

            (ParseState::HeaderValue, LF) => {
                let name = lowercase_text(trim(&self.window.buf[self.name.clone()]))
                    .ok_or(ErrorKind::InvalidHeader)?;
                let value = lowercase_text(trim(&self.window.buf[token]))
                    .ok_or(ErrorKind::InvalidHeader)?;
                request.set_header(name, value);
                self.state = ParseState::HeaderEnd;
            }

            _ => {}
        }
        Ok(())
    }

    #[inline]
    fn text(&self, range: Range<usize>) -> Option<String> {
        text(&self.window.buf[range])
    }

    #[inline]
    pub(crate) fn set_codec(&mut self, codec: Option<Box<dyn BodyCodec>>) {
        self.codec = codec;
    }

    /// Nothing of the next request has arrived yet.
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.state == ParseState::Method && self.window.end == 0
    }

    /// Bytes past the current request are already buffered.
    #[inline]
    pub(crate) fn has_buffered(&self) -> bool {
        self.window.buffered() > 0
    }

    /// Reads at most `max` body bytes. `None` marks the end of the body.
    ///
    /// Without a codec only the bytes already buffered are returned.
    pub(crate) fn read_body(
        &mut self,
        io: &dyn ChannelIo,
        max: usize,
    ) -> Result<Option<&[u8]>, ErrorKind> {
        debug_assert_eq!(self.state, ParseState::Done);
        let range = match self.codec.as_mut() {
            Some(codec) => codec.read(&mut self.window, io, max)?,
            None => self.window.take_buffered(max),
        };
        Ok(range.map(|range| self.window.slice(range)))
    }

    /// Discards the unread rest of the body, bounded by the swallow limit.
    pub(crate) fn end(&mut self, io: &dyn ChannelIo) -> Result<usize, ErrorKind> {
        match self.codec.as_mut() {
            Some(codec) => codec.end_read(&mut self.window, io, self.max_swallow_size),
            None => Ok(0),
        }
    }

    /// Fills the parameter cache from the query string and, for url-encoded
    /// `POST` requests, from the body.
    pub(crate) fn parse_parameters(
        &mut self,
        request: &mut RawRequest,
        io: &dyn ChannelIo,
    ) -> Result<(), ErrorKind> {
        if request.parameters_parsed {
            return Ok(());
        }
        request.parameters_parsed = true;

        if let Some(query) = request.query.as_deref() {
            parse_form(query.as_bytes(), &mut request.parameters);
        }

        let is_form = request
            .content_type()
            .is_some_and(|t| t.starts_with("application/x-www-form-urlencoded"));
        if request.method != "POST" || !is_form {
            return Ok(());
        }
        if request.content_length.is_some_and(|len| len > self.max_post_size) {
            return Err(ErrorKind::BodyTooLarge);
        }

        let max_post_size = self.max_post_size;
        let mut body = Vec::with_capacity(request.content_length.unwrap_or(0));
        while let Some(chunk) = self.read_body(io, usize::MAX)? {
            if body.len() + chunk.len() > max_post_size {
                return Err(ErrorKind::BodyTooLarge);
            }
            body.extend_from_slice(chunk);
        }
        parse_form(&body, &mut request.parameters);
        Ok(())
    }

    /// Prepares for the next request on the same connection, keeping any
    /// pipelined bytes.
    pub(crate) fn recycle(&mut self) {
        self.window.compact();
        self.state = ParseState::Method;
        self.mark = 0;
        self.name = 0..0;
        self.codec = None;
    }

    /// Prepares for a different connection.
    pub(crate) fn reset(&mut self) {
        self.recycle();
        self.window.clear();
    }
}

fn parse_form(src: &[u8], parameters: &mut HashMap<String, String>) {
    for (name, value) in url::form_urlencoded::parse(src) {
        if name.is_empty() {
            continue;
        }
        parameters.insert(name.into_owned(), value.into_owned());
    }
}
