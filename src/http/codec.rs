//! Body framing: identity (`Content-Length`) and chunked transfer coding.
//!
//! A codec instance serves one direction of one message. The input buffer
//! drives [`BodyCodec::read`], the output buffer drives [`BodyCodec::write`].

use crate::{
    errors::ErrorKind,
    http::{
        input::ReadWindow,
        output::WriteWindow,
        types::{hex_value, CR, CRLF, END_CHUNK, HT, LF, SEMI_COLON, SP},
    },
    server::channel::ChannelIo,
};
use std::ops::Range;

pub(crate) trait BodyCodec: Send + Sync {
    /// Decodes at most `max` body bytes, returning their position in the
    /// window. `None` once the body is exhausted.
    fn read(
        &mut self,
        window: &mut ReadWindow,
        io: &dyn ChannelIo,
        max: usize,
    ) -> Result<Option<Range<usize>>, ErrorKind>;

    /// Discards the unread rest of the body.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::SwallowLimitExceeded`] once more than `limit` bytes would
    /// have to be discarded.
    fn end_read(
        &mut self,
        window: &mut ReadWindow,
        io: &dyn ChannelIo,
        limit: usize,
    ) -> Result<usize, ErrorKind> {
        let mut swallowed = 0;
        while let Some(range) = self.read(window, io, usize::MAX)? {
            swallowed += range.len();
            if swallowed > limit {
                return Err(ErrorKind::SwallowLimitExceeded);
            }
        }
        Ok(swallowed)
    }

    /// Encodes `src` into the output window. Returns the number of payload
    /// bytes accepted.
    fn write(
        &mut self,
        out: &mut WriteWindow,
        io: &dyn ChannelIo,
        src: &[u8],
    ) -> Result<usize, ErrorKind>;

    fn end_write(&mut self, out: &mut WriteWindow, io: &dyn ChannelIo) -> Result<(), ErrorKind>;
}

// IDENTITY

/// Body of a declared length. Writes past the declared length are dropped.
pub(crate) struct IdentityCodec {
    remaining: u64,
}

impl IdentityCodec {
    #[inline]
    pub(crate) fn new(len: u64) -> Self {
        Self { remaining: len }
    }

    #[inline]
    fn bounded(&self, max: usize) -> usize {
        usize::try_from(self.remaining).map_or(max, |r| r.min(max))
    }
}

impl BodyCodec for IdentityCodec {
    fn read(
        &mut self,
        window: &mut ReadWindow,
        io: &dyn ChannelIo,
        max: usize,
    ) -> Result<Option<Range<usize>>, ErrorKind> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let range = window.take(self.bounded(max), io)?;
        self.remaining -= range.len() as u64;
        Ok(Some(range))
    }

    fn end_read(
        &mut self,
        window: &mut ReadWindow,
        io: &dyn ChannelIo,
        limit: usize,
    ) -> Result<usize, ErrorKind> {
        let mut swallowed = 0;
        while self.remaining > 0 {
            if swallowed >= limit {
                return Err(ErrorKind::SwallowLimitExceeded);
            }
            if let Some(range) = self.read(window, io, limit - swallowed)? {
                swallowed += range.len();
            }
        }
        Ok(swallowed)
    }

    fn write(
        &mut self,
        out: &mut WriteWindow,
        io: &dyn ChannelIo,
        src: &[u8],
    ) -> Result<usize, ErrorKind> {
        let n = self.bounded(src.len());
        out.put(io, &src[..n])?;
        self.remaining -= n as u64;
        Ok(n)
    }

    #[inline]
    fn end_write(&mut self, _: &mut WriteWindow, _: &dyn ChannelIo) -> Result<(), ErrorKind> {
        Ok(())
    }
}

// CHUNKED

/// `Transfer-Encoding: chunked`. Extensions and trailers are skipped.
pub(crate) struct ChunkedCodec {
    remaining: usize,
    end_of_stream: bool,
    skip_crlf: bool,
}

impl ChunkedCodec {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            remaining: 0,
            end_of_stream: false,
            skip_crlf: false,
        }
    }

    /// Parses `<hex>[ws][;ext]CRLF` and stores the size in `remaining`.
    fn read_chunk_header(
        &mut self,
        window: &mut ReadWindow,
        io: &dyn ChannelIo,
    ) -> Result<(), ErrorKind> {
        let mut size: usize = 0;
        let mut digits = 0;
        let mut digits_done = false;
        let mut extension = false;

        loop {
            match window.next_byte(io)? {
                LF => break,
                _ if extension => window.skip_until(LF),
                CR => digits_done = true,
                SEMI_COLON => {
                    extension = true;
                    window.skip_until(LF);
                }
                SP | HT => digits_done = true,
                _ if digits_done => return Err(ErrorKind::InvalidChunkHeader),
                byte => {
                    let value = hex_value(byte).ok_or(ErrorKind::InvalidChunkHeader)?;
                    size = size
                        .checked_mul(16)
                        .and_then(|s| s.checked_add(value))
                        .ok_or(ErrorKind::InvalidChunkHeader)?;
                    digits += 1;
                }
            }
        }

        if digits == 0 {
            return Err(ErrorKind::InvalidChunkHeader);
        }
        self.remaining = size;
        Ok(())
    }

    fn expect_crlf(window: &mut ReadWindow, io: &dyn ChannelIo) -> Result<(), ErrorKind> {
        let mut byte = window.next_byte(io)?;
        if byte == CR {
            byte = window.next_byte(io)?;
        }
        match byte {
            LF => Ok(()),
            _ => Err(ErrorKind::InvalidChunkHeader),
        }
    }

    /// Consumes trailer lines up to and including the terminating blank line.
    fn skip_trailers(window: &mut ReadWindow, io: &dyn ChannelIo) -> Result<(), ErrorKind> {
        loop {
            let mut blank = true;
            loop {
                match window.next_byte(io)? {
                    LF => break,
                    CR => {}
                    _ => {
                        blank = false;
                        window.skip_until(LF);
                    }
                }
            }
            if blank {
                return Ok(());
            }
        }
    }
}

impl BodyCodec for ChunkedCodec {
    fn read(
        &mut self,
        window: &mut ReadWindow,
        io: &dyn ChannelIo,
        max: usize,
    ) -> Result<Option<Range<usize>>, ErrorKind> {
        if self.end_of_stream {
            return Ok(None);
        }

        if self.remaining == 0 {
            if self.skip_crlf {
                Self::expect_crlf(window, io)?;
                self.skip_crlf = false;
            }
            self.read_chunk_header(window, io)?;

            if self.remaining == 0 {
                Self::skip_trailers(window, io)?;
                self.end_of_stream = true;
                return Ok(None);
            }
        }

        let range = window.take(self.remaining.min(max), io)?;
        self.remaining -= range.len();
        if self.remaining == 0 {
            self.skip_crlf = true;
        }
        Ok(Some(range))
    }

    fn write(
        &mut self,
        out: &mut WriteWindow,
        io: &dyn ChannelIo,
        src: &[u8],
    ) -> Result<usize, ErrorKind> {
        if src.is_empty() {
            return Ok(0);
        }
        out.put(io, format!("{:x}\r\n", src.len()).as_bytes())?;
        out.put(io, src)?;
        out.put(io, CRLF)?;
        Ok(src.len())
    }

    #[inline]
    fn end_write(&mut self, out: &mut WriteWindow, io: &dyn ChannelIo) -> Result<(), ErrorKind> {
        out.put(io, END_CHUNK)
    }
}
