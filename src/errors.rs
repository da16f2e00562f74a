use std::{fmt, io};
use thiserror::Error;

/// Every failure the engine distinguishes.
///
/// Protocol variants are fatal for the connection; when no response bytes
/// were committed yet the processor sends [`as_http`](Self::as_http) before
/// closing.
#[derive(Debug, PartialEq, Error)]
pub enum ErrorKind {
    #[error("invalid request method")]
    InvalidMethod,
    #[error("invalid request uri")]
    InvalidUri,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("request header region exceeds the configured maximum")]
    HeaderTooLarge,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("missing or empty host header")]
    MissingHost,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("invalid chunk header")]
    InvalidChunkHeader,

    #[error("unread request body exceeds the swallow limit")]
    SwallowLimitExceeded,
    #[error("request body too large")]
    BodyTooLarge,

    #[error("response already committed")]
    ResponseCommitted,
    #[error("server setup failed: {0}")]
    Setup(&'static str),

    #[error("i/o error: {0}")]
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:literal; )*) => {
        /// Canned, correctly framed response for this error.
        pub(crate) const fn as_http(&self) -> &'static [u8] {
            match self { $(
                Self::$name { .. } => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }

        /// Numeric status the error maps to.
        pub(crate) fn status(&self) -> u16 {
            match self { $(
                Self::$name { .. } => {
                    let code = $status_code.as_bytes();
                    ((code[0] - b'0') as u16) * 100
                        + ((code[1] - b'0') as u16) * 10
                        + (code[2] - b'0') as u16
                }
            )* }
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request";
        InvalidUri: "400 Bad Request";
        InvalidHeader: "400 Bad Request";
        HeaderTooLarge: "431 Request Header Fields Too Large";
        UnsupportedVersion: "505 HTTP Version Not Supported";
        MissingHost: "400 Bad Request";
        InvalidContentLength: "400 Bad Request";
        InvalidChunkHeader: "400 Bad Request";

        SwallowLimitExceeded: "413 Payload Too Large";
        BodyTooLarge: "413 Payload Too Large";

        ResponseCommitted: "500 Internal Server Error";
        Setup: "500 Internal Server Error";

        Io: "500 Internal Server Error";
    }

    /// Transport failures end the connection silently; everything else deserves
    /// an error response if one can still be framed.
    #[inline]
    pub(crate) fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub struct IoError(pub io::Error);

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
