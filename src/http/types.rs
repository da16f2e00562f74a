//! Core HTTP protocol types and utilities

pub(crate) const CR: u8 = b'\r';
pub(crate) const LF: u8 = b'\n';
pub(crate) const SP: u8 = b' ';
pub(crate) const HT: u8 = b'\t';
pub(crate) const COLON: u8 = b':';
pub(crate) const QUESTION: u8 = b'?';
pub(crate) const SEMI_COLON: u8 = b';';

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const END_CHUNK: &[u8] = b"0\r\n\r\n";
pub(crate) const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
pub(crate) const HTTP_11: &str = "HTTP/1.1";

// TEXT

/// Validates `src` as UTF-8 and returns an owned, lowercased copy.
#[inline]
pub(crate) fn lowercase_text(src: &[u8]) -> Option<String> {
    let mut owned = text(src)?;
    owned.make_ascii_lowercase();
    Some(owned)
}

#[inline]
pub(crate) fn text(src: &[u8]) -> Option<String> {
    simdutf8::basic::from_utf8(src).ok().map(str::to_owned)
}

/// Strips leading and trailing spaces, tabs and carriage returns.
#[inline]
pub(crate) fn trim(mut src: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = src {
        match *first {
            SP | HT | CR => src = rest,
            _ => break,
        }
    }
    while let [rest @ .., last] = src {
        match *last {
            SP | HT | CR => src = rest,
            _ => break,
        }
    }
    src
}

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

#[inline(always)]
pub(crate) fn hex_value(byte: u8) -> Option<usize> {
    match byte {
        b'0'..=b'9' => Some((byte - b'0') as usize),
        b'a'..=b'f' => Some((byte - b'a' + 10) as usize),
        b'A'..=b'F' => Some((byte - b'A' + 10) as usize),
        _ => None,
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $name:ident = ($num:literal, $str:literal);
    )+) => {
        /// HTTP status codes with their standard reason phrases
        ///
        /// [`RawResponse`](crate::RawResponse) stores the numeric code so
        /// non-standard codes remain expressible.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $name = $num,
        )+ }

        impl StatusCode {
            #[inline]
            pub const fn as_u16(self) -> u16 {
                self as u16
            }

            #[inline]
            pub const fn reason(self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }

            #[inline]
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $( $num => Some(StatusCode::$name), )+
                    _ => None,
                }
            }
        }
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NonAuthoritativeInformation = (203, "Non-Authoritative Information");
    NoContent = (204, "No Content");
    ResetContent = (205, "Reset Content");
    PartialContent = (206, "Partial Content");

    MultipleChoices = (300, "Multiple Choices");
    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    UseProxy = (305, "Use Proxy");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    PaymentRequired = (402, "Payment Required");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    NotAcceptable = (406, "Not Acceptable");
    ProxyAuthenticationRequired = (407, "Proxy Authentication Required");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PreconditionFailed = (412, "Precondition Failed");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    RangeNotSatisfiable = (416, "Range Not Satisfiable");
    ExpectationFailed = (417, "Expectation Failed");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

impl From<StatusCode> for u16 {
    #[inline]
    fn from(code: StatusCode) -> Self {
        code.as_u16()
    }
}

/// Reason phrase for `code`, empty when the code is not a known one.
#[inline]
pub(crate) fn reason_phrase(code: u16) -> &'static str {
    StatusCode::from_u16(code).map_or("", StatusCode::reason)
}

/// Statuses whose responses never carry an entity body.
#[inline]
pub(crate) const fn is_bodiless(code: u16) -> bool {
    matches!(code, 204 | 205 | 304)
}
