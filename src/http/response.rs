use crate::{errors::ErrorKind, http::types::reason_phrase};

/// Wire-level response state.
///
/// Headers hold one value per name (matched case-insensitively, last write
/// wins). `Set-Cookie` is the exception: [`add_header`](Self::add_header)
/// appends to it with `;` and the output buffer re-emits each `;`-separated
/// part as its own `Set-Cookie` line.
///
/// Framing headers (`Content-Length`, `Transfer-Encoding`, `Content-Type`,
/// `Server`, `Connection`) are derived from the fields of this struct when the
/// response is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    status: u16,
    message: Option<String>,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    character_encoding: Option<String>,
    content_language: Option<String>,
    content_length: Option<u64>,
    pub(crate) committed: bool,
}

impl Default for RawResponse {
    fn default() -> Self {
        Self {
            status: 200,
            message: None,
            headers: Vec::new(),
            content_type: None,
            character_encoding: None,
            content_language: None,
            content_length: None,
            committed: false,
        }
    }
}

impl RawResponse {
    #[inline]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn recycle(&mut self) {
        self.clear();
        self.committed = false;
    }

    fn clear(&mut self) {
        self.status = 200;
        self.message = None;
        self.headers.clear();
        self.content_type = None;
        self.character_encoding = None;
        self.content_language = None;
        self.content_length = None;
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

// Public API
impl RawResponse {
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[inline]
    pub fn set_status(&mut self, status: impl Into<u16>) -> &mut Self {
        self.status = status.into();
        self
    }

    /// Reason phrase sent on the status line: the custom message if one was
    /// set, otherwise the standard phrase for the status.
    #[inline]
    pub fn message(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status))
    }

    #[inline]
    pub fn set_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.message = Some(message.into());
        self
    }

    /// Sets `name` to `value`, replacing any previous value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.headers[i].1 = value,
            None => self.headers.push((name.to_owned(), value)),
        }
        self
    }

    /// Like [`set_header`](Self::set_header), except that `Set-Cookie` values
    /// accumulate, joined with `;`.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if name.eq_ignore_ascii_case("set-cookie") {
            if let Some(i) = self.position(name) {
                let existing = &mut self.headers[i].1;
                existing.push(';');
                existing.push_str(&value);
                return self;
            }
        }
        self.set_header(name, value)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.headers[i].1.as_str())
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.headers.remove(i).1)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    #[inline]
    pub fn set_content_type(&mut self, value: impl Into<String>) -> &mut Self {
        self.content_type = Some(value.into());
        self
    }

    #[inline]
    pub fn character_encoding(&self) -> Option<&str> {
        self.character_encoding.as_deref()
    }

    #[inline]
    pub fn set_character_encoding(&mut self, value: impl Into<String>) -> &mut Self {
        self.character_encoding = Some(value.into());
        self
    }

    #[inline]
    pub fn content_language(&self) -> Option<&str> {
        self.content_language.as_deref()
    }

    #[inline]
    pub fn set_content_language(&mut self, value: impl Into<String>) -> &mut Self {
        self.content_language = Some(value.into());
        self
    }

    /// Declared body length. Without one the body is sent chunked.
    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[inline]
    pub fn set_content_length(&mut self, len: u64) -> &mut Self {
        self.content_length = Some(len);
        self
    }

    /// Whether the status line and headers have been serialized.
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Discards status, headers and framing fields.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ResponseCommitted`] once headers went out.
    pub fn reset(&mut self) -> Result<(), ErrorKind> {
        if self.committed {
            return Err(ErrorKind::ResponseCommitted);
        }
        self.clear();
        Ok(())
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use crate::StatusCode;

    #[test]
    fn status_and_message() {
        let mut response = RawResponse::new();
        assert_eq!((response.status(), response.message()), (200, "OK"));

        response.set_status(StatusCode::NotFound);
        assert_eq!((response.status(), response.message()), (404, "Not Found"));

        response.set_status(599u16).set_message("Custom");
        assert_eq!(response.message(), "Custom");
    }

    #[test]
    fn headers_are_replaced_case_insensitively() {
        let mut response = RawResponse::new();
        response
            .set_header("X-Mode", "a")
            .set_header("x-mode", "b")
            .set_header("Other", "c");

        assert_eq!(response.header("X-MODE"), Some("b"));
        assert_eq!(response.headers().count(), 2);
        assert_eq!(response.remove_header("x-mode"), Some("b".into()));
        assert_eq!(response.header("X-Mode"), None);
    }

    #[test]
    fn cookies_accumulate() {
        let mut response = RawResponse::new();
        response
            .add_header("Set-Cookie", "a=1")
            .add_header("set-cookie", "b=2")
            .add_header("X-Once", "1")
            .add_header("X-Once", "2");

        assert_eq!(response.header("Set-Cookie"), Some("a=1;b=2"));
        assert_eq!(response.header("X-Once"), Some("2"));
    }

    #[test]
    fn reset_before_and_after_commit() {
        let mut response = RawResponse::new();
        response.set_status(500u16).set_header("A", "1").set_content_length(3);

        assert_eq!(response.reset(), Ok(()));
        assert_eq!(response, RawResponse::new());

        response.committed = true;
        assert_eq!(response.reset(), Err(ErrorKind::ResponseCommitted));
    }
}
