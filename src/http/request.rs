use std::collections::HashMap;

/// Wire-level request state filled in by the input buffer.
///
/// One instance lives inside each processor and is recycled between requests.
/// Header names and values are stored lowercased; after the header block is
/// parsed the header map is read-only to adapters.
///
/// # Examples
/// ```text
/// POST /form?lang=en HTTP/1.1\r\n
/// Host: example\r\n
/// Content-Type: application/x-www-form-urlencoded\r\n
/// Content-Length: 7\r\n
/// \r\n
/// a=1&b=2
/// ```
/// yields `method() == "POST"`, `uri() == "/form"`, `query() == Some("lang=en")`,
/// `header("Host") == Some("example")`, `content_length() == Some(7)`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RawRequest {
    pub(crate) method: String,
    pub(crate) uri: String,
    pub(crate) query: Option<String>,
    pub(crate) protocol: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) content_length: Option<usize>,

    pub(crate) parameters: HashMap<String, String>,
    pub(crate) parameters_parsed: bool,
}

impl RawRequest {
    #[inline]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Clears every field while keeping allocations.
    pub(crate) fn recycle(&mut self) {
        self.method.clear();
        self.uri.clear();
        self.query = None;
        self.protocol.clear();
        self.headers.clear();
        self.content_length = None;
        self.parameters.clear();
        self.parameters_parsed = false;
    }

    /// Stores a header; a second value for the same name replaces the first.
    #[inline]
    pub(crate) fn set_header(&mut self, name: String, value: String) {
        self.headers.insert(name, value);
    }

    #[inline]
    pub(crate) fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }
}

// Public API
impl RawRequest {
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target without the query string.
    #[inline]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Raw query string, without the leading `?`.
    #[inline]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        match self.headers.get(name) {
            Some(value) => Some(value.as_str()),
            None if name.bytes().any(|b| b.is_ascii_uppercase()) => self
                .headers
                .get(&name.to_ascii_lowercase())
                .map(String::as_str),
            None => None,
        }
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Declared body length. `None` for chunked or body-less requests.
    #[inline]
    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Parameters parsed so far. Use
    /// [`Exchange::parameters`](crate::Exchange::parameters) to trigger parsing.
    #[inline]
    pub fn parsed_parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }
}
