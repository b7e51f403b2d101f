use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, StatusCode};
use std::fmt;
use std::num::ParseIntError;

use crate::codec::md5_hex;

pub const HTTP_11: &str = "HTTP/1.1";

/// Methods a request line may carry.
pub const METHODS: [&str; 11] =
    ["GET", "HEAD", "PUT", "POST", "TRACE", "OPTIONS", "DELETE", "LOCK", "MKCOL", "COPY", "MOVE"];

const CONTENT_LENGTH: &str = "Content-Length";
const CONTENT_TYPE: &str = "Content-Type";
const TRANSFER_ENCODING: &str = "Transfer-Encoding";
const TRAILER: &str = "Trailer";
const CONNECTION: &str = "Connection";
pub const CONTENT_MD5: &str = "Content-MD5";

/// A single `Name: Value` line, name kept as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Insertion-ordered header list. Duplicates are kept and lookups ignore ascii case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

/// What the `Connection` header asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirective {
    Close,
    KeepAlive,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.entries.push(Header::new(name, value));
    }

    /// Value of the first header called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries.iter().filter(move |h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `Content-Length`, if present.
    ///
    /// # Errors
    /// when the value is not a decimal number
    pub fn content_length(&self) -> Result<Option<usize>, ParseIntError> {
        self.get(CONTENT_LENGTH).map(|value| value.trim().parse()).transpose()
    }

    /// The body is chunked when the last transfer coding is `chunked`.
    pub fn is_chunked(&self) -> bool {
        self.get_all(TRANSFER_ENCODING)
            .last()
            .and_then(|value| value.rsplit(',').next())
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    /// Whether the `Trailer` header announces a `Content-MD5` trailer.
    pub fn announces_md5_trailer(&self) -> bool {
        self.get_all(TRAILER).flat_map(|value| value.split(',')).any(|name| name.trim().eq_ignore_ascii_case(CONTENT_MD5))
    }

    /// Checks a chunked `body` against the `Content-MD5` trailer.
    /// `None` when the body is not chunked or carries no digest.
    pub fn body_integrity(&self, body: &[u8]) -> Option<bool> {
        if !self.is_chunked() {
            return None;
        }
        let expected = self.get(CONTENT_MD5)?;
        Some(md5_hex(body).eq_ignore_ascii_case(expected.trim()))
    }

    pub fn connection(&self) -> Option<ConnectionDirective> {
        let value = self.get(CONNECTION)?.trim();
        if value.eq_ignore_ascii_case("close") {
            Some(ConnectionDirective::Close)
        } else if value.eq_ignore_ascii_case("keep-alive") {
            Some(ConnectionDirective::KeepAlive)
        } else {
            None
        }
    }

    pub fn set_connection(&mut self, directive: ConnectionDirective) {
        self.entries.retain(|h| !h.name.eq_ignore_ascii_case(CONNECTION));
        self.push(CONNECTION, directive.as_str());
    }

    fn encode(&self, dst: &mut BytesMut) {
        for header in &self.entries {
            dst.put_slice(header.name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(header.value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
    }
}

impl ConnectionDirective {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionDirective::Close => "close",
            ConnectionDirective::KeepAlive => "keep-alive",
        }
    }

    pub fn from_keep_alive(keep_alive: bool) -> Self {
        if keep_alive { ConnectionDirective::KeepAlive } else { ConnectionDirective::Close }
    }
}

impl fmt::Display for ConnectionDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: Method,
    url: String,
    version: String,
    headers: Headers,
    body: Vec<u8>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self { method: Method::GET, url: String::new(), version: String::new(), headers: Headers::new(), body: Vec::new() }
    }
}

impl HttpRequest {
    pub fn new<U: Into<String>>(method: Method, url: U) -> Self {
        Self { method, url: url.into(), version: HTTP_11.to_owned(), ..Self::default() }
    }

    /// Builds an outgoing request the way the transfer client sends them.
    ///
    /// `PUT` announces a chunked body with a `Content-MD5` trailer, every
    /// other method an empty `text/plain` body. `Connection` follows
    /// `keep_alive`.
    pub fn outgoing<U: Into<String>>(method: Method, url: U, keep_alive: bool) -> Self {
        let mut request = Self::new(method, url);
        let headers = &mut request.headers;
        if request.method == Method::PUT {
            headers.push(CONTENT_TYPE, mime::TEXT_PLAIN.as_ref());
            headers.push(TRANSFER_ENCODING, "chunked");
            headers.push(TRAILER, CONTENT_MD5);
        } else {
            headers.push(CONTENT_LENGTH, "0");
            headers.push(CONTENT_TYPE, mime::TEXT_PLAIN.as_ref());
        }
        headers.set_connection(ConnectionDirective::from_keep_alive(keep_alive));
        request
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Result of the `Content-MD5` check of a chunked body, see [`Headers::body_integrity`].
    pub fn integrity(&self) -> Option<bool> {
        self.headers.body_integrity(&self.body)
    }

    /// Replaces the body and keeps `Content-Length` in step unless the body is chunked.
    pub fn set_body<B: Into<Vec<u8>>>(&mut self, body: B) {
        self.body = body.into();
        if !self.headers.is_chunked() {
            set_content_length(&mut self.headers, self.body.len());
        }
    }

    /// `"METHOD /path"`, the key handlers are registered under.
    pub fn route(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let version = if self.version.is_empty() { HTTP_11 } else { &self.version };
        dst.reserve(self.url.len() + 64 + self.body.len());
        dst.put_slice(self.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.url.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(version.as_bytes());
        dst.put_slice(b"\r\n");
        self.headers.encode(dst);
        dst.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }

    pub fn reset(&mut self) {
        self.method = Method::GET;
        self.url.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_url(&mut self, url: String) {
        self.url = url;
    }

    pub(crate) fn set_version(&mut self, version: String) {
        self.version = version;
    }

    pub(crate) fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    version: String,
    status: StatusCode,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            version: String::new(),
            status: StatusCode::OK,
            reason: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: HTTP_11.to_owned(),
            status,
            reason: status.canonical_reason().unwrap_or_default().to_owned(),
            ..Self::default()
        }
    }

    /// The stock response for `status`: an html page naming the status,
    /// with `Content-Length` and `Content-Type: text/html`.
    pub fn default_for(status: StatusCode) -> Self {
        let mut response = Self::new(status);
        response.body = stock_body(status).into_bytes();
        response.headers.push(CONTENT_LENGTH, response.body.len().to_string());
        response.headers.push(CONTENT_TYPE, mime::TEXT_HTML.as_ref());
        response
    }

    /// A `text/plain` response carrying `body`.
    pub fn text<B: Into<Vec<u8>>>(status: StatusCode, body: B) -> Self {
        let mut response = Self::new(status);
        response.body = body.into();
        response.headers.push(CONTENT_LENGTH, response.body.len().to_string());
        response.headers.push(CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref());
        response
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn integrity(&self) -> Option<bool> {
        self.headers.body_integrity(&self.body)
    }

    pub fn set_body<B: Into<Vec<u8>>>(&mut self, body: B) {
        self.body = body.into();
        if !self.headers.is_chunked() {
            set_content_length(&mut self.headers, self.body.len());
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let version = if self.version.is_empty() { HTTP_11 } else { &self.version };
        dst.reserve(self.reason.len() + 64 + self.body.len());
        dst.put_slice(version.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.reason.as_bytes());
        dst.put_slice(b"\r\n");
        self.headers.encode(dst);
        dst.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }

    pub fn reset(&mut self) {
        self.version.clear();
        self.status = StatusCode::OK;
        self.reason.clear();
        self.headers.clear();
        self.body.clear();
    }

    pub(crate) fn set_version(&mut self, version: String) {
        self.version = version;
    }

    pub(crate) fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub(crate) fn set_reason(&mut self, reason: String) {
        self.reason = reason;
    }

    pub(crate) fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }
}

fn set_content_length(headers: &mut Headers, len: usize) {
    headers.entries.retain(|h| !h.name.eq_ignore_ascii_case(CONTENT_LENGTH));
    headers.push(CONTENT_LENGTH, len.to_string());
}

/// Html page for a status; `200 OK` has an empty body.
fn stock_body(status: StatusCode) -> String {
    if status == StatusCode::OK {
        return String::new();
    }
    let reason = status.canonical_reason().unwrap_or("Unknown");
    format!(
        "<html><head><title>{reason}</title></head><body><h1>{} {reason}</h1></body></html>",
        status.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.push("content-length", "12");
        headers.push("X-Tag", "a");
        headers.push("x-tag", "b");

        assert_eq!(headers.get("Content-Length"), Some("12"));
        assert_eq!(headers.content_length().unwrap(), Some(12));
        assert_eq!(headers.get_all("X-TAG").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!headers.contains("Host"));

        // the value borrows the headers, not the name it was looked up by
        let first = {
            let name = String::from("X-TAG");
            headers.get(&name)
        };
        assert_eq!(first, Some("a"));
    }

    #[test]
    fn test_bad_content_length() {
        let mut headers = Headers::new();
        headers.push("Content-Length", "twelve");
        assert!(headers.content_length().is_err());
    }

    #[test]
    fn test_chunked_uses_last_coding() {
        let mut headers = Headers::new();
        headers.push("Transfer-Encoding", "gzip, chunked");
        assert!(headers.is_chunked());

        let mut headers = Headers::new();
        headers.push("Transfer-Encoding", "chunked");
        headers.push("Transfer-Encoding", "gzip");
        assert!(!headers.is_chunked());
    }

    #[test]
    fn test_connection_directive() {
        let mut headers = Headers::new();
        assert_eq!(headers.connection(), None);

        headers.push("Connection", "Keep-Alive");
        assert_eq!(headers.connection(), Some(ConnectionDirective::KeepAlive));

        headers.set_connection(ConnectionDirective::Close);
        assert_eq!(headers.connection(), Some(ConnectionDirective::Close));
        assert_eq!(headers.len(), 1);

        let mut headers = Headers::new();
        headers.push("Connection", "upgrade");
        assert_eq!(headers.connection(), None);
    }

    #[test]
    fn test_body_integrity() {
        let mut headers = Headers::new();
        headers.push("Content-MD5", md5_hex(b"abc"));
        assert_eq!(headers.body_integrity(b"abc"), None);

        headers.push("Transfer-Encoding", "chunked");
        assert_eq!(headers.body_integrity(b"abc"), Some(true));
        assert_eq!(headers.body_integrity(b"abd"), Some(false));
    }

    #[test]
    fn test_outgoing_put_request() {
        let request = HttpRequest::outgoing(Method::PUT, "/upload", true);
        let expected = "PUT /upload HTTP/1.1\r\n\
                        Content-Type: text/plain\r\n\
                        Transfer-Encoding: chunked\r\n\
                        Trailer: Content-MD5\r\n\
                        Connection: keep-alive\r\n\r\n";
        assert_eq!(request.to_bytes(), expected.as_bytes());
        assert!(request.headers().is_chunked());
        assert!(request.headers().announces_md5_trailer());
    }

    #[test]
    fn test_outgoing_get_request() {
        let request = HttpRequest::outgoing(Method::GET, "/index", false);
        let expected = "GET /index HTTP/1.1\r\n\
                        Content-Length: 0\r\n\
                        Content-Type: text/plain\r\n\
                        Connection: close\r\n\r\n";
        assert_eq!(request.to_bytes(), expected.as_bytes());
        assert_eq!(request.route(), "GET /index");
    }

    #[test]
    fn test_default_response() {
        let response = HttpResponse::default_for(StatusCode::BAD_REQUEST);
        let body = "<html><head><title>Bad Request</title></head><body><h1>400 Bad Request</h1></body></html>";
        assert_eq!(response.body(), body.as_bytes());

        let expected = format!(
            "HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\nContent-Type: text/html\r\n\r\n{body}",
            body.len()
        );
        assert_eq!(response.to_bytes(), expected.as_bytes());

        let ok = HttpResponse::default_for(StatusCode::OK);
        assert!(ok.body().is_empty());
        assert_eq!(ok.headers().content_length().unwrap(), Some(0));
    }

    #[test]
    fn test_set_body_updates_length() {
        let mut response = HttpResponse::text(StatusCode::OK, "hi");
        response.set_body("hello");
        assert_eq!(response.headers().get_all("content-length").collect::<Vec<_>>(), vec!["5"]);
    }
}
