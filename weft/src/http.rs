// src/http.rs

use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::body::BodyReader;
use crate::cookie::Cookie;
use crate::syscalls;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Head,
    Delete,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"PUT" => Some(Method::Put),
            b"POST" => Some(Method::Post),
            b"HEAD" => Some(Method::Head),
            b"DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
        }
    }
}

pub fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Header map: order-preserving, case-insensitive keys, values trimmed at
/// parse time but stored with their case.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    items: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers { items: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace any existing value for `name`, or append.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        for (k, v) in self.items.iter_mut() {
            if k.eq_ignore_ascii_case(&name) {
                *v = value;
                return;
            }
        }
        self.items.push((name, value));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.items.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.items.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when the comma-separated value of `name` includes `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        match self.get(name) {
            Some(v) => v
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token)),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Immutable header view plus the streaming body of one request.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) raw_path: String,
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) headers: Headers,
    pub(crate) host: Option<String>,
    pub(crate) cookies: Vec<(String, String)>,
    pub(crate) body: BodyReader,
    pub(crate) start: Instant,
    pub(crate) close_after: bool,
    pub(crate) addr_index: usize,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    /// Path as received on the wire, including the query string.
    pub fn raw_path(&self) -> &str {
        &self.raw_path
    }

    /// Percent-decoded path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> BodyReader {
        self.body.clone()
    }

    /// Trailer headers; populated only once the body has been fully
    /// consumed.
    pub fn trailer(&self) -> Option<Headers> {
        self.body.trailer()
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    pub fn close_after(&self) -> bool {
        self.close_after
    }

    pub fn set_close_after(&mut self, close: bool) {
        self.close_after = close;
    }

    /// Dense index of the address this request was accepted on.
    pub fn address_index(&self) -> usize {
        self.addr_index
    }
}

/// Whether the writer closes a file body's descriptor after serving it.
/// Shared cache descriptors are kept open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    Close,
    Keep,
}

/// Pull source for a chunked response body. Any `Iterator<Item = Vec<u8>>`
/// qualifies.
pub trait ChunkSource {
    fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

impl<I> ChunkSource for I
where
    I: Iterator<Item = Vec<u8>>,
{
    fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.next()
    }
}

pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// Bytes owned by a cache entry; served without copying.
    Shared(std::sync::Arc<Vec<u8>>),
    Stream(Box<dyn ChunkSource>),
    File {
        fd: RawFd,
        size: u64,
        close: ClosePolicy,
    },
}

impl Body {
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Shared(b) => Some(b.len() as u64),
            Body::File { size, .. } => Some(*size),
            Body::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        if let Body::File {
            fd,
            close: ClosePolicy::Close,
            ..
        } = self
        {
            syscalls::close_fd(*fd);
        }
    }
}

pub struct Response {
    pub code: u16,
    pub headers: Headers,
    pub body: Body,
    /// Invoked once after the response has been flushed; used to release
    /// cache entries or update statistics.
    pub post_hook: Option<Box<dyn FnOnce()>>,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Response {
            code,
            headers: Headers::new(),
            body: Body::Empty,
            post_hook: None,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let mut r = Response::new(200);
        r.body = Body::Bytes(body.into());
        r.headers.set("Content-Type", "text/plain; charset=utf-8");
        r
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        let mut r = Response::new(200);
        r.body = Body::Bytes(body.into());
        r.headers.set("Content-Type", "text/html; charset=utf-8");
        r
    }

    pub fn created() -> Self {
        Response::new(201)
    }

    pub fn not_modified() -> Self {
        Response::new(304)
    }

    pub fn bad_request() -> Self {
        Response::with_text(400, "Bad Request")
    }

    pub fn forbidden() -> Self {
        Response::with_text(403, "Forbidden")
    }

    pub fn not_found() -> Self {
        Response::with_text(404, "Not Found")
    }

    pub fn method_not_allowed() -> Self {
        Response::with_text(405, "Method Not Allowed")
    }

    pub fn payload_too_large() -> Self {
        Response::with_text(413, "Payload Too Large")
    }

    pub fn internal_error() -> Self {
        Response::with_text(500, "Internal Server Error")
    }

    pub fn with_text(code: u16, text: impl Into<Vec<u8>>) -> Self {
        let mut r = Response::new(code);
        r.body = Body::Bytes(text.into());
        r.headers.set("Content-Type", "text/plain; charset=utf-8");
        r
    }

    pub fn redirect(code: u16, location: impl Into<String>) -> Self {
        debug_assert!(code == 301 || code == 308);
        let mut r = Response::new(code);
        r.headers.set("Location", location.into());
        r
    }

    pub fn stream(source: impl ChunkSource + 'static) -> Self {
        let mut r = Response::new(200);
        r.body = Body::Stream(Box::new(source));
        r
    }

    pub fn file(fd: RawFd, size: u64, close: ClosePolicy) -> Self {
        let mut r = Response::new(200);
        r.body = Body::File { fd, size, close };
        r
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn set_cookie(mut self, cookie: &Cookie) -> Self {
        self.headers.append("Set-Cookie", cookie.to_header_value());
        self
    }

    pub fn post_hook(mut self, hook: impl FnOnce() + 'static) -> Self {
        self.post_hook = Some(Box::new(hook));
        self
    }

    /// True when this response asks for the connection to close.
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("Connection", "close")
    }
}
