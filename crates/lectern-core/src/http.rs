// src/http.rs
use std::io;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
}

impl Method {
    /// Recognized methods only; anything else is answered with 405.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"HEAD" => Some(Method::Head),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// Byte offsets of a parsed request, relative to the first byte of its request line.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub(crate) method: Option<Method>,
    pub(crate) uri: Range<usize>,
    pub(crate) path_end: usize,
    pub(crate) version: Version,
    pub(crate) headers: Vec<(Range<usize>, Range<usize>)>,
    pub(crate) body: Range<usize>,
    pub(crate) close: bool,
}

impl RequestHead {
    pub(crate) fn clear(&mut self) {
        self.method = None;
        self.uri = 0..0;
        self.path_end = 0;
        self.version = Version::default();
        self.headers.clear();
        self.body = 0..0;
        self.close = false;
    }

    /// Total bytes of the request on the wire, body included.
    pub fn len(&self) -> usize {
        self.body.end
    }

    pub fn is_empty(&self) -> bool {
        self.body.end == 0
    }
}

/// Parsed request. Every accessor returns a view into the connection's
/// receive buffer; views are valid until the router returns.
#[derive(Clone, Copy)]
pub struct Request<'a> {
    buf: &'a [u8],
    head: &'a RequestHead,
}

impl<'a> Request<'a> {
    /// `buf` must start at the request line that `head` was parsed from.
    pub fn new(buf: &'a [u8], head: &'a RequestHead) -> Self {
        Self { buf, head }
    }

    #[inline]
    fn text(&self, range: Range<usize>) -> &'a str {
        // Text spans were validated as UTF-8 by the parser.
        std::str::from_utf8(&self.buf[range]).unwrap_or("")
    }

    pub fn method(&self) -> Method {
        self.head.method.unwrap_or(Method::Get)
    }

    pub fn uri(&self) -> &'a str {
        self.text(self.head.uri.clone())
    }

    pub fn path(&self) -> &'a str {
        self.text(self.head.uri.start..self.head.path_end)
    }

    pub fn query(&self) -> Option<&'a str> {
        if self.head.path_end < self.head.uri.end {
            Some(self.text(self.head.path_end + 1..self.head.uri.end))
        } else {
            None
        }
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Headers in arrival order.
    pub fn headers(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let buf = self.buf;
        self.head.headers.iter().map(move |(name, value)| {
            (
                std::str::from_utf8(&buf[name.clone()]).unwrap_or(""),
                std::str::from_utf8(&buf[value.clone()]).unwrap_or(""),
            )
        })
    }

    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// `name=value` pairs of every `Cookie` header.
    pub fn cookies(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.headers()
            .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, v)| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name, value.trim().trim_matches('"')))
            })
    }

    pub fn cookie(&self, name: &str) -> Option<&'a str> {
        self.cookies().find(|(k, _)| *k == name).map(|(_, v)| v)
    }

    pub fn body(&self) -> &'a [u8] {
        &self.buf[self.head.body.clone()]
    }

    /// Client asked for `Connection: close`.
    pub fn wants_close(&self) -> bool {
        self.head.close
    }
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method())
            .field("uri", &self.uri())
            .field("version", &self.version())
            .field("headers", &self.head.headers.len())
            .field("body", &self.body().len())
            .finish()
    }
}

const STATUSES: &[(u16, &str, &[u8])] = &[
    (200, "OK", b"HTTP/1.1 200 OK\r\n"),
    (201, "Created", b"HTTP/1.1 201 Created\r\n"),
    (202, "Accepted", b"HTTP/1.1 202 Accepted\r\n"),
    (204, "No Content", b"HTTP/1.1 204 No Content\r\n"),
    (301, "Moved Permanently", b"HTTP/1.1 301 Moved Permanently\r\n"),
    (302, "Found", b"HTTP/1.1 302 Found\r\n"),
    (303, "See Other", b"HTTP/1.1 303 See Other\r\n"),
    (304, "Not Modified", b"HTTP/1.1 304 Not Modified\r\n"),
    (307, "Temporary Redirect", b"HTTP/1.1 307 Temporary Redirect\r\n"),
    (400, "Bad Request", b"HTTP/1.1 400 Bad Request\r\n"),
    (401, "Unauthorized", b"HTTP/1.1 401 Unauthorized\r\n"),
    (403, "Forbidden", b"HTTP/1.1 403 Forbidden\r\n"),
    (404, "Not Found", b"HTTP/1.1 404 Not Found\r\n"),
    (405, "Method Not Allowed", b"HTTP/1.1 405 Method Not Allowed\r\n"),
    (409, "Conflict", b"HTTP/1.1 409 Conflict\r\n"),
    (
        413,
        "Request Entity Too Large",
        b"HTTP/1.1 413 Request Entity Too Large\r\n",
    ),
    (422, "Unprocessable Entity", b"HTTP/1.1 422 Unprocessable Entity\r\n"),
    (429, "Too Many Requests", b"HTTP/1.1 429 Too Many Requests\r\n"),
    (
        500,
        "Internal Server Error",
        b"HTTP/1.1 500 Internal Server Error\r\n",
    ),
    (501, "Not Implemented", b"HTTP/1.1 501 Not Implemented\r\n"),
    (503, "Service Unavailable", b"HTTP/1.1 503 Service Unavailable\r\n"),
];

/// Reason phrase for a status code.
pub fn reason(status: u16) -> &'static str {
    STATUSES
        .iter()
        .find(|(code, _, _)| *code == status)
        .map(|(_, r, _)| *r)
        .unwrap_or("Unknown")
}

fn status_line(status: u16) -> Option<&'static [u8]> {
    STATUSES
        .iter()
        .find(|(code, _, _)| *code == status)
        .map(|(_, _, line)| *line)
}

/// One piece of the response wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk {
    Static(&'static [u8]),
    Arena(Range<usize>),
}

/// Response accumulator.
///
/// Small transient buffers (formatted headers, lengths, dates, copied body
/// bytes) live in a per-response arena that is reused across requests; body
/// chunks are written with vectored I/O straight from the arena or from
/// `'static` data.
#[derive(Debug)]
pub struct Response {
    status: u16,
    close: bool,
    arena: Vec<u8>,
    headers: Vec<Range<usize>>,
    body: Vec<Chunk>,
    wire: Vec<Chunk>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            close: false,
            arena: Vec::with_capacity(256),
            headers: Vec::with_capacity(8),
            body: Vec::with_capacity(4),
            wire: Vec::with_capacity(16),
        }
    }

    /// Back to an empty `200 OK`, keeping allocations.
    pub fn reset(&mut self) {
        self.status = 200;
        self.close = false;
        self.arena.clear();
        self.headers.clear();
        self.body.clear();
        self.wire.clear();
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    fn alloc(&mut self, parts: &[&[u8]]) -> Range<usize> {
        let start = self.arena.len();
        for part in parts {
            self.arena.extend_from_slice(part);
        }
        start..self.arena.len()
    }

    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        let range = self.alloc(&[name.as_bytes(), b": ", value.as_bytes(), b"\r\n"]);
        self.headers.push(range);
        self
    }

    pub fn content_type(&mut self, value: &str) -> &mut Self {
        self.header("Content-Type", value)
    }

    /// Appends `bytes` to the body, copied into the arena.
    pub fn body(&mut self, bytes: &[u8]) -> &mut Self {
        let range = self.alloc(&[bytes]);
        match self.body.last_mut() {
            Some(Chunk::Arena(last)) if last.end == range.start => last.end = range.end,
            _ => self.body.push(Chunk::Arena(range)),
        }
        self
    }

    /// Appends `bytes` to the body without copying.
    pub fn body_static(&mut self, bytes: &'static [u8]) -> &mut Self {
        self.body.push(Chunk::Static(bytes));
        self
    }

    /// `text/plain` body.
    pub fn text(&mut self, text: &str) -> &mut Self {
        self.content_type("text/plain; charset=utf-8");
        self.body(text.as_bytes())
    }

    /// `303 See Other` to `location`.
    pub fn redirect(&mut self, location: &str) -> &mut Self {
        self.set_status(303);
        self.header("Location", location)
    }

    /// Error reply: reason phrase as body, connection closed after the write.
    pub fn error(&mut self, status: u16) -> &mut Self {
        self.reset();
        self.status = status;
        self.close = true;
        self.content_type("text/plain; charset=utf-8");
        self.body_static(reason(status).as_bytes())
    }

    /// Send `Connection: close` and close the connection after this response.
    pub fn close(&mut self) -> &mut Self {
        self.close = true;
        self
    }

    pub fn closes_connection(&self) -> bool {
        self.close
    }

    fn chunk(&self, chunk: &Chunk) -> &[u8] {
        match chunk {
            Chunk::Static(bytes) => bytes,
            Chunk::Arena(range) => &self.arena[range.clone()],
        }
    }

    pub fn content_length(&self) -> usize {
        self.body.iter().map(|c| self.chunk(c).len()).sum()
    }

    /// Body bytes gathered into one vector.
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.content_length());
        for chunk in &self.body {
            out.extend_from_slice(self.chunk(chunk));
        }
        out
    }

    /// Lay out the wire form: status line, headers, `Date`, `Content-Length`,
    /// optional `Connection: close`, blank line, body (omitted for HEAD).
    pub(crate) fn finalize(&mut self, date: &[u8], head_only: bool) {
        self.wire.clear();

        let status_line = match status_line(self.status) {
            Some(line) => Chunk::Static(line),
            None => {
                let mut code = itoa::Buffer::new();
                let code = code.format(self.status);
                Chunk::Arena(self.alloc(&[b"HTTP/1.1 ", code.as_bytes(), b" Unknown\r\n"]))
            }
        };
        self.wire.push(status_line);

        for i in 0..self.headers.len() {
            let range = self.headers[i].clone();
            self.wire.push(Chunk::Arena(range));
        }

        let date = self.alloc(&[b"Date: ", date, b"\r\n"]);
        self.wire.push(Chunk::Arena(date));

        let mut len = itoa::Buffer::new();
        let len = len.format(self.content_length());
        let len = self.alloc(&[b"Content-Length: ", len.as_bytes(), b"\r\n"]);
        self.wire.push(Chunk::Arena(len));

        if self.close {
            self.wire.push(Chunk::Static(b"Connection: close\r\n"));
        }
        self.wire.push(Chunk::Static(b"\r\n"));

        if !head_only {
            self.wire.extend(self.body.iter().cloned());
        }
    }

    /// Number of wire segments laid out by the last `finalize`.
    pub(crate) fn segments(&self) -> usize {
        self.wire.len()
    }

    pub(crate) fn segment(&self, index: usize) -> &[u8] {
        self.chunk(&self.wire[index])
    }

    /// Full wire form laid out by the last `finalize`.
    pub(crate) fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..self.segments() {
            out.extend_from_slice(self.segment(i));
        }
        out
    }
}

impl io::Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
