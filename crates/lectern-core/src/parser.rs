// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! The parser never holds views into the receive buffer. It records byte
//! offsets relative to the first byte of the request being parsed, so the
//! connection can keep reading (and the ring can slide) between calls.
//! Each call rescans at most the element that was incomplete last time.

use crate::http::{Method, RequestHead, Version};
use memchr::{memchr, memchr3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed request line or header.
    BadRequest,
    /// Well-formed method token that is not GET, POST or HEAD.
    MethodNotAllowed,
    /// Declared body that can never fit in the receive buffer.
    PayloadTooLarge,
    /// `Transfer-Encoding: chunked` request bodies.
    NotImplemented,
}

impl ParseError {
    pub fn status(self) -> u16 {
        match self {
            ParseError::BadRequest => 400,
            ParseError::MethodNotAllowed => 405,
            ParseError::PayloadTooLarge => 413,
            ParseError::NotImplemented => 501,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(crate::http::reason(self.status()))
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Method,
    Uri,
    Version,
    Header,
    Body,
    Done,
}

/// Longest method token we wait for before calling the line malformed.
const MAX_METHOD: usize = 16;
const VERSION_LINE: usize = b"HTTP/1.1\r\n".len();

#[inline]
fn is_token(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

fn trim_ows(bytes: &[u8], mut start: usize, mut end: usize) -> (usize, usize) {
    while start < end && matches!(bytes[start], b' ' | b'\t') {
        start += 1;
    }
    while end > start && matches!(bytes[end - 1], b' ' | b'\t') {
        end -= 1;
    }
    (start, end)
}

#[derive(Debug)]
pub struct Parser {
    state: State,
    pos: usize,
    head: RequestHead,
    content_length: Option<usize>,
    chunked: bool,
    limit: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// A parser that rejects requests whose declared length exceeds `limit`.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: State::Method,
            pos: 0,
            head: RequestHead::default(),
            content_length: None,
            chunked: false,
            limit,
        }
    }

    /// Back to `Method` for the next pipelined request.
    pub fn reset(&mut self) {
        self.state = State::Method;
        self.pos = 0;
        self.head.clear();
        self.content_length = None;
        self.chunked = false;
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Offsets of the request parsed so far.
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Moves the finished request's offsets into `slot`, leaving the
    /// parser ready for the next request. Allocations are swapped, not dropped.
    pub fn take_head(&mut self, slot: &mut RequestHead) {
        std::mem::swap(&mut self.head, slot);
        self.reset();
    }

    /// Advance over `buf`, which must begin at the first byte of the current
    /// request and contain at least the bytes seen by the previous call.
    ///
    /// Returns `Ok(Some(len))` once a whole request of `len` bytes (body
    /// included) is available and `Ok(None)` when more input is needed.
    pub fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>, ParseError> {
        loop {
            match self.state {
                State::Method => {
                    // Tolerate stray CRLFs between pipelined requests.
                    while self.pos < buf.len() && matches!(buf[self.pos], b'\r' | b'\n') {
                        self.pos += 1;
                    }
                    let start = self.pos;
                    let window = &buf[start..buf.len().min(start + MAX_METHOD + 1)];
                    let Some(sp) = memchr(b' ', window) else {
                        if window.iter().any(|&b| !is_token(b)) || window.len() > MAX_METHOD {
                            return Err(ParseError::BadRequest);
                        }
                        return Ok(None);
                    };
                    let token = &window[..sp];
                    if token.is_empty() || !token.iter().all(|&b| is_token(b)) {
                        return Err(ParseError::BadRequest);
                    }
                    let method = Method::from_bytes(token).ok_or(ParseError::MethodNotAllowed)?;
                    self.head.method = Some(method);
                    self.pos = start + sp + 1;
                    self.state = State::Uri;
                }
                State::Uri => {
                    let start = self.pos;
                    let Some(end) = memchr3(b' ', b'\r', b'\n', &buf[start..]) else {
                        return Ok(None);
                    };
                    let end = start + end;
                    if buf[end] != b' ' || end == start {
                        return Err(ParseError::BadRequest);
                    }
                    let uri = &buf[start..end];
                    if uri.iter().any(|&b| b < 0x21 || b == 0x7f) || std::str::from_utf8(uri).is_err() {
                        return Err(ParseError::BadRequest);
                    }
                    self.head.uri = start..end;
                    self.head.path_end = memchr(b'?', uri).map_or(end, |q| start + q);
                    self.pos = end + 1;
                    self.state = State::Version;
                }
                State::Version => {
                    let start = self.pos;
                    let have = buf.len() - start;
                    let line = &buf[start..start + have.min(VERSION_LINE)];
                    if !version_prefix_ok(line) {
                        return Err(ParseError::BadRequest);
                    }
                    if line.len() < VERSION_LINE {
                        return Ok(None);
                    }
                    self.head.version = Version {
                        major: line[5] - b'0',
                        minor: line[7] - b'0',
                    };
                    self.pos = start + VERSION_LINE;
                    self.state = State::Header;
                }
                State::Header => {
                    let start = self.pos;
                    let Some(nl) = memchr(b'\n', &buf[start..]) else {
                        return Ok(None);
                    };
                    let nl = start + nl;
                    if nl == start || buf[nl - 1] != b'\r' {
                        return Err(ParseError::BadRequest);
                    }
                    let line_end = nl - 1;
                    self.pos = nl + 1;

                    if line_end == start {
                        self.finish_headers()?;
                        continue;
                    }
                    self.header(buf, start, line_end)?;
                }
                State::Body => {
                    if buf.len() < self.head.body.end {
                        return Ok(None);
                    }
                    self.state = State::Done;
                }
                State::Done => return Ok(Some(self.head.body.end)),
            }
        }
    }

    fn header(&mut self, buf: &[u8], start: usize, end: usize) -> Result<(), ParseError> {
        let line = &buf[start..end];
        let colon = memchr(b':', line).ok_or(ParseError::BadRequest)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_token(b)) {
            return Err(ParseError::BadRequest);
        }
        let (vstart, vend) = trim_ows(buf, start + colon + 1, end);
        let value = std::str::from_utf8(&buf[vstart..vend]).map_err(|_| ParseError::BadRequest)?;

        if name.eq_ignore_ascii_case(b"content-length") {
            let len: usize = value.parse().map_err(|_| ParseError::BadRequest)?;
            if self.content_length.is_some_and(|prev| prev != len) {
                return Err(ParseError::BadRequest);
            }
            self.content_length = Some(len);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            {
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"connection")
            && value
                .split(',')
                .any(|opt| opt.trim().eq_ignore_ascii_case("close"))
        {
            self.head.close = true;
        }

        self.head.headers.push((start..start + colon, vstart..vend));
        Ok(())
    }

    fn finish_headers(&mut self) -> Result<(), ParseError> {
        if self.chunked {
            return Err(ParseError::NotImplemented);
        }
        let len = self.content_length.unwrap_or(0);
        let end = self.pos.checked_add(len).ok_or(ParseError::BadRequest)?;
        if end > self.limit {
            return Err(ParseError::PayloadTooLarge);
        }
        self.head.body = self.pos..end;
        self.state = State::Body;
        Ok(())
    }
}

/// `HTTP/<digit>.<digit>\r\n`, checked against however much has arrived.
fn version_prefix_ok(line: &[u8]) -> bool {
    line.iter().enumerate().all(|(i, &b)| match i {
        0..=4 => b == b"HTTP/"[i],
        5 | 7 => b.is_ascii_digit(),
        6 => b == b'.',
        8 => b == b'\r',
        _ => b == b'\n',
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;

    fn parse_all(raw: &[u8]) -> (Parser, usize) {
        let mut parser = Parser::new();
        let len = parser.advance(raw).unwrap().expect("complete request");
        (parser, len)
    }

    #[test]
    fn simple_get() {
        let raw = b"GET /plaintext HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (parser, len) = parse_all(raw);
        assert_eq!(len, raw.len());
        let req = Request::new(raw, parser.head());
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/plaintext");
        assert_eq!(req.query(), None);
        assert_eq!(req.version(), Version { major: 1, minor: 1 });
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.body().is_empty());
    }

    #[test]
    fn query_headers_and_cookies() {
        let raw = b"GET /lessons/3?step=2&x=y HTTP/1.0\r\nCookie: session=abc; lang=en\r\nX-Pad:   spaced value \t\r\n\r\n";
        let (parser, _) = parse_all(raw);
        let req = Request::new(raw, parser.head());
        assert_eq!(req.path(), "/lessons/3");
        assert_eq!(req.query(), Some("step=2&x=y"));
        assert_eq!(req.version(), Version { major: 1, minor: 0 });
        assert_eq!(req.header("x-pad"), Some("spaced value"));
        assert_eq!(req.cookie("session"), Some("abc"));
        assert_eq!(req.cookie("lang"), Some("en"));
        assert_eq!(req.cookie("missing"), None);
        let names: Vec<_> = req.headers().map(|(k, _)| k).collect();
        assert_eq!(names, ["Cookie", "X-Pad"]);
    }

    #[test]
    fn byte_at_a_time_matches_whole() {
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world";
        let mut parser = Parser::new();
        let mut done = None;
        for end in 1..=raw.len() {
            if let Some(len) = parser.advance(&raw[..end]).unwrap() {
                done = Some((end, len));
                break;
            }
        }
        let (end, len) = done.unwrap();
        assert_eq!(end, raw.len());
        assert_eq!(len, raw.len());
        let req = Request::new(raw, parser.head());
        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.body(), b"hello world");
        assert!(req.wants_close());
    }

    #[test]
    fn pipelined_requests_parse_in_sequence() {
        let raw = b"GET /a HTTP/1.1\r\n\r\nHEAD /b HTTP/1.1\r\n\r\nGET /c";
        let mut parser = Parser::new();
        let mut slot = RequestHead::default();
        let mut offset = 0;
        let mut paths = Vec::new();

        while let Some(len) = parser.advance(&raw[offset..]).unwrap() {
            parser.take_head(&mut slot);
            let req = Request::new(&raw[offset..], &slot);
            paths.push((req.method(), req.path().to_string()));
            offset += len;
        }
        assert_eq!(
            paths,
            [(Method::Get, "/a".to_string()), (Method::Head, "/b".to_string())]
        );
        assert_eq!(parser.state(), State::Uri);
    }

    #[test]
    fn waits_for_full_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabc";
        let mut parser = Parser::new();
        assert_eq!(parser.advance(raw).unwrap(), None);
        assert_eq!(parser.state(), State::Body);
        let full = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
        assert_eq!(parser.advance(full).unwrap(), Some(full.len()));
    }

    #[test]
    fn unknown_method_is_405() {
        let mut parser = Parser::new();
        assert_eq!(
            parser.advance(b"PUT / HTTP/1.1\r\n\r\n"),
            Err(ParseError::MethodNotAllowed)
        );
        assert_eq!(ParseError::MethodNotAllowed.status(), 405);
    }

    #[test]
    fn malformed_request_lines_are_400() {
        let cases: &[&[u8]] = &[
            b"G@T / HTTP/1.1\r\n\r\n",
            b"GET\r\n\r\n",
            b"GET  HTTP/1.1\r\n\r\n",
            b"GET / HTTX/1.1\r\n\r\n",
            b"GET / HTTP/1.1\n\r\n",
            b"GET / HTTP/1.1\r\nNoColon\r\n\r\n",
            b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
            b"GETTINGLONGERTHANANYMETHOD",
        ];
        for raw in cases {
            let mut parser = Parser::new();
            assert_eq!(
                parser.advance(raw),
                Err(ParseError::BadRequest),
                "{}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn chunked_body_is_501() {
        let mut parser = Parser::new();
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        assert_eq!(parser.advance(raw), Err(ParseError::NotImplemented));
        assert_eq!(ParseError::NotImplemented.status(), 501);
    }

    #[test]
    fn overflowing_content_length_is_400() {
        let mut parser = Parser::new();
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert_eq!(parser.advance(raw), Err(ParseError::BadRequest));
    }

    #[test]
    fn body_larger_than_limit_is_413() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n";
        let head = raw.len();

        let mut parser = Parser::with_limit(head + 99);
        assert_eq!(parser.advance(raw), Err(ParseError::PayloadTooLarge));
        assert_eq!(ParseError::PayloadTooLarge.status(), 413);

        // Exactly fitting is fine; the body is simply still on its way.
        let mut parser = Parser::with_limit(head + 100);
        assert_eq!(parser.advance(raw), Ok(None));
        parser.reset();
        assert_eq!(parser.advance(raw), Ok(None));
        assert_eq!(parser.state(), State::Body);
    }

    #[test]
    fn partial_request_line_is_incomplete() {
        let mut parser = Parser::new();
        assert_eq!(parser.advance(b"GE").unwrap(), None);
        assert_eq!(parser.advance(b"GET /pa").unwrap(), None);
        assert_eq!(parser.advance(b"GET /path HTTP/1").unwrap(), None);
        assert_eq!(parser.state(), State::Version);
        assert_eq!(parser.advance(b"GET /path HTTP/1.1\r\n").unwrap(), None);
        assert_eq!(parser.state(), State::Header);
    }
}
