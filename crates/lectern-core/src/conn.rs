// src/conn.rs
use crate::buffer::CircularBuffer;
use crate::http::{Method, Request, RequestHead, Response};
use crate::metrics::WorkerMetrics;
use crate::parser::{ParseError, Parser};
use crate::router::Router;
use crate::syscalls::{self, MAX_IOVECS};
use arrayvec::ArrayVec;
use libc::c_int;
use std::io::{self, IoSlice};
use tracing::debug;

/// Most requests handed to the router in one call.
pub const MAX_BATCH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnState {
    #[default]
    Idle = 0,
    Reading = 1,
    Dispatching = 2,
    Writing = 3,
    Closed = 4,
}

/// What the worker should do with a context after driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Parked until the next readiness event.
    Open,
    Close,
}

#[derive(Debug, Default, Clone, Copy)]
struct WriteCursor {
    response: usize,
    segment: usize,
    offset: usize,
}

/// Per-connection state: receive ring, parser, batched responses and write cursor.
pub struct Context {
    fd: c_int,
    state: ConnState,
    buffer: CircularBuffer,
    parser: Parser,
    heads: Vec<RequestHead>,
    responses: Vec<Response>,
    pending: usize,
    cursor: WriteCursor,
    close_after_write: bool,
    peer_closed: bool,
    last_active: u64,
}

impl Context {
    pub fn new(buffer_size: usize) -> io::Result<Self> {
        let buffer = CircularBuffer::new(buffer_size)?;
        Ok(Self {
            fd: -1,
            state: ConnState::Closed,
            parser: Parser::with_limit(buffer.capacity()),
            buffer,
            heads: (0..MAX_BATCH).map(|_| RequestHead::default()).collect(),
            // One extra slot for the error reply that ends a batch.
            responses: (0..=MAX_BATCH).map(|_| Response::new()).collect(),
            pending: 0,
            cursor: WriteCursor::default(),
            close_after_write: false,
            peer_closed: false,
            last_active: 0,
        })
    }

    /// Bind a freshly accepted socket.
    pub fn attach(&mut self, fd: c_int, now: u64) {
        self.fd = fd;
        self.state = ConnState::Idle;
        self.last_active = now;
    }

    /// Forget the socket and clear all per-connection state, keeping allocations.
    pub fn reset(&mut self) {
        self.fd = -1;
        self.state = ConnState::Closed;
        self.buffer.reset();
        self.parser.reset();
        self.pending = 0;
        self.cursor = WriteCursor::default();
        self.close_after_write = false;
        self.peer_closed = false;
        self.last_active = 0;
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn touch(&mut self, now: u64) {
        self.last_active = now;
    }

    pub fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_active)
    }

    /// True while responses are queued but not fully written.
    pub fn has_pending_writes(&self) -> bool {
        self.pending > 0
    }

    /// Read, parse, dispatch and write until the socket would block or the
    /// connection has to close.
    pub fn drive(&mut self, router: &dyn Router, date: &[u8], metrics: &WorkerMetrics) -> Outcome {
        loop {
            if self.pending > 0 {
                self.state = ConnState::Writing;
                match self.flush(metrics) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::Open,
                    Err(e) => {
                        debug!(fd = self.fd, "write failed: {}", e);
                        return Outcome::Close;
                    }
                }
            }
            if self.close_after_write {
                return Outcome::Close;
            }

            self.state = ConnState::Dispatching;
            if self.dispatch(router, date, metrics) {
                continue;
            }
            if self.peer_closed {
                return Outcome::Close;
            }

            self.state = ConnState::Reading;
            let space = self.buffer.remaining_mut();
            if space.is_empty() {
                // A single request does not fit in the ring.
                self.reply_error(413, date);
                syscalls::shutdown_read(self.fd);
                continue;
            }
            match syscalls::read_nonblocking(self.fd, space) {
                Ok(0) => self.peer_closed = true,
                Ok(n) => self.buffer.produce(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.state = ConnState::Idle;
                    return Outcome::Open;
                }
                Err(e) => {
                    debug!(fd = self.fd, "read failed: {}", e);
                    return Outcome::Close;
                }
            }
        }
    }

    fn reply_error(&mut self, status: u16, date: &[u8]) {
        let res = &mut self.responses[0];
        res.error(status);
        res.finalize(date, false);
        self.pending = 1;
        self.cursor = WriteCursor::default();
        self.close_after_write = true;
    }

    /// Parse up to `MAX_BATCH` complete requests from the ring, route them and
    /// lay out their responses. Returns false when nothing was queued.
    fn dispatch(&mut self, router: &dyn Router, date: &[u8], metrics: &WorkerMetrics) -> bool {
        let buf = self.buffer.unconsumed();
        let mut starts = [0usize; MAX_BATCH];
        let mut count = 0;
        let mut offset = 0;
        let mut failure = None;

        while count < MAX_BATCH {
            match self.parser.advance(&buf[offset..]) {
                Ok(Some(len)) => {
                    self.parser.take_head(&mut self.heads[count]);
                    starts[count] = offset;
                    offset += len;
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut queued = 0;
        if count > 0 {
            let requests: ArrayVec<Request<'_>, MAX_BATCH> = (0..count)
                .map(|i| Request::new(&buf[starts[i]..], &self.heads[i]))
                .collect();
            let responses = &mut self.responses[..count];
            for res in responses.iter_mut() {
                res.reset();
            }

            if route_batch(router, &requests, responses) {
                for (req, res) in requests.iter().zip(responses.iter_mut()) {
                    if req.wants_close() {
                        res.close();
                    }
                    res.finalize(date, req.method() == Method::Head);
                    queued += 1;
                    if res.closes_connection() {
                        // Nothing after a closing response is written.
                        self.close_after_write = true;
                        break;
                    }
                }
            } else {
                let res = &mut responses[0];
                res.error(500);
                res.finalize(date, requests[0].method() == Method::Head);
                queued = 1;
                self.close_after_write = true;
            }
            metrics.add_reqs(count);
        }

        if let Some(err) = failure {
            if !self.close_after_write {
                debug!(fd = self.fd, "rejecting request: {}", err);
                let res = &mut self.responses[queued];
                res.error(err.status());
                res.finalize(date, false);
                queued += 1;
                self.close_after_write = true;
                if err == ParseError::PayloadTooLarge {
                    syscalls::shutdown_read(self.fd);
                }
            }
        }

        self.buffer.consume(offset);
        if queued > 0 {
            self.pending = queued;
            self.cursor = WriteCursor::default();
        }
        queued > 0
    }

    /// Write queued responses with vectored I/O, resuming from the cursor.
    fn flush(&mut self, metrics: &WorkerMetrics) -> io::Result<()> {
        loop {
            let mut slices: ArrayVec<IoSlice<'_>, MAX_IOVECS> = ArrayVec::new();
            let WriteCursor {
                mut response,
                mut segment,
                mut offset,
            } = self.cursor;

            'fill: while response < self.pending {
                let res = &self.responses[response];
                while segment < res.segments() {
                    if slices.is_full() {
                        break 'fill;
                    }
                    let bytes = &res.segment(segment)[offset..];
                    if !bytes.is_empty() {
                        slices.push(IoSlice::new(bytes));
                    }
                    offset = 0;
                    segment += 1;
                }
                response += 1;
                segment = 0;
            }

            if slices.is_empty() {
                self.pending = 0;
                self.cursor = WriteCursor::default();
                return Ok(());
            }

            let n = syscalls::writev_nonblocking(self.fd, &slices)?;
            drop(slices);
            metrics.add_bytes(n);
            self.advance_cursor(n);
        }
    }

    fn advance_cursor(&mut self, mut n: usize) {
        while n > 0 && self.cursor.response < self.pending {
            let res = &self.responses[self.cursor.response];
            if self.cursor.segment >= res.segments() {
                self.cursor.response += 1;
                self.cursor.segment = 0;
                self.cursor.offset = 0;
                continue;
            }
            let left = res.segment(self.cursor.segment).len() - self.cursor.offset;
            if n < left {
                self.cursor.offset += n;
                return;
            }
            n -= left;
            self.cursor.segment += 1;
            self.cursor.offset = 0;
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("fd", &self.fd)
            .field("state", &self.state)
            .field("buffer", &self.buffer)
            .field("pending", &self.pending)
            .finish()
    }
}

/// Run the router; false if it panicked.
#[cfg(feature = "catch-panic")]
fn route_batch(router: &dyn Router, requests: &[Request<'_>], responses: &mut [Response]) -> bool {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        router.route(requests, responses)
    }));
    if result.is_err() {
        tracing::error!("router panicked; answering 500");
    }
    result.is_ok()
}

#[cfg(not(feature = "catch-panic"))]
fn route_batch(router: &dyn Router, requests: &[Request<'_>], responses: &mut [Response]) -> bool {
    router.route(requests, responses);
    true
}
