// src/worker.rs
use crate::conn::{Context, Outcome};
use crate::error::{LecternError, LecternResult};
use crate::metrics::{ServerMetrics, WorkerMetrics};
use crate::pool::Pool;
use crate::router::Router;
use crate::slab::{Slab, Token};
use crate::syscalls::{self, Events, Poller};
use libc::c_int;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Reserved tokens; slab tokens never reach these values.
pub const LISTENER: Token = u64::MAX;
pub const TIMER: Token = u64::MAX - 1;
pub const SIGNAL: Token = u64::MAX - 2;

const EVENT_CAPACITY: usize = 1024;
/// Upper bound on one wait, so a shutdown requested from another thread is noticed.
const WAIT_TIMEOUT: Duration = Duration::from_millis(250);

/// `Date` header value, reformatted once per timer tick.
pub struct DateCache {
    value: String,
}

impl DateCache {
    pub fn new() -> Self {
        let mut cache = Self {
            value: String::with_capacity(40),
        };
        cache.refresh();
        cache
    }

    /// RFC 2822 (RFC 822 with four-digit years) in the local timezone.
    pub fn refresh(&mut self) {
        self.value.clear();
        self.value.push_str(&chrono::Local::now().to_rfc2822());
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Worker {
    id: usize,
    listen_fd: c_int,
    router: Arc<dyn Router>,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<AtomicBool>,
    buffer_size: usize,
    idle_timeout: u64,
    handle_signals: bool,
}

/// Event-loop state owned by the worker thread.
struct Reactor {
    poller: Poller,
    slab: Slab<Context>,
    date: DateCache,
    tick: u64,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        listen_fd: c_int,
        router: Arc<dyn Router>,
        metrics: Arc<ServerMetrics>,
        shutdown: Arc<AtomicBool>,
        buffer_size: usize,
        idle_timeout: u64,
        handle_signals: bool,
    ) -> Self {
        Self {
            id,
            listen_fd,
            router,
            metrics,
            shutdown,
            buffer_size,
            idle_timeout,
            handle_signals,
        }
    }

    fn fatal(&self, message: String) -> LecternError {
        // Take the other workers down with us.
        self.shutdown.store(true, Ordering::Release);
        LecternError::Worker {
            id: self.id,
            message,
        }
    }

    fn reactor(&self) -> LecternResult<Reactor> {
        let mut poller = Poller::new()?;
        poller.add_listener(self.listen_fd, LISTENER)?;
        poller.add_timer(TIMER, Duration::from_secs(1))?;
        if self.handle_signals {
            poller.add_shutdown_signals(SIGNAL)?;
        }

        let buffer_size = self.buffer_size;
        let pool = Pool::new(move || Context::new(buffer_size).map(Box::new));
        Ok(Reactor {
            poller,
            slab: Slab::new(pool),
            date: DateCache::new(),
            tick: 0,
        })
    }

    pub fn run(self) -> LecternResult<()> {
        let mut reactor = self
            .reactor()
            .map_err(|e| self.fatal(format!("event queue setup failed: {e}")))?;
        let metrics = self.metrics.worker(self.id);
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        debug!("Worker {} entering main event loop.", self.id);

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = reactor.poller.wait(&mut events, Some(WAIT_TIMEOUT)) {
                return Err(self.fatal(format!("event wait failed: {e}")));
            }

            for event in events.iter() {
                match event.token {
                    LISTENER => self.accept(&mut reactor, metrics)?,
                    TIMER => {
                        reactor.tick += reactor.poller.ack_timer().max(1);
                        reactor.date.refresh();
                        if self.idle_timeout > 0 {
                            self.sweep_idle(&mut reactor, metrics);
                        }
                    }
                    SIGNAL => {
                        let signo = reactor.poller.ack_signal();
                        info!("Worker {} received shutdown signal {:?}.", self.id, signo);
                        self.shutdown.store(true, Ordering::Release);
                    }
                    token => self.handle(token, &mut reactor, metrics),
                }
            }
        }

        let open = reactor.slab.tokens();
        for token in open {
            close(token, &mut reactor, metrics);
        }
        debug!("Worker {} exiting gracefully.", self.id);
        Ok(())
    }

    /// Drain the accept backlog. Other workers race for the same listener,
    /// so an empty backlog right after wakeup is normal.
    fn accept(&self, reactor: &mut Reactor, metrics: &WorkerMetrics) -> LecternResult<()> {
        loop {
            let fd = match syscalls::accept_connection(self.listen_fd) {
                Ok(Some(fd)) => fd,
                Ok(None) => return Ok(()),
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::ECONNABORTED | libc::EINTR | libc::EPROTO)
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Worker {} accept failed: {}", self.id, e);
                    return Err(self.fatal(format!("accept failed: {e}")));
                }
            };

            let token = match reactor.slab.insert() {
                Ok((token, ctx)) => {
                    ctx.attach(fd, reactor.tick);
                    token
                }
                Err(e) => {
                    warn!("Worker {} rejecting connection: {}", self.id, e);
                    syscalls::close_connection(fd);
                    metrics.inc_rejected();
                    continue;
                }
            };

            if let Err(e) = reactor.poller.add_connection(fd, token) {
                warn!("Worker {} failed to register connection: {}", self.id, e);
                if let Some(mut ctx) = reactor.slab.remove(token) {
                    ctx.reset();
                    reactor.slab.release(ctx);
                }
                syscalls::close_connection(fd);
                metrics.inc_rejected();
                continue;
            }
            metrics.inc_conn();
        }
    }

    fn handle(&self, token: Token, reactor: &mut Reactor, metrics: &WorkerMetrics) {
        let tick = reactor.tick;
        let Some(ctx) = reactor.slab.get_mut(token) else {
            trace!(token, "dropping event for a closed connection");
            return;
        };
        let outcome = ctx.drive(&*self.router, reactor.date.as_bytes(), metrics);
        ctx.touch(tick);
        if outcome == Outcome::Close {
            close(token, reactor, metrics);
        }
    }

    fn sweep_idle(&self, reactor: &mut Reactor, metrics: &WorkerMetrics) {
        let tick = reactor.tick;
        for token in reactor.slab.tokens() {
            let idle = reactor
                .slab
                .get_mut(token)
                .is_some_and(|ctx| !ctx.has_pending_writes() && ctx.idle_for(tick) >= self.idle_timeout);
            if idle {
                debug!(token, "closing idle connection");
                close(token, reactor, metrics);
            }
        }
    }
}

/// Unregister, close the socket, invalidate the token and pool the context.
fn close(token: Token, reactor: &mut Reactor, metrics: &WorkerMetrics) {
    let Some(mut ctx) = reactor.slab.remove(token) else {
        return;
    };
    let fd = ctx.fd();
    if let Err(e) = reactor.poller.delete(fd) {
        debug!(fd, "event queue delete failed: {}", e);
    }
    syscalls::close_connection(fd);
    ctx.reset();
    reactor.slab.release(ctx);
    metrics.dec_conn();
}
