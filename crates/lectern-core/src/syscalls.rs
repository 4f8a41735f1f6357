// src/syscalls.rs
use crate::error::LecternResult;
use libc::{c_int, c_void, socklen_t};
use std::io::{self, IoSlice};
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::FromRawFd;
use std::ptr;
use std::sync::OnceLock;
use std::time::Duration;

/// Upper bound on iovecs handed to a single vectored write.
pub const MAX_IOVECS: usize = 64;

// ---- Memory ----

pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 { n as usize } else { 4096 }
    })
}

/// Create an unnamed shared memory object suitable for double mapping.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn anonymous_shm() -> io::Result<c_int> {
    let fd = unsafe { libc::memfd_create(c"lectern-ring".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(target_os = "freebsd")]
pub fn anonymous_shm() -> io::Result<c_int> {
    let fd = unsafe {
        libc::shm_open(
            libc::SHM_ANON as *const libc::c_char,
            libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
            0o600,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn anonymous_shm() -> io::Result<c_int> {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEQ: AtomicU64 = AtomicU64::new(0);
    let name = format!(
        "/lectern-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    unsafe {
        let fd = libc::shm_open(
            cname.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::c_uint,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // The name is only needed to obtain the descriptor.
        libc::shm_unlink(cname.as_ptr());
        Ok(fd)
    }
}

// ---- Socket Operations ----

/// Create a non-blocking TCP listener with SO_REUSEADDR.
///
/// Every worker registers the same descriptor with its own event queue, so
/// the listener is created once and shared.
pub fn create_listen_socket(host: &str, port: u16, backlog: i32) -> LecternResult<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);

        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // From here on the listener owns fd and closes it on every error path.
        let listener = TcpListener::from_raw_fd(fd);

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        set_nonblocking(fd)?;

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        bind_addr(fd, &addr)?;

        if libc::listen(fd, backlog) < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(listener)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_scope_id = a.scope_id();
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    unsafe {
        if libc::bind(
            fd,
            &storage as *const _ as *const libc::sockaddr,
            len as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg_attr(
    any(target_os = "linux", target_os = "android", target_os = "freebsd"),
    allow(dead_code)
)]
fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fdflags = libc::fcntl(fd, libc::F_GETFD, 0);
        if fdflags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC);
        }
    }
    Ok(())
}

/// Accept a non-blocking connection. `Ok(None)` means the backlog is drained.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<c_int>> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let fd = unsafe { libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut()) };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        };
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        if let Err(err) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        unsafe {
            // No MSG_NOSIGNAL on Darwin.
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }
    }

    Ok(Some(fd))
}

/// Read into `buf`. `Ok(0)` is EOF; EAGAIN surfaces as `ErrorKind::WouldBlock`.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Vectored write: write multiple buffers in a single syscall (scatter-gather I/O).
pub fn writev_nonblocking(fd: c_int, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }
    let count = bufs.len().min(MAX_IOVECS);

    loop {
        // IoSlice is ABI-compatible with struct iovec on Unix.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let res = unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
            msg.msg_iovlen = count as _;
            libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL)
        };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let res = unsafe { libc::writev(fd, bufs.as_ptr() as *const libc::iovec, count as c_int) };

        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn shutdown_read(fd: c_int) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RD);
    }
}

/// Half-close then close.
pub fn close_connection(fd: c_int) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
        libc::close(fd);
    }
}

// ---- Signals ----

const SHUTDOWN_SIGNALS: [c_int; 2] = [libc::SIGINT, libc::SIGTERM];

/// Writes to a reset peer must fail with EPIPE instead of killing the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Route SIGINT/SIGTERM to the event queues instead of default handlers.
///
/// Must run on the main thread before workers are spawned so they inherit
/// the mask.
pub fn route_shutdown_signals() -> io::Result<()> {
    ignore_sigpipe();
    unsafe {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            for sig in SHUTDOWN_SIGNALS {
                libc::sigaddset(&mut set, sig);
            }
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        for sig in SHUTDOWN_SIGNALS {
            // kqueue still records ignored signals.
            libc::signal(sig, libc::SIG_IGN);
        }
    }
    Ok(())
}

// ---- Event queue ----

/// A readiness notification, normalized across epoll and kqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

/// Reusable buffer of raw kernel events.
pub struct Events {
    raw: Vec<RawEvent>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![unsafe { mem::zeroed::<RawEvent>() }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().map(convert)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux_epoll::Poller;
#[cfg(any(target_os = "linux", target_os = "android"))]
use linux_epoll::{RawEvent, convert};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux_epoll {
    use super::*;
    use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

    pub(super) type RawEvent = epoll_event;

    fn timeout_ms(timeout: Option<Duration>) -> c_int {
        match timeout {
            Some(d) => d.as_millis().min(c_int::MAX as u128) as c_int,
            None => -1,
        }
    }

    pub(super) fn convert(raw: &epoll_event) -> Event {
        let flags = raw.events;
        let token = raw.u64;
        Event {
            token,
            readable: flags & (EPOLLIN | EPOLLRDHUP) as u32 != 0,
            writable: flags & EPOLLOUT as u32 != 0,
            hangup: flags & (EPOLLHUP | EPOLLRDHUP) as u32 != 0,
            error: flags & EPOLLERR as u32 != 0,
        }
    }

    /// epoll instance plus the timerfd and signalfd that stand in for
    /// kqueue's EVFILT_TIMER and EVFILT_SIGNAL.
    pub struct Poller {
        fd: c_int,
        timer_fd: c_int,
        signal_fd: c_int,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                fd,
                timer_fd: -1,
                signal_fd: -1,
            })
        }

        fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: c_int) -> io::Result<()> {
            let mut event = epoll_event {
                events: interests as u32,
                u64: token,
            };
            if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Edge-triggered accept readiness on a (shared) listener.
        pub fn add_listener(&self, fd: c_int, token: u64) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, EPOLLIN | EPOLLET)
        }

        /// Edge-triggered read + write readiness on an accepted socket.
        pub fn add_connection(&self, fd: c_int, token: u64) -> io::Result<()> {
            self.ctl(
                libc::EPOLL_CTL_ADD,
                fd,
                token,
                EPOLLIN | EPOLLOUT | EPOLLRDHUP | EPOLLET,
            )
        }

        pub fn delete(&self, fd: c_int) -> io::Result<()> {
            if unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
            Ok(())
        }

        pub fn add_timer(&mut self, token: u64, period: Duration) -> io::Result<()> {
            unsafe {
                let tfd = libc::timerfd_create(
                    libc::CLOCK_MONOTONIC,
                    libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
                );
                if tfd < 0 {
                    return Err(io::Error::last_os_error());
                }
                let interval = libc::timespec {
                    tv_sec: period.as_secs() as libc::time_t,
                    tv_nsec: period.subsec_nanos() as libc::c_long,
                };
                let spec = libc::itimerspec {
                    it_interval: interval,
                    it_value: interval,
                };
                if libc::timerfd_settime(tfd, 0, &spec, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    libc::close(tfd);
                    return Err(err);
                }
                if let Err(err) = self.ctl(libc::EPOLL_CTL_ADD, tfd, token, EPOLLIN) {
                    libc::close(tfd);
                    return Err(err);
                }
                self.timer_fd = tfd;
            }
            Ok(())
        }

        /// Watch SIGINT/SIGTERM. The signals must already be blocked in this thread.
        pub fn add_shutdown_signals(&mut self, token: u64) -> io::Result<()> {
            unsafe {
                let mut set: libc::sigset_t = mem::zeroed();
                libc::sigemptyset(&mut set);
                for sig in SHUTDOWN_SIGNALS {
                    libc::sigaddset(&mut set, sig);
                }
                let sfd = libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
                if sfd < 0 {
                    return Err(io::Error::last_os_error());
                }
                if let Err(err) = self.ctl(libc::EPOLL_CTL_ADD, sfd, token, EPOLLIN) {
                    libc::close(sfd);
                    return Err(err);
                }
                self.signal_fd = sfd;
            }
            Ok(())
        }

        /// Drain the timer source; returns the number of expirations.
        pub fn ack_timer(&self) -> u64 {
            let mut expirations: u64 = 0;
            unsafe {
                libc::read(
                    self.timer_fd,
                    &mut expirations as *mut u64 as *mut c_void,
                    mem::size_of::<u64>(),
                );
            }
            expirations
        }

        /// Drain the signal source; returns the last signal number read.
        pub fn ack_signal(&self) -> Option<c_int> {
            let mut last = None;
            loop {
                let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
                let n = unsafe {
                    libc::read(
                        self.signal_fd,
                        &mut info as *mut _ as *mut c_void,
                        mem::size_of::<libc::signalfd_siginfo>(),
                    )
                };
                if n != mem::size_of::<libc::signalfd_siginfo>() as isize {
                    return last;
                }
                last = Some(info.ssi_signo as c_int);
            }
        }

        /// Block until events arrive or `timeout` elapses. EINTR yields `Ok(0)`.
        pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
            let res = unsafe {
                libc::epoll_wait(
                    self.fd,
                    events.raw.as_mut_ptr(),
                    events.raw.len() as c_int,
                    timeout_ms(timeout),
                )
            };
            if res < 0 {
                events.len = 0;
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }
            events.len = res as usize;
            Ok(events.len)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                if self.timer_fd >= 0 {
                    libc::close(self.timer_fd);
                }
                if self.signal_fd >= 0 {
                    libc::close(self.signal_fd);
                }
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub use bsd_kqueue::Poller;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
use bsd_kqueue::{RawEvent, convert};

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod bsd_kqueue {
    use super::*;
    use libc::{
        EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_SIGNAL,
        EVFILT_TIMER, EVFILT_WRITE, kevent,
    };

    pub(super) type RawEvent = kevent;

    pub(super) fn convert(raw: &kevent) -> Event {
        let filter = raw.filter;
        Event {
            token: raw.udata as usize as u64,
            readable: filter == EVFILT_READ || filter == EVFILT_TIMER || filter == EVFILT_SIGNAL,
            writable: filter == EVFILT_WRITE,
            hangup: raw.flags & EV_EOF != 0,
            error: raw.flags & EV_ERROR != 0,
        }
    }

    fn change(ident: usize, filter: i16, flags: u16, data: isize, token: u64) -> kevent {
        let mut ev: kevent = unsafe { mem::zeroed() };
        ev.ident = ident as _;
        ev.filter = filter;
        ev.flags = flags;
        ev.fflags = 0;
        ev.data = data as _;
        ev.udata = token as usize as *mut c_void;
        ev
    }

    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { libc::kqueue() };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
            Ok(Self { fd })
        }

        fn submit(&self, changes: &[kevent]) -> io::Result<()> {
            let res = unsafe {
                libc::kevent(
                    self.fd,
                    changes.as_ptr(),
                    changes.len() as c_int,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                )
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn add_listener(&self, fd: c_int, token: u64) -> io::Result<()> {
            self.submit(&[change(fd as usize, EVFILT_READ, EV_ADD | EV_CLEAR, 0, token)])
        }

        pub fn add_connection(&self, fd: c_int, token: u64) -> io::Result<()> {
            self.submit(&[
                change(fd as usize, EVFILT_READ, EV_ADD | EV_CLEAR, 0, token),
                change(fd as usize, EVFILT_WRITE, EV_ADD | EV_CLEAR, 0, token),
            ])
        }

        pub fn delete(&self, fd: c_int) -> io::Result<()> {
            // Closing the descriptor drops its knotes anyway; ENOENT is harmless.
            let _ = self.submit(&[
                change(fd as usize, EVFILT_READ, EV_DELETE, 0, 0),
                change(fd as usize, EVFILT_WRITE, EV_DELETE, 0, 0),
            ]);
            Ok(())
        }

        pub fn add_timer(&mut self, token: u64, period: Duration) -> io::Result<()> {
            let ms = period.as_millis().max(1) as isize;
            self.submit(&[change(
                token as usize,
                EVFILT_TIMER,
                EV_ADD | EV_ENABLE,
                ms,
                token,
            )])
        }

        pub fn add_shutdown_signals(&mut self, token: u64) -> io::Result<()> {
            let changes: Vec<kevent> = SHUTDOWN_SIGNALS
                .iter()
                .map(|&sig| change(sig as usize, EVFILT_SIGNAL, EV_ADD | EV_CLEAR, 0, token))
                .collect();
            self.submit(&changes)
        }

        pub fn ack_timer(&self) -> u64 {
            1
        }

        /// EVFILT_SIGNAL needs no draining; the signal number is not tracked.
        pub fn ack_signal(&self) -> Option<c_int> {
            None
        }

        pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
            let ts = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let ts_ptr = match &ts {
                Some(t) => t as *const libc::timespec,
                None => ptr::null(),
            };
            let res = unsafe {
                libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    events.raw.as_mut_ptr(),
                    events.raw.len() as c_int,
                    ts_ptr,
                )
            };
            if res < 0 {
                events.len = 0;
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }
            events.len = res as usize;
            Ok(events.len)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
