// src/exec.rs
//! Bounded child execution: merged output capture with a byte cap, stdin
//! feeding, and a wall-clock watchdog that kills the whole process group.

use libc::c_int;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a bounded child run produced.
#[derive(Debug)]
pub struct Execution {
    pub status: ExitStatus,
    /// stdout and stderr interleaved as written, up to the output limit.
    pub output: Vec<u8>,
    pub truncated: bool,
    /// The watchdog fired and killed the process group.
    pub timed_out: bool,
    /// Wall-clock time from spawn until output collection finished.
    pub elapsed: Duration,
}

impl Execution {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Make the child the leader of a new session, so its process group id is
/// its pid and the watchdog can signal every descendant at once.
pub fn new_session(command: &mut Command) {
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn kill_group(pid: libc::pid_t) {
    // ESRCH once the group is gone.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

/// A pipe with both ends close-on-exec; the child gets dups of the write end.
fn output_pipe() -> io::Result<(File, OwnedFd)> {
    let mut fds: [c_int; 2] = [-1; 2];

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
    {
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
    }

    let reader = unsafe { File::from_raw_fd(fds[0]) };
    let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((reader, writer))
}

/// How long output may keep flowing once the process group is dead. Anything
/// still holding the pipe after that has left the group.
const DRAIN_GRACE: Duration = Duration::from_millis(250);
const POLL_SLICE_MS: c_int = 50;

/// Wait until `fd` reports `events`, giving up once `stop` is set.
fn ready(fd: c_int, events: libc::c_short, stop: &AtomicBool) -> bool {
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_SLICE_MS) };
        if rc > 0 {
            return true;
        }
        if rc < 0 && io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            // Let the following read or write report it.
            return true;
        }
    }
}

/// Keep the first `limit` bytes and drain the rest so the child never
/// blocks on a full pipe.
fn collect(mut reader: File, limit: usize, stop: &AtomicBool) -> (Vec<u8>, bool) {
    let mut output = Vec::with_capacity(limit.min(8192));
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    while ready(reader.as_raw_fd(), libc::POLLIN, stop) {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit - output.len();
                if n > room {
                    truncated = true;
                }
                output.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("output pipe read failed: {}", e);
                break;
            }
        }
    }
    (output, truncated)
}

fn feed(mut pipe: ChildStdin, data: &[u8], stop: &AtomicBool) {
    let fd = pipe.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    let mut rest = data;
    while !rest.is_empty() {
        match pipe.write(rest) {
            Ok(n) => rest = &rest[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !ready(fd, libc::POLLOUT, stop) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EPIPE when the program exits without reading.
            Err(_) => return,
        }
    }
}

/// Spawn `command`, feed it `stdin`, and wait at most `timeout`.
///
/// The command should already call [`new_session`]; otherwise the watchdog
/// signal misses the child. Any process still in the group after the child
/// exits is killed as well. A process that escaped the group may keep the
/// output pipe open; collection then stops shortly after the group is gone,
/// so the call never outlives the deadline by more than a short grace period.
pub fn run(mut command: Command, stdin: Option<&[u8]>, timeout: Duration, limit: usize) -> io::Result<Execution> {
    let (reader, writer) = output_pipe()?;
    let stderr = writer.try_clone()?;
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(stderr));

    let started = Instant::now();
    let mut child = command.spawn()?;
    // Release our copies of the write end, or the collector never sees EOF.
    drop(command);
    let pid = child.id() as libc::pid_t;

    let stop = Arc::new(AtomicBool::new(false));
    let (drained, collected) = mpsc::channel::<()>();
    let collector = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let result = collect(reader, limit, &stop);
            let _ = drained.send(());
            result
        })
    };
    let feeder = match (child.stdin.take(), stdin) {
        (Some(pipe), Some(data)) => {
            let data = data.to_vec();
            let stop = Arc::clone(&stop);
            Some(thread::spawn(move || feed(pipe, &data, &stop)))
        }
        _ => None,
    };

    let (done, expired) = mpsc::channel::<()>();
    let watchdog = thread::spawn(move || match expired.recv_timeout(timeout) {
        Err(RecvTimeoutError::Timeout) => {
            kill_group(pid);
            true
        }
        _ => false,
    });

    let status = child.wait();
    let _ = done.send(());
    let timed_out = watchdog.join().unwrap_or(false);
    kill_group(pid);

    if collected.recv_timeout(DRAIN_GRACE).is_err() {
        warn!(pid, "output pipe still held by a process outside the group; abandoning it");
    }
    stop.store(true, Ordering::Release);
    let (output, truncated) = collector.join().unwrap_or_default();
    if let Some(feeder) = feeder {
        let _ = feeder.join();
    }
    let elapsed = started.elapsed();

    Ok(Execution {
        status: status?,
        output,
        truncated,
        timed_out,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        new_session(&mut cmd);
        cmd
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn merges_stdout_and_stderr() {
        let run = run(sh("echo out; echo err >&2; echo again"), None, SECOND * 5, 1024).unwrap();
        assert!(run.success());
        assert_eq!(run.output_text(), "out\nerr\nagain\n");
        assert!(!run.truncated);
    }

    #[test]
    fn feeds_stdin() {
        let run = run(sh("read line; echo \"got $line\""), Some(b"abc\n"), SECOND * 5, 1024).unwrap();
        assert_eq!(run.output_text(), "got abc\n");
    }

    #[test]
    fn reports_exit_status() {
        let run = run(sh("echo nope; exit 3"), None, SECOND * 5, 1024).unwrap();
        assert!(!run.success());
        assert!(!run.timed_out);
        assert_eq!(run.status.code(), Some(3));
    }

    #[test]
    fn caps_output_but_drains() {
        let run = run(sh("yes x | head -c 100000"), None, SECOND * 5, 10).unwrap();
        assert!(run.success());
        assert_eq!(run.output, b"x\nx\nx\nx\nx\n");
        assert!(run.truncated);
    }

    #[test]
    fn watchdog_kills_the_group() {
        // The background sleeper shares the pipe; it must die too or this hangs.
        let run = run(sh("sleep 30 & while :; do :; done"), None, SECOND, 1024).unwrap();
        assert!(run.timed_out);
        assert!(!run.success());
        assert!(run.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn stragglers_are_reaped_after_exit() {
        let run = run(sh("sleep 30 & echo bye"), None, SECOND * 5, 1024).unwrap();
        assert!(!run.timed_out);
        assert_eq!(run.output_text(), "bye\n");
        assert!(run.elapsed < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn escaped_child_cannot_hold_the_deadline() {
        // The sleeper starts its own session, out of reach of the group kill,
        // and keeps the output pipe open for far longer than the timeout.
        let run = run(sh("setsid sleep 8 & echo started; while :; do :; done"), None, SECOND, 1024).unwrap();
        assert!(run.timed_out);
        assert_eq!(run.output_text(), "started\n");
        assert!(run.elapsed < Duration::from_secs(4), "took {:?}", run.elapsed);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn escaped_child_after_normal_exit_is_abandoned() {
        let run = run(sh("setsid sleep 8 & echo bye"), None, SECOND * 5, 1024).unwrap();
        assert!(!run.timed_out);
        assert!(run.success());
        assert_eq!(run.output_text(), "bye\n");
        assert!(run.elapsed < Duration::from_secs(4), "took {:?}", run.elapsed);
    }

    #[test]
    fn large_stdin_to_a_non_reader_does_not_block() {
        let input = vec![b'x'; 1 << 20];
        let run = run(sh("sleep 0.2; echo done"), Some(&input), SECOND * 5, 1024).unwrap();
        assert!(run.success());
        assert_eq!(run.output_text(), "done\n");
    }

    #[test]
    fn missing_program_is_an_error() {
        let mut cmd = Command::new("/nonexistent/lectern-compiler");
        new_session(&mut cmd);
        assert!(run(cmd, None, SECOND, 16).is_err());
    }
}
