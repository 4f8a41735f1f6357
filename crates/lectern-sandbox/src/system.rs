// src/system.rs
//! OS primitives behind the jail lifecycle.
//!
//! [`Jail`](crate::jail::Jail) drives the protocol; a [`JailSystem`] performs
//! each step. [`FreeBsdJails`] talks to nmount(2), jail(2) and rctl(2).
//! [`HostJails`] keeps the directory layout but confines nothing, which is
//! what development hosts and the test suite run on.

use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};

/// Kernel-assigned jail identifier.
pub type JailId = i32;

pub trait JailSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when children are actually confined and the template is mounted.
    fn isolates(&self) -> bool;

    /// Null-mount `source` at `target`.
    fn mount(&self, source: &Path, target: &Path, read_only: bool) -> io::Result<()>;

    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Create a persistent jail rooted at `root`.
    fn create_jail(&self, name: &str, root: &Path) -> io::Result<JailId>;

    fn remove_jail(&self, jid: JailId) -> io::Result<()>;

    fn add_rule(&self, rule: &str) -> io::Result<()>;

    /// Remove every rule matching `filter` (a `jail:<name>:` prefix).
    fn remove_rules(&self, filter: &str) -> io::Result<()>;

    /// Tighten the jail before untrusted code runs in it.
    fn protect(&self, jid: JailId) -> io::Result<()>;

    /// Arrange for `command` to run inside the jail with `/tmp` as its working
    /// directory. `env` is the host side of that `/tmp`.
    fn confine(&self, jid: JailId, env: &Path, command: &mut Command);
}

/// Unconfined stand-in: mounts, jails and rules are no-ops and children run
/// directly in the env directory.
#[derive(Debug, Default)]
pub struct HostJails {
    next_jid: AtomicI32,
}

impl HostJails {
    pub fn new() -> Self {
        tracing::warn!("sandbox running on the host backend: submitted code is NOT isolated");
        Self::default()
    }
}

impl JailSystem for HostJails {
    fn name(&self) -> &'static str {
        "host"
    }

    fn isolates(&self) -> bool {
        false
    }

    fn mount(&self, source: &Path, target: &Path, _read_only: bool) -> io::Result<()> {
        tracing::trace!("host backend skips mount {} -> {}", source.display(), target.display());
        Ok(())
    }

    fn unmount(&self, _target: &Path) -> io::Result<()> {
        Ok(())
    }

    fn create_jail(&self, _name: &str, _root: &Path) -> io::Result<JailId> {
        Ok(self.next_jid.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn remove_jail(&self, _jid: JailId) -> io::Result<()> {
        Ok(())
    }

    fn add_rule(&self, _rule: &str) -> io::Result<()> {
        Ok(())
    }

    fn remove_rules(&self, _filter: &str) -> io::Result<()> {
        Ok(())
    }

    fn protect(&self, _jid: JailId) -> io::Result<()> {
        Ok(())
    }

    fn confine(&self, _jid: JailId, env: &Path, command: &mut Command) {
        command.current_dir(env);
    }
}

#[cfg(target_os = "freebsd")]
pub use freebsd::FreeBsdJails;

#[cfg(target_os = "freebsd")]
mod freebsd {
    use super::{JailId, JailSystem};
    use std::ffi::{CString, c_char, c_int, c_uint};
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::process::CommandExt;
    use std::path::Path;
    use std::process::Command;

    unsafe extern "C" {
        fn nmount(iov: *mut libc::iovec, niov: c_uint, flags: c_int) -> c_int;
        fn unmount(dir: *const c_char, flags: c_int) -> c_int;
        fn jail_set(iov: *mut libc::iovec, niov: c_uint, flags: c_int) -> c_int;
        fn jail_remove(jid: c_int) -> c_int;
        fn jail_attach(jid: c_int) -> c_int;
        fn rctl_add_rule(inbuf: *const c_char, inlen: usize, outbuf: *mut c_char, outlen: usize) -> c_int;
        fn rctl_remove_rule(inbuf: *const c_char, inlen: usize, outbuf: *mut c_char, outlen: usize) -> c_int;
    }

    const MNT_RDONLY: c_int = 0x0000_0001;
    const JAIL_CREATE: c_int = 0x01;
    const JAIL_UPDATE: c_int = 0x02;
    /// Highest securelevel; no raw devices, no clock changes, no firewall edits.
    const SECURELEVEL: c_int = 3;
    const JAIL_PATH: &str = "/bin:/usr/bin:/usr/local/bin";

    enum Value {
        Str(CString),
        Int(c_int),
        Flag,
        Buf(Vec<u8>),
    }

    /// Name/value pairs in the iovec layout nmount(2) and jail_set(2) take.
    struct Params {
        items: Vec<(CString, Value)>,
    }

    fn cstring(bytes: &[u8]) -> io::Result<CString> {
        CString::new(bytes).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
    }

    impl Params {
        fn new() -> Self {
            Self { items: Vec::new() }
        }

        fn push(&mut self, name: &str, value: Value) -> io::Result<&mut Self> {
            self.items.push((cstring(name.as_bytes())?, value));
            Ok(self)
        }

        fn str(&mut self, name: &str, value: &[u8]) -> io::Result<&mut Self> {
            let value = Value::Str(cstring(value)?);
            self.push(name, value)
        }

        fn errmsg(&mut self) -> io::Result<&mut Self> {
            self.push("errmsg", Value::Buf(vec![0; 256]))
        }

        fn message(&self) -> Option<String> {
            self.items.iter().find_map(|(_, v)| match v {
                Value::Buf(buf) if buf[0] != 0 => {
                    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
                    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
                }
                _ => None,
            })
        }

        fn iovecs(&mut self) -> Vec<libc::iovec> {
            let mut iov = Vec::with_capacity(self.items.len() * 2);
            for (name, value) in &mut self.items {
                iov.push(libc::iovec {
                    iov_base: name.as_ptr() as *mut _,
                    iov_len: name.as_bytes_with_nul().len(),
                });
                let (base, len) = match value {
                    Value::Str(s) => (s.as_ptr() as *mut libc::c_void, s.as_bytes_with_nul().len()),
                    Value::Int(n) => (n as *mut c_int as *mut libc::c_void, size_of::<c_int>()),
                    Value::Flag => (std::ptr::null_mut(), 0),
                    Value::Buf(buf) => (buf.as_mut_ptr() as *mut libc::c_void, buf.len()),
                };
                iov.push(libc::iovec { iov_base: base, iov_len: len });
            }
            iov
        }

        /// Attach the kernel's errmsg, if any, to the errno.
        fn error(&self) -> io::Error {
            let errno = io::Error::last_os_error();
            match self.message() {
                Some(msg) => io::Error::new(errno.kind(), format!("{errno}: {msg}")),
                None => errno,
            }
        }
    }

    fn path_cstring(path: &Path) -> io::Result<CString> {
        cstring(path.as_os_str().as_bytes())
    }

    fn rctl(call: unsafe extern "C" fn(*const c_char, usize, *mut c_char, usize) -> c_int, rule: &str) -> io::Result<()> {
        let rule = cstring(rule.as_bytes())?;
        let bytes = rule.as_bytes_with_nul();
        let rc = unsafe { call(rule.as_ptr(), bytes.len(), std::ptr::null_mut(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// FreeBSD jails with nullfs-composed roots and rctl limits. Requires root.
    #[derive(Debug, Default)]
    pub struct FreeBsdJails;

    impl FreeBsdJails {
        pub fn new() -> Self {
            FreeBsdJails
        }
    }

    impl JailSystem for FreeBsdJails {
        fn name(&self) -> &'static str {
            "jail"
        }

        fn isolates(&self) -> bool {
            true
        }

        fn mount(&self, source: &Path, target: &Path, read_only: bool) -> io::Result<()> {
            let mut params = Params::new();
            params
                .str("fstype", b"nullfs")?
                .str("fspath", target.as_os_str().as_bytes())?
                .str("target", source.as_os_str().as_bytes())?
                .errmsg()?;
            let mut iov = params.iovecs();
            let flags = if read_only { MNT_RDONLY } else { 0 };
            let rc = unsafe { nmount(iov.as_mut_ptr(), iov.len() as c_uint, flags) };
            if rc < 0 {
                return Err(params.error());
            }
            Ok(())
        }

        fn unmount(&self, target: &Path) -> io::Result<()> {
            let target = path_cstring(target)?;
            if unsafe { unmount(target.as_ptr(), 0) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn create_jail(&self, name: &str, root: &Path) -> io::Result<JailId> {
            let mut params = Params::new();
            params
                .str("path", root.as_os_str().as_bytes())?
                .str("name", name.as_bytes())?
                .str("host.hostname", name.as_bytes())?
                .push("persist", Value::Flag)?
                .errmsg()?;
            let mut iov = params.iovecs();
            let jid = unsafe { jail_set(iov.as_mut_ptr(), iov.len() as c_uint, JAIL_CREATE) };
            if jid < 0 {
                return Err(params.error());
            }
            Ok(jid)
        }

        fn remove_jail(&self, jid: JailId) -> io::Result<()> {
            if unsafe { jail_remove(jid) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn add_rule(&self, rule: &str) -> io::Result<()> {
            rctl(rctl_add_rule, rule)
        }

        fn remove_rules(&self, filter: &str) -> io::Result<()> {
            match rctl(rctl_remove_rule, filter) {
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
                other => other,
            }
        }

        fn protect(&self, jid: JailId) -> io::Result<()> {
            let mut params = Params::new();
            params
                .push("jid", Value::Int(jid))?
                .push("securelevel", Value::Int(SECURELEVEL))?
                .errmsg()?;
            let mut iov = params.iovecs();
            if unsafe { jail_set(iov.as_mut_ptr(), iov.len() as c_uint, JAIL_UPDATE) } < 0 {
                return Err(params.error());
            }
            Ok(())
        }

        fn confine(&self, jid: JailId, _env: &Path, command: &mut Command) {
            command.env_clear().env("PATH", JAIL_PATH).env("HOME", "/tmp");
            unsafe {
                command.pre_exec(move || {
                    if jail_attach(jid) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::chdir(c"/tmp".as_ptr()) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
    }
}
