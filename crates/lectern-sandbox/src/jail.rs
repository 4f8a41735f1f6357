// src/jail.rs
use crate::error::{SandboxError, SandboxResult};
use crate::exec;
use crate::limits::{Limits, rule_prefix};
use crate::system::{JailId, JailSystem};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Process-wide; jail names and directories are unique among live jails.
static NEXT_INDEX: AtomicU64 = AtomicU64::new(0);

/// Directories belonging to one jail index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailPaths {
    /// `<base>/containers/<idx>`, where the template is mounted.
    pub root: PathBuf,
    /// `<root>/tmp`, where `env` is mounted.
    pub tmp: PathBuf,
    /// `<base>/envs/<idx>`, the host side of the jail's `/tmp`.
    pub env: PathBuf,
}

impl JailPaths {
    pub fn new(base: &Path, index: u64) -> Self {
        let root = base.join("containers").join(index.to_string());
        Self {
            tmp: root.join("tmp"),
            env: base.join("envs").join(index.to_string()),
            root,
        }
    }
}

/// Something the jail created that teardown must undo.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resource {
    /// Empty directory; removed non-recursively so a stuck mount is never traversed.
    Dir(PathBuf),
    /// Host-owned scratch directory, removed with its contents.
    Tree(PathBuf),
    Mount(PathBuf),
    Jail(JailId),
    Rules(String),
    File(PathBuf),
}

/// A provisioned jail. Dropping it tears it down; [`Jail::destroy`] does the
/// same and hands back the failures.
pub struct Jail {
    system: Arc<dyn JailSystem>,
    index: u64,
    name: String,
    paths: JailPaths,
    jid: JailId,
    /// Creation order; undone in reverse.
    ledger: Vec<Resource>,
}

impl Jail {
    /// Provision a fresh jail under `base`. Whatever was set up before a
    /// failing step is reverted before the error is returned.
    pub fn create(
        system: Arc<dyn JailSystem>,
        base: &Path,
        template: &Path,
        limits: &Limits,
    ) -> SandboxResult<Jail> {
        let index = NEXT_INDEX.fetch_add(1, Ordering::Relaxed);
        let mut jail = Jail {
            system,
            index,
            name: format!("lectern-{}", index),
            paths: JailPaths::new(base, index),
            jid: 0,
            ledger: Vec::with_capacity(8),
        };

        if let Err(e) = jail.provision(template, limits) {
            for failure in jail.teardown() {
                warn!("jail {} rollback: {}", jail.name, failure);
            }
            return Err(e);
        }
        debug!("jail {} ready (jid {})", jail.name, jail.jid);
        Ok(jail)
    }

    fn provision(&mut self, template: &Path, limits: &Limits) -> SandboxResult<()> {
        let paths = self.paths.clone();

        fs::create_dir_all(&paths.root)?;
        self.ledger.push(Resource::Dir(paths.root.clone()));
        fs::create_dir_all(&paths.env)?;
        self.ledger.push(Resource::Tree(paths.env.clone()));

        self.system
            .mount(template, &paths.root, true)
            .map_err(|source| SandboxError::Mount {
                target: paths.root.clone(),
                source,
            })?;
        self.ledger.push(Resource::Mount(paths.root.clone()));

        self.system
            .mount(&paths.env, &paths.tmp, false)
            .map_err(|source| SandboxError::Mount {
                target: paths.tmp.clone(),
                source,
            })?;
        self.ledger.push(Resource::Mount(paths.tmp.clone()));

        self.jid = self
            .system
            .create_jail(&self.name, &paths.root)
            .map_err(|source| SandboxError::Jail {
                name: self.name.clone(),
                source,
            })?;
        self.ledger.push(Resource::Jail(self.jid));

        // Recorded up front: a half-applied rule set is removed by prefix.
        self.ledger.push(Resource::Rules(rule_prefix(&self.name)));
        for rule in limits.rules(&self.name) {
            self.system
                .add_rule(&rule)
                .map_err(|source| SandboxError::Rctl { rule, source })?;
        }
        Ok(())
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jid(&self) -> JailId {
        self.jid
    }

    pub fn paths(&self) -> &JailPaths {
        &self.paths
    }

    /// Write `contents` to `<env>/<file_name>` with mode 0644.
    pub fn place(&mut self, file_name: &str, contents: &[u8]) -> SandboxResult<PathBuf> {
        let path = self.paths.env.join(file_name);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)?;
        self.ledger.push(Resource::File(path.clone()));
        file.write_all(contents)?;
        Ok(path)
    }

    /// Unlink `<env>/<file_name>` at teardown, if it exists by then.
    pub fn track(&mut self, file_name: &str) {
        self.ledger.push(Resource::File(self.paths.env.join(file_name)));
    }

    pub fn protect(&self) -> SandboxResult<()> {
        self.system.protect(self.jid).map_err(|source| SandboxError::Jail {
            name: self.name.clone(),
            source,
        })
    }

    /// A command that runs `argv` inside the jail, in `/tmp`, as the leader of
    /// a new session.
    pub fn command(&self, argv: &[String]) -> SandboxResult<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::InvalidConfig("empty command line".into()))?;
        let mut command = Command::new(program);
        command.args(args);
        exec::new_session(&mut command);
        self.system.confine(self.jid, &self.paths.env, &mut command);
        Ok(command)
    }

    /// Undo everything in reverse creation order. Every step is attempted;
    /// failed ones stay in the ledger and are returned.
    fn teardown(&mut self) -> Vec<SandboxError> {
        let mut failures = Vec::new();
        let mut kept = Vec::new();
        while let Some(resource) = self.ledger.pop() {
            if let Err(e) = self.release(&resource) {
                failures.push(e);
                kept.push(resource);
            }
        }
        kept.reverse();
        self.ledger = kept;
        failures
    }

    fn release(&self, resource: &Resource) -> SandboxResult<()> {
        let tolerate_missing = |r: io::Result<()>| match r {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        match resource {
            Resource::File(path) => tolerate_missing(fs::remove_file(path))?,
            Resource::Rules(prefix) => {
                self.system
                    .remove_rules(prefix)
                    .map_err(|source| SandboxError::Rctl {
                        rule: prefix.clone(),
                        source,
                    })?
            }
            Resource::Jail(jid) => {
                self.system
                    .remove_jail(*jid)
                    .map_err(|source| SandboxError::Jail {
                        name: self.name.clone(),
                        source,
                    })?
            }
            Resource::Mount(target) => {
                self.system
                    .unmount(target)
                    .map_err(|source| SandboxError::Mount {
                        target: target.clone(),
                        source,
                    })?
            }
            Resource::Tree(path) => tolerate_missing(fs::remove_dir_all(path))?,
            Resource::Dir(path) => tolerate_missing(fs::remove_dir(path))?,
        }
        Ok(())
    }

    /// Tear the jail down, returning every failure. Each one is also logged.
    pub fn destroy(mut self) -> Vec<SandboxError> {
        let failures = self.teardown();
        for failure in &failures {
            warn!("jail {} cleanup: {}", self.name, failure);
        }
        self.ledger.clear();
        failures
    }
}

impl Drop for Jail {
    fn drop(&mut self) {
        if self.ledger.is_empty() {
            return;
        }
        for failure in self.teardown() {
            warn!("jail {} cleanup: {}", self.name, failure);
        }
    }
}

impl std::fmt::Debug for Jail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jail")
            .field("name", &self.name)
            .field("jid", &self.jid)
            .field("backend", &self.system.name())
            .field("paths", &self.paths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call; fails the call whose description starts with `fail_on`.
    #[derive(Default)]
    struct Recorder {
        pub calls: Mutex<Vec<String>>,
        pub fail_on: Option<String>,
    }

    impl Recorder {
        pub fn failing(prefix: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: Some(prefix.to_string()),
            }
        }

        fn log(&self, call: String) -> io::Result<()> {
            let fail = self.fail_on.as_ref().is_some_and(|p| call.starts_with(p.as_str()));
            self.calls.lock().unwrap().push(call);
            if fail {
                return Err(io::Error::from_raw_os_error(libc::EPERM));
            }
            Ok(())
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn leaf(path: &Path) -> String {
        let parent = path.parent().and_then(Path::file_name).unwrap_or_default();
        let name = path.file_name().unwrap_or_default();
        format!("{}/{}", parent.to_string_lossy(), name.to_string_lossy())
    }

    impl JailSystem for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn isolates(&self) -> bool {
            false
        }
        fn mount(&self, _source: &Path, target: &Path, read_only: bool) -> io::Result<()> {
            self.log(format!("mount {} ro={}", leaf(target), read_only))
        }
        fn unmount(&self, target: &Path) -> io::Result<()> {
            self.log(format!("unmount {}", leaf(target)))
        }
        fn create_jail(&self, name: &str, _root: &Path) -> io::Result<JailId> {
            self.log(format!("create {}", name)).map(|_| 42)
        }
        fn remove_jail(&self, jid: JailId) -> io::Result<()> {
            self.log(format!("remove {}", jid))
        }
        fn add_rule(&self, rule: &str) -> io::Result<()> {
            let resource = rule.split(':').nth(2).unwrap_or_default();
            self.log(format!("rule {}", resource))
        }
        fn remove_rules(&self, filter: &str) -> io::Result<()> {
            assert!(filter.starts_with("jail:lectern-") && filter.ends_with(':'));
            self.log("unrule".to_string())
        }
        fn protect(&self, jid: JailId) -> io::Result<()> {
            self.log(format!("protect {}", jid))
        }
        fn confine(&self, _jid: JailId, env: &Path, command: &mut Command) {
            command.current_dir(env);
        }
    }

    fn create(system: &Arc<Recorder>, base: &Path) -> SandboxResult<Jail> {
        let template = base.join("workster");
        Jail::create(system.clone(), base, &template, &Limits::default())
    }

    fn is_empty_dir(path: &Path) -> bool {
        fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(false)
    }

    #[test]
    fn layout() {
        let paths = JailPaths::new(Path::new("jails"), 7);
        assert_eq!(paths.root, PathBuf::from("jails/containers/7"));
        assert_eq!(paths.tmp, PathBuf::from("jails/containers/7/tmp"));
        assert_eq!(paths.env, PathBuf::from("jails/envs/7"));
    }

    #[test]
    fn create_then_destroy_leaves_nothing() {
        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(Recorder::default());
        let mut jail = create(&system, base.path()).unwrap();
        let idx = jail.index().to_string();
        assert_eq!(jail.name(), format!("lectern-{}", idx));
        assert_eq!(jail.jid(), 42);

        let source = jail.place("main.sh", b"echo hi\n").unwrap();
        assert!(source.starts_with(&jail.paths().env));
        jail.track("a.out");
        jail.protect().unwrap();
        let env = jail.paths().env.clone();
        let root = jail.paths().root.clone();
        assert!(env.join("main.sh").is_file());

        let failures = jail.destroy();
        assert!(failures.is_empty(), "{:?}", failures);
        assert!(!env.exists());
        assert!(!root.exists());
        assert!(is_empty_dir(&base.path().join("containers")));
        assert!(is_empty_dir(&base.path().join("envs")));

        let calls = system.calls();
        let setup = [
            format!("mount containers/{idx} ro=true"),
            format!("mount {idx}/tmp ro=false"),
            format!("create lectern-{idx}"),
            "rule maxproc".into(),
            "rule vmemoryuse".into(),
            "rule memoryuse".into(),
            "rule swapuse".into(),
            "protect 42".into(),
            "unrule".into(),
            "remove 42".into(),
            format!("unmount {idx}/tmp"),
            format!("unmount containers/{idx}"),
        ];
        assert_eq!(calls, setup);
    }

    #[test]
    fn failed_tmp_mount_reverts_root_mount() {
        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(Recorder::failing("mount "));
        // First mount fails: nothing to unmount, directories removed.
        let err = create(&system, base.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Mount { .. }));
        assert_eq!(system.calls().len(), 1);
        assert!(is_empty_dir(&base.path().join("containers")));
        assert!(is_empty_dir(&base.path().join("envs")));

        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(FailSecondMount::default());
        let err = Jail::create(system.clone(), base.path(), Path::new("/t"), &Limits::default()).unwrap_err();
        assert!(matches!(err, SandboxError::Mount { ref target, .. } if target.ends_with("tmp")));
        assert_eq!(system.unmounts.lock().unwrap().len(), 1);
        assert!(is_empty_dir(&base.path().join("containers")));
    }

    /// Lets the root mount through and refuses the tmp overlay.
    #[derive(Default)]
    struct FailSecondMount {
        mounts: Mutex<usize>,
        unmounts: Mutex<Vec<PathBuf>>,
    }

    impl JailSystem for FailSecondMount {
        fn name(&self) -> &'static str {
            "fail-second-mount"
        }
        fn isolates(&self) -> bool {
            false
        }
        fn mount(&self, _source: &Path, _target: &Path, _ro: bool) -> io::Result<()> {
            let mut n = self.mounts.lock().unwrap();
            *n += 1;
            if *n == 2 {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            Ok(())
        }
        fn unmount(&self, target: &Path) -> io::Result<()> {
            self.unmounts.lock().unwrap().push(target.to_path_buf());
            Ok(())
        }
        fn create_jail(&self, _name: &str, _root: &Path) -> io::Result<JailId> {
            unreachable!("jail created after a failed mount")
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
        fn confine(&self, _jid: JailId, _env: &Path, _command: &mut Command) {}
    }

    #[test]
    fn failed_jail_creation_unmounts_both() {
        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(Recorder::failing("create "));
        let err = create(&system, base.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Jail { .. }));
        let calls = system.calls();
        assert_eq!(calls.len(), 5);
        assert!(calls[3].starts_with("unmount ") && calls[3].ends_with("/tmp"));
        assert!(calls[4].starts_with("unmount containers/"));
        assert!(is_empty_dir(&base.path().join("envs")));
    }

    #[test]
    fn failed_rule_removes_rules_jail_and_mounts() {
        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(Recorder::failing("rule memoryuse"));
        let err = create(&system, base.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Rctl { ref rule, .. } if rule.contains(":memoryuse:deny=")));
        let calls = system.calls();
        let tail: Vec<_> = calls.iter().rev().take(4).rev().cloned().collect();
        assert_eq!(tail[0], "unrule");
        assert_eq!(tail[1], "remove 42");
        assert!(tail[2].starts_with("unmount ") && tail[2].ends_with("/tmp"));
        assert!(tail[3].starts_with("unmount containers/"));
        assert!(!calls.iter().any(|c| c == "rule swapuse"));
        assert!(is_empty_dir(&base.path().join("containers")));
        assert!(is_empty_dir(&base.path().join("envs")));
    }

    #[test]
    fn cleanup_attempts_every_step_and_collects_failures() {
        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(Recorder::failing("unmount "));
        let mut jail = create(&system, base.path()).unwrap();
        jail.place("main.c", b"int main(){}").unwrap();
        let env = jail.paths().env.clone();
        let root = jail.paths().root.clone();

        let failures = jail.destroy();
        // Both unmounts fail; everything else still runs.
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| matches!(f, SandboxError::Mount { .. })));
        let calls = system.calls();
        assert!(calls.contains(&"unrule".to_string()));
        assert!(calls.contains(&"remove 42".to_string()));
        assert!(!env.exists());
        assert!(!root.exists());
    }

    #[test]
    fn drop_tears_down() {
        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(Recorder::default());
        let env = {
            let mut jail = create(&system, base.path()).unwrap();
            jail.place("main.py", b"print(1)").unwrap();
            jail.paths().env.clone()
        };
        assert!(!env.exists());
        assert!(system.calls().contains(&"remove 42".to_string()));
    }

    #[test]
    fn indices_are_unique() {
        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(Recorder::default());
        let a = create(&system, base.path()).unwrap();
        let b = create(&system, base.path()).unwrap();
        assert_ne!(a.index(), b.index());
        assert_ne!(a.name(), b.name());
        assert_ne!(a.paths().env, b.paths().env);
    }

    #[test]
    fn empty_command_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let system = Arc::new(Recorder::default());
        let jail = create(&system, base.path()).unwrap();
        assert!(jail.command(&[]).is_err());
        assert!(jail.command(&["sh".to_string()]).is_ok());
    }
}
