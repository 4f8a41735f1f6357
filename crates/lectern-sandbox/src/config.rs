// src/config.rs
use crate::error::{SandboxError, SandboxResult};
use crate::limits::Limits;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which [`JailSystem`](crate::system::JailSystem) runs the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// FreeBSD jails, nullfs mounts and rctl.
    Jail,
    /// Plain directories on the host, no isolation.
    Host,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "freebsd") {
            Backend::Jail
        } else {
            Backend::Host
        }
    }
}

impl FromStr for Backend {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jail" => Ok(Backend::Jail),
            "host" => Ok(Backend::Host),
            other => Err(SandboxError::InvalidConfig(format!("unknown backend {other:?}"))),
        }
    }
}

/// Verifier configuration loaded from `LECTERN_JAIL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory holding `containers/` and `envs/` (default: ./jails)
    pub root: PathBuf,

    /// Read-only filesystem mounted as every jail root (default: <root>/workster)
    pub template: PathBuf,

    pub backend: Backend,

    /// Wall-clock limit for the compile stage (default: 5)
    pub compile_timeout_secs: u64,

    /// Wall-clock limit for each test case (default: 2)
    pub run_timeout_secs: u64,

    /// Captured output per child; the rest is drained and dropped (default: 64 KiB)
    pub output_limit: usize,

    pub limits: Limits,

    /// JSON file replacing the built-in language registry
    pub languages: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let root = PathBuf::from("./jails");
        Self {
            template: root.join("workster"),
            root,
            backend: Backend::default(),
            compile_timeout_secs: 5,
            run_timeout_secs: 2,
            output_limit: 64 * 1024,
            limits: Limits::default(),
            languages: None,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SandboxConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let root = std::env::var("LECTERN_JAIL_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.root);
        let template = std::env::var("LECTERN_JAIL_TEMPLATE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("workster"));
        SandboxConfig {
            template,
            backend: env_or("LECTERN_JAIL_BACKEND", defaults.backend),
            compile_timeout_secs: env_or("LECTERN_JAIL_COMPILE_TIMEOUT", defaults.compile_timeout_secs),
            run_timeout_secs: env_or("LECTERN_JAIL_RUN_TIMEOUT", defaults.run_timeout_secs),
            output_limit: env_or("LECTERN_JAIL_OUTPUT_LIMIT", defaults.output_limit),
            limits: Limits {
                maxproc: env_or("LECTERN_JAIL_MAXPROC", defaults.limits.maxproc),
                vmemoryuse: env_or("LECTERN_JAIL_VMEMORYUSE", defaults.limits.vmemoryuse),
                memoryuse: env_or("LECTERN_JAIL_MEMORYUSE", defaults.limits.memoryuse),
                swapuse: env_or("LECTERN_JAIL_SWAPUSE", defaults.limits.swapuse),
            },
            languages: std::env::var("LECTERN_JAIL_LANGUAGES").ok().map(PathBuf::from),
            root,
        }
    }

    /// Sets the root and moves the template along with it.
    pub fn root(mut self, root: impl AsRef<Path>) -> Self {
        self.root = root.as_ref().to_path_buf();
        self.template = self.root.join("workster");
        self
    }

    pub fn template(mut self, template: impl AsRef<Path>) -> Self {
        self.template = template.as_ref().to_path_buf();
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn compile_timeout_secs(mut self, secs: u64) -> Self {
        self.compile_timeout_secs = secs;
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.run_timeout_secs = secs;
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn languages(mut self, path: impl AsRef<Path>) -> Self {
        self.languages = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.compile_timeout_secs == 0 || self.run_timeout_secs == 0 {
            return Err(SandboxError::InvalidConfig("timeouts must be at least one second".into()));
        }
        if self.output_limit == 0 {
            return Err(SandboxError::InvalidConfig("output_limit must be positive".into()));
        }
        if self.limits.maxproc == 0 {
            return Err(SandboxError::InvalidConfig("maxproc must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.root, PathBuf::from("./jails"));
        assert_eq!(cfg.template, PathBuf::from("./jails/workster"));
        assert_eq!(cfg.compile_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.run_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.containers_dir(), PathBuf::from("./jails/containers"));
        assert_eq!(cfg.envs_dir(), PathBuf::from("./jails/envs"));
        cfg.validate().unwrap();
    }

    #[test]
    fn root_moves_template() {
        let cfg = SandboxConfig::default().root("/var/lectern");
        assert_eq!(cfg.template, PathBuf::from("/var/lectern/workster"));
        let cfg = cfg.template("/usr/local/workster");
        assert_eq!(cfg.template, PathBuf::from("/usr/local/workster"));
    }

    #[test]
    fn backend_names() {
        assert_eq!("jail".parse::<Backend>().unwrap(), Backend::Jail);
        assert_eq!(" HOST ".parse::<Backend>().unwrap(), Backend::Host);
        assert!("docker".parse::<Backend>().is_err());
    }

    #[test]
    fn deserializes_from_json() {
        let cfg: SandboxConfig =
            serde_json::from_str(r#"{"backend": "host", "run_timeout_secs": 3, "limits": {"maxproc": 8}}"#)
                .unwrap();
        assert_eq!(cfg.backend, Backend::Host);
        assert_eq!(cfg.run_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.limits.maxproc, 8);
        assert_eq!(cfg.compile_timeout_secs, 5);
    }

    #[test]
    fn rejects_zero_timeouts() {
        assert!(SandboxConfig::default().run_timeout_secs(0).validate().is_err());
        assert!(SandboxConfig::default().output_limit(0).validate().is_err());
    }
}
