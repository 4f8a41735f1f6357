// src/config.rs
use crate::error::{LecternError, LecternResult};
use serde::Deserialize;
use std::str::FromStr;

/// Server configuration loaded from `LECTERN_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (default: 127.0.0.1)
    pub host: String,

    /// Listen port (default: 7072)
    pub port: u16,

    /// `listen(2)` backlog (default: 128)
    pub backlog: i32,

    /// Worker threads (default: half the logical CPUs, rounded up)
    pub workers: usize,

    /// Receive ring capacity per connection; a multiple of the page size (default: 64 KiB)
    pub buffer_size: usize,

    /// Pin each worker to a CPU core (default: true)
    pub pin_workers: bool,

    /// Watch SIGINT/SIGTERM through the event queues (default: true)
    pub handle_signals: bool,

    /// Close connections idle for this many seconds; 0 disables (default: 0)
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7072,
            backlog: 128,
            workers: default_workers(),
            buffer_size: 64 * 1024,
            pin_workers: true,
            handle_signals: true,
            idle_timeout_secs: 0,
        }
    }
}

pub fn default_workers() -> usize {
    num_cpus::get().div_ceil(2).max(1)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        ServerConfig {
            host: std::env::var("LECTERN_HOST").unwrap_or(defaults.host),
            port: env_or("LECTERN_PORT", defaults.port),
            backlog: env_or("LECTERN_BACKLOG", defaults.backlog),
            workers: env_or("LECTERN_WORKERS", defaults.workers),
            buffer_size: env_or("LECTERN_BUFFER_SIZE", defaults.buffer_size),
            pin_workers: env_flag("LECTERN_PIN_WORKERS", defaults.pin_workers),
            handle_signals: env_flag("LECTERN_HANDLE_SIGNALS", defaults.handle_signals),
            idle_timeout_secs: env_or("LECTERN_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub fn handle_signals(mut self, handle: bool) -> Self {
        self.handle_signals = handle;
        self
    }

    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    /// Get the full server address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values no resource could be built from.
    pub fn validate(&self) -> LecternResult<()> {
        let page = crate::syscalls::page_size();
        if self.buffer_size == 0 || self.buffer_size % page != 0 {
            return Err(LecternError::InvalidConfig(format!(
                "buffer_size {} is not a positive multiple of the page size {}",
                self.buffer_size, page
            )));
        }
        if self.workers == 0 {
            return Err(LecternError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.backlog <= 0 {
            return Err(LecternError::InvalidConfig("backlog must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 7072);
        assert_eq!(cfg.backlog, 128);
        assert_eq!(cfg.addr(), "127.0.0.1:7072");
        assert!(cfg.workers >= 1);
        assert_eq!(cfg.idle_timeout_secs, 0);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_unaligned_buffer() {
        let cfg = ServerConfig::default().buffer_size(1000);
        assert!(matches!(cfg.validate(), Err(LecternError::InvalidConfig(_))));
        let cfg = ServerConfig::default().workers(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_from_partial_map() {
        // serde(default) fills anything missing.
        let cfg: ServerConfig = serde::Deserialize::deserialize(
            serde::de::value::MapDeserializer::<_, serde::de::value::Error>::new(
                [("port", 8080u16)].into_iter(),
            ),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.host, "127.0.0.1");
    }
}
