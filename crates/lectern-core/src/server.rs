// src/server.rs
use crate::config::ServerConfig;
use crate::error::{LecternError, LecternResult};
use crate::metrics::ServerMetrics;
use crate::router::Router;
use crate::syscalls;
use crate::worker::Worker;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{error, info, warn};

/// Requests a graceful exit of every worker, as SIGINT/SIGTERM would.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Validate `config` and bind the shared listener. Bind failures are fatal
    /// to the caller; nothing is spawned yet.
    pub fn bind(config: ServerConfig) -> LecternResult<Self> {
        config.validate()?;
        let listener = syscalls::create_listen_socket(&config.host, config.port, config.backlog)?;
        let metrics = Arc::new(ServerMetrics::new(config.workers));
        Ok(Self {
            config,
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics,
        })
    }

    pub fn local_addr(&self) -> LecternResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Run the workers until a shutdown signal or [`ShutdownHandle::shutdown`].
    ///
    /// Call from the main thread when `handle_signals` is set, before any
    /// other thread is spawned, so every thread inherits the signal mask.
    pub fn serve<R: Router>(self, router: R) -> LecternResult<()> {
        if self.config.handle_signals {
            syscalls::route_shutdown_signals()?;
        } else {
            syscalls::ignore_sigpipe();
        }

        let router: Arc<dyn Router> = Arc::new(router);
        let core_ids = if self.config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let listen_fd = self.listener.as_raw_fd();
        let workers = self.config.workers;

        info!(
            "Starting {} workers on {}",
            workers,
            self.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| self.config.addr())
        );

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            // Pin to core or wrap around
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let worker = Worker::new(
                i,
                listen_fd,
                router.clone(),
                self.metrics.clone(),
                self.shutdown.clone(),
                self.config.buffer_size,
                self.config.idle_timeout_secs,
                self.config.handle_signals,
            );

            let spawned = thread::Builder::new()
                .name(format!("lectern-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            info!("Worker {} pinned to CPU {}", i, id.id);
                        } else {
                            warn!("Worker {} failed to pin to CPU {}", i, id.id);
                        }
                    }
                    worker.run()
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.shutdown.store(true, Ordering::Release);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        // Wait for all workers to finish
        let mut failure = None;
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("{}", e);
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    let e = LecternError::Worker {
                        id: i,
                        message: "worker thread panicked".into(),
                    };
                    error!("{}", e);
                    failure.get_or_insert(e);
                }
            }
        }

        let snap = self.metrics.snapshot();
        info!(
            "Server shut down. Requests: {} | Bytes Sent: {} | Rejected Connections: {}",
            snap.requests, snap.bytes_written, snap.rejected_connections
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_rejects_bad_config() {
        let cfg = ServerConfig::default().port(0).buffer_size(123);
        assert!(matches!(Server::bind(cfg), Err(LecternError::InvalidConfig(_))));
    }

    #[test]
    fn bind_reports_ephemeral_port() {
        let server = Server::bind(ServerConfig::default().port(0)).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        let handle = server.shutdown_handle();
        assert!(!handle.is_shutdown());
        handle.shutdown();
        assert!(handle.is_shutdown());
    }

    #[test]
    fn bind_fails_on_bad_host() {
        let cfg = ServerConfig::default().host("not an address").port(0);
        assert!(matches!(Server::bind(cfg), Err(LecternError::Io(_))));
    }
}
