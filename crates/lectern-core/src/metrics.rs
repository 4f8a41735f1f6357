// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-worker counters, padded to a cache line so workers never share one.
#[repr(C, align(64))]
pub struct WorkerMetrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub rejected_conns: AtomicUsize,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            rejected_conns: AtomicUsize::new(0),
        }
    }

    pub fn add_reqs(&self, n: usize) {
        self.req_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected_conns.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time totals across all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: usize,
    pub active_connections: usize,
    pub bytes_written: usize,
    pub rejected_connections: usize,
}

pub struct ServerMetrics {
    workers: Box<[WorkerMetrics]>,
}

impl ServerMetrics {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: (0..workers.max(1)).map(|_| WorkerMetrics::new()).collect(),
        }
    }

    /// Counters of worker `id`; ids past the end share the last slot.
    pub fn worker(&self, id: usize) -> &WorkerMetrics {
        &self.workers[id.min(self.workers.len() - 1)]
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();
        for w in self.workers.iter() {
            snap.requests += w.req_count.load(Ordering::Relaxed);
            snap.active_connections += w.active_conns.load(Ordering::Relaxed);
            snap.bytes_written += w.bytes_sent.load(Ordering::Relaxed);
            snap.rejected_connections += w.rejected_conns.load(Ordering::Relaxed);
        }
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sums_workers() {
        let metrics = ServerMetrics::new(2);
        metrics.worker(0).add_reqs(3);
        metrics.worker(1).add_reqs(2);
        metrics.worker(1).inc_conn();
        metrics.worker(0).add_bytes(100);
        metrics.worker(7).inc_rejected();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 5);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.bytes_written, 100);
        assert_eq!(snap.rejected_connections, 1);
        assert_eq!(std::mem::align_of::<WorkerMetrics>(), 64);
    }
}
