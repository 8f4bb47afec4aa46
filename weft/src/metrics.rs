// src/metrics.rs

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counters. Each counter has a single writer (its worker);
/// the reporter thread reads with relaxed loads.
#[derive(Default)]
pub struct WorkerMetrics {
    pub active_conns: AtomicU64,
    pub req_count: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = WorkerMetrics::new();
        m.inc_conn();
        m.inc_conn();
        m.dec_conn();
        m.inc_req();
        m.add_bytes(100);
        assert_eq!(m.active_conns.load(Ordering::Relaxed), 1);
        assert_eq!(m.req_count.load(Ordering::Relaxed), 1);
        assert_eq!(m.bytes_sent.load(Ordering::Relaxed), 100);
    }
}
