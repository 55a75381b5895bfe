//! Runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of runtime counters at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    /// Requests transmitted, including retransmits.
    pub requests_sent: u64,
    /// Requests that reached the complete phase.
    pub requests_completed: u64,
    /// Completions with a negative status.
    pub requests_failed: u64,
    /// Requests expired past their retry budget.
    pub timeouts: u64,
    /// Retransmissions.
    pub resends: u64,
    /// Bulk payload bytes moved, both directions.
    pub bulk_bytes: u64,
}

/// Thread-safe counters for one runtime.
pub struct RpcStats {
    requests_sent: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    timeouts: AtomicU64,
    resends: AtomicU64,
    bulk_bytes: AtomicU64,
}

impl Default for RpcStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RpcStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl RpcStats {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> RpcStats {
        RpcStats {
            requests_sent: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            resends: AtomicU64::new(0),
            bulk_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_send(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_complete(&self, status: i32) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        if status < 0 {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resend(&self) {
        self.resends.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bulk_bytes(&self, bytes: u64) {
        self.bulk_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Requests transmitted so far.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Requests completed so far.
    pub fn requests_completed(&self) -> u64 {
        self.requests_completed.load(Ordering::Relaxed)
    }

    /// Expiries so far.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Retransmissions so far.
    pub fn resends(&self) -> u64 {
        self.resends.load(Ordering::Relaxed)
    }

    /// Bulk bytes moved so far.
    pub fn bulk_bytes(&self) -> u64 {
        self.bulk_bytes.load(Ordering::Relaxed)
    }

    /// Consistent point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            resends: self.resends.load(Ordering::Relaxed),
            bulk_bytes: self.bulk_bytes.load(Ordering::Relaxed),
        }
    }

    /// Render the counters in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP talusfs_rpc_requests_sent_total Requests transmitted, including retransmits\n");
        output.push_str("# TYPE talusfs_rpc_requests_sent_total counter\n");
        output.push_str(&format!(
            "talusfs_rpc_requests_sent_total {}\n",
            snap.requests_sent
        ));

        output.push_str("# HELP talusfs_rpc_requests_completed_total Requests that reached completion\n");
        output.push_str("# TYPE talusfs_rpc_requests_completed_total counter\n");
        output.push_str(&format!(
            "talusfs_rpc_requests_completed_total {}\n",
            snap.requests_completed
        ));

        output.push_str("# HELP talusfs_rpc_requests_failed_total Completions with a negative status\n");
        output.push_str("# TYPE talusfs_rpc_requests_failed_total counter\n");
        output.push_str(&format!(
            "talusfs_rpc_requests_failed_total {}\n",
            snap.requests_failed
        ));

        output.push_str("# HELP talusfs_rpc_timeouts_total Requests expired past their retry budget\n");
        output.push_str("# TYPE talusfs_rpc_timeouts_total counter\n");
        output.push_str(&format!("talusfs_rpc_timeouts_total {}\n", snap.timeouts));

        output.push_str("# HELP talusfs_rpc_resends_total Retransmissions\n");
        output.push_str("# TYPE talusfs_rpc_resends_total counter\n");
        output.push_str(&format!("talusfs_rpc_resends_total {}\n", snap.resends));

        output.push_str("# HELP talusfs_rpc_bulk_bytes_total Bulk payload bytes moved\n");
        output.push_str("# TYPE talusfs_rpc_bulk_bytes_total counter\n");
        output.push_str(&format!("talusfs_rpc_bulk_bytes_total {}\n", snap.bulk_bytes));

        output
    }
}
