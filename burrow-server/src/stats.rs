//! Process-wide server counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use burrow_proto::wire::ServerStatsSnapshot;

/// Counters shared by the accept loop and every dispatcher, read by the
/// periodic reporter and the stats snapshot.
pub struct ServerStats {
    total_connections:     AtomicU64,
    active_tunnels:        AtomicU64,
    total_bytes_forwarded: AtomicU64,
    started_at:            Instant,
}

impl ServerStats {
    pub(crate) fn new() -> Self {
        Self {
            total_connections:     AtomicU64::new(0),
            active_tunnels:        AtomicU64::new(0),
            total_bytes_forwarded: AtomicU64::new(0),
            started_at:            Instant::now(),
        }
    }

    pub(crate) fn connection_accepted(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_opened(&self) {
        self.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        self.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn add_forwarded(&self, bytes: u64) {
        self.total_bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Sessions currently authenticated.
    pub fn active_tunnels(&self) -> u64 {
        self.active_tunnels.load(Ordering::Relaxed)
    }

    /// Current snapshot for the stats reply and the reporter.
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            total_connections:     self.total_connections.load(Ordering::Relaxed),
            active_tunnels:        self.active_tunnels.load(Ordering::Relaxed),
            total_bytes_forwarded: self.total_bytes_forwarded.load(Ordering::Relaxed),
            uptime_seconds:        self.started_at.elapsed().as_secs_f64(),
        }
    }
}
