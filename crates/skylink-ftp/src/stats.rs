//! Link statistics for the transfer client

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated from the inbound path and the operation driver
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Operations started
    pub operations_started: AtomicU64,
    /// Operations that ended in Success
    pub operations_completed: AtomicU64,
    /// Operations that ended in any other terminal result
    pub operations_failed: AtomicU64,
    /// Requests resent after a timeout
    pub retransmissions: AtomicU64,
    /// Frames discarded as stale or duplicate
    pub stale_frames: AtomicU64,
    /// Frames that failed to decode
    pub decode_errors: AtomicU64,
    /// Frames handed to the transport
    pub frames_sent: AtomicU64,
    /// Frames received and decoded
    pub frames_received: AtomicU64,
    /// File bytes uploaded
    pub bytes_sent: AtomicU64,
    /// File bytes downloaded
    pub bytes_received: AtomicU64,
}

impl ClientStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get snapshot for reporting
    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            operations_started: self.operations_started.load(Ordering::Relaxed),
            operations_completed: self.operations_completed.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            stale_frames: self.stale_frames.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of client stats
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub operations_started: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub retransmissions: u64,
    pub stale_frames: u64,
    pub decode_errors: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ClientStatsSnapshot {
    /// Share of sent frames that were retransmissions
    pub fn retransmit_percent(&self) -> f64 {
        if self.frames_sent == 0 {
            0.0
        } else {
            (self.retransmissions as f64 / self.frames_sent as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = ClientStats::default();
        ClientStats::add(&stats.frames_sent, 10);
        ClientStats::add(&stats.retransmissions, 2);
        ClientStats::add(&stats.stale_frames, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 10);
        assert_eq!(snap.retransmissions, 2);
        assert_eq!(snap.stale_frames, 1);
        assert_eq!(snap.retransmit_percent(), 20.0);
        assert_eq!(ClientStatsSnapshot::default().retransmit_percent(), 0.0);
    }
}
