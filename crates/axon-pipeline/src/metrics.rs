//! Atomic pipeline counters and the shutdown consistency check.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

/// Lock-free counters updated from the caller's thread (`send_stream`) and
/// the encoder dispatch thread (delivered chunks).
#[derive(Debug)]
pub struct PipelineMetrics {
    packets_in: AtomicU64,
    chunks_out: AtomicU64,
    bytes_out: AtomicU64,
    pts_regressions: AtomicU64,
    last_pts: AtomicI64,
}

impl PipelineMetrics {
    /// Allocate a fresh [`PipelineMetrics`] with all counters zeroed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            packets_in: AtomicU64::new(0),
            chunks_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            pts_regressions: AtomicU64::new(0),
            last_pts: AtomicI64::new(i64::MIN),
        })
    }

    pub(crate) fn note_packet(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_chunk(&self, pts: i64, bytes: usize) {
        self.chunks_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        let prev = self.last_pts.swap(pts, Ordering::AcqRel);
        if pts < prev {
            self.pts_regressions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Ordering invariants that must hold at shutdown: no chunk without a
    /// packet, presentation timestamps non-decreasing.
    pub fn validate(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.chunks_out <= snapshot.packets_in && snapshot.pts_regressions == 0
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_in: self.packets_in.load(Ordering::Acquire),
            chunks_out: self.chunks_out.load(Ordering::Acquire),
            bytes_out: self.bytes_out.load(Ordering::Acquire),
            pts_regressions: self.pts_regressions.load(Ordering::Acquire),
        }
    }

    /// Log the counters.
    pub fn report(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_in = snapshot.packets_in,
            chunks_out = snapshot.chunks_out,
            bytes_out = snapshot.bytes_out,
            pts_regressions = snapshot.pts_regressions,
            "pipeline totals"
        );
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub packets_in: u64,
    pub chunks_out: u64,
    pub bytes_out: u64,
    pub pts_regressions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regressing_pts_fails_validation() {
        let metrics = PipelineMetrics::new();
        metrics.note_packet();
        metrics.note_packet();
        metrics.note_chunk(100, 10);
        metrics.note_chunk(50, 10);
        assert!(!metrics.validate());
        assert_eq!(metrics.snapshot().pts_regressions, 1);
    }

    #[test]
    fn monotonic_flow_validates() {
        let metrics = PipelineMetrics::new();
        for pts in [0_i64, 33, 66, 66, 100] {
            metrics.note_packet();
            metrics.note_chunk(pts, 8);
        }
        assert!(metrics.validate());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_in, 5);
        assert_eq!(snapshot.chunks_out, 5);
        assert_eq!(snapshot.bytes_out, 40);
    }
}
