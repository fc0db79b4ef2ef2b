//! Stream statistics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use mirrorcast_ipc::StreamStats;

/// Collects and reports per-capture stream statistics.
///
/// Totals live in the components that produce them (decoder counters,
/// socket byte count); the collector derives rates between reports.
pub struct StatsCollector {
    start_time: RwLock<Option<Instant>>,
    last_report_time: RwLock<Instant>,
    last_frame_count: AtomicU64,
}

impl StatsCollector {
    /// Create a new collector.
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            last_report_time: RwLock::new(Instant::now()),
            last_frame_count: AtomicU64::new(0),
        }
    }

    /// Start the uptime clock.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
        *self.last_report_time.write() = Instant::now();
        self.last_frame_count.store(0, Ordering::Relaxed);
    }

    /// Stop the uptime clock.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    /// Build a snapshot from the current component totals.
    pub fn snapshot(
        &self,
        frames_decoded: u64,
        frames_dropped: u64,
        decode_errors: u64,
        bytes_received: u64,
    ) -> StreamStats {
        let now = Instant::now();

        let last_time = *self.last_report_time.read();
        let elapsed = now.duration_since(last_time);
        let last_frames = self.last_frame_count.load(Ordering::Relaxed);

        let fps = if elapsed.as_secs_f32() > 0.0 {
            frames_decoded.saturating_sub(last_frames) as f32 / elapsed.as_secs_f32()
        } else {
            0.0
        };

        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| now.duration_since(s).as_secs())
            .unwrap_or(0);

        StreamStats {
            fps,
            frames_decoded,
            frames_dropped,
            decode_errors,
            bytes_received,
            uptime_seconds,
        }
    }

    /// Mark a report as delivered, resetting the fps window.
    pub fn mark_reported(&self, frames_decoded: u64) {
        *self.last_report_time.write() = Instant::now();
        self.last_frame_count.store(frames_decoded, Ordering::Relaxed);
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
