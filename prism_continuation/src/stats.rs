//! Capture statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for continuation captures.
#[derive(Debug, Default)]
pub struct CaptureStats {
    /// Successful captures.
    pub captures: AtomicU64,
    /// Captures that yielded to a capture already in progress.
    pub yields: AtomicU64,
    /// Captures that failed to allocate.
    pub failures: AtomicU64,
    /// Frames stored by successful captures.
    pub frames_captured: AtomicU64,
    /// Raw frame bytes stored by successful captures.
    pub bytes_captured: AtomicU64,
    /// Previous stored continuations released by re-capture.
    pub objects_replaced: AtomicU64,
}

impl CaptureStats {
    /// Create new empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful capture.
    #[inline]
    pub fn record_capture(&self, frames: usize, bytes: usize) {
        self.captures.fetch_add(1, Ordering::Relaxed);
        self.frames_captured
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.bytes_captured
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a yield.
    #[inline]
    pub fn record_yield(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an allocation failure.
    #[inline]
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a previous stored continuation was released.
    #[inline]
    pub fn record_replacement(&self) {
        self.objects_replaced.fetch_add(1, Ordering::Relaxed);
    }

    /// Average frames per successful capture.
    pub fn avg_frames(&self) -> f64 {
        let captures = self.captures.load(Ordering::Relaxed);
        if captures == 0 {
            return 0.0;
        }
        self.frames_captured.load(Ordering::Relaxed) as f64 / captures as f64
    }

    /// Log a summary at info level.
    pub fn log_summary(&self) {
        log::info!(
            "capture: {} captured ({} frames, {} bytes, {:.1} frames avg), {} yielded, {} failed, {} replaced",
            self.captures.load(Ordering::Relaxed),
            self.frames_captured.load(Ordering::Relaxed),
            self.bytes_captured.load(Ordering::Relaxed),
            self.avg_frames(),
            self.yields.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.objects_replaced.load(Ordering::Relaxed),
        );
    }
}
