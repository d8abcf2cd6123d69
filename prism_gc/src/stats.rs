//! GC statistics and metrics.
//!
//! Tracks allocation volume, releases and collection times for monitoring
//! and tuning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics about heap and collection activity.
#[derive(Debug)]
pub struct GcStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Total bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,
    /// Total bytes released since start.
    pub bytes_released: AtomicU64,
    /// Total objects released since start.
    pub objects_released: AtomicU64,
    /// Failed allocations (heap limit reached).
    pub failed_allocations: AtomicU64,

    // =========================================================================
    // Collection Statistics
    // =========================================================================
    /// Number of collections run.
    pub collections: AtomicU64,
    /// Total time spent in collections (nanoseconds).
    pub collection_time_ns: AtomicU64,
}

impl GcStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            bytes_allocated: AtomicU64::new(0),
            objects_allocated: AtomicU64::new(0),
            bytes_released: AtomicU64::new(0),
            objects_released: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            collection_time_ns: AtomicU64::new(0),
        }
    }

    /// Record an allocation.
    #[inline]
    pub fn record_allocation(&self, size: usize) {
        self.bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a release.
    #[inline]
    pub fn record_release(&self, size: usize) {
        self.bytes_released
            .fetch_add(size as u64, Ordering::Relaxed);
        self.objects_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an allocation that failed.
    #[inline]
    pub fn record_failed_allocation(&self) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a collection.
    pub fn record_collection(&self, duration: Duration) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.collection_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Bytes allocated and not yet released.
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.bytes_released.load(Ordering::Relaxed))
    }

    /// Objects allocated and not yet released.
    pub fn live_objects(&self) -> u64 {
        self.objects_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.objects_released.load(Ordering::Relaxed))
    }

    /// Get total collection time.
    pub fn total_gc_time(&self) -> Duration {
        Duration::from_nanos(self.collection_time_ns.load(Ordering::Relaxed))
    }

    /// Get average collection pause time.
    pub fn avg_pause(&self) -> Duration {
        let count = self.collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.collection_time_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / count)
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.bytes_released.store(0, Ordering::Relaxed);
        self.objects_released.store(0, Ordering::Relaxed);
        self.failed_allocations.store(0, Ordering::Relaxed);
        self.collections.store(0, Ordering::Relaxed);
        self.collection_time_ns.store(0, Ordering::Relaxed);
    }

    /// Log a summary of GC statistics at info level.
    pub fn log_summary(&self) {
        log::info!(
            "gc: allocated {} objects ({}), released {} objects ({}), {} failed",
            self.objects_allocated.load(Ordering::Relaxed),
            format_bytes(self.bytes_allocated.load(Ordering::Relaxed)),
            self.objects_released.load(Ordering::Relaxed),
            format_bytes(self.bytes_released.load(Ordering::Relaxed)),
            self.failed_allocations.load(Ordering::Relaxed),
        );
        log::info!(
            "gc: live {} objects ({}), {} collections, {:?} total ({:?} avg)",
            self.live_objects(),
            format_bytes(self.live_bytes()),
            self.collections.load(Ordering::Relaxed),
            self.total_gc_time(),
            self.avg_pause(),
        );
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes in human-readable form.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Timer for measuring GC phases.
pub struct GcTimer {
    start: Instant,
    label: &'static str,
}

impl GcTimer {
    /// Start a new timer with the given label.
    pub fn start(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    /// Stop the timer and return the elapsed duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        log::trace!("gc {}: {:?}", self.label, elapsed);
        elapsed
    }
}
