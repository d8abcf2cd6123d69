//! GC configuration parameters.
//!
//! All sizes and thresholds are tunable for different workloads.
//! Default values suit a runtime that captures continuations regularly.

use thiserror::Error;

/// Configuration for the continuation heap.
///
/// # Example
///
/// ```ignore
/// use prism_gc::GcConfig;
///
/// // Bounded heap that collects every 64KB of allocation
/// let config = GcConfig {
///     max_heap_size: 8 * 1024 * 1024,
///     collection_trigger: 64 * 1024,
///     ..Default::default()
/// };
/// config.validate()?;
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    // =========================================================================
    // Heap Limits
    // =========================================================================
    /// Maximum number of live bytes in the heap.
    ///
    /// Allocations that would exceed this limit fail with
    /// `AllocError::OutOfMemory`. Set to 0 for unlimited.
    ///
    /// Default: 0 (unlimited)
    pub max_heap_size: usize,

    /// Object alignment in bytes.
    ///
    /// Must be a power of two of at least 8 so that the hub word and the
    /// shared reference-map handle of a stored continuation are naturally
    /// aligned.
    ///
    /// Default: 8
    pub object_alignment: usize,

    // =========================================================================
    // Collection Triggers
    // =========================================================================
    /// Bytes allocated before an allocation triggers a collection.
    ///
    /// The collection runs on the allocating thread right after the
    /// allocation that crossed the threshold. Set to 0 to disable
    /// allocation-triggered collections.
    ///
    /// Default: 4MB
    pub collection_trigger: usize,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Log every allocation and release at trace level.
    ///
    /// Default: false
    pub trace_allocations: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_heap_size: 0,
            object_alignment: 8,
            collection_trigger: 4 * 1024 * 1024, // 4MB
            trace_allocations: false,
        }
    }
}

impl GcConfig {
    /// Create a configuration that collects after every allocation.
    ///
    /// Useful for shaking out ordering bugs: every allocation is followed by
    /// a collection that may observe freshly allocated objects.
    pub fn for_testing() -> Self {
        Self {
            collection_trigger: 1,
            trace_allocations: true,
            ..Default::default()
        }
    }

    /// Create a configuration optimized for low memory usage.
    pub fn low_memory() -> Self {
        Self {
            max_heap_size: 16 * 1024 * 1024, // 16MB
            collection_trigger: 256 * 1024,  // 256KB
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.object_alignment < 8 || !self.object_alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(self.object_alignment));
        }
        if self.max_heap_size != 0 && self.max_heap_size < MIN_HEAP_SIZE {
            return Err(ConfigError::HeapTooSmall(self.max_heap_size));
        }
        if self.max_heap_size != 0 && self.collection_trigger > self.max_heap_size {
            return Err(ConfigError::TriggerExceedsHeap {
                trigger: self.collection_trigger,
                max: self.max_heap_size,
            });
        }
        Ok(())
    }
}

/// Smallest bounded heap accepted by [`GcConfig::validate`].
pub const MIN_HEAP_SIZE: usize = 4096;

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Alignment must be a power of two, minimum 8.
    #[error("object alignment must be a power of two, minimum 8 (got {0})")]
    InvalidAlignment(usize),
    /// A bounded heap must be at least `MIN_HEAP_SIZE` bytes.
    #[error("max heap size must be 0 (unlimited) or at least 4KB (got {0})")]
    HeapTooSmall(usize),
    /// The collection trigger can never be reached in a bounded heap.
    #[error("collection trigger {trigger} exceeds max heap size {max}")]
    TriggerExceedsHeap {
        /// Configured trigger.
        trigger: usize,
        /// Configured heap limit.
        max: usize,
    },
}
