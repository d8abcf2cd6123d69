//! Heap memory management.
//!
//! A single non-moving object space with allocation-triggered collections.
//! The heap does not decide reachability itself: a collection runs the
//! registered [`CollectionHook`], which scans objects (for example with
//! `walk_stored_continuation`) and releases what it finds unreachable.

mod object_space;

pub use object_space::ObjectSpace;

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

use crate::alloc::{HUB_SIZE, ObjectHub, ObjectRef};
use crate::config::{ConfigError, GcConfig};
use crate::guarantee;
use crate::safepoint;
use crate::stats::{GcStats, GcTimer};

/// Allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The request would exceed the configured heap limit.
    #[error("out of memory: requested {requested} bytes with heap limit {limit}")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
        /// Configured heap limit in bytes.
        limit: usize,
    },
    /// The system allocator refused the request.
    #[error("system allocator failed to provide {size} bytes")]
    Exhausted {
        /// Requested size in bytes.
        size: usize,
    },
    /// The request is too small to hold an object hub.
    #[error("invalid object size {size}")]
    InvalidSize {
        /// Requested size in bytes.
        size: usize,
    },
}

/// Source of zero-initialized, collector-tracked objects.
///
/// Allocation may run a collection before it returns, so it must be called
/// from interruptible code only.
pub trait Allocator {
    /// Allocate a zeroed object of `size` bytes, claim it for `hub` and run
    /// `init` on it before any collector can see it.
    ///
    /// `init` runs inside a non-interruptible region: it must not allocate.
    fn allocate_with(
        &self,
        hub: ObjectHub,
        size: usize,
        init: &dyn Fn(ObjectRef),
    ) -> Result<ObjectRef, AllocError>;

    /// Allocate a zeroed object of `size` bytes and claim it for `hub`.
    fn allocate_zeroed(&self, hub: ObjectHub, size: usize) -> Result<ObjectRef, AllocError> {
        self.allocate_with(hub, size, &|_| {})
    }

    /// Return an unreachable object to the allocator.
    fn release(&self, object: ObjectRef);
}

/// Collector callback invoked by [`GcHeap::collect`].
pub trait CollectionHook: Send + Sync {
    /// Run one collection over `heap`.
    fn collect(&self, heap: &GcHeap);
}

impl<F> CollectionHook for F
where
    F: Fn(&GcHeap) + Send + Sync,
{
    fn collect(&self, heap: &GcHeap) {
        self(heap)
    }
}

thread_local! {
    /// Set while this thread runs a collection.
    static COLLECTING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as collecting until dropped.
struct CollectingScope {
    _not_send: PhantomData<*const ()>,
}

impl CollectingScope {
    fn enter() -> Option<Self> {
        if COLLECTING.with(|c| c.replace(true)) {
            return None;
        }
        Some(Self {
            _not_send: PhantomData,
        })
    }
}

impl Drop for CollectingScope {
    fn drop(&mut self) {
        COLLECTING.with(|c| c.set(false));
    }
}

/// Main heap structure.
pub struct GcHeap {
    /// Configuration parameters.
    config: GcConfig,

    /// Object storage.
    space: ObjectSpace,

    /// GC statistics.
    stats: GcStats,

    /// Total bytes allocated since last GC.
    bytes_since_gc: AtomicUsize,

    /// Collector run on each collection.
    hook: RwLock<Option<Arc<dyn CollectionHook>>>,
}

impl GcHeap {
    /// Create a new heap with the given configuration.
    pub fn new(config: GcConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            space: ObjectSpace::new(config.object_alignment),
            config,
            stats: GcStats::new(),
            bytes_since_gc: AtomicUsize::new(0),
            hook: RwLock::new(None),
        })
    }

    /// Create a heap with default configuration.
    pub fn with_defaults() -> Self {
        let config = GcConfig::default();
        Self {
            space: ObjectSpace::new(config.object_alignment),
            config,
            stats: GcStats::new(),
            bytes_since_gc: AtomicUsize::new(0),
            hook: RwLock::new(None),
        }
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Install the collector run on every collection.
    pub fn set_collection_hook<H>(&self, hook: H)
    where
        H: CollectionHook + 'static,
    {
        *self.hook.write() = Some(Arc::new(hook));
    }

    /// Remove the collection hook.
    pub fn clear_collection_hook(&self) {
        *self.hook.write() = None;
    }

    /// Check if the allocation trigger has been reached.
    pub fn should_collect(&self) -> bool {
        let trigger = self.config.collection_trigger;
        trigger != 0 && self.bytes_since_gc.load(Ordering::Relaxed) >= trigger
    }

    /// Run a collection.
    ///
    /// Waits for every thread to leave its non-interruptible region and keeps
    /// new regions out while the collection hook runs. A hook that allocates
    /// does not start a nested collection.
    pub fn collect(&self) {
        guarantee!(
            !safepoint::is_uninterruptible(),
            "collection requested inside an uninterruptible region"
        );
        let Some(_collecting) = CollectingScope::enter() else {
            return;
        };

        let barrier = safepoint::block_regions();

        let timer = GcTimer::start("collection");
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook.collect(self);
        }
        let elapsed = timer.stop();
        drop(barrier);

        self.stats.record_collection(elapsed);
        self.bytes_since_gc.store(0, Ordering::Relaxed);

        log::debug!(
            "gc: collection finished in {:?}, {} objects live ({} bytes)",
            elapsed,
            self.space.count(),
            self.space.usage()
        );
    }

    // =========================================================================
    // Space Queries
    // =========================================================================

    /// Snapshot of all live objects.
    pub fn objects(&self) -> Vec<ObjectRef> {
        self.space
            .objects()
            .into_iter()
            // SAFETY: every tracked allocation starts with its hub word.
            .map(|(ptr, _)| unsafe { ObjectRef::from_non_null(ptr) })
            .collect()
    }

    /// Check if an object belongs to this heap.
    pub fn contains(&self, object: ObjectRef) -> bool {
        self.space.contains(object.addr())
    }

    /// Get the allocated size of an object.
    pub fn size_of(&self, object: ObjectRef) -> Option<usize> {
        self.space.size_of(object.addr())
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.space.count()
    }

    /// Bytes currently allocated.
    pub fn usage(&self) -> usize {
        self.space.usage()
    }

    /// Get GC statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Get configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }
}

impl Allocator for GcHeap {
    fn allocate_with(
        &self,
        hub: ObjectHub,
        size: usize,
        init: &dyn Fn(ObjectRef),
    ) -> Result<ObjectRef, AllocError> {
        guarantee!(
            !safepoint::is_uninterruptible(),
            "allocation of {} bytes inside an uninterruptible region",
            size
        );
        if size < HUB_SIZE {
            return Err(AllocError::InvalidSize { size });
        }

        let aligned_size = align_up(size, self.config.object_alignment);
        let limit = self.config.max_heap_size;
        if limit != 0 && self.space.usage() + aligned_size > limit {
            self.stats.record_failed_allocation();
            log::debug!("gc: allocation of {aligned_size} bytes exceeds heap limit {limit}");
            return Err(AllocError::OutOfMemory {
                requested: aligned_size,
                limit,
            });
        }

        // No collection may observe the object between tracking and init.
        let object = {
            let _region = safepoint::Uninterruptible::enter("initialize object");
            let Some(ptr) = self.space.alloc_zeroed(aligned_size) else {
                self.stats.record_failed_allocation();
                return Err(AllocError::Exhausted { size: aligned_size });
            };
            // SAFETY: fresh, zeroed, aligned allocation of at least HUB_SIZE bytes.
            let object = unsafe { ObjectRef::from_non_null(ptr) };
            // SAFETY: nobody else can see the object yet.
            unsafe { object.set_hub(hub) };
            init(object);
            object
        };

        self.stats.record_allocation(aligned_size);
        self.bytes_since_gc
            .fetch_add(aligned_size, Ordering::Relaxed);
        if self.config.trace_allocations {
            log::trace!("gc: allocated {aligned_size} bytes at {object:?} (hub {:#x})", hub.raw());
        }

        // The new object is already tracked: a collection here sees it.
        if self.should_collect() {
            self.collect();
        }

        Ok(object)
    }

    fn release(&self, object: ObjectRef) {
        match self.space.free(object.addr()) {
            Some(size) => {
                self.stats.record_release(size);
                if self.config.trace_allocations {
                    log::trace!("gc: released {size} bytes at {object:?}");
                }
            }
            None => log::warn!("gc: release of untracked object {object:?}"),
        }
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Align a size up to the given alignment.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn no_auto_collect() -> GcConfig {
        GcConfig {
            collection_trigger: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(17, 16), 32);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GcConfig {
            object_alignment: 3,
            ..Default::default()
        };
        assert!(matches!(
            GcHeap::new(config),
            Err(ConfigError::InvalidAlignment(3))
        ));
    }

    #[test]
    fn test_allocate_zeroed_writes_hub() {
        let heap = GcHeap::new(no_auto_collect()).unwrap();
        let object = heap
            .allocate_zeroed(ObjectHub::STORED_CONTINUATION, 30)
            .unwrap();

        assert_eq!(object.hub(), ObjectHub::STORED_CONTINUATION);
        assert_eq!(heap.size_of(object), Some(32));
        assert!(heap.contains(object));
        assert_eq!(heap.object_count(), 1);

        let body = unsafe { std::slice::from_raw_parts(object.as_ptr().add(HUB_SIZE), 24) };
        assert!(body.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocate_too_small() {
        let heap = GcHeap::new(no_auto_collect()).unwrap();
        assert_eq!(
            heap.allocate_zeroed(ObjectHub::STORED_CONTINUATION, 4),
            Err(AllocError::InvalidSize { size: 4 })
        );
    }

    #[test]
    fn test_heap_limit() {
        let config = GcConfig {
            max_heap_size: 4096,
            collection_trigger: 0,
            ..Default::default()
        };
        let heap = GcHeap::new(config).unwrap();

        heap.allocate_zeroed(ObjectHub::STORED_CONTINUATION, 4000)
            .unwrap();
        let err = heap
            .allocate_zeroed(ObjectHub::STORED_CONTINUATION, 200)
            .unwrap_err();

        assert_eq!(
            err,
            AllocError::OutOfMemory {
                requested: 200,
                limit: 4096
            }
        );
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.stats().failed_allocations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_release() {
        let heap = GcHeap::new(no_auto_collect()).unwrap();
        let object = heap
            .allocate_zeroed(ObjectHub::STORED_CONTINUATION, 64)
            .unwrap();

        heap.release(object);
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.usage(), 0);
        assert_eq!(heap.stats().live_objects(), 0);
    }

    #[test]
    fn test_allocation_triggers_collection() {
        let config = GcConfig {
            collection_trigger: 128,
            ..Default::default()
        };
        let heap = GcHeap::new(config).unwrap();
        let runs = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&runs);
        heap.set_collection_hook(move |heap: &GcHeap| {
            seen.fetch_add(1, Ordering::Relaxed);
            assert!(heap.object_count() > 0);
        });

        heap.allocate_zeroed(ObjectHub::STORED_CONTINUATION, 64)
            .unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 0);
        assert!(!heap.should_collect());

        heap.allocate_zeroed(ObjectHub::STORED_CONTINUATION, 64)
            .unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(heap.stats().collections.load(Ordering::Relaxed), 1);
        assert!(!heap.should_collect());
    }

    #[test]
    fn test_hook_may_release_objects() {
        let heap = GcHeap::new(GcConfig::for_testing()).unwrap();
        heap.set_collection_hook(|heap: &GcHeap| {
            for object in heap.objects() {
                heap.release(object);
            }
        });

        let object = heap
            .allocate_zeroed(ObjectHub::from_raw(7), 16)
            .unwrap();
        assert!(!heap.contains(object));
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_hook_allocation_does_not_recurse() {
        let heap = GcHeap::new(GcConfig::for_testing()).unwrap();
        heap.set_collection_hook(|heap: &GcHeap| {
            heap.allocate_zeroed(ObjectHub::from_raw(1), 8).unwrap();
        });

        heap.allocate_zeroed(ObjectHub::from_raw(1), 8).unwrap();
        assert_eq!(heap.stats().collections.load(Ordering::Relaxed), 1);
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_allocate_with_initializes_before_collection() {
        let heap = GcHeap::new(GcConfig::for_testing()).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            heap.set_collection_hook(move |heap: &GcHeap| {
                for object in heap.objects() {
                    // SAFETY: every test object is at least 16 bytes.
                    let word = unsafe { object.as_ptr().add(HUB_SIZE).cast::<u64>().read() };
                    seen.lock().push(word);
                }
            });
        }

        let object = heap
            .allocate_with(ObjectHub::from_raw(3), 32, &|object| {
                assert!(safepoint::is_uninterruptible());
                // SAFETY: the object is 32 bytes and not yet shared.
                unsafe { object.as_ptr().add(HUB_SIZE).cast::<u64>().write(0xFEED) };
            })
            .unwrap();

        assert_eq!(*seen.lock(), vec![0xFEED]);
        assert_eq!(object.hub(), ObjectHub::from_raw(3));
        assert!(!safepoint::is_uninterruptible());
    }

    #[test]
    fn test_regions_wait_for_collection() {
        use std::sync::Barrier;
        use std::sync::atomic::AtomicBool;

        let heap = GcHeap::new(no_auto_collect()).unwrap();
        let in_hook = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        {
            let in_hook = Arc::clone(&in_hook);
            let resume = Arc::clone(&resume);
            heap.set_collection_hook(move |_heap: &GcHeap| {
                in_hook.wait();
                resume.wait();
            });
        }
        let entered = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| heap.collect());
            in_hook.wait();

            let mutator = scope.spawn(|| {
                let _region = safepoint::Uninterruptible::enter("publish");
                entered.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!entered.load(Ordering::SeqCst));

            resume.wait();
            mutator.join().unwrap();
        });

        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(heap.stats().collections.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panicking_hook_does_not_disable_collection() {
        let heap = GcHeap::new(no_auto_collect()).unwrap();
        let runs = Arc::new(AtomicU64::new(0));
        {
            let runs = Arc::clone(&runs);
            heap.set_collection_hook(move |_heap: &GcHeap| {
                if runs.fetch_add(1, Ordering::Relaxed) == 0 {
                    panic!("collector bug");
                }
            });
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| heap.collect()));
        assert!(result.is_err());

        heap.collect();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        assert_eq!(heap.stats().collections.load(Ordering::Relaxed), 1);

        // Regions are usable again once the failed collection unwound.
        let _region = safepoint::Uninterruptible::enter("after panic");
    }

    #[test]
    #[should_panic(expected = "inside an uninterruptible region")]
    fn test_allocate_inside_region_is_fatal() {
        let heap = GcHeap::with_defaults();
        let _region = safepoint::Uninterruptible::enter("test");
        let _ = heap.allocate_zeroed(ObjectHub::from_raw(1), 16);
    }
}
