//! Object space backed by the system allocator.
//!
//! Every object is a separate zeroed allocation tracked in a map from address
//! to size. Objects never move, so raw slot addresses handed to reference
//! visitors stay valid until the object is released.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Metadata for one tracked allocation.
struct Allocation {
    /// Pointer to the allocated memory.
    ptr: NonNull<u8>,
    /// Size of the allocation.
    size: usize,
}

// Safety: the allocation is owned by the space and only freed under its lock.
unsafe impl Send for Allocation {}

/// Tracked, non-moving object storage.
pub struct ObjectSpace {
    /// Map from address to allocation metadata.
    objects: Mutex<FxHashMap<usize, Allocation>>,
    /// Total bytes allocated.
    allocated: AtomicUsize,
    /// Alignment of every allocation.
    alignment: usize,
}

impl ObjectSpace {
    /// Create a new object space with the given alignment.
    pub fn new(alignment: usize) -> Self {
        Self {
            objects: Mutex::new(FxHashMap::default()),
            allocated: AtomicUsize::new(0),
            alignment,
        }
    }

    /// Allocate `size` zeroed bytes.
    pub fn alloc_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, self.alignment).ok()?;
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;

        self.objects
            .lock()
            .insert(ptr.as_ptr() as usize, Allocation { ptr, size });
        self.allocated.fetch_add(size, Ordering::Relaxed);

        Some(ptr)
    }

    /// Free an object, returning its size if it was tracked here.
    pub fn free(&self, addr: usize) -> Option<usize> {
        let allocation = self.objects.lock().remove(&addr)?;
        let size = allocation.size;
        self.allocated.fetch_sub(size, Ordering::Relaxed);
        self.dealloc(allocation);
        Some(size)
    }

    /// Check if an address is the start of an object in this space.
    pub fn contains(&self, addr: usize) -> bool {
        self.objects.lock().contains_key(&addr)
    }

    /// Get the size of an object.
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.objects.lock().get(&addr).map(|obj| obj.size)
    }

    /// Get total bytes allocated.
    pub fn usage(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get number of objects.
    pub fn count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Snapshot of all objects as `(address, size)` pairs.
    ///
    /// Taken under the lock and returned by value, so callers may allocate or
    /// free while iterating.
    pub fn objects(&self) -> Vec<(NonNull<u8>, usize)> {
        self.objects
            .lock()
            .values()
            .map(|obj| (obj.ptr, obj.size))
            .collect()
    }

    fn dealloc(&self, allocation: Allocation) {
        if let Ok(layout) = Layout::from_size_align(allocation.size, self.alignment) {
            // SAFETY: the pointer was allocated with this exact layout.
            unsafe { std::alloc::dealloc(allocation.ptr.as_ptr(), layout) };
        }
    }
}

impl Drop for ObjectSpace {
    fn drop(&mut self) {
        // Free all remaining objects
        let objects = std::mem::take(self.objects.get_mut());
        for (_, obj) in objects {
            self.dealloc(obj);
        }
    }
}
