//! Mutator threads and their registered stacks.
//!
//! A [`MutatorThread`] describes the stack region a walker may read. A thread
//! that parks itself at a safepoint records its stack pointer as the
//! suspension anchor, which is where a foreign walk of that thread starts.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Identifier of a registered mutator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

/// Address range of a thread's stack.
///
/// Stacks grow downwards: `limit` is the lowest usable address and `base`
/// the address just past the outermost frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest address of the stack.
    pub limit: usize,
    /// One past the highest address of the stack.
    pub base: usize,
}

impl StackBounds {
    /// Check if `[addr, addr + len)` lies within the stack.
    #[inline]
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        addr >= self.limit && addr.checked_add(len).is_some_and(|end| end <= self.base)
    }
}

/// A registered mutator thread.
#[derive(Debug)]
pub struct MutatorThread {
    /// Thread ID.
    pub id: ThreadId,
    /// Stack region.
    pub bounds: StackBounds,
    /// Stack pointer at which the thread parked, 0 while running.
    anchor: AtomicUsize,
}

impl MutatorThread {
    fn new(id: ThreadId, bounds: StackBounds) -> Self {
        Self {
            id,
            bounds,
            anchor: AtomicUsize::new(0),
        }
    }

    /// Record that the thread parked with its leaf frame at `sp`.
    #[inline]
    pub fn park_at(&self, sp: usize) {
        self.anchor.store(sp, Ordering::Release);
    }

    /// Record that the thread is running again.
    #[inline]
    pub fn unpark(&self) {
        self.anchor.store(0, Ordering::Release);
    }

    /// Suspension anchor, if the thread is parked.
    #[inline]
    pub fn anchor(&self) -> Option<usize> {
        match self.anchor.load(Ordering::Acquire) {
            0 => None,
            sp => Some(sp),
        }
    }
}

/// Registry of mutator threads.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: RwLock<FxHashMap<ThreadId, Arc<MutatorThread>>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread with the given stack.
    ///
    /// # Safety
    ///
    /// `bounds` must describe memory that stays readable until the thread
    /// is unregistered.
    pub unsafe fn register(&self, bounds: StackBounds) -> Arc<MutatorThread> {
        let id = ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let thread = Arc::new(MutatorThread::new(id, bounds));
        self.threads.write().insert(id, Arc::clone(&thread));
        log::debug!(
            "registered thread {} with stack {:#x}..{:#x}",
            id.0,
            bounds.limit,
            bounds.base
        );
        thread
    }

    /// Unregister a thread.
    pub fn unregister(&self, id: ThreadId) -> Option<Arc<MutatorThread>> {
        self.threads.write().remove(&id)
    }

    /// Lookup a thread by id.
    pub fn get(&self, id: ThreadId) -> Option<Arc<MutatorThread>> {
        self.threads.read().get(&id).cloned()
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// Check if no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }
}

thread_local! {
    /// Mutator thread attached to this OS thread.
    static CURRENT: RefCell<Option<Arc<MutatorThread>>> = const { RefCell::new(None) };
}

/// RAII guard for [`attach_current`]. Restores the previous attachment on
/// drop.
#[must_use = "the thread is detached when the guard is dropped"]
pub struct AttachedThread {
    previous: Option<Arc<MutatorThread>>,
}

impl Drop for AttachedThread {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

/// Attach a mutator thread to the calling OS thread.
pub fn attach_current(thread: Arc<MutatorThread>) -> AttachedThread {
    let previous = CURRENT.with(|c| c.borrow_mut().replace(thread));
    AttachedThread { previous }
}

/// The mutator thread attached to the calling OS thread.
pub fn current_thread() -> Option<Arc<MutatorThread>> {
    CURRENT.with(|c| c.borrow().clone())
}
