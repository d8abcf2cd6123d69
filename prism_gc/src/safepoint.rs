//! Non-interruptible regions.
//!
//! A thread inside an [`Uninterruptible`] region must not be stopped by the
//! collector, and the collector must not inspect what that thread is writing.
//! Regions and collections exclude each other through one global
//! reader-writer lock:
//!
//! - a thread's outermost region holds the lock shared, so many threads may
//!   be inside regions at once;
//! - a collection holds it exclusively through a [`RegionBarrier`], so it
//!   starts only once every region has exited, and no region starts until it
//!   is done.
//!
//! The thread holding the barrier may still enter regions (a collection hook
//! that allocates does). Per thread, a nesting depth is also kept: the heap
//! refuses to allocate inside a region, since allocation may collect.
//!
//! Region bodies must be short and bounded: no allocation, no blocking, no
//! calls that may reach a collection.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared by regions, exclusive to collections.
static REGION_LOCK: RwLock<()> = parking_lot::const_rwlock(());

/// Number of threads currently inside at least one region.
static ACTIVE_THREADS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Nesting depth of uninterruptible regions on this thread.
    static DEPTH: Cell<u32> = const { Cell::new(0) };

    /// Shared hold on `REGION_LOCK` for this thread's outermost region.
    static REGION_HOLD: RefCell<Option<RwLockReadGuard<'static, ()>>> =
        const { RefCell::new(None) };

    /// Set while this thread holds the region barrier.
    static HOLDS_BARRIER: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard for a non-interruptible region.
///
/// Entering the outermost region blocks while a collection runs on another
/// thread. The guard is neither `Send` nor `Sync`: a region belongs to the
/// thread that entered it.
///
/// # Example
///
/// ```ignore
/// {
///     let _region = Uninterruptible::enter("copy stack frames");
///     // ... bounded body, no allocation ...
/// } // region exits here
/// ```
#[must_use = "the region ends when the guard is dropped"]
pub struct Uninterruptible {
    reason: &'static str,
    _not_send: PhantomData<*const ()>,
}

impl Uninterruptible {
    /// Enter a non-interruptible region on the current thread.
    pub fn enter(reason: &'static str) -> Self {
        if DEPTH.with(Cell::get) == 0 {
            if !HOLDS_BARRIER.with(Cell::get) {
                let hold = REGION_LOCK.read();
                REGION_HOLD.with(|h| *h.borrow_mut() = Some(hold));
            }
            ACTIVE_THREADS.fetch_add(1, Ordering::AcqRel);
        }
        DEPTH.with(|d| d.set(d.get() + 1));
        log::trace!("enter uninterruptible region: {reason}");
        Self {
            reason,
            _not_send: PhantomData,
        }
    }

    /// Why this region was entered.
    #[inline]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

impl Drop for Uninterruptible {
    fn drop(&mut self) {
        let depth = DEPTH.with(|d| {
            let depth = d.get() - 1;
            d.set(depth);
            depth
        });
        if depth == 0 {
            ACTIVE_THREADS.fetch_sub(1, Ordering::Release);
            let hold = REGION_HOLD.with(|h| h.borrow_mut().take());
            drop(hold);
        }
        log::trace!("exit uninterruptible region: {}", self.reason);
    }
}

/// Check if the current thread is inside a non-interruptible region.
#[inline]
pub fn is_uninterruptible() -> bool {
    DEPTH.with(|d| d.get() > 0)
}

/// Number of threads currently inside a non-interruptible region.
#[inline]
pub fn active_regions() -> usize {
    ACTIVE_THREADS.load(Ordering::Acquire)
}

/// Exclusive hold that keeps every other thread out of non-interruptible
/// regions. Released on drop.
#[must_use = "regions resume when the barrier is dropped"]
pub struct RegionBarrier {
    _hold: RwLockWriteGuard<'static, ()>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RegionBarrier {
    fn drop(&mut self) {
        HOLDS_BARRIER.with(|b| b.set(false));
    }
}

/// Wait until no thread is inside a non-interruptible region, then keep new
/// regions out until the returned barrier is dropped.
///
/// Called by the collector before it inspects objects. The calling thread
/// must itself be interruptible, or this would never return.
pub fn block_regions() -> RegionBarrier {
    crate::guarantee!(
        !is_uninterruptible(),
        "collector entered from inside an uninterruptible region"
    );
    crate::guarantee!(
        !HOLDS_BARRIER.with(Cell::get),
        "region barrier is already held by this thread"
    );

    let hold = REGION_LOCK.write();
    HOLDS_BARRIER.with(|b| b.set(true));
    RegionBarrier {
        _hold: hold,
        _not_send: PhantomData,
    }
}
