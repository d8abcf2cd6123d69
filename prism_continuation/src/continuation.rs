//! The continuation entity.

use prism_gc::StoredContinuation;

/// One suspended execution context.
///
/// Owns at most one stored continuation. A new capture replaces the previous
/// object, which the capture hands back to the allocator. The object is
/// kept reachable by the owner of the `Continuation`, not by the collector.
#[derive(Debug, Default)]
pub struct Continuation {
    stored: Option<StoredContinuation>,
    ip: usize,
}

impl Continuation {
    /// Create an empty continuation.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current stored continuation, if captured.
    #[inline]
    pub fn stored(&self) -> Option<StoredContinuation> {
        self.stored
    }

    /// Check if a stack has been captured.
    #[inline]
    pub fn is_captured(&self) -> bool {
        self.stored.is_some()
    }

    /// Resume address recorded by a foreign capture (0 if none).
    #[inline]
    pub fn ip(&self) -> usize {
        self.ip
    }

    /// Take ownership of the stored continuation, leaving the continuation
    /// empty.
    pub fn take_stored(&mut self) -> Option<StoredContinuation> {
        self.stored.take()
    }

    pub(crate) fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    pub(crate) fn replace_stored(
        &mut self,
        stored: StoredContinuation,
    ) -> Option<StoredContinuation> {
        self.stored.replace(stored)
    }
}
