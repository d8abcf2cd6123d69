//! Reference visitation for garbage collection.
//!
//! The collector discovers embedded references by handing a
//! [`ReferenceVisitor`] to whatever knows an object's layout. For stored
//! continuations that is the reference-map decoder, driven by
//! `walk_stored_continuation`.

/// Receives the address of every slot that holds a heap reference.
///
/// The slot address points into the scanned object; the visitor may read or
/// update the word stored there. Returning `false` stops the traversal.
///
/// # Example
///
/// ```ignore
/// use prism_gc::ReferenceVisitor;
///
/// let mut slots = Vec::new();
/// let mut visitor = |slot: usize| {
///     slots.push(slot);
///     true
/// };
/// walk_stored_continuation(stored, &registry, &mut visitor);
/// ```
pub trait ReferenceVisitor {
    /// Visit one reference slot. Return `false` to stop.
    fn visit_reference(&mut self, slot: usize) -> bool;
}

impl<F> ReferenceVisitor for F
where
    F: FnMut(usize) -> bool,
{
    #[inline]
    fn visit_reference(&mut self, slot: usize) -> bool {
        self(slot)
    }
}

/// Visitor that counts slots, optionally stopping after a fixed number.
#[derive(Debug, Default, Clone)]
pub struct CountingVisitor {
    /// Slots visited so far.
    pub count: usize,
    /// Stop once this many slots have been visited.
    pub stop_after: Option<usize>,
}

impl CountingVisitor {
    /// Create a visitor that never stops early.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a visitor that stops after `limit` slots.
    pub fn stopping_after(limit: usize) -> Self {
        Self {
            count: 0,
            stop_after: Some(limit),
        }
    }
}

impl ReferenceVisitor for CountingVisitor {
    fn visit_reference(&mut self, _slot: usize) -> bool {
        self.count += 1;
        match self.stop_after {
            Some(limit) => self.count < limit,
            None => true,
        }
    }
}
