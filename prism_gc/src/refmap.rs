//! Reference maps: which frame slots hold heap references.
//!
//! A reference map is a 64-bit slot bitmap. Bit `b` set means the 8-byte word
//! at `frame_base + 8 * b` holds a heap reference. Maps for one code blob are
//! stored together in an immutable [`ReferenceMapEncoding`] and addressed by
//! index; the encoding itself is addressed by a [`ReferenceMapHandle`], which
//! is the stable address of the encoding's storage.
//!
//! # Example
//!
//! ```ignore
//! use prism_gc::{ReferenceMapEncoder, ReferenceMapRegistry};
//!
//! // While compiling, build the encoding for a code blob
//! let mut encoder = ReferenceMapEncoder::new();
//! let call_a = encoder.add(0b0011); // slots 0 and 1
//! let call_b = encoder.add(0b0011); // deduplicated, same index
//! let encoding = encoder.finish();
//!
//! // Register so the collector can decode handles
//! let registry = ReferenceMapRegistry::new();
//! let handle = registry.register(&encoding);
//!
//! // During GC, report live slots of a frame
//! registry.walk_offsets(frame_base, handle, call_a, &mut visitor);
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::guarantee;
use crate::trace::ReferenceVisitor;

/// Reference-map index meaning "this frame holds no references".
pub const NO_REFERENCE_MAP: i32 = -1;

/// Size of one frame slot in bytes.
pub const SLOT_SIZE: usize = 8;

/// Number of slots one bitmap can describe.
pub const MAX_SLOTS: usize = 64;

// =============================================================================
// ReferenceMapHandle
// =============================================================================

/// Opaque handle naming one reference-map encoding.
///
/// Stored as an 8-byte word in stored continuations. The null handle never
/// names a real encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ReferenceMapHandle(u64);

impl ReferenceMapHandle {
    /// The null handle.
    pub const NULL: ReferenceMapHandle = ReferenceMapHandle(0);

    /// Create a handle from its raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check for the null handle.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// ReferenceMapEncoding
// =============================================================================

/// Immutable table of slot bitmaps shared by all frames of a code blob.
///
/// Only ever created behind an `Arc`, so its address (the handle) is stable
/// for as long as any owner keeps it alive.
#[derive(Debug, PartialEq, Eq)]
pub struct ReferenceMapEncoding {
    bitmaps: Box<[u64]>,
}

impl ReferenceMapEncoding {
    /// Build an encoding directly from bitmaps, without deduplication.
    pub fn from_bitmaps(bitmaps: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            bitmaps: bitmaps.into_boxed_slice(),
        })
    }

    /// Handle naming this encoding.
    #[inline]
    pub fn handle(&self) -> ReferenceMapHandle {
        ReferenceMapHandle(self as *const Self as u64)
    }

    /// Number of reference maps in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    /// Check if the table is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Get the bitmap at `index`, if it exists.
    #[inline]
    pub fn bitmap(&self, index: i32) -> Option<u64> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.bitmaps.get(i).copied())
    }

    /// Iterate over the live slot numbers of the map at `index`.
    ///
    /// `NO_REFERENCE_MAP` and out-of-range indices yield nothing.
    #[inline]
    pub fn live_slots(&self, index: i32) -> LiveSlotIter {
        LiveSlotIter {
            bitmap: self.bitmap(index).unwrap_or(0),
        }
    }
}

/// Iterator over set bits in a slot bitmap, lowest slot first.
#[derive(Debug, Clone)]
pub struct LiveSlotIter {
    bitmap: u64,
}

impl Iterator for LiveSlotIter {
    type Item = u8;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.bitmap == 0 {
            return None;
        }
        let trailing = self.bitmap.trailing_zeros() as u8;
        self.bitmap &= self.bitmap - 1; // Clear lowest set bit
        Some(trailing)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = self.bitmap.count_ones() as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for LiveSlotIter {}

// =============================================================================
// ReferenceMapEncoder
// =============================================================================

/// Builder for reference-map encodings, deduplicating identical bitmaps.
#[derive(Debug, Default)]
pub struct ReferenceMapEncoder {
    bitmaps: Vec<u64>,
    dedup: FxHashMap<u64, i32>,
}

impl ReferenceMapEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bitmap and return its index.
    ///
    /// An empty bitmap needs no entry and returns `NO_REFERENCE_MAP`.
    pub fn add(&mut self, bitmap: u64) -> i32 {
        if bitmap == 0 {
            return NO_REFERENCE_MAP;
        }
        if let Some(&index) = self.dedup.get(&bitmap) {
            return index;
        }
        let index = self.bitmaps.len() as i32;
        self.bitmaps.push(bitmap);
        self.dedup.insert(bitmap, index);
        index
    }

    /// Number of distinct bitmaps added so far.
    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    /// Check if no bitmaps were added.
    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Build the final encoding.
    pub fn finish(self) -> Arc<ReferenceMapEncoding> {
        ReferenceMapEncoding::from_bitmaps(self.bitmaps)
    }
}

// =============================================================================
// ReferenceMapDecoder
// =============================================================================

/// Turns `(frame base, encoding, index)` into reference slots.
pub trait ReferenceMapDecoder {
    /// Report every reference slot of the frame at `base` to `visitor`.
    ///
    /// Returns `false` if the visitor asked to stop.
    fn walk_offsets(
        &self,
        base: usize,
        encoding: ReferenceMapHandle,
        index: i32,
        visitor: &mut dyn ReferenceVisitor,
    ) -> bool;
}

// =============================================================================
// ReferenceMapRegistry
// =============================================================================

/// Registry of live encodings, keyed by handle.
///
/// Registering an encoding keeps it alive, so a handle found in a stored
/// continuation stays decodable for as long as it is registered.
#[derive(Debug, Default)]
pub struct ReferenceMapRegistry {
    encodings: RwLock<FxHashMap<ReferenceMapHandle, Arc<ReferenceMapEncoding>>>,
}

impl ReferenceMapRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an encoding and return its handle.
    pub fn register(&self, encoding: &Arc<ReferenceMapEncoding>) -> ReferenceMapHandle {
        let handle = encoding.handle();
        self.encodings.write().insert(handle, Arc::clone(encoding));
        handle
    }

    /// Remove an encoding from the registry.
    pub fn unregister(&self, handle: ReferenceMapHandle) -> Option<Arc<ReferenceMapEncoding>> {
        self.encodings.write().remove(&handle)
    }

    /// Lookup an encoding by handle.
    pub fn get(&self, handle: ReferenceMapHandle) -> Option<Arc<ReferenceMapEncoding>> {
        self.encodings.read().get(&handle).cloned()
    }

    /// Get the number of registered encodings.
    pub fn len(&self) -> usize {
        self.encodings.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.encodings.read().is_empty()
    }
}

impl ReferenceMapDecoder for ReferenceMapRegistry {
    fn walk_offsets(
        &self,
        base: usize,
        encoding: ReferenceMapHandle,
        index: i32,
        visitor: &mut dyn ReferenceVisitor,
    ) -> bool {
        if index == NO_REFERENCE_MAP {
            return true;
        }

        // Clone out so the visitor runs without holding the lock.
        let Some(table) = self.get(encoding) else {
            guarantee::fail(format_args!(
                "reference map encoding {:#x} is not registered",
                encoding.raw()
            ))
        };
        guarantee!(
            index >= 0 && (index as usize) < table.len(),
            "reference map index {} out of range for encoding {:#x} ({} maps)",
            index,
            encoding.raw(),
            table.len()
        );

        for slot in table.live_slots(index) {
            if !visitor.visit_reference(base + slot as usize * SLOT_SIZE) {
                return false;
            }
        }
        true
    }
}
