//! Prism Garbage Collector: continuation support
//!
//! Collector-side infrastructure for stored continuations: heap objects that
//! hold a copy of a captured call stack and describe their own embedded
//! pointers to the collector.
//!
//! # Architecture
//!
//! - **Heap**: a zero-initializing object space with allocation-triggered
//!   collections. Implements the [`Allocator`] seam used by capture.
//!
//! - **Reference maps**: immutable bitmap tables describing which stack slots
//!   hold heap references at a given call site. Decoded through the
//!   [`ReferenceMapDecoder`] seam.
//!
//! - **Stored continuations**: the variable-length object layout, its read
//!   accessors, the capture-only writer, and the scanner the collector uses to
//!   find embedded references.
//!
//! - **Safepoints**: the non-interruptible region that makes the final stack
//!   copy and frame-count publication atomic with respect to the collector.
//!
//! # Usage
//!
//! ```ignore
//! use prism_gc::{GcHeap, GcConfig, ReferenceMapRegistry, StoredContinuation};
//! use prism_gc::continuation::walk_stored_continuation;
//!
//! let heap = GcHeap::new(GcConfig::default())?;
//! let registry = ReferenceMapRegistry::new();
//!
//! heap.set_collection_hook(move |heap: &GcHeap| {
//!     for object in heap.objects() {
//!         if let Some(stored) = StoredContinuation::from_object(object) {
//!             walk_stored_continuation(stored, &registry, &mut |slot| {
//!                 mark(slot);
//!                 true
//!             });
//!         }
//!     }
//! });
//! ```
//!
//! # Safety
//!
//! Stored continuations are published exactly once. Until the frame count is
//! published the object scans as empty, so a collection may observe a
//! freshly allocated object at any time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod continuation;
pub mod guarantee;
pub mod heap;
pub mod refmap;
pub mod safepoint;
pub mod trace;

mod alloc;
mod stats;

// Re-exports for convenient access
pub use alloc::{ObjectHub, ObjectRef};
pub use config::{ConfigError, GcConfig};
pub use continuation::{StoredContinuation, StoredContinuationWriter, walk_stored_continuation};
pub use heap::{AllocError, Allocator, CollectionHook, GcHeap};
pub use refmap::{
    NO_REFERENCE_MAP, ReferenceMapDecoder, ReferenceMapEncoder, ReferenceMapEncoding,
    ReferenceMapHandle, ReferenceMapRegistry,
};
pub use safepoint::{RegionBarrier, Uninterruptible};
pub use stats::{GcStats, GcTimer};
pub use trace::{CountingVisitor, ReferenceVisitor};
