//! Write path for stored continuations, used only during capture.

use std::sync::atomic::Ordering;

use super::layout::{PayloadOffset, debug_check_write, frame_meta_size, payload_size_for};
use super::object::StoredContinuation;
use crate::alloc::ObjectRef;
use crate::guarantee;
use crate::heap::{AllocError, Allocator};
use crate::refmap::ReferenceMapHandle;
use crate::safepoint::Uninterruptible;

/// Exclusive writer for a freshly allocated, unpublished stored continuation.
///
/// The object is allocated with a frame count of 0, so the collector treats
/// it as empty while metadata is written. [`publish`](Self::publish) copies
/// the frame bytes and publishes the count in one non-interruptible region,
/// consuming the writer.
#[derive(Debug)]
pub struct StoredContinuationWriter {
    object: StoredContinuation,
    frame_count: usize,
    payload_size: u32,
}

impl StoredContinuationWriter {
    /// Allocate an object for `frame_count` frames totalling `frame_bytes`.
    ///
    /// The payload size is written before the object becomes visible. May run
    /// a collection; the collector sees the new object as empty but sized.
    pub fn allocate(
        allocator: &dyn Allocator,
        frame_count: usize,
        frame_bytes: usize,
    ) -> Result<Self, AllocError> {
        let payload_size = payload_size_for(frame_count, frame_bytes).ok_or(
            AllocError::InvalidSize {
                size: frame_bytes,
            },
        )?;
        let size = super::layout::HEADER_SIZE + payload_size as usize;
        let object = allocator.allocate_with(StoredContinuation::HUB, size, &|object| {
            // SAFETY: allocated with room for the header and payload, and
            // not yet visible to any collector.
            unsafe {
                StoredContinuation::from_object_unchecked(object).store_header(
                    PayloadOffset::PAYLOAD_SIZE,
                    payload_size,
                    Ordering::Relaxed,
                )
            }
        })?;

        // SAFETY: allocated with room for the header and payload.
        let object = unsafe { StoredContinuation::from_object_unchecked(object) };
        guarantee!(
            object.payload_size() == payload_size,
            "allocator left payload size {} for a {} byte payload",
            object.payload_size(),
            payload_size
        );

        Ok(Self {
            object,
            frame_count,
            payload_size,
        })
    }

    /// The object being written, still unpublished.
    #[inline]
    pub fn object(&self) -> StoredContinuation {
        self.object
    }

    /// Underlying heap object.
    #[inline]
    pub fn object_ref(&self) -> ObjectRef {
        self.object.object()
    }

    /// Number of frames the object was sized for.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Write the reference-map encoding handle shared by all frames.
    pub fn write_reference_map_encoding(&mut self, handle: ReferenceMapHandle) {
        self.write_u64(PayloadOffset::SHARED_REFERENCE_MAP_ENCODING, handle.raw());
    }

    /// Write the metadata entry of frame `index`.
    pub fn write_frame_meta(&mut self, index: usize, size: u32, reference_map_index: i32) {
        guarantee!(
            index < self.frame_count,
            "frame {} out of range for {} frames",
            index,
            self.frame_count
        );
        self.write_u32(PayloadOffset::frame_size(index), size);
        self.write_u32(
            PayloadOffset::reference_map_index(index),
            reference_map_index as u32,
        );
    }

    /// Copy the frame bytes and publish the frame count.
    ///
    /// Runs inside a non-interruptible region: no collection can observe the
    /// object between the copy and the count store.
    ///
    /// # Safety
    ///
    /// `source` must be valid for reads of `frame_bytes` bytes and must not
    /// overlap the object.
    pub unsafe fn publish(self, source: *const u8, frame_bytes: usize) -> StoredContinuation {
        let _region = Uninterruptible::enter("publish stored continuation");

        let expected = self.payload_size as usize - frame_meta_size(self.frame_count);
        guarantee!(
            frame_bytes == expected,
            "payload holds {} frame bytes, copying {}",
            expected,
            frame_bytes
        );

        let dst = self.object.frame_data_start_for(self.frame_count) as *mut u8;
        // SAFETY: the caller guarantees the source; the destination is the
        // frame data area, exactly `frame_bytes` long.
        unsafe { std::ptr::copy_nonoverlapping(source, dst, frame_bytes) };

        // SAFETY: this writer owns the unpublished object. Release ordering
        // makes every byte written above visible to acquire readers.
        unsafe {
            self.object.store_header(
                PayloadOffset::FRAME_COUNT,
                self.frame_count as u32,
                Ordering::Release,
            )
        };

        self.object
    }

    fn write_u32(&mut self, offset: PayloadOffset, value: u32) {
        debug_check_write(offset, 4, self.payload_size);
        // SAFETY: offset checked against the payload size; the object is
        // unpublished and owned by this writer.
        unsafe { (self.object.field_addr(offset) as *mut u32).write(value) }
    }

    fn write_u64(&mut self, offset: PayloadOffset, value: u64) {
        debug_check_write(offset, 8, self.payload_size);
        // SAFETY: as for `write_u32`; the handle field is 8-byte aligned.
        unsafe { (self.object.field_addr(offset) as *mut u64).write(value) }
    }
}
