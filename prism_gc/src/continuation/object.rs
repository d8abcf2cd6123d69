//! Read accessors for stored continuations.

use std::sync::atomic::{AtomicU32, Ordering};

use super::layout::{
    HEADER_SIZE, PAYLOAD_OFFSET, PayloadOffset, debug_check_offset, frame_meta_size,
};
use crate::alloc::{ObjectHub, ObjectRef};
use crate::guarantee;
use crate::refmap::ReferenceMapHandle;

/// A heap object holding a captured call stack.
///
/// A stored continuation is allocated with a frame count of 0 and stays
/// invisible to the collector until its contents are published. All
/// accessors read the frame count with acquire ordering, so once a non-zero
/// count is observed the metadata table and frame bytes are complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoredContinuation {
    object: ObjectRef,
}

/// One frame of a stored continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredFrame {
    /// Position in the frame table (0 is the leaf).
    pub index: usize,
    /// Address of the frame's first byte inside the object.
    pub base: usize,
    /// Frame size in bytes.
    pub size: u32,
    /// Reference-map index into the shared encoding.
    pub reference_map_index: i32,
}

impl StoredContinuation {
    /// Hub word of every stored continuation.
    pub const HUB: ObjectHub = ObjectHub::STORED_CONTINUATION;

    /// View an object as a stored continuation if its hub says it is one.
    #[inline]
    pub fn from_object(object: ObjectRef) -> Option<Self> {
        (object.hub() == Self::HUB).then_some(Self { object })
    }

    /// View an object as a stored continuation without checking the hub.
    ///
    /// # Safety
    ///
    /// The object must have been allocated with `HEADER_SIZE` plus its
    /// payload-size field worth of bytes.
    #[inline]
    pub(crate) unsafe fn from_object_unchecked(object: ObjectRef) -> Self {
        Self { object }
    }

    /// The underlying heap object.
    #[inline]
    pub fn object(self) -> ObjectRef {
        self.object
    }

    /// Address of the payload.
    #[inline]
    pub fn payload_start(self) -> usize {
        self.object.addr() + PAYLOAD_OFFSET
    }

    /// Total object size in bytes (header plus payload).
    #[inline]
    pub fn size(self) -> usize {
        HEADER_SIZE + self.payload_size() as usize
    }

    /// Payload size in bytes.
    #[inline]
    pub fn payload_size(self) -> u32 {
        self.load_header(PayloadOffset::PAYLOAD_SIZE, Ordering::Relaxed)
    }

    /// Number of frames, 0 until the object is published.
    #[inline]
    pub fn frame_count(self) -> u32 {
        self.load_header(PayloadOffset::FRAME_COUNT, Ordering::Acquire)
    }

    /// Check if the contents have been published.
    #[inline]
    pub fn is_published(self) -> bool {
        self.frame_count() != 0
    }

    /// Shared reference-map encoding handle of all frames.
    #[inline]
    pub fn reference_map_encoding(self) -> ReferenceMapHandle {
        ReferenceMapHandle::from_raw(self.read_u64(PayloadOffset::SHARED_REFERENCE_MAP_ENCODING))
    }

    /// Size in bytes of frame `index`.
    #[inline]
    pub fn frame_size(self, index: usize) -> u32 {
        debug_assert!(index < self.frame_count() as usize, "frame {index} out of range");
        self.read_u32(PayloadOffset::frame_size(index))
    }

    /// Reference-map index of frame `index`.
    #[inline]
    pub fn reference_map_index(self, index: usize) -> i32 {
        debug_assert!(index < self.frame_count() as usize, "frame {index} out of range");
        self.read_u32(PayloadOffset::reference_map_index(index)) as i32
    }

    /// Address of the first raw frame byte.
    #[inline]
    pub fn frame_data_start(self) -> usize {
        self.frame_data_start_for(self.frame_count() as usize)
    }

    /// Total size of all raw frame bytes.
    pub fn all_frame_size(self) -> usize {
        let count = self.frame_count() as usize;
        if count == 0 {
            return 0;
        }
        self.payload_size() as usize - frame_meta_size(count)
    }

    /// Iterate over the frames in table order, leaf first.
    pub fn frames(self) -> StoredFrames {
        let count = self.frame_count() as usize;
        StoredFrames {
            object: self,
            index: 0,
            count,
            cursor: self.frame_data_start_for(count),
        }
    }

    /// Copy all raw frame bytes into `dst`.
    ///
    /// `dst` must be exactly `all_frame_size()` bytes long.
    pub fn copy_frames_to(self, dst: &mut [u8]) {
        let len = self.all_frame_size();
        guarantee!(
            dst.len() == len,
            "frame buffer of {} bytes for {} bytes of frames",
            dst.len(),
            len
        );
        if len == 0 {
            return;
        }
        // SAFETY: the frame data area is `len` bytes inside the object and
        // cannot overlap a caller-owned slice.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.frame_data_start() as *const u8,
                dst.as_mut_ptr(),
                len,
            );
        }
    }

    /// Copy all raw frame bytes into a new buffer.
    pub fn frame_bytes(self) -> Vec<u8> {
        let mut buf = vec![0u8; self.all_frame_size()];
        self.copy_frames_to(&mut buf);
        buf
    }

    // =========================================================================
    // Raw field access
    // =========================================================================

    #[inline]
    pub(crate) fn frame_data_start_for(self, frame_count: usize) -> usize {
        self.field_addr(PayloadOffset::frame_data(frame_count))
    }

    #[inline]
    pub(crate) fn field_addr(self, offset: PayloadOffset) -> usize {
        self.payload_start().wrapping_add_signed(offset.get() as isize)
    }

    #[inline]
    fn header_addr(self, offset: PayloadOffset) -> *mut u32 {
        debug_assert!(offset.get() < 0, "payload offset {} is not a header field", offset.get());
        self.field_addr(offset) as *mut u32
    }

    #[inline]
    fn load_header(self, offset: PayloadOffset, order: Ordering) -> u32 {
        // SAFETY: header fields are 4-byte aligned words inside the object,
        // only ever accessed atomically.
        unsafe { AtomicU32::from_ptr(self.header_addr(offset)) }.load(order)
    }

    /// Store a header field.
    ///
    /// # Safety
    ///
    /// Only the writer of an unpublished object may store header fields.
    #[inline]
    pub(crate) unsafe fn store_header(self, offset: PayloadOffset, value: u32, order: Ordering) {
        // SAFETY: see `load_header`.
        unsafe { AtomicU32::from_ptr(self.header_addr(offset)) }.store(value, order)
    }

    #[inline]
    fn read_u32(self, offset: PayloadOffset) -> u32 {
        debug_check_offset(offset, 4, self.payload_size());
        // SAFETY: offset checked against the payload size; fields are aligned.
        unsafe { (self.field_addr(offset) as *const u32).read() }
    }

    #[inline]
    fn read_u64(self, offset: PayloadOffset) -> u64 {
        debug_check_offset(offset, 8, self.payload_size());
        // SAFETY: offset checked against the payload size; the handle is
        // 8-byte aligned because the payload starts 16 bytes into the object.
        unsafe { (self.field_addr(offset) as *const u64).read() }
    }
}

/// Iterator over the frames of a stored continuation.
///
/// The frame count is read once when the iterator is created.
#[derive(Debug, Clone)]
pub struct StoredFrames {
    object: StoredContinuation,
    index: usize,
    count: usize,
    cursor: usize,
}

impl Iterator for StoredFrames {
    type Item = StoredFrame;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let index = self.index;
        let size = self.object.frame_size(index);
        let frame = StoredFrame {
            index,
            base: self.cursor,
            size,
            reference_map_index: self.object.reference_map_index(index),
        };
        self.index += 1;
        self.cursor += size as usize;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for StoredFrames {}
