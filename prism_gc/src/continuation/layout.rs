//! Binary layout of a stored continuation.
//!
//! ```text
//! object start
//! +0   hub                              8 bytes  (written by the allocator)
//! +8   payload size          (u32)      payload offset -8
//! +12  frame count           (u32)      payload offset -4, published last
//! +16  shared ref-map handle (u64)      payload offset 0
//! +24  frame 0 size          (u32)      payload offset 8
//! +28  frame 0 ref-map index (i32)      payload offset 12
//!      ... one 8-byte entry per frame ...
//!      raw frame bytes, leaf to root, in table order
//! ```
//!
//! All fields use native byte order.

/// Bytes before the payload.
pub const HEADER_SIZE: usize = 16;

/// Offset of the payload from the object start.
pub const PAYLOAD_OFFSET: usize = HEADER_SIZE;

/// Size of the shared reference-map handle at payload offset 0.
pub const SHARED_REFERENCE_MAP_ENCODING_SIZE: usize = 8;

/// Size of one frame metadata entry.
pub const FRAME_META_SIZE: usize = 8;

/// Lowest negative payload offset that names a field.
const MIN_PAYLOAD_OFFSET: i32 = -8;

/// Offset of a field relative to the payload start.
///
/// The associated constructors are the only way to name a field. Every
/// offset is a multiple of 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PayloadOffset(i32);

impl PayloadOffset {
    /// Total payload size (u32).
    pub const PAYLOAD_SIZE: PayloadOffset = PayloadOffset::new(-8);

    /// Number of frames (u32), published with release ordering.
    pub const FRAME_COUNT: PayloadOffset = PayloadOffset::new(-4);

    /// Shared reference-map encoding handle (u64).
    pub const SHARED_REFERENCE_MAP_ENCODING: PayloadOffset = PayloadOffset::new(0);

    /// First frame metadata entry.
    pub const FRAME_META_START: PayloadOffset =
        PayloadOffset::new(SHARED_REFERENCE_MAP_ENCODING_SIZE as i32);

    const fn new(offset: i32) -> Self {
        assert!(offset % 4 == 0, "payload offsets are 4-byte aligned");
        assert!(offset >= MIN_PAYLOAD_OFFSET, "offset below the payload size field");
        Self(offset)
    }

    /// Size field of frame `index`'s metadata entry.
    #[inline]
    pub const fn frame_size(index: usize) -> Self {
        Self::new(Self::FRAME_META_START.0 + (index * FRAME_META_SIZE) as i32)
    }

    /// Reference-map index field of frame `index`'s metadata entry.
    #[inline]
    pub const fn reference_map_index(index: usize) -> Self {
        Self::new(Self::frame_size(index).0 + 4)
    }

    /// First byte of the raw frame data for a table of `frame_count` frames.
    #[inline]
    pub const fn frame_data(frame_count: usize) -> Self {
        Self::new(Self::FRAME_META_START.0 + (frame_count * FRAME_META_SIZE) as i32)
    }

    /// Raw offset value.
    #[inline]
    pub const fn get(self) -> i32 {
        self.0
    }
}

/// Bytes taken by the reference-map handle and a table of `frame_count`
/// metadata entries.
#[inline]
pub const fn frame_meta_size(frame_count: usize) -> usize {
    SHARED_REFERENCE_MAP_ENCODING_SIZE + frame_count * FRAME_META_SIZE
}

/// Payload size for `frame_count` frames totalling `frame_bytes` bytes.
///
/// Returns `None` if the payload would not fit the 32-bit size field.
pub fn payload_size_for(frame_count: usize, frame_bytes: usize) -> Option<u32> {
    frame_count
        .checked_mul(FRAME_META_SIZE)
        .and_then(|table| table.checked_add(SHARED_REFERENCE_MAP_ENCODING_SIZE))
        .and_then(|meta| meta.checked_add(frame_bytes))
        .and_then(|total| u32::try_from(total).ok())
}

/// Check that a field of `width` bytes at `offset` lies inside an object
/// with the given payload size.
#[inline]
pub(crate) fn debug_check_offset(offset: PayloadOffset, width: usize, payload_size: u32) {
    debug_assert!(offset.0 % 4 == 0, "unaligned payload offset {}", offset.0);
    debug_assert!(offset.0 >= MIN_PAYLOAD_OFFSET, "payload offset {} below header", offset.0);
    if offset.0 >= 0 {
        debug_assert!(
            offset.0 as usize + width <= payload_size as usize,
            "payload offset {} (+{width}) past payload end {payload_size}",
            offset.0
        );
        debug_assert!(
            (offset.0 as usize) < HEADER_SIZE + payload_size as usize,
            "payload offset {} past object end",
            offset.0
        );
    }
}

/// Writes to the payload must not touch the header.
#[inline]
pub(crate) fn debug_check_write(offset: PayloadOffset, width: usize, payload_size: u32) {
    debug_assert!(offset.0 >= 0, "write to header offset {}", offset.0);
    debug_check_offset(offset, width, payload_size);
}
