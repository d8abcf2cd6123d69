//! Collector-side traversal of stored continuations.

use super::layout::PAYLOAD_OFFSET;
use super::object::StoredContinuation;
use crate::refmap::ReferenceMapDecoder;
use crate::trace::ReferenceVisitor;

/// Report every reference slot embedded in a stored continuation.
///
/// Replays the frame table leaf to root, handing each frame's base address,
/// the shared encoding handle and the frame's reference-map index to
/// `decoder`. An unpublished object (frame count 0) has nothing to report.
///
/// Returns `false` if the visitor asked to stop; later frames are skipped.
pub fn walk_stored_continuation(
    object: StoredContinuation,
    decoder: &dyn ReferenceMapDecoder,
    visitor: &mut dyn ReferenceVisitor,
) -> bool {
    let count = object.frame_count() as usize;
    if count == 0 {
        return true;
    }
    let encoding = object.reference_map_encoding();

    let mut cursor = object.frame_data_start_for(count);
    for index in 0..count {
        let size = object.frame_size(index);
        let reference_map_index = object.reference_map_index(index);
        if !decoder.walk_offsets(cursor, encoding, reference_map_index, visitor) {
            return false;
        }
        cursor += size as usize;
    }

    debug_assert_eq!(
        cursor,
        object.object().addr() + PAYLOAD_OFFSET + object.payload_size() as usize,
        "frame table does not cover the payload"
    );
    true
}
