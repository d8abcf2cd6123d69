//! Stored continuations: captured call stacks as heap objects.
//!
//! A stored continuation is self-describing to the collector. Its payload
//! holds one reference-map encoding handle shared by all frames, a table of
//! `(frame size, reference-map index)` entries, and the raw frame bytes in
//! the same leaf-to-root order. See [`layout`] for the exact byte layout.
//!
//! Objects go through three states:
//!
//! 1. allocated: zeroed, frame count 0, scans as empty;
//! 2. metadata written by [`StoredContinuationWriter`], still count 0;
//! 3. published: frame bytes copied and count stored in one
//!    non-interruptible region.

pub mod layout;
mod object;
mod scan;
mod writer;

pub use layout::{HEADER_SIZE, PAYLOAD_OFFSET, PayloadOffset};
pub use object::{StoredContinuation, StoredFrame, StoredFrames};
pub use scan::walk_stored_continuation;
pub use writer::StoredContinuationWriter;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::ObjectHub;
    use crate::config::GcConfig;
    use crate::heap::{Allocator, GcHeap};
    use crate::refmap::{
        NO_REFERENCE_MAP, ReferenceMapDecoder, ReferenceMapEncoding, ReferenceMapHandle,
        ReferenceMapRegistry,
    };
    use crate::trace::{CountingVisitor, ReferenceVisitor};

    fn heap() -> GcHeap {
        GcHeap::new(GcConfig {
            collection_trigger: 0,
            ..Default::default()
        })
        .unwrap()
    }

    /// Build a published object from `(size, index)` frames filled with a
    /// byte pattern.
    fn build(
        heap: &GcHeap,
        handle: ReferenceMapHandle,
        frames: &[(u32, i32)],
    ) -> (StoredContinuation, Vec<u8>) {
        let total: usize = frames.iter().map(|&(size, _)| size as usize).sum();
        let source: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        let mut writer = StoredContinuationWriter::allocate(heap, frames.len(), total).unwrap();
        writer.write_reference_map_encoding(handle);
        for (i, &(size, index)) in frames.iter().enumerate() {
            writer.write_frame_meta(i, size, index);
        }
        let stored = unsafe { writer.publish(source.as_ptr(), total) };
        (stored, source)
    }

    /// Decoder that records every call and reports one slot per frame.
    #[derive(Default)]
    struct RecordingDecoder {
        calls: std::cell::RefCell<Vec<(usize, ReferenceMapHandle, i32)>>,
    }

    impl ReferenceMapDecoder for RecordingDecoder {
        fn walk_offsets(
            &self,
            base: usize,
            encoding: ReferenceMapHandle,
            index: i32,
            visitor: &mut dyn ReferenceVisitor,
        ) -> bool {
            self.calls.borrow_mut().push((base, encoding, index));
            visitor.visit_reference(base)
        }
    }

    #[test]
    fn test_layout_of_published_object() {
        let heap = heap();
        let handle = ReferenceMapHandle::from_raw(0x1000);
        let (stored, _) = build(&heap, handle, &[(96, 0), (32, 2), (48, NO_REFERENCE_MAP)]);

        assert_eq!(stored.frame_count(), 3);
        assert_eq!(stored.payload_size(), 8 + 3 * 8 + 96 + 32 + 48);
        assert_eq!(stored.size(), HEADER_SIZE + stored.payload_size() as usize);
        assert_eq!(stored.reference_map_encoding(), handle);
        assert_eq!(stored.frame_size(0), 96);
        assert_eq!(stored.frame_size(1), 32);
        assert_eq!(stored.frame_size(2), 48);
        assert_eq!(stored.reference_map_index(1), 2);
        assert_eq!(stored.reference_map_index(2), NO_REFERENCE_MAP);
        assert_eq!(stored.all_frame_size(), 176);
        assert_eq!(stored.frame_data_start(), stored.payload_start() + 32);
    }

    #[test]
    fn test_raw_header_words() {
        let heap = heap();
        let (stored, _) = build(&heap, ReferenceMapHandle::from_raw(0xAB), &[(16, 0)]);

        let base = stored.object().as_ptr();
        unsafe {
            assert_eq!(base.cast::<u64>().read(), ObjectHub::STORED_CONTINUATION.raw());
            assert_eq!(base.add(8).cast::<u32>().read(), 8 + 8 + 16);
            assert_eq!(base.add(12).cast::<u32>().read(), 1);
            assert_eq!(base.add(16).cast::<u64>().read(), 0xAB);
            assert_eq!(base.add(24).cast::<u32>().read(), 16);
            assert_eq!(base.add(28).cast::<i32>().read(), 0);
        }
    }

    #[test]
    fn test_frames_iterator_and_bytes() {
        let heap = heap();
        let (stored, source) = build(&heap, ReferenceMapHandle::from_raw(8), &[(24, 0), (40, 1)]);

        let frames: Vec<StoredFrame> = stored.frames().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].base, stored.frame_data_start());
        assert_eq!(frames[0].size, 24);
        assert_eq!(frames[1].base, stored.frame_data_start() + 24);
        assert_eq!(frames[1].reference_map_index, 1);

        assert_eq!(stored.frame_bytes(), source);
    }

    #[test]
    #[should_panic(expected = "frame buffer of 3 bytes")]
    fn test_copy_frames_to_wrong_length() {
        let heap = heap();
        let (stored, _) = build(&heap, ReferenceMapHandle::from_raw(8), &[(16, 0)]);
        stored.copy_frames_to(&mut [0u8; 3]);
    }

    #[test]
    fn test_unpublished_object_scans_empty() {
        let heap = heap();
        let mut writer = StoredContinuationWriter::allocate(&heap, 2, 64).unwrap();
        writer.write_reference_map_encoding(ReferenceMapHandle::from_raw(0x40));
        writer.write_frame_meta(0, 32, 0);

        let object = writer.object();
        assert_eq!(object.frame_count(), 0);
        assert!(!object.is_published());
        assert_eq!(object.all_frame_size(), 0);
        assert_eq!(object.frames().count(), 0);

        let decoder = RecordingDecoder::default();
        let mut visitor = CountingVisitor::new();
        assert!(walk_stored_continuation(object, &decoder, &mut visitor));
        assert!(decoder.calls.borrow().is_empty());
        assert_eq!(visitor.count, 0);
    }

    #[test]
    fn test_collection_during_allocation_sees_full_size() {
        let heap = GcHeap::new(GcConfig::for_testing()).unwrap();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let seen = std::sync::Arc::clone(&seen);
            heap.set_collection_hook(move |heap: &GcHeap| {
                for object in heap.objects() {
                    if let Some(stored) = StoredContinuation::from_object(object) {
                        seen.lock().push((
                            stored.size(),
                            stored.payload_size(),
                            stored.frame_count(),
                            heap.size_of(object),
                        ));
                    }
                }
            });
        }

        let writer = StoredContinuationWriter::allocate(&heap, 2, 64).unwrap();

        let payload = 8 + 2 * 8 + 64;
        assert_eq!(
            *seen.lock(),
            vec![(HEADER_SIZE + payload, payload as u32, 0, Some(HEADER_SIZE + payload))]
        );
        assert_eq!(writer.object().size(), HEADER_SIZE + payload);
    }

    #[test]
    fn test_from_object_checks_hub() {
        let heap = heap();
        let other = heap.allocate_zeroed(ObjectHub::from_raw(3), 32).unwrap();
        assert!(StoredContinuation::from_object(other).is_none());

        let (stored, _) = build(&heap, ReferenceMapHandle::from_raw(8), &[(8, 0)]);
        assert_eq!(StoredContinuation::from_object(stored.object()), Some(stored));
    }

    #[test]
    fn test_scan_replays_table_in_order() {
        let heap = heap();
        let handle = ReferenceMapHandle::from_raw(0x7700);
        let (stored, _) = build(&heap, handle, &[(16, 4), (32, NO_REFERENCE_MAP), (8, 1)]);

        let decoder = RecordingDecoder::default();
        let mut visitor = CountingVisitor::new();
        assert!(walk_stored_continuation(stored, &decoder, &mut visitor));

        let start = stored.frame_data_start();
        assert_eq!(
            *decoder.calls.borrow(),
            vec![
                (start, handle, 4),
                (start + 16, handle, NO_REFERENCE_MAP),
                (start + 48, handle, 1),
            ]
        );
        assert_eq!(visitor.count, 3);
    }

    #[test]
    fn test_scan_early_stop() {
        let heap = heap();
        let (stored, _) = build(&heap, ReferenceMapHandle::from_raw(8), &[(8, 0), (8, 0), (8, 0)]);

        let decoder = RecordingDecoder::default();
        let mut visitor = CountingVisitor::stopping_after(2);
        assert!(!walk_stored_continuation(stored, &decoder, &mut visitor));
        assert_eq!(decoder.calls.borrow().len(), 2);
    }

    #[test]
    fn test_scan_with_registry_reports_slots() {
        let heap = heap();
        let registry = ReferenceMapRegistry::new();
        let encoding = ReferenceMapEncoding::from_bitmaps(vec![0b01, 0b110]);
        let handle = registry.register(&encoding);
        let (stored, _) = build(&heap, handle, &[(16, 0), (24, 1)]);

        let mut slots = Vec::new();
        let completed = walk_stored_continuation(stored, &registry, &mut |slot: usize| {
            slots.push(slot);
            true
        });

        let start = stored.frame_data_start();
        assert!(completed);
        assert_eq!(slots, vec![start, start + 16 + 8, start + 16 + 16]);

        // Scanning is read-only and repeatable.
        let mut again = Vec::new();
        walk_stored_continuation(stored, &registry, &mut |slot: usize| {
            again.push(slot);
            true
        });
        assert_eq!(slots, again);
    }

    #[test]
    #[should_panic(expected = "payload holds 16 frame bytes, copying 8")]
    fn test_publish_size_mismatch_is_fatal() {
        let heap = heap();
        let writer = StoredContinuationWriter::allocate(&heap, 1, 16).unwrap();
        let source = [0u8; 16];
        unsafe { writer.publish(source.as_ptr(), 8) };
    }

    #[test]
    #[should_panic(expected = "frame 1 out of range for 1 frames")]
    fn test_write_meta_out_of_range_is_fatal() {
        let heap = heap();
        let mut writer = StoredContinuationWriter::allocate(&heap, 1, 16).unwrap();
        writer.write_frame_meta(1, 8, 0);
    }

    #[test]
    fn test_release_through_allocator() {
        let heap = heap();
        let (stored, _) = build(&heap, ReferenceMapHandle::from_raw(8), &[(8, 0)]);
        assert_eq!(heap.size_of(stored.object()), Some(stored.size()));
        heap.release(stored.object());
        assert_eq!(heap.object_count(), 0);
    }
}
