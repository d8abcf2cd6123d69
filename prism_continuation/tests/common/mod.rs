//! Synthetic stacks for capture tests.
//!
//! A `SyntheticStack` owns a block of memory laid out like a downward-growing
//! machine stack: frames tile the block from the top, and the word below each
//! frame holds the return address into that frame's code. Every frame gets its
//! own installed code blob, and all blobs share one reference-map encoding.

#![allow(dead_code)]

use std::sync::Arc;

use prism_continuation::{
    CodeImageBuilder, CodeInfoId, CodeInfoStackWalker, CodeInfoTable, FrameKind, MutatorThread,
    StackBounds, ThreadRegistry,
};
use prism_gc::{
    GcConfig, GcHeap, ReferenceMapEncoding, ReferenceMapHandle, ReferenceMapRegistry,
    StoredContinuation,
};

/// Words kept free below the leaf frame for its return address.
const SCRATCH_WORDS: usize = 2;

/// First code address; blob `i` starts at `CODE_BASE + i * CODE_STRIDE`.
const CODE_BASE: usize = 0x40_0000;
const CODE_STRIDE: usize = 0x1000;
const CODE_SIZE: u32 = 0x100;

/// Offset of the one call site in every blob.
pub const CALL_OFFSET: usize = 0x10;

/// Description of one synthetic frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameShape {
    /// Frame size in bytes, a non-zero multiple of 8.
    pub size: u32,
    /// Role of the frame's code.
    pub kind: FrameKind,
    /// Reference slots at the call site.
    pub bitmap: u64,
}

impl FrameShape {
    pub fn regular(size: u32, bitmap: u64) -> Self {
        Self {
            size,
            kind: FrameKind::Regular,
            bitmap,
        }
    }

    pub fn marker(size: u32, kind: FrameKind) -> Self {
        Self {
            size,
            kind,
            bitmap: 0,
        }
    }
}

/// A laid-out frame.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticFrame {
    pub sp: usize,
    pub ip: usize,
    pub code: CodeInfoId,
    pub shape: FrameShape,
}

impl SyntheticFrame {
    pub fn end(&self) -> usize {
        self.sp + self.shape.size as usize
    }
}

pub struct SyntheticStack {
    memory: Box<[u64]>,
    pub frames: Vec<SyntheticFrame>,
    pub code: CodeInfoTable,
    pub threads: ThreadRegistry,
    pub thread: Arc<MutatorThread>,
    pub encoding: Arc<ReferenceMapEncoding>,
}

impl SyntheticStack {
    /// Lay out `shapes`, leaf first, ending at the top of the stack.
    pub fn new(shapes: &[FrameShape]) -> Self {
        let total: usize = shapes.iter().map(|s| s.size as usize).sum();
        assert!(shapes.iter().all(|s| s.size > 0 && s.size % 8 == 0));

        let words = SCRATCH_WORDS + total / 8;
        let mut memory: Box<[u64]> = (0..words as u64)
            .map(|i| 0xC0DE_0000_0000 | i)
            .collect();
        let start = memory.as_ptr() as usize;
        let root = start + words * 8;

        let mut builder = CodeImageBuilder::new();
        let mut frames = Vec::with_capacity(shapes.len());
        let mut sp = root - total;
        for (i, shape) in shapes.iter().enumerate() {
            let code_start = CODE_BASE + i * CODE_STRIDE;
            let code = builder.add_code(
                code_start,
                CODE_SIZE,
                shape.size,
                shape.kind,
                &[(CALL_OFFSET as u32, shape.bitmap)],
            );
            let ip = code_start + CALL_OFFSET;
            memory[(sp - 8 - start) / 8] = ip as u64;
            frames.push(SyntheticFrame {
                sp,
                ip,
                code,
                shape: *shape,
            });
            sp += shape.size as usize;
        }
        let image = builder.finish();
        let encoding = Arc::clone(&image.reference_maps);

        let code = CodeInfoTable::new(Arc::new(ReferenceMapRegistry::new()));
        code.install_image(image);

        let threads = ThreadRegistry::new();
        // SAFETY: the memory lives as long as the stack, which owns the
        // registry.
        let thread = unsafe {
            threads.register(StackBounds {
                limit: start,
                base: root,
            })
        };

        Self {
            memory,
            frames,
            code,
            threads,
            thread,
            encoding,
        }
    }

    pub fn root(&self) -> usize {
        self.memory.as_ptr() as usize + self.memory.len() * 8
    }

    pub fn leaf(&self) -> SyntheticFrame {
        self.frames[0]
    }

    pub fn handle(&self) -> ReferenceMapHandle {
        self.encoding.handle()
    }

    pub fn registry(&self) -> &Arc<ReferenceMapRegistry> {
        self.code.reference_maps()
    }

    pub fn walker(&self) -> CodeInfoStackWalker<'_> {
        CodeInfoStackWalker::new(&self.code, &self.threads)
    }

    /// Raw bytes of `[from, to)`.
    pub fn bytes(&self, from: usize, to: usize) -> Vec<u8> {
        let start = self.memory.as_ptr() as usize;
        assert!(from >= start && to <= self.root() && from <= to);
        // SAFETY: bounds checked against the owned memory.
        unsafe { std::slice::from_raw_parts(from as *const u8, to - from) }.to_vec()
    }

    /// Slot addresses a scan of `stored` should report, given that it holds
    /// `frames` in order.
    pub fn expected_slots(&self, stored: StoredContinuation, frames: &[SyntheticFrame]) -> Vec<usize> {
        let mut slots = Vec::new();
        let mut base = stored.frame_data_start();
        for frame in frames {
            let mut bitmap = frame.shape.bitmap;
            while bitmap != 0 {
                slots.push(base + bitmap.trailing_zeros() as usize * 8);
                bitmap &= bitmap - 1;
            }
            base += frame.shape.size as usize;
        }
        slots
    }
}

/// Heap that never collects on its own.
pub fn quiet_heap() -> GcHeap {
    GcHeap::new(GcConfig {
        collection_trigger: 0,
        ..Default::default()
    })
    .unwrap()
}

/// Record every slot a scan reports.
pub fn scan_slots(stored: StoredContinuation, registry: &ReferenceMapRegistry) -> Vec<usize> {
    let mut slots = Vec::new();
    prism_gc::walk_stored_continuation(stored, registry, &mut |slot: usize| {
        slots.push(slot);
        true
    });
    slots
}
