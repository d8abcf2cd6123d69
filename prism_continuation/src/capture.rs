//! Continuation capture.
//!
//! Capturing copies the frames between a leaf stack pointer and a root stack
//! pointer into a stored continuation:
//!
//! 1. walk the stack leaf to root, resolving each frame's size and
//!    reference-map index (interruptible);
//! 2. allocate the object, which may collect (interruptible);
//! 3. write the shared encoding handle and the frame table while the frame
//!    count is still 0 (interruptible);
//! 4. copy the raw frame bytes and publish the count in one
//!    non-interruptible region.
//!
//! A capture that finds another capture in progress, either on the calling
//! OS thread or as a frame on the walked stack, gives up before allocating
//! and reports [`CaptureStatus::Yielding`].

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::ControlFlow;

use prism_gc::continuation::layout::payload_size_for;
use prism_gc::{Allocator, ReferenceMapHandle, StoredContinuationWriter, guarantee};
use smallvec::SmallVec;

use crate::code_info::FrameMetadataResolver;
use crate::continuation::Continuation;
use crate::error::CaptureError;
use crate::stats::CaptureStats;
use crate::thread::ThreadId;
use crate::walker::{FrameKind, FrameVisitor, StackWalker, WalkStart, WalkedFrame};

/// Outcome of a capture that did not fail.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStatus {
    /// The stack was captured into the continuation.
    Success = 0,
    /// Another capture is in progress; nothing was allocated or changed.
    Yielding = 1,
}

impl CaptureStatus {
    /// Numeric status code.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Check for success.
    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, CaptureStatus::Success)
    }
}

thread_local! {
    /// Set while a capture runs on this OS thread.
    static CAPTURE_IN_PROGRESS: Cell<bool> = const { Cell::new(false) };
}

/// Check if a capture is running on the calling OS thread.
#[inline]
pub fn is_capture_in_progress() -> bool {
    CAPTURE_IN_PROGRESS.with(Cell::get)
}

/// Marks the calling OS thread as capturing until dropped.
struct CaptureScope {
    _not_send: PhantomData<*const ()>,
}

impl CaptureScope {
    fn enter() -> Option<Self> {
        if CAPTURE_IN_PROGRESS.with(|c| c.replace(true)) {
            return None;
        }
        Some(Self {
            _not_send: PhantomData,
        })
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        CAPTURE_IN_PROGRESS.with(|c| c.set(false));
    }
}

/// Size and reference map of one walked frame.
#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    size: u32,
    reference_map_index: i32,
}

/// Frame visitor that records the frames of one capture.
struct CaptureVisitor<'a> {
    resolver: &'a dyn FrameMetadataResolver,
    root_sp: usize,
    /// Self mode: the first frame must match this `(sp, ip)`.
    verify_leaf: Option<(usize, usize)>,
    /// Foreign mode starts recording after the safepoint slow path.
    recording: bool,
    leaf: Option<(usize, usize)>,
    encoding: Option<ReferenceMapHandle>,
    frames: SmallVec<[FrameMeta; 16]>,
    frame_bytes: usize,
    reached_root: bool,
    yielding: bool,
}

impl<'a> CaptureVisitor<'a> {
    fn new(
        resolver: &'a dyn FrameMetadataResolver,
        root_sp: usize,
        verify_leaf: Option<(usize, usize)>,
    ) -> Self {
        Self {
            resolver,
            root_sp,
            recording: verify_leaf.is_some(),
            verify_leaf,
            leaf: None,
            encoding: None,
            frames: SmallVec::new(),
            frame_bytes: 0,
            reached_root: false,
            yielding: false,
        }
    }
}

impl FrameVisitor for CaptureVisitor<'_> {
    fn visit_frame(&mut self, frame: &WalkedFrame) -> ControlFlow<()> {
        if frame.kind == FrameKind::CaptureInProgress {
            self.yielding = true;
            return ControlFlow::Break(());
        }

        if !self.recording {
            if frame.kind == FrameKind::SafepointSlowPath {
                self.recording = true;
            }
            return ControlFlow::Continue(());
        }

        if self.leaf.is_none() {
            if let Some((sp, ip)) = self.verify_leaf {
                guarantee!(
                    frame.sp == sp && frame.ip == ip,
                    "first frame (sp {:#x}, ip {:#x}) is not the leaf (sp {:#x}, ip {:#x})",
                    frame.sp,
                    frame.ip,
                    sp,
                    ip
                );
            }
            self.leaf = Some((frame.sp, frame.ip));
        }

        let meta = self.resolver.resolve(frame.code, frame.ip);
        match self.encoding {
            None => self.encoding = Some(meta.reference_map_encoding),
            Some(shared) => guarantee!(
                shared == meta.reference_map_encoding,
                "frame at {:#x} uses reference map encoding {:#x}, capture uses {:#x}",
                frame.sp,
                meta.reference_map_encoding.raw(),
                shared.raw()
            ),
        }
        guarantee!(meta.frame_size > 0, "empty frame at {:#x}", frame.sp);

        let end = frame.sp + meta.frame_size as usize;
        guarantee!(
            end <= self.root_sp,
            "frame {:#x}..{:#x} crosses root {:#x}",
            frame.sp,
            end,
            self.root_sp
        );

        self.frames.push(FrameMeta {
            size: meta.frame_size,
            reference_map_index: meta.reference_map_index,
        });
        self.frame_bytes += meta.frame_size as usize;

        if end == self.root_sp {
            self.reached_root = true;
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

/// Captures stacks into stored continuations.
pub struct ContinuationCapture<'a> {
    walker: &'a dyn StackWalker,
    resolver: &'a dyn FrameMetadataResolver,
    allocator: &'a dyn Allocator,
    stats: CaptureStats,
}

impl<'a> ContinuationCapture<'a> {
    /// Create a capture using the given collaborators.
    pub fn new(
        walker: &'a dyn StackWalker,
        resolver: &'a dyn FrameMetadataResolver,
        allocator: &'a dyn Allocator,
    ) -> Self {
        Self {
            walker,
            resolver,
            allocator,
            stats: CaptureStats::new(),
        }
    }

    /// Capture statistics.
    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Capture the calling thread's frames from `leaf_sp` up to `root_sp`.
    ///
    /// The first walked frame must be the one at `leaf_sp` returning to
    /// `leaf_ip`.
    pub fn capture_current(
        &self,
        cont: &mut Continuation,
        root_sp: usize,
        leaf_sp: usize,
        leaf_ip: usize,
    ) -> Result<CaptureStatus, CaptureError> {
        let Some(_scope) = CaptureScope::enter() else {
            return Ok(self.yielded("capture already in progress on this thread"));
        };
        guarantee!(leaf_sp != 0, "capture without a leaf stack pointer");
        guarantee!(
            leaf_sp < root_sp,
            "leaf {:#x} is not below root {:#x}",
            leaf_sp,
            root_sp
        );

        let mut visitor = CaptureVisitor::new(self.resolver, root_sp, Some((leaf_sp, leaf_ip)));
        self.walker
            .walk(WalkStart::Current { sp: leaf_sp }, &mut visitor);
        self.finish(cont, visitor, false)
    }

    /// Capture a parked thread's frames above its safepoint slow path, up to
    /// `root_sp`.
    ///
    /// On success the continuation's resume address is the return address of
    /// the first captured frame.
    pub fn capture_foreign(
        &self,
        cont: &mut Continuation,
        root_sp: usize,
        thread: ThreadId,
    ) -> Result<CaptureStatus, CaptureError> {
        let Some(_scope) = CaptureScope::enter() else {
            return Ok(self.yielded("capture already in progress on this thread"));
        };

        let mut visitor = CaptureVisitor::new(self.resolver, root_sp, None);
        self.walker.walk(WalkStart::Thread(thread), &mut visitor);
        self.finish(cont, visitor, true)
    }

    fn finish(
        &self,
        cont: &mut Continuation,
        visitor: CaptureVisitor<'_>,
        foreign: bool,
    ) -> Result<CaptureStatus, CaptureError> {
        if visitor.yielding {
            return Ok(self.yielded("walk reached a capture in progress"));
        }

        let root_sp = visitor.root_sp;
        let Some((leaf_sp, leaf_ip)) = visitor.leaf else {
            guarantee::fail(format_args!("capture found no leaf frame below root {root_sp:#x}"))
        };
        guarantee!(
            visitor.reached_root && leaf_sp + visitor.frame_bytes == root_sp,
            "frames from leaf {:#x} cover {} bytes, root is {:#x}",
            leaf_sp,
            visitor.frame_bytes,
            root_sp
        );
        let Some(encoding) = visitor.encoding else {
            guarantee::fail(format_args!("capture recorded no frames"))
        };

        let frame_count = visitor.frames.len();
        let frame_bytes = visitor.frame_bytes;
        if payload_size_for(frame_count, frame_bytes).is_none() {
            return Err(CaptureError::TooLarge {
                frame_count,
                frame_bytes,
            });
        }

        let mut writer =
            match StoredContinuationWriter::allocate(self.allocator, frame_count, frame_bytes) {
                Ok(writer) => writer,
                Err(err) => {
                    self.stats.record_failure();
                    log::debug!("capture of {frame_count} frames failed: {err}");
                    return Err(err.into());
                }
            };
        writer.write_reference_map_encoding(encoding);
        for (index, frame) in visitor.frames.iter().enumerate() {
            writer.write_frame_meta(index, frame.size, frame.reference_map_index);
        }

        // SAFETY: the walker contract keeps every reported frame readable, and
        // the frames were checked to tile [leaf_sp, root_sp) exactly.
        let stored = unsafe { writer.publish(leaf_sp as *const u8, frame_bytes) };

        if foreign {
            cont.set_ip(leaf_ip);
        }
        if let Some(previous) = cont.replace_stored(stored) {
            self.allocator.release(previous.object());
            self.stats.record_replacement();
        }

        self.stats.record_capture(frame_count, frame_bytes);
        log::debug!(
            "captured {frame_count} frames ({frame_bytes} bytes) from {leaf_sp:#x} into {:?}",
            stored.object()
        );
        Ok(CaptureStatus::Success)
    }

    fn yielded(&self, reason: &str) -> CaptureStatus {
        self.stats.record_yield();
        log::trace!("capture yielding: {reason}");
        CaptureStatus::Yielding
    }
}
