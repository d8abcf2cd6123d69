//! Stack walking seam.
//!
//! A [`StackWalker`] reports frames leaf to root. Each frame carries the
//! stack pointer at its lowest address, the return address into its code,
//! a handle to that code's metadata, and the code's [`FrameKind`].
//!
//! ```text
//!   high ┌──────────────┐ ← root sp
//!        │   frame N-1  │
//!        ├──────────────┤ ← sp(N-1) = sp(N-2) + size(N-2)
//!        │     ...      │
//!        ├──────────────┤
//!        │   frame 0    │   (leaf)
//!        ├──────────────┤ ← sp(0)
//!        │  return addr │   ip(0), read from sp(0) - 8
//!   low  └──────────────┘
//! ```

use std::ops::ControlFlow;

use crate::thread::ThreadId;

/// Handle to the metadata of one installed code blob.
///
/// The value is the code's start address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeInfoId(pub usize);

/// Role of a frame's code, as recorded in its code metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameKind {
    /// Ordinary compiled code.
    #[default]
    Regular,
    /// The entry point of a continuation capture. A walk that meets one is
    /// racing with a capture that is still in progress.
    CaptureInProgress,
    /// The slow path a thread enters when it parks at a safepoint. A foreign
    /// capture starts at the frame above it.
    SafepointSlowPath,
}

/// One frame reported by a walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkedFrame {
    /// Lowest address of the frame.
    pub sp: usize,
    /// Return address into the frame's code.
    pub ip: usize,
    /// Metadata handle of the frame's code.
    pub code: CodeInfoId,
    /// Role of the frame's code.
    pub kind: FrameKind,
}

/// Where a walk starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStart {
    /// The calling thread, starting at the frame whose stack pointer is `sp`.
    Current {
        /// Leaf stack pointer.
        sp: usize,
    },
    /// A parked thread, starting at its suspension point.
    Thread(ThreadId),
}

/// Receives frames from a [`StackWalker`].
pub trait FrameVisitor {
    /// Visit one frame. `Break` ends the walk.
    fn visit_frame(&mut self, frame: &WalkedFrame) -> ControlFlow<()>;
}

impl<F> FrameVisitor for F
where
    F: FnMut(&WalkedFrame) -> ControlFlow<()>,
{
    #[inline]
    fn visit_frame(&mut self, frame: &WalkedFrame) -> ControlFlow<()> {
        self(frame)
    }
}

/// Produces the frames of a thread's stack, leaf to root.
///
/// # Safety
///
/// Implementors must only report frames whose memory `[sp, sp + frame size)`
/// stays readable for the duration of the walk and of any capture that uses
/// it, where the frame size is what the paired `FrameMetadataResolver`
/// reports for the frame.
pub unsafe trait StackWalker {
    /// Walk from `start` towards the root until the stack ends or the
    /// visitor breaks.
    fn walk(&self, start: WalkStart, visitor: &mut dyn FrameVisitor);
}
