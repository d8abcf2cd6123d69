//! Prism continuation capture
//!
//! Captures a contiguous range of a thread's call stack into a stored
//! continuation heap object that the collector can scan.
//!
//! # Architecture
//!
//! - **Walker seam**: [`StackWalker`] produces frames leaf to root;
//!   [`CodeInfoStackWalker`] walks registered thread stacks using installed
//!   code metadata.
//!
//! - **Metadata seam**: [`FrameMetadataResolver`] maps a frame to its size and
//!   reference map; [`CodeInfoTable`] resolves against installed code.
//!
//! - **Capture**: [`ContinuationCapture`] walks, sizes, allocates, writes the
//!   frame table and publishes the frame bytes into a [`Continuation`].
//!
//! # Usage
//!
//! ```ignore
//! use prism_continuation::{CaptureStatus, Continuation, ContinuationCapture};
//!
//! let walker = CodeInfoStackWalker::new(&code, &threads);
//! let capture = ContinuationCapture::new(&walker, &code, &heap);
//!
//! let mut cont = Continuation::new();
//! match capture.capture_current(&mut cont, root_sp, leaf_sp, leaf_ip)? {
//!     CaptureStatus::Success => scheduler.park(cont),
//!     CaptureStatus::Yielding => retry_later(),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod code_info;
pub mod stack_walker;
pub mod thread;
pub mod walker;

mod continuation;
mod error;
mod stats;

// Re-exports for convenient access
pub use capture::{CaptureStatus, ContinuationCapture, is_capture_in_progress};
pub use code_info::{
    CallSite, CodeImage, CodeImageBuilder, CodeInfo, CodeInfoTable, FrameMetadata,
    FrameMetadataResolver,
};
pub use continuation::Continuation;
pub use error::CaptureError;
pub use stack_walker::CodeInfoStackWalker;
pub use stats::CaptureStats;
pub use thread::{
    AttachedThread, MutatorThread, StackBounds, ThreadId, ThreadRegistry, attach_current,
    current_thread,
};
pub use walker::{CodeInfoId, FrameKind, FrameVisitor, StackWalker, WalkStart, WalkedFrame};
