//! Capture errors.

use prism_gc::AllocError;
use thiserror::Error;

/// Recoverable capture failures.
///
/// A capture that runs into another capture is not an error: it reports
/// `CaptureStatus::Yielding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The stored continuation could not be allocated.
    #[error("failed to allocate stored continuation: {0}")]
    Allocation(#[from] AllocError),
    /// The captured range does not fit the 32-bit payload size field.
    #[error("captured stack of {frame_bytes} bytes in {frame_count} frames is too large")]
    TooLarge {
        /// Number of frames walked.
        frame_count: usize,
        /// Total frame bytes.
        frame_bytes: usize,
    },
}
