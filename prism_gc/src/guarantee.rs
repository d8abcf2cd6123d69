//! Always-on invariant checks.
//!
//! A failed guarantee means a collaborator broke a precondition the collector
//! relies on (a corrupt frame walk, a mismatched reference map, an object
//! whose size disagrees with its contents). Continuing would let the
//! collector misread memory, so the failure is logged and the thread panics.
//! Release builds use `panic = "abort"`, which turns this into process
//! termination.
//!
//! Unlike `debug_assert!`, guarantees are compiled into every build.

use std::fmt;

/// Check a condition that must hold in every build.
///
/// # Example
///
/// ```ignore
/// prism_gc::guarantee!(end <= root_sp, "frame end {:#x} crosses root {:#x}", end, root_sp);
/// ```
#[macro_export]
macro_rules! guarantee {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::guarantee::fail(format_args!("{}", stringify!($cond)))
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::guarantee::fail(format_args!($($arg)+))
        }
    };
}

/// Report a failed guarantee and never return.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fail(message: fmt::Arguments<'_>) -> ! {
    log::error!("guarantee failed: {message}");
    panic!("guarantee failed: {message}");
}
