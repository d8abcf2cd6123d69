//! Stack walker over registered thread stacks.

use std::ops::ControlFlow;

use prism_gc::guarantee;

use crate::code_info::CodeInfoTable;
use crate::thread::{self, MutatorThread, ThreadRegistry};
use crate::walker::{FrameVisitor, StackWalker, WalkStart, WalkedFrame};

/// Size of a return address slot.
const RETURN_ADDRESS_SIZE: usize = 8;

/// Walks registered thread stacks using installed code metadata.
///
/// The return address of the frame at `sp` is the word just below `sp`; the
/// caller's frame starts at `sp + frame_size`. The walk stops at the first
/// return address outside installed code or when the next frame would leave
/// the thread's stack.
pub struct CodeInfoStackWalker<'a> {
    code: &'a CodeInfoTable,
    threads: &'a ThreadRegistry,
}

impl<'a> CodeInfoStackWalker<'a> {
    /// Create a walker over `threads` resolving code through `code`.
    pub fn new(code: &'a CodeInfoTable, threads: &'a ThreadRegistry) -> Self {
        Self { code, threads }
    }

    fn walk_from(&self, thread: &MutatorThread, mut sp: usize, visitor: &mut dyn FrameVisitor) {
        let bounds = thread.bounds;
        loop {
            let Some(slot) = sp.checked_sub(RETURN_ADDRESS_SIZE) else {
                return;
            };
            if !bounds.contains_range(slot, RETURN_ADDRESS_SIZE) {
                return;
            }
            // SAFETY: the slot lies inside the registered stack, which the
            // registration contract keeps readable.
            let ip = unsafe { (slot as *const usize).read_unaligned() };

            let Some(info) = self.code.lookup(ip) else {
                log::trace!("stack walk of thread {} ends at ip {ip:#x}", thread.id.0);
                return;
            };
            guarantee!(
                info.frame_size > 0,
                "code {:#x} has an empty frame",
                info.code_start
            );
            let size = info.frame_size as usize;
            if !bounds.contains_range(sp, size) {
                log::trace!(
                    "stack walk of thread {} leaves the stack at sp {sp:#x}",
                    thread.id.0
                );
                return;
            }

            let frame = WalkedFrame {
                sp,
                ip,
                code: info.id(),
                kind: info.kind,
            };
            if let ControlFlow::Break(()) = visitor.visit_frame(&frame) {
                return;
            }

            sp += size;
            if sp >= bounds.base {
                return;
            }
        }
    }
}

// SAFETY: every reported frame was checked to lie inside the registered
// stack, and registered stacks stay readable while registered.
unsafe impl StackWalker for CodeInfoStackWalker<'_> {
    fn walk(&self, start: WalkStart, visitor: &mut dyn FrameVisitor) {
        match start {
            WalkStart::Current { sp } => {
                let Some(thread) = thread::current_thread() else {
                    log::debug!("stack walk requested on a detached thread");
                    return;
                };
                self.walk_from(&thread, sp, visitor);
            }
            WalkStart::Thread(id) => {
                let Some(thread) = self.threads.get(id) else {
                    return;
                };
                let Some(sp) = thread.anchor() else {
                    log::debug!("stack walk of running thread {}", id.0);
                    return;
                };
                self.walk_from(&thread, sp, visitor);
            }
        }
    }
}
