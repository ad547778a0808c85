mod arch;

use std::ffi::c_void;
use std::marker::PhantomData;

pub use self::arch::{FramePointerSource, NativeFrameSource};
use crate::callstack::CallStack;

/// Captures the call stack of the current thread.
///
/// Walking itself is delegated to the platform unwinder through `backtrace`;
/// only the anchor (the stack pointer of the capturing frame) is
/// architecture-specific. Frames at or below the anchor belong to the walker
/// and are never recorded.
pub struct StackWalker<S: FramePointerSource = NativeFrameSource> {
    source: PhantomData<S>,
}

impl StackWalker {
    pub const fn new() -> Self {
        Self {
            source: PhantomData,
        }
    }
}

impl<S: FramePointerSource> StackWalker<S> {
    /// Reads the anchor for a later [`StackWalker::capture_from`].
    #[inline(always)]
    pub fn anchor(&self) -> usize {
        S::stack_pointer()
    }

    /// Captures at most `max_frames` frames, starting at the caller.
    #[inline(always)]
    pub fn capture(&self, max_frames: usize) -> CallStack {
        let anchor = S::stack_pointer();
        let mut frames = Vec::with_capacity(max_frames.min(64));
        self.capture_from(anchor, max_frames, &mut frames);
        CallStack::from(frames)
    }

    /// Captures at most `max_frames` frames older than `anchor` into `out`.
    ///
    /// `out` is cleared first. The walk stops at `max_frames`, when the
    /// unwinder cannot go further, or at a zero program counter.
    #[inline(never)]
    pub fn capture_from(&self, anchor: usize, max_frames: usize, out: &mut Vec<usize>) {
        out.clear();
        if max_frames == 0 {
            return;
        }

        backtrace::trace(|frame| {
            let pc = frame.ip() as usize;
            if pc == 0 {
                return false;
            }
            let sp = frame.sp() as usize;
            if sp != 0 && sp < anchor {
                // still inside the walker
                return true;
            }
            out.push(pc);
            out.len() < max_frames
        });
    }
}

impl Default for StackWalker {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a captured program counter into the pointer `backtrace` expects.
pub(crate) fn pc_to_ptr(pc: usize) -> *mut c_void {
    pc as *mut c_void
}

#[cfg(test)]
mod test {

    use super::*;

    #[inline(never)]
    fn level_one(max: usize) -> CallStack {
        std::hint::black_box(level_two(max))
    }

    #[inline(never)]
    fn level_two(max: usize) -> CallStack {
        std::hint::black_box(StackWalker::new().capture(max))
    }

    fn names(stack: &CallStack) -> Vec<String> {
        let mut names = Vec::new();
        for pc in stack.iter() {
            backtrace::resolve(pc_to_ptr(*pc), |symbol| {
                if let Some(name) = symbol.name() {
                    names.push(format!("{name:#}"));
                }
            });
        }
        names
    }

    #[test]
    fn test_should_capture_callers() {
        let stack = level_one(64);
        assert!(!stack.is_empty());
        let names = names(&stack);
        assert!(names.iter().any(|name| name.ends_with("level_two")));
        assert!(names.iter().any(|name| name.ends_with("level_one")));
    }

    #[test]
    fn test_should_start_at_walker_caller() {
        let stack = level_one(64);
        let first = names(&CallStack::from(&stack[..1]));
        assert!(first.iter().any(|name| name.ends_with("level_two")));
    }

    #[test]
    fn test_should_exclude_walker_frames() {
        let names = names(&level_one(64));
        assert!(!names.iter().any(|name| name.contains("capture_from")));
    }

    #[test]
    fn test_should_respect_max_frames() {
        assert_eq!(level_one(2).len(), 2);
        assert!(level_one(0).is_empty());
    }
}
