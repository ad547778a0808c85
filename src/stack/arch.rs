//! The one architecture-specific primitive the stack walker needs.

/// Reads the stack pointer of the calling frame.
pub trait FramePointerSource {
    fn stack_pointer() -> usize;
}

/// The [`FramePointerSource`] of the architecture being compiled for.
pub struct NativeFrameSource;

#[cfg(target_arch = "x86_64")]
impl FramePointerSource for NativeFrameSource {
    #[inline(always)]
    fn stack_pointer() -> usize {
        let sp: usize;
        // SAFETY: copies a register, touches no memory.
        unsafe {
            std::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
        }
        sp
    }
}

#[cfg(target_arch = "x86")]
impl FramePointerSource for NativeFrameSource {
    #[inline(always)]
    fn stack_pointer() -> usize {
        let sp: usize;
        // SAFETY: copies a register, touches no memory.
        unsafe {
            std::arch::asm!("mov {}, esp", out(reg) sp, options(nomem, nostack, preserves_flags));
        }
        sp
    }
}

#[cfg(target_arch = "aarch64")]
impl FramePointerSource for NativeFrameSource {
    #[inline(always)]
    fn stack_pointer() -> usize {
        let sp: usize;
        // SAFETY: copies a register, touches no memory.
        unsafe {
            std::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
        }
        sp
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
compile_error!("Unsupported architecture - only x86, x86_64 and aarch64 are supported");
