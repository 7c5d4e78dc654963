//! Architecture layer.
//!
//! One ISA, one tree. Everything the rest of the kernel needs from the CPU
//! goes through the small facade below: interrupt masking, the halt loop,
//! and the x86_64 bring-up modules.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("this kernel targets x86_64 only");

pub mod x86_64;

/// Masks interrupts on this CPU.
pub fn interrupts_disable() {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::interrupts::disable();
}

/// Unmasks interrupts on this CPU.
pub fn interrupts_enable() {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::interrupts::enable();
}

/// Runs `f` with interrupts masked, restoring the previous state after.
///
/// This is the critical-section primitive: on a single CPU, masking the
/// local interrupt line is what makes a spinlocked section atomic against
/// the timer.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(target_os = "none")]
    {
        ::x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(not(target_os = "none"))]
    {
        f()
    }
}

/// Stops this CPU for good.
pub fn halt() -> ! {
    loop {
        #[cfg(target_os = "none")]
        ::x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Waits for the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::hlt();
}
