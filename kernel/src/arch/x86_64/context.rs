//! Execution contexts and the context switch.
//!
//! A [`Context`] freezes where a thread last left kernel mode: its kernel
//! stack pointer (the callee-saved registers live in the switch frame that
//! pointer addresses), the root of its address space, and, for threads
//! that have never run, the entry state the first dispatch jumps to.
//!
//! The contract of [`context_switch`]: on return, execution resumes where
//! `to` last invoked `context_switch`, with all registers and the page
//! directory as they were at that point.

/// Frozen per-thread execution state.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// Saved kernel stack pointer; the switch frame lives at this address.
    pub rsp: u64,
    /// Page-directory root to activate; 0 keeps the current one.
    pub pgdir: u64,
    /// First-dispatch entry point (kernel trampoline or user rip).
    pub entry: u64,
    /// First-dispatch stack (user rsp for ring-3 threads).
    pub stack: u64,
    /// First-dispatch argument registers.
    pub arg0: u64,
    pub arg1: u64,
    /// Whether the first dispatch lands in ring 3.
    pub user: bool,
}

impl Context {
    pub const fn empty() -> Self {
        Self {
            rsp: 0,
            pgdir: 0,
            entry: 0,
            stack: 0,
            arg0: 0,
            arg1: 0,
            user: false,
        }
    }

    /// Context for a kernel thread entering `entry`.
    pub fn kernel(entry: u64) -> Self {
        Self {
            rsp: 0,
            pgdir: 0,
            entry,
            stack: 0,
            arg0: 0,
            arg1: 0,
            user: false,
        }
    }

    /// Context for a thread whose first dispatch lands at `entry` in
    /// ring 3 on `stack`, in the address space rooted at `pgdir`.
    pub fn user(entry: u64, stack: u64, pgdir: u64) -> Self {
        Self {
            rsp: 0,
            pgdir,
            entry,
            stack,
            arg0: 0,
            arg1: 0,
            user: true,
        }
    }

    /// Ring-3 context carrying two argument registers, for trampolines of
    /// the shape `caller(start, arg)`.
    pub fn user_call(entry: u64, stack: u64, pgdir: u64, arg0: u64, arg1: u64) -> Self {
        Self {
            rsp: 0,
            pgdir,
            entry,
            stack,
            arg0,
            arg1,
            user: true,
        }
    }

    /// Forges the switch frame on a fresh kernel stack so the first
    /// dispatch of this context lands in `trampoline`.
    pub fn prepare_first_dispatch(&mut self, kstack_top: u64, trampoline: extern "C" fn() -> !) {
        #[cfg(target_os = "none")]
        {
            // Layout must mirror the pop sequence in `context_switch`:
            // r15 r14 r13 r12 rbx rbp rflags, then ret into the
            // trampoline.
            let frame: [u64; 8] = [
                0,
                0,
                0,
                0,
                0,
                0,
                0x202, // IF set
                trampoline as usize as u64,
            ];
            let base = kstack_top - 64;
            // SAFETY: the caller hands us the top of an exclusively owned,
            // writable kernel stack page; the 64-byte frame fits below it.
            unsafe {
                core::ptr::copy_nonoverlapping(frame.as_ptr(), base as *mut u64, frame.len());
            }
            self.rsp = base;
        }
        #[cfg(not(target_os = "none"))]
        {
            let _ = trampoline;
            self.rsp = kstack_top;
        }
    }
}

/// Switches from `from` to `to`.
///
/// Saves the callee-saved state of the caller, loads `to`, and switches
/// the page directory iff it differs. Returns when somebody switches back
/// to `from`.
///
/// # Safety
///
/// Both pointers must reference live contexts whose stacks and page
/// directories are valid, and interrupts must be masked across the call.
#[cfg(target_os = "none")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(from: *mut Context, to: *const Context) {
    core::arch::naked_asm!(
        // Save the caller's callee-saved state on its own stack.
        "pushfq",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        // Switch the page directory only when it actually changes.
        "mov rax, [rsi + 8]",
        "test rax, rax",
        "jz 2f",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        // Adopt the target stack and unwind its switch frame.
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "popfq",
        "ret",
    );
}

/// Drops to ring 3 at `entry` on `stack` via `iretq`, with `arg0` and
/// `arg1` in the argument registers.
///
/// # Safety
///
/// `entry` and `stack` must be mapped user-accessible in the current
/// address space.
#[cfg(target_os = "none")]
pub unsafe fn jump_to_user(entry: u64, stack: u64, arg0: u64, arg1: u64) -> ! {
    let selectors = super::gdt::selectors();
    let user_cs = u64::from(selectors.user_code.0);
    let user_ss = u64::from(selectors.user_data.0);

    // SAFETY: builds the architected iretq frame for a ring-3 return; the
    // caller guarantees the target state is valid.
    unsafe {
        core::arch::asm!(
            "push {ss}",
            "push {stack}",
            "push {rflags}",
            "push {cs}",
            "push {entry}",
            "iretq",
            ss = in(reg) user_ss,
            stack = in(reg) stack,
            rflags = in(reg) 0x202u64,
            cs = in(reg) user_cs,
            entry = in(reg) entry,
            in("rdi") arg0,
            in("rsi") arg1,
            options(noreturn)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_context_records_first_dispatch_state() {
        let ctx = Context::user(0x8000_0000, 0xc000_0000, 0x42000);
        assert!(ctx.user);
        assert_eq!(ctx.entry, 0x8000_0000);
        assert_eq!(ctx.stack, 0xc000_0000);
        assert_eq!(ctx.pgdir, 0x42000);
    }

    #[test]
    fn prepare_sets_the_stack_pointer() {
        extern "C" fn never() -> ! {
            unreachable!()
        }
        let mut ctx = Context::kernel(0x1234);
        ctx.prepare_first_dispatch(0x9000, never);
        assert_ne!(ctx.rsp, 0);
    }
}
