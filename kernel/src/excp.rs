//! Exception service.
//!
//! Converts synchronous CPU faults into something user space can deal
//! with. Per exception number the action is either the default, which
//! terminates the faulting process with the exception recorded as the
//! cause, or controlled: the faulting thread is suspended with its
//! context pinned, a record is posted, and the controlling process
//! retrieves it with `excpwait` and decides between `excpresume` and a
//! kill.
//!
//! Page faults get one extra chance first: a fault in the guard page
//! right below the user stack grows the stack instead of raising
//! anything.

extern crate alloc;

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::error::ExcpError;
use crate::hal::interrupt::{ExceptionContext, EXCEPTIONS_NUM};
use crate::mm::VirtAddr;
use crate::pm::{process, sched, thread, Condvar, Tid};

/// `excpctrl` action: restore the default behavior.
pub const EXCP_ACTION_DEFAULT: usize = 0;
/// `excpctrl` action: deliver faults to the controlling process.
pub const EXCP_ACTION_HANDLE: usize = 1;

/// Exit-status base for processes killed by an exception.
pub const EXCP_STATUS_BASE: i32 = 128;

/// What to do when an exception arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcpAction {
    Default,
    Handled,
}

/// Record handed to the controlling process.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcpInfo {
    pub num: u32,
    pub addr: u32,
    pub pid: u32,
    pub tid: u32,
}

impl ExcpInfo {
    /// Size of the user-visible record.
    pub const SIZE: usize = 16;

    /// Encodes the record for the copy to user space.
    pub fn emit(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.num.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.addr.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.pid.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.tid.to_le_bytes());
        bytes
    }
}

const EXCEPTION_NAMES: [&str; 21] = [
    "division-by-zero error",
    "debug exception",
    "non-maskable interrupt",
    "breakpoint exception",
    "overflow exception",
    "bounds check exception",
    "invalid opcode exception",
    "coprocessor not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid task state segment",
    "segment not present",
    "stack segment fault",
    "general protection fault",
    "page fault",
    "floating point unit exception",
    "alignment check",
    "machine exception",
    "simd unit exception",
    "virtualization exception",
    "security exception",
];

/// Canonical name of exception `num`.
pub fn exception_name(num: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(usize::from(num))
        .copied()
        .unwrap_or("unknown exception")
}

struct ExcpState {
    actions: [ExcpAction; EXCEPTIONS_NUM],
    pending: VecDeque<ExcpInfo>,
    /// Faulting thread pinned per exception number, off the ready queue
    /// with its saved context frozen until resumed or killed.
    pinned: [Option<Tid>; EXCEPTIONS_NUM],
}

static STATE: Mutex<ExcpState> = Mutex::new(ExcpState {
    actions: [ExcpAction::Default; EXCEPTIONS_NUM],
    pending: VecDeque::new(),
    pinned: [None; EXCEPTIONS_NUM],
});

static AVAILABLE: Condvar = Condvar::new();

/// Chooses the action for exception `num`.
///
/// Claiming an already-claimed vector is busy; restoring the default
/// always succeeds and kills a thread still pinned on that vector.
pub fn excp_control(num: usize, action: usize) -> Result<(), ExcpError> {
    if num >= EXCEPTIONS_NUM {
        return Err(ExcpError::InvalidNumber);
    }

    match action {
        EXCP_ACTION_HANDLE => {
            let mut state = STATE.lock();
            if state.actions[num] == ExcpAction::Handled {
                return Err(ExcpError::Busy);
            }
            state.actions[num] = ExcpAction::Handled;
            Ok(())
        }
        EXCP_ACTION_DEFAULT => {
            let orphan = {
                let mut state = STATE.lock();
                state.actions[num] = ExcpAction::Default;
                state.pending.retain(|info| info.num != num as u32);
                state.pinned[num].take()
            };
            // Nobody is left to resume an orphaned faulter.
            if let Some(tid) = orphan {
                thread::set_pinned(tid, false).ok();
                if let Ok(pid) = thread::pid_of(tid) {
                    process::kill(pid, EXCP_STATUS_BASE + num as i32).ok();
                }
            }
            Ok(())
        }
        _ => Err(ExcpError::InvalidNumber),
    }
}

/// Blocks until an exception record arrives and returns it.
pub fn excp_wait() -> ExcpInfo {
    let mut state = STATE.lock();
    loop {
        if let Some(info) = state.pending.pop_front() {
            return info;
        }
        state = AVAILABLE.wait(&STATE, state);
    }
}

/// Resumes the thread pinned on exception `num`, restarting the faulting
/// instruction.
pub fn excp_resume(num: usize) -> Result<(), ExcpError> {
    if num >= EXCEPTIONS_NUM {
        return Err(ExcpError::InvalidNumber);
    }

    let tid = STATE.lock().pinned[num].take().ok_or(ExcpError::NothingPending)?;
    thread::set_pinned(tid, false).ok();
    if thread::wake_blocked(tid) {
        sched::push_ready(tid);
    }
    Ok(())
}

/// Entry point from the dispatch tables for vectors nobody claimed at the
/// HAL level.
pub fn forward(ctx: &ExceptionContext) {
    let num = usize::from(ctx.num);

    // Stack-growth triage: a guard-page fault is not an error.
    if num == 14 && ctx.user_mode {
        let grown = process::with_current_vmem(|vm| vm.grow_stack(VirtAddr::new(ctx.addr as u32)))
            .unwrap_or(false);
        if grown {
            return;
        }
    }

    if !ctx.user_mode {
        log::error!(
            "{} in kernel mode at {:#x} (addr {:#x})",
            exception_name(ctx.num),
            ctx.instruction,
            ctx.addr
        );
        crate::hal::kpanic("unhandled exception in kernel mode");
    }

    let action = STATE.lock().actions[num];
    match action {
        ExcpAction::Default => {
            log::warn!(
                "{} at {:#x}: terminating process",
                exception_name(ctx.num),
                ctx.instruction
            );
            if let Some(pid) = process::current_pid() {
                process::kill(pid, EXCP_STATUS_BASE + num as i32).ok();
            }
            sched::reschedule();
        }
        ExcpAction::Handled => {
            let me = sched::current().expect("user fault without a current thread");
            let pid = process::current_pid().map(|p| p.raw()).unwrap_or(0);

            thread::set_state(me, thread::ThreadState::Blocked).ok();
            thread::set_pinned(me, true).ok();
            sched::purge(me);

            {
                let mut state = STATE.lock();
                state.pinned[num] = Some(me);
                state.pending.push_back(ExcpInfo {
                    num: ctx.num as u32,
                    addr: ctx.addr as u32,
                    pid,
                    tid: me.raw(),
                });
            }
            AVAILABLE.signal();
            sched::reschedule();
        }
    }
}

/// Current action for exception `num`.
pub fn action_of(num: usize) -> Option<ExcpAction> {
    if num >= EXCEPTIONS_NUM {
        return None;
    }
    Some(STATE.lock().actions[num])
}

/// Number of undelivered exception records.
pub fn pending_count() -> usize {
    STATE.lock().pending.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_round_trip_restores_default() {
        excp_control(6, EXCP_ACTION_HANDLE).unwrap();
        assert_eq!(action_of(6), Some(ExcpAction::Handled));

        // Claiming a claimed vector is busy.
        assert_eq!(excp_control(6, EXCP_ACTION_HANDLE), Err(ExcpError::Busy));

        excp_control(6, EXCP_ACTION_DEFAULT).unwrap();
        assert_eq!(action_of(6), Some(ExcpAction::Default));
        excp_control(6, EXCP_ACTION_HANDLE).unwrap();
        excp_control(6, EXCP_ACTION_DEFAULT).unwrap();
    }

    #[test]
    fn bad_numbers_and_actions_are_rejected() {
        assert_eq!(
            excp_control(EXCEPTIONS_NUM, EXCP_ACTION_HANDLE),
            Err(ExcpError::InvalidNumber)
        );
        assert_eq!(excp_control(3, 99), Err(ExcpError::InvalidNumber));
        assert_eq!(excp_resume(EXCEPTIONS_NUM), Err(ExcpError::InvalidNumber));
    }

    #[test]
    fn resume_without_a_pinned_thread_fails() {
        assert_eq!(excp_resume(19), Err(ExcpError::NothingPending));
    }

    #[test]
    fn names_cover_the_architected_vectors() {
        assert_eq!(exception_name(0), "division-by-zero error");
        assert_eq!(exception_name(14), "page fault");
        assert_eq!(exception_name(31), "unknown exception");
    }

    #[test]
    fn info_encoding_is_stable() {
        let info = ExcpInfo {
            num: 14,
            addr: 0xdead_0000,
            pid: 0x101,
            tid: 0x202,
        };
        let bytes = info.emit();
        assert_eq!(&bytes[0..4], &14u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0xdead_0000u32.to_le_bytes());
    }
}
