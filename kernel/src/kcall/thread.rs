//! Thread calls.

use crate::arch::x86_64::context::Context;
use crate::error::{Errno, KernelError, PmError};
use crate::mm::{VirtAddr, PAGE_SIZE, USER_STACK_TOP};
use crate::pm::{process, sched, thread, Tid};

use super::KcallResult;

/// Virtual span reserved per user thread stack, guard gap included.
const USER_STACK_SPAN: u32 = 16 * PAGE_SIZE as u32;

/// Creates a thread whose first dispatch lands in the user trampoline
/// `caller(start, arg)` in ring 3.
pub(super) fn kcall_thread_create(start: usize, arg: usize, caller: usize) -> KcallResult {
    let start_va = super::user_addr(start, 1)?;
    let caller_va = super::user_addr(caller, 1)?;

    let pid = process::current_pid().ok_or(Errno::Srch)?;

    // Carve the next stack region below the initial one.
    let threads = process::thread_count_of(pid).map_err(|_| Errno::Srch)?;
    let stack_top = USER_STACK_TOP - threads as u32 * USER_STACK_SPAN;

    process::with_current_vmem(|vm| vm.attach_stack(VirtAddr::new(stack_top)))
        .map_err(|_| Errno::Srch)?
        .map_err(Errno::from)?;

    let pgdir_root =
        process::with_current_vmem(|vm| vm.pgdir() as *const _ as u64).map_err(|_| Errno::Srch)?;

    let ctx = Context::user_call(
        u64::from(caller_va.as_u32()),
        u64::from(stack_top),
        pgdir_root,
        u64::from(start_va.as_u32()),
        arg as u64,
    );

    let tid = thread::spawn(pid, ctx)?;
    process::note_thread_created(pid, tid);
    Ok(tid.raw() as usize)
}

/// Terminates the calling thread; does not return.
pub(super) fn kcall_thread_exit(retval: usize) -> KcallResult {
    thread::exit_current(retval)
}

pub(super) fn kcall_thread_yield() -> KcallResult {
    sched::yield_now();
    Ok(0)
}

/// Blocks until the target exits, stores its retval when asked to, and
/// reaps it.
pub(super) fn kcall_thread_join(tid: usize, retval_ptr: usize) -> KcallResult {
    let tid = Tid::from_raw(u32::try_from(tid).map_err(|_| Errno::Inval)?);

    if retval_ptr != 0 {
        super::user_addr(retval_ptr, 4)?;
    }

    let retval = thread::join(tid).map_err(|e| match e {
        KernelError::Pm(PmError::NotFound) => Errno::Srch,
        KernelError::Pm(PmError::NotJoinable) => Errno::Inval,
        KernelError::Pm(PmError::InvalidState) => Errno::Inval,
        other => Errno::from(other),
    })?;

    if retval_ptr != 0 {
        super::copy_to_user(retval_ptr, &(retval as u32).to_le_bytes())?;
    }
    Ok(0)
}

pub(super) fn kcall_thread_detach(tid: usize) -> KcallResult {
    let tid = Tid::from_raw(u32::try_from(tid).map_err(|_| Errno::Inval)?);
    thread::detach(tid)?;
    Ok(0)
}

pub(super) fn kcall_thread_get_id() -> KcallResult {
    let tid = thread::thread_get_id().ok_or(Errno::Srch)?;
    Ok(tid.raw() as usize)
}
