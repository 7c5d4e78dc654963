//! Test calls.
//!
//! Exercise the trap path end to end: each call validates the canonical
//! argument pattern and returns the sum of its arguments.

use crate::error::Errno;

use super::KcallResult;

pub(super) fn kcall_void0() -> KcallResult {
    Ok(0)
}

pub(super) fn kcall_void1(arg0: usize) -> KcallResult {
    if arg0 != 1 {
        return Err(Errno::Inval);
    }
    Ok(arg0)
}

pub(super) fn kcall_void2(arg0: usize, arg1: usize) -> KcallResult {
    if (arg0, arg1) != (1, 2) {
        return Err(Errno::Inval);
    }
    Ok(arg0 + arg1)
}

pub(super) fn kcall_void3(arg0: usize, arg1: usize, arg2: usize) -> KcallResult {
    if (arg0, arg1, arg2) != (1, 2, 3) {
        return Err(Errno::Inval);
    }
    Ok(arg0 + arg1 + arg2)
}

pub(super) fn kcall_void4(arg0: usize, arg1: usize, arg2: usize, arg3: usize) -> KcallResult {
    if (arg0, arg1, arg2, arg3) != (1, 2, 3, 4) {
        return Err(Errno::Inval);
    }
    Ok(arg0 + arg1 + arg2 + arg3)
}

pub(super) fn kcall_void5(
    arg0: usize,
    arg1: usize,
    arg2: usize,
    arg3: usize,
    arg4: usize,
) -> KcallResult {
    if (arg0, arg1, arg2, arg3, arg4) != (1, 2, 3, 4, 5) {
        return Err(Errno::Inval);
    }
    Ok(arg0 + arg1 + arg2 + arg3 + arg4)
}
