//! Exception service calls.

use crate::error::Errno;
use crate::excp::{self, ExcpInfo};

use super::KcallResult;

/// Controls which action to take when an exception happens.
pub(super) fn kcall_excpctrl(num: usize, action: usize) -> KcallResult {
    excp::excp_control(num, action)?;
    Ok(0)
}

/// Waits for an exception record and copies it out to the caller.
pub(super) fn kcall_excpwait(info: usize) -> KcallResult {
    if info == 0 {
        return Err(Errno::Inval);
    }
    super::user_addr(info, ExcpInfo::SIZE)?;

    let record = excp::excp_wait();
    super::copy_to_user(info, &record.emit())?;
    Ok(0)
}

/// Resumes the faulting thread pinned on `num`.
pub(super) fn kcall_excpresume(num: usize) -> KcallResult {
    excp::excp_resume(num)?;
    Ok(0)
}
