//! Named semaphore calls.

use crate::error::Errno;
use crate::pm::{process, semaphore};

use super::KcallResult;

/// Create-or-open the semaphore behind `key`.
pub(super) fn kcall_semget(key: usize) -> KcallResult {
    let key = u32::try_from(key).map_err(|_| Errno::Inval)?;
    let pid = process::current_pid().ok_or(Errno::Srch)?;
    let id = semaphore::semget(key, pid)?;
    Ok(id)
}

/// Applies a signed operation: negative downs, positive ups.
pub(super) fn kcall_semop(id: usize, op: usize) -> KcallResult {
    let op = op as isize;
    let op = i32::try_from(op).map_err(|_| Errno::Inval)?;
    semaphore::semop(id, op)?;
    Ok(0)
}

/// Control operations: GETVAL, SETVAL, RMID.
pub(super) fn kcall_semctl(id: usize, cmd: usize, val: usize) -> KcallResult {
    let value = semaphore::semctl(id, cmd, val)?;
    Ok(value)
}
