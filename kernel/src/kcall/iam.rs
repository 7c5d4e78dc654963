//! Identity calls.

use crate::error::Errno;
use crate::pm::process;

use super::KcallResult;

pub(super) fn kcall_getuid() -> KcallResult {
    process::with_current_identity(|id| id.uid() as usize).map_err(|_| Errno::Srch)
}

pub(super) fn kcall_geteuid() -> KcallResult {
    process::with_current_identity(|id| id.euid() as usize).map_err(|_| Errno::Srch)
}

pub(super) fn kcall_getgid() -> KcallResult {
    process::with_current_identity(|id| id.gid() as usize).map_err(|_| Errno::Srch)
}

pub(super) fn kcall_getegid() -> KcallResult {
    process::with_current_identity(|id| id.egid() as usize).map_err(|_| Errno::Srch)
}

pub(super) fn kcall_setuid(uid: usize) -> KcallResult {
    let uid = u32::try_from(uid).map_err(|_| Errno::Inval)?;
    process::with_current_identity(|id| id.setuid(uid))
        .map_err(|_| Errno::Srch)?
        .map_err(|_| Errno::Perm)?;
    Ok(0)
}

pub(super) fn kcall_seteuid(euid: usize) -> KcallResult {
    let euid = u32::try_from(euid).map_err(|_| Errno::Inval)?;
    process::with_current_identity(|id| id.seteuid(euid))
        .map_err(|_| Errno::Srch)?
        .map_err(|_| Errno::Perm)?;
    Ok(0)
}

pub(super) fn kcall_setgid(gid: usize) -> KcallResult {
    let gid = u32::try_from(gid).map_err(|_| Errno::Inval)?;
    process::with_current_identity(|id| id.setgid(gid))
        .map_err(|_| Errno::Srch)?
        .map_err(|_| Errno::Perm)?;
    Ok(0)
}

pub(super) fn kcall_setegid(egid: usize) -> KcallResult {
    let egid = u32::try_from(egid).map_err(|_| Errno::Inval)?;
    process::with_current_identity(|id| id.setegid(egid))
        .map_err(|_| Errno::Srch)?
        .map_err(|_| Errno::Perm)?;
    Ok(0)
}
