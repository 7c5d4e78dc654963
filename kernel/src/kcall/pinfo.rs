//! Process self-introspection.

use crate::error::Errno;
use crate::pm::{process, sched};

use super::KcallResult;

/// User-visible record: pid, tid, address-space root.
const PINFO_SIZE: usize = 12;

/// Copies the caller's pid, tid, and address-space root to `out`.
pub(super) fn kcall_pinfo(out: usize) -> KcallResult {
    if out == 0 {
        return Err(Errno::Inval);
    }
    super::user_addr(out, PINFO_SIZE)?;

    let pid = process::current_pid().ok_or(Errno::Srch)?;
    let tid = sched::current().ok_or(Errno::Srch)?;
    let vmem = process::with_current_vmem(|vm| vm.pgdir() as *const _ as usize as u32)
        .unwrap_or(0);

    let mut bytes = [0u8; PINFO_SIZE];
    bytes[0..4].copy_from_slice(&pid.raw().to_le_bytes());
    bytes[4..8].copy_from_slice(&tid.raw().to_le_bytes());
    bytes[8..12].copy_from_slice(&vmem.to_le_bytes());

    super::copy_to_user(out, &bytes)?;
    Ok(0)
}
