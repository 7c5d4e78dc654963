//! Boot module introspection.

use crate::error::Errno;
use crate::kmod::{self, KMOD_CMDLINE_MAX};

use super::KcallResult;

/// User-visible module record: start, end, command line.
const KMOD_INFO_SIZE: usize = 8 + KMOD_CMDLINE_MAX;

/// Copies information on the `index`-th kernel module to the caller.
pub(super) fn kcall_kmod_get(index: usize, info: usize) -> KcallResult {
    if info == 0 {
        return Err(Errno::Inval);
    }
    super::user_addr(info, KMOD_INFO_SIZE)?;

    let module = kmod::kmod_get(index).ok_or(Errno::Inval)?;

    let mut out = [0u8; KMOD_INFO_SIZE];
    out[0..4].copy_from_slice(&module.start.to_le_bytes());
    out[4..8].copy_from_slice(&module.end.to_le_bytes());
    out[8..].copy_from_slice(module.cmdline_bytes());

    super::copy_to_user(info, &out)?;
    Ok(0)
}
