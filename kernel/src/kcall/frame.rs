//! Direct frame manipulation. Privileged.

use crate::error::Errno;
use crate::mm::{frame, FrameNumber, FRAME_NULL, PAGE_SHIFT, USER_BASE_PHYS};
use crate::pm::process;

use super::KcallResult;

fn require_privilege() -> Result<(), Errno> {
    let privileged = process::with_current_identity(|id| id.is_privileged())
        .map_err(|_| Errno::Srch)?;
    if !privileged {
        return Err(Errno::Perm);
    }
    Ok(())
}

/// Allocates one user frame for the caller.
pub(super) fn kcall_fralloc() -> KcallResult {
    require_privilege()?;

    let frame = frame::frame_alloc_any();
    if frame == FRAME_NULL {
        return Err(Errno::NoMem);
    }
    Ok(frame.as_u32() as usize)
}

/// Frees a frame previously handed out by `fralloc`.
pub(super) fn kcall_frfree(frame: usize) -> KcallResult {
    require_privilege()?;

    let frame = u32::try_from(frame).map_err(|_| Errno::Inval)?;
    // Kernel-reserved frames are not user business.
    if frame < USER_BASE_PHYS >> PAGE_SHIFT as u32 {
        return Err(Errno::Inval);
    }

    frame::frame_free(FrameNumber::new(frame))?;
    Ok(0)
}
