//! Kernel error types.
//!
//! Every subsystem reports failures through its own typed error, collected
//! under [`KernelError`]. The kernel-call dispatcher is the only place that
//! translates these into the user-visible [`Errno`] table; everything below
//! it either handles an error or propagates it unchanged.

use core::fmt;

/// User-visible error numbers.
///
/// Returned to user space as the negated raw value in the kernel-call
/// result slot.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Operation not permitted
    Perm = 1,
    /// No such process
    Srch = 3,
    /// Resource temporarily unavailable
    Again = 11,
    /// Out of memory
    NoMem = 12,
    /// Bad address
    Fault = 14,
    /// Device or resource busy
    Busy = 16,
    /// Resource already exists
    Exist = 17,
    /// Invalid argument
    Inval = 22,
    /// Function not implemented
    NoSys = 38,
    /// Operation not supported
    NotSup = 95,
    /// No buffer space available
    NoBufs = 105,
}

impl Errno {
    /// Raw value as returned to user space (negative).
    pub const fn as_ret(self) -> isize {
        -(self as i32 as isize)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::Perm => "EPERM",
            Errno::Srch => "ESRCH",
            Errno::Again => "EAGAIN",
            Errno::NoMem => "ENOMEM",
            Errno::Fault => "EFAULT",
            Errno::Busy => "EBUSY",
            Errno::Exist => "EEXIST",
            Errno::Inval => "EINVAL",
            Errno::NoSys => "ENOSYS",
            Errno::NotSup => "ENOTSUP",
            Errno::NoBufs => "ENOBUFS",
        };
        write!(f, "{}", name)
    }
}

/// Frame allocator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// No free frame in the user range
    OutOfMemory,
    /// Frame number outside the DRAM window
    InvalidFrame,
    /// Frame is already allocated
    Busy,
    /// Frame is already free
    DoubleFree,
}

/// Kernel page pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KpoolError {
    /// All kernel pages are in use
    Exhausted,
    /// Address does not name a kernel pool page
    InvalidPage,
    /// Page is already free
    DoublePut,
}

/// MMU primitive errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// Target entry is already present
    Busy,
    /// Address is not page-aligned
    Misaligned,
    /// Walked entry is not present
    NotMapped,
}

/// Process and thread manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmError {
    /// Process or thread table is full
    TableFull,
    /// No entry with the given id (or the id is stale)
    NotFound,
    /// Operation does not apply to the entry in its current state
    InvalidState,
    /// Target is already detached or joined by someone else
    NotJoinable,
    /// Malformed executable image
    BadImage,
    /// Caller lacks the required identity
    NotPermitted,
}

/// Semaphore errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemError {
    /// Semaphore table is full
    TableFull,
    /// No semaphore with the given id
    NotFound,
    /// A semaphore with the given key already exists
    Exists,
    /// Invalid operation or value
    Invalid,
}

/// Exception service errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcpError {
    /// Exception number out of range
    InvalidNumber,
    /// A controller is already registered for this exception
    Busy,
    /// No faulting thread is pinned on this exception
    NothingPending,
}

/// Interrupt dispatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrError {
    /// Vector number out of range
    InvalidVector,
    /// A non-default handler is already installed
    Busy,
}

/// Umbrella error for cross-subsystem propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Frame(FrameError),
    Kpool(KpoolError),
    Mmu(MmuError),
    Pm(PmError),
    Sem(SemError),
    Excp(ExcpError),
    Intr(IntrError),
    /// Pointer argument failed the user-memory check
    BadAddress,
    /// Malformed argument that no subsystem ever saw
    InvalidArgument,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl From<FrameError> for KernelError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

impl From<KpoolError> for KernelError {
    fn from(err: KpoolError) -> Self {
        Self::Kpool(err)
    }
}

impl From<MmuError> for KernelError {
    fn from(err: MmuError) -> Self {
        Self::Mmu(err)
    }
}

impl From<PmError> for KernelError {
    fn from(err: PmError) -> Self {
        Self::Pm(err)
    }
}

impl From<SemError> for KernelError {
    fn from(err: SemError) -> Self {
        Self::Sem(err)
    }
}

impl From<ExcpError> for KernelError {
    fn from(err: ExcpError) -> Self {
        Self::Excp(err)
    }
}

impl From<IntrError> for KernelError {
    fn from(err: IntrError) -> Self {
        Self::Intr(err)
    }
}

/// The single internal-to-user translation point, used by the kernel-call
/// dispatcher.
impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Frame(FrameError::OutOfMemory) => Errno::NoMem,
            KernelError::Frame(FrameError::Busy) => Errno::Busy,
            KernelError::Frame(_) => Errno::Inval,
            KernelError::Kpool(KpoolError::Exhausted) => Errno::NoMem,
            KernelError::Kpool(_) => Errno::Inval,
            KernelError::Mmu(MmuError::Busy) => Errno::Busy,
            KernelError::Mmu(_) => Errno::Inval,
            KernelError::Pm(PmError::TableFull) => Errno::Again,
            KernelError::Pm(PmError::NotFound) => Errno::Srch,
            KernelError::Pm(PmError::NotPermitted) => Errno::Perm,
            KernelError::Pm(_) => Errno::Inval,
            KernelError::Sem(SemError::TableFull) => Errno::NoBufs,
            KernelError::Sem(SemError::Exists) => Errno::Exist,
            KernelError::Sem(SemError::NotFound) => Errno::Srch,
            KernelError::Sem(SemError::Invalid) => Errno::Inval,
            KernelError::Excp(ExcpError::Busy) => Errno::Busy,
            KernelError::Excp(_) => Errno::Inval,
            KernelError::Intr(IntrError::Busy) => Errno::Busy,
            KernelError::Intr(_) => Errno::Inval,
            KernelError::BadAddress => Errno::Fault,
            KernelError::InvalidArgument => Errno::Inval,
        }
    }
}

// Shorthand conversions for the kcall adapters, which consume subsystem
// errors directly.
impl From<FrameError> for Errno {
    fn from(err: FrameError) -> Self {
        Errno::from(KernelError::from(err))
    }
}

impl From<SemError> for Errno {
    fn from(err: SemError) -> Self {
        Errno::from(KernelError::from(err))
    }
}

impl From<ExcpError> for Errno {
    fn from(err: ExcpError) -> Self {
        Errno::from(KernelError::from(err))
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame allocator: {:?}", e),
            Self::Kpool(e) => write!(f, "kernel pool: {:?}", e),
            Self::Mmu(e) => write!(f, "mmu: {:?}", e),
            Self::Pm(e) => write!(f, "process manager: {:?}", e),
            Self::Sem(e) => write!(f, "semaphore: {:?}", e),
            Self::Excp(e) => write!(f, "exception service: {:?}", e),
            Self::Intr(e) => write!(f, "interrupt dispatch: {:?}", e),
            Self::BadAddress => write!(f, "bad user address"),
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_negative_on_return() {
        assert_eq!(Errno::Inval.as_ret(), -22);
        assert_eq!(Errno::Fault.as_ret(), -14);
        assert_eq!(Errno::NoSys.as_ret(), -38);
    }

    #[test]
    fn kernel_error_translates_once() {
        let e: KernelError = FrameError::OutOfMemory.into();
        assert_eq!(Errno::from(e), Errno::NoMem);
        let e: KernelError = PmError::TableFull.into();
        assert_eq!(Errno::from(e), Errno::Again);
        let e: KernelError = SemError::TableFull.into();
        assert_eq!(Errno::from(e), Errno::NoBufs);
    }
}
