//! Process table and lifecycle.
//!
//! Processes live in a bounded arena guarded by one spin lock. A process
//! is created from a flat in-memory executable image: a fresh address
//! space copying the kernel half of the root directory, the image's text
//! and data copied into user frames, a stack at the canonical top of user
//! memory, and one thread entering the image in ring 3.

extern crate alloc;

use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::arch::x86_64::context::Context;
use crate::error::{KernelResult, PmError};
use crate::mm::{self, vmem::Virtmem, VirtAddr, PAGE_SIZE, USER_BASE_VIRT, USER_STACK_TOP};
use crate::pm::{sched, semaphore, thread, Identity, Pid, Tid, PROCESS_MAX};

/// Magic of the flat executable image format.
pub const IMAGE_MAGIC: u32 = 0x0b51_d1a0;

/// Header of a flat executable image: magic, absolute entry point, and
/// the text and data extents that follow the header back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub entry: u32,
    pub text_size: u32,
    pub data_size: u32,
}

impl ImageHeader {
    /// Header size in the blob.
    pub const SIZE: usize = 16;

    /// Reads and validates the boot-contract header.
    pub fn parse(image: &[u8]) -> Result<Self, PmError> {
        if image.len() < Self::SIZE {
            return Err(PmError::BadImage);
        }

        let word =
            |at: usize| u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]]);
        if word(0) != IMAGE_MAGIC {
            return Err(PmError::BadImage);
        }

        let header = Self {
            entry: word(4),
            text_size: word(8),
            data_size: word(12),
        };

        let payload = (header.text_size as usize).checked_add(header.data_size as usize);
        match payload {
            Some(payload) if Self::SIZE + payload <= image.len() => {}
            _ => return Err(PmError::BadImage),
        }

        // The entry point must land inside the text segment.
        if header.text_size == 0
            || header.entry < USER_BASE_VIRT
            || header.entry >= USER_BASE_VIRT + header.text_size
        {
            return Err(PmError::BadImage);
        }

        Ok(header)
    }

    /// Emits the header bytes; the encoder half of the boot contract,
    /// used by image-building tooling.
    pub fn emit(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.entry.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.text_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.data_size.to_le_bytes());
        bytes
    }

    /// First virtual address of the data segment.
    pub fn data_base(&self) -> u32 {
        USER_BASE_VIRT + align_up(self.text_size)
    }
}

fn align_up(size: u32) -> u32 {
    (size + PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1)
}

/// Process states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    New,
    Running,
    Blocked,
    Zombie,
}

struct ProcessSlot {
    generation: u32,
    live: bool,
    state: ProcState,
    parent: Option<Pid>,
    identity: Identity,
    vmem: Option<Virtmem>,
    exit_status: i32,
    threads: Vec<Tid>,
    initial_thread: Option<Tid>,
}

impl ProcessSlot {
    const fn empty() -> Self {
        Self {
            generation: 0,
            live: false,
            state: ProcState::New,
            parent: None,
            identity: Identity::root(),
            vmem: None,
            exit_status: 0,
            threads: Vec::new(),
            initial_thread: None,
        }
    }
}

static PROCESSES: Mutex<[ProcessSlot; PROCESS_MAX]> =
    Mutex::new([const { ProcessSlot::empty() }; PROCESS_MAX]);

static BOOTED: AtomicBool = AtomicBool::new(false);

fn slot_of<'a>(
    table: &'a mut [ProcessSlot; PROCESS_MAX],
    pid: Pid,
) -> Result<&'a mut ProcessSlot, PmError> {
    let slot = table.get_mut(pid.index()).ok_or(PmError::NotFound)?;
    if !slot.live || slot.generation != pid.generation() {
        return Err(PmError::NotFound);
    }
    Ok(slot)
}

extern "C" fn idle_main() -> ! {
    loop {
        crate::arch::wait_for_interrupt();
    }
}

/// Creates the kernel process and its idle thread and hands the CPU
/// bookkeeping to the scheduler. Idempotent.
pub fn init() {
    if BOOTED.swap(true, Ordering::AcqRel) {
        return;
    }

    let pid = {
        let mut table = PROCESSES.lock();
        let slot = &mut table[0];
        slot.generation += 1;
        slot.live = true;
        slot.state = ProcState::Running;
        slot.parent = None;
        slot.identity = Identity::root();
        slot.vmem = None;
        slot.threads = Vec::new();
        slot.initial_thread = None;
        Pid::pack(0, slot.generation)
    };

    let idle = thread::create(pid, Context::kernel(idle_main as usize as u64))
        .expect("creating the idle thread");
    sched::adopt_boot_thread(idle);

    let mut table = PROCESSES.lock();
    if let Ok(slot) = slot_of(&mut table, pid) {
        slot.threads.push(idle);
        slot.initial_thread = Some(idle);
    }
}

/// Creates a process from a flat executable image.
pub fn create(image: &[u8]) -> KernelResult<Pid> {
    let header = ImageHeader::parse(image)?;

    let parent = current_pid();
    let identity = parent
        .and_then(|pid| identity_of(pid).ok())
        .unwrap_or(Identity::root());

    let pid = {
        let mut table = PROCESSES.lock();
        let mut claimed = None;
        for (index, slot) in table.iter_mut().enumerate() {
            if slot.live {
                continue;
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.live = true;
            slot.state = ProcState::New;
            slot.parent = parent;
            slot.identity = identity;
            slot.vmem = None;
            slot.exit_status = 0;
            slot.threads = Vec::new();
            slot.initial_thread = None;
            claimed = Some(Pid::pack(index, slot.generation));
            break;
        }
        claimed.ok_or(PmError::TableFull)?
    };

    match build_address_space(&header, image) {
        Ok(vm) => {
            let pgdir_root = vm.pgdir() as *const _ as u64;
            let ctx = Context::user(
                u64::from(header.entry),
                u64::from(USER_STACK_TOP),
                pgdir_root,
            );

            match thread::spawn(pid, ctx) {
                Ok(tid) => {
                    let mut table = PROCESSES.lock();
                    if let Ok(slot) = slot_of(&mut table, pid) {
                        slot.vmem = Some(vm);
                        slot.threads.push(tid);
                        slot.initial_thread = Some(tid);
                        slot.state = ProcState::Running;
                    }
                    log::info!("spawned process {} (entry {:#x})", pid, header.entry);
                    Ok(pid)
                }
                Err(e) => {
                    release_slot(pid);
                    Err(e)
                }
            }
        }
        Err(e) => {
            release_slot(pid);
            Err(e)
        }
    }
}

fn build_address_space(header: &ImageHeader, image: &[u8]) -> KernelResult<Virtmem> {
    let mut vm = Virtmem::create(mm::root_pgdir());

    let text = &image[ImageHeader::SIZE..ImageHeader::SIZE + header.text_size as usize];
    let data_start = ImageHeader::SIZE + header.text_size as usize;
    let data = &image[data_start..data_start + header.data_size as usize];

    map_segment(&mut vm, USER_BASE_VIRT, text, false, true)?;
    if !data.is_empty() {
        map_segment(&mut vm, header.data_base(), data, true, false)?;
    }
    vm.attach_stack(VirtAddr::new(USER_STACK_TOP))?;

    Ok(vm)
}

fn map_segment(
    vm: &mut Virtmem,
    base: u32,
    bytes: &[u8],
    writable: bool,
    executable: bool,
) -> KernelResult<()> {
    let mut mapped = 0;
    while mapped < bytes.len() {
        vm.map_page(VirtAddr::new(base + mapped as u32), writable, executable)?;
        mapped += PAGE_SIZE;
    }
    vm.write_bytes(VirtAddr::new(base), bytes)
}

fn release_slot(pid: Pid) {
    let mut table = PROCESSES.lock();
    if let Ok(slot) = slot_of(&mut table, pid) {
        slot.live = false;
        slot.vmem = None;
    }
}

/// The calling thread's process.
pub fn current_pid() -> Option<Pid> {
    sched::current().and_then(|tid| thread::pid_of(tid).ok())
}

/// Kills `pid` with `status`: every thread exits, the address space and
/// semaphore references go away, and the slot lingers as a zombie until
/// the initial thread is reaped.
///
/// When the calling thread belongs to `pid` the caller must not expect to
/// run on; it is left EXITED and the next reschedule never comes back.
pub fn kill(pid: Pid, status: i32) -> Result<(), PmError> {
    let tids = {
        let mut table = PROCESSES.lock();
        let slot = slot_of(&mut table, pid)?;
        slot.state = ProcState::Zombie;
        slot.exit_status = status;
        let vm = slot.vmem.take();
        let tids = slot.threads.clone();
        drop(table);
        // Frees user frames and page tables outside the table lock.
        drop(vm);
        tids
    };

    semaphore::drop_process(pid);
    for tid in tids {
        thread::finish(tid, status as usize);
    }
    Ok(())
}

/// Terminates the calling process; never returns.
pub fn exit_current(status: i32) -> ! {
    let pid = current_pid().expect("process exit outside a process");
    log::info!("process {} exiting with status {}", pid, status);
    kill(pid, status).ok();
    sched::reschedule();
    crate::hal::kpanic("exited process kept running");
}

/// Number of threads a process currently has.
pub fn thread_count_of(pid: Pid) -> Result<usize, PmError> {
    let mut table = PROCESSES.lock();
    slot_of(&mut table, pid).map(|slot| slot.threads.len())
}

/// Records a thread created into an existing process.
pub(crate) fn note_thread_created(pid: Pid, tid: Tid) {
    let mut table = PROCESSES.lock();
    if let Ok(slot) = slot_of(&mut table, pid) {
        slot.threads.push(tid);
    }
}

/// Thread-exit bookkeeping: the last thread turns the process into a
/// zombie.
pub(crate) fn note_thread_exit(pid: Pid, tid: Tid, retval: usize) {
    let vm = {
        let mut table = PROCESSES.lock();
        let Ok(slot) = slot_of(&mut table, pid) else {
            return;
        };
        slot.threads.retain(|&t| t != tid);
        if slot.threads.is_empty() && slot.state == ProcState::Running {
            slot.state = ProcState::Zombie;
            slot.exit_status = retval as i32;
            slot.vmem.take()
        } else {
            None
        }
    };
    drop(vm);
}

/// Reap bookkeeping: a zombie whose initial thread was reaped frees its
/// slot (the pid goes stale).
pub(crate) fn note_thread_reaped(pid: Pid, tid: Tid) {
    let mut table = PROCESSES.lock();
    let Ok(slot) = slot_of(&mut table, pid) else {
        return;
    };
    if slot.state == ProcState::Zombie
        && slot.initial_thread == Some(tid)
        && slot.threads.is_empty()
    {
        slot.live = false;
        slot.vmem = None;
    }
}

/// Runs `f` on the calling process's identity.
pub fn with_current_identity<R>(f: impl FnOnce(&mut Identity) -> R) -> Result<R, PmError> {
    let pid = current_pid().ok_or(PmError::NotFound)?;
    let mut table = PROCESSES.lock();
    let slot = slot_of(&mut table, pid)?;
    Ok(f(&mut slot.identity))
}

/// Runs `f` on the calling process's address space. The kernel process
/// has none.
pub fn with_current_vmem<R>(f: impl FnOnce(&mut Virtmem) -> R) -> Result<R, PmError> {
    let pid = current_pid().ok_or(PmError::NotFound)?;
    let mut table = PROCESSES.lock();
    let slot = slot_of(&mut table, pid)?;
    let vm = slot.vmem.as_mut().ok_or(PmError::InvalidState)?;
    Ok(f(vm))
}

/// Identity snapshot of a process.
pub fn identity_of(pid: Pid) -> Result<Identity, PmError> {
    let mut table = PROCESSES.lock();
    slot_of(&mut table, pid).map(|slot| slot.identity)
}

pub fn state_of(pid: Pid) -> Result<ProcState, PmError> {
    let mut table = PROCESSES.lock();
    slot_of(&mut table, pid).map(|slot| slot.state)
}

pub fn exit_status(pid: Pid) -> Result<i32, PmError> {
    let mut table = PROCESSES.lock();
    slot_of(&mut table, pid).map(|slot| slot.exit_status)
}

pub fn parent_of(pid: Pid) -> Result<Option<Pid>, PmError> {
    let mut table = PROCESSES.lock();
    slot_of(&mut table, pid).map(|slot| slot.parent)
}

/// The thread whose retval carries the exit status.
pub fn initial_thread(pid: Pid) -> Result<Option<Tid>, PmError> {
    let mut table = PROCESSES.lock();
    slot_of(&mut table, pid).map(|slot| slot.initial_thread)
}

/// Number of live processes.
pub fn process_count() -> usize {
    PROCESSES.lock().iter().filter(|slot| slot.live).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(entry_off: u32, text: &[u8], data: &[u8]) -> Vec<u8> {
        let header = ImageHeader {
            entry: USER_BASE_VIRT + entry_off,
            text_size: text.len() as u32,
            data_size: data.len() as u32,
        };
        let mut blob = header.emit().to_vec();
        blob.extend_from_slice(text);
        blob.extend_from_slice(data);
        blob
    }

    #[test]
    fn header_round_trips() {
        let blob = image(4, &[0x90; 32], b"payload");
        let header = ImageHeader::parse(&blob).unwrap();
        assert_eq!(header.entry, USER_BASE_VIRT + 4);
        assert_eq!(header.text_size, 32);
        assert_eq!(header.data_size, 7);
        assert_eq!(header.emit()[..], blob[..ImageHeader::SIZE]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut blob = image(0, &[0x90; 16], &[]);
        blob[0] ^= 0xff;
        assert_eq!(ImageHeader::parse(&blob), Err(PmError::BadImage));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut blob = image(0, &[0x90; 64], &[]);
        blob.truncate(ImageHeader::SIZE + 8);
        assert_eq!(ImageHeader::parse(&blob), Err(PmError::BadImage));
    }

    #[test]
    fn entry_outside_text_is_rejected() {
        let header = ImageHeader {
            entry: USER_BASE_VIRT + 0x100,
            text_size: 0x10,
            data_size: 0,
        };
        let mut blob = header.emit().to_vec();
        blob.extend_from_slice(&[0x90; 0x10]);
        assert_eq!(ImageHeader::parse(&blob), Err(PmError::BadImage));
    }

    #[test]
    fn data_base_is_page_aligned_after_text() {
        let header = ImageHeader {
            entry: USER_BASE_VIRT,
            text_size: PAGE_SIZE as u32 + 1,
            data_size: 4,
        };
        assert_eq!(header.data_base(), USER_BASE_VIRT + 2 * PAGE_SIZE as u32);
    }
}
