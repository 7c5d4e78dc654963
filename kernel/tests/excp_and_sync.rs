//! Exception service and synchronization end to end on the host build:
//! stack growth, default kill, the controlled wait/resume protocol, and
//! named semaphores through the kernel-call dispatcher.

use obsidian_kernel::error::Errno;
use obsidian_kernel::excp;
use obsidian_kernel::hal::interrupt::ExceptionContext;
use obsidian_kernel::kargs::Kargs;
use obsidian_kernel::kcall;
use obsidian_kernel::mm::{self, PAGE_SIZE, USER_BASE_VIRT, USER_STACK_TOP};
use obsidian_kernel::pm::{process, sched, semaphore, thread};

const KCALL_SEMGET: usize = 15;
const KCALL_SEMOP: usize = 16;
const KCALL_SEMCTL: usize = 17;
const KCALL_EXCPCTRL: usize = 20;
const KCALL_EXCPRESUME: usize = 22;

const PAGE_FAULT: u8 = 14;
const INVALID_OPCODE: u8 = 6;

fn fault(num: u8, addr: u32) -> ExceptionContext {
    ExceptionContext {
        num,
        instruction: u64::from(USER_BASE_VIRT),
        addr: u64::from(addr),
        error_code: 0,
        user_mode: true,
    }
}

fn tiny_image() -> Vec<u8> {
    let header = process::ImageHeader {
        entry: USER_BASE_VIRT,
        text_size: 16,
        data_size: 0,
    };
    let mut blob = header.emit().to_vec();
    blob.extend_from_slice(&[0x90; 16]);
    blob
}

#[test]
fn exceptions_and_semaphores() {
    obsidian_kernel::boot(Kargs::new(0, mm::MEMORY_SIZE as u32));

    // --- named semaphores as a mutex ------------------------------------

    let id = kcall::dispatch(KCALL_SEMGET, [77, 0, 0, 0, 0, 0]);
    assert!(id >= 0);
    let id = id as usize;

    // Opening the same key lands on the same semaphore.
    assert_eq!(kcall::dispatch(KCALL_SEMGET, [77, 0, 0, 0, 0, 0]), id as isize);

    // Two workers, 1000 up/down pairs each around a shared counter.
    let mut counter = 0u32;
    for _ in 0..2 {
        for _ in 0..1000 {
            assert_eq!(
                kcall::dispatch(KCALL_SEMOP, [id, (-1isize) as usize, 0, 0, 0, 0]),
                0
            );
            counter += 1;
            assert_eq!(kcall::dispatch(KCALL_SEMOP, [id, 1, 0, 0, 0, 0]), 0);
        }
    }
    assert_eq!(counter, 2000);
    assert_eq!(
        kcall::dispatch(KCALL_SEMCTL, [id, semaphore::SEM_GETVAL, 0, 0, 0, 0]),
        1
    );

    // Zero is not an operation.
    assert_eq!(
        kcall::dispatch(KCALL_SEMOP, [id, 0, 0, 0, 0, 0]),
        Errno::Inval.as_ret()
    );

    assert_eq!(kcall::dispatch(KCALL_SEMCTL, [id, semaphore::SEM_RMID, 0, 0, 0, 0]), 0);
    assert_eq!(
        kcall::dispatch(KCALL_SEMOP, [id, 1, 0, 0, 0, 0]),
        Errno::Srch.as_ret()
    );

    // --- page-fault triage: stack growth --------------------------------

    let victim = process::create(&tiny_image()).unwrap();
    sched::yield_now();
    let victim_tid = sched::current().unwrap();
    assert_eq!(process::current_pid(), Some(victim));

    let guard_addr = USER_STACK_TOP - PAGE_SIZE as u32 - 16;
    excp::forward(&fault(PAGE_FAULT, guard_addr));

    // Still alive, one page deeper.
    assert_eq!(thread::state_of(victim_tid), Ok(thread::ThreadState::Running));
    let grown = process::with_current_vmem(|vm| {
        vm.resolve(mm::VirtAddr::new(USER_STACK_TOP - 2 * PAGE_SIZE as u32))
            .is_some()
    })
    .unwrap();
    assert!(grown);

    // --- page-fault triage: the kill path -------------------------------

    excp::forward(&fault(PAGE_FAULT, 0));

    assert_eq!(thread::state_of(victim_tid), Ok(thread::ThreadState::Exited));
    assert_eq!(process::state_of(victim), Ok(process::ProcState::Zombie));
    assert_eq!(
        process::exit_status(victim),
        Ok(excp::EXCP_STATUS_BASE + i32::from(PAGE_FAULT))
    );
    // The parent observes the cause through join.
    assert_eq!(
        thread::join(victim_tid),
        Ok((excp::EXCP_STATUS_BASE + i32::from(PAGE_FAULT)) as usize)
    );

    // --- controlled exceptions: wait and resume -------------------------

    assert_eq!(
        kcall::dispatch(KCALL_EXCPCTRL, [INVALID_OPCODE as usize, excp::EXCP_ACTION_HANDLE, 0, 0, 0, 0]),
        0
    );
    // Claiming a claimed vector is busy.
    assert_eq!(
        kcall::dispatch(KCALL_EXCPCTRL, [INVALID_OPCODE as usize, excp::EXCP_ACTION_HANDLE, 0, 0, 0, 0]),
        Errno::Busy.as_ret()
    );

    let controlled = process::create(&tiny_image()).unwrap();
    sched::yield_now();
    let controlled_tid = sched::current().unwrap();
    assert_eq!(process::current_pid(), Some(controlled));

    excp::forward(&fault(INVALID_OPCODE, 0));

    // The faulting thread is suspended, pinned, and off the ready queue.
    assert_eq!(
        thread::state_of(controlled_tid),
        Ok(thread::ThreadState::Blocked)
    );
    assert!(!sched::ready_contains(controlled_tid));
    assert_eq!(excp::pending_count(), 1);

    // The controller picks up the record.
    let info = excp::excp_wait();
    assert_eq!(info.num, u32::from(INVALID_OPCODE));
    assert_eq!(info.tid, controlled_tid.raw());
    assert_eq!(info.pid, controlled.raw());

    // Resume restarts the faulter.
    assert_eq!(
        kcall::dispatch(KCALL_EXCPRESUME, [INVALID_OPCODE as usize, 0, 0, 0, 0, 0]),
        0
    );
    assert_eq!(
        thread::state_of(controlled_tid),
        Ok(thread::ThreadState::Ready)
    );
    assert!(sched::ready_contains(controlled_tid));

    // Nothing left to resume.
    assert_eq!(
        kcall::dispatch(KCALL_EXCPRESUME, [INVALID_OPCODE as usize, 0, 0, 0, 0, 0]),
        Errno::Inval.as_ret()
    );

    // Round trip back to the default action.
    assert_eq!(
        kcall::dispatch(KCALL_EXCPCTRL, [INVALID_OPCODE as usize, excp::EXCP_ACTION_DEFAULT, 0, 0, 0, 0]),
        0
    );
    assert_eq!(excp::action_of(INVALID_OPCODE as usize), Some(excp::ExcpAction::Default));
    assert_eq!(
        kcall::dispatch(KCALL_EXCPCTRL, [INVALID_OPCODE as usize, excp::EXCP_ACTION_HANDLE, 0, 0, 0, 0]),
        0
    );
    assert_eq!(
        kcall::dispatch(KCALL_EXCPCTRL, [INVALID_OPCODE as usize, excp::EXCP_ACTION_DEFAULT, 0, 0, 0, 0]),
        0
    );
}
