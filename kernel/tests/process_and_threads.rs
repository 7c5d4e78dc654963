//! Process and thread lifecycle on the host build: join with a retval,
//! detach, table exhaustion, and the saved-uid identity rules end to end.

use obsidian_kernel::arch::x86_64::context::Context;
use obsidian_kernel::error::{Errno, KernelError, PmError};
use obsidian_kernel::kargs::Kargs;
use obsidian_kernel::kcall;
use obsidian_kernel::mm::{self, USER_BASE_VIRT};
use obsidian_kernel::pm::{process, sched, thread, Identity, PROCESS_MAX};

const KCALL_GETUID: usize = 25;
const KCALL_GETEUID: usize = 26;
const KCALL_SETUID: usize = 29;
const KCALL_SETEUID: usize = 30;

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
fn process_and_thread_lifecycle() {
    obsidian_kernel::boot(Kargs::new(0, mm::MEMORY_SIZE as u32));

    let kernel_pid = process::current_pid().expect("the kernel process");
    let boot_thread = sched::current().expect("the boot thread");

    // --- two-thread join -------------------------------------------------

    let worker = thread::spawn(kernel_pid, Context::kernel(0)).unwrap();
    assert_eq!(thread::state_of(worker), Ok(thread::ThreadState::Ready));
    assert!(sched::ready_contains(worker));

    // Dispatch the worker, let it exit with 42.
    sched::yield_now();
    assert_eq!(sched::current(), Some(worker));
    assert!(std::panic::catch_unwind(|| thread::exit_current(42)).is_err());

    assert_eq!(sched::current(), Some(boot_thread));
    assert!(!sched::ready_contains(worker));
    assert_eq!(thread::join(worker), Ok(42));
    // The reaped id is stale now.
    assert!(matches!(
        thread::join(worker),
        Err(KernelError::Pm(PmError::NotFound))
    ));

    // --- detach ----------------------------------------------------------

    let loner = thread::spawn(kernel_pid, Context::kernel(0)).unwrap();
    thread::detach(loner).unwrap();
    sched::yield_now();
    assert_eq!(sched::current(), Some(loner));
    assert!(std::panic::catch_unwind(|| thread::exit_current(7)).is_err());

    // Detached threads reap themselves on exit.
    assert!(thread::state_of(loner).is_err());
    assert!(matches!(
        thread::join(loner),
        Err(KernelError::Pm(PmError::NotFound))
    ));

    // --- process table exhaustion ---------------------------------------

    let image = tiny_image();
    let mut spawned = Vec::new();
    loop {
        match process::create(&image) {
            Ok(pid) => spawned.push(pid),
            Err(e) => {
                assert_eq!(e, KernelError::Pm(PmError::TableFull));
                assert_eq!(Errno::from(e), Errno::Again);
                break;
            }
        }
    }
    // The kernel process holds one slot; everything else was ours.
    assert_eq!(spawned.len(), PROCESS_MAX - 1);
    assert_eq!(process::process_count(), PROCESS_MAX);

    // --- identity: the saved-uid rules ----------------------------------

    // Become the first spawned process.
    sched::yield_now();
    let me = process::current_pid().unwrap();
    assert_eq!(me, spawned[0]);

    // A setuid-root situation: real uid 1000, effective uid 0.
    process::with_current_identity(|id| *id = Identity::new(1000, 0, 100, 100)).unwrap();

    // Dropping privilege works.
    assert_eq!(kcall::dispatch(KCALL_SETEUID, [1000, 0, 0, 0, 0, 0]), 0);
    assert_eq!(kcall::dispatch(KCALL_GETEUID, [0; 6]), 1000);
    assert_eq!(kcall::dispatch(KCALL_GETUID, [0; 6]), 1000);

    // The saved uid still allows the way back.
    assert_eq!(kcall::dispatch(KCALL_SETEUID, [0, 0, 0, 0, 0, 0]), 0);

    // A privileged setuid rewrites all three ids.
    assert_eq!(kcall::dispatch(KCALL_SETUID, [1000, 0, 0, 0, 0, 0]), 0);

    // No way back anymore.
    assert_eq!(
        kcall::dispatch(KCALL_SETEUID, [0, 0, 0, 0, 0, 0]),
        Errno::Perm.as_ret()
    );
}
