//! Boot the kernel core on the host build and drive the hello-world
//! scenario through the kernel-call dispatcher: spawn a boot module,
//! dispatch its thread, write to stdout, exit, and reap.

use obsidian_kernel::error::Errno;
use obsidian_kernel::kargs::Kargs;
use obsidian_kernel::kcall;
use obsidian_kernel::kmod::{self, Kmod};
use obsidian_kernel::mm::{self, USER_BASE_VIRT, USER_STACK_TOP};
use obsidian_kernel::pm::{process, sched, thread};

const MODULE_BASE: u32 = 0x0180_0000;

const KCALL_WRITE: usize = 6;
const KCALL_KMOD_GET: usize = 23;
const KCALL_PINFO: usize = 24;
const KCALL_EXCPWAIT: usize = 21;

fn hello_image() -> &'static [u8] {
    let header = process::ImageHeader {
        entry: USER_BASE_VIRT,
        text_size: 32,
        data_size: 3,
    };
    let mut blob = header.emit().to_vec();
    blob.extend_from_slice(&[0x90; 32]);
    blob.extend_from_slice(b"hi\n");
    Box::leak(blob.into_boxed_slice())
}

#[test]
fn boot_and_hello() {
    let image = hello_image();

    let mut kargs = Kargs::new(0, mm::MEMORY_SIZE as u32);
    kargs
        .add_module(Kmod::new(
            MODULE_BASE,
            MODULE_BASE + image.len() as u32,
            "hello",
        ))
        .unwrap();

    obsidian_kernel::boot(kargs);
    kmod::kmod_pin_image(0, image);

    // The memory system is online with the reserved ranges carved out.
    let stats = mm::frame::frame_stats();
    assert!(stats.booked > 0);
    assert_eq!(stats.total, mm::NUM_FRAMES);
    assert_eq!(kmod::kmod_count(), 1);

    obsidian_kernel::spawn_boot_modules();
    assert_eq!(process::process_count(), 2);

    // Dispatch the module's thread.
    sched::yield_now();
    let tid = sched::current().expect("a current thread");
    let pid = process::current_pid().expect("a current process");
    assert_eq!(thread::pid_of(tid), Ok(pid));

    // write(1, "hi\n", 3) out of the module's data segment.
    let data_vaddr = USER_BASE_VIRT as usize + 0x1000;
    let written = kcall::dispatch(KCALL_WRITE, [1, data_vaddr, 3, 0, 0, 0]);
    assert_eq!(written, 3);
    let out = obsidian_kernel::dev::stdout::take_captured();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("hi\n"), "stdout was: {text:?}");

    // Oversized writes fail without writing anything.
    assert_eq!(
        kcall::dispatch(KCALL_WRITE, [1, data_vaddr, 200, 0, 0, 0]),
        Errno::Inval.as_ret()
    );
    // Kernel pointers never pass the user check.
    assert_eq!(
        kcall::dispatch(KCALL_WRITE, [1, 0x1000, 4, 0, 0, 0]),
        Errno::Fault.as_ret()
    );
    assert!(obsidian_kernel::dev::stdout::take_captured().is_empty());

    // Introspection into the writable stack region.
    let pinfo_ptr = (USER_STACK_TOP - 64) as usize;
    assert_eq!(kcall::dispatch(KCALL_PINFO, [pinfo_ptr, 0, 0, 0, 0, 0]), 0);
    let mut raw = [0u8; 12];
    process::with_current_vmem(|vm| vm.read_bytes(mm::VirtAddr::new(pinfo_ptr as u32), &mut raw))
        .unwrap()
        .unwrap();
    assert_eq!(u32::from_le_bytes(raw[0..4].try_into().unwrap()), pid.raw());
    assert_eq!(u32::from_le_bytes(raw[4..8].try_into().unwrap()), tid.raw());

    let kmod_ptr = (USER_STACK_TOP - 256) as usize;
    assert_eq!(kcall::dispatch(KCALL_KMOD_GET, [0, kmod_ptr, 0, 0, 0, 0]), 0);
    let mut raw = [0u8; 8];
    process::with_current_vmem(|vm| vm.read_bytes(mm::VirtAddr::new(kmod_ptr as u32), &mut raw))
        .unwrap()
        .unwrap();
    assert_eq!(u32::from_le_bytes(raw[0..4].try_into().unwrap()), MODULE_BASE);

    // A null record pointer is invalid before anything can block.
    assert_eq!(
        kcall::dispatch(KCALL_EXCPWAIT, [0, 0, 0, 0, 0, 0]),
        Errno::Inval.as_ret()
    );

    // _exit(0): the thread dies, the process turns zombie, and the boot
    // thread takes back the CPU.
    let exited = std::panic::catch_unwind(|| thread::exit_current(0));
    assert!(exited.is_err());
    assert_eq!(thread::state_of(tid), Ok(thread::ThreadState::Exited));
    assert_eq!(process::state_of(pid), Ok(process::ProcState::Zombie));
    assert_eq!(process::exit_status(pid), Ok(0));
    assert!(!sched::ready_contains(tid));

    // Reaping the initial thread frees the pid.
    assert_eq!(thread::join(tid), Ok(0));
    assert!(process::state_of(pid).is_err());
    assert_eq!(process::process_count(), 1);
}
