//! Thread table and lifecycle.
//!
//! Threads live in a bounded arena guarded by one spin lock. Each thread
//! owns one kernel page as its kernel stack while it exists; its saved
//! context is meaningful whenever the thread is not running. The first
//! dispatch of a fresh thread lands in a trampoline that either enters a
//! kernel loop or drops to ring 3.

use spin::Mutex;

use crate::arch::x86_64::context::Context;
use crate::error::{KernelResult, PmError};
use crate::mm::{kpool, PAGE_SIZE};
use crate::pm::{sched, Pid, Tid, THREAD_MAX};

/// Thread states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Ready,
    Running,
    Blocked,
    Exited,
}

struct ThreadSlot {
    generation: u32,
    live: bool,
    state: ThreadState,
    pid: Pid,
    ctx: Context,
    kstack: Option<u32>,
    retval: usize,
    detached: bool,
    joiner: Option<Tid>,
    /// Pinned by the exception service; not schedulable until resumed.
    pinned: bool,
}

impl ThreadSlot {
    const fn empty() -> Self {
        Self {
            generation: 0,
            live: false,
            state: ThreadState::New,
            pid: Pid::from_raw(0),
            ctx: Context::empty(),
            kstack: None,
            retval: 0,
            detached: false,
            joiner: None,
            pinned: false,
        }
    }
}

static THREADS: Mutex<[ThreadSlot; THREAD_MAX]> =
    Mutex::new([const { ThreadSlot::empty() }; THREAD_MAX]);

fn slot_of<'a>(
    table: &'a mut [ThreadSlot; THREAD_MAX],
    tid: Tid,
) -> Result<&'a mut ThreadSlot, PmError> {
    let slot = table.get_mut(tid.index()).ok_or(PmError::NotFound)?;
    if !slot.live || slot.generation != tid.generation() {
        return Err(PmError::NotFound);
    }
    Ok(slot)
}

/// First landing point of every thread.
extern "C" fn thread_trampoline() -> ! {
    #[cfg(target_os = "none")]
    {
        let ctx = {
            let me = sched::current().expect("trampoline outside a thread");
            let mut table = THREADS.lock();
            let slot = slot_of(&mut table, me).expect("trampoline on a dead thread");
            slot.ctx
        };

        crate::arch::interrupts_enable();
        if ctx.user {
            // SAFETY: the loader mapped entry and stack user-accessible in
            // the address space this thread was dispatched with.
            unsafe {
                crate::arch::x86_64::context::jump_to_user(
                    ctx.entry, ctx.stack, ctx.arg0, ctx.arg1,
                )
            }
        } else {
            let entry: extern "C" fn() -> ! =
                // SAFETY: kernel threads are created from function pointers
                // of exactly this signature.
                unsafe { core::mem::transmute(ctx.entry as usize) };
            entry()
        }
    }
    #[cfg(not(target_os = "none"))]
    unreachable!("thread bodies do not run on the host build");
}

/// Creates a thread in `pid` without scheduling it.
pub(crate) fn create(pid: Pid, mut ctx: Context) -> KernelResult<Tid> {
    let kstack = kpool::kpage_get()?;
    let kstack_top = u64::from(kstack.as_u32()) + PAGE_SIZE as u64;
    ctx.prepare_first_dispatch(kstack_top, thread_trampoline);

    let mut table = THREADS.lock();
    for (index, slot) in table.iter_mut().enumerate() {
        if slot.live {
            continue;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.live = true;
        slot.state = ThreadState::New;
        slot.pid = pid;
        slot.ctx = ctx;
        slot.kstack = Some(kstack.as_u32());
        slot.retval = 0;
        slot.detached = false;
        slot.joiner = None;
        slot.pinned = false;
        return Ok(Tid::pack(index, slot.generation));
    }

    drop(table);
    kpool::kpage_put(kstack).ok();
    Err(PmError::TableFull.into())
}

/// Creates a thread and puts it on the ready queue.
pub fn spawn(pid: Pid, ctx: Context) -> KernelResult<Tid> {
    let tid = create(pid, ctx)?;
    set_state(tid, ThreadState::Ready)?;
    sched::push_ready(tid);
    Ok(tid)
}

/// State of a thread; stale ids fail lookup.
pub fn state_of(tid: Tid) -> Result<ThreadState, PmError> {
    let mut table = THREADS.lock();
    slot_of(&mut table, tid).map(|slot| slot.state)
}

/// Owning process of a thread.
pub fn pid_of(tid: Tid) -> Result<Pid, PmError> {
    let mut table = THREADS.lock();
    slot_of(&mut table, tid).map(|slot| slot.pid)
}

pub(crate) fn set_state(tid: Tid, state: ThreadState) -> Result<(), PmError> {
    let mut table = THREADS.lock();
    slot_of(&mut table, tid).map(|slot| slot.state = state)
}

/// Blocked-to-ready transition; false when the thread is gone or was not
/// blocked.
pub(crate) fn wake_blocked(tid: Tid) -> bool {
    let mut table = THREADS.lock();
    match slot_of(&mut table, tid) {
        Ok(slot) if slot.state == ThreadState::Blocked && !slot.pinned => {
            slot.state = ThreadState::Ready;
            true
        }
        _ => false,
    }
}

/// Pins or unpins a thread for the exception service. A pinned thread is
/// off the ready queue and its saved context stays frozen.
pub(crate) fn set_pinned(tid: Tid, pinned: bool) -> Result<(), PmError> {
    let mut table = THREADS.lock();
    slot_of(&mut table, tid).map(|slot| slot.pinned = pinned)
}

/// The calling thread's id.
pub fn thread_get_id() -> Option<Tid> {
    sched::current()
}

/// Terminates the calling thread: parks `retval` for a joiner, wakes it,
/// and never returns.
pub fn exit_current(retval: usize) -> ! {
    let me = sched::current().expect("thread_exit outside a thread");
    finish(me, retval);
    sched::reschedule();
    // A dead thread cannot be dispatched again.
    crate::hal::kpanic("exited thread kept running");
}

/// Marks `tid` exited with `retval`: releases its kernel stack, wakes any
/// joiner, reaps immediately when detached, and purges it from the ready
/// queue. Also tells the owning process.
pub(crate) fn finish(tid: Tid, retval: usize) {
    let (pid, joiner, reap_now) = {
        let mut table = THREADS.lock();
        let Ok(slot) = slot_of(&mut table, tid) else {
            return;
        };
        slot.state = ThreadState::Exited;
        slot.retval = retval;
        slot.pinned = false;
        if let Some(kstack) = slot.kstack.take() {
            // The page cannot be reused while the exiting thread is still
            // on it: nothing else runs on this CPU until the switch.
            kpool::kpage_put(crate::mm::VirtAddr::new(kstack)).ok();
        }
        let joiner = slot.joiner;
        let reap_now = slot.detached;
        if reap_now {
            slot.live = false;
        }
        (slot.pid, joiner, reap_now)
    };

    sched::purge(tid);
    if let Some(joiner) = joiner {
        if wake_blocked(joiner) {
            sched::push_ready(joiner);
        }
    }

    crate::pm::process::note_thread_exit(pid, tid, retval);
    if reap_now {
        crate::pm::process::note_thread_reaped(pid, tid);
    }
}

/// Blocks until `tid` exits, then reaps it and returns its retval.
pub fn join(tid: Tid) -> KernelResult<usize> {
    let me = sched::current().ok_or(PmError::NotFound)?;
    if me == tid {
        return Err(PmError::InvalidState.into());
    }

    loop {
        let mut table = THREADS.lock();
        let slot = slot_of(&mut table, tid)?;

        if slot.detached {
            return Err(PmError::NotJoinable.into());
        }
        match slot.joiner {
            Some(existing) if existing != me => return Err(PmError::NotJoinable.into()),
            _ => {}
        }

        if slot.state == ThreadState::Exited {
            let retval = slot.retval;
            let pid = slot.pid;
            slot.live = false;
            slot.joiner = None;
            drop(table);
            crate::pm::process::note_thread_reaped(pid, tid);
            return Ok(retval);
        }

        slot.joiner = Some(me);
        let me_slot = slot_of(&mut table, me)?;
        me_slot.state = ThreadState::Blocked;
        drop(table);
        sched::reschedule();
    }
}

/// Marks `tid` self-reaping: nobody will join it, and its slot is freed
/// the moment it exits (or now, if it already has).
pub fn detach(tid: Tid) -> KernelResult<()> {
    let reaped = {
        let mut table = THREADS.lock();
        let slot = slot_of(&mut table, tid)?;
        if slot.joiner.is_some() {
            return Err(PmError::NotJoinable.into());
        }
        slot.detached = true;
        if slot.state == ThreadState::Exited {
            slot.live = false;
            Some(slot.pid)
        } else {
            None
        }
    };

    if let Some(pid) = reaped {
        crate::pm::process::note_thread_reaped(pid, tid);
    }
    Ok(())
}

/// Raw pointer to a thread's saved context, for the switch path. The
/// pointer references a slot in the static table, which never moves; the
/// switch runs with interrupts masked on the only CPU.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub(crate) fn ctx_ptr(tid: Tid) -> Option<*mut Context> {
    let mut table = THREADS.lock();
    let slot = slot_of(&mut table, tid).ok()?;
    Some(&mut slot.ctx as *mut Context)
}

/// Top of a thread's kernel stack, for the TSS ring-0 slot.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub(crate) fn kstack_top(tid: Tid) -> Option<u64> {
    let mut table = THREADS.lock();
    let slot = slot_of(&mut table, tid).ok()?;
    slot.kstack.map(|base| u64::from(base) + PAGE_SIZE as u64)
}

/// Number of live threads. Diagnostic.
pub fn thread_count() -> usize {
    THREADS.lock().iter().filter(|slot| slot.live).count()
}
