//! Scheduler.
//!
//! Single CPU, one FIFO ready queue, pre-emptive on the timer tick and
//! cooperative through [`yield_now`]. Exactly one thread is running at any
//! instant; the idle thread soaks up the gaps and never blocks.
//!
//! Dispatch rule on entry from a trap: a thread that stopped being
//! runnable gives way to the head of the ready queue; a thread that
//! exhausted its quantum goes to the tail and the new head runs.
//!
//! On the host build the switch is bookkeeping only: the ready queue,
//! current pointer, and thread states move exactly as on hardware, but no
//! register state changes hands.

extern crate alloc;

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::pm::{thread, Tid};

/// Timer ticks one thread may run before pre-emption.
pub const QUANTUM_TICKS: u32 = 10;

struct Scheduler {
    current: Option<Tid>,
    idle: Option<Tid>,
    ready: VecDeque<Tid>,
    quantum: u32,
    need_resched: bool,
}

static SCHED: Mutex<Scheduler> = Mutex::new(Scheduler {
    current: None,
    idle: None,
    ready: VecDeque::new(),
    quantum: QUANTUM_TICKS,
    need_resched: false,
});

/// Adopts the boot thread as both the current and the idle thread.
pub(crate) fn adopt_boot_thread(tid: Tid) {
    let mut sched = SCHED.lock();
    sched.current = Some(tid);
    sched.idle = Some(tid);
    sched.quantum = QUANTUM_TICKS;
    drop(sched);
    thread::set_state(tid, thread::ThreadState::Running).ok();
}

/// The running thread, if the scheduler is up.
pub fn current() -> Option<Tid> {
    SCHED.lock().current
}

/// Appends a ready thread to the queue tail.
pub fn push_ready(tid: Tid) {
    let mut sched = SCHED.lock();
    // The idle thread is dispatched as a fallback, never queued.
    if sched.idle == Some(tid) {
        return;
    }
    if !sched.ready.contains(&tid) {
        sched.ready.push_back(tid);
    }
}

/// Drops every queue entry naming `tid`.
pub(crate) fn purge(tid: Tid) {
    SCHED.lock().ready.retain(|&t| t != tid);
}

/// Whether `tid` sits on the ready queue.
pub fn ready_contains(tid: Tid) -> bool {
    SCHED.lock().ready.contains(&tid)
}

pub fn ready_len() -> usize {
    SCHED.lock().ready.len()
}

/// Timer hook: burn one quantum tick, request pre-emption when it runs
/// out. Called from interrupt context; must not block or switch.
pub fn clock_tick() {
    let mut sched = SCHED.lock();
    if sched.quantum > 0 {
        sched.quantum -= 1;
    }
    if sched.quantum == 0 {
        sched.need_resched = true;
    }
}

/// Pre-emption point: honors a pending tick expiry. Called by the trap
/// return path after the controller was acknowledged.
pub fn preempt_point() {
    let expired = {
        let mut sched = SCHED.lock();
        core::mem::take(&mut sched.need_resched)
    };
    if expired {
        yield_now();
    }
}

/// Cooperative yield: the caller goes to the queue tail and the head
/// runs.
pub fn yield_now() {
    switch_next(true);
}

/// Gives up the CPU without re-queueing: the caller already transitioned
/// off RUNNING (blocked or exited).
pub(crate) fn reschedule() {
    switch_next(false);
}

fn pick_next() -> Option<Tid> {
    loop {
        let candidate = SCHED.lock().ready.pop_front()?;
        // Entries can go stale when a queued thread is killed.
        if thread::state_of(candidate) == Ok(thread::ThreadState::Ready) {
            return Some(candidate);
        }
    }
}

fn switch_next(requeue_current: bool) {
    crate::arch::without_interrupts(|| {
        let Some(cur) = current() else {
            return;
        };

        let next = match pick_next() {
            Some(next) => next,
            None => {
                if requeue_current {
                    // Alone in the system: keep running.
                    let mut sched = SCHED.lock();
                    sched.quantum = QUANTUM_TICKS;
                    return;
                }
                // The caller cannot run on; fall back to the idle thread.
                let idle = SCHED.lock().idle;
                match idle {
                    Some(idle) if idle != cur => idle,
                    _ => return,
                }
            }
        };

        if requeue_current {
            thread::set_state(cur, thread::ThreadState::Ready).ok();
        }

        {
            let mut sched = SCHED.lock();
            if requeue_current && sched.idle != Some(cur) {
                sched.ready.push_back(cur);
            }
            sched.current = Some(next);
            sched.quantum = QUANTUM_TICKS;
            sched.need_resched = false;
        }
        thread::set_state(next, thread::ThreadState::Running).ok();

        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            use crate::arch::x86_64::context::{context_switch, Context};

            if let Some(top) = thread::kstack_top(next) {
                crate::arch::x86_64::gdt::set_kernel_stack(top);
            }
            let Some(to) = thread::ctx_ptr(next) else {
                return;
            };
            // An exiting thread's slot may already be reaped; its saved
            // state goes into a scratch frame nobody reads.
            let mut scratch = Context::empty();
            let from = thread::ctx_ptr(cur).unwrap_or(&mut scratch as *mut Context);
            // SAFETY: both pointers address live (or scratch) contexts,
            // the slots never move, and interrupts are masked.
            unsafe { context_switch(from, to) };
        }
    });
}

/// Boot tail: enable interrupts and idle. Pre-emption takes it from here.
pub fn run() -> ! {
    crate::arch::interrupts_enable();
    loop {
        crate::arch::wait_for_interrupt();
        preempt_point();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_tick_requests_resched_after_a_quantum() {
        // Burn whatever quantum is left; the flag must latch.
        for _ in 0..QUANTUM_TICKS {
            clock_tick();
        }
        assert!(SCHED.lock().need_resched);
        // Leave the flag clear for other tests.
        SCHED.lock().need_resched = false;
        SCHED.lock().quantum = QUANTUM_TICKS;
    }

    #[test]
    fn purge_removes_queue_entries() {
        let ghost = Tid::from_raw(0xfe01);
        push_ready(ghost);
        assert!(ready_contains(ghost));
        purge(ghost);
        assert!(!ready_contains(ghost));
    }
}
