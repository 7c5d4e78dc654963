//! Condition variables.
//!
//! A wait queue with atomic "drop the associated lock and sleep"
//! semantics. The caller holds a spin lock protecting the condition;
//! [`Condvar::wait`] enqueues the caller, releases that lock, and blocks,
//! all inside one masked-interrupt section. That is the only ordering that
//! cannot lose a wakeup against a broadcast in the unlock-sleep window.

extern crate alloc;

use alloc::collections::VecDeque;

use spin::{Mutex, MutexGuard};

use crate::error::PmError;
use crate::pm::{sched, thread, Tid};

/// A condition variable. Embedded in the object it guards; no separate
/// allocation.
pub struct Condvar {
    queue: Mutex<VecDeque<Tid>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically releases `guard` and sleeps until woken, then
    /// re-acquires the lock before returning.
    pub fn wait<'a, T>(&self, lock: &'a Mutex<T>, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        crate::arch::without_interrupts(|| {
            let me = sched::current().expect("cond_wait outside a thread");
            self.queue.lock().push_back(me);
            thread::set_state(me, thread::ThreadState::Blocked).ok();
            drop(guard);
            sched::reschedule();
        });
        lock.lock()
    }

    /// Wakes the first waiter, if any.
    pub fn signal(&self) {
        let woken = self.queue.lock().pop_front();
        if let Some(tid) = woken {
            wake(tid);
        }
    }

    /// Wakes every waiter. The queue is empty when this returns.
    pub fn broadcast(&self) {
        let woken: VecDeque<Tid> = core::mem::take(&mut *self.queue.lock());
        for tid in woken {
            wake(tid);
        }
    }

    /// Wakes one specific waiter.
    pub fn unicast(&self, tid: Tid) -> Result<(), PmError> {
        let mut queue = self.queue.lock();
        let pos = queue.iter().position(|&t| t == tid).ok_or(PmError::NotFound)?;
        queue.remove(pos);
        drop(queue);
        wake(tid);
        Ok(())
    }

    /// Number of threads currently enqueued.
    pub fn waiters(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether `tid` sits in this wait queue.
    pub fn contains(&self, tid: Tid) -> bool {
        self.queue.lock().iter().any(|&t| t == tid)
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

fn wake(tid: Tid) {
    // A queue may hold a thread that has since been killed; waking skips
    // anything that is no longer blocked.
    if thread::wake_blocked(tid) {
        sched::push_ready(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_leaves_the_queue_empty() {
        let cv = Condvar::new();
        // Stale ids in the queue: broadcast must drain them all without
        // waking anything.
        cv.queue.lock().push_back(Tid::from_raw(0xdead));
        cv.queue.lock().push_back(Tid::from_raw(0xbeef));
        assert_eq!(cv.waiters(), 2);

        cv.broadcast();
        assert_eq!(cv.waiters(), 0);
    }

    #[test]
    fn unicast_removes_only_the_target() {
        let cv = Condvar::new();
        let a = Tid::from_raw(0x0101);
        let b = Tid::from_raw(0x0202);
        cv.queue.lock().push_back(a);
        cv.queue.lock().push_back(b);

        cv.unicast(a).unwrap();
        assert!(!cv.contains(a));
        assert!(cv.contains(b));
        assert_eq!(cv.unicast(a), Err(PmError::NotFound));
    }

    #[test]
    fn signal_on_empty_queue_is_harmless() {
        let cv = Condvar::new();
        cv.signal();
        assert_eq!(cv.waiters(), 0);
    }
}
