//! Counting semaphores.
//!
//! The primitive pairs a counter with a condition variable: `down`
//! atomically checks the count and sleeps while it is zero, `up`
//! increments and wakes a waiter. Named semaphores add a process-wide
//! table keyed by integer key, with atomic create-or-open and destruction
//! when dropped explicitly or when the last referencing process exits.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::SemError;
use crate::pm::{condvar::Condvar, Pid};

/// Maximum number of named semaphores.
pub const SEMAPHORE_MAX: usize = 32;

/// `semctl` command: destroy the semaphore.
pub const SEM_RMID: usize = 0;
/// `semctl` command: read the counter.
pub const SEM_GETVAL: usize = 12;
/// `semctl` command: overwrite the counter.
pub const SEM_SETVAL: usize = 16;

/// A counting semaphore.
pub struct Semaphore {
    count: Mutex<u32>,
    nonzero: Condvar,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Self {
            count: Mutex::new(count),
            nonzero: Condvar::new(),
        }
    }

    /// Decrements the counter, sleeping while it is zero.
    pub fn down(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            count = self.nonzero.wait(&self.count, count);
        }
        *count -= 1;
    }

    /// Decrements the counter if it is positive; never sleeps.
    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Increments the counter and wakes one waiter.
    pub fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        drop(count);
        self.nonzero.signal();
    }

    /// Current counter value.
    pub fn value(&self) -> u32 {
        *self.count.lock()
    }

    /// Overwrites the counter; waiters are woken when it becomes positive.
    pub fn set_value(&self, value: u32) {
        let mut count = self.count.lock();
        *count = value;
        drop(count);
        if value > 0 {
            self.nonzero.broadcast();
        }
    }

    /// Threads currently sleeping on this semaphore.
    pub fn waiters(&self) -> usize {
        self.nonzero.waiters()
    }

    pub(crate) fn wake_all(&self) {
        self.nonzero.broadcast();
    }
}

struct NamedSem {
    key: u32,
    sem: Arc<Semaphore>,
    owners: Vec<Pid>,
}

/// Process-wide table of named semaphores.
pub struct SemTable {
    slots: Mutex<[Option<NamedSem>; SEMAPHORE_MAX]>,
}

impl SemTable {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new([const { None }; SEMAPHORE_MAX]),
        }
    }

    /// Atomic create-or-open: two processes racing on a fresh key see one
    /// create and one open. New semaphores start with count 1.
    pub fn get(&self, key: u32, caller: Pid) -> Result<usize, SemError> {
        let mut slots = self.slots.lock();

        for (id, slot) in slots.iter_mut().enumerate() {
            if let Some(named) = slot {
                if named.key == key {
                    if !named.owners.contains(&caller) {
                        named.owners.push(caller);
                    }
                    return Ok(id);
                }
            }
        }

        for (id, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let mut owners = Vec::new();
                owners.push(caller);
                *slot = Some(NamedSem {
                    key,
                    sem: Arc::new(Semaphore::new(1)),
                    owners,
                });
                return Ok(id);
            }
        }

        Err(SemError::TableFull)
    }

    fn handle(&self, id: usize) -> Result<Arc<Semaphore>, SemError> {
        let slots = self.slots.lock();
        slots
            .get(id)
            .and_then(|slot| slot.as_ref())
            .map(|named| Arc::clone(&named.sem))
            .ok_or(SemError::NotFound)
    }

    /// Applies `op`: negative performs that many downs, positive that many
    /// ups, zero is invalid.
    pub fn op(&self, id: usize, op: i32) -> Result<(), SemError> {
        if op == 0 {
            return Err(SemError::Invalid);
        }
        let sem = self.handle(id)?;

        if op < 0 {
            for _ in 0..op.unsigned_abs() {
                sem.down();
            }
        } else {
            for _ in 0..op {
                sem.up();
            }
        }
        Ok(())
    }

    /// Control operations: GETVAL, SETVAL, RMID.
    pub fn ctl(&self, id: usize, cmd: usize, val: usize) -> Result<usize, SemError> {
        match cmd {
            SEM_GETVAL => Ok(self.handle(id)?.value() as usize),
            SEM_SETVAL => {
                let value = u32::try_from(val).map_err(|_| SemError::Invalid)?;
                self.handle(id)?.set_value(value);
                Ok(0)
            }
            SEM_RMID => {
                let mut slots = self.slots.lock();
                let slot = slots.get_mut(id).ok_or(SemError::NotFound)?;
                let named = slot.take().ok_or(SemError::NotFound)?;
                drop(slots);
                // Sleepers re-evaluate the count and go back to sleep on
                // their own handle; the table entry is gone.
                named.sem.wake_all();
                Ok(0)
            }
            _ => Err(SemError::Invalid),
        }
    }

    /// Drops every reference `pid` holds; a semaphore disappears with its
    /// last owner.
    pub fn drop_process(&self, pid: Pid) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(named) = slot {
                named.owners.retain(|&p| p != pid);
                if named.owners.is_empty() {
                    *slot = None;
                }
            }
        }
    }

    /// Looks up the id behind `key`.
    pub fn id_of(&self, key: u32) -> Result<usize, SemError> {
        let slots = self.slots.lock();
        for (id, slot) in slots.iter().enumerate() {
            if let Some(named) = slot {
                if named.key == key {
                    return Ok(id);
                }
            }
        }
        Err(SemError::NotFound)
    }
}

impl Default for SemTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The system semaphore table.
static SEMAPHORES: SemTable = SemTable::new();

/// Create-or-open the semaphore behind `key` for `caller`.
pub fn semget(key: u32, caller: Pid) -> Result<usize, SemError> {
    SEMAPHORES.get(key, caller)
}

/// Applies `op` to semaphore `id`.
pub fn semop(id: usize, op: i32) -> Result<(), SemError> {
    SEMAPHORES.op(id, op)
}

/// Control operation on semaphore `id`.
pub fn semctl(id: usize, cmd: usize, val: usize) -> Result<usize, SemError> {
    SEMAPHORES.ctl(id, cmd, val)
}

/// Process-exit hook.
pub(crate) fn drop_process(pid: Pid) {
    SEMAPHORES.drop_process(pid);
}
