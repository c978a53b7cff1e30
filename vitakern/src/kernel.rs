use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::{
    CondVar, CondVarInfo, EventFlag, EventFlagInfo, FunctionRegistry, GuestMemory, KResult,
    KernelError, Mutex, MutexInfo, ObjectTable, Semaphore, SemaphoreInfo, Uid, WaitFailure,
};

/// Longest accepted object name, excluding the terminator.
pub const MAX_NAME_LEN: usize = 31;

fn check_name(name: &str) -> KResult<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(KernelError::NameTooLong);
    }
    Ok(())
}

fn timeout_from_usec(usec: Option<u32>) -> Option<Duration> {
    usec.map(|us| Duration::from_micros(us as u64))
}

/// The guest kernel personality: one uid table per object class, the import
/// registry, and guest memory. All entry points take and return guest-ABI
/// shaped values; blocking ones identify the caller by guest thread id.
///
/// Deletion withdraws the object from its table first and notifies waiters
/// only after the table lock is back down, so a waiter waking into `get` can
/// never observe the dying object.
pub struct Kernel {
    memory: Arc<GuestMemory>,
    registry: FunctionRegistry,
    event_flags: ObjectTable<EventFlag>,
    semaphores: ObjectTable<Semaphore>,
    mutexes: ObjectTable<Mutex>,
    condvars: ObjectTable<CondVar>,
}

impl Kernel {
    #[must_use]
    pub fn new(memory: Arc<GuestMemory>) -> Self {
        Self {
            memory,
            registry: FunctionRegistry::new(),
            event_flags: ObjectTable::new(),
            semaphores: ObjectTable::new(),
            mutexes: ObjectTable::new(),
            condvars: ObjectTable::new(),
        }
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    #[must_use]
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    fn wait_target<T>(table: &ObjectTable<T>, uid: Uid) -> Result<Arc<T>, WaitFailure>
    where
        T: crate::KernelObject,
    {
        table
            .get(uid)
            .ok_or(WaitFailure::new(KernelError::InvalidUid, 0))
    }

    // --- event flags ---

    pub fn create_event_flag(&self, name: &str, attr: u32, init: u32) -> KResult<Uid> {
        check_name(name)?;
        let uid = self.event_flags.create(EventFlag::new(name, attr, init))?;
        trace!("create_event_flag {name:?} -> {uid:?}");
        Ok(uid)
    }

    /// Deletes the flag; every waiter fails with `WaitDeleted`. Returns how
    /// many were released.
    pub fn delete_event_flag(&self, uid: Uid) -> KResult<usize> {
        let evf = self.event_flags.withdraw(uid).ok_or(KernelError::InvalidUid)?;
        Ok(evf.destroy())
    }

    pub fn set_event_flag(&self, uid: Uid, bits: u32) -> KResult<usize> {
        let evf = self.event_flags.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(evf.set(bits))
    }

    pub fn clear_event_flag(&self, uid: Uid, bits: u32) -> KResult<()> {
        let evf = self.event_flags.get(uid).ok_or(KernelError::InvalidUid)?;
        evf.clear(bits);
        Ok(())
    }

    pub fn wait_event_flag(
        &self,
        thread_id: u32,
        uid: Uid,
        pattern: u32,
        mode: u32,
        timeout_us: Option<u32>,
    ) -> Result<u32, WaitFailure> {
        let evf = Self::wait_target(&self.event_flags, uid)?;
        evf.wait(thread_id, pattern, mode, timeout_from_usec(timeout_us))
    }

    pub fn poll_event_flag(&self, uid: Uid, pattern: u32, mode: u32) -> Result<u32, WaitFailure> {
        let evf = Self::wait_target(&self.event_flags, uid)?;
        evf.poll(pattern, mode)
    }

    pub fn cancel_event_flag(&self, uid: Uid, new_pattern: u32) -> KResult<usize> {
        let evf = self.event_flags.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(evf.cancel(new_pattern))
    }

    pub fn event_flag_info(&self, uid: Uid) -> KResult<EventFlagInfo> {
        let evf = self.event_flags.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(evf.snapshot())
    }

    // --- semaphores ---

    pub fn create_semaphore(&self, name: &str, attr: u32, init: i32, max: i32) -> KResult<Uid> {
        check_name(name)?;
        let uid = self.semaphores.create(Semaphore::new(name, attr, init, max)?)?;
        trace!("create_semaphore {name:?} -> {uid:?}");
        Ok(uid)
    }

    pub fn delete_semaphore(&self, uid: Uid) -> KResult<usize> {
        let sema = self.semaphores.withdraw(uid).ok_or(KernelError::InvalidUid)?;
        Ok(sema.destroy())
    }

    pub fn signal_semaphore(&self, uid: Uid, grant: i32) -> KResult<usize> {
        let sema = self.semaphores.get(uid).ok_or(KernelError::InvalidUid)?;
        sema.signal(grant)
    }

    pub fn wait_semaphore(
        &self,
        thread_id: u32,
        uid: Uid,
        need: i32,
        timeout_us: Option<u32>,
    ) -> Result<u32, WaitFailure> {
        let sema = Self::wait_target(&self.semaphores, uid)?;
        sema.wait(thread_id, need, timeout_from_usec(timeout_us))
    }

    pub fn poll_semaphore(&self, uid: Uid, need: i32) -> Result<u32, WaitFailure> {
        let sema = Self::wait_target(&self.semaphores, uid)?;
        sema.poll(need)
    }

    pub fn cancel_semaphore(&self, uid: Uid, set_count: i32) -> KResult<usize> {
        let sema = self.semaphores.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(sema.cancel(set_count))
    }

    pub fn semaphore_info(&self, uid: Uid) -> KResult<SemaphoreInfo> {
        let sema = self.semaphores.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(sema.snapshot())
    }

    // --- mutexes ---

    pub fn create_mutex(
        &self,
        name: &str,
        attr: u32,
        init: i32,
        creator_thread: u32,
    ) -> KResult<Uid> {
        check_name(name)?;
        let uid = self
            .mutexes
            .create(Mutex::new(name, attr, init, creator_thread)?)?;
        trace!("create_mutex {name:?} -> {uid:?}");
        Ok(uid)
    }

    pub fn delete_mutex(&self, uid: Uid) -> KResult<usize> {
        let mutex = self.mutexes.withdraw(uid).ok_or(KernelError::InvalidUid)?;
        Ok(mutex.destroy())
    }

    pub fn lock_mutex(
        &self,
        thread_id: u32,
        uid: Uid,
        count: i32,
        timeout_us: Option<u32>,
    ) -> Result<u32, WaitFailure> {
        let mutex = Self::wait_target(&self.mutexes, uid)?;
        mutex.lock(thread_id, count, timeout_from_usec(timeout_us))
    }

    pub fn try_lock_mutex(&self, thread_id: u32, uid: Uid, count: i32) -> Result<u32, WaitFailure> {
        let mutex = Self::wait_target(&self.mutexes, uid)?;
        mutex.try_lock(thread_id, count)
    }

    pub fn unlock_mutex(&self, thread_id: u32, uid: Uid, count: i32) -> KResult<i32> {
        let mutex = self.mutexes.get(uid).ok_or(KernelError::InvalidUid)?;
        mutex.unlock(thread_id, count)
    }

    pub fn cancel_mutex(&self, uid: Uid, new_count: i32) -> KResult<usize> {
        let mutex = self.mutexes.get(uid).ok_or(KernelError::InvalidUid)?;
        mutex.cancel(new_count)
    }

    pub fn mutex_info(&self, uid: Uid) -> KResult<MutexInfo> {
        let mutex = self.mutexes.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(mutex.snapshot())
    }

    // --- condition variables ---

    /// Creates a condition variable bound to an existing mutex. The condvar
    /// keeps the mutex alive even if the mutex uid is deleted later.
    pub fn create_condvar(&self, name: &str, attr: u32, mutex_uid: Uid) -> KResult<Uid> {
        check_name(name)?;
        let mutex = self.mutexes.get(mutex_uid).ok_or(KernelError::InvalidUid)?;
        let uid = self.condvars.create(CondVar::new(name, attr, mutex))?;
        trace!("create_condvar {name:?} -> {uid:?}");
        Ok(uid)
    }

    pub fn delete_condvar(&self, uid: Uid) -> KResult<usize> {
        let cond = self.condvars.withdraw(uid).ok_or(KernelError::InvalidUid)?;
        Ok(cond.destroy())
    }

    pub fn wait_condvar(
        &self,
        thread_id: u32,
        uid: Uid,
        timeout_us: Option<u32>,
    ) -> Result<u32, WaitFailure> {
        let cond = Self::wait_target(&self.condvars, uid)?;
        cond.wait(thread_id, timeout_from_usec(timeout_us))
    }

    pub fn signal_condvar(&self, uid: Uid) -> KResult<usize> {
        let cond = self.condvars.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(cond.signal_one())
    }

    pub fn signal_condvar_all(&self, uid: Uid) -> KResult<usize> {
        let cond = self.condvars.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(cond.signal_all())
    }

    pub fn condvar_info(&self, uid: Uid) -> KResult<CondVarInfo> {
        let cond = self.condvars.get(uid).ok_or(KernelError::InvalidUid)?;
        Ok(cond.snapshot())
    }
}
