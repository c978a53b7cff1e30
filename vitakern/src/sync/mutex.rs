use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex as HostMutex;

use super::{WaitFailure, WaitQueue, Waiter, WakeReason, finish_wait};
use crate::{KResult, KernelError, KernelObject, ObjClass};

/// Attribute bit allowing the owner to re-lock.
pub const MUTEX_ATTR_RECURSIVE: u32 = 0x2;

#[derive(Debug, Clone, Copy)]
struct MutexRequest {
    count: i32,
}

struct MutexState {
    count: i32,
    owner: Option<u32>,
    queue: WaitQueue<MutexRequest>,
}

/// Guest-visible mutex snapshot. `current_owner` is zero when unowned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexInfo {
    pub name: String,
    pub attr: u32,
    pub init_count: i32,
    pub current_count: i32,
    pub current_owner: u32,
    pub num_wait_threads: u32,
}

/// Guest mutex with optional recursion and FIFO ownership handoff: when the
/// count drops to zero, ownership transfers directly to the front waiter
/// instead of going through an unlocked state.
pub struct Mutex {
    name: String,
    attr: u32,
    init: i32,
    state: HostMutex<MutexState>,
}

impl KernelObject for Mutex {
    const CLASS: ObjClass = ObjClass::Mutex;

    fn name(&self) -> &str {
        &self.name
    }
}

impl Mutex {
    pub fn new(name: impl Into<String>, attr: u32, init: i32, creator: u32) -> KResult<Self> {
        if init < 0 || (init > 1 && attr & MUTEX_ATTR_RECURSIVE == 0) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            name: name.into(),
            attr,
            init,
            state: HostMutex::new(MutexState {
                count: init,
                owner: (init > 0).then_some(creator),
                queue: WaitQueue::default(),
            }),
        })
    }

    fn check_count(&self, count: i32) -> Result<(), WaitFailure> {
        if count <= 0 || (count > 1 && self.attr & MUTEX_ATTR_RECURSIVE == 0) {
            return Err(WaitFailure::new(KernelError::InvalidArgument, 0));
        }
        Ok(())
    }

    /// Acquires the mutex `count` times. Returns the resulting lock count.
    pub fn lock(
        &self,
        thread_id: u32,
        count: i32,
        timeout: Option<Duration>,
    ) -> Result<u32, WaitFailure> {
        self.check_count(count)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.state.lock();
        match state.owner {
            None if state.queue.is_empty() => {
                state.owner = Some(thread_id);
                state.count = count;
                trace!("mutex {}: locked by {}", self.name, thread_id);
                return Ok(count as u32);
            }
            Some(owner) if owner == thread_id => {
                if self.attr & MUTEX_ATTR_RECURSIVE == 0 {
                    return Err(WaitFailure::new(
                        KernelError::MutexRecursive,
                        state.count as u32,
                    ));
                }
                let new = state
                    .count
                    .checked_add(count)
                    .ok_or(WaitFailure::new(
                        KernelError::MutexLockOverflow,
                        state.count as u32,
                    ))?;
                state.count = new;
                return Ok(new as u32);
            }
            _ => {}
        }
        if timeout == Some(Duration::ZERO) {
            return Err(WaitFailure::new(
                KernelError::WaitTimeout,
                state.count as u32,
            ));
        }

        let waiter = Waiter::new(thread_id, MutexRequest { count });
        state.queue.push(waiter.clone());
        drop(state);

        finish_wait(
            &self.state,
            |s| &mut s.queue,
            |s| s.count as u32,
            &waiter,
            deadline,
        )
    }

    /// Non-blocking acquire; fails with `MutexFailedToOwn` when someone else
    /// holds the mutex or waiters are queued ahead.
    pub fn try_lock(&self, thread_id: u32, count: i32) -> Result<u32, WaitFailure> {
        self.check_count(count)?;
        let mut state = self.state.lock();
        match state.owner {
            None if state.queue.is_empty() => {
                state.owner = Some(thread_id);
                state.count = count;
                Ok(count as u32)
            }
            Some(owner) if owner == thread_id => {
                drop(state);
                self.lock(thread_id, count, None)
            }
            _ => Err(WaitFailure::new(
                KernelError::MutexFailedToOwn,
                state.count as u32,
            )),
        }
    }

    /// Releases `count` holds. When the count reaches zero, ownership moves
    /// to the front waiter. Returns the remaining count.
    pub fn unlock(&self, thread_id: u32, count: i32) -> KResult<i32> {
        if count <= 0 || (count > 1 && self.attr & MUTEX_ATTR_RECURSIVE == 0) {
            return Err(KernelError::InvalidArgument);
        }
        let mut state = self.state.lock();
        if state.owner != Some(thread_id) {
            return Err(KernelError::MutexNotOwned);
        }
        if count > state.count {
            return Err(KernelError::MutexUnlockUnderflow);
        }
        state.count -= count;
        if state.count == 0 {
            Self::hand_off(&mut state);
        }
        Ok(state.count)
    }

    /// Drops every hold the calling thread has and returns how many it had.
    /// Used by condition variables to release the monitor in one step.
    pub(crate) fn release_all(&self, thread_id: u32) -> KResult<i32> {
        let mut state = self.state.lock();
        if state.owner != Some(thread_id) {
            return Err(KernelError::MutexNotOwned);
        }
        let held = state.count;
        state.count = 0;
        Self::hand_off(&mut state);
        Ok(held)
    }

    fn hand_off(state: &mut MutexState) {
        match state.queue.pop_front() {
            Some(waiter) => {
                state.owner = Some(waiter.thread_id);
                state.count = waiter.request.count;
                waiter.wake(WakeReason::Satisfied(waiter.request.count as u32));
            }
            None => state.owner = None,
        }
    }

    /// Forces the lock count and releases every waiter with `WaitCancelled`.
    /// A negative `new_count` restores the initial count; ownership is
    /// cleared.
    pub fn cancel(&self, new_count: i32) -> KResult<usize> {
        let applied = if new_count < 0 { self.init } else { new_count };
        if applied > 1 && self.attr & MUTEX_ATTR_RECURSIVE == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut state = self.state.lock();
        state.count = applied;
        state.owner = None;
        Ok(state
            .queue
            .wake_all(|_| WakeReason::Cancelled(applied as u32)))
    }

    /// Releases every waiter with `WaitDeleted`. Called once the mutex has
    /// been withdrawn from its table.
    pub fn destroy(&self) -> usize {
        let mut state = self.state.lock();
        state.queue.wake_all(|_| WakeReason::Deleted)
    }

    #[must_use]
    pub fn snapshot(&self) -> MutexInfo {
        let state = self.state.lock();
        MutexInfo {
            name: self.name.clone(),
            attr: self.attr,
            init_count: self.init,
            current_count: state.count,
            current_owner: state.owner.unwrap_or(0),
            num_wait_threads: state.queue.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn plain_lock_unlock() {
        let mutex = Mutex::new("m", 0, 0, 1).unwrap();
        assert_eq!(mutex.lock(1, 1, None), Ok(1));
        assert_eq!(mutex.snapshot().current_owner, 1);
        assert_eq!(mutex.unlock(1, 1), Ok(0));
        assert_eq!(mutex.snapshot().current_owner, 0);
    }

    #[test]
    fn recursion_requires_the_attribute() {
        let plain = Mutex::new("m", 0, 0, 1).unwrap();
        plain.lock(1, 1, None).unwrap();
        assert_eq!(
            plain.lock(1, 1, None),
            Err(WaitFailure::new(KernelError::MutexRecursive, 1))
        );

        let rec = Mutex::new("m", MUTEX_ATTR_RECURSIVE, 0, 1).unwrap();
        for depth in 1..=5 {
            assert_eq!(rec.lock(1, 1, None), Ok(depth));
        }
        assert_eq!(rec.unlock(1, 5), Ok(0));
    }

    #[test]
    fn recursive_count_overflow_is_reported() {
        let rec = Mutex::new("m", MUTEX_ATTR_RECURSIVE, 0, 1).unwrap();
        rec.lock(1, i32::MAX, None).unwrap();
        assert_eq!(
            rec.lock(1, 1, None),
            Err(WaitFailure::new(
                KernelError::MutexLockOverflow,
                i32::MAX as u32
            ))
        );
    }

    #[test]
    fn unlock_validates_ownership_and_depth() {
        let mutex = Mutex::new("m", MUTEX_ATTR_RECURSIVE, 0, 1).unwrap();
        assert_eq!(mutex.unlock(1, 1), Err(KernelError::MutexNotOwned));

        mutex.lock(1, 2, None).unwrap();
        assert_eq!(mutex.unlock(2, 1), Err(KernelError::MutexNotOwned));
        assert_eq!(mutex.unlock(1, 3), Err(KernelError::MutexUnlockUnderflow));
        assert_eq!(mutex.unlock(1, 2), Ok(0));
    }

    #[test]
    fn creation_with_initial_count_assigns_the_creator() {
        let mutex = Mutex::new("m", 0, 1, 9).unwrap();
        assert_eq!(mutex.snapshot().current_owner, 9);
        assert!(Mutex::new("m", 0, 2, 9).is_err());
        assert!(Mutex::new("m", MUTEX_ATTR_RECURSIVE, 2, 9).is_ok());
    }

    #[test]
    fn ownership_hands_off_to_the_front_waiter() {
        let mutex = Arc::new(Mutex::new("m", 0, 0, 1).unwrap());
        mutex.lock(1, 1, None).unwrap();

        let m = mutex.clone();
        let second = std::thread::spawn(move || m.lock(2, 1, None));
        while mutex.snapshot().num_wait_threads < 1 {
            std::thread::yield_now();
        }

        let m = mutex.clone();
        let third = std::thread::spawn(move || m.lock(3, 1, None));
        while mutex.snapshot().num_wait_threads < 2 {
            std::thread::yield_now();
        }

        mutex.unlock(1, 1).unwrap();
        assert_eq!(second.join().unwrap(), Ok(1));
        assert_eq!(mutex.snapshot().current_owner, 2);

        mutex.unlock(2, 1).unwrap();
        assert_eq!(third.join().unwrap(), Ok(1));
        assert_eq!(mutex.snapshot().current_owner, 3);
        mutex.unlock(3, 1).unwrap();
    }

    #[test]
    fn try_lock_fails_without_blocking() {
        let mutex = Mutex::new("m", 0, 0, 1).unwrap();
        mutex.lock(1, 1, None).unwrap();
        assert_eq!(
            mutex.try_lock(2, 1),
            Err(WaitFailure::new(KernelError::MutexFailedToOwn, 1))
        );

        let rec = Mutex::new("m", MUTEX_ATTR_RECURSIVE, 0, 1).unwrap();
        rec.lock(1, 1, None).unwrap();
        assert_eq!(rec.try_lock(1, 1), Ok(2));
    }

    #[test]
    fn lock_timeout_expires_against_a_held_mutex() {
        let mutex = Mutex::new("m", 0, 0, 1).unwrap();
        mutex.lock(1, 1, None).unwrap();

        let start = Instant::now();
        assert_eq!(
            mutex.lock(2, 1, Some(Duration::from_millis(20))),
            Err(WaitFailure::new(KernelError::WaitTimeout, 1))
        );
        assert!(start.elapsed() >= Duration::from_millis(20));

        assert_eq!(
            mutex.lock(2, 1, Some(Duration::ZERO)),
            Err(WaitFailure::new(KernelError::WaitTimeout, 1))
        );
    }

    #[test]
    fn cancel_clears_ownership_and_wakes_waiters() {
        let mutex = Arc::new(Mutex::new("m", 0, 0, 1).unwrap());
        mutex.lock(1, 1, None).unwrap();

        let m = mutex.clone();
        let handle = std::thread::spawn(move || m.lock(2, 1, None));
        while mutex.snapshot().num_wait_threads < 1 {
            std::thread::yield_now();
        }

        assert_eq!(mutex.cancel(0), Ok(1));
        assert_eq!(
            handle.join().unwrap(),
            Err(WaitFailure::new(KernelError::WaitCancelled, 0))
        );
        assert_eq!(mutex.snapshot().current_owner, 0);
        assert_eq!(mutex.lock(5, 1, None), Ok(1));
    }

    #[test]
    fn destroy_delivers_wait_deleted() {
        let mutex = Arc::new(Mutex::new("m", 0, 0, 1).unwrap());
        mutex.lock(1, 1, None).unwrap();

        let m = mutex.clone();
        let handle = std::thread::spawn(move || m.lock(2, 1, None));
        while mutex.snapshot().num_wait_threads < 1 {
            std::thread::yield_now();
        }

        assert_eq!(mutex.destroy(), 1);
        assert_eq!(
            handle.join().unwrap(),
            Err(WaitFailure::new(KernelError::WaitDeleted, 0))
        );
    }
}
