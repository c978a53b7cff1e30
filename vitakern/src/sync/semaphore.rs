use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex;

use super::{WaitFailure, WaitQueue, Waiter, WakeReason, map_reason};
use crate::{KResult, KernelError, KernelObject, ObjClass};

#[derive(Debug, Clone, Copy)]
struct SemaRequest {
    need: i32,
}

struct SemaState {
    count: i32,
    queue: WaitQueue<SemaRequest>,
}

/// Guest-visible semaphore snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreInfo {
    pub name: String,
    pub attr: u32,
    pub init_count: i32,
    pub max_count: i32,
    pub current_count: i32,
    pub num_wait_threads: u32,
}

/// Counting semaphore with per-wait demand. Waiters queue FIFO and only the
/// front waiter is eligible: a large demand at the front blocks smaller
/// demands behind it until it can be served.
pub struct Semaphore {
    name: String,
    attr: u32,
    init: i32,
    max: i32,
    state: Mutex<SemaState>,
}

impl KernelObject for Semaphore {
    const CLASS: ObjClass = ObjClass::Semaphore;

    fn name(&self) -> &str {
        &self.name
    }
}

impl Semaphore {
    pub fn new(name: impl Into<String>, attr: u32, init: i32, max: i32) -> KResult<Self> {
        if max <= 0 || init < 0 || init > max {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            name: name.into(),
            attr,
            init,
            max,
            state: Mutex::new(SemaState {
                count: init,
                queue: WaitQueue::default(),
            }),
        })
    }

    fn check_need(&self, need: i32) -> Result<(), WaitFailure> {
        if need <= 0 || need > self.max {
            return Err(WaitFailure::new(KernelError::InvalidArgument, 0));
        }
        Ok(())
    }

    /// Non-blocking acquire of `need` units. Returns the remaining count on
    /// success, `SemaphoreZero` with the current count on a miss.
    pub fn poll(&self, need: i32) -> Result<u32, WaitFailure> {
        self.check_need(need)?;
        let mut state = self.state.lock();
        if state.count >= need && state.queue.is_empty() {
            state.count -= need;
            Ok(state.count as u32)
        } else {
            Err(WaitFailure::new(
                KernelError::SemaphoreZero,
                state.count as u32,
            ))
        }
    }

    /// Blocking acquire of `need` units. Returns the remaining count.
    pub fn wait(
        &self,
        thread_id: u32,
        need: i32,
        timeout: Option<Duration>,
    ) -> Result<u32, WaitFailure> {
        self.check_need(need)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.state.lock();
        // FIFO: an arriving thread may not overtake queued waiters.
        if state.count >= need && state.queue.is_empty() {
            state.count -= need;
            return Ok(state.count as u32);
        }
        if timeout == Some(Duration::ZERO) {
            return Err(WaitFailure::new(
                KernelError::WaitTimeout,
                state.count as u32,
            ));
        }

        let waiter = Waiter::new(thread_id, SemaRequest { need });
        state.queue.push(waiter.clone());
        drop(state);

        if let Some(reason) = waiter.block(deadline) {
            return map_reason(reason);
        }
        let mut state = self.state.lock();
        if let Some(reason) = waiter.poll_woken() {
            return map_reason(reason);
        }
        let removed = state.queue.remove(&waiter);
        debug_assert!(removed, "timed-out waiter missing from its queue");
        let count = state.count as u32;
        // A timed-out front waiter may have been blocking a smaller demand
        // behind it; the banked count serves the queue now.
        Self::serve_front(&mut *state);
        Err(WaitFailure::new(KernelError::WaitTimeout, count))
    }

    /// Releases `grant` units and serves the queue from the front while the
    /// front waiter's demand fits. Returns how many waiters were released.
    pub fn signal(&self, grant: i32) -> KResult<usize> {
        if grant <= 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let new_count = state
            .count
            .checked_add(grant)
            .filter(|&c| c <= self.max)
            .ok_or(KernelError::SemaphoreOverflow)?;
        state.count = new_count;
        trace!("sema {}: signal {} -> {}", self.name, grant, state.count);
        Ok(Self::serve_front(&mut *state))
    }

    /// Serves the queue from the front while the front waiter's demand fits
    /// the available count. Returns how many waiters were released.
    fn serve_front(state: &mut SemaState) -> usize {
        let mut woken = 0;
        while let Some(front) = state.queue.front() {
            let need = front.request.need;
            if state.count < need {
                break;
            }
            state.count -= need;
            if let Some(waiter) = state.queue.pop_front() {
                waiter.wake(WakeReason::Satisfied(state.count as u32));
                woken += 1;
            }
        }
        woken
    }

    /// Forces the count and releases every waiter with `WaitCancelled`.
    /// A negative `set_count` restores the initial count.
    pub fn cancel(&self, set_count: i32) -> usize {
        let mut state = self.state.lock();
        state.count = if set_count < 0 { self.init } else { set_count.min(self.max) };
        let count = state.count as u32;
        state.queue.wake_all(|_| WakeReason::Cancelled(count))
    }

    /// Releases every waiter with `WaitDeleted`. Called once the semaphore
    /// has been withdrawn from its table.
    pub fn destroy(&self) -> usize {
        let mut state = self.state.lock();
        state.queue.wake_all(|_| WakeReason::Deleted)
    }

    #[must_use]
    pub fn snapshot(&self) -> SemaphoreInfo {
        let state = self.state.lock();
        SemaphoreInfo {
            name: self.name.clone(),
            attr: self.attr,
            init_count: self.init,
            max_count: self.max,
            current_count: state.count,
            num_wait_threads: state.queue.len() as u32,
        }
    }
}
