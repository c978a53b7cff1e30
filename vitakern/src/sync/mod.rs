mod condvar;
mod event_flag;
mod mutex;
mod semaphore;

pub use condvar::*;
pub use event_flag::*;
pub use mutex::*;
pub use semaphore::*;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar as HostCondvar, Mutex as HostMutex};

use crate::KernelError;

/// Why a blocked waiter was released. The payload is the guest-visible
/// secondary value (event-flag pattern, semaphore count, and so on) sampled
/// at wake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Satisfied(u32),
    Cancelled(u32),
    Deleted,
}

#[derive(Debug, Clone, Copy)]
enum WaitState {
    Pending,
    Woken(WakeReason),
}

/// One blocked guest thread. The signaling side stores the outcome under the
/// waiter lock and notifies; the waiting side blocks on the condvar until an
/// outcome arrives or its deadline passes.
pub struct Waiter<R> {
    pub thread_id: u32,
    pub request: R,
    state: HostMutex<WaitState>,
    cv: HostCondvar,
}

impl<R> Waiter<R> {
    pub fn new(thread_id: u32, request: R) -> Arc<Self> {
        Arc::new(Self {
            thread_id,
            request,
            state: HostMutex::new(WaitState::Pending),
            cv: HostCondvar::new(),
        })
    }

    /// Delivers the outcome. Each waiter is woken at most once; the caller
    /// must hold the owning object's lock while the waiter is in its queue.
    pub fn wake(&self, reason: WakeReason) {
        let mut state = self.state.lock();
        match *state {
            WaitState::Pending => *state = WaitState::Woken(reason),
            WaitState::Woken(_) => panic!("waiter woken twice"),
        }
        self.cv.notify_one();
    }

    /// Non-blocking check for an already-delivered outcome.
    pub fn poll_woken(&self) -> Option<WakeReason> {
        match *self.state.lock() {
            WaitState::Pending => None,
            WaitState::Woken(reason) => Some(reason),
        }
    }

    /// Blocks until woken or until the deadline. `None` means the deadline
    /// passed with no outcome delivered; spurious wakeups re-test against
    /// the same deadline.
    pub fn block(&self, deadline: Option<Instant>) -> Option<WakeReason> {
        let mut state = self.state.lock();
        loop {
            if let WaitState::Woken(reason) = *state {
                return Some(reason);
            }
            match deadline {
                Some(d) => {
                    if self.cv.wait_until(&mut state, d).timed_out() {
                        return match *state {
                            WaitState::Woken(reason) => Some(reason),
                            WaitState::Pending => None,
                        };
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }
    }
}

/// FIFO queue of blocked waiters. All mutation happens under the owning
/// object's lock.
pub struct WaitQueue<R> {
    queue: VecDeque<Arc<Waiter<R>>>,
}

impl<R> Default for WaitQueue<R> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<R> WaitQueue<R> {
    pub fn push(&mut self, waiter: Arc<Waiter<R>>) {
        self.queue.push_back(waiter);
    }

    /// Removes a specific waiter, identified by pointer. Returns false if it
    /// was already taken off the queue by a signaler.
    pub fn remove(&mut self, waiter: &Arc<Waiter<R>>) -> bool {
        match self.queue.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(i) => {
                self.queue.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn pop_front(&mut self) -> Option<Arc<Waiter<R>>> {
        self.queue.pop_front()
    }

    #[must_use]
    pub fn front(&self) -> Option<&Arc<Waiter<R>>> {
        self.queue.front()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<Waiter<R>>> {
        self.queue.get(index)
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Arc<Waiter<R>>> {
        self.queue.remove(index)
    }

    /// Wakes every queued waiter with the reason produced per waiter and
    /// empties the queue. Returns how many were released.
    pub fn wake_all(&mut self, reason: impl Fn(&Waiter<R>) -> WakeReason) -> usize {
        let count = self.queue.len();
        for waiter in self.queue.drain(..) {
            let r = reason(&waiter);
            waiter.wake(r);
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A failed wait, carrying the error and the guest-visible secondary value
/// at failure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFailure {
    pub error: KernelError,
    pub value: u32,
}

impl WaitFailure {
    pub fn new(error: KernelError, value: u32) -> Self {
        Self { error, value }
    }
}

pub(crate) fn map_reason(reason: WakeReason) -> Result<u32, WaitFailure> {
    match reason {
        WakeReason::Satisfied(value) => Ok(value),
        WakeReason::Cancelled(value) => {
            Err(WaitFailure::new(KernelError::WaitCancelled, value))
        }
        WakeReason::Deleted => Err(WaitFailure::new(KernelError::WaitDeleted, 0)),
    }
}

/// Blocks on an enqueued waiter and resolves the timeout race: if the
/// deadline passes, the object lock is retaken and a wake that slipped in
/// wins over the timeout. Only a still-pending waiter is dequeued and
/// reported as timed out, with the object's current value attached.
pub(crate) fn finish_wait<S, R>(
    state: &HostMutex<S>,
    queue: impl FnOnce(&mut S) -> &mut WaitQueue<R>,
    value_now: impl FnOnce(&S) -> u32,
    waiter: &Arc<Waiter<R>>,
    deadline: Option<Instant>,
) -> Result<u32, WaitFailure> {
    if let Some(reason) = waiter.block(deadline) {
        return map_reason(reason);
    }

    let mut guard = state.lock();
    if let Some(reason) = waiter.poll_woken() {
        return map_reason(reason);
    }
    let removed = queue(&mut *guard).remove(waiter);
    debug_assert!(removed, "timed-out waiter missing from its queue");
    let value = value_now(&*guard);
    Err(WaitFailure::new(KernelError::WaitTimeout, value))
}
