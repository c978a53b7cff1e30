use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as HostMutex;

use super::{Mutex, WaitFailure, WaitQueue, Waiter, WakeReason, finish_wait};
use crate::{KernelError, KernelObject, ObjClass};

#[derive(Debug, Clone, Copy)]
struct CondRequest {
    held: i32,
}

struct CondState {
    queue: WaitQueue<CondRequest>,
}

/// Guest-visible condition-variable snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondVarInfo {
    pub name: String,
    pub attr: u32,
    pub mutex_name: String,
    pub num_wait_threads: u32,
}

/// Monitor-style condition variable, bound to one mutex for its lifetime.
/// `wait` releases the caller's full recursion depth in one step and
/// restores it before returning, whatever the outcome.
pub struct CondVar {
    name: String,
    attr: u32,
    mutex: Arc<Mutex>,
    state: HostMutex<CondState>,
}

impl KernelObject for CondVar {
    const CLASS: ObjClass = ObjClass::CondVar;

    fn name(&self) -> &str {
        &self.name
    }
}

impl CondVar {
    #[must_use]
    pub fn new(name: impl Into<String>, attr: u32, mutex: Arc<Mutex>) -> Self {
        Self {
            name: name.into(),
            attr,
            mutex,
            state: HostMutex::new(CondState {
                queue: WaitQueue::default(),
            }),
        }
    }

    #[must_use]
    pub fn mutex(&self) -> &Arc<Mutex> {
        &self.mutex
    }

    /// Atomically releases the bound mutex and blocks until signaled. The
    /// caller must own the mutex. On return the mutex is re-acquired at the
    /// caller's previous depth, except when the mutex itself was cancelled
    /// or deleted while re-acquiring, which is the error reported.
    pub fn wait(&self, thread_id: u32, timeout: Option<Duration>) -> Result<u32, WaitFailure> {
        let deadline = timeout.map(|t| Instant::now() + t);
        if timeout == Some(Duration::ZERO) {
            return Err(WaitFailure::new(KernelError::WaitTimeout, 0));
        }

        // Release and enqueue under the queue lock so a signal issued
        // between the two cannot be lost.
        let mut state = self.state.lock();
        let held = self
            .mutex
            .release_all(thread_id)
            .map_err(|e| WaitFailure::new(e, 0))?;
        let waiter = Waiter::new(thread_id, CondRequest { held });
        state.queue.push(waiter.clone());
        drop(state);

        let outcome = finish_wait(&self.state, |s| &mut s.queue, |_| 0, &waiter, deadline);

        // Whatever happened, the monitor contract requires the mutex back.
        self.mutex.lock(thread_id, held, None)?;
        outcome
    }

    /// Wakes the front waiter. Returns 1 if one was queued.
    pub fn signal_one(&self) -> usize {
        let mut state = self.state.lock();
        match state.queue.pop_front() {
            Some(waiter) => {
                waiter.wake(WakeReason::Satisfied(0));
                1
            }
            None => 0,
        }
    }

    /// Wakes every waiter. Returns how many were queued.
    pub fn signal_all(&self) -> usize {
        let mut state = self.state.lock();
        state.queue.wake_all(|_| WakeReason::Satisfied(0))
    }

    /// Releases every waiter with `WaitCancelled`.
    pub fn cancel(&self) -> usize {
        let mut state = self.state.lock();
        state.queue.wake_all(|_| WakeReason::Cancelled(0))
    }

    /// Releases every waiter with `WaitDeleted`. Called once the condvar has
    /// been withdrawn from its table.
    pub fn destroy(&self) -> usize {
        let mut state = self.state.lock();
        state.queue.wake_all(|_| WakeReason::Deleted)
    }

    #[must_use]
    pub fn snapshot(&self) -> CondVarInfo {
        let state = self.state.lock();
        CondVarInfo {
            name: self.name.clone(),
            attr: self.attr,
            mutex_name: self.mutex.name().to_string(),
            num_wait_threads: state.queue.len() as u32,
        }
    }
}
