use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex;

use super::{WaitFailure, WaitQueue, Waiter, WakeReason, finish_wait};
use crate::{KernelError, KernelObject, ObjClass};

/// Attribute bit allowing more than one simultaneous waiter.
pub const EVF_ATTR_MULTI: u32 = 0x1000;

/// Wait mode: any requested bit satisfies (default is all bits).
pub const EVF_WAIT_OR: u32 = 0x1;
/// Wait mode: clear the whole pattern on a satisfied wait.
pub const EVF_WAIT_CLEAR_ALL: u32 = 0x2;
/// Wait mode: clear the requested bits on a satisfied wait.
pub const EVF_WAIT_CLEAR_PAT: u32 = 0x4;

const EVF_MODE_MASK: u32 = EVF_WAIT_OR | EVF_WAIT_CLEAR_ALL | EVF_WAIT_CLEAR_PAT;

fn pat_test(current: u32, pattern: u32, mode: u32) -> bool {
    if mode & EVF_WAIT_OR != 0 {
        current & pattern != 0
    } else {
        current & pattern == pattern
    }
}

/// Mask to AND into the pattern after a satisfied wait.
fn pat_clear(pattern: u32, mode: u32) -> u32 {
    if mode & EVF_WAIT_CLEAR_ALL != 0 {
        0
    } else if mode & EVF_WAIT_CLEAR_PAT != 0 {
        !pattern
    } else {
        !0
    }
}

#[derive(Debug, Clone, Copy)]
struct EvfRequest {
    pattern: u32,
    mode: u32,
}

struct EvfState {
    pattern: u32,
    queue: WaitQueue<EvfRequest>,
}

/// Guest-visible event-flag snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFlagInfo {
    pub name: String,
    pub attr: u32,
    pub init_pattern: u32,
    pub current_pattern: u32,
    pub num_wait_threads: u32,
}

/// A 32-bit pattern of event bits threads can wait on with AND/OR conditions
/// and optional clear-on-exit. Waiters are served in FIFO order: each `set`
/// scans the queue front to back, and a clear-on-exit waiter consumes bits
/// before the next waiter is tested.
pub struct EventFlag {
    name: String,
    attr: u32,
    init: u32,
    state: Mutex<EvfState>,
}

impl KernelObject for EventFlag {
    const CLASS: ObjClass = ObjClass::EventFlag;

    fn name(&self) -> &str {
        &self.name
    }
}

impl EventFlag {
    #[must_use]
    pub fn new(name: impl Into<String>, attr: u32, init: u32) -> Self {
        Self {
            name: name.into(),
            attr,
            init,
            state: Mutex::new(EvfState {
                pattern: init,
                queue: WaitQueue::default(),
            }),
        }
    }

    fn check_wait_args(pattern: u32, mode: u32) -> Result<(), WaitFailure> {
        if pattern == 0 || mode & !EVF_MODE_MASK != 0 {
            return Err(WaitFailure::new(KernelError::InvalidArgument, 0));
        }
        Ok(())
    }

    /// Sets bits and wakes every waiter whose condition now holds, in FIFO
    /// order. Returns the number of waiters released.
    pub fn set(&self, bits: u32) -> usize {
        let mut state = self.state.lock();
        state.pattern |= bits;
        trace!("evf {}: set {:#x} -> {:#x}", self.name, bits, state.pattern);

        let mut woken = 0;
        let mut i = 0;
        while i < state.queue.len() {
            let req = state.queue.get(i).map(|w| w.request);
            let req = match req {
                Some(r) if pat_test(state.pattern, r.pattern, r.mode) => r,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let prev = state.pattern;
            state.pattern &= pat_clear(req.pattern, req.mode);
            if let Some(waiter) = state.queue.remove_at(i) {
                waiter.wake(WakeReason::Satisfied(prev));
                woken += 1;
            }
        }
        woken
    }

    /// Clears the given bits. Never wakes anyone.
    pub fn clear(&self, bits: u32) {
        let mut state = self.state.lock();
        state.pattern &= !bits;
    }

    /// Non-blocking wait. On success returns the pattern before any clear;
    /// on a miss returns `EventFlagCondition` with the current pattern.
    pub fn poll(&self, pattern: u32, mode: u32) -> Result<u32, WaitFailure> {
        Self::check_wait_args(pattern, mode)?;
        let mut state = self.state.lock();
        if pat_test(state.pattern, pattern, mode) {
            let prev = state.pattern;
            state.pattern &= pat_clear(pattern, mode);
            Ok(prev)
        } else {
            Err(WaitFailure::new(
                KernelError::EventFlagCondition,
                state.pattern,
            ))
        }
    }

    /// Blocking wait. On success returns the pattern as it was when the
    /// condition held, before any clear-on-exit. A `Some(0)` timeout is a
    /// pure poll that fails with `WaitTimeout` instead of blocking.
    pub fn wait(
        &self,
        thread_id: u32,
        pattern: u32,
        mode: u32,
        timeout: Option<Duration>,
    ) -> Result<u32, WaitFailure> {
        Self::check_wait_args(pattern, mode)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.state.lock();
        if pat_test(state.pattern, pattern, mode) {
            let prev = state.pattern;
            state.pattern &= pat_clear(pattern, mode);
            return Ok(prev);
        }
        if self.attr & EVF_ATTR_MULTI == 0 && !state.queue.is_empty() {
            return Err(WaitFailure::new(
                KernelError::EventFlagMultipleWaiters,
                state.pattern,
            ));
        }
        if timeout == Some(Duration::ZERO) {
            return Err(WaitFailure::new(KernelError::WaitTimeout, state.pattern));
        }

        let waiter = Waiter::new(thread_id, EvfRequest { pattern, mode });
        state.queue.push(waiter.clone());
        drop(state);

        finish_wait(
            &self.state,
            |s| &mut s.queue,
            |s| s.pattern,
            &waiter,
            deadline,
        )
    }

    /// Replaces the pattern and releases every waiter with `WaitCancelled`.
    /// Returns the number of waiters released.
    pub fn cancel(&self, new_pattern: u32) -> usize {
        let mut state = self.state.lock();
        state.pattern = new_pattern;
        state.queue.wake_all(|_| WakeReason::Cancelled(new_pattern))
    }

    /// Releases every waiter with `WaitDeleted`. Called once the flag has
    /// been withdrawn from its table.
    pub fn destroy(&self) -> usize {
        let mut state = self.state.lock();
        state.queue.wake_all(|_| WakeReason::Deleted)
    }

    #[must_use]
    pub fn snapshot(&self) -> EventFlagInfo {
        let state = self.state.lock();
        EventFlagInfo {
            name: self.name.clone(),
            attr: self.attr,
            init_pattern: self.init,
            current_pattern: state.pattern,
            num_wait_threads: state.queue.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;

    #[test]
    fn and_mode_needs_all_bits_or_mode_needs_any() {
        let evf = EventFlag::new("evf", EVF_ATTR_MULTI, 0b0101);

        assert!(evf.poll(0b0100, 0).is_ok()); // AND, subset present
        assert_eq!(
            evf.poll(0b0110, 0),
            Err(WaitFailure::new(KernelError::EventFlagCondition, 0b0101))
        );
        assert_eq!(evf.poll(0b0110, EVF_WAIT_OR), Ok(0b0101));
    }

    #[test]
    fn clear_modes_consume_the_right_bits() {
        let evf = EventFlag::new("evf", EVF_ATTR_MULTI, 0b1111);
        assert_eq!(evf.poll(0b0011, EVF_WAIT_CLEAR_PAT), Ok(0b1111));
        assert_eq!(evf.snapshot().current_pattern, 0b1100);

        assert_eq!(evf.poll(0b0100, EVF_WAIT_OR | EVF_WAIT_CLEAR_ALL), Ok(0b1100));
        assert_eq!(evf.snapshot().current_pattern, 0);
    }

    #[test]
    fn explicit_clear_never_wakes() {
        let evf = Arc::new(EventFlag::new("evf", EVF_ATTR_MULTI, 0b1010));
        evf.clear(0b0010);
        assert_eq!(evf.snapshot().current_pattern, 0b1000);

        let e = evf.clone();
        let handle = std::thread::spawn(move || e.wait(1, 0b0001, 0, Some(Duration::from_millis(30))));
        // Clearing while a thread waits must not release it.
        std::thread::sleep(Duration::from_millis(5));
        evf.clear(0b1000);
        let out = handle.join().unwrap();
        assert_eq!(out, Err(WaitFailure::new(KernelError::WaitTimeout, 0)));
    }

    #[test]
    fn zero_pattern_and_bad_mode_are_rejected() {
        let evf = EventFlag::new("evf", EVF_ATTR_MULTI, 0);
        assert_eq!(
            evf.poll(0, 0),
            Err(WaitFailure::new(KernelError::InvalidArgument, 0))
        );
        assert_eq!(
            evf.wait(1, 1, 0x80, None),
            Err(WaitFailure::new(KernelError::InvalidArgument, 0))
        );
    }

    #[test]
    fn single_waiter_attr_rejects_a_second_waiter() {
        let evf = Arc::new(EventFlag::new("evf", 0, 0));

        let e = evf.clone();
        let handle = std::thread::spawn(move || e.wait(1, 1, 0, None));
        // Give the first waiter time to enqueue.
        while evf.snapshot().num_wait_threads == 0 {
            std::thread::yield_now();
        }

        assert_eq!(
            evf.wait(2, 1, 0, None),
            Err(WaitFailure::new(KernelError::EventFlagMultipleWaiters, 0))
        );

        evf.set(1);
        assert_eq!(handle.join().unwrap(), Ok(1));
    }

    #[test]
    fn set_after_a_delay_wakes_the_waiter_early() {
        let evf = Arc::new(EventFlag::new("evf", EVF_ATTR_MULTI, 0));

        let e = evf.clone();
        let handle = std::thread::spawn(move || {
            e.wait(1, 0x10, 0, Some(Duration::from_secs(10)))
        });

        std::thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        assert_eq!(evf.set(0x10), 1);
        assert_eq!(handle.join().unwrap(), Ok(0x10));
        // The waiter returned on the set, nowhere near the 10s deadline.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn fifo_scan_lets_an_earlier_waiter_consume_first() {
        let evf = Arc::new(EventFlag::new("evf", EVF_ATTR_MULTI, 0));
        let (tx, rx) = mpsc::channel();

        // First waiter clears everything it sees; second wants the same bit.
        let e = evf.clone();
        let tx1 = tx.clone();
        let first = std::thread::spawn(move || {
            let out = e.wait(1, 1, EVF_WAIT_CLEAR_ALL, None);
            tx1.send(1u32).unwrap();
            out
        });
        while evf.snapshot().num_wait_threads < 1 {
            std::thread::yield_now();
        }

        let e = evf.clone();
        let second = std::thread::spawn(move || {
            e.wait(2, 1, 0, Some(Duration::from_millis(50)))
        });
        while evf.snapshot().num_wait_threads < 2 {
            std::thread::yield_now();
        }

        assert_eq!(evf.set(1), 1);
        assert_eq!(first.join().unwrap(), Ok(1));
        assert_eq!(rx.recv().unwrap(), 1);
        // The first waiter consumed the bit, so the second times out.
        assert_eq!(
            second.join().unwrap(),
            Err(WaitFailure::new(KernelError::WaitTimeout, 0))
        );
    }

    #[test]
    fn cancel_wakes_everyone_and_the_flag_survives() {
        let evf = Arc::new(EventFlag::new("evf", EVF_ATTR_MULTI, 0));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let e = evf.clone();
                std::thread::spawn(move || e.wait(i, 0x80, 0, None))
            })
            .collect();
        while evf.snapshot().num_wait_threads < 3 {
            std::thread::yield_now();
        }

        assert_eq!(evf.cancel(0x5a), 3);
        for handle in handles {
            assert_eq!(
                handle.join().unwrap(),
                Err(WaitFailure::new(KernelError::WaitCancelled, 0x5a))
            );
        }

        // Still usable afterwards.
        assert_eq!(evf.snapshot().current_pattern, 0x5a);
        assert_eq!(evf.poll(0x5a, EVF_WAIT_CLEAR_ALL), Ok(0x5a));
    }

    #[test]
    fn destroy_delivers_wait_deleted() {
        let evf = Arc::new(EventFlag::new("evf", EVF_ATTR_MULTI, 0));

        let e = evf.clone();
        let handle = std::thread::spawn(move || e.wait(1, 1, 0, None));
        while evf.snapshot().num_wait_threads == 0 {
            std::thread::yield_now();
        }

        assert_eq!(evf.destroy(), 1);
        assert_eq!(
            handle.join().unwrap(),
            Err(WaitFailure::new(KernelError::WaitDeleted, 0))
        );
    }

    #[test]
    fn zero_timeout_is_a_failing_poll() {
        let evf = EventFlag::new("evf", EVF_ATTR_MULTI, 0b10);
        let start = Instant::now();
        assert_eq!(
            evf.wait(1, 0b01, 0, Some(Duration::ZERO)),
            Err(WaitFailure::new(KernelError::WaitTimeout, 0b10))
        );
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
