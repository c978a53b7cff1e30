use std::thread::ThreadId;

use log::trace;

use crate::{GuestMemory, IsaMode, KResult, RegisterFile};

/// Link-register sentinel that marks a return into host code. The executor
/// reports `ReturnToHost` when the guest branches to this address.
pub const HOST_RETURN_ADDR: u32 = 0x4000_0000;

/// Outcome of executing one guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    ReturnToHost,
}

/// The instruction-level interpreter this layer drives. Implementations
/// advance the thread by one instruction per call.
pub trait GuestExecutor {
    fn step(&mut self, thread: &mut GuestThread, mem: &GuestMemory) -> KResult<StepResult>;
}

type DispatchHook = Box<dyn FnMut(&mut GuestThread) + Send>;

/// A guest thread's context. Each guest thread is owned by exactly one host
/// thread; re-entrant calls from that host thread are allowed, calls from any
/// other host thread are a consistency violation.
pub struct GuestThread {
    pub id: u32,
    pub name: String,
    pub regs: RegisterFile,
    host: ThreadId,
    hook: Option<DispatchHook>,
}

impl std::fmt::Debug for GuestThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pc", &format_args!("{:#010x}", self.regs.pc))
            .finish()
    }
}

impl GuestThread {
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            regs: RegisterFile::default(),
            host: std::thread::current().id(),
            hook: None,
        }
    }

    /// Installs a hook invoked when the executor hits a host-dispatch point.
    pub fn set_hook(&mut self, hook: DispatchHook) {
        self.hook = Some(hook);
    }

    #[must_use]
    pub fn take_hook(&mut self) -> Option<DispatchHook> {
        self.hook.take()
    }

    /// Runs the guest function at `addr` to completion on the current host
    /// thread. Arguments must already be staged in the register file and
    /// stack frame; the return value is left in r0 (and r1 for pairs).
    ///
    /// Panics if called from a host thread other than the owner, or if the
    /// callee returns with an unbalanced stack pointer.
    pub fn fast_call(
        &mut self,
        addr: u32,
        mem: &GuestMemory,
        exec: &mut dyn GuestExecutor,
    ) -> KResult<()> {
        assert_eq!(
            std::thread::current().id(),
            self.host,
            "guest thread {} entered from a foreign host thread",
            self.id
        );

        let saved_pc = self.regs.pc;
        let saved_lr = self.regs.lr();
        let saved_sp = self.regs.sp();
        let saved_isa = self.regs.isa;
        let saved_it = self.regs.it;
        // The dispatch hook belongs to the interrupted invocation; the
        // nested guest call runs without it.
        let saved_hook = self.hook.take();

        self.regs.pc = addr & !1;
        self.regs.set_lr(HOST_RETURN_ADDR);
        self.regs.isa = if addr & 1 != 0 {
            IsaMode::Thumb
        } else {
            IsaMode::Arm
        };
        self.regs.it = Default::default();

        trace!("thread {}: fast_call {:#010x}", self.id, addr);

        let result = loop {
            match exec.step(self, mem) {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::ReturnToHost) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if result.is_ok() {
            assert_eq!(
                self.regs.sp(),
                saved_sp,
                "guest function {:#010x} returned with an unbalanced stack",
                addr
            );
        }

        self.regs.pc = saved_pc;
        self.regs.set_lr(saved_lr);
        self.regs.set_sp(saved_sp);
        self.regs.isa = saved_isa;
        self.regs.it = saved_it;
        self.hook = saved_hook;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelError;

    /// Scripted executor: runs a closure per step against the thread.
    struct Script<F>(F);

    impl<F> GuestExecutor for Script<F>
    where
        F: FnMut(&mut GuestThread, &GuestMemory) -> KResult<StepResult>,
    {
        fn step(&mut self, thread: &mut GuestThread, mem: &GuestMemory) -> KResult<StepResult> {
            (self.0)(thread, mem)
        }
    }

    #[test]
    fn fast_call_restores_context_and_keeps_r0() {
        let mem = GuestMemory::new(0, 0x100);
        let mut thread = GuestThread::new(1, "main");
        thread.regs.pc = 0x1234;
        thread.regs.set_lr(0x5678);
        thread.regs.set_sp(0x80);

        let mut exec = Script(|t: &mut GuestThread, _: &GuestMemory| {
            assert_eq!(t.regs.lr(), HOST_RETURN_ADDR);
            t.regs.gpr[0] = 99;
            Ok(StepResult::ReturnToHost)
        });
        thread.fast_call(0x2000, &mem, &mut exec).unwrap();

        assert_eq!(thread.regs.gpr[0], 99);
        assert_eq!(thread.regs.pc, 0x1234);
        assert_eq!(thread.regs.lr(), 0x5678);
        assert_eq!(thread.regs.sp(), 0x80);
    }

    #[test]
    fn fast_call_suspends_the_dispatch_hook() {
        let mem = GuestMemory::new(0, 0x100);
        let mut thread = GuestThread::new(1, "main");
        thread.set_hook(Box::new(|_| {}));

        let mut exec = Script(|t: &mut GuestThread, _: &GuestMemory| {
            assert!(t.take_hook().is_none());
            Ok(StepResult::ReturnToHost)
        });
        thread.fast_call(0x2000, &mem, &mut exec).unwrap();
        assert!(thread.take_hook().is_some());
    }

    #[test]
    fn thumb_entry_bit_selects_isa() {
        let mem = GuestMemory::new(0, 0x100);
        let mut thread = GuestThread::new(1, "main");

        let mut exec = Script(|t: &mut GuestThread, _: &GuestMemory| {
            assert_eq!(t.regs.isa, IsaMode::Thumb);
            assert_eq!(t.regs.pc, 0x2000);
            Ok(StepResult::ReturnToHost)
        });
        thread.fast_call(0x2001, &mem, &mut exec).unwrap();
        assert_eq!(thread.regs.isa, IsaMode::Arm);
    }

    #[test]
    fn executor_errors_propagate_without_sp_check() {
        let mem = GuestMemory::new(0, 0x100);
        let mut thread = GuestThread::new(1, "main");
        thread.regs.set_sp(0x80);

        let mut exec = Script(|t: &mut GuestThread, _: &GuestMemory| {
            t.regs.set_sp(0x70); // left unbalanced on purpose
            Err(KernelError::IllegalAddress)
        });
        assert_eq!(
            thread.fast_call(0x2000, &mem, &mut exec),
            Err(KernelError::IllegalAddress)
        );
        assert_eq!(thread.regs.sp(), 0x80);
    }

    #[test]
    #[should_panic(expected = "unbalanced stack")]
    fn unbalanced_stack_is_a_consistency_violation() {
        let mem = GuestMemory::new(0, 0x100);
        let mut thread = GuestThread::new(1, "main");
        thread.regs.set_sp(0x80);

        let mut exec = Script(|t: &mut GuestThread, _: &GuestMemory| {
            t.regs.set_sp(t.regs.sp() - 8);
            Ok(StepResult::ReturnToHost)
        });
        let _ = thread.fast_call(0x2000, &mem, &mut exec);
    }

    #[test]
    fn cross_thread_entry_panics() {
        let mem = GuestMemory::new(0, 0x100);
        let mut thread = GuestThread::new(7, "pinned");

        let result = std::thread::scope(|s| {
            s.spawn(|| {
                let mut exec =
                    Script(|_: &mut GuestThread, _: &GuestMemory| Ok(StepResult::ReturnToHost));
                thread.fast_call(0x2000, &mem, &mut exec)
            })
            .join()
        });
        assert!(result.is_err());
    }
}
