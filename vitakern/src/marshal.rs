use std::marker::PhantomData;

use crate::{
    ArgClass, ArgKind, GuestExecutor, GuestMemory, GuestPtr, GuestThread, KResult, KernelError,
    LayoutBuilder, RegisterFile, RetClass, STACK_FRAME_SIZE,
    abi::AbiError,
};

/// A value that travels as a single classified argument. The raw form is the
/// register image: words in the low 32 bits, dwords using all 64.
pub trait GuestArg: Sized + 'static {
    const KIND: ArgKind;
    fn from_raw(raw: u64) -> Self;
    fn into_raw(self) -> u64;
}

macro_rules! impl_word_arg {
    ($($t:ty),* $(,)?) => {$(
        impl GuestArg for $t {
            const KIND: ArgKind = ArgKind::Word;

            fn from_raw(raw: u64) -> Self {
                raw as u32 as $t
            }

            fn into_raw(self) -> u64 {
                (self as u32) as u64
            }
        }
    )*};
}

impl_word_arg!(u8, i8, u16, i16, u32, i32);

impl GuestArg for bool {
    const KIND: ArgKind = ArgKind::Word;

    fn from_raw(raw: u64) -> Self {
        raw as u32 != 0
    }

    fn into_raw(self) -> u64 {
        self as u64
    }
}

impl GuestArg for u64 {
    const KIND: ArgKind = ArgKind::DWord;

    fn from_raw(raw: u64) -> Self {
        raw
    }

    fn into_raw(self) -> u64 {
        self
    }
}

impl GuestArg for i64 {
    const KIND: ArgKind = ArgKind::DWord;

    fn from_raw(raw: u64) -> Self {
        raw as i64
    }

    fn into_raw(self) -> u64 {
        self as u64
    }
}

impl<T: 'static> GuestArg for GuestPtr<T> {
    const KIND: ArgKind = ArgKind::Word;

    fn from_raw(raw: u64) -> Self {
        GuestPtr::new(raw as u32)
    }

    fn into_raw(self) -> u64 {
        self.addr() as u64
    }
}

/// A value that travels in the return registers (r0, or r0:r1 for pairs).
pub trait GuestRet: Sized + 'static {
    const KIND: Option<ArgKind>;
    fn read_ret(regs: &RegisterFile) -> Self;
    fn write_ret(self, regs: &mut RegisterFile);
}

impl GuestRet for () {
    const KIND: Option<ArgKind> = None;

    fn read_ret(_regs: &RegisterFile) -> Self {}

    fn write_ret(self, _regs: &mut RegisterFile) {}
}

macro_rules! impl_word_ret {
    ($($t:ty),* $(,)?) => {$(
        impl GuestRet for $t {
            const KIND: Option<ArgKind> = Some(ArgKind::Word);

            fn read_ret(regs: &RegisterFile) -> Self {
                <$t as GuestArg>::from_raw(regs.gpr[0] as u64)
            }

            fn write_ret(self, regs: &mut RegisterFile) {
                regs.gpr[0] = self.into_raw() as u32;
            }
        }
    )*};
}

impl_word_ret!(u8, i8, u16, i16, u32, i32, bool);

macro_rules! impl_pair_ret {
    ($($t:ty),* $(,)?) => {$(
        impl GuestRet for $t {
            const KIND: Option<ArgKind> = Some(ArgKind::DWord);

            fn read_ret(regs: &RegisterFile) -> Self {
                <$t as GuestArg>::from_raw(regs.pair(0))
            }

            fn write_ret(self, regs: &mut RegisterFile) {
                regs.set_pair(0, self.into_raw());
            }
        }
    )*};
}

impl_pair_ret!(u64, i64);

impl<T: 'static> GuestRet for GuestPtr<T> {
    const KIND: Option<ArgKind> = Some(ArgKind::Word);

    fn read_ret(regs: &RegisterFile) -> Self {
        GuestPtr::new(regs.gpr[0])
    }

    fn write_ret(self, regs: &mut RegisterFile) {
        regs.gpr[0] = self.addr();
    }
}

macro_rules! impl_result_ret {
    ($($t:ty),* $(,)?) => {$(
        impl GuestRet for KResult<$t> {
            const KIND: Option<ArgKind> = Some(ArgKind::Word);

            fn read_ret(regs: &RegisterFile) -> Self {
                let raw = regs.gpr[0] as i32;
                if raw < 0 {
                    Err(KernelError::from_code(raw).unwrap_or(KernelError::InvalidArgument))
                } else {
                    Ok(<$t as GuestArg>::from_raw(raw as u32 as u64))
                }
            }

            fn write_ret(self, regs: &mut RegisterFile) {
                regs.gpr[0] = match self {
                    Ok(v) => v.into_raw() as u32,
                    Err(e) => e.code() as u32,
                };
            }
        }
    )*};
}

impl_result_ret!(u32, i32);

fn load_arg<T: GuestArg>(
    class: ArgClass,
    regs: &RegisterFile,
    mem: &GuestMemory,
) -> KResult<T> {
    let raw = match class {
        ArgClass::General(n) => regs.gpr[n as usize] as u64,
        ArgClass::Pair(n) => regs.pair(n as usize),
        ArgClass::Stack(off) => {
            let addr = regs.sp().wrapping_add(off);
            match T::KIND {
                ArgKind::Word => mem.read::<u32>(addr)? as u64,
                ArgKind::DWord => mem.read::<u64>(addr)?,
                ArgKind::Float | ArgKind::Vector => unreachable!(),
            }
        }
        ArgClass::Float(_) | ArgClass::Vector(_) => unreachable!(),
    };
    Ok(T::from_raw(raw))
}

fn store_arg(
    class: ArgClass,
    kind: ArgKind,
    raw: u64,
    regs: &mut RegisterFile,
    mem: &GuestMemory,
) -> KResult<()> {
    match class {
        ArgClass::General(n) => regs.gpr[n as usize] = raw as u32,
        ArgClass::Pair(n) => regs.set_pair(n as usize, raw),
        ArgClass::Stack(off) => {
            let addr = regs.sp().wrapping_add(off);
            match kind {
                ArgKind::Word => mem.write::<u32>(addr, raw as u32)?,
                ArgKind::DWord => mem.write::<u64>(addr, raw)?,
                ArgKind::Float | ArgKind::Vector => unreachable!(),
            }
        }
        ArgClass::Float(_) | ArgClass::Vector(_) => unreachable!(),
    }
    Ok(())
}

/// An argument tuple: a full parameter list, loadable from or storable to a
/// precomputed layout.
pub trait GuestArgs: Sized + 'static {
    const KINDS: &'static [ArgKind];
    fn load(layout: &[ArgClass], regs: &RegisterFile, mem: &GuestMemory) -> KResult<Self>;
    fn store(
        self,
        layout: &[ArgClass],
        regs: &mut RegisterFile,
        mem: &GuestMemory,
    ) -> KResult<()>;
}

macro_rules! impl_args {
    ($($name:ident $idx:tt),*) => {
        impl<$($name: GuestArg),*> GuestArgs for ($($name,)*) {
            const KINDS: &'static [ArgKind] = &[$($name::KIND),*];

            #[allow(unused_variables)]
            fn load(layout: &[ArgClass], regs: &RegisterFile, mem: &GuestMemory) -> KResult<Self> {
                Ok(($(load_arg::<$name>(layout[$idx], regs, mem)?,)*))
            }

            #[allow(unused_variables)]
            fn store(
                self,
                layout: &[ArgClass],
                regs: &mut RegisterFile,
                mem: &GuestMemory,
            ) -> KResult<()> {
                $(store_arg(layout[$idx], $name::KIND, self.$idx.into_raw(), regs, mem)?;)*
                Ok(())
            }
        }
    };
}

impl_args!();
impl_args!(A0 0);
impl_args!(A0 0, A1 1);
impl_args!(A0 0, A1 1, A2 2);
impl_args!(A0 0, A1 1, A2 2, A3 3);
impl_args!(A0 0, A1 1, A2 2, A3 3, A4 4);
impl_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5);
impl_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6);
impl_args!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7);

/// Host functions callable from guest code, over thread and memory plus a
/// marshalled argument tuple.
pub trait HleFn<A, R>: Send + Sync + 'static {
    fn call(&self, thread: &mut GuestThread, mem: &GuestMemory, args: A) -> R;
}

macro_rules! impl_hle_fn {
    ($($name:ident $idx:tt),*) => {
        impl<F, R, $($name),*> HleFn<($($name,)*), R> for F
        where
            F: Fn(&mut GuestThread, &GuestMemory, $($name),*) -> R + Send + Sync + 'static,
        {
            #[allow(unused_variables)]
            fn call(&self, thread: &mut GuestThread, mem: &GuestMemory, args: ($($name,)*)) -> R {
                self(thread, mem, $(args.$idx),*)
            }
        }
    };
}

impl_hle_fn!();
impl_hle_fn!(A0 0);
impl_hle_fn!(A0 0, A1 1);
impl_hle_fn!(A0 0, A1 1, A2 2);
impl_hle_fn!(A0 0, A1 1, A2 2, A3 3);
impl_hle_fn!(A0 0, A1 1, A2 2, A3 3, A4 4);
impl_hle_fn!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5);
impl_hle_fn!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6);
impl_hle_fn!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7);

type InvokeFn = Box<dyn Fn(&mut GuestThread, &GuestMemory, &[ArgClass]) -> KResult<()> + Send + Sync>;

/// A host function wrapped for calls from guest code. The argument layout is
/// classified once here; an unsupported signature is rejected before the
/// function can ever be dispatched.
pub struct HleFunction {
    name: String,
    layout: Box<[ArgClass]>,
    ret: RetClass,
    invoke: InvokeFn,
}

impl std::fmt::Debug for HleFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HleFunction")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("ret", &self.ret)
            .finish()
    }
}

impl HleFunction {
    pub fn wrap<F, A, R>(name: impl Into<String>, f: F) -> Result<Self, AbiError>
    where
        F: HleFn<A, R>,
        A: GuestArgs,
        R: GuestRet,
    {
        let layout = LayoutBuilder::build(A::KINDS)?.into_boxed_slice();
        let ret = LayoutBuilder::ret(R::KIND)?;
        let invoke: InvokeFn = Box::new(move |thread, mem, layout| {
            let args = A::load(layout, &thread.regs, mem)?;
            f.call(thread, mem, args).write_ret(&mut thread.regs);
            Ok(())
        });
        Ok(Self {
            name: name.into(),
            layout,
            ret,
            invoke,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ret_class(&self) -> RetClass {
        self.ret
    }

    /// Unmarshals arguments from the thread, runs the host function, and
    /// leaves the marshalled result in the return registers.
    pub fn call(&self, thread: &mut GuestThread, mem: &GuestMemory) -> KResult<()> {
        (self.invoke)(thread, mem, &self.layout)
    }
}

/// A guest function address made callable from host code with a typed Rust
/// signature. Classification happens once in `new`.
pub struct GuestCallable<A, R> {
    layout: Box<[ArgClass]>,
    ret: RetClass,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A: GuestArgs, R: GuestRet> GuestCallable<A, R> {
    pub fn new() -> Result<Self, AbiError> {
        Ok(Self {
            layout: LayoutBuilder::build(A::KINDS)?.into_boxed_slice(),
            ret: LayoutBuilder::ret(R::KIND)?,
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn ret_class(&self) -> RetClass {
        self.ret
    }

    /// Reserves a spill frame below SP, stages the arguments, runs the guest
    /// function to completion, and reads back the typed result. SP is
    /// restored whether or not the call succeeds.
    pub fn call(
        &self,
        thread: &mut GuestThread,
        mem: &GuestMemory,
        exec: &mut dyn GuestExecutor,
        addr: u32,
        args: A,
    ) -> KResult<R> {
        let saved_sp = thread.regs.sp();
        thread.regs.set_sp(saved_sp.wrapping_sub(STACK_FRAME_SIZE));
        let staged = args.store(&self.layout, &mut thread.regs, mem);
        let result = match staged {
            Ok(()) => thread.fast_call(addr, mem, exec),
            Err(e) => Err(e),
        };
        thread.regs.set_sp(saved_sp);
        result?;
        Ok(R::read_ret(&thread.regs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StepResult, thread::GuestThread};

    struct Script<F>(F);

    impl<F> GuestExecutor for Script<F>
    where
        F: FnMut(&mut GuestThread, &GuestMemory) -> KResult<StepResult>,
    {
        fn step(&mut self, thread: &mut GuestThread, mem: &GuestMemory) -> KResult<StepResult> {
            (self.0)(thread, mem)
        }
    }

    fn setup() -> (GuestMemory, GuestThread) {
        let mem = GuestMemory::new(0, 0x1000);
        let mut thread = GuestThread::new(1, "main");
        thread.regs.set_sp(0x800);
        (mem, thread)
    }

    #[test]
    fn hle_function_reads_registers_and_writes_r0() {
        let (mem, mut thread) = setup();
        let f = HleFunction::wrap("add3", |_: &mut GuestThread, _: &GuestMemory, a: u32, b: u32, c: u32| {
            a + b + c
        })
        .unwrap();

        thread.regs.gpr[0] = 10;
        thread.regs.gpr[1] = 20;
        thread.regs.gpr[2] = 12;
        f.call(&mut thread, &mem).unwrap();
        assert_eq!(thread.regs.gpr[0], 42);
    }

    #[test]
    fn hle_function_reads_pairs_and_stack_spill() {
        let (mem, mut thread) = setup();
        // (u32, u64, u32): r0, r2:r3 pair, first stack slot.
        let f = HleFunction::wrap(
            "mix",
            |_: &mut GuestThread, _: &GuestMemory, a: u32, b: u64, c: u32| -> u64 {
                b + a as u64 + c as u64
            },
        )
        .unwrap();

        thread.regs.gpr[0] = 1;
        thread.regs.set_pair(2, 0x1_0000_0000);
        mem.write::<u32>(thread.regs.sp(), 2).unwrap();
        f.call(&mut thread, &mem).unwrap();
        assert_eq!(thread.regs.pair(0), 0x1_0000_0003);
    }

    #[test]
    fn result_return_marshals_error_codes() {
        let (mem, mut thread) = setup();
        let f = HleFunction::wrap("fails", |_: &mut GuestThread, _: &GuestMemory| -> KResult<u32> {
            Err(KernelError::InvalidUid)
        })
        .unwrap();

        f.call(&mut thread, &mem).unwrap();
        assert_eq!(thread.regs.gpr[0] as i32, KernelError::InvalidUid.code());
        assert_eq!(
            KResult::<u32>::read_ret(&thread.regs),
            Err(KernelError::InvalidUid)
        );
    }

    #[test]
    fn guest_callable_stages_args_and_reads_result() {
        let (mem, mut thread) = setup();
        let callable: GuestCallable<(u32, u64, u32), u64> = GuestCallable::new().unwrap();

        let mut exec = Script(|t: &mut GuestThread, m: &GuestMemory| {
            // Guest-side view: r0, r2:r3, and the spilled third argument.
            let a = t.regs.gpr[0] as u64;
            let b = t.regs.pair(2);
            let c = m.read::<u32>(t.regs.sp()).unwrap() as u64;
            t.regs.set_pair(0, a + b + c);
            Ok(StepResult::ReturnToHost)
        });
        let out = callable
            .call(&mut thread, &mem, &mut exec, 0x2000, (5, 0x2_0000_0000, 7))
            .unwrap();

        assert_eq!(out, 0x2_0000_000c);
        assert_eq!(thread.regs.sp(), 0x800);
    }

    #[test]
    fn guest_callable_restores_sp_on_failure() {
        let (mem, mut thread) = setup();
        let callable: GuestCallable<(u32,), u32> = GuestCallable::new().unwrap();

        let mut exec =
            Script(|_: &mut GuestThread, _: &GuestMemory| Err(KernelError::IllegalAddress));
        let out = callable.call(&mut thread, &mem, &mut exec, 0x2000, (1,));

        assert_eq!(out, Err(KernelError::IllegalAddress));
        assert_eq!(thread.regs.sp(), 0x800);
    }

    #[test]
    fn store_then_load_round_trips_every_placement() {
        let (mem, mut thread) = setup();
        type Args = (u32, u64, i32, u64, u32, i64);
        let layout = LayoutBuilder::build(Args::KINDS).unwrap();

        // r0, r2:r3, then everything else spills in order.
        let original: Args = (7, u64::MAX - 1, -5, 0xdead_beef_0000_0001, 9, i64::MIN);
        original
            .store(&layout, &mut thread.regs, &mem)
            .unwrap();
        let loaded = Args::load(&layout, &thread.regs, &mem).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn dword_args_skip_odd_registers_both_directions() {
        let (mem, mut thread) = setup();
        let f = HleFunction::wrap(
            "pairs",
            |_: &mut GuestThread, _: &GuestMemory, a: u32, b: u64| -> u32 { (a as u64 + b) as u32 },
        )
        .unwrap();

        thread.regs.gpr[0] = 3;
        thread.regs.gpr[1] = 0xffff_ffff; // must be ignored
        thread.regs.set_pair(2, 4);
        f.call(&mut thread, &mem).unwrap();
        assert_eq!(thread.regs.gpr[0], 7);
    }
}
