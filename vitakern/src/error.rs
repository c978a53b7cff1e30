use std::fmt;

/// Result type used by every kernel-facing operation.
pub type KResult<T> = Result<T, KernelError>;

/// Kernel error codes handed back across the guest ABI boundary.
///
/// The numeric values live in a stable SCE-style `0x8002_xxxx` block and are
/// what the guest observes in r0, so they must never change once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum KernelError {
    InvalidUid = 0x8002_0001u32 as i32,
    DifferentUidClass = 0x8002_0002u32 as i32,
    OutOfUids = 0x8002_0003u32 as i32,
    IllegalAddress = 0x8002_0004u32 as i32,
    InvalidArgument = 0x8002_0005u32 as i32,
    NameTooLong = 0x8002_0006u32 as i32,
    NotFound = 0x8002_0007u32 as i32,
    NoMemory = 0x8002_0008u32 as i32,

    WaitTimeout = 0x8002_0010u32 as i32,
    WaitCancelled = 0x8002_0011u32 as i32,
    WaitDeleted = 0x8002_0012u32 as i32,

    EventFlagCondition = 0x8002_0020u32 as i32,
    EventFlagMultipleWaiters = 0x8002_0021u32 as i32,

    SemaphoreZero = 0x8002_0030u32 as i32,
    SemaphoreOverflow = 0x8002_0031u32 as i32,

    MutexNotOwned = 0x8002_0040u32 as i32,
    MutexUnlockUnderflow = 0x8002_0041u32 as i32,
    MutexLockOverflow = 0x8002_0042u32 as i32,
    MutexRecursive = 0x8002_0043u32 as i32,
    MutexFailedToOwn = 0x8002_0044u32 as i32,
}

impl KernelError {
    /// The raw ABI code, as the guest sees it in a result register.
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps a raw ABI code back to the enumeration.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        use KernelError::*;
        let all = [
            InvalidUid,
            DifferentUidClass,
            OutOfUids,
            IllegalAddress,
            InvalidArgument,
            NameTooLong,
            NotFound,
            NoMemory,
            WaitTimeout,
            WaitCancelled,
            WaitDeleted,
            EventFlagCondition,
            EventFlagMultipleWaiters,
            SemaphoreZero,
            SemaphoreOverflow,
            MutexNotOwned,
            MutexUnlockUnderflow,
            MutexLockOverflow,
            MutexRecursive,
            MutexFailedToOwn,
        ];
        all.into_iter().find(|e| e.code() == code)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#010x})", self, self.code() as u32)
    }
}
