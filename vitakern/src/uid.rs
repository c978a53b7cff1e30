/// Bits reserved for the slot index inside a uid.
pub const SLOT_BITS: u32 = 15;

/// Object classes carried in the uid tag. The numeric values are part of the
/// uid encoding and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ObjClass {
    Thread = 1,
    EventFlag = 2,
    Semaphore = 3,
    Mutex = 4,
    CondVar = 5,
}

/// Tagged 32-bit object identifier.
///
/// Layout, LSB first: oddness bit (always 1), 15-bit slot index, 15-bit
/// class tag, sign bit (always 0). The guest sees uids as positive odd
/// integers; `check` validates every tag before the slot index is trusted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid(u32);

impl std::fmt::Debug for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Uid({:#010x}: class {}, slot {})",
            self.0,
            self.class_bits(),
            self.slot()
        )
    }
}

impl Uid {
    /// Assembles a uid for a freshly claimed slot.
    #[must_use]
    pub fn assemble(class: ObjClass, slot: u32) -> Self {
        debug_assert!(slot < 1 << SLOT_BITS);
        Self((slot << 1) | 1 | ((class as u32) << (SLOT_BITS + 1)))
    }

    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        Self(raw as u32)
    }

    /// The value as the guest sees it in a register.
    #[must_use]
    pub fn raw(self) -> i32 {
        self.0 as i32
    }

    #[must_use]
    pub fn slot(self) -> u32 {
        (self.0 >> 1) & ((1 << SLOT_BITS) - 1)
    }

    #[must_use]
    pub fn class_bits(self) -> u32 {
        (self.0 >> (SLOT_BITS + 1)) & ((1 << 15) - 1)
    }

    /// Validates every tag: sign clear, oddness set, class matching. Only a
    /// uid that passes may have its slot index used.
    #[must_use]
    pub fn check(self, class: ObjClass) -> bool {
        self.0 & 1 == 1 && self.0 >> 31 == 0 && self.class_bits() == class as u32
    }
}
