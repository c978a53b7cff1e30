/// Index of the stack pointer in the general register file.
pub const SP_INDEX: usize = 13;
/// Index of the link register in the general register file.
pub const LR_INDEX: usize = 14;

/// Application program status register flags, kept as discrete bools and
/// packed only at the CPSR boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Apsr {
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
    pub q: bool,
}

impl Apsr {
    #[must_use]
    pub fn pack(self) -> u32 {
        (self.n as u32) << 31
            | (self.z as u32) << 30
            | (self.c as u32) << 29
            | (self.v as u32) << 28
            | (self.q as u32) << 27
    }

    #[must_use]
    pub fn unpack(bits: u32) -> Self {
        Self {
            n: bits & (1 << 31) != 0,
            z: bits & (1 << 30) != 0,
            c: bits & (1 << 29) != 0,
            v: bits & (1 << 28) != 0,
            q: bits & (1 << 27) != 0,
        }
    }
}

/// Instruction set state, from the CPSR J and T bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsaMode {
    #[default]
    Arm,
    Thumb,
    Jazelle,
    ThumbEe,
}

impl IsaMode {
    #[must_use]
    pub fn from_bits(j: bool, t: bool) -> Self {
        match (j, t) {
            (false, false) => Self::Arm,
            (false, true) => Self::Thumb,
            (true, false) => Self::Jazelle,
            (true, true) => Self::ThumbEe,
        }
    }

    #[must_use]
    pub fn to_bits(self) -> (bool, bool) {
        match self {
            Self::Arm => (false, false),
            Self::Thumb => (false, true),
            Self::Jazelle => (true, false),
            Self::ThumbEe => (true, true),
        }
    }
}

/// Thumb IT-block state byte. Layout follows the architecture manual:
/// base condition in the top nibble, remaining-length mask in the bottom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItState(pub u8);

impl ItState {
    #[must_use]
    pub fn in_it_block(self) -> bool {
        self.0 & 0x0f != 0
    }

    #[must_use]
    pub fn last_in_it_block(self) -> bool {
        self.0 & 0x0f == 0x08
    }

    /// Condition code for the current instruction, AL outside an IT block.
    #[must_use]
    pub fn condition(self) -> u8 {
        if self.in_it_block() { self.0 >> 4 } else { 0b1110 }
    }

    pub fn advance(&mut self) {
        if self.0 & 0x07 == 0 {
            self.0 = 0;
        } else {
            self.0 = (self.0 & 0xe0) | ((self.0 << 1) & 0x1f);
        }
    }
}

/// One guest thread's architectural register state.
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    pub gpr: [u32; 15],
    pub pc: u32,
    pub apsr: Apsr,
    pub isa: IsaMode,
    pub it: ItState,
}

impl RegisterFile {
    #[must_use]
    pub fn sp(&self) -> u32 {
        self.gpr[SP_INDEX]
    }

    pub fn set_sp(&mut self, value: u32) {
        self.gpr[SP_INDEX] = value;
    }

    #[must_use]
    pub fn lr(&self) -> u32 {
        self.gpr[LR_INDEX]
    }

    pub fn set_lr(&mut self, value: u32) {
        self.gpr[LR_INDEX] = value;
    }

    /// Reads the 64-bit value held in the even-aligned pair `r{n}:r{n+1}`.
    #[must_use]
    pub fn pair(&self, n: usize) -> u64 {
        debug_assert!(n % 2 == 0 && n + 1 < 15);
        (self.gpr[n] as u64) | ((self.gpr[n + 1] as u64) << 32)
    }

    pub fn set_pair(&mut self, n: usize, value: u64) {
        debug_assert!(n % 2 == 0 && n + 1 < 15);
        self.gpr[n] = value as u32;
        self.gpr[n + 1] = (value >> 32) as u32;
    }

    /// Packs APSR flags, ISA mode and IT state into CPSR form. The ITSTATE
    /// byte is split across bits 26:25 and 15:10 as the architecture does.
    #[must_use]
    pub fn cpsr(&self) -> u32 {
        let (j, t) = self.isa.to_bits();
        let it = self.it.0 as u32;
        self.apsr.pack()
            | (j as u32) << 24
            | (t as u32) << 5
            | (it & 0x3) << 25
            | (it >> 2) << 10
    }

    pub fn set_cpsr(&mut self, bits: u32) {
        self.apsr = Apsr::unpack(bits);
        self.isa = IsaMode::from_bits(bits & (1 << 24) != 0, bits & (1 << 5) != 0);
        self.it = ItState((((bits >> 25) & 0x3) | ((bits >> 10) & 0x3f) << 2) as u8);
    }
}
