use std::fmt;

/// General registers available for argument passing (r0..r3).
pub const GPR_ARG_COUNT: u8 = 4;

/// Size of the stack frame reserved below SP for spilled arguments when the
/// host calls into guest code.
pub const STACK_FRAME_SIZE: u32 = 0x40;

/// Shape of a single parameter or return value, before placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Word,
    DWord,
    Float,
    Vector,
}

/// Placement of one argument after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    /// Single general register r{n}.
    General(u8),
    /// Even-aligned register pair r{n}:r{n+1}.
    Pair(u8),
    /// Stack slot at the given offset from SP.
    Stack(u32),
    Float(u8),
    Vector(u8),
}

/// Placement of the return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetClass {
    Void,
    Word,
    Pair,
}

/// Signature shapes the marshaller cannot carry. Raised when a wrapper is
/// constructed, never at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiError {
    FloatUnsupported,
    VectorUnsupported,
    FrameOverflow { needed: u32 },
    ReturnUnsupported,
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FloatUnsupported => write!(f, "floating-point arguments are not supported"),
            Self::VectorUnsupported => write!(f, "vector arguments are not supported"),
            Self::FrameOverflow { needed } => write!(
                f,
                "stack arguments need {needed:#x} bytes, frame is {STACK_FRAME_SIZE:#x}"
            ),
            Self::ReturnUnsupported => write!(f, "return type is not supported"),
        }
    }
}

impl std::error::Error for AbiError {}

/// Sequential AAPCS-style classifier. Words fill r0..r3 then spill; dwords
/// take an even register pair, bumping over an odd register, and once any
/// argument spills no later argument goes back to registers.
#[derive(Debug, Default)]
pub struct LayoutBuilder {
    general: u8,
    stack: u32,
}

impl LayoutBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stack_slot(&mut self, size: u32, align: u32) -> Result<ArgClass, AbiError> {
        let off = (self.stack + align - 1) & !(align - 1);
        let end = off + size;
        if end > STACK_FRAME_SIZE {
            return Err(AbiError::FrameOverflow { needed: end });
        }
        self.stack = end;
        Ok(ArgClass::Stack(off))
    }

    pub fn push(&mut self, kind: ArgKind) -> Result<ArgClass, AbiError> {
        match kind {
            ArgKind::Word => {
                if self.general < GPR_ARG_COUNT {
                    let n = self.general;
                    self.general += 1;
                    Ok(ArgClass::General(n))
                } else {
                    self.stack_slot(4, 4)
                }
            }
            ArgKind::DWord => {
                let aligned = self.general + self.general % 2;
                if aligned + 2 <= GPR_ARG_COUNT {
                    self.general = aligned + 2;
                    Ok(ArgClass::Pair(aligned))
                } else {
                    self.general = GPR_ARG_COUNT;
                    self.stack_slot(8, 8)
                }
            }
            ArgKind::Float => Err(AbiError::FloatUnsupported),
            ArgKind::Vector => Err(AbiError::VectorUnsupported),
        }
    }

    pub fn build(kinds: &[ArgKind]) -> Result<Vec<ArgClass>, AbiError> {
        let mut builder = Self::new();
        kinds.iter().map(|&k| builder.push(k)).collect()
    }

    pub fn ret(kind: Option<ArgKind>) -> Result<RetClass, AbiError> {
        match kind {
            None => Ok(RetClass::Void),
            Some(ArgKind::Word) => Ok(RetClass::Word),
            Some(ArgKind::DWord) => Ok(RetClass::Pair),
            Some(ArgKind::Float) | Some(ArgKind::Vector) => Err(AbiError::ReturnUnsupported),
        }
    }
}
