/// A host register the allocator can hand out.
///
/// The index is the hardware register number within its bank, so the same value means
/// `rbx`/`xmm3` on x86-64 and `w3`/`q3` on AArch64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostReg {
    /// General-purpose register.
    Gpr(u8),
    /// Floating-point / vector register.
    Fpr(u8),
}

impl HostReg {
    pub fn is_gpr(self) -> bool {
        matches!(self, HostReg::Gpr(_))
    }

    pub fn is_fpr(self) -> bool {
        matches!(self, HostReg::Fpr(_))
    }

    /// Hardware register number.
    pub fn index(self) -> u8 {
        match self {
            HostReg::Gpr(i) | HostReg::Fpr(i) => i,
        }
    }

    pub fn bank(self) -> RegBankKind {
        match self {
            HostReg::Gpr(_) => RegBankKind::Gpr,
            HostReg::Fpr(_) => RegBankKind::Fpr,
        }
    }
}

/// Which register file a guest or host register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegBankKind {
    Gpr,
    Fpr,
}

/// Width of a canonical in-memory register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotWidth {
    /// One 32-bit general-purpose register.
    Word,
    /// A paired-single register: two 64-bit halves.
    Quad,
}

impl SlotWidth {
    pub fn bytes(self) -> usize {
        match self {
            SlotWidth::Word => 4,
            SlotWidth::Quad => 16,
        }
    }
}

/// Location of a guest register inside the CPU state block, relative to the state pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateSlot {
    pub offset: u32,
    pub width: SlotWidth,
}

impl StateSlot {
    pub const fn word(offset: usize) -> Self {
        Self { offset: offset as u32, width: SlotWidth::Word }
    }

    pub const fn quad(offset: usize) -> Self {
        Self { offset: offset as u32, width: SlotWidth::Quad }
    }
}
