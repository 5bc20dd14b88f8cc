use crate::backend::hostloc::StateSlot;
use crate::condition_register::ConditionRegister;
use crate::cpu_flags::{FeatureFlags, Hid0, Msr};

pub const NUM_GPRS: usize = 32;
pub const NUM_FPRS: usize = 32;

/// Guest CPU state as generated code sees it.
///
/// The reserved state register points at this struct while guest code runs; every field is
/// reached with a small displacement from it.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct PpcState {
    /// Paired-single registers: ps0 in `[0]`, ps1 in `[1]`.
    pub ps: [[u64; 2]; NUM_FPRS],
    /// Host stack pointer saved by the entry routine. The dispatcher resets to it, dropping
    /// any frames left by budgeted calls.
    pub host_sp: u64,
    pub gpr: [u32; NUM_GPRS],
    pub cr: ConditionRegister,

    pub pc: u32,
    pub npc: u32,
    /// Cycles left in the current timeslice. Blocks bail out to the dispatcher once it drops
    /// to zero or below.
    pub downcount: i32,

    pub msr: u32,
    pub hid0: u32,
    /// XER summary overflow, kept apart from the rest of XER.
    pub xer_so_ov: u8,
}

impl PpcState {
    pub fn new() -> Self {
        Self {
            ps: [[0; 2]; NUM_FPRS],
            host_sp: 0,
            gpr: [0; NUM_GPRS],
            cr: ConditionRegister::new(),
            pc: 0,
            npc: 0,
            downcount: 0,
            msr: 0,
            hid0: Hid0::default().bits(),
            xer_so_ov: 0,
        }
    }

    pub fn msr(&self) -> Msr {
        Msr::from_bits_retain(self.msr)
    }

    pub fn hid0(&self) -> Hid0 {
        Hid0::from_bits_retain(self.hid0)
    }

    pub fn set_hid0(&mut self, hid0: Hid0) {
        self.hid0 = hid0.bits();
    }

    pub fn feature_flags(&self) -> FeatureFlags {
        FeatureFlags::from_msr(self.msr())
    }

    // -- Field offsets for generated code --

    pub const fn offset_of_ps(i: usize) -> usize {
        core::mem::offset_of!(PpcState, ps) + i * 16
    }

    pub const fn offset_of_gpr(i: usize) -> usize {
        core::mem::offset_of!(PpcState, gpr) + i * 4
    }

    pub const fn offset_of_cr_field(i: usize) -> usize {
        core::mem::offset_of!(PpcState, cr) + ConditionRegister::offset_of_field(i)
    }

    pub const fn offset_of_pc() -> usize {
        core::mem::offset_of!(PpcState, pc)
    }

    pub const fn offset_of_npc() -> usize {
        core::mem::offset_of!(PpcState, npc)
    }

    pub const fn offset_of_downcount() -> usize {
        core::mem::offset_of!(PpcState, downcount)
    }

    pub const fn offset_of_host_sp() -> usize {
        core::mem::offset_of!(PpcState, host_sp)
    }

    /// Canonical home of a general-purpose register.
    pub const fn gpr_slot(i: usize) -> StateSlot {
        StateSlot::word(Self::offset_of_gpr(i))
    }

    /// Canonical home of a paired-single register.
    pub const fn fpr_slot(i: usize) -> StateSlot {
        StateSlot::quad(Self::offset_of_ps(i))
    }
}

impl Default for PpcState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PpcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PpcState")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("npc", &format_args!("{:#010x}", self.npc))
            .field("downcount", &self.downcount)
            .field("msr", &self.msr())
            .field("cr", &self.cr)
            .field("gpr", &self.gpr)
            .finish_non_exhaustive()
    }
}
